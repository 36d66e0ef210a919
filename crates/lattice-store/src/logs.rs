//! Per-node append-only log streams with incremental polling.

use crate::nodes::fetch_node;
use crate::{StoreResult, utc_now};
use lattice_proto::LogEntry;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value;

pub(crate) const LOG_LIMIT_DEFAULT: i64 = 200;
pub(crate) const LOG_LIMIT_MAX: i64 = 500;

const ALLOWED_LEVELS: &[&str] = &["debug", "info", "warning", "error"];

#[derive(Debug)]
pub enum AppendLogOutcome {
    Ok,
    NotFound,
}

#[derive(Debug)]
pub enum LogListOutcome {
    Ok(Vec<LogEntry>),
    NotFound,
}

/// Clamp a requested page size into [1, 500], defaulting to 200.
pub fn clamp_log_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(LOG_LIMIT_DEFAULT).clamp(1, LOG_LIMIT_MAX)
}

fn normalize_level(level: &str) -> String {
    let lowered = level.trim().to_lowercase();
    if ALLOWED_LEVELS.contains(&lowered.as_str()) {
        lowered
    } else {
        "info".to_string()
    }
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<LogEntry> {
    let meta_raw: Option<String> = row.get("meta_json")?;
    Ok(LogEntry {
        id: row.get("id")?,
        node_id: row.get("node_id")?,
        created_at: row.get("created_at")?,
        level: row.get("level")?,
        message: row.get("message")?,
        meta: meta_raw.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

/// Insert a log row inside an open transaction. Blank messages are dropped.
pub(crate) fn insert_node_log(
    conn: &Connection,
    node_id: &str,
    level: &str,
    message: &str,
    meta: Option<&Value>,
    created_at: Option<&str>,
) -> StoreResult<()> {
    let clean_message = message.trim();
    if clean_message.is_empty() {
        return Ok(());
    }
    let meta_json = meta.map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO node_logs (node_id, created_at, level, message, meta_json)
         VALUES (?, ?, ?, ?, ?);",
        params![
            node_id,
            created_at.map(str::to_string).unwrap_or_else(utc_now),
            normalize_level(level),
            clean_message,
            meta_json
        ],
    )?;
    Ok(())
}

impl crate::Store {
    /// Append one log entry for a node. Levels outside the allowed set are
    /// lowered to `info`; a caller-supplied timestamp wins over server time.
    pub fn append_node_log(
        &self,
        node_id: &str,
        level: &str,
        message: &str,
        meta: Option<&Value>,
        timestamp: Option<&str>,
    ) -> StoreResult<AppendLogOutcome> {
        let clean_id = node_id.trim();
        if clean_id.is_empty() {
            return Ok(AppendLogOutcome::NotFound);
        }
        self.with_conn(|conn| {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM nodes WHERE id = ? LIMIT 1;",
                    params![clean_id],
                    |r| r.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Ok(AppendLogOutcome::NotFound);
            }
            insert_node_log(conn, clean_id, level, message, meta, timestamp)?;
            Ok(AppendLogOutcome::Ok)
        })
    }

    /// List a node's log entries in ascending id order. With `since_id`, only
    /// entries strictly after it; without, the most recent `limit` entries.
    pub fn list_node_logs(
        &self,
        node_id: &str,
        limit: i64,
        since_id: Option<i64>,
    ) -> StoreResult<LogListOutcome> {
        let clean_id = node_id.trim();
        if clean_id.is_empty() {
            return Ok(LogListOutcome::NotFound);
        }
        let limit = clamp_log_limit(Some(limit));
        self.with_conn(|conn| {
            if fetch_node(conn, clean_id)?.is_none() {
                return Ok(LogListOutcome::NotFound);
            }
            let items = match since_id {
                Some(since) => {
                    let mut stmt = conn.prepare(
                        "SELECT id, node_id, created_at, level, message, meta_json
                         FROM node_logs
                         WHERE node_id = ? AND id > ?
                         ORDER BY id ASC
                         LIMIT ?;",
                    )?;
                    stmt.query_map(params![clean_id, since, limit], log_from_row)?
                        .collect::<Result<Vec<_>, _>>()?
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT id, node_id, created_at, level, message, meta_json
                         FROM node_logs
                         WHERE node_id = ?
                         ORDER BY id DESC
                         LIMIT ?;",
                    )?;
                    let mut latest = stmt
                        .query_map(params![clean_id, limit], log_from_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    latest.reverse();
                    latest
                }
            };
            Ok(LogListOutcome::Ok(items))
        })
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use serde_json::json;

    fn store_with_node() -> (Store, String) {
        let store = Store::open_in_memory().unwrap();
        let node = store.create_node(Some("logs-node")).unwrap();
        (store, node.id)
    }

    fn append_n(store: &Store, node_id: &str, n: usize) {
        for i in 0..n {
            store
                .append_node_log(node_id, "info", &format!("entry {i}"), None, None)
                .unwrap();
        }
    }

    fn ids(items: &[lattice_proto::LogEntry]) -> Vec<i64> {
        items.iter().map(|e| e.id).collect()
    }

    #[test]
    fn append_requires_existing_node_and_nonempty_message() {
        let (store, node_id) = store_with_node();
        assert!(matches!(
            store.append_node_log("missing", "info", "x", None, None).unwrap(),
            AppendLogOutcome::NotFound
        ));
        // Blank messages are dropped silently.
        store.append_node_log(&node_id, "info", "   ", None, None).unwrap();
        let items = match store.list_node_logs(&node_id, 100, None).unwrap() {
            LogListOutcome::Ok(items) => items,
            other => panic!("unexpected {other:?}"),
        };
        // Only the creation log entry.
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn unknown_levels_are_lowered_to_info() {
        let (store, node_id) = store_with_node();
        store
            .append_node_log(&node_id, "CRITICAL", "boom", None, None)
            .unwrap();
        store
            .append_node_log(&node_id, "WARNING", "careful", None, None)
            .unwrap();
        let items = match store.list_node_logs(&node_id, 10, None).unwrap() {
            LogListOutcome::Ok(items) => items,
            other => panic!("unexpected {other:?}"),
        };
        let boom = items.iter().find(|e| e.message == "boom").unwrap();
        assert_eq!(boom.level, "info");
        let warn = items.iter().find(|e| e.message == "careful").unwrap();
        assert_eq!(warn.level, "warning");
    }

    #[test]
    fn listing_without_since_returns_latest_in_ascending_order() {
        let (store, node_id) = store_with_node();
        append_n(&store, &node_id, 10);
        let items = match store.list_node_logs(&node_id, 5, None).unwrap() {
            LogListOutcome::Ok(items) => items,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(items.len(), 5);
        let got = ids(&items);
        let mut sorted = got.clone();
        sorted.sort_unstable();
        assert_eq!(got, sorted, "caller sees chronological order");
        assert_eq!(items.last().unwrap().message, "entry 9");
    }

    #[test]
    fn listing_with_since_returns_strictly_greater_prefix() {
        let (store, node_id) = store_with_node();
        append_n(&store, &node_id, 10);
        let all = match store.list_node_logs(&node_id, 100, None).unwrap() {
            LogListOutcome::Ok(items) => items,
            other => panic!("unexpected {other:?}"),
        };
        let pivot = all[4].id;
        let delta = match store.list_node_logs(&node_id, 3, Some(pivot)).unwrap() {
            LogListOutcome::Ok(items) => items,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(delta.len(), 3);
        assert!(delta.iter().all(|e| e.id > pivot));
        let expected: Vec<i64> = all.iter().map(|e| e.id).filter(|id| *id > pivot).take(3).collect();
        assert_eq!(ids(&delta), expected);
    }

    #[test]
    fn since_past_the_tail_returns_empty() {
        let (store, node_id) = store_with_node();
        append_n(&store, &node_id, 3);
        let all = match store.list_node_logs(&node_id, 100, None).unwrap() {
            LogListOutcome::Ok(items) => items,
            other => panic!("unexpected {other:?}"),
        };
        let tail = all.last().unwrap().id;
        let delta = match store.list_node_logs(&node_id, 10, Some(tail)).unwrap() {
            LogListOutcome::Ok(items) => items,
            other => panic!("unexpected {other:?}"),
        };
        assert!(delta.is_empty());
    }

    #[test]
    fn limit_is_clamped_into_bounds() {
        assert_eq!(clamp_log_limit(None), 200);
        assert_eq!(clamp_log_limit(Some(0)), 1);
        assert_eq!(clamp_log_limit(Some(-5)), 1);
        assert_eq!(clamp_log_limit(Some(100_000)), 500);
        assert_eq!(clamp_log_limit(Some(37)), 37);
    }

    #[test]
    fn meta_and_timestamp_roundtrip() {
        let (store, node_id) = store_with_node();
        store
            .append_node_log(
                &node_id,
                "error",
                "disk failure",
                Some(&json!({"device": "/dev/sda"})),
                Some("2025-06-01T12:00:00+00:00"),
            )
            .unwrap();
        let items = match store.list_node_logs(&node_id, 10, None).unwrap() {
            LogListOutcome::Ok(items) => items,
            other => panic!("unexpected {other:?}"),
        };
        let entry = items.iter().find(|e| e.message == "disk failure").unwrap();
        assert_eq!(entry.level, "error");
        assert_eq!(entry.created_at, "2025-06-01T12:00:00+00:00");
        assert_eq!(entry.meta.as_ref().unwrap()["device"], json!("/dev/sda"));
    }

    #[test]
    fn logs_are_removed_with_their_node() {
        let (store, node_id) = store_with_node();
        append_n(&store, &node_id, 3);
        store.delete_node(&node_id).unwrap();
        assert!(matches!(
            store.list_node_logs(&node_id, 10, None).unwrap(),
            LogListOutcome::NotFound
        ));
    }
}
