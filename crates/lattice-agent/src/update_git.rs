//! Agent self-update via git fast-forward.

use crate::runner::{first_error_line, run};
use lattice_proto::CommandStatus;
use serde_json::{Value, json};
use std::time::Duration;

const GIT_TIMEOUT: Duration = Duration::from_secs(120);
const PULL_TIMEOUT: Duration = Duration::from_secs(600);

type ExecOutcome = (CommandStatus, String, Value);

fn failed(message: impl Into<String>) -> ExecOutcome {
    (CommandStatus::Failed, message.into(), json!({}))
}

/// Local files an update must tolerate being dirty: the agent's own config
/// and pairing state live inside the checkout.
pub fn is_ignorable_change(status_line: &str) -> bool {
    let path = status_line.get(3..).unwrap_or("").trim();
    path.ends_with("agent-config.json") || path.ends_with("state.json")
}

async fn git(args: &[&str], timeout: Duration) -> crate::runner::CommandOutput {
    let mut cmd: Vec<&str> = vec!["git"];
    cmd.extend_from_slice(args);
    run(&cmd, timeout).await
}

/// Fast-forward the agent checkout. Refuses on a dirty work tree (beyond the
/// config/state files) unless forced; reports `up_to_date` when HEAD already
/// matches upstream.
pub async fn execute(force: bool, branch: Option<&str>) -> ExecOutcome {
    let inside = git(&["rev-parse", "--is-inside-work-tree"], GIT_TIMEOUT).await;
    if !inside.ok() || inside.stdout.trim() != "true" {
        return failed("Agent is not running from a git work tree");
    }

    let status = git(&["status", "--porcelain"], GIT_TIMEOUT).await;
    if !status.ok() {
        return failed(format!(
            "git status failed: {}",
            first_error_line(&status.stdout, &status.stderr)
        ));
    }
    let dirty: Vec<&str> = status
        .stdout
        .lines()
        .filter(|line| !line.trim().is_empty() && !is_ignorable_change(line))
        .collect();
    if !dirty.is_empty() && !force {
        return (
            CommandStatus::Failed,
            "Work tree has local changes; pass force to update anyway".to_string(),
            json!({ "dirty": dirty }),
        );
    }

    let fetch = match branch {
        Some(branch) => git(&["fetch", "origin", branch], PULL_TIMEOUT).await,
        None => git(&["fetch", "--all", "--prune"], PULL_TIMEOUT).await,
    };
    if !fetch.ok() {
        return failed(format!(
            "git fetch failed: {}",
            first_error_line(&fetch.stdout, &fetch.stderr)
        ));
    }

    let before = git(&["rev-parse", "HEAD"], GIT_TIMEOUT).await;
    if !before.ok() {
        return failed("Unable to resolve current HEAD");
    }
    let before_sha = before.stdout.trim().to_string();

    let upstream = match branch {
        Some(branch) => format!("origin/{branch}"),
        None => "@{u}".to_string(),
    };
    let behind = git(
        &["rev-list", "--count", &format!("HEAD..{upstream}")],
        GIT_TIMEOUT,
    )
    .await;
    if !behind.ok() {
        return failed(format!(
            "Unable to compare HEAD with upstream: {}",
            first_error_line(&behind.stdout, &behind.stderr)
        ));
    }
    let behind_count: u64 = behind.stdout.trim().parse().unwrap_or(0);
    if behind_count == 0 {
        return (
            CommandStatus::Succeeded,
            "Agent is up to date".to_string(),
            json!({ "result": "up_to_date", "commit": before_sha }),
        );
    }

    let pull = match branch {
        Some(branch) => git(&["pull", "--ff-only", "origin", branch], PULL_TIMEOUT).await,
        None => git(&["pull", "--ff-only"], PULL_TIMEOUT).await,
    };
    if !pull.ok() {
        return failed(format!(
            "git pull failed: {}",
            first_error_line(&pull.stdout, &pull.stderr)
        ));
    }

    let after = git(&["rev-parse", "HEAD"], GIT_TIMEOUT).await;
    let after_sha = if after.ok() {
        after.stdout.trim().to_string()
    } else {
        String::new()
    };
    (
        CommandStatus::Succeeded,
        format!("Agent updated ({behind_count} commit(s) applied)"),
        json!({
            "result": "updated",
            "from_commit": before_sha,
            "to_commit": after_sha,
            "commits_applied": behind_count,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_and_state_changes_are_ignorable() {
        assert!(is_ignorable_change(" M agent/agent-config.json"));
        assert!(is_ignorable_change("?? state.json"));
        assert!(!is_ignorable_change(" M src/main.rs"));
        assert!(!is_ignorable_change("?? notes.txt"));
    }
}
