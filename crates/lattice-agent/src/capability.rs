//! Capability caching and best-effort prerequisite auto-install.
//!
//! Both subsystems (libvirt VMs, docker containers) share the same shape:
//! a cached readiness probe and a cooldown-gated installer that only runs on
//! Linux when a supported package manager is present.

use crate::runner::{
    first_error_line, looks_like_apt_lock_error, run_sudo, run_sudo_with_retry,
};
use lattice_proto::CapabilityReport;
use serde_json::{Value, json};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub const CAPABILITY_TTL: Duration = Duration::from_secs(60);
pub const AUTO_INSTALL_COOLDOWN: Duration = Duration::from_secs(600);

const APT_RETRIES: usize = 4;
const APT_RETRY_DELAY: Duration = Duration::from_secs(8);

/// Per-package-manager package lists for one subsystem.
pub struct PackageSet {
    pub apt: &'static [&'static str],
    pub rpm: &'static [&'static str],
    pub pacman: &'static [&'static str],
    pub zypper: &'static [&'static str],
    /// Service to `systemctl enable --now` after install; failures are
    /// harmless on some distros.
    pub service: &'static str,
}

pub fn detect_linux_package_manager() -> Option<&'static str> {
    for (tool, name) in [
        ("apt-get", "apt"),
        ("dnf", "dnf"),
        ("yum", "yum"),
        ("pacman", "pacman"),
        ("zypper", "zypper"),
    ] {
        if which::which(tool).is_ok() {
            return Some(name);
        }
    }
    None
}

pub async fn install_prerequisites(
    package_manager: &str,
    packages: &PackageSet,
) -> (bool, String, Value) {
    let result = match package_manager {
        "apt" => {
            let update = run_sudo_with_retry(
                &["apt-get", "-o", "Acquire::Retries=3", "update"],
                Duration::from_secs(1200),
                APT_RETRIES,
                APT_RETRY_DELAY,
                looks_like_apt_lock_error,
            )
            .await;
            if !update.ok() {
                let reason = first_error_line(&update.stdout, &update.stderr);
                return (
                    false,
                    format!("apt-get update failed: {reason}"),
                    json!({ "stdout": update.stdout, "stderr": update.stderr }),
                );
            }
            let mut cmd: Vec<&str> =
                vec!["apt-get", "install", "-y", "--no-install-recommends"];
            cmd.extend_from_slice(packages.apt);
            run_sudo_with_retry(
                &cmd,
                Duration::from_secs(1800),
                APT_RETRIES,
                APT_RETRY_DELAY,
                looks_like_apt_lock_error,
            )
            .await
        }
        "dnf" | "yum" => {
            let mut cmd: Vec<&str> = vec![package_manager, "install", "-y"];
            cmd.extend_from_slice(packages.rpm);
            run_sudo(&cmd, Duration::from_secs(1800)).await
        }
        "pacman" => {
            let mut cmd: Vec<&str> = vec!["pacman", "-Sy", "--noconfirm"];
            cmd.extend_from_slice(packages.pacman);
            run_sudo(&cmd, Duration::from_secs(1800)).await
        }
        "zypper" => {
            let mut cmd: Vec<&str> = vec!["zypper", "--non-interactive", "install"];
            cmd.extend_from_slice(packages.zypper);
            run_sudo(&cmd, Duration::from_secs(1800)).await
        }
        other => {
            return (
                false,
                "Unsupported package manager".to_string(),
                json!({ "package_manager": other }),
            );
        }
    };

    if !result.ok() {
        let reason = first_error_line(&result.stdout, &result.stderr);
        return (
            false,
            format!("{package_manager} install failed: {reason}"),
            json!({ "stdout": result.stdout, "stderr": result.stderr }),
        );
    }
    run_sudo(
        &["systemctl", "enable", "--now", packages.service],
        Duration::from_secs(120),
    )
    .await;
    (
        true,
        format!("Installed prerequisites with {package_manager}"),
        json!({}),
    )
}

// ─── Capability cache ─────────────────────────────────────────────────────────

struct CacheState {
    value: Option<CapabilityReport>,
    checked_at: Option<Instant>,
}

/// Probe cache with a short TTL: readiness checks shell out and must not run
/// on every heartbeat.
pub struct CapabilityCache {
    state: Mutex<CacheState>,
}

impl Default for CapabilityCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CacheState {
                value: None,
                checked_at: None,
            }),
        }
    }

    /// Return the cached report when younger than `max_age`, otherwise run
    /// `detect` and cache its result. A zero `max_age` forces a refresh.
    pub async fn get<F, Fut>(&self, max_age: Duration, detect: F) -> CapabilityReport
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CapabilityReport>,
    {
        let mut state = self.state.lock().await;
        if let (Some(value), Some(checked_at)) = (&state.value, state.checked_at) {
            if !max_age.is_zero() && checked_at.elapsed() <= max_age {
                return value.clone();
            }
        }
        let fresh = detect().await;
        state.value = Some(fresh.clone());
        state.checked_at = Some(Instant::now());
        fresh
    }

    pub async fn store(&self, value: CapabilityReport) {
        let mut state = self.state.lock().await;
        state.value = Some(value);
        state.checked_at = Some(Instant::now());
    }
}

/// Cooldown gate for auto-install attempts.
pub struct AutoInstallGate {
    last_attempt: Mutex<Option<Instant>>,
}

impl Default for AutoInstallGate {
    fn default() -> Self {
        Self::new()
    }
}

impl AutoInstallGate {
    pub fn new() -> Self {
        Self {
            last_attempt: Mutex::new(None),
        }
    }

    /// Record an attempt if one is allowed. `force` bypasses the cooldown.
    pub async fn begin(&self, force: bool) -> bool {
        let mut last = self.last_attempt.lock().await;
        if !force {
            if let Some(at) = *last {
                if at.elapsed() < AUTO_INSTALL_COOLDOWN {
                    return false;
                }
            }
        }
        *last = Some(Instant::now());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(ready: bool) -> CapabilityReport {
        CapabilityReport {
            provider: "test".to_string(),
            ready,
            message: "probe".to_string(),
            missing_tools: Vec::new(),
            version: None,
            managed_paths: None,
            details: None,
        }
    }

    #[tokio::test]
    async fn cache_serves_fresh_values_without_reprobing() {
        let cache = CapabilityCache::new();
        let first = cache.get(CAPABILITY_TTL, || async { report(true) }).await;
        assert!(first.ready);

        // Within the TTL the detector must not run again.
        let second = cache
            .get(CAPABILITY_TTL, || async {
                panic!("detector should not have been called")
            })
            .await;
        assert!(second.ready);
    }

    #[tokio::test]
    async fn zero_max_age_forces_a_refresh() {
        let cache = CapabilityCache::new();
        cache.get(CAPABILITY_TTL, || async { report(true) }).await;
        let refreshed = cache
            .get(Duration::ZERO, || async { report(false) })
            .await;
        assert!(!refreshed.ready);
    }

    #[tokio::test]
    async fn auto_install_gate_enforces_cooldown() {
        let gate = AutoInstallGate::new();
        assert!(gate.begin(false).await);
        assert!(!gate.begin(false).await, "second attempt is in cooldown");
        assert!(gate.begin(true).await, "force bypasses the cooldown");
    }
}
