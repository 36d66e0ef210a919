//! Container lifecycle executor backed by the docker CLI.

use crate::capability::{
    AutoInstallGate, CAPABILITY_TTL, CapabilityCache, PackageSet, detect_linux_package_manager,
    install_prerequisites,
};
use crate::runner::{first_error_line, looks_like_sudo_denial, run_sudo};
use lattice_proto::{CapabilityReport, CommandStatus, ContainerCreateSpec};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{info, warn};

const CONTAINER_PACKAGES: PackageSet = PackageSet {
    apt: &["docker.io"],
    rpm: &["docker"],
    pacman: &["docker"],
    zypper: &["docker"],
    service: "docker",
};

type ExecOutcome = (CommandStatus, String, Value);

fn failed(message: impl Into<String>) -> ExecOutcome {
    (CommandStatus::Failed, message.into(), json!({}))
}

/// Collapse a docker runtime state into the fleet-level state token.
pub fn derive_state(runtime_state: &str, fallback: &str) -> String {
    let normalized = runtime_state.trim().to_lowercase();
    if normalized.is_empty() {
        return fallback.to_string();
    }
    if normalized.contains("running") {
        return "running".to_string();
    }
    if normalized.contains("restarting") {
        return "restarting".to_string();
    }
    if ["exited", "created", "dead", "stopped"]
        .iter()
        .any(|token| normalized.contains(token))
    {
        return "stopped".to_string();
    }
    if ["removing", "deleting"]
        .iter()
        .any(|token| normalized.contains(token))
    {
        return "deleting".to_string();
    }
    fallback.to_string()
}

/// Parse one `docker ps -a` row in the tab-separated format the sync command
/// requests. Short rows are skipped.
pub fn parse_ps_line(line: &str) -> Option<Value> {
    let raw = line.trim();
    if raw.is_empty() {
        return None;
    }
    let parts: Vec<&str> = raw.split('\t').collect();
    if parts.len() < 5 {
        return None;
    }
    let runtime_state = parts[3].trim().to_lowercase();
    Some(json!({
        "runtime_id": parts[0].trim(),
        "runtime_name": parts[1].trim(),
        "image": parts[2].trim(),
        "runtime_state": runtime_state,
        "status_text": parts[4].trim(),
        "state": derive_state(&runtime_state, "unknown"),
    }))
}

async fn container_state(runtime_name: &str) -> String {
    let out = run_sudo(
        &["docker", "inspect", "-f", "{{.State.Status}}", runtime_name],
        Duration::from_secs(30),
    )
    .await;
    if out.ok() {
        let state = out.stdout.trim().to_lowercase();
        if state.is_empty() { "unknown".to_string() } else { state }
    } else {
        "unknown".to_string()
    }
}

async fn container_runtime_id(runtime_name: &str) -> Option<String> {
    let out = run_sudo(
        &["docker", "inspect", "-f", "{{.Id}}", runtime_name],
        Duration::from_secs(30),
    )
    .await;
    if out.ok() {
        let value = out.stdout.trim().to_string();
        if value.is_empty() { None } else { Some(value) }
    } else {
        None
    }
}

pub struct ContainerSubsystem {
    capability: CapabilityCache,
    auto_install: AutoInstallGate,
}

impl Default for ContainerSubsystem {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerSubsystem {
    pub fn new() -> Self {
        Self {
            capability: CapabilityCache::new(),
            auto_install: AutoInstallGate::new(),
        }
    }

    async fn detect_capability() -> CapabilityReport {
        if !cfg!(target_os = "linux") {
            return CapabilityReport {
                provider: "docker".to_string(),
                ready: false,
                message: "docker container support is Linux-only in v1".to_string(),
                missing_tools: Vec::new(),
                version: None,
                managed_paths: None,
                details: None,
            };
        }
        if which::which("docker").is_err() {
            return CapabilityReport {
                provider: "docker".to_string(),
                ready: false,
                message: "Missing required container tools".to_string(),
                missing_tools: vec!["docker".to_string()],
                version: None,
                managed_paths: None,
                details: None,
            };
        }

        let probe = run_sudo(
            &["docker", "info", "--format", "{{.ServerVersion}}"],
            Duration::from_secs(30),
        )
        .await;
        if !probe.ok() {
            let combined = format!("{}\n{}", probe.stderr, probe.stdout);
            let message = if looks_like_sudo_denial(&combined) {
                "sudo -n denied; configure NOPASSWD sudo or install prerequisites manually"
            } else {
                "Unable to access docker daemon"
            };
            return CapabilityReport {
                provider: "docker".to_string(),
                ready: false,
                message: message.to_string(),
                missing_tools: Vec::new(),
                version: None,
                managed_paths: None,
                details: Some(if probe.stderr.is_empty() {
                    probe.stdout
                } else {
                    probe.stderr
                }),
            };
        }

        let version = probe.stdout.trim().to_string();
        CapabilityReport {
            provider: "docker".to_string(),
            ready: true,
            message: "docker ready".to_string(),
            missing_tools: Vec::new(),
            version: if version.is_empty() { None } else { Some(version) },
            managed_paths: None,
            details: None,
        }
    }

    pub async fn capability(&self, max_age: Duration) -> CapabilityReport {
        self.capability.get(max_age, Self::detect_capability).await
    }

    pub async fn auto_install(&self, force: bool) -> Value {
        if !cfg!(target_os = "linux") {
            return json!({
                "attempted": false,
                "ready": false,
                "message": "Auto-install only runs on Linux",
            });
        }
        if !self.auto_install.begin(force).await {
            let current = self.capability(Duration::ZERO).await;
            return json!({
                "attempted": false,
                "ready": current.ready,
                "message": "Auto-install attempt is in cooldown",
                "capability": current,
            });
        }

        let capability = Self::detect_capability().await;
        if capability.ready {
            self.capability.store(capability.clone()).await;
            return json!({
                "attempted": false,
                "ready": true,
                "message": "Prerequisites already installed",
                "capability": capability,
            });
        }
        if capability.missing_tools.is_empty() {
            self.capability.store(capability.clone()).await;
            return json!({
                "attempted": false,
                "ready": false,
                "message": capability.message,
                "capability": capability,
            });
        }
        let Some(package_manager) = detect_linux_package_manager() else {
            self.capability.store(capability.clone()).await;
            return json!({
                "attempted": false,
                "ready": false,
                "message": "No supported package manager found for auto-install",
                "capability": capability,
            });
        };

        info!(package_manager, "installing container prerequisites");
        let (ok, message, details) =
            install_prerequisites(package_manager, &CONTAINER_PACKAGES).await;
        let refreshed = Self::detect_capability().await;
        self.capability.store(refreshed.clone()).await;
        json!({
            "attempted": true,
            "ok": ok,
            "ready": refreshed.ready,
            "message": message,
            "details": details,
            "package_manager": package_manager,
            "capability": refreshed,
        })
    }

    async fn create_container(&self, spec: &ContainerCreateSpec) -> ExecOutcome {
        let container_id = spec.container_id.trim();
        let name = spec.name.trim();
        let runtime_name = spec.runtime_name.trim();
        let image = spec.image.trim();
        if container_id.is_empty() || name.is_empty() || runtime_name.is_empty() || image.is_empty()
        {
            return failed("Invalid container_create payload");
        }
        let command_text = spec
            .command_text
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        let mut create_cmd: Vec<&str> = vec!["docker", "create", "--name", runtime_name, image];
        if let Some(text) = command_text {
            create_cmd.extend_from_slice(&["/bin/sh", "-lc", text]);
        }
        let created = run_sudo(&create_cmd, Duration::from_secs(240)).await;
        if !created.ok() {
            return (
                CommandStatus::Failed,
                format!(
                    "Docker create failed: {}",
                    first_error_line(&created.stdout, &created.stderr)
                ),
                json!({ "stderr": format!("{}\n{}", created.stderr, created.stdout).trim() }),
            );
        }
        let runtime_id = created
            .stdout
            .lines()
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        if spec.start_immediately {
            let started = run_sudo(&["docker", "start", runtime_name], Duration::from_secs(120)).await;
            if !started.ok() {
                return (
                    CommandStatus::Failed,
                    format!(
                        "Docker start failed: {}",
                        first_error_line(&started.stdout, &started.stderr)
                    ),
                    json!({ "stderr": format!("{}\n{}", started.stderr, started.stdout).trim() }),
                );
            }
        }

        let runtime_state = container_state(runtime_name).await;
        let fallback = if spec.start_immediately { "running" } else { "stopped" };
        let runtime_id = match runtime_id {
            Some(id) => Some(id),
            None => container_runtime_id(runtime_name).await,
        };
        (
            CommandStatus::Succeeded,
            "Container created".to_string(),
            json!({
                "container_id": container_id,
                "runtime_name": runtime_name,
                "runtime_id": runtime_id,
                "image": image,
                "state": derive_state(&runtime_state, fallback),
                "runtime_state": runtime_state,
            }),
        )
    }

    async fn start_container(&self, container_id: &str, runtime_name: &str) -> ExecOutcome {
        let out = run_sudo(&["docker", "start", runtime_name], Duration::from_secs(90)).await;
        let combined = format!("{}\n{}", out.stdout, out.stderr).to_lowercase();
        // Idempotent: an already-running container reads as success.
        if !out.ok()
            && !combined.contains("already started")
            && !combined.contains("is already running")
        {
            return failed(format!(
                "Unable to start container: {}",
                first_error_line(&out.stdout, &out.stderr)
            ));
        }
        let runtime_state = container_state(runtime_name).await;
        (
            CommandStatus::Succeeded,
            "Container started".to_string(),
            json!({
                "container_id": container_id,
                "runtime_name": runtime_name,
                "runtime_id": container_runtime_id(runtime_name).await,
                "state": derive_state(&runtime_state, "running"),
                "runtime_state": runtime_state,
            }),
        )
    }

    async fn stop_container(&self, container_id: &str, runtime_name: &str) -> ExecOutcome {
        let out = run_sudo(
            &["docker", "stop", "--time", "15", runtime_name],
            Duration::from_secs(120),
        )
        .await;
        let combined = format!("{}\n{}", out.stdout, out.stderr).to_lowercase();
        if !out.ok() && !combined.contains("is not running") {
            return failed(format!(
                "Unable to stop container: {}",
                first_error_line(&out.stdout, &out.stderr)
            ));
        }
        let runtime_state = container_state(runtime_name).await;
        (
            CommandStatus::Succeeded,
            "Container stopped".to_string(),
            json!({
                "container_id": container_id,
                "runtime_name": runtime_name,
                "runtime_id": container_runtime_id(runtime_name).await,
                "state": derive_state(&runtime_state, "stopped"),
                "runtime_state": runtime_state,
            }),
        )
    }

    async fn restart_container(&self, container_id: &str, runtime_name: &str) -> ExecOutcome {
        let out = run_sudo(&["docker", "restart", runtime_name], Duration::from_secs(120)).await;
        if !out.ok() {
            return failed(format!(
                "Unable to restart container: {}",
                first_error_line(&out.stdout, &out.stderr)
            ));
        }
        let runtime_state = container_state(runtime_name).await;
        (
            CommandStatus::Succeeded,
            "Container restarted".to_string(),
            json!({
                "container_id": container_id,
                "runtime_name": runtime_name,
                "runtime_id": container_runtime_id(runtime_name).await,
                "state": derive_state(&runtime_state, "running"),
                "runtime_state": runtime_state,
            }),
        )
    }

    async fn delete_container(&self, container_id: &str, runtime_name: &str) -> ExecOutcome {
        let out = run_sudo(&["docker", "rm", "-f", runtime_name], Duration::from_secs(120)).await;
        let combined = format!("{}\n{}", out.stdout, out.stderr).to_lowercase();
        if !out.ok() && !combined.contains("no such container") {
            return failed(format!(
                "Unable to delete container: {}",
                first_error_line(&out.stdout, &out.stderr)
            ));
        }
        (
            CommandStatus::Succeeded,
            "Container deleted".to_string(),
            json!({
                "container_id": container_id,
                "runtime_name": runtime_name,
                "state": "deleted",
            }),
        )
    }

    async fn sync_containers(&self) -> ExecOutcome {
        let out = run_sudo(
            &[
                "docker",
                "ps",
                "-a",
                "--no-trunc",
                "--format",
                "{{.ID}}\t{{.Names}}\t{{.Image}}\t{{.State}}\t{{.Status}}",
            ],
            Duration::from_secs(60),
        )
        .await;
        if !out.ok() {
            return failed(format!(
                "Unable to sync container state: {}",
                first_error_line(&out.stdout, &out.stderr)
            ));
        }
        let containers: Vec<Value> = out.stdout.lines().filter_map(parse_ps_line).collect();
        (
            CommandStatus::Succeeded,
            "Container sync complete".to_string(),
            json!({ "containers": containers }),
        )
    }

    /// Run one container command, gated on docker readiness.
    pub async fn execute(
        &self,
        command_type: &str,
        container_id: &str,
        runtime_name: &str,
        spec: Option<&ContainerCreateSpec>,
    ) -> ExecOutcome {
        let capability = self.capability(CAPABILITY_TTL).await;
        if !capability.ready {
            let auto_install = self.auto_install(false).await;
            let capability = self.capability(Duration::ZERO).await;
            if !capability.ready {
                warn!(message = %capability.message, "container capability not ready");
                return (
                    CommandStatus::Failed,
                    capability.message.clone(),
                    json!({ "capability": capability, "auto_install": auto_install }),
                );
            }
        }

        match command_type {
            "container_create" => match spec {
                Some(spec) => self.create_container(spec).await,
                None => failed("Missing create spec"),
            },
            "container_sync" => self.sync_containers().await,
            _ => {
                let runtime_name = runtime_name.trim();
                if runtime_name.is_empty() {
                    return failed("runtime_name is required");
                }
                match command_type {
                    "container_start" => self.start_container(container_id, runtime_name).await,
                    "container_stop" => self.stop_container(container_id, runtime_name).await,
                    "container_restart" => {
                        self.restart_container(container_id, runtime_name).await
                    }
                    "container_delete" => self.delete_container(container_id, runtime_name).await,
                    other => failed(format!("Unsupported container command type: {other}")),
                }
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
