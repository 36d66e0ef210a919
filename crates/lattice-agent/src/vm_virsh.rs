//! VM lifecycle executor backed by libvirt CLI tooling (`virsh`,
//! `virt-install`, `qemu-img`, `cloud-localds`).

use crate::capability::{
    AutoInstallGate, CAPABILITY_TTL, CapabilityCache, PackageSet, detect_linux_package_manager,
    install_prerequisites,
};
use crate::runner::{
    looks_like_missing_domain_error, looks_like_sudo_denial, run, run_sudo,
};
use futures_util::StreamExt;
use lattice_proto::{CapabilityReport, CommandStatus, ImageSpec, OsFamily, VmCreateSpec};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

const VM_ROOT: &str = "/var/lib/lattice/vms";
const IMAGE_ROOT: &str = "/var/lib/lattice/vm-images";

const REQUIRED_TOOLS: &[&str] = &[
    "sudo",
    "ip",
    "virsh",
    "virt-install",
    "qemu-img",
    "cloud-localds",
    "install",
    "mkdir",
    "rm",
];

const VM_PACKAGES: PackageSet = PackageSet {
    apt: &[
        "qemu-kvm",
        "libvirt-daemon-system",
        "libvirt-clients",
        "virtinst",
        "cloud-image-utils",
        "qemu-utils",
    ],
    rpm: &["qemu-kvm", "libvirt", "virt-install", "cloud-utils", "qemu-img"],
    pacman: &["qemu-full", "libvirt", "virt-install", "cloud-image-utils"],
    zypper: &["qemu-kvm", "libvirt", "virt-install", "cloud-utils"],
    service: "libvirtd",
};

/// Stop polls `domstate` this many times, two seconds apart, before forcing
/// a `virsh destroy`.
const STOP_POLL_ATTEMPTS: usize = 12;
const STOP_POLL_DELAY: Duration = Duration::from_secs(2);

type ExecOutcome = (CommandStatus, String, Value);

fn failed(message: impl Into<String>) -> ExecOutcome {
    (CommandStatus::Failed, message.into(), json!({}))
}

// ─── Pure helpers ─────────────────────────────────────────────────────────────

pub fn normalize_arch(value: &str) -> String {
    match value.trim().to_lowercase().as_str() {
        "x86_64" | "amd64" | "x64" => "amd64".to_string(),
        "aarch64" | "arm64" => "arm64".to_string(),
        other => other.to_string(),
    }
}

/// Architecture an image is built for: the declared tag wins, otherwise it is
/// inferred from the image name and source URL.
pub fn resolve_image_architecture(image: &ImageSpec) -> String {
    if let Some(declared) = image.architecture.as_deref() {
        let normalized = normalize_arch(declared);
        if !normalized.is_empty() {
            return normalized;
        }
    }
    let combined = format!(
        "{} {}",
        image.source_url.to_lowercase(),
        image.name.to_lowercase()
    );
    if combined.contains("amd64") || combined.contains("x86_64") {
        return "amd64".to_string();
    }
    if combined.contains("arm64") || combined.contains("aarch64") {
        return "arm64".to_string();
    }
    String::new()
}

fn resolve_osinfo_value(image: &ImageSpec) -> &'static str {
    match image.os_family {
        OsFamily::Linux => "linux2022",
        OsFamily::Windows => "win10",
    }
}

/// First IPv4 address found in command output, e.g. a `virsh domifaddr` row.
pub fn extract_ipv4(text: &str) -> Option<String> {
    for token in text.split_whitespace() {
        let candidate = token.split('/').next().unwrap_or(token);
        if candidate.parse::<std::net::Ipv4Addr>().is_ok() {
            return Some(candidate.to_string());
        }
    }
    None
}

/// Cloud-init user-data: guest account with NOPASSWD sudo plus a serial
/// getty so `virsh console` has a login prompt.
pub fn build_user_data(domain_name: &str, username: &str, password: &str) -> String {
    format!(
        "#cloud-config\n\
         hostname: {domain_name}\n\
         manage_etc_hosts: true\n\
         users:\n\
         \x20 - name: {username}\n\
         \x20   shell: /bin/bash\n\
         \x20   groups: sudo\n\
         \x20   sudo: ALL=(ALL) NOPASSWD:ALL\n\
         \x20   lock_passwd: false\n\
         \x20   plain_text_passwd: '{password}'\n\
         ssh_pwauth: true\n\
         chpasswd:\n\
         \x20 expire: false\n\
         runcmd:\n\
         \x20 - [ sh, -c, \"systemctl enable --now serial-getty@ttyS0.service || true\" ]\n"
    )
}

// ─── Domain probes ────────────────────────────────────────────────────────────

pub async fn domain_state(domain_name: &str) -> String {
    let out = run_sudo(&["virsh", "domstate", domain_name], Duration::from_secs(30)).await;
    if out.ok() {
        out.stdout.trim().to_lowercase()
    } else {
        "unknown".to_string()
    }
}

async fn domain_uuid(domain_name: &str) -> Option<String> {
    let out = run_sudo(&["virsh", "domuuid", domain_name], Duration::from_secs(30)).await;
    if out.ok() {
        let value = out.stdout.trim().to_string();
        if value.is_empty() { None } else { Some(value) }
    } else {
        None
    }
}

async fn domain_ip(domain_name: &str) -> Option<String> {
    let out = run_sudo(
        &["virsh", "domifaddr", domain_name, "--source", "agent"],
        Duration::from_secs(30),
    )
    .await;
    if out.ok() { extract_ipv4(&out.stdout) } else { None }
}

async fn domain_details(vm_id: &str, domain_name: &str) -> Value {
    json!({
        "vm_id": vm_id,
        "domain_name": domain_name,
        "domain_uuid": domain_uuid(domain_name).await,
        "power_state": domain_state(domain_name).await,
        "ip_address": domain_ip(domain_name).await,
    })
}

// ─── Networking ───────────────────────────────────────────────────────────────

async fn bridge_exists(name: &str) -> bool {
    let interface = name.trim();
    if interface.is_empty() {
        return false;
    }
    run(&["ip", "link", "show", interface], Duration::from_secs(20))
        .await
        .ok()
}

async fn ensure_libvirt_default_network() -> bool {
    let mut info = run_sudo(&["virsh", "net-info", "default"], Duration::from_secs(30)).await;
    if !info.ok() {
        // Try defining the default network from common libvirt XML locations.
        let mut defined = false;
        for candidate in [
            "/usr/share/libvirt/networks/default.xml",
            "/etc/libvirt/qemu/networks/default.xml",
        ] {
            if !Path::new(candidate).exists() {
                continue;
            }
            let define =
                run_sudo(&["virsh", "net-define", candidate], Duration::from_secs(60)).await;
            if define.ok() {
                defined = true;
                break;
            }
        }
        if !defined {
            return false;
        }
        info = run_sudo(&["virsh", "net-info", "default"], Duration::from_secs(30)).await;
        if !info.ok() {
            return false;
        }
    }
    if info.stdout.to_lowercase().contains("active: yes") {
        return true;
    }
    run_sudo(&["virsh", "net-start", "default"], Duration::from_secs(60)).await;
    run_sudo(&["virsh", "net-autostart", "default"], Duration::from_secs(30)).await;
    let refreshed = run_sudo(&["virsh", "net-info", "default"], Duration::from_secs(30)).await;
    refreshed.ok() && refreshed.stdout.to_lowercase().contains("active: yes")
}

/// Pick the virt-install network argument: the requested bridge when it
/// exists, else the libvirt default network, else user-mode networking. The
/// second element is an operator-facing notice for the fallbacks.
async fn resolve_network_argument(requested_bridge: &str) -> (Option<String>, Option<String>) {
    let bridge = {
        let trimmed = requested_bridge.trim();
        if trimmed.is_empty() { "br0" } else { trimmed }
    };
    if bridge_exists(bridge).await {
        return (Some(format!("bridge={bridge},model=virtio")), None);
    }
    if ensure_libvirt_default_network().await {
        return (
            Some("network=default,model=virtio".to_string()),
            Some(format!(
                "Bridge '{bridge}' not found; using libvirt default network"
            )),
        );
    }
    (
        Some("user,model=virtio".to_string()),
        Some(format!(
            "Bridge '{bridge}' not found and libvirt network 'default' is unavailable; using user-mode network"
        )),
    )
}

// ─── Subsystem ────────────────────────────────────────────────────────────────

pub struct VmSubsystem {
    capability: CapabilityCache,
    auto_install: AutoInstallGate,
    http: reqwest::Client,
}

impl Default for VmSubsystem {
    fn default() -> Self {
        Self::new()
    }
}

impl VmSubsystem {
    pub fn new() -> Self {
        Self {
            capability: CapabilityCache::new(),
            auto_install: AutoInstallGate::new(),
            http: reqwest::Client::new(),
        }
    }

    async fn detect_capability() -> CapabilityReport {
        let managed_paths = Some(vec![IMAGE_ROOT.to_string(), VM_ROOT.to_string()]);
        if !cfg!(target_os = "linux") {
            return CapabilityReport {
                provider: "libvirt".to_string(),
                ready: false,
                message: "libvirt VM support is Linux-only in v1".to_string(),
                missing_tools: Vec::new(),
                version: None,
                managed_paths,
                details: None,
            };
        }

        let missing_tools: Vec<String> = REQUIRED_TOOLS
            .iter()
            .filter(|tool| which::which(tool).is_err())
            .map(|tool| tool.to_string())
            .collect();
        if !missing_tools.is_empty() {
            return CapabilityReport {
                provider: "libvirt".to_string(),
                ready: false,
                message: "Missing required virtualization tools".to_string(),
                missing_tools,
                version: None,
                managed_paths,
                details: None,
            };
        }

        let probe = run_sudo(&["virsh", "list", "--all"], Duration::from_secs(30)).await;
        if !probe.ok() {
            let message = if looks_like_sudo_denial(&probe.stderr) {
                "sudo -n denied; configure NOPASSWD sudo or install prerequisites manually"
            } else {
                "Unable to access libvirt with sudo -n"
            };
            return CapabilityReport {
                provider: "libvirt".to_string(),
                ready: false,
                message: message.to_string(),
                missing_tools: Vec::new(),
                version: None,
                managed_paths,
                details: Some(probe.stderr),
            };
        }

        CapabilityReport {
            provider: "libvirt".to_string(),
            ready: true,
            message: "libvirt ready".to_string(),
            missing_tools: Vec::new(),
            version: None,
            managed_paths,
            details: None,
        }
    }

    pub async fn capability(&self, max_age: Duration) -> CapabilityReport {
        self.capability.get(max_age, Self::detect_capability).await
    }

    /// Attempt to install VM prerequisites, at most once per cooldown window.
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

        info!(package_manager, "installing VM prerequisites");
        let (ok, message, details) = install_prerequisites(package_manager, &VM_PACKAGES).await;
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

    // ── Image handling ────────────────────────────────────────────────────

    async fn download_cloud_image(&self, image: &ImageSpec) -> Result<PathBuf, String> {
        if image.id.trim().is_empty() {
            return Err("image.id is required".to_string());
        }
        if image.source_url.trim().is_empty() {
            return Err("image.source_url is required".to_string());
        }

        let image_path = Path::new(IMAGE_ROOT).join(format!("{}.qcow2", image.id));
        let mkdir = run_sudo(&["mkdir", "-p", IMAGE_ROOT], Duration::from_secs(30)).await;
        if !mkdir.ok() {
            return Err(format!("unable to prepare image directory: {}", mkdir.stderr));
        }
        if image_path.exists() {
            return Ok(image_path);
        }

        let tmp_path = std::env::temp_dir().join(format!("lattice-image-{}.tmp", image.id));
        let digest = self
            .fetch_to_file(&image.source_url, &tmp_path)
            .await
            .map_err(|e| format!("image download failed: {e}"))?;

        if let Some(expected) = image.sha256.as_deref() {
            let expected = expected.trim().to_lowercase();
            if !expected.is_empty() && digest != expected {
                let _ = std::fs::remove_file(&tmp_path);
                return Err("image checksum mismatch".to_string());
            }
        }

        let tmp = tmp_path.to_string_lossy().to_string();
        let target = image_path.to_string_lossy().to_string();
        let installed = run_sudo(
            &["install", "-m", "0644", &tmp, &target],
            Duration::from_secs(120),
        )
        .await;
        let _ = std::fs::remove_file(&tmp_path);
        if !installed.ok() {
            return Err(format!("unable to install image: {}", installed.stderr));
        }
        Ok(image_path)
    }

    /// Stream a URL to disk, returning the hex sha256 of the body.
    async fn fetch_to_file(&self, url: &str, path: &Path) -> Result<String, String> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| e.to_string())?;

        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| e.to_string())?;
        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| e.to_string())?;
            hasher.update(&chunk);
            file.write_all(&chunk).await.map_err(|e| e.to_string())?;
        }
        file.flush().await.map_err(|e| e.to_string())?;
        Ok(hex::encode(hasher.finalize()))
    }

    async fn create_cloud_init_seed(
        &self,
        vm_dir: &Path,
        domain_name: &str,
        username: &str,
        password: &str,
    ) -> Result<PathBuf, String> {
        let user_data_path = std::env::temp_dir().join(format!("{domain_name}-user-data.yaml"));
        let meta_data_path = std::env::temp_dir().join(format!("{domain_name}-meta-data.yaml"));
        let seed_path = vm_dir.join("seed.iso");

        let user_data = build_user_data(domain_name, username, password);
        let meta_data = format!("instance-id: {domain_name}\nlocal-hostname: {domain_name}\n");
        std::fs::write(&user_data_path, user_data).map_err(|e| e.to_string())?;
        std::fs::write(&meta_data_path, meta_data).map_err(|e| e.to_string())?;

        let seed = seed_path.to_string_lossy().to_string();
        let user = user_data_path.to_string_lossy().to_string();
        let meta = meta_data_path.to_string_lossy().to_string();
        let result = run_sudo(
            &["cloud-localds", &seed, &user, &meta],
            Duration::from_secs(120),
        )
        .await;
        let _ = std::fs::remove_file(&user_data_path);
        let _ = std::fs::remove_file(&meta_data_path);
        if !result.ok() {
            return Err(format!("cloud-init seed creation failed: {}", result.stderr));
        }
        Ok(seed_path)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    async fn create_vm(&self, spec: &VmCreateSpec) -> ExecOutcome {
        let vm_id = spec.vm_id.trim();
        let domain_name = spec.domain_name.trim();
        if vm_id.is_empty() || domain_name.is_empty() {
            return failed("Invalid vm_create payload");
        }
        let guest_username = spec.guest.username.trim();
        let guest_password = spec.guest.password.trim();
        if guest_username.is_empty() || guest_password.is_empty() {
            return failed("Guest credentials are required");
        }

        let host_arch = normalize_arch(std::env::consts::ARCH);
        let image_arch = resolve_image_architecture(&spec.image);
        if !host_arch.is_empty() && !image_arch.is_empty() && host_arch != image_arch {
            return (
                CommandStatus::Failed,
                format!(
                    "Image architecture '{image_arch}' is incompatible with node architecture \
                     '{host_arch}'. Choose a '{host_arch}' cloud image."
                ),
                json!({
                    "host_architecture": host_arch,
                    "image_architecture": image_arch,
                }),
            );
        }

        let vm_dir = Path::new(VM_ROOT).join(vm_id);
        let vm_dir_str = vm_dir.to_string_lossy().to_string();
        let mkdir = run_sudo(&["mkdir", "-p", &vm_dir_str], Duration::from_secs(30)).await;
        if !mkdir.ok() {
            return failed(format!("Unable to create VM directory: {}", mkdir.stderr));
        }

        let base_image_path = match self.download_cloud_image(&spec.image).await {
            Ok(path) => path,
            Err(message) => return failed(message),
        };

        let disk_path = vm_dir.join("disk.qcow2");
        let disk = disk_path.to_string_lossy().to_string();
        let base = base_image_path.to_string_lossy().to_string();
        let size = format!("{}G", spec.disk_gb);
        let provision = run_sudo(
            &[
                "qemu-img", "create", "-f", "qcow2", "-F", "qcow2", "-b", &base, &disk, &size,
            ],
            Duration::from_secs(240),
        )
        .await;
        if !provision.ok() {
            return failed(format!("Disk provisioning failed: {}", provision.stderr));
        }

        let seed_path = match self
            .create_cloud_init_seed(&vm_dir, domain_name, guest_username, guest_password)
            .await
        {
            Ok(path) => path,
            Err(message) => return failed(message),
        };

        let (network_arg, network_notice) = resolve_network_argument(&spec.bridge).await;
        let Some(network_arg) = network_arg else {
            return failed(
                network_notice.unwrap_or_else(|| "Unable to resolve VM network target".to_string()),
            );
        };

        let memory = spec.memory_mb.to_string();
        let vcpus = spec.vcpu.to_string();
        let disk_arg = format!("path={disk},format=qcow2,bus=virtio");
        let seed_arg = format!("path={},device=cdrom", seed_path.to_string_lossy());
        let osinfo = resolve_osinfo_value(&spec.image);
        let install = run_sudo(
            &[
                "virt-install",
                "--name",
                domain_name,
                "--memory",
                &memory,
                "--vcpus",
                &vcpus,
                "--import",
                "--disk",
                &disk_arg,
                "--disk",
                &seed_arg,
                "--network",
                &network_arg,
                "--serial",
                "pty",
                "--console",
                "pty,target.type=serial",
                "--osinfo",
                osinfo,
                "--graphics",
                "none",
                "--noautoconsole",
            ],
            Duration::from_secs(300),
        )
        .await;
        if !install.ok() {
            return failed(format!("virt-install failed: {}", install.stderr));
        }

        let message = match network_notice {
            Some(notice) => format!("VM created ({notice})"),
            None => "VM created".to_string(),
        };
        (
            CommandStatus::Succeeded,
            message,
            domain_details(vm_id, domain_name).await,
        )
    }

    async fn start_vm(&self, vm_id: &str, domain_name: &str) -> ExecOutcome {
        let out = run_sudo(&["virsh", "start", domain_name], Duration::from_secs(60)).await;
        if !out.ok() && !out.stderr.to_lowercase().contains("already active") {
            return failed(format!("Unable to start VM: {}", out.stderr));
        }
        (
            CommandStatus::Succeeded,
            "VM started".to_string(),
            domain_details(vm_id, domain_name).await,
        )
    }

    async fn stop_vm(&self, vm_id: &str, domain_name: &str) -> ExecOutcome {
        run_sudo(&["virsh", "shutdown", domain_name], Duration::from_secs(30)).await;
        for _ in 0..STOP_POLL_ATTEMPTS {
            let state = domain_state(domain_name).await;
            if state.contains("shut") || state.contains("off") || state.contains("stopped") {
                return (
                    CommandStatus::Succeeded,
                    "VM stopped".to_string(),
                    json!({
                        "vm_id": vm_id,
                        "domain_name": domain_name,
                        "power_state": "stopped",
                        "domain_uuid": domain_uuid(domain_name).await,
                    }),
                );
            }
            tokio::time::sleep(STOP_POLL_DELAY).await;
        }

        // Graceful shutdown never landed; pull the plug.
        run_sudo(&["virsh", "destroy", domain_name], Duration::from_secs(30)).await;
        let state = domain_state(domain_name).await;
        if state.contains("running") {
            return (
                CommandStatus::Failed,
                "VM did not stop".to_string(),
                json!({
                    "vm_id": vm_id,
                    "domain_name": domain_name,
                    "power_state": state,
                }),
            );
        }
        (
            CommandStatus::Succeeded,
            "VM stopped".to_string(),
            json!({
                "vm_id": vm_id,
                "domain_name": domain_name,
                "power_state": state,
                "domain_uuid": domain_uuid(domain_name).await,
            }),
        )
    }

    async fn reboot_vm(&self, vm_id: &str, domain_name: &str) -> ExecOutcome {
        let out = run_sudo(&["virsh", "reboot", domain_name], Duration::from_secs(60)).await;
        if !out.ok() {
            return failed(format!("Unable to reboot VM: {}", out.stderr));
        }
        (
            CommandStatus::Succeeded,
            "VM rebooted".to_string(),
            domain_details(vm_id, domain_name).await,
        )
    }

    async fn delete_vm(&self, vm_id: &str, domain_name: &str) -> ExecOutcome {
        run_sudo(&["virsh", "destroy", domain_name], Duration::from_secs(30)).await;
        let undefine = run_sudo(
            &[
                "virsh",
                "undefine",
                domain_name,
                "--nvram",
                "--remove-all-storage",
            ],
            Duration::from_secs(120),
        )
        .await;
        if !undefine.ok() && !looks_like_missing_domain_error(&undefine.stdout, &undefine.stderr) {
            let reason = if undefine.stderr.is_empty() {
                undefine.stdout.clone()
            } else {
                undefine.stderr.clone()
            };
            return failed(format!("Unable to delete VM: {reason}"));
        }
        if !vm_id.is_empty() {
            let vm_dir = Path::new(VM_ROOT).join(vm_id);
            let vm_dir_str = vm_dir.to_string_lossy().to_string();
            run_sudo(&["rm", "-rf", &vm_dir_str], Duration::from_secs(30)).await;
        }
        (
            CommandStatus::Succeeded,
            "VM deleted".to_string(),
            json!({
                "vm_id": vm_id,
                "domain_name": domain_name,
                "power_state": "deleted",
            }),
        )
    }

    async fn sync_vms(&self) -> ExecOutcome {
        let out = run_sudo(&["virsh", "list", "--all", "--name"], Duration::from_secs(30)).await;
        if !out.ok() {
            return failed(format!("Unable to sync VM state: {}", out.stderr));
        }
        let mut vms = Vec::new();
        for line in out.stdout.lines() {
            let name = line.trim();
            if name.is_empty() {
                continue;
            }
            vms.push(json!({
                "domain_name": name,
                "power_state": domain_state(name).await,
                "domain_uuid": domain_uuid(name).await,
            }));
        }
        (
            CommandStatus::Succeeded,
            "VM sync complete".to_string(),
            json!({ "vms": vms }),
        )
    }

    /// Run one VM command. The capability gate runs first and triggers a
    /// cooldown-limited auto-install when tooling is missing.
    pub async fn execute(
        &self,
        command_type: &str,
        vm_id: &str,
        domain_name: &str,
        spec: Option<&VmCreateSpec>,
    ) -> ExecOutcome {
        let capability = self.capability(CAPABILITY_TTL).await;
        if !capability.ready {
            let auto_install = self.auto_install(false).await;
            let capability = self.capability(Duration::ZERO).await;
            if !capability.ready {
                warn!(message = %capability.message, "vm capability not ready");
                return (
                    CommandStatus::Failed,
                    capability.message.clone(),
                    json!({ "capability": capability, "auto_install": auto_install }),
                );
            }
        }

        match command_type {
            "vm_create" => match spec {
                Some(spec) => self.create_vm(spec).await,
                None => failed("Missing create spec"),
            },
            _ => {
                let domain_name = domain_name.trim();
                if domain_name.is_empty() {
                    return failed("domain_name is required");
                }
                match command_type {
                    "vm_start" => self.start_vm(vm_id, domain_name).await,
                    "vm_stop" => self.stop_vm(vm_id, domain_name).await,
                    "vm_reboot" => self.reboot_vm(vm_id, domain_name).await,
                    "vm_delete" => self.delete_vm(vm_id, domain_name).await,
                    "vm_sync" => self.sync_vms().await,
                    other => failed(format!("Unsupported vm command type: {other}")),
                }
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn image(arch: Option<&str>, url: &str, name: &str) -> ImageSpec {
        ImageSpec {
            id: "img-1".to_string(),
            name: name.to_string(),
            os_family: OsFamily::Linux,
            architecture: arch.map(str::to_string),
            source_url: url.to_string(),
            sha256: None,
            default_username: "ubuntu".to_string(),
            cloud_init_enabled: true,
        }
    }

    #[test]
    fn arch_normalisation_collapses_aliases() {
        assert_eq!(normalize_arch("x86_64"), "amd64");
        assert_eq!(normalize_arch("AMD64"), "amd64");
        assert_eq!(normalize_arch("x64"), "amd64");
        assert_eq!(normalize_arch("aarch64"), "arm64");
        assert_eq!(normalize_arch("arm64"), "arm64");
        assert_eq!(normalize_arch("riscv64"), "riscv64");
    }

    #[test]
    fn image_architecture_prefers_declared_tag() {
        let img = image(Some("aarch64"), "https://host/noble-amd64.img", "Ubuntu");
        assert_eq!(resolve_image_architecture(&img), "arm64");
    }

    #[test]
    fn image_architecture_falls_back_to_url_and_name() {
        let by_url = image(None, "https://host/noble-server-cloudimg-amd64.img", "Ubuntu");
        assert_eq!(resolve_image_architecture(&by_url), "amd64");

        let by_name = image(None, "https://host/image.qcow2", "Debian 12 arm64");
        assert_eq!(resolve_image_architecture(&by_name), "arm64");

        let unknown = image(None, "https://host/image.qcow2", "Mystery");
        assert_eq!(resolve_image_architecture(&unknown), "");
    }

    #[test]
    fn osinfo_tracks_os_family() {
        let linux = image(None, "u", "n");
        assert_eq!(resolve_osinfo_value(&linux), "linux2022");
        let mut windows = image(None, "u", "n");
        windows.os_family = OsFamily::Windows;
        assert_eq!(resolve_osinfo_value(&windows), "win10");
    }

    #[test]
    fn ipv4_extraction_handles_domifaddr_rows() {
        let out = " vnet0      52:54:00:aa:bb:cc    ipv4         192.168.122.50/24";
        assert_eq!(extract_ipv4(out), Some("192.168.122.50".to_string()));
        assert_eq!(extract_ipv4("no address here"), None);
        assert_eq!(extract_ipv4("999.1.1.1 10.0.0.12/16"), Some("10.0.0.12".to_string()));
    }

    #[test]
    fn user_data_provisions_guest_and_serial_console() {
        let data = build_user_data("lattice-abcd1234", "ops", "secret");
        assert!(data.starts_with("#cloud-config\n"));
        assert!(data.contains("hostname: lattice-abcd1234"));
        assert!(data.contains("- name: ops"));
        assert!(data.contains("sudo: ALL=(ALL) NOPASSWD:ALL"));
        assert!(data.contains("plain_text_passwd: 'secret'"));
        assert!(data.contains("serial-getty@ttyS0.service"));
    }
}
