//! Host introspection: system identity, runtime metrics, local IP, git commit.

use lattice_proto::{AgentInfo, UsageMetrics};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::net::UdpSocket;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use sysinfo::{Disks, System};
use url::Url;

const LOCAL_IP_TTL: Duration = Duration::from_secs(60);

pub fn hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Static OS/arch/hardware snapshot mirrored into pair requests and
/// heartbeat extras.
pub fn system_info() -> Value {
    json!({
        "os": {
            "name": System::name().unwrap_or_default(),
            "release": System::os_version().unwrap_or_default(),
            "version": System::kernel_version().unwrap_or_default(),
        },
        "arch": {
            "machine": std::env::consts::ARCH,
        },
        "hardware": {
            "node": hostname(),
            "processor": cpu_brand(),
            "cpu_count": num_cpus(),
        },
    })
}

fn cpu_brand() -> String {
    let mut sys = System::new();
    sys.refresh_cpu_list(sysinfo::CpuRefreshKind::new());
    sys.cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_string())
        .filter(|brand| !brand.is_empty())
        .unwrap_or_else(|| std::env::consts::ARCH.to_string())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

pub fn agent_info() -> AgentInfo {
    AgentInfo {
        hostname: hostname(),
        os: format!(
            "{} {}",
            System::name().unwrap_or_default(),
            System::os_version().unwrap_or_default()
        ),
        arch: std::env::consts::ARCH.to_string(),
        hardware: cpu_brand(),
    }
}

/// Live system probe. Keeps one `sysinfo::System` around so CPU usage has a
/// previous sample to diff against.
pub struct SystemProbe {
    sys: Mutex<System>,
    local_ip: Mutex<Option<(String, Instant)>>,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new_all()),
            local_ip: Mutex::new(None),
        }
    }

    pub fn runtime_metrics(&self) -> UsageMetrics {
        let mut sys = self.sys.lock();
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let memory_total = sys.total_memory();
        let memory_used = sys.used_memory();
        let memory_percent = if memory_total > 0 {
            memory_used as f64 / memory_total as f64 * 100.0
        } else {
            0.0
        };

        let disks = Disks::new_with_refreshed_list();
        let root = disks
            .list()
            .iter()
            .find(|d| d.mount_point() == std::path::Path::new("/"))
            .or_else(|| disks.list().first());
        let (storage_total, storage_used) = match root {
            Some(disk) => (
                disk.total_space(),
                disk.total_space().saturating_sub(disk.available_space()),
            ),
            None => (0, 0),
        };
        let storage_percent = if storage_total > 0 {
            storage_used as f64 / storage_total as f64 * 100.0
        } else {
            0.0
        };

        UsageMetrics {
            cpu_percent: Some(round2(sys.global_cpu_usage() as f64)),
            memory_percent: Some(round2(memory_percent)),
            memory_used_bytes: Some(memory_used as i64),
            memory_total_bytes: Some(memory_total as i64),
            storage_percent: Some(round2(storage_percent)),
            storage_used_bytes: Some(storage_used as i64),
            storage_total_bytes: Some(storage_total as i64),
        }
    }

    /// Local IPv4 as seen on the route towards the master, cached for a
    /// minute. Probing connects a UDP socket (no packets are sent) and reads
    /// back the chosen source address.
    pub fn local_ip(&self, master_url: &str) -> Option<String> {
        {
            let cached = self.local_ip.lock();
            if let Some((ip, probed_at)) = cached.as_ref() {
                if probed_at.elapsed() < LOCAL_IP_TTL {
                    return Some(ip.clone());
                }
            }
        }

        let mut targets: Vec<String> = Vec::new();
        if let Ok(url) = Url::parse(master_url) {
            if let Some(host) = url.host_str() {
                let port = url.port_or_known_default().unwrap_or(80);
                targets.push(format!("{host}:{port}"));
            }
        }
        targets.push("8.8.8.8:53".to_string());
        targets.push("1.1.1.1:53".to_string());

        for target in targets {
            let Ok(socket) = UdpSocket::bind("0.0.0.0:0") else {
                continue;
            };
            if socket.connect(&target).is_err() {
                continue;
            }
            if let Ok(addr) = socket.local_addr() {
                let ip = addr.ip();
                if ip.is_ipv4() && !ip.is_loopback() && !ip.is_unspecified() {
                    let ip = ip.to_string();
                    *self.local_ip.lock() = Some((ip.clone(), Instant::now()));
                    return Some(ip);
                }
            }
        }
        None
    }
}

/// Short git commit of the agent checkout, probed once.
pub fn git_commit() -> Option<String> {
    static COMMIT: OnceLock<Option<String>> = OnceLock::new();
    COMMIT
        .get_or_init(|| {
            std::process::Command::new("git")
                .args(["rev-parse", "--short", "HEAD"])
                .output()
                .ok()
                .filter(|out| out.status.success())
                .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .clone()
}
