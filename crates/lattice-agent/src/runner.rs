//! External command execution helpers shared by every executor.
//!
//! `run`/`run_sudo` never fail: spawn errors and timeouts fold into a
//! non-zero exit code with the reason in stderr, so callers only ever look
//! at `(exit_code, stdout, stderr)`.

use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(&self) -> bool {
        self.exit_code == 0
    }

    fn failure(reason: String) -> Self {
        Self {
            exit_code: 1,
            stdout: String::new(),
            stderr: reason,
        }
    }
}

pub async fn run(cmd: &[&str], timeout: Duration) -> CommandOutput {
    let Some((program, args)) = cmd.split_first() else {
        return CommandOutput::failure("empty command".to_string());
    };
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => CommandOutput {
            exit_code: output.status.code().unwrap_or(1),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        },
        Ok(Err(e)) => CommandOutput::failure(e.to_string()),
        Err(_) => CommandOutput::failure(format!(
            "command timed out after {}s",
            timeout.as_secs()
        )),
    }
}

/// Whether the agent runs as root, probed once via `id -u`.
pub fn is_root() -> bool {
    static IS_ROOT: OnceLock<bool> = OnceLock::new();
    *IS_ROOT.get_or_init(|| {
        std::process::Command::new("id")
            .arg("-u")
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).trim() == "0")
            .unwrap_or(false)
    })
}

/// Run privileged: directly when root, otherwise under non-interactive sudo.
pub async fn run_sudo(cmd: &[&str], timeout: Duration) -> CommandOutput {
    if is_root() {
        return run(cmd, timeout).await;
    }
    let mut wrapped: Vec<&str> = Vec::with_capacity(cmd.len() + 2);
    wrapped.push("sudo");
    wrapped.push("-n");
    wrapped.extend_from_slice(cmd);
    run(&wrapped, timeout).await
}

pub async fn run_sudo_with_retry(
    cmd: &[&str],
    timeout: Duration,
    retries: usize,
    retry_delay: Duration,
    retry_on: fn(&str, &str) -> bool,
) -> CommandOutput {
    let attempts = retries.max(1);
    let mut last = CommandOutput::failure("command not executed".to_string());
    for attempt in 1..=attempts {
        last = run_sudo(cmd, timeout).await;
        if last.ok() || attempt >= attempts {
            break;
        }
        if !retry_on(&last.stdout, &last.stderr) {
            break;
        }
        tokio::time::sleep(retry_delay.max(Duration::from_secs(1))).await;
    }
    last
}

/// Summarise a failure by its first non-empty line, preferring stderr.
pub fn first_error_line(stdout: &str, stderr: &str) -> String {
    for source in [stderr, stdout] {
        for line in source.lines() {
            let line = line.trim();
            if !line.is_empty() {
                return line.to_string();
            }
        }
    }
    "unknown error".to_string()
}

pub fn looks_like_apt_lock_error(stdout: &str, stderr: &str) -> bool {
    let combined = format!("{stdout}\n{stderr}").to_lowercase();
    [
        "could not get lock",
        "unable to acquire the dpkg frontend lock",
        "is another process using it",
        "/var/lib/dpkg/lock",
        "/var/lib/apt/lists/lock",
    ]
    .iter()
    .any(|marker| combined.contains(marker))
}

pub fn looks_like_missing_domain_error(stdout: &str, stderr: &str) -> bool {
    let combined = format!("{stdout}\n{stderr}").to_lowercase();
    [
        "domain not found",
        "failed to get domain",
        "no domain with matching name",
        "domain does not exist",
    ]
    .iter()
    .any(|marker| combined.contains(marker))
}

/// Maps a `sudo -n` refusal to a clear capability message.
pub fn looks_like_sudo_denial(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("password is required")
        || lower.contains("no tty present")
        || lower.contains("not in the sudoers file")
}
