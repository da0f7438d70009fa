//! SSH transport - the engine's remote execution capability
//!
//! Shells out to the OpenSSH client rather than linking a protocol
//! implementation; the server side needs nothing but sshd. Container
//! targets are reached by wrapping the command in `incus exec` on the
//! host. Every invocation is bounded by the caller's timeout.

use anyhow::{Context, Result, bail};
use orchestrate::{ExecError, ExecOutput, RemoteExecutor, Target};
use regex::Regex;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::config::{AuthMethod, ServerConfig};

const CONNECT_TIMEOUT_SECS: u32 = 10;
const HEREDOC_MARKER: &str = "VIBEHOST_EOF";

enum Auth {
    Password(String),
    KeyFile(PathBuf),
}

/// Connection settings for one target server.
///
/// Stateless between calls: each execute spawns a fresh ssh process, so
/// concurrent workers never contend over a shared channel.
pub struct SshSession {
    host: String,
    port: u16,
    user: String,
    auth: Auth,
}

/// Facts gathered by the preflight probe
#[derive(Debug, Clone)]
pub struct HostFacts {
    pub pretty_name: String,
    pub os_id: String,
    pub debian_version: Option<u32>,
    pub memory_gb: f64,
    pub cpu_cores: u32,
    pub disk_free_gb: u64,
}

impl SshSession {
    /// Build a session from server configuration
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let auth = match config.auth_method {
            AuthMethod::Password => {
                let password = config
                    .ssh_password
                    .clone()
                    .context("ssh_password missing for password auth")?;
                Auth::Password(password)
            }
            AuthMethod::SshKey => {
                let path = config
                    .key_path()
                    .context("ssh_key_path missing for key auth")?;
                if !path.exists() {
                    bail!("SSH key not found: {}", path.display());
                }
                Auth::KeyFile(path)
            }
        };

        Ok(Self {
            host: config.host.clone(),
            port: config.ssh_port,
            user: config.ssh_user.clone(),
            auth,
        })
    }

    /// ssh invocation with auth and connection options applied
    fn ssh_command(&self) -> Command {
        let mut cmd = match &self.auth {
            Auth::Password(password) => {
                // sshpass -e reads the password from the environment so
                // it never appears in the process list
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").env("SSHPASS", password).arg("ssh");
                cmd
            }
            Auth::KeyFile(path) => {
                let mut cmd = Command::new("ssh");
                cmd.arg("-i").arg(path).args(["-o", "BatchMode=yes"]);
                cmd
            }
        };

        cmd.args([
            "-p",
            &self.port.to_string(),
            "-o",
            &format!("ConnectTimeout={CONNECT_TIMEOUT_SECS}"),
            "-o",
            "StrictHostKeyChecking=accept-new",
            &format!("{}@{}", self.user, self.host),
        ]);
        cmd
    }

    /// Wrap a command for the logical target: host commands get sudo
    /// when we are not root, container commands go through incus exec.
    fn remote_command(&self, target: &Target, command: &str) -> String {
        let as_root = self.user == "root";
        match target {
            Target::Host => {
                if as_root {
                    command.to_string()
                } else {
                    format!("sudo bash -c {}", shell_quote(command))
                }
            }
            Target::Container(name) => {
                let exec = format!("incus exec {name} -- bash -c {}", shell_quote(command));
                if as_root { exec } else { format!("sudo {exec}") }
            }
        }
    }

    /// Test connectivity and gather host facts before any step runs
    pub fn preflight(&self) -> Result<HostFacts> {
        let probe = self
            .execute(&Target::Host, "echo connection-test", Duration::from_secs(30))
            .map_err(|e| anyhow::anyhow!("could not connect to {}: {e}", self.host))?;
        if !probe.success() || probe.stdout_trimmed() != "connection-test" {
            bail!("unexpected response from {}", self.host);
        }

        let os_release = self
            .execute(&Target::Host, "cat /etc/os-release", Duration::from_secs(30))?
            .stdout;
        let (pretty_name, os_id, debian_version) = parse_os_release(&os_release);

        let mem = self.execute(
            &Target::Host,
            "grep MemTotal /proc/meminfo | awk '{print $2}'",
            Duration::from_secs(30),
        )?;
        let memory_gb = parse_mem_kb(mem.stdout_trimmed());

        let cores = self.execute(&Target::Host, "nproc", Duration::from_secs(30))?;
        let cpu_cores = cores.stdout_trimmed().parse().unwrap_or(0);

        let disk = self.execute(
            &Target::Host,
            "df -BG / | tail -1 | awk '{print $4}'",
            Duration::from_secs(30),
        )?;
        let disk_free_gb = parse_disk_gb(disk.stdout_trimmed());

        Ok(HostFacts {
            pretty_name,
            os_id,
            debian_version,
            memory_gb,
            cpu_cores,
            disk_free_gb,
        })
    }
}

impl RemoteExecutor for SshSession {
    fn execute(
        &self,
        target: &Target,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, ExecError> {
        let mut cmd = self.ssh_command();
        cmd.arg(self.remote_command(target, command));
        log::debug!("[{target}] exec ({} bytes)", command.len());

        let output = run_with_deadline(cmd, timeout)?;
        if output.exit_code == 255 {
            return Err(ExecError::Connection {
                target: format!("{}@{}", self.user, self.host),
                message: output.stderr_trimmed().to_string(),
            });
        }
        Ok(output)
    }

    fn upload(
        &self,
        target: &Target,
        content: &str,
        remote_path: &str,
        mode: &str,
        timeout: Duration,
    ) -> Result<(), ExecError> {
        let script = write_file_script(content, remote_path, mode);
        let output = self.execute(target, &script, timeout)?;
        if !output.success() {
            return Err(ExecError::Connection {
                target: target.key(),
                message: format!(
                    "writing {remote_path} failed: {}",
                    output.stderr_trimmed()
                ),
            });
        }
        Ok(())
    }
}

/// Heredoc write followed by chmod, as one remote script
fn write_file_script(content: &str, remote_path: &str, mode: &str) -> String {
    format!(
        "tee {remote_path} > /dev/null << '{HEREDOC_MARKER}'\n{content}\n{HEREDOC_MARKER}\nchmod {mode} {remote_path}"
    )
}

/// Single-quote a string for a POSIX shell
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Spawn the command and enforce the deadline by polling, killing the
/// child when the budget is spent. Output is drained on reader threads
/// so a chatty command cannot block on a full pipe.
fn run_with_deadline(mut cmd: Command, timeout: Duration) -> Result<ExecOutput, ExecError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn()?;
    let stdout_handle = spawn_reader(child.stdout.take());
    let stderr_handle = spawn_reader(child.stderr.take());

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if started.elapsed() >= timeout {
            kill_child(&mut child);
            return Err(ExecError::Timeout(timeout));
        }
        std::thread::sleep(Duration::from_millis(50));
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();

    Ok(ExecOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout,
        stderr,
    })
}

fn spawn_reader<R: Read + Send + 'static>(
    source: Option<R>,
) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut reader) = source {
            let _ = reader.read_to_string(&mut buf);
        }
        buf
    })
}

fn kill_child(child: &mut Child) {
    if let Err(e) = child.kill() {
        log::warn!("failed to kill timed-out ssh process: {e}");
    }
    let _ = child.wait();
}

/// Extract PRETTY_NAME, ID, and the Debian major version
fn parse_os_release(content: &str) -> (String, String, Option<u32>) {
    let field = |key: &str| -> String {
        let re = Regex::new(&format!(r#"(?m)^{key}="?([^"\n]*)"?$"#)).expect("static regex");
        re.captures(content)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
    };

    let pretty_name = field("PRETTY_NAME");
    let os_id = field("ID");
    let debian_version = field("VERSION_ID")
        .split('.')
        .next()
        .and_then(|v| v.parse().ok());

    (pretty_name, os_id, debian_version)
}

fn parse_mem_kb(s: &str) -> f64 {
    let kb: f64 = s.parse().unwrap_or(0.0);
    (kb / 1024.0 / 1024.0 * 10.0).round() / 10.0
}

fn parse_disk_gb(s: &str) -> u64 {
    s.trim_end_matches('G').parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_session(user: &str) -> SshSession {
        SshSession {
            host: "203.0.113.10".to_string(),
            port: 22,
            user: user.to_string(),
            auth: Auth::KeyFile(PathBuf::from("/tmp/id_test")),
        }
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn host_command_as_root_is_passed_through() {
        let session = key_session("root");
        assert_eq!(
            session.remote_command(&Target::Host, "apt-get update"),
            "apt-get update"
        );
    }

    #[test]
    fn host_command_as_user_gets_sudo() {
        let session = key_session("ops");
        let cmd = session.remote_command(&Target::Host, "apt-get update");
        assert!(cmd.starts_with("sudo bash -c "));
        assert!(cmd.contains("apt-get update"));
    }

    #[test]
    fn container_command_wraps_incus_exec() {
        let session = key_session("root");
        let cmd = session.remote_command(
            &Target::Container("dev".to_string()),
            "echo 'hello'",
        );
        assert!(cmd.starts_with("incus exec dev -- bash -c "));
        // The embedded quote survives escaping
        assert!(cmd.contains(r"'\''hello'\''"));
    }

    #[test]
    fn container_command_as_user_gets_sudo_prefix() {
        let session = key_session("ops");
        let cmd = session.remote_command(&Target::Container("prod".to_string()), "ls");
        assert!(cmd.starts_with("sudo incus exec prod -- bash -c "));
    }

    #[test]
    fn write_file_script_uses_heredoc_and_chmod() {
        let script = write_file_script("line1\nline2", "/etc/motd", "644");
        assert!(script.contains("tee /etc/motd > /dev/null << 'VIBEHOST_EOF'"));
        assert!(script.contains("line1\nline2"));
        assert!(script.ends_with("chmod 644 /etc/motd"));
    }

    #[test]
    fn os_release_parsing() {
        let content = r#"PRETTY_NAME="Debian GNU/Linux 13 (trixie)"
NAME="Debian GNU/Linux"
VERSION_ID="13"
ID=debian
"#;
        let (pretty, id, version) = parse_os_release(content);
        assert_eq!(pretty, "Debian GNU/Linux 13 (trixie)");
        assert_eq!(id, "debian");
        assert_eq!(version, Some(13));
    }

    #[test]
    fn os_release_parsing_handles_missing_fields() {
        let (pretty, id, version) = parse_os_release("NAME=Custom\n");
        assert_eq!(pretty, "");
        assert_eq!(id, "");
        assert_eq!(version, None);
    }

    #[test]
    fn mem_and_disk_parsing() {
        assert_eq!(parse_mem_kb("16384000"), 15.6);
        assert_eq!(parse_disk_gb("420G"), 420);
        assert_eq!(parse_disk_gb("garbage"), 0);
    }

    #[test]
    fn deadline_kills_slow_commands() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let started = Instant::now();
        let err = run_with_deadline(cmd, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, ExecError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn deadline_returns_output_for_fast_commands() {
        let mut cmd = Command::new("echo");
        cmd.arg("hello");
        let out = run_with_deadline(cmd, Duration::from_secs(5)).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout_trimmed(), "hello");
    }
}
