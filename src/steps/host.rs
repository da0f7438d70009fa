//! Host hardening steps
//!
//! Everything here runs on the host target: package repos, the admin
//! user, UFW, CrowdSec, unattended upgrades, kernel tuning, and SSH
//! hardening. The SSH step is the lockout-sensitive one - because the
//! transport reconnects for every command, it must be the last step of
//! the entire run, not just of this phase (the graph builder wires that
//! edge set).

use anyhow::{Result, bail};
use orchestrate::{BoxedStep, CheckOutcome, Step, StepContext, Target};
use std::time::Duration;

use crate::config::Config;

pub const CONTRIB_REPO: &str = "hardening.contrib-repo";
pub const SYSTEM_UPDATE: &str = "hardening.system-update";
pub const ADMIN_USER: &str = "hardening.admin-user";
pub const FIREWALL: &str = "hardening.firewall";
pub const CROWDSEC: &str = "hardening.crowdsec";
pub const UNATTENDED_UPGRADES: &str = "hardening.unattended-upgrades";
pub const KERNEL_PARAMS: &str = "hardening.kernel-params";
pub const HARDEN_SSH: &str = "hardening.ssh";

const SYSCTL_PATH: &str = "/etc/sysctl.d/99-vibehost-incus.conf";

/// All hardening steps except SSH hardening, which the graph builder
/// appends with run-wide dependencies.
pub fn steps(config: &Config) -> Vec<BoxedStep> {
    vec![
        Box::new(ContribRepo),
        Box::new(SystemUpdate),
        Box::new(AdminUser {
            username: config.admin.username.clone(),
            public_key: config.admin.ssh_public_key.clone(),
        }),
        Box::new(HostFirewall),
        Box::new(Crowdsec),
        Box::new(UnattendedUpgrades),
        Box::new(KernelParams),
    ]
}

/// SSH hardening, eligible only after `after` have all finished.
pub fn harden_ssh_step(config: &Config, after: Vec<String>) -> BoxedStep {
    Box::new(HardenSsh {
        admin: config.admin.username.clone(),
        ssh_user: config.server.ssh_user.clone(),
        public_key: config.admin.ssh_public_key.clone(),
        after,
    })
}

/// First characters of a public key, enough to grep for it without
/// tripping over the comment field
fn key_needle(public_key: &str) -> &str {
    let end = public_key
        .char_indices()
        .nth(50)
        .map_or(public_key.len(), |(i, _)| i);
    &public_key[..end]
}

struct ContribRepo;

impl Step for ContribRepo {
    fn id(&self) -> String {
        CONTRIB_REPO.to_string()
    }
    fn phase(&self) -> &'static str {
        "hardening"
    }
    fn target(&self) -> Target {
        Target::Host
    }
    fn description(&self) -> String {
        "Enable the contrib apt repository (required for ZFS)".to_string()
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let out = ctx.run("grep -q contrib /etc/apt/sources.list")?;
        Ok(if out.success() {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        ctx.run_checked(
            "sed -i 's/main non-free-firmware/main contrib non-free-firmware/g' /etc/apt/sources.list",
        )?;
        // Lines that end at 'main' with no components after it
        ctx.run_checked(r"sed -i 's/^\(deb.*\) main$/\1 main contrib/' /etc/apt/sources.list")?;
        Ok(())
    }
}

struct SystemUpdate;

impl Step for SystemUpdate {
    fn id(&self) -> String {
        SYSTEM_UPDATE.to_string()
    }
    fn phase(&self) -> &'static str {
        "hardening"
    }
    fn target(&self) -> Target {
        Target::Host
    }
    fn depends_on(&self) -> Vec<String> {
        vec![CONTRIB_REPO.to_string()]
    }
    fn description(&self) -> String {
        "Update and upgrade system packages".to_string()
    }
    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(1800))
    }

    fn check(&self, _ctx: &StepContext) -> Result<CheckOutcome> {
        // Whether the package lists are fresh cannot be probed cheaply
        Ok(CheckOutcome::Indeterminate)
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        ctx.run_checked("apt-get update")?;
        ctx.run_checked("DEBIAN_FRONTEND=noninteractive apt-get upgrade -y")?;
        Ok(())
    }
}

struct AdminUser {
    username: String,
    public_key: String,
}

impl Step for AdminUser {
    fn id(&self) -> String {
        ADMIN_USER.to_string()
    }
    fn phase(&self) -> &'static str {
        "hardening"
    }
    fn target(&self) -> Target {
        Target::Host
    }
    fn depends_on(&self) -> Vec<String> {
        vec![SYSTEM_UPDATE.to_string()]
    }
    fn description(&self) -> String {
        format!("Create admin user '{}' with passwordless sudo", self.username)
    }
    fn rollback_hint(&self) -> Option<String> {
        Some(format!(
            "userdel -r {u}; rm -f /etc/sudoers.d/{u}",
            u = self.username
        ))
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let user = ctx.run(&format!("id {}", self.username))?;
        if !user.success() {
            return Ok(CheckOutcome::NotApplied);
        }
        let key = ctx.run(&format!(
            "grep -qF '{}' /home/{}/.ssh/authorized_keys",
            key_needle(&self.public_key),
            self.username
        ))?;
        Ok(if key.success() {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        let u = &self.username;
        ctx.run_checked(&format!(
            "id -u {u} > /dev/null 2>&1 || useradd -m -s /bin/bash {u}"
        ))?;
        ctx.run_checked(&format!("usermod -aG sudo {u}"))?;
        ctx.upload(
            &format!("{u} ALL=(ALL) NOPASSWD:ALL\n"),
            &format!("/etc/sudoers.d/{u}"),
            "440",
        )?;
        ctx.run_checked(&format!("mkdir -p /home/{u}/.ssh && chmod 700 /home/{u}/.ssh"))?;
        ctx.upload(
            &format!("{}\n", self.public_key),
            &format!("/home/{u}/.ssh/authorized_keys"),
            "600",
        )?;
        ctx.run_checked(&format!("chown -R {u}:{u} /home/{u}/.ssh"))?;
        Ok(())
    }

    fn verify(&self, ctx: &StepContext) -> Result<()> {
        let out = ctx.run(&format!(
            "id {u} && grep -qF '{}' /home/{u}/.ssh/authorized_keys",
            key_needle(&self.public_key),
            u = self.username
        ))?;
        if !out.success() {
            bail!("admin user or authorized key missing after creation");
        }
        Ok(())
    }
}

struct HostFirewall;

impl Step for HostFirewall {
    fn id(&self) -> String {
        FIREWALL.to_string()
    }
    fn phase(&self) -> &'static str {
        "hardening"
    }
    fn target(&self) -> Target {
        Target::Host
    }
    fn depends_on(&self) -> Vec<String> {
        vec![SYSTEM_UPDATE.to_string()]
    }
    fn description(&self) -> String {
        "Configure UFW on the host (deny incoming, allow SSH)".to_string()
    }
    fn rollback_hint(&self) -> Option<String> {
        Some("ufw --force disable".to_string())
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let out = ctx.run("ufw status")?;
        let status = out.stdout_trimmed();
        Ok(
            if out.success() && status.contains("Status: active") && status.contains("22/tcp") {
                CheckOutcome::AlreadyApplied
            } else {
                CheckOutcome::NotApplied
            },
        )
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        ctx.run_checked("apt-get install -y ufw")?;
        ctx.run_checked("ufw --force reset")?;
        ctx.run_checked("ufw default deny incoming")?;
        ctx.run_checked("ufw default allow outgoing")?;
        ctx.run_checked("ufw allow 22/tcp")?;
        ctx.run_checked("ufw --force enable")?;
        Ok(())
    }

    fn verify(&self, ctx: &StepContext) -> Result<()> {
        let out = ctx.run("ufw status")?;
        if !out.stdout.contains("Status: active") {
            bail!("ufw is not active after enabling");
        }
        Ok(())
    }
}

struct Crowdsec;

impl Step for Crowdsec {
    fn id(&self) -> String {
        CROWDSEC.to_string()
    }
    fn phase(&self) -> &'static str {
        "hardening"
    }
    fn target(&self) -> Target {
        Target::Host
    }
    fn depends_on(&self) -> Vec<String> {
        vec![SYSTEM_UPDATE.to_string()]
    }
    fn description(&self) -> String {
        "Install CrowdSec with the iptables firewall bouncer".to_string()
    }
    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(900))
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let out = ctx.run("systemctl is-active --quiet crowdsec")?;
        Ok(if out.success() {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        ctx.run_checked("apt-get install -y curl")?;
        ctx.run_checked("curl -s https://install.crowdsec.net | bash")?;
        ctx.run_checked("apt-get update")?;
        ctx.run_checked(
            "DEBIAN_FRONTEND=noninteractive apt-get install -y \
             -o Dpkg::Options::='--force-confnew' \
             crowdsec crowdsec-firewall-bouncer-iptables",
        )?;
        ctx.run_checked("systemctl enable --now crowdsec")?;
        ctx.run_checked("systemctl enable --now crowdsec-firewall-bouncer")?;
        Ok(())
    }

    fn verify(&self, ctx: &StepContext) -> Result<()> {
        let out = ctx.run("systemctl is-active --quiet crowdsec")?;
        if !out.success() {
            bail!("crowdsec service is not active");
        }
        Ok(())
    }
}

const UNATTENDED_CONFIG: &str = r#"APT::Periodic::Update-Package-Lists "1";
APT::Periodic::Unattended-Upgrade "1";
APT::Periodic::AutocleanInterval "7";
Unattended-Upgrade::Origins-Pattern {
    "origin=Debian,codename=${distro_codename},label=Debian-Security";
};
Unattended-Upgrade::AutoFixInterruptedDpkg "true";
Unattended-Upgrade::Remove-Unused-Dependencies "true";
"#;

struct UnattendedUpgrades;

impl Step for UnattendedUpgrades {
    fn id(&self) -> String {
        UNATTENDED_UPGRADES.to_string()
    }
    fn phase(&self) -> &'static str {
        "hardening"
    }
    fn target(&self) -> Target {
        Target::Host
    }
    fn depends_on(&self) -> Vec<String> {
        vec![SYSTEM_UPDATE.to_string()]
    }
    fn description(&self) -> String {
        "Enable unattended security upgrades".to_string()
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let out = ctx.run("test -f /etc/apt/apt.conf.d/20auto-upgrades")?;
        Ok(if out.success() {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        ctx.run_checked("apt-get install -y unattended-upgrades apt-listchanges")?;
        ctx.upload(UNATTENDED_CONFIG, "/etc/apt/apt.conf.d/20auto-upgrades", "644")?;
        ctx.run_checked("systemctl enable --now unattended-upgrades")?;
        Ok(())
    }
}

const SYSCTL_CONFIG: &str = r"# vibehost: kernel parameters for Incus production
# See: https://linuxcontainers.org/incus/docs/main/reference/server_settings/

# Async I/O - increase for database workloads
fs.aio-max-nr = 524288

# inotify limits - needed for many containers with file watchers
fs.inotify.max_queued_events = 1048576
fs.inotify.max_user_instances = 1048576
fs.inotify.max_user_watches = 1048576

# Restrict container access to kernel ring buffer
kernel.dmesg_restrict = 1

# Key ring limits - should exceed number of containers
kernel.keys.maxbytes = 2000000
kernel.keys.maxkeys = 2000

# eBPF JIT limit
net.core.bpf_jit_limit = 1000000000

# ARP table size - prevents neighbor table overflow with many containers
net.ipv4.neigh.default.gc_thresh3 = 8192
net.ipv6.neigh.default.gc_thresh3 = 8192

# Memory map areas - needed for many applications
vm.max_map_count = 262144
";

struct KernelParams;

impl Step for KernelParams {
    fn id(&self) -> String {
        KERNEL_PARAMS.to_string()
    }
    fn phase(&self) -> &'static str {
        "hardening"
    }
    fn target(&self) -> Target {
        Target::Host
    }
    fn depends_on(&self) -> Vec<String> {
        vec![SYSTEM_UPDATE.to_string()]
    }
    fn description(&self) -> String {
        "Tune kernel parameters for container workloads".to_string()
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let out = ctx.run(&format!("test -f {SYSCTL_PATH}"))?;
        Ok(if out.success() {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        ctx.upload(SYSCTL_CONFIG, SYSCTL_PATH, "644")?;
        ctx.run_checked("sysctl --system")?;
        Ok(())
    }
}

struct HardenSsh {
    admin: String,
    ssh_user: String,
    public_key: String,
    after: Vec<String>,
}

impl HardenSsh {
    fn sshd_config(&self) -> String {
        let allowed_users = if self.ssh_user == self.admin {
            self.admin.clone()
        } else {
            format!("{} {}", self.admin, self.ssh_user)
        };
        format!(
            r"# vibehost hardened SSH config
Port 22
HostKey /etc/ssh/ssh_host_ed25519_key
HostKey /etc/ssh/ssh_host_rsa_key

# Authentication
PermitRootLogin no
PubkeyAuthentication yes
PasswordAuthentication no
PermitEmptyPasswords no
KbdInteractiveAuthentication no
UsePAM yes

# Security
X11Forwarding no
AllowTcpForwarding yes
MaxAuthTries 3
MaxSessions 10
ClientAliveInterval 300
ClientAliveCountMax 2

# Allowed users (admin + original ssh user if different)
AllowUsers {allowed_users}
"
        )
    }
}

impl Step for HardenSsh {
    fn id(&self) -> String {
        HARDEN_SSH.to_string()
    }
    fn phase(&self) -> &'static str {
        "hardening"
    }
    fn target(&self) -> Target {
        Target::Host
    }
    fn depends_on(&self) -> Vec<String> {
        self.after.clone()
    }
    fn description(&self) -> String {
        "Harden sshd: disable root login and password auth".to_string()
    }
    fn rollback_hint(&self) -> Option<String> {
        Some(
            "mv /etc/ssh/sshd_config.backup /etc/ssh/sshd_config && systemctl restart sshd"
                .to_string(),
        )
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let out = ctx.run("grep -q '^PasswordAuthentication no' /etc/ssh/sshd_config")?;
        Ok(if out.success() {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        // Lockout guard: the admin key must be verified on the remote
        // side before password auth goes away
        let keys = ctx.run(&format!(
            "test -f /home/{}/.ssh/authorized_keys",
            self.admin
        ))?;
        if !keys.success() {
            bail!(
                "admin user {} has no authorized_keys file; refusing to disable password auth",
                self.admin
            );
        }
        let key = ctx.run(&format!(
            "grep -qF '{}' /home/{}/.ssh/authorized_keys",
            key_needle(&self.public_key),
            self.admin
        ))?;
        if !key.success() {
            bail!(
                "admin key not present in {}'s authorized_keys; refusing to disable password auth",
                self.admin
            );
        }

        ctx.run_checked("cp /etc/ssh/sshd_config /etc/ssh/sshd_config.backup")?;
        ctx.upload(&self.sshd_config(), "/etc/ssh/sshd_config", "644")?;

        let test = ctx.run("sshd -t")?;
        if !test.success() {
            ctx.run_checked("mv /etc/ssh/sshd_config.backup /etc/ssh/sshd_config")?;
            bail!(
                "sshd configuration test failed, original restored: {}",
                test.stderr_trimmed()
            );
        }

        // Effective-config check happens before the restart: sshd -T
        // parses the on-disk file, and once the daemon restarts this
        // transport can no longer open new sessions as the original user
        let effective = ctx.run("sshd -T 2> /dev/null | grep -i 'passwordauthentication no'")?;
        if !effective.success() {
            ctx.run_checked("mv /etc/ssh/sshd_config.backup /etc/ssh/sshd_config")?;
            bail!("effective sshd config still permits password auth, original restored");
        }

        ctx.run_checked("systemctl restart sshd")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_needle_truncates_long_keys() {
        let key = "ssh-ed25519 ".to_string() + &"A".repeat(80) + " ops@laptop";
        assert_eq!(key_needle(&key).len(), 50);
        assert!(key.starts_with(key_needle(&key)));
    }

    #[test]
    fn key_needle_keeps_short_keys_whole() {
        assert_eq!(key_needle("ssh-ed25519 AAAA"), "ssh-ed25519 AAAA");
    }

    #[test]
    fn sshd_config_allows_admin_and_original_user() {
        let step = HardenSsh {
            admin: "ops".to_string(),
            ssh_user: "root".to_string(),
            public_key: String::new(),
            after: Vec::new(),
        };
        let config = step.sshd_config();
        assert!(config.contains("AllowUsers ops root"));
        assert!(config.contains("PermitRootLogin no"));
        assert!(config.contains("PasswordAuthentication no"));
    }

    #[test]
    fn sshd_config_deduplicates_same_user() {
        let step = HardenSsh {
            admin: "ops".to_string(),
            ssh_user: "ops".to_string(),
            public_key: String::new(),
            after: Vec::new(),
        };
        assert!(step.sshd_config().contains("AllowUsers ops\n"));
    }
}
