//! Container lifecycle steps: launch, in-container network
//! configuration, SSH access, and the common setup applied across
//! containers.
//!
//! Launch runs on the host (it drives incus); everything after targets
//! the container itself, which also gives the scheduler the right
//! serialization unit.

use anyhow::{Result, bail};
use orchestrate::{BoxedStep, CheckOutcome, Step, StepContext, Target};
use std::time::Duration;

use crate::config::Config;
use crate::steps::{incus, network};

pub fn launch_id(container: &str) -> String {
    format!("containers.launch.{container}")
}

pub fn network_id(container: &str) -> String {
    format!("containers.network.{container}")
}

pub fn ssh_id(container: &str) -> String {
    format!("containers.ssh.{container}")
}

pub fn common_id(container: &str) -> String {
    format!("common.{container}")
}

pub fn steps(config: &Config) -> Vec<BoxedStep> {
    let mut steps: Vec<BoxedStep> = Vec::new();

    for name in config.container_names() {
        steps.push(Box::new(LaunchContainer {
            name: name.to_string(),
            image: config.containers.image(name).to_string(),
            profiles: profiles_for(name),
        }));

        let public = config
            .public_containers()
            .into_iter()
            .find(|(c, _)| *c == name)
            .map(|(_, ip)| PublicAddress {
                ip: ip.to_string(),
                gateway: config.network.gateway.clone(),
                cidr: config.network.cidr_prefix().to_string(),
            });
        steps.push(Box::new(ContainerNetwork {
            name: name.to_string(),
            public,
        }));

        // The postgres container is only reachable over the private
        // network and never gets an SSH daemon
        if name != "postgres" {
            steps.push(Box::new(ContainerSsh {
                name: name.to_string(),
                public_key: config.admin.ssh_public_key.clone(),
            }));
        }
    }

    steps
}

pub fn common_steps(config: &Config) -> Vec<BoxedStep> {
    config
        .common_setup
        .containers
        .iter()
        .map(|name| {
            Box::new(CommonSetup {
                name: name.clone(),
                packages: config.common_setup.packages.clone(),
                allow_rules: config.common_setup.firewall.allow.clone(),
            }) as BoxedStep
        })
        .collect()
}

/// Profile stack for a container, in the order incus applies them
fn profiles_for(name: &str) -> Vec<String> {
    let mut profiles = vec!["default".to_string(), incus::pool_name(name).to_string()];
    if name == "postgres" {
        profiles.push(format!("private-{name}"));
    } else {
        profiles.push("docker-ready".to_string());
        profiles.push(format!("public-{name}"));
        profiles.push(format!("private-{name}"));
    }
    profiles
}

struct LaunchContainer {
    name: String,
    image: String,
    profiles: Vec<String>,
}

impl Step for LaunchContainer {
    fn id(&self) -> String {
        launch_id(&self.name)
    }
    fn phase(&self) -> &'static str {
        "containers"
    }
    fn target(&self) -> Target {
        Target::Host
    }
    fn depends_on(&self) -> Vec<String> {
        let mut deps = vec![
            incus::PROFILES.to_string(),
            network::PRIVATE_PROFILES.to_string(),
            network::FIREWALL.to_string(),
        ];
        if self.name != "postgres" {
            deps.push(incus::DOCKER_PROFILE.to_string());
            deps.push(network::PUBLIC_MACVLAN.to_string());
        }
        deps
    }
    fn description(&self) -> String {
        format!("Launch container '{}' from {}", self.name, self.image)
    }
    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(300))
    }
    fn rollback_hint(&self) -> Option<String> {
        Some(format!("incus delete -f {}", self.name))
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let out = ctx.run(&format!("incus info {}", self.name))?;
        Ok(if out.success() {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        let profile_flags: Vec<String> =
            self.profiles.iter().map(|p| format!("-p {p}")).collect();
        ctx.run_checked(&format!(
            "incus launch images:{} {} {}",
            self.image,
            self.name,
            profile_flags.join(" ")
        ))?;
        Ok(())
    }

    /// Readiness wait: running status plus an exec round-trip, bounded
    /// by the step's remaining budget
    fn verify(&self, ctx: &StepContext) -> Result<()> {
        while !ctx.expired() {
            let info = ctx.run(&format!("incus info {}", self.name))?;
            if info.success() && info.stdout.contains("Status: RUNNING") {
                let echo = ctx.run(&format!("incus exec {} -- echo ready", self.name))?;
                if echo.success() && echo.stdout_trimmed() == "ready" {
                    return Ok(());
                }
            }
            std::thread::sleep(Duration::from_secs(2));
        }
        bail!("container {} did not become ready", self.name)
    }
}

struct PublicAddress {
    ip: String,
    gateway: String,
    cidr: String,
}

struct ContainerNetwork {
    name: String,
    public: Option<PublicAddress>,
}

impl ContainerNetwork {
    fn eth0_config(addr: &PublicAddress) -> String {
        format!(
            "[Match]\nName=eth0\n\n[Network]\nAddress={}/{}\nGateway={}\nDNS=1.1.1.1\nDNS=8.8.8.8\n",
            addr.ip, addr.cidr, addr.gateway
        )
    }

    fn eth1_config() -> &'static str {
        "[Match]\nName=eth1\n\n[Network]\nDHCP=yes\n\n[DHCPv4]\nUseDomains=true\nUseMTU=true\n\n[DHCP]\nClientIdentifier=mac\n"
    }
}

impl Step for ContainerNetwork {
    fn id(&self) -> String {
        network_id(&self.name)
    }
    fn phase(&self) -> &'static str {
        "containers"
    }
    fn target(&self) -> Target {
        Target::Container(self.name.clone())
    }
    fn depends_on(&self) -> Vec<String> {
        vec![launch_id(&self.name)]
    }
    fn description(&self) -> String {
        match &self.public {
            Some(addr) => format!(
                "Configure networking in '{}' (eth0 {} + eth1 DHCP)",
                self.name, addr.ip
            ),
            None => format!("Configure networking in '{}' (eth1 DHCP)", self.name),
        }
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let mut probe = "test -f /etc/systemd/network/eth1.network".to_string();
        if self.public.is_some() {
            probe.push_str(" -a -f /etc/systemd/network/eth0.network");
        }
        let out = ctx.run(&probe)?;
        Ok(if out.success() {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        // Debian 13 images ship without cloud-init; static addressing
        // goes straight through systemd-networkd
        if let Some(addr) = &self.public {
            ctx.upload(
                &Self::eth0_config(addr),
                "/etc/systemd/network/eth0.network",
                "644",
            )?;
        }
        ctx.upload(Self::eth1_config(), "/etc/systemd/network/eth1.network", "644")?;
        ctx.run_checked("systemctl restart systemd-networkd")?;
        Ok(())
    }

    fn verify(&self, ctx: &StepContext) -> Result<()> {
        let out = ctx.run("systemctl is-active --quiet systemd-networkd")?;
        if !out.success() {
            bail!("systemd-networkd not active after restart");
        }
        Ok(())
    }
}

struct ContainerSsh {
    name: String,
    public_key: String,
}

impl Step for ContainerSsh {
    fn id(&self) -> String {
        ssh_id(&self.name)
    }
    fn phase(&self) -> &'static str {
        "containers"
    }
    fn target(&self) -> Target {
        Target::Container(self.name.clone())
    }
    fn depends_on(&self) -> Vec<String> {
        vec![network_id(&self.name)]
    }
    fn description(&self) -> String {
        format!("Enable SSH access in '{}'", self.name)
    }
    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(900))
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let out = ctx.run(
            "test -f /root/.ssh/authorized_keys && systemctl is-active --quiet ssh",
        )?;
        Ok(if out.success() {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        ctx.run_checked("apt-get update && apt-get install -y openssh-server")?;
        ctx.run_checked("mkdir -p /root/.ssh && chmod 700 /root/.ssh")?;
        ctx.upload(
            &format!("{}\n", self.public_key),
            "/root/.ssh/authorized_keys",
            "600",
        )?;
        // Both forms: commented-out default and an existing directive
        ctx.run_checked(
            "sed -i 's/#PermitRootLogin.*/PermitRootLogin prohibit-password/' /etc/ssh/sshd_config",
        )?;
        ctx.run_checked(
            "sed -i 's/^PermitRootLogin.*/PermitRootLogin prohibit-password/' /etc/ssh/sshd_config",
        )?;
        ctx.run_checked("systemctl enable ssh && systemctl start ssh")?;
        Ok(())
    }

    fn verify(&self, ctx: &StepContext) -> Result<()> {
        let out = ctx.run("systemctl is-active --quiet ssh")?;
        if !out.success() {
            bail!("ssh service not active in {}", self.name);
        }
        Ok(())
    }
}

struct CommonSetup {
    name: String,
    packages: Vec<String>,
    allow_rules: Vec<String>,
}

impl Step for CommonSetup {
    fn id(&self) -> String {
        common_id(&self.name)
    }
    fn phase(&self) -> &'static str {
        "common-setup"
    }
    fn target(&self) -> Target {
        Target::Container(self.name.clone())
    }
    fn depends_on(&self) -> Vec<String> {
        vec![network_id(&self.name)]
    }
    fn description(&self) -> String {
        format!("Apply common packages and firewall to '{}'", self.name)
    }
    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(900))
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let ufw = ctx.run("ufw status")?;
        if !ufw.success() || !ufw.stdout.contains("Status: active") {
            return Ok(CheckOutcome::NotApplied);
        }
        if self.packages.is_empty() {
            return Ok(CheckOutcome::AlreadyApplied);
        }
        let pkgs = ctx.run(&format!(
            "dpkg -s {} > /dev/null 2>&1",
            self.packages.join(" ")
        ))?;
        Ok(if pkgs.success() {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        if !self.packages.is_empty() {
            ctx.run_checked(&format!(
                "apt-get update && apt-get install -y {}",
                self.packages.join(" ")
            ))?;
        }
        ctx.run_checked("apt-get install -y ufw")?;
        ctx.run_checked("ufw --force reset")?;
        ctx.run_checked("ufw default deny incoming")?;
        ctx.run_checked("ufw default allow outgoing")?;
        for rule in &self.allow_rules {
            ctx.run_checked(&format!("ufw allow {rule}"))?;
        }
        ctx.run_checked("ufw --force enable")?;
        Ok(())
    }

    fn verify(&self, ctx: &StepContext) -> Result<()> {
        let out = ctx.run_checked("ufw status")?;
        if !out.stdout.contains("Status: active") {
            bail!("ufw not active in {}", self.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_container_profile_stack() {
        assert_eq!(
            profiles_for("dev"),
            vec!["default", "dev-pool", "docker-ready", "public-dev", "private-dev"]
        );
    }

    #[test]
    fn postgres_gets_no_public_or_docker_profiles() {
        assert_eq!(profiles_for("postgres"), vec!["default", "db-pool", "private-postgres"]);
    }

    #[test]
    fn eth0_config_carries_static_address() {
        let config = ContainerNetwork::eth0_config(&PublicAddress {
            ip: "203.0.113.11".to_string(),
            gateway: "203.0.113.1".to_string(),
            cidr: "24".to_string(),
        });
        assert!(config.contains("Address=203.0.113.11/24"));
        assert!(config.contains("Gateway=203.0.113.1"));
        assert!(config.starts_with("[Match]\nName=eth0"));
    }

    #[test]
    fn eth1_config_uses_dhcp() {
        let config = ContainerNetwork::eth1_config();
        assert!(config.contains("DHCP=yes"));
        assert!(config.contains("ClientIdentifier=mac"));
    }
}
