//! Network steps: the private bridge, the public macvlan, per-container
//! network profiles, and the UFW rules that let bridge traffic through.

use anyhow::{Result, bail};
use orchestrate::{BoxedStep, CheckOutcome, Step, StepContext, Target};

use crate::config::Config;
use crate::steps::{host, incus};

pub const PRIVATE_BRIDGE: &str = "network.private-bridge";
pub const PUBLIC_MACVLAN: &str = "network.public-macvlan";
pub const PRIVATE_PROFILES: &str = "network.private-profiles";
pub const FIREWALL: &str = "network.firewall";

pub const PRIVATE_NETWORK: &str = "vibenet-private";
pub const PUBLIC_NETWORK: &str = "vibenet-public";

pub fn steps(config: &Config) -> Vec<BoxedStep> {
    let publics: Vec<(String, String)> = config
        .public_containers()
        .into_iter()
        .map(|(name, ip)| (name.to_string(), ip.to_string()))
        .collect();
    let privates: Vec<(String, String)> = config
        .container_names()
        .into_iter()
        .map(|name| (name.to_string(), config.private_ip(name)))
        .collect();

    vec![
        Box::new(PrivateBridge {
            gateway: config.network.private.gateway.clone(),
            subnet: config.network.private.subnet.clone(),
        }),
        Box::new(PublicMacvlan {
            interface: config.network.interface.clone(),
            containers: publics,
        }),
        Box::new(PrivateProfiles { containers: privates }),
        Box::new(BridgeFirewall),
    ]
}

struct PrivateBridge {
    gateway: String,
    subnet: String,
}

impl Step for PrivateBridge {
    fn id(&self) -> String {
        PRIVATE_BRIDGE.to_string()
    }
    fn phase(&self) -> &'static str {
        "network"
    }
    fn target(&self) -> Target {
        Target::Host
    }
    fn depends_on(&self) -> Vec<String> {
        vec![incus::INIT.to_string()]
    }
    fn description(&self) -> String {
        format!("Create the private bridge {PRIVATE_NETWORK} ({})", self.subnet)
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let out = ctx.run(&format!("incus network show {PRIVATE_NETWORK}"))?;
        Ok(if out.success() {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        ctx.run_checked(&format!("incus network create {PRIVATE_NETWORK} --type=bridge"))?;
        ctx.run_checked(&format!(
            "incus network set {PRIVATE_NETWORK} ipv4.address={}/24",
            self.gateway
        ))?;
        ctx.run_checked(&format!("incus network set {PRIVATE_NETWORK} ipv4.nat=true"))?;
        ctx.run_checked(&format!("incus network set {PRIVATE_NETWORK} ipv6.address=none"))?;
        Ok(())
    }

    fn verify(&self, ctx: &StepContext) -> Result<()> {
        let out = ctx.run(&format!("incus network show {PRIVATE_NETWORK}"))?;
        if !out.success() {
            bail!("{PRIVATE_NETWORK} missing after creation");
        }
        Ok(())
    }
}

struct PublicMacvlan {
    interface: String,
    containers: Vec<(String, String)>,
}

impl Step for PublicMacvlan {
    fn id(&self) -> String {
        PUBLIC_MACVLAN.to_string()
    }
    fn phase(&self) -> &'static str {
        "network"
    }
    fn target(&self) -> Target {
        Target::Host
    }
    fn depends_on(&self) -> Vec<String> {
        vec![incus::INIT.to_string()]
    }
    fn description(&self) -> String {
        format!(
            "Create the {PUBLIC_NETWORK} macvlan on {} with public profiles",
            self.interface
        )
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let network = ctx.run(&format!("incus network show {PUBLIC_NETWORK}"))?;
        if !network.success() {
            return Ok(CheckOutcome::NotApplied);
        }
        for (name, _) in &self.containers {
            let profile = ctx.run(&format!("incus profile show public-{name}"))?;
            if !profile.success() {
                return Ok(CheckOutcome::NotApplied);
            }
        }
        Ok(CheckOutcome::AlreadyApplied)
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        let network = ctx.run(&format!("incus network show {PUBLIC_NETWORK}"))?;
        if !network.success() {
            ctx.run_checked(&format!(
                "incus network create {PUBLIC_NETWORK} --type=macvlan parent={}",
                self.interface
            ))?;
        }
        // The profiles only attach the device; static addressing happens
        // inside each container via systemd-networkd
        for (name, _) in &self.containers {
            let exists = ctx.run(&format!("incus profile show public-{name}"))?;
            if !exists.success() {
                ctx.run_checked(&format!("incus profile create public-{name}"))?;
            }
            ctx.run_checked(&format!(
                "incus profile device add public-{name} eth0 nic network={PUBLIC_NETWORK} name=eth0 || true"
            ))?;
        }
        Ok(())
    }

    fn verify(&self, ctx: &StepContext) -> Result<()> {
        let out = ctx.run(&format!("incus network show {PUBLIC_NETWORK}"))?;
        if !out.success() {
            bail!("{PUBLIC_NETWORK} missing after creation");
        }
        Ok(())
    }
}

struct PrivateProfiles {
    containers: Vec<(String, String)>,
}

impl Step for PrivateProfiles {
    fn id(&self) -> String {
        PRIVATE_PROFILES.to_string()
    }
    fn phase(&self) -> &'static str {
        "network"
    }
    fn target(&self) -> Target {
        Target::Host
    }
    fn depends_on(&self) -> Vec<String> {
        vec![PRIVATE_BRIDGE.to_string()]
    }
    fn description(&self) -> String {
        "Create private network profiles with static addresses".to_string()
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        for (name, _) in &self.containers {
            let out = ctx.run(&format!("incus profile show private-{name}"))?;
            if !out.success() {
                return Ok(CheckOutcome::NotApplied);
            }
        }
        Ok(CheckOutcome::AlreadyApplied)
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        for (name, ip) in &self.containers {
            let exists = ctx.run(&format!("incus profile show private-{name}"))?;
            if !exists.success() {
                ctx.run_checked(&format!("incus profile create private-{name}"))?;
            }
            ctx.run_checked(&format!(
                "incus profile device add private-{name} eth1 nic network={PRIVATE_NETWORK} name=eth1 ipv4.address={ip} || true"
            ))?;
        }
        Ok(())
    }

    fn verify(&self, ctx: &StepContext) -> Result<()> {
        for (name, _) in &self.containers {
            let out = ctx.run(&format!("incus profile show private-{name}"))?;
            if !out.success() {
                bail!("profile private-{name} missing after creation");
            }
        }
        Ok(())
    }
}

/// UFW's default deny-routed policy blocks container NAT traffic, so
/// both bridges get explicit allow rules.
struct BridgeFirewall;

impl Step for BridgeFirewall {
    fn id(&self) -> String {
        FIREWALL.to_string()
    }
    fn phase(&self) -> &'static str {
        "network"
    }
    fn target(&self) -> Target {
        Target::Host
    }
    fn depends_on(&self) -> Vec<String> {
        vec![host::FIREWALL.to_string(), PRIVATE_BRIDGE.to_string()]
    }
    fn description(&self) -> String {
        "Allow bridge traffic through UFW".to_string()
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let out = ctx.run("ufw status")?;
        Ok(
            if out.success()
                && out.stdout.contains("incusbr0")
                && out.stdout.contains(PRIVATE_NETWORK)
            {
                CheckOutcome::AlreadyApplied
            } else {
                CheckOutcome::NotApplied
            },
        )
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        for bridge in ["incusbr0", PRIVATE_NETWORK] {
            ctx.run_checked(&format!("ufw allow in on {bridge}"))?;
            ctx.run_checked(&format!("ufw allow out on {bridge}"))?;
            ctx.run_checked(&format!("ufw route allow in on {bridge}"))?;
            ctx.run_checked(&format!("ufw route allow out on {bridge}"))?;
        }
        Ok(())
    }

    fn verify(&self, ctx: &StepContext) -> Result<()> {
        let out = ctx.run_checked("ufw status")?;
        if !out.stdout.contains("incusbr0") || !out.stdout.contains(PRIVATE_NETWORK) {
            bail!("bridge rules missing from ufw");
        }
        Ok(())
    }
}
