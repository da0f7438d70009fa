//! Incus installation, initialization, and profile steps
//!
//! Profile checks parse `incus profile list -f json` and compare the
//! desired limits against what the server reports, so a profile that
//! exists with stale limits is converged rather than skipped.

use anyhow::{Context as _, Result, bail};
use orchestrate::{BoxedStep, CheckOutcome, Step, StepContext, Target};
use std::time::Duration;

use crate::config::{Config, ResourcePool, StorageConfig};
use crate::steps::host;

pub const INSTALL: &str = "incus.install";
pub const INIT: &str = "incus.init";
pub const PROFILES: &str = "incus.profiles";
pub const DOCKER_PROFILE: &str = "incus.docker-profile";

/// Zabbly channel used on Debian 12, where incus is not yet packaged
const ZABBLY_CHANNEL: &str = "lts-6.0";

pub fn steps(config: &Config) -> Vec<BoxedStep> {
    vec![
        Box::new(InstallIncus),
        Box::new(InitIncus {
            storage: config.storage.clone(),
        }),
        Box::new(ResourceProfiles {
            pools: pool_profiles(config),
        }),
        Box::new(DockerProfile),
    ]
}

/// Profile name per container pool, in launch order
fn pool_profiles(config: &Config) -> Vec<(String, ResourcePool)> {
    vec![
        ("dev-pool".to_string(), config.resources.dev.clone()),
        ("staging-pool".to_string(), config.resources.staging.clone()),
        ("prod-pool".to_string(), config.resources.prod.clone()),
        ("db-pool".to_string(), config.resources.postgres.clone()),
    ]
}

/// The profile a container launches with, pool first
pub fn pool_name(container: &str) -> &'static str {
    match container {
        "dev" => "dev-pool",
        "staging" => "staging-pool",
        "prod" => "prod-pool",
        _ => "db-pool",
    }
}

/// Whether `incus profile list -f json` output contains `name` with
/// every key/value of `want` present in its config map
fn profile_matches(listing: &str, name: &str, want: &[(String, String)]) -> Result<bool> {
    let profiles: serde_json::Value =
        serde_json::from_str(listing).context("unparseable profile listing")?;
    let Some(profile) = profiles
        .as_array()
        .and_then(|arr| arr.iter().find(|p| p["name"].as_str() == Some(name)))
    else {
        return Ok(false);
    };
    Ok(want.iter().all(|(key, value)| {
        profile["config"][key].as_str() == Some(value.as_str())
    }))
}

fn limit_entries(pool: &ResourcePool) -> Vec<(String, String)> {
    vec![
        ("limits.memory".to_string(), pool.memory.clone()),
        ("limits.cpu.allowance".to_string(), pool.cpu_allowance.clone()),
        ("limits.cpu.priority".to_string(), pool.cpu_priority.to_string()),
    ]
}

struct InstallIncus;

impl Step for InstallIncus {
    fn id(&self) -> String {
        INSTALL.to_string()
    }
    fn phase(&self) -> &'static str {
        "incus-install"
    }
    fn target(&self) -> Target {
        Target::Host
    }
    fn depends_on(&self) -> Vec<String> {
        vec![host::SYSTEM_UPDATE.to_string(), host::KERNEL_PARAMS.to_string()]
    }
    fn description(&self) -> String {
        "Install Incus and ZFS".to_string()
    }
    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(1800))
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let incus = ctx.run("incus --version")?;
        if !incus.success() {
            return Ok(CheckOutcome::NotApplied);
        }
        let zfs = ctx.run("modprobe -n zfs")?;
        Ok(if zfs.success() {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        // ZFS comes in via DKMS, which needs the running kernel's headers
        ctx.run_checked(
            "apt-get install -y linux-headers-$(uname -r) zfsutils-linux zfs-dkms",
        )?;
        ctx.run_checked("dkms autoinstall")?;
        ctx.run_checked("modprobe zfs")?;

        let version = ctx
            .run_checked("grep VERSION_ID /etc/os-release | cut -d'\"' -f2")?
            .stdout_trimmed()
            .split('.')
            .next()
            .unwrap_or("")
            .parse::<u32>()
            .context("could not determine Debian version")?;

        if version >= 13 {
            ctx.run_checked("apt-get install -y incus incus-client")?;
        } else {
            // Debian 12: the Zabbly repository is maintained by the
            // Incus developers
            ctx.run_checked("apt-get install -y curl gpg")?;
            ctx.run_checked("mkdir -p /etc/apt/keyrings && rm -f /etc/apt/keyrings/zabbly.gpg")?;
            ctx.run_checked(
                "curl -fsSL https://pkgs.zabbly.com/key.asc | gpg --batch --dearmor -o /etc/apt/keyrings/zabbly.gpg",
            )?;
            let codename = ctx
                .run_checked("grep VERSION_CODENAME /etc/os-release | cut -d= -f2")?
                .stdout_trimmed()
                .to_string();
            ctx.upload(
                &format!(
                    "deb [signed-by=/etc/apt/keyrings/zabbly.gpg] https://pkgs.zabbly.com/incus/{ZABBLY_CHANNEL} {codename} main\n"
                ),
                &format!("/etc/apt/sources.list.d/zabbly-incus-{ZABBLY_CHANNEL}.list"),
                "644",
            )?;
            ctx.run_checked("apt-get update")?;
            ctx.run_checked("apt-get install -y incus incus-client")?;
        }
        Ok(())
    }

    fn verify(&self, ctx: &StepContext) -> Result<()> {
        let out = ctx.run("incus --version")?;
        if !out.success() {
            bail!("incus binary missing after install");
        }
        Ok(())
    }
}

struct InitIncus {
    storage: Option<StorageConfig>,
}

impl InitIncus {
    fn preseed(&self) -> String {
        let storage_line = match &self.storage {
            Some(StorageConfig {
                device: Some(device),
                ..
            }) => format!("source: {device}"),
            Some(StorageConfig { size, .. }) => format!("size: {size}"),
            None => "size: 100GiB".to_string(),
        };
        format!(
            r#"config: {{}}
networks:
- config:
    ipv4.address: auto
    ipv6.address: none
  description: ""
  name: incusbr0
  type: bridge
storage_pools:
- config:
    {storage_line}
  description: ""
  name: default
  driver: zfs
profiles:
- config: {{}}
  description: Default profile
  devices:
    root:
      path: /
      pool: default
      type: disk
    eth0:
      name: eth0
      network: incusbr0
      type: nic
  name: default
cluster: null
"#
        )
    }
}

impl Step for InitIncus {
    fn id(&self) -> String {
        INIT.to_string()
    }
    fn phase(&self) -> &'static str {
        "incus-install"
    }
    fn target(&self) -> Target {
        Target::Host
    }
    fn depends_on(&self) -> Vec<String> {
        vec![INSTALL.to_string()]
    }
    fn description(&self) -> String {
        "Initialize Incus with a ZFS storage pool".to_string()
    }
    fn rollback_hint(&self) -> Option<String> {
        Some("inspect with 'incus storage list'; a partial pool can be removed with 'incus storage delete default'".to_string())
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let out = ctx.run("incus storage list -f csv")?;
        Ok(if out.success() && out.stdout.contains("default") {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        if let Some(StorageConfig {
            device: Some(device),
            ..
        }) = &self.storage
        {
            // The device is dedicated to ZFS: unmount it, drop its fstab
            // entries, and wipe existing signatures
            ctx.run_checked(&format!(
                "lsblk -n -o MOUNTPOINT {device} 2> /dev/null | grep -v '^$' | xargs -r -n1 umount"
            ))?;
            let basename = device.rsplit('/').next().unwrap_or(device);
            ctx.run_checked(&format!("sed -i '/{basename}/d' /etc/fstab"))?;
            ctx.run_checked(&format!("wipefs -a {device}"))?;
        }

        ctx.upload(&self.preseed(), "/tmp/incus-preseed.yaml", "600")?;
        ctx.run_checked("incus admin init --preseed < /tmp/incus-preseed.yaml")?;
        ctx.run_checked("rm /tmp/incus-preseed.yaml")?;
        Ok(())
    }

    fn verify(&self, ctx: &StepContext) -> Result<()> {
        let out = ctx.run("incus storage list -f csv")?;
        if !out.success() || !out.stdout.contains("default") {
            bail!("default storage pool missing after init");
        }
        Ok(())
    }
}

struct ResourceProfiles {
    pools: Vec<(String, ResourcePool)>,
}

impl Step for ResourceProfiles {
    fn id(&self) -> String {
        PROFILES.to_string()
    }
    fn phase(&self) -> &'static str {
        "incus-install"
    }
    fn target(&self) -> Target {
        Target::Host
    }
    fn depends_on(&self) -> Vec<String> {
        vec![INIT.to_string()]
    }
    fn description(&self) -> String {
        "Create resource pool profiles with configured limits".to_string()
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let out = ctx.run("incus profile list -f json")?;
        if !out.success() {
            return Ok(CheckOutcome::Indeterminate);
        }
        for (name, pool) in &self.pools {
            if !profile_matches(&out.stdout, name, &limit_entries(pool))? {
                return Ok(CheckOutcome::NotApplied);
            }
        }
        Ok(CheckOutcome::AlreadyApplied)
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        for (name, pool) in &self.pools {
            let exists = ctx.run(&format!("incus profile show {name}"))?;
            if !exists.success() {
                ctx.run_checked(&format!("incus profile create {name}"))?;
            }
            for (key, value) in limit_entries(pool) {
                ctx.run_checked(&format!("incus profile set {name} {key}={value}"))?;
            }
        }
        Ok(())
    }

    fn verify(&self, ctx: &StepContext) -> Result<()> {
        let out = ctx.run_checked("incus profile list -f json")?;
        for (name, pool) in &self.pools {
            if !profile_matches(&out.stdout, name, &limit_entries(pool))? {
                bail!("profile {name} missing or limits not applied");
            }
        }
        Ok(())
    }
}

/// Security options that let Docker run inside a container on ZFS
const DOCKER_OPTIONS: [(&str, &str); 3] = [
    ("security.nesting", "true"),
    ("security.syscalls.intercept.mknod", "true"),
    ("security.syscalls.intercept.setxattr", "true"),
];

struct DockerProfile;

impl Step for DockerProfile {
    fn id(&self) -> String {
        DOCKER_PROFILE.to_string()
    }
    fn phase(&self) -> &'static str {
        "incus-install"
    }
    fn target(&self) -> Target {
        Target::Host
    }
    fn depends_on(&self) -> Vec<String> {
        vec![INIT.to_string()]
    }
    fn description(&self) -> String {
        "Create the docker-ready profile (nesting + syscall intercepts)".to_string()
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let out = ctx.run("incus profile list -f json")?;
        if !out.success() {
            return Ok(CheckOutcome::Indeterminate);
        }
        let want: Vec<(String, String)> = DOCKER_OPTIONS
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Ok(if profile_matches(&out.stdout, "docker-ready", &want)? {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        let exists = ctx.run("incus profile show docker-ready")?;
        if !exists.success() {
            ctx.run_checked("incus profile create docker-ready")?;
        }
        for (key, value) in DOCKER_OPTIONS {
            ctx.run_checked(&format!("incus profile set docker-ready {key}={value}"))?;
        }
        Ok(())
    }

    fn verify(&self, ctx: &StepContext) -> Result<()> {
        let out = ctx.run_checked("incus profile list -f json")?;
        let want: Vec<(String, String)> = DOCKER_OPTIONS
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        if !profile_matches(&out.stdout, "docker-ready", &want)? {
            bail!("docker-ready profile missing or options not applied");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"[
        {"name": "default", "config": {}},
        {"name": "dev-pool", "config": {
            "limits.memory": "16GB",
            "limits.cpu.allowance": "30%",
            "limits.cpu.priority": "5"
        }}
    ]"#;

    fn dev_pool() -> ResourcePool {
        ResourcePool {
            memory: "16GB".to_string(),
            cpu_allowance: "30%".to_string(),
            cpu_priority: 5,
        }
    }

    #[test]
    fn profile_with_matching_limits_is_detected() {
        let want = limit_entries(&dev_pool());
        assert!(profile_matches(LISTING, "dev-pool", &want).unwrap());
    }

    #[test]
    fn profile_with_stale_limits_does_not_match() {
        let mut pool = dev_pool();
        pool.memory = "32GB".to_string();
        let want = limit_entries(&pool);
        assert!(!profile_matches(LISTING, "dev-pool", &want).unwrap());
    }

    #[test]
    fn missing_profile_does_not_match() {
        let want = limit_entries(&dev_pool());
        assert!(!profile_matches(LISTING, "db-pool", &want).unwrap());
    }

    #[test]
    fn garbage_listing_is_an_error() {
        assert!(profile_matches("not json", "dev-pool", &[]).is_err());
    }

    #[test]
    fn preseed_uses_dedicated_device_when_configured() {
        let init = InitIncus {
            storage: Some(StorageConfig {
                device: Some("/dev/nvme1n1".to_string()),
                size: "100GiB".to_string(),
            }),
        };
        let preseed = init.preseed();
        assert!(preseed.contains("source: /dev/nvme1n1"));
        assert!(!preseed.contains("size:"));
        assert!(preseed.contains("driver: zfs"));
    }

    #[test]
    fn preseed_defaults_to_loopback() {
        let init = InitIncus { storage: None };
        let preseed = init.preseed();
        assert!(preseed.contains("size: 100GiB"));
        assert!(preseed.contains("ipv6.address: none"));
    }
}
