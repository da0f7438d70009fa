//! Configuration loading and validation
//!
//! The YAML schema mirrors what the provisioning run needs: server
//! access, the admin user, network layout, container resource pools,
//! databases, backups, and dev tooling. Parsing and cross-field
//! validation happen here, before any connection is opened; the engine
//! only ever sees validated values.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// How to authenticate the initial SSH connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Password,
    SshKey,
}

/// Server access configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub auth_method: AuthMethod,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    pub ssh_password: Option<String>,
    pub ssh_key_path: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

impl ServerConfig {
    /// Expanded path to the private key, if key auth is configured
    pub fn key_path(&self) -> Option<PathBuf> {
        self.ssh_key_path
            .as_deref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
    }
}

/// New admin user created during hardening
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    pub username: String,
    pub ssh_public_key: String,
}

/// Public IP assignments
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkIps {
    pub host: String,
    pub dev: String,
    pub staging: String,
    pub prod: String,
    #[serde(default)]
    pub spare: Option<String>,
}

/// Private bridge network configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PrivateNetwork {
    #[serde(default = "default_private_subnet")]
    pub subnet: String,
    #[serde(default = "default_private_gateway")]
    pub gateway: String,
    #[serde(default = "default_private_postgres")]
    pub postgres: String,
}

fn default_private_subnet() -> String {
    "10.10.10.0/24".to_string()
}

fn default_private_gateway() -> String {
    "10.10.10.1".to_string()
}

fn default_private_postgres() -> String {
    "10.10.10.5".to_string()
}

impl Default for PrivateNetwork {
    fn default() -> Self {
        Self {
            subnet: default_private_subnet(),
            gateway: default_private_gateway(),
            postgres: default_private_postgres(),
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub interface: String,
    pub gateway: String,
    pub netmask: String,
    pub ips: NetworkIps,
    #[serde(default)]
    pub private: PrivateNetwork,
}

impl NetworkConfig {
    /// CIDR prefix length derived from the netmask (accepts dotted quad
    /// or a bare prefix like "/24")
    pub fn cidr_prefix(&self) -> &str {
        match self.netmask.as_str() {
            "255.255.255.0" => "24",
            "255.255.255.128" => "25",
            "255.255.255.192" => "26",
            "255.255.0.0" => "16",
            other => other.trim_start_matches('/'),
        }
    }
}

/// Resource allocation for one container
#[derive(Debug, Clone, Deserialize)]
pub struct ResourcePool {
    pub memory: String,
    pub cpu_allowance: String,
    #[serde(default = "default_cpu_priority")]
    pub cpu_priority: u8,
}

fn default_cpu_priority() -> u8 {
    5
}

/// Resource pools for all containers
#[derive(Debug, Clone, Deserialize)]
pub struct ResourcesConfig {
    pub dev: ResourcePool,
    pub staging: ResourcePool,
    pub prod: ResourcePool,
    pub postgres: ResourcePool,
}

/// One database to create
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSpec {
    pub name: String,
    pub user: String,
    #[serde(default = "default_db_password")]
    pub password: String,
}

fn default_db_password() -> String {
    "generate".to_string()
}

impl DatabaseSpec {
    /// Whether the password should be generated rather than taken from
    /// the config file
    pub fn generate_password(&self) -> bool {
        self.password == "generate"
    }

    /// Vault name under which this database's password is stored
    pub fn secret_name(&self) -> String {
        format!("postgres.{}.password", self.name)
    }
}

/// PostgreSQL configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    #[serde(default = "default_postgres_version")]
    pub version: String,
    pub databases: Vec<DatabaseSpec>,
}

fn default_postgres_version() -> String {
    "17".to_string()
}

/// Local snapshot backups
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_snapshot_retention")]
    pub retention_days: u32,
    #[serde(default = "default_snapshot_schedule")]
    pub schedule: String,
}

fn default_true() -> bool {
    true
}

fn default_snapshot_retention() -> u32 {
    7
}

fn default_snapshot_schedule() -> String {
    "0 2 * * *".to_string()
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: default_snapshot_retention(),
            schedule: default_snapshot_schedule(),
        }
    }
}

/// Offsite backups to an SFTP storage box
#[derive(Debug, Clone, Deserialize)]
pub struct OffsiteConfig {
    #[serde(default)]
    pub enabled: bool,
    pub storagebox_host: Option<String>,
    pub storagebox_user: Option<String>,
    #[serde(default = "default_storagebox_key")]
    pub ssh_key_path: String,
    #[serde(default = "default_offsite_retention")]
    pub retention_weeks: u32,
    #[serde(default = "default_offsite_schedule")]
    pub schedule: String,
}

fn default_storagebox_key() -> String {
    "/root/.ssh/storagebox_key".to_string()
}

fn default_offsite_retention() -> u32 {
    4
}

fn default_offsite_schedule() -> String {
    "0 3 * * 0".to_string()
}

impl Default for OffsiteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            storagebox_host: None,
            storagebox_user: None,
            ssh_key_path: default_storagebox_key(),
            retention_weeks: default_offsite_retention(),
            schedule: default_offsite_schedule(),
        }
    }
}

/// Backup configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackupsConfig {
    #[serde(default)]
    pub snapshots: SnapshotConfig,
    #[serde(default)]
    pub offsite: OffsiteConfig,
}

/// Python environment in the dev container
#[derive(Debug, Clone, Deserialize)]
pub struct PythonSetup {
    #[serde(default = "default_python_version")]
    pub version: String,
    #[serde(default)]
    pub global_packages: Vec<String>,
}

fn default_python_version() -> String {
    "3.12".to_string()
}

impl Default for PythonSetup {
    fn default() -> Self {
        Self {
            version: default_python_version(),
            global_packages: Vec::new(),
        }
    }
}

/// Node.js environment in the dev container
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSetup {
    #[serde(default = "default_node_version")]
    pub version: String,
    #[serde(default)]
    pub global_packages: Vec<String>,
}

fn default_node_version() -> String {
    "20".to_string()
}

impl Default for NodeSetup {
    fn default() -> Self {
        Self {
            version: default_node_version(),
            global_packages: Vec::new(),
        }
    }
}

/// Additional tools installed in the dev container
#[derive(Debug, Clone, Deserialize)]
pub struct ExtrasSetup {
    #[serde(default = "default_true")]
    pub claude_code: bool,
    #[serde(default = "default_true")]
    pub docker: bool,
    #[serde(default = "default_true")]
    pub certbot: bool,
}

impl Default for ExtrasSetup {
    fn default() -> Self {
        Self {
            claude_code: true,
            docker: true,
            certbot: true,
        }
    }
}

/// Dev container setup
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DevSetupConfig {
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub python: PythonSetup,
    #[serde(default)]
    pub node: NodeSetup,
    #[serde(default)]
    pub extras: ExtrasSetup,
}

/// Container image selection
#[derive(Debug, Clone, Deserialize)]
pub struct ContainersConfig {
    #[serde(default = "default_image")]
    pub default_image: String,
    #[serde(default)]
    pub overrides: std::collections::BTreeMap<String, String>,
}

fn default_image() -> String {
    "debian/13".to_string()
}

impl Default for ContainersConfig {
    fn default() -> Self {
        Self {
            default_image: default_image(),
            overrides: std::collections::BTreeMap::new(),
        }
    }
}

impl ContainersConfig {
    /// Image for a specific container
    pub fn image(&self, container: &str) -> &str {
        self.overrides
            .get(container)
            .map_or(self.default_image.as_str(), String::as_str)
    }
}

/// Firewall rules applied inside containers
#[derive(Debug, Clone, Deserialize)]
pub struct FirewallConfig {
    #[serde(default = "default_firewall_allow")]
    pub allow: Vec<String>,
}

fn default_firewall_allow() -> Vec<String> {
    vec![
        "22/tcp".to_string(),
        "80/tcp".to_string(),
        "443/tcp".to_string(),
    ]
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            allow: default_firewall_allow(),
        }
    }
}

/// Setup applied to multiple containers
#[derive(Debug, Clone, Deserialize)]
pub struct CommonSetupConfig {
    #[serde(default = "default_common_containers")]
    pub containers: Vec<String>,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub firewall: FirewallConfig,
}

fn default_common_containers() -> Vec<String> {
    vec![
        "dev".to_string(),
        "staging".to_string(),
        "prod".to_string(),
    ]
}

impl Default for CommonSetupConfig {
    fn default() -> Self {
        Self {
            containers: default_common_containers(),
            packages: Vec::new(),
            firewall: FirewallConfig::default(),
        }
    }
}

/// Incus storage pool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Dedicated block device for ZFS (loopback file when absent)
    pub device: Option<String>,
    #[serde(default = "default_storage_size")]
    pub size: String,
}

fn default_storage_size() -> String {
    "100GiB".to_string()
}

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub admin: AdminConfig,
    pub network: NetworkConfig,
    pub resources: ResourcesConfig,
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub backups: BackupsConfig,
    #[serde(default)]
    pub dev_setup: DevSetupConfig,
    #[serde(default)]
    pub containers: ContainersConfig,
    #[serde(default)]
    pub common_setup: CommonSetupConfig,
    #[serde(default)]
    pub storage: Option<StorageConfig>,
}

impl Config {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let config: Self =
            serde_yaml::from_str(&content).context("Invalid configuration format")?;
        config.check_cross_fields()?;
        Ok(config)
    }

    /// Hard cross-field requirements
    fn check_cross_fields(&self) -> Result<()> {
        match self.server.auth_method {
            AuthMethod::Password if self.server.ssh_password.is_none() => {
                bail!("ssh_password required when auth_method is 'password'");
            }
            AuthMethod::SshKey if self.server.ssh_key_path.is_none() => {
                bail!("ssh_key_path required when auth_method is 'ssh_key'");
            }
            _ => {}
        }

        if self.backups.offsite.enabled {
            if self.backups.offsite.storagebox_host.is_none() {
                bail!("storagebox_host required when offsite backups enabled");
            }
            if self.backups.offsite.storagebox_user.is_none() {
                bail!("storagebox_user required when offsite backups enabled");
            }
        }

        Ok(())
    }

    /// Advisory checks; returns warnings without failing the load
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for ip in [
            &self.network.ips.host,
            &self.network.ips.dev,
            &self.network.ips.staging,
            &self.network.ips.prod,
        ] {
            if ip.split('.').count() != 4 {
                warnings.push(format!("Invalid IP format: {ip}"));
            }
        }

        let mut total_cpu = 0u32;
        for pool in [
            &self.resources.dev,
            &self.resources.staging,
            &self.resources.prod,
            &self.resources.postgres,
        ] {
            match pool.cpu_allowance.trim_end_matches('%').parse::<u32>() {
                Ok(pct) => total_cpu += pct,
                Err(_) => warnings.push(format!(
                    "Invalid CPU allowance format: {}",
                    pool.cpu_allowance
                )),
            }
        }
        if total_cpu > 100 {
            warnings.push(format!(
                "Total CPU allowance ({total_cpu}%) exceeds 100% - containers may compete for resources"
            ));
        }

        warnings
    }

    /// All containers this run manages, in a stable order
    pub fn container_names(&self) -> Vec<&'static str> {
        vec!["dev", "staging", "prod", "postgres"]
    }

    /// Containers with a public IP, with their addresses
    pub fn public_containers(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("dev", self.network.ips.dev.as_str()),
            ("staging", self.network.ips.staging.as_str()),
            ("prod", self.network.ips.prod.as_str()),
        ]
    }

    /// Private IP assignment per container
    pub fn private_ip(&self, container: &str) -> String {
        match container {
            "dev" => "10.10.10.2".to_string(),
            "staging" => "10.10.10.3".to_string(),
            "prod" => "10.10.10.4".to_string(),
            _ => self.network.private.postgres.clone(),
        }
    }

    /// Resource pool for a container
    pub fn pool(&self, container: &str) -> &ResourcePool {
        match container {
            "dev" => &self.resources.dev,
            "staging" => &self.resources.staging,
            "prod" => &self.resources.prod,
            _ => &self.resources.postgres,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FULL_CONFIG: &str = r#"
server:
  host: 203.0.113.10
  auth_method: ssh_key
  ssh_key_path: ~/.ssh/id_ed25519
admin:
  username: ops
  ssh_public_key: "ssh-ed25519 AAAAC3Nza ops@laptop"
network:
  interface: enp5s0
  gateway: 203.0.113.1
  netmask: 255.255.255.0
  ips:
    host: 203.0.113.10
    dev: 203.0.113.11
    staging: 203.0.113.12
    prod: 203.0.113.13
resources:
  dev:
    memory: 16GB
    cpu_allowance: 30%
  staging:
    memory: 8GB
    cpu_allowance: 15%
  prod:
    memory: 16GB
    cpu_allowance: 30%
  postgres:
    memory: 8GB
    cpu_allowance: 20%
    cpu_priority: 8
postgres:
  version: "17"
  databases:
    - name: app_prod
      user: app
    - name: app_staging
      user: app_staging
      password: fixed-by-operator
backups:
  offsite:
    enabled: true
    storagebox_host: u123.example.net
    storagebox_user: u123
dev_setup:
  packages: [git, vim, tmux]
  node:
    version: "22"
    global_packages: [pnpm]
common_setup:
  packages: [curl, htop]
"#;

    fn parse(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn full_config_parses_with_defaults() {
        let config = parse(FULL_CONFIG);
        assert_eq!(config.server.ssh_user, "root");
        assert_eq!(config.server.ssh_port, 22);
        assert_eq!(config.network.private.subnet, "10.10.10.0/24");
        assert_eq!(config.network.cidr_prefix(), "24");
        assert_eq!(config.resources.dev.cpu_priority, 5);
        assert_eq!(config.resources.postgres.cpu_priority, 8);
        assert_eq!(config.containers.image("dev"), "debian/13");
        assert_eq!(config.common_setup.firewall.allow.len(), 3);
        assert_eq!(config.backups.snapshots.retention_days, 7);
        assert!(config.backups.offsite.enabled);
    }

    #[test]
    fn database_password_generation_flag() {
        let config = parse(FULL_CONFIG);
        let dbs = &config.postgres.databases;
        assert!(dbs[0].generate_password());
        assert!(!dbs[1].generate_password());
        assert_eq!(dbs[0].secret_name(), "postgres.app_prod.password");
    }

    #[test]
    fn load_rejects_password_auth_without_password() {
        let yaml = FULL_CONFIG.replace("auth_method: ssh_key", "auth_method: password");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("ssh_password"));
    }

    #[test]
    fn load_rejects_offsite_without_host() {
        let yaml = FULL_CONFIG.replace("    storagebox_host: u123.example.net\n", "");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("storagebox_host"));
    }

    #[test]
    fn validate_warns_on_cpu_oversubscription() {
        let yaml = FULL_CONFIG.replace("cpu_allowance: 20%", "cpu_allowance: 80%");
        let config = parse(&yaml);
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("exceeds 100%")));
    }

    #[test]
    fn validate_warns_on_bad_ip() {
        let yaml = FULL_CONFIG.replace("dev: 203.0.113.11", "dev: 203.0.113");
        let config = parse(&yaml);
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("Invalid IP")));
    }

    #[test]
    fn validate_accepts_good_config() {
        let config = parse(FULL_CONFIG);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn image_overrides_apply() {
        let yaml = format!(
            "{FULL_CONFIG}containers:\n  overrides:\n    postgres: debian/12\n"
        );
        let config = parse(&yaml);
        assert_eq!(config.containers.image("postgres"), "debian/12");
        assert_eq!(config.containers.image("dev"), "debian/13");
    }

    #[test]
    fn private_ips_are_stable() {
        let config = parse(FULL_CONFIG);
        assert_eq!(config.private_ip("dev"), "10.10.10.2");
        assert_eq!(config.private_ip("postgres"), "10.10.10.5");
    }
}
