//! PostgreSQL steps: install, configure and tune, create databases,
//! and probe connectivity from the dev container.
//!
//! Database passwords flow through the secret vault. A database step
//! whose role and database both already exist reports `Indeterminate`
//! rather than `AlreadyApplied`: the password cannot be confirmed
//! remotely, so the action re-asserts it with the value generated (or
//! configured) for this run.

use anyhow::{Result, bail};
use orchestrate::{BoxedStep, CheckOutcome, SecretPolicy, Step, StepContext, Target};
use std::time::Duration;

use crate::config::{Config, DatabaseSpec};
use crate::steps::containers;

pub const INSTALL: &str = "postgres.install";
pub const CONFIGURE: &str = "postgres.configure";
pub const CONNECTIVITY: &str = "postgres.connectivity";

pub fn db_id(database: &str) -> String {
    format!("postgres.db.{database}")
}

pub fn steps(config: &Config) -> Vec<BoxedStep> {
    let mut steps: Vec<BoxedStep> = vec![
        Box::new(InstallPostgres {
            version: config.postgres.version.clone(),
        }),
        Box::new(ConfigurePostgres {
            version: config.postgres.version.clone(),
            private_ip: config.network.private.postgres.clone(),
            subnet: config.network.private.subnet.clone(),
            memory_mb: parse_memory_mb(&config.resources.postgres.memory),
        }),
    ];

    for db in &config.postgres.databases {
        steps.push(Box::new(CreateDatabase { spec: db.clone() }));
    }

    steps.push(Box::new(TestConnectivity {
        first_db: config.postgres.databases.first().cloned(),
        db_ids: config
            .postgres
            .databases
            .iter()
            .map(|db| db_id(&db.name))
            .collect(),
        postgres_ip: config.network.private.postgres.clone(),
    }));

    steps
}

/// Parse a memory size like `16GB`, `512MB`, `8G` into megabytes.
/// A bare number is taken as gigabytes.
pub fn parse_memory_mb(memory: &str) -> u64 {
    let s = memory.trim().to_uppercase();
    let (digits, scale) = if let Some(rest) = s.strip_suffix("GB") {
        (rest.to_string(), 1024)
    } else if let Some(rest) = s.strip_suffix("MB") {
        (rest.to_string(), 1)
    } else if let Some(rest) = s.strip_suffix('G') {
        (rest.to_string(), 1024)
    } else if let Some(rest) = s.strip_suffix('M') {
        (rest.to_string(), 1)
    } else {
        (s, 1024)
    };
    digits.trim().parse::<u64>().unwrap_or(0) * scale
}

/// Derived tuning values for a given memory allocation, following the
/// usual pgtune heuristics for SSD-backed storage
#[derive(Debug, PartialEq, Eq)]
pub struct Tuning {
    pub shared_buffers_mb: u64,
    pub effective_cache_size_mb: u64,
    pub work_mem_mb: u64,
    pub maintenance_work_mem_mb: u64,
    pub wal_buffers_mb: u64,
}

impl Tuning {
    pub fn for_memory(memory_mb: u64) -> Self {
        let shared_buffers_mb = (memory_mb / 4).min(8192);
        let wal_buffers_mb = (shared_buffers_mb * 3 / 100).clamp(4, 64);
        Self {
            shared_buffers_mb,
            effective_cache_size_mb: memory_mb * 3 / 4,
            work_mem_mb: (memory_mb / 400).max(16),
            maintenance_work_mem_mb: (memory_mb / 8).min(2048),
            wal_buffers_mb,
        }
    }

    fn render(&self, memory_mb: u64) -> String {
        format!(
            r"# vibehost: PostgreSQL performance tuning
# Based on {memory_mb}MB container allocation

# Memory Settings
shared_buffers = {}MB
effective_cache_size = {}MB
work_mem = {}MB
maintenance_work_mem = {}MB
wal_buffers = {}MB

# Connection Settings
max_connections = 200

# Checkpoint Settings
checkpoint_completion_target = 0.9
min_wal_size = 1GB
max_wal_size = 4GB

# SSD-optimized Settings (assuming ZFS on SSD)
random_page_cost = 1.1
effective_io_concurrency = 200

# Query Planner
default_statistics_target = 100

# Logging
log_min_duration_statement = 1000
log_checkpoints = on
log_connections = on
log_disconnections = on
log_lock_waits = on

# Parallel Query
max_parallel_workers_per_gather = 4
max_parallel_workers = 8
max_parallel_maintenance_workers = 4
",
            self.shared_buffers_mb,
            self.effective_cache_size_mb,
            self.work_mem_mb,
            self.maintenance_work_mem_mb,
            self.wal_buffers_mb,
        )
    }
}

/// Escape a value for a single-quoted SQL literal
fn sql_quote(value: &str) -> String {
    value.replace('\'', "''")
}

struct InstallPostgres {
    version: String,
}

impl Step for InstallPostgres {
    fn id(&self) -> String {
        INSTALL.to_string()
    }
    fn phase(&self) -> &'static str {
        "postgres"
    }
    fn target(&self) -> Target {
        Target::Container("postgres".to_string())
    }
    fn depends_on(&self) -> Vec<String> {
        vec![containers::network_id("postgres")]
    }
    fn description(&self) -> String {
        format!("Install PostgreSQL {}", self.version)
    }
    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(900))
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let out = ctx.run(&format!(
            "dpkg -s postgresql-{} 2> /dev/null | grep -q 'ok installed'",
            self.version
        ))?;
        Ok(if out.success() {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        ctx.run_checked("apt-get update")?;
        ctx.run_checked(&format!(
            "apt-get install -y postgresql-{v} postgresql-contrib-{v}",
            v = self.version
        ))?;
        Ok(())
    }

    fn verify(&self, ctx: &StepContext) -> Result<()> {
        let out = ctx.run("systemctl is-active --quiet postgresql")?;
        if !out.success() {
            bail!("postgresql service not active after install");
        }
        Ok(())
    }
}

struct ConfigurePostgres {
    version: String,
    private_ip: String,
    subnet: String,
    memory_mb: u64,
}

impl ConfigurePostgres {
    fn conf_dir(&self) -> String {
        format!("/etc/postgresql/{}/main", self.version)
    }
}

impl Step for ConfigurePostgres {
    fn id(&self) -> String {
        CONFIGURE.to_string()
    }
    fn phase(&self) -> &'static str {
        "postgres"
    }
    fn target(&self) -> Target {
        Target::Container("postgres".to_string())
    }
    fn depends_on(&self) -> Vec<String> {
        vec![INSTALL.to_string()]
    }
    fn description(&self) -> String {
        format!(
            "Configure PostgreSQL to listen on {} and tune for {}MB",
            self.private_ip, self.memory_mb
        )
    }
    fn rollback_hint(&self) -> Option<String> {
        Some(format!(
            "rm {}/conf.d/99-vibehost-tuning.conf and revert listen_addresses, then restart postgresql",
            self.conf_dir()
        ))
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let dir = self.conf_dir();
        let out = ctx.run(&format!(
            "grep -q \"listen_addresses = 'localhost,{}'\" {dir}/postgresql.conf && test -f {dir}/conf.d/99-vibehost-tuning.conf",
            self.private_ip
        ))?;
        Ok(if out.success() {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        let dir = self.conf_dir();
        ctx.run_checked(&format!(
            "sed -i \"s/#listen_addresses = 'localhost'/listen_addresses = 'localhost,{}'/\" {dir}/postgresql.conf",
            self.private_ip
        ))?;
        // Idempotent append: the subnet line goes in once
        ctx.run_checked(&format!(
            "grep -q '{subnet}' {dir}/pg_hba.conf || printf '\\n# vibehost: allow connections from private network\\nhost    all             all             {subnet}            scram-sha-256\\n' >> {dir}/pg_hba.conf",
            subnet = self.subnet
        ))?;
        ctx.upload(
            &Tuning::for_memory(self.memory_mb).render(self.memory_mb),
            &format!("{dir}/conf.d/99-vibehost-tuning.conf"),
            "644",
        )?;
        ctx.run_checked("systemctl restart postgresql")?;
        Ok(())
    }

    fn verify(&self, ctx: &StepContext) -> Result<()> {
        let out = ctx.run("sudo -u postgres psql -tAc 'SHOW listen_addresses'")?;
        if !out.success() || !out.stdout.contains(&self.private_ip) {
            bail!("postgres is not listening on {}", self.private_ip);
        }
        Ok(())
    }
}

struct CreateDatabase {
    spec: DatabaseSpec,
}

impl CreateDatabase {
    fn role_exists_cmd(&self) -> String {
        format!(
            "sudo -u postgres psql -tAc \"SELECT 1 FROM pg_roles WHERE rolname = '{}'\"",
            sql_quote(&self.spec.user)
        )
    }

    fn db_exists_cmd(&self) -> String {
        format!(
            "sudo -u postgres psql -tAc \"SELECT 1 FROM pg_database WHERE datname = '{}'\"",
            sql_quote(&self.spec.name)
        )
    }
}

impl Step for CreateDatabase {
    fn id(&self) -> String {
        db_id(&self.spec.name)
    }
    fn phase(&self) -> &'static str {
        "postgres"
    }
    fn target(&self) -> Target {
        Target::Container("postgres".to_string())
    }
    fn depends_on(&self) -> Vec<String> {
        vec![CONFIGURE.to_string()]
    }
    fn description(&self) -> String {
        format!(
            "Create database '{}' owned by '{}'",
            self.spec.name, self.spec.user
        )
    }
    fn rollback_hint(&self) -> Option<String> {
        Some(format!(
            "sudo -u postgres dropdb {} && sudo -u postgres dropuser {}",
            self.spec.name, self.spec.user
        ))
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let role = ctx.run(&self.role_exists_cmd())?;
        let db = ctx.run(&self.db_exists_cmd())?;
        let role_present = role.success() && role.stdout_trimmed() == "1";
        let db_present = db.success() && db.stdout_trimmed() == "1";
        // Role and database present proves structure, not the password;
        // re-assert rather than skip
        Ok(if role_present && db_present {
            CheckOutcome::Indeterminate
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        let secret_name = self.spec.secret_name();
        let secret = if self.spec.generate_password() {
            ctx.vault().generate(&secret_name, &SecretPolicy::default())?
        } else {
            ctx.vault()
                .insert(&secret_name, self.spec.password.clone())?
        };
        let password = sql_quote(secret.reveal());
        let user = &self.spec.user;
        let name = &self.spec.name;

        let role = ctx.run_checked(&self.role_exists_cmd())?;
        if role.stdout_trimmed() != "1" {
            ctx.run_checked(&format!(
                "sudo -u postgres psql -c \"CREATE ROLE {user} LOGIN PASSWORD '{password}'\""
            ))?;
        }
        // The password is asserted unconditionally so a re-run converges
        // the role to this run's credential
        ctx.run_checked(&format!(
            "sudo -u postgres psql -c \"ALTER ROLE {user} PASSWORD '{password}'\""
        ))?;

        let db = ctx.run_checked(&self.db_exists_cmd())?;
        if db.stdout_trimmed() != "1" {
            ctx.run_checked(&format!("sudo -u postgres createdb -O {user} {name}"))?;
        }
        ctx.run_checked(&format!(
            "sudo -u postgres psql -c \"GRANT ALL PRIVILEGES ON DATABASE {name} TO {user}\""
        ))?;
        Ok(())
    }

    fn verify(&self, ctx: &StepContext) -> Result<()> {
        let role = ctx.run_checked(&self.role_exists_cmd())?;
        let db = ctx.run_checked(&self.db_exists_cmd())?;
        if role.stdout_trimmed() != "1" || db.stdout_trimmed() != "1" {
            bail!("role or database missing after creation");
        }
        Ok(())
    }
}

/// Round-trip probe from the dev container, which is where application
/// code will connect from.
struct TestConnectivity {
    first_db: Option<DatabaseSpec>,
    db_ids: Vec<String>,
    postgres_ip: String,
}

impl TestConnectivity {
    fn psql_cmd(&self, db: &DatabaseSpec, password: &str) -> String {
        format!(
            "PGPASSWORD='{}' psql -h {} -U {} -d {} -c 'SELECT 1'",
            password.replace('\'', r"'\''"),
            self.postgres_ip,
            db.user,
            db.name
        )
    }
}

impl Step for TestConnectivity {
    fn id(&self) -> String {
        CONNECTIVITY.to_string()
    }
    fn phase(&self) -> &'static str {
        "postgres"
    }
    fn target(&self) -> Target {
        Target::Container("dev".to_string())
    }
    fn depends_on(&self) -> Vec<String> {
        let mut deps = self.db_ids.clone();
        deps.push(containers::network_id("dev"));
        deps
    }
    fn description(&self) -> String {
        "Verify database connectivity from the dev container".to_string()
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let Some(db) = &self.first_db else {
            return Ok(CheckOutcome::AlreadyApplied);
        };
        let client = ctx.run("command -v psql")?;
        if !client.success() {
            return Ok(CheckOutcome::NotApplied);
        }
        // The password for this run was (re)asserted by the database
        // step this one depends on
        let secret = ctx.vault().get(&db.secret_name())?;
        let out = ctx.run(&self.psql_cmd(db, secret.reveal()))?;
        Ok(if out.success() {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        let Some(db) = &self.first_db else {
            return Ok(());
        };
        ctx.run_checked("apt-get update && apt-get install -y postgresql-client")?;
        let secret = ctx.vault().get(&db.secret_name())?;
        let out = ctx.run(&self.psql_cmd(db, secret.reveal()))?;
        if !out.success() {
            bail!(
                "could not connect to {} at {} as {}: {}",
                db.name,
                self.postgres_ip,
                db.user,
                out.stderr_trimmed()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_parsing_accepts_common_forms() {
        assert_eq!(parse_memory_mb("16GB"), 16384);
        assert_eq!(parse_memory_mb("8G"), 8192);
        assert_eq!(parse_memory_mb("512MB"), 512);
        assert_eq!(parse_memory_mb("256M"), 256);
        assert_eq!(parse_memory_mb("4"), 4096);
        assert_eq!(parse_memory_mb(" 2gb "), 2048);
    }

    #[test]
    fn tuning_for_8gb_container() {
        let t = Tuning::for_memory(8192);
        assert_eq!(t.shared_buffers_mb, 2048);
        assert_eq!(t.effective_cache_size_mb, 6144);
        assert_eq!(t.work_mem_mb, 20);
        assert_eq!(t.maintenance_work_mem_mb, 1024);
        assert_eq!(t.wal_buffers_mb, 61);
    }

    #[test]
    fn tuning_caps_apply_to_large_hosts() {
        let t = Tuning::for_memory(131072); // 128GB
        assert_eq!(t.shared_buffers_mb, 8192);
        assert_eq!(t.maintenance_work_mem_mb, 2048);
        assert_eq!(t.wal_buffers_mb, 64);
    }

    #[test]
    fn tuning_floors_apply_to_small_hosts() {
        let t = Tuning::for_memory(2048);
        assert_eq!(t.work_mem_mb, 16);
        assert_eq!(t.wal_buffers_mb, 15);
    }

    #[test]
    fn rendered_tuning_carries_units() {
        let rendered = Tuning::for_memory(8192).render(8192);
        assert!(rendered.contains("shared_buffers = 2048MB"));
        assert!(rendered.contains("max_connections = 200"));
        assert!(rendered.contains("random_page_cost = 1.1"));
    }

    #[test]
    fn sql_quoting_doubles_single_quotes() {
        assert_eq!(sql_quote("plain"), "plain");
        assert_eq!(sql_quote("it's"), "it''s");
    }
}
