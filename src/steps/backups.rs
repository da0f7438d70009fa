//! Backup steps: snapshot and offsite scripts, cron wiring, the
//! storage-box key, and an initial snapshot run.
//!
//! The storage-box public key is not secret in itself, but it is a
//! generated value, so it flows through the vault like every other one
//! and surfaces only in the handoff document.

use anyhow::{Result, bail};
use orchestrate::{BoxedStep, CheckOutcome, Step, StepContext, Target};
use std::fmt::Write as _;
use std::time::Duration;

use crate::config::{Config, OffsiteConfig};
use crate::steps::{containers, postgres};

pub const DIRECTORIES: &str = "backups.directories";
pub const STORAGEBOX_KEY: &str = "backups.storagebox-key";
pub const SNAPSHOT_SCRIPT: &str = "backups.snapshot-script";
pub const OFFSITE_SCRIPT: &str = "backups.offsite-script";
pub const CRON: &str = "backups.cron";
pub const INITIAL_SNAPSHOT: &str = "backups.initial-snapshot";

/// Vault name for the storage-box public key
pub const STORAGEBOX_PUBKEY: &str = "backups.storagebox.pubkey";

const SNAPSHOT_PATH: &str = "/usr/local/bin/vibehost-snapshot";
const OFFSITE_PATH: &str = "/usr/local/bin/vibehost-offsite-backup";
const CRON_PATH: &str = "/etc/cron.d/vibehost-backups";

pub fn steps(config: &Config) -> Vec<BoxedStep> {
    let offsite = config.backups.offsite.enabled;
    let mut steps: Vec<BoxedStep> = vec![
        Box::new(BackupDirectories {
            containers: config
                .container_names()
                .into_iter()
                .map(String::from)
                .collect(),
        }),
        Box::new(SnapshotScript {
            retention_days: config.backups.snapshots.retention_days,
            databases: config
                .postgres
                .databases
                .iter()
                .map(|db| db.name.clone())
                .collect(),
        }),
    ];
    if offsite {
        steps.push(Box::new(StorageboxKey {
            key_path: config.backups.offsite.ssh_key_path.clone(),
        }));
        steps.push(Box::new(OffsiteScript {
            offsite: config.backups.offsite.clone(),
        }));
    }
    steps.push(Box::new(BackupCron {
        snapshot_schedule: config
            .backups
            .snapshots
            .enabled
            .then(|| config.backups.snapshots.schedule.clone()),
        offsite_schedule: offsite.then(|| config.backups.offsite.schedule.clone()),
    }));
    steps.push(Box::new(InitialSnapshot));
    steps
}

fn snapshot_script(retention_days: u32, databases: &[String]) -> String {
    let mut script = format!(
        r#"#!/bin/bash
# vibehost snapshot backup script
# Runs daily, keeps snapshots for {retention_days} days

set -e

DATE=$(date +%Y%m%d)
RETENTION_DAYS={retention_days}

# Containers to snapshot
CONTAINERS="dev staging prod postgres"

echo "Starting snapshot backup - $DATE"

for CONTAINER in $CONTAINERS; do
    echo "Snapshotting $CONTAINER..."

    # Create snapshot
    incus snapshot create $CONTAINER daily-$DATE

    # Clean up old snapshots
    incus snapshot list $CONTAINER -f csv | grep "^daily-" | while read SNAP; do
        SNAP_NAME=$(echo $SNAP | cut -d',' -f1)
        SNAP_DATE=$(echo $SNAP_NAME | sed 's/daily-//')

        SNAP_EPOCH=$(date -d "$SNAP_DATE" +%s 2>/dev/null || echo 0)
        NOW_EPOCH=$(date +%s)
        AGE_DAYS=$(( (NOW_EPOCH - SNAP_EPOCH) / 86400 ))

        if [ $AGE_DAYS -gt $RETENTION_DAYS ]; then
            echo "Deleting old snapshot: $SNAP_NAME (age: $AGE_DAYS days)"
            incus snapshot delete $CONTAINER $SNAP_NAME
        fi
    done
done
"#
    );

    if !databases.is_empty() {
        let _ = write!(
            script,
            r#"
# Also dump postgres databases
echo "Dumping PostgreSQL databases..."
mkdir -p /var/lib/incus/backups/postgres

for DB in {names}; do
    incus exec postgres -- sudo -u postgres pg_dump $DB > /var/lib/incus/backups/postgres/$DB-$DATE.sql

    # Compress
    gzip -f /var/lib/incus/backups/postgres/$DB-$DATE.sql

    # Keep only the most recent dumps
    ls -t /var/lib/incus/backups/postgres/$DB-*.sql.gz 2>/dev/null | tail -n +$((RETENTION_DAYS + 1)) | xargs -r rm
done
"#,
            names = databases.join(" ")
        );
    }

    script.push_str("\necho \"Snapshot backup complete!\"\n");
    script
}

fn offsite_script(offsite: &OffsiteConfig) -> String {
    let host = offsite.storagebox_host.as_deref().unwrap_or_default();
    let user = offsite.storagebox_user.as_deref().unwrap_or_default();
    let retention = offsite.retention_weeks;
    format!(
        r#"#!/bin/bash
# vibehost offsite backup script
# Runs weekly, keeps backups for {retention} weeks

set -e

DATE=$(date +%Y%m%d)
STORAGEBOX_HOST="{host}"
STORAGEBOX_USER="{user}"
SSH_KEY="{key}"
BACKUP_DIR="/var/lib/incus/backups/offsite"

mkdir -p $BACKUP_DIR

echo "Starting offsite backup - $DATE"

# Export containers
CONTAINERS="dev staging prod postgres"

for CONTAINER in $CONTAINERS; do
    echo "Exporting $CONTAINER..."

    EXPORT_FILE="$BACKUP_DIR/$CONTAINER-$DATE.tar.gz"
    incus export $CONTAINER $EXPORT_FILE --optimized-storage

    echo "Uploading $CONTAINER to Storage Box..."
    sftp -i $SSH_KEY -oBatchMode=yes $STORAGEBOX_USER@$STORAGEBOX_HOST << EOF
mkdir backups
mkdir backups/$CONTAINER
put $EXPORT_FILE backups/$CONTAINER/
EOF

    # Clean up local export
    rm -f $EXPORT_FILE
done

# Upload postgres dumps
echo "Uploading PostgreSQL dumps..."
sftp -i $SSH_KEY -oBatchMode=yes $STORAGEBOX_USER@$STORAGEBOX_HOST << EOF
mkdir backups/postgres-dumps
put /var/lib/incus/backups/postgres/*.sql.gz backups/postgres-dumps/
EOF

# Clean up old backups on the Storage Box
echo "Cleaning up old backups on Storage Box..."
ssh -i $SSH_KEY $STORAGEBOX_USER@$STORAGEBOX_HOST << 'REMOTE_EOF'
cd backups
for dir in dev staging prod postgres; do
    if [ -d "$dir" ]; then
        cd $dir
        ls -t *.tar.gz 2>/dev/null | tail -n +{weekly_keep} | xargs -r rm
        cd ..
    fi
done
cd postgres-dumps
ls -t *.sql.gz 2>/dev/null | tail -n +{daily_keep} | xargs -r rm
REMOTE_EOF

echo "Offsite backup complete!"
"#,
        key = offsite.ssh_key_path,
        weekly_keep = retention + 1,
        daily_keep = retention * 7 + 1,
    )
}

struct BackupDirectories {
    containers: Vec<String>,
}

impl Step for BackupDirectories {
    fn id(&self) -> String {
        DIRECTORIES.to_string()
    }
    fn phase(&self) -> &'static str {
        "backups"
    }
    fn target(&self) -> Target {
        Target::Host
    }
    fn depends_on(&self) -> Vec<String> {
        self.containers
            .iter()
            .map(|c| containers::launch_id(c))
            .collect()
    }
    fn description(&self) -> String {
        "Create backup directories".to_string()
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let out = ctx.run(
            "test -d /var/lib/incus/backups/postgres -a -d /var/lib/incus/backups/offsite",
        )?;
        Ok(if out.success() {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        ctx.run_checked("mkdir -p /var/lib/incus/backups/postgres /var/lib/incus/backups/offsite")?;
        Ok(())
    }
}

struct StorageboxKey {
    key_path: String,
}

impl Step for StorageboxKey {
    fn id(&self) -> String {
        STORAGEBOX_KEY.to_string()
    }
    fn phase(&self) -> &'static str {
        "backups"
    }
    fn target(&self) -> Target {
        Target::Host
    }
    fn depends_on(&self) -> Vec<String> {
        vec![DIRECTORIES.to_string()]
    }
    fn description(&self) -> String {
        "Generate the storage-box SSH key".to_string()
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let out = ctx.run(&format!("test -f {}", self.key_path))?;
        // An existing key still needs its public half captured for the
        // handoff, which happens in the action
        Ok(if out.success() {
            CheckOutcome::Indeterminate
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        ctx.run_checked(&format!(
            "test -f {path} || ssh-keygen -t ed25519 -N '' -f {path}",
            path = self.key_path
        ))?;
        let pubkey = ctx.run_checked(&format!("cat {}.pub", self.key_path))?;
        ctx.vault()
            .insert(STORAGEBOX_PUBKEY, pubkey.stdout_trimmed().to_string())?;
        Ok(())
    }

    fn verify(&self, ctx: &StepContext) -> Result<()> {
        let out = ctx.run(&format!(
            "test -f {path} -a -f {path}.pub",
            path = self.key_path
        ))?;
        if !out.success() {
            bail!("storage-box key pair missing after generation");
        }
        Ok(())
    }
}

struct SnapshotScript {
    retention_days: u32,
    databases: Vec<String>,
}

impl Step for SnapshotScript {
    fn id(&self) -> String {
        SNAPSHOT_SCRIPT.to_string()
    }
    fn phase(&self) -> &'static str {
        "backups"
    }
    fn target(&self) -> Target {
        Target::Host
    }
    fn depends_on(&self) -> Vec<String> {
        vec![DIRECTORIES.to_string()]
    }
    fn description(&self) -> String {
        format!(
            "Install the snapshot script ({}-day retention)",
            self.retention_days
        )
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let out = ctx.run(&format!(
            "test -x {SNAPSHOT_PATH} && grep -q 'RETENTION_DAYS={}' {SNAPSHOT_PATH}",
            self.retention_days
        ))?;
        Ok(if out.success() {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        ctx.upload(
            &snapshot_script(self.retention_days, &self.databases),
            SNAPSHOT_PATH,
            "755",
        )?;
        Ok(())
    }
}

struct OffsiteScript {
    offsite: OffsiteConfig,
}

impl Step for OffsiteScript {
    fn id(&self) -> String {
        OFFSITE_SCRIPT.to_string()
    }
    fn phase(&self) -> &'static str {
        "backups"
    }
    fn target(&self) -> Target {
        Target::Host
    }
    fn depends_on(&self) -> Vec<String> {
        vec![STORAGEBOX_KEY.to_string()]
    }
    fn description(&self) -> String {
        "Install the offsite backup script".to_string()
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let host = self.offsite.storagebox_host.as_deref().unwrap_or_default();
        let out = ctx.run(&format!(
            "test -x {OFFSITE_PATH} && grep -qF '{host}' {OFFSITE_PATH}"
        ))?;
        Ok(if out.success() {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        ctx.upload(&offsite_script(&self.offsite), OFFSITE_PATH, "755")?;
        Ok(())
    }
}

struct BackupCron {
    snapshot_schedule: Option<String>,
    offsite_schedule: Option<String>,
}

impl BackupCron {
    fn content(&self) -> String {
        let mut content = String::from("# vibehost backup jobs\n");
        if let Some(schedule) = &self.snapshot_schedule {
            let _ = writeln!(
                content,
                "{schedule} root {SNAPSHOT_PATH} >> /var/log/vibehost-snapshot.log 2>&1"
            );
        }
        if let Some(schedule) = &self.offsite_schedule {
            let _ = writeln!(
                content,
                "{schedule} root {OFFSITE_PATH} >> /var/log/vibehost-offsite.log 2>&1"
            );
        }
        content
    }
}

impl Step for BackupCron {
    fn id(&self) -> String {
        CRON.to_string()
    }
    fn phase(&self) -> &'static str {
        "backups"
    }
    fn target(&self) -> Target {
        Target::Host
    }
    fn depends_on(&self) -> Vec<String> {
        let mut deps = vec![SNAPSHOT_SCRIPT.to_string()];
        if self.offsite_schedule.is_some() {
            deps.push(OFFSITE_SCRIPT.to_string());
        }
        deps
    }
    fn description(&self) -> String {
        "Schedule backup cron jobs".to_string()
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let Some(schedule) = self
            .snapshot_schedule
            .as_deref()
            .or(self.offsite_schedule.as_deref())
        else {
            return Ok(CheckOutcome::AlreadyApplied);
        };
        let out = ctx.run(&format!(
            "test -f {CRON_PATH} && grep -qF '{schedule}' {CRON_PATH}"
        ))?;
        Ok(if out.success() {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        ctx.upload(&self.content(), CRON_PATH, "644")?;
        Ok(())
    }
}

struct InitialSnapshot;

impl Step for InitialSnapshot {
    fn id(&self) -> String {
        INITIAL_SNAPSHOT.to_string()
    }
    fn phase(&self) -> &'static str {
        "backups"
    }
    fn target(&self) -> Target {
        Target::Host
    }
    fn depends_on(&self) -> Vec<String> {
        vec![CRON.to_string(), postgres::CONNECTIVITY.to_string()]
    }
    fn description(&self) -> String {
        "Run the initial snapshot backup".to_string()
    }
    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(1800))
    }
    fn rollback_hint(&self) -> Option<String> {
        Some("incus snapshot list <container> and delete partial daily-* snapshots".to_string())
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let out = ctx.run("incus snapshot list dev -f csv | grep -q '^daily-'")?;
        Ok(if out.success() {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        ctx.run_checked(SNAPSHOT_PATH)?;
        Ok(())
    }

    fn verify(&self, ctx: &StepContext) -> Result<()> {
        let out = ctx.run("incus snapshot list dev -f csv | grep -q '^daily-'")?;
        if !out.success() {
            bail!("no daily snapshot found after the initial run");
        }
        Ok(())
    }
}
