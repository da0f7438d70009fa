//! Handoff document rendering
//!
//! The one place secrets are deliberately surfaced: the operator gets a
//! markdown document with access details, database credentials, and
//! backup information. Every `Secret::reveal()` outside step actions
//! lives in this module.

use anyhow::{Context as _, Result};
use chrono::Local;
use orchestrate::SecretVault;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::config::Config;

/// Render the handoff document and write it into `output_dir`.
pub fn write(config: &Config, vault: &SecretVault, output_dir: &Path) -> Result<PathBuf> {
    let now = Local::now();
    let content = render(config, vault, &now.format("%Y-%m-%d").to_string());
    let hostname = config.network.ips.host.replace('.', "-");
    let path = output_dir.join(format!("handoff-{hostname}-{}.md", now.format("%Y%m%d")));
    std::fs::write(&path, content)
        .with_context(|| format!("could not write {}", path.display()))?;
    Ok(path)
}

fn render(config: &Config, vault: &SecretVault, date: &str) -> String {
    let mut doc = String::new();
    let net = &config.network;
    let admin = &config.admin.username;

    let _ = writeln!(doc, "# Server Handoff - {}", net.ips.host);
    let _ = writeln!(doc, "\nProvisioned: {date}\n");
    doc.push_str(
        "> This document contains credentials. Store it securely and delete it once the\n> values are in your password manager.\n",
    );

    doc.push_str("\n## Access\n\n");
    let _ = writeln!(doc, "| Target | Address | Login |");
    let _ = writeln!(doc, "|---|---|---|");
    let _ = writeln!(doc, "| Host | {} | `ssh {admin}@{}` |", net.ips.host, net.ips.host);
    for (name, ip) in config.public_containers() {
        let _ = writeln!(doc, "| {name} | {ip} | `ssh root@{ip}` |");
    }
    let _ = writeln!(
        doc,
        "| postgres | {} (private) | via any container on {} |",
        net.private.postgres, net.private.subnet
    );
    doc.push_str(
        "\nRoot SSH login on the host is disabled; use the admin account and `sudo`.\n",
    );

    doc.push_str("\n## Containers\n\n");
    let _ = writeln!(doc, "| Container | Public IP | Private IP |");
    let _ = writeln!(doc, "|---|---|---|");
    for name in config.container_names() {
        let public = config
            .public_containers()
            .into_iter()
            .find(|(c, _)| *c == name)
            .map_or_else(|| "-".to_string(), |(_, ip)| ip.to_string());
        let _ = writeln!(doc, "| {name} | {public} | {} |", config.private_ip(name));
    }
    if let Some(spare) = &net.ips.spare {
        let _ = writeln!(doc, "\nSpare public IP (unassigned): {spare}");
    }

    doc.push_str("\n## Databases\n\n");
    if config.postgres.databases.is_empty() {
        doc.push_str("No databases configured.\n");
    } else {
        let _ = writeln!(
            doc,
            "PostgreSQL {} at {}:5432 (private network only).\n",
            config.postgres.version, net.private.postgres
        );
        let _ = writeln!(doc, "| Database | User | Password |");
        let _ = writeln!(doc, "|---|---|---|");
        for db in &config.postgres.databases {
            let password = vault
                .get(&db.secret_name())
                .map_or_else(|_| "(not created this run)".to_string(), |s| format!("`{}`", s.reveal()));
            let _ = writeln!(doc, "| {} | {} | {password} |", db.name, db.user);
        }
        let _ = writeln!(
            doc,
            "\nConnection string: `postgresql://<user>:<password>@{}:5432/<database>`",
            net.private.postgres
        );
    }

    doc.push_str("\n## Development environment (dev container)\n\n");
    let dev = &config.dev_setup;
    let _ = writeln!(doc, "- Python {} with uv", dev.python.version);
    if !dev.python.global_packages.is_empty() {
        let _ = writeln!(doc, "  - global packages: {}", dev.python.global_packages.join(", "));
    }
    let _ = writeln!(doc, "- Node.js {}", dev.node.version);
    if !dev.node.global_packages.is_empty() {
        let _ = writeln!(doc, "  - global packages: {}", dev.node.global_packages.join(", "));
    }
    if dev.extras.docker {
        doc.push_str("- Docker (running as a service)\n");
    }
    if dev.extras.certbot {
        doc.push_str("- Certbot\n");
    }
    doc.push_str("- `/root/setup-user.sh <name>` creates a passwordless sudoer\n");
    if dev.extras.claude_code {
        doc.push_str("- `setup-claude-code` installs the Claude Code CLI (run as a regular user)\n");
    }

    doc.push_str("\n## Firewall\n\n");
    let _ = writeln!(
        doc,
        "Host allows SSH only. Containers allow: {}.",
        config.common_setup.firewall.allow.join(", ")
    );

    doc.push_str("\n## Backups\n\n");
    let snapshots = &config.backups.snapshots;
    if snapshots.enabled {
        let _ = writeln!(
            doc,
            "- Local snapshots: `{}` (cron), {}-day retention, script at `/usr/local/bin/vibehost-snapshot`",
            snapshots.schedule, snapshots.retention_days
        );
    }
    let offsite = &config.backups.offsite;
    if offsite.enabled {
        let _ = writeln!(
            doc,
            "- Offsite: `{}` (cron), {}-week retention, to {}@{}",
            offsite.schedule,
            offsite.retention_weeks,
            offsite.storagebox_user.as_deref().unwrap_or("?"),
            offsite.storagebox_host.as_deref().unwrap_or("?")
        );
        match vault.get(crate::steps::backups::STORAGEBOX_PUBKEY) {
            Ok(pubkey) => {
                doc.push_str(
                    "\nAdd this public key to the storage box before the first offsite run:\n\n",
                );
                let _ = writeln!(doc, "```\n{}\n```", pubkey.reveal());
            }
            Err(_) => {
                doc.push_str("\nStorage-box key was not generated this run.\n");
            }
        }
    }

    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrate::REDACTED;

    fn fixture() -> (Config, SecretVault) {
        let config = crate::steps::test_config();
        let vault = SecretVault::new();
        vault
            .insert("postgres.app_prod.password", "pw-prod-123".to_string())
            .unwrap();
        vault
            .insert("postgres.app_staging.password", "pw-staging-456".to_string())
            .unwrap();
        vault
            .insert(
                crate::steps::backups::STORAGEBOX_PUBKEY,
                "ssh-ed25519 AAAAbox backup@host".to_string(),
            )
            .unwrap();
        (config, vault)
    }

    #[test]
    fn handoff_reveals_database_credentials() {
        let (config, vault) = fixture();
        let doc = render(&config, &vault, "2026-01-15");
        assert!(doc.contains("| app_prod | app | `pw-prod-123` |"));
        assert!(doc.contains("| app_staging | app_staging | `pw-staging-456` |"));
        assert!(!doc.contains(REDACTED));
    }

    #[test]
    fn handoff_carries_access_and_storagebox_key() {
        let (config, vault) = fixture();
        let doc = render(&config, &vault, "2026-01-15");
        assert!(doc.contains("ssh ops@203.0.113.10"));
        assert!(doc.contains("ssh root@203.0.113.11"));
        assert!(doc.contains("ssh-ed25519 AAAAbox backup@host"));
        assert!(doc.contains("Provisioned: 2026-01-15"));
    }

    #[test]
    fn missing_secret_degrades_gracefully() {
        let config = crate::steps::test_config();
        let vault = SecretVault::new();
        let doc = render(&config, &vault, "2026-01-15");
        assert!(doc.contains("(not created this run)"));
        assert!(doc.contains("Storage-box key was not generated this run."));
    }

    #[test]
    fn write_names_file_after_host_and_date() {
        let (config, vault) = fixture();
        let dir = tempfile::tempdir().unwrap();
        let path = write(&config, &vault, dir.path()).unwrap();
        let name = path.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("handoff-203-0-113-10-"));
        assert!(name.ends_with(".md"));
        assert!(std::fs::read_to_string(&path).unwrap().contains("pw-prod-123"));
    }
}
