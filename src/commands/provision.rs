//! The provision command: load and validate configuration, preflight
//! the server, build the graph, run the scheduler, report, and render
//! the handoff document.

use anyhow::{Context as _, Result, bail};
use chrono::Local;
use dialoguer::Confirm;
use orchestrate::{
    RunLog, RunOptions, RunReport, Scheduler, SecretVault, StepStatus,
};
use std::time::Duration;

use crate::Context;
use crate::cli::{PlanArgs, ProvisionArgs};
use crate::config::Config;
use crate::handoff;
use crate::progress::RunProgress;
use crate::ssh::SshSession;
use crate::steps::{self, GraphOptions};
use crate::ui;

const MIN_DEBIAN_VERSION: u32 = 12;

pub fn run(ctx: &Context, args: &ProvisionArgs) -> Result<()> {
    let config = Config::load(&args.config)?;
    ui::success(&format!("Configuration loaded from {}", args.config.display()));
    for warning in config.validate() {
        ui::warn(&warning);
    }

    let ssh = SshSession::from_config(&config.server)?;
    ui::info(&format!("Connecting to {}...", config.server.host));
    let facts = ssh.preflight()?;

    if facts.os_id != "debian" || facts.debian_version.unwrap_or(0) < MIN_DEBIAN_VERSION {
        bail!(
            "expected Debian {MIN_DEBIAN_VERSION}+, found: {}",
            if facts.pretty_name.is_empty() {
                "unknown"
            } else {
                &facts.pretty_name
            }
        );
    }
    ui::success(&format!("{} confirmed", facts.pretty_name));
    ui::kv("Memory", &format!("{} GB", facts.memory_gb));
    ui::kv("CPU cores", &facts.cpu_cores.to_string());
    ui::kv("Disk free", &format!("{} GB", facts.disk_free_gb));
    if facts.memory_gb < 8.0 {
        ui::warn("Less than 8GB RAM - performance may be limited");
    }
    if facts.disk_free_gb < 50 {
        ui::warn("Less than 50GB free disk space");
    }

    let graph = steps::build_graph(
        &config,
        GraphOptions {
            skip_backups: args.skip_backups,
        },
    )?;
    ui::info(&format!("{} steps to evaluate", graph.len()));
    if args.skip_backups {
        ui::dim("backup configuration skipped (--skip-backups)");
    }

    if !args.dry_run && !args.yes {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Provision {}? This will mutate the server",
                config.server.host
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            ui::info("Aborted by operator");
            return Ok(());
        }
    }

    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("could not create {}", args.output_dir.display()))?;
    let mut run_log = if args.dry_run {
        RunLog::disabled()
    } else {
        let log_path = args.output_dir.join(format!(
            "vibehost-run-{}.log",
            Local::now().format("%Y%m%d-%H%M%S")
        ));
        ui::dim(&format!("run log: {}", log_path.display()));
        RunLog::to_file(&log_path)?
    };

    let vault = SecretVault::new();
    let scheduler = Scheduler::new(&ssh, &vault);
    let options = RunOptions {
        dry_run: args.dry_run,
        max_workers: args.jobs.max(1),
        step_timeout: Duration::from_secs(600),
    };

    let mut progress = RunProgress::new(graph.len() as u64, ctx.verbose > 0);
    let report = scheduler.run(&graph, &options, &mut run_log, &mut progress)?;
    progress.finish();

    if !ctx.quiet {
        print_summary(&report);
    }

    if !report.is_success() {
        for failure in report.failures() {
            ui::error(&format!(
                "{}: {}",
                failure.id,
                failure.error.as_deref().unwrap_or("unknown error")
            ));
            if let Some(hint) = &failure.rollback_hint {
                ui::dim(&format!("rollback: {hint}"));
            }
        }
        bail!(
            "run aborted: {} step(s) failed, {} cancelled - re-run after fixing; completed steps will be skipped",
            report.count(StepStatus::Failed),
            report.count(StepStatus::Cancelled)
        );
    }

    if args.dry_run {
        ui::success(&format!(
            "Plan complete: {} would run, {} already applied",
            report.count(StepStatus::Planned),
            report.count(StepStatus::Skipped)
        ));
        return Ok(());
    }

    let handoff_path = handoff::write(&config, &vault, &args.output_dir)?;
    let elapsed = report
        .finished_at
        .signed_duration_since(report.started_at)
        .num_seconds();
    ui::header("Provisioning complete");
    ui::kv("Time elapsed", &format!("{elapsed}s"));
    ui::kv("Handoff document", &handoff_path.display().to_string());
    ui::warn("The handoff document contains credentials - store it securely");

    ui::section("Quick connect");
    ui::kv(
        "host",
        &format!("ssh {}@{}", config.admin.username, config.network.ips.host),
    );
    ui::kv("dev", &format!("ssh root@{}", config.network.ips.dev));

    Ok(())
}

/// Plan is a dry run that never prompts and never writes output files.
pub fn plan(ctx: &Context, args: &PlanArgs) -> Result<()> {
    run(
        ctx,
        &ProvisionArgs {
            config: args.config.clone(),
            dry_run: true,
            skip_backups: args.skip_backups,
            jobs: args.jobs,
            output_dir: std::path::PathBuf::from("."),
            yes: true,
        },
    )
}

/// Phase-grouped summary table, in graph order
fn print_summary(report: &RunReport) {
    let mut current_phase = "";
    for step in &report.steps {
        if step.phase != current_phase {
            ui::section(&step.phase);
            current_phase = &step.phase;
        }
        let duration = step
            .duration_ms
            .map_or_else(String::new, |ms| format!(" ({:.1}s)", ms as f64 / 1000.0));
        let detail = step
            .detail
            .as_deref()
            .map_or_else(String::new, |d| format!(" - {d}"));
        println!(
            "  {} {}{duration}{detail}",
            ui::status_symbol(step.status),
            step.id
        );
    }
    println!();
}
