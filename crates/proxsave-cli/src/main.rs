mod cli;
mod prompt;
mod signal;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use clap::Parser;

use proxsave_core::cancel::CancelToken;
use proxsave_core::category::{self, SystemType};
use proxsave_core::env::{Env, SystemClock};
use proxsave_core::error::{RestoreError, Result};
use proxsave_core::nicrepair;
use proxsave_core::orchestrator::{self, RestoreOptions};
use proxsave_core::plan::{PbsBehavior, RestoreMode};
use proxsave_core::safety;

use cli::{Cli, Commands};
use prompt::TerminalUi;

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cancel = signal::install_signal_handlers();

    let result = match cli.command {
        Commands::Restore {
            bundle,
            system,
            mode,
            categories,
            cluster,
            pbs_behavior,
            export_base,
            yes,
        } => run_restore(
            &cancel,
            bundle,
            &system,
            mode.as_deref(),
            categories,
            cluster,
            pbs_behavior.as_deref(),
            export_base,
            yes,
        ),
        Commands::Categories { system } => run_categories(system.as_deref()),
        Commands::NicRepair {
            stage_root,
            include_conflicts,
            dry_run,
        } => run_nic_repair(&cancel, &stage_root, include_conflicts, dry_run),
        Commands::PurgeSafetyBackups { older_than } => run_purge(older_than),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        let code = match &e {
            RestoreError::Cancelled => 130,
            RestoreError::Aborted => 2,
            RestoreError::FirewallNotCommitted(details) => {
                eprintln!("  rollback armed: {}", details.rollback_armed);
                eprintln!("  marker: {}", details.marker_path.display());
                eprintln!("  log:    {}", details.log_path.display());
                if let Ok(remaining) = details.deadline.duration_since(SystemTime::now()) {
                    eprintln!("  fires in ~{}s unless the marker is removed", remaining.as_secs());
                } else {
                    eprintln!("  the rollback timer has already fired or is about to");
                }
                3
            }
            _ => 1,
        };
        std::process::exit(code);
    }
}

fn parse_system(system: &str) -> SystemType {
    match system {
        "pbs" => SystemType::Pbs,
        _ => SystemType::Pve,
    }
}

#[allow(clippy::too_many_arguments)]
fn run_restore(
    cancel: &CancelToken,
    bundle: String,
    system: &str,
    mode: Option<&str>,
    categories: Vec<String>,
    cluster: bool,
    pbs_behavior: Option<&str>,
    export_base: String,
    yes: bool,
) -> Result<()> {
    if unsafe { libc::geteuid() } != 0 {
        return Err(RestoreError::Precondition(
            "restore writes privileged paths; run as root".to_string(),
        ));
    }

    let mode = match (mode, categories.is_empty()) {
        (Some(mode), _) => RestoreMode::parse(mode),
        (None, false) => Some(RestoreMode::Custom),
        (None, true) => None,
    };
    let behavior = match pbs_behavior {
        Some("merge") => PbsBehavior::Merge,
        Some("clean-1to1") => PbsBehavior::CleanOneToOne,
        _ => PbsBehavior::Unspecified,
    };

    tracing::info!("restoring from {bundle} ({system} host)");

    let env = Env::system(Arc::new(TerminalUi { assume_yes: yes }));
    let opts = RestoreOptions {
        bundle: PathBuf::from(bundle),
        system_type: parse_system(system),
        cluster_backup: cluster,
        mode,
        categories: (!categories.is_empty()).then_some(categories),
        pbs_behavior: behavior,
        dest_root: PathBuf::from("/"),
        export_base: PathBuf::from(export_base),
    };

    let outcome = orchestrator::run(&env, cancel, &opts)?;
    eprintln!(
        "Restore finished: {} restored, {} skipped, {} failed ({} bytes).",
        outcome.stats.restored,
        outcome.stats.skipped,
        outcome.stats.failed,
        outcome.stats.bytes_written
    );
    if let Some(log) = &outcome.stats.log_path {
        eprintln!("Detail log: {}", log.display());
    }
    if let Some(backup) = &outcome.safety {
        eprintln!(
            "Safety backup: {} (manual rollback: {})",
            backup.archive_path.display(),
            backup.rollback_hint()
        );
    }
    Ok(())
}

fn run_categories(system: Option<&str>) -> Result<()> {
    let categories: Vec<&category::Category> = match system {
        Some(system) => category::available_for(parse_system(system)),
        None => category::registry().iter().collect(),
    };
    for cat in categories {
        let export = if cat.export_only { " [export-only]" } else { "" };
        println!("{:<20} {}{}", cat.id, cat.description, export);
        for path in cat.paths {
            println!("{:<20}   {}", "", path);
        }
    }
    Ok(())
}

fn run_nic_repair(
    cancel: &CancelToken,
    stage_root: &str,
    include_conflicts: bool,
    dry_run: bool,
) -> Result<()> {
    let env = Env::system(Arc::new(TerminalUi { assume_yes: false }));
    let stage_root = Path::new(stage_root);

    let Some(backup) = nicrepair::load_backup_inventory(stage_root)? else {
        return Err(RestoreError::Precondition(format!(
            "no network inventory found under {}",
            stage_root.display()
        )));
    };
    let current =
        nicrepair::collect_current(env.runner.as_ref(), cancel, Path::new("/sys/class/net"))?;
    let plan = nicrepair::compute_plan(&backup, &current);

    if plan.is_empty() {
        println!("Interface names already match this hardware; nothing to do.");
        return Ok(());
    }
    for entry in &plan.safe {
        println!(
            "rename {} -> {} (matched by {:?}: {})",
            entry.old_name, entry.new_name, entry.method, entry.identifier
        );
    }
    for entry in &plan.conflicts {
        println!(
            "CONFLICT {} -> {} ({} is a live interface on this host)",
            entry.old_name, entry.new_name, entry.old_name
        );
    }
    if dry_run {
        return Ok(());
    }

    let mut selected = plan.safe.clone();
    if include_conflicts {
        selected.extend(plan.conflicts.iter().cloned());
    } else if !plan.conflicts.is_empty() {
        eprintln!("Conflicting renames skipped; re-run with --include-conflicts to force them.");
    }
    if selected.is_empty() {
        return Ok(());
    }
    if !env
        .ui
        .confirm("Rewrite /etc/network/interfaces* with these renames?", false)?
    {
        return Err(RestoreError::Aborted);
    }

    let report = nicrepair::apply(
        env.clock.as_ref(),
        &env.tmp_dir,
        Path::new("/etc/network"),
        &selected,
    )?;
    for file in &report.changed_files {
        println!("rewrote {}", file.display());
    }
    if let Some(dir) = &report.backup_dir {
        println!("originals preserved under {}", dir.display());
    }
    Ok(())
}

fn run_purge(older_than_hours: u64) -> Result<()> {
    let removed = safety::purge_older_than(
        &SystemClock,
        Path::new(proxsave_core::env::DEFAULT_TMP_DIR),
        Duration::from_secs(older_than_hours * 3600),
    )?;
    println!("Removed {removed} safety backup(s).");
    Ok(())
}
