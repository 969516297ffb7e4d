use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::category::{self, SelectedCategory, SystemType};
use crate::env::Env;
use crate::error::{RestoreError, Result};
use crate::extract::{self, ExtractOptions, ExtractStats};
use crate::firewall;
use crate::mount::{self, MountTable};
use crate::nicrepair;
use crate::plan::{self, PbsBehavior, RestoreMode, RestorePlan};
use crate::safety::{self, SafetyBackupResult};
use crate::services::{ServiceCoordinator, PBS_SERVICES, PVE_CLUSTER_SERVICES};
use crate::staged;

/// Categories whose files need domain-aware merge rules instead of a
/// naive copy; they are extracted into a stage directory and handed to
/// the staged appliers.
const STAGED_CATEGORY_IDS: &[&str] = &[
    "pve_access",
    "pve_notifications",
    "pve_firewall",
    "pbs_access",
    "pbs_notifications",
    "pbs_datastore",
];

/// Rollback window for the firewall guarded apply.
const FIREWALL_ROLLBACK_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// The decrypted archive bundle (decryption is an external step).
    pub bundle: PathBuf,
    pub system_type: SystemType,
    /// Whether the backup was taken on a cluster member.
    pub cluster_backup: bool,
    /// Preselected mode; prompted when absent.
    pub mode: Option<RestoreMode>,
    /// Preselected category ids for custom mode; prompted when absent.
    pub categories: Option<Vec<String>>,
    pub pbs_behavior: PbsBehavior,
    /// `/` in production, a fake root in tests.
    pub dest_root: PathBuf,
    /// Where export directories are created.
    pub export_base: PathBuf,
}

#[derive(Debug)]
pub struct RestoreOutcome {
    pub plan: RestorePlan,
    pub safety: Option<SafetyBackupResult>,
    pub stats: ExtractStats,
    pub export_stats: Option<ExtractStats>,
    pub export_dir: Option<PathBuf>,
}

/// Sequence one restore run: analyze, select, snapshot, stop services,
/// extract, run the staged appliers, start services. Layered rollback:
/// the safety backup covers the extract stage, the firewall dead-man
/// switch covers the firewall stage.
pub fn run(env: &Env, cancel: &CancelToken, opts: &RestoreOptions) -> Result<RestoreOutcome> {
    cancel.check()?;

    let available =
        extract::scan_available_categories(env.runner.as_ref(), &opts.bundle, opts.system_type)?;
    if available.is_empty() {
        return Err(RestoreError::InvalidArchive(
            "archive contains no recognizable configuration".to_string(),
        ));
    }

    let mode = match opts.mode {
        Some(mode) => mode,
        None => env
            .ui
            .choose_mode(&RestoreMode::ALL)?
            .ok_or(RestoreError::Aborted)?,
    };

    let selection = select_categories(env, opts, mode, &available)?;
    if selection.is_empty() {
        return Err(RestoreError::Aborted);
    }

    let cluster_mode = if opts.cluster_backup && selection.iter().any(|c| c.id == "pve_cluster") {
        Some(
            env.ui
                .choose_cluster_mode()?
                .ok_or(RestoreError::Aborted)?,
        )
    } else {
        None
    };

    let restore_plan = RestorePlan::build(
        opts.system_type,
        mode,
        selection,
        opts.cluster_backup,
        cluster_mode,
        opts.pbs_behavior,
    );

    env.ui.notice(&restore_plan.summary());
    if !env.ui.confirm("Proceed with this restore plan?", false)? {
        return Err(RestoreError::Aborted);
    }

    let safety_backup = create_safety_backup(env, opts, &restore_plan)?;

    let stopped = stop_services(env, cancel, opts, &restore_plan)?;

    let mutation = (|| -> Result<(ExtractStats, Option<ExtractStats>, Option<PathBuf>)> {
        // Naive archive-level writes first; staged appliers supersede
        // their own files afterwards.
        let stats = extract_normal(env, cancel, opts, &restore_plan)?;
        let (export_stats, export_dir) = extract_exports(env, cancel, opts, &restore_plan)?;
        apply_staged(env, cancel, opts, &restore_plan)?;
        recreate_datastore_skeletons(opts, &restore_plan);
        repair_nic_names(env, opts, &restore_plan)?;
        Ok((stats, export_stats, export_dir))
    })();

    start_services(env, cancel, &stopped);

    match mutation {
        Ok((stats, export_stats, export_dir)) => {
            if let Some(dir) = &export_dir {
                env.ui
                    .notice(&format!("Export written to {}", dir.display()));
                if restore_plan.cluster_safe_mode {
                    env.ui.notice(&format!(
                        "SAFE mode: review {}/etc/pve and re-apply guest or storage \
                         configs with qm/pct/pvesh as needed.",
                        dir.display()
                    ));
                }
            }
            Ok(RestoreOutcome {
                plan: restore_plan,
                safety: safety_backup,
                stats,
                export_stats,
                export_dir,
            })
        }
        Err(e) => {
            if let Some(backup) = &safety_backup {
                if !e.is_cancelled() {
                    env.ui.notice(&format!(
                        "Restore failed. Roll back manually with: {} \
                         (detail logs under {})",
                        backup.rollback_hint(),
                        env.tmp_dir.display()
                    ));
                }
            }
            Err(e)
        }
    }
}

fn select_categories(
    env: &Env,
    opts: &RestoreOptions,
    mode: RestoreMode,
    available: &[&'static category::Category],
) -> Result<Vec<SelectedCategory>> {
    let chosen: Vec<&'static category::Category> = if mode == RestoreMode::Custom {
        let ids = match &opts.categories {
            Some(ids) => ids.clone(),
            None => env
                .ui
                .choose_categories(available)?
                .ok_or(RestoreError::Aborted)?,
        };
        let mut chosen = Vec::new();
        for id in &ids {
            match available.iter().find(|c| c.id == id.as_str()) {
                Some(cat) => chosen.push(*cat),
                None => {
                    return Err(RestoreError::Precondition(format!(
                        "category '{id}' is not available in this archive"
                    )))
                }
            }
        }
        chosen
    } else {
        plan::mode_categories(opts.system_type, mode)
            .into_iter()
            .filter(|c| available.iter().any(|a| a.id == c.id))
            .collect()
    };

    Ok(chosen.into_iter().map(SelectedCategory::from).collect())
}

fn create_safety_backup(
    env: &Env,
    opts: &RestoreOptions,
    restore_plan: &RestorePlan,
) -> Result<Option<SafetyBackupResult>> {
    if restore_plan.normal_categories.is_empty() {
        return Ok(None);
    }
    let paths = category::paths_for(&restore_plan.normal_categories);
    match safety::create(
        env.clock.as_ref(),
        &env.tmp_dir,
        &opts.dest_root,
        &paths,
        safety::SAFETY_PREFIX,
    ) {
        Ok(result) => Ok(Some(result)),
        Err(e) => {
            tracing::warn!("safety backup failed: {e}");
            if env.ui.confirm(
                "Safety backup failed. Continue without a rollback snapshot?",
                false,
            )? {
                Ok(None)
            } else {
                Err(e)
            }
        }
    }
}

/// Returns the stopped service groups, innermost last, for reverse
/// restart.
fn stop_services(
    env: &Env,
    cancel: &CancelToken,
    opts: &RestoreOptions,
    restore_plan: &RestorePlan,
) -> Result<Vec<&'static [&'static str]>> {
    let coordinator = ServiceCoordinator::new(env.runner.as_ref());
    let mut stopped: Vec<&'static [&'static str]> = Vec::new();

    if restore_plan.needs_cluster_restore {
        // A failed PVE stop aborts: writing config.db under a live
        // pmxcfs corrupts the cluster state.
        coordinator.stop_group(PVE_CLUSTER_SERVICES, cancel)?;
        stopped.push(PVE_CLUSTER_SERVICES);

        if opts.dest_root == Path::new("/") {
            let umount = crate::env::CmdSpec::new("umount").arg("/etc/pve");
            if let Err(e) = crate::env::run_checked(
                env.runner.as_ref(),
                &umount,
                Duration::from_secs(30),
                cancel,
            ) {
                if e.is_cancelled() {
                    return Err(e);
                }
                tracing::warn!("umount /etc/pve failed: {e}");
            }
        }
    }

    if restore_plan.needs_pbs_services {
        match coordinator.stop_group(PBS_SERVICES, cancel) {
            Ok(()) => stopped.push(PBS_SERVICES),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => tracing::warn!("PBS services did not stop cleanly, continuing: {e}"),
        }
    }

    Ok(stopped)
}

fn start_services(env: &Env, cancel: &CancelToken, stopped: &[&'static [&'static str]]) {
    let coordinator = ServiceCoordinator::new(env.runner.as_ref());
    for group in stopped.iter().rev() {
        // Groups restart in reverse stop order, members too.
        let reversed: Vec<&str> = group.iter().rev().copied().collect();
        if let Err(e) = coordinator.start_group(&reversed, cancel) {
            tracing::warn!("service restart incomplete: {e}");
        }
    }
}

fn extract_normal(
    env: &Env,
    cancel: &CancelToken,
    opts: &RestoreOptions,
    restore_plan: &RestorePlan,
) -> Result<ExtractStats> {
    if restore_plan.normal_categories.is_empty() {
        return Ok(ExtractStats::default());
    }
    let extract_opts = ExtractOptions {
        dest_root: &opts.dest_root,
        selection: Some(&restore_plan.normal_categories),
        tmp_dir: &env.tmp_dir,
    };
    extract::extract_archive(
        env.runner.as_ref(),
        env.clock.as_ref(),
        &opts.bundle,
        &extract_opts,
        cancel,
    )
}

fn extract_exports(
    env: &Env,
    cancel: &CancelToken,
    opts: &RestoreOptions,
    restore_plan: &RestorePlan,
) -> Result<(Option<ExtractStats>, Option<PathBuf>)> {
    if restore_plan.export_categories.is_empty() {
        return Ok((None, None));
    }
    let export_dir = opts
        .export_base
        .join(format!("pve-config-export-{}", env.timestamp()));
    std::fs::create_dir_all(&export_dir)?;

    let extract_opts = ExtractOptions {
        dest_root: &export_dir,
        selection: Some(&restore_plan.export_categories),
        tmp_dir: &env.tmp_dir,
    };
    let stats = extract::extract_archive(
        env.runner.as_ref(),
        env.clock.as_ref(),
        &opts.bundle,
        &extract_opts,
        cancel,
    )?;
    Ok((Some(stats), Some(export_dir)))
}

/// Extract the staged categories into a scratch stage and run the
/// domain-aware appliers. The stage supersedes the naive copies for
/// exactly the files these appliers own.
fn apply_staged(
    env: &Env,
    cancel: &CancelToken,
    opts: &RestoreOptions,
    restore_plan: &RestorePlan,
) -> Result<()> {
    let staged: Vec<SelectedCategory> = restore_plan
        .normal_categories
        .iter()
        .filter(|c| STAGED_CATEGORY_IDS.contains(&c.id.as_str()))
        .cloned()
        .collect();
    if staged.is_empty() {
        return Ok(());
    }

    let stage_root = env.tmp_dir.join(format!("stage_{}", env.timestamp()));
    std::fs::create_dir_all(&stage_root)?;
    let extract_opts = ExtractOptions {
        dest_root: &stage_root,
        selection: Some(&staged),
        tmp_dir: &env.tmp_dir,
    };
    extract::extract_archive(
        env.runner.as_ref(),
        env.clock.as_ref(),
        &opts.bundle,
        &extract_opts,
        cancel,
    )?;

    let selected = |id: &str| staged.iter().any(|c| c.id == id);
    let production_root = opts.dest_root == Path::new("/");

    if selected("pve_access") {
        let pve_mounted = if production_root {
            MountTable::load()?.pmxcfs_mounted()
        } else {
            true
        };
        staged::access::apply_pve(&stage_root, &opts.dest_root.join("etc/pve"), pve_mounted)?;
    }
    if selected("pbs_access") {
        staged::access::apply_pbs(&stage_root, &opts.dest_root.join("etc/proxmox-backup"))?;
    }

    if selected("pve_notifications") {
        let stats = staged::notifications::apply_pve(env.runner.as_ref(), cancel, &stage_root)?;
        tracing::info!(
            "PVE notifications: {} applied, {} failed",
            stats.applied,
            stats.failed
        );
    }
    if selected("pbs_notifications") {
        staged::notifications::apply_pbs(
            &stage_root,
            &opts.dest_root.join("etc/proxmox-backup"),
        )?;
    }

    if selected("pbs_datastore") {
        apply_datastores(env, cancel, opts, &stage_root)?;
    }

    if selected("pve_firewall") {
        let fw_opts = firewall::FirewallApplyOptions {
            stage_root: &stage_root,
            live_root: &opts.dest_root,
            timeout: FIREWALL_ROLLBACK_WINDOW,
        };
        firewall::guarded_apply(env, cancel, &fw_opts)?;
    }

    Ok(())
}

fn apply_datastores(
    env: &Env,
    cancel: &CancelToken,
    opts: &RestoreOptions,
    stage_root: &Path,
) -> Result<()> {
    let staged_cfg = stage_root.join("etc/proxmox-backup/datastore.cfg");
    let live_cfg = opts.dest_root.join("etc/proxmox-backup/datastore.cfg");

    // Mount-guard every staged datastore path before the file lands.
    if opts.dest_root == Path::new("/") {
        if let Ok(text) = std::fs::read_to_string(&staged_cfg) {
            if let Ok(blocks) = staged::datastore::parse_blocks("datastore.cfg", &text) {
                let paths: Vec<PathBuf> = blocks
                    .iter()
                    .filter_map(|b| b.path.as_deref().map(PathBuf::from))
                    .collect();
                let mounts = MountTable::load()?;
                let fstab = std::fs::read_to_string("/etc/fstab").unwrap_or_default();
                let fstab_mountpoints = mount::parse_fstab_mountpoints(&fstab);
                mount::guard_datastore_paths(
                    env.runner.as_ref(),
                    cancel,
                    &mounts,
                    &fstab_mountpoints,
                    Path::new("/run/proxsave/guard"),
                    &paths,
                )?;
            }
        }
    }

    let stats =
        staged::datastore::apply_file(env.clock.as_ref(), &env.tmp_dir, &staged_cfg, &live_cfg)?;
    if let Some(deferred) = &stats.deferred_file {
        env.ui.notice(&format!(
            "{} datastore block(s) deferred to {}",
            stats.deferred_blocks,
            deferred.display()
        ));
    }
    Ok(())
}

/// Best-effort skeletons so services find their directories on start.
fn recreate_datastore_skeletons(opts: &RestoreOptions, restore_plan: &RestorePlan) {
    if !restore_plan.is_selected("pbs_datastore") {
        return;
    }
    let live_cfg = opts.dest_root.join("etc/proxmox-backup/datastore.cfg");
    let Ok(text) = std::fs::read_to_string(&live_cfg) else {
        return;
    };
    let Ok(blocks) = staged::datastore::parse_blocks("datastore.cfg", &text) else {
        return;
    };
    for block in blocks {
        if let Some(path) = block.path {
            if let Err(e) = std::fs::create_dir_all(&path) {
                tracing::warn!("cannot recreate datastore directory {path}: {e}");
            }
        }
    }
}

/// After a network restore, repair interface names against the current
/// hardware. Only unambiguous, conflict-free renames are applied here;
/// the `nic-repair` command exposes the full plan.
fn repair_nic_names(env: &Env, opts: &RestoreOptions, restore_plan: &RestorePlan) -> Result<()> {
    if !restore_plan.is_selected("network") {
        return Ok(());
    }
    let Some(backup) = nicrepair::load_backup_inventory(&opts.dest_root)? else {
        return Ok(());
    };
    let sys_class_net = Path::new("/sys/class/net");
    if !sys_class_net.is_dir() || opts.dest_root != Path::new("/") {
        return Ok(());
    }
    let current =
        nicrepair::collect_current(env.runner.as_ref(), &CancelToken::new(), sys_class_net)?;
    let nic_plan = nicrepair::compute_plan(&backup, &current);
    if nic_plan.safe.is_empty() {
        if !nic_plan.conflicts.is_empty() {
            env.ui.notice(
                "NIC rename conflicts detected; run `proxsave nic-repair` to review them.",
            );
        }
        return Ok(());
    }

    let summary: Vec<String> = nic_plan
        .safe
        .iter()
        .map(|m| format!("{} -> {}", m.old_name, m.new_name))
        .collect();
    if env.ui.confirm(
        &format!(
            "Rewrite /etc/network/interfaces* for renamed NICs ({})?",
            summary.join(", ")
        ),
        true,
    )? {
        let report = nicrepair::apply(
            env.clock.as_ref(),
            &env.tmp_dir,
            &opts.dest_root.join("etc/network"),
            &nic_plan.safe,
        )?;
        if let Some(dir) = report.backup_dir {
            env.ui.notice(&format!(
                "Rewrote {} file(s); originals under {}",
                report.changed_files.len(),
                dir.display()
            ));
        }
    }
    Ok(())
}
