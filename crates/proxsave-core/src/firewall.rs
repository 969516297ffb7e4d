use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::cancel::CancelToken;
use crate::env::{run_checked, CmdSpec, Env};
use crate::error::{FirewallNotCommitted, RestoreError, Result};
use crate::platform::fs as pfs;
use crate::safety;

/// Prefix of the firewall-only safety archive.
pub const FIREWALL_BACKUP_PREFIX: &str = "firewall_backup";

/// Archive-relative paths covered by the firewall stage.
pub const FIREWALL_PATHS: &[&str] = &["./etc/pve/firewall/", "./etc/pve/nodes/*/host.fw"];

const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// State of an armed dead-man switch. The armed condition is the presence
/// of the marker file (plus, when available, the transient timer unit).
#[derive(Debug, Clone)]
pub struct FirewallRollbackHandle {
    pub marker_path: PathBuf,
    pub log_path: PathBuf,
    pub script_path: PathBuf,
    pub unit_name: Option<String>,
    pub armed_at: SystemTime,
    pub timeout: Duration,
    pub work_dir: PathBuf,
}

impl FirewallRollbackHandle {
    pub fn deadline(&self) -> SystemTime {
        self.armed_at + self.timeout
    }

    pub fn remaining(&self, now: SystemTime) -> Duration {
        self.deadline()
            .duration_since(now)
            .unwrap_or(Duration::ZERO)
    }
}

/// Write the marker, compose the rollback script, and schedule it: via a
/// transient timer unit when `systemd-run` works, otherwise via a
/// detached `sleep`-and-run shell.
pub fn arm_rollback(
    env: &Env,
    cancel: &CancelToken,
    safety_archive: &Path,
    timeout: Duration,
) -> Result<FirewallRollbackHandle> {
    let stamp = env.timestamp();
    let work_dir = env.tmp_dir.join(format!("fw_rollback_{stamp}"));
    std::fs::create_dir_all(&work_dir)?;

    let marker_path = work_dir.join("rollback_pending");
    let log_path = work_dir.join("rollback.log");
    let script_path = work_dir.join("rollback.sh");

    std::fs::write(&marker_path, b"pending\n")?;

    let script = format!(
        "#!/bin/sh\n\
         if [ -f '{marker}' ]; then\n\
         \techo \"firewall rollback fired: $(date)\" >> '{log}'\n\
         \ttar -xzf '{archive}' -C / >> '{log}' 2>&1\n\
         \trm -f '{marker}'\n\
         \tsystemctl restart pve-firewall >> '{log}' 2>&1\n\
         fi\n",
        marker = marker_path.display(),
        log = log_path.display(),
        archive = safety_archive.display(),
    );
    let mut file = std::fs::File::create(&script_path)?;
    file.write_all(script.as_bytes())?;
    drop(file);
    let _ = pfs::apply_mode(&script_path, 0o700);

    let armed_at = env.clock.now();
    let unit_name = format!("proxsave-fw-rollback-{stamp}");
    let seconds = timeout.as_secs().max(1);

    let transient = CmdSpec::new("systemd-run")
        .arg(format!("--unit={unit_name}"))
        .arg(format!("--on-active={seconds}"))
        .arg("sh")
        .arg(script_path.to_string_lossy());
    let unit_name = match run_checked(env.runner.as_ref(), &transient, TOOL_TIMEOUT, cancel) {
        Ok(_) => Some(unit_name),
        Err(e) if e.is_cancelled() => return Err(e),
        Err(e) => {
            tracing::warn!("transient timer unavailable ({e}); falling back to detached shell");
            let fallback = CmdSpec::new("sh").arg("-c").arg(format!(
                "nohup sh -c 'sleep {seconds}; sh {}' >/dev/null 2>&1 &",
                script_path.display()
            ));
            run_checked(env.runner.as_ref(), &fallback, TOOL_TIMEOUT, cancel)?;
            None
        }
    };

    tracing::info!(
        "firewall rollback armed: fires in {seconds}s unless committed (marker: {})",
        marker_path.display()
    );

    Ok(FirewallRollbackHandle {
        marker_path,
        log_path,
        script_path,
        unit_name,
        armed_at,
        timeout,
        work_dir,
    })
}

/// Disarm: remove the marker, stop the transient timer and service, and
/// clear any unit failure state.
pub fn commit(env: &Env, cancel: &CancelToken, handle: &FirewallRollbackHandle) -> Result<()> {
    match std::fs::remove_file(&handle.marker_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    if let Some(unit) = &handle.unit_name {
        for suffix in [".timer", ".service"] {
            let stop = CmdSpec::new("systemctl").arg("stop").arg(format!("{unit}{suffix}"));
            let _ = env.runner.run(&stop, TOOL_TIMEOUT, cancel);
            let reset = CmdSpec::new("systemctl")
                .arg("reset-failed")
                .arg(format!("{unit}{suffix}"));
            let _ = env.runner.run(&reset, TOOL_TIMEOUT, cancel);
        }
    }
    Ok(())
}

fn not_committed(handle: &FirewallRollbackHandle) -> RestoreError {
    RestoreError::FirewallNotCommitted(Box::new(FirewallNotCommitted {
        rollback_armed: true,
        marker_path: handle.marker_path.clone(),
        log_path: handle.log_path.clone(),
        deadline: handle.deadline(),
    }))
}

#[derive(Debug, Clone, Copy)]
pub struct FirewallApplyOptions<'a> {
    pub stage_root: &'a Path,
    /// `/` in production; a fake root in tests.
    pub live_root: &'a Path,
    /// Rollback window.
    pub timeout: Duration,
}

/// The guarded firewall flow: safety backup, consent, arm, exact sync,
/// service restart, then commit-or-rollback. Returns `false` when the
/// operator declined to apply at all.
pub fn guarded_apply(
    env: &Env,
    cancel: &CancelToken,
    opts: &FirewallApplyOptions<'_>,
) -> Result<bool> {
    cancel.check()?;

    let paths: Vec<String> = FIREWALL_PATHS.iter().map(|p| p.to_string()).collect();
    let backup = safety::create(
        env.clock.as_ref(),
        &env.tmp_dir,
        opts.live_root,
        &paths,
        FIREWALL_BACKUP_PREFIX,
    )?;

    if !env.ui.confirm(
        "Apply the restored firewall configuration now? A rollback timer will guard the change.",
        false,
    )? {
        env.ui.notice("Firewall apply skipped.");
        return Ok(false);
    }

    let handle = arm_rollback(env, cancel, &backup.archive_path, opts.timeout)?;

    let stage_fw = opts.stage_root.join("etc/pve/firewall");
    if stage_fw.is_dir() {
        let stats = sync_dir_exact(&stage_fw, &opts.live_root.join("etc/pve/firewall"))?;
        tracing::info!(
            "firewall rules synced: {} created, {} updated, {} pruned",
            stats.created,
            stats.updated,
            stats.pruned
        );
    }
    sync_host_rules(opts.stage_root, opts.live_root)?;

    let restart = CmdSpec::new("systemctl").arg("restart").arg("pve-firewall");
    if let Err(e) = run_checked(env.runner.as_ref(), &restart, TOOL_TIMEOUT, cancel) {
        if e.is_cancelled() {
            return Err(e);
        }
        tracing::warn!("pve-firewall restart failed: {e}");
    }

    // A commit prompt after the window has lapsed is pointless: the timer
    // has already fired (or is about to); report the typed error instead.
    if handle.remaining(env.clock.now()) == Duration::ZERO {
        return Err(not_committed(&handle));
    }

    if env.ui.confirm("Commit the applied firewall configuration?", false)? {
        commit(env, cancel, &handle)?;
        env.ui.notice("Firewall configuration committed; rollback disarmed.");
        Ok(true)
    } else {
        env.ui.notice(&format!(
            "Commit declined: the rollback timer will restore the previous rules. \
             Manual restore: tar -xzf {} -C / (log: {})",
            backup.archive_path.display(),
            handle.log_path.display()
        ));
        Err(not_committed(&handle))
    }
}

/// Copy per-node `host.fw` files from the stage into the live tree.
fn sync_host_rules(stage_root: &Path, live_root: &Path) -> Result<()> {
    let nodes = stage_root.join("etc/pve/nodes");
    let Ok(entries) = std::fs::read_dir(&nodes) else {
        return Ok(());
    };
    for entry in entries.flatten() {
        let host_fw = entry.path().join("host.fw");
        if !host_fw.is_file() {
            continue;
        }
        let rel = entry.file_name();
        let dest_dir = live_root.join("etc/pve/nodes").join(&rel);
        std::fs::create_dir_all(&dest_dir)?;
        std::fs::copy(&host_fw, dest_dir.join("host.fw"))?;
    }
    Ok(())
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub created: u64,
    pub updated: u64,
    pub pruned: u64,
}

/// Make `dst` an exact file-level mirror of `src`: create missing files,
/// overwrite mismatched ones, keep directory structure, and prune files
/// the stage no longer has.
pub fn sync_dir_exact(src: &Path, dst: &Path) -> Result<SyncStats> {
    let mut stats = SyncStats::default();
    std::fs::create_dir_all(dst)?;

    for entry in walkdir::WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| RestoreError::Other(format!("walk failed: {e}")))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|_| RestoreError::Other("walk escaped source".to_string()))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dest = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let src_bytes = std::fs::read(entry.path())?;
        match std::fs::read(&dest) {
            Ok(dst_bytes) if dst_bytes == src_bytes => {}
            Ok(_) => {
                std::fs::write(&dest, &src_bytes)?;
                stats.updated += 1;
            }
            Err(_) => {
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&dest, &src_bytes)?;
                stats.created += 1;
            }
        }
    }

    // Prune destination files the stage does not carry.
    let mut to_remove = Vec::new();
    for entry in walkdir::WalkDir::new(dst).follow_links(false) {
        let entry = entry.map_err(|e| RestoreError::Other(format!("walk failed: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dst)
            .map_err(|_| RestoreError::Other("walk escaped destination".to_string()))?;
        if !src.join(rel).is_file() {
            to_remove.push(entry.path().to_path_buf());
        }
    }
    for path in to_remove {
        std::fs::remove_file(&path)?;
        stats.pruned += 1;
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FixedClock, ScriptedRunner, ScriptedUi};
    use std::sync::Arc;

    fn test_env(
        dir: &Path,
        runner: Arc<ScriptedRunner>,
        ui: Arc<ScriptedUi>,
        now_unix: u64,
    ) -> Env {
        Env {
            clock: Arc::new(FixedClock::at_unix(now_unix)),
            runner,
            ui,
            tmp_dir: dir.join("tmp"),
        }
    }

    fn seed_live(root: &Path) {
        std::fs::create_dir_all(root.join("etc/pve/firewall")).unwrap();
        std::fs::write(root.join("etc/pve/firewall/cluster.fw"), b"[OPTIONS]\nenable: 1\n")
            .unwrap();
    }

    fn seed_stage(root: &Path) {
        std::fs::create_dir_all(root.join("etc/pve/firewall")).unwrap();
        std::fs::write(root.join("etc/pve/firewall/cluster.fw"), b"[OPTIONS]\nenable: 0\n")
            .unwrap();
        std::fs::create_dir_all(root.join("etc/pve/nodes/node1")).unwrap();
        std::fs::write(root.join("etc/pve/nodes/node1/host.fw"), b"[RULES]\n").unwrap();
    }

    #[test]
    fn sync_dir_exact_creates_updates_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::create_dir_all(&dst).unwrap();
        std::fs::write(src.join("new.fw"), b"new").unwrap();
        std::fs::write(src.join("sub/changed.fw"), b"after").unwrap();
        std::fs::create_dir_all(dst.join("sub")).unwrap();
        std::fs::write(dst.join("sub/changed.fw"), b"before").unwrap();
        std::fs::write(dst.join("stale.fw"), b"gone").unwrap();

        let stats = sync_dir_exact(&src, &dst).unwrap();
        assert_eq!(
            stats,
            SyncStats {
                created: 1,
                updated: 1,
                pruned: 1
            }
        );
        assert_eq!(std::fs::read(dst.join("new.fw")).unwrap(), b"new");
        assert_eq!(std::fs::read(dst.join("sub/changed.fw")).unwrap(), b"after");
        assert!(!dst.join("stale.fw").exists());
    }

    #[test]
    fn declined_commit_leaves_marker_and_returns_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("live");
        let stage = dir.path().join("stage");
        seed_live(&live);
        seed_stage(&stage);

        let runner = Arc::new(ScriptedRunner::new());
        // Consent to apply, decline the commit.
        let ui = Arc::new(ScriptedUi::with_confirms(&[true, false]));
        let env = test_env(dir.path(), runner.clone(), ui, 1_700_000_000);

        let opts = FirewallApplyOptions {
            stage_root: &stage,
            live_root: &live,
            timeout: Duration::from_secs(600),
        };
        let err = guarded_apply(&env, &CancelToken::new(), &opts).unwrap_err();

        let RestoreError::FirewallNotCommitted(details) = err else {
            panic!("expected the typed firewall error");
        };
        assert!(details.rollback_armed);
        assert!(details.marker_path.exists());
        assert_eq!(
            details.deadline,
            SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + 600)
        );
        // The staged rules were applied before the decline.
        assert_eq!(
            std::fs::read(live.join("etc/pve/firewall/cluster.fw")).unwrap(),
            b"[OPTIONS]\nenable: 0\n"
        );
        assert_eq!(
            std::fs::read(live.join("etc/pve/nodes/node1/host.fw")).unwrap(),
            b"[RULES]\n"
        );
    }

    #[test]
    fn committed_apply_disarms_marker_and_timer() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("live");
        let stage = dir.path().join("stage");
        seed_live(&live);
        seed_stage(&stage);

        let runner = Arc::new(ScriptedRunner::new());
        let ui = Arc::new(ScriptedUi::with_confirms(&[true, true]));
        let env = test_env(dir.path(), runner.clone(), ui, 1_700_000_000);

        let opts = FirewallApplyOptions {
            stage_root: &stage,
            live_root: &live,
            timeout: Duration::from_secs(600),
        };
        assert!(guarded_apply(&env, &CancelToken::new(), &opts).unwrap());

        // Marker gone, transient unit torn down.
        let markers: Vec<_> = walkdir::WalkDir::new(env.tmp_dir.clone())
            .into_iter()
            .flatten()
            .filter(|e| e.file_name() == "rollback_pending")
            .collect();
        assert!(markers.is_empty());
        assert_eq!(runner.call_count("systemd-run"), 1);
        // Both the transient timer and its service are stopped.
        assert_eq!(runner.call_count("systemctl stop proxsave-fw-rollback-"), 2);
        assert_eq!(runner.call_count("restart pve-firewall"), 1);
    }

    #[test]
    fn declined_apply_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("live");
        let stage = dir.path().join("stage");
        seed_live(&live);
        seed_stage(&stage);

        let runner = Arc::new(ScriptedRunner::new());
        let ui = Arc::new(ScriptedUi::with_confirms(&[false]));
        let env = test_env(dir.path(), runner.clone(), ui, 1_700_000_000);

        let opts = FirewallApplyOptions {
            stage_root: &stage,
            live_root: &live,
            timeout: Duration::from_secs(600),
        };
        assert!(!guarded_apply(&env, &CancelToken::new(), &opts).unwrap());
        // Live rules untouched, nothing armed.
        assert_eq!(
            std::fs::read(live.join("etc/pve/firewall/cluster.fw")).unwrap(),
            b"[OPTIONS]\nenable: 1\n"
        );
        assert_eq!(runner.call_count("systemd-run"), 0);
    }

    #[test]
    fn expired_window_suppresses_commit_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("live");
        let stage = dir.path().join("stage");
        seed_live(&live);
        seed_stage(&stage);

        let runner = Arc::new(ScriptedRunner::new());
        // Only the apply consent is scripted; a commit prompt would pull
        // the fallback and commit, failing the assertion below.
        let ui = Arc::new(ScriptedUi::with_confirms(&[true]));
        let env = test_env(dir.path(), runner.clone(), ui, 1_700_000_000);

        let opts = FirewallApplyOptions {
            stage_root: &stage,
            live_root: &live,
            timeout: Duration::ZERO,
        };
        let err = guarded_apply(&env, &CancelToken::new(), &opts).unwrap_err();
        let RestoreError::FirewallNotCommitted(details) = err else {
            panic!("expected the typed firewall error");
        };
        assert!(details.marker_path.exists());
    }

    #[test]
    fn arm_falls_back_to_detached_shell() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new().fail_on("systemd-run", 127, "not found"));
        let ui = Arc::new(ScriptedUi::accepting());
        let env = test_env(dir.path(), runner.clone(), ui, 1_700_000_000);

        let archive = dir.path().join("fw.tar.gz");
        std::fs::write(&archive, b"").unwrap();
        let handle =
            arm_rollback(&env, &CancelToken::new(), &archive, Duration::from_secs(120)).unwrap();

        assert!(handle.unit_name.is_none());
        assert!(handle.marker_path.exists());
        assert_eq!(runner.call_count("nohup"), 1);

        let script = std::fs::read_to_string(&handle.script_path).unwrap();
        assert!(script.contains("tar -xzf"));
        assert!(script.contains("rollback_pending"));
    }

    #[test]
    fn remaining_clamps_at_zero() {
        let handle = FirewallRollbackHandle {
            marker_path: PathBuf::from("/tmp/m"),
            log_path: PathBuf::from("/tmp/l"),
            script_path: PathBuf::from("/tmp/s"),
            unit_name: None,
            armed_at: SystemTime::UNIX_EPOCH,
            timeout: Duration::from_secs(10),
            work_dir: PathBuf::from("/tmp"),
        };
        assert_eq!(
            handle.remaining(SystemTime::UNIX_EPOCH + Duration::from_secs(4)),
            Duration::from_secs(6)
        );
        assert_eq!(
            handle.remaining(SystemTime::UNIX_EPOCH + Duration::from_secs(100)),
            Duration::ZERO
        );
    }
}
