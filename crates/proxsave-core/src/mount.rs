use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::cancel::CancelToken;
use crate::env::{run_checked, CmdSpec, CommandRunner};
use crate::error::Result;

const MOUNT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct MountEntry {
    pub source: String,
    pub mountpoint: PathBuf,
    pub fstype: String,
}

/// Snapshot of the kernel mount table.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    pub fn load() -> Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string("/proc/mounts")?))
    }

    pub fn parse(text: &str) -> Self {
        let mut entries = Vec::new();
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            let (Some(source), Some(mountpoint), Some(fstype)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            entries.push(MountEntry {
                source: source.to_string(),
                mountpoint: PathBuf::from(unescape_mount_path(mountpoint)),
                fstype: fstype.to_string(),
            });
        }
        Self { entries }
    }

    pub fn is_mountpoint(&self, path: &Path) -> bool {
        self.entries.iter().any(|e| e.mountpoint == path)
    }

    /// The mount a path lives on: the entry with the longest mountpoint
    /// prefix of `path`.
    pub fn mount_of(&self, path: &Path) -> Option<&MountEntry> {
        self.entries
            .iter()
            .filter(|e| path.starts_with(&e.mountpoint))
            .max_by_key(|e| e.mountpoint.as_os_str().len())
    }

    /// True when `path` is backed by the root filesystem rather than a
    /// mount of its own.
    pub fn is_on_root_fs(&self, path: &Path) -> bool {
        self.mount_of(path)
            .map(|e| e.mountpoint == Path::new("/"))
            .unwrap_or(true)
    }

    /// pmxcfs check used by the access-control applier.
    pub fn pmxcfs_mounted(&self) -> bool {
        self.is_mountpoint(Path::new("/etc/pve"))
    }
}

/// `/proc/mounts` escapes spaces as `\040` (and tab/newline/backslash
/// alike).
fn unescape_mount_path(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut bytes = raw.bytes().peekable();
    while let Some(b) = bytes.next() {
        if b == b'\\' {
            let digits: Vec<u8> = bytes.clone().take(3).collect();
            if digits.len() == 3 && digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = (digits[0] - b'0') * 64 + (digits[1] - b'0') * 8 + (digits[2] - b'0');
                out.push(value as char);
                for _ in 0..3 {
                    bytes.next();
                }
                continue;
            }
        }
        out.push(b as char);
    }
    out
}

/// Mountpoints listed in fstab, for the "should this path be a mount?"
/// question.
pub fn parse_fstab_mountpoints(text: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let mut fields = trimmed.split_whitespace();
        let (Some(_source), Some(mountpoint)) = (fields.next(), fields.next()) else {
            continue;
        };
        if mountpoint == "none" || !mountpoint.starts_with('/') {
            continue;
        }
        out.push(PathBuf::from(unescape_mount_path(mountpoint)));
    }
    out
}

/// The fstab mountpoint that should carry `path`, longest match wins.
pub fn longest_fstab_parent<'a>(mountpoints: &'a [PathBuf], path: &Path) -> Option<&'a PathBuf> {
    mountpoints
        .iter()
        .filter(|mp| mp.as_path() != Path::new("/") && path.starts_with(mp))
        .max_by_key(|mp| mp.as_os_str().len())
}

#[derive(Debug, Default)]
pub struct GuardReport {
    pub mounted: u64,
    pub guarded: u64,
    pub warnings: u64,
}

/// Protect staged datastore paths before `datastore.cfg` is written.
///
/// A path that fstab says should be its own mount gets a mount attempt;
/// on success the datastore directory is made immutable so writes against
/// a future unmounted target fail visibly. A mountpoint that stays
/// unmounted is overlaid with a read-only bind mount of an empty sentinel
/// directory. Every failure here is a warning — guarding never aborts the
/// restore. Already-mounted targets are left untouched.
pub fn guard_datastore_paths(
    runner: &dyn CommandRunner,
    cancel: &CancelToken,
    mounts: &MountTable,
    fstab_mountpoints: &[PathBuf],
    guard_base: &Path,
    datastore_paths: &[PathBuf],
) -> Result<GuardReport> {
    let mut report = GuardReport::default();

    for path in datastore_paths {
        cancel.check()?;

        if !mounts.is_on_root_fs(path) {
            // Already on its own mount; nothing to do.
            continue;
        }
        let Some(mountpoint) = longest_fstab_parent(fstab_mountpoints, path) else {
            continue;
        };
        if mounts.is_mountpoint(mountpoint) {
            continue;
        }

        let mount_cmd = CmdSpec::new("mount").arg(mountpoint.to_string_lossy());
        match run_checked(runner, &mount_cmd, MOUNT_TIMEOUT, cancel) {
            Ok(_) => {
                report.mounted += 1;
                let chattr = CmdSpec::new("chattr").arg("+i").arg(path.to_string_lossy());
                if let Err(e) = run_checked(runner, &chattr, MOUNT_TIMEOUT, cancel) {
                    report.warnings += 1;
                    tracing::warn!("chattr +i on {} failed: {e}", path.display());
                }
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                report.warnings += 1;
                tracing::warn!(
                    "could not mount {} for datastore {}: {e}",
                    mountpoint.display(),
                    path.display()
                );
                match guard_mountpoint(runner, cancel, guard_base, mountpoint) {
                    Ok(()) => report.guarded += 1,
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        report.warnings += 1;
                        tracing::warn!("guard of {} failed: {e}", mountpoint.display());
                    }
                }
            }
        }
    }

    Ok(report)
}

/// Bind an empty sentinel directory read-only over an unmounted
/// mountpoint so stray writes fail instead of filling the root fs.
fn guard_mountpoint(
    runner: &dyn CommandRunner,
    cancel: &CancelToken,
    guard_base: &Path,
    mountpoint: &Path,
) -> Result<()> {
    let sentinel = guard_base.join(guard_dir_name(mountpoint));
    std::fs::create_dir_all(&sentinel)?;

    let bind = CmdSpec::new("mount")
        .arg("--bind")
        .arg(sentinel.to_string_lossy())
        .arg(mountpoint.to_string_lossy());
    run_checked(runner, &bind, MOUNT_TIMEOUT, cancel)?;

    let remount = CmdSpec::new("mount")
        .arg("-o")
        .arg("remount,ro,bind")
        .arg(mountpoint.to_string_lossy());
    run_checked(runner, &remount, MOUNT_TIMEOUT, cancel)?;
    Ok(())
}

/// `<basename>-<hex8(sha256(target))>` keeps sentinel names readable and
/// collision-free for distinct targets with equal basenames.
pub fn guard_dir_name(target: &Path) -> String {
    let digest = Sha256::digest(target.to_string_lossy().as_bytes());
    let basename = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());
    format!("{basename}-{}", &hex::encode(digest)[..8])
}
