use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::category;
use crate::env::{format_timestamp, Clock};
use crate::error::{RestoreError, Result};
use crate::fsglob;
use crate::platform::fs as pfs;
use crate::sandbox;

/// File-name prefix of the pre-mutation snapshot archives.
pub const SAFETY_PREFIX: &str = "restore_backup";

/// Records where the most recent safety backup landed so the operator can
/// find the rollback archive after a crashed run.
pub const LOCATION_FILE: &str = "restore_backup_location.txt";

#[derive(Debug, Clone)]
pub struct SafetyBackupResult {
    pub archive_path: PathBuf,
    pub files_backed_up: u64,
    pub total_size: u64,
    pub timestamp: String,
}

impl SafetyBackupResult {
    /// The manual rollback command surfaced in error messages.
    pub fn rollback_hint(&self) -> String {
        format!("tar -xzf {} -C /", self.archive_path.display())
    }
}

#[derive(Debug, Default)]
pub struct SafetyRestoreCounts {
    pub restored: u64,
    pub skipped: u64,
}

/// Snapshot every path a selection references into a timestamped tar.gz
/// under `tmp_dir`. Entry names are relative to `dest_root`; directories
/// carry a trailing `/`, symlinks store their target verbatim.
pub fn create(
    clock: &dyn Clock,
    tmp_dir: &Path,
    dest_root: &Path,
    archive_paths: &[String],
    prefix: &str,
) -> Result<SafetyBackupResult> {
    std::fs::create_dir_all(tmp_dir)?;
    let timestamp = format_timestamp(clock.now());
    let archive_path = tmp_dir.join(format!("{prefix}_{timestamp}.tar.gz"));

    let file = std::fs::File::create(&archive_path)?;
    let encoder = GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut files_backed_up = 0u64;
    let mut total_size = 0u64;

    for pattern in archive_paths {
        let rel = category::normalize_archive_path(pattern);
        let rel = rel.trim_start_matches("./").trim_end_matches('/');
        if rel.is_empty() {
            continue;
        }

        let candidates = if fsglob::has_glob_chars(rel) {
            fsglob::expand(dest_root, rel)
        } else {
            vec![dest_root.join(rel)]
        };

        for candidate in candidates {
            let meta = match std::fs::symlink_metadata(&candidate) {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if meta.is_dir() {
                for entry in walkdir::WalkDir::new(&candidate).follow_links(false) {
                    let entry = match entry {
                        Ok(entry) => entry,
                        Err(e) => {
                            tracing::warn!("safety backup: cannot walk {candidate:?}: {e}");
                            continue;
                        }
                    };
                    match append_entry(&mut builder, dest_root, entry.path()) {
                        Ok(Some(size)) => {
                            files_backed_up += 1;
                            total_size += size;
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!(
                            "safety backup: skipping {}: {e}",
                            entry.path().display()
                        ),
                    }
                }
            } else {
                match append_entry(&mut builder, dest_root, &candidate) {
                    Ok(Some(size)) => {
                        files_backed_up += 1;
                        total_size += size;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!("safety backup: skipping {}: {e}", candidate.display())
                    }
                }
            }
        }
    }

    builder.into_inner()?.finish()?;

    if prefix == SAFETY_PREFIX {
        let location = tmp_dir.join(LOCATION_FILE);
        let mut f = std::fs::File::create(location)?;
        writeln!(f, "{}", archive_path.display())?;
    }

    tracing::info!(
        "safety backup created: {} ({files_backed_up} files, {total_size} bytes)",
        archive_path.display()
    );

    Ok(SafetyBackupResult {
        archive_path,
        files_backed_up,
        total_size,
        timestamp,
    })
}

/// Append one filesystem object. Returns `Some(size)` for regular files
/// so the caller can account totals.
fn append_entry<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    dest_root: &Path,
    path: &Path,
) -> Result<Option<u64>> {
    let rel = path
        .strip_prefix(dest_root)
        .map_err(|_| RestoreError::Other(format!("{} is outside {:?}", path.display(), dest_root)))?
        .to_string_lossy()
        .replace('\\', "/");
    if rel.is_empty() {
        return Ok(None);
    }

    let meta = std::fs::symlink_metadata(path)?;
    let mut header = tar::Header::new_gnu();

    if meta.is_dir() {
        header.set_metadata(&meta);
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        builder.append_data(&mut header, format!("{rel}/"), std::io::empty())?;
        Ok(None)
    } else if meta.file_type().is_symlink() {
        let target = std::fs::read_link(path)?;
        header.set_metadata(&meta);
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        // Preserve the link target text unchanged, absolute or not; the
        // restorer validates it. Overlong targets fall back to the
        // extension-based writer.
        if header
            .set_link_name_literal(std::os::unix::ffi::OsStrExt::as_bytes(target.as_os_str()))
            .is_ok()
        {
            builder.append_data(&mut header, rel, std::io::empty())?;
        } else {
            builder.append_link(&mut header, rel, &target)?;
        }
        Ok(None)
    } else if meta.is_file() {
        let mut file = std::fs::File::open(path)?;
        header.set_metadata(&meta);
        builder.append_data(&mut header, rel, &mut file)?;
        Ok(Some(meta.len()))
    } else {
        // Sockets, fifos, devices: not part of configuration state.
        Ok(None)
    }
}

/// Replay a safety archive onto `dest_root`. Per-file failures are logged
/// and skipped; an unreadable archive or a failure to create the
/// destination root aborts. Pre-existing files are overwritten.
pub fn restore(archive_path: &Path, dest_root: &Path) -> Result<SafetyRestoreCounts> {
    let file = std::fs::File::open(archive_path).map_err(|e| {
        RestoreError::InvalidArchive(format!(
            "cannot open safety backup {}: {e}",
            archive_path.display()
        ))
    })?;
    std::fs::create_dir_all(dest_root)?;

    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut counts = SafetyRestoreCounts::default();

    for entry in archive.entries().map_err(|e| {
        RestoreError::InvalidArchive(format!("unreadable safety backup: {e}"))
    })? {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                return Err(RestoreError::InvalidArchive(format!(
                    "corrupt safety backup entry: {e}"
                )))
            }
        };

        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let target = match sandbox::sanitize_archive_entry_name(dest_root, &name) {
            Ok(target) => target,
            Err(e) => {
                tracing::warn!("safety restore: rejecting '{name}': {e}");
                counts.skipped += 1;
                continue;
            }
        };

        let result = restore_one(&mut entry, dest_root, &target);
        match result {
            Ok(true) => counts.restored += 1,
            Ok(false) => counts.skipped += 1,
            Err(e) => {
                tracing::warn!("safety restore: failed on '{name}': {e}");
                counts.skipped += 1;
            }
        }
    }

    Ok(counts)
}

fn restore_one<R: std::io::Read>(
    entry: &mut tar::Entry<'_, R>,
    dest_root: &Path,
    target: &Path,
) -> Result<bool> {
    let header = entry.header();
    let mode = header.mode().unwrap_or(0o644);
    let mtime = header.mtime().unwrap_or(0) as i64;

    match header.entry_type() {
        tar::EntryType::Directory => {
            std::fs::create_dir_all(target)?;
            let _ = pfs::apply_mode(target, mode);
            Ok(true)
        }
        tar::EntryType::Symlink => {
            let linkname = entry
                .link_name()?
                .ok_or_else(|| RestoreError::InvalidArchive("symlink without target".into()))?
                .to_string_lossy()
                .into_owned();
            sandbox::extract_symlink(dest_root, target, &linkname)?;
            Ok(true)
        }
        tar::EntryType::Regular | tar::EntryType::Continuous | tar::EntryType::GNUSparse => {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let _ = std::fs::remove_file(target);
            let mut out = std::fs::File::create(target)?;
            std::io::copy(entry, &mut out)?;
            drop(out);
            let _ = pfs::apply_mode(target, mode);
            let _ = pfs::set_file_times(target, None, mtime.saturating_mul(1_000_000_000));
            Ok(true)
        }
        other => {
            tracing::debug!("safety restore: skipping entry type {other:?}");
            Ok(false)
        }
    }
}

/// Drop `restore_backup_*` archives in `tmp_dir` older than `max_age`.
pub fn purge_older_than(clock: &dyn Clock, tmp_dir: &Path, max_age: Duration) -> Result<u64> {
    let now = clock.now();
    let mut removed = 0u64;

    let entries = match std::fs::read_dir(tmp_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(0),
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(SAFETY_PREFIX) || !name.ends_with(".tar.gz") {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        let Ok(modified) = meta.modified() else {
            continue;
        };
        let expired = now
            .duration_since(modified)
            .map(|age| age > max_age)
            .unwrap_or(false);
        if expired {
            if std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::SystemClock;

    fn write(path: &Path, data: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    #[test]
    fn round_trip_preserves_files_and_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let src_root = dir.path().join("src");
        write(&src_root.join("etc/app/config.txt"), b"config-data");
        write(&src_root.join("etc/app/deep/state.bin"), &[0u8, 1, 2, 3]);
        pfs::create_symlink(Path::new("config.txt"), &src_root.join("etc/app/alias")).unwrap();

        let tmp = dir.path().join("tmp");
        let result = create(
            &SystemClock,
            &tmp,
            &src_root,
            &["./etc/app/".to_string()],
            SAFETY_PREFIX,
        )
        .unwrap();
        assert_eq!(result.files_backed_up, 2);
        assert!(result.archive_path.exists());

        // The location file names the archive.
        let location = std::fs::read_to_string(tmp.join(LOCATION_FILE)).unwrap();
        assert_eq!(
            location.trim(),
            result.archive_path.display().to_string()
        );

        let restored_root = dir.path().join("restored");
        let counts = restore(&result.archive_path, &restored_root).unwrap();
        assert!(counts.restored >= 3);

        assert_eq!(
            std::fs::read(restored_root.join("etc/app/config.txt")).unwrap(),
            b"config-data"
        );
        assert_eq!(
            std::fs::read(restored_root.join("etc/app/deep/state.bin")).unwrap(),
            &[0u8, 1, 2, 3]
        );
        let link = std::fs::read_link(restored_root.join("etc/app/alias")).unwrap();
        assert_eq!(link, Path::new("config.txt"));
    }

    #[test]
    fn glob_paths_are_expanded() {
        let dir = tempfile::tempdir().unwrap();
        let src_root = dir.path().join("src");
        write(&src_root.join("etc/cron.d/job-a"), b"a");
        write(&src_root.join("etc/cron.d/job-b"), b"b");
        write(&src_root.join("etc/cron.d/other"), b"x");

        let result = create(
            &SystemClock,
            &dir.path().join("tmp"),
            &src_root,
            &["./etc/cron.d/job-*".to_string()],
            SAFETY_PREFIX,
        )
        .unwrap();
        assert_eq!(result.files_backed_up, 2);
    }

    #[test]
    fn restore_overwrites_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let src_root = dir.path().join("src");
        write(&src_root.join("etc/one.txt"), b"new-content");

        let result = create(
            &SystemClock,
            &dir.path().join("tmp"),
            &src_root,
            &["./etc/one.txt".to_string()],
            "firewall_backup",
        )
        .unwrap();

        let dest = dir.path().join("dest");
        write(&dest.join("etc/one.txt"), b"stale");
        restore(&result.archive_path, &dest).unwrap();
        assert_eq!(std::fs::read(dest.join("etc/one.txt")).unwrap(), b"new-content");
    }

    #[test]
    fn missing_paths_are_silently_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let result = create(
            &SystemClock,
            &dir.path().join("tmp"),
            dir.path(),
            &["./etc/not-there".to_string()],
            SAFETY_PREFIX,
        )
        .unwrap();
        assert_eq!(result.files_backed_up, 0);
    }

    #[test]
    fn unreadable_archive_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = restore(&dir.path().join("nope.tar.gz"), &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, RestoreError::InvalidArchive(_)));
    }

    #[test]
    fn purge_removes_only_aged_safety_archives() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("restore_backup_20200101_000000.tar.gz");
        let other = dir.path().join("firewall_backup_20200101_000000.tar.gz");
        std::fs::write(&old, b"x").unwrap();
        std::fs::write(&other, b"x").unwrap();

        let removed = purge_older_than(&SystemClock, dir.path(), Duration::ZERO).unwrap();
        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(other.exists());
    }
}
