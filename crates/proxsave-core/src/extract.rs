use std::io::{Read, Write as _};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;

use crate::cancel::CancelToken;
use crate::category::{self, Category, SelectedCategory, SystemType};
use crate::chunked::{self, ChunkAssembler, MAX_CHUNK_METADATA_BYTES};
use crate::env::{format_timestamp, Clock, CmdSpec, CommandRunner};
use crate::error::{RestoreError, Result};
use crate::platform::fs as pfs;
use crate::sandbox;

#[derive(Debug, Clone, Copy)]
pub struct ExtractOptions<'a> {
    /// Filesystem root the archive is written onto.
    pub dest_root: &'a Path,
    /// Selected categories; `None` extracts everything.
    pub selection: Option<&'a [SelectedCategory]>,
    /// Namespaced temp area for the detail log and the chunk spool.
    pub tmp_dir: &'a Path,
}

#[derive(Debug, Default)]
pub struct ExtractStats {
    pub restored: u64,
    pub skipped: u64,
    pub failed: u64,
    pub bytes_written: u64,
    pub log_path: Option<PathBuf>,
}

/// Open `path` and build the decompression reader from its extension.
/// gzip decodes in-process; xz/zstd/bzip2/lzma stream through an external
/// decompressor; a bare `.tar` reads directly.
pub fn open_archive_reader(
    path: &Path,
    runner: &dyn CommandRunner,
) -> Result<Box<dyn Read + Send>> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let file = std::fs::File::open(path)?;

    let external: Option<CmdSpec> = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        return Ok(Box::new(GzDecoder::new(file)));
    } else if name.ends_with(".tar.xz") {
        Some(CmdSpec::new("xz").arg("-dc"))
    } else if name.ends_with(".tar.zst") || name.ends_with(".tar.zstd") {
        Some(CmdSpec::new("zstd").arg("-dc"))
    } else if name.ends_with(".tar.bz2") {
        Some(CmdSpec::new("bzip2").arg("-dc"))
    } else if name.ends_with(".tar.lzma") {
        Some(CmdSpec::new("xz").arg("--format=lzma").arg("-dc"))
    } else if name.ends_with(".tar") {
        return Ok(Box::new(file));
    } else {
        None
    };

    match external {
        Some(spec) => runner.open_stream(&spec, file),
        None => Err(RestoreError::UnsupportedArchive(name)),
    }
}

/// Stream the archive onto `dest_root`, filtering by category, assembling
/// chunked files, and refusing anything that leaves the sandbox. Per-file
/// failures are counted and logged; the run only fails on a broken stream
/// or cancellation.
pub fn extract_archive(
    runner: &dyn CommandRunner,
    clock: &dyn Clock,
    archive_path: &Path,
    opts: &ExtractOptions<'_>,
    cancel: &CancelToken,
) -> Result<ExtractStats> {
    let reader = open_archive_reader(archive_path, runner)?;
    let mut archive = tar::Archive::new(reader);
    archive.set_ignore_zeros(true);

    let timestamp = format_timestamp(clock.now());
    let mut log = RestoreLog::open(opts.tmp_dir, &timestamp);
    let mut assembler = ChunkAssembler::new(opts.tmp_dir.join(format!("chunk_spool_{timestamp}")))?;
    let mut stats = ExtractStats::default();

    for entry in archive
        .entries()
        .map_err(|e| RestoreError::InvalidArchive(format!("unreadable archive: {e}")))?
    {
        cancel.check()?;

        let mut entry = entry.map_err(|e| {
            RestoreError::InvalidArchive(format!("corrupt archive entry: {e}"))
        })?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();

        // Chunk companion entries are routed by their *logical* name so a
        // selected category also selects the pieces of its large files.
        if let Some(logical) = chunked::marker_logical_name(&name) {
            if !selected(opts, &logical) {
                stats.skipped += 1;
                log.skipped(&name, "not selected");
                continue;
            }
            let declared = entry.header().size().unwrap_or(0);
            if declared > MAX_CHUNK_METADATA_BYTES {
                stats.failed += 1;
                log.skipped(&name, "chunk metadata too large");
                continue;
            }
            let mut body = Vec::new();
            if let Err(e) = entry.read_to_end(&mut body) {
                stats.failed += 1;
                log.skipped(&name, &format!("read error: {e}"));
                continue;
            }
            match ChunkAssembler::parse_metadata(&body) {
                Ok(meta) => assembler.note_metadata(logical.clone(), meta),
                Err(e) => {
                    stats.failed += 1;
                    log.skipped(&name, &format!("bad chunk metadata: {e}"));
                    continue;
                }
            }
            try_assemble(&mut assembler, &logical, opts, &mut stats, &mut log);
            continue;
        }

        if let Some((logical, index)) = chunked::chunk_piece_name(&name) {
            if !selected(opts, &logical) {
                stats.skipped += 1;
                log.skipped(&name, "not selected");
                continue;
            }
            if let Err(e) = assembler.note_chunk(logical.clone(), index, &mut entry) {
                stats.failed += 1;
                log.skipped(&name, &format!("chunk spool error: {e}"));
                continue;
            }
            try_assemble(&mut assembler, &logical, opts, &mut stats, &mut log);
            continue;
        }

        if !selected(opts, &name) {
            stats.skipped += 1;
            log.skipped(&name, "not selected");
            continue;
        }

        let target = match sandbox::sanitize_archive_entry_name(opts.dest_root, &name) {
            Ok(target) => target,
            Err(e) => {
                stats.skipped += 1;
                log.skipped(&name, &format!("sandbox: {e}"));
                tracing::warn!("rejecting archive entry '{name}': {e}");
                continue;
            }
        };
        if pmxcfs_guarded(opts.dest_root, &target) {
            stats.skipped += 1;
            log.skipped(&name, "under /etc/pve (owned by pmxcfs)");
            continue;
        }

        match write_entry(&mut entry, opts.dest_root, &target) {
            Ok(Written::File(bytes)) => {
                stats.restored += 1;
                stats.bytes_written += bytes;
                log.restored(&name);
            }
            Ok(Written::Other) => {
                stats.restored += 1;
                log.restored(&name);
            }
            Ok(Written::Skipped(reason)) => {
                stats.skipped += 1;
                log.skipped(&name, reason);
            }
            Err(e) => {
                stats.failed += 1;
                log.skipped(&name, &e.to_string());
                tracing::warn!("failed to extract '{name}': {e}");
            }
        }
    }

    for leftover in assembler.leftovers() {
        stats.failed += 1;
        log.skipped(&leftover, "incomplete chunked file");
        tracing::warn!("chunked file '{leftover}' never completed");
    }

    log.summary(&stats);
    stats.log_path = log.path;
    Ok(stats)
}

/// Single pass over the archive to find which categories have at least one
/// matching entry. Drives the selection UI.
pub fn scan_available_categories(
    runner: &dyn CommandRunner,
    archive_path: &Path,
    system: SystemType,
) -> Result<Vec<&'static Category>> {
    let reader = open_archive_reader(archive_path, runner)?;
    let mut archive = tar::Archive::new(reader);
    archive.set_ignore_zeros(true);

    let candidates = category::available_for(system);
    let mut found = vec![false; candidates.len()];

    for entry in archive
        .entries()
        .map_err(|e| RestoreError::InvalidArchive(format!("unreadable archive: {e}")))?
    {
        let entry = entry.map_err(|e| {
            RestoreError::InvalidArchive(format!("corrupt archive entry: {e}"))
        })?;
        let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let name = chunked::marker_logical_name(&raw)
            .or_else(|| chunked::chunk_piece_name(&raw).map(|(logical, _)| logical))
            .unwrap_or(raw);

        for (idx, cat) in candidates.iter().enumerate() {
            if !found[idx] && cat.paths.iter().any(|p| category::pattern_matches(&name, p)) {
                found[idx] = true;
            }
        }
        if found.iter().all(|f| *f) {
            break;
        }
    }

    Ok(candidates
        .into_iter()
        .zip(found)
        .filter_map(|(cat, hit)| hit.then_some(cat))
        .collect())
}

fn selected(opts: &ExtractOptions<'_>, name: &str) -> bool {
    match opts.selection {
        Some(selection) => category::matches_any(name, selection),
        None => true,
    }
}

/// When the destination root is `/`, nothing may be written under
/// `/etc/pve` — the host's pmxcfs owns that path.
fn pmxcfs_guarded(dest_root: &Path, target: &Path) -> bool {
    dest_root == Path::new("/") && target.starts_with("/etc/pve")
}

enum Written {
    File(u64),
    Other,
    Skipped(&'static str),
}

fn write_entry<R: Read>(
    entry: &mut tar::Entry<'_, R>,
    dest_root: &Path,
    target: &Path,
) -> Result<Written> {
    let header = entry.header();
    let mode = header.mode().unwrap_or(0o644);
    let uid = header.uid().unwrap_or(0) as u32;
    let gid = header.gid().unwrap_or(0) as u32;
    let mtime = header.mtime().unwrap_or(0) as i64;
    let entry_type = header.entry_type();

    match entry_type {
        tar::EntryType::Directory => {
            std::fs::create_dir_all(target)?;
            apply_attrs(target, mode, uid, gid, mtime);
            Ok(Written::Other)
        }
        tar::EntryType::Regular | tar::EntryType::Continuous | tar::EntryType::GNUSparse => {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let _ = std::fs::remove_file(target);
            let mut out = std::fs::File::create(target)?;
            let bytes = std::io::copy(entry, &mut out)?;
            out.flush()?;
            drop(out);
            apply_attrs(target, mode, uid, gid, mtime);
            Ok(Written::File(bytes))
        }
        tar::EntryType::Symlink => {
            let linkname = entry
                .link_name()?
                .ok_or_else(|| RestoreError::InvalidArchive("symlink without target".into()))?
                .to_string_lossy()
                .into_owned();
            sandbox::extract_symlink(dest_root, target, &linkname)?;
            Ok(Written::Other)
        }
        tar::EntryType::Link => {
            let linkname = entry
                .link_name()?
                .ok_or_else(|| RestoreError::InvalidArchive("hardlink without target".into()))?
                .to_string_lossy()
                .into_owned();
            if Path::new(&linkname).is_absolute() {
                return Err(RestoreError::Sandbox(format!(
                    "hardlink with absolute target '{linkname}'"
                )));
            }
            let source = sandbox::resolve_within(dest_root, Path::new(&linkname))?;
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let _ = std::fs::remove_file(target);
            std::fs::hard_link(&source, target)?;
            Ok(Written::Other)
        }
        _ => Ok(Written::Skipped("unsupported entry type")),
    }
}

fn apply_attrs(target: &Path, mode: u32, uid: u32, gid: u32, mtime: i64) {
    let _ = pfs::apply_mode(target, mode);
    if let Err(e) = pfs::apply_owner(target, uid, gid) {
        tracing::debug!("keeping current ownership on {}: {e}", target.display());
    }
    let _ = pfs::set_file_times(target, None, mtime.saturating_mul(1_000_000_000));
}

fn try_assemble(
    assembler: &mut ChunkAssembler,
    logical: &str,
    opts: &ExtractOptions<'_>,
    stats: &mut ExtractStats,
    log: &mut RestoreLog,
) {
    if !assembler.ready(logical) {
        return;
    }
    let target = match sandbox::sanitize_archive_entry_name(opts.dest_root, logical) {
        Ok(target) => target,
        Err(e) => {
            stats.failed += 1;
            log.skipped(logical, &format!("sandbox: {e}"));
            return;
        }
    };
    if pmxcfs_guarded(opts.dest_root, &target) {
        stats.skipped += 1;
        log.skipped(logical, "under /etc/pve (owned by pmxcfs)");
        return;
    }
    match assembler.assemble(logical, &target) {
        Ok(bytes) => {
            stats.restored += 1;
            stats.bytes_written += bytes;
            log.restored(logical);
        }
        Err(e) => {
            stats.failed += 1;
            log.skipped(logical, &e.to_string());
            tracing::warn!("chunked file '{logical}' failed: {e}");
        }
    }
}

/// Per-run detail log under `/tmp/<product>/restore_<timestamp>.log`.
/// Opening it is best-effort; a read-only temp area must not kill the run.
struct RestoreLog {
    file: Option<std::fs::File>,
    path: Option<PathBuf>,
}

impl RestoreLog {
    fn open(tmp_dir: &Path, timestamp: &str) -> Self {
        let path = tmp_dir.join(format!("restore_{timestamp}.log"));
        let file = std::fs::create_dir_all(tmp_dir)
            .and_then(|_| std::fs::File::create(&path))
            .map_err(|e| {
                tracing::warn!("cannot open restore log {}: {e}", path.display());
                e
            })
            .ok();
        let path = file.is_some().then_some(path);
        Self { file, path }
    }

    fn restored(&mut self, name: &str) {
        self.line(&format!("RESTORED {name}"));
    }

    fn skipped(&mut self, name: &str, reason: &str) {
        self.line(&format!("SKIPPED {name} ({reason})"));
    }

    fn summary(&mut self, stats: &ExtractStats) {
        self.line(&format!(
            "SUMMARY restored={} skipped={} failed={} bytes={}",
            stats.restored, stats.skipped, stats.failed, stats.bytes_written
        ));
    }

    fn line(&mut self, text: &str) {
        if let Some(file) = self.file.as_mut() {
            let _ = writeln!(file, "{text}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{SystemClock, SystemRunner};
    use sha2::{Digest, Sha256};

    enum TestEntry<'a> {
        File(&'a str, &'a [u8]),
        Symlink(&'a str, &'a str),
        Hardlink(&'a str, &'a str),
    }

    fn make_archive(path: &Path, entries: &[TestEntry<'_>]) {
        let file = std::fs::File::create(path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for entry in entries {
            let mut header = tar::Header::new_gnu();
            header.set_mode(0o644);
            header.set_mtime(1_700_000_000);
            match entry {
                TestEntry::File(name, data) => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(data.len() as u64);
                    builder.append_data(&mut header, *name, &data[..]).unwrap();
                }
                TestEntry::Symlink(name, target) => {
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_size(0);
                    header.set_link_name_literal(*target).unwrap();
                    builder
                        .append_data(&mut header, *name, std::io::empty())
                        .unwrap();
                }
                TestEntry::Hardlink(name, target) => {
                    header.set_entry_type(tar::EntryType::Link);
                    header.set_size(0);
                    header.set_link_name_literal(*target).unwrap();
                    builder
                        .append_data(&mut header, *name, std::io::empty())
                        .unwrap();
                }
            }
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn custom_category(id: &str, paths: &[&str]) -> SelectedCategory {
        SelectedCategory {
            id: id.to_string(),
            name: id.to_string(),
            export_only: false,
            paths: paths.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn selective_extraction_writes_only_matching_entries() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bundle.tar.gz");
        make_archive(
            &archive,
            &[
                TestEntry::File("./etc/config.txt", b"config-data"),
                TestEntry::File("./var/lib/app/state.txt", b"state"),
                TestEntry::File("./opt/ignored.txt", b"nope"),
            ],
        );

        let dest = dir.path().join("restore");
        let selection = vec![
            custom_category("etc", &["./etc/"]),
            custom_category("var", &["./var/"]),
        ];
        let opts = ExtractOptions {
            dest_root: &dest,
            selection: Some(&selection),
            tmp_dir: &dir.path().join("tmp"),
        };
        let stats = extract_archive(
            &SystemRunner,
            &SystemClock,
            &archive,
            &opts,
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(stats.restored, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(
            std::fs::read(dest.join("etc/config.txt")).unwrap(),
            b"config-data"
        );
        assert_eq!(
            std::fs::read(dest.join("var/lib/app/state.txt")).unwrap(),
            b"state"
        );
        assert!(!dest.join("opt/ignored.txt").exists());

        let log = std::fs::read_to_string(stats.log_path.unwrap()).unwrap();
        assert!(log.contains("RESTORED ./etc/config.txt"));
        assert!(log.contains("SKIPPED ./opt/ignored.txt"));
        assert!(log.contains("SUMMARY restored=2"));
    }

    #[test]
    fn traversal_entries_never_escape_destination() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.tar.gz");
        make_archive(
            &archive,
            &[
                TestEntry::File("../../../etc/passwd", b"pwned"),
                TestEntry::File("ok.txt", b"fine"),
            ],
        );

        let dest = dir.path().join("restore");
        std::fs::create_dir_all(&dest).unwrap();
        let opts = ExtractOptions {
            dest_root: &dest,
            selection: None,
            tmp_dir: &dir.path().join("tmp"),
        };
        let stats = extract_archive(
            &SystemRunner,
            &SystemClock,
            &archive,
            &opts,
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(stats.restored, 1);
        assert_eq!(stats.skipped, 1);
        assert!(!dir.path().join("etc/passwd").exists());
        assert!(dest.join("ok.txt").exists());
    }

    #[test]
    fn escaping_symlink_is_absent_after_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("links.tar.gz");
        make_archive(
            &archive,
            &[TestEntry::Symlink("link_escape", "../../../../etc/passwd")],
        );

        let dest = dir.path().join("restore");
        let opts = ExtractOptions {
            dest_root: &dest,
            selection: None,
            tmp_dir: &dir.path().join("tmp"),
        };
        std::fs::create_dir_all(&dest).unwrap();
        let stats = extract_archive(
            &SystemRunner,
            &SystemClock,
            &archive,
            &opts,
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(stats.failed, 1);
        assert!(std::fs::symlink_metadata(dest.join("link_escape")).is_err());
    }

    #[test]
    fn absolute_symlink_inside_root_is_kept_outside_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("restore");
        std::fs::create_dir_all(&dest).unwrap();
        let abs_inside = dest.join("etc/config.txt");

        let archive = dir.path().join("abs.tar.gz");
        make_archive(
            &archive,
            &[
                TestEntry::File("etc/config.txt", b"hello"),
                TestEntry::Symlink("abs_link", &abs_inside.to_string_lossy()),
                TestEntry::Symlink("abs_escape", "/etc/passwd"),
            ],
        );

        let opts = ExtractOptions {
            dest_root: &dest,
            selection: None,
            tmp_dir: &dir.path().join("tmp"),
        };
        extract_archive(
            &SystemRunner,
            &SystemClock,
            &archive,
            &opts,
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(std::fs::read_to_string(dest.join("abs_link")).unwrap(), "hello");
        assert!(std::fs::symlink_metadata(dest.join("abs_escape")).is_err());
    }

    #[test]
    fn chunked_file_is_reassembled_and_companions_do_not_survive() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0u8..=255).cycle().take(1000).collect();
        let meta = serde_json::json!({
            "version": 1,
            "size_bytes": data.len(),
            "chunk_size_bytes": 400,
            "chunk_count": 3,
            "sha256": hex::encode(Sha256::digest(&data)),
            "mode": 0o600,
            "uid": 0,
            "gid": 0,
            "mod_time_unix_nano": 1_700_000_000_000_000_000u64,
        })
        .to_string();

        let archive = dir.path().join("chunked.tar.gz");
        make_archive(
            &archive,
            &[
                TestEntry::File("./var/lib/app/big.bin.chunked", meta.as_bytes()),
                TestEntry::File("chunked_files/var/lib/app/big.bin.001.chunk", &data[..400]),
                TestEntry::File("chunked_files/var/lib/app/big.bin.002.chunk", &data[400..800]),
                TestEntry::File("chunked_files/var/lib/app/big.bin.003.chunk", &data[800..]),
            ],
        );

        let dest = dir.path().join("restore");
        let selection = vec![custom_category("var", &["./var/"])];
        let opts = ExtractOptions {
            dest_root: &dest,
            selection: Some(&selection),
            tmp_dir: &dir.path().join("tmp"),
        };
        let stats = extract_archive(
            &SystemRunner,
            &SystemClock,
            &archive,
            &opts,
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(stats.restored, 1);
        assert_eq!(stats.failed, 0);
        let assembled = dest.join("var/lib/app/big.bin");
        assert_eq!(std::fs::read(&assembled).unwrap(), data);
        // Neither the marker nor the chunk tree survive.
        assert!(!dest.join("var/lib/app/big.bin.chunked").exists());
        assert!(!dest.join("chunked_files").exists());
    }

    #[test]
    fn hardlink_points_at_existing_file_in_root() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("hard.tar.gz");
        make_archive(
            &archive,
            &[
                TestEntry::File("data/original.txt", b"shared"),
                TestEntry::Hardlink("data/linked.txt", "data/original.txt"),
                TestEntry::Hardlink("data/evil.txt", "/etc/passwd"),
            ],
        );

        let dest = dir.path().join("restore");
        let opts = ExtractOptions {
            dest_root: &dest,
            selection: None,
            tmp_dir: &dir.path().join("tmp"),
        };
        std::fs::create_dir_all(&dest).unwrap();
        let stats = extract_archive(
            &SystemRunner,
            &SystemClock,
            &archive,
            &opts,
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(std::fs::read(dest.join("data/linked.txt")).unwrap(), b"shared");
        assert!(!dest.join("data/evil.txt").exists());
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn unsupported_extension_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bundle.rar");
        std::fs::write(&archive, b"not a tar").unwrap();
        let err = match open_archive_reader(&archive, &SystemRunner) {
            Ok(_) => panic!("expected open_archive_reader to fail"),
            Err(e) => e,
        };
        assert!(matches!(err, RestoreError::UnsupportedArchive(_)));
    }

    #[test]
    fn cancellation_stops_before_first_header() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bundle.tar.gz");
        make_archive(&archive, &[TestEntry::File("a.txt", b"x")]);

        let cancel = CancelToken::new();
        cancel.cancel();
        let dest = dir.path().join("restore");
        let opts = ExtractOptions {
            dest_root: &dest,
            selection: None,
            tmp_dir: &dir.path().join("tmp"),
        };
        let err = extract_archive(&SystemRunner, &SystemClock, &archive, &opts, &cancel)
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(!dest.join("a.txt").exists());
    }

    #[test]
    fn pmxcfs_guard_only_applies_at_filesystem_root() {
        assert!(pmxcfs_guarded(
            Path::new("/"),
            Path::new("/etc/pve/user.cfg")
        ));
        assert!(!pmxcfs_guarded(Path::new("/"), Path::new("/etc/hosts")));
        assert!(!pmxcfs_guarded(
            Path::new("/tmp/stage"),
            Path::new("/tmp/stage/etc/pve/user.cfg")
        ));
    }

    #[test]
    fn scan_reports_only_categories_with_hits() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("scan.tar.gz");
        make_archive(
            &archive,
            &[
                TestEntry::File("./etc/network/interfaces", b"iface lo inet loopback"),
                TestEntry::File("./etc/proxmox-backup/datastore.cfg", b""),
            ],
        );

        let found =
            scan_available_categories(&SystemRunner, &archive, SystemType::Pbs).unwrap();
        let ids: Vec<_> = found.iter().map(|c| c.id).collect();
        assert!(ids.contains(&"network"));
        assert!(ids.contains(&"pbs_datastore"));
        assert!(!ids.contains(&"ssh"));
    }
}
