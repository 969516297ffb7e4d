use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use crate::error::{RestoreError, Result};
use crate::platform::fs as pfs;

/// Resolve `candidate` against `root` and refuse anything that lands
/// outside the root after symlink evaluation.
///
/// Non-existent paths are resolved by canonicalizing the deepest existing
/// ancestor and re-appending the remainder lexically, so the check also
/// works for targets that are about to be created.
pub fn resolve_within(root: &Path, candidate: &Path) -> Result<PathBuf> {
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    let resolved = resolve_best_effort(&joined);
    let abs_root = resolve_best_effort(root);

    if resolved == abs_root || resolved.starts_with(&abs_root) {
        Ok(resolved)
    } else {
        Err(RestoreError::Sandbox(format!(
            "'{}' resolves outside '{}'",
            candidate.display(),
            root.display()
        )))
    }
}

/// Validate an archive entry name and return its absolute target under
/// `root`.
///
/// Backslashes count as separators so archives authored on mixed systems
/// cannot smuggle traversal segments past the check. `..` segments are
/// resolved lexically; a segment that would climb above the entry's own
/// root is rejected, as are empty names, lone dots and absolute names.
pub fn sanitize_archive_entry_name(root: &Path, name: &str) -> Result<PathBuf> {
    let unified = name.replace('\\', "/");

    if unified.starts_with('/') {
        return Err(RestoreError::Sandbox(format!(
            "absolute archive entry name: '{name}'"
        )));
    }

    let mut parts: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(RestoreError::Sandbox(format!(
                        "archive entry name escapes the destination: '{name}'"
                    )));
                }
            }
            normal => parts.push(normal),
        }
    }

    if parts.is_empty() {
        return Err(RestoreError::Sandbox(format!(
            "empty archive entry name: '{name}'"
        )));
    }

    let mut target = root.to_path_buf();
    for part in &parts {
        target.push(part);
    }
    Ok(target)
}

/// Pre-validate the intended target of a symlink entry. Relative link
/// targets are joined with the link's directory; absolute targets are
/// accepted only when they resolve under the same root.
pub fn validate_link_target(root: &Path, link_path: &Path, linkname: &str) -> Result<PathBuf> {
    if linkname.is_empty() {
        return Err(RestoreError::Sandbox(format!(
            "empty symlink target for '{}'",
            link_path.display()
        )));
    }
    let target = Path::new(linkname);
    let intended = if target.is_absolute() {
        target.to_path_buf()
    } else {
        link_path.parent().unwrap_or(root).join(target)
    };
    resolve_within(root, &intended)
}

/// Create a symlink with the double-gate: the intended target is validated
/// before creation, then the link is re-read from the filesystem and
/// validated again. Post-validation failure removes the created link.
pub fn extract_symlink(root: &Path, link_path: &Path, linkname: &str) -> Result<()> {
    validate_link_target(root, link_path, linkname)?;

    if let Some(parent) = link_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = std::fs::remove_file(link_path);
    pfs::create_symlink(Path::new(linkname), link_path)?;

    let reread = match std::fs::read_link(link_path) {
        Ok(target) => target,
        Err(e) => {
            let _ = std::fs::remove_file(link_path);
            return Err(e.into());
        }
    };
    if validate_link_target(root, link_path, &reread.to_string_lossy()).is_err() {
        let _ = std::fs::remove_file(link_path);
        return Err(RestoreError::Sandbox(format!(
            "symlink '{}' failed post-creation validation (target '{}')",
            link_path.display(),
            reread.display()
        )));
    }
    Ok(())
}

/// Resolve `.` / `..` segments without touching the filesystem. `..` at
/// the root stays at the root, matching path-walking semantics.
fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(c) => out.push(c),
        }
    }
    out
}

fn resolve_best_effort(path: &Path) -> PathBuf {
    if let Ok(resolved) = path.canonicalize() {
        return resolved;
    }

    let cleaned = lexical_clean(path);
    let mut existing = cleaned.as_path();
    let mut tail: Vec<OsString> = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => break,
        }
    }

    let mut out = existing
        .canonicalize()
        .unwrap_or_else(|_| existing.to_path_buf());
    for name in tail.iter().rev() {
        out.push(name);
    }
    out
}
