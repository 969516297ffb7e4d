use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::env::{format_timestamp, Clock};
use crate::error::{RestoreError, Result};
use crate::staged::atomic::atomic_write;
use crate::staged::sections;

/// Inspection bound for existing datastore paths: looking at more entries
/// than this buys no additional confidence and can stall on misdirected
/// mounts holding millions of files.
const MAX_INSPECT_ENTRIES: usize = 64;

/// Bound for inventory JSON snapshots read from the archive.
const MAX_INVENTORY_BYTES: u64 = 1024 * 1024;

/// One `datastore:` block from `datastore.cfg`, kept verbatim so merges
/// never reformat operator content.
#[derive(Debug, Clone)]
pub struct DatastoreBlock {
    pub name: String,
    pub path: Option<String>,
    pub body: String,
}

/// Parse `datastore.cfg` into blocks. Duplicate keys inside one block make
/// the intent ambiguous and reject the whole file.
pub fn parse_blocks(source_name: &str, text: &str) -> Result<Vec<DatastoreBlock>> {
    let mut blocks = Vec::new();
    for raw in sections::parse_raw_sections(text) {
        if raw.kind != "datastore" {
            continue;
        }
        let mut seen = HashSet::new();
        let mut path = None;
        for line in raw.lines.iter().skip(1) {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let key = trimmed
                .split_once(char::is_whitespace)
                .map(|(k, _)| k)
                .unwrap_or(trimmed);
            if !seen.insert(key.to_string()) {
                return Err(RestoreError::Parse {
                    file: source_name.to_string(),
                    detail: format!("duplicate key '{key}' in datastore '{}'", raw.name),
                });
            }
            if key == "path" {
                path = trimmed
                    .split_once(char::is_whitespace)
                    .map(|(_, v)| v.trim().to_string());
            }
        }
        blocks.push(DatastoreBlock {
            name: raw.name.clone(),
            path,
            body: raw.render(),
        });
    }
    Ok(blocks)
}

#[derive(Debug, PartialEq, Eq)]
pub enum PathSafety {
    Safe,
    Unsafe(String),
}

/// A staged datastore path is SAFE when it does not exist, is an empty
/// directory, or is a directory whose first `MAX_INSPECT_ENTRIES` entries
/// include `.chunks` (an existing datastore). Anything else would be
/// dangerous to adopt and defers the block.
pub fn classify_existing_path(path: &Path) -> PathSafety {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(_) => return PathSafety::Safe,
    };
    if !meta.is_dir() {
        return PathSafety::Unsafe("exists and is not a directory".to_string());
    }
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) => return PathSafety::Unsafe(format!("unreadable directory: {e}")),
    };

    let mut count = 0usize;
    for entry in entries.flatten() {
        if entry.file_name() == ".chunks" {
            return PathSafety::Safe;
        }
        count += 1;
        if count >= MAX_INSPECT_ENTRIES {
            break;
        }
    }
    if count == 0 {
        PathSafety::Safe
    } else {
        PathSafety::Unsafe("contains unexpected entries".to_string())
    }
}

#[derive(Debug, Default)]
pub struct DatastoreApplyStats {
    pub applied_blocks: u64,
    pub deferred_blocks: u64,
    pub deferred_file: Option<PathBuf>,
    pub wrote_live: bool,
}

/// File-level datastore apply: safe blocks merge into the live file,
/// unsafe blocks divert into a deferral file for the operator. When every
/// block defers, the live file stays exactly as it was.
pub fn apply_file(
    clock: &dyn Clock,
    tmp_dir: &Path,
    staged_cfg: &Path,
    live_cfg: &Path,
) -> Result<DatastoreApplyStats> {
    let mut stats = DatastoreApplyStats::default();

    let text = match std::fs::read_to_string(staged_cfg) {
        Ok(text) => text,
        Err(_) => return Ok(stats),
    };
    let blocks = parse_blocks(&staged_cfg.display().to_string(), &text)?;

    let mut safe = Vec::new();
    let mut deferred = Vec::new();
    for block in blocks {
        let verdict = block
            .path
            .as_deref()
            .map(|p| classify_existing_path(Path::new(p)))
            .unwrap_or_else(|| PathSafety::Unsafe("no path entry".to_string()));
        match verdict {
            PathSafety::Safe => safe.push(block),
            PathSafety::Unsafe(reason) => {
                tracing::warn!(
                    "deferring datastore '{}' ({}): {reason}",
                    block.name,
                    block.path.as_deref().unwrap_or("<no path>")
                );
                deferred.push((block, reason));
            }
        }
    }

    if !deferred.is_empty() {
        std::fs::create_dir_all(tmp_dir)?;
        let stamp = format_timestamp(clock.now());
        let deferred_path = tmp_dir.join(format!("pbs_datastore_deferred_{stamp}.cfg"));
        let mut content = String::from(
            "# Datastore blocks deferred during restore: their paths held\n\
             # unexpected content. Review each path, then merge the block\n\
             # into /etc/proxmox-backup/datastore.cfg manually.\n\n",
        );
        for (block, reason) in &deferred {
            content.push_str(&format!("# reason: {reason}\n"));
            content.push_str(&block.body);
            content.push('\n');
        }
        atomic_write(&deferred_path, content.as_bytes(), 0o640)?;
        stats.deferred_blocks = deferred.len() as u64;
        stats.deferred_file = Some(deferred_path);
    }

    if safe.is_empty() {
        // All blocks deferred (or the staged file was empty): the live
        // configuration stays untouched.
        return Ok(stats);
    }

    let mut merged = String::new();
    for block in &safe {
        merged.push_str(&block.body);
        merged.push('\n');
    }
    atomic_write(live_cfg, merged.as_bytes(), 0o640)?;
    stats.applied_blocks = safe.len() as u64;
    stats.wrote_live = true;
    Ok(stats)
}

/// Build synthetic `datastore.cfg` content from a JSON inventory snapshot
/// when the raw file is absent from the archive. Accepts either a bare
/// array or an object with a `datastores` array.
pub fn synthesize_from_inventory(json_path: &Path) -> Result<Option<String>> {
    let meta = match std::fs::metadata(json_path) {
        Ok(meta) => meta,
        Err(_) => return Ok(None),
    };
    if meta.len() > MAX_INVENTORY_BYTES {
        return Err(RestoreError::InvalidArchive(format!(
            "datastore inventory exceeds {MAX_INVENTORY_BYTES} bytes"
        )));
    }

    let value: serde_json::Value = serde_json::from_slice(&std::fs::read(json_path)?)?;
    let items = match &value {
        serde_json::Value::Array(items) => items.as_slice(),
        serde_json::Value::Object(map) => match map.get("datastores") {
            Some(serde_json::Value::Array(items)) => items.as_slice(),
            _ => {
                return Err(RestoreError::Parse {
                    file: json_path.display().to_string(),
                    detail: "expected an array or a 'datastores' array".to_string(),
                })
            }
        },
        _ => {
            return Err(RestoreError::Parse {
                file: json_path.display().to_string(),
                detail: "expected an array or a 'datastores' array".to_string(),
            })
        }
    };

    let mut out = String::new();
    for item in items {
        let name = item
            .get("name")
            .or_else(|| item.get("store"))
            .and_then(|v| v.as_str());
        let path = item.get("path").and_then(|v| v.as_str());
        let (Some(name), Some(path)) = (name, path) else {
            continue;
        };
        out.push_str(&format!("datastore: {name}\n\tpath {path}\n"));
        if let Some(comment) = item.get("comment").and_then(|v| v.as_str()) {
            out.push_str(&format!("\tcomment {comment}\n"));
        }
        out.push('\n');
    }

    if out.is_empty() {
        Ok(None)
    } else {
        Ok(Some(out))
    }
}
