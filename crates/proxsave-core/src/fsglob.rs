use std::path::{Path, PathBuf};

use globset::GlobBuilder;

/// Glob metacharacters recognized in category paths.
pub fn has_glob_chars(s: &str) -> bool {
    s.bytes().any(|b| matches!(b, b'*' | b'?' | b'['))
}

/// Match one path segment against one pattern segment. `/` is never
/// matched by a wildcard.
pub fn segment_matches(pattern: &str, name: &str) -> bool {
    match GlobBuilder::new(pattern).literal_separator(true).build() {
        Ok(glob) => glob.compile_matcher().is_match(name),
        Err(_) => pattern == name,
    }
}

/// Expand a relative pattern against `root`, consulting the filesystem
/// only through `read_dir`/`symlink_metadata`. Wildcard segments fan out,
/// literal segments are joined directly; paths that do not exist are
/// dropped at the end.
pub fn expand(root: &Path, pattern: &str) -> Vec<PathBuf> {
    let mut current = vec![root.to_path_buf()];

    for segment in pattern.split('/').filter(|s| !s.is_empty() && *s != ".") {
        let mut next = Vec::new();
        if has_glob_chars(segment) {
            for dir in &current {
                let Ok(entries) = std::fs::read_dir(dir) else {
                    continue;
                };
                let mut names: Vec<_> = entries.flatten().map(|e| e.file_name()).collect();
                names.sort();
                for name in names {
                    if segment_matches(segment, &name.to_string_lossy()) {
                        next.push(dir.join(&name));
                    }
                }
            }
        } else {
            for dir in &current {
                next.push(dir.join(segment));
            }
        }
        current = next;
    }

    current.retain(|p| std::fs::symlink_metadata(p).is_ok());
    current
}
