use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::env::{run_checked, CmdSpec, CommandRunner};
use crate::error::Result;
use crate::plan::PbsBehavior;
use crate::staged::sections::{self, Section};

/// The PBS management CLI every object applier drives.
pub const MANAGER: &str = "proxmox-backup-manager";

const MANAGER_TIMEOUT: Duration = Duration::from_secs(120);

/// One PBS object family: its manager subcommand and the JSON keys that
/// identify an instance in `list` output (first present key wins).
#[derive(Debug, Clone, Copy)]
pub struct ObjectSpec {
    pub object: &'static str,
    pub id_keys: &'static [&'static str],
}

pub const OBJECTS: &[ObjectSpec] = &[
    ObjectSpec {
        object: "remote",
        id_keys: &["name", "id"],
    },
    ObjectSpec {
        object: "s3-endpoint",
        id_keys: &["id", "name"],
    },
    ObjectSpec {
        object: "datastore",
        id_keys: &["name", "store", "id"],
    },
    ObjectSpec {
        object: "sync-job",
        id_keys: &["id", "name"],
    },
    ObjectSpec {
        object: "verify-job",
        id_keys: &["id", "name"],
    },
    ObjectSpec {
        object: "prune-job",
        id_keys: &["id", "name"],
    },
    ObjectSpec {
        object: "traffic-control",
        id_keys: &["name", "id"],
    },
    ObjectSpec {
        object: "node",
        id_keys: &["name", "id"],
    },
];

pub fn object_spec(object: &str) -> Option<&'static ObjectSpec> {
    OBJECTS.iter().find(|o| o.object == object)
}

#[derive(Debug, Default)]
pub struct PbsApplyStats {
    pub applied: u64,
    pub removed: u64,
    pub failed: u64,
}

/// Apply one staged `.cfg` file through the manager CLI. In strict mode
/// (clean 1:1 behavior) live objects absent from the staged file are
/// removed first; removal failures downgrade to warnings. Each staged
/// section is applied as `update`, retried as `create` when the object
/// does not exist yet.
pub fn apply_object(
    runner: &dyn CommandRunner,
    cancel: &CancelToken,
    behavior: PbsBehavior,
    spec: &ObjectSpec,
    staged_cfg: &Path,
) -> Result<PbsApplyStats> {
    let mut stats = PbsApplyStats::default();

    let text = match std::fs::read_to_string(staged_cfg) {
        Ok(text) => text,
        Err(_) => return Ok(stats),
    };
    let staged = sections::parse_sections(&text);
    let staged_ids: HashSet<&str> = staged.iter().map(|s| s.name.as_str()).collect();

    // The datastore applier always needs the live view to detect path
    // changes; other objects only list when strict removal is on.
    let need_list = behavior.strict() || spec.object == "datastore";
    let current = if need_list {
        list_current(runner, cancel, spec)?
    } else {
        Vec::new()
    };

    if behavior.strict() {
        for obj in &current {
            cancel.check()?;
            let Some(id) = object_id(obj, spec.id_keys) else {
                continue;
            };
            if staged_ids.contains(id.as_str()) {
                continue;
            }
            let remove = CmdSpec::new(MANAGER)
                .arg(spec.object)
                .arg("remove")
                .arg(&id);
            match run_checked(runner, &remove, MANAGER_TIMEOUT, cancel) {
                Ok(_) => stats.removed += 1,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => tracing::warn!("strict removal of {} '{id}' failed: {e}", spec.object),
            }
        }
    }

    for section in &staged {
        cancel.check()?;
        let applied = if spec.object == "datastore" {
            apply_datastore_section(runner, cancel, section, &current, spec)
        } else {
            apply_generic_section(runner, cancel, section, spec)
        };
        match applied {
            Ok(()) => stats.applied += 1,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                stats.failed += 1;
                tracing::warn!("{} '{}' failed: {e}", spec.object, section.name);
            }
        }
    }

    Ok(stats)
}

fn apply_generic_section(
    runner: &dyn CommandRunner,
    cancel: &CancelToken,
    section: &Section,
    spec: &ObjectSpec,
) -> Result<()> {
    let update = command_for(section, spec.object, "update", None);
    match run_checked(runner, &update, MANAGER_TIMEOUT, cancel) {
        Ok(_) => Ok(()),
        Err(e) if e.is_cancelled() => Err(e),
        Err(_) => {
            let create = command_for(section, spec.object, "create", None);
            run_checked(runner, &create, MANAGER_TIMEOUT, cancel).map(|_| ())
        }
    }
}

/// Datastores cannot change their path in place: when the staged path
/// differs from the live one the object is removed and recreated.
fn apply_datastore_section(
    runner: &dyn CommandRunner,
    cancel: &CancelToken,
    section: &Section,
    current: &[serde_json::Value],
    spec: &ObjectSpec,
) -> Result<()> {
    let staged_path = section.get("path").map(str::to_string);
    let live = current
        .iter()
        .find(|obj| object_id(obj, spec.id_keys).as_deref() == Some(section.name.as_str()));
    let live_path = live
        .and_then(|obj| obj.get("path"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    match (live, &staged_path, &live_path) {
        (Some(_), Some(staged), Some(live_path)) if staged != live_path => {
            let remove = CmdSpec::new(MANAGER)
                .arg("datastore")
                .arg("remove")
                .arg(&section.name);
            run_checked(runner, &remove, MANAGER_TIMEOUT, cancel)?;
            let create = command_for(section, "datastore", "create", staged_path.as_deref());
            run_checked(runner, &create, MANAGER_TIMEOUT, cancel).map(|_| ())
        }
        (Some(_), _, _) => {
            let update = command_for(section, "datastore", "update", None);
            match run_checked(runner, &update, MANAGER_TIMEOUT, cancel) {
                Ok(_) => Ok(()),
                Err(e) if e.is_cancelled() => Err(e),
                Err(_) => {
                    let create =
                        command_for(section, "datastore", "create", staged_path.as_deref());
                    run_checked(runner, &create, MANAGER_TIMEOUT, cancel).map(|_| ())
                }
            }
        }
        (None, _, _) => {
            let create = command_for(section, "datastore", "create", staged_path.as_deref());
            match run_checked(runner, &create, MANAGER_TIMEOUT, cancel) {
                Ok(_) => Ok(()),
                Err(e) if e.is_cancelled() => Err(e),
                Err(_) => {
                    let update = command_for(section, "datastore", "update", None);
                    run_checked(runner, &update, MANAGER_TIMEOUT, cancel).map(|_| ())
                }
            }
        }
    }
}

/// Build `<manager> <object> <verb> <id> [<path>] --key value …`.
/// A datastore create takes the path as positional; in every other case
/// the path entry stays a flag. `name`/`digest` are filtered and secret
/// values carry redaction metadata.
fn command_for(
    section: &Section,
    object: &str,
    verb: &str,
    positional_path: Option<&str>,
) -> CmdSpec {
    let mut spec = CmdSpec::new(MANAGER).arg(object).arg(verb).arg(&section.name);
    if let Some(path) = positional_path {
        spec = spec.arg(path);
    }
    for (flag, value, secret) in sections::section_command_args(section) {
        if positional_path.is_some() && flag == "--path" {
            continue;
        }
        if object == "datastore" && verb == "update" && flag == "--path" {
            // Path changes go through remove+create, never update.
            continue;
        }
        spec = spec.arg(flag);
        spec = if secret {
            spec.secret_arg(value)
        } else {
            spec.arg(value)
        };
    }
    spec
}

fn list_current(
    runner: &dyn CommandRunner,
    cancel: &CancelToken,
    spec: &ObjectSpec,
) -> Result<Vec<serde_json::Value>> {
    let list = CmdSpec::new(MANAGER)
        .arg(spec.object)
        .arg("list")
        .arg("--output-format=json");
    let output = match run_checked(runner, &list, MANAGER_TIMEOUT, cancel) {
        Ok(output) => output,
        Err(e) if e.is_cancelled() => return Err(e),
        Err(e) => {
            tracing::warn!("cannot list current {} objects: {e}", spec.object);
            return Ok(Vec::new());
        }
    };
    match serde_json::from_slice::<serde_json::Value>(&output.stdout) {
        Ok(serde_json::Value::Array(items)) => Ok(items),
        Ok(_) | Err(_) => {
            tracing::warn!("unexpected {} list output; treating as empty", spec.object);
            Ok(Vec::new())
        }
    }
}

fn object_id(value: &serde_json::Value, id_keys: &[&str]) -> Option<String> {
    for key in id_keys {
        if let Some(id) = value.get(*key).and_then(|v| v.as_str()) {
            return Some(id.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{output, ScriptedRunner};

    fn staged_file(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn update_falls_back_to_create() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = staged_file(
            dir.path(),
            "remote.cfg",
            "remote: offsite\n\thost pbs.example.com\n\tpassword topsecret\n",
        );

        let runner = ScriptedRunner::new().fail_on("remote update", 2, "no such remote");
        let stats = apply_object(
            &runner,
            &CancelToken::new(),
            PbsBehavior::Merge,
            object_spec("remote").unwrap(),
            &cfg,
        )
        .unwrap();

        assert_eq!(stats.applied, 1);
        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].contains("proxmox-backup-manager remote update offsite"));
        assert!(calls[1].contains("proxmox-backup-manager remote create offsite"));
        // Secrets never leak into display lines.
        for call in &calls {
            assert!(!call.contains("topsecret"));
        }
    }

    #[test]
    fn strict_mode_removes_unlisted_objects() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = staged_file(dir.path(), "sync.cfg", "sync: keep-me\n\tstore local\n");

        let runner = ScriptedRunner::new().on(
            "sync-job list",
            output(0, r#"[{"id": "keep-me"}, {"id": "stale-job"}]"#),
        );
        let stats = apply_object(
            &runner,
            &CancelToken::new(),
            PbsBehavior::CleanOneToOne,
            object_spec("sync-job").unwrap(),
            &cfg,
        )
        .unwrap();

        assert_eq!(stats.removed, 1);
        assert_eq!(runner.call_count("sync-job remove stale-job"), 1);
        assert_eq!(runner.call_count("sync-job remove keep-me"), 0);
    }

    #[test]
    fn strict_removal_failure_is_only_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = staged_file(dir.path(), "remote.cfg", "remote: a\n\thost h\n");

        let runner = ScriptedRunner::new()
            .on("remote list", output(0, r#"[{"name": "doomed"}]"#))
            .fail_on("remote remove doomed", 1, "in use");
        let stats = apply_object(
            &runner,
            &CancelToken::new(),
            PbsBehavior::CleanOneToOne,
            object_spec("remote").unwrap(),
            &cfg,
        )
        .unwrap();

        assert_eq!(stats.removed, 0);
        assert_eq!(stats.applied, 1);
    }

    #[test]
    fn merge_mode_never_lists_or_removes() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = staged_file(dir.path(), "remote.cfg", "remote: a\n\thost h\n");

        let runner = ScriptedRunner::new();
        apply_object(
            &runner,
            &CancelToken::new(),
            PbsBehavior::Merge,
            object_spec("remote").unwrap(),
            &cfg,
        )
        .unwrap();

        assert_eq!(runner.call_count("remote list"), 0);
        assert_eq!(runner.call_count("remote remove"), 0);
    }

    #[test]
    fn datastore_path_change_triggers_recreation() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = staged_file(
            dir.path(),
            "datastore.cfg",
            "datastore: tank\n\tpath /mnt/new-tank\n\tgc-schedule daily\n",
        );

        let runner = ScriptedRunner::new().on(
            "datastore list",
            output(0, r#"[{"name": "tank", "path": "/mnt/old-tank"}]"#),
        );
        let stats = apply_object(
            &runner,
            &CancelToken::new(),
            PbsBehavior::Merge,
            object_spec("datastore").unwrap(),
            &cfg,
        )
        .unwrap();

        assert_eq!(stats.applied, 1);
        assert_eq!(runner.call_count("datastore remove tank"), 1);
        assert_eq!(
            runner.call_count("datastore create tank /mnt/new-tank"),
            1
        );
        // The path is positional on create, not a flag.
        for call in runner.calls() {
            assert!(!call.contains("--path"));
        }
    }

    #[test]
    fn datastore_same_path_is_updated_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = staged_file(
            dir.path(),
            "datastore.cfg",
            "datastore: tank\n\tpath /mnt/tank\n\tcomment restored\n",
        );

        let runner = ScriptedRunner::new().on(
            "datastore list",
            output(0, r#"[{"name": "tank", "path": "/mnt/tank"}]"#),
        );
        let stats = apply_object(
            &runner,
            &CancelToken::new(),
            PbsBehavior::Merge,
            object_spec("datastore").unwrap(),
            &cfg,
        )
        .unwrap();

        assert_eq!(stats.applied, 1);
        assert_eq!(runner.call_count("datastore remove"), 0);
        assert_eq!(runner.call_count("datastore update tank"), 1);
    }

    #[test]
    fn missing_staged_file_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        let stats = apply_object(
            &runner,
            &CancelToken::new(),
            PbsBehavior::Merge,
            object_spec("remote").unwrap(),
            &dir.path().join("absent.cfg"),
        )
        .unwrap();
        assert_eq!(stats.applied, 0);
        assert!(runner.calls().is_empty());
    }
}
