use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::env::{run_checked, CmdSpec, CommandRunner};
use crate::error::Result;
use crate::staged::atomic::atomic_write;
use crate::staged::sections::{self, Section};

/// Endpoint section kinds; everything else in `notifications.cfg` is a
/// matcher.
const ENDPOINT_KINDS: &[&str] = &["smtp", "sendmail", "gotify", "webhook"];

const PVESH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
pub struct NotificationStats {
    pub applied: u64,
    pub failed: u64,
}

/// PBS: the staged notification files are written whole once a section
/// header is present. The priv file carries the secrets and keeps 0600.
pub fn apply_pbs(stage_root: &Path, live_dir: &Path) -> Result<NotificationStats> {
    let mut stats = NotificationStats::default();
    let pairs: [(&str, u32); 2] = [
        ("notifications.cfg", 0o640),
        ("notifications-priv.cfg", 0o600),
    ];

    for (file_name, mode) in pairs {
        let staged = stage_root.join("etc/proxmox-backup").join(file_name);
        let text = match std::fs::read_to_string(&staged) {
            Ok(text) => text,
            Err(_) => continue,
        };
        if sections::parse_sections(&text).is_empty() {
            tracing::warn!(
                "staged {file_name} has no recognizable section header; leaving live file alone"
            );
            stats.failed += 1;
            continue;
        }
        std::fs::create_dir_all(live_dir)?;
        atomic_write(&live_dir.join(file_name), text.as_bytes(), mode)?;
        stats.applied += 1;
    }
    Ok(stats)
}

/// PVE: endpoints and matchers are pushed through `pvesh` so pmxcfs and
/// the notification daemon stay consistent. Endpoint sections merge the
/// entries of the matching `<type>:<name>` priv section; secret values are
/// redacted in every failure path.
pub fn apply_pve(
    runner: &dyn CommandRunner,
    cancel: &CancelToken,
    stage_root: &Path,
) -> Result<NotificationStats> {
    let mut stats = NotificationStats::default();

    let public_path = stage_root.join("etc/pve/notifications.cfg");
    let public = match std::fs::read_to_string(&public_path) {
        Ok(text) => text,
        Err(_) => return Ok(stats),
    };
    let priv_text = std::fs::read_to_string(stage_root.join("etc/pve/priv/notifications.cfg"))
        .unwrap_or_default();

    let mut priv_map: HashMap<(String, String), Section> = HashMap::new();
    for section in sections::parse_sections(&priv_text) {
        priv_map.insert((section.kind.clone(), section.name.clone()), section);
    }

    for mut section in sections::parse_sections(&public) {
        cancel.check()?;

        let is_endpoint = ENDPOINT_KINDS.contains(&section.kind.as_str());
        if is_endpoint {
            if let Some(private) = priv_map.remove(&(section.kind.clone(), section.name.clone())) {
                section.entries.extend(private.entries);
            }
        }

        let (set_spec, create_spec) = if is_endpoint {
            let base = format!("/cluster/notifications/endpoints/{}", section.kind);
            (
                build_pvesh("set", &format!("{base}/{}", section.name), &section, None),
                build_pvesh("create", &base, &section, Some(&section.name)),
            )
        } else {
            (
                build_pvesh(
                    "set",
                    &format!("/cluster/notifications/matchers/{}", section.name),
                    &section,
                    None,
                ),
                build_pvesh(
                    "create",
                    "/cluster/notifications/matchers",
                    &section,
                    Some(&section.name),
                ),
            )
        };

        match run_checked(runner, &set_spec, PVESH_TIMEOUT, cancel) {
            Ok(_) => stats.applied += 1,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(set_err) => match run_checked(runner, &create_spec, PVESH_TIMEOUT, cancel) {
                Ok(_) => stats.applied += 1,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(create_err) => {
                    stats.failed += 1;
                    tracing::warn!(
                        "notification '{}: {}' failed: set: {set_err}; create: {create_err}",
                        section.kind,
                        section.name
                    );
                }
            },
        }
    }

    Ok(stats)
}

fn build_pvesh(verb: &str, api_path: &str, section: &Section, name: Option<&str>) -> CmdSpec {
    let mut spec = CmdSpec::new("pvesh").arg(verb).arg(api_path);
    if let Some(name) = name {
        spec = spec.arg("--name").arg(name);
    }
    for (flag, value, secret) in sections::section_command_args(section) {
        spec = spec.arg(flag);
        spec = if secret {
            spec.secret_arg(value)
        } else {
            spec.arg(value)
        };
    }
    spec
}
