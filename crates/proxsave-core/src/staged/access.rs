//! Access-control merges. A naive 1:1 restore of `user.cfg` and friends
//! would lock the operator out when the backup's root credentials differ
//! from the live ones, so every merge here preserves the live `root@pam`
//! identity and guarantees a root admin ACL exists afterwards.

use std::path::Path;

use crate::error::{RestoreError, Result};
use crate::staged::atomic::atomic_write;
use crate::staged::sections::{self, RawSection};

const ROOT_USER: &str = "root@pam";

fn read_opt(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

// ---------------------------------------------------------------------------
// PVE
// ---------------------------------------------------------------------------

/// Apply the PVE access-control files from `stage_root` into `live_root`
/// (normally `/etc/pve`). Refuses outright when pmxcfs is not mounted —
/// writing into an unmounted `/etc/pve` would shadow the cluster state.
pub fn apply_pve(stage_root: &Path, live_root: &Path, pve_mounted: bool) -> Result<()> {
    if !pve_mounted {
        return Err(RestoreError::Precondition(
            "/etc/pve is not mounted (pmxcfs down); refusing access-control apply".to_string(),
        ));
    }

    let stage = stage_root.join("etc/pve");

    if let Some(backup) = read_opt(&stage.join("user.cfg")) {
        let live = read_opt(&live_root.join("user.cfg")).unwrap_or_default();
        let merged = merge_pve_user_cfg(&backup, &live);
        atomic_write(&live_root.join("user.cfg"), merged.as_bytes(), 0o640)?;
    }

    if let Some(backup) = read_opt(&stage.join("domains.cfg")) {
        let live = read_opt(&live_root.join("domains.cfg")).unwrap_or_default();
        let backup_users = read_opt(&stage.join("user.cfg")).unwrap_or_default();
        let merged = merge_pve_domains(&backup, &live, &backup_users);
        atomic_write(&live_root.join("domains.cfg"), merged.as_bytes(), 0o640)?;
    }

    std::fs::create_dir_all(live_root.join("priv"))?;
    for file in ["shadow.cfg", "token.cfg", "tfa.cfg"] {
        let staged_path = stage.join("priv").join(file);
        if let Some(backup) = read_opt(&staged_path) {
            let live_path = live_root.join("priv").join(file);
            let live = read_opt(&live_path).unwrap_or_default();
            let merged = merge_root_preserving(&backup, &live);
            atomic_write(&live_path, merged.as_bytes(), 0o600)?;
        }
    }

    Ok(())
}

/// `user.cfg`: every backup section except `user: root@pam`, then the live
/// root section verbatim (a default when absent), then a synthetic
/// Administrator ACL for root when no such entry survives the merge.
fn merge_pve_user_cfg(backup: &str, live: &str) -> String {
    let mut merged: Vec<RawSection> = sections::parse_raw_sections(backup)
        .into_iter()
        .filter(|s| !(s.kind == "user" && s.name == ROOT_USER))
        .collect();

    let live_root = sections::parse_raw_sections(live)
        .into_iter()
        .find(|s| s.kind == "user" && s.name == ROOT_USER)
        .unwrap_or_else(default_root_user_section);
    merged.push(live_root);

    if !has_root_admin_acl(&merged, "Administrator") {
        merged.push(RawSection {
            kind: "acl".to_string(),
            name: "1".to_string(),
            lines: vec![
                "acl: 1".to_string(),
                "\tpath /".to_string(),
                "\troles Administrator".to_string(),
                format!("\tusers {ROOT_USER}"),
            ],
        });
    }

    sections::serialize_raw_sections(&merged)
}

fn default_root_user_section() -> RawSection {
    RawSection {
        kind: "user".to_string(),
        name: ROOT_USER.to_string(),
        lines: vec![
            format!("user: {ROOT_USER}"),
            "\tenable 1".to_string(),
            "\texpire 0".to_string(),
        ],
    }
}

fn section_entry<'a>(section: &'a RawSection, key: &str) -> Option<&'a str> {
    for line in section.lines.iter().skip(1) {
        let trimmed = line.trim();
        if let Some((k, v)) = trimmed.split_once(char::is_whitespace) {
            if k == key {
                return Some(v.trim());
            }
        }
    }
    None
}

fn has_root_admin_acl(merged: &[RawSection], role: &str) -> bool {
    merged.iter().any(|s| {
        s.kind == "acl"
            && section_entry(s, "path") == Some("/")
            && section_entry(s, "roles")
                .map(|r| r.split(',').any(|r| r.trim() == role))
                .unwrap_or(false)
            && section_entry(s, "users")
                .map(|u| u.split(',').any(|u| u.trim() == ROOT_USER))
                .unwrap_or(false)
    })
}

/// `domains.cfg`: backup realms first; for each required realm the live
/// section overlays the backup one, and a minimal default fills any gap.
/// `pve` only counts as required when a backup user lives in that realm.
fn merge_pve_domains(backup: &str, live: &str, backup_users: &str) -> String {
    let mut merged = sections::parse_raw_sections(backup);
    let live_sections = sections::parse_raw_sections(live);

    let mut required = vec!["pam"];
    let has_pve_realm_user = sections::parse_raw_sections(backup_users)
        .iter()
        .any(|s| s.kind == "user" && s.name.ends_with("@pve"));
    if has_pve_realm_user {
        required.push("pve");
    }

    for realm in required {
        if let Some(live_realm) = live_sections.iter().find(|s| s.name == realm) {
            match merged.iter_mut().find(|s| s.name == realm) {
                Some(existing) => *existing = live_realm.clone(),
                None => merged.push(live_realm.clone()),
            }
        } else if !merged.iter().any(|s| s.name == realm) {
            merged.push(default_realm_section(realm));
        }
    }

    sections::serialize_raw_sections(&merged)
}

fn default_realm_section(realm: &str) -> RawSection {
    let comment = match realm {
        "pam" => "Linux PAM standard authentication",
        _ => "Proxmox VE authentication server",
    };
    RawSection {
        kind: realm.to_string(),
        name: realm.to_string(),
        lines: vec![format!("{realm}: {realm}"), format!("\tcomment {comment}")],
    }
}

/// Shared merge rule for the priv files and the PBS user file: keep every
/// backup section whose user id is not root, then append the live root
/// sections.
fn merge_root_preserving(backup: &str, live: &str) -> String {
    let mut merged: Vec<RawSection> = sections::parse_raw_sections(backup)
        .into_iter()
        .filter(|s| s.user_id() != ROOT_USER)
        .collect();
    for section in sections::parse_raw_sections(live) {
        if section.user_id() == ROOT_USER {
            merged.push(section);
        }
    }
    sections::serialize_raw_sections(&merged)
}

// ---------------------------------------------------------------------------
// PBS
// ---------------------------------------------------------------------------

/// Apply the PBS access-control files from `stage_root` into `live_root`
/// (normally `/etc/proxmox-backup`).
pub fn apply_pbs(stage_root: &Path, live_root: &Path) -> Result<()> {
    let stage = stage_root.join("etc/proxmox-backup");
    std::fs::create_dir_all(live_root)?;

    if let Some(backup) = read_opt(&stage.join("user.cfg")) {
        let live = read_opt(&live_root.join("user.cfg")).unwrap_or_default();
        let merged = merge_pbs_user_cfg(&backup, &live);
        atomic_write(&live_root.join("user.cfg"), merged.as_bytes(), 0o640)?;
    }

    if let Some(backup) = read_opt(&stage.join("acl.cfg")) {
        let live = read_opt(&live_root.join("acl.cfg")).unwrap_or_default();
        match merge_pbs_acl(&backup, &live) {
            Some(merged) => {
                atomic_write(&live_root.join("acl.cfg"), merged.as_bytes(), 0o640)?
            }
            None => tracing::warn!("unrecognized acl.cfg format; leaving live file alone"),
        }
    }

    for file in ["shadow.json", "token.shadow"] {
        if let Some(backup) = read_opt(&stage.join(file)) {
            let live = read_opt(&live_root.join(file)).unwrap_or_default();
            let merged = merge_secret_json(&backup, &live)?;
            atomic_write(&live_root.join(file), merged.as_bytes(), 0o600)?;
        }
    }

    if let Some(backup) = read_opt(&stage.join("tfa.json")) {
        let live = read_opt(&live_root.join("tfa.json")).unwrap_or_default();
        let merged = merge_tfa_json(&backup, &live)?;
        atomic_write(&live_root.join("tfa.json"), merged.as_bytes(), 0o600)?;
    }

    Ok(())
}

/// PBS `user.cfg`: drop every backup `user:`/`token:` section belonging to
/// root, then carry over the live root user and its tokens.
fn merge_pbs_user_cfg(backup: &str, live: &str) -> String {
    let mut merged: Vec<RawSection> = sections::parse_raw_sections(backup)
        .into_iter()
        .filter(|s| {
            !(matches!(s.kind.as_str(), "user" | "token") && s.user_id() == ROOT_USER)
        })
        .collect();
    for section in sections::parse_raw_sections(live) {
        if matches!(section.kind.as_str(), "user" | "token") && section.user_id() == ROOT_USER {
            merged.push(section);
        }
    }
    sections::serialize_raw_sections(&merged)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclEntry {
    pub propagate: bool,
    pub path: String,
    pub users: Vec<String>,
    pub roles: String,
}

impl AclEntry {
    fn render(&self) -> String {
        format!(
            "acl:{}:{}:{}:{}",
            if self.propagate { "1" } else { "0" },
            self.path,
            self.users.join(","),
            self.roles
        )
    }
}

/// Parse `acl.cfg` in either recognized format: the colon-delimited line
/// form (`acl:<propagate>:<path>:<userlist>:<rolelist>`) or the header
/// section form. Returns `None` for content in neither format.
pub fn parse_acl(text: &str) -> Option<Vec<AclEntry>> {
    let meaningful: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();
    if meaningful.is_empty() {
        return Some(Vec::new());
    }

    if meaningful
        .iter()
        .all(|l| l.starts_with("acl:") && l.matches(':').count() >= 4)
    {
        let mut entries = Vec::new();
        for line in meaningful {
            let mut fields = line.splitn(5, ':');
            let _tag = fields.next()?;
            let propagate = fields.next()? == "1";
            let path = fields.next()?.to_string();
            let users = fields
                .next()?
                .split(',')
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect();
            let roles = fields.next()?.to_string();
            entries.push(AclEntry {
                propagate,
                path,
                users,
                roles,
            });
        }
        return Some(entries);
    }

    let raw = sections::parse_raw_sections(text);
    if !raw.is_empty() && raw.iter().all(|s| s.kind == "acl") {
        let mut entries = Vec::new();
        for section in raw {
            entries.push(AclEntry {
                propagate: section.name != "0",
                path: section_entry(&section, "path").unwrap_or("/").to_string(),
                users: section_entry(&section, "users")
                    .map(|u| {
                        u.split(',')
                            .map(str::trim)
                            .filter(|u| !u.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                roles: section_entry(&section, "roles").unwrap_or_default().to_string(),
            });
        }
        return Some(entries);
    }

    None
}

/// PBS acl merge: backup entries scrubbed of root, live entries kept, and
/// an `Admin` on `/` for root guaranteed. Output uses the line form.
fn merge_pbs_acl(backup: &str, live: &str) -> Option<String> {
    let mut backup_entries = parse_acl(backup)?;
    let live_entries = parse_acl(live).unwrap_or_default();

    for entry in &mut backup_entries {
        entry.users.retain(|u| u != ROOT_USER);
    }
    backup_entries.retain(|e| !e.users.is_empty());

    let mut merged = backup_entries;
    for entry in live_entries {
        if !merged.contains(&entry) {
            merged.push(entry);
        }
    }

    let has_root_admin = merged.iter().any(|e| {
        e.path == "/"
            && e.users.iter().any(|u| u == ROOT_USER)
            && e.roles.split(',').any(|r| r.trim() == "Admin")
    });
    if !has_root_admin {
        merged.push(AclEntry {
            propagate: true,
            path: "/".to_string(),
            users: vec![ROOT_USER.to_string()],
            roles: "Admin".to_string(),
        });
    }

    let mut out = String::new();
    for entry in &merged {
        out.push_str(&entry.render());
        out.push('\n');
    }
    Some(out)
}

/// Secret JSON files map user ids to hash strings: drop the backup's root
/// entries, then overlay the live root entries.
fn merge_secret_json(backup: &str, live: &str) -> Result<String> {
    let mut map = parse_json_map(backup)?;
    let live_map = if live.trim().is_empty() {
        serde_json::Map::new()
    } else {
        parse_json_map(live)?
    };

    map.retain(|key, _| key.split('!').next() != Some(ROOT_USER));
    for (key, value) in live_map {
        if key.split('!').next() == Some(ROOT_USER) {
            map.insert(key, value);
        }
    }

    let mut out = serde_json::to_string_pretty(&serde_json::Value::Object(map))?;
    out.push('\n');
    Ok(out)
}

fn parse_json_map(text: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    if text.trim().is_empty() {
        return Ok(serde_json::Map::new());
    }
    match serde_json::from_str::<serde_json::Value>(text)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(RestoreError::Parse {
            file: "secret json".to_string(),
            detail: "expected a JSON object".to_string(),
        }),
    }
}

/// `tfa.json`: merge the `users` map with root preservation, keep other
/// top-level keys from the backup, and warn about WebAuthn/U2F users —
/// those credentials bind to the enrollment origin and may need to be
/// re-enrolled after a hostname change.
fn merge_tfa_json(backup: &str, live: &str) -> Result<String> {
    let mut root_obj = parse_json_map(backup)?;
    let live_obj = parse_json_map(live)?;

    let mut users = match root_obj.remove("users") {
        Some(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    users.retain(|key, _| key.split('!').next() != Some(ROOT_USER));
    if let Some(serde_json::Value::Object(live_users)) = live_obj.get("users") {
        for (key, value) in live_users {
            if key.split('!').next() == Some(ROOT_USER) {
                users.insert(key.clone(), value.clone());
            }
        }
    }

    let origin_bound: Vec<&String> = users
        .iter()
        .filter(|(_, value)| {
            let text = value.to_string();
            text.contains("\"webauthn\"") || text.contains("\"u2f\"")
        })
        .map(|(key, _)| key)
        .collect();
    if !origin_bound.is_empty() {
        tracing::warn!(
            "TFA users with WebAuthn/U2F credentials may need to re-enroll \
             after an origin or hostname change: {}",
            origin_bound
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    root_obj.insert("users".to_string(), serde_json::Value::Object(users));
    let mut out = serde_json::to_string_pretty(&serde_json::Value::Object(root_obj))?;
    out.push('\n');
    Ok(out)
}
