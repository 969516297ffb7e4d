use globset::GlobBuilder;

use crate::fsglob;

/// Which host type a category applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemType {
    Pve,
    Pbs,
}

impl SystemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemType::Pve => "pve",
            SystemType::Pbs => "pbs",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryKind {
    Pve,
    Pbs,
    Common,
}

/// A named, ordered set of archive-relative paths used for selective
/// restore. Paths ending in `/` are directory prefixes; paths containing
/// `*?[` are glob patterns; everything else is a literal file.
#[derive(Debug)]
pub struct Category {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub kind: CategoryKind,
    pub paths: &'static [&'static str],
    pub export_only: bool,
}

impl Category {
    pub fn applies_to(&self, system: SystemType) -> bool {
        match self.kind {
            CategoryKind::Common => true,
            CategoryKind::Pve => system == SystemType::Pve,
            CategoryKind::Pbs => system == SystemType::Pbs,
        }
    }
}

/// The static category registry.
pub fn registry() -> &'static [Category] {
    static CATEGORIES: &[Category] = &[
        Category {
            id: "system_base",
            name: "Base system identity",
            description: "Hostname, hosts file, DNS resolver, timezone",
            kind: CategoryKind::Common,
            paths: &[
                "./etc/hostname",
                "./etc/hosts",
                "./etc/resolv.conf",
                "./etc/timezone",
            ],
            export_only: false,
        },
        Category {
            id: "network",
            name: "Network configuration",
            description: "ifupdown configuration and interface drop-ins",
            kind: CategoryKind::Common,
            paths: &["./etc/network/"],
            export_only: false,
        },
        Category {
            id: "ssh",
            name: "SSH",
            description: "Host keys, sshd configuration and root's authorized keys",
            kind: CategoryKind::Common,
            paths: &["./etc/ssh/", "./root/.ssh/"],
            export_only: false,
        },
        Category {
            id: "cron",
            name: "Scheduled jobs",
            description: "System crontab and cron drop-in directories",
            kind: CategoryKind::Common,
            paths: &["./etc/crontab", "./etc/cron.d/", "./var/spool/cron/"],
            export_only: false,
        },
        Category {
            id: "systemd_units",
            name: "Custom systemd units",
            description: "Locally administered unit files and overrides",
            kind: CategoryKind::Common,
            paths: &["./etc/systemd/system/"],
            export_only: false,
        },
        Category {
            id: "apt",
            name: "APT configuration",
            description: "Repository lists, pins and keyrings",
            kind: CategoryKind::Common,
            paths: &["./etc/apt/"],
            export_only: false,
        },
        Category {
            id: "pve_cluster",
            name: "PVE cluster database",
            description: "pmxcfs backing store (config.db) and corosync configuration",
            kind: CategoryKind::Pve,
            paths: &["./var/lib/pve-cluster/", "./etc/corosync/"],
            export_only: false,
        },
        Category {
            id: "pve_config_export",
            name: "PVE configuration export",
            description: "Read-only export of the pmxcfs tree",
            kind: CategoryKind::Pve,
            paths: &["./etc/pve/"],
            export_only: true,
        },
        Category {
            id: "pve_storage",
            name: "PVE storage",
            description: "Storage definitions and vzdump defaults",
            kind: CategoryKind::Pve,
            paths: &["./etc/pve/storage.cfg", "./etc/vzdump.conf"],
            export_only: false,
        },
        Category {
            id: "pve_firewall",
            name: "PVE firewall",
            description: "Cluster firewall rules and per-node host rules",
            kind: CategoryKind::Pve,
            paths: &["./etc/pve/firewall/", "./etc/pve/nodes/*/host.fw"],
            export_only: false,
        },
        Category {
            id: "pve_jobs",
            name: "PVE jobs",
            description: "Backup and replication job definitions",
            kind: CategoryKind::Pve,
            paths: &["./etc/pve/jobs.cfg", "./etc/pve/replication.cfg"],
            export_only: false,
        },
        Category {
            id: "pve_notifications",
            name: "PVE notifications",
            description: "Notification endpoints, matchers and their secrets",
            kind: CategoryKind::Pve,
            paths: &[
                "./etc/pve/notifications.cfg",
                "./etc/pve/priv/notifications.cfg",
            ],
            export_only: false,
        },
        Category {
            id: "pve_access",
            name: "PVE access control",
            description: "Users, realms, tokens, TFA and ACLs",
            kind: CategoryKind::Pve,
            paths: &[
                "./etc/pve/user.cfg",
                "./etc/pve/domains.cfg",
                "./etc/pve/priv/",
            ],
            export_only: false,
        },
        Category {
            id: "ceph",
            name: "Ceph",
            description: "Ceph cluster configuration and keyrings",
            kind: CategoryKind::Pve,
            paths: &["./etc/ceph/"],
            export_only: false,
        },
        Category {
            id: "pbs_config",
            name: "PBS configuration",
            description: "The /etc/proxmox-backup tree",
            kind: CategoryKind::Pbs,
            paths: &["./etc/proxmox-backup/"],
            export_only: false,
        },
        Category {
            id: "pbs_datastore",
            name: "PBS datastores",
            description: "Datastore definitions (applied with mount guarding)",
            kind: CategoryKind::Pbs,
            paths: &["./etc/proxmox-backup/datastore.cfg"],
            export_only: false,
        },
        Category {
            id: "pbs_access",
            name: "PBS access control",
            description: "Users, ACLs, tokens, password hashes and TFA",
            kind: CategoryKind::Pbs,
            paths: &[
                "./etc/proxmox-backup/user.cfg",
                "./etc/proxmox-backup/acl.cfg",
                "./etc/proxmox-backup/shadow.json",
                "./etc/proxmox-backup/token.shadow",
                "./etc/proxmox-backup/tfa.json",
            ],
            export_only: false,
        },
        Category {
            id: "pbs_notifications",
            name: "PBS notifications",
            description: "Notification targets and their secrets",
            kind: CategoryKind::Pbs,
            paths: &[
                "./etc/proxmox-backup/notifications.cfg",
                "./etc/proxmox-backup/notifications-priv.cfg",
            ],
            export_only: false,
        },
    ];
    CATEGORIES
}

pub fn find(id: &str) -> Option<&'static Category> {
    registry().iter().find(|c| c.id == id)
}

pub fn available_for(system: SystemType) -> Vec<&'static Category> {
    registry().iter().filter(|c| c.applies_to(system)).collect()
}

/// A category instance inside a plan: paths become owned so SAFE-mode
/// sanitization can strip `/etc/pve` entries per selection.
#[derive(Debug, Clone)]
pub struct SelectedCategory {
    pub id: String,
    pub name: String,
    pub export_only: bool,
    pub paths: Vec<String>,
}

impl From<&Category> for SelectedCategory {
    fn from(def: &Category) -> Self {
        Self {
            id: def.id.to_string(),
            name: def.name.to_string(),
            export_only: def.export_only,
            paths: def.paths.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Prefix `./` if absent so archive names and category paths compare in
/// one canonical form.
pub fn normalize_archive_path(path: &str) -> String {
    if path.starts_with("./") {
        path.to_string()
    } else if let Some(stripped) = path.strip_prefix('/') {
        format!("./{stripped}")
    } else {
        format!("./{path}")
    }
}

/// Match an archive entry name against one category path pattern:
/// equality, directory prefix (pattern ends `/`), or glob.
pub fn pattern_matches(archive_path: &str, pattern: &str) -> bool {
    let path = normalize_archive_path(archive_path);
    let pattern = normalize_archive_path(pattern);

    if let Some(prefix) = pattern.strip_suffix('/') {
        return path == prefix || path.starts_with(&pattern);
    }
    if fsglob::has_glob_chars(&pattern) {
        return match GlobBuilder::new(&pattern).literal_separator(true).build() {
            Ok(glob) => glob.compile_matcher().is_match(&path),
            Err(_) => false,
        };
    }
    path == pattern
}

pub fn path_matches(archive_path: &str, category: &SelectedCategory) -> bool {
    category
        .paths
        .iter()
        .any(|p| pattern_matches(archive_path, p))
}

pub fn matches_any(archive_path: &str, selection: &[SelectedCategory]) -> bool {
    selection.iter().any(|c| path_matches(archive_path, c))
}

/// Deduplicated union of paths across a selection, in selection order.
pub fn paths_for(selection: &[SelectedCategory]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for cat in selection {
        for path in &cat.paths {
            let normalized = normalize_archive_path(path);
            if seen.insert(normalized.clone()) {
                out.push(normalized);
            }
        }
    }
    out
}

fn is_pmxcfs_path(path: &str) -> bool {
    let p = normalize_archive_path(path);
    p == "./etc/pve" || p == "./etc/pve/" || p.starts_with("./etc/pve/")
}

/// SAFE cluster recovery: strip every `/etc/pve` path from the selection.
/// A category whose paths all lived under `/etc/pve` disappears entirely.
pub fn sanitize_for_cluster_recovery(selection: &mut Vec<SelectedCategory>) {
    selection.retain_mut(|cat| {
        let all_pmxcfs = !cat.paths.is_empty() && cat.paths.iter().all(|p| is_pmxcfs_path(p));
        cat.paths.retain(|p| !is_pmxcfs_path(p));
        !(all_pmxcfs && cat.paths.is_empty())
    });
}
