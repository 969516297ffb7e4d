use crate::category::{self, Category, SelectedCategory, SystemType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    Full,
    Storage,
    Base,
    Custom,
}

impl RestoreMode {
    pub const ALL: [RestoreMode; 4] = [
        RestoreMode::Full,
        RestoreMode::Storage,
        RestoreMode::Base,
        RestoreMode::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreMode::Full => "full",
            RestoreMode::Storage => "storage",
            RestoreMode::Base => "base",
            RestoreMode::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(RestoreMode::Full),
            "storage" => Some(RestoreMode::Storage),
            "base" => Some(RestoreMode::Base),
            "custom" => Some(RestoreMode::Custom),
            _ => None,
        }
    }
}

/// How a cluster backup's pmxcfs data is handled: SAFE exports it for
/// inspection, RECOVERY writes `config.db` back onto the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterRestoreMode {
    Safe,
    Recovery,
}

/// How PBS object appliers treat live objects missing from the backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PbsBehavior {
    #[default]
    Unspecified,
    Merge,
    CleanOneToOne,
}

impl PbsBehavior {
    /// Strict mode removes live objects that the staged file no longer
    /// lists. Only `CleanOneToOne` opts in.
    pub fn strict(&self) -> bool {
        matches!(self, PbsBehavior::CleanOneToOne)
    }
}

/// The routed selection a restore run executes.
#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub system_type: SystemType,
    pub mode: RestoreMode,
    pub normal_categories: Vec<SelectedCategory>,
    pub export_categories: Vec<SelectedCategory>,
    pub needs_cluster_restore: bool,
    pub cluster_safe_mode: bool,
    pub cluster_backup: bool,
    pub needs_pbs_services: bool,
    pub pbs_behavior: PbsBehavior,
}

impl RestorePlan {
    pub fn build(
        system_type: SystemType,
        mode: RestoreMode,
        selected: Vec<SelectedCategory>,
        cluster_backup: bool,
        cluster_mode: Option<ClusterRestoreMode>,
        pbs_behavior: PbsBehavior,
    ) -> Self {
        let mut normal: Vec<SelectedCategory> = Vec::new();
        let mut export: Vec<SelectedCategory> = Vec::new();
        for cat in selected {
            if cat.export_only {
                export.push(cat);
            } else {
                normal.push(cat);
            }
        }

        let mut cluster_safe_mode = false;
        let mut needs_cluster_restore = false;
        if let Some(idx) = normal.iter().position(|c| c.id == "pve_cluster") {
            if cluster_mode == Some(ClusterRestoreMode::Safe) {
                cluster_safe_mode = true;
                let mut cluster = normal.remove(idx);
                cluster.export_only = true;
                export.push(cluster);
                category::sanitize_for_cluster_recovery(&mut normal);
            } else {
                needs_cluster_restore = true;
            }
        }

        let needs_pbs_services = system_type == SystemType::Pbs
            && normal.iter().any(|c| {
                c.paths
                    .iter()
                    .any(|p| category::normalize_archive_path(p).starts_with("./etc/proxmox-backup"))
            });

        Self {
            system_type,
            mode,
            normal_categories: normal,
            export_categories: export,
            needs_cluster_restore,
            cluster_safe_mode,
            cluster_backup,
            needs_pbs_services,
            pbs_behavior,
        }
    }

    pub fn is_selected(&self, id: &str) -> bool {
        self.normal_categories.iter().any(|c| c.id == id)
            || self.export_categories.iter().any(|c| c.id == id)
    }

    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Restore plan ({} host, {} mode)\n",
            self.system_type.as_str(),
            self.mode.as_str()
        ));
        out.push_str("  Write to the live system:\n");
        if self.normal_categories.is_empty() {
            out.push_str("    (nothing)\n");
        }
        for cat in &self.normal_categories {
            out.push_str(&format!("    - {} ({})\n", cat.name, cat.id));
        }
        if !self.export_categories.is_empty() {
            out.push_str("  Export only:\n");
            for cat in &self.export_categories {
                out.push_str(&format!("    - {} ({})\n", cat.name, cat.id));
            }
        }
        if self.cluster_safe_mode {
            out.push_str("  Cluster data is exported, not written (SAFE mode).\n");
        }
        if self.needs_cluster_restore {
            out.push_str("  Cluster database will be written back (RECOVERY mode).\n");
        }
        out
    }
}

/// Categories implied by a non-custom mode.
pub fn mode_categories(system: SystemType, mode: RestoreMode) -> Vec<&'static Category> {
    let available = category::available_for(system);
    match mode {
        RestoreMode::Full => available,
        RestoreMode::Storage => available
            .into_iter()
            .filter(|c| matches!(c.id, "pve_storage" | "pve_jobs" | "pbs_datastore"))
            .collect(),
        RestoreMode::Base => available
            .into_iter()
            .filter(|c| {
                matches!(
                    c.id,
                    "system_base" | "network" | "ssh" | "cron" | "systemd_units" | "apt"
                )
            })
            .collect(),
        RestoreMode::Custom => available,
    }
}
