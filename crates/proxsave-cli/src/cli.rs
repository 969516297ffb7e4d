use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "proxsave",
    version,
    about = "Restore Proxmox VE / Proxmox Backup Server configuration from an archive bundle",
    after_help = "\
The bundle must already be decrypted. Safety backups, restore logs and
deferred configuration fragments are written under /tmp/proxsave."
)]
pub(crate) struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Restore configuration from an archive bundle
    Restore {
        /// Path to the decrypted archive (.tar, .tar.gz, .tar.xz, .tar.zst, .tar.bz2, .tar.lzma)
        bundle: String,

        /// Host type the archive was taken from
        #[arg(long, value_parser = ["pve", "pbs"])]
        system: String,

        /// Restore mode; prompted interactively when omitted
        #[arg(long, value_parser = ["full", "storage", "base", "custom"])]
        mode: Option<String>,

        /// Category id to restore (repeatable, implies --mode custom)
        #[arg(long = "category")]
        categories: Vec<String>,

        /// The backup was taken on a cluster member
        #[arg(long)]
        cluster: bool,

        /// How PBS object appliers treat live objects missing from the backup
        #[arg(long, value_parser = ["merge", "clean-1to1"])]
        pbs_behavior: Option<String>,

        /// Where export-only categories are written
        #[arg(long, default_value = "/root")]
        export_base: String,

        /// Answer yes to every confirmation (scripted runs)
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// List the category registry
    Categories {
        /// Limit to one host type
        #[arg(long, value_parser = ["pve", "pbs"])]
        system: Option<String>,
    },

    /// Repair interface names in /etc/network/interfaces* after restoring
    /// to different hardware
    NicRepair {
        /// Root holding the restored tree with the saved inventory
        #[arg(long, default_value = "/")]
        stage_root: String,

        /// Apply renames whose old name still exists on this host
        #[arg(long)]
        include_conflicts: bool,

        /// Print the plan without writing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove aged safety backups from /tmp/proxsave
    PurgeSafetyBackups {
        /// Age threshold in hours
        #[arg(long, default_value_t = 72)]
        older_than: u64,
    },
}
