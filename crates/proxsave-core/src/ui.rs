use crate::category::Category;
use crate::error::Result;
use crate::plan::{ClusterRestoreMode, RestoreMode};

/// Prompting capability. The core never reads stdin itself; the CLI
/// provides a terminal implementation and tests provide scripted answers.
///
/// Selection methods return `None` when the operator cancels, which the
/// orchestrator turns into `RestoreError::Aborted`.
pub trait RestoreUi: Send + Sync {
    /// Yes/no question. `default_yes` is what plain Enter selects.
    fn confirm(&self, question: &str, default_yes: bool) -> Result<bool>;

    /// Pick the restore mode.
    fn choose_mode(&self, available: &[RestoreMode]) -> Result<Option<RestoreMode>>;

    /// Pick category ids for a custom restore.
    fn choose_categories(&self, available: &[&Category]) -> Result<Option<Vec<String>>>;

    /// For cluster backups: SAFE (export-only cluster data) vs RECOVERY
    /// (write `config.db` back and rebuild pmxcfs).
    fn choose_cluster_mode(&self) -> Result<Option<ClusterRestoreMode>>;

    /// Informational output (plan summaries, rollback hints).
    fn notice(&self, message: &str);
}

/// Non-interactive implementation that accepts every confirmation and
/// refuses every selection. Used by scripted invocations that pass the
/// whole plan on the command line.
#[derive(Debug, Default)]
pub struct NonInteractiveUi {
    pub assume_yes: bool,
}

impl RestoreUi for NonInteractiveUi {
    fn confirm(&self, _question: &str, default_yes: bool) -> Result<bool> {
        Ok(self.assume_yes || default_yes)
    }

    fn choose_mode(&self, _available: &[RestoreMode]) -> Result<Option<RestoreMode>> {
        Ok(None)
    }

    fn choose_categories(&self, _available: &[&Category]) -> Result<Option<Vec<String>>> {
        Ok(None)
    }

    fn choose_cluster_mode(&self) -> Result<Option<ClusterRestoreMode>> {
        Ok(None)
    }

    fn notice(&self, message: &str) {
        tracing::info!("{message}");
    }
}
