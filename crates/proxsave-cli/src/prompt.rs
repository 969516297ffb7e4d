use std::io::{self, BufRead, Write};

use proxsave_core::category::Category;
use proxsave_core::error::{RestoreError, Result};
use proxsave_core::plan::{ClusterRestoreMode, RestoreMode};
use proxsave_core::ui::RestoreUi;

/// Terminal implementation of the prompting capability. Prompts go to
/// stderr so stdout stays scriptable.
pub struct TerminalUi {
    pub assume_yes: bool,
}

impl TerminalUi {
    fn read_line(&self) -> Result<String> {
        let mut line = String::new();
        io::stdin()
            .lock()
            .read_line(&mut line)
            .map_err(RestoreError::Io)?;
        Ok(line.trim().to_string())
    }
}

impl RestoreUi for TerminalUi {
    fn confirm(&self, question: &str, default_yes: bool) -> Result<bool> {
        if self.assume_yes {
            return Ok(true);
        }
        let hint = if default_yes { "[Y/n]" } else { "[y/N]" };
        eprint!("{question} {hint} ");
        io::stderr().flush()?;

        let answer = self.read_line()?.to_lowercase();
        Ok(match answer.as_str() {
            "" => default_yes,
            "y" | "yes" => true,
            _ => false,
        })
    }

    fn choose_mode(&self, available: &[RestoreMode]) -> Result<Option<RestoreMode>> {
        eprintln!("Restore modes:");
        for (idx, mode) in available.iter().enumerate() {
            eprintln!("  {}) {}", idx + 1, mode.as_str());
        }
        eprint!("Select a mode (empty cancels): ");
        io::stderr().flush()?;

        let answer = self.read_line()?;
        if answer.is_empty() {
            return Ok(None);
        }
        let index: usize = match answer.parse() {
            Ok(n) => n,
            Err(_) => return Ok(None),
        };
        Ok(available.get(index.wrapping_sub(1)).copied())
    }

    fn choose_categories(&self, available: &[&Category]) -> Result<Option<Vec<String>>> {
        eprintln!("Available categories:");
        for cat in available {
            let marker = if cat.export_only { " (export-only)" } else { "" };
            eprintln!("  {:<20} {}{}", cat.id, cat.description, marker);
        }
        eprint!("Category ids, comma-separated (empty cancels): ");
        io::stderr().flush()?;

        let answer = self.read_line()?;
        if answer.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            answer
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        ))
    }

    fn choose_cluster_mode(&self) -> Result<Option<ClusterRestoreMode>> {
        eprintln!("This backup was taken on a cluster member.");
        eprintln!("  1) SAFE      export cluster data for inspection, do not write it");
        eprintln!("  2) RECOVERY  write config.db back and rebuild pmxcfs");
        eprint!("Select (empty cancels): ");
        io::stderr().flush()?;

        Ok(match self.read_line()?.as_str() {
            "1" => Some(ClusterRestoreMode::Safe),
            "2" => Some(ClusterRestoreMode::Recovery),
            _ => None,
        })
    }

    fn notice(&self, message: &str) {
        eprintln!("{message}");
    }
}
