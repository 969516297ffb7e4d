use std::collections::VecDeque;
use std::io::Read;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::cancel::CancelToken;
use crate::category::Category;
use crate::env::{Clock, CmdOutput, CmdSpec, CommandRunner};
use crate::error::{RestoreError, Result};
use crate::plan::{ClusterRestoreMode, RestoreMode};
use crate::ui::RestoreUi;

pub fn output(code: i32, stdout: &str) -> CmdOutput {
    CmdOutput {
        status_code: Some(code),
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
    }
}

pub struct FixedClock(pub SystemTime);

impl FixedClock {
    pub fn at_unix(secs: u64) -> Self {
        Self(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
    }
}

impl Clock for FixedClock {
    fn now(&self) -> SystemTime {
        self.0
    }
}

/// Scripted command runner. Rules match on a substring of the redacted
/// display line, first match wins; unmatched commands succeed with empty
/// output. Every invocation is recorded for assertions.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<(String, CmdOutput)>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, needle: &str, out: CmdOutput) -> Self {
        self.rules.lock().unwrap().push((needle.to_string(), out));
        self
    }

    pub fn fail_on(self, needle: &str, code: i32, stderr: &str) -> Self {
        self.on(
            needle,
            CmdOutput {
                status_code: Some(code),
                stdout: Vec::new(),
                stderr: stderr.as_bytes().to_vec(),
            },
        )
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(needle)).count()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: &CmdSpec, _timeout: Duration, cancel: &CancelToken) -> Result<CmdOutput> {
        cancel.check()?;
        let line = spec.display_line();
        self.calls.lock().unwrap().push(line.clone());
        let rules = self.rules.lock().unwrap();
        for (needle, out) in rules.iter() {
            if line.contains(needle.as_str()) {
                return Ok(out.clone());
            }
        }
        Ok(output(0, ""))
    }

    fn open_stream(&self, spec: &CmdSpec, _input: std::fs::File) -> Result<Box<dyn Read + Send>> {
        Err(RestoreError::Other(format!(
            "scripted runner cannot stream '{}'",
            spec.display_line()
        )))
    }
}

/// Scripted UI: confirmation answers pop from a queue, then fall back to a
/// fixed default. Selection prompts return preset values.
pub struct ScriptedUi {
    confirm_answers: Mutex<VecDeque<bool>>,
    pub confirm_fallback: bool,
    pub mode: Option<RestoreMode>,
    pub categories: Option<Vec<String>>,
    pub cluster_mode: Option<ClusterRestoreMode>,
    pub notices: Mutex<Vec<String>>,
}

impl ScriptedUi {
    pub fn accepting() -> Self {
        Self {
            confirm_answers: Mutex::new(VecDeque::new()),
            confirm_fallback: true,
            mode: None,
            categories: None,
            cluster_mode: None,
            notices: Mutex::new(Vec::new()),
        }
    }

    pub fn with_confirms(answers: &[bool]) -> Self {
        let ui = Self::accepting();
        *ui.confirm_answers.lock().unwrap() = answers.iter().copied().collect();
        ui
    }
}

impl RestoreUi for ScriptedUi {
    fn confirm(&self, _question: &str, _default_yes: bool) -> Result<bool> {
        Ok(self
            .confirm_answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.confirm_fallback))
    }

    fn choose_mode(&self, _available: &[RestoreMode]) -> Result<Option<RestoreMode>> {
        Ok(self.mode)
    }

    fn choose_categories(&self, _available: &[&Category]) -> Result<Option<Vec<String>>> {
        Ok(self.categories.clone())
    }

    fn choose_cluster_mode(&self) -> Result<Option<ClusterRestoreMode>> {
        Ok(self.cluster_mode)
    }

    fn notice(&self, message: &str) {
        self.notices.lock().unwrap().push(message.to_string());
    }
}
