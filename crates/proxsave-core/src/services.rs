use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::env::{CmdSpec, CommandRunner};
use crate::error::{RestoreError, Result};

/// PVE services stopped (in order) before a cluster restore and started in
/// reverse afterwards.
pub const PVE_CLUSTER_SERVICES: &[&str] = &["pve-cluster", "pvedaemon", "pveproxy", "pvestatd"];

/// PBS services stopped before `/etc/proxmox-backup` mutation.
pub const PBS_SERVICES: &[&str] = &["proxmox-backup-proxy", "proxmox-backup"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceState {
    Stopped,
    Active,
}

/// Wraps the service manager with verified stops and retried starts.
pub struct ServiceCoordinator<'a> {
    runner: &'a dyn CommandRunner,
    pub poll_interval: Duration,
    pub verify_timeout: Duration,
    pub start_timeout: Duration,
    pub op_timeout: Duration,
}

impl<'a> ServiceCoordinator<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self {
            runner,
            poll_interval: Duration::from_millis(500),
            verify_timeout: Duration::from_secs(30),
            start_timeout: Duration::from_secs(60),
            op_timeout: Duration::from_secs(30),
        }
    }

    fn systemctl(&self, args: &[&str]) -> CmdSpec {
        CmdSpec::new("systemctl").args(args.iter().copied())
    }

    /// `is-active` output is advisory text; substring matches beat exact
    /// comparison because unit states can arrive decorated.
    fn state(&self, service: &str, cancel: &CancelToken) -> Result<ServiceState> {
        let spec = self.systemctl(&["is-active", service]);
        let output = self.runner.run(&spec, self.op_timeout, cancel)?;
        let text = format!("{} {}", output.stdout_text(), output.stderr_text()).to_lowercase();

        if text.contains("deactivating") || text.contains("activating") {
            return Ok(ServiceState::Active);
        }
        if text.contains("inactive") || text.contains("failed") || text.contains("dead") {
            return Ok(ServiceState::Stopped);
        }
        Ok(ServiceState::Active)
    }

    fn wait_stopped(&self, service: &str, cancel: &CancelToken) -> Result<bool> {
        let deadline = Instant::now() + self.verify_timeout;
        loop {
            cancel.check()?;
            if self.state(service, cancel)? == ServiceState::Stopped {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    /// Stop with four progressively more forceful strategies, verifying
    /// between attempts. A verified stop fires `reset-failed` (ignored).
    pub fn stop(&self, service: &str, cancel: &CancelToken) -> Result<()> {
        let strategies: [&[&str]; 4] = [
            &["stop", "--no-block", service],
            &["stop", service],
            &["kill", "--signal=SIGTERM", "--kill-who=all", service],
            &["kill", "--signal=SIGKILL", "--kill-who=all", service],
        ];

        for (attempt, args) in strategies.iter().enumerate() {
            cancel.check()?;
            tracing::debug!("stopping {service} (attempt {})", attempt + 1);
            let spec = self.systemctl(args);
            match self.runner.run(&spec, self.op_timeout, cancel) {
                Ok(_) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => tracing::debug!("stop attempt on {service} reported: {e}"),
            }
            if self.wait_stopped(service, cancel)? {
                let reset = self.systemctl(&["reset-failed", service]);
                let _ = self.runner.run(&reset, self.op_timeout, cancel);
                return Ok(());
            }
        }

        Err(RestoreError::Service {
            action: "stop",
            services: vec![service.to_string()],
        })
    }

    /// `start`, retry `start`, then `restart`.
    pub fn start(&self, service: &str, cancel: &CancelToken) -> Result<()> {
        let attempts: [&[&str]; 3] = [
            &["start", service],
            &["start", service],
            &["restart", service],
        ];

        for args in attempts {
            cancel.check()?;
            let spec = self.systemctl(args);
            match self.runner.run(&spec, self.start_timeout, cancel) {
                Ok(output) if output.success() => return Ok(()),
                Ok(_) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => tracing::debug!("start attempt on {service} reported: {e}"),
            }
        }

        Err(RestoreError::Service {
            action: "start",
            services: vec![service.to_string()],
        })
    }

    /// Stop a whole group; the aggregated error names every service that
    /// would not stop.
    pub fn stop_group(&self, services: &[&str], cancel: &CancelToken) -> Result<()> {
        let mut failed = Vec::new();
        for service in services {
            match self.stop(service, cancel) {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(_) => failed.push(service.to_string()),
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(RestoreError::Service {
                action: "stop",
                services: failed,
            })
        }
    }

    pub fn start_group(&self, services: &[&str], cancel: &CancelToken) -> Result<()> {
        let mut failed = Vec::new();
        for service in services {
            match self.start(service, cancel) {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(_) => failed.push(service.to_string()),
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(RestoreError::Service {
                action: "start",
                services: failed,
            })
        }
    }
}
