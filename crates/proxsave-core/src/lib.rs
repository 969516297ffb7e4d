//! ProxSave core: a staged, transactional restore pipeline for Proxmox VE
//! and Proxmox Backup Server configuration state.
//!
//! The pipeline runs strictly left to right within one restore:
//! category analysis and planning, safety backup, service stop, sandboxed
//! archive extraction, staged appliers with atomic swaps, the firewall
//! guarded apply, NIC rename repair, service start. Rollback is layered:
//! the safety backup covers the extract stage and the firewall dead-man
//! switch covers the firewall stage.

pub mod cancel;
pub mod category;
pub mod chunked;
pub mod env;
pub mod error;
pub mod extract;
pub mod firewall;
pub mod fsglob;
pub mod mount;
pub mod nicrepair;
pub mod orchestrator;
pub mod plan;
pub mod platform;
pub mod safety;
pub mod sandbox;
pub mod services;
pub mod staged;
pub mod ui;

#[cfg(test)]
pub(crate) mod testutil;
