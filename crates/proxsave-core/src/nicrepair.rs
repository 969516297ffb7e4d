use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::env::{format_timestamp, Clock, CmdSpec, CommandRunner};
use crate::error::Result;
use crate::staged::atomic::atomic_write;

const TOOL_TIMEOUT: Duration = Duration::from_secs(15);

/// Archive entries that may hold the saved network inventory, tried in
/// order.
pub const INVENTORY_CANDIDATES: &[&str] = &[
    "var/lib/proxsave/network_inventory.json",
    "etc/proxsave/network_inventory.json",
    "network_inventory.json",
];

/// Characters that may appear in an interface name; both neighbors of a
/// replaced token must fall outside this set.
fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Stable identifiers of one NIC, saved at backup time and collected from
/// the live host at restore time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterfaceInventory {
    pub name: String,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub permanent_mac: Option<String>,
    #[serde(default)]
    pub pci_path: Option<String>,
    #[serde(default)]
    pub udev_id_serial: Option<String>,
    #[serde(default)]
    pub udev_pci_slot: Option<String>,
    #[serde(default)]
    pub udev_id_path: Option<String>,
    #[serde(default)]
    pub udev_net_name_path: Option<String>,
    #[serde(default)]
    pub udev_net_name_slot: Option<String>,
    #[serde(default)]
    pub is_virtual: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    PermanentMac,
    Mac,
    UdevIdSerial,
    UdevPciSlot,
    UdevIdPath,
    PciPath,
    UdevNetNamePath,
    UdevNetNameSlot,
}

/// Strict preference order: hardware-burned identity first, firmware
/// naming hints last.
pub const METHOD_ORDER: [MatchMethod; 8] = [
    MatchMethod::PermanentMac,
    MatchMethod::Mac,
    MatchMethod::UdevIdSerial,
    MatchMethod::UdevPciSlot,
    MatchMethod::UdevIdPath,
    MatchMethod::PciPath,
    MatchMethod::UdevNetNamePath,
    MatchMethod::UdevNetNameSlot,
];

fn identifier(iface: &InterfaceInventory, method: MatchMethod) -> Option<String> {
    let raw = match method {
        MatchMethod::PermanentMac => iface.permanent_mac.as_deref(),
        MatchMethod::Mac => iface.mac.as_deref(),
        MatchMethod::UdevIdSerial => iface.udev_id_serial.as_deref(),
        MatchMethod::UdevPciSlot => iface.udev_pci_slot.as_deref(),
        MatchMethod::UdevIdPath => iface.udev_id_path.as_deref(),
        MatchMethod::PciPath => iface.pci_path.as_deref(),
        MatchMethod::UdevNetNamePath => iface.udev_net_name_path.as_deref(),
        MatchMethod::UdevNetNameSlot => iface.udev_net_name_slot.as_deref(),
    }?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(match method {
        MatchMethod::PermanentMac | MatchMethod::Mac => trimmed.to_ascii_lowercase(),
        _ => trimmed.to_string(),
    })
}

fn has_any_identifier(iface: &InterfaceInventory) -> bool {
    METHOD_ORDER
        .iter()
        .any(|m| identifier(iface, *m).is_some())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicMappingEntry {
    pub old_name: String,
    pub new_name: String,
    pub method: MatchMethod,
    pub identifier: String,
}

#[derive(Debug, Default)]
pub struct NicRepairPlan {
    /// Renames whose old name no longer exists on the host.
    pub safe: Vec<NicMappingEntry>,
    /// Renames whose old name is also a live interface; applying these
    /// swaps meaning and needs explicit operator consent.
    pub conflicts: Vec<NicMappingEntry>,
}

impl NicRepairPlan {
    pub fn is_empty(&self) -> bool {
        self.safe.is_empty() && self.conflicts.is_empty()
    }
}

/// Load the saved inventory from the extracted stage, trying each known
/// location. Accepts a bare array or an `interfaces` array.
pub fn load_backup_inventory(stage_root: &Path) -> Result<Option<Vec<InterfaceInventory>>> {
    for candidate in INVENTORY_CANDIDATES {
        let path = stage_root.join(candidate);
        let Ok(bytes) = std::fs::read(&path) else {
            continue;
        };
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        let items = match value {
            serde_json::Value::Array(items) => items,
            serde_json::Value::Object(mut map) => match map.remove("interfaces") {
                Some(serde_json::Value::Array(items)) => items,
                _ => continue,
            },
            _ => continue,
        };
        let mut out = Vec::new();
        for item in items {
            out.push(serde_json::from_value(item)?);
        }
        return Ok(Some(out));
    }
    Ok(None)
}

/// Scan the live host: `/sys/class/net` for names, MACs and PCI device
/// links, `ethtool -P` for the permanent MAC, `udevadm` for properties.
/// Tool failures leave the corresponding fields empty.
pub fn collect_current(
    runner: &dyn CommandRunner,
    cancel: &CancelToken,
    sys_class_net: &Path,
) -> Result<Vec<InterfaceInventory>> {
    let mut names: Vec<String> = std::fs::read_dir(sys_class_net)?
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    let mut out = Vec::new();
    for name in names {
        cancel.check()?;
        let dir = sys_class_net.join(&name);

        let mut iface = InterfaceInventory {
            name: name.clone(),
            is_virtual: !dir.join("device").exists(),
            ..Default::default()
        };
        if let Ok(mac) = std::fs::read_to_string(dir.join("address")) {
            let mac = mac.trim().to_ascii_lowercase();
            if !mac.is_empty() && mac != "00:00:00:00:00:00" {
                iface.mac = Some(mac);
            }
        }
        if let Ok(target) = std::fs::read_link(dir.join("device")) {
            iface.pci_path = Some(target.to_string_lossy().into_owned());
        }

        let ethtool = CmdSpec::new("ethtool").arg("-P").arg(&name);
        if let Ok(output) = runner.run(&ethtool, TOOL_TIMEOUT, cancel) {
            if output.success() {
                if let Some(addr) = output
                    .stdout_text()
                    .lines()
                    .find_map(|l| l.split_once(':').map(|(_, v)| v.trim().to_string()))
                {
                    // `ethtool -P` prints all-zeros when unsupported.
                    let addr = addr.to_ascii_lowercase();
                    if !addr.is_empty() && !addr.chars().all(|c| c == '0' || c == ':') {
                        iface.permanent_mac = Some(addr);
                    }
                }
            }
        }

        let udevadm = CmdSpec::new("udevadm")
            .arg("info")
            .arg("-q")
            .arg("property")
            .arg("-p")
            .arg(format!("/sys/class/net/{name}"));
        if let Ok(output) = runner.run(&udevadm, TOOL_TIMEOUT, cancel) {
            if output.success() {
                for line in output.stdout_text().lines() {
                    let Some((key, value)) = line.split_once('=') else {
                        continue;
                    };
                    let value = value.trim().to_string();
                    if value.is_empty() {
                        continue;
                    }
                    match key.trim() {
                        "ID_SERIAL" => iface.udev_id_serial = Some(value),
                        "PCI_SLOT_NAME" => iface.udev_pci_slot = Some(value),
                        "ID_PATH" => iface.udev_id_path = Some(value),
                        "ID_NET_NAME_PATH" => iface.udev_net_name_path = Some(value),
                        "ID_NET_NAME_SLOT" => iface.udev_net_name_slot = Some(value),
                        _ => {}
                    }
                }
            }
        }

        out.push(iface);
    }
    Ok(out)
}

/// Compute the rename plan. Per-method indices over the current host drop
/// ambiguous identifiers; each backup NIC takes the first method in the
/// preference order that yields an unambiguous, unused current name.
pub fn compute_plan(
    backup: &[InterfaceInventory],
    current: &[InterfaceInventory],
) -> NicRepairPlan {
    // identifier -> interface name, ambiguous keys removed.
    let mut indices: HashMap<MatchMethod, HashMap<String, String>> = HashMap::new();
    for method in METHOD_ORDER {
        let mut index: HashMap<String, String> = HashMap::new();
        let mut ambiguous: HashSet<String> = HashSet::new();
        for iface in current {
            let Some(ident) = identifier(iface, method) else {
                continue;
            };
            if ambiguous.contains(&ident) {
                continue;
            }
            if index.insert(ident.clone(), iface.name.clone()).is_some() {
                index.remove(&ident);
                ambiguous.insert(ident);
            }
        }
        indices.insert(method, index);
    }

    let current_names: HashSet<&str> = current.iter().map(|i| i.name.as_str()).collect();
    let mut used: HashSet<String> = HashSet::new();
    let mut plan = NicRepairPlan::default();

    for iface in backup {
        if iface.is_virtual || !has_any_identifier(iface) {
            continue;
        }
        for method in METHOD_ORDER {
            let Some(ident) = identifier(iface, method) else {
                continue;
            };
            let Some(new_name) = indices[&method].get(&ident) else {
                continue;
            };
            if new_name.is_empty() || used.contains(new_name) {
                continue;
            }
            used.insert(new_name.clone());
            if *new_name != iface.name {
                let entry = NicMappingEntry {
                    old_name: iface.name.clone(),
                    new_name: new_name.clone(),
                    method,
                    identifier: ident,
                };
                if current_names.contains(entry.old_name.as_str()) {
                    plan.conflicts.push(entry);
                } else {
                    plan.safe.push(entry);
                }
            }
            break;
        }
    }

    plan
}

/// Token-aware rename: `old` is replaced only where both boundary
/// characters fall outside the interface-name charset, and longer names
/// substitute first so `eth10` never matches an `eth1` rule.
pub fn substitute_tokens(text: &str, renames: &HashMap<String, String>) -> String {
    let mut keys: Vec<&String> = renames.keys().collect();
    keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut pos = 0usize;

    'outer: while pos < chars.len() {
        let boundary_before = pos == 0 || !is_name_char(chars[pos - 1]);
        if boundary_before {
            for key in &keys {
                let key_chars: Vec<char> = key.chars().collect();
                let end = pos + key_chars.len();
                if end <= chars.len() && chars[pos..end] == key_chars[..] {
                    let boundary_after = end == chars.len() || !is_name_char(chars[end]);
                    if boundary_after {
                        out.push_str(&renames[*key]);
                        pos = end;
                        continue 'outer;
                    }
                }
            }
        }
        out.push(chars[pos]);
        pos += 1;
    }
    out
}

#[derive(Debug, Default)]
pub struct NicApplyReport {
    pub changed_files: Vec<PathBuf>,
    pub backup_dir: Option<PathBuf>,
}

/// Rewrite `interfaces` and every file under `interfaces.d/` with the
/// selected mappings. Originals of changed files are snapshotted under
/// `<tmp>/nic_repair_<ts>_<seq>/` (preserving their absolute path) before
/// the atomic write.
pub fn apply(
    clock: &dyn Clock,
    tmp_dir: &Path,
    etc_network: &Path,
    mappings: &[NicMappingEntry],
) -> Result<NicApplyReport> {
    let mut report = NicApplyReport::default();
    if mappings.is_empty() {
        return Ok(report);
    }

    let renames: HashMap<String, String> = mappings
        .iter()
        .map(|m| (m.old_name.clone(), m.new_name.clone()))
        .collect();

    let mut files = vec![etc_network.join("interfaces")];
    if let Ok(entries) = std::fs::read_dir(etc_network.join("interfaces.d")) {
        let mut extra: Vec<PathBuf> = entries
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.path())
            .collect();
        extra.sort();
        files.extend(extra);
    }

    let mut pending: Vec<(PathBuf, String)> = Vec::new();
    for file in files {
        let Ok(original) = std::fs::read_to_string(&file) else {
            continue;
        };
        let updated = substitute_tokens(&original, &renames);
        if updated != original {
            pending.push((file, updated));
        }
    }
    if pending.is_empty() {
        return Ok(report);
    }

    let stamp = format_timestamp(clock.now());
    let backup_root = unique_backup_dir(tmp_dir, &stamp)?;

    for (file, updated) in pending {
        let rel: PathBuf = file.components().skip(1).collect();
        let snapshot = backup_root.join(if rel.as_os_str().is_empty() {
            PathBuf::from("interfaces")
        } else {
            rel
        });
        if let Some(parent) = snapshot.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&file, &snapshot)?;

        let mode = file_mode(&file).unwrap_or(0o644);
        atomic_write(&file, updated.as_bytes(), mode)?;
        report.changed_files.push(file);
    }

    report.backup_dir = Some(backup_root);
    Ok(report)
}

fn unique_backup_dir(tmp_dir: &Path, stamp: &str) -> Result<PathBuf> {
    for seq in 0u32.. {
        let candidate = tmp_dir.join(format!("nic_repair_{stamp}_{seq}"));
        if !candidate.exists() {
            std::fs::create_dir_all(&candidate)?;
            return Ok(candidate);
        }
    }
    unreachable!("sequence space exhausted");
}

fn file_mode(path: &Path) -> Option<u32> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        std::fs::metadata(path).ok().map(|m| m.mode() & 0o7777)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FixedClock;

    fn nic(name: &str, mac: Option<&str>) -> InterfaceInventory {
        InterfaceInventory {
            name: name.to_string(),
            mac: mac.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn substitution_is_token_aware() {
        let mut renames = HashMap::new();
        renames.insert("eth0".to_string(), "ens18".to_string());

        let text = "iface eth0 inet static\n\taddress 10.0.0.2/24\neth01\n";
        let result = substitute_tokens(text, &renames);
        assert_eq!(result, "iface ens18 inet static\n\taddress 10.0.0.2/24\neth01\n");
    }

    #[test]
    fn longer_names_substitute_first() {
        let mut renames = HashMap::new();
        renames.insert("eth1".to_string(), "ens19".to_string());
        renames.insert("eth10".to_string(), "ens20".to_string());

        let result = substitute_tokens("auto eth1\nauto eth10\n", &renames);
        assert_eq!(result, "auto ens19\nauto ens20\n");
    }

    #[test]
    fn substitution_respects_punctuation_boundaries() {
        let mut renames = HashMap::new();
        renames.insert("eth0".to_string(), "ens18".to_string());

        let result = substitute_tokens("bridge-ports eth0 eth0.100\n", &renames);
        assert_eq!(result, "bridge-ports ens18 ens18.100\n");
        // Inside a larger token nothing changes.
        let result = substitute_tokens("myeth0name\n", &renames);
        assert_eq!(result, "myeth0name\n");
    }

    #[test]
    fn plan_prefers_permanent_mac_and_falls_back() {
        let mut backup_nic = nic("eth0", Some("aa:bb:cc:dd:ee:01"));
        backup_nic.permanent_mac = Some("AA:BB:CC:DD:EE:01".to_string());
        let backup = vec![backup_nic];

        let mut current_nic = nic("ens18", None);
        current_nic.permanent_mac = Some("aa:bb:cc:dd:ee:01".to_string());
        let current = vec![current_nic];

        let plan = compute_plan(&backup, &current);
        assert_eq!(plan.safe.len(), 1);
        assert_eq!(plan.safe[0].old_name, "eth0");
        assert_eq!(plan.safe[0].new_name, "ens18");
        assert_eq!(plan.safe[0].method, MatchMethod::PermanentMac);
    }

    #[test]
    fn ambiguous_identifiers_are_dropped_from_indices() {
        let backup = vec![nic("eth0", Some("aa:aa:aa:aa:aa:aa"))];
        // Two current NICs share the MAC (bond members): no match.
        let current = vec![
            nic("ens18", Some("aa:aa:aa:aa:aa:aa")),
            nic("ens19", Some("aa:aa:aa:aa:aa:aa")),
        ];
        let plan = compute_plan(&backup, &current);
        assert!(plan.is_empty());
    }

    #[test]
    fn each_current_name_is_used_at_most_once() {
        let backup = vec![
            nic("eth0", Some("aa:aa:aa:aa:aa:01")),
            nic("eth1", Some("aa:aa:aa:aa:aa:01")),
        ];
        let current = vec![nic("ens18", Some("aa:aa:aa:aa:aa:01"))];
        let plan = compute_plan(&backup, &current);
        assert_eq!(plan.safe.len() + plan.conflicts.len(), 1);
    }

    #[test]
    fn virtual_interfaces_are_not_candidates() {
        let mut bridge = nic("vmbr0", Some("aa:aa:aa:aa:aa:02"));
        bridge.is_virtual = true;
        let backup = vec![bridge];
        let current = vec![nic("ens18", Some("aa:aa:aa:aa:aa:02"))];
        assert!(compute_plan(&backup, &current).is_empty());
    }

    #[test]
    fn existing_old_name_is_a_conflict() {
        let backup = vec![nic("eth0", Some("aa:aa:aa:aa:aa:03"))];
        let current = vec![
            nic("ens18", Some("aa:aa:aa:aa:aa:03")),
            // A different live NIC already answers to eth0.
            nic("eth0", Some("bb:bb:bb:bb:bb:04")),
        ];
        let plan = compute_plan(&backup, &current);
        assert!(plan.safe.is_empty());
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.conflicts[0].new_name, "ens18");
    }

    #[test]
    fn identical_names_produce_no_mapping() {
        let backup = vec![nic("ens18", Some("aa:aa:aa:aa:aa:05"))];
        let current = vec![nic("ens18", Some("aa:aa:aa:aa:aa:05"))];
        assert!(compute_plan(&backup, &current).is_empty());
    }

    #[test]
    fn apply_rewrites_files_and_snapshots_originals() {
        let dir = tempfile::tempdir().unwrap();
        let etc_network = dir.path().join("etc/network");
        std::fs::create_dir_all(etc_network.join("interfaces.d")).unwrap();
        std::fs::write(
            etc_network.join("interfaces"),
            "auto eth0\niface eth0 inet dhcp\n",
        )
        .unwrap();
        std::fs::write(
            etc_network.join("interfaces.d/vlan"),
            "iface eth0.100 inet manual\n",
        )
        .unwrap();

        let mappings = vec![NicMappingEntry {
            old_name: "eth0".to_string(),
            new_name: "ens18".to_string(),
            method: MatchMethod::Mac,
            identifier: "aa:bb:cc:dd:ee:ff".to_string(),
        }];

        let tmp = dir.path().join("tmp");
        let report = apply(
            &FixedClock::at_unix(1_700_000_000),
            &tmp,
            &etc_network,
            &mappings,
        )
        .unwrap();

        assert_eq!(report.changed_files.len(), 2);
        assert_eq!(
            std::fs::read_to_string(etc_network.join("interfaces")).unwrap(),
            "auto ens18\niface ens18 inet dhcp\n"
        );
        assert_eq!(
            std::fs::read_to_string(etc_network.join("interfaces.d/vlan")).unwrap(),
            "iface ens18.100 inet manual\n"
        );

        // Originals are preserved under the snapshot dir.
        let backup_dir = report.backup_dir.unwrap();
        let mut snapshots = Vec::new();
        for entry in walkdir::WalkDir::new(&backup_dir).into_iter().flatten() {
            if entry.file_type().is_file() {
                snapshots.push(std::fs::read_to_string(entry.path()).unwrap());
            }
        }
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots.iter().any(|s| s.contains("auto eth0")));
    }

    #[test]
    fn apply_without_changes_creates_no_snapshot_dir() {
        let dir = tempfile::tempdir().unwrap();
        let etc_network = dir.path().join("etc/network");
        std::fs::create_dir_all(&etc_network).unwrap();
        std::fs::write(etc_network.join("interfaces"), "auto lo\n").unwrap();

        let mappings = vec![NicMappingEntry {
            old_name: "eth0".to_string(),
            new_name: "ens18".to_string(),
            method: MatchMethod::Mac,
            identifier: "x".to_string(),
        }];
        let report = apply(
            &FixedClock::at_unix(1_700_000_000),
            &dir.path().join("tmp"),
            &etc_network,
            &mappings,
        )
        .unwrap();
        assert!(report.changed_files.is_empty());
        assert!(report.backup_dir.is_none());
    }

    #[test]
    fn inventory_loader_tries_all_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let stage = dir.path();
        std::fs::create_dir_all(stage.join("etc/proxsave")).unwrap();
        std::fs::write(
            stage.join("etc/proxsave/network_inventory.json"),
            r#"{"interfaces": [{"name": "eth0", "mac": "aa:bb:cc:dd:ee:ff"}]}"#,
        )
        .unwrap();

        let loaded = load_backup_inventory(stage).unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "eth0");
        assert_eq!(loaded[0].mac.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
    }

    #[test]
    fn missing_inventory_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_backup_inventory(dir.path()).unwrap().is_none());
    }
}
