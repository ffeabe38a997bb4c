//! Finds the disks a test may use and classifies them.
//!
//! Candidates are the SATA/SCSI (`sd*`) and NVMe entries of `/sys/block`, minus every
//! physical disk that backs the root filesystem. SSDs known to the vendor tool are
//! classified from its report; everything left is treated as a hard drive and split on
//! its sector size.

use crate::device::Device;
use crate::sysfs;
use dutkit_core::{DiscoveryConfig, DiskRecord, DiskType, DutError, Result, Session};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

const VENDOR_TOOL: &str = "isdct";

fn dev_path(name: &str) -> String {
    format!("/dev/{}", name.trim_start_matches("/dev/"))
}

fn last_segment(path: &str) -> &str {
    path.trim().rsplit('/').next().unwrap_or_default()
}

/// Names of `/sys/class/block/<name>/slaves`; empty when the directory does not exist.
pub fn slaves(session: &Session, name: &str) -> Result<Vec<String>> {
    let command = format!("ls -1 /sys/class/block/{name}/slaves");
    let output = session.run(&command)?;
    if !output.success() {
        if output.stderr.contains("No such file or directory") {
            return Ok(Vec::new());
        }
        return Err(DutError::command(command, output));
    }
    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Walks the holder/slave tree below `root` and returns the leaves in discovery order.
/// A device without slaves is its own leaf.
pub fn resolve_leaf_devices(session: &Session, root: &str) -> Result<Vec<String>> {
    let mut leaves = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![root.to_string()];
    while let Some(name) = stack.pop() {
        if !visited.insert(name.clone()) {
            continue;
        }
        let children = slaves(session, &name)?;
        if children.is_empty() {
            leaves.push(name);
        } else {
            stack.extend(children.into_iter().rev());
        }
    }
    Ok(leaves)
}

fn parent_disk(session: &Session, name: &str) -> Result<String> {
    let is_partition = session
        .run(&format!("test -e /sys/class/block/{name}/partition"))?
        .success();
    if !is_partition {
        return Ok(name.to_string());
    }
    let output = session.run_expect_success(&format!("readlink -f /sys/class/block/{name}/.."))?;
    Ok(last_segment(&output.stdout).to_string())
}

/// Whole-disk names backing the root filesystem.
pub fn system_disks(session: &Session) -> Result<Vec<String>> {
    let output = session.run_expect_success("findmnt -n -o SOURCE /")?;
    let source = output.stdout.trim();
    // btrfs reports the subvolume as `/dev/sda2[/@]`.
    let source = source.split('[').next().unwrap_or(source);
    let resolved = session.run_expect_success(&format!("readlink -f {source}"))?;
    let root = last_segment(&resolved.stdout).to_string();

    let mut disks = Vec::new();
    for leaf in resolve_leaf_devices(session, &root)? {
        let disk = parent_disk(session, &leaf)?;
        if !disks.contains(&disk) {
            disks.push(disk);
        }
    }
    debug!(?disks, "system disks");
    Ok(disks)
}

/// Device names from `/sys/block` that may be handed to tests.
pub fn candidate_devices(session: &Session) -> Result<Vec<String>> {
    let output = session.run_expect_success("ls -1 /sys/block")?;
    let system = system_disks(session)?;
    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|name| name.contains("sd") || name.contains("nvme"))
        .filter(|name| !system.iter().any(|disk| disk == name))
        .map(str::to_string)
        .collect())
}

fn sg_inq_serial(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find(|line| line.contains("Unit serial number"))
        .and_then(|line| line.split_once(':'))
        .map(|(_, serial)| serial.trim().to_string())
        .filter(|serial| !serial.is_empty())
}

fn udev_property(stdout: &str, matches: impl Fn(&str) -> bool) -> Option<String> {
    stdout
        .lines()
        .map(|line| line.trim_start_matches("E:").trim())
        .filter_map(|line| line.split_once('='))
        .find(|(key, _)| matches(key))
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Serial number of `name`, trying the SCSI identity or short udev serial, then the
/// SCSI inquiry page, then the full udev serial.
pub fn disk_serial_number(session: &Session, name: &str) -> Result<Option<String>> {
    let udev = format!("udevadm info --query=all --name={}", dev_path(name));
    let output = session.run(&udev)?;
    if output.success() {
        let scsi = udev_property(&output.stdout, |key| key.starts_with("SCSI") && key.ends_with("_SERIAL"));
        if let Some(serial) = scsi.or_else(|| udev_property(&output.stdout, |key| key == "ID_SERIAL_SHORT")) {
            return Ok(Some(serial));
        }
    }

    let output = session.run(&format!("sg_inq {}", dev_path(name)))?;
    if let Some(serial) = output.success().then(|| sg_inq_serial(&output.stdout)).flatten() {
        return Ok(Some(serial));
    }

    let output = session.run(&udev)?;
    if output.success() {
        if let Some(serial) = udev_property(&output.stdout, |key| key == "ID_SERIAL") {
            return Ok(Some(serial));
        }
    }
    Ok(None)
}

/// Serial number to device path for every candidate. Devices without a serial are
/// keyed by their name.
pub fn all_serial_numbers(session: &Session) -> Result<BTreeMap<String, String>> {
    let mut serials = BTreeMap::new();
    for name in candidate_devices(session)? {
        match disk_serial_number(session, &name)? {
            Some(serial) => {
                serials.insert(serial, dev_path(&name));
            }
            None => {
                warn!(device = %name, "device does not have a serial number");
                serials.insert(name.clone(), dev_path(&name));
            }
        }
    }
    Ok(serials)
}

/// One SSD as reported by `isdct show -intelssd <index>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorSsd {
    pub device_path: String,
    pub serial: String,
    pub optane: bool,
}

fn vendor_field(output: &str, key: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            [field, ":", value, ..] if *field == key => Some(value.to_string()),
            _ => None,
        }
    })
}

pub fn parse_vendor_ssd(output: &str) -> Option<VendorSsd> {
    Some(VendorSsd {
        device_path: vendor_field(output, "DevicePath")?,
        serial: vendor_field(output, "SerialNumber")?,
        optane: output.contains("Optane"),
    })
}

fn vendor_ssds(session: &Session) -> Result<Vec<VendorSsd>> {
    session.run_expect_success(VENDOR_TOOL)?;
    let listing = session.run_expect_success(&format!("{VENDOR_TOOL} show -intelssd"))?;
    let count = listing
        .stdout
        .lines()
        .filter(|line| line.contains("DevicePath"))
        .count();
    let mut ssds = Vec::with_capacity(count);
    for index in 0..count {
        let output = session.run_expect_success(&format!("{VENDOR_TOOL} show -intelssd {index}"))?;
        match parse_vendor_ssd(&output.stdout) {
            Some(ssd) => ssds.push(ssd),
            None => warn!(index, "incomplete vendor tool entry"),
        }
    }
    Ok(ssds)
}

fn record(session: &Session, disk_type: DiskType, name: &str, serial: String) -> Result<DiskRecord> {
    let path = dev_path(name);
    Ok(DiskRecord {
        disk_type,
        block_size: sysfs::block_size(session, &path)?,
        size: sysfs::size(session, &path)?,
        path,
        serial,
    })
}

fn discover_ssds(session: &Session, candidates: &mut Vec<String>, found: &mut Vec<DiskRecord>) -> Result<()> {
    for ssd in vendor_ssds(session)? {
        let (disk_type, name) = if !ssd.device_path.contains("nvme") {
            let mut matched = None;
            for name in candidates.iter() {
                let output = session.run(&format!("sg_inq {}", dev_path(name)))?;
                if sg_inq_serial(&output.stdout).as_deref() == Some(ssd.serial.as_str()) {
                    matched = Some(name.clone());
                    break;
                }
            }
            match matched {
                Some(name) => (DiskType::Sata, name),
                None => {
                    debug!(serial = %ssd.serial, "SATA SSD not among candidates");
                    continue;
                }
            }
        } else if ssd.optane {
            (DiskType::Optane, last_segment(&ssd.device_path).to_string())
        } else {
            (DiskType::Nand, last_segment(&ssd.device_path).to_string())
        };

        let Some(position) = candidates.iter().position(|candidate| *candidate == name) else {
            debug!(device = %ssd.device_path, "SSD is a system disk or was filtered out");
            continue;
        };
        candidates.remove(position);
        found.push(record(session, disk_type, &name, ssd.serial)?);
    }
    Ok(())
}

fn discover_hdds(session: &Session, candidates: &[String], found: &mut Vec<DiskRecord>) -> Result<()> {
    for name in candidates {
        let path = dev_path(name);
        let disk_type = if sysfs::block_size(session, &path)? == 4096 {
            DiskType::Hdd4k
        } else {
            DiskType::Hdd
        };
        let serial = match disk_serial_number(session, name)? {
            Some(serial) => serial,
            None => {
                warn!(device = %path, "no serial number, using device name");
                name.clone()
            }
        };
        found.push(record(session, disk_type, name, serial)?);
    }
    Ok(())
}

pub fn find_disks(session: &Session, config: &DiscoveryConfig) -> Result<Vec<DiskRecord>> {
    info!("finding platform disks");
    let mut candidates = candidate_devices(session)?;
    let mut found = Vec::new();
    if config.vendor_tool {
        discover_ssds(session, &mut candidates, &mut found)?;
    }
    discover_hdds(session, &candidates, &mut found)?;
    info!(count = found.len(), "disks found");
    Ok(found)
}

/// Devices created by the scsi_debug module, as listed by `lsscsi`.
pub fn scsi_debug_devices(session: &Session) -> Result<Vec<Device>> {
    let output = session.run_expect_success("lsscsi")?;
    output
        .stdout
        .lines()
        .filter(|line| line.contains("scsi_debug"))
        .filter_map(|line| line.split_whitespace().last())
        .filter(|path| path.starts_with("/dev/"))
        .map(|path| Device::open(session, path))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dutkit_core::{CommandOutput, ScriptedExecutor, Timing};
    use std::sync::Arc;

    fn scripted(exec: ScriptedExecutor) -> (Arc<ScriptedExecutor>, Session) {
        let exec = Arc::new(exec);
        let session = Session::new(exec.clone()).with_timing(Timing::immediate());
        (exec, session)
    }

    fn no_slaves() -> CommandOutput {
        CommandOutput::failed(2, "ls: cannot access: No such file or directory")
    }

    /// Root on an LVM volume spread over sda2 and sdb1.
    fn lvm_root() -> ScriptedExecutor {
        ScriptedExecutor::new()
            .on("findmnt -n -o SOURCE /", CommandOutput::ok("/dev/mapper/vg-root\n"))
            .on("readlink -f /dev/mapper/vg-root", CommandOutput::ok("/dev/dm-0\n"))
            .on("ls -1 /sys/class/block/dm-0/slaves", CommandOutput::ok("sda2\nsdb1\n"))
            .on("/slaves", no_slaves())
            .on("test -e /sys/class/block/dm-0/partition", CommandOutput::failed(1, ""))
            .on("readlink -f /sys/class/block/sda2/..", CommandOutput::ok("/sys/devices/pci/host0/block/sda\n"))
            .on("readlink -f /sys/class/block/sdb1/..", CommandOutput::ok("/sys/devices/pci/host1/block/sdb\n"))
    }

    #[test]
    fn leaf_walk_guards_against_cycles() {
        let (_, session) = scripted(
            ScriptedExecutor::new()
                .on("ls -1 /sys/class/block/dm-1/slaves", CommandOutput::ok("dm-0\n"))
                .on("ls -1 /sys/class/block/dm-0/slaves", CommandOutput::ok("dm-1\nsdc\n"))
                .on("/slaves", no_slaves()),
        );
        assert_eq!(resolve_leaf_devices(&session, "dm-1").unwrap(), vec!["sdc"]);
    }

    #[test]
    fn unexpected_slaves_error_propagates() {
        let (_, session) = scripted(
            ScriptedExecutor::new().on("/slaves", CommandOutput::failed(1, "Permission denied")),
        );
        assert!(resolve_leaf_devices(&session, "dm-0").is_err());
    }

    #[test]
    fn system_disks_follow_device_mapper_chain() {
        let (_, session) = scripted(lvm_root());
        assert_eq!(system_disks(&session).unwrap(), vec!["sda", "sdb"]);
    }

    #[test]
    fn plain_root_partition_maps_to_its_disk() {
        let (_, session) = scripted(
            ScriptedExecutor::new()
                .on("findmnt -n -o SOURCE /", CommandOutput::ok("/dev/nvme0n1p2[/@]\n"))
                .on("readlink -f /dev/nvme0n1p2", CommandOutput::ok("/dev/nvme0n1p2\n"))
                .on("/slaves", no_slaves())
                .on("readlink -f /sys/class/block/nvme0n1p2/..", CommandOutput::ok("/sys/block/nvme0n1\n")),
        );
        assert_eq!(system_disks(&session).unwrap(), vec!["nvme0n1"]);
    }

    #[test]
    fn candidates_exclude_system_disks() {
        let (_, session) = scripted(
            lvm_root().on("ls -1 /sys/block", CommandOutput::ok("dm-0\nloop0\nsda\nsdb\nsdc\nnvme0n1\n")),
        );
        assert_eq!(candidate_devices(&session).unwrap(), vec!["sdc", "nvme0n1"]);
    }

    #[test]
    fn serial_strategies_in_order() {
        let (_, session) = scripted(
            ScriptedExecutor::new()
                .on("udevadm info", CommandOutput::ok("E: ID_SERIAL=WDC_WD10_ABC123\nE: SCSI_IDENT_SERIAL=ABC123\n")),
        );
        assert_eq!(disk_serial_number(&session, "sdc").unwrap().as_deref(), Some("ABC123"));

        let (exec, session) = scripted(
            ScriptedExecutor::new()
                .on("udevadm info", CommandOutput::ok("E: DEVNAME=/dev/sdc\n"))
                .on("sg_inq /dev/sdc", CommandOutput::ok(" Unit serial number: Z1X2\n")),
        );
        assert_eq!(disk_serial_number(&session, "sdc").unwrap().as_deref(), Some("Z1X2"));
        assert_eq!(exec.count_matching("udevadm"), 1);

        let (_, session) = scripted(
            ScriptedExecutor::new()
                .on("udevadm info", CommandOutput::ok("E: ID_SERIAL=QEMU_HARDDISK_1\n"))
                .on("sg_inq", CommandOutput::failed(1, "")),
        );
        assert_eq!(disk_serial_number(&session, "sdc").unwrap().as_deref(), Some("QEMU_HARDDISK_1"));

        let (_, session) = scripted(ScriptedExecutor::new());
        assert_eq!(disk_serial_number(&session, "sdc").unwrap(), None);
    }

    #[test]
    fn vendor_entry_parsing() {
        let entry = "- Intel Optane SSD 900P Series PHMB1 -\n\nDevicePath : /dev/nvme1n1\nIndex : 1\nSerialNumber : PHMB1\n";
        assert_eq!(
            parse_vendor_ssd(entry),
            Some(VendorSsd {
                device_path: "/dev/nvme1n1".to_string(),
                serial: "PHMB1".to_string(),
                optane: true,
            })
        );
        assert_eq!(parse_vendor_ssd("Index : 0\n"), None);
    }

    fn inventory_host() -> ScriptedExecutor {
        lvm_root()
            .on("ls -1 /sys/block", CommandOutput::ok("sda\nsdb\nsdc\nsdd\nnvme0n1\nnvme1n1\n"))
            .on("isdct show -intelssd", CommandOutput::ok("DevicePath : /dev/nvme0n1\nDevicePath : /dev/sdd\nDevicePath : /dev/nvme1n1\n"))
            .on("isdct show -intelssd 0", CommandOutput::ok("DevicePath : /dev/nvme0n1\nSerialNumber : NAND0\n"))
            .on("isdct show -intelssd 1", CommandOutput::ok("DevicePath : /dev/sg3\nSerialNumber : SATA1\n"))
            .on("isdct show -intelssd 2", CommandOutput::ok("- Optane -\nDevicePath : /dev/nvme1n1\nSerialNumber : OPT2\n"))
            .on("sg_inq /dev/sdc", CommandOutput::ok("Unit serial number: HDD9\n"))
            .on("sg_inq /dev/sdd", CommandOutput::ok("Unit serial number: SATA1\n"))
            .on("ls -lL /dev/sdc", CommandOutput::ok("brw-rw---- 1 root disk 8, 32 Jan 1 00:00 /dev/sdc"))
            .on("ls -lL /dev/sdd", CommandOutput::ok("brw-rw---- 1 root disk 8, 48 Jan 1 00:00 /dev/sdd"))
            .on("ls -lL /dev/nvme0n1", CommandOutput::ok("brw-rw---- 1 root disk 259, 0 Jan 1 00:00 /dev/nvme0n1"))
            .on("ls -lL /dev/nvme1n1", CommandOutput::ok("brw-rw---- 1 root disk 259, 1 Jan 1 00:00 /dev/nvme1n1"))
            .on("/size", CommandOutput::ok("1000\n"))
            .on("hw_sector_size", CommandOutput::ok("512\n"))
            .on("/sys/dev/block/8:32/queue/hw_sector_size", CommandOutput::ok("4096\n"))
    }

    #[test]
    fn classifies_vendor_ssds_then_hdds() {
        let (_, session) = scripted(inventory_host());
        let disks = find_disks(&session, &DiscoveryConfig::default()).unwrap();
        let summary: Vec<(DiskType, &str, &str)> = disks
            .iter()
            .map(|disk| (disk.disk_type, disk.path.as_str(), disk.serial.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (DiskType::Nand, "/dev/nvme0n1", "NAND0"),
                (DiskType::Sata, "/dev/sdd", "SATA1"),
                (DiskType::Optane, "/dev/nvme1n1", "OPT2"),
                (DiskType::Hdd4k, "/dev/sdc", "HDD9"),
            ]
        );
        assert_eq!(disks[3].block_size, 4096);
        assert_eq!(disks[3].size, 1000 * 4096);
    }

    #[test]
    fn vendor_tool_can_be_skipped() {
        let (exec, session) = scripted(inventory_host());
        let config = DiscoveryConfig { vendor_tool: false };
        let disks = find_disks(&session, &config).unwrap();
        assert_eq!(disks.len(), 4);
        assert!(disks.iter().all(|disk| matches!(disk.disk_type, DiskType::Hdd | DiskType::Hdd4k)));
        assert_eq!(exec.count_matching("isdct"), 0);
    }

    #[test]
    fn missing_serials_fall_back_to_names() {
        let (_, session) = scripted(
            lvm_root()
                .on("ls -1 /sys/block", CommandOutput::ok("sdc\nsde\n"))
                .on("sg_inq /dev/sdc", CommandOutput::ok("Unit serial number: HDD9\n")),
        );
        let serials = all_serial_numbers(&session).unwrap();
        assert_eq!(serials.get("HDD9").map(String::as_str), Some("/dev/sdc"));
        assert_eq!(serials.get("sde").map(String::as_str), Some("/dev/sde"));
    }

    #[test]
    fn lists_scsi_debug_devices() {
        let (_, session) = scripted(
            crate::device::tests::disk_executor().on(
                "lsscsi",
                CommandOutput::ok(
                    "[0:0:0:0]  disk  ATA  Samsung SSD  1B6Q  /dev/sda\n[2:0:0:0]  disk  Linux  scsi_debug  0191  /dev/sdb\n",
                ),
            ),
        );
        let devices = scsi_debug_devices(&session).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].system_path(), "/dev/sdb");
    }
}
