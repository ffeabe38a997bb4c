use crate::diskstats::IoStats;
use crate::iostat::IoStat;
use crate::partition::{self, Partition, PartitionTable};
use crate::sysfs;
use dutkit_core::{DutError, Outcome, Result, Session, Size};
use std::fmt;
use std::str::FromStr;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filesystem {
    Xfs,
    Ext3,
    Ext4,
}

impl Filesystem {
    pub fn name(self) -> &'static str {
        match self {
            Filesystem::Xfs => "xfs",
            Filesystem::Ext3 => "ext3",
            Filesystem::Ext4 => "ext4",
        }
    }

    fn force_flag(self) -> &'static str {
        match self {
            Filesystem::Xfs => "-f",
            Filesystem::Ext3 | Filesystem::Ext4 => "-F",
        }
    }

    fn block_size_arg(self, block_size: u64) -> String {
        match self {
            Filesystem::Xfs => format!("-b size={block_size}"),
            Filesystem::Ext3 | Filesystem::Ext4 => format!("-b {block_size}"),
        }
    }

    /// `mkfs` invocation for this filesystem on `device_path`.
    pub fn mkfs_command(self, device_path: &str, force: bool, block_size: Option<u64>) -> String {
        let mut parts = vec![format!("mkfs.{}", self.name())];
        if force {
            parts.push(self.force_flag().to_string());
        }
        parts.push(device_path.to_string());
        if let Some(block_size) = block_size {
            parts.push(self.block_size_arg(block_size));
        }
        parts.join(" ")
    }
}

impl FromStr for Filesystem {
    type Err = DutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "xfs" => Ok(Filesystem::Xfs),
            "ext3" => Ok(Filesystem::Ext3),
            "ext4" => Ok(Filesystem::Ext4),
            other => Err(DutError::Parse(format!("unsupported filesystem: {other}"))),
        }
    }
}

impl fmt::Display for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Finds the mount point in `findmnt <path>` output: the field just before
/// `device_path` in its SOURCE column, else the TARGET of the first row. findmnt
/// reports the canonical node, so a symlinked `device_path` only hits the fallback.
pub fn parse_findmnt(output: &str, device_path: &str) -> Option<String> {
    let clean = |target: &str| {
        target
            .trim_start_matches(|ch: char| "├└│─ ".contains(ch))
            .to_string()
    };
    let rows: Vec<Vec<&str>> = output
        .lines()
        .skip(1)
        .map(|line| line.split_whitespace().collect())
        .filter(|tokens: &Vec<&str>| !tokens.is_empty())
        .collect();
    rows.iter()
        .find_map(|tokens| {
            let index = tokens.iter().position(|token| *token == device_path)?;
            tokens.get(index.checked_sub(1)?).map(|target| clean(*target))
        })
        .or_else(|| rows.first().map(|tokens| clean(tokens[0])))
}

/// A block device on the DUT.
#[derive(Debug, Clone)]
pub struct Device {
    session: Session,
    system_path: String,
    size: Size,
    block_size: Size,
    filesystem: Option<Filesystem>,
    mount_point: Option<String>,
    pub(crate) partition_table: Option<PartitionTable>,
    pub(crate) partitions: Vec<Partition>,
}

impl Device {
    pub fn open(session: &Session, system_path: &str) -> Result<Self> {
        let size = Size::from_bytes(sysfs::size(session, system_path)?);
        let block_size = Size::from_bytes(sysfs::block_size(session, system_path)?);
        let filesystem = match sysfs::filesystem_type(session, system_path)? {
            Some(name) => match name.parse::<Filesystem>() {
                Ok(fs) => Some(fs),
                Err(_) => {
                    warn!(device = system_path, fstype = %name, "unrecognized filesystem");
                    None
                }
            },
            None => None,
        };
        Ok(Self {
            session: session.clone(),
            system_path: system_path.to_string(),
            size,
            block_size,
            filesystem,
            mount_point: None,
            partition_table: None,
            partitions: Vec::new(),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn system_path(&self) -> &str {
        &self.system_path
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn block_size(&self) -> Size {
        self.block_size
    }

    pub fn filesystem(&self) -> Option<Filesystem> {
        self.filesystem
    }

    pub fn mount_point(&self) -> Option<&str> {
        self.mount_point.as_deref()
    }

    pub fn partition_table(&self) -> Option<PartitionTable> {
        self.partition_table
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn partition_mut(&mut self, system_path: &str) -> Option<&mut Partition> {
        self.partitions
            .iter_mut()
            .find(|partition| partition.system_path() == system_path)
    }

    pub fn create_filesystem(
        &mut self,
        filesystem: Filesystem,
        force: bool,
        block_size: Option<u64>,
    ) -> Result<()> {
        info!(device = %self.system_path, fs = %filesystem, "creating filesystem");
        let command = filesystem.mkfs_command(&self.system_path, force, block_size);
        let output = self.session.run(&command)?;
        if !output.success() {
            return Err(DutError::FilesystemCreation {
                device: self.system_path.clone(),
                output,
            });
        }
        self.filesystem = Some(filesystem);
        info!(device = %self.system_path, "filesystem created");
        Ok(())
    }

    pub fn wipe_filesystem(&mut self, force: bool) -> Result<()> {
        info!(device = %self.system_path, fs = ?self.filesystem, "wiping filesystem");
        let force = if force { " -f" } else { "" };
        self.session
            .run_expect_success(&format!("wipefs -a{force} {}", self.system_path))?;
        self.filesystem = None;
        Ok(())
    }

    /// Checks the mount table and refreshes the cached mount point. A successful
    /// `findmnt` means mounted even when its row names the canonical node.
    pub fn is_mounted(&mut self) -> Result<bool> {
        let output = self.session.run(&format!("findmnt {}", self.system_path))?;
        if !output.success() {
            self.mount_point = None;
            return Ok(false);
        }
        self.mount_point = parse_findmnt(&output.stdout, &self.system_path);
        if self.mount_point.is_none() {
            warn!(device = %self.system_path, "findmnt succeeded without a mount row");
        }
        Ok(true)
    }

    pub fn mount(&mut self, mount_point: &str) -> Result<()> {
        if self.is_mounted()? {
            return Err(DutError::usage(format!(
                "{} is already mounted at {}",
                self.system_path,
                self.mount_point.as_deref().unwrap_or("?")
            )));
        }
        if !self.session.run(&format!("test -d {mount_point}"))?.success() {
            self.session
                .run_expect_success(&format!("mkdir -p {mount_point}"))?;
        }
        info!(device = %self.system_path, mount_point, "mounting");
        let output = self
            .session
            .run(&format!("mount {} {mount_point}", self.system_path))?;
        if !output.success() {
            return Err(DutError::Mount {
                device: self.system_path.clone(),
                mount_point: mount_point.to_string(),
                output,
            });
        }
        self.mount_point = Some(mount_point.to_string());
        Ok(())
    }

    pub fn unmount(&mut self) -> Result<Outcome> {
        if !self.is_mounted()? {
            info!(device = %self.system_path, "device is not mounted");
            return Ok(Outcome::AlreadyDone);
        }
        let target = self
            .mount_point
            .clone()
            .unwrap_or_else(|| self.system_path.clone());
        info!(device = %self.system_path, mount_point = %target, "unmounting");
        let output = self.session.run(&format!("umount {target}"))?;
        if !output.success() {
            error!(device = %self.system_path, stderr = %output.stderr.trim(), "could not unmount device");
            return Ok(Outcome::Failed(output));
        }
        self.mount_point = None;
        Ok(Outcome::Done)
    }

    /// Kernel block-layer counters for this device.
    pub fn get_io_stats(&self) -> Result<IoStats> {
        IoStats::collect(&self.session, &self.system_path)
    }

    pub fn get_iostat(&self) -> Result<IoStat> {
        IoStat::collect(&self.session, &self.system_path)
    }

    /// Entries under `directory` that resolve to this device, e.g. `/dev/disk/by-id`.
    pub fn device_links(&self, directory: &str) -> Result<Vec<String>> {
        let output = self.session.run_expect_success(&format!(
            "find -L {directory} -samefile {}",
            self.system_path
        ))?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with(directory))
            .map(str::to_string)
            .collect())
    }

    pub fn wbt_lat_usec(&self) -> Result<u64> {
        sysfs::wbt_lat_usec(&self.session, &self.system_path)
    }

    pub fn set_wbt_lat_usec(&self, value: u64) -> Result<()> {
        sysfs::set_wbt_lat_usec(&self.session, &self.system_path, value)
    }

    pub fn create_partitions(&mut self, sizes: &[Size], table: PartitionTable) -> Result<()> {
        partition::create_partitions(self, sizes, table)
    }

    pub fn remove_partitions(&mut self) -> Result<bool> {
        partition::remove_partitions(self)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "system path: {}, filesystem: {}, mount point: {}, size: {}",
            self.system_path,
            self.filesystem.map(Filesystem::name).unwrap_or("none"),
            self.mount_point.as_deref().unwrap_or("none"),
            self.size
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use dutkit_core::{CommandOutput, ScriptedExecutor, Timing};
    use std::sync::Arc;

    /// Answers the probes `Device::open` issues: 8:16, 2048 sectors of 512 bytes, no fs.
    pub(crate) fn disk_executor() -> ScriptedExecutor {
        ScriptedExecutor::new()
            .on("ls -lL", CommandOutput::ok("brw-rw---- 1 root disk 8, 16 Jan 1 00:00 /dev/sdb"))
            .on("/size", CommandOutput::ok("2048\n"))
            .on("hw_sector_size", CommandOutput::ok("512\n"))
            .on("lsblk", CommandOutput::ok("MAJ:MIN FSTYPE\n8:16\n"))
            .on("findmnt", CommandOutput::failed(1, ""))
    }

    pub(crate) fn open(exec: Arc<ScriptedExecutor>, path: &str) -> Device {
        let session = Session::new(exec).with_timing(Timing::immediate());
        Device::open(&session, path).unwrap()
    }

    #[test]
    fn open_reads_size_and_filesystem() {
        let exec = disk_executor().on("lsblk -l", CommandOutput::ok("MAJ:MIN FSTYPE\n8:16 xfs\n"));
        let device = open(Arc::new(exec), "/dev/sdb");
        assert_eq!(device.size().whole_bytes(), 2048 * 512);
        assert_eq!(device.block_size().whole_bytes(), 512);
        assert_eq!(device.filesystem(), Some(Filesystem::Xfs));
        assert!(device.partitions().is_empty());
    }

    #[test]
    fn mkfs_flags_per_family() {
        assert_eq!(
            Filesystem::Xfs.mkfs_command("/dev/sdb1", true, Some(4096)),
            "mkfs.xfs -f /dev/sdb1 -b size=4096"
        );
        assert_eq!(
            Filesystem::Ext4.mkfs_command("/dev/sdb1", true, None),
            "mkfs.ext4 -F /dev/sdb1"
        );
        assert_eq!(
            Filesystem::Ext3.mkfs_command("/dev/sdb1", false, Some(1024)),
            "mkfs.ext3 /dev/sdb1 -b 1024"
        );
    }

    #[test]
    fn create_filesystem_failure_carries_output() {
        let exec = Arc::new(disk_executor().on("mkfs.ext4", CommandOutput::new(1, "out", "bad superblock")));
        let mut device = open(exec, "/dev/sdb");
        let err = device.create_filesystem(Filesystem::Ext4, true, None).unwrap_err();
        match err {
            DutError::FilesystemCreation { device, output } => {
                assert_eq!(device, "/dev/sdb");
                assert_eq!(output.stderr, "bad superblock");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(device.filesystem(), None);
    }

    #[test]
    fn create_then_wipe_filesystem() {
        let exec = Arc::new(disk_executor());
        let mut device = open(exec.clone(), "/dev/sdb");
        device.create_filesystem(Filesystem::Xfs, true, None).unwrap();
        assert_eq!(device.filesystem(), Some(Filesystem::Xfs));
        device.wipe_filesystem(true).unwrap();
        assert_eq!(device.filesystem(), None);
        assert_eq!(exec.count_matching("wipefs -a -f /dev/sdb"), 1);
    }

    #[test]
    fn wipe_failure_is_fatal() {
        let exec = Arc::new(disk_executor().on("wipefs", CommandOutput::failed(1, "busy")));
        let mut device = open(exec, "/dev/sdb");
        assert!(matches!(device.wipe_filesystem(false), Err(DutError::Command { .. })));
    }

    #[test]
    fn absent_from_mount_table() {
        let mut device = open(Arc::new(disk_executor()), "/dev/sdb");
        assert!(!device.is_mounted().unwrap());
        assert_eq!(device.mount_point(), None);
    }

    #[test]
    fn findmnt_row_sets_mount_point() {
        let exec = disk_executor().on(
            "findmnt /dev/sdb",
            CommandOutput::ok("TARGET    SOURCE   FSTYPE OPTIONS\n/mnt/test /dev/sdb xfs    rw,relatime\n"),
        );
        let mut device = open(Arc::new(exec), "/dev/sdb");
        assert!(device.is_mounted().unwrap());
        assert_eq!(device.mount_point(), Some("/mnt/test"));
    }

    #[test]
    fn mount_when_already_mounted_is_usage_error() {
        let exec = disk_executor().on(
            "findmnt /dev/sdb",
            CommandOutput::ok("TARGET SOURCE FSTYPE OPTIONS\n/mnt/a /dev/sdb xfs rw\n"),
        );
        let mut device = open(Arc::new(exec), "/dev/sdb");
        let err = device.mount("/mnt/b").unwrap_err();
        assert!(matches!(err, DutError::Usage(ref msg) if msg.contains("/mnt/a")));
    }

    #[test]
    fn mount_creates_directory() {
        let exec = Arc::new(disk_executor().on("test -d", CommandOutput::failed(1, "")));
        let mut device = open(exec.clone(), "/dev/sdb");
        device.mount("/mnt/cache").unwrap();
        assert_eq!(device.mount_point(), Some("/mnt/cache"));
        assert_eq!(exec.count_matching("mkdir -p /mnt/cache"), 1);
        assert_eq!(exec.count_matching("mount /dev/sdb /mnt/cache"), 1);
    }

    #[test]
    fn mount_failure_is_mount_error() {
        let exec = disk_executor().on("mount /dev/sdb", CommandOutput::failed(32, "wrong fs type"));
        let mut device = open(Arc::new(exec), "/dev/sdb");
        assert!(matches!(device.mount("/mnt/x"), Err(DutError::Mount { .. })));
        assert_eq!(device.mount_point(), None);
    }

    #[test]
    fn unmount_outcomes() {
        let mut device = open(Arc::new(disk_executor()), "/dev/sdb");
        assert_eq!(device.unmount().unwrap(), Outcome::AlreadyDone);

        let exec = disk_executor()
            .on("findmnt /dev/sdb", CommandOutput::ok("TARGET SOURCE FSTYPE OPTIONS\n/mnt/a /dev/sdb xfs rw\n"))
            .on("umount /mnt/a", CommandOutput::failed(32, "target is busy"));
        let mut device = open(Arc::new(exec), "/dev/sdb");
        assert!(matches!(device.unmount().unwrap(), Outcome::Failed(_)));
        assert_eq!(device.mount_point(), Some("/mnt/a"));
    }

    #[test]
    fn symlinked_path_is_mounted_at_canonical_row() {
        let by_id = "/dev/disk/by-id/ata-DISK_1-part1";
        let exec = Arc::new(
            disk_executor()
                .on(
                    &format!("findmnt {by_id}"),
                    CommandOutput::ok("TARGET SOURCE FSTYPE OPTIONS\n/mnt/test /dev/sdb1 xfs rw\n"),
                )
                .on("umount /mnt/test", CommandOutput::failed(32, "target is busy")),
        );
        let mut device = open(exec.clone(), by_id);
        assert!(device.is_mounted().unwrap());
        assert_eq!(device.mount_point(), Some("/mnt/test"));
        assert!(matches!(device.unmount().unwrap(), Outcome::Failed(_)));

        let err = device.mount("/mnt/other").unwrap_err();
        assert!(matches!(err, DutError::Usage(ref msg) if msg.contains("/mnt/test")));
        assert_eq!(exec.count_matching("mount /dev/disk/by-id"), 0);
    }

    #[test]
    fn findmnt_parse_prefers_matching_source() {
        let output = "TARGET SOURCE FSTYPE OPTIONS\n/mnt/a /dev/sdc xfs rw\n/mnt/b /dev/sdb xfs rw\n";
        assert_eq!(parse_findmnt(output, "/dev/sdb").as_deref(), Some("/mnt/b"));
        assert_eq!(parse_findmnt(output, "/dev/disk/by-id/x").as_deref(), Some("/mnt/a"));
        assert_eq!(parse_findmnt("TARGET SOURCE FSTYPE OPTIONS\n", "/dev/sdb"), None);
    }

    #[test]
    fn device_links_filter_directory() {
        let exec = disk_executor().on(
            "find -L /dev/disk/by-id",
            CommandOutput::ok("/dev/disk/by-id/wwn-0x5000\n/dev/disk/by-id/ata-DISK_123\n"),
        );
        let device = open(Arc::new(exec), "/dev/sdb");
        assert_eq!(
            device.device_links("/dev/disk/by-id").unwrap(),
            vec!["/dev/disk/by-id/wwn-0x5000", "/dev/disk/by-id/ata-DISK_123"]
        );
    }
}
