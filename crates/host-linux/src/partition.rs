//! Partition table management: creation with offset bookkeeping, verification and
//! teardown.
//!
//! Offsets are computed from the partitions this session created on the device, in
//! creation order. The first usable offset is 1 MiB when aligned; otherwise 34 sectors
//! on GPT (primary header plus backup table reservation) or a single sector on MBR.

use crate::device::Device;
use crate::sysfs;
use dutkit_core::{CommandOutput, DutError, Result, Session, Size, Unit, VerifyPolicy};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionTable {
    Msdos,
    Gpt,
}

impl PartitionTable {
    pub fn name(self) -> &'static str {
        match self {
            PartitionTable::Msdos => "msdos",
            PartitionTable::Gpt => "gpt",
        }
    }
}

impl FromStr for PartitionTable {
    type Err = DutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "msdos" | "mbr" => Ok(PartitionTable::Msdos),
            "gpt" => Ok(PartitionTable::Gpt),
            other => Err(DutError::Parse(format!("unknown partition table: {other}"))),
        }
    }
}

impl fmt::Display for PartitionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    Efi,
    Primary,
    Extended,
    Logical,
    Lvm,
    Msr,
    Swap,
    Standard,
    Unknown,
}

impl PartitionType {
    pub fn name(self) -> &'static str {
        match self {
            PartitionType::Efi => "efi",
            PartitionType::Primary => "primary",
            PartitionType::Extended => "extended",
            PartitionType::Logical => "logical",
            PartitionType::Lvm => "lvm",
            PartitionType::Msr => "msr",
            PartitionType::Swap => "swap",
            PartitionType::Standard => "standard",
            PartitionType::Unknown => "unknown",
        }
    }
}

/// Result of post-creation checks. A size mismatch still counts as a created
/// partition unless the session asks for strict verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionCheck {
    Verified,
    SizeMismatch { expected: u64, actual: u64 },
}

/// A partition is a device of its own, tied to its parent by path.
#[derive(Debug, Clone)]
pub struct Partition {
    device: Device,
    parent_path: String,
    partition_type: PartitionType,
    number: u32,
}

impl Partition {
    pub fn open(
        session: &Session,
        parent_path: &str,
        partition_type: PartitionType,
        number: u32,
    ) -> Result<Self> {
        let path = partition_path(parent_path, number);
        Ok(Self {
            device: Device::open(session, &path)?,
            parent_path: parent_path.to_string(),
            partition_type,
            number,
        })
    }

    pub fn as_device(&self) -> &Device {
        &self.device
    }

    pub fn as_device_mut(&mut self) -> &mut Device {
        &mut self.device
    }

    pub fn parent_path(&self) -> &str {
        &self.parent_path
    }

    pub fn partition_type(&self) -> PartitionType {
        self.partition_type
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn system_path(&self) -> &str {
        self.device.system_path()
    }

    pub fn size(&self) -> Size {
        self.device.size()
    }
}

pub fn partition_path(parent_path: &str, number: u32) -> String {
    if parent_path.starts_with("/dev/disk/by-id/") {
        return format!("{parent_path}-part{number}");
    }
    if parent_path.ends_with(|ch: char| ch.is_ascii_digit()) {
        return format!("{parent_path}p{number}");
    }
    format!("{parent_path}{number}")
}

pub fn first_partition_offset(
    table: Option<PartitionTable>,
    block_size: Size,
    aligned: bool,
) -> Size {
    if aligned {
        return Size::new(1.0, Unit::MebiByte);
    }
    match table {
        Some(PartitionTable::Gpt) => block_size * 34.0,
        _ => block_size,
    }
}

/// Start offset of a new partition placed after `existing` ones. Every logical
/// partition, existing or new, costs one extra block for its EBR gap.
pub fn partition_start<I>(
    first_offset: Size,
    existing: I,
    new_type: PartitionType,
    block_size: Size,
) -> Size
where
    I: IntoIterator<Item = (Size, PartitionType)>,
{
    let mut start = first_offset;
    for (size, partition_type) in existing {
        start = start + size;
        if partition_type == PartitionType::Logical {
            start = start + block_size;
        }
    }
    if new_type == PartitionType::Logical {
        start = start + block_size;
    }
    start
}

fn mklabel(device: &Device, table: PartitionTable) -> Result<CommandOutput> {
    info!(device = device.system_path(), table = %table, "creating partition table");
    device.session().run(&format!(
        "parted --script {} mklabel {}",
        device.system_path(),
        table.name()
    ))
}

pub fn create_partition_table(device: &mut Device, table: PartitionTable) -> Result<bool> {
    let output = mklabel(device, table)?;
    if !output.success() {
        error!(device = device.system_path(), %output, "could not create partition table");
        return Ok(false);
    }
    device.partition_table = Some(table);
    device.partitions.clear();
    Ok(true)
}

fn settle(session: &Session, device_path: &str) -> Result<()> {
    let output = session.run(&format!("partx -u {device_path}"))?;
    if !output.success() {
        debug!(device = device_path, %output, "partx update failed");
    }
    session.run("udevadm settle")?;
    Ok(())
}

fn verify_partition(
    device: &Device,
    size: Size,
    number: u32,
    partition_type: PartitionType,
    aligned: bool,
) -> Result<Option<PartitionCheck>> {
    let session = device.session();
    let path = partition_path(device.system_path(), number);
    let timing = session.timing();
    let mut found = false;
    for attempt in 0..timing.partition_poll_attempts {
        if attempt > 0 {
            session.pause(timing.partition_poll_interval);
        }
        if session.run(&format!("test -b {path}"))?.success() {
            found = true;
            break;
        }
    }
    if !found {
        warn!(partition = %path, "partition node did not appear");
        return Ok(None);
    }

    if aligned && partition_type != PartitionType::Extended && !size.is_multiple_of(Unit::Blocks4096) {
        warn!(
            partition = %path,
            size_kib = size.get_value(Unit::KibiByte),
            "partition is not 4k aligned"
        );
    }
    if partition_type == PartitionType::Extended {
        return Ok(Some(PartitionCheck::Verified));
    }

    let expected = size.whole_bytes();
    let actual = sysfs::size(session, &path)?;
    if actual == expected {
        return Ok(Some(PartitionCheck::Verified));
    }
    warn!(partition = %path, expected, actual, "partition size does not match");
    if session.verification() == VerifyPolicy::Strict {
        return Err(DutError::Verification {
            target: path,
            message: format!("expected {expected} bytes, found {actual}"),
        });
    }
    Ok(Some(PartitionCheck::SizeMismatch { expected, actual }))
}

/// Creates one partition. `size` equal to [`Size::zero`] takes the rest of the disk.
pub fn create_partition(
    device: &Device,
    size: Size,
    number: u32,
    partition_type: PartitionType,
    unit: Unit,
    aligned: bool,
) -> Result<PartitionCheck> {
    let session = device.session();
    let path = device.system_path();
    info!(device = path, kind = partition_type.name(), number, "creating partition");

    let first = first_partition_offset(device.partition_table(), device.block_size(), aligned);
    let existing = device
        .partitions()
        .iter()
        .map(|partition| (partition.size(), partition.partition_type()));
    let begin = partition_start(first, existing, partition_type, device.block_size()).get_value(unit);
    let suffix = unit.parted_suffix();
    let end = if size.is_zero() {
        "100%".to_string()
    } else {
        format!("{}{suffix}", begin + size.get_value(unit))
    };
    let command = format!(
        "parted --script {path} mkpart {} {begin}{suffix} {end}",
        partition_type.name()
    );

    let output = session.run(&command)?;
    if output.success() {
        settle(session, path)?;
        if let Some(check) = verify_partition(device, size, number, partition_type, aligned)? {
            info!(device = path, number, "partition created");
            return Ok(check);
        }
    } else {
        error!(device = path, %output, "mkpart failed, re-probing");
    }

    let reprobe = format!("partprobe {path}");
    let output = session.run(&reprobe)?;
    if output.success() {
        settle(session, path)?;
        if let Some(check) = verify_partition(device, size, number, partition_type, aligned)? {
            info!(device = path, number, "partition created after re-probe");
            return Ok(check);
        }
    }
    Err(DutError::command(reprobe, output))
}

fn zero_first_block(session: &Session, path: &str) -> Result<()> {
    session.run_expect_success(&format!(
        "dd if=/dev/zero of={path} bs=4096 count=1 oflag=direct"
    ))?;
    Ok(())
}

/// Lays out a fresh table with one partition per requested size. Each partition gives
/// up its last block. On MBR with more than four sizes, partition 4 becomes an
/// extended container and the remaining ones are logical, numbered from 5.
pub fn create_partitions(device: &mut Device, sizes: &[Size], table: PartitionTable) -> Result<()> {
    let output = mklabel(device, table)?;
    if !output.success() {
        return Err(DutError::command(
            format!("parted --script {} mklabel {}", device.system_path(), table.name()),
            output,
        ));
    }
    device.partition_table = Some(table);
    device.partitions.clear();

    let session = device.session().clone();
    let block_size = device.block_size();
    let mut partition_type = PartitionType::Primary;
    let mut number_offset = 0;

    for requested in sizes {
        let size = Size::from_bytes(requested.whole_bytes().saturating_sub(block_size.whole_bytes()));
        if table == PartitionTable::Msdos && sizes.len() > 4 && device.partitions.len() == 3 {
            create_partition(device, Size::zero(), 4, PartitionType::Extended, Unit::MebiByte, true)?;
            partition_type = PartitionType::Logical;
            number_offset = 1;
        }

        let number = device.partitions.len() as u32 + 1 + number_offset;
        create_partition(device, size, number, partition_type, Unit::MebiByte, true)?;
        let partition = Partition::open(&session, device.system_path(), partition_type, number)?;
        zero_first_block(&session, partition.system_path())?;
        device.partitions.push(partition);
    }
    Ok(())
}

/// Unmounts everything, destroys the table signature and checks that only the bare
/// device node is left.
pub fn remove_partitions(device: &mut Device) -> Result<bool> {
    device.unmount()?;
    for partition in device.partitions.iter_mut() {
        partition.as_device_mut().unmount()?;
    }

    let session = device.session().clone();
    let path = device.system_path().to_string();
    info!(device = %path, "removing partitions");
    zero_first_block(&session, &path)?;

    let output = session.run(&format!("ls -1 {path}*"))?;
    let nodes = output.stdout.lines().filter(|line| !line.trim().is_empty()).count();
    if nodes > 1 {
        error!(device = %path, nodes, "could not remove partitions");
        return Ok(false);
    }
    device.partitions.clear();
    device.partition_table = None;
    Ok(true)
}
