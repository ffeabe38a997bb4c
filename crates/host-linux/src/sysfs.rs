//! Block-device attributes read through `/sys/dev/block/<major>:<minor>`.

use dutkit_core::{DutError, Result, Session, Unit};
use tracing::warn;

/// Extracts `(major, minor)` from one line of `ls -lL` on a block special file,
/// e.g. `brw-rw---- 1 root disk 259, 0 Jan  1 00:00 /dev/nvme0n1`.
pub fn parse_major_minor(listing: &str) -> Option<(u32, u32)> {
    let tokens: Vec<&str> = listing.split_whitespace().collect();
    tokens.windows(2).find_map(|pair| {
        let major = pair[0].strip_suffix(',')?.parse::<u32>().ok()?;
        let minor = pair[1].parse::<u32>().ok()?;
        Some((major, minor))
    })
}

pub fn major_minor(session: &Session, device_path: &str) -> Result<(u32, u32)> {
    let output = session.run_expect_success(&format!("ls -lL {device_path}"))?;
    parse_major_minor(&output.stdout)
        .ok_or_else(|| DutError::Parse(format!("{device_path} is not a block device")))
}

pub fn sysfs_path(session: &Session, device_path: &str) -> Result<String> {
    let (major, minor) = major_minor(session, device_path)?;
    Ok(format!("/sys/dev/block/{major}:{minor}"))
}

/// Hardware sector size in bytes; 512 when sysfs gives nothing usable.
pub fn block_size(session: &Session, device_path: &str) -> Result<u64> {
    let sysfs = sysfs_path(session, device_path)?;
    let output = session.run(&format!("cat {sysfs}/queue/hw_sector_size"))?;
    match output.stdout.trim().parse::<u64>() {
        Ok(value) if output.success() => Ok(value),
        _ => {
            warn!(device = device_path, "unreadable hw_sector_size, assuming 512");
            Ok(Unit::Blocks512.bytes() as u64)
        }
    }
}

/// Device size in bytes: sector count from sysfs times the hardware sector size.
pub fn size(session: &Session, device_path: &str) -> Result<u64> {
    let sysfs = sysfs_path(session, device_path)?;
    let output = session.run_expect_success(&format!("cat {sysfs}/size"))?;
    let sectors = output
        .stdout
        .trim()
        .parse::<u64>()
        .map_err(|_| DutError::Parse(format!("invalid sector count for {device_path}")))?;
    Ok(sectors.saturating_mul(block_size(session, device_path)?))
}

pub fn wbt_lat_usec(session: &Session, device_path: &str) -> Result<u64> {
    let sysfs = sysfs_path(session, device_path)?;
    let output = session.run_expect_success(&format!("cat {sysfs}/queue/wbt_lat_usec"))?;
    output
        .stdout
        .trim()
        .parse::<u64>()
        .map_err(|_| DutError::Parse(format!("invalid wbt_lat_usec for {device_path}")))
}

pub fn set_wbt_lat_usec(session: &Session, device_path: &str, value: u64) -> Result<()> {
    let sysfs = sysfs_path(session, device_path)?;
    session.run_expect_success(&format!("echo {value} > {sysfs}/queue/wbt_lat_usec"))?;
    Ok(())
}

/// Filesystem signature reported by `lsblk` for the device, if any.
pub fn filesystem_type(session: &Session, device_path: &str) -> Result<Option<String>> {
    let (major, minor) = major_minor(session, device_path)?;
    let output = session.run_expect_success("lsblk -l -o MAJ:MIN,FSTYPE")?;
    Ok(parse_lsblk_fstype(&output.stdout, major, minor))
}

pub fn parse_lsblk_fstype(table: &str, major: u32, minor: u32) -> Option<String> {
    let key = format!("{major}:{minor}");
    table.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        if tokens.next()? != key {
            return None;
        }
        tokens.next().map(str::to_string)
    })
}
