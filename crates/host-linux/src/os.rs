//! Host-level helpers that are not tied to a single block device.

use dutkit_core::{DutError, HostInfo, Result, Session};
use std::time::{Duration, Instant};
use tracing::info;

pub const DEBUGFS_MOUNT_POINT: &str = "/sys/kernel/debug";

/// Value written to `/proc/sys/vm/drop_caches`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DropCaches {
    #[default]
    PageCache,
    Slab,
    All,
}

impl DropCaches {
    pub fn value(self) -> u8 {
        match self {
            DropCaches::PageCache => 1,
            DropCaches::Slab => 2,
            DropCaches::All => 3,
        }
    }
}

/// Polls `predicate` every `interval` until it returns true or `timeout` elapses.
/// Returns the last result.
pub fn wait<F>(mut predicate: F, timeout: Duration, interval: Duration) -> Result<bool>
where
    F: FnMut() -> Result<bool>,
{
    if interval.is_zero() {
        return Err(DutError::usage("wait interval must be positive"));
    }
    let deadline = Instant::now() + timeout;
    let mut result = false;
    while Instant::now() < deadline {
        result = predicate()?;
        if result {
            break;
        }
        std::thread::sleep(interval);
    }
    Ok(result)
}

pub fn sync(session: &Session) -> Result<()> {
    session.run_expect_success("sync")?;
    Ok(())
}

pub fn drop_caches(session: &Session, mode: DropCaches) -> Result<()> {
    session.run_expect_success(&format!("echo {} > /proc/sys/vm/drop_caches", mode.value()))?;
    Ok(())
}

pub fn udev_enable(session: &Session) -> Result<()> {
    info!("enabling udev");
    session.run_expect_success("udevadm control --start-exec-queue")?;
    Ok(())
}

pub fn udev_disable(session: &Session) -> Result<()> {
    info!("disabling udev");
    session.run_expect_success("udevadm control --stop-exec-queue")?;
    Ok(())
}

/// `(major, minor, patch)` from `uname -r`, ignoring the distribution suffix.
pub fn kernel_version(session: &Session) -> Result<(u32, u32, u32)> {
    let output = session.run_expect_success("uname -r")?;
    parse_kernel_version(&output.stdout)
}

pub fn parse_kernel_version(release: &str) -> Result<(u32, u32, u32)> {
    let release = release.trim();
    let base = release.split(['-', '+']).next().unwrap_or_default();
    let mut parts = base.split('.').map(|part| part.parse::<u32>());
    let mut next = || -> Result<u32> {
        match parts.next() {
            Some(Ok(value)) => Ok(value),
            None => Ok(0),
            Some(Err(_)) => Err(DutError::Parse(format!("invalid kernel release {release:?}"))),
        }
    };
    let major = next()?;
    let minor = next()?;
    let patch = next()?;
    if major == 0 {
        return Err(DutError::Parse(format!("invalid kernel release {release:?}")));
    }
    Ok((major, minor, patch))
}

/// True if `path` is a mount target in the current mount table.
pub fn is_path_mounted(session: &Session, path: &str) -> Result<bool> {
    let path = path.trim();
    if path.is_empty() {
        return Err(DutError::usage("checked path cannot be empty"));
    }
    let target = match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };
    let output = session.run("mount")?;
    Ok(output.stdout.lines().any(|line| {
        line.split(" on ")
            .nth(1)
            .and_then(|rest| rest.split_whitespace().next())
            == Some(target)
    }))
}

pub fn mount_debugfs(session: &Session) -> Result<()> {
    if !is_path_mounted(session, DEBUGFS_MOUNT_POINT)? {
        session.run_expect_success(&format!("mount -t debugfs none {DEBUGFS_MOUNT_POINT}"))?;
    }
    Ok(())
}

pub fn host_info(session: &Session) -> Result<HostInfo> {
    let hostname = session.run("hostname")?;
    let os_release = session.run("cat /etc/os-release")?;
    let kernel = session.run_expect_success("uname -r")?;
    Ok(HostInfo {
        hostname: match hostname.stdout.trim() {
            "" => "unknown".to_string(),
            name => name.to_string(),
        },
        os_version: parse_os_release(&os_release.stdout),
        kernel: kernel.stdout.trim().to_string(),
    })
}

pub fn parse_os_release(data: &str) -> String {
    let mut name = None;
    let mut version = None;
    for line in data.lines() {
        if line.starts_with("NAME=") && name.is_none() {
            name = Some(trim_os_value(line));
        } else if line.starts_with("VERSION=") && version.is_none() {
            version = Some(trim_os_value(line));
        }
    }
    match (name, version) {
        (Some(name), Some(version)) => format!("{} {}", name, version),
        (Some(name), None) => name,
        _ => "unknown".to_string(),
    }
}

fn trim_os_value(line: &str) -> String {
    let value = line.split_once('=').map(|(_, value)| value).unwrap_or("").trim();
    value.trim_matches('"').to_string()
}
