//! `iostat` output parsing.

use dutkit_core::{DutError, Result, Session, Size, Unit};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Basic per-device snapshot from `iostat -dk`, throughput in KiB.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IoStat {
    pub transfers_per_second: f64,
    pub reads_per_second: Size,
    pub writes_per_second: Size,
    pub total_reads: Size,
    pub total_writes: Size,
}

impl Default for IoStat {
    fn default() -> Self {
        Self::from_fields(&[])
    }
}

/// Kernel name for `device_path` (`sdb` for `/dev/disk/by-id/ata-X`), which is what
/// iostat prints in its Device column.
pub fn kernel_name(session: &Session, device_path: &str) -> Result<String> {
    let output = session.run_expect_success(&format!("readlink -f {device_path}"))?;
    let resolved = match output.stdout.trim() {
        "" => device_path,
        path => path,
    };
    Ok(resolved.trim_start_matches("/dev/").to_string())
}

fn field(fields: &[&str], index: usize) -> f64 {
    fields
        .get(index)
        .and_then(|value| value.parse::<f64>().ok())
        .unwrap_or(0.0)
}

impl IoStat {
    /// Columns after the device name: tps, kB_read/s, kB_wrtn/s, kB_read, kB_wrtn.
    /// Missing or unreadable columns count as zero.
    pub fn from_fields(fields: &[&str]) -> Self {
        let kib = |index| Size::new(field(fields, index), Unit::KibiByte);
        Self {
            transfers_per_second: field(fields, 0),
            reads_per_second: kib(1),
            writes_per_second: kib(2),
            total_reads: kib(3),
            total_writes: kib(4),
        }
    }

    /// Reads the row that follows the `Device` header for `device_path`.
    pub fn parse(output: &str, device_path: &str) -> Self {
        let name = device_path.trim_start_matches("/dev/");
        let mut lines = output.lines().skip_while(|line| !line.trim_start().starts_with("Device"));
        let row = lines.nth(1).unwrap_or_default();
        let mut tokens = row.split_whitespace();
        match tokens.next() {
            Some(first) if first == name || first == device_path => {
                Self::from_fields(&tokens.collect::<Vec<_>>())
            }
            _ => {
                debug!(device = device_path, "no iostat row for device");
                Self::default()
            }
        }
    }

    pub fn collect(session: &Session, device_path: &str) -> Result<Self> {
        let name = kernel_name(session, device_path)?;
        let output = session.run_expect_success(&format!("iostat -dk {device_path}"))?;
        Ok(Self::parse(&output.stdout, &name))
    }
}

impl fmt::Display for IoStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "IO stats:")?;
        writeln!(f, "Transfers per second: {}", self.transfers_per_second)?;
        writeln!(f, "Kilobytes read per second: {}", self.reads_per_second)?;
        writeln!(f, "Kilobytes written per second: {}", self.writes_per_second)?;
        writeln!(f, "Kilobytes read: {}", self.total_reads)?;
        write!(f, "Kilobytes written: {}", self.total_writes)
    }
}

/// One device row of `iostat -dxk`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct IoStatExtended {
    pub read_merges_per_second: f64,
    pub write_merges_per_second: f64,
    pub reads_per_second: f64,
    pub writes_per_second: f64,
    pub read_kib_per_second: f64,
    pub write_kib_per_second: f64,
    pub average_request_size: f64,
    pub average_queue_length: f64,
    pub await_ms: f64,
    pub read_await_ms: f64,
    pub write_await_ms: f64,
    pub utilization_percent: f64,
}

const EXTENDED_COLUMNS: usize = 13;
/// `svctm`, deprecated by sysstat and not trustworthy.
const SKIPPED_COLUMN: usize = 11;

impl IoStatExtended {
    pub fn from_fields(fields: &[&str]) -> Result<Self> {
        if fields.len() < EXTENDED_COLUMNS {
            return Err(DutError::Parse(format!(
                "expected {EXTENDED_COLUMNS} iostat columns, got {}",
                fields.len()
            )));
        }
        let mut values = Vec::with_capacity(EXTENDED_COLUMNS - 1);
        for (index, value) in fields.iter().take(EXTENDED_COLUMNS).enumerate() {
            if index == SKIPPED_COLUMN {
                continue;
            }
            let value = value
                .replace(',', ".")
                .parse::<f64>()
                .map_err(|_| DutError::Parse(format!("invalid iostat value {value:?}")))?;
            values.push(value);
        }
        Ok(Self {
            read_merges_per_second: values[0],
            write_merges_per_second: values[1],
            reads_per_second: values[2],
            writes_per_second: values[3],
            read_kib_per_second: values[4],
            write_kib_per_second: values[5],
            average_request_size: values[6],
            average_queue_length: values[7],
            await_ms: values[8],
            read_await_ms: values[9],
            write_await_ms: values[10],
            utilization_percent: values[11],
        })
    }
}

/// Parses every report in `output`, keeping the latest row per requested device.
/// Devices are matched on their name without the `/dev/` prefix. The whole first
/// column must match, so `sdb` never picks up the rows of `sdb1`.
pub fn parse_extended(output: &str, devices: &[&str]) -> Result<BTreeMap<String, IoStatExtended>> {
    let names: Vec<&str> = devices
        .iter()
        .map(|device| device.trim_start_matches("/dev/"))
        .collect();
    let mut stats = BTreeMap::new();
    for line in output.lines() {
        let mut tokens = line.split_whitespace();
        let Some(first) = tokens.next() else { continue };
        if let Some(name) = names.iter().find(|name| **name == first) {
            let fields: Vec<&str> = tokens.collect();
            stats.insert(name.to_string(), IoStatExtended::from_fields(&fields)?);
        }
    }
    Ok(stats)
}

/// Samples the devices twice `interval` seconds apart; the second report reflects
/// the interval rather than the counters since boot.
pub fn collect_extended(
    session: &Session,
    devices: &[&str],
    interval: u64,
) -> Result<BTreeMap<String, IoStatExtended>> {
    if interval == 0 {
        return Err(DutError::usage("iostat interval must be positive"));
    }
    if devices.is_empty() {
        return Err(DutError::usage("no devices given for iostat"));
    }
    let names = devices
        .iter()
        .map(|device| kernel_name(session, device))
        .collect::<Result<Vec<_>>>()?;
    let command = format!("iostat -dxk {} {interval} 2", devices.join(" "));
    let output = session.run_expect_success(&command)?;
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    parse_extended(&output.stdout, &names)
}
