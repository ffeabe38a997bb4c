//! Kernel block-layer counters as exposed by `/proc/diskstats` and sysfs `stat`.
//!
//! Field order follows Documentation/admin-guide/iostats.rst. Discard counters exist
//! on 4.18+ kernels and flush counters on 5.5+, so both groups are optional.

use crate::sysfs;
use dutkit_core::{DutError, Result, Session};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IoStats {
    pub reads: u64,
    pub reads_merged: u64,
    pub sectors_read: u64,
    pub read_time_ms: u64,
    pub writes: u64,
    pub writes_merged: u64,
    pub sectors_written: u64,
    pub write_time_ms: u64,
    pub ios_in_progress: u64,
    pub io_time_ms: u64,
    pub io_time_weighted_ms: u64,
    pub discards: Option<DiscardStats>,
    pub flushes: Option<FlushStats>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiscardStats {
    pub discards: u64,
    pub discards_merged: u64,
    pub sectors_discarded: u64,
    pub discard_time_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushStats {
    pub flushes: u64,
    pub flush_time_ms: u64,
}

fn numbers(tokens: &[&str]) -> Option<Vec<u64>> {
    tokens.iter().map(|token| token.parse::<u64>().ok()).collect()
}

impl IoStats {
    /// Accepts either a sysfs `stat` line (numbers only) or a `/proc/diskstats` line
    /// (`major minor name` followed by the same numbers).
    pub fn parse(line: &str) -> Result<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let values = match numbers(&tokens) {
            Some(values) if values.len() >= 11 => values,
            _ => {
                let procfs = tokens.len() >= 14
                    && tokens[0].parse::<u32>().is_ok()
                    && tokens[1].parse::<u32>().is_ok();
                match numbers(tokens.get(3..).unwrap_or_default()) {
                    Some(values) if procfs && values.len() >= 11 => values,
                    _ => {
                        return Err(DutError::Parse(format!(
                            "unrecognized diskstats line: {:?}",
                            line.trim()
                        )))
                    }
                }
            }
        };

        let discards = (values.len() >= 15).then(|| DiscardStats {
            discards: values[11],
            discards_merged: values[12],
            sectors_discarded: values[13],
            discard_time_ms: values[14],
        });
        let flushes = (values.len() >= 17).then(|| FlushStats {
            flushes: values[15],
            flush_time_ms: values[16],
        });
        Ok(Self {
            reads: values[0],
            reads_merged: values[1],
            sectors_read: values[2],
            read_time_ms: values[3],
            writes: values[4],
            writes_merged: values[5],
            sectors_written: values[6],
            write_time_ms: values[7],
            ios_in_progress: values[8],
            io_time_ms: values[9],
            io_time_weighted_ms: values[10],
            discards,
            flushes,
        })
    }

    /// Counters accumulated between `earlier` and `self`. In-flight I/O is a gauge,
    /// not a counter, so the difference reports zero for it.
    pub fn checked_sub(&self, earlier: &IoStats) -> Result<IoStats> {
        if self.reads < earlier.reads {
            return Err(DutError::Parse("cannot subtract reads: counter went backwards".into()));
        }
        if self.writes < earlier.writes {
            return Err(DutError::Parse("cannot subtract writes: counter went backwards".into()));
        }
        let discards = match (self.discards, earlier.discards) {
            (Some(now), Some(before)) => Some(DiscardStats {
                discards: now.discards.saturating_sub(before.discards),
                discards_merged: now.discards_merged.saturating_sub(before.discards_merged),
                sectors_discarded: now.sectors_discarded.saturating_sub(before.sectors_discarded),
                discard_time_ms: now.discard_time_ms.saturating_sub(before.discard_time_ms),
            }),
            _ => None,
        };
        let flushes = match (self.flushes, earlier.flushes) {
            (Some(now), Some(before)) => Some(FlushStats {
                flushes: now.flushes.saturating_sub(before.flushes),
                flush_time_ms: now.flush_time_ms.saturating_sub(before.flush_time_ms),
            }),
            _ => None,
        };
        Ok(IoStats {
            reads: self.reads - earlier.reads,
            reads_merged: self.reads_merged.saturating_sub(earlier.reads_merged),
            sectors_read: self.sectors_read.saturating_sub(earlier.sectors_read),
            read_time_ms: self.read_time_ms.saturating_sub(earlier.read_time_ms),
            writes: self.writes - earlier.writes,
            writes_merged: self.writes_merged.saturating_sub(earlier.writes_merged),
            sectors_written: self.sectors_written.saturating_sub(earlier.sectors_written),
            write_time_ms: self.write_time_ms.saturating_sub(earlier.write_time_ms),
            ios_in_progress: 0,
            io_time_ms: self.io_time_ms.saturating_sub(earlier.io_time_ms),
            io_time_weighted_ms: self.io_time_weighted_ms.saturating_sub(earlier.io_time_weighted_ms),
            discards,
            flushes,
        })
    }

    pub fn collect(session: &Session, device_path: &str) -> Result<Self> {
        let (major, minor) = sysfs::major_minor(session, device_path)?;
        let output = session.run_expect_success("cat /proc/diskstats")?;
        let line = output
            .stdout
            .lines()
            .find(|line| {
                let mut tokens = line.split_whitespace();
                tokens.next() == Some(major.to_string().as_str())
                    && tokens.next() == Some(minor.to_string().as_str())
            })
            .ok_or_else(|| DutError::command(format!("cat /proc/diskstats ({device_path})"), output.clone()))?;
        Self::parse(line)
    }
}
