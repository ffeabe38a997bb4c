//! Byte quantities with unit conversion.
//!
//! A [`Size`] keeps the magnitude in the unit it was created with; comparisons and
//! arithmetic go through the normalised byte value.

use crate::error::DutError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Div, Mul, Sub};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    Byte,
    KiloByte,
    KibiByte,
    MegaByte,
    MebiByte,
    GigaByte,
    GibiByte,
    TeraByte,
    TebiByte,
    Blocks512,
    Blocks4096,
}

impl Unit {
    pub const ALL: [Unit; 11] = [
        Unit::Byte,
        Unit::KiloByte,
        Unit::KibiByte,
        Unit::MegaByte,
        Unit::MebiByte,
        Unit::GigaByte,
        Unit::GibiByte,
        Unit::TeraByte,
        Unit::TebiByte,
        Unit::Blocks512,
        Unit::Blocks4096,
    ];

    /// Number of bytes in one of this unit.
    pub fn bytes(self) -> f64 {
        match self {
            Unit::Byte => 1.0,
            Unit::KiloByte => 1_000.0,
            Unit::KibiByte => 1_024.0,
            Unit::MegaByte => 1_000_000.0,
            Unit::MebiByte => 1_048_576.0,
            Unit::GigaByte => 1_000_000_000.0,
            Unit::GibiByte => 1_073_741_824.0,
            Unit::TeraByte => 1_000_000_000_000.0,
            Unit::TebiByte => 1_099_511_627_776.0,
            Unit::Blocks512 => 512.0,
            Unit::Blocks4096 => 4_096.0,
        }
    }

    /// Unit token understood by `parted` when building offsets.
    pub fn parted_suffix(self) -> &'static str {
        match self {
            Unit::Byte => "B",
            Unit::Blocks512 | Unit::Blocks4096 => "s",
            Unit::KibiByte => "KiB",
            Unit::MebiByte => "MiB",
            Unit::GibiByte => "GiB",
            Unit::TebiByte => "TiB",
            Unit::KiloByte => "kB",
            Unit::MegaByte => "MB",
            Unit::GigaByte => "GB",
            Unit::TeraByte => "TB",
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Unit::Blocks512 => "blocks(512)",
            Unit::Blocks4096 => "blocks(4096)",
            other => other.parted_suffix(),
        }
    }

    pub fn from_suffix(value: &str) -> Option<Unit> {
        match value {
            "B" | "b" => Some(Unit::Byte),
            "kB" | "KB" | "k" => Some(Unit::KiloByte),
            "KiB" | "K" => Some(Unit::KibiByte),
            "MB" => Some(Unit::MegaByte),
            "MiB" | "M" => Some(Unit::MebiByte),
            "GB" => Some(Unit::GigaByte),
            "GiB" | "G" => Some(Unit::GibiByte),
            "TB" => Some(Unit::TeraByte),
            "TiB" | "T" => Some(Unit::TebiByte),
            "blocks(512)" => Some(Unit::Blocks512),
            "blocks(4096)" => Some(Unit::Blocks4096),
            _ => None,
        }
    }

    /// Sector unit matching a hardware sector size, if it is one of the known ones.
    pub fn from_block_size(bytes: u64) -> Option<Unit> {
        match bytes {
            512 => Some(Unit::Blocks512),
            4096 => Some(Unit::Blocks4096),
            _ => None,
        }
    }
}

/// Serialized as its display form, e.g. `"3.2 KiB"`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Size {
    value: f64,
    unit: Unit,
}

impl Size {
    pub const fn new(value: f64, unit: Unit) -> Self {
        Self { value, unit }
    }

    pub fn from_bytes(bytes: u64) -> Self {
        Self {
            value: bytes as f64,
            unit: Unit::Byte,
        }
    }

    /// Sentinel meaning "the rest of the disk" when sizing partitions.
    pub const fn zero() -> Self {
        Self {
            value: 0.0,
            unit: Unit::Byte,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.bytes() == 0.0
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    pub fn bytes(&self) -> f64 {
        self.value * self.unit.bytes()
    }

    /// Byte count rounded to the nearest whole byte.
    pub fn whole_bytes(&self) -> u64 {
        self.bytes().round().max(0.0) as u64
    }

    pub fn get_value(&self, unit: Unit) -> f64 {
        self.bytes() / unit.bytes()
    }

    pub fn convert(&self, unit: Unit) -> Size {
        Size::new(self.get_value(unit), unit)
    }

    pub fn is_multiple_of(&self, unit: Unit) -> bool {
        self.whole_bytes() % (unit.bytes() as u64) == 0
    }
}

impl PartialEq for Size {
    fn eq(&self, other: &Self) -> bool {
        self.bytes() == other.bytes()
    }
}

impl PartialOrd for Size {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.bytes().partial_cmp(&other.bytes())
    }
}

impl Add for Size {
    type Output = Size;

    fn add(self, rhs: Size) -> Size {
        Size::new(self.value + rhs.get_value(self.unit), self.unit)
    }
}

impl Sub for Size {
    type Output = Size;

    fn sub(self, rhs: Size) -> Size {
        Size::new(self.value - rhs.get_value(self.unit), self.unit)
    }
}

impl Mul<f64> for Size {
    type Output = Size;

    fn mul(self, rhs: f64) -> Size {
        Size::new(self.value * rhs, self.unit)
    }
}

impl Div<f64> for Size {
    type Output = Size;

    fn div(self, rhs: f64) -> Size {
        Size::new(self.value / rhs, self.unit)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit.symbol())
    }
}

impl FromStr for Size {
    type Err = DutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let split = trimmed
            .find(|ch: char| !(ch.is_ascii_digit() || ch == '.'))
            .unwrap_or(trimmed.len());
        let (number, suffix) = trimmed.split_at(split);
        let value = number
            .parse::<f64>()
            .map_err(|_| DutError::Parse(format!("invalid size value: {s:?}")))?;
        let suffix = suffix.trim();
        let unit = if suffix.is_empty() {
            Unit::Byte
        } else {
            Unit::from_suffix(suffix)
                .ok_or_else(|| DutError::Parse(format!("unknown size unit in {s:?}")))?
        };
        Ok(Size::new(value, unit))
    }
}

impl From<Size> for String {
    fn from(size: Size) -> Self {
        size.to_string()
    }
}

impl TryFrom<String> for Size {
    type Error = DutError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
