use crate::HostError;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// A volume size in bytes.
///
/// Parsed from `<n>[bBkKmMgGtT]` with binary multiples. A bare number is
/// taken as mebibytes, matching the LVM default unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Size(u64);

impl Size {
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn bytes(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Rendering passed to `--size`/`--virtualsize`.
    pub fn to_lvm_arg(self) -> String {
        format!("{}b", self.0)
    }
}

impl FromStr for Size {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HostError::InvalidSize(s.to_owned());
        let s = s.trim();
        let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let (digits, unit) = s.split_at(split);
        if digits.is_empty() {
            return Err(invalid());
        }
        let n: u64 = digits.parse().map_err(|_| invalid())?;
        let shift = match unit {
            "b" | "B" => 0,
            "k" | "K" => 10,
            "" | "m" | "M" => 20,
            "g" | "G" => 30,
            "t" | "T" => 40,
            _ => return Err(invalid()),
        };
        n.checked_mul(1u64 << shift).map(Self).ok_or_else(invalid)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(&str, u32); 4] = [("T", 40), ("G", 30), ("M", 20), ("K", 10)];
        for (unit, shift) in UNITS {
            let factor = 1u64 << shift;
            if self.0 >= factor && self.0 % factor == 0 {
                return write!(f, "{}{unit}", self.0 / factor);
            }
        }
        write!(f, "{}B", self.0)
    }
}
