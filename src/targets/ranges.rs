//! IPv4 address ranges and normalised interval sets.
//!
//! Filters (blacklist, whitelist) and the configured target ranges are all
//! represented as sorted, disjoint, inclusive `u32` intervals so that size,
//! intersection and subtraction never materialise individual addresses.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Inclusive range of IPv4 addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl AddressRange {
    /// Build a range; `None` when `end < start`.
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Option<Self> {
        if u32::from(end) < u32::from(start) {
            return None;
        }
        Some(Self { start, end })
    }

    /// Range holding a single address.
    pub fn single(addr: Ipv4Addr) -> Self {
        Self {
            start: addr,
            end: addr,
        }
    }

    /// Number of addresses in the range (up to 2^32).
    pub fn len(&self) -> u64 {
        u64::from(u32::from(self.end)) - u64::from(u32::from(self.start)) + 1
    }

    /// A range always holds at least one address.
    pub fn is_empty(&self) -> bool {
        false
    }

    fn bounds(&self) -> (u32, u32) {
        (u32::from(self.start), u32::from(self.end))
    }

    /// Parse "10.0.0.0/24", "10.0.0.1-10.0.0.9" or "10.0.0.1".
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let s = s.trim();
        let invalid = || ConfigError::InvalidRange(s.to_string());

        if s.contains('/') {
            let net = Ipv4Net::from_str(s).map_err(|_| invalid())?;
            let net = net.trunc();
            return Ok(Self {
                start: net.network(),
                end: net.broadcast(),
            });
        }

        if let Some((lo, hi)) = s.split_once('-') {
            let start = lo.trim().parse::<Ipv4Addr>().map_err(|_| invalid())?;
            let end = hi.trim().parse::<Ipv4Addr>().map_err(|_| invalid())?;
            return Self::new(start, end).ok_or_else(invalid);
        }

        s.parse::<Ipv4Addr>().map(Self::single).map_err(|_| invalid())
    }
}

impl FromStr for AddressRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Set of IPv4 addresses stored as sorted, disjoint, inclusive intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSet {
    intervals: Vec<(u32, u32)>,
}

impl AddressSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from possibly overlapping ranges.
    pub fn from_ranges<I>(ranges: I) -> Self
    where
        I: IntoIterator<Item = AddressRange>,
    {
        let intervals = ranges.into_iter().map(|r| r.bounds()).collect();
        Self::normalised(intervals)
    }

    fn normalised(mut intervals: Vec<(u32, u32)>) -> Self {
        intervals.sort_unstable_by_key(|&(s, _)| s);
        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(intervals.len());
        for (s, e) in intervals {
            match merged.last_mut() {
                // Overlapping or adjacent: extend the previous interval.
                Some(last) if u64::from(s) <= u64::from(last.1) + 1 => {
                    last.1 = last.1.max(e);
                }
                _ => merged.push((s, e)),
            }
        }
        Self { intervals: merged }
    }

    /// Add a range to the set.
    pub fn insert(&mut self, range: AddressRange) {
        let mut intervals = std::mem::take(&mut self.intervals);
        intervals.push(range.bounds());
        *self = Self::normalised(intervals);
    }

    /// Total number of addresses in the set.
    pub fn len(&self) -> u64 {
        self.intervals
            .iter()
            .map(|&(s, e)| u64::from(e) - u64::from(s) + 1)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Whether `addr` is in the set (binary search over intervals).
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let a = u32::from(addr);
        let idx = self.intervals.partition_point(|&(s, _)| s <= a);
        idx > 0 && self.intervals[idx - 1].1 >= a
    }

    /// Addresses present in both sets.
    pub fn intersect(&self, other: &AddressSet) -> AddressSet {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.intervals.len() && j < other.intervals.len() {
            let (a0, a1) = self.intervals[i];
            let (b0, b1) = other.intervals[j];
            let lo = a0.max(b0);
            let hi = a1.min(b1);
            if lo <= hi {
                out.push((lo, hi));
            }
            if a1 < b1 {
                i += 1;
            } else {
                j += 1;
            }
        }
        Self { intervals: out }
    }

    /// Addresses in `self` that are not in `other`.
    pub fn subtract(&self, other: &AddressSet) -> AddressSet {
        let mut out = Vec::new();
        let mut j = 0;
        for &(s, e) in &self.intervals {
            let mut cur = u64::from(s);
            let end = u64::from(e);
            while j < other.intervals.len() && u64::from(other.intervals[j].1) < cur {
                j += 1;
            }
            let mut k = j;
            while cur <= end && k < other.intervals.len() {
                let (b0, b1) = (u64::from(other.intervals[k].0), u64::from(other.intervals[k].1));
                if b0 > end {
                    break;
                }
                if b0 > cur {
                    out.push((cur as u32, (b0 - 1) as u32));
                }
                cur = cur.max(b1 + 1);
                k += 1;
            }
            if cur <= end {
                out.push((cur as u32, end as u32));
            }
        }
        Self { intervals: out }
    }

    /// Iterate intervals as inclusive `(start, end)` pairs.
    pub fn intervals(&self) -> &[(u32, u32)] {
        &self.intervals
    }

    /// Load a filter file: one range per line, `#` comments, blank lines ignored.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FilterIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_lines(path, &content)
    }

    /// Parse filter file contents. `path` is only used for error reporting.
    pub fn parse_lines(path: &Path, content: &str) -> Result<Self, ConfigError> {
        let mut intervals = Vec::new();
        for (idx, raw) in content.lines().enumerate() {
            let entry = raw.split('#').next().unwrap_or("").trim();
            if entry.is_empty() {
                continue;
            }
            let range = AddressRange::parse(entry).map_err(|_| ConfigError::InvalidFilterEntry {
                path: path.to_path_buf(),
                line: idx + 1,
                entry: entry.to_string(),
            })?;
            intervals.push(range.bounds());
        }
        Ok(Self::normalised(intervals))
    }
}
