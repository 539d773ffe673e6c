//! The filtered scan target universe and its pseudo-random visitation order.

use std::net::Ipv4Addr;

use super::cyclic::{Cycle, CyclicGroup};
use super::ranges::{AddressRange, AddressSet};

/// Eligible targets: `(ranges ∩ whitelist) − blacklist`.
///
/// Eligible addresses are addressed by a dense index `0..size()` through
/// prefix sums over the interval list, so the cyclic permutation runs over
/// exactly the eligible set and never has to skip excluded addresses.
#[derive(Debug, Clone)]
pub struct AddressSpace {
    eligible: AddressSet,
    /// `prefix[i]` is the number of eligible addresses before interval `i`.
    prefix: Vec<u64>,
    size: u64,
    seed: u64,
}

impl AddressSpace {
    /// Build the eligible set. The blacklist always wins over the whitelist.
    pub fn new(
        ranges: &[AddressRange],
        whitelist: Option<&AddressSet>,
        blacklist: &AddressSet,
        seed: u64,
    ) -> Self {
        let mut eligible = AddressSet::from_ranges(ranges.iter().copied());
        if let Some(wl) = whitelist {
            eligible = eligible.intersect(wl);
        }
        let eligible = eligible.subtract(blacklist);
        Self::from_set(eligible, seed)
    }

    fn from_set(eligible: AddressSet, seed: u64) -> Self {
        let mut prefix = Vec::with_capacity(eligible.intervals().len());
        let mut acc = 0u64;
        for &(s, e) in eligible.intervals() {
            prefix.push(acc);
            acc += u64::from(e) - u64::from(s) + 1;
        }
        Self {
            eligible,
            prefix,
            size: acc,
            seed,
        }
    }

    /// Number of eligible targets.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Whether `addr` is an eligible target.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.eligible.contains(addr)
    }

    /// Address at dense index `idx` (`idx < size()`).
    pub fn address_at(&self, idx: u64) -> Option<Ipv4Addr> {
        if idx >= self.size {
            return None;
        }
        let slot = self.prefix.partition_point(|&p| p <= idx) - 1;
        let (start, _) = self.eligible.intervals()[slot];
        let offset = idx - self.prefix[slot];
        Some(Ipv4Addr::from((u64::from(start) + offset) as u32))
    }

    /// Lazy, finite enumeration of every eligible address in seeded order.
    ///
    /// Restarting with the same seed reproduces the same order.
    pub fn targets(&self) -> Targets<'_> {
        Targets {
            space: self,
            cycle: CyclicGroup::new(self.size, self.seed).iter(),
        }
    }
}

/// Iterator over the targets of an `AddressSpace`.
#[derive(Debug, Clone)]
pub struct Targets<'a> {
    space: &'a AddressSpace,
    cycle: Cycle,
}

impl Iterator for Targets<'_> {
    type Item = Ipv4Addr;

    fn next(&mut self) -> Option<Ipv4Addr> {
        let idx = self.cycle.next()?;
        self.space.address_at(idx)
    }
}

/// Owning variant of [`Targets`], used where the cursor must outlive a borrow
/// (the sending flow holds it across await points).
#[derive(Debug, Clone)]
pub struct TargetCursor {
    space: std::sync::Arc<AddressSpace>,
    cycle: Cycle,
    yielded: u64,
}

impl TargetCursor {
    pub fn new(space: std::sync::Arc<AddressSpace>) -> Self {
        let cycle = CyclicGroup::new(space.size(), space.seed()).iter();
        Self {
            space,
            cycle,
            yielded: 0,
        }
    }

    /// Number of addresses handed out so far.
    pub fn yielded(&self) -> u64 {
        self.yielded
    }
}

impl Iterator for TargetCursor {
    type Item = Ipv4Addr;

    fn next(&mut self) -> Option<Ipv4Addr> {
        let idx = self.cycle.next()?;
        self.yielded += 1;
        self.space.address_at(idx)
    }
}
