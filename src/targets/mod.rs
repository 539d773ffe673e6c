//! Target address universe: ranges, filters and stateless enumeration.

pub mod cyclic;
pub mod ranges;
pub mod space;

pub use cyclic::CyclicGroup;
pub use ranges::{AddressRange, AddressSet};
pub use space::{AddressSpace, TargetCursor};
