//! Small helpers shared by the cache tiers.

pub mod glob;
pub mod hash;
