//! In-process cache tiers: the L1 LRU, the policy-driven decision cache
//! layered over the key-value store, and the tagged HTTP-style cache.

pub mod lru;
pub mod tagged;
pub mod tiered;

pub use lru::{LocalLruCache, LruStats};
pub use tagged::{Revalidator, TaggedCache, TaggedEntryInfo, TaggedHit, TaggedStats};
pub use tiered::{
    default_policies, CachePolicy, TierMembership, TieredDecisionCache, TieredStats, WarmupEntry,
};
