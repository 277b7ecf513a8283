//! ZeptoCache: a latency-tiered response cache for conversational replies.
//!
//! A request walks four tiers, cheapest first:
//!
//! 1. **instant**: [`PrecomputedResponseStore`], exact and intent-pattern replies
//! 2. **fast**: a process-local [`LocalLruCache`]
//! 3. **standard**: [`TieredDecisionCache`] entries in the shared key-value store
//! 4. **computed**: the caller's [`ResponseCompute`] callback
//!
//! [`ResponseCacheRouter`] runs that walk and writes computed replies back into
//! the cheaper tiers. [`TaggedCache`] is a separate tag-invalidated cache with
//! stale-while-revalidate, and [`CacheService`] wires everything together.
//!
//! Backend trouble never fails a request: the store degrades to misses behind a
//! circuit breaker, and compute failures become a fallback reply.

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod precomputed;
pub mod router;
pub mod service;
pub mod store;
pub mod utils;

pub use cache::{
    LocalLruCache, Revalidator, TaggedCache, TaggedHit, TieredDecisionCache, WarmupEntry,
};
pub use config::Config;
pub use error::{CacheError, Result};
pub use precomputed::PrecomputedResponseStore;
pub use router::{CacheLevel, FnCompute, ResponseCacheRouter, ResponseCompute, RoutedResponse};
pub use service::{CacheService, WarmupFile};
pub use store::{InMemoryBackend, KeyValueBackend, KeyValueStore};
