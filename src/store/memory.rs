//! In-memory key-value backend.
//!
//! Implements the same contract as the remote backend, including TTL expiry,
//! so tests and single-node deployments behave like production minus the
//! network.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::KeyValueBackend;
use crate::error::Result;
use crate::utils::glob::glob_to_regex;

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|t| now >= t).unwrap_or(false)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryBackend {
    entries: DashMap<String, MemoryEntry>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, expired ones included until they are touched.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store a raw string without going through JSON encoding.
    ///
    /// Lets tests plant corrupt payloads under a fully-qualified key.
    pub fn insert_raw(&self, key: &str, raw: &str) {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: raw.to_string(),
                expires_at: None,
            },
        );
    }
}

#[async_trait]
impl KeyValueBackend for InMemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => {}
            None => return Ok(None),
        }
        // The read guard is released above; removing while holding it would deadlock.
        self.entries.remove_if(key, |_, e| e.is_expired(now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .insert(key.to_string(), MemoryEntry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
        let re = glob_to_regex(pattern);
        let before = self.entries.len();
        self.entries.retain(|key, _| !re.is_match(key));
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let backend = InMemoryBackend::new();
        backend.set("k", "v".into(), None).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some("v".to_string()));
        assert!(backend.exists("k").await.unwrap());
        assert!(backend.delete("k").await.unwrap());
        assert!(!backend.delete("k").await.unwrap());
        assert_eq!(backend.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_removes_entry() {
        let backend = InMemoryBackend::new();
        backend
            .set("k", "v".into(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(backend.get("k").await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(backend.get("k").await.unwrap().is_none());
        assert!(backend.is_empty(), "expired entry is dropped on read");
    }

    #[tokio::test]
    async fn test_delete_pattern() {
        let backend = InMemoryBackend::new();
        for key in ["ns:decision:a", "ns:decision:b", "ns:response:a"] {
            backend.set(key, "1".into(), None).await.unwrap();
        }
        assert_eq!(backend.delete_pattern("ns:decision:*").await.unwrap(), 2);
        assert_eq!(backend.len(), 1);
        assert!(backend.exists("ns:response:a").await.unwrap());
    }
}
