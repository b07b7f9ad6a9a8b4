//! Usage: TTL cache of per-token usage snapshots in front of a `UsageFetcher`.
//!
//! Entries are keyed by a SHA-256 digest of the bearer token so raw tokens never sit in the map keys.

use crate::gateway::usage::{UsageFetcher, UsageSnapshot};
use crate::shared::error::{AppError, AppResult};
use crate::shared::mutex_ext::RwLockExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::time::{Duration, Instant};

pub const DEFAULT_QUOTA_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct CacheEntry {
    snapshot: UsageSnapshot,
    fetched_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaCacheStats {
    pub entries: usize,
    pub expired: usize,
    pub ttl_secs: u64,
}

pub struct QuotaCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    fetcher: Arc<dyn UsageFetcher>,
    ttl: Duration,
}

fn cache_key(bearer_token: &str) -> String {
    hex::encode(Sha256::digest(bearer_token.trim().as_bytes()))
}

impl QuotaCache {
    pub fn new(fetcher: Arc<dyn UsageFetcher>) -> Self {
        Self::with_ttl(fetcher, DEFAULT_QUOTA_TTL)
    }

    pub fn with_ttl(fetcher: Arc<dyn UsageFetcher>, ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            fetcher,
            ttl,
        }
    }

    fn is_fresh(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.fetched_at) < self.ttl
    }

    /// Cached snapshot while fresh, otherwise fetches and stores a new one.
    pub async fn get_quota(&self, bearer_token: &str) -> AppResult<UsageSnapshot> {
        if bearer_token.trim().is_empty() {
            return Err(AppError::invalid_input("bearer token is required"));
        }
        let key = cache_key(bearer_token);
        {
            let entries = self.entries.read_or_recover();
            if let Some(entry) = entries.get(&key) {
                if self.is_fresh(entry, Instant::now()) {
                    return Ok(entry.snapshot.clone());
                }
            }
        }
        self.fetch_and_store(key, bearer_token, None).await
    }

    /// Bypasses the cache for one account and overwrites its entry.
    pub async fn refresh_quota(
        &self,
        account_id: &str,
        bearer_token: &str,
        profile_arn: Option<&str>,
    ) -> AppResult<UsageSnapshot> {
        if bearer_token.trim().is_empty() {
            return Err(AppError::invalid_input(format!(
                "account {account_id} has no bearer token"
            )));
        }
        tracing::debug!(account_id, "refreshing quota");
        self.fetch_and_store(cache_key(bearer_token), bearer_token, profile_arn)
            .await
    }

    async fn fetch_and_store(
        &self,
        key: String,
        bearer_token: &str,
        profile_arn: Option<&str>,
    ) -> AppResult<UsageSnapshot> {
        let snapshot = self
            .fetcher
            .fetch_usage(bearer_token.trim(), profile_arn)
            .await?;
        self.entries.write_or_recover().insert(
            key,
            CacheEntry {
                snapshot: snapshot.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(snapshot)
    }

    pub fn clear_cache(&self) {
        self.entries.write_or_recover().clear();
    }

    /// Drops expired entries, returning how many were removed.
    pub fn clear_expired_cache(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write_or_recover();
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_duration_since(entry.fetched_at) < self.ttl);
        before - entries.len()
    }

    pub fn stats(&self) -> QuotaCacheStats {
        let now = Instant::now();
        let entries = self.entries.read_or_recover();
        QuotaCacheStats {
            entries: entries.len(),
            expired: entries.values().filter(|e| !self.is_fresh(e, now)).count(),
            ttl_secs: self.ttl.as_secs(),
        }
    }
}
