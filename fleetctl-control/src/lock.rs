//! Deploy lock registry (C2).
//!
//! In-memory, process-local, advisory. The control plane is assumed
//! single-writer (spec Non-goals); if it's ever scaled out the same
//! `acquire`/`release(lock_id)` fencing contract can be backed by a
//! distributed lock service without touching callers.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

struct LockEntry {
    lock_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LockInfo {
    pub holder: String,
    pub remaining: Duration,
}

/// A held lock. Callers are expected to call [`LockRegistry::release`] with
/// `lock_id` when the guarded operation finishes; there is no `Drop`-based
/// auto-release because release is fallible (a stale lock may have already
/// expired and been replaced) and the orchestrator needs to observe that.
#[derive(Debug, Clone)]
pub struct DeployLock {
    pub service_id: String,
    pub env: String,
    pub lock_id: String,
}

pub struct LockRegistry {
    locks: Mutex<HashMap<String, LockEntry>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self { locks: Mutex::new(HashMap::new()) }
    }

    fn key(service_id: &str, env: &str) -> String {
        format!("{service_id}:{env}")
    }

    /// Acquires the lock for `(service_id, env)` if it is free or its
    /// previous holder's TTL has expired. Returns `None` if another holder
    /// still has it.
    pub async fn acquire(&self, service_id: &str, env: &str, ttl: Duration) -> Option<DeployLock> {
        let key = Self::key(service_id, env);
        let now = Utc::now();
        let mut locks = self.locks.lock().await;

        if let Some(existing) = locks.get(&key) {
            if existing.expires_at > now {
                return None;
            }
        }

        let lock_id = Uuid::new_v4().to_string();
        locks.insert(
            key,
            LockEntry {
                lock_id: lock_id.clone(),
                expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(0)),
            },
        );

        Some(DeployLock { service_id: service_id.to_string(), env: env.to_string(), lock_id })
    }

    /// Releases the lock iff `lock_id` still matches the current holder.
    /// Returns `false` if the lock was already released, expired and
    /// reclaimed by someone else, or never existed.
    pub async fn release(&self, service_id: &str, env: &str, lock_id: &str) -> bool {
        let key = Self::key(service_id, env);
        let mut locks = self.locks.lock().await;

        match locks.get(&key) {
            Some(existing) if existing.lock_id == lock_id => {
                locks.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub async fn info(&self, service_id: &str, env: &str) -> Option<LockInfo> {
        let key = Self::key(service_id, env);
        let now = Utc::now();
        let locks = self.locks.lock().await;

        locks.get(&key).and_then(|entry| {
            if entry.expires_at <= now {
                return None;
            }
            let remaining = (entry.expires_at - now).to_std().unwrap_or(Duration::ZERO);
            Some(LockInfo { holder: entry.lock_id.clone(), remaining })
        })
    }
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_is_rejected_while_held() {
        let registry = LockRegistry::new();
        let first = registry.acquire("svc", "prod", Duration::from_secs(60)).await;
        assert!(first.is_some());

        let second = registry.acquire("svc", "prod", Duration::from_secs(60)).await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn acquire_immediately_after_release_succeeds() {
        let registry = LockRegistry::new();
        let lock = registry.acquire("svc", "prod", Duration::from_secs(60)).await.unwrap();
        assert!(registry.release(&lock.service_id, &lock.env, &lock.lock_id).await);

        let reacquired = registry.acquire("svc", "prod", Duration::from_secs(60)).await;
        assert!(reacquired.is_some());
    }

    #[tokio::test]
    async fn release_with_wrong_lock_id_fails() {
        let registry = LockRegistry::new();
        let lock = registry.acquire("svc", "prod", Duration::from_secs(60)).await.unwrap();
        assert!(!registry.release(&lock.service_id, &lock.env, "not-the-real-id").await);
        // still held by the real lock id
        assert!(registry.acquire("svc", "prod", Duration::from_secs(60)).await.is_none());
    }

    #[tokio::test]
    async fn expired_lock_can_be_reacquired() {
        let registry = LockRegistry::new();
        let _first = registry.acquire("svc", "prod", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let second = registry.acquire("svc", "prod", Duration::from_secs(60)).await;
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn different_envs_do_not_contend() {
        let registry = LockRegistry::new();
        let a = registry.acquire("svc", "prod", Duration::from_secs(60)).await;
        let b = registry.acquire("svc", "staging", Duration::from_secs(60)).await;
        assert!(a.is_some());
        assert!(b.is_some());
    }
}
