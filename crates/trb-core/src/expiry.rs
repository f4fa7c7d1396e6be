//! TTL key-value cells: pending auth secrets and the forward-origin
//! display-name cache.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

#[derive(Clone, Debug)]
struct Entry {
    value: String,
    expire_at: DateTime<Utc>,
}

/// Generic expiring map. Reads do not evict; a periodic [`sweep`] removes
/// entries whose `expire_at` has passed.
///
/// [`sweep`]: ExpiryCache::sweep
pub struct ExpiryCache<K> {
    inner: Mutex<HashMap<K, Entry>>,
}

impl<K: Eq + Hash + Clone> Default for ExpiryCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> ExpiryCache<K> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn put(&self, key: K, value: impl Into<String>, ttl: Duration) {
        let expire_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(
            key,
            Entry {
                value: value.into(),
                expire_at,
            },
        );
    }

    pub fn get(&self, key: &K) -> Option<String> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(key).map(|e| e.value.clone())
    }

    pub fn remove(&self, key: &K) -> Option<String> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(key).map(|e| e.value)
    }

    /// Evict every entry that expired before `now`.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.retain(|_, e| e.expire_at >= now);
    }
}

/// Expiring secret store whose writers wake pending readers.
///
/// The login flow stores a code/password here from the conversation side;
/// the auth side consumes it with a bounded [`wait`]. One vault per secret
/// kind, keyed by account phone.
///
/// [`wait`]: SecretVault::wait
pub struct SecretVault {
    cache: ExpiryCache<String>,
    waiters: Mutex<HashMap<String, Arc<Notify>>>,
}

impl Default for SecretVault {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretVault {
    pub fn new() -> Self {
        Self {
            cache: ExpiryCache::new(),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn put(&self, key: &str, value: impl Into<String>, ttl: Duration) {
        self.cache.put(key.to_string(), value, ttl);
        let notify = self.notifier(key);
        notify.notify_one();
    }

    /// Remove and return the secret, if present.
    pub fn take(&self, key: &str) -> Option<String> {
        self.cache.remove(&key.to_string())
    }

    /// Await the secret for up to `timeout`, consuming it on success.
    ///
    /// Returns `None` on timeout; the caller abandons the login attempt.
    pub async fn wait(&self, key: &str, timeout: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(value) = self.take(key) {
                return Some(value);
            }
            let notify = self.notifier(key);
            // notify_one() leaves a permit even with no waiter registered, so
            // a put between take() and notified() is not lost.
            match tokio::time::timeout_at(deadline, notify.notified()).await {
                Ok(()) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Periodic eviction, shared with the plain caches.
    pub fn sweep(&self, now: DateTime<Utc>) {
        self.cache.sweep(now);
    }

    fn notifier(&self, key: &str) -> Arc<Notify> {
        let mut map = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(key.to_string()).or_default().clone()
    }
}
