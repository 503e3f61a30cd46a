//! Opaque-username token store (§3, §4.2).
//!
//! When a client authenticates via OIDC, the proxy mints a random
//! "opaque username" that stands in for the end user's real OIDC tokens
//! for the lifetime of the Postgres session. The sidecar HTTP API
//! (`POST /connection`) registers the mapping here; the protocol handler
//! looks it up during `Authenticate-Upstream`; a background janitor evicts
//! entries past their lifetime.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;

/// OIDC token material associated with one opaque username.
#[derive(Debug, Clone)]
pub struct TokenEntry {
    pub access_token: String,
    pub refresh_token: String,
    pub client_id: String,
    pub database: String,
    registered_at: Instant,
}

/// Concurrent opaque-username → token-entry map with TTL-based eviction.
pub struct TokenStore {
    entries: DashMap<String, TokenEntry>,
    lifetime: Duration,
}

impl TokenStore {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            lifetime,
        }
    }

    /// Mint a fresh opaque username and register its token material.
    /// Collisions are vanishingly unlikely (122 bits of randomness) but are
    /// retried rather than assumed away.
    pub fn add(&self, access_token: String, refresh_token: String, client_id: String, database: String) -> String {
        loop {
            let username = generate_opaque_username();
            let entry = TokenEntry {
                access_token: access_token.clone(),
                refresh_token: refresh_token.clone(),
                client_id: client_id.clone(),
                database: database.clone(),
                registered_at: Instant::now(),
            };
            match self.entries.entry(username.clone()) {
                dashmap::mapref::entry::Entry::Vacant(v) => {
                    v.insert(entry);
                    return username;
                }
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
            }
        }
    }

    /// Look up a username's token entry, treating an entry past its
    /// lifetime as absent even if the janitor hasn't swept it yet.
    pub fn get(&self, username: &str) -> Option<TokenEntry> {
        let entry = self.entries.get(username)?;
        if entry.registered_at.elapsed() < self.lifetime {
            Some(entry.clone())
        } else {
            None
        }
    }

    /// Overwrite the access/refresh token pair for an existing username,
    /// e.g. after a mid-session OIDC refresh.
    pub fn update_tokens(&self, username: &str, access_token: String, refresh_token: String) -> bool {
        if let Some(mut entry) = self.entries.get_mut(username) {
            entry.access_token = access_token;
            entry.refresh_token = refresh_token;
            true
        } else {
            false
        }
    }

    pub fn delete(&self, username: &str) -> bool {
        self.entries.remove(username).is_some()
    }

    /// Usernames whose registration is older than the configured lifetime.
    pub fn expired_usernames(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.registered_at.elapsed() >= self.lifetime)
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn generate_opaque_username() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    let body: String = (0..24)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("proxy_{body}")
}

/// Periodically sweeps expired entries out of `store`. Runs until the
/// process exits; intended to be `tokio::spawn`ed once from `main`.
pub async fn run_janitor(store: std::sync::Arc<TokenStore>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let expired = store.expired_usernames();
        for username in expired {
            store.delete(&username);
            tracing::debug!(username = %username, "evicted expired opaque username");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_get_roundtrips() {
        let store = TokenStore::new(Duration::from_secs(3600));
        let username = store.add(
            "access".into(),
            "refresh".into(),
            "client-a".into(),
            "mydb".into(),
        );
        let entry = store.get(&username).expect("entry should exist");
        assert_eq!(entry.access_token, "access");
        assert_eq!(entry.refresh_token, "refresh");
        assert_eq!(entry.client_id, "client-a");
        assert_eq!(entry.database, "mydb");
    }

    #[test]
    fn generated_usernames_are_unique() {
        let store = TokenStore::new(Duration::from_secs(3600));
        let a = store.add("a".into(), "a".into(), "c".into(), "d".into());
        let b = store.add("a".into(), "a".into(), "c".into(), "d".into());
        assert_ne!(a, b);
    }

    #[test]
    fn delete_removes_entry() {
        let store = TokenStore::new(Duration::from_secs(3600));
        let username = store.add("a".into(), "a".into(), "c".into(), "d".into());
        assert!(store.delete(&username));
        assert!(store.get(&username).is_none());
        assert!(!store.delete(&username));
    }

    #[test]
    fn expired_usernames_respects_lifetime() {
        let store = TokenStore::new(Duration::from_millis(0));
        let username = store.add("a".into(), "a".into(), "c".into(), "d".into());
        std::thread::sleep(Duration::from_millis(5));
        let expired = store.expired_usernames();
        assert!(expired.contains(&username));
    }

    #[test]
    fn update_tokens_overwrites_existing_entry() {
        let store = TokenStore::new(Duration::from_secs(3600));
        let username = store.add("old".into(), "old".into(), "c".into(), "d".into());
        assert!(store.update_tokens(&username, "new".into(), "new".into()));
        let entry = store.get(&username).unwrap();
        assert_eq!(entry.access_token, "new");
        assert_eq!(entry.refresh_token, "new");
    }

    #[test]
    fn update_tokens_on_missing_username_returns_false() {
        let store = TokenStore::new(Duration::from_secs(3600));
        assert!(!store.update_tokens("nope", "a".into(), "b".into()));
    }

    #[test]
    fn get_treats_expired_entry_as_absent() {
        let store = TokenStore::new(Duration::from_millis(0));
        let username = store.add("a".into(), "a".into(), "c".into(), "d".into());
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.get(&username).is_none());
    }
}
