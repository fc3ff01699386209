//! In-memory key store.
//!
//! The [`KeyStore`] holds every identity the agent can sign with.  Records
//! are indexed twice: by caller-assigned id, and by the public key blob a
//! client presents in a sign request.  Both maps live behind one mutex so the
//! blob index is always exactly the image of the primary map.
//!
//! Expiry is lazy.  A record whose deadline has passed is treated as absent
//! by every read path and is evicted the first time a read encounters it;
//! [`KeyStore::list`] therefore doubles as the garbage collector, since
//! clients enumerate identities before every authentication.
//!
//! The lock is held only for map operations.  Records are handed out as
//! `Arc<KeyRecord>` so signing happens outside the lock, and usage-log writes
//! are issued after the guard is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use serde_json::json;
use tracing::{debug, warn};

use crate::audit::{Action, UsageLog};
use crate::clock::Clock;
use crate::error::KeyError;
use crate::key::{AgentKey, KeyKind, KeyMaterial, fingerprint};

/// Policy attached to a key when it is added.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddOptions {
    /// Require a live approval grant before every signing session.
    pub require_approval: bool,
    /// Evict the key this long after it was added.
    pub ttl: Option<Duration>,
}

/// One loaded signing identity.
pub struct KeyRecord {
    pub id: String,
    pub key: AgentKey,
    /// Wire-format public key; unique across the store.
    pub public_blob: Vec<u8>,
    /// `SHA256:…` fingerprint of `public_blob`.
    pub fingerprint: String,
    pub comment: String,
    pub require_approval: bool,
    pub added_at: SystemTime,
    pub expires_at: Option<SystemTime>,
}

impl KeyRecord {
    pub fn kind(&self) -> KeyKind {
        self.key.kind()
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

impl std::fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRecord")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("fingerprint", &self.fingerprint)
            .field("comment", &self.comment)
            .field("require_approval", &self.require_approval)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// A public identity as advertised to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub blob: Vec<u8>,
    pub comment: String,
}

#[derive(Debug, Default)]
struct Entries {
    by_id: HashMap<String, Arc<KeyRecord>>,
    by_blob: HashMap<Vec<u8>, String>,
}

impl Entries {
    /// Insert `record`, displacing any record with the same id or blob.
    fn insert(&mut self, record: Arc<KeyRecord>) -> Vec<Arc<KeyRecord>> {
        let mut displaced = Vec::new();
        if let Some(old) = self.take(&record.id) {
            displaced.push(old);
        }
        if let Some(owner) = self.by_blob.get(&record.public_blob).cloned()
            && let Some(old) = self.take(&owner)
        {
            displaced.push(old);
        }
        self.by_blob
            .insert(record.public_blob.clone(), record.id.clone());
        self.by_id.insert(record.id.clone(), record);
        displaced
    }

    fn take(&mut self, id: &str) -> Option<Arc<KeyRecord>> {
        let record = self.by_id.remove(id)?;
        self.by_blob.remove(&record.public_blob);
        Some(record)
    }
}

/// Shared, thread-safe key registry.
#[derive(Debug)]
pub struct KeyStore {
    entries: Mutex<Entries>,
    clock: Arc<dyn Clock>,
    usage: Arc<UsageLog>,
}

impl KeyStore {
    pub fn new(clock: Arc<dyn Clock>, usage: Arc<UsageLog>) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            clock,
            usage,
        }
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            warn!("key store lock poisoned; continuing with inner state");
            poisoned.into_inner()
        })
    }

    /// Parse `material` and add it under `id`.
    ///
    /// Nothing is mutated when the material does not parse.  An existing
    /// record with the same id (or the same public key) is replaced.
    pub fn add(
        &self,
        id: impl Into<String>,
        material: &KeyMaterial,
        comment: impl Into<String>,
        options: AddOptions,
    ) -> Result<Arc<KeyRecord>, KeyError> {
        let key = AgentKey::from_material(material)?;
        Ok(self.add_key(id, key, comment, options))
    }

    /// Add an already-parsed key.
    pub fn add_key(
        &self,
        id: impl Into<String>,
        key: AgentKey,
        comment: impl Into<String>,
        options: AddOptions,
    ) -> Arc<KeyRecord> {
        let public_blob = key.public_blob();
        let now = self.clock.now();
        let record = Arc::new(KeyRecord {
            id: id.into(),
            fingerprint: fingerprint(&public_blob),
            public_blob,
            key,
            comment: comment.into(),
            require_approval: options.require_approval,
            added_at: now,
            expires_at: options.ttl.map(|ttl| now + ttl),
        });

        let displaced = self.entries().insert(Arc::clone(&record));

        for old in &displaced {
            debug!(id = %old.id, fingerprint = %old.fingerprint, "keystore: replaced key");
        }
        debug!(
            id = %record.id,
            fingerprint = %record.fingerprint,
            kind = %record.kind(),
            "keystore: added key"
        );
        self.usage.record(
            &record.id,
            Action::Add,
            json!({
                "fingerprint": record.fingerprint,
                "key_type": record.kind().algorithm(),
                "comment": record.comment,
                "require_approval": record.require_approval,
                "ttl_secs": options.ttl.map(|t| t.as_secs()),
                "replaced": displaced.len(),
            }),
        );
        record
    }

    /// Remove the record with `id`.  Returns `false` if no live record had it.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.entries().take(id);
        self.finish_removal(removed)
    }

    /// Remove the record whose public key blob is `blob`.
    pub fn remove_by_blob(&self, blob: &[u8]) -> bool {
        let removed = {
            let mut entries = self.entries();
            match entries.by_blob.get(blob).cloned() {
                Some(id) => entries.take(&id),
                None => None,
            }
        };
        self.finish_removal(removed)
    }

    fn finish_removal(&self, removed: Option<Arc<KeyRecord>>) -> bool {
        let Some(record) = removed else {
            return false;
        };
        if record.is_expired(self.clock.now()) {
            self.log_expired(&record);
            return false;
        }
        self.log_removed(&record);
        true
    }

    /// Remove every record, returning how many were evicted.
    pub fn remove_all(&self) -> usize {
        let drained: Vec<Arc<KeyRecord>> = {
            let mut entries = self.entries();
            entries.by_blob.clear();
            entries.by_id.drain().map(|(_, record)| record).collect()
        };
        for record in &drained {
            self.log_removed(record);
        }
        debug!(removed = drained.len(), "keystore: removed all keys");
        drained.len()
    }

    /// Every live identity, oldest first.  Expired records are evicted.
    pub fn list(&self) -> Vec<Identity> {
        let now = self.clock.now();
        let (mut live, expired) = {
            let mut entries = self.entries();
            let stale: Vec<String> = entries
                .by_id
                .values()
                .filter(|r| r.is_expired(now))
                .map(|r| r.id.clone())
                .collect();
            let expired: Vec<Arc<KeyRecord>> =
                stale.iter().filter_map(|id| entries.take(id)).collect();
            let live: Vec<Arc<KeyRecord>> = entries.by_id.values().cloned().collect();
            (live, expired)
        };

        for record in &expired {
            self.log_expired(record);
        }

        live.sort_by(|a, b| a.added_at.cmp(&b.added_at).then_with(|| a.id.cmp(&b.id)));
        live.iter()
            .map(|r| Identity {
                blob: r.public_blob.clone(),
                comment: r.comment.clone(),
            })
            .collect()
    }

    /// Look up a live record by public key blob, evicting it if expired.
    pub fn get_by_blob(&self, blob: &[u8]) -> Option<Arc<KeyRecord>> {
        let now = self.clock.now();
        let expired = {
            let mut entries = self.entries();
            let id = entries.by_blob.get(blob)?.clone();
            let record = entries.by_id.get(&id)?;
            if !record.is_expired(now) {
                return Some(Arc::clone(record));
            }
            entries.take(&id)
        };
        if let Some(record) = expired {
            self.log_expired(&record);
        }
        None
    }

    /// Look up a live record by id, evicting it if expired.
    pub fn get(&self, id: &str) -> Option<Arc<KeyRecord>> {
        let blob = self.entries().by_id.get(id)?.public_blob.clone();
        self.get_by_blob(&blob)
    }

    /// Number of records held, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn log_removed(&self, record: &KeyRecord) {
        debug!(id = %record.id, fingerprint = %record.fingerprint, "keystore: removed key");
        self.usage.record(
            &record.id,
            Action::Remove,
            json!({ "fingerprint": record.fingerprint }),
        );
    }

    fn log_expired(&self, record: &KeyRecord) {
        debug!(id = %record.id, fingerprint = %record.fingerprint, "keystore: key expired");
        self.usage.record(
            &record.id,
            Action::Expire,
            json!({ "fingerprint": record.fingerprint }),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::clock::ManualClock;
    use crate::testkeys;

    fn store() -> (KeyStore, ManualClock) {
        let clock = ManualClock::default();
        let store = KeyStore::new(Arc::new(clock.clone()), Arc::new(UsageLog::disabled()));
        (store, clock)
    }

    #[test]
    fn add_then_lookup_by_blob() {
        let (store, _) = store();
        let record = store
            .add("k1", &testkeys::ed25519(1), "test", AddOptions::default())
            .unwrap();
        let found = store.get_by_blob(&record.public_blob).unwrap();
        assert_eq!(found.id, "k1");
        assert_eq!(store.list().len(), 1);
        assert_eq!(store.list()[0].comment, "test");
    }

    #[test]
    fn unparseable_material_leaves_store_untouched() {
        let (store, _) = store();
        let bad = KeyMaterial::Rsa {
            encoded: zeroize::Zeroizing::new(b"junk".to_vec()),
        };
        assert!(store.add("k1", &bad, "bad", AddOptions::default()).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn remove_clears_both_indexes() {
        let (store, _) = store();
        let record = store
            .add("k1", &testkeys::ed25519(1), "a", AddOptions::default())
            .unwrap();
        assert!(store.remove("k1"));
        assert!(!store.remove("k1"));
        assert!(store.get_by_blob(&record.public_blob).is_none());
        assert!(store.list().is_empty());
    }

    #[test]
    fn remove_by_blob() {
        let (store, _) = store();
        let record = store
            .add("k1", &testkeys::ed25519(1), "a", AddOptions::default())
            .unwrap();
        assert!(store.remove_by_blob(&record.public_blob));
        assert!(!store.remove_by_blob(&record.public_blob));
        assert!(store.get("k1").is_none());
    }

    #[test]
    fn remove_all_reports_count() {
        let (store, _) = store();
        store.add("a", &testkeys::ed25519(1), "a", AddOptions::default()).unwrap();
        store.add("b", &testkeys::ed25519(2), "b", AddOptions::default()).unwrap();
        assert_eq!(store.remove_all(), 2);
        assert!(store.is_empty());
        assert!(store.list().is_empty());
    }

    #[test]
    fn same_id_replaces_and_drops_old_blob() {
        let (store, _) = store();
        let first = store
            .add("k", &testkeys::ed25519(1), "first", AddOptions::default())
            .unwrap();
        let second = store
            .add("k", &testkeys::ed25519(2), "second", AddOptions::default())
            .unwrap();
        assert!(store.get_by_blob(&first.public_blob).is_none());
        assert_eq!(store.get_by_blob(&second.public_blob).unwrap().comment, "second");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn same_blob_under_new_id_replaces_old_record() {
        let (store, _) = store();
        store.add("a", &testkeys::ed25519(3), "a", AddOptions::default()).unwrap();
        let record = store
            .add("b", &testkeys::ed25519(3), "b", AddOptions::default())
            .unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get("a").is_none());
        assert_eq!(store.get_by_blob(&record.public_blob).unwrap().id, "b");
    }

    #[test]
    fn expired_key_is_absent_without_explicit_remove() {
        let (store, clock) = store();
        let options = AddOptions {
            ttl: Some(Duration::from_secs(60)),
            ..AddOptions::default()
        };
        let record = store.add("k", &testkeys::ed25519(1), "t", options).unwrap();
        assert!(store.get_by_blob(&record.public_blob).is_some());

        clock.advance(Duration::from_secs(61));
        assert!(store.list().is_empty());
        assert!(store.get_by_blob(&record.public_blob).is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn get_by_blob_evicts_expired_record() {
        let (store, clock) = store();
        let options = AddOptions {
            ttl: Some(Duration::from_secs(1)),
            ..AddOptions::default()
        };
        let record = store.add("k", &testkeys::ed25519(1), "t", options).unwrap();
        clock.advance(Duration::from_secs(2));
        assert_eq!(store.len(), 1);
        assert!(store.get_by_blob(&record.public_blob).is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn removing_an_expired_key_reports_absent() {
        let (store, clock) = store();
        let options = AddOptions {
            ttl: Some(Duration::from_secs(1)),
            ..AddOptions::default()
        };
        store.add("k", &testkeys::ed25519(1), "t", options).unwrap();
        clock.advance(Duration::from_secs(5));
        assert!(!store.remove("k"));
        assert!(store.is_empty());
    }

    #[test]
    fn list_is_ordered_by_insertion_time() {
        let (store, clock) = store();
        store.add("z", &testkeys::ed25519(1), "first", AddOptions::default()).unwrap();
        clock.advance(Duration::from_secs(1));
        store.add("a", &testkeys::ed25519(2), "second", AddOptions::default()).unwrap();
        let comments: Vec<String> = store.list().into_iter().map(|i| i.comment).collect();
        assert_eq!(comments, ["first", "second"]);
    }

    #[test]
    fn lifecycle_events_reach_the_usage_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.log");
        let clock = ManualClock::default();
        let store = KeyStore::new(
            Arc::new(clock.clone()),
            Arc::new(UsageLog::open(&path).unwrap()),
        );
        store.add("a", &testkeys::ed25519(1), "a", AddOptions::default()).unwrap();
        store.add("b", &testkeys::ed25519(2), "b", AddOptions::default()).unwrap();
        store.remove_all();

        let actions: Vec<String> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["action"].to_string())
            .collect();
        assert_eq!(actions, ["\"add\"", "\"add\"", "\"remove\"", "\"remove\""]);
    }

    #[test]
    fn concurrent_adds_and_lookups_keep_indexes_consistent() {
        let (store, _) = store();
        let store = Arc::new(store);
        let handles: Vec<_> = (0..8u8)
            .map(|n| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for round in 0..20 {
                        let record = store
                            .add(format!("k{n}"), &testkeys::ed25519(n), "c", AddOptions::default())
                            .unwrap();
                        assert!(store.get_by_blob(&record.public_blob).is_some());
                        if round % 3 == 0 {
                            store.list();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), 8);
        assert_eq!(store.list().len(), 8);
    }
}
