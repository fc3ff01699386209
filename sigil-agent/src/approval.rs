//! Per-session signing approval.
//!
//! Keys added with `require_approval` may only sign for a connection that
//! holds a live grant for that key.  Grants are created when the approval
//! surface says yes, expire after a fixed time-to-live, and are dropped when
//! the connection that earned them closes.  Expired grants are removed the
//! next time they are looked at; there is no background sweeper.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;
use crate::keystore::KeyRecord;

/// Permission for one session to sign with one key until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalGrant {
    pub key_id: String,
    pub session_id: Uuid,
    pub approved: bool,
    pub expires_at: SystemTime,
}

impl ApprovalGrant {
    fn is_live(&self, now: SystemTime) -> bool {
        self.approved && now < self.expires_at
    }
}

type GrantKey = (String, Uuid);

/// Registry of live approval grants.
#[derive(Debug)]
pub struct ApprovalGate {
    grants: Mutex<HashMap<GrantKey, ApprovalGrant>>,
    clock: Arc<dyn Clock>,
}

impl ApprovalGate {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            grants: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn grants(&self) -> MutexGuard<'_, HashMap<GrantKey, ApprovalGrant>> {
        self.grants.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True only if a live grant exists for exactly this pair.
    pub fn is_approved(&self, key_id: &str, session_id: Uuid) -> bool {
        let now = self.clock.now();
        let mut grants = self.grants();
        let slot = (key_id.to_string(), session_id);
        match grants.get(&slot) {
            Some(grant) if grant.is_live(now) => true,
            Some(_) => {
                grants.remove(&slot);
                false
            }
            None => false,
        }
    }

    /// Whether `record` may sign for `session_id` without asking.
    pub fn permits(&self, record: &KeyRecord, session_id: Uuid) -> bool {
        !record.require_approval || self.is_approved(&record.id, session_id)
    }

    /// Record an approval valid for `ttl` from now, replacing any earlier one.
    pub fn grant(&self, key_id: &str, session_id: Uuid, ttl: Duration) -> ApprovalGrant {
        let grant = ApprovalGrant {
            key_id: key_id.to_string(),
            session_id,
            approved: true,
            expires_at: self.clock.now() + ttl,
        };
        self.grants()
            .insert((key_id.to_string(), session_id), grant.clone());
        debug!(key_id, %session_id, ttl_secs = ttl.as_secs(), "approval: granted");
        grant
    }

    pub fn revoke(&self, key_id: &str, session_id: Uuid) -> bool {
        self.grants()
            .remove(&(key_id.to_string(), session_id))
            .is_some()
    }

    /// Drop every grant held by `session_id`, returning how many were removed.
    pub fn revoke_session(&self, session_id: Uuid) -> usize {
        let mut grants = self.grants();
        let before = grants.len();
        grants.retain(|(_, session), _| *session != session_id);
        let removed = before - grants.len();
        if removed > 0 {
            debug!(%session_id, removed, "approval: session grants revoked");
        }
        removed
    }

    /// Number of stored grants, including expired ones not yet looked at.
    pub fn len(&self) -> usize {
        self.grants().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What the approval surface is asked to decide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub key_id: String,
    pub session_id: Uuid,
    pub comment: String,
    pub fingerprint: String,
}

impl ApprovalRequest {
    pub fn for_record(record: &KeyRecord, session_id: Uuid) -> Self {
        Self {
            key_id: record.id.clone(),
            session_id,
            comment: record.comment.clone(),
            fingerprint: record.fingerprint.clone(),
        }
    }

    /// One-line prompt suitable for an askpass-style dialog.
    pub fn prompt(&self) -> String {
        let name = if self.comment.is_empty() {
            &self.key_id
        } else {
            &self.comment
        };
        format!("Allow use of key {name}?\nKey fingerprint {}.", self.fingerprint)
    }
}

/// Interactive surface that decides whether a session may use a key.
///
/// Implementations may take arbitrarily long; the caller applies its own
/// timeout and treats expiry as a refusal.
#[async_trait]
pub trait Approver: Send + Sync {
    async fn request(&self, request: &ApprovalRequest) -> bool;
}

/// A request waiting for an answer from whoever drains the channel.
#[derive(Debug)]
pub struct PendingApproval {
    pub request: ApprovalRequest,
    reply: oneshot::Sender<bool>,
}

impl PendingApproval {
    pub fn respond(self, approved: bool) {
        // The requester may have timed out and gone away.
        let _ = self.reply.send(approved);
    }
}

/// Forwards approval requests over a channel.
///
/// A request is refused when the receiving side is gone or drops the
/// [`PendingApproval`] without answering.
#[derive(Debug, Clone)]
pub struct ChannelApprover {
    tx: mpsc::Sender<PendingApproval>,
}

impl ChannelApprover {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PendingApproval>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Approver for ChannelApprover {
    async fn request(&self, request: &ApprovalRequest) -> bool {
        let (reply, answer) = oneshot::channel();
        let pending = PendingApproval {
            request: request.clone(),
            reply,
        };
        if self.tx.send(pending).await.is_err() {
            debug!(key_id = %request.key_id, "approval: no listener for requests");
            return false;
        }
        answer.await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::UsageLog;
    use crate::clock::ManualClock;
    use crate::keystore::{AddOptions, KeyStore};
    use crate::testkeys;

    fn gate() -> (ApprovalGate, ManualClock) {
        let clock = ManualClock::default();
        (ApprovalGate::new(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn grant_applies_to_exact_pair_only() {
        let (gate, _) = gate();
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        gate.grant("k1", s1, Duration::from_secs(60));

        assert!(gate.is_approved("k1", s1));
        assert!(!gate.is_approved("k1", s2));
        assert!(!gate.is_approved("k2", s1));
    }

    #[test]
    fn expired_grant_is_absent_and_removed() {
        let (gate, clock) = gate();
        let s = Uuid::new_v4();
        gate.grant("k", s, Duration::from_secs(10));
        clock.advance(Duration::from_secs(10));
        assert!(!gate.is_approved("k", s));
        assert!(gate.is_empty());
    }

    #[test]
    fn revoke_and_revoke_session() {
        let (gate, _) = gate();
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        gate.grant("a", s1, Duration::from_secs(60));
        gate.grant("b", s1, Duration::from_secs(60));
        gate.grant("a", s2, Duration::from_secs(60));

        assert!(gate.revoke("a", s2));
        assert!(!gate.revoke("a", s2));
        assert_eq!(gate.revoke_session(s1), 2);
        assert!(gate.is_empty());
    }

    #[test]
    fn permits_short_circuits_for_unrestricted_keys() {
        let clock = ManualClock::default();
        let store = KeyStore::new(Arc::new(clock.clone()), Arc::new(UsageLog::disabled()));
        let gate = ApprovalGate::new(Arc::new(clock));
        let open = store
            .add("open", &testkeys::ed25519(1), "", AddOptions::default())
            .unwrap();
        let guarded = store
            .add(
                "guarded",
                &testkeys::ed25519(2),
                "",
                AddOptions {
                    require_approval: true,
                    ttl: None,
                },
            )
            .unwrap();
        let s = Uuid::new_v4();

        assert!(gate.permits(&open, s));
        assert!(!gate.permits(&guarded, s));
        gate.grant("guarded", s, Duration::from_secs(5));
        assert!(gate.permits(&guarded, s));
    }

    #[test]
    fn prompt_prefers_comment() {
        let request = ApprovalRequest {
            key_id: "id".into(),
            session_id: Uuid::nil(),
            comment: "laptop".into(),
            fingerprint: "SHA256:abc".into(),
        };
        assert!(request.prompt().contains("laptop"));
        assert!(request.prompt().contains("SHA256:abc"));
    }

    #[tokio::test]
    async fn channel_approver_round_trip() {
        let (approver, mut rx) = ChannelApprover::new(1);
        let request = ApprovalRequest {
            key_id: "k".into(),
            session_id: Uuid::new_v4(),
            comment: String::new(),
            fingerprint: String::new(),
        };

        let responder = tokio::spawn(async move {
            let pending = rx.recv().await.unwrap();
            assert_eq!(pending.request.key_id, "k");
            pending.respond(true);
        });
        assert!(approver.request(&request).await);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_request_means_no() {
        let (approver, mut rx) = ChannelApprover::new(1);
        let request = ApprovalRequest {
            key_id: "k".into(),
            session_id: Uuid::new_v4(),
            comment: String::new(),
            fingerprint: String::new(),
        };
        tokio::spawn(async move {
            drop(rx.recv().await);
        });
        assert!(!approver.request(&request).await);
    }

    #[tokio::test]
    async fn closed_channel_means_no() {
        let (approver, rx) = ChannelApprover::new(1);
        drop(rx);
        let request = ApprovalRequest {
            key_id: "k".into(),
            session_id: Uuid::new_v4(),
            comment: String::new(),
            fingerprint: String::new(),
        };
        assert!(!approver.request(&request).await);
    }
}
