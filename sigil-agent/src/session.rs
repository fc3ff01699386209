//! Per-connection request dispatch.
//!
//! An [`AgentSession`] owns one client stream.  Bytes are accumulated until a
//! complete frame is available; frames are handled strictly in arrival order
//! and each reply is written before the next frame is looked at.  A frame
//! declaring more than [`MAX_FRAME_LEN`] bytes ends the connection.
//!
//! Every protocol-level problem (unknown key, malformed payload, refused
//! approval, signing error) is answered with `SSH_AGENT_FAILURE`; only I/O
//! errors on this stream end the session early.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tracing::{debug, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::approval::{ApprovalGate, ApprovalRequest, Approver};
use crate::audit::{Action, UsageLog};
use crate::clock::{Clock, SystemClock};
use crate::key::fingerprint;
use crate::keystore::{AddOptions, KeyRecord, KeyStore};
use crate::proto::{self, AddIdentity, Request, SignRequest};
use crate::signer;
use crate::wire::{self, MAX_FRAME_LEN};

const READ_CHUNK: usize = 4096;

/// How approvals are obtained and how long they last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalPolicy {
    /// Lifetime of a grant once the approval surface says yes.
    pub grant_ttl: Duration,
    /// Give up on the approval surface after this long.  `None` waits forever.
    pub approval_timeout: Option<Duration>,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            grant_ttl: Duration::from_secs(300),
            approval_timeout: None,
        }
    }
}

/// Everything a session needs, shared by all connections.
pub struct AgentState {
    pub keys: KeyStore,
    pub approvals: ApprovalGate,
    pub usage: Arc<UsageLog>,
    approver: Option<Arc<dyn Approver>>,
    policy: ApprovalPolicy,
}

impl AgentState {
    pub fn new(usage: Arc<UsageLog>) -> Self {
        Self::with_clock(Arc::new(SystemClock), usage)
    }

    pub fn with_clock(clock: Arc<dyn Clock>, usage: Arc<UsageLog>) -> Self {
        Self {
            keys: KeyStore::new(Arc::clone(&clock), Arc::clone(&usage)),
            approvals: ApprovalGate::new(clock),
            usage,
            approver: None,
            policy: ApprovalPolicy::default(),
        }
    }

    /// Attach the interactive approval surface.  Without one, keys that
    /// require approval can never sign.
    pub fn with_approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = Some(approver);
        self
    }

    pub fn with_policy(mut self, policy: ApprovalPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> ApprovalPolicy {
        self.policy
    }
}

impl std::fmt::Debug for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentState")
            .field("keys", &self.keys.len())
            .field("approvals", &self.approvals.len())
            .field("approver", &self.approver.is_some())
            .field("policy", &self.policy)
            .finish()
    }
}

/// One client connection.
#[derive(Debug, Clone)]
pub struct AgentSession {
    state: Arc<AgentState>,
    id: Uuid,
}

impl AgentSession {
    pub fn new(state: Arc<AgentState>) -> Self {
        Self {
            state,
            id: Uuid::new_v4(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Serve `stream` until the peer disconnects, then drop this session's
    /// approval grants.
    pub async fn run<S>(self, mut stream: S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!(session = %self.id, "agent: connection opened");
        let result = self.serve(&mut stream).await;
        self.state.approvals.revoke_session(self.id);
        match &result {
            Ok(()) => debug!(session = %self.id, "agent: connection closed"),
            Err(e) => debug!(session = %self.id, error = %e, "agent: connection ended"),
        }
        result
    }

    async fn serve<S>(&self, stream: &mut S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = Zeroizing::new(Vec::new());
        let mut chunk = Zeroizing::new([0u8; READ_CHUNK]);

        loop {
            loop {
                if let Some(len) = wire::frame_len(&buf)
                    && len > MAX_FRAME_LEN
                {
                    warn!(session = %self.id, len, "agent: oversized frame, closing connection");
                    return Ok(());
                }
                let Some(frame) = wire::parse_frame(&buf) else {
                    break;
                };
                let consumed = frame.consumed;
                let reply = self.handle(frame.msg_type, frame.payload).await;
                buf.drain(..consumed);
                stream.write_all(&reply).await?;
                stream.flush().await?;
            }

            let n = stream.read(&mut chunk[..]).await?;
            if n == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Handle one request and return the complete reply frame.
    pub async fn handle(&self, msg_type: u8, payload: &[u8]) -> Vec<u8> {
        let request = match proto::parse(msg_type, payload) {
            Ok(request) => request,
            Err(e) => {
                debug!(session = %self.id, msg_type, error = %e, "agent: rejected request");
                return wire::failure();
            }
        };

        match request {
            Request::RequestIdentities => {
                let identities = self.state.keys.list();
                debug!(session = %self.id, count = identities.len(), "agent: request_identities");
                wire::identities_answer(
                    identities
                        .iter()
                        .map(|i| (i.blob.as_slice(), i.comment.as_str())),
                )
            }
            Request::Sign(request) => self.sign(request).await,
            Request::AddIdentity(add) => self.add_identity(*add),
            Request::RemoveIdentity { key_blob } => {
                if self.state.keys.remove_by_blob(key_blob) {
                    wire::success()
                } else {
                    wire::failure()
                }
            }
            Request::RemoveAllIdentities => {
                self.state.keys.remove_all();
                wire::success()
            }
            Request::Unknown(msg_type) => {
                debug!(session = %self.id, msg_type, "agent: unsupported message");
                wire::failure()
            }
        }
    }

    async fn sign(&self, request: SignRequest<'_>) -> Vec<u8> {
        let Some(mut record) = self.state.keys.get_by_blob(request.key_blob) else {
            return self.unknown_key(request.key_blob);
        };

        if !self.state.approvals.permits(&record, self.id) {
            if !self.request_approval(&record).await {
                self.state.usage.record(
                    &record.id,
                    Action::SignDenied,
                    json!({ "fingerprint": record.fingerprint, "session_id": self.id }),
                );
                return wire::failure();
            }
            // The key may have been removed or replaced while we waited.
            match self.state.keys.get_by_blob(request.key_blob) {
                Some(current) => record = current,
                None => return self.unknown_key(request.key_blob),
            }
            if !self.state.approvals.permits(&record, self.id) {
                debug!(session = %self.id, key_id = %record.id, "agent: key replaced during approval");
                self.state.usage.record(
                    &record.id,
                    Action::SignDenied,
                    json!({
                        "fingerprint": record.fingerprint,
                        "session_id": self.id,
                        "reason": "replaced_during_approval",
                    }),
                );
                return wire::failure();
            }
        }

        let algorithm = signer::signature_algorithm(record.kind(), request.flags);
        match signer::sign(&record.key, request.data, request.flags) {
            Ok(blob) => {
                debug!(
                    session = %self.id,
                    fingerprint = %record.fingerprint,
                    algorithm,
                    data_len = request.data.len(),
                    "agent: signed"
                );
                self.state.usage.record(
                    &record.id,
                    Action::Sign,
                    json!({
                        "fingerprint": record.fingerprint,
                        "algorithm": algorithm,
                        "session_id": self.id,
                    }),
                );
                wire::sign_response(&blob)
            }
            Err(e) => {
                warn!(session = %self.id, fingerprint = %record.fingerprint, error = %e, "agent: signing failed");
                self.state.usage.record(
                    &record.id,
                    Action::SignFailed,
                    json!({
                        "fingerprint": record.fingerprint,
                        "reason": e.to_string(),
                        "session_id": self.id,
                    }),
                );
                wire::failure()
            }
        }
    }

    fn unknown_key(&self, key_blob: &[u8]) -> Vec<u8> {
        let fp = fingerprint(key_blob);
        debug!(session = %self.id, fingerprint = %fp, "agent: sign request for unknown key");
        self.state.usage.record(
            &fp,
            Action::SignFailed,
            json!({ "reason": "unknown_key", "session_id": self.id }),
        );
        wire::failure()
    }

    /// Ask the approval surface about `record`, recording a grant on yes.
    ///
    /// No store or gate lock is held while waiting.
    async fn request_approval(&self, record: &KeyRecord) -> bool {
        let Some(approver) = &self.state.approver else {
            debug!(fingerprint = %record.fingerprint, "agent: approval required but no approver configured");
            return false;
        };

        let request = ApprovalRequest::for_record(record, self.id);
        let policy = self.state.policy;
        let approved = match policy.approval_timeout {
            Some(limit) => tokio::time::timeout(limit, approver.request(&request))
                .await
                .unwrap_or_else(|_| {
                    warn!(key_id = %record.id, "agent: approval timed out");
                    false
                }),
            None => approver.request(&request).await,
        };

        if approved {
            self.state
                .approvals
                .grant(&record.id, self.id, policy.grant_ttl);
            self.state.usage.record(
                &record.id,
                Action::Approve,
                json!({
                    "fingerprint": record.fingerprint,
                    "session_id": self.id,
                    "grant_ttl_secs": policy.grant_ttl.as_secs(),
                }),
            );
        }
        approved
    }

    fn add_identity(&self, add: AddIdentity) -> Vec<u8> {
        let id = fingerprint(&add.key.public_blob());
        let options = AddOptions {
            require_approval: add.confirm,
            ttl: add.lifetime,
        };
        self.state.keys.add_key(id, add.key, add.comment, options);
        wire::success()
    }
}
