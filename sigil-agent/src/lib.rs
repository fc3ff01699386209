//! SSH agent core for sigil.
//!
//! Holds decrypted private keys in memory and serves them to unmodified SSH
//! clients over the standard agent protocol.  Private material never leaves
//! the process; clients only ever see public key blobs and signatures.  On
//! top of the protocol sit two policies it has no native notion of: keys can
//! expire, and keys can require an interactive approval per connection.
//!
//! # Architecture
//!
//! ```text
//!                 AgentServer (Unix socket / named pipe)
//!                        │ accept
//!                        ▼
//!                 AgentSession  ── one per connection, own task
//!                        │ frames (wire) → Request (proto)
//!          ┌─────────────┼──────────────┐
//!          ▼             ▼              ▼
//!      KeyStore    ApprovalGate ◄── Approver (ChannelApprover, …)
//!          │             │
//!          └──── signer ─┘──► reply frame
//!                        │
//!                    UsageLog (JSON lines)
//! ```
//!
//! [`AgentState`] owns the shared pieces; there are no globals.  The key
//! store and the approval gate each guard their maps with one mutex that is
//! never held across an `.await`.

pub mod approval;
pub mod audit;
pub mod client;
pub mod clock;
pub mod error;
pub mod key;
pub mod keystore;
pub mod listener;
pub mod pem;
pub mod proto;
pub mod session;
pub mod signer;
pub mod source;
pub mod wire;

#[cfg(test)]
mod testkeys;

pub use approval::{ApprovalGate, ApprovalRequest, Approver, ChannelApprover, PendingApproval};
pub use audit::{Action, UsageLog};
pub use client::AgentClient;
pub use clock::{Clock, SystemClock};
pub use error::{AgentError, ClientError, KeyError, ProtoError, SignError, SourceError};
pub use key::{AgentKey, EcdsaCurve, KeyKind, KeyMaterial, fingerprint};
pub use keystore::{AddOptions, Identity, KeyRecord, KeyStore};
pub use listener::AgentServer;
pub use proto::Constraints;
pub use session::{AgentSession, AgentState, ApprovalPolicy};
pub use source::{DirKeySource, KeySource, SourcedKey, add_from_source};
