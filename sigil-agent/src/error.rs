//! Error types for the agent.

use std::path::PathBuf;

/// Errors surfaced by the listener lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent is already listening on {0}")]
    AlreadyRunning(PathBuf),

    #[error("failed to bind agent endpoint {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Key material could not be turned into a usable signing key.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("malformed {kind} key: {reason}")]
    Malformed { kind: &'static str, reason: String },

    #[error("unsupported key type: {0}")]
    Unsupported(String),

    #[error("encrypted private keys are not supported")]
    Encrypted,

    #[error("public key does not match private key")]
    PublicMismatch,
}

impl KeyError {
    pub(crate) fn malformed(kind: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Malformed {
            kind,
            reason: reason.to_string(),
        }
    }
}

/// A request payload could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("truncated message")]
    Truncated,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("unsupported key constraint {0}")]
    UnsupportedConstraint(u8),
}

/// A key source could not supply the requested key.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("no key named {0:?}")]
    NotFound(String),

    #[error("invalid key id {0:?}")]
    InvalidId(String),

    #[error("cannot read key {id:?}: {source}")]
    Io {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("key {id:?} is unusable: {source}")]
    Key {
        id: String,
        #[source]
        source: KeyError,
    },
}

/// A loaded key failed to produce a signature.
#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("RSA signing failed: {0}")]
    Rsa(String),

    #[error("ECDSA signing failed: {0}")]
    Ecdsa(String),
}

/// Errors from the client side of the protocol.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("cannot connect to agent at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("agent refused the request")]
    Refused,

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("unexpected reply from agent (type {0})")]
    UnexpectedReply(u8),

    #[error("malformed reply from agent")]
    MalformedReply,
}
