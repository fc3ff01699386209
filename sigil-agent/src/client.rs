//! Client side of the agent protocol.
//!
//! Used by the `sigil` command-line tool and by tests that exercise a real
//! endpoint.  One request is in flight at a time; each call writes a frame
//! and waits for exactly one reply.

use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::error::ClientError;
use crate::key::AgentKey;
use crate::keystore::Identity;
use crate::proto::{self, Constraints};
use crate::wire::{
    MAX_FRAME_LEN, SSH_AGENT_FAILURE, SSH_AGENT_IDENTITIES_ANSWER, SSH_AGENT_SIGN_RESPONSE,
    SSH_AGENT_SUCCESS,
};

/// A connection to a running agent.
#[derive(Debug)]
pub struct AgentClient<S> {
    stream: S,
}

#[cfg(unix)]
impl AgentClient<tokio::net::UnixStream> {
    pub async fn connect(path: &Path) -> Result<Self, ClientError> {
        let stream = tokio::net::UnixStream::connect(path)
            .await
            .map_err(|source| ClientError::Connect {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::from_stream(stream))
    }
}

#[cfg(windows)]
impl AgentClient<tokio::net::windows::named_pipe::NamedPipeClient> {
    pub async fn connect(path: &Path) -> Result<Self, ClientError> {
        let stream = tokio::net::windows::named_pipe::ClientOptions::new()
            .open(path)
            .map_err(|source| ClientError::Connect {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::from_stream(stream))
    }
}

impl<S> AgentClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn from_stream(stream: S) -> Self {
        Self { stream }
    }

    pub async fn list_identities(&mut self) -> Result<Vec<Identity>, ClientError> {
        let payload = self
            .call(&proto::request_identities(), SSH_AGENT_IDENTITIES_ANSWER)
            .await?;
        proto::parse_identities(&payload).map_err(|_| ClientError::MalformedReply)
    }

    /// Ask the agent to sign `data`; returns the full signature blob.
    pub async fn sign(
        &mut self,
        key_blob: &[u8],
        data: &[u8],
        flags: u32,
    ) -> Result<Vec<u8>, ClientError> {
        let payload = self
            .call(&proto::sign_request(key_blob, data, flags), SSH_AGENT_SIGN_RESPONSE)
            .await?;
        proto::parse_sign_response(&payload)
            .map(<[u8]>::to_vec)
            .map_err(|_| ClientError::MalformedReply)
    }

    pub async fn add(
        &mut self,
        key: &AgentKey,
        comment: &str,
        constraints: Constraints,
    ) -> Result<(), ClientError> {
        let request = proto::add_identity(key, comment, constraints)?;
        self.call(&request, SSH_AGENT_SUCCESS).await.map(drop)
    }

    pub async fn remove(&mut self, key_blob: &[u8]) -> Result<(), ClientError> {
        self.call(&proto::remove_identity(key_blob), SSH_AGENT_SUCCESS)
            .await
            .map(drop)
    }

    pub async fn remove_all(&mut self) -> Result<(), ClientError> {
        self.call(&proto::remove_all_identities(), SSH_AGENT_SUCCESS)
            .await
            .map(drop)
    }

    async fn call(&mut self, request: &[u8], expected: u8) -> Result<Vec<u8>, ClientError> {
        self.stream.write_all(request).await?;
        self.stream.flush().await?;

        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).await?;
        let len = u32::from_be_bytes(header) as usize;
        if len == 0 || len > MAX_FRAME_LEN {
            return Err(ClientError::MalformedReply);
        }
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await?;

        match body[0] {
            t if t == expected => {
                body.remove(0);
                Ok(body)
            }
            SSH_AGENT_FAILURE => Err(ClientError::Refused),
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }
}
