//! Typed agent messages.
//!
//! [`parse`] turns a frame's `(type, payload)` into a [`Request`]; the
//! builders at the bottom produce the same byte layout from the client side.
//! Key fields inside add-identity messages are decoded straight into an
//! [`AgentKey`], checking that the public half matches the private half.

use std::time::Duration;

use rsa::BigUint;
use rsa::traits::{PrivateKeyParts as _, PublicKeyParts as _};
use zeroize::Zeroizing;

use crate::error::{KeyError, ProtoError};
use crate::key::{AgentKey, ED25519_ALGORITHM, EcdsaCurve, EcdsaKey, RSA_ALGORITHM};
use crate::keystore::Identity;
use crate::wire::{
    self, Reader, SSH_AGENT_CONSTRAIN_CONFIRM, SSH_AGENT_CONSTRAIN_LIFETIME,
    SSH_AGENTC_ADD_ID_CONSTRAINED, SSH_AGENTC_ADD_IDENTITY, SSH_AGENTC_REMOVE_ALL_IDENTITIES,
    SSH_AGENTC_REMOVE_IDENTITY, SSH_AGENTC_REQUEST_IDENTITIES, SSH_AGENTC_SIGN_REQUEST, put_mpint,
    put_string, put_u32,
};

/// A decoded client request.
#[derive(Debug)]
pub enum Request<'a> {
    RequestIdentities,
    Sign(SignRequest<'a>),
    AddIdentity(Box<AddIdentity>),
    RemoveIdentity { key_blob: &'a [u8] },
    RemoveAllIdentities,
    /// Any message type the agent does not implement.
    Unknown(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignRequest<'a> {
    pub key_blob: &'a [u8],
    pub data: &'a [u8],
    pub flags: u32,
}

/// A private key pushed by a client, with its constraints applied.
#[derive(Debug)]
pub struct AddIdentity {
    pub key: AgentKey,
    pub comment: String,
    pub lifetime: Option<Duration>,
    pub confirm: bool,
}

/// Constraints a client may attach when adding a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Constraints {
    pub lifetime: Option<Duration>,
    pub confirm: bool,
}

impl Constraints {
    pub fn is_empty(&self) -> bool {
        self.lifetime.is_none() && !self.confirm
    }
}

fn need<T>(value: Option<T>) -> Result<T, ProtoError> {
    value.ok_or(ProtoError::Truncated)
}

/// Decode one request.
pub fn parse(msg_type: u8, payload: &[u8]) -> Result<Request<'_>, ProtoError> {
    let mut reader = Reader::new(payload);
    let request = match msg_type {
        SSH_AGENTC_REQUEST_IDENTITIES => Request::RequestIdentities,
        SSH_AGENTC_SIGN_REQUEST => Request::Sign(SignRequest {
            key_blob: need(reader.string())?,
            data: need(reader.string())?,
            flags: need(reader.u32())?,
        }),
        SSH_AGENTC_ADD_IDENTITY | SSH_AGENTC_ADD_ID_CONSTRAINED => {
            let key = read_private_key(&mut reader)?;
            let comment = String::from_utf8_lossy(need(reader.string())?).into_owned();
            let constraints = if msg_type == SSH_AGENTC_ADD_ID_CONSTRAINED {
                read_constraints(&mut reader)?
            } else {
                Constraints::default()
            };
            Request::AddIdentity(Box::new(AddIdentity {
                key,
                comment,
                lifetime: constraints.lifetime,
                confirm: constraints.confirm,
            }))
        }
        SSH_AGENTC_REMOVE_IDENTITY => Request::RemoveIdentity {
            key_blob: need(reader.string())?,
        },
        SSH_AGENTC_REMOVE_ALL_IDENTITIES => Request::RemoveAllIdentities,
        other => Request::Unknown(other),
    };
    Ok(request)
}

fn read_constraints(reader: &mut Reader<'_>) -> Result<Constraints, ProtoError> {
    let mut constraints = Constraints::default();
    while !reader.is_empty() {
        match need(reader.u8())? {
            SSH_AGENT_CONSTRAIN_LIFETIME => {
                let secs = need(reader.u32())?;
                // Zero means "no lifetime", as in OpenSSH.
                constraints.lifetime = (secs > 0).then(|| Duration::from_secs(u64::from(secs)));
            }
            SSH_AGENT_CONSTRAIN_CONFIRM => constraints.confirm = true,
            other => return Err(ProtoError::UnsupportedConstraint(other)),
        }
    }
    Ok(constraints)
}

/// Decode the key fields of an add-identity message.
///
/// ```text
/// ssh-ed25519          string pub(32)  string seed||pub(64)
/// ssh-rsa              mpint n  e  d  iqmp  p  q
/// ecdsa-sha2-<curve>   string curve  string Q  mpint d
/// ```
pub fn read_private_key(reader: &mut Reader<'_>) -> Result<AgentKey, ProtoError> {
    let algorithm = need(reader.utf8())?;
    match algorithm {
        ED25519_ALGORITHM => {
            let public = need(reader.string())?;
            let private = need(reader.string())?;
            if public.len() != 32 || private.len() != 64 {
                return Err(KeyError::malformed("Ed25519", "bad field length").into());
            }
            let mut seed = Zeroizing::new([0u8; 32]);
            seed.copy_from_slice(&private[..32]);
            let key = ed25519_dalek::SigningKey::from_bytes(&seed);
            if key.verifying_key().as_bytes() != public || &private[32..] != public {
                return Err(KeyError::PublicMismatch.into());
            }
            Ok(AgentKey::Ed25519(key))
        }
        RSA_ALGORITHM => {
            let mut next = || need(reader.mpint()).map(BigUint::from_bytes_be);
            let n = next()?;
            let e = next()?;
            let d = next()?;
            let _iqmp = next()?;
            let p = next()?;
            let q = next()?;
            let key = rsa::RsaPrivateKey::from_components(n, e, d, vec![p, q])
                .map_err(|e| KeyError::malformed("RSA", e))?;
            key.validate().map_err(|e| KeyError::malformed("RSA", e))?;
            Ok(AgentKey::Rsa(Box::new(key)))
        }
        _ => {
            let curve = EcdsaCurve::from_algorithm(algorithm)
                .ok_or_else(|| KeyError::Unsupported(algorithm.to_string()))?;
            let curve_name = need(reader.utf8())?;
            if curve_name != curve.name() {
                return Err(ProtoError::Malformed(format!(
                    "curve {curve_name} does not match {algorithm}"
                )));
            }
            let public = need(reader.string())?;
            let scalar = need(reader.mpint())?;
            let key = EcdsaKey::from_scalar(curve, scalar)?;
            if key.public_point() != public {
                return Err(KeyError::PublicMismatch.into());
            }
            Ok(AgentKey::Ecdsa(key))
        }
    }
}

/// Decode an `SSH_AGENT_IDENTITIES_ANSWER` payload.
pub fn parse_identities(payload: &[u8]) -> Result<Vec<Identity>, ProtoError> {
    let mut reader = Reader::new(payload);
    let count = need(reader.u32())?;
    // Each entry needs at least two length prefixes.
    if count as usize > reader.remaining() / 8 {
        return Err(ProtoError::Malformed(format!("{count} identities claimed")));
    }
    let mut identities = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let blob = need(reader.string())?.to_vec();
        let comment = String::from_utf8_lossy(need(reader.string())?).into_owned();
        identities.push(Identity { blob, comment });
    }
    Ok(identities)
}

/// Decode an `SSH_AGENT_SIGN_RESPONSE` payload into the signature blob.
pub fn parse_sign_response(payload: &[u8]) -> Result<&[u8], ProtoError> {
    need(Reader::new(payload).string())
}

// ---------------------------------------------------------------------------
// Client-side builders
// ---------------------------------------------------------------------------

pub fn request_identities() -> Vec<u8> {
    wire::frame(SSH_AGENTC_REQUEST_IDENTITIES, &[])
}

pub fn sign_request(key_blob: &[u8], data: &[u8], flags: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12 + key_blob.len() + data.len());
    put_string(&mut payload, key_blob);
    put_string(&mut payload, data);
    put_u32(&mut payload, flags);
    wire::frame(SSH_AGENTC_SIGN_REQUEST, &payload)
}

/// Encode `key` for an add-identity request.  Uses the constrained variant
/// only when `constraints` is non-empty.
pub fn add_identity(
    key: &AgentKey,
    comment: &str,
    constraints: Constraints,
) -> Result<Zeroizing<Vec<u8>>, KeyError> {
    let mut payload = Zeroizing::new(Vec::new());
    write_private_key(&mut payload, key)?;
    put_string(&mut payload, comment.as_bytes());

    let msg_type = if constraints.is_empty() {
        SSH_AGENTC_ADD_IDENTITY
    } else {
        if let Some(lifetime) = constraints.lifetime {
            payload.push(SSH_AGENT_CONSTRAIN_LIFETIME);
            put_u32(&mut payload, u32::try_from(lifetime.as_secs()).unwrap_or(u32::MAX));
        }
        if constraints.confirm {
            payload.push(SSH_AGENT_CONSTRAIN_CONFIRM);
        }
        SSH_AGENTC_ADD_ID_CONSTRAINED
    };
    Ok(Zeroizing::new(wire::frame(msg_type, &payload)))
}

fn write_private_key(out: &mut Vec<u8>, key: &AgentKey) -> Result<(), KeyError> {
    match key {
        AgentKey::Ed25519(k) => {
            let public = k.verifying_key().to_bytes();
            let mut private = Zeroizing::new(Vec::with_capacity(64));
            private.extend_from_slice(k.as_bytes());
            private.extend_from_slice(&public);
            put_string(out, ED25519_ALGORITHM.as_bytes());
            put_string(out, &public);
            put_string(out, &private);
        }
        AgentKey::Rsa(k) => {
            let [p, q] = k.primes() else {
                return Err(KeyError::Unsupported("multi-prime RSA".into()));
            };
            let iqmp = k
                .crt_coefficient()
                .ok_or_else(|| KeyError::malformed("RSA", "missing CRT coefficient"))?;
            put_string(out, RSA_ALGORITHM.as_bytes());
            for part in [k.n(), k.e(), k.d(), &iqmp, p, q] {
                put_mpint(out, &Zeroizing::new(part.to_bytes_be()));
            }
        }
        AgentKey::Ecdsa(k) => {
            let curve = k.curve();
            put_string(out, curve.algorithm().as_bytes());
            put_string(out, curve.name().as_bytes());
            put_string(out, &k.public_point());
            put_mpint(out, &k.scalar_bytes());
        }
    }
    Ok(())
}

pub fn remove_identity(key_blob: &[u8]) -> Vec<u8> {
    wire::frame(SSH_AGENTC_REMOVE_IDENTITY, &wire::write_string(key_blob))
}

pub fn remove_all_identities() -> Vec<u8> {
    wire::frame(SSH_AGENTC_REMOVE_ALL_IDENTITIES, &[])
}
