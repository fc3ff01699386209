//! Signature construction.
//!
//! Every function here returns the complete SSH signature blob:
//!
//! ```text
//! string  algorithm name
//! string  signature bytes   (ECDSA: mpint r || mpint s)
//! ```

use rsa::Pkcs1v15Sign;
use sha2::{Digest, Sha256, Sha512};
use signature::Signer as _;

use crate::error::SignError;
use crate::key::{AgentKey, ED25519_ALGORITHM, EcdsaKey, KeyKind, RSA_ALGORITHM};
use crate::wire::{SSH_AGENT_RSA_SHA2_256, SSH_AGENT_RSA_SHA2_512, put_mpint, put_string};

/// Hash selected for an RSA signature by the request flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsaHash {
    Sha1,
    Sha256,
    Sha512,
}

impl RsaHash {
    /// SHA-256 wins when both SHA-2 bits are set.
    pub fn from_flags(flags: u32) -> Self {
        if flags & SSH_AGENT_RSA_SHA2_256 != 0 {
            Self::Sha256
        } else if flags & SSH_AGENT_RSA_SHA2_512 != 0 {
            Self::Sha512
        } else {
            Self::Sha1
        }
    }

    pub fn algorithm(self) -> &'static str {
        match self {
            Self::Sha1 => RSA_ALGORITHM,
            Self::Sha256 => "rsa-sha2-256",
            Self::Sha512 => "rsa-sha2-512",
        }
    }
}

/// Signature algorithm name that [`sign`] will emit for this key and flags.
pub fn signature_algorithm(kind: KeyKind, flags: u32) -> &'static str {
    match kind {
        KeyKind::Rsa => RsaHash::from_flags(flags).algorithm(),
        other => other.algorithm(),
    }
}

/// Sign `data` with `key`.  `flags` only matters for RSA.
pub fn sign(key: &AgentKey, data: &[u8], flags: u32) -> Result<Vec<u8>, SignError> {
    match key {
        AgentKey::Ed25519(k) => Ok(sign_ed25519(k, data)),
        AgentKey::Rsa(k) => sign_rsa(k, data, RsaHash::from_flags(flags)),
        AgentKey::Ecdsa(k) => sign_ecdsa(k, data),
    }
}

fn sign_ed25519(key: &ed25519_dalek::SigningKey, data: &[u8]) -> Vec<u8> {
    let signature = key.sign(data);
    signature_blob(ED25519_ALGORITHM, &signature.to_bytes())
}

fn sign_rsa(key: &rsa::RsaPrivateKey, data: &[u8], hash: RsaHash) -> Result<Vec<u8>, SignError> {
    let signed = match hash {
        RsaHash::Sha1 => key.sign(Pkcs1v15Sign::new::<sha1::Sha1>(), &sha1::Sha1::digest(data)),
        RsaHash::Sha256 => key.sign(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(data)),
        RsaHash::Sha512 => key.sign(Pkcs1v15Sign::new::<Sha512>(), &Sha512::digest(data)),
    }
    .map_err(|e| SignError::Rsa(e.to_string()))?;
    Ok(signature_blob(hash.algorithm(), &signed))
}

macro_rules! ecdsa_rs {
    ($krate:ident, $secret:expr, $data:expr) => {{
        let signing_key = $krate::ecdsa::SigningKey::from_bytes(&$secret.to_bytes())
            .map_err(|e| SignError::Ecdsa(e.to_string()))?;
        let signature: $krate::ecdsa::Signature = signing_key
            .try_sign($data)
            .map_err(|e| SignError::Ecdsa(e.to_string()))?;
        let (r, s) = signature.split_bytes();
        (r.to_vec(), s.to_vec())
    }};
}

fn sign_ecdsa(key: &EcdsaKey, data: &[u8]) -> Result<Vec<u8>, SignError> {
    // Each curve hashes with its paired digest: SHA-256, SHA-384, SHA-512.
    let (r, s) = match key {
        EcdsaKey::NistP256(secret) => ecdsa_rs!(p256, secret, data),
        EcdsaKey::NistP384(secret) => ecdsa_rs!(p384, secret, data),
        EcdsaKey::NistP521(secret) => ecdsa_rs!(p521, secret, data),
    };
    let mut inner = Vec::with_capacity(r.len() + s.len() + 10);
    put_mpint(&mut inner, &r);
    put_mpint(&mut inner, &s);
    Ok(signature_blob(key.curve().algorithm(), &inner))
}

fn signature_blob(algorithm: &str, signature: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(8 + algorithm.len() + signature.len());
    put_string(&mut blob, algorithm.as_bytes());
    put_string(&mut blob, signature);
    blob
}
