//! Private key file detection.
//!
//! Scans text for private key PEM blocks and turns each into
//! [`KeyMaterial`].  Understands OpenSSH (`BEGIN OPENSSH PRIVATE KEY`),
//! PKCS#1 RSA, SEC1 EC and unencrypted PKCS#8.  Passphrase-protected keys are
//! recognised and rejected with [`KeyError::Encrypted`]; they are never
//! decrypted.

use ed25519_dalek::pkcs8::DecodePrivateKey as _;
use rsa::pkcs1::EncodeRsaPrivateKey as _;
use ssh_key::private::{EcdsaKeypair, KeypairData};
use zeroize::Zeroizing;

use crate::error::KeyError;
use crate::key::{AgentKey, EcdsaCurve, EcdsaKey, KeyMaterial};

const OPENSSH: &str = "OPENSSH PRIVATE KEY";
const PKCS8: &str = "PRIVATE KEY";
const PKCS8_ENCRYPTED: &str = "ENCRYPTED PRIVATE KEY";
const RSA: &str = "RSA PRIVATE KEY";
const EC: &str = "EC PRIVATE KEY";
const DSA: &str = "DSA PRIVATE KEY";

const CURVES: [EcdsaCurve; 3] = [EcdsaCurve::NistP256, EcdsaCurve::NistP384, EcdsaCurve::NistP521];

/// A parsed key file: the material plus the comment embedded in it (OpenSSH
/// files carry one; other formats yield an empty comment).
#[derive(Debug)]
pub struct KeyFile {
    pub material: KeyMaterial,
    pub comment: String,
}

/// Parse the first private key found in `text`.
pub fn parse_key_file(text: &str) -> Result<KeyFile, KeyError> {
    let (label, block) = pem_blocks(text)
        .next()
        .ok_or_else(|| KeyError::malformed("PEM", "no private key block found"))?;
    parse_block(label, block)
}

/// Extract every private key in `text`.
///
/// Blocks that fail to parse are skipped, so notes with a key pasted among
/// other text still yield the key.
pub fn extract_keys(text: &str) -> Vec<KeyFile> {
    pem_blocks(text)
        .filter_map(|(label, block)| parse_block(label, block).ok())
        .collect()
}

fn parse_block(label: &str, block: &str) -> Result<KeyFile, KeyError> {
    // Legacy OpenSSL encryption keeps the RSA/EC label and adds headers.
    if label == PKCS8_ENCRYPTED || block.contains("Proc-Type: 4,ENCRYPTED") {
        return Err(KeyError::Encrypted);
    }

    let material = match label {
        OPENSSH => return parse_openssh(block),
        RSA => checked(KeyMaterial::Rsa {
            encoded: encoded(block),
        })?,
        EC => first_curve(block)?,
        PKCS8 => parse_pkcs8(block)?,
        DSA => return Err(KeyError::Unsupported("ssh-dss".to_string())),
        other => return Err(KeyError::Unsupported(other.to_string())),
    };
    Ok(KeyFile {
        material,
        comment: String::new(),
    })
}

fn encoded(block: &str) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(block.as_bytes().to_vec())
}

/// Return `material` only if it parses into a usable key.
fn checked(material: KeyMaterial) -> Result<KeyMaterial, KeyError> {
    AgentKey::from_material(&material)?;
    Ok(material)
}

fn first_curve(block: &str) -> Result<KeyMaterial, KeyError> {
    CURVES
        .iter()
        .find_map(|&curve| {
            checked(KeyMaterial::Ecdsa {
                curve,
                encoded: encoded(block),
            })
            .ok()
        })
        .ok_or_else(|| KeyError::malformed("ECDSA", "not a P-256, P-384 or P-521 key"))
}

fn parse_pkcs8(block: &str) -> Result<KeyMaterial, KeyError> {
    if let Ok(material) = checked(KeyMaterial::Rsa {
        encoded: encoded(block),
    }) {
        return Ok(material);
    }
    if let Ok(material) = first_curve(block) {
        return Ok(material);
    }
    let key = ed25519_dalek::SigningKey::from_pkcs8_pem(block)
        .map_err(|e| KeyError::malformed("PKCS#8", e))?;
    Ok(KeyMaterial::Ed25519 {
        seed: Zeroizing::new(key.to_bytes()),
    })
}

fn parse_openssh(block: &str) -> Result<KeyFile, KeyError> {
    let key = ssh_key::PrivateKey::from_openssh(block.as_bytes())
        .map_err(|e| KeyError::malformed("OpenSSH", e))?;
    if key.is_encrypted() {
        return Err(KeyError::Encrypted);
    }

    let material = match key.key_data() {
        KeypairData::Ed25519(pair) => KeyMaterial::Ed25519 {
            seed: Zeroizing::new(pair.private.to_bytes()),
        },
        KeypairData::Rsa(pair) => {
            let private =
                rsa::RsaPrivateKey::try_from(pair).map_err(|e| KeyError::malformed("RSA", e))?;
            let der = private
                .to_pkcs1_der()
                .map_err(|e| KeyError::malformed("RSA", e))?;
            KeyMaterial::Rsa {
                encoded: Zeroizing::new(der.as_bytes().to_vec()),
            }
        }
        KeypairData::Ecdsa(pair) => {
            let (curve, scalar) = match pair {
                EcdsaKeypair::NistP256 { private, .. } => (EcdsaCurve::NistP256, private.as_slice()),
                EcdsaKeypair::NistP384 { private, .. } => (EcdsaCurve::NistP384, private.as_slice()),
                EcdsaKeypair::NistP521 { private, .. } => (EcdsaCurve::NistP521, private.as_slice()),
            };
            let pem = EcdsaKey::from_scalar(curve, scalar)?.to_sec1_pem()?;
            KeyMaterial::Ecdsa {
                curve,
                encoded: Zeroizing::new(pem.as_bytes().to_vec()),
            }
        }
        _ => return Err(KeyError::Unsupported(key.algorithm().as_str().to_string())),
    };

    Ok(KeyFile {
        material,
        comment: key.comment().to_string(),
    })
}

/// Iterate over `(label, block)` for every `-----BEGIN <label>-----` …
/// `-----END <label>-----` section whose label ends in `PRIVATE KEY`.
fn pem_blocks(text: &str) -> impl Iterator<Item = (&str, &str)> {
    const BEGIN: &str = "-----BEGIN ";
    const DASHES: &str = "-----";

    let mut rest = text;
    std::iter::from_fn(move || {
        loop {
            let start = rest.find(BEGIN)?;
            let after_begin = &rest[start + BEGIN.len()..];
            let label_len = after_begin.find(DASHES)?;
            let label = &after_begin[..label_len];

            let footer = format!("-----END {label}-----");
            let Some(end_rel) = rest[start..].find(&footer) else {
                rest = &after_begin[label_len..];
                continue;
            };
            let end = start + end_rel + footer.len();
            let block = &rest[start..end];
            rest = &rest[end..];

            if label.ends_with(PKCS8) {
                return Some((label, block));
            }
        }
    })
}
