//! Key sources.
//!
//! A [`KeySource`] hands out private key material by id on request.  The
//! agent never enumerates or caches a source; callers fetch one key, add it
//! to the [`KeyStore`], and the material buffer is zeroized when dropped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::key::KeyMaterial;
use crate::keystore::{AddOptions, KeyRecord, KeyStore};
use crate::pem::parse_key_file;

/// Key material plus the metadata the source knows about it.
#[derive(Debug)]
pub struct SourcedKey {
    pub material: KeyMaterial,
    pub comment: String,
}

#[async_trait]
pub trait KeySource: Send + Sync {
    /// Fetch the key named `id`.
    async fn fetch(&self, id: &str) -> Result<SourcedKey, SourceError>;
}

/// Fetch `id` from `source` and add it to `store` under the same id.
pub async fn add_from_source(
    store: &KeyStore,
    source: &dyn KeySource,
    id: &str,
    options: AddOptions,
) -> Result<Arc<KeyRecord>, SourceError> {
    let sourced = source.fetch(id).await?;
    store
        .add(id, &sourced.material, sourced.comment, options)
        .map_err(|source| SourceError::Key {
            id: id.to_string(),
            source,
        })
}

/// Serves key files from one directory; the id is the file name.
#[derive(Debug, Clone)]
pub struct DirKeySource {
    dir: PathBuf,
}

impl DirKeySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, SourceError> {
        let invalid = id.is_empty()
            || id.starts_with('.')
            || id.contains(['/', '\\'])
            || id.contains('\0');
        if invalid {
            return Err(SourceError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(id))
    }
}

#[async_trait]
impl KeySource for DirKeySource {
    async fn fetch(&self, id: &str) -> Result<SourcedKey, SourceError> {
        let path = self.path_for(id)?;
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => zeroize::Zeroizing::new(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::NotFound(id.to_string()));
            }
            Err(source) => {
                return Err(SourceError::Io {
                    id: id.to_string(),
                    source,
                });
            }
        };
        warn_if_exposed(&path);

        let file = parse_key_file(&text).map_err(|source| SourceError::Key {
            id: id.to_string(),
            source,
        })?;
        debug!(id, kind = %file.material.kind(), "key source: loaded key file");

        let comment = if file.comment.is_empty() {
            id.to_string()
        } else {
            file.comment
        };
        Ok(SourcedKey {
            material: file.material,
            comment,
        })
    }
}

#[cfg(unix)]
fn warn_if_exposed(path: &Path) {
    use std::os::unix::fs::PermissionsExt as _;
    if let Ok(meta) = std::fs::metadata(path) {
        let mode = meta.permissions().mode();
        if mode & 0o077 != 0 {
            warn!(
                path = %path.display(),
                mode = %format!("{:04o}", mode & 0o7777),
                "key file is accessible by other users; consider chmod 600"
            );
        }
    }
}

#[cfg(not(unix))]
fn warn_if_exposed(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::UsageLog;
    use crate::clock::ManualClock;
    use crate::key::KeyKind;
    use crate::testkeys;

    fn source_with(files: &[(&str, &str)]) -> (tempfile::TempDir, DirKeySource) {
        let dir = tempfile::tempdir().unwrap();
        for (name, contents) in files {
            std::fs::write(dir.path().join(name), contents).unwrap();
        }
        let source = DirKeySource::new(dir.path());
        (dir, source)
    }

    #[tokio::test]
    async fn fetches_by_file_name() {
        let (_dir, source) = source_with(&[("work", testkeys::OPENSSH_ED25519)]);
        let key = source.fetch("work").await.unwrap();
        assert_eq!(key.material.kind(), KeyKind::Ed25519);
        assert_eq!(key.comment, "fixture");
    }

    #[tokio::test]
    async fn comment_defaults_to_id() {
        let (_dir, source) = source_with(&[("deploy", testkeys::RSA_PEM)]);
        assert_eq!(source.fetch("deploy").await.unwrap().comment, "deploy");
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let (_dir, source) = source_with(&[]);
        assert!(matches!(source.fetch("nope").await, Err(SourceError::NotFound(_))));
    }

    #[tokio::test]
    async fn path_escapes_are_rejected() {
        let (_dir, source) = source_with(&[]);
        for id in ["", "..", "../etc/passwd", "a/b", ".hidden", "a\\b"] {
            assert!(
                matches!(source.fetch(id).await, Err(SourceError::InvalidId(_))),
                "{id:?}"
            );
        }
    }

    #[tokio::test]
    async fn unusable_key_reports_parse_error() {
        let (_dir, source) = source_with(&[("enc", testkeys::OPENSSH_ENCRYPTED)]);
        assert!(matches!(
            source.fetch("enc").await,
            Err(SourceError::Key { .. })
        ));
    }

    #[tokio::test]
    async fn add_from_source_registers_under_id() {
        let (_dir, source) = source_with(&[("laptop", testkeys::P384_PEM)]);
        let store = KeyStore::new(
            Arc::new(ManualClock::default()),
            Arc::new(UsageLog::disabled()),
        );
        let record = add_from_source(&store, &source, "laptop", AddOptions::default())
            .await
            .unwrap();
        assert_eq!(record.id, "laptop");
        assert_eq!(record.comment, "laptop");
        assert!(store.get("laptop").is_some());
    }
}
