//! Usage log.
//!
//! Every key lifecycle and signing event is appended to a local file as one
//! JSON object per line:
//!
//! ```json
//! {"timestamp":"2026-10-18T09:12:44.012Z","key_id":"SHA256:…","action":"sign","algorithm":"rsa-sha2-512"}
//! ```
//!
//! The log sits on the protocol path, so write failures are reported through
//! `tracing` and otherwise ignored; a full disk never turns into a failed
//! sign request.  Each record is also emitted as a `tracing` event on the
//! `sigil::audit` target.

use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

/// Audited event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Add,
    Remove,
    Expire,
    Approve,
    Sign,
    SignDenied,
    SignFailed,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Expire => "expire",
            Self::Approve => "approve",
            Self::Sign => "sign",
            Self::SignDenied => "sign_denied",
            Self::SignFailed => "sign_failed",
        }
    }
}

#[derive(Serialize)]
struct Record<'a> {
    timestamp: String,
    key_id: &'a str,
    action: Action,
    #[serde(flatten)]
    details: Map<String, Value>,
}

/// Append-only JSON-lines sink.
#[derive(Debug)]
pub struct UsageLog {
    path: Option<PathBuf>,
    file: Option<Mutex<File>>,
}

impl UsageLog {
    /// A log that only emits `tracing` events.
    pub fn disabled() -> Self {
        Self {
            path: None,
            file: None,
        }
    }

    /// Open (or create) the log file at `path` for appending, mode `0600`.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut options = std::fs::OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt as _;
            options.mode(0o600);
        }
        let file = options.open(path)?;

        Ok(Self {
            path: Some(path.to_path_buf()),
            file: Some(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one record.
    ///
    /// `details` must be a JSON object (its fields are merged into the
    /// record) or `Value::Null`; any other value is stored under `"details"`.
    pub fn record(&self, key_id: &str, action: Action, details: Value) {
        info!(target: "sigil::audit", key_id, action = action.as_str(), %details, "usage");

        let Some(file) = &self.file else {
            return;
        };

        let details = match details {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("details".to_string(), other);
                map
            }
        };
        let record = Record {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            key_id,
            action,
            details,
        };

        let mut line = match serde_json::to_vec(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "usage log: failed to serialise record");
                return;
            }
        };
        line.push(b'\n');

        let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = file.write_all(&line).and_then(|()| file.flush()) {
            warn!(path = ?self.path, error = %e, "usage log: write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn read_lines(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn records_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("usage.log");
        let log = UsageLog::open(&path).unwrap();

        log.record("k1", Action::Add, json!({"comment": "laptop"}));
        log.record("k1", Action::SignDenied, Value::Null);

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["key_id"], "k1");
        assert_eq!(lines[0]["action"], "add");
        assert_eq!(lines[0]["comment"], "laptop");
        assert!(lines[0]["timestamp"].as_str().unwrap().ends_with('Z'));
        assert_eq!(lines[1]["action"], "sign_denied");
    }

    #[test]
    fn reopening_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.log");
        UsageLog::open(&path).unwrap().record("a", Action::Add, Value::Null);
        UsageLog::open(&path).unwrap().record("a", Action::Remove, Value::Null);
        assert_eq!(read_lines(&path).len(), 2);
    }

    #[test]
    fn non_object_details_are_nested() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.log");
        let log = UsageLog::open(&path).unwrap();
        log.record("a", Action::SignFailed, json!("boom"));
        assert_eq!(read_lines(&path)[0]["details"], "boom");
    }

    #[test]
    fn disabled_log_is_silent() {
        let log = UsageLog::disabled();
        log.record("a", Action::Sign, Value::Null);
        assert!(log.path().is_none());
    }

    #[test]
    #[cfg(unix)]
    fn log_file_is_private() {
        use std::os::unix::fs::PermissionsExt as _;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.log");
        UsageLog::open(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
