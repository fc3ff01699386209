//! Askpass-style approval surface.
//!
//! The configured program (or `$SSH_ASKPASS`) is run with the prompt text as
//! its last argument and `SSH_ASKPASS_PROMPT=confirm` in the environment, the
//! same convention OpenSSH uses for `ssh-add -c` keys.  Exit status 0 means
//! the user approved.

use std::process::Stdio;

use async_trait::async_trait;
use sigil_agent::{ApprovalRequest, Approver};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct CommandApprover {
    program: String,
    args: Vec<String>,
}

impl CommandApprover {
    /// Split `command` on whitespace into program and leading arguments.
    pub fn new(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl Approver for CommandApprover {
    async fn request(&self, request: &ApprovalRequest) -> bool {
        debug!(program = %self.program, key_id = %request.key_id, "approval: launching confirm program");
        // kill_on_drop: a timed-out request drops this future mid-wait.
        let child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(request.prompt())
            .env("SSH_ASKPASS_PROMPT", "confirm")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %self.program, "approval: confirm program failed to launch: {e}");
                return false;
            }
        };

        match child.wait().await {
            Ok(status) => status.success(),
            Err(e) => {
                warn!(program = %self.program, "approval: waiting for confirm program failed: {e}");
                false
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn request() -> ApprovalRequest {
        ApprovalRequest {
            key_id: "work".to_string(),
            session_id: Uuid::new_v4(),
            comment: "alice@laptop".to_string(),
            fingerprint: "SHA256:abc".to_string(),
        }
    }

    fn script(dir: &tempfile::TempDir, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt as _;
        let path = dir.path().join("confirm.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[test]
    fn blank_command_is_rejected() {
        assert!(CommandApprover::new("   ").is_none());
        let approver = CommandApprover::new("zenity --question --text").unwrap();
        assert_eq!(approver.program(), "zenity");
        assert_eq!(approver.args, ["--question", "--text"]);
    }

    #[tokio::test]
    async fn exit_status_decides() {
        assert!(CommandApprover::new("true").unwrap().request(&request()).await);
        assert!(!CommandApprover::new("false").unwrap().request(&request()).await);
    }

    #[tokio::test]
    async fn missing_program_denies() {
        let approver = CommandApprover::new("/nonexistent/sigil-confirm").unwrap();
        assert!(!approver.request(&request()).await);
    }

    #[tokio::test]
    async fn follows_askpass_convention() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(
            &dir,
            r#"[ "$SSH_ASKPASS_PROMPT" = confirm ] || exit 2
case "$1" in *alice@laptop*SHA256:abc*) exit 0 ;; esac
exit 1"#,
        );
        let approver = CommandApprover::new(&program).unwrap();
        assert!(approver.request(&request()).await);
    }
}
