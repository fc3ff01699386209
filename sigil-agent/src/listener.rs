//! Local endpoint and accept loop.
//!
//! On Unix the agent listens on a filesystem socket that only the owning
//! user can open (`0600`, parent directory created `0700`).  A socket left
//! behind by a crashed process is removed before binding; a socket that still
//! answers belongs to a live agent and is left alone.  On Windows the
//! endpoint is a named pipe.
//!
//! Each accepted connection runs as its own task in a [`JoinSet`], so
//! [`AgentServer::stop`] can abort whatever is still in flight.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::session::{AgentSession, AgentState};

struct Running {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// The agent's listening endpoint.
pub struct AgentServer {
    state: Arc<AgentState>,
    endpoint: PathBuf,
    running: Option<Running>,
}

impl std::fmt::Debug for AgentServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentServer")
            .field("endpoint", &self.endpoint)
            .field("running", &self.running.is_some())
            .finish_non_exhaustive()
    }
}

impl AgentServer {
    pub fn new(state: Arc<AgentState>, endpoint: impl Into<PathBuf>) -> Self {
        Self {
            state,
            endpoint: endpoint.into(),
            running: None,
        }
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    pub fn state(&self) -> &Arc<AgentState> {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bind the endpoint and start accepting connections.
    ///
    /// Returns once the endpoint is bound, so clients may connect as soon as
    /// this resolves.
    pub async fn start(&mut self) -> Result<(), AgentError> {
        if self.running.is_some() {
            return Err(AgentError::AlreadyRunning(self.endpoint.clone()));
        }

        let listener = platform::Listener::bind(&self.endpoint)?;
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, Arc::clone(&self.state), shutdown_rx));
        self.running = Some(Running { shutdown, task });

        info!(endpoint = %self.endpoint.display(), "agent: listening");
        Ok(())
    }

    /// Stop accepting, close in-flight connections, and release the
    /// endpoint.  Does nothing when not running.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.shutdown.send(());
        if let Err(e) = running.task.await {
            warn!(error = %e, "agent: accept loop ended abnormally");
        }
        platform::release(&self.endpoint);
        info!(endpoint = %self.endpoint.display(), "agent: stopped");
    }
}

impl Drop for AgentServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.task.abort();
            platform::release(&self.endpoint);
        }
    }
}

async fn accept_loop(
    mut listener: platform::Listener,
    state: Arc<AgentState>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    let session = AgentSession::new(Arc::clone(&state));
                    connections.spawn(async move {
                        let id = session.id();
                        if let Err(e) = session.run(stream).await {
                            debug!(session = %id, error = %e, "agent: connection error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "agent: accept failed");
                    // Back off so a persistent error (EMFILE) does not spin.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined
                    && e.is_panic()
                {
                    warn!(error = %e, "agent: connection task panicked");
                }
            }
        }
    }

    let open = connections.len();
    connections.shutdown().await;
    debug!(closed = open, "agent: accept loop finished");
}

#[cfg(unix)]
mod platform {
    use std::os::unix::fs::PermissionsExt as _;

    use tokio::net::{UnixListener, UnixStream};

    use super::*;

    pub(super) struct Listener(UnixListener);

    impl Listener {
        pub(super) fn bind(path: &Path) -> Result<Self, AgentError> {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
            {
                std::fs::create_dir_all(parent)?;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
            }

            if path.symlink_metadata().is_ok() {
                if std::os::unix::net::UnixStream::connect(path).is_ok() {
                    return Err(AgentError::Bind {
                        path: path.to_path_buf(),
                        source: io::Error::new(
                            io::ErrorKind::AddrInUse,
                            "another agent is listening on this socket",
                        ),
                    });
                }
                debug!(path = %path.display(), "agent: removing stale socket");
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), "failed to remove stale agent socket: {e}");
                }
            }

            let listener = UnixListener::bind(path).map_err(|source| AgentError::Bind {
                path: path.to_path_buf(),
                source,
            })?;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
            Ok(Self(listener))
        }

        pub(super) async fn accept(&mut self) -> io::Result<UnixStream> {
            self.0.accept().await.map(|(stream, _)| stream)
        }
    }

    pub(super) fn release(path: &Path) {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), "failed to remove agent socket: {e}"),
        }
    }
}

#[cfg(windows)]
mod platform {
    use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};

    use super::*;

    pub(super) struct Listener {
        name: PathBuf,
        next: NamedPipeServer,
    }

    impl Listener {
        pub(super) fn bind(name: &Path) -> Result<Self, AgentError> {
            let next = ServerOptions::new()
                .first_pipe_instance(true)
                .create(name)
                .map_err(|source| AgentError::Bind {
                    path: name.to_path_buf(),
                    source,
                })?;
            Ok(Self {
                name: name.to_path_buf(),
                next,
            })
        }

        pub(super) async fn accept(&mut self) -> io::Result<NamedPipeServer> {
            self.next.connect().await?;
            let fresh = ServerOptions::new().create(&self.name)?;
            Ok(std::mem::replace(&mut self.next, fresh))
        }
    }

    /// Named pipes vanish with their last handle.
    pub(super) fn release(_name: &Path) {}
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt as _;

    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::UnixStream;

    use super::*;
    use crate::audit::UsageLog;
    use crate::proto;
    use crate::wire::SSH_AGENT_IDENTITIES_ANSWER;

    fn server(path: &Path) -> AgentServer {
        let state = Arc::new(AgentState::new(Arc::new(UsageLog::disabled())));
        AgentServer::new(state, path)
    }

    async fn identities_reply_type(path: &Path) -> u8 {
        let mut stream = UnixStream::connect(path).await.unwrap();
        stream.write_all(&proto::request_identities()).await.unwrap();
        // Empty identities answer: length, type, zero count.
        let mut reply = [0u8; 9];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[4], SSH_AGENT_IDENTITIES_ANSWER);
        reply[4]
    }

    #[tokio::test]
    async fn start_serves_and_stop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("agent.sock");
        let mut server = server(&path);

        server.start().await.unwrap();
        assert!(server.is_running());
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
        assert_eq!(identities_reply_type(&path).await, SSH_AGENT_IDENTITIES_ANSWER);

        server.stop().await;
        assert!(!server.is_running());
        assert!(!path.exists());
        // Stopping twice is harmless.
        server.stop().await;
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let mut server = server(&path);
        server.start().await.unwrap();
        assert!(matches!(server.start().await, Err(AgentError::AlreadyRunning(_))));
        server.stop().await;
    }

    #[tokio::test]
    async fn stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let mut server = server(&path);
        server.start().await.unwrap();
        assert_eq!(identities_reply_type(&path).await, SSH_AGENT_IDENTITIES_ANSWER);
        server.stop().await;
    }

    #[tokio::test]
    async fn live_socket_is_not_stolen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let mut first = server(&path);
        first.start().await.unwrap();

        let mut second = server(&path);
        match second.start().await {
            Err(AgentError::Bind { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::AddrInUse);
            }
            other => panic!("expected bind error, got {other:?}"),
        }
        assert_eq!(identities_reply_type(&path).await, SSH_AGENT_IDENTITIES_ANSWER);
        first.stop().await;
    }

    #[tokio::test]
    async fn stop_closes_open_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let mut server = server(&path);
        server.start().await.unwrap();

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_all(&proto::request_identities()).await.unwrap();
        // Empty identities answer: length, type, zero count.
        let mut reply = [0u8; 9];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[4], SSH_AGENT_IDENTITIES_ANSWER);

        server.stop().await;
        let mut rest = Vec::new();
        let read = stream.read_to_end(&mut rest).await;
        assert!(matches!(read, Ok(0)) || read.is_err());
    }

    #[tokio::test]
    async fn drop_removes_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let mut server = server(&path);
        server.start().await.unwrap();
        drop(server);
        assert!(!path.exists());
    }
}
