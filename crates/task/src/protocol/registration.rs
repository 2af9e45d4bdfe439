//! Parent-side management channel that forked workers register on.
//!
//! The hub listens on a Unix socket. A worker connects, sends a
//! `runtime.registered` notification carrying its deployment id, and the
//! connection is handed to whichever launcher subscribed to that id.

use dashmap::DashMap;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use tasklaunch_config::WorkerSettings;
use tasklaunch_core::{Error, Result, SESSION_ID_BOUND};

use super::types::{methods, JsonRpcNotification, RegisteredParams, JSONRPC_VERSION};

const CONTACT_SCHEME: &str = "unix://";

/// A worker connection that completed its registration
pub struct RegisteredRuntime {
    pub info: RegisteredParams,
    pub reader: BufReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,
}

type Waiters = Arc<DashMap<u32, oneshot::Sender<RegisteredRuntime>>>;

/// Listener that correlates worker registrations with waiting launchers
pub struct RegistrationHub {
    socket_path: PathBuf,
    waiters: Waiters,
    accept_loop: JoinHandle<()>,
}

impl RegistrationHub {
    /// Bind a fresh socket in the configured socket directory
    pub async fn bind(settings: &WorkerSettings) -> Result<Arc<Self>> {
        let dir = settings.resolve_socket_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::file_system(dir.clone(), "create socket directory", e))?;

        let name = uuid::Uuid::new_v4().simple().to_string();
        let socket_path = dir.join(format!("tasklaunch-{}.sock", &name[..12]));
        if socket_path.exists() {
            tokio::fs::remove_file(&socket_path)
                .await
                .map_err(|e| Error::file_system(socket_path.clone(), "remove existing socket", e))?;
        }

        let listener = UnixListener::bind(&socket_path).map_err(|e| {
            Error::configuration(format!(
                "Failed to bind to socket {}: {}",
                socket_path.display(),
                e
            ))
        })?;
        tracing::debug!(socket_path = %socket_path.display(), "registration hub listening");

        let waiters: Waiters = Arc::new(DashMap::new());
        let accept_loop = tokio::spawn(Self::accept_connections(
            listener,
            Arc::clone(&waiters),
            settings.handshake_timeout,
        ));

        Ok(Arc::new(Self {
            socket_path,
            waiters,
            accept_loop,
        }))
    }

    /// URL workers are told to register on
    #[must_use]
    pub fn contact_url(&self) -> String {
        format!("{CONTACT_SCHEME}{}", self.socket_path.display())
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// A random session id nobody is currently waiting on
    #[must_use]
    pub fn fresh_session_id(&self) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let id = rng.gen_range(0..SESSION_ID_BOUND);
            if !self.waiters.contains_key(&id) {
                return id;
            }
        }
    }

    /// Wait for the worker registering under `session_id`.
    ///
    /// The subscription is removed when the returned guard is dropped.
    pub fn subscribe(&self, session_id: u32) -> Result<Registration> {
        let (sender, receiver) = oneshot::channel();
        match self.waiters.entry(session_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::configuration(format!(
                    "session {session_id} already has a subscriber"
                )))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(sender);
            }
        }
        Ok(Registration {
            session_id,
            receiver,
            waiters: Arc::clone(&self.waiters),
        })
    }

    async fn accept_connections(listener: UnixListener, waiters: Waiters, handshake: Duration) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let waiters = Arc::clone(&waiters);
                    tokio::spawn(async move {
                        let registration = Self::handle_registration(stream, waiters, handshake);
                        if let Err(e) = registration.await {
                            tracing::warn!(error = %e, "rejected worker registration");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept worker connection");
                    // Continue accepting other connections
                }
            }
        }
    }

    async fn handle_registration(
        stream: UnixStream,
        waiters: Waiters,
        handshake: Duration,
    ) -> Result<()> {
        let (read_half, writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        let read = tokio::time::timeout(handshake, reader.read_line(&mut line))
            .await
            .map_err(|_| Error::timeout("worker registration handshake", handshake))?
            .map_err(|e| Error::protocol(format!("Failed to read registration: {e}")))?;
        if read == 0 {
            return Err(Error::protocol("worker closed the connection before registering"));
        }

        let notification: JsonRpcNotification<RegisteredParams> =
            serde_json::from_str(line.trim())
                .map_err(|e| Error::protocol(format!("Invalid registration: {e}")))?;
        if notification.jsonrpc != JSONRPC_VERSION || notification.method != methods::REGISTERED {
            return Err(Error::protocol(format!(
                "expected '{}' notification, got '{}'",
                methods::REGISTERED,
                notification.method
            )));
        }

        let info = notification.params;
        let Some((_, waiter)) = waiters.remove(&info.deployment_id) else {
            tracing::warn!(
                deployment_id = info.deployment_id,
                pid = info.pid,
                "registration for an unknown session, dropping it"
            );
            return Ok(());
        };

        tracing::debug!(deployment_id = info.deployment_id, pid = info.pid, "worker registered");
        let deployment_id = info.deployment_id;
        if waiter
            .send(RegisteredRuntime {
                info,
                reader,
                writer,
            })
            .is_err()
        {
            tracing::warn!(deployment_id, "launcher stopped waiting before the worker registered");
        }
        Ok(())
    }
}

impl Drop for RegistrationHub {
    fn drop(&mut self) {
        self.accept_loop.abort();
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            tracing::debug!(
                socket_path = %self.socket_path.display(),
                error = %e,
                "failed to remove socket"
            );
        }
    }
}

/// Outcome of one bounded wait on a [`Registration`]
pub enum WaitOutcome {
    Registered(RegisteredRuntime),
    TimedOut,
    /// The hub went away
    Closed,
}

/// Subscription to one session id
pub struct Registration {
    session_id: u32,
    receiver: oneshot::Receiver<RegisteredRuntime>,
    waiters: Waiters,
}

impl Registration {
    #[must_use]
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Wait up to `timeout` for the registration signal
    pub async fn wait(&mut self, timeout: Duration) -> WaitOutcome {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(runtime)) => WaitOutcome::Registered(runtime),
            Ok(Err(_)) => WaitOutcome::Closed,
            Err(_) => WaitOutcome::TimedOut,
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.waiters.remove(&self.session_id);
    }
}

/// Socket path of a `unix://` contact URL
pub fn parse_contact_url(url: &str) -> Result<PathBuf> {
    url.strip_prefix(CONTACT_SCHEME)
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| Error::configuration(format!("unsupported contact URL '{url}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    fn settings(dir: &TempDir) -> WorkerSettings {
        WorkerSettings {
            socket_dir: Some(dir.path().to_path_buf()),
            handshake_timeout: Duration::from_secs(1),
            ..WorkerSettings::default()
        }
    }

    async fn register(hub: &RegistrationHub, deployment_id: u32) -> UnixStream {
        let path = parse_contact_url(&hub.contact_url()).unwrap();
        let mut stream = UnixStream::connect(path).await.unwrap();
        let note = JsonRpcNotification::new(
            methods::REGISTERED,
            RegisteredParams {
                deployment_id,
                pid: 42,
                node_count: 1,
            },
        );
        let line = format!("{}\n", serde_json::to_string(&note).unwrap());
        stream.write_all(line.as_bytes()).await.unwrap();
        stream
    }

    #[tokio::test]
    async fn delivers_matching_registration() {
        let dir = TempDir::new().unwrap();
        let hub = RegistrationHub::bind(&settings(&dir)).await.unwrap();
        let session = hub.fresh_session_id();
        let mut registration = hub.subscribe(session).unwrap();

        let _stream = register(&hub, session).await;
        match registration.wait(Duration::from_secs(2)).await {
            WaitOutcome::Registered(runtime) => {
                assert_eq!(runtime.info.deployment_id, session);
                assert_eq!(runtime.info.pid, 42);
            }
            _ => panic!("expected registration"),
        }
    }

    #[tokio::test]
    async fn ignores_other_sessions() {
        let dir = TempDir::new().unwrap();
        let hub = RegistrationHub::bind(&settings(&dir)).await.unwrap();
        let mut registration = hub.subscribe(7).unwrap();

        let _stream = register(&hub, 8).await;
        assert!(matches!(
            registration.wait(Duration::from_millis(200)).await,
            WaitOutcome::TimedOut
        ));
    }

    #[tokio::test]
    async fn subscriptions_are_exclusive_and_scoped() {
        let dir = TempDir::new().unwrap();
        let hub = RegistrationHub::bind(&settings(&dir)).await.unwrap();
        let registration = hub.subscribe(3).unwrap();
        assert!(hub.subscribe(3).is_err());
        drop(registration);
        assert!(hub.subscribe(3).is_ok());
    }

    #[tokio::test]
    async fn socket_is_removed_with_hub() {
        let dir = TempDir::new().unwrap();
        let hub = RegistrationHub::bind(&settings(&dir)).await.unwrap();
        let path = hub.socket_path().to_path_buf();
        assert!(path.exists());
        drop(hub);
        assert!(!path.exists());
    }

    #[test]
    fn contact_url_round_trip() {
        assert_eq!(
            parse_contact_url("unix:///tmp/x.sock").unwrap(),
            PathBuf::from("/tmp/x.sock")
        );
        assert!(parse_contact_url("tcp://host:1").is_err());
        assert!(parse_contact_url("unix://").is_err());
    }
}
