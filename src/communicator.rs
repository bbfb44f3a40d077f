//! The communicator: connection lifecycle, session acquisition, and the
//! execution and transfer entry points.
//!
//! One authenticated client is held at a time, behind a mutex. Reconnection
//! and session opening serialize on that mutex; data transfer on sessions
//! that are already open proceeds in parallel.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle, Msg};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::{Channel, Disconnect};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::command::{self, ExitStatus, RemoteCommand, TERMINAL_MODES};
use crate::config::{AuthMethod, Config};
use crate::error::CommError;
use crate::handler::ClientHandler;
use crate::scp::{self, SinkExit, SinkStream, UploadEntry};

/// Remote-execution and file-transfer communicator over SSH.
///
/// Created with an initial connection attempt; reconnects in place when a
/// session open fails. Each operation runs on its own session channel.
pub struct Communicator {
    config: Config,
    /// The authenticated client. The handle owns the underlying transport,
    /// so connection and client are set and cleared as one value; there is
    /// never a half-initialized pair.
    state: Mutex<Option<Handle<ClientHandler>>>,
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator").finish_non_exhaustive()
    }
}

impl Communicator {
    /// Create a communicator and establish the initial connection.
    pub async fn new(config: Config) -> Result<Self, CommError> {
        let comm = Self {
            config,
            state: Mutex::new(None),
        };
        {
            let mut state = comm.state.lock().await;
            comm.reconnect(&mut state).await?;
        }
        Ok(comm)
    }

    /// Run a remote command with a pty, returning as soon as the process is
    /// started. The returned [`ExitStatus`] resolves once the process
    /// terminates; pty or start failures propagate here and no background
    /// task is spawned.
    pub async fn start(&self, cmd: RemoteCommand) -> Result<ExitStatus, CommError> {
        let mut channel = self.new_session().await?;

        channel
            .request_pty(false, "xterm", 80, 40, 0, 0, TERMINAL_MODES)
            .await
            .map_err(|e| CommError::SessionOpen(format!("pty request failed: {e}")))?;

        info!("starting remote command: {}", cmd.command);
        channel
            .exec(true, format!("{}\n", cmd.command))
            .await
            .map_err(|e| CommError::SessionOpen(format!("exec request failed: {e}")))?;

        Ok(command::spawn_command_task(channel, cmd))
    }

    /// Upload `content` to the remote `path` over a single-file sink
    /// session.
    ///
    /// The content is buffered in memory to determine its length before any
    /// protocol bytes are sent, so the largest uploadable file is bounded by
    /// available memory.
    pub async fn upload(
        &self,
        path: &str,
        content: impl AsyncRead + Unpin,
    ) -> Result<(), CommError> {
        let (dir, file) = split_target(path)?;

        let (mut stream, exit_rx) = self.start_sink(&format!("scp -vt {dir}")).await?;
        let result = scp::upload_file(&mut stream, &file, content).await;
        self.finish_sink(stream, exit_rx, result).await
    }

    /// Upload the immediate regular files of `src` into the remote `dst`
    /// directory.
    ///
    /// Subdirectories are not descended into; use
    /// [`Communicator::upload_entries`] for a recursive tree upload.
    /// `excludes` is accepted for interface compatibility but not yet
    /// applied.
    pub async fn upload_dir(
        &self,
        dst: &str,
        src: &Path,
        excludes: &[String],
    ) -> Result<(), CommError> {
        if !excludes.is_empty() {
            debug!("exclude patterns are not applied yet: {:?}", excludes);
        }

        let (mut stream, exit_rx) = self
            .start_sink(&format!("scp -rvt {}", to_slash(dst)))
            .await?;
        let result = scp::upload_flat(&mut stream, src).await;
        self.finish_sink(stream, exit_rx, result).await
    }

    /// Upload a prepared entry tree into the remote `dst` directory,
    /// descending into directories with begin/end framing so nested paths
    /// are preserved. Build the tree with [`UploadEntry::from_dir`].
    pub async fn upload_entries(
        &self,
        dst: &str,
        entries: &[UploadEntry],
    ) -> Result<(), CommError> {
        let (mut stream, exit_rx) = self
            .start_sink(&format!("scp -rvt {}", to_slash(dst)))
            .await?;
        let result = scp::upload_entries(&mut stream, entries).await;
        self.finish_sink(stream, exit_rx, result).await
    }

    /// Reserved mirror of [`Communicator::upload`]; not implemented and
    /// always fails.
    pub async fn download(
        &self,
        _path: &str,
        _output: impl AsyncWrite + Unpin,
    ) -> Result<(), CommError> {
        Err(CommError::Unimplemented("download"))
    }

    /// Open a fresh session channel, reconnecting exactly once if the first
    /// attempt fails. If the reconnect itself fails, its error is the
    /// result; otherwise the single retried open decides.
    pub(crate) async fn new_session(&self) -> Result<Channel<Msg>, CommError> {
        let mut state = self.state.lock().await;
        debug!("opening new ssh session");
        open_with_retry(&mut ClientSource {
            comm: self,
            state: &mut *state,
        })
        .await
    }

    /// Drop any existing client and establish a fresh transport connection
    /// and handshake. On failure the communicator is left with no client.
    async fn reconnect(&self, state: &mut Option<Handle<ClientHandler>>) -> Result<(), CommError> {
        if let Some(old) = state.take() {
            let _ = old
                .disconnect(Disconnect::ByApplication, "reconnecting", "en")
                .await;
        }

        info!("reconnecting transport for SSH");
        let stream = self
            .config
            .connection
            .connect()
            .await
            .map_err(|e| CommError::Connection(e.to_string()))?;

        info!("handshaking with SSH");
        let client_config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        });
        let handler = ClientHandler::new(self.config.host_key.clone());

        let mut handle = tokio::time::timeout(
            Duration::from_secs(self.config.handshake_timeout_secs),
            client::connect_stream(client_config, stream, handler),
        )
        .await
        .map_err(|_| CommError::Handshake("handshake timed out".to_string()))??;

        let authenticated = match &self.config.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(&self.config.username, password)
                .await
                .map_err(|e| CommError::Handshake(e.to_string()))?,
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                    .map_err(|e| CommError::Key(e.to_string()))?;
                let key = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                handle
                    .authenticate_publickey(&self.config.username, key)
                    .await
                    .map_err(|e| CommError::Handshake(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(CommError::Handshake(
                "authentication rejected by server".to_string(),
            ));
        }

        debug!("SSH handshake and authentication complete");
        *state = Some(handle);
        Ok(())
    }

    /// Open a session running the given remote sink command and hand back
    /// the byte-level stream plus the exit report receiver.
    async fn start_sink(
        &self,
        sink_command: &str,
    ) -> Result<(SinkStream, oneshot::Receiver<SinkExit>), CommError> {
        let mut channel = self.new_session().await?;

        info!("starting remote scp process: {}", sink_command);
        channel
            .exec(true, sink_command)
            .await
            .map_err(|e| CommError::SessionOpen(format!("exec request failed: {e}")))?;

        Ok(scp::spawn_sink_pump(channel))
    }

    /// Close the input side exactly once, then fold the driver result and
    /// the sink process exit status into the transfer result.
    async fn finish_sink(
        &self,
        mut stream: SinkStream,
        exit_rx: oneshot::Receiver<SinkExit>,
        result: Result<(), CommError>,
    ) -> Result<(), CommError> {
        debug!("transfer exchange done, closing sink input");
        stream.close_input().await;
        result?;

        debug!("waiting for remote sink process to exit");
        let exit = exit_rx.await.map_err(|_| {
            CommError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "sink session ended without reporting",
            ))
        })?;

        if !exit.stderr.is_empty() {
            debug!(
                "scp stderr (length {}): {}",
                exit.stderr.len(),
                String::from_utf8_lossy(&exit.stderr)
            );
        }
        scp::sink_exit_result(exit.status)
    }
}

/// Where session channels come from: an open attempt against the current
/// client, and a reconnect that replaces it.
trait SessionSource {
    type Session;

    async fn open(&mut self) -> Result<Self::Session, CommError>;
    async fn reconnect(&mut self) -> Result<(), CommError>;
}

/// The bounded open sequence: one attempt, and on failure exactly one
/// reconnect followed by exactly one more attempt whose result is final.
/// A failed reconnect short-circuits with its own error.
async fn open_with_retry<S: SessionSource>(source: &mut S) -> Result<S::Session, CommError> {
    match source.open().await {
        Ok(session) => Ok(session),
        Err(err) => {
            warn!("ssh session open error: '{}', attempting reconnect", err);
            source.reconnect().await?;
            source.open().await
        }
    }
}

/// Session source backed by the communicator's locked client slot.
struct ClientSource<'a> {
    comm: &'a Communicator,
    state: &'a mut Option<Handle<ClientHandler>>,
}

impl SessionSource for ClientSource<'_> {
    type Session = Channel<Msg>;

    async fn open(&mut self) -> Result<Channel<Msg>, CommError> {
        match self.state.as_ref() {
            None => Err(CommError::ClientUnavailable),
            Some(handle) => handle
                .channel_open_session()
                .await
                .map_err(|e| CommError::SessionOpen(e.to_string())),
        }
    }

    async fn reconnect(&mut self) -> Result<(), CommError> {
        self.comm.reconnect(self.state).await
    }
}

/// Split an upload target into its directory and base name, normalizing the
/// directory to forward slashes. The remote shell expects forward slashes
/// whatever the local platform uses.
fn split_target(path: &str) -> Result<(String, String), CommError> {
    let target = Path::new(path);
    let file = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            CommError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("upload path has no file name: {path}"),
            ))
        })?;
    let dir = target
        .parent()
        .map(|d| d.to_string_lossy().into_owned())
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| ".".to_string());
    Ok((to_slash(&dir), file))
}

fn to_slash(path: &str) -> String {
    path.replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionFactory, HostKeyPolicy, Transport};
    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingFactory {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionFactory for FailingFactory {
        async fn connect(&self) -> io::Result<Box<dyn Transport>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "target unreachable",
            ))
        }
    }

    fn failing_config(factory: Arc<FailingFactory>) -> Config {
        Config {
            connection: factory,
            username: "user".to_string(),
            auth: AuthMethod::password("pw"),
            host_key: HostKeyPolicy::AcceptAny,
            handshake_timeout_secs: 1,
        }
    }

    #[tokio::test]
    async fn new_fails_when_factory_fails() {
        let factory = Arc::new(FailingFactory {
            calls: AtomicUsize::new(0),
        });
        let err = Communicator::new(failing_config(factory.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, CommError::Connection(_)));
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn session_open_without_client_reconnects_exactly_once() {
        let factory = Arc::new(FailingFactory {
            calls: AtomicUsize::new(0),
        });
        let comm = Communicator {
            config: failing_config(factory.clone()),
            state: Mutex::new(None),
        };

        // No client present: the factory is consulted once for the bounded
        // reconnect, and its failure is the final error. No retry loop.
        let err = comm.new_session().await.unwrap_err();
        assert!(matches!(err, CommError::Connection(_)));
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);

        // A second call starts the same bounded sequence over.
        let err = comm.new_session().await.unwrap_err();
        assert!(matches!(err, CommError::Connection(_)));
        assert_eq!(factory.calls.load(Ordering::SeqCst), 2);
    }

    /// Session source with scripted open results and a counting, always
    /// successful reconnect.
    struct ScriptedSource {
        open_results: Vec<Result<u32, CommError>>,
        opens: usize,
        reconnects: usize,
    }

    impl ScriptedSource {
        fn new(open_results: Vec<Result<u32, CommError>>) -> Self {
            Self {
                open_results,
                opens: 0,
                reconnects: 0,
            }
        }
    }

    impl SessionSource for ScriptedSource {
        type Session = u32;

        async fn open(&mut self) -> Result<u32, CommError> {
            self.opens += 1;
            self.open_results.remove(0)
        }

        async fn reconnect(&mut self) -> Result<(), CommError> {
            self.reconnects += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn retry_open_after_successful_reconnect_is_final() {
        let mut source = ScriptedSource::new(vec![
            Err(CommError::SessionOpen("channel refused".to_string())),
            Ok(7),
        ]);

        let session = open_with_retry(&mut source).await.unwrap();
        assert_eq!(session, 7);
        assert_eq!(source.reconnects, 1);
        assert_eq!(source.opens, 2);
    }

    #[tokio::test]
    async fn failed_retry_open_is_final_with_no_further_attempts() {
        let mut source = ScriptedSource::new(vec![
            Err(CommError::SessionOpen("channel refused".to_string())),
            Err(CommError::SessionOpen("still refused".to_string())),
        ]);

        let err = open_with_retry(&mut source).await.unwrap_err();
        assert!(matches!(err, CommError::SessionOpen(m) if m == "still refused"));
        assert_eq!(source.reconnects, 1);
        assert_eq!(source.opens, 2);
    }

    #[tokio::test]
    async fn first_open_success_skips_reconnect() {
        let mut source = ScriptedSource::new(vec![Ok(1)]);

        assert_eq!(open_with_retry(&mut source).await.unwrap(), 1);
        assert_eq!(source.reconnects, 0);
        assert_eq!(source.opens, 1);
    }

    #[tokio::test]
    async fn download_is_unimplemented() {
        let factory = Arc::new(FailingFactory {
            calls: AtomicUsize::new(0),
        });
        let comm = Communicator {
            config: failing_config(factory),
            state: Mutex::new(None),
        };
        let err = comm.download("/tmp/x", tokio::io::sink()).await.unwrap_err();
        assert!(matches!(err, CommError::Unimplemented(_)));
    }

    #[test]
    fn split_target_normalizes_separators() {
        let (dir, file) = split_target("C:\\temp\\file.txt").unwrap();
        // Backslash separators are normalized for the remote shell even
        // when the local platform does not treat them as separators.
        if cfg!(windows) {
            assert_eq!(dir, "C:/temp");
            assert_eq!(file, "file.txt");
        } else {
            assert_eq!(dir, ".");
            assert_eq!(file, "C:/temp/file.txt".replace('/', "\\"));
        }
    }

    #[test]
    fn split_target_unix_paths() {
        let (dir, file) = split_target("/tmp/staging/upload.bin").unwrap();
        assert_eq!(dir, "/tmp/staging");
        assert_eq!(file, "upload.bin");

        let (dir, file) = split_target("upload.bin").unwrap();
        assert_eq!(dir, ".");
        assert_eq!(file, "upload.bin");
    }

    #[test]
    fn split_target_rejects_bare_directory() {
        assert!(split_target("/tmp/..").is_err());
    }
}
