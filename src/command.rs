//! Remote command execution
//!
//! A started command returns immediately; a background task owns the session
//! channel, pumps stdio, and resolves the exit status once, after the remote
//! process terminates.

use russh::client::Msg;
use russh::{Channel, ChannelMsg, Pty};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fixed terminal mode set for the command pty: local echo off, 14.4k baud
/// input and output rates. Some remote shells refuse to run non-interactive
/// commands without these.
pub(crate) const TERMINAL_MODES: &[(Pty, u32)] = &[
    (Pty::ECHO, 0),
    (Pty::TTY_OP_ISPEED, 14400),
    (Pty::TTY_OP_OSPEED, 14400),
];

/// Caller-supplied descriptor for one remote command invocation.
///
/// The command text is passed to the remote shell as-is; no escaping is
/// applied.
pub struct RemoteCommand {
    /// Command text to execute remotely.
    pub command: String,
    /// Optional stream piped into the remote stdin. EOF is sent to the
    /// remote side once it drains.
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    /// Receives the remote stdout.
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    /// Receives the remote stderr.
    pub stderr: Box<dyn AsyncWrite + Send + Unpin>,
}

impl RemoteCommand {
    pub fn new(
        command: impl Into<String>,
        stdout: impl AsyncWrite + Send + Unpin + 'static,
        stderr: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            command: command.into(),
            stdin: None,
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        }
    }

    pub fn stdin(mut self, stdin: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = Some(Box::new(stdin));
        self
    }
}

/// How the remote process ended, as observed on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommandOutcome {
    /// The remote side reported an exit status.
    Exited(u32),
    /// The channel ended without a usable status (killed by a signal,
    /// transport loss).
    Aborted,
}

impl CommandOutcome {
    /// Exit code delivered to the caller. An abnormal end maps to 0 because
    /// no better signal exists for it.
    pub(crate) fn exit_code(self) -> u32 {
        match self {
            CommandOutcome::Exited(code) => code,
            CommandOutcome::Aborted => 0,
        }
    }
}

/// Completion handle for a started command. The background task resolves it
/// exactly once, after the remote process terminates.
pub struct ExitStatus {
    rx: oneshot::Receiver<u32>,
}

impl ExitStatus {
    /// Wait for the remote process to terminate and return its exit code.
    pub async fn wait(self) -> u32 {
        // The sender is dropped only if the pump task dies before resolving;
        // there is no status to report in that case.
        self.rx.await.unwrap_or(0)
    }
}

/// Spawn the background task that owns the channel for a started command.
pub(crate) fn spawn_command_task(channel: Channel<Msg>, cmd: RemoteCommand) -> ExitStatus {
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let id = Uuid::new_v4();
        let command = cmd.command.clone();
        debug!("command task {} started: {}", id, command);

        let outcome = pump(channel, cmd).await;

        info!(
            "remote command exited with '{}': {} ({})",
            outcome.exit_code(),
            command,
            id
        );
        let _ = tx.send(outcome.exit_code());
    });

    ExitStatus { rx }
}

/// Pump stdio between the caller's streams and the channel until the remote
/// process terminates. Closes the channel on every path.
async fn pump(mut channel: Channel<Msg>, cmd: RemoteCommand) -> CommandOutcome {
    let RemoteCommand {
        mut stdin,
        mut stdout,
        mut stderr,
        ..
    } = cmd;

    let mut outcome = CommandOutcome::Aborted;
    let mut buf = [0u8; 8192];
    let mut stdin_open = stdin.is_some();

    loop {
        tokio::select! {
            read = async {
                match stdin.as_mut() {
                    Some(reader) => tokio::io::AsyncReadExt::read(reader, &mut buf).await,
                    None => std::future::pending().await,
                }
            }, if stdin_open => {
                match read {
                    Ok(0) => {
                        stdin_open = false;
                        stdin = None;
                        let _ = channel.eof().await;
                    }
                    Ok(n) => {
                        if let Err(e) = channel.data(&buf[..n]).await {
                            warn!("failed to send stdin to remote command: {}", e);
                            stdin_open = false;
                            stdin = None;
                        }
                    }
                    Err(e) => {
                        warn!("local stdin read failed: {}", e);
                        stdin_open = false;
                        stdin = None;
                        let _ = channel.eof().await;
                    }
                }
            }

            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if let Err(e) = stdout.write_all(&data).await {
                            warn!("failed to write remote stdout: {}", e);
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        if ext == 1 {
                            if let Err(e) = stderr.write_all(&data).await {
                                warn!("failed to write remote stderr: {}", e);
                            }
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        outcome = CommandOutcome::Exited(exit_status);
                    }
                    Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                        debug!("remote command killed by signal {:?}", signal_name);
                    }
                    Some(ChannelMsg::Eof) => {
                        // The status message can trail the output EOF.
                    }
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
        }
    }

    let _ = stdout.flush().await;
    let _ = stderr.flush().await;
    let _ = channel.close().await;

    outcome
}
