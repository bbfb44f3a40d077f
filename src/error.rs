//! Communicator error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommError {
    /// The connection factory could not produce a transport.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The SSH handshake or authentication failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("key error: {0}")]
    Key(String),

    /// A session was requested while no client is present.
    #[error("client not available")]
    ClientUnavailable,

    /// Opening a session channel failed, surviving one reconnect retry.
    #[error("session open failed: {0}")]
    SessionOpen(String),

    /// The remote sink rejected a transfer step. Carries the message line
    /// supplied by the remote side, verbatim.
    #[error("{0}")]
    Protocol(String),

    /// The remote sink program exited 127, meaning it could not be started.
    #[error(
        "SCP failed to start. This usually means that SCP is not \
         properly installed on the remote system."
    )]
    SinkUnavailable,

    /// The remote sink process exited with a non-zero status.
    #[error("remote sink process exited with status {0}")]
    RemoteExit(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not implemented: {0}")]
    Unimplemented(&'static str),
}

impl From<russh::Error> for CommError {
    fn from(err: russh::Error) -> Self {
        CommError::Handshake(err.to_string())
    }
}
