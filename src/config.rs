//! Communicator configuration
//!
//! A [`Config`] pairs a connection factory (how to reach the remote host)
//! with the SSH client parameters used for the handshake. The factory is
//! invoked again on every reconnect, so it must produce a fresh transport
//! each time.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Raw byte-stream transport the SSH handshake runs over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

/// Produces a new transport connection, once per (re)connect attempt.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> io::Result<Box<dyn Transport>>;
}

/// Connects a plain TCP stream to a fixed address, with a per-attempt
/// timeout.
pub struct TcpConnectionFactory {
    /// Target address in `host:port` form.
    pub addr: String,
    /// Timeout for a single connect attempt in seconds.
    pub connect_timeout_secs: u64,
}

impl TcpConnectionFactory {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout_secs: 30,
        }
    }
}

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    async fn connect(&self) -> io::Result<Box<dyn Transport>> {
        let stream = tokio::time::timeout(
            Duration::from_secs(self.connect_timeout_secs),
            TcpStream::connect(&self.addr),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Authentication methods supported
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// SSH key authentication
    Key {
        /// Path to private key file
        key_path: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            passphrase,
        }
    }
}

/// Host key verification policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Accept whatever key the server presents. The fingerprint is logged.
    AcceptAny,

    /// Require the server key's SHA256 fingerprint to match exactly
    /// (OpenSSH `SHA256:<base64>` form).
    Sha256Fingerprint { fingerprint: String },
}

/// Communicator configuration. Immutable after construction.
#[derive(Clone)]
pub struct Config {
    /// Produces a fresh transport for each connect attempt.
    pub connection: Arc<dyn ConnectionFactory>,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Host key verification policy
    pub host_key: HostKeyPolicy,

    /// Handshake timeout in seconds
    pub handshake_timeout_secs: u64,
}

impl Config {
    pub fn new(
        connection: Arc<dyn ConnectionFactory>,
        username: impl Into<String>,
        auth: AuthMethod,
    ) -> Self {
        Self {
            connection,
            username: username.into(),
            auth,
            host_key: HostKeyPolicy::AcceptAny,
            handshake_timeout_secs: 30,
        }
    }
}
