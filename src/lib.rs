//! sshcomm - remote command execution and SCP push transfers over a
//! reconnectable SSH client.
//!
//! The communicator owns one authenticated SSH client at a time, built from
//! a caller-supplied connection factory. Each operation runs on its own
//! session channel: [`Communicator::start`] runs a remote command with
//! streamed stdio and an asynchronously resolved exit status, while
//! [`Communicator::upload`] and [`Communicator::upload_dir`] push files with
//! the SCP sink protocol. A failed session open triggers exactly one
//! reconnect-and-retry before the error is surfaced.

mod command;
mod communicator;
mod handler;
mod scp;

pub mod config;
pub mod error;

pub use command::{ExitStatus, RemoteCommand};
pub use communicator::Communicator;
pub use config::{
    AuthMethod, Config, ConnectionFactory, HostKeyPolicy, TcpConnectionFactory, Transport,
};
pub use error::CommError;
pub use scp::UploadEntry;
