//! russh client handler: host key verification

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::client;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::HostKeyPolicy;
use crate::error::CommError;

/// Client handler for russh callbacks. Verifies the server host key
/// against the configured policy.
pub(crate) struct ClientHandler {
    policy: HostKeyPolicy,
}

impl ClientHandler {
    pub(crate) fn new(policy: HostKeyPolicy) -> Self {
        Self { policy }
    }
}

/// Compute the SHA256 fingerprint of a public key, in the OpenSSH
/// `SHA256:<base64>` form.
pub(crate) fn fingerprint(key: &PublicKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.public_key_bytes());
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

impl client::Handler for ClientHandler {
    type Error = CommError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let actual = fingerprint(server_public_key);

        match &self.policy {
            HostKeyPolicy::AcceptAny => {
                info!("accepting server host key (fingerprint: {})", actual);
                Ok(true)
            }
            HostKeyPolicy::Sha256Fingerprint {
                fingerprint: expected,
            } => {
                if &actual == expected {
                    info!("server host key verified (fingerprint: {})", actual);
                    Ok(true)
                } else {
                    warn!(
                        "server host key mismatch: expected {}, got {}",
                        expected, actual
                    );
                    Err(CommError::Handshake(format!(
                        "host key verification failed: expected {}, got {}",
                        expected, actual
                    )))
                }
            }
        }
    }
}
