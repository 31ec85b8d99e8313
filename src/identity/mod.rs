use crate::crypto::{self, CryptoError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Identity persistence errors
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("failed to persist identity to {path}: {source}")]
    Persist {
        path: String,
        source: std::io::Error,
    },
}

/// On-disk identity file: both keys hex encoded, private key as PKCS#8.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityFile {
    private_key: String,
    public_key: String,
}

/// The device's long-lived signing keypair.
///
/// Immutable once loaded; the device id and every beacon signature derive from
/// it, so regenerating it gives the device a brand-new identity on the network.
pub struct Identity {
    pkcs8: Vec<u8>,
    public_key: Vec<u8>,
}

impl Identity {
    /// Load the identity from `path`, or generate and persist a fresh one.
    ///
    /// An unreadable or corrupt file is treated as absent. Failing to persist a
    /// freshly generated keypair is fatal: a device must not announce an
    /// identity it cannot present again after restart.
    pub fn load_or_generate(path: &Path) -> Result<Self, IdentityError> {
        if let Some(identity) = Self::try_load(path) {
            info!("loaded identity from {}", path.display());
            return Ok(identity);
        }

        let (pkcs8, public_key) = crypto::generate_signing_keypair()?;
        let identity = Self { pkcs8, public_key };
        identity.persist(path)?;
        info!("generated new identity at {}", path.display());
        Ok(identity)
    }

    fn try_load(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        let file: IdentityFile = match serde_json::from_str(&content) {
            Ok(file) => file,
            Err(e) => {
                warn!("identity file {} is corrupt ({}); regenerating", path.display(), e);
                return None;
            }
        };
        let pkcs8 = hex::decode(&file.private_key).ok()?;
        let public_key = hex::decode(&file.public_key).ok()?;
        // The stored public key must be the one the private key produces.
        match crypto::derive_public_key(&pkcs8) {
            Ok(derived) if derived == public_key => Some(Self { pkcs8, public_key }),
            _ => {
                warn!("identity file {} has mismatched keys; regenerating", path.display());
                None
            }
        }
    }

    /// Write the identity as JSON, via a sibling temp file and an atomic rename.
    fn persist(&self, path: &Path) -> Result<(), IdentityError> {
        let file = IdentityFile {
            private_key: hex::encode(&self.pkcs8),
            public_key: hex::encode(&self.public_key),
        };
        let persist_err = |source: std::io::Error| IdentityError::Persist {
            path: path.display().to_string(),
            source,
        };

        let content = serde_json::to_string_pretty(&file).map_err(|e| {
            persist_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(persist_err)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(persist_err)?;
        std::fs::rename(&tmp, path).map_err(persist_err)?;
        Ok(())
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(&self.public_key)
    }

    /// Sign `message` with the device's private key.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        crypto::sign_message(message, &self.pkcs8)
    }
}
