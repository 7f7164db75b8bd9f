//! Node identity: a persistent ed25519 keypair and the descriptor a node
//! advertises to its peers.
//!
//! A peer ID is the lowercase hex encoding of the node's 32-byte verifying
//! key, so anything signed by a node can be checked with nothing but its ID.

use std::fs;
use std::io::Write;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{KeyError, TripleError};

/// Result type for identity operations.
pub type KeyResult<T> = std::result::Result<T, KeyError>;

/// The public descriptor of a node: who it is and where to reach it.
///
/// Used both for the local node (see [`Identity::local_peer`]) and, wrapped
/// in [`crate::peers::Peer`], for remote nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Hex-encoded ed25519 public key.
    pub id: String,
    /// Host the node listens on, as advertised by the node itself.
    pub address: String,
    /// Listening port for peer connections.
    pub port: u16,
    /// Self-reported storage capacity in bytes. Not verified.
    pub disk_allocated: u64,
}

impl PeerInfo {
    /// `host:port` string suitable for dialing.
    pub fn dial_addr(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// Decode the verifying key this peer's ID stands for.
    pub fn public_key(&self) -> Result<VerifyingKey, TripleError> {
        decode_peer_id(&self.id)
    }
}

/// A node's signing identity.
pub struct Identity {
    signing_key: SigningKey,
    id: String,
}

impl Identity {
    /// Generate a fresh, unpersisted identity.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let id = peer_id(&signing_key.verifying_key());
        Self { signing_key, id }
    }

    /// Load the keypair stored at `path`, or generate one and write it there.
    ///
    /// The key file holds the hex-encoded 32-byte secret key. On unix it is
    /// created with mode `0600`. Loading the same file always yields the same ID.
    pub fn generate_or_load(path: &Path) -> KeyResult<Self> {
        let shown = path.display().to_string();
        match fs::read_to_string(path) {
            Ok(contents) => {
                let bytes = hex::decode(contents.trim()).map_err(|e| KeyError::Corrupt {
                    path: shown.clone(),
                    message: e.to_string(),
                })?;
                let secret: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| KeyError::Corrupt {
                    path: shown.clone(),
                    message: format!("expected 32 key bytes, found {}", b.len()),
                })?;
                let identity = Self::from_signing_key(SigningKey::from_bytes(&secret));
                tracing::debug!(path = %shown, id = %identity.id, "loaded node key");
                Ok(identity)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::generate();
                identity.persist(path)?;
                tracing::info!(path = %shown, id = %identity.id, "generated new node key");
                Ok(identity)
            }
            Err(source) => Err(KeyError::Io {
                path: shown,
                source,
            }),
        }
    }

    fn persist(&self, path: &Path) -> KeyResult<()> {
        let io_err = |source| KeyError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path).map_err(io_err)?;
        file.write_all(hex::encode(self.signing_key.to_bytes()).as_bytes())
            .map_err(io_err)?;
        file.sync_all().map_err(io_err)
    }

    /// This node's peer ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// This node's public key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign an arbitrary payload.
    pub fn sign(&self, payload: &[u8]) -> Signature {
        self.signing_key.sign(payload)
    }

    /// Build the descriptor this node advertises.
    pub fn local_peer(&self, address: impl Into<String>, port: u16, disk_allocated: u64) -> PeerInfo {
        PeerInfo {
            id: self.id.clone(),
            address: address.into(),
            port,
            disk_allocated,
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity").field("id", &self.id).finish()
    }
}

/// Derive the peer ID for a public key.
pub fn peer_id(key: &VerifyingKey) -> String {
    hex::encode(key.as_bytes())
}

/// Decode a peer ID back into the public key it encodes.
pub fn decode_peer_id(id: &str) -> Result<VerifyingKey, TripleError> {
    let malformed = || TripleError::MalformedSigner {
        signer: id.to_string(),
    };
    let bytes: [u8; 32] = hex::decode(id)
        .map_err(|_| malformed())?
        .try_into()
        .map_err(|_| malformed())?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| malformed())
}

/// Check `signature` over `payload` against `public_key`.
pub fn verify(payload: &[u8], signature: &Signature, public_key: &VerifyingKey) -> bool {
    public_key.verify(payload, signature).is_ok()
}

/// Check a hex-encoded signature against a peer ID. Malformed input fails.
pub fn verify_hex(payload: &[u8], signature_hex: &str, signer_id: &str) -> bool {
    let Ok(key) = decode_peer_id(signer_id) else {
        return false;
    };
    let Ok(bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&bytes) else {
        return false;
    };
    verify(payload, &signature, &key)
}
