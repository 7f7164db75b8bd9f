//! Rich diagnostic error types for a degdb node.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains. Only [`KeyError`] and
//! [`StoreError`] are fatal; triple and network errors are contained by the
//! replication layer and reported per peer.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for a degdb node.
#[derive(Debug, Error, Diagnostic)]
pub enum DegError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Triple(#[from] TripleError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Identity / key errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum KeyError {
    #[error("failed to access key file {path}")]
    #[diagnostic(
        code(degdb::key::io),
        help(
            "The node key file could not be read or written. Check that the \
             directory exists and that the process owns the file."
        )
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("key file {path} is corrupt: {message}")]
    #[diagnostic(
        code(degdb::key::corrupt),
        help(
            "The key file does not contain a valid ed25519 secret key. \
             Restore it from a backup; deleting it gives this node a new identity."
        )
    )]
    Corrupt { path: String, message: String },
}

// ---------------------------------------------------------------------------
// Triple errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum TripleError {
    #[error("signature does not verify for triple {id}")]
    #[diagnostic(
        code(degdb::triple::signature_invalid),
        help("The triple was altered after signing or signed by a different key. It is dropped.")
    )]
    SignatureInvalid { id: String },

    #[error("malformed signer id: {signer}")]
    #[diagnostic(
        code(degdb::triple::malformed_signer),
        help("A signer id is the 64-character hex encoding of an ed25519 public key.")
    )]
    MalformedSigner { signer: String },
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("I/O error: {source}")]
    #[diagnostic(
        code(degdb::store::io),
        help(
            "A filesystem operation failed. Check that the database directory exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("redb transaction error: {message}")]
    #[diagnostic(
        code(degdb::store::redb),
        help(
            "The embedded database encountered a transaction error. \
             This may indicate corruption or a full disk."
        )
    )]
    Redb { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(degdb::store::serde),
        help(
            "Failed to serialize or deserialize a stored triple. \
             The database file may have been written by an incompatible version."
        )
    )]
    Serialization { message: String },

    #[error("store task failed: {message}")]
    #[diagnostic(
        code(degdb::store::task),
        help("A blocking store operation panicked or was cancelled before it finished.")
    )]
    Task { message: String },
}

// ---------------------------------------------------------------------------
// Network errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum NetworkError {
    #[error("no established connection to peer {peer}")]
    #[diagnostic(
        code(degdb::net::not_connected),
        help("Dial the peer first, or drop the message.")
    )]
    NotConnected { peer: String },

    #[error("failed to dial {addr}: {message}")]
    #[diagnostic(
        code(degdb::net::dial_failure),
        help("The peer is unreachable. The caller retries with exponential backoff.")
    )]
    DialFailure { addr: String, message: String },

    #[error("handshake with {addr} timed out")]
    #[diagnostic(
        code(degdb::net::handshake_timeout),
        help("The remote did not complete the identity exchange in time.")
    )]
    HandshakeTimeout { addr: String },

    #[error("handshake with {addr} rejected: {reason}")]
    #[diagnostic(
        code(degdb::net::handshake_rejected),
        help("The remote's identity proof did not verify or did not match the expected peer.")
    )]
    HandshakeRejected { addr: String, reason: String },

    #[error("protocol version mismatch: local {local}, remote {remote}")]
    #[diagnostic(
        code(degdb::net::version_mismatch),
        help("Both nodes must run the same wire protocol version.")
    )]
    VersionMismatch { local: u32, remote: u32 },

    #[error("frame of {len} bytes exceeds limit of {max}")]
    #[diagnostic(
        code(degdb::net::frame_too_large),
        help("Raise `max_frame_bytes` on the receiving node or send smaller batches.")
    )]
    FrameTooLarge { len: usize, max: usize },

    #[error("outbound queue for peer {peer} is full")]
    #[diagnostic(
        code(degdb::net::backpressure),
        help("The peer is not draining messages. The message is dropped for this peer only.")
    )]
    Backpressure { peer: String },

    #[error("codec error: {message}")]
    #[diagnostic(code(degdb::net::codec), help("The remote sent a frame that does not decode."))]
    Codec { message: String },

    #[error("I/O error: {source}")]
    #[diagnostic(code(degdb::net::io), help("The connection failed at the socket level."))]
    Io {
        #[source]
        source: std::io::Error,
    },
}

impl From<std::io::Error> for NetworkError {
    fn from(source: std::io::Error) -> Self {
        NetworkError::Io { source }
    }
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read node config: {path}")]
    #[diagnostic(
        code(degdb::config::read),
        help("Ensure the config file exists and is valid TOML.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse node config: {path}: {message}")]
    #[diagnostic(
        code(degdb::config::parse),
        help("Check the TOML syntax and field names in the node config file.")
    )]
    Parse { path: String, message: String },

    #[error("failed to write node config: {path}")]
    #[diagnostic(
        code(degdb::config::write),
        help("Ensure you have write permissions to the config directory.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid seed address: {addr}")]
    #[diagnostic(
        code(degdb::config::seed),
        help("Seeds are given as host:port, e.g. `127.0.0.1:7400`.")
    )]
    InvalidSeed { addr: String },
}

/// Convenience alias for functions returning degdb results.
pub type DegResult<T> = std::result::Result<T, DegError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_converts_to_deg_error() {
        let err = StoreError::Redb {
            message: "commit failed".into(),
        };
        let deg: DegError = err.into();
        assert!(matches!(deg, DegError::Store(StoreError::Redb { .. })));
    }

    #[test]
    fn io_error_converts_to_network_error() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let net: NetworkError = io.into();
        assert!(matches!(net, NetworkError::Io { .. }));
    }

    #[test]
    fn error_display_messages_are_descriptive() {
        let err = NetworkError::VersionMismatch {
            local: 1,
            remote: 7,
        };
        let msg = format!("{err}");
        assert!(msg.contains('1'));
        assert!(msg.contains('7'));

        let err = NetworkError::NotConnected {
            peer: "abcd".into(),
        };
        assert!(format!("{err}").contains("abcd"));
    }
}
