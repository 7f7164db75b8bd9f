//! Connection lifecycle and the identity handshake.
//!
//! Both sides send a [`Message::Hello`] carrying their descriptor and a random
//! nonce, then a [`Message::Proof`] signing the other side's nonce together
//! with their own ID. A connection is admitted only after the remote's proof
//! verifies against the key its claimed ID encodes.

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::NetworkError;
use crate::identity::{self, Identity, PeerInfo};
use crate::network::message::{read_frame, write_frame, Message};
use crate::network::{NetworkResult, PROTOCOL_VERSION};

const HANDSHAKE_DOMAIN: &[u8] = b"degdb-handshake";

/// Per-attempt connection state.
///
/// `Idle → Dialing → Handshaking → Established → Closed`; an accepted
/// connection starts at `Handshaking`. Any state may move to `Closed`, and
/// nothing leaves `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Dialing,
    Handshaking,
    Established,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Dialing)
                | (Idle, Handshaking)
                | (Dialing, Handshaking)
                | (Handshaking, Established)
                | (Idle | Dialing | Handshaking | Established, Closed)
        )
    }

    /// Move to `next` if allowed; returns whether the state changed.
    pub fn advance(&mut self, next: ConnectionState) -> bool {
        if self.can_transition_to(next) {
            *self = next;
            true
        } else {
            false
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Dialing => "dialing",
            Self::Handshaking => "handshaking",
            Self::Established => "established",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// What the remote told us during a successful handshake.
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    pub remote: PeerInfo,
    pub known_peers: Vec<PeerInfo>,
}

/// Inputs for one handshake.
pub struct Handshake<'a> {
    pub identity: &'a Identity,
    pub local: &'a PeerInfo,
    pub known_peers: Vec<PeerInfo>,
    /// The ID we meant to reach, when dialing a known peer.
    pub expected: Option<&'a str>,
    pub max_frame_bytes: usize,
    /// Remote address, for error messages.
    pub addr: String,
}

impl Handshake<'_> {
    /// Run the exchange over `stream`. The caller bounds it with a timeout.
    pub async fn run<S>(self, stream: &mut S) -> NetworkResult<HandshakeOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);

        write_frame(
            stream,
            &Message::Hello {
                version: PROTOCOL_VERSION,
                peer: self.local.clone(),
                nonce,
                known_peers: self.known_peers.clone(),
            },
        )
        .await?;

        let (remote, remote_nonce, known_peers) = match read_frame(stream, self.max_frame_bytes).await? {
            Message::Hello {
                version,
                peer,
                nonce,
                known_peers,
            } => {
                if version != PROTOCOL_VERSION {
                    return Err(NetworkError::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: version,
                    });
                }
                (peer, nonce, known_peers)
            }
            other => return Err(self.reject(format!("expected hello, got {}", other.kind()))),
        };

        if remote.id == self.local.id {
            return Err(self.reject("remote claims our own identity".into()));
        }
        if let Some(expected) = self.expected {
            if remote.id != expected {
                return Err(self.reject(format!("expected peer {expected}, found {}", remote.id)));
            }
        }
        let remote_key = remote
            .public_key()
            .map_err(|e| self.reject(e.to_string()))?;

        let signature = self
            .identity
            .sign(&proof_payload(&remote_nonce, &self.local.id));
        write_frame(
            stream,
            &Message::Proof {
                signature: signature.to_bytes().to_vec(),
            },
        )
        .await?;

        let proof = match read_frame(stream, self.max_frame_bytes).await? {
            Message::Proof { signature } => signature,
            other => return Err(self.reject(format!("expected proof, got {}", other.kind()))),
        };
        let proof = ed25519_dalek::Signature::from_slice(&proof)
            .map_err(|_| self.reject("malformed proof signature".into()))?;
        if !identity::verify(&proof_payload(&nonce, &remote.id), &proof, &remote_key) {
            return Err(self.reject("identity proof does not verify".into()));
        }

        Ok(HandshakeOutcome {
            remote,
            known_peers,
        })
    }

    fn reject(&self, reason: String) -> NetworkError {
        NetworkError::HandshakeRejected {
            addr: self.addr.clone(),
            reason,
        }
    }
}

fn proof_payload(nonce: &[u8; 32], signer_id: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(HANDSHAKE_DOMAIN.len() + 32 + signer_id.len());
    payload.extend_from_slice(HANDSHAKE_DOMAIN);
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(signer_id.as_bytes());
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake<'a>(identity: &'a Identity, local: &'a PeerInfo, expected: Option<&'a str>) -> Handshake<'a> {
        Handshake {
            identity,
            local,
            known_peers: Vec::new(),
            expected,
            max_frame_bytes: 1 << 16,
            addr: "test".into(),
        }
    }

    #[test]
    fn state_machine_transitions() {
        use ConnectionState::*;
        let mut state = Idle;
        assert!(state.advance(Dialing));
        assert!(state.advance(Handshaking));
        assert!(!state.advance(Dialing));
        assert!(state.advance(Established));
        assert!(state.advance(Closed));
        assert!(!state.advance(Established));
        assert_eq!(state, Closed);
        assert!(Handshaking.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Closed));
    }

    /// Run both sides concurrently; each stream is dropped as soon as its
    /// side finishes so a rejecting side never leaves the other blocked.
    async fn exchange(
        left: Handshake<'_>,
        right: Handshake<'_>,
    ) -> (NetworkResult<HandshakeOutcome>, NetworkResult<HandshakeOutcome>) {
        let (sl, sr) = tokio::io::duplex(1 << 16);
        tokio::join!(
            async move {
                let mut s = sl;
                left.run(&mut s).await
            },
            async move {
                let mut s = sr;
                right.run(&mut s).await
            },
        )
    }

    #[tokio::test]
    async fn mutual_handshake_succeeds() {
        let a = Identity::generate();
        let b = Identity::generate();
        let a_info = a.local_peer("127.0.0.1", 1, 0);
        let b_info = b.local_peer("127.0.0.1", 2, 0);

        let (ra, rb) = exchange(
            handshake(&a, &a_info, Some(b.id())),
            handshake(&b, &b_info, None),
        )
        .await;
        assert_eq!(ra.unwrap().remote, b_info);
        assert_eq!(rb.unwrap().remote, a_info);
    }

    #[tokio::test]
    async fn unexpected_identity_is_rejected() {
        let a = Identity::generate();
        let b = Identity::generate();
        let other = Identity::generate();
        let a_info = a.local_peer("127.0.0.1", 1, 0);
        let b_info = b.local_peer("127.0.0.1", 2, 0);

        let (ra, rb) = exchange(
            handshake(&a, &a_info, Some(other.id())),
            handshake(&b, &b_info, None),
        )
        .await;
        assert!(matches!(ra, Err(NetworkError::HandshakeRejected { .. })));
        assert!(rb.is_err());
    }

    #[tokio::test]
    async fn impersonation_fails_proof() {
        // `b` claims `a`'s descriptor but can only sign with its own key.
        let a = Identity::generate();
        let b = Identity::generate();
        let c = Identity::generate();
        let forged = a.local_peer("127.0.0.1", 2, 0);
        let c_info = c.local_peer("127.0.0.1", 3, 0);

        let (_, rc) = exchange(handshake(&b, &forged, None), handshake(&c, &c_info, None)).await;
        assert!(matches!(rc, Err(NetworkError::HandshakeRejected { .. })));
    }

    #[tokio::test]
    async fn version_mismatch_is_reported() {
        let a = Identity::generate();
        let a_info = a.local_peer("127.0.0.1", 1, 0);
        let (sl, mut sr) = tokio::io::duplex(1 << 16);

        let (ra, _) = tokio::join!(
            async move {
                let mut s = sl;
                handshake(&a, &a_info, None).run(&mut s).await
            },
            async {
                let b = Identity::generate();
                write_frame(
                    &mut sr,
                    &Message::Hello {
                        version: PROTOCOL_VERSION + 1,
                        peer: b.local_peer("127.0.0.1", 2, 0),
                        nonce: [0; 32],
                        known_peers: Vec::new(),
                    },
                )
                .await
            },
        );
        assert!(matches!(ra, Err(NetworkError::VersionMismatch { .. })));
    }
}
