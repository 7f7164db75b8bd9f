//! Wire protocol: one closed set of message kinds sharing a connection.
//!
//! Frames are a 4-byte big-endian length followed by the bincode encoding of
//! a [`Message`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NetworkError;
use crate::identity::PeerInfo;
use crate::network::NetworkResult;
use crate::triple::{Triple, TripleId};

/// Every message a node can send to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// First handshake frame: who the sender is plus a challenge.
    Hello {
        version: u32,
        peer: PeerInfo,
        nonce: [u8; 32],
        /// Piggybacked sample of the sender's known peers.
        known_peers: Vec<PeerInfo>,
    },
    /// Second handshake frame: signature over the receiver's nonce.
    Proof { signature: Vec<u8> },
    /// Newly committed triples being gossiped.
    Insert(InsertMessage),
    /// A sample of the sender's known peers.
    Peers { peers: Vec<PeerInfo> },
    /// Triple identities the sender holds, for reconciliation. A large set
    /// spans several frames; `complete` marks the last one.
    Digest { ids: Vec<TripleId>, complete: bool },
}

impl Message {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::Proof { .. } => "proof",
            Message::Insert(_) => "insert",
            Message::Peers { .. } => "peers",
            Message::Digest { .. } => "digest",
        }
    }

    /// The digest of `ids` as frames of at most `max_frame_bytes` each.
    ///
    /// Always yields at least one frame, so an empty store still asks its
    /// peer for everything.
    pub fn digests(ids: Vec<TripleId>, max_frame_bytes: usize) -> Vec<Message> {
        let base = encoded_len(&Message::Digest {
            ids: Vec::new(),
            complete: false,
        });
        let per_id = encoded_len(&TripleId::from_bytes([0; 32])).max(1);
        let per_frame = ((max_frame_bytes as u64).saturating_sub(base) / per_id).max(1) as usize;

        if ids.is_empty() {
            return vec![Message::Digest {
                ids,
                complete: true,
            }];
        }
        let mut frames: Vec<Message> = ids
            .chunks(per_frame)
            .map(|chunk| Message::Digest {
                ids: chunk.to_vec(),
                complete: false,
            })
            .collect();
        if let Some(Message::Digest { complete, .. }) = frames.last_mut() {
            *complete = true;
        }
        frames
    }
}

/// Size of the bincode body of `value`.
fn encoded_len<T: Serialize>(value: &T) -> u64 {
    bincode::serialized_size(value).unwrap_or(u64::MAX)
}

/// Identity of a gossip payload for the seen-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; 32]);

/// A batch of triples travelling through the gossip network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertMessage {
    /// Peer ID of the node that first broadcast this batch.
    pub origin: String,
    /// Remaining relay hops. Zero means commit but do not relay.
    pub ttl: u8,
    pub triples: Vec<Triple>,
}

impl InsertMessage {
    pub fn new(origin: impl Into<String>, ttl: u8, triples: Vec<Triple>) -> Self {
        Self {
            origin: origin.into(),
            ttl,
            triples,
        }
    }

    /// Hash of the payload. The TTL is excluded so a relayed copy of the
    /// same batch is recognised at any hop.
    pub fn message_id(&self) -> MessageId {
        let mut hasher = Sha256::new();
        hasher.update(self.origin.as_bytes());
        for triple in &self.triples {
            hasher.update(triple.id().as_bytes());
        }
        MessageId(hasher.finalize().into())
    }

    /// Split into batches whose frames fit in `max_frame_bytes`.
    ///
    /// Order is kept. A triple too large for any frame is dropped with a
    /// warning, since no peer would accept it.
    pub fn split_to_fit(self, max_frame_bytes: usize) -> Vec<InsertMessage> {
        let max = max_frame_bytes as u64;
        let base = encoded_len(&Message::Insert(InsertMessage::new(
            self.origin.clone(),
            self.ttl,
            Vec::new(),
        )));

        let mut batches = Vec::new();
        let mut current = Vec::new();
        let mut size = base;
        for triple in self.triples {
            let len = encoded_len(&triple);
            if base.saturating_add(len) > max {
                tracing::warn!(id = ?triple.id(), len, max, "triple exceeds the frame limit, not sent");
                continue;
            }
            if size.saturating_add(len) > max && !current.is_empty() {
                batches.push(InsertMessage::new(
                    self.origin.clone(),
                    self.ttl,
                    std::mem::take(&mut current),
                ));
                size = base;
            }
            size += len;
            current.push(triple);
        }
        if !current.is_empty() {
            batches.push(InsertMessage::new(self.origin, self.ttl, current));
        }
        batches
    }

    /// The same payload one hop further along, or `None` if the hop budget
    /// is spent.
    pub fn relayed(&self, triples: Vec<Triple>) -> Option<Self> {
        let ttl = self.ttl.checked_sub(1)?;
        Some(Self {
            origin: self.origin.clone(),
            ttl,
            triples,
        })
    }
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, message: &Message) -> NetworkResult<()>
where
    W: AsyncWrite + Unpin,
{
    let body = bincode::serialize(message).map_err(|e| NetworkError::Codec {
        message: format!("failed to encode {}: {e}", message.kind()),
    })?;
    let len = u32::try_from(body.len()).map_err(|_| NetworkError::FrameTooLarge {
        len: body.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame, refusing bodies above `max_len`.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> NetworkResult<Message>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max_len {
        return Err(NetworkError::FrameTooLarge { len, max: max_len });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    bincode::deserialize(&body).map_err(|e| NetworkError::Codec {
        message: format!("failed to decode frame of {len} bytes: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    #[tokio::test]
    async fn frame_round_trip_over_duplex() {
        let identity = Identity::generate();
        let triple = Triple::new("s", "p", "o").signed_by(&identity);
        let message = Message::Insert(InsertMessage::new(identity.id(), 3, vec![triple]));

        let (mut a, mut b) = tokio::io::duplex(4096);
        write_frame(&mut a, &message).await.unwrap();
        let received = read_frame(&mut b, 4096).await.unwrap();
        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn oversized_frame_is_refused() {
        let message = Message::Peers {
            peers: vec![
                PeerInfo {
                    id: "x".repeat(64),
                    address: "127.0.0.1".into(),
                    port: 1,
                    disk_allocated: 0,
                };
                4
            ],
        };
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_frame(&mut a, &message).await.unwrap();
        let err = read_frame(&mut b, 16).await.unwrap_err();
        assert!(matches!(err, NetworkError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn garbage_body_is_a_codec_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&4u32.to_be_bytes()).await.unwrap();
        a.write_all(&[0xff, 0xff, 0xff, 0xff]).await.unwrap();
        let err = read_frame(&mut b, 64).await.unwrap_err();
        assert!(matches!(err, NetworkError::Codec { .. }));
    }

    #[test]
    fn message_id_ignores_ttl() {
        let identity = Identity::generate();
        let triple = Triple::new("s", "p", "o").signed_by(&identity);
        let first = InsertMessage::new(identity.id(), 5, vec![triple.clone()]);
        let relayed = first.relayed(vec![triple]).unwrap();
        assert_eq!(relayed.ttl, 4);
        assert_eq!(first.message_id(), relayed.message_id());
    }

    fn signed_batch(identity: &Identity, n: usize) -> Vec<Triple> {
        (0..n)
            .map(|i| Triple::new(format!("/m/{i:05}"), "/type/object/name", "x".repeat(40)).signed_by(identity))
            .collect()
    }

    #[test]
    fn split_batches_fit_the_frame_limit() {
        let identity = Identity::generate();
        let triples = signed_batch(&identity, 50);
        let max = 2048;

        let batches = InsertMessage::new(identity.id(), 2, triples.clone()).split_to_fit(max);
        assert!(batches.len() > 1);
        for batch in &batches {
            assert_eq!(batch.ttl, 2);
            assert_eq!(batch.origin, identity.id());
            let body = bincode::serialize(&Message::Insert(batch.clone())).unwrap();
            assert!(body.len() <= max, "{} > {max}", body.len());
        }
        let rejoined: Vec<Triple> = batches.into_iter().flat_map(|b| b.triples).collect();
        assert_eq!(rejoined, triples);
    }

    #[test]
    fn small_batch_is_not_split() {
        let identity = Identity::generate();
        let triples = signed_batch(&identity, 3);
        let batches = InsertMessage::new(identity.id(), 1, triples).split_to_fit(16 * 1024 * 1024);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].triples.len(), 3);
    }

    #[test]
    fn triple_larger_than_any_frame_is_dropped() {
        let identity = Identity::generate();
        let huge = Triple::new("s", "p", "o".repeat(4096)).signed_by(&identity);
        let small = Triple::new("s", "p", "o").signed_by(&identity);
        let batches =
            InsertMessage::new(identity.id(), 1, vec![huge, small.clone()]).split_to_fit(1024);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].triples, vec![small]);
    }

    #[test]
    fn digest_frames_fit_and_only_the_last_is_complete() {
        let ids: Vec<TripleId> = (0..1000u32)
            .map(|i| {
                let mut bytes = [0u8; 32];
                bytes[..4].copy_from_slice(&i.to_be_bytes());
                TripleId::from_bytes(bytes)
            })
            .collect();
        let max = 4096;

        let frames = Message::digests(ids.clone(), max);
        assert!(frames.len() > 1);
        let mut seen = Vec::new();
        for (i, frame) in frames.iter().enumerate() {
            assert!(bincode::serialize(frame).unwrap().len() <= max);
            let Message::Digest { ids, complete } = frame else {
                panic!("expected a digest, got {}", frame.kind());
            };
            assert_eq!(*complete, i == frames.len() - 1);
            seen.extend_from_slice(ids);
        }
        assert_eq!(seen, ids);
    }

    #[test]
    fn empty_digest_is_one_complete_frame() {
        let frames = Message::digests(Vec::new(), 4096);
        assert_eq!(
            frames,
            vec![Message::Digest {
                ids: Vec::new(),
                complete: true
            }]
        );
    }

    #[test]
    fn zero_ttl_is_not_relayed() {
        let message = InsertMessage::new("origin", 0, Vec::new());
        assert!(message.relayed(Vec::new()).is_none());
    }
}
