//! Signed subject-predicate-object statements.
//!
//! A [`Triple`] is valid only if its `signature` verifies against the public
//! key named by `signer` over the canonical encoding of
//! subject ‖ predicate ‖ object ‖ signer. The same canonical bytes, hashed,
//! give the triple's [`TripleId`]; the timestamp is not part of either.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::TripleError;
use crate::identity::{self, Identity};

/// Content hash of a triple's canonical encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TripleId([u8; 32]);

impl TripleId {
    /// Wrap raw hash bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse from a byte slice; `None` unless exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    /// The raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for TripleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A signed statement `(subject, predicate, object)`.
///
/// Client-supplied triples may arrive unsigned (empty `signer`); the
/// replication engine signs those with the local key before committing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Triple {
    #[serde(alias = "subj")]
    pub subject: String,
    #[serde(alias = "pred")]
    pub predicate: String,
    #[serde(alias = "obj")]
    pub object: String,
    /// Peer ID (hex public key) of the node that asserted the triple.
    #[serde(default, alias = "author")]
    pub signer: String,
    /// Hex-encoded ed25519 signature over [`Triple::canonical_bytes`].
    #[serde(default, alias = "sig")]
    pub signature: String,
    /// Seconds since UNIX epoch at signing time.
    #[serde(default, alias = "created")]
    pub timestamp: Option<u64>,
}

impl Triple {
    /// Create an unsigned triple.
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            signer: String::new(),
            signature: String::new(),
            timestamp: None,
        }
    }

    /// Length-prefixed encoding of subject, predicate, object and signer.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let fields = [&self.subject, &self.predicate, &self.object, &self.signer];
        let len = fields.iter().map(|f| 4 + f.len()).sum();
        let mut out = Vec::with_capacity(len);
        for field in fields {
            out.extend_from_slice(&(field.len() as u32).to_be_bytes());
            out.extend_from_slice(field.as_bytes());
        }
        out
    }

    /// Content identity used for deduplication.
    pub fn id(&self) -> TripleId {
        TripleId(Sha256::digest(self.canonical_bytes()).into())
    }

    /// Whether the triple names a signer.
    pub fn is_signed(&self) -> bool {
        !self.signer.is_empty()
    }

    /// Assert this triple as `identity`: sets signer and signature, and
    /// stamps the current time if no timestamp is present.
    pub fn signed_by(mut self, identity: &Identity) -> Self {
        self.signer = identity.id().to_string();
        self.signature = hex::encode(identity.sign(&self.canonical_bytes()).to_bytes());
        if self.timestamp.is_none() {
            self.timestamp = Some(
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs(),
            );
        }
        self
    }

    /// Check the signature against the signer's public key.
    pub fn verify(&self) -> Result<(), TripleError> {
        identity::decode_peer_id(&self.signer)?;
        if identity::verify_hex(&self.canonical_bytes(), &self.signature, &self.signer) {
            Ok(())
        } else {
            Err(TripleError::SignatureInvalid {
                id: self.id().to_string(),
            })
        }
    }

    /// Approximate stored size in bytes, used for capacity accounting.
    pub fn stored_size(&self) -> u64 {
        (self.subject.len()
            + self.predicate.len()
            + self.object.len()
            + self.signer.len()
            + self.signature.len()
            + 8) as u64
    }
}

/// A lookup pattern; `None` in a position is a wildcard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriplePattern {
    #[serde(default, alias = "subj")]
    pub subject: Option<String>,
    #[serde(default, alias = "pred")]
    pub predicate: Option<String>,
    #[serde(default, alias = "obj")]
    pub object: Option<String>,
}

impl TriplePattern {
    /// The all-wildcard pattern.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_predicate(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = Some(predicate.into());
        self
    }

    pub fn with_object(mut self, object: impl Into<String>) -> Self {
        self.object = Some(object.into());
        self
    }

    /// Whether `triple` satisfies every bound position.
    pub fn matches(&self, triple: &Triple) -> bool {
        self.subject.as_deref().is_none_or(|s| s == triple.subject)
            && self.predicate.as_deref().is_none_or(|p| p == triple.predicate)
            && self.object.as_deref().is_none_or(|o| o == triple.object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obama_name() -> Triple {
        Triple::new("/m/02mjmr", "/type/object/name", "Barack Obama")
    }

    #[test]
    fn signed_triple_verifies() {
        let identity = Identity::generate();
        let triple = obama_name().signed_by(&identity);
        assert_eq!(triple.signer, identity.id());
        assert!(triple.timestamp.is_some());
        assert!(triple.verify().is_ok());
    }

    #[test]
    fn tampered_triple_fails_verification() {
        let identity = Identity::generate();
        let mut triple = obama_name().signed_by(&identity);
        triple.object = "Someone Else".into();
        assert!(matches!(
            triple.verify(),
            Err(TripleError::SignatureInvalid { .. })
        ));
    }

    #[test]
    fn swapped_signer_fails_verification() {
        let a = Identity::generate();
        let b = Identity::generate();
        let mut triple = obama_name().signed_by(&a);
        triple.signer = b.id().to_string();
        assert!(triple.verify().is_err());
    }

    #[test]
    fn unsigned_triple_is_malformed() {
        assert!(matches!(
            obama_name().verify(),
            Err(TripleError::MalformedSigner { .. })
        ));
    }

    #[test]
    fn id_ignores_timestamp_but_includes_signer() {
        let a = Identity::generate();
        let b = Identity::generate();
        let mut first = obama_name().signed_by(&a);
        let second = obama_name().signed_by(&a);
        first.timestamp = Some(1);
        assert_eq!(first.id(), second.id());
        assert_ne!(first.id(), obama_name().signed_by(&b).id());
    }

    #[test]
    fn canonical_encoding_is_unambiguous() {
        let a = Triple::new("ab", "c", "d");
        let b = Triple::new("a", "bc", "d");
        assert_ne!(a.canonical_bytes(), b.canonical_bytes());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn json_accepts_short_field_names() {
        let json = r#"{"subj":"/m/0hume","pred":"/type/object/name","obj":"Hume"}"#;
        let triple: Triple = serde_json::from_str(json).unwrap();
        assert_eq!(triple.subject, "/m/0hume");
        assert!(!triple.is_signed());
    }

    #[test]
    fn pattern_matching() {
        let triple = obama_name();
        assert!(TriplePattern::any().matches(&triple));
        assert!(TriplePattern::any().with_subject("/m/02mjmr").matches(&triple));
        assert!(!TriplePattern::any().with_object("Hume").matches(&triple));
    }
}
