//! Update fragments and the versioned wire envelope.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬──────────┬───────────┬──────────┐
//! │ version  │ kind     │ origin    │ payload  │
//! │ 1 byte   │ 1 byte   │ 16 bytes  │ variable │
//! └──────────┴──────────┴───────────┴──────────┘
//! ```
//!
//! The payload of `Update` and `StateResponse` envelopes is a Yjs v1 update;
//! the payload of a `StateRequest` is a Yjs v1 state vector. Both are
//! self-describing (client ids and clocks travel with the data), so any
//! replica can merge them regardless of arrival order or of the process that
//! produced them.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{StateVector, Update};

/// Current envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;

/// An opaque binary delta produced by a local mutation or received from a peer.
///
/// Fragments are the unit of transport and persistence. Applying a set of
/// fragments is commutative, associative and idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpdateFragment(Vec<u8>);

impl UpdateFragment {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse the fragment into a yrs update, failing with
    /// [`CodecError::MalformedFragment`] on garbage.
    pub fn decode(&self) -> Result<Update, CodecError> {
        decode_update(&self.0)
    }
}

impl From<Vec<u8>> for UpdateFragment {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for UpdateFragment {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Decode a Yjs v1 update.
pub fn decode_update(bytes: &[u8]) -> Result<Update, CodecError> {
    Update::decode_v1(bytes).map_err(|e| CodecError::MalformedFragment(e.to_string()))
}

/// Decode a Yjs v1 state vector.
pub fn decode_state_vector(bytes: &[u8]) -> Result<StateVector, CodecError> {
    StateVector::decode_v1(bytes).map_err(|e| CodecError::MalformedFragment(e.to_string()))
}

/// Envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EnvelopeKind {
    /// Incremental update produced by a local mutation
    Update = 1,
    /// "Here is what I have": payload is a state vector
    StateRequest = 2,
    /// Diff answering a state request
    StateResponse = 3,
}

/// Versioned wire envelope wrapping a fragment with its origin replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u8,
    pub kind: EnvelopeKind,
    /// Replica that produced the envelope; used to drop our own echoes
    pub origin: Uuid,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Wrap an update fragment.
    pub fn update(origin: Uuid, fragment: &UpdateFragment) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            kind: EnvelopeKind::Update,
            origin,
            payload: fragment.as_bytes().to_vec(),
        }
    }

    /// Announce our state vector so peers can answer with what we lack.
    pub fn state_request(origin: Uuid, state_vector: Vec<u8>) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            kind: EnvelopeKind::StateRequest,
            origin,
            payload: state_vector,
        }
    }

    /// Answer a state request with a diff.
    pub fn state_response(origin: Uuid, diff: &UpdateFragment) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            kind: EnvelopeKind::StateResponse,
            origin,
            payload: diff.as_bytes().to_vec(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Deserialize from binary wire format.
    ///
    /// Envelopes from a newer format version are rejected rather than
    /// guessed at.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (envelope, _): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| CodecError::MalformedFragment(e.to_string()))?;
        if envelope.version == 0 || envelope.version > ENVELOPE_VERSION {
            return Err(CodecError::UnsupportedVersion {
                found: envelope.version,
                supported: ENVELOPE_VERSION,
            });
        }
        Ok(envelope)
    }

    /// The payload as an update fragment (for `Update` / `StateResponse`).
    pub fn fragment(&self) -> Result<UpdateFragment, CodecError> {
        match self.kind {
            EnvelopeKind::Update | EnvelopeKind::StateResponse => {
                Ok(UpdateFragment::new(self.payload.clone()))
            }
            EnvelopeKind::StateRequest => Err(CodecError::UnexpectedKind(self.kind)),
        }
    }
}

/// Codec errors.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    #[error("malformed fragment: {0}")]
    MalformedFragment(String),
    #[error("unsupported envelope version {found} (supported up to {supported})")]
    UnsupportedVersion { found: u8, supported: u8 },
    #[error("envelope of kind {0:?} carries no update")]
    UnexpectedKind(EnvelopeKind),
    #[error("encode error: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::updates::encoder::Encode;
    use yrs::{Doc, ReadTxn, Text, Transact, WriteTxn};

    fn sample_update() -> Vec<u8> {
        let doc = Doc::new();
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        text.insert(&mut txn, 0, "hello");
        txn.encode_update_v1()
    }

    #[test]
    fn test_envelope_update_roundtrip() {
        let origin = Uuid::new_v4();
        let fragment = UpdateFragment::new(sample_update());

        let encoded = Envelope::update(origin, &fragment).encode().unwrap();
        let decoded = Envelope::decode(&encoded).unwrap();

        assert_eq!(decoded.version, ENVELOPE_VERSION);
        assert_eq!(decoded.kind, EnvelopeKind::Update);
        assert_eq!(decoded.origin, origin);
        assert_eq!(decoded.fragment().unwrap(), fragment);
    }

    #[test]
    fn test_state_request_carries_no_fragment() {
        let doc = Doc::new();
        let sv = doc.transact().state_vector().encode_v1();
        let envelope = Envelope::state_request(Uuid::new_v4(), sv.clone());

        assert_eq!(envelope.payload, sv);
        assert!(matches!(
            envelope.fragment(),
            Err(CodecError::UnexpectedKind(EnvelopeKind::StateRequest))
        ));
        assert!(decode_state_vector(&envelope.payload).is_ok());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(matches!(
            Envelope::decode(&garbage),
            Err(CodecError::MalformedFragment(_))
        ));
    }

    #[test]
    fn test_newer_version_rejected() {
        let mut envelope = Envelope::update(Uuid::new_v4(), &UpdateFragment::new(sample_update()));
        envelope.version = ENVELOPE_VERSION + 1;
        let encoded = bincode::serde::encode_to_vec(&envelope, bincode::config::standard()).unwrap();

        match Envelope::decode(&encoded) {
            Err(CodecError::UnsupportedVersion { found, supported }) => {
                assert_eq!(found, ENVELOPE_VERSION + 1);
                assert_eq!(supported, ENVELOPE_VERSION);
            }
            other => panic!("expected UnsupportedVersion, got {other:?}"),
        }
    }

    #[test]
    fn test_fragment_decode() {
        assert!(UpdateFragment::new(sample_update()).decode().is_ok());
        assert!(UpdateFragment::new(vec![0xFF; 8]).decode().is_err());
    }

    #[test]
    fn test_envelope_size_efficient() {
        let fragment = UpdateFragment::new(vec![0u8; 50]);
        let encoded = Envelope::update(Uuid::new_v4(), &fragment).encode().unwrap();

        // 1 version + 1 kind + 16 origin + length prefix + payload
        assert!(
            encoded.len() < 100,
            "Encoded size {} too large for 50-byte fragment",
            encoded.len()
        );
    }
}
