//! Broadcast sync protocol: 1-byte-tagged frames over an opaque channel.
//!
//! Wire format:
//! ```text
//! ┌──────────┬───────────────────────────────┐
//! │ tag      │ payload                       │
//! │ 1 byte   │ CRDT delta (Update only)      │
//! └──────────┴───────────────────────────────┘
//! tag 0 = SyncRequest (no payload), tag 1 = Update
//! ```
//!
//! The transport underneath (socket, data channel, anything with
//! send/receive) is an external collaborator. It may reorder or redeliver
//! frames; idempotent merge tolerates both. No retry, acknowledgement or
//! ordering lives here. For text-only transports the base64 variants carry
//! the same frames as strings.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::doc::{DecodeError, Origin, ReplicatedDoc};

const TAG_SYNC_REQUEST: u8 = 0;
const TAG_UPDATE: u8 = 1;

/// A frame of the broadcast sync protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// "Please send me your full current state." No payload.
    SyncRequest,
    /// An opaque replicated-state delta, as produced by
    /// [`ReplicatedDoc::encode_state_as_update`] or by a transaction.
    Update(Vec<u8>),
}

impl SyncMessage {
    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            SyncMessage::SyncRequest => vec![TAG_SYNC_REQUEST],
            SyncMessage::Update(delta) => {
                let mut bytes = Vec::with_capacity(1 + delta.len());
                bytes.push(TAG_UPDATE);
                bytes.extend_from_slice(delta);
                bytes
            }
        }
    }

    /// Parse a binary frame. Fails on an empty frame or an unknown tag;
    /// the payload itself stays opaque until merge.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        match bytes.split_first() {
            None => Err(DecodeError::Message("empty frame".into())),
            Some((&TAG_SYNC_REQUEST, _)) => Ok(SyncMessage::SyncRequest),
            Some((&TAG_UPDATE, payload)) => Ok(SyncMessage::Update(payload.to_vec())),
            Some((tag, _)) => Err(DecodeError::Message(format!("unknown message tag {tag}"))),
        }
    }

    /// Text-safe encoding for transports that cannot carry binary payloads.
    pub fn encode_base64(&self) -> String {
        BASE64.encode(self.encode())
    }

    pub fn decode_base64(text: &str) -> Result<Self, DecodeError> {
        let bytes = BASE64
            .decode(text.trim())
            .map_err(|e| DecodeError::Message(e.to_string()))?;
        Self::decode(&bytes)
    }
}

/// Receiver behavior for one inbound frame.
///
/// A `SyncRequest` yields the encoded `Update` reply to send back; an
/// `Update` is merged with origin `Remote` and yields nothing. On any
/// [`DecodeError`] the document is untouched; the caller logs and drops the
/// frame (see [`handle_message_lossy`]).
pub fn handle_message(doc: &mut ReplicatedDoc, bytes: &[u8]) -> Result<Option<Vec<u8>>, DecodeError> {
    match SyncMessage::decode(bytes)? {
        SyncMessage::SyncRequest => {
            let reply = SyncMessage::Update(doc.encode_state_as_update());
            Ok(Some(reply.encode()))
        }
        SyncMessage::Update(delta) => {
            doc.merge_remote_update(&delta, Origin::Remote)?;
            Ok(None)
        }
    }
}

/// [`handle_message`] with the drop-and-log policy applied: malformed input
/// never propagates past this boundary.
pub fn handle_message_lossy(doc: &mut ReplicatedDoc, bytes: &[u8]) -> Option<Vec<u8>> {
    match handle_message(doc, bytes) {
        Ok(reply) => reply,
        Err(e) => {
            log::warn!("dropping inbound sync message: {e}");
            None
        }
    }
}

/// Encoded handshake frame asking a peer for its full state.
pub fn sync_request() -> Vec<u8> {
    SyncMessage::SyncRequest.encode()
}

/// Encoded update frame carrying `delta`.
pub fn update_message(delta: Vec<u8>) -> Vec<u8> {
    SyncMessage::Update(delta).encode()
}
