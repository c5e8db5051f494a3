//! Event envelope: the platform's realtime payload type.
//!
//! The payload set is a closed tagged union: a one-byte discriminant
//! ([`EventKind`]) followed by the variant's JSON body. Each variant has an
//! explicit entry in the encode/decode tables below; an unknown tag is a
//! decode error. There is no runtime type discovery.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{TopicId, UserId};

/// Error type for envelope codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Insufficient data to decode
    #[error("Insufficient data")]
    InsufficientData,

    /// Unknown event kind tag
    #[error("Unknown event kind: {0}")]
    UnknownKind(u8),

    /// Body serialization or deserialization failed
    #[error("Invalid body for {kind:?}: {source}")]
    InvalidBody {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Discriminant for the closed set of event payloads.
///
/// Tag values are part of the wire contract; never reuse a retired tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    /// A message was posted to a channel.
    MessagePosted = 0x01,
    /// A message was deleted from a channel.
    MessageDeleted = 0x02,
    /// A user's presence changed.
    PresenceChanged = 0x03,
    /// A user started typing in a channel.
    TypingStarted = 0x04,
    /// A user's voice state changed (joined/left/muted).
    VoiceStateChanged = 0x05,
}

impl EventKind {
    /// Map a wire tag back to a kind.
    fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            0x01 => Ok(EventKind::MessagePosted),
            0x02 => Ok(EventKind::MessageDeleted),
            0x03 => Ok(EventKind::PresenceChanged),
            0x04 => Ok(EventKind::TypingStarted),
            0x05 => Ok(EventKind::VoiceStateChanged),
            other => Err(CodecError::UnknownKind(other)),
        }
    }
}

/// Body of a `MessagePosted` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePosted {
    /// Message identifier.
    pub message_id: String,
    /// Author of the message.
    pub author: UserId,
    /// Message text.
    pub content: String,
}

/// Body of a `MessageDeleted` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDeleted {
    /// Message identifier.
    pub message_id: String,
    /// Who deleted it.
    pub deleted_by: UserId,
}

/// Body of a `PresenceChanged` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceChanged {
    /// The user whose presence changed.
    pub user: UserId,
    /// New presence value ("online", "idle", "offline").
    pub presence: String,
}

/// Body of a `TypingStarted` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingStarted {
    /// The user who started typing.
    pub user: UserId,
}

/// Body of a `VoiceStateChanged` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStateChanged {
    /// The user whose voice state changed.
    pub user: UserId,
    /// Whether the user is in the voice channel.
    pub connected: bool,
    /// Whether the user is muted.
    pub muted: bool,
}

/// One variant of the closed payload union.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventBody {
    /// See [`MessagePosted`].
    MessagePosted(MessagePosted),
    /// See [`MessageDeleted`].
    MessageDeleted(MessageDeleted),
    /// See [`PresenceChanged`].
    PresenceChanged(PresenceChanged),
    /// See [`TypingStarted`].
    TypingStarted(TypingStarted),
    /// See [`VoiceStateChanged`].
    VoiceStateChanged(VoiceStateChanged),
}

impl EventBody {
    /// Discriminant for this variant.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            EventBody::MessagePosted(_) => EventKind::MessagePosted,
            EventBody::MessageDeleted(_) => EventKind::MessageDeleted,
            EventBody::PresenceChanged(_) => EventKind::PresenceChanged,
            EventBody::TypingStarted(_) => EventKind::TypingStarted,
            EventBody::VoiceStateChanged(_) => EventKind::VoiceStateChanged,
        }
    }
}

/// A realtime event as carried through the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Topic the event belongs to.
    pub topic: TopicId,
    /// When the event was published.
    pub published_at: DateTime<Utc>,
    /// The payload.
    pub body: EventBody,
}

impl EventEnvelope {
    /// Create an envelope stamped with the current time.
    #[must_use]
    pub fn new(topic: TopicId, body: EventBody) -> Self {
        Self {
            topic,
            published_at: Utc::now(),
            body,
        }
    }
}

/// Encode an envelope: 1-byte kind tag, then the envelope JSON.
///
/// # Errors
///
/// Returns an error if body serialization fails.
pub fn encode_envelope(envelope: &EventEnvelope) -> Result<Bytes, CodecError> {
    let kind = envelope.body.kind();
    let json = serde_json::to_vec(envelope).map_err(|source| CodecError::InvalidBody {
        kind,
        source,
    })?;

    let mut buf = BytesMut::with_capacity(1 + json.len());
    buf.put_u8(kind as u8);
    buf.extend_from_slice(&json);
    Ok(buf.freeze())
}

/// Decode an envelope produced by [`encode_envelope`].
///
/// The tag is validated against the closed kind set before the body is
/// parsed, and the decoded body must match the tag.
///
/// # Errors
///
/// Returns an error on truncated input, an unknown tag, or a body that does
/// not parse as the tagged variant.
pub fn decode_envelope(data: &mut impl Buf) -> Result<EventEnvelope, CodecError> {
    if data.remaining() < 1 {
        return Err(CodecError::InsufficientData);
    }

    let kind = EventKind::from_tag(data.get_u8())?;
    let body = data.copy_to_bytes(data.remaining());

    let envelope: EventEnvelope =
        serde_json::from_slice(&body).map_err(|source| CodecError::InvalidBody { kind, source })?;

    if envelope.body.kind() != kind {
        // A mismatched tag means the frame was assembled incorrectly.
        return Err(CodecError::UnknownKind(kind as u8));
    }

    Ok(envelope)
}
