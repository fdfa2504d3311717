//! Strata wire format — the length-prefixed frame every link speaks.
//!
//! One frame carries exactly one `Message`. TCP gives us a byte stream with
//! no boundaries, so every frame starts with its own total length and every
//! variable-width field carries an explicit length prefix. All integers are
//! big-endian and fixed width.
//!
//! ```text
//! total_length  i32     includes itself
//! magic_len     i32     magic       [u8; magic_len]
//! version       i32
//! type_len      i32     type        [u8; type_len]
//! messageType   i32
//! nodeId_len    i32     nodeId      [u8; nodeId_len]
//! sender_len    i32     sender      [u8; sender_len]
//! timestamp     i64
//! payload_len   i32     payload     [u8; payload_len]
//! ```
//!
//! The codec is pure. Reading frames off a socket lives in
//! `strata_services::transport`.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Protocol tag carried by every frame. A handshake with any other magic is
/// rejected.
pub const MAGIC: &str = "CSM218";

/// Current protocol version.
pub const PROTOCOL_VERSION: i32 = 1;

/// Size of the `total_length` prefix.
pub const LENGTH_PREFIX: usize = 4;

/// Bytes taken by the fixed-width fields and length prefixes of one frame.
/// A frame with every string and the payload empty is exactly this long.
pub const FIXED_OVERHEAD: usize = 40;

// ── Message kind ──────────────────────────────────────────────────────────────

/// The `type` of a frame.
///
/// On the wire this is a string tag plus a redundant integer discriminant.
/// Unknown tags are rejected at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Node → coordinator. First frame on every link. Empty payload.
    Identity,
    /// Coordinator → node. Payload is a task unit.
    Task,
    /// Node → coordinator. Payload is a result unit.
    Result,
}

impl MessageKind {
    /// The string tag written into the `type` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "IDENTITY",
            Self::Task => "TASK",
            Self::Result => "RESULT",
        }
    }

    /// The integer written into the `messageType` field.
    pub fn code(&self) -> i32 {
        match self {
            Self::Identity => 0,
            Self::Task => 1,
            Self::Result => 2,
        }
    }
}

impl TryFrom<&str> for MessageKind {
    type Error = FrameError;

    fn try_from(tag: &str) -> Result<Self, Self::Error> {
        match tag {
            "IDENTITY" => Ok(Self::Identity),
            "TASK" => Ok(Self::Task),
            "RESULT" => Ok(Self::Result),
            other => Err(FrameError::UnknownKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Message ───────────────────────────────────────────────────────────────────

/// One decoded frame.
///
/// `decode` always produces a fresh, independently owned value; nothing
/// borrows from the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub magic: String,
    pub version: i32,
    pub kind: MessageKind,
    /// Redundant discriminant. Constructors keep it equal to `kind.code()`;
    /// the codec carries whatever value is set.
    pub message_type: i32,
    /// Stable identity of the sending (or addressed) node.
    pub node_id: String,
    /// Free-form label. Task and result frames use it for the job key.
    pub sender: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub payload: Bytes,
}

impl Message {
    /// Build a frame of `kind` stamped with the current time.
    pub fn new(
        kind: MessageKind,
        node_id: impl Into<String>,
        sender: impl Into<String>,
        payload: Bytes,
    ) -> Self {
        Self {
            magic: MAGIC.to_string(),
            version: PROTOCOL_VERSION,
            kind,
            message_type: kind.code(),
            node_id: node_id.into(),
            sender: sender.into(),
            timestamp: now_ms(),
            payload,
        }
    }

    /// The registration frame a node sends first on every link.
    pub fn identity(node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self::new(MessageKind::Identity, node_id.clone(), node_id, Bytes::new())
    }
}

/// Wall clock in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ── Encode ────────────────────────────────────────────────────────────────────

/// Encode a message into one complete frame, length prefix included.
///
/// Fails only when a field (or the whole frame) cannot be described by an
/// `i32` length.
pub fn encode(msg: &Message) -> Result<Bytes, FrameError> {
    let magic = msg.magic.as_bytes();
    let kind = msg.kind.as_str().as_bytes();
    let node_id = msg.node_id.as_bytes();
    let sender = msg.sender.as_bytes();
    let payload = &msg.payload[..];

    let total = frame_len([
        ("magic", magic.len()),
        ("type", kind.len()),
        ("nodeId", node_id.len()),
        ("sender", sender.len()),
        ("payload", payload.len()),
    ])?;

    let mut buf = BytesMut::with_capacity(total);
    buf.put_i32(total as i32);
    put_field(&mut buf, magic);
    buf.put_i32(msg.version);
    put_field(&mut buf, kind);
    buf.put_i32(msg.message_type);
    put_field(&mut buf, node_id);
    put_field(&mut buf, sender);
    buf.put_i64(msg.timestamp);
    put_field(&mut buf, payload);

    debug_assert_eq!(buf.len(), total);
    Ok(buf.freeze())
}

/// Total frame size for the given variable-length fields, or the first
/// field that pushes it past `i32::MAX`.
fn frame_len(fields: [(&'static str, usize); 5]) -> Result<usize, FrameError> {
    let mut total = FIXED_OVERHEAD;
    for (field, len) in fields {
        total = total
            .checked_add(len)
            .filter(|t| *t <= i32::MAX as usize)
            .ok_or(FrameError::FieldTooLarge { field, len })?;
    }
    Ok(total)
}

fn put_field(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_i32(bytes.len() as i32);
    buf.put_slice(bytes);
}

// ── Decode ────────────────────────────────────────────────────────────────────

/// Decode exactly one frame. `frame` must hold the whole frame, starting at
/// the length prefix and ending at the last payload byte.
pub fn decode(frame: &[u8]) -> Result<Message, FrameError> {
    let mut reader = FieldReader { buf: frame };

    if frame.len() < LENGTH_PREFIX {
        return Err(FrameError::LengthTooSmall(frame.len() as i64));
    }
    let declared = reader.i32("total_length")?;
    if declared < LENGTH_PREFIX as i32 {
        return Err(FrameError::LengthTooSmall(declared as i64));
    }
    if declared as usize != frame.len() {
        return Err(FrameError::LengthMismatch {
            declared: declared as i64,
            actual: frame.len(),
        });
    }

    let magic = reader.string("magic")?;
    let version = reader.i32("version")?;
    let kind = MessageKind::try_from(reader.string("type")?.as_str())?;
    let message_type = reader.i32("messageType")?;
    let node_id = reader.string("nodeId")?;
    let sender = reader.string("sender")?;
    let timestamp = reader.i64("timestamp")?;
    let payload = reader.field("payload")?;

    if !reader.buf.is_empty() {
        return Err(FrameError::TrailingBytes(reader.buf.len()));
    }

    Ok(Message {
        magic,
        version,
        kind,
        message_type,
        node_id,
        sender,
        timestamp,
        payload: Bytes::copy_from_slice(payload),
    })
}

/// Bounds-checked field reader. Every read checks the remaining length
/// first, so a hostile frame can never push us past the buffer.
struct FieldReader<'a> {
    buf: &'a [u8],
}

impl<'a> FieldReader<'a> {
    fn need(&self, field: &'static str, needed: usize) -> Result<(), FrameError> {
        if self.buf.remaining() < needed {
            return Err(FrameError::Truncated {
                field,
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn i32(&mut self, field: &'static str) -> Result<i32, FrameError> {
        self.need(field, 4)?;
        Ok(self.buf.get_i32())
    }

    fn i64(&mut self, field: &'static str) -> Result<i64, FrameError> {
        self.need(field, 8)?;
        Ok(self.buf.get_i64())
    }

    fn field(&mut self, field: &'static str) -> Result<&'a [u8], FrameError> {
        let len = self.i32(field)?;
        if len < 0 {
            return Err(FrameError::NegativeLength { field, len });
        }
        let len = len as usize;
        self.need(field, len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn string(&mut self, field: &'static str) -> Result<String, FrameError> {
        let bytes = self.field(field)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| FrameError::InvalidText(field))
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when encoding or interpreting a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame length {0} is smaller than the 4-byte length prefix")]
    LengthTooSmall(i64),

    #[error("declared frame length {declared} does not match the {actual} bytes supplied")]
    LengthMismatch { declared: i64, actual: usize },

    #[error("negative length {len} for field {field}")]
    NegativeLength { field: &'static str, len: i32 },

    #[error("field {field} needs {needed} bytes but only {remaining} remain")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("{0} unexpected bytes after the payload")]
    TrailingBytes(usize),

    #[error("field {0} is not valid UTF-8")]
    InvalidText(&'static str),

    #[error("unknown message type tag {0:?}")]
    UnknownKind(String),

    #[error("field {field} is {len} bytes, too large for a single frame")]
    FieldTooLarge { field: &'static str, len: usize },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
