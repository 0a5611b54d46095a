//! Wire codec for the daemon↔agent socket protocol.
//!
//! Every frame is a fixed 16-byte header followed by `size` payload bytes:
//!
//! ```text
//! [u32 LE type] [u32 LE arg1] [u32 LE arg2] [u32 LE size] [payload: size bytes]
//! ```
//!
//! There is no magic number and no checksum. Framing relies on the stream
//! being reliable and ordered; a single misframed byte desynchronises the
//! stream for good and the connection has to be torn down.
//!
//! Message types are a dense enumeration shared by both peers. New types are
//! appended, never renumbered.

use crate::error::TransportError;

/// Size of the serialized header.
pub const HEADER_SIZE: usize = 16;

/// Largest payload either side will send or accept (64 MB).
///
/// Clipboard images are the largest legitimate payloads. Anything above this
/// is treated as a desynchronised stream.
pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// Fixed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    /// Raw message type (see [`MessageType`]).
    pub msg_type: u32,
    /// First message-specific scalar (e.g. selection id).
    pub arg1: u32,
    /// Second message-specific scalar (e.g. clipboard format).
    pub arg2: u32,
    /// Number of payload bytes following the header.
    pub size: u32,
}

impl MessageHeader {
    /// Serialize to wire bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.msg_type.to_le_bytes());
        buf[4..8].copy_from_slice(&self.arg1.to_le_bytes());
        buf[8..12].copy_from_slice(&self.arg2.to_le_bytes());
        buf[12..16].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// Known message type, if any.
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_u32(self.msg_type)
    }

    /// Symbolic name for logs.
    pub fn type_name(&self) -> &'static str {
        message_type_name(self.msg_type)
    }
}

/// Decode a header. Total: every 16-byte pattern is a header.
pub fn decode_header(bytes: &[u8; HEADER_SIZE]) -> MessageHeader {
    let field = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
    MessageHeader {
        msg_type: field(0),
        arg1: field(4),
        arg2: field(8),
        size: field(12),
    }
}

/// Encode a complete frame: header then payload, no padding.
///
/// # Errors
///
/// Returns [`TransportError::PayloadTooLarge`] if the payload exceeds
/// [`MAX_MESSAGE_SIZE`].
pub fn encode(msg_type: u32, arg1: u32, arg2: u32, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    if payload.len() > MAX_MESSAGE_SIZE as usize {
        return Err(TransportError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    let header = MessageHeader {
        msg_type,
        arg1,
        arg2,
        size: payload.len() as u32,
    };
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// A fully received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Decoded header. `header.size == payload.len()`.
    pub header: MessageHeader,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

/// Message types shared by daemon and agent.
///
/// Discriminants are wire values. Append only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    /// agent → daemon: arg1 overall width, arg2 overall height, payload per-monitor geometry.
    GuestXorgResolution = 0,
    /// daemon → agent: requested monitor layout.
    MonitorsConfig = 1,
    /// arg1 selection, payload u32 array of offered clipboard types.
    ClipboardGrab = 2,
    /// arg1 selection, arg2 requested type.
    ClipboardRequest = 3,
    /// arg1 selection, arg2 type, payload data.
    ClipboardData = 4,
    /// arg1 selection.
    ClipboardRelease = 5,
    /// daemon → agent: build version string.
    Version = 6,
    /// daemon → agent: audio mute/volume sync.
    AudioVolumeSync = 7,
    /// daemon → agent: file transfer start.
    FileXferStart = 8,
    /// both ways: file transfer status (arg1 id, arg2 status when agent → daemon).
    FileXferStatus = 9,
    /// daemon → agent: file transfer data chunk.
    FileXferData = 10,
    /// daemon → agent: file transfers are disabled for this session.
    FileXferDisable = 11,
    /// daemon → agent: the remote viewer went away.
    ClientDisconnected = 12,
    /// daemon → agent: graphics device info for display id mapping.
    GraphicsDeviceInfo = 13,
}

/// Symbolic names indexed by wire value.
const MESSAGE_NAMES: [&str; MessageType::COUNT] = [
    "guest xorg resolution",
    "monitors config",
    "clipboard grab",
    "clipboard request",
    "clipboard data",
    "clipboard release",
    "version",
    "audio volume sync",
    "file xfer start",
    "file xfer status",
    "file xfer data",
    "file xfer disable",
    "client disconnected",
    "graphics device info",
];

impl MessageType {
    /// Number of defined message types.
    pub const COUNT: usize = 14;

    /// Every message type in wire order.
    pub const ALL: [MessageType; Self::COUNT] = [
        Self::GuestXorgResolution,
        Self::MonitorsConfig,
        Self::ClipboardGrab,
        Self::ClipboardRequest,
        Self::ClipboardData,
        Self::ClipboardRelease,
        Self::Version,
        Self::AudioVolumeSync,
        Self::FileXferStart,
        Self::FileXferStatus,
        Self::FileXferData,
        Self::FileXferDisable,
        Self::ClientDisconnected,
        Self::GraphicsDeviceInfo,
    ];

    /// Map a wire value to a known type.
    pub fn from_u32(raw: u32) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    /// Wire value.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Symbolic name.
    pub fn name(self) -> &'static str {
        MESSAGE_NAMES[self as usize]
    }
}

/// Symbolic name for a raw wire type; out-of-range values are "invalid message".
pub fn message_type_name(raw: u32) -> &'static str {
    MESSAGE_NAMES.get(raw as usize).copied().unwrap_or("invalid message")
}

/// Debug trace of a completed send or receive.
pub(crate) fn trace_header(conn: &str, header: &MessageHeader, direction: &str) {
    log::debug!(
        "{} {} {}, arg1: {}, arg2: {}, size {}",
        conn,
        direction,
        header.type_name(),
        header.arg1,
        header.arg2,
        header.size
    );
}
