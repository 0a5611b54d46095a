//! Typed payloads carried by the daemon↔agent messages.
//!
//! All multi-byte fields are little-endian and packed, matching the frame
//! header. Parsers are strict about the fixed part of each payload and
//! return [`PayloadError`] instead of reading past the end.

use crate::error::PayloadError;

/// Clipboard selection, carried in `arg1` of the clipboard messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Selection {
    /// The regular clipboard.
    Clipboard = 0,
    /// X11 primary selection.
    Primary = 1,
    /// X11 secondary selection.
    Secondary = 2,
}

impl Selection {
    /// Map a wire value to a known selection.
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Clipboard),
            1 => Some(Self::Primary),
            2 => Some(Self::Secondary),
            _ => None,
        }
    }

    /// Wire value.
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Clipboard content type, carried in `arg2` and in grab type lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ClipboardType {
    /// No data. Used to answer a request that cannot be served.
    None = 0,
    /// UTF-8 text.
    Utf8Text = 1,
    /// PNG image.
    Png = 2,
    /// BMP image.
    Bmp = 3,
    /// TIFF image.
    Tiff = 4,
    /// JPEG image.
    Jpg = 5,
}

impl ClipboardType {
    /// Map a wire value to a known type.
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::None,
            1 => Self::Utf8Text,
            2 => Self::Png,
            3 => Self::Bmp,
            4 => Self::Tiff,
            5 => Self::Jpg,
            _ => return None,
        })
    }

    /// Wire value.
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Outcome codes for file transfers, carried in `arg2` of an agent-sent
/// `FileXferStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FileXferStatusCode {
    /// Ready for data.
    CanSendData = 0,
    /// Cancelled by either side.
    Cancelled = 1,
    /// Failed.
    Error = 2,
    /// Completed.
    Success = 3,
    /// Destination is out of space.
    NotEnoughSpace = 4,
    /// Session is locked.
    SessionLocked = 5,
    /// No agent is running in the session.
    VdagentNotConnected = 6,
    /// File transfer is disabled.
    Disabled = 7,
}

impl FileXferStatusCode {
    /// Map a wire value to a known code.
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::CanSendData,
            1 => Self::Cancelled,
            2 => Self::Error,
            3 => Self::Success,
            4 => Self::NotEnoughSpace,
            5 => Self::SessionLocked,
            6 => Self::VdagentNotConnected,
            7 => Self::Disabled,
            _ => return None,
        })
    }

    /// Wire value.
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn i32_at(buf: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn require(what: &'static str, buf: &[u8], expected: usize) -> Result<(), PayloadError> {
    if buf.len() < expected {
        return Err(PayloadError::Truncated {
            what,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// One monitor of a requested layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Height in pixels.
    pub height: u32,
    /// Width in pixels.
    pub width: u32,
    /// Colour depth in bits.
    pub depth: u32,
    /// Left edge.
    pub x: i32,
    /// Top edge.
    pub y: i32,
}

impl MonitorConfig {
    const SIZE: usize = 20;
}

/// A requested monitor layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorsConfig {
    /// Layout flags (e.g. "use positions").
    pub flags: u32,
    /// Monitors in host order.
    pub monitors: Vec<MonitorConfig>,
}

impl MonitorsConfig {
    const WHAT: &'static str = "monitors config";

    /// Parse `num_of_monitors: u32, flags: u32, monitors[num]`.
    pub fn parse(buf: &[u8]) -> Result<Self, PayloadError> {
        require(Self::WHAT, buf, 8)?;
        let count = u32_at(buf, 0) as usize;
        let flags = u32_at(buf, 4);
        let declared = count
            .checked_mul(MonitorConfig::SIZE)
            .and_then(|n| n.checked_add(8))
            .unwrap_or(usize::MAX);
        if buf.len() < declared {
            return Err(PayloadError::LengthMismatch {
                what: Self::WHAT,
                declared,
                actual: buf.len(),
            });
        }

        let monitors = buf[8..declared]
            .chunks_exact(MonitorConfig::SIZE)
            .map(|m| MonitorConfig {
                height: u32_at(m, 0),
                width: u32_at(m, 4),
                depth: u32_at(m, 8),
                x: i32_at(m, 12),
                y: i32_at(m, 16),
            })
            .collect();
        Ok(Self { flags, monitors })
    }

    /// Serialize to the wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.monitors.len() * MonitorConfig::SIZE);
        buf.extend_from_slice(&(self.monitors.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        for m in &self.monitors {
            buf.extend_from_slice(&m.height.to_le_bytes());
            buf.extend_from_slice(&m.width.to_le_bytes());
            buf.extend_from_slice(&m.depth.to_le_bytes());
            buf.extend_from_slice(&m.x.to_le_bytes());
            buf.extend_from_slice(&m.y.to_le_bytes());
        }
        buf
    }
}

/// Geometry of one guest display, as reported to the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GuestResolution {
    /// Width in pixels.
    pub width: i32,
    /// Height in pixels.
    pub height: i32,
    /// Left edge.
    pub x: i32,
    /// Top edge.
    pub y: i32,
    /// Host-side display id.
    pub display_id: i32,
}

impl GuestResolution {
    const SIZE: usize = 20;
    const WHAT: &'static str = "guest xorg resolution";

    /// Serialize a list of displays.
    pub fn encode_list(list: &[GuestResolution]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(list.len() * Self::SIZE);
        for r in list {
            for field in [r.width, r.height, r.x, r.y, r.display_id] {
                buf.extend_from_slice(&field.to_le_bytes());
            }
        }
        buf
    }

    /// Parse a list of displays. The payload must be a whole number of entries.
    pub fn parse_list(buf: &[u8]) -> Result<Vec<GuestResolution>, PayloadError> {
        if buf.len() % Self::SIZE != 0 {
            return Err(PayloadError::LengthMismatch {
                what: Self::WHAT,
                declared: buf.len() / Self::SIZE * Self::SIZE,
                actual: buf.len(),
            });
        }
        Ok(buf
            .chunks_exact(Self::SIZE)
            .map(|r| GuestResolution {
                width: i32_at(r, 0),
                height: i32_at(r, 4),
                x: i32_at(r, 8),
                y: i32_at(r, 12),
                display_id: i32_at(r, 16),
            })
            .collect())
    }
}

/// Daemon asks the agent to start receiving a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileXferStart {
    /// Transfer id.
    pub id: u32,
    /// Transfer metadata (key file with name and size).
    pub data: Vec<u8>,
}

impl FileXferStart {
    /// Parse `id: u32, data[]`.
    pub fn parse(buf: &[u8]) -> Result<Self, PayloadError> {
        require("file xfer start", buf, 4)?;
        Ok(Self {
            id: u32_at(buf, 0),
            data: buf[4..].to_vec(),
        })
    }
}

/// Status update for a transfer, daemon → agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileXferStatus {
    /// Transfer id.
    pub id: u32,
    /// Raw status code (see [`FileXferStatusCode`]).
    pub result: u32,
    /// Optional status detail.
    pub data: Vec<u8>,
}

impl FileXferStatus {
    /// Parse `id: u32, result: u32, data[]`.
    pub fn parse(buf: &[u8]) -> Result<Self, PayloadError> {
        require("file xfer status", buf, 8)?;
        Ok(Self {
            id: u32_at(buf, 0),
            result: u32_at(buf, 4),
            data: buf[8..].to_vec(),
        })
    }

    /// Known status code, if any.
    pub fn code(&self) -> Option<FileXferStatusCode> {
        FileXferStatusCode::from_u32(self.result)
    }
}

/// One chunk of file data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileXferData {
    /// Transfer id.
    pub id: u32,
    /// Chunk bytes.
    pub data: Vec<u8>,
}

impl FileXferData {
    const WHAT: &'static str = "file xfer data";

    /// Parse `id: u32, size: u64, data[size]`.
    pub fn parse(buf: &[u8]) -> Result<Self, PayloadError> {
        require(Self::WHAT, buf, 12)?;
        let id = u32_at(buf, 0);
        let mut size = [0u8; 8];
        size.copy_from_slice(&buf[4..12]);
        let size = u64::from_le_bytes(size);
        let data = &buf[12..];
        if size != data.len() as u64 {
            return Err(PayloadError::LengthMismatch {
                what: Self::WHAT,
                declared: usize::try_from(size).unwrap_or(usize::MAX),
                actual: data.len(),
            });
        }
        Ok(Self {
            id,
            data: data.to_vec(),
        })
    }
}

/// Transfer id at the head of any file-xfer payload, even a malformed one.
pub fn peek_xfer_id(buf: &[u8]) -> Option<u32> {
    (buf.len() >= 4).then(|| u32_at(buf, 0))
}

/// Host audio volume change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioVolumeSync {
    /// Playback stream when true, record stream otherwise.
    pub is_playback: bool,
    /// Muted.
    pub mute: bool,
    /// Per-channel volume.
    pub volumes: Vec<u16>,
}

impl AudioVolumeSync {
    const WHAT: &'static str = "audio volume sync";

    /// Parse `is_playback: u8, mute: u8, nchannels: u8, volume: u16[nchannels]`.
    pub fn parse(buf: &[u8]) -> Result<Self, PayloadError> {
        require(Self::WHAT, buf, 3)?;
        let channels = buf[2] as usize;
        let declared = 3 + channels * 2;
        if buf.len() < declared {
            return Err(PayloadError::LengthMismatch {
                what: Self::WHAT,
                declared,
                actual: buf.len(),
            });
        }
        let volumes = buf[3..declared]
            .chunks_exact(2)
            .map(|v| u16::from_le_bytes([v[0], v[1]]))
            .collect();
        Ok(Self {
            is_playback: buf[0] != 0,
            mute: buf[1] != 0,
            volumes,
        })
    }

    /// Serialize to the wire layout. Channels beyond 255 are dropped.
    pub fn encode(&self) -> Vec<u8> {
        let channels = self.volumes.len().min(u8::MAX as usize);
        let mut buf = Vec::with_capacity(3 + channels * 2);
        buf.push(u8::from(self.is_playback));
        buf.push(u8::from(self.mute));
        buf.push(channels as u8);
        for v in &self.volumes[..channels] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf
    }
}

/// Parse a clipboard grab type list (`u32[]`).
///
/// Unknown type values are kept raw so the clipboard can decide; trailing
/// bytes that do not make up a whole entry are ignored. Allocation of the
/// list is fallible.
pub fn parse_type_list(buf: &[u8]) -> Result<Vec<u32>, PayloadError> {
    let count = buf.len() / 4;
    let mut types = Vec::new();
    types
        .try_reserve_exact(count)
        .map_err(|_| PayloadError::OutOfMemory {
            what: "clipboard type list",
        })?;
    types.extend(buf.chunks_exact(4).map(|t| u32_at(t, 0)));
    Ok(types)
}

/// Serialize a clipboard grab type list.
pub fn encode_type_list(types: &[ClipboardType]) -> Vec<u8> {
    types.iter().flat_map(|t| t.as_u32().to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitors_config_parse() {
        let config = MonitorsConfig {
            flags: 1,
            monitors: vec![
                MonitorConfig {
                    height: 1080,
                    width: 1920,
                    depth: 32,
                    x: 0,
                    y: 0,
                },
                MonitorConfig {
                    height: 768,
                    width: 1024,
                    depth: 32,
                    x: 1920,
                    y: -10,
                },
            ],
        };
        let wire = config.encode();
        assert_eq!(wire.len(), 8 + 2 * 20);
        assert_eq!(MonitorsConfig::parse(&wire).unwrap(), config);
    }

    #[test]
    fn test_monitors_config_count_exceeds_payload() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&3u32.to_le_bytes());
        wire.extend_from_slice(&0u32.to_le_bytes());
        wire.extend_from_slice(&[0u8; 20]);
        let err = MonitorsConfig::parse(&wire).unwrap_err();
        assert_eq!(
            err,
            PayloadError::LengthMismatch {
                what: "monitors config",
                declared: 68,
                actual: 28
            }
        );
        assert!(matches!(
            MonitorsConfig::parse(&[1, 0]),
            Err(PayloadError::Truncated { .. })
        ));
    }

    #[test]
    fn test_monitors_config_huge_count_does_not_overflow() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&u32::MAX.to_le_bytes());
        wire.extend_from_slice(&0u32.to_le_bytes());
        assert!(MonitorsConfig::parse(&wire).is_err());
    }

    #[test]
    fn test_file_xfer_data_size_must_match() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&9u32.to_le_bytes());
        wire.extend_from_slice(&3u64.to_le_bytes());
        wire.extend_from_slice(b"abc");
        let chunk = FileXferData::parse(&wire).unwrap();
        assert_eq!(chunk.id, 9);
        assert_eq!(chunk.data, b"abc");

        wire.push(b'd');
        assert!(matches!(
            FileXferData::parse(&wire),
            Err(PayloadError::LengthMismatch { .. })
        ));
        assert_eq!(peek_xfer_id(&wire), Some(9));
        assert_eq!(peek_xfer_id(&[1]), None);
    }

    #[test]
    fn test_file_xfer_start_and_status() {
        let mut wire = 5u32.to_le_bytes().to_vec();
        wire.extend_from_slice(b"[vdagent-file-xfer]");
        let start = FileXferStart::parse(&wire).unwrap();
        assert_eq!(start.id, 5);
        assert!(start.data.starts_with(b"[vdagent"));

        let mut wire = 5u32.to_le_bytes().to_vec();
        wire.extend_from_slice(&1u32.to_le_bytes());
        let status = FileXferStatus::parse(&wire).unwrap();
        assert_eq!(status.code(), Some(FileXferStatusCode::Cancelled));
        assert!(FileXferStatus::parse(&wire[..6]).is_err());
    }

    #[test]
    fn test_audio_volume_sync() {
        let sync = AudioVolumeSync {
            is_playback: true,
            mute: false,
            volumes: vec![0x1234, 0xFFFF],
        };
        let wire = sync.encode();
        assert_eq!(wire, vec![1, 0, 2, 0x34, 0x12, 0xFF, 0xFF]);
        assert_eq!(AudioVolumeSync::parse(&wire).unwrap(), sync);
        assert!(AudioVolumeSync::parse(&wire[..5]).is_err());
    }

    #[test]
    fn test_guest_resolution_list() {
        let list = vec![
            GuestResolution {
                width: 1920,
                height: 1080,
                x: 0,
                y: 0,
                display_id: 0,
            },
            GuestResolution {
                width: 800,
                height: 600,
                x: 1920,
                y: 0,
                display_id: 1,
            },
        ];
        let wire = GuestResolution::encode_list(&list);
        assert_eq!(GuestResolution::parse_list(&wire).unwrap(), list);
        assert!(GuestResolution::parse_list(&wire[..21]).is_err());
    }

    #[test]
    fn test_type_list() {
        let wire = encode_type_list(&[ClipboardType::Utf8Text, ClipboardType::Png]);
        assert_eq!(parse_type_list(&wire).unwrap(), vec![1, 2]);
        let mut odd = wire.clone();
        odd.push(9);
        assert_eq!(parse_type_list(&odd).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_enum_mappings() {
        assert_eq!(Selection::from_u32(1), Some(Selection::Primary));
        assert_eq!(Selection::from_u32(42), None);
        assert_eq!(ClipboardType::from_u32(5), Some(ClipboardType::Jpg));
        assert_eq!(ClipboardType::from_u32(6), None);
        assert_eq!(FileXferStatusCode::Disabled.as_u32(), 7);
        assert_eq!(FileXferStatusCode::from_u32(8), None);
    }
}
