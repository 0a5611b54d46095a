//! Routing of daemon messages to the agent's session collaborators.
//!
//! The transport knows nothing about clipboards or monitors; it hands the
//! dispatcher a numeric type and an opaque payload. The dispatcher parses
//! the payload for that type and calls the matching collaborator. Outbound
//! events go the other way through [`SessionEvents`], which any
//! [`FrameSink`] gets for free.
//!
//! Collaborators are optional. A message for one that is not installed is
//! logged and dropped, except where the daemon expects an answer (clipboard
//! requests, file transfers), which get an explicit negative reply.

pub mod messages;

use std::fmt;

use crate::error::TransportError;
use crate::socket::connection::FrameSink;
use crate::socket::framing::{Message, MessageType};

use messages::{
    encode_type_list, parse_type_list, peek_xfer_id, AudioVolumeSync, ClipboardType,
    FileXferData, FileXferStart, FileXferStatus, FileXferStatusCode, GuestResolution,
    MonitorsConfig, Selection,
};

/// Session clipboard.
pub trait Clipboard {
    /// The host owns `selection` and offers these types.
    fn grab(&mut self, selection: Selection, types: &[u32]);

    /// The host wants our `selection` as `data_type`. Return `false` when
    /// it cannot be served; the dispatcher then answers with empty data.
    fn request(&mut self, selection: Selection, data_type: u32) -> bool;

    /// Data for an earlier request of ours.
    fn data(&mut self, selection: Selection, data_type: u32, data: &[u8]);

    /// The host released `selection`.
    fn release(&mut self, selection: Selection);

    /// Drop ownership of every selection (remote client went away).
    fn release_all(&mut self);
}

/// Session display configuration.
pub trait Display {
    /// Apply a monitor layout requested by the host.
    fn set_monitor_config(&mut self, config: &MonitorsConfig);

    /// Graphics device information for mapping host display ids.
    fn graphics_device_info(&mut self, data: &[u8]) {
        let _ = data;
    }
}

/// File transfers into the session.
pub trait FileXfers {
    /// Begin a transfer.
    fn start(&mut self, msg: FileXferStart);
    /// Status update from the host.
    fn status(&mut self, msg: FileXferStatus);
    /// Next chunk of a transfer.
    fn data(&mut self, msg: FileXferData);
    /// Abort every open transfer.
    fn reset(&mut self);
}

/// Session audio mixer.
pub trait Audio {
    /// Apply host playback volume.
    fn playback_sync(&mut self, mute: bool, volumes: &[u16]);
    /// Apply host record volume.
    fn record_sync(&mut self, mute: bool, volumes: &[u16]);
}

/// What the transport owner should do after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep going.
    Continue,
    /// The daemon runs a different build. Drop the connection and restart.
    VersionMismatch,
}

/// Routes inbound messages to collaborators.
pub struct Dispatcher {
    version: String,
    clipboard: Option<Box<dyn Clipboard>>,
    display: Option<Box<dyn Display>>,
    file_xfers: Option<Box<dyn FileXfers>>,
    file_xfers_enabled: bool,
    audio: Option<Box<dyn Audio>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("version", &self.version)
            .field("clipboard", &self.clipboard.is_some())
            .field("display", &self.display.is_some())
            .field("file_xfers", &self.file_xfers_active())
            .field("audio", &self.audio.is_some())
            .finish()
    }
}

impl Dispatcher {
    /// Dispatcher expecting the daemon to report `version`.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            clipboard: None,
            display: None,
            file_xfers: None,
            file_xfers_enabled: true,
            audio: None,
        }
    }

    /// Install the clipboard collaborator.
    #[must_use]
    pub fn with_clipboard(mut self, clipboard: Box<dyn Clipboard>) -> Self {
        self.clipboard = Some(clipboard);
        self
    }

    /// Install the display collaborator.
    #[must_use]
    pub fn with_display(mut self, display: Box<dyn Display>) -> Self {
        self.display = Some(display);
        self
    }

    /// Install the file transfer collaborator.
    #[must_use]
    pub fn with_file_xfers(mut self, file_xfers: Box<dyn FileXfers>) -> Self {
        self.file_xfers = Some(file_xfers);
        self
    }

    /// Install the audio collaborator.
    #[must_use]
    pub fn with_audio(mut self, audio: Box<dyn Audio>) -> Self {
        self.audio = Some(audio);
        self
    }

    /// Version string this agent was built as.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Whether file transfers are currently accepted.
    pub fn file_xfers_active(&self) -> bool {
        self.file_xfers_enabled && self.file_xfers.is_some()
    }

    /// The transport went away: reset everything scoped to the session and
    /// re-enable file transfers for the next one.
    pub fn session_ended(&mut self) {
        if let Some(clipboard) = self.clipboard.as_mut() {
            clipboard.release_all();
        }
        if let Some(xfers) = self.file_xfers.as_mut() {
            xfers.reset();
        }
        self.file_xfers_enabled = true;
    }

    /// Route one message. Replies, if any, are written to `sink`.
    pub fn dispatch<W: FrameSink + ?Sized>(&mut self, sink: &mut W, message: Message) -> Disposition {
        let header = message.header;
        let Some(kind) = header.kind() else {
            log::warn!(
                "[Dispatch] Unknown message from daemon type: {}, ignoring",
                header.msg_type
            );
            return Disposition::Continue;
        };
        let payload = message.payload;

        match kind {
            MessageType::Version => return self.check_version(&payload),
            MessageType::MonitorsConfig => match MonitorsConfig::parse(&payload) {
                Ok(config) => match self.display.as_mut() {
                    Some(display) => display.set_monitor_config(&config),
                    None => missing("display", kind),
                },
                Err(e) => log::warn!("[Dispatch] Dropping {}: {e}", kind.name()),
            },
            MessageType::GraphicsDeviceInfo => match self.display.as_mut() {
                Some(display) => display.graphics_device_info(&payload),
                None => missing("display", kind),
            },
            MessageType::ClipboardGrab => match (self.clipboard.as_mut(), selection(kind, header.arg1)) {
                (Some(clipboard), Some(sel)) => match parse_type_list(&payload) {
                    Ok(types) => clipboard.grab(sel, &types),
                    Err(e) => log::error!("[Dispatch] Dropping {}: {e}", kind.name()),
                },
                (None, _) => missing("clipboard", kind),
                (Some(_), None) => {}
            },
            MessageType::ClipboardRequest => {
                let served = match (self.clipboard.as_mut(), selection(kind, header.arg1)) {
                    (Some(clipboard), Some(sel)) => clipboard.request(sel, header.arg2),
                    (None, _) => {
                        missing("clipboard", kind);
                        false
                    }
                    (Some(_), None) => false,
                };
                if !served {
                    reply(sink, MessageType::ClipboardData, header.arg1, ClipboardType::None.as_u32());
                }
            }
            MessageType::ClipboardData => match (self.clipboard.as_mut(), selection(kind, header.arg1)) {
                (Some(clipboard), Some(sel)) => clipboard.data(sel, header.arg2, &payload),
                (None, _) => missing("clipboard", kind),
                (Some(_), None) => {}
            },
            MessageType::ClipboardRelease => match (self.clipboard.as_mut(), selection(kind, header.arg1)) {
                (Some(clipboard), Some(sel)) => clipboard.release(sel),
                (None, _) => missing("clipboard", kind),
                (Some(_), None) => {}
            },
            MessageType::AudioVolumeSync => match AudioVolumeSync::parse(&payload) {
                Ok(sync) => match self.audio.as_mut() {
                    Some(audio) if sync.is_playback => audio.playback_sync(sync.mute, &sync.volumes),
                    Some(audio) => audio.record_sync(sync.mute, &sync.volumes),
                    None => missing("audio", kind),
                },
                Err(e) => log::warn!("[Dispatch] Dropping {}: {e}", kind.name()),
            },
            MessageType::FileXferStart | MessageType::FileXferStatus | MessageType::FileXferData => {
                self.file_xfer(sink, kind, &payload);
            }
            MessageType::FileXferDisable => {
                log::debug!("[Dispatch] Disabling file-xfers");
                if let Some(xfers) = self.file_xfers.as_mut() {
                    xfers.reset();
                }
                self.file_xfers_enabled = false;
            }
            MessageType::ClientDisconnected => {
                log::debug!("[Dispatch] Remote client disconnected, resetting session state");
                if let Some(clipboard) = self.clipboard.as_mut() {
                    clipboard.release_all();
                }
                if self.file_xfers_enabled {
                    if let Some(xfers) = self.file_xfers.as_mut() {
                        xfers.reset();
                    }
                }
            }
            MessageType::GuestXorgResolution => {
                log::debug!("[Dispatch] Ignoring {} sent to the agent", kind.name());
            }
        }
        Disposition::Continue
    }

    fn check_version(&self, payload: &[u8]) -> Disposition {
        let end = payload.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        let theirs = &payload[..end];
        if theirs == self.version.as_bytes() {
            log::debug!("[Dispatch] Daemon version {} matches", self.version);
            return Disposition::Continue;
        }
        log::info!(
            "[Dispatch] Daemon version mismatch: got {} expected {}",
            String::from_utf8_lossy(theirs),
            self.version
        );
        Disposition::VersionMismatch
    }

    fn file_xfer<W: FrameSink + ?Sized>(&mut self, sink: &mut W, kind: MessageType, payload: &[u8]) {
        let enabled = self.file_xfers_enabled;
        let xfers = match self.file_xfers.as_mut() {
            Some(xfers) if enabled => xfers,
            _ => {
                match peek_xfer_id(payload) {
                    Some(id) => {
                        log::debug!("[Dispatch] File transfer {id} refused: disabled");
                        reply(sink, MessageType::FileXferStatus, id, FileXferStatusCode::Disabled.as_u32());
                    }
                    None => log::warn!("[Dispatch] Dropping {}: no transfer id", kind.name()),
                }
                return;
            }
        };

        let parsed = match kind {
            MessageType::FileXferStart => FileXferStart::parse(payload).map(|m| xfers.start(m)),
            MessageType::FileXferStatus => FileXferStatus::parse(payload).map(|m| xfers.status(m)),
            _ => FileXferData::parse(payload).map(|m| xfers.data(m)),
        };
        if let Err(e) = parsed {
            log::warn!("[Dispatch] Dropping {}: {e}", kind.name());
        }
    }
}

fn missing(collaborator: &str, kind: MessageType) {
    log::warn!(
        "[Dispatch] No {collaborator} handler installed, dropping {}",
        kind.name()
    );
}

/// Selection named by `arg1`, or `None` (logged) when it is not one we know.
fn selection(kind: MessageType, raw: u32) -> Option<Selection> {
    let sel = Selection::from_u32(raw);
    if sel.is_none() {
        log::warn!("[Dispatch] Dropping {} for unknown selection {raw}", kind.name());
    }
    sel
}

fn reply<W: FrameSink + ?Sized>(sink: &mut W, kind: MessageType, arg1: u32, arg2: u32) {
    if let Err(e) = sink.send_frame(kind.as_u32(), arg1, arg2, &[]) {
        log::error!("[Dispatch] Could not send {}: {e}", kind.name());
    }
}

/// Outbound session events, available on every [`FrameSink`].
pub trait SessionEvents: FrameSink {
    /// We own `selection` and offer `types`.
    fn clipboard_grab(&mut self, selection: Selection, types: &[ClipboardType]) -> Result<(), TransportError> {
        self.send_frame(
            MessageType::ClipboardGrab.as_u32(),
            selection.as_u32(),
            0,
            &encode_type_list(types),
        )
    }

    /// Ask the host for its `selection` as `data_type`.
    fn clipboard_request(&mut self, selection: Selection, data_type: ClipboardType) -> Result<(), TransportError> {
        self.send_frame(
            MessageType::ClipboardRequest.as_u32(),
            selection.as_u32(),
            data_type.as_u32(),
            &[],
        )
    }

    /// Answer a host request.
    fn clipboard_data(
        &mut self,
        selection: Selection,
        data_type: ClipboardType,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.send_frame(
            MessageType::ClipboardData.as_u32(),
            selection.as_u32(),
            data_type.as_u32(),
            data,
        )
    }

    /// We no longer own `selection`.
    fn clipboard_release(&mut self, selection: Selection) -> Result<(), TransportError> {
        self.send_frame(MessageType::ClipboardRelease.as_u32(), selection.as_u32(), 0, &[])
    }

    /// Report the session's screen geometry.
    fn guest_resolution(
        &mut self,
        width: u32,
        height: u32,
        screens: &[GuestResolution],
    ) -> Result<(), TransportError> {
        self.send_frame(
            MessageType::GuestXorgResolution.as_u32(),
            width,
            height,
            &GuestResolution::encode_list(screens),
        )
    }

    /// Report the outcome of a transfer.
    fn file_xfer_status(&mut self, id: u32, status: FileXferStatusCode) -> Result<(), TransportError> {
        self.send_frame(MessageType::FileXferStatus.as_u32(), id, status.as_u32(), &[])
    }
}

impl<T: FrameSink + ?Sized> SessionEvents for T {}
