//! One framed, bidirectional channel over a non-blocking byte stream.
//!
//! A `Connection` never blocks and never loops on the stream. The owning
//! event loop calls [`Connection::read_ready`] when the descriptor is
//! readable and [`Connection::write_ready`] when it is writable; each call
//! performs at most one `read(2)`/`write(2)` and reports what happened.
//!
//! Inbound bytes are assembled by a small state machine: the connection is
//! either filling the 16-byte header or filling the payload the header
//! announced, never both. Outbound frames are queued whole (header and
//! payload in one buffer) and drained strictly in `write` order.
//!
//! The connection does not own callbacks. Completed messages and fatal
//! errors are returned to the caller, who decides what to dispatch and when
//! to drop the connection.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};

use super::framing::{self, Message, MessageHeader, HEADER_SIZE, MAX_MESSAGE_SIZE};
use crate::error::{ConnectionError, TransportError};

/// Source of process-unique connection labels.
static NEXT_LABEL: AtomicU64 = AtomicU64::new(1);

/// Scratch size used while discarding a payload we could not buffer.
const DISCARD_CHUNK: usize = 4096;

/// OS-reported identity of the peer process (server side only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCred {
    /// Process id of the peer.
    pub pid: i32,
    /// Effective user id.
    pub uid: u32,
    /// Effective group id.
    pub gid: u32,
}

/// Result of a single read step.
#[derive(Debug)]
pub enum ReadOutcome {
    /// The stream had nothing for us. Wait for the next readiness event.
    Blocked,
    /// Bytes were consumed but no message is complete yet.
    Progress,
    /// A full message arrived. Read state is back to "awaiting header".
    Message(Message),
}

/// Result of a single write step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The stream accepted nothing. Wait for writability.
    Blocked,
    /// Some bytes went out and more are queued.
    Progress,
    /// The outbound queue is empty.
    Drained,
}

/// Something a complete frame can be written to.
///
/// Implemented by [`Connection`] for loop-thread writes and by
/// [`WriteHandle`](super::marshal::WriteHandle) for writes from other threads.
pub trait FrameSink {
    /// Queue one frame for transmission.
    fn send_frame(
        &mut self,
        msg_type: u32,
        arg1: u32,
        arg2: u32,
        payload: &[u8],
    ) -> Result<(), TransportError>;
}

#[derive(Debug)]
enum ReadState {
    Header {
        buf: [u8; HEADER_SIZE],
        filled: usize,
    },
    Payload {
        header: MessageHeader,
        buf: Vec<u8>,
        filled: usize,
    },
    /// Payload could not be allocated; its bytes are consumed and dropped.
    Discard {
        header: MessageHeader,
        remaining: usize,
    },
}

impl Default for ReadState {
    fn default() -> Self {
        Self::Header {
            buf: [0u8; HEADER_SIZE],
            filled: 0,
        }
    }
}

/// One encoded frame and how much of it has been written.
struct OutboundFrame {
    bytes: Vec<u8>,
    written: usize,
}

/// A framed channel over `S`.
pub struct Connection<S = UnixStream> {
    stream: S,
    label: String,
    debug: bool,
    read_state: ReadState,
    outbound: VecDeque<OutboundFrame>,
    peer: Option<PeerCred>,
    user_data: Option<Box<dyn Any + Send>>,
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("label", &self.label)
            .field("queued_frames", &self.outbound.len())
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl Connection<UnixStream> {
    /// Wrap a connected Unix stream, switching it to non-blocking mode.
    pub fn new(stream: UnixStream, debug: bool) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::from_stream(stream, debug))
    }
}

impl<S> Connection<S> {
    /// Wrap an arbitrary byte stream as-is.
    ///
    /// The stream should already be non-blocking; a blocking stream makes
    /// every step a potential stall.
    pub fn from_stream(stream: S, debug: bool) -> Self {
        let n = NEXT_LABEL.fetch_add(1, Ordering::Relaxed);
        Self {
            stream,
            label: format!("conn-{n}"),
            debug,
            read_state: ReadState::default(),
            outbound: VecDeque::new(),
            peer: None,
            user_data: None,
        }
    }

    /// Label used in log lines.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn set_label(&mut self, label: String) {
        self.label = label;
    }

    /// Whether per-message tracing is on.
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Peer credentials captured at accept time.
    pub fn peer(&self) -> Option<PeerCred> {
        self.peer
    }

    pub(crate) fn set_peer(&mut self, peer: PeerCred) {
        self.peer = Some(peer);
    }

    /// True while outbound bytes are queued. Integrations register write
    /// interest only while this holds.
    pub fn wants_write(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Number of frames not yet fully written.
    pub fn queued_frames(&self) -> usize {
        self.outbound.len()
    }

    /// Attach arbitrary per-connection data, replacing any previous value.
    pub fn set_user_data<T: Any + Send>(&mut self, data: T) {
        self.user_data = Some(Box::new(data));
    }

    /// Borrow the user data if it is a `T`.
    pub fn user_data<T: Any>(&self) -> Option<&T> {
        self.user_data.as_ref()?.downcast_ref::<T>()
    }

    /// Mutably borrow the user data if it is a `T`.
    pub fn user_data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.user_data.as_mut()?.downcast_mut::<T>()
    }

    /// Remove and return the user data if it is a `T`.
    pub fn take_user_data<T: Any>(&mut self) -> Option<T> {
        match self.user_data.take()?.downcast::<T>() {
            Ok(data) => Some(*data),
            Err(other) => {
                self.user_data = Some(other);
                None
            }
        }
    }

    /// Underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Queue one frame behind everything already queued.
    pub fn write(
        &mut self,
        msg_type: u32,
        arg1: u32,
        arg2: u32,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let bytes = framing::encode(msg_type, arg1, arg2, payload)?;
        if self.debug {
            let header = MessageHeader {
                msg_type,
                arg1,
                arg2,
                size: payload.len() as u32,
            };
            framing::trace_header(&self.label, &header, "sent");
        }
        self.outbound.push_back(OutboundFrame { bytes, written: 0 });
        Ok(())
    }

    fn complete(&self, header: MessageHeader, payload: Vec<u8>) -> ReadOutcome {
        if self.debug {
            framing::trace_header(&self.label, &header, "received");
        }
        ReadOutcome::Message(Message { header, payload })
    }
}

impl<S: Read + Write> Connection<S> {
    /// Perform one non-blocking read attempt.
    ///
    /// # Errors
    ///
    /// Any error means the connection is finished: peer closed, the socket
    /// failed, or the header announced an impossible payload size.
    pub fn read_ready(&mut self) -> Result<ReadOutcome, ConnectionError> {
        match &mut self.read_state {
            ReadState::Header { buf, filled } => {
                let Some(n) = read_some(&mut self.stream, &mut buf[*filled..])? else {
                    return Ok(ReadOutcome::Blocked);
                };
                *filled += n;
                if *filled < HEADER_SIZE {
                    return Ok(ReadOutcome::Progress);
                }

                let header = framing::decode_header(buf);
                if header.size > MAX_MESSAGE_SIZE {
                    return Err(ConnectionError::Oversized {
                        size: header.size,
                        max: MAX_MESSAGE_SIZE,
                    });
                }
                if header.size == 0 {
                    self.read_state = ReadState::default();
                    return Ok(self.complete(header, Vec::new()));
                }

                let size = header.size as usize;
                let mut payload = Vec::new();
                if payload.try_reserve_exact(size).is_err() {
                    log::error!(
                        "{}: out of memory allocating {} byte {} payload, skipping message",
                        self.label,
                        size,
                        header.type_name()
                    );
                    self.read_state = ReadState::Discard {
                        header,
                        remaining: size,
                    };
                    return Ok(ReadOutcome::Progress);
                }
                payload.resize(size, 0);
                self.read_state = ReadState::Payload {
                    header,
                    buf: payload,
                    filled: 0,
                };
                Ok(ReadOutcome::Progress)
            }
            ReadState::Payload {
                header,
                buf,
                filled,
            } => {
                let Some(n) = read_some(&mut self.stream, &mut buf[*filled..])? else {
                    return Ok(ReadOutcome::Blocked);
                };
                *filled += n;
                if *filled < buf.len() {
                    return Ok(ReadOutcome::Progress);
                }
                let header = *header;
                let payload = std::mem::take(buf);
                self.read_state = ReadState::default();
                Ok(self.complete(header, payload))
            }
            ReadState::Discard { header, remaining } => {
                let mut scratch = [0u8; DISCARD_CHUNK];
                let want = (*remaining).min(DISCARD_CHUNK);
                let Some(n) = read_some(&mut self.stream, &mut scratch[..want])? else {
                    return Ok(ReadOutcome::Blocked);
                };
                *remaining -= n;
                if *remaining == 0 {
                    log::warn!("{}: dropped unbuffered {} message", self.label, header.type_name());
                    self.read_state = ReadState::default();
                }
                Ok(ReadOutcome::Progress)
            }
        }
    }

    /// Perform one non-blocking write attempt from the head of the queue.
    ///
    /// # Errors
    ///
    /// Any error means the connection is finished.
    pub fn write_ready(&mut self) -> Result<WriteOutcome, ConnectionError> {
        let Some(head) = self.outbound.front_mut() else {
            return Ok(WriteOutcome::Drained);
        };

        match self.stream.write(&head.bytes[head.written..]) {
            Ok(0) => {
                return Err(ConnectionError::Write(io::Error::from(
                    io::ErrorKind::WriteZero,
                )))
            }
            Ok(n) => head.written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(WriteOutcome::Blocked),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(WriteOutcome::Progress),
            Err(e) => return Err(ConnectionError::Write(e)),
        }

        if head.written == head.bytes.len() {
            self.outbound.pop_front();
        }
        if self.outbound.is_empty() {
            Ok(WriteOutcome::Drained)
        } else {
            Ok(WriteOutcome::Progress)
        }
    }
}

impl<S: Read + Write> FrameSink for Connection<S> {
    fn send_frame(
        &mut self,
        msg_type: u32,
        arg1: u32,
        arg2: u32,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.write(msg_type, arg1, arg2, payload)
    }
}

impl<S: AsRawFd> AsRawFd for Connection<S> {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// One read attempt. `Ok(None)` is would-block, `Ok(Some(0))` is an
/// interrupted call.
fn read_some<S: Read>(stream: &mut S, buf: &mut [u8]) -> Result<Option<usize>, ConnectionError> {
    match stream.read(buf) {
        Ok(0) => Err(ConnectionError::Closed),
        Ok(n) => Ok(Some(n)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(Some(0)),
        Err(e) => Err(ConnectionError::Read(e)),
    }
}
