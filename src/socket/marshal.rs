//! Cross-thread writes onto the event loop's connections.
//!
//! Connections are only ever touched by the loop thread. Code running
//! elsewhere (UI callbacks, worker threads) holds a [`WriteHandle`], which
//! pushes frames into a bounded channel and pokes a wake socket so the loop
//! leaves its poll. The loop owns the [`Mailbox`], registers its descriptor
//! for reading, and drains it at the top of every iteration before it
//! processes any other readiness.
//!
//! ```text
//! worker thread ──send()──► sync_channel ──► Mailbox::drain() ──► Connection::write()
//!               ──1 byte──► wake socket  ──► poll() wakes the loop
//! ```

use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use super::connection::{Connection, FrameSink};
use super::framing::MAX_MESSAGE_SIZE;
use super::server::{Clients, ConnId};
use crate::error::TransportError;

/// Where a marshaled frame goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Every live connection. On the client side, the single connection.
    All,
    /// One server-side connection.
    One(ConnId),
}

/// A frame waiting to be queued by the loop thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    /// Target connection(s).
    pub destination: Destination,
    /// Message type.
    pub msg_type: u32,
    /// First argument.
    pub arg1: u32,
    /// Second argument.
    pub arg2: u32,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl OutboundFrame {
    /// Queue this frame on the server's connection set.
    pub fn write_to_clients(&self, clients: &mut Clients) -> Result<(), TransportError> {
        match self.destination {
            Destination::All => clients.broadcast(self.msg_type, self.arg1, self.arg2, &self.payload),
            Destination::One(id) => clients.write(id, self.msg_type, self.arg1, self.arg2, &self.payload),
        }
    }

    /// Queue this frame on a single connection, ignoring the destination.
    pub fn write_to<S>(&self, conn: &mut Connection<S>) -> Result<(), TransportError> {
        conn.write(self.msg_type, self.arg1, self.arg2, &self.payload)
    }
}

type Envelope = (OutboundFrame, Option<SyncSender<()>>);

/// Thread-safe sender of frames to the loop thread.
#[derive(Clone)]
pub struct WriteHandle {
    tx: SyncSender<Envelope>,
    wake: Arc<UnixStream>,
    loop_thread: ThreadId,
}

impl fmt::Debug for WriteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteHandle")
            .field("loop_thread", &self.loop_thread)
            .finish_non_exhaustive()
    }
}

/// Loop-side end of the channel.
pub struct Mailbox {
    rx: Receiver<Envelope>,
    wake: UnixStream,
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("wake_fd", &self.wake.as_raw_fd())
            .finish_non_exhaustive()
    }
}

/// Create a channel holding at most `capacity` pending frames.
///
/// Must be called on the thread that will drain the [`Mailbox`].
pub fn channel(capacity: usize) -> io::Result<(WriteHandle, Mailbox)> {
    let (wake_tx, wake_rx) = UnixStream::pair()?;
    wake_tx.set_nonblocking(true)?;
    wake_rx.set_nonblocking(true)?;
    let (tx, rx) = mpsc::sync_channel(capacity);
    Ok((
        WriteHandle {
            tx,
            wake: Arc::new(wake_tx),
            loop_thread: thread::current().id(),
        },
        Mailbox { rx, wake: wake_rx },
    ))
}

impl WriteHandle {
    /// Hand a frame to the loop thread.
    ///
    /// Blocks only while the channel is full.
    pub fn send(
        &self,
        destination: Destination,
        msg_type: u32,
        arg1: u32,
        arg2: u32,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.post(destination, msg_type, arg1, arg2, payload, None)
    }

    /// Hand a frame to the loop thread and wait until it has been queued on
    /// its connection.
    ///
    /// On the loop thread itself this cannot wait (the loop is the one that
    /// would have to wake us) and behaves like [`send`](Self::send).
    pub fn send_and_wait(
        &self,
        destination: Destination,
        msg_type: u32,
        arg1: u32,
        arg2: u32,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if thread::current().id() == self.loop_thread {
            return self.send(destination, msg_type, arg1, arg2, payload);
        }
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        self.post(destination, msg_type, arg1, arg2, payload, Some(ack_tx))?;
        ack_rx.recv().map_err(|_| TransportError::LoopClosed)
    }

    fn post(
        &self,
        destination: Destination,
        msg_type: u32,
        arg1: u32,
        arg2: u32,
        payload: &[u8],
        ack: Option<SyncSender<()>>,
    ) -> Result<(), TransportError> {
        if payload.len() > MAX_MESSAGE_SIZE as usize {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        let frame = OutboundFrame {
            destination,
            msg_type,
            arg1,
            arg2,
            payload: payload.to_vec(),
        };
        self.tx
            .send((frame, ack))
            .map_err(|_| TransportError::LoopClosed)?;

        match (&*self.wake).write(&[1]) {
            Ok(_) => Ok(()),
            // A full wake buffer already guarantees a wakeup.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(TransportError::Io(e)),
        }
    }
}

impl FrameSink for WriteHandle {
    fn send_frame(
        &mut self,
        msg_type: u32,
        arg1: u32,
        arg2: u32,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.send_and_wait(Destination::All, msg_type, arg1, arg2, payload)
    }
}

impl Mailbox {
    /// Take every pending frame, in send order, and hand each to `deliver`.
    /// A waiting sender is released once `deliver` returns for its frame.
    ///
    /// Returns the number of frames delivered.
    pub fn drain<F>(&mut self, mut deliver: F) -> usize
    where
        F: FnMut(OutboundFrame),
    {
        let mut scratch = [0u8; 64];
        loop {
            match self.wake.read(&mut scratch) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }

        let mut delivered = 0;
        loop {
            match self.rx.try_recv() {
                Ok((frame, ack)) => {
                    deliver(frame);
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    delivered += 1;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return delivered,
            }
        }
    }
}

impl AsRawFd for Mailbox {
    fn as_raw_fd(&self) -> RawFd {
        self.wake.as_raw_fd()
    }
}
