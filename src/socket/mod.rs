//! Unix domain socket transport between the system daemon and session
//! agents.
//!
//! One daemon listens on a well-known socket path; each desktop session runs
//! an agent that connects to it. Both ends exchange the same fixed-header
//! frames over non-blocking streams and are driven by an event loop the
//! caller owns.
//!
//! # Architecture
//!
//! ```text
//! Daemon Process                       Agent Process (one per session)
//! ┌──────────────────┐                ┌──────────────────┐
//! │ Server<H>        │                │ Reconnector      │
//! │  UnixListener    │◄──────────────►│  Connection      │
//! │  Clients arena   │  frames over   │  Dispatcher      │
//! │  Connection/peer │  Unix socket   │                  │
//! └────────┬─────────┘                └────────┬─────────┘
//!          │ ServerHandler callbacks           │ Disposition
//!          ▼                                   ▼
//!   FdSet poll loop or watch::serve      FdSet poll loop
//!          ▲                                   ▲
//!          └── Mailbox ◄── WriteHandle (other threads) ──┘
//! ```
//!
//! # Wire Protocol
//!
//! Each frame is a 16-byte header of four little-endian `u32`s
//! `[type][arg1][arg2][size]` followed by `size` payload bytes. Payloads
//! larger than [`framing::MAX_MESSAGE_SIZE`] are refused on both ends. The
//! transport treats the type and payload as opaque; the meaning of each
//! type lives in [`crate::dispatch`].
//!
//! See [`framing`] for the header codec and the message type table.

pub mod client;
pub mod connection;
pub mod framing;
pub mod marshal;
pub mod reactor;
pub mod server;
pub mod watch;
