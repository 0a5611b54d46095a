//! Multi-client Unix domain socket server.
//!
//! The server owns a listening socket and the set of live connections. It
//! does not run an event loop of its own. An integration layer (a
//! [`FdSet`] poll loop or the tokio watch driver in [`super::watch`]) tells
//! it which descriptors are ready, and the server runs the matching step
//! functions and delivers [`ServerHandler`] callbacks.
//!
//! # Connection handles
//!
//! Connections live in an arena and are addressed by [`ConnId`], an index
//! plus a generation counter. Destroying a connection bumps its slot's
//! generation, so a handle kept past destruction simply stops resolving
//! instead of aliasing whatever connection reuses the slot.
//!
//! # Destruction during callbacks
//!
//! Handlers receive `&mut Clients` and may destroy any connection, including
//! the one whose callback is running. Destruction unlinks the connection
//! from the live set at once; the connection itself is parked and its
//! `on_disconnect` runs right after the current callback returns, with the
//! connection still intact so its user data can be inspected.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use super::connection::{Connection, PeerCred, ReadOutcome, WriteOutcome};
use super::framing::{message_type_name, Message, MAX_MESSAGE_SIZE};
use super::marshal::OutboundFrame;
use super::reactor::FdSet;
use crate::error::{ConnectionError, TransportError};

/// Size of `sockaddr_un.sun_path` (including the terminating NUL).
#[cfg(target_os = "linux")]
pub const MAX_SOCKET_PATH: usize = 108;
/// Size of `sockaddr_un.sun_path` (including the terminating NUL).
#[cfg(not(target_os = "linux"))]
pub const MAX_SOCKET_PATH: usize = 104;

/// Stable handle to a server-side connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId {
    index: u32,
    generation: u32,
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}.{}", self.index, self.generation)
    }
}

/// What the integration layer should do after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// More work may be possible right away.
    Continue,
    /// Wait for the next readiness notification.
    WouldBlock,
}

/// Application callbacks for a [`Server`].
pub trait ServerHandler {
    /// A peer connected and passed the credential check.
    fn on_connect(&mut self, clients: &mut Clients, id: ConnId) {
        let _ = (clients, id);
    }

    /// A complete message arrived on `id`.
    fn on_message(&mut self, clients: &mut Clients, id: ConnId, message: Message);

    /// `id` was destroyed. Called exactly once per connection, before the
    /// connection is dropped. `id` no longer resolves in `clients`.
    fn on_disconnect(&mut self, clients: &mut Clients, id: ConnId, conn: &mut Connection) {
        let _ = (clients, id, conn);
    }
}

struct Entry {
    conn: Connection,
    prev: Option<u32>,
    next: Option<u32>,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// The live connection set.
///
/// Iteration follows insertion order. Order carries no meaning beyond being
/// stable.
pub struct Clients {
    slots: Vec<Slot>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
    closed: VecDeque<(ConnId, Connection)>,
}

impl fmt::Debug for Clients {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clients")
            .field("live", &self.len)
            .field("pending_disconnects", &self.closed.len())
            .finish_non_exhaustive()
    }
}

impl Clients {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
            closed: VecDeque::new(),
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no connection is live.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `id` still names a live connection.
    pub fn contains(&self, id: ConnId) -> bool {
        self.get(id).is_some()
    }

    /// Live handles in insertion order.
    pub fn ids(&self) -> Vec<ConnId> {
        let mut ids = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let slot = &self.slots[index as usize];
            ids.push(ConnId {
                index,
                generation: slot.generation,
            });
            cursor = slot.entry.as_ref().and_then(|e| e.next);
        }
        ids
    }

    /// Borrow a live connection.
    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref().map(|e| &e.conn)
    }

    /// Mutably borrow a live connection.
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut().map(|e| &mut e.conn)
    }

    /// Peer credentials of a live connection.
    pub fn peer(&self, id: ConnId) -> Option<PeerCred> {
        self.get(id)?.peer()
    }

    /// Queue a frame on one connection.
    pub fn write(
        &mut self,
        id: ConnId,
        msg_type: u32,
        arg1: u32,
        arg2: u32,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.get_mut(id)
            .ok_or(TransportError::UnknownConnection(id))?
            .write(msg_type, arg1, arg2, payload)
    }

    /// Queue the same frame on every live connection.
    ///
    /// Each connection gets its own encoded copy.
    pub fn broadcast(
        &mut self,
        msg_type: u32,
        arg1: u32,
        arg2: u32,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if payload.len() > MAX_MESSAGE_SIZE as usize {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        for id in self.ids() {
            self.write(id, msg_type, arg1, arg2, payload)?;
        }
        Ok(())
    }

    /// Call `f` once for each connection live at call start, skipping any
    /// that an earlier call destroyed. Returns the sum of `f`'s results.
    ///
    /// `f` may destroy any connection, including the one it was handed.
    pub fn for_each<F>(&mut self, mut f: F) -> usize
    where
        F: FnMut(&mut Clients, ConnId) -> usize,
    {
        let mut total = 0;
        for id in self.ids() {
            if self.contains(id) {
                total += f(self, id);
            }
        }
        total
    }

    /// Destroy a connection. Returns `false` if `id` was already gone.
    ///
    /// The connection leaves the live set immediately. Its `on_disconnect`
    /// is delivered once the running callback returns.
    pub fn destroy(&mut self, id: ConnId) -> bool {
        match self.remove(id) {
            Some(conn) => {
                self.closed.push_back((id, conn));
                true
            }
            None => false,
        }
    }

    fn insert(&mut self, conn: Connection) -> ConnId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let prev = self.tail;
        let slot = &mut self.slots[index as usize];
        slot.entry = Some(Entry {
            conn,
            prev,
            next: None,
        });
        let id = ConnId {
            index,
            generation: slot.generation,
        };

        match prev {
            Some(tail) => {
                if let Some(entry) = self.slots[tail as usize].entry.as_mut() {
                    entry.next = Some(index);
                }
            }
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
        id
    }

    fn remove(&mut self, id: ConnId) -> Option<Connection> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);

        match entry.prev {
            Some(prev) => {
                if let Some(e) = self.slots[prev as usize].entry.as_mut() {
                    e.next = entry.next;
                }
            }
            None => self.head = entry.next,
        }
        match entry.next {
            Some(next) => {
                if let Some(e) = self.slots[next as usize].entry.as_mut() {
                    e.prev = entry.prev;
                }
            }
            None => self.tail = entry.prev,
        }
        self.len -= 1;
        Some(entry.conn)
    }
}

/// Listening endpoint plus its live connections.
pub struct Server<H: ServerHandler> {
    listener: UnixListener,
    /// Set when we created the socket file and must remove it on drop.
    socket_path: Option<PathBuf>,
    clients: Clients,
    handler: H,
    debug: bool,
}

impl<H: ServerHandler> fmt::Debug for Server<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("socket_path", &self.socket_path)
            .field("clients", &self.clients)
            .finish_non_exhaustive()
    }
}

impl<H: ServerHandler> Server<H> {
    /// Bind and listen on `path`.
    ///
    /// Removes a stale socket file, binds, restricts the socket to its
    /// owner (0600) and switches the listener to non-blocking mode.
    pub fn bind(path: impl AsRef<Path>, handler: H, debug: bool) -> Result<Self, TransportError> {
        let path = path.as_ref();
        let len = path.as_os_str().len();
        if len >= MAX_SOCKET_PATH {
            return Err(TransportError::PathTooLong {
                path: path.to_path_buf(),
                len,
                max: MAX_SOCKET_PATH - 1,
            });
        }

        let bind_err = |source: io::Error| TransportError::Bind {
            path: path.to_path_buf(),
            source,
        };

        if path.exists() {
            std::fs::remove_file(path).map_err(bind_err)?;
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(bind_err)?;
            }
        }

        let listener = UnixListener::bind(path).map_err(bind_err)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;

        log::info!("[Server] Listening on {}", path.display());

        Ok(Self {
            listener,
            socket_path: Some(path.to_path_buf()),
            clients: Clients::new(),
            handler,
            debug,
        })
    }

    /// Adopt an already listening socket (e.g. socket activation).
    ///
    /// Takes ownership of `fd`. The socket file, if any, is left alone on
    /// drop.
    pub fn from_listener_fd(fd: RawFd, handler: H, debug: bool) -> Result<Self, TransportError> {
        if fd <= 0 {
            return Err(TransportError::InvalidFd(fd));
        }
        // SAFETY: the caller hands over a listening socket it owns; nothing
        // else closes `fd` after this point.
        let listener = unsafe { UnixListener::from_raw_fd(fd) };
        listener.set_nonblocking(true)?;
        log::info!("[Server] Using inherited listening socket fd {fd}");

        Ok(Self {
            listener,
            socket_path: None,
            clients: Clients::new(),
            handler,
            debug,
        })
    }

    /// Path of the bound socket file, if this server created it.
    pub fn socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }

    /// Listening descriptor.
    pub fn listener_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// The live connection set.
    pub fn clients(&self) -> &Clients {
        &self.clients
    }

    /// Application handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Application handler, mutably.
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// True when no connection is live.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Queue a frame on one connection.
    pub fn write(
        &mut self,
        id: ConnId,
        msg_type: u32,
        arg1: u32,
        arg2: u32,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.clients.write(id, msg_type, arg1, arg2, payload)
    }

    /// Queue the same frame on every live connection.
    pub fn broadcast(
        &mut self,
        msg_type: u32,
        arg1: u32,
        arg2: u32,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.clients.broadcast(msg_type, arg1, arg2, payload)
    }

    /// See [`Clients::for_each`]. Disconnect callbacks for connections `f`
    /// destroyed run after the pass completes.
    pub fn for_each<F>(&mut self, f: F) -> usize
    where
        F: FnMut(&mut Clients, ConnId) -> usize,
    {
        let total = self.clients.for_each(f);
        self.reap();
        total
    }

    /// Queue a frame handed over by a [`Mailbox`](super::marshal::Mailbox).
    ///
    /// Failures are logged; the sending thread has already moved on.
    pub fn deliver(&mut self, frame: &OutboundFrame) {
        if let Err(e) = frame.write_to_clients(&mut self.clients) {
            log::warn!("[Server] Dropping marshaled {} frame: {e}", message_type_name(frame.msg_type));
        }
    }

    /// Destroy a connection and deliver its `on_disconnect` now.
    pub fn destroy(&mut self, id: ConnId) -> bool {
        let destroyed = self.clients.destroy(id);
        self.reap();
        destroyed
    }

    /// Accept one pending connection.
    ///
    /// A peer whose credentials cannot be read is closed without being added
    /// to the set. Accept errors are logged and reported as `WouldBlock`.
    pub fn accept_ready(&mut self) -> Step {
        let stream = match self.listener.accept() {
            Ok((stream, _addr)) => stream,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Step::WouldBlock,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Step::Continue,
            Err(e) => {
                log::error!("[Server] accept: {e}");
                return Step::WouldBlock;
            }
        };

        let cred = match peer_credentials(&stream) {
            Ok(cred) => cred,
            Err(e) => {
                log::error!("[Server] Could not get peer credentials, rejecting client: {e}");
                return Step::Continue;
            }
        };

        let mut conn = match Connection::new(stream, self.debug) {
            Ok(conn) => conn,
            Err(e) => {
                log::error!("[Server] Could not set up accepted client: {e}");
                return Step::Continue;
            }
        };
        conn.set_peer(cred);

        let id = self.clients.insert(conn);
        if let Some(conn) = self.clients.get_mut(id) {
            conn.set_label(id.to_string());
        }
        log::debug!("[Server] New client accepted: {id}, pid {}", cred.pid);

        self.handler.on_connect(&mut self.clients, id);
        self.reap();
        Step::Continue
    }

    /// One read step on `id`, dispatching a completed message.
    pub fn read_ready(&mut self, id: ConnId) -> Step {
        let Some(conn) = self.clients.get_mut(id) else {
            return Step::WouldBlock;
        };
        match conn.read_ready() {
            Ok(ReadOutcome::Blocked) => Step::WouldBlock,
            Ok(ReadOutcome::Progress) => Step::Continue,
            Ok(ReadOutcome::Message(message)) => {
                self.handler.on_message(&mut self.clients, id, message);
                self.reap();
                Step::Continue
            }
            Err(e) => {
                self.fail(id, &e);
                Step::WouldBlock
            }
        }
    }

    /// One write step on `id`.
    pub fn write_ready(&mut self, id: ConnId) -> Step {
        let Some(conn) = self.clients.get_mut(id) else {
            return Step::WouldBlock;
        };
        match conn.write_ready() {
            Ok(WriteOutcome::Progress) => Step::Continue,
            Ok(WriteOutcome::Blocked | WriteOutcome::Drained) => Step::WouldBlock,
            Err(e) => {
                self.fail(id, &e);
                Step::WouldBlock
            }
        }
    }

    /// Register the listener and every connection with `set`. Write interest
    /// is registered only for connections with queued output.
    pub fn fill_fds(&self, set: &mut FdSet) {
        set.watch_read(self.listener_fd());
        for id in self.clients.ids() {
            if let Some(conn) = self.clients.get(id) {
                let fd = conn.as_raw_fd();
                set.watch_read(fd);
                if conn.wants_write() {
                    set.watch_write(fd);
                }
            }
        }
    }

    /// Run the steps `set` reports ready after a poll.
    pub fn handle_fds(&mut self, set: &FdSet) {
        let ids = self.clients.ids();

        if set.is_readable(self.listener_fd()) {
            self.accept_ready();
        }

        for id in ids {
            let Some(fd) = self.clients.get(id).map(AsRawFd::as_raw_fd) else {
                continue;
            };
            if set.is_readable(fd) {
                self.read_ready(id);
            }
            if self.clients.contains(id) && set.is_writable(fd) {
                self.write_ready(id);
            }
        }
    }

    fn fail(&mut self, id: ConnId, err: &ConnectionError) {
        match err {
            ConnectionError::Closed => log::debug!("[Server] {id} closed by peer"),
            other => log::error!("[Server] {id}: {other}"),
        }
        self.clients.destroy(id);
        self.reap();
    }

    /// Deliver pending disconnect callbacks.
    fn reap(&mut self) {
        while let Some((id, mut conn)) = self.clients.closed.pop_front() {
            if let Some(peer) = conn.peer() {
                log::debug!("[Server] Client {id} gone, pid {}", peer.pid);
            }
            self.handler.on_disconnect(&mut self.clients, id, &mut conn);
        }
    }
}

impl<H: ServerHandler> Drop for Server<H> {
    fn drop(&mut self) {
        for id in self.clients.ids() {
            self.clients.destroy(id);
        }
        self.reap();
        if let Some(path) = &self.socket_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Read the peer's credentials from a connected socket.
#[cfg(target_os = "linux")]
pub fn peer_credentials(stream: &UnixStream) -> io::Result<PeerCred> {
    let mut cred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    // SAFETY: `cred` and `len` are valid for writes and `len` is the size of
    // the buffer we pass.
    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            std::ptr::addr_of_mut!(cred).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(PeerCred {
        pid: cred.pid,
        uid: cred.uid,
        gid: cred.gid,
    })
}

/// Read the peer's credentials from a connected socket.
#[cfg(target_os = "macos")]
pub fn peer_credentials(stream: &UnixStream) -> io::Result<PeerCred> {
    let fd = stream.as_raw_fd();
    let mut uid: libc::uid_t = 0;
    let mut gid: libc::gid_t = 0;
    // SAFETY: both out-pointers are valid for writes.
    if unsafe { libc::getpeereid(fd, &mut uid, &mut gid) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut pid: libc::pid_t = 0;
    let mut len = std::mem::size_of::<libc::pid_t>() as libc::socklen_t;
    // SAFETY: `pid` and `len` are valid for writes and `len` matches `pid`.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_LOCAL,
            libc::LOCAL_PEERPID,
            std::ptr::addr_of_mut!(pid).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(PeerCred { pid, uid, gid })
}

/// Read the peer's credentials from a connected socket.
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn peer_credentials(_stream: &UnixStream) -> io::Result<PeerCred> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "peer credentials are not supported on this platform",
    ))
}
