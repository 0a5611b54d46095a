//! Per-descriptor watch integration on the tokio reactor.
//!
//! Instead of rebuilding a poll set every iteration, [`serve`] keeps one
//! [`AsyncFd`] registration per live descriptor and waits on all of them at
//! once. Read interest is permanent; write interest is awaited only while a
//! connection has queued output. Each wake-up runs exactly the step function
//! the poll loop would run, so both integrations drive the same state
//! machine.
//!
//! Readiness is cleared only when a step reports
//! [`Step::WouldBlock`]; a step that made progress leaves the descriptor
//! marked ready so the next iteration runs it again. The wait set is rotated
//! every iteration so a descriptor that stays ready cannot starve the rest.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;

use futures_util::future::select_all;
use tokio::io::unix::{AsyncFd, AsyncFdReadyGuard};
use tokio_util::sync::CancellationToken;

use super::connection::Connection;
use super::marshal::Mailbox;
use super::server::{ConnId, Server, ServerHandler, Step};

/// A descriptor owned by the server or the mailbox. Its watch is dropped in
/// [`sync_watches`] before the number can be handed out again.
#[derive(Debug, Clone, Copy)]
struct Watched(RawFd);

impl AsRawFd for Watched {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

enum Wake<'a> {
    Accept(AsyncFdReadyGuard<'a, Watched>),
    Read(ConnId, AsyncFdReadyGuard<'a, Watched>),
    Write(ConnId, AsyncFdReadyGuard<'a, Watched>),
    Mailbox(AsyncFdReadyGuard<'a, Watched>),
    Shutdown,
}

type WakeFuture<'a> = Pin<Box<dyn Future<Output = io::Result<Wake<'a>>> + 'a>>;

/// Drive `server` until `cancel` fires.
///
/// Must run inside a tokio runtime with I/O enabled. The future is not
/// `Send`; run it with `block_on` or on a current-thread runtime.
pub async fn serve<H: ServerHandler>(
    server: &mut Server<H>,
    mut mailbox: Option<&mut Mailbox>,
    cancel: CancellationToken,
) -> io::Result<()> {
    let listener = AsyncFd::new(Watched(server.listener_fd()))?;
    let mailbox_watch = match mailbox.as_deref() {
        Some(mb) => Some(AsyncFd::new(Watched(mb.as_raw_fd()))?),
        None => None,
    };
    let mut conns: HashMap<ConnId, AsyncFd<Watched>> = HashMap::new();
    sync_watches(server, &mut conns);
    let mut turn = 0usize;

    log::info!("[Watch] Serving {} connection(s)", server.len());

    loop {
        if let Some(mb) = mailbox.as_deref_mut() {
            mb.drain(|frame| server.deliver(&frame));
        }

        let writers: Vec<ConnId> = conns
            .keys()
            .copied()
            .filter(|id| server.clients().get(*id).is_some_and(Connection::wants_write))
            .collect();

        let wake = {
            let mut waits: Vec<WakeFuture<'_>> = Vec::with_capacity(2 + conns.len() + writers.len());
            waits.push(Box::pin(async {
                cancel.cancelled().await;
                Ok(Wake::Shutdown)
            }));
            waits.push(Box::pin(async { listener.readable().await.map(Wake::Accept) }));
            if let Some(watch) = &mailbox_watch {
                waits.push(Box::pin(async move { watch.readable().await.map(Wake::Mailbox) }));
            }
            for (&id, fd) in &conns {
                waits.push(Box::pin(async move { fd.readable().await.map(|g| Wake::Read(id, g)) }));
            }
            for id in writers {
                if let Some(fd) = conns.get(&id) {
                    waits.push(Box::pin(async move { fd.writable().await.map(|g| Wake::Write(id, g)) }));
                }
            }
            // select_all takes the first ready future in order; rotate so
            // the head of the list changes each iteration.
            let shift = turn % waits.len();
            waits.rotate_left(shift);
            turn = turn.wrapping_add(1);
            let (ready, _index, rest) = select_all(waits).await;
            drop(rest);
            ready?
        };

        match wake {
            Wake::Shutdown => {
                log::info!("[Watch] Shutdown requested");
                return Ok(());
            }
            Wake::Accept(mut guard) => {
                if server.accept_ready() == Step::WouldBlock {
                    guard.clear_ready();
                }
            }
            Wake::Mailbox(mut guard) => {
                if let Some(mb) = mailbox.as_deref_mut() {
                    mb.drain(|frame| server.deliver(&frame));
                }
                guard.clear_ready();
            }
            Wake::Read(id, mut guard) => {
                if server.read_ready(id) == Step::WouldBlock {
                    guard.clear_ready();
                }
            }
            Wake::Write(id, mut guard) => {
                if server.write_ready(id) == Step::WouldBlock {
                    guard.clear_ready();
                }
            }
        }

        sync_watches(server, &mut conns);
    }
}

/// Bring the registrations in line with the live set. Dead registrations go
/// first so a recycled descriptor number is never registered twice.
fn sync_watches<H: ServerHandler>(server: &mut Server<H>, conns: &mut HashMap<ConnId, AsyncFd<Watched>>) {
    conns.retain(|id, _| server.clients().contains(*id));

    for id in server.clients().ids() {
        if conns.contains_key(&id) {
            continue;
        }
        let Some(fd) = server.clients().get(id).map(AsRawFd::as_raw_fd) else {
            continue;
        };
        match AsyncFd::new(Watched(fd)) {
            Ok(watch) => {
                conns.insert(id, watch);
            }
            Err(e) => {
                log::error!("[Watch] Cannot watch {id}: {e}");
                server.destroy(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::framing::{self, decode_header, Message, MessageType, HEADER_SIZE};
    use crate::socket::marshal::{self, Destination};
    use crate::socket::server::Clients;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct Echo {
        disconnects: usize,
    }

    impl ServerHandler for Echo {
        fn on_connect(&mut self, clients: &mut Clients, id: ConnId) {
            clients.write(id, MessageType::Version.as_u32(), 0, 0, b"test\0").unwrap();
        }

        fn on_message(&mut self, clients: &mut Clients, id: ConnId, message: Message) {
            let h = message.header;
            clients.write(id, h.msg_type, h.arg1, h.arg2, &message.payload).unwrap();
        }

        fn on_disconnect(&mut self, _clients: &mut Clients, _id: ConnId, _conn: &mut Connection) {
            self.disconnects += 1;
        }
    }

    fn read_frame(stream: &mut UnixStream) -> (framing::MessageHeader, Vec<u8>) {
        let mut head = [0u8; HEADER_SIZE];
        stream.read_exact(&mut head).unwrap();
        let header = decode_header(&head);
        let mut payload = vec![0u8; header.size as usize];
        stream.read_exact(&mut payload).unwrap();
        (header, payload)
    }

    #[tokio::test]
    async fn test_serve_accepts_echoes_and_stops_on_cancel() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("watch.sock");
        let mut server = Server::bind(&path, Echo::default(), true).unwrap();
        let cancel = CancellationToken::new();

        let client = {
            let cancel = cancel.clone();
            let path = path.clone();
            tokio::task::spawn_blocking(move || {
                let mut stream = UnixStream::connect(&path).unwrap();
                stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

                let (greeting, version) = read_frame(&mut stream);
                let frame = framing::encode(MessageType::ClipboardData.as_u32(), 0, 1, &vec![7u8; 100_000]).unwrap();
                stream.write_all(&frame).unwrap();
                let (echo, payload) = read_frame(&mut stream);

                drop(stream);
                std::thread::sleep(Duration::from_millis(50));
                cancel.cancel();
                (greeting, version, echo, payload)
            })
        };

        tokio::time::timeout(Duration::from_secs(10), serve(&mut server, None, cancel))
            .await
            .expect("serve did not stop")
            .unwrap();
        let (greeting, version, echo, payload) = client.await.unwrap();

        assert_eq!(greeting.kind(), Some(MessageType::Version));
        assert_eq!(version, b"test\0");
        assert_eq!(echo.kind(), Some(MessageType::ClipboardData));
        assert_eq!(echo.arg2, 1);
        assert_eq!(payload.len(), 100_000);
        assert!(payload.iter().all(|b| *b == 7));
    }

    #[tokio::test]
    async fn test_serve_delivers_marshaled_broadcast() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("watch.sock");
        let mut server = Server::bind(&path, Echo::default(), false).unwrap();
        let (handle, mut mailbox) = marshal::channel(4).unwrap();
        let cancel = CancellationToken::new();

        let client = {
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                let mut stream = UnixStream::connect(&path).unwrap();
                stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
                // Greeting means we are in the live set.
                read_frame(&mut stream);

                handle
                    .send_and_wait(Destination::All, MessageType::ClientDisconnected.as_u32(), 0, 0, &[])
                    .unwrap();
                let (header, _) = read_frame(&mut stream);
                cancel.cancel();
                header
            })
        };

        serve(&mut server, Some(&mut mailbox), cancel).await.unwrap();
        let header = client.await.unwrap();
        assert_eq!(header.kind(), Some(MessageType::ClientDisconnected));
    }

    #[tokio::test]
    async fn test_serve_drops_closed_connections() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("watch.sock");
        let mut server = Server::bind(&path, Echo::default(), false).unwrap();
        let cancel = CancellationToken::new();

        let client = {
            let cancel = cancel.clone();
            let path = path.clone();
            tokio::task::spawn_blocking(move || {
                for _ in 0..3 {
                    let mut stream = UnixStream::connect(&path).unwrap();
                    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
                    read_frame(&mut stream);
                }
                // Each stream is dropped at the end of its iteration.
                std::thread::sleep(Duration::from_millis(100));
                cancel.cancel();
            })
        };

        serve(&mut server, None, cancel).await.unwrap();
        client.await.unwrap();
        assert_eq!(server.handler().disconnects, 3);
        assert!(server.is_empty());
    }

    #[tokio::test]
    async fn test_busy_connection_does_not_starve_newcomers() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("watch.sock");
        let mut server = Server::bind(&path, Echo::default(), false).unwrap();
        let cancel = CancellationToken::new();
        let done = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));

        let flooder = {
            let path = path.clone();
            let done = std::sync::Arc::clone(&done);
            tokio::task::spawn_blocking(move || {
                let mut stream = UnixStream::connect(&path).unwrap();
                stream.set_write_timeout(Some(Duration::from_millis(50))).unwrap();
                let frame = framing::encode(MessageType::ClipboardData.as_u32(), 0, 0, &[1u8; 1024]).unwrap();
                let deadline = std::time::Instant::now() + Duration::from_secs(10);
                while !done.load(std::sync::atomic::Ordering::Relaxed) && std::time::Instant::now() < deadline {
                    // Timeouts are expected once the server stops keeping up.
                    let _ = stream.write_all(&frame);
                }
            })
        };

        let newcomer = {
            let cancel = cancel.clone();
            let done = std::sync::Arc::clone(&done);
            tokio::task::spawn_blocking(move || {
                std::thread::sleep(Duration::from_millis(50));
                let mut stream = UnixStream::connect(&path).unwrap();
                stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
                let (greeting, _) = read_frame(&mut stream);
                let frame = framing::encode(MessageType::ClipboardRelease.as_u32(), 2, 0, &[]).unwrap();
                stream.write_all(&frame).unwrap();
                let (echo, _) = read_frame(&mut stream);
                done.store(true, std::sync::atomic::Ordering::Relaxed);
                cancel.cancel();
                (greeting, echo)
            })
        };

        tokio::time::timeout(Duration::from_secs(10), serve(&mut server, None, cancel))
            .await
            .expect("serve did not stop")
            .unwrap();
        let (greeting, echo) = newcomer.await.unwrap();
        flooder.await.unwrap();

        assert_eq!(greeting.kind(), Some(MessageType::Version));
        assert_eq!(echo.kind(), Some(MessageType::ClipboardRelease));
        assert_eq!(echo.arg1, 2);
    }
}
