//! System daemon side: accepts session agents on the rendezvous socket.
//!
//! [`SessionDaemon`] is the [`ServerHandler`]: it greets every agent with the
//! daemon version, keeps the last resolution each agent reported and logs
//! session arrival and departure. [`bind`] creates the server from the
//! configuration or an inherited descriptor, and the two `run_*` functions
//! drive it with either integration style.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::constants::POLL_INTERVAL;
use crate::dispatch::messages::GuestResolution;
use crate::socket::connection::Connection;
use crate::socket::framing::{Message, MessageType};
use crate::socket::marshal::Mailbox;
use crate::socket::reactor::FdSet;
use crate::socket::server::{Clients, ConnId, Server, ServerHandler};
use crate::socket::watch;

/// Per-agent state kept in the connection's user-data slot.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AgentSession {
    /// Overall guest desktop size, as last reported.
    pub desktop: Option<(u32, u32)>,
    /// Per-monitor geometry, as last reported.
    pub screens: Vec<GuestResolution>,
    /// Messages received from this agent.
    pub messages: u64,
}

/// Handler for agent connections.
#[derive(Debug)]
pub struct SessionDaemon {
    version: String,
    sessions_seen: u64,
}

impl SessionDaemon {
    /// Handler that announces `version` to every agent.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            sessions_seen: 0,
        }
    }

    /// Agents accepted over the daemon's lifetime.
    pub fn sessions_seen(&self) -> u64 {
        self.sessions_seen
    }

    fn version_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.version.len() + 1);
        payload.extend_from_slice(self.version.as_bytes());
        payload.push(0);
        payload
    }
}

impl ServerHandler for SessionDaemon {
    fn on_connect(&mut self, clients: &mut Clients, id: ConnId) {
        self.sessions_seen += 1;
        let pid = clients.peer(id).map_or(-1, |p| p.pid);
        log::info!("[Daemon] Agent connected: {id} (pid {pid})");

        if let Some(conn) = clients.get_mut(id) {
            conn.set_user_data(AgentSession::default());
        }
        let payload = self.version_payload();
        if let Err(e) = clients.write(id, MessageType::Version.as_u32(), 0, 0, &payload) {
            log::error!("[Daemon] Cannot greet {id}: {e}");
            clients.destroy(id);
        }
    }

    fn on_message(&mut self, clients: &mut Clients, id: ConnId, message: Message) {
        let Some(session) = clients
            .get_mut(id)
            .and_then(|conn| conn.user_data_mut::<AgentSession>())
        else {
            return;
        };
        session.messages += 1;

        match message.header.kind() {
            Some(MessageType::GuestXorgResolution) => match GuestResolution::parse_list(&message.payload) {
                Ok(screens) => {
                    log::debug!(
                        "[Daemon] {id} resolution {}x{} with {} screen(s)",
                        message.header.arg1,
                        message.header.arg2,
                        screens.len()
                    );
                    session.desktop = Some((message.header.arg1, message.header.arg2));
                    session.screens = screens;
                }
                Err(e) => log::warn!("[Daemon] Bad resolution from {id}: {e}"),
            },
            Some(MessageType::Version) => {
                log::warn!("[Daemon] Unexpected version message from {id}");
            }
            Some(kind) => {
                log::debug!("[Daemon] {id} sent {}", kind.name());
            }
            None => {
                log::warn!("[Daemon] {id} sent unknown message type {}", message.header.msg_type);
            }
        }
    }

    fn on_disconnect(&mut self, _clients: &mut Clients, id: ConnId, conn: &mut Connection) {
        let pid = conn.peer().map_or(-1, |p| p.pid);
        match conn.take_user_data::<AgentSession>() {
            Some(AgentSession {
                desktop: Some((width, height)),
                messages,
                ..
            }) => log::info!(
                "[Daemon] Agent disconnected: {id} (pid {pid}, last resolution {width}x{height}, {messages} message(s))"
            ),
            Some(session) => log::info!(
                "[Daemon] Agent disconnected: {id} (pid {pid}, {} message(s))",
                session.messages
            ),
            None => log::info!("[Daemon] Agent disconnected: {id} (pid {pid})"),
        }
    }
}

/// Create the daemon server, adopting `listen_fd` when given and binding
/// the configured path otherwise.
pub fn bind(config: &Config, listen_fd: Option<RawFd>, version: &str) -> Result<Server<SessionDaemon>> {
    let handler = SessionDaemon::new(version);
    match listen_fd {
        Some(fd) => Server::from_listener_fd(fd, handler, config.debug)
            .with_context(|| format!("Failed to adopt listening socket fd {fd}")),
        None => Server::bind(&config.socket_path, handler, config.debug)
            .with_context(|| format!("Failed to listen on {}", config.socket_path.display())),
    }
}

/// Drive `server` with the poll integration until `quit` is set.
pub fn run_poll<H: ServerHandler>(
    server: &mut Server<H>,
    mut mailbox: Option<&mut Mailbox>,
    quit: &AtomicBool,
) -> Result<()> {
    let mut set = FdSet::new();
    while !quit.load(Ordering::Relaxed) {
        if let Some(mb) = mailbox.as_deref_mut() {
            mb.drain(|frame| server.deliver(&frame));
        }

        set.clear();
        server.fill_fds(&mut set);
        if let Some(mb) = mailbox.as_deref() {
            set.watch_read(mb.as_raw_fd());
        }
        set.poll(Some(POLL_INTERVAL)).context("poll failed")?;
        server.handle_fds(&set);
    }
    log::info!("[Daemon] Quit requested, {} agent(s) connected", server.len());
    Ok(())
}

/// Drive `server` with the watch integration on a current-thread tokio
/// runtime until `quit` is set.
pub fn run_watch<H: ServerHandler>(
    server: &mut Server<H>,
    mailbox: Option<&mut Mailbox>,
    quit: Arc<AtomicBool>,
) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async {
        let cancel = CancellationToken::new();
        let watcher = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(POLL_INTERVAL);
                loop {
                    tick.tick().await;
                    if quit.load(Ordering::Relaxed) {
                        cancel.cancel();
                        return;
                    }
                }
            })
        };
        let result = watch::serve(server, mailbox, cancel).await;
        watcher.abort();
        result.context("watch loop failed")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::SessionEvents;
    use crate::socket::client;
    use crate::socket::connection::ReadOutcome;
    use std::thread;
    use std::time::{Duration, Instant};

    fn read_message(conn: &mut Connection) -> Message {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match conn.read_ready().unwrap() {
                ReadOutcome::Message(m) => return m,
                _ if Instant::now() > deadline => panic!("no message"),
                _ => thread::sleep(Duration::from_millis(5)),
            }
        }
    }

    fn flush(conn: &mut Connection) {
        while conn.wants_write() {
            conn.write_ready().unwrap();
        }
    }

    fn config_for(dir: &tempfile::TempDir) -> Config {
        Config {
            socket_path: dir.path().join("vdagentd.sock"),
            ..Config::default()
        }
    }

    #[test]
    fn test_poll_daemon_greets_and_records_resolution() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config_for(&dir);
        let mut server = bind(&config, None, "1.0").unwrap();
        let quit = Arc::new(AtomicBool::new(false));

        let daemon = {
            let quit = Arc::clone(&quit);
            thread::spawn(move || {
                run_poll(&mut server, None, &quit).unwrap();
                server
            })
        };

        let mut agent = client::connect(&config.socket_path, false).unwrap();
        let greeting = read_message(&mut agent);
        assert_eq!(greeting.header.kind(), Some(MessageType::Version));
        assert_eq!(greeting.payload, b"1.0\0");

        let screen = GuestResolution {
            width: 1024,
            height: 768,
            x: 0,
            y: 0,
            display_id: 0,
        };
        agent.guest_resolution(1024, 768, &[screen]).unwrap();
        flush(&mut agent);
        thread::sleep(Duration::from_millis(100));

        quit.store(true, Ordering::Relaxed);
        let server = daemon.join().unwrap();
        assert_eq!(server.handler().sessions_seen(), 1);

        let id = server.clients().ids()[0];
        let session = server.clients().get(id).unwrap().user_data::<AgentSession>().unwrap();
        assert_eq!(session.desktop, Some((1024, 768)));
        assert_eq!(session.screens, vec![screen]);
        assert_eq!(session.messages, 1);
    }

    #[test]
    fn test_watch_daemon_stops_on_quit() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config_for(&dir);
        let mut server = bind(&config, None, "2.0").unwrap();
        let quit = Arc::new(AtomicBool::new(false));

        let daemon = {
            let quit = Arc::clone(&quit);
            thread::spawn(move || {
                run_watch(&mut server, None, quit).unwrap();
                server
            })
        };

        let mut agent = client::connect(&config.socket_path, false).unwrap();
        assert_eq!(read_message(&mut agent).payload, b"2.0\0");
        drop(agent);

        thread::sleep(Duration::from_millis(100));
        quit.store(true, Ordering::Relaxed);
        let server = daemon.join().unwrap();
        assert_eq!(server.handler().sessions_seen(), 1);
        assert!(server.is_empty());
    }

    #[test]
    fn test_bind_rejects_invalid_inherited_fd() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = bind(&config_for(&dir), Some(-1), "v").unwrap_err();
        assert!(format!("{err:#}").contains("fd -1"));
    }
}
