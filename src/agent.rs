//! Session agent: the client end of the daemon socket.
//!
//! The agent connects to the daemon (retrying while the daemon starts up),
//! checks the daemon's version announcement, and then runs a poll loop that
//! feeds inbound messages to the [`Dispatcher`] and flushes outbound frames.
//! Other threads write through a [`WriteHandle`]; their frames are drained
//! at the top of every loop iteration.
//!
//! # Lifecycle
//!
//! ```text
//! run() ──connect_with_retry──► session ──peer closed / I/O error──► session_ended ─┐
//!   ▲                             │                                                │
//!   └─────────────────────────────┼────────────────────────────────────────────────┘
//!                                 ├── quit flag ───────► AgentExit::Quit
//!                                 └── version mismatch ► AgentExit::Restart
//! retries exhausted ──────────────────────────────────► AgentExit::GaveUp
//! ```

use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::constants::{MARSHAL_CAPACITY, POLL_INTERVAL};
use crate::dispatch::{Disposition, Dispatcher};
use crate::socket::client::{ConnectOutcome, Reconnector};
use crate::socket::connection::{Connection, ReadOutcome};
use crate::socket::marshal::{self, Mailbox, WriteHandle};
use crate::socket::reactor::FdSet;

/// Why [`Agent::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    /// Quit was requested.
    Quit,
    /// The daemon runs a different build; the process should re-execute
    /// itself.
    Restart,
    /// The daemon never became reachable.
    GaveUp,
}

enum SessionEnd {
    Quit,
    Disconnected,
    VersionMismatch,
}

/// Agent context: configuration, collaborators and process-level flags.
#[derive(Debug)]
pub struct Agent {
    config: Config,
    dispatcher: Dispatcher,
    quit: Arc<AtomicBool>,
    version_mismatch: bool,
    reconnector: Reconnector,
    handle: WriteHandle,
    mailbox: Mailbox,
}

impl Agent {
    /// Build an agent. Must be called on the thread that will call
    /// [`run`](Self::run).
    pub fn new(config: Config, dispatcher: Dispatcher, quit: Arc<AtomicBool>) -> io::Result<Self> {
        let (handle, mailbox) = marshal::channel(MARSHAL_CAPACITY)?;
        let reconnector = Reconnector::new(config.max_connect_attempts, config.retry_delay());
        Ok(Self {
            config,
            dispatcher,
            quit,
            version_mismatch: false,
            reconnector,
            handle,
            mailbox,
        })
    }

    /// Handle for writing to the daemon from other threads.
    pub fn write_handle(&self) -> WriteHandle {
        self.handle.clone()
    }

    /// Set once the daemon announced a different version.
    pub fn version_mismatch(&self) -> bool {
        self.version_mismatch
    }

    /// The dispatcher and its collaborators.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Connect and serve sessions until quit, version mismatch or the
    /// retry budget runs out.
    pub fn run(&mut self) -> AgentExit {
        let path = self.config.socket_path.clone();
        loop {
            let quit = Arc::clone(&self.quit);
            let outcome = self.reconnector.connect_with_retry(&path, self.config.debug, &quit, |delay| {
                interruptible_sleep(delay, &quit);
            });
            let conn = match outcome {
                ConnectOutcome::Connected(conn) => conn,
                ConnectOutcome::GaveUp => return AgentExit::GaveUp,
                ConnectOutcome::Quit => return AgentExit::Quit,
            };

            log::info!("[Agent] Connected to daemon at {}", path.display());
            let end = self.session(conn);
            self.dispatcher.session_ended();

            // Frames queued for the dead session must not leak into the next one.
            let dropped = self.mailbox.drain(|_| {});
            if dropped > 0 {
                log::debug!("[Agent] Dropped {dropped} frame(s) queued for the old session");
            }

            match end {
                SessionEnd::Quit => return AgentExit::Quit,
                SessionEnd::VersionMismatch => {
                    self.version_mismatch = true;
                    return AgentExit::Restart;
                }
                SessionEnd::Disconnected => {
                    if self.quit.load(Ordering::Relaxed) {
                        return AgentExit::Quit;
                    }
                    log::info!("[Agent] Lost connection to daemon, reconnecting");
                }
            }
        }
    }

    fn session(&mut self, mut conn: Connection) -> SessionEnd {
        let fd = conn.as_raw_fd();
        let mailbox_fd = self.mailbox.as_raw_fd();
        let mut set = FdSet::new();

        loop {
            if self.quit.load(Ordering::Relaxed) {
                return SessionEnd::Quit;
            }

            self.mailbox.drain(|frame| {
                if let Err(e) = frame.write_to(&mut conn) {
                    log::warn!("[Agent] Dropping marshaled frame: {e}");
                }
            });

            set.clear();
            set.watch_read(fd);
            set.watch_read(mailbox_fd);
            if conn.wants_write() {
                set.watch_write(fd);
            }
            if let Err(e) = set.poll(Some(POLL_INTERVAL)) {
                log::error!("[Agent] Fatal error polling: {e}");
                return SessionEnd::Disconnected;
            }

            if set.is_readable(fd) {
                match conn.read_ready() {
                    Ok(ReadOutcome::Message(message)) => {
                        if self.dispatcher.dispatch(&mut conn, message) == Disposition::VersionMismatch {
                            return SessionEnd::VersionMismatch;
                        }
                    }
                    Ok(ReadOutcome::Blocked | ReadOutcome::Progress) => {}
                    Err(e) => {
                        log::info!("[Agent] Daemon connection closed: {e}");
                        return SessionEnd::Disconnected;
                    }
                }
            }

            if set.is_writable(fd) {
                if let Err(e) = conn.write_ready() {
                    log::info!("[Agent] Daemon connection closed: {e}");
                    return SessionEnd::Disconnected;
                }
            }
        }
    }
}

/// Whether the hypervisor channel exists. Without it the agent has no host
/// to serve and must not start.
pub fn virtio_port_present(path: &Path) -> bool {
    path.exists()
}

/// Sleep for `total`, waking early when `quit` is set.
fn interruptible_sleep(total: Duration, quit: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !quit.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(POLL_INTERVAL));
    }
}
