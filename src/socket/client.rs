//! Client side: connecting to the daemon's rendezvous socket.
//!
//! [`connect`] is a single attempt. [`Reconnector`] wraps it in the agent's
//! retry policy: a fixed delay between attempts and a hard cap on
//! consecutive failures, after which the agent concludes the daemon is not
//! coming and shuts down.

use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::connection::Connection;
use crate::constants::{CONNECT_RETRY_DELAY, MAX_CONNECT_ATTEMPTS};
use crate::error::TransportError;

/// Open a non-blocking framed connection to `path`.
///
/// # Errors
///
/// [`TransportError::Connect`] when the socket is missing or refuses the
/// connection.
pub fn connect(path: impl AsRef<Path>, debug: bool) -> Result<Connection, TransportError> {
    let path = path.as_ref();
    let stream = UnixStream::connect(path).map_err(|source| TransportError::Connect {
        path: path.to_path_buf(),
        source,
    })?;
    let conn = Connection::new(stream, debug)?;
    log::debug!("[Client] Connected to {} as {}", path.display(), conn.label());
    Ok(conn)
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after this delay.
    RetryAfter(Duration),
    /// The attempt budget is spent.
    GiveUp,
}

/// Result of [`Reconnector::connect_with_retry`].
#[derive(Debug)]
pub enum ConnectOutcome {
    /// A live connection.
    Connected(Connection),
    /// Every attempt failed.
    GaveUp,
    /// Quit was requested while retrying.
    Quit,
}

/// Bounded fixed-delay retry policy.
#[derive(Debug, Clone)]
pub struct Reconnector {
    failures: u32,
    max_attempts: u32,
    delay: Duration,
}

impl Default for Reconnector {
    fn default() -> Self {
        Self::new(MAX_CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY)
    }
}

impl Reconnector {
    /// Policy giving up after `max_attempts` consecutive failures.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            failures: 0,
            max_attempts,
            delay,
        }
    }

    /// Consecutive failures since the last success.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Configured attempt cap.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Count a failed attempt.
    ///
    /// Logs on the first failure of a streak and when giving up, nothing in
    /// between.
    pub fn record_failure(&mut self, path: &Path, err: &TransportError) -> RetryDecision {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.max_attempts {
            log::error!(
                "[Client] Giving up on {} after {} attempts: {err}",
                path.display(),
                self.failures
            );
            return RetryDecision::GiveUp;
        }
        if self.failures == 1 {
            log::info!(
                "[Client] Could not connect to {}: {err}, retrying every {:?}",
                path.display(),
                self.delay
            );
        }
        RetryDecision::RetryAfter(self.delay)
    }

    /// Count a successful attempt and reset the streak.
    pub fn record_success(&mut self, path: &Path) {
        if self.failures > 0 {
            log::info!(
                "[Client] Connected to {} after {} retries",
                path.display(),
                self.failures
            );
        }
        self.failures = 0;
    }

    /// Connect, retrying per policy until connected, out of attempts, or
    /// `quit` is set. `sleep` performs the wait between attempts so callers
    /// can make it interruptible.
    pub fn connect_with_retry<F>(
        &mut self,
        path: &Path,
        debug: bool,
        quit: &AtomicBool,
        mut sleep: F,
    ) -> ConnectOutcome
    where
        F: FnMut(Duration),
    {
        loop {
            if quit.load(Ordering::Relaxed) {
                return ConnectOutcome::Quit;
            }
            match connect(path, debug) {
                Ok(conn) => {
                    self.record_success(path);
                    return ConnectOutcome::Connected(conn);
                }
                Err(e) => match self.record_failure(path, &e) {
                    RetryDecision::GiveUp => return ConnectOutcome::GaveUp,
                    RetryDecision::RetryAfter(delay) => sleep(delay),
                },
            }
        }
    }
}
