//! Application-wide constants for the session agent and daemon.
//!
//! Timing and sizing values are collected here so the agent, daemon and
//! configuration defaults agree on them.
//!
//! # Categories
//!
//! - **Endpoints**: well-known socket and device paths
//! - **Reconnect**: retry policy towards the daemon
//! - **Event loop**: poll and marshal sizing

use std::time::Duration;

// ============================================================================
// Endpoints
// ============================================================================

/// Rendezvous socket the daemon listens on and agents connect to.
pub const DEFAULT_SOCKET_PATH: &str = "/run/spice-vdagentd/spice-vdagent-sock";

/// Virtio-serial port node exposed by the hypervisor.
///
/// The agent refuses to start when this node is missing: without it there is
/// no host to talk to.
pub const DEFAULT_VIRTIO_PORT_PATH: &str = "/dev/virtio-ports/com.redhat.spice.0";

// ============================================================================
// Reconnect
// ============================================================================

/// Consecutive failed connects after which the agent gives up.
///
/// With [`CONNECT_RETRY_DELAY`] this bounds the wait for the daemon to about
/// one minute.
pub const MAX_CONNECT_ATTEMPTS: u32 = 60;

/// Delay between connect attempts.
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Delay before the agent re-executes itself after a version mismatch.
///
/// Gives an in-progress package upgrade time to finish replacing binaries.
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

// ============================================================================
// Event loop
// ============================================================================

/// Upper bound on one poll wait, so the quit flag is noticed promptly.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Capacity of the cross-thread write channel.
pub const MARSHAL_CAPACITY: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_window_is_about_a_minute() {
        let window = CONNECT_RETRY_DELAY * MAX_CONNECT_ATTEMPTS;
        assert!(window >= Duration::from_secs(30));
        assert!(window <= Duration::from_secs(120));
    }

    #[test]
    fn test_poll_interval_is_shorter_than_retry_delay() {
        assert!(POLL_INTERVAL < CONNECT_RETRY_DELAY);
    }

    #[test]
    fn test_default_paths_are_absolute() {
        assert!(DEFAULT_SOCKET_PATH.starts_with('/'));
        assert!(DEFAULT_VIRTIO_PORT_PATH.starts_with('/'));
    }

    #[test]
    fn test_marshal_capacity_nonzero() {
        assert!(MARSHAL_CAPACITY > 0);
    }
}
