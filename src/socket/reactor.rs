//! Readiness-set integration over `poll(2)`.
//!
//! The loop owner clears the set, lets each component register its
//! descriptors ([`Server::fill_fds`](super::server::Server::fill_fds)),
//! blocks in [`FdSet::poll`], then hands the set back for interpretation
//! ([`Server::handle_fds`](super::server::Server::handle_fds)).

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// A set of descriptors with read/write interest.
#[derive(Debug, Default)]
pub struct FdSet {
    fds: Vec<libc::pollfd>,
}

impl FdSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every registration and result.
    pub fn clear(&mut self) {
        self.fds.clear();
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Register read interest in `fd`.
    pub fn watch_read(&mut self, fd: RawFd) {
        self.entry(fd).events |= libc::POLLIN;
    }

    /// Register write interest in `fd`.
    pub fn watch_write(&mut self, fd: RawFd) {
        self.entry(fd).events |= libc::POLLOUT;
    }

    fn entry(&mut self, fd: RawFd) -> &mut libc::pollfd {
        let pos = match self.fds.iter().position(|p| p.fd == fd) {
            Some(pos) => pos,
            None => {
                self.fds.push(libc::pollfd {
                    fd,
                    events: 0,
                    revents: 0,
                });
                self.fds.len() - 1
            }
        };
        &mut self.fds[pos]
    }

    fn revents(&self, fd: RawFd) -> libc::c_short {
        self.fds
            .iter()
            .find(|p| p.fd == fd)
            .map_or(0, |p| p.revents)
    }

    /// Wait until a registered descriptor is ready or `timeout` passes
    /// (`None` waits forever). Returns the number of ready descriptors; an
    /// interrupted wait reports zero.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        for p in &mut self.fds {
            p.revents = 0;
        }
        let timeout_ms = timeout.map_or(-1, |t| t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int);

        // SAFETY: `fds` is a live, correctly sized array of pollfd structs for
        // the duration of the call.
        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(rc as usize)
    }

    /// Readable, hung up or in error. All of these mean a read step will
    /// make progress or report the failure.
    pub fn is_readable(&self, fd: RawFd) -> bool {
        self.revents(fd) & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
    }

    /// Writable or in error.
    pub fn is_writable(&self, fd: RawFd) -> bool {
        self.revents(fd) & (libc::POLLOUT | libc::POLLERR) != 0
    }
}
