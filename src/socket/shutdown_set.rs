use std::cell::RefCell;
use std::collections::HashSet;
use std::os::fd::RawFd;
use std::rc::Rc;
use tracing::{info, warn};

/// Registry of every descriptor owned by live connections.
///
/// Connections register their descriptor on open and deregister on close;
/// [`Self::shutdown_all`] is the emergency switch that half-closes every
/// tracked descriptor in both directions so peers observe EOF promptly,
/// e.g. during process drain. The owning connections still run their normal
/// teardown when they observe the resulting EOF/errors.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSocketSet {
    inner: Rc<RefCell<HashSet<RawFd>>>,
}

impl ShutdownSocketSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, fd: RawFd) {
        self.inner.borrow_mut().insert(fd);
    }

    pub(crate) fn remove(&self, fd: RawFd) {
        self.inner.borrow_mut().remove(&fd);
    }

    /// Number of descriptors currently tracked.
    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().is_empty()
    }

    /// Shuts down every tracked descriptor in both directions.
    pub fn shutdown_all(&self) {
        let fds: Vec<RawFd> = self.inner.borrow().iter().copied().collect();
        info!(count = fds.len(), "Shutting down all tracked sockets");
        for fd in fds {
            let rv = unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
            if rv != 0 {
                let err = std::io::Error::last_os_error();
                warn!(fd, ?err, "Error shutting down tracked socket");
            }
        }
    }
}
