use super::timer::{TimerId, TimerQueue};
use crate::error::Error;
use ::config::Config;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{instrument, trace, warn};

const DEFAULT_POLL_CAPACITY: usize = 256;

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

/// Looks up `{name}.{key}` for a named loop, then the bare `{key}`.
fn capacity_from_config(config: &Config, name: &str, key: &str) -> Option<usize> {
    if !name.is_empty() {
        if let Ok(value) = config.get::<usize>(&format!("{name}.{key}")) {
            return Some(value);
        }
    }
    config.get::<usize>(key).ok()
}

/// Readiness mask delivered to [`EventHandler::io_ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub readable: bool,
    pub writable: bool,
}

impl Ready {
    pub const READ: Ready = Ready {
        readable: true,
        writable: false,
    };
    pub const WRITE: Ready = Ready {
        readable: false,
        writable: true,
    };
    pub const READ_WRITE: Ready = Ready {
        readable: true,
        writable: true,
    };

    fn interest(self) -> Option<Interest> {
        match (self.readable, self.writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Upcalls a registered connection receives from its event loop.
///
/// Both upcalls run on the loop thread, with the loop holding a strong
/// reference to the handler for the duration of the call. A handler that is
/// dropped while a callback it triggered is still on the stack is therefore
/// deallocated only after the upcall unwinds.
pub trait EventHandler {
    /// The descriptor registered for this handler became ready.
    fn io_ready(&mut self, ready: Ready);

    /// A timer scheduled by this handler expired.
    fn timeout_expired(&mut self, id: TimerId);
}

pub(crate) struct LoopInner {
    id: u64,
    thread: ThreadId,
    registry: Registry,
    handlers: RefCell<HashMap<Token, Weak<RefCell<dyn EventHandler>>>>,
    timers: RefCell<TimerQueue>,
    next_token: Cell<usize>,
}

/// Single-threaded event loop: readiness demultiplexer plus timer queue.
///
/// Connections are attached through [`LoopHandle`]s and held weakly; the
/// loop never keeps a connection alive and never calls into one that has
/// been dropped.
pub struct EventLoop {
    poll: Poll,
    capacity: usize,
    inner: Rc<LoopInner>,
}

impl EventLoop {
    /// Creates a new event loop with default settings.
    pub fn new() -> Result<Self, Error> {
        Self::new_named(&Config::default(), "")
    }

    /// Creates a new named event loop with configuration namespacing.
    ///
    /// Recognized keys: `poll_capacity` (event batch size, default 256).
    pub fn new_named(config: &Config, name: &str) -> Result<Self, Error> {
        let capacity =
            capacity_from_config(config, name, "poll_capacity").unwrap_or(DEFAULT_POLL_CAPACITY);

        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let inner = Rc::new(LoopInner {
            id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
            thread: thread::current().id(),
            registry,
            handlers: RefCell::new(HashMap::new()),
            timers: RefCell::new(TimerQueue::default()),
            next_token: Cell::new(0),
        });

        Ok(Self {
            poll,
            capacity,
            inner,
        })
    }

    /// Gets the attach handle connections are created against.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            inner: self.inner.clone(),
        }
    }

    /// Whether any connection or timer is still attached.
    pub fn is_active(&self) -> bool {
        self.inner
            .handlers
            .borrow()
            .values()
            .any(|weak| weak.strong_count() > 0)
            || !self.inner.timers.borrow().is_empty()
    }

    /// Runs one poll-dispatch-expire cycle.
    ///
    /// Blocks until readiness, a timer deadline, or `timeout` (whichever is
    /// soonest), dispatches `io_ready` to every handler with events, then
    /// fires expired timers. Returns the number of upcalls dispatched.
    #[instrument(skip(self, timeout))]
    pub fn loop_once(&mut self, timeout: Option<Duration>) -> Result<usize, Error> {
        let poll_timeout = self.poll_timeout(timeout);

        let mut events = Events::with_capacity(self.capacity);
        if let Err(err) = self.poll.poll(&mut events, poll_timeout) {
            if err.kind() != ErrorKind::Interrupted {
                return Err(err.into());
            }
        }

        let mut dispatched = 0;
        for event in events.iter() {
            let handler = self
                .inner
                .handlers
                .borrow()
                .get(&event.token())
                .and_then(Weak::upgrade);
            let Some(handler) = handler else {
                trace!(token = event.token().0, "readiness for dropped handler");
                continue;
            };

            let mut ready = Ready {
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable() || event.is_write_closed(),
            };
            // Error conditions arrive without a readable/writable bit on some
            // platforms; deliver both so the owner discovers the failure from
            // the syscall.
            if !ready.readable && !ready.writable {
                ready = Ready::READ_WRITE;
            }

            handler.borrow_mut().io_ready(ready);
            dispatched += 1;
        }

        let now = Instant::now();
        loop {
            let expired = self.inner.timers.borrow_mut().pop_expired(now);
            let Some(entry) = expired else { break };
            if let Some(handler) = entry.handler.upgrade() {
                handler.borrow_mut().timeout_expired(entry.id);
                dispatched += 1;
            }
        }

        self.inner
            .handlers
            .borrow_mut()
            .retain(|_, weak| weak.strong_count() > 0);

        Ok(dispatched)
    }

    fn poll_timeout(&self, timeout: Option<Duration>) -> Option<Duration> {
        let timer_timeout = self
            .inner
            .timers
            .borrow()
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));
        match (timeout, timer_timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }
}

/// Cloneable attach target for an [`EventLoop`].
///
/// Held by every connection affined to the loop; provides token allocation,
/// handler registration, timers, and the loop-identity checks that the
/// connection I/O loops rely on.
#[derive(Clone)]
pub struct LoopHandle {
    pub(crate) inner: Rc<LoopInner>,
}

impl LoopHandle {
    /// Whether the caller is running on the loop's thread.
    ///
    /// All connection operations assert this; a connection is affined to
    /// exactly one loop and must only be touched from its thread.
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.inner.thread
    }

    /// Identity of the owning loop, used to detect migration mid-callback.
    pub(crate) fn loop_id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn next_token(&self) -> Token {
        let token = self.inner.next_token.get();
        self.inner.next_token.set(token + 1);
        Token(token)
    }

    pub(crate) fn insert_handler(&self, token: Token, handler: Weak<RefCell<dyn EventHandler>>) {
        self.inner.handlers.borrow_mut().insert(token, handler);
    }

    pub(crate) fn remove_handler(&self, token: Token) {
        self.inner.handlers.borrow_mut().remove(&token);
    }

    pub(crate) fn schedule_timer(
        &self,
        deadline: Instant,
        cancelled: Rc<Cell<bool>>,
        handler: Weak<RefCell<dyn EventHandler>>,
        id: TimerId,
    ) {
        self.inner
            .timers
            .borrow_mut()
            .schedule(deadline, cancelled, handler, id);
    }
}

/// Per-connection registration state for one descriptor.
///
/// Tracks the currently armed interest so redundant kernel calls are
/// skipped. mio's epoll backend is edge-triggered; [`Self::rearm`]
/// re-registers the current interest, which makes the kernel re-announce
/// readiness that was deliberately left unconsumed (per-event read caps).
pub(crate) struct IoRegistration {
    handle: LoopHandle,
    token: Token,
    fd: RawFd,
    armed: Option<Ready>,
}

impl IoRegistration {
    pub(crate) fn new(handle: &LoopHandle, token: Token) -> Self {
        Self {
            handle: handle.clone(),
            token,
            fd: -1,
            armed: None,
        }
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.armed.is_some()
    }

    /// Points the registration at a new descriptor (or none, with -1).
    ///
    /// Any existing registration is dropped first. Safe to call after the
    /// old descriptor has already been closed.
    pub(crate) fn change_fd(&mut self, fd: RawFd) {
        self.unregister();
        self.fd = fd;
    }

    /// Arms, re-arms, or disarms event interest for the descriptor.
    pub(crate) fn set_events(&mut self, ready: Option<Ready>) -> std::io::Result<()> {
        let registry = &self.handle.inner.registry;
        match (self.armed, ready) {
            (None, None) => Ok(()),
            (Some(current), Some(next)) if current == next => Ok(()),
            (Some(_), None) => {
                let result = registry.deregister(&mut SourceFd(&self.fd));
                self.armed = None;
                result
            }
            (None, Some(next)) => {
                let interest = next.interest().expect("non-empty ready mask");
                registry.register(&mut SourceFd(&self.fd), self.token, interest)?;
                self.armed = Some(next);
                Ok(())
            }
            (Some(_), Some(next)) => {
                let interest = next.interest().expect("non-empty ready mask");
                registry.reregister(&mut SourceFd(&self.fd), self.token, interest)?;
                self.armed = Some(next);
                Ok(())
            }
        }
    }

    /// Re-registers the current interest so still-pending readiness is
    /// delivered again on the next poll.
    pub(crate) fn rearm(&mut self) -> std::io::Result<()> {
        if let Some(ready) = self.armed {
            let interest = ready.interest().expect("non-empty ready mask");
            self.handle
                .inner
                .registry
                .reregister(&mut SourceFd(&self.fd), self.token, interest)?;
        }
        Ok(())
    }

    /// Drops the registration, tolerating an already-closed descriptor.
    pub(crate) fn unregister(&mut self) {
        if self.armed.take().is_some() && self.fd >= 0 {
            if let Err(err) = self
                .handle
                .inner
                .registry
                .deregister(&mut SourceFd(&self.fd))
            {
                warn!(fd = self.fd, ?err, "Failed to deregister descriptor");
            }
        }
    }
}

impl Drop for IoRegistration {
    fn drop(&mut self) {
        self.unregister();
    }
}
