use super::{
    deliver_all, BufferChain, ConnectCb, Delivery, ReadCb, ShutdownSocketSet, SocketOption,
    SocketState, Transport, WriteCb, WriteFlags, WriteQueue, WriteRequest, MAX_WRITE_IOVECS,
};
use crate::error::TransportError;
use crate::reactor::{EventHandler, IoRegistration, LoopHandle, Ready, TimerHandle, TimerId};
use mio::Token;
use socket2::{Domain, SockRef, Socket, Type};
use std::cell::RefCell;
use std::net::SocketAddr;
use std::os::fd::{BorrowedFd, IntoRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Timer id for the shared connect/send timer.
pub(crate) const TIMER_IO: TimerId = TimerId(0);

#[derive(Debug, Clone, Copy, Default)]
struct ShutdownFlags {
    read: bool,
    write: bool,
    write_pending: bool,
}

/// A non-blocking TCP connection driven by reactor readiness.
///
/// One socket owns one descriptor and is affined to one event loop. Reads
/// are a persistent subscription: install a [`super::ReadCallback`] and it
/// is notified whenever data arrives, until uninstalled or the stream
/// terminates. Writes complete per request, in submission order, each with
/// its own optional [`super::WriteCallback`].
///
/// Constructors return `Rc<RefCell<AsyncSocket>>`; the event loop holds
/// only a weak reference, so dropping every user handle both cancels all
/// future callbacks and releases the descriptor. Inside a callback, operate
/// on the socket through the `&mut dyn Transport` argument rather than
/// borrowing the owning cell again.
pub struct AsyncSocket {
    handle: LoopHandle,
    handler: Weak<RefCell<dyn EventHandler>>,
    token: Token,
    registration: IoRegistration,
    timer: TimerHandle,
    fd: RawFd,
    state: SocketState,
    shutdown: ShutdownFlags,
    interest_read: bool,
    interest_write: bool,
    peer_addr: Option<SocketAddr>,
    connect_callback: Option<ConnectCb>,
    read_callback: Option<ReadCb>,
    write_queue: WriteQueue,
    send_timeout: Option<Duration>,
    max_reads_per_event: usize,
    app_bytes_written: u64,
    app_bytes_received: u64,
    shutdown_set: Option<ShutdownSocketSet>,
}

// ============================================================================
// Constructors
// ============================================================================

impl AsyncSocket {
    /// Creates an unconnected socket attached to the given loop.
    pub fn new(handle: &LoopHandle) -> Rc<RefCell<AsyncSocket>> {
        let rc = Rc::new_cyclic(|weak: &Weak<RefCell<AsyncSocket>>| {
            let handler: Weak<RefCell<dyn EventHandler>> = weak.clone();
            RefCell::new(AsyncSocket::build(handle.clone(), handler))
        });
        let token = rc.borrow().token;
        let rc_dyn: Rc<RefCell<dyn EventHandler>> = rc.clone();
        let handler: Weak<RefCell<dyn EventHandler>> = Rc::downgrade(&rc_dyn);
        handle.insert_handler(token, handler);
        rc
    }

    /// Adopts an already-connected descriptor (e.g. from `accept`).
    ///
    /// The socket starts in the established state and takes ownership of
    /// the descriptor. Options set by the acceptor are left untouched.
    pub fn from_fd(handle: &LoopHandle, fd: RawFd) -> Rc<RefCell<AsyncSocket>> {
        let rc = Self::new(handle);
        rc.borrow_mut().adopt_fd(fd);
        rc
    }

    pub(crate) fn build(handle: LoopHandle, handler: Weak<RefCell<dyn EventHandler>>) -> Self {
        let token = handle.next_token();
        let registration = IoRegistration::new(&handle, token);
        let timer = TimerHandle::new(&handle);
        Self {
            handle,
            handler,
            token,
            registration,
            timer,
            fd: -1,
            state: SocketState::Uninit,
            shutdown: ShutdownFlags::default(),
            interest_read: false,
            interest_write: false,
            peer_addr: None,
            connect_callback: None,
            read_callback: None,
            write_queue: WriteQueue::default(),
            send_timeout: None,
            max_reads_per_event: 0,
            app_bytes_written: 0,
            app_bytes_received: 0,
            shutdown_set: None,
        }
    }

    pub(crate) fn adopt_fd(&mut self, fd: RawFd) {
        assert_eq!(self.state, SocketState::Uninit);
        assert!(self.fd < 0);
        self.fd = fd;
        self.registration.change_fd(fd);
        self.state = SocketState::Established;
        if let Some(set) = &self.shutdown_set {
            set.add(fd);
        }
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl AsyncSocket {
    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn good(&self) -> bool {
        matches!(
            self.state,
            SocketState::Connecting | SocketState::Established
        ) && !self.shutdown.read
            && !self.shutdown.write
            && !self.shutdown.write_pending
    }

    pub fn connecting(&self) -> bool {
        self.state == SocketState::Connecting
    }

    pub fn error(&self) -> bool {
        self.state == SocketState::Error
    }

    pub fn closed(&self) -> bool {
        self.state == SocketState::Closed
    }

    /// Whether reads are still possible.
    pub fn readable(&self) -> bool {
        self.state == SocketState::Established && !self.shutdown.read
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        if self.fd < 0 {
            return None;
        }
        let borrowed = unsafe { BorrowedFd::borrow_raw(self.fd) };
        SockRef::from(&borrowed)
            .local_addr()
            .ok()
            .and_then(|addr| addr.as_socket())
    }

    pub fn peer_address(&self) -> Option<SocketAddr> {
        if self.fd < 0 {
            return None;
        }
        let borrowed = unsafe { BorrowedFd::borrow_raw(self.fd) };
        SockRef::from(&borrowed)
            .peer_addr()
            .ok()
            .and_then(|addr| addr.as_socket())
            .or(self.peer_addr)
    }

    pub fn app_bytes_written(&self) -> u64 {
        self.app_bytes_written
    }

    pub fn app_bytes_received(&self) -> u64 {
        self.app_bytes_received
    }

    /// Sets the timeout for pending writes (and connect). Zero-equivalent
    /// `None` disables it. Takes effect immediately for writes already
    /// blocked.
    pub fn set_send_timeout(&mut self, timeout: Option<Duration>) {
        self.send_timeout = timeout;
        if self.interest_write && self.state == SocketState::Established {
            match timeout {
                Some(t) => self.schedule_send_timer(t),
                None => self.timer.cancel(),
            }
        }
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout
    }

    /// Caps how many `recv` calls one readable event may issue; 0 means
    /// unlimited. When the cap cuts a read burst short, readiness is
    /// re-armed so the remainder is delivered on the next loop pass.
    pub fn set_max_reads_per_event(&mut self, max: usize) {
        self.max_reads_per_event = max;
    }

    pub fn max_reads_per_event(&self) -> usize {
        self.max_reads_per_event
    }

    /// Registers this socket's descriptor lifecycle with `set`.
    pub fn set_shutdown_socket_set(&mut self, set: Option<ShutdownSocketSet>) {
        if let Some(old) = &self.shutdown_set {
            if self.fd >= 0 {
                old.remove(self.fd);
            }
        }
        self.shutdown_set = set;
        if let Some(new) = &self.shutdown_set {
            if self.fd >= 0 {
                new.add(self.fd);
            }
        }
    }
}

// ============================================================================
// Connect
// ============================================================================

impl AsyncSocket {
    /// Initiates a non-blocking connect.
    ///
    /// Permitted only in the uninitialized state. The callback sees exactly
    /// one of `connect_success` / `connect_error`. If the connect cannot
    /// finish synchronously the socket registers for writability and, when
    /// `timeout` is set, fails with `TimedOut` on expiry.
    pub fn connect(
        &mut self,
        callback: Option<ConnectCb>,
        addr: SocketAddr,
        timeout: Option<Duration>,
        options: &[SocketOption],
        bind_addr: Option<SocketAddr>,
    ) {
        debug_assert!(self.handle.is_in_loop_thread());
        if self.state != SocketState::Uninit {
            return self.invalid_connect_state(callback);
        }
        assert!(self.fd < 0);

        debug!(%addr, "Initiating connection");
        self.state = SocketState::Connecting;
        self.connect_callback = callback;
        self.peer_addr = Some(addr);

        match self.start_connect(addr, timeout, options, bind_addr) {
            Ok(true) => {
                // Synchronous completion: nothing is registered yet and no
                // writes can be pending.
                assert!(self.read_callback.is_none());
                assert!(self.write_queue.is_empty());
                self.state = SocketState::Established;
                info!(%addr, fd = self.fd, "Connection established");
                if let Some(cb) = self.connect_callback.take() {
                    if let Ok(mut cb) = cb.try_borrow_mut() {
                        cb.connect_success(self);
                    }
                }
            }
            Ok(false) => {
                trace!(%addr, fd = self.fd, "Connection in progress");
            }
            Err(err) => self.fail_connect("connect", err),
        }
    }

    /// Returns Ok(true) when the connect finished synchronously.
    fn start_connect(
        &mut self,
        addr: SocketAddr,
        timeout: Option<Duration>,
        options: &[SocketOption],
        bind_addr: Option<SocketAddr>,
    ) -> Result<bool, TransportError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)
            .map_err(|e| TransportError::internal("failed to create socket", e.raw_os_error()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::internal("failed to set non-blocking", e.raw_os_error()))?;
        socket
            .set_cloexec(true)
            .map_err(|e| TransportError::internal("failed to set close-on-exec", e.raw_os_error()))?;

        // On by default; losing it is not fatal.
        if let Err(err) = socket.set_nodelay(true) {
            warn!(%addr, ?err, "Failed to enable TCP_NODELAY");
        }

        if let Some(bind) = bind_addr {
            socket.set_reuse_address(true).map_err(|e| {
                TransportError::internal("failed to set SO_REUSEADDR before bind", e.raw_os_error())
            })?;
            socket.bind(&bind.into()).map_err(|e| {
                TransportError::internal(
                    format!("failed to bind to {bind}"),
                    e.raw_os_error(),
                )
            })?;
        }

        let connect_result = socket.connect(&addr.into());
        self.fd = socket.into_raw_fd();
        self.registration.change_fd(self.fd);
        if let Some(set) = &self.shutdown_set {
            set.add(self.fd);
        }

        for option in options {
            option
                .apply(self.fd)
                .map_err(|e| TransportError::internal("failed to set socket option", e.raw_os_error()))?;
        }

        match connect_result {
            Ok(()) => Ok(true),
            Err(err)
                if err.raw_os_error() == Some(libc::EINPROGRESS)
                    || err.kind() == std::io::ErrorKind::WouldBlock =>
            {
                if let Some(t) = timeout {
                    self.schedule_send_timer(t);
                }
                self.try_set_interest(false, true).map_err(|e| {
                    TransportError::internal(
                        "failed to register for connect events",
                        e.raw_os_error(),
                    )
                })?;
                Ok(false)
            }
            Err(err) => Err(TransportError::with_errno(
                crate::error::ErrorKind::NotOpen,
                "connect failed (immediately)",
                err.raw_os_error(),
            )),
        }
    }

    /// Checks SO_ERROR after a writable event in the connecting state and
    /// moves to established. Does not invoke callbacks; the plain-socket
    /// path and the TLS overlay differ in what happens next.
    pub(crate) fn finish_connect(&mut self) -> Result<(), TransportError> {
        assert_eq!(self.state, SocketState::Connecting);
        assert!(!self.shutdown.write);
        self.timer.cancel();

        self.interest_read = false;
        self.interest_write = false;
        self.registration
            .set_events(None)
            .map_err(|e| TransportError::internal("failed to clear connect events", e.raw_os_error()))?;

        let borrowed = unsafe { BorrowedFd::borrow_raw(self.fd) };
        match SockRef::from(&borrowed).take_error() {
            Err(err) => Err(TransportError::internal(
                "getsockopt(SO_ERROR) after connect failed",
                err.raw_os_error(),
            )),
            Ok(Some(err)) => Err(TransportError::with_errno(
                crate::error::ErrorKind::NotOpen,
                "connect failed",
                err.raw_os_error(),
            )),
            Ok(None) => {
                self.state = SocketState::Established;
                info!(fd = self.fd, peer = ?self.peer_addr, "Connection established");
                Ok(())
            }
        }
    }

    fn handle_connect(&mut self) {
        match self.finish_connect() {
            Err(err) => self.fail_connect("handle_connect", err),
            Ok(()) => {
                // Half-close was requested while connecting and nothing is
                // queued behind it.
                if self.shutdown.write_pending && self.write_queue.is_empty() {
                    assert!(!self.shutdown.read);
                    self.kernel_shutdown_write();
                    self.shutdown.write_pending = false;
                    self.shutdown.write = true;
                }

                let original = self.handle.loop_id();
                if let Some(cb) = self.connect_callback.take() {
                    if let Ok(mut cb) = cb.try_borrow_mut() {
                        cb.connect_success(self);
                    }
                }
                // The callback may have closed the socket or moved it to
                // another loop.
                if self.handle.loop_id() != original || self.state != SocketState::Established {
                    return;
                }
                self.handle_initial_read_write();
            }
        }
    }

    /// Arms read interest and flushes queued writes once a connection (or a
    /// TLS handshake, which defers this) completes.
    fn handle_initial_read_write(&mut self) {
        if self.read_callback.is_some() {
            if !self.interest_read
                && self.state == SocketState::Established
                && !self.shutdown.read
                && !self.set_interest(true, self.interest_write)
            {
                return;
            }
        } else if self.interest_read && !self.set_interest(false, self.interest_write) {
            return;
        }

        if !self.write_queue.is_empty() && !self.interest_write {
            self.handle_write();
        } else if self.write_queue.is_empty() && self.interest_write {
            self.set_interest(self.interest_read, false);
        }
    }
}

// ============================================================================
// Reads
// ============================================================================

impl AsyncSocket {
    /// Installs or removes the persistent read callback.
    ///
    /// Installing a callback on a socket already shut down for reads is a
    /// caller error (`NotOpen` delivered to the supplied callback);
    /// removing one in that situation is a no-op. In the connecting state
    /// the callback is stored and armed once established.
    pub fn set_read_callback(&mut self, callback: Option<ReadCb>) {
        if self.shutdown.read {
            match callback {
                Some(cb) => self.invalid_read_state(cb),
                None => self.read_callback = None,
            }
            return;
        }

        debug_assert!(self.handle.is_in_loop_thread());
        match self.state {
            SocketState::Connecting => {
                self.read_callback = callback;
            }
            SocketState::Established => {
                let want_read = callback.is_some();
                self.read_callback = callback;
                self.set_interest(want_read, self.interest_write);
                // The base socket does not attempt an optimistic read here;
                // data present is announced by the next poll.
            }
            SocketState::Uninit | SocketState::Closed | SocketState::Error => {
                if let Some(cb) = callback {
                    self.invalid_read_state(cb);
                }
            }
        }
    }

    pub fn has_read_callback(&self) -> bool {
        self.read_callback.is_some()
    }

    pub(crate) fn read_cb(&self) -> Option<ReadCb> {
        self.read_callback.clone()
    }

    pub(crate) fn take_read_cb(&mut self) -> Option<ReadCb> {
        self.read_callback.take()
    }

    /// Stores a read callback without touching event interest; the TLS
    /// overlay uses this during handshake phases.
    pub(crate) fn store_read_cb(&mut self, callback: Option<ReadCb>) {
        self.read_callback = callback;
    }

    fn handle_read(&mut self) {
        assert_eq!(self.state, SocketState::Established);
        assert!(!self.shutdown.read);

        // Loop until a read would block, the callback is uninstalled, the
        // per-event cap is reached, or the socket migrated to another loop.
        let original = self.handle.loop_id();
        let mut reads = 0usize;
        while self.read_callback.is_some() && self.handle.loop_id() == original {
            let cb = self.read_callback.clone().expect("checked above");
            let fd = self.fd;

            let (result, buflen) = {
                let Ok(mut cb_ref) = cb.try_borrow_mut() else {
                    return;
                };
                let buf = cb_ref.get_read_buffer();
                if buf.is_empty() {
                    drop(cb_ref);
                    return self.fail_read(
                        "handle_read",
                        TransportError::bad_args("get_read_buffer() returned empty buffer"),
                    );
                }
                let buflen = buf.len();
                let rv = unsafe {
                    libc::recv(
                        fd,
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buflen,
                        libc::MSG_DONTWAIT,
                    )
                };
                (rv, buflen)
            };

            if result > 0 {
                let n = result as usize;
                trace!(fd, len = n, "Read data from socket");
                self.app_bytes_received += n as u64;
                if let Ok(mut cb_ref) = cb.try_borrow_mut() {
                    cb_ref.read_data_available(self, n);
                }
                if n < buflen {
                    // Short read: the kernel buffer is drained.
                    return;
                }
                reads += 1;
                if self.max_reads_per_event != 0 && reads >= self.max_reads_per_event {
                    // More data may remain buffered; re-announce readiness.
                    if let Err(err) = self.registration.rearm() {
                        self.fail(
                            "handle_read",
                            TransportError::internal("failed to rearm read events", err.raw_os_error()),
                        );
                    }
                    return;
                }
            } else if result == 0 {
                info!(fd, "Connection closed by peer");
                self.shutdown.read = true;
                if !self.set_interest(false, self.interest_write) {
                    return;
                }
                if let Some(cb) = self.read_callback.take() {
                    if let Ok(mut cb) = cb.try_borrow_mut() {
                        cb.read_eof(self);
                    }
                }
                return;
            } else {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => return,
                    Some(libc::EINTR) => continue,
                    raw => {
                        return self.fail_read(
                            "handle_read",
                            TransportError::internal("recv() failed", raw),
                        )
                    }
                }
            }
        }
    }
}

// ============================================================================
// Writes
// ============================================================================

impl AsyncSocket {
    /// Queues a single buffer for transmission.
    ///
    /// In the established state with an empty queue, one synchronous send
    /// is attempted first and `write_success` fires inline on full
    /// transmission. Writing after `shutdown_write` is a caller bug and
    /// fails the whole socket.
    pub fn write(&mut self, callback: Option<WriteCb>, data: Vec<u8>, flags: WriteFlags) {
        self.write_impl(callback, vec![data], flags);
    }

    /// Queues several buffers as one gather-write request.
    pub fn writev(&mut self, callback: Option<WriteCb>, bufs: Vec<Vec<u8>>, flags: WriteFlags) {
        self.write_impl(callback, bufs, flags);
    }

    /// Queues an owned buffer chain as one request; links are released as
    /// the socket advances past them.
    pub fn write_chain(&mut self, callback: Option<WriteCb>, chain: BufferChain, flags: WriteFlags) {
        self.write_impl(callback, chain.into_segments(), flags);
    }

    fn write_impl(&mut self, callback: Option<WriteCb>, segments: Vec<Vec<u8>>, flags: WriteFlags) {
        debug_assert!(self.handle.is_in_loop_thread());

        if self.shutdown.write || self.shutdown.write_pending {
            // A write after shutdown is a bug in the caller, not a
            // recoverable condition; fail every outstanding callback.
            return self.invalid_write_state(callback);
        }

        let mut request = WriteRequest::new(callback, segments, flags);
        if request.is_complete() {
            // Nothing to send; complete immediately.
            if let Some(cb) = request.take_callback() {
                if let Ok(mut cb) = cb.try_borrow_mut() {
                    cb.write_success(self);
                }
            }
            return;
        }

        let mut must_register = false;
        if self.state == SocketState::Established {
            if self.write_queue.is_empty() {
                debug_assert!(!self.interest_write);
                match self.perform_write(&mut request, flags) {
                    Err(err) => {
                        let bytes = request.bytes_written();
                        let cb = request.take_callback();
                        return self.fail_new_write(cb, bytes, err);
                    }
                    Ok(_) => {
                        if request.is_complete() {
                            if let Some(cb) = request.take_callback() {
                                if let Ok(mut cb) = cb.try_borrow_mut() {
                                    cb.write_success(self);
                                }
                            }
                            return;
                        }
                        must_register = true;
                    }
                }
            }
        } else if self.state != SocketState::Connecting {
            return self.invalid_write_state(request.take_callback());
        }

        self.write_queue.push_back(request);
        if must_register {
            if !self.set_interest(self.interest_read, true) {
                return;
            }
            if let Some(t) = self.send_timeout {
                self.schedule_send_timer(t);
            }
        }
    }

    /// One `sendmsg` pass over the head of `request`. Returns the bytes
    /// accepted by the kernel; 0 means the send buffer is full.
    fn perform_write(
        &mut self,
        request: &mut WriteRequest,
        flags: WriteFlags,
    ) -> Result<usize, TransportError> {
        let mut iovs = [libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        }; MAX_WRITE_IOVECS];
        let count = request.fill_iovec(&mut iovs);

        // sendmsg rather than writev: MSG_NOSIGNAL suppresses SIGPIPE, and
        // EPIPE is handled like any other error.
        let mut msg_flags = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
        if flags.cork {
            msg_flags |= libc::MSG_MORE;
        }
        if flags.eor {
            msg_flags |= libc::MSG_EOR;
        }

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = iovs.as_mut_ptr();
        msg.msg_iovlen = count as _;

        let rv = unsafe { libc::sendmsg(self.fd, &msg, msg_flags) };
        if rv < 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(0),
                raw => Err(TransportError::internal("sendmsg() failed", raw)),
            };
        }

        let written = rv as usize;
        trace!(fd = self.fd, len = written, remaining = request.remaining() - written, "Wrote to socket");
        self.app_bytes_written += written as u64;
        request.consume(written);
        Ok(written)
    }

    fn handle_write(&mut self) {
        if self.state == SocketState::Connecting {
            return self.handle_connect();
        }
        if self.write_queue.is_empty() {
            // Stale writability from an earlier pass in the same wakeup.
            if self.interest_write {
                self.set_interest(self.interest_read, false);
            }
            return;
        }
        assert_eq!(self.state, SocketState::Established);
        assert!(!self.shutdown.write);

        let original = self.handle.loop_id();
        while !self.write_queue.is_empty() && self.handle.loop_id() == original {
            let mut request = self.write_queue.pop_front().expect("non-empty queue");
            let mut flags = request.flags();
            if !self.write_queue.is_empty() {
                // More requests follow; ask the kernel to coalesce.
                flags.cork = true;
            }

            match self.perform_write(&mut request, flags) {
                Err(err) => {
                    return self.fail_write_head(request, err);
                }
                Ok(written) => {
                    if request.is_complete() {
                        if self.write_queue.is_empty() {
                            // Last request: update registration and stop the
                            // send timer before the callback runs, since it
                            // may detach or close the socket.
                            if self.interest_write
                                && !self.set_interest(self.interest_read, false)
                            {
                                return;
                            }
                            self.timer.cancel();
                            if self.shutdown.write_pending {
                                self.finish_pending_shutdown();
                            }
                        }
                        if let Some(cb) = request.take_callback() {
                            if let Ok(mut cb) = cb.try_borrow_mut() {
                                cb.write_success(self);
                            }
                        }
                        if self.state != SocketState::Established {
                            return;
                        }
                    } else {
                        self.write_queue.push_front(request);
                        if !self.interest_write && !self.set_interest(self.interest_read, true) {
                            return;
                        }
                        if written > 0 {
                            // Progress resets the send timeout.
                            if let Some(t) = self.send_timeout {
                                self.schedule_send_timer(t);
                            }
                        }
                        return;
                    }
                }
            }
        }
    }

    /// Promotes a pending write-shutdown once the queue has drained.
    fn finish_pending_shutdown(&mut self) {
        assert!(self.connect_callback.is_none());
        self.shutdown.write_pending = false;
        self.shutdown.write = true;

        if self.shutdown.read {
            // Both directions are finished; fully close.
            assert!(self.read_callback.is_none());
            self.state = SocketState::Closed;
            self.registration.unregister();
            self.do_close();
        } else {
            self.kernel_shutdown_write();
        }
    }

    pub(crate) fn kernel_shutdown_write(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::shutdown(self.fd, libc::SHUT_WR) };
        }
    }
}

// ============================================================================
// Shutdown and close
// ============================================================================

impl AsyncSocket {
    /// Half-closes the write side once all queued writes drain. New writes
    /// are rejected immediately.
    pub fn shutdown_write(&mut self) {
        if self.write_queue.is_empty() {
            return self.shutdown_write_now();
        }
        self.shutdown.write_pending = true;
    }

    /// Half-closes the write side immediately. Queued writes fail with an
    /// end-of-file error and the send timer stops.
    pub fn shutdown_write_now(&mut self) {
        if self.shutdown.write {
            return;
        }
        if self.shutdown.read {
            // Reads are already finished; no reason to linger half-open.
            return self.close_now();
        }

        match self.state {
            SocketState::Established => {
                self.shutdown.write_pending = false;
                self.shutdown.write = true;
                if self.interest_write && !self.set_interest(self.interest_read, false) {
                    return;
                }
                self.timer.cancel();
                self.kernel_shutdown_write();
                let deliveries = self.collect_write_deliveries();
                let err = TransportError::local_close("socket shut down for writes");
                deliver_all(self, deliveries, &err);
            }
            SocketState::Connecting => {
                // The half-close happens when the connect completes.
                self.shutdown.write_pending = true;
                let deliveries = self.collect_write_deliveries();
                let err = TransportError::local_close("socket shut down for writes");
                deliver_all(self, deliveries, &err);
            }
            SocketState::Uninit => {
                self.shutdown.write_pending = true;
            }
            SocketState::Closed | SocketState::Error => {
                warn!(state = ?self.state, "shutdown_write_now() called on finished socket");
            }
        }
    }

    /// Closes after queued writes drain; equivalent to `close_now` when
    /// nothing is pending or the socket is not connecting/established.
    pub fn close(&mut self) {
        if self.write_queue.is_empty()
            || !matches!(
                self.state,
                SocketState::Connecting | SocketState::Established
            )
        {
            return self.close_now();
        }

        // Reads stop now; writes drain, then the descriptor closes.
        self.shutdown.read = true;
        self.shutdown.write_pending = true;
        if self.interest_read && !self.set_interest(false, self.interest_write) {
            return;
        }
        if let Some(cb) = self.read_callback.take() {
            if let Ok(mut cb) = cb.try_borrow_mut() {
                cb.read_eof(self);
            }
        }
    }

    /// Closes unconditionally. Safe to call repeatedly; only the first call
    /// delivers callbacks.
    pub fn close_now(&mut self) {
        let deliveries = self.close_now_quiet();
        if !deliveries.is_empty() {
            let err = TransportError::local_close("socket closed locally");
            deliver_all(self, deliveries, &err);
        }
    }

    /// The state/resource part of `close_now`, with the owed callbacks
    /// returned instead of invoked.
    pub(crate) fn close_now_quiet(&mut self) -> Vec<Delivery> {
        match self.state {
            SocketState::Uninit | SocketState::Connecting | SocketState::Established => {
                self.state = SocketState::Closed;
                self.shutdown.read = true;
                self.shutdown.write = true;
                self.shutdown.write_pending = false;
                self.interest_read = false;
                self.interest_write = false;
                self.timer.cancel();
                self.registration.unregister();
                self.do_close();
                self.collect_close_deliveries()
            }
            SocketState::Closed | SocketState::Error => {
                // A close() from inside a teardown callback can arrive here
                // with requests still queued behind the one being failed.
                self.collect_close_deliveries()
            }
        }
    }

    /// Extracts the descriptor and closes the connection without closing
    /// it. Pending callbacks fire as for `close_now`; the caller owns the
    /// returned descriptor afterwards.
    pub fn detach_fd(&mut self) -> RawFd {
        if let Some(set) = &self.shutdown_set {
            if self.fd >= 0 {
                set.remove(self.fd);
            }
        }
        let fd = self.fd;
        self.registration.unregister();
        self.fd = -1;
        self.registration.change_fd(-1);
        self.close_now();
        fd
    }

    fn do_close(&mut self) {
        if self.fd < 0 {
            return;
        }
        if let Some(set) = &self.shutdown_set {
            set.remove(self.fd);
        }
        unsafe { libc::close(self.fd) };
        self.fd = -1;
        self.registration.change_fd(-1);
    }
}

// ============================================================================
// Event-loop affinity
// ============================================================================

impl AsyncSocket {
    pub fn loop_handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub(crate) fn loop_id(&self) -> u64 {
        self.handle.loop_id()
    }

    /// Moves the socket to another event loop.
    ///
    /// Only legal while no events or timers are armed (uninstall the read
    /// callback and let writes drain first).
    pub fn attach_event_base(&mut self, handle: &LoopHandle) {
        assert!(!self.registration.is_registered());
        assert!(!self.timer.is_scheduled());

        self.handle.remove_handler(self.token);
        self.handle = handle.clone();
        self.token = handle.next_token();
        let mut registration = IoRegistration::new(handle, self.token);
        registration.change_fd(self.fd);
        self.registration = registration;
        self.timer = TimerHandle::new(handle);
        handle.insert_handler(self.token, self.handler.clone());
    }
}

// ============================================================================
// Internal plumbing shared with the TLS overlay
// ============================================================================

impl AsyncSocket {
    pub(crate) fn handler(&self) -> Weak<RefCell<dyn EventHandler>> {
        self.handler.clone()
    }

    pub(crate) fn is_shut_read(&self) -> bool {
        self.shutdown.read
    }

    pub(crate) fn set_shut_read(&mut self) {
        self.shutdown.read = true;
    }

    pub(crate) fn is_shut_write(&self) -> bool {
        self.shutdown.write
    }

    pub(crate) fn is_shut_write_pending(&self) -> bool {
        self.shutdown.write_pending
    }

    pub(crate) fn set_shut_write_pending(&mut self) {
        self.shutdown.write_pending = true;
    }

    pub(crate) fn promote_write_shutdown(&mut self) {
        self.shutdown.write_pending = false;
        self.shutdown.write = true;
    }

    pub(crate) fn interest_write(&self) -> bool {
        self.interest_write
    }

    /// Arms the given interest set without any failure handling; the TLS
    /// overlay routes errors through its own fail paths.
    pub(crate) fn try_set_interest(&mut self, read: bool, write: bool) -> std::io::Result<()> {
        if self.interest_read == read && self.interest_write == write {
            return Ok(());
        }
        self.interest_read = read;
        self.interest_write = write;
        let ready = match (read, write) {
            (false, false) => None,
            (true, false) => Some(Ready::READ),
            (false, true) => Some(Ready::WRITE),
            (true, true) => Some(Ready::READ_WRITE),
        };
        self.registration.set_events(ready)
    }

    /// Arms the given interest set; returns false when registration failed
    /// and the socket moved to the error state.
    pub(crate) fn set_interest(&mut self, read: bool, write: bool) -> bool {
        match self.try_set_interest(read, write) {
            Ok(()) => true,
            Err(err) => {
                self.fail(
                    "set_interest",
                    TransportError::internal(
                        "failed to update event registration",
                        err.raw_os_error(),
                    ),
                );
                false
            }
        }
    }

    pub(crate) fn rearm_events(&mut self) -> std::io::Result<()> {
        self.registration.rearm()
    }

    pub(crate) fn queue(&mut self) -> &mut WriteQueue {
        &mut self.write_queue
    }

    pub(crate) fn queue_is_empty(&self) -> bool {
        self.write_queue.is_empty()
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.write_queue.len()
    }

    pub(crate) fn add_app_bytes_written(&mut self, n: u64) {
        self.app_bytes_written += n;
    }

    pub(crate) fn add_app_bytes_received(&mut self, n: u64) {
        self.app_bytes_received += n;
    }

    pub(crate) fn schedule_send_timer(&mut self, timeout: Duration) {
        let handler = self.handler.clone();
        self.timer.schedule(timeout, handler, TIMER_IO);
    }

    pub(crate) fn cancel_send_timer(&mut self) {
        self.timer.cancel();
    }
}

// ============================================================================
// Failure protocol
// ============================================================================

impl AsyncSocket {
    /// Phase one: enter the error state, reject all future I/O, tear down
    /// events, timers, and the descriptor.
    pub(crate) fn start_fail(&mut self) {
        assert_ne!(self.state, SocketState::Error);
        self.state = SocketState::Error;
        self.shutdown.read = true;
        self.shutdown.write = true;
        self.interest_read = false;
        self.interest_write = false;
        self.registration.unregister();
        self.timer.cancel();
        self.do_close();
    }

    /// Phase two: collect the fixed-order callback deliveries (pending
    /// connect, queued writes in FIFO order with their byte counts, then
    /// the read callback).
    pub(crate) fn collect_fail_deliveries(&mut self) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        if let Some(cb) = self.connect_callback.take() {
            deliveries.push(Delivery::ConnectError(cb));
        }
        deliveries.extend(self.collect_write_deliveries());
        if let Some(cb) = self.read_callback.take() {
            deliveries.push(Delivery::ReadError(cb));
        }
        deliveries
    }

    /// Like [`Self::collect_fail_deliveries`] but the read side terminates
    /// with EOF rather than an error (local close).
    fn collect_close_deliveries(&mut self) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        if let Some(cb) = self.connect_callback.take() {
            deliveries.push(Delivery::ConnectError(cb));
        }
        deliveries.extend(self.collect_write_deliveries());
        if let Some(cb) = self.read_callback.take() {
            deliveries.push(Delivery::ReadEof(cb));
        }
        deliveries
    }

    pub(crate) fn collect_write_deliveries(&mut self) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        while let Some(mut request) = self.write_queue.pop_front() {
            let bytes = request.bytes_written();
            if let Some(cb) = request.take_callback() {
                deliveries.push(Delivery::WriteError(cb, bytes));
            }
        }
        deliveries
    }

    pub(crate) fn finish_fail(&mut self) {
        assert_eq!(self.state, SocketState::Error);
        let deliveries = self.collect_fail_deliveries();
        let err = TransportError::internal("socket closing after error", None);
        deliver_all(self, deliveries, &err);
    }

    fn fail(&mut self, op: &str, err: TransportError) {
        warn!(fd = self.fd, state = ?self.state, %err, "Socket failed in {op}");
        self.start_fail();
        self.finish_fail();
    }

    fn fail_connect(&mut self, op: &str, err: TransportError) {
        warn!(fd = self.fd, peer = ?self.peer_addr, %err, "Connect failed in {op}");
        self.start_fail();
        if let Some(cb) = self.connect_callback.take() {
            if let Ok(mut cb) = cb.try_borrow_mut() {
                cb.connect_error(self, err);
            }
        }
        self.finish_fail();
    }

    fn fail_read(&mut self, op: &str, err: TransportError) {
        warn!(fd = self.fd, %err, "Read failed in {op}");
        self.start_fail();
        if let Some(cb) = self.read_callback.take() {
            if let Ok(mut cb) = cb.try_borrow_mut() {
                cb.read_error(self, err);
            }
        }
        self.finish_fail();
    }

    /// A syscall failure on the head request: only that request gets the
    /// specific error; the rest of the queue drains with the generic one in
    /// `finish_fail`.
    fn fail_write_head(&mut self, mut request: WriteRequest, err: TransportError) {
        warn!(fd = self.fd, %err, "Write failed");
        self.start_fail();
        let bytes = request.bytes_written();
        if let Some(cb) = request.take_callback() {
            if let Ok(mut cb) = cb.try_borrow_mut() {
                cb.write_error(self, bytes, err);
            }
        }
        self.finish_fail();
    }

    /// Failure before the request reached the queue.
    fn fail_new_write(
        &mut self,
        callback: Option<WriteCb>,
        bytes_written: usize,
        err: TransportError,
    ) {
        warn!(fd = self.fd, %err, "Write failed");
        self.start_fail();
        if let Some(cb) = callback {
            if let Ok(mut cb) = cb.try_borrow_mut() {
                cb.write_error(self, bytes_written, err);
            }
        }
        self.finish_fail();
    }

    /// The currently blocked write timed out or similar: fail the head with
    /// the specific error, the rest generically.
    fn fail_write_current(&mut self, op: &str, err: TransportError) {
        warn!(fd = self.fd, %err, "Write failed in {op}");
        self.start_fail();
        if let Some(mut request) = self.write_queue.pop_front() {
            let bytes = request.bytes_written();
            if let Some(cb) = request.take_callback() {
                if let Ok(mut cb) = cb.try_borrow_mut() {
                    cb.write_error(self, bytes, err);
                }
            }
        }
        self.finish_fail();
    }

    // Invalid-state errors go to the supplied callback without disturbing
    // callbacks already bound to the connection, except that a live socket
    // is failed outright (the call indicates a caller bug).

    fn invalid_connect_state(&mut self, callback: Option<ConnectCb>) {
        let err = TransportError::already_open("connect() called with socket in invalid state");
        if matches!(self.state, SocketState::Closed | SocketState::Error) {
            if let Some(cb) = callback {
                if let Ok(mut cb) = cb.try_borrow_mut() {
                    cb.connect_error(self, err);
                }
            }
        } else {
            self.start_fail();
            if let Some(cb) = callback {
                if let Ok(mut cb) = cb.try_borrow_mut() {
                    cb.connect_error(self, err);
                }
            }
            self.finish_fail();
        }
    }

    fn invalid_read_state(&mut self, callback: ReadCb) {
        let err =
            TransportError::not_open("set_read_callback() called with socket in invalid state");
        if matches!(self.state, SocketState::Closed | SocketState::Error) {
            if let Ok(mut cb) = callback.try_borrow_mut() {
                cb.read_error(self, err);
            }
        } else {
            self.start_fail();
            if let Ok(mut cb) = callback.try_borrow_mut() {
                cb.read_error(self, err);
            }
            self.finish_fail();
        }
    }

    fn invalid_write_state(&mut self, callback: Option<WriteCb>) {
        let err = TransportError::not_open("write() called with socket in invalid state");
        if matches!(self.state, SocketState::Closed | SocketState::Error) {
            if let Some(cb) = callback {
                if let Ok(mut cb) = cb.try_borrow_mut() {
                    cb.write_error(self, 0, err);
                }
            }
        } else {
            self.start_fail();
            if let Some(cb) = callback {
                if let Ok(mut cb) = cb.try_borrow_mut() {
                    cb.write_error(self, 0, err);
                }
            }
            self.finish_fail();
        }
    }
}

// ============================================================================
// Event-loop upcalls
// ============================================================================

impl EventHandler for AsyncSocket {
    fn io_ready(&mut self, ready: Ready) {
        // Writes are processed first to drain the kernel buffer; reads are
        // skipped if write processing moved the socket to another loop.
        let original = self.handle.loop_id();
        if ready.writable {
            self.handle_write();
        }
        if ready.readable {
            if self.handle.loop_id() != original {
                return;
            }
            if self.read_callback.is_some()
                && self.state == SocketState::Established
                && !self.shutdown.read
            {
                self.handle_read();
            } else if self.state == SocketState::Connecting && !ready.writable {
                // Error conditions on a connecting socket can surface as
                // readability.
                self.handle_connect();
            }
        }
    }

    fn timeout_expired(&mut self, _id: TimerId) {
        debug_assert!(self.handle.is_in_loop_thread());
        match self.state {
            SocketState::Connecting => {
                self.fail_connect("timeout_expired", TransportError::timed_out("connect timed out"));
            }
            SocketState::Established => {
                self.fail_write_current("timeout_expired", TransportError::timed_out("write timed out"));
            }
            _ => {}
        }
    }
}

// ============================================================================
// Transport trait implementation
// ============================================================================
//
// The trait impl delegates to the inherent methods above so all logic stays
// in one place; it exists to give callbacks a capability surface shared
// with the TLS overlay.

impl Transport for AsyncSocket {
    fn write(&mut self, callback: Option<WriteCb>, data: Vec<u8>, flags: WriteFlags) {
        AsyncSocket::write(self, callback, data, flags)
    }

    fn writev(&mut self, callback: Option<WriteCb>, bufs: Vec<Vec<u8>>, flags: WriteFlags) {
        AsyncSocket::writev(self, callback, bufs, flags)
    }

    fn write_chain(&mut self, callback: Option<WriteCb>, chain: BufferChain, flags: WriteFlags) {
        AsyncSocket::write_chain(self, callback, chain, flags)
    }

    fn set_read_callback(&mut self, callback: Option<ReadCb>) {
        AsyncSocket::set_read_callback(self, callback)
    }

    fn close(&mut self) {
        AsyncSocket::close(self)
    }

    fn close_now(&mut self) {
        AsyncSocket::close_now(self)
    }

    fn shutdown_write(&mut self) {
        AsyncSocket::shutdown_write(self)
    }

    fn shutdown_write_now(&mut self) {
        AsyncSocket::shutdown_write_now(self)
    }

    fn good(&self) -> bool {
        AsyncSocket::good(self)
    }

    fn connecting(&self) -> bool {
        AsyncSocket::connecting(self)
    }

    fn local_address(&self) -> Option<SocketAddr> {
        AsyncSocket::local_address(self)
    }

    fn peer_address(&self) -> Option<SocketAddr> {
        AsyncSocket::peer_address(self)
    }

    fn app_bytes_written(&self) -> u64 {
        self.app_bytes_written
    }

    fn app_bytes_received(&self) -> u64 {
        self.app_bytes_received
    }
}

impl Drop for AsyncSocket {
    fn drop(&mut self) {
        // No callbacks from Drop: with the last strong reference gone there
        // is no one left to observe them. Resources only.
        self.timer.cancel();
        self.registration.unregister();
        if self.fd >= 0 {
            if let Some(set) = &self.shutdown_set {
                set.remove(self.fd);
            }
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
        self.handle.remove_handler(self.token);
    }
}
