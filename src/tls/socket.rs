use super::client_hello::{parse_client_hello, ClientHelloInfo};
use super::context::{ServerNameCallbackResult, TlsContext, VerifyMode};
use super::{
    HandshakeCb, TlsState, SSL_CLIENT_RENEGOTIATION_ATTEMPT, SSL_EARLY_WRITE,
    SSL_INVALID_RENEGOTIATION,
};
use crate::error::TransportError;
use crate::reactor::{EventHandler, LoopHandle, Ready, TimerHandle, TimerId};
use crate::socket::{
    deliver_all, AsyncSocket, BufferChain, ConnectCb, ReadCb, SocketOption, SocketState, Transport,
    WriteCb, WriteFlags, WriteRequest,
};
use rustls::pki_types::CertificateDer;
use rustls::server::{Accepted, Acceptor};
use std::cell::RefCell;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Timer id for the handshake timer (the shared connect/send timer is
/// [`crate::socket`]'s id 0).
const TIMER_HANDSHAKE: TimerId = TimerId(1);

/// Record sizing used for the end-of-record raw-boundary bound: the
/// engine's plaintext fragment ceiling and a generous per-record framing
/// overhead (header, nonce/IV, MAC/tag, padding).
const MAX_PLAINTEXT_PER_RECORD: u64 = 16 * 1024;
const MAX_RECORD_OVERHEAD: u64 = 80;

/// Upper bound on the raw-stream position of the last record byte carrying
/// the tracked application EOR, given the app bytes fed to the engine but
/// not yet flushed to the wire.
fn min_eor_raw_bound(raw_bytes_written: u64, unflushed_app_bytes: u64) -> u64 {
    let records = unflushed_app_bytes.div_ceil(MAX_PLAINTEXT_PER_RECORD).max(1);
    raw_bytes_written + unflushed_app_bytes + records * MAX_RECORD_OVERHEAD
}

/// Whether a wire write of `chunk_len` starting at `raw_written` reaches
/// the tracked boundary.
fn crosses_eor_boundary(raw_written: u64, chunk_len: usize, min_eor_raw_byte_no: u64) -> bool {
    min_eor_raw_byte_no != 0 && raw_written + chunk_len as u64 >= min_eor_raw_byte_no
}

enum Engine {
    None,
    Accepting(Acceptor),
    Active(rustls::Connection),
}

/// Walks record headers on the inbound raw stream.
///
/// The engine gives no signal at the moment a peer *starts* a
/// renegotiation, only a protocol error once it chokes on the message.
/// Watching the record layer directly spots the plaintext handshake-type
/// record (the new ClientHello or HelloRequest) the instant it arrives.
/// Must observe every inbound byte from the start of the stream to stay
/// aligned on record boundaries; the flag is cleared when the legitimate
/// handshake finishes.
#[derive(Default)]
struct RecordWatcher {
    skip: usize,
    header: [u8; 5],
    have: usize,
    saw_handshake_record: bool,
}

impl RecordWatcher {
    const CONTENT_TYPE_HANDSHAKE: u8 = 22;

    /// Whether the next inbound byte starts a record header.
    fn at_record_boundary(&self) -> bool {
        self.skip == 0 && self.have == 0
    }

    fn observe(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            if self.skip > 0 {
                let n = self.skip.min(bytes.len());
                self.skip -= n;
                bytes = &bytes[n..];
                continue;
            }
            let n = (5 - self.have).min(bytes.len());
            self.header[self.have..self.have + n].copy_from_slice(&bytes[..n]);
            self.have += n;
            bytes = &bytes[n..];
            if self.have == 5 {
                if self.header[0] == Self::CONTENT_TYPE_HANDSHAKE {
                    self.saw_handshake_record = true;
                }
                self.skip = u16::from_be_bytes([self.header[3], self.header[4]]) as usize;
                self.have = 0;
            }
        }
    }
}

/// Reads raw record bytes from the descriptor into the engine, counting
/// them, feeding the record watcher, and optionally teeing into the
/// ClientHello capture buffer.
struct FdReader<'a> {
    fd: RawFd,
    raw_bytes_received: &'a mut u64,
    watcher: &'a mut RecordWatcher,
    tee: Option<&'a mut Vec<u8>>,
}

impl io::Read for FdReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let rv = unsafe {
            libc::recv(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if rv < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = rv as usize;
        *self.raw_bytes_received += n as u64;
        self.watcher.observe(&buf[..n]);
        if let Some(tee) = self.tee.as_mut() {
            tee.extend_from_slice(&buf[..n]);
        }
        Ok(n)
    }
}

/// Writes record bytes to the descriptor, switching the `sendmsg` flags to
/// MSG_EOR on the write that crosses the tracked raw boundary, so the
/// kernel sees the application's end-of-record even though the engine
/// re-frames plaintext into records.
struct EorWriter<'a> {
    fd: RawFd,
    raw_bytes_written: &'a mut u64,
    min_eor_raw_byte_no: &'a mut u64,
    cork: bool,
}

impl io::Write for EorWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let eor = crosses_eor_boundary(*self.raw_bytes_written, buf.len(), *self.min_eor_raw_byte_no);
        let mut flags = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
        if eor {
            flags |= libc::MSG_EOR;
        } else if self.cork {
            flags |= libc::MSG_MORE;
        }

        let iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &iov as *const libc::iovec as *mut libc::iovec;
        msg.msg_iovlen = 1;

        let rv = unsafe { libc::sendmsg(self.fd, &msg, flags) };
        if rv < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = rv as usize;
        *self.raw_bytes_written += n as u64;
        if eor && *self.raw_bytes_written >= *self.min_eor_raw_byte_no {
            *self.min_eor_raw_byte_no = 0;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum DrainOutcome {
    /// No more plaintext buffered.
    Drained,
    /// Stop processing (callback gone, cap reached, or loop changed).
    Stop,
    /// The peer cleanly closed the TLS stream.
    RemoteClosed,
}

/// A TLS connection layered over [`AsyncSocket`].
///
/// Embeds the plain socket by value and overrides its read, write,
/// connect, and shutdown paths: readiness first drives the handshake, then
/// the record layer. The TLS context is shared; engine state is per
/// connection.
///
/// A graceful TLS close (close_notify exchange) is intentionally not
/// performed; `close_now` drops the connection at the transport level.
pub struct TlsSocket {
    sock: AsyncSocket,
    ctx: Arc<TlsContext>,
    handshake_ctx: Option<Arc<TlsContext>>,
    state: TlsState,
    server: bool,
    engine: Engine,
    pending_accepted: Option<Accepted>,
    handshake_callback: Option<HandshakeCb>,
    handshake_timer: TimerHandle,
    handshake_timeout: Option<Duration>,
    connect_callback: Option<ConnectCb>,
    verify_override: Option<VerifyMode>,
    server_name: Option<String>,
    server_name_match: bool,
    handshake_complete: bool,
    renegotiate_attempted: bool,
    session_reused: bool,
    raw_bytes_written: u64,
    raw_bytes_received: u64,
    record_watcher: RecordWatcher,
    unflushed_app_bytes: u64,
    app_eor_byte_no: u64,
    min_eor_raw_byte_no: u64,
    hello_buf: Vec<u8>,
    client_hello_info: Option<ClientHelloInfo>,
    selected_alpn: Option<Vec<u8>>,
    negotiated_cipher: Option<String>,
    protocol_version: Option<rustls::ProtocolVersion>,
}

// ============================================================================
// Constructors
// ============================================================================

impl TlsSocket {
    /// Creates an unconnected client socket.
    pub fn new(ctx: Arc<TlsContext>, handle: &LoopHandle) -> Rc<RefCell<TlsSocket>> {
        Self::build_rc(ctx, handle, None, false, -1)
    }

    /// Creates an unconnected client socket that advertises `server_name`
    /// in its ClientHello.
    pub fn with_server_name(
        ctx: Arc<TlsContext>,
        handle: &LoopHandle,
        server_name: impl Into<String>,
    ) -> Rc<RefCell<TlsSocket>> {
        Self::build_rc(ctx, handle, Some(server_name.into()), false, -1)
    }

    /// Adopts an already-connected descriptor; follow with `ssl_accept`
    /// (server) or `ssl_connect` (client).
    pub fn from_fd(
        ctx: Arc<TlsContext>,
        handle: &LoopHandle,
        fd: RawFd,
        server: bool,
    ) -> Rc<RefCell<TlsSocket>> {
        Self::build_rc(ctx, handle, None, server, fd)
    }

    fn build_rc(
        ctx: Arc<TlsContext>,
        handle: &LoopHandle,
        server_name: Option<String>,
        server: bool,
        fd: RawFd,
    ) -> Rc<RefCell<TlsSocket>> {
        let rc = Rc::new_cyclic(|weak: &Weak<RefCell<TlsSocket>>| {
            let handler: Weak<RefCell<dyn EventHandler>> = weak.clone();
            let sock = AsyncSocket::build(handle.clone(), handler);
            RefCell::new(TlsSocket {
                sock,
                ctx,
                handshake_ctx: None,
                state: TlsState::Uninit,
                server,
                engine: Engine::None,
                pending_accepted: None,
                handshake_callback: None,
                handshake_timer: TimerHandle::new(handle),
                handshake_timeout: None,
                connect_callback: None,
                verify_override: None,
                server_name,
                server_name_match: false,
                handshake_complete: false,
                renegotiate_attempted: false,
                session_reused: false,
                raw_bytes_written: 0,
                raw_bytes_received: 0,
                record_watcher: RecordWatcher::default(),
                unflushed_app_bytes: 0,
                app_eor_byte_no: 0,
                min_eor_raw_byte_no: 0,
                hello_buf: Vec::new(),
                client_hello_info: None,
                selected_alpn: None,
                negotiated_cipher: None,
                protocol_version: None,
            })
        });
        {
            let mut this = rc.borrow_mut();
            if fd >= 0 {
                this.sock.adopt_fd(fd);
            }
            let token = this.sock.token();
            let rc_dyn: Rc<RefCell<dyn EventHandler>> = rc.clone();
            let handler: Weak<RefCell<dyn EventHandler>> = Rc::downgrade(&rc_dyn);
            handle.insert_handler(token, handler);
        }
        rc
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl TlsSocket {
    pub fn tls_state(&self) -> TlsState {
        self.state
    }

    pub fn fd(&self) -> RawFd {
        self.sock.fd()
    }

    pub fn is_server(&self) -> bool {
        self.server
    }

    pub fn good(&self) -> bool {
        matches!(
            self.state,
            TlsState::Accepting
                | TlsState::CacheLookup
                | TlsState::RsaAsyncPending
                | TlsState::Connecting
                | TlsState::Established
        ) && !self.sock.is_shut_read()
            && !self.sock.is_shut_write()
            && !self.sock.is_shut_write_pending()
    }

    pub fn connecting(&self) -> bool {
        matches!(
            self.state,
            TlsState::Accepting
                | TlsState::CacheLookup
                | TlsState::RsaAsyncPending
                | TlsState::Connecting
        )
    }

    /// Sets the SNI hostname advertised in the ClientHello (client side;
    /// before connect).
    pub fn set_server_name(&mut self, name: impl Into<String>) {
        self.server_name = Some(name.into());
    }

    /// The SNI hostname: configured on the client side, received on the
    /// server side.
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// Server side: whether the server-name callback recognized the
    /// client's SNI.
    pub fn server_name_matched(&self) -> bool {
        self.server_name_match
    }

    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    pub fn renegotiation_attempted(&self) -> bool {
        self.renegotiate_attempted
    }

    /// Whether the handshake resumed a previous session instead of running
    /// a full exchange.
    pub fn session_reused(&self) -> bool {
        self.session_reused
    }

    /// The application protocol negotiated via ALPN.
    pub fn selected_alpn_protocol(&self) -> Option<&[u8]> {
        self.selected_alpn.as_deref()
    }

    pub fn negotiated_cipher_name(&self) -> Option<&str> {
        self.negotiated_cipher.as_deref()
    }

    pub fn ssl_version(&self) -> Option<rustls::ProtocolVersion> {
        self.protocol_version
    }

    /// Wire bytes written, including record framing and handshake traffic.
    pub fn raw_bytes_written(&self) -> u64 {
        self.raw_bytes_written
    }

    /// Application-stream position of the byte currently tracked for
    /// end-of-record signalling; 0 when none is tracked.
    pub fn app_eor_byte_no(&self) -> u64 {
        self.app_eor_byte_no
    }

    /// Wire bytes received, including record framing and handshake traffic.
    pub fn raw_bytes_received(&self) -> u64 {
        self.raw_bytes_received
    }

    pub fn app_bytes_written(&self) -> u64 {
        self.sock.app_bytes_written()
    }

    pub fn app_bytes_received(&self) -> u64 {
        self.sock.app_bytes_received()
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.sock.local_address()
    }

    pub fn peer_address(&self) -> Option<SocketAddr> {
        self.sock.peer_address()
    }

    pub fn peer_certificates(&self) -> Vec<CertificateDer<'static>> {
        match &self.engine {
            Engine::Active(conn) => conn
                .peer_certificates()
                .map(|certs| certs.to_vec())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// The captured ClientHello, when parsing was enabled on the context.
    pub fn client_hello_info(&self) -> Option<&ClientHelloInfo> {
        self.client_hello_info.as_ref()
    }

    /// Swaps the context used to finish the current server-side handshake.
    /// Meant to be called from the server-name callback.
    pub fn switch_server_tls_context(&mut self, ctx: Arc<TlsContext>) {
        assert!(self.server, "context switching is a server-side operation");
        self.handshake_ctx = Some(ctx);
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        self.sock.loop_handle()
    }

    pub fn set_send_timeout(&mut self, timeout: Option<Duration>) {
        self.sock.set_send_timeout(timeout);
    }

    pub fn set_max_reads_per_event(&mut self, max: usize) {
        self.sock.set_max_reads_per_event(max);
    }

    pub fn set_shutdown_socket_set(&mut self, set: Option<crate::socket::ShutdownSocketSet>) {
        self.sock.set_shutdown_socket_set(set);
    }

    /// Moves the socket (and its handshake timer) to another event loop;
    /// same restrictions as on the plain socket.
    pub fn attach_event_base(&mut self, handle: &LoopHandle) {
        assert!(!self.handshake_timer.is_scheduled());
        self.sock.attach_event_base(handle);
        self.handshake_timer = TimerHandle::new(handle);
    }
}

// ============================================================================
// Connect and handshake initiation
// ============================================================================

impl TlsSocket {
    /// Connects and handshakes in one step; the connect callback fires
    /// after the TLS session is established. The timeout covers each phase.
    pub fn connect(
        &mut self,
        callback: Option<ConnectCb>,
        addr: SocketAddr,
        timeout: Option<Duration>,
        options: &[SocketOption],
        bind_addr: Option<SocketAddr>,
    ) {
        if self.state != TlsState::Uninit || self.sock.state() != SocketState::Uninit {
            let err = TransportError::already_open("connect() called with socket in invalid state");
            if let Some(cb) = callback {
                if let Ok(mut cb) = cb.try_borrow_mut() {
                    cb.connect_error(self, err);
                }
            }
            return;
        }

        self.connect_callback = callback;
        self.handshake_timeout = timeout;
        self.state = TlsState::Connecting;
        // The TCP phase runs on the plain socket with no callback; its
        // completion is intercepted in io_ready.
        self.sock.connect(None, addr, timeout, options, bind_addr);

        match self.sock.state() {
            SocketState::Established => self.start_handshake_connect(false),
            SocketState::Connecting => {}
            _ => {
                self.state = TlsState::Error;
                let err = TransportError::not_open("connect failed");
                if let Some(cb) = self.connect_callback.take() {
                    if let Ok(mut cb) = cb.try_borrow_mut() {
                        cb.connect_error(self, err.clone());
                    }
                }
                if let Some(cb) = self.handshake_callback.take() {
                    if let Ok(mut cb) = cb.try_borrow_mut() {
                        cb.handshake_error(self, err);
                    }
                }
            }
        }
    }

    /// Starts the client-side handshake on an established socket.
    pub fn ssl_connect(
        &mut self,
        callback: Option<HandshakeCb>,
        timeout: Option<Duration>,
        verify: Option<VerifyMode>,
    ) {
        if self.state != TlsState::Uninit || self.sock.state() != SocketState::Established {
            return self.invalid_handshake_state(callback);
        }
        self.server = false;
        self.verify_override = verify;
        self.handshake_callback = callback;
        self.handshake_timeout = timeout;
        self.start_handshake_connect(false);
    }

    /// Starts the server-side handshake on an accepted socket.
    pub fn ssl_accept(
        &mut self,
        callback: Option<HandshakeCb>,
        timeout: Option<Duration>,
        verify: Option<VerifyMode>,
    ) {
        if self.state != TlsState::Uninit || self.sock.state() != SocketState::Established {
            return self.invalid_handshake_state(callback);
        }
        info!(fd = self.sock.fd(), "Starting TLS accept");
        self.server = true;
        self.verify_override = verify;
        self.handshake_callback = callback;
        if let Some(t) = timeout {
            self.handshake_timer
                .schedule(t, self.sock.handler(), TIMER_HANDSHAKE);
        }
        self.engine = Engine::Accepting(Acceptor::default());
        self.state = TlsState::Accepting;
        self.set_tls_interest(true, false);
    }

    fn start_handshake_connect(&mut self, closing: bool) {
        debug!(fd = self.sock.fd(), sni = ?self.server_name, "Starting TLS connect");
        if let Some(t) = self.handshake_timeout {
            self.handshake_timer
                .schedule(t, self.sock.handler(), TIMER_HANDSHAKE);
        }

        let config = match self.ctx.client_config(self.verify_override) {
            Ok(config) => config,
            Err(err) => {
                return self.fail_handshake(TransportError::ssl(
                    format!("failed to build client TLS config: {err}"),
                    None,
                ))
            }
        };
        let server_name: rustls::pki_types::ServerName<'static> = match &self.server_name {
            Some(name) => match rustls::pki_types::ServerName::try_from(name.clone()) {
                Ok(sn) => sn,
                Err(_) => {
                    return self.fail_handshake(TransportError::ssl(
                        format!("invalid SNI server name '{name}'"),
                        None,
                    ))
                }
            },
            None => match self.sock.peer_address() {
                Some(addr) => rustls::pki_types::ServerName::IpAddress(addr.ip().into()),
                None => {
                    return self
                        .fail_handshake(TransportError::ssl("peer address unknown", None))
                }
            },
        };

        match rustls::ClientConnection::new(config, server_name) {
            Ok(conn) => {
                self.engine = Engine::Active(rustls::Connection::Client(conn));
                self.state = if closing {
                    TlsState::ConnectingClosing
                } else {
                    TlsState::Connecting
                };
                self.drive_handshake_io();
            }
            Err(err) => self.fail_handshake(TransportError::ssl(
                format!("failed to create TLS client engine: {err}"),
                None,
            )),
        }
    }

    fn handle_tcp_connect(&mut self) {
        let closing = self.state == TlsState::ConnectingClosing;
        match self.sock.finish_connect() {
            Err(err) => self.fail_handshake(err),
            Ok(()) => self.start_handshake_connect(closing),
        }
    }
}

// ============================================================================
// Server-side accept
// ============================================================================

impl TlsSocket {
    fn drive_accept(&mut self) {
        loop {
            let fd = self.sock.fd();
            let parse_hello = self.ctx.parse_client_hello;
            let Engine::Accepting(acceptor) = &mut self.engine else {
                return self.drive_handshake_io();
            };
            let mut reader = FdReader {
                fd,
                raw_bytes_received: &mut self.raw_bytes_received,
                watcher: &mut self.record_watcher,
                tee: parse_hello.then_some(&mut self.hello_buf),
            };
            match acceptor.read_tls(&mut reader) {
                Ok(0) => {
                    return self.fail_handshake(TransportError::eof(
                        "connection closed during handshake",
                    ))
                }
                Ok(n) => trace!(fd, len = n, "Read ClientHello bytes"),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    self.set_tls_interest(true, false);
                    return;
                }
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(err) => {
                    return self.fail_handshake(TransportError::internal(
                        "recv() failed during handshake",
                        err.raw_os_error(),
                    ))
                }
            }

            let Engine::Accepting(acceptor) = &mut self.engine else {
                unreachable!()
            };
            match acceptor.accept() {
                Ok(None) => continue,
                Ok(Some(accepted)) => {
                    self.engine = Engine::None;
                    return self.process_client_hello(accepted);
                }
                Err((err, mut alert)) => {
                    let mut writer = EorWriter {
                        fd,
                        raw_bytes_written: &mut self.raw_bytes_written,
                        min_eor_raw_byte_no: &mut self.min_eor_raw_byte_no,
                        cork: false,
                    };
                    let _ = alert.write(&mut writer);
                    return self.fail_handshake(TransportError::ssl(
                        format!("TLS accept failed: {err}"),
                        None,
                    ));
                }
            }
        }
    }

    fn process_client_hello(&mut self, accepted: Accepted) {
        if self.ctx.parse_client_hello && self.client_hello_info.is_none() {
            self.client_hello_info = parse_client_hello(&self.hello_buf);
        }
        self.server_name = accepted.client_hello().server_name().map(str::to_string);

        // Observers run before the server-name callback, in registration
        // order. Any of them may pause the accept for an asynchronous
        // session-cache lookup.
        let ctx = self.ctx.clone();
        if let Some(info) = self.client_hello_info.clone() {
            for observer in &ctx.client_hello_observers {
                observer(self, &info);
                if self.state == TlsState::Error || self.state == TlsState::Closed {
                    return;
                }
            }
        }
        if self.state == TlsState::CacheLookup {
            self.pending_accepted = Some(accepted);
            return;
        }
        self.continue_accept(accepted);
    }

    fn continue_accept(&mut self, accepted: Accepted) {
        let ctx = self.ctx.clone();
        if let Some(callback) = ctx.server_name_callback.as_ref() {
            match callback(self) {
                ServerNameCallbackResult::Found => self.server_name_match = true,
                ServerNameCallbackResult::NotFound => self.server_name_match = false,
                ServerNameCallbackResult::FatalAlert => {
                    return self.fail_handshake(TransportError::ssl(
                        "server name not recognized: fatal unrecognized_name(112) alert",
                        None,
                    ));
                }
            }
        }

        let effective_ctx = self.handshake_ctx.clone().unwrap_or(ctx);
        let config = match effective_ctx.server_config_for_accept(self.verify_override) {
            Ok(config) => config,
            Err(err) => {
                return self.fail_handshake(TransportError::ssl(
                    format!("failed to build server TLS config: {err}"),
                    None,
                ))
            }
        };
        match accepted.into_connection(config) {
            Ok(conn) => {
                self.engine = Engine::Active(rustls::Connection::Server(conn));
                self.drive_handshake_io();
            }
            Err((err, mut alert)) => {
                let fd = self.sock.fd();
                let mut writer = EorWriter {
                    fd,
                    raw_bytes_written: &mut self.raw_bytes_written,
                    min_eor_raw_byte_no: &mut self.min_eor_raw_byte_no,
                    cork: false,
                };
                let _ = alert.write(&mut writer);
                self.fail_handshake(TransportError::ssl(
                    format!("TLS accept failed: {err}"),
                    None,
                ))
            }
        }
    }

    /// Parks the accept in the cache-lookup state. Call from a ClientHello
    /// observer; resume with [`Self::restart_accept`].
    pub fn pause_for_cache_lookup(&mut self) {
        if self.state == TlsState::Accepting {
            self.state = TlsState::CacheLookup;
            self.set_tls_interest(false, false);
        }
    }

    /// Resumes an accept parked by [`Self::pause_for_cache_lookup`].
    pub fn restart_accept(&mut self) {
        assert_eq!(self.state, TlsState::CacheLookup);
        self.state = TlsState::Accepting;
        match self.pending_accepted.take() {
            Some(accepted) => self.continue_accept(accepted),
            None => {
                self.set_tls_interest(true, false);
            }
        }
    }
}

// ============================================================================
// Handshake drive loop
// ============================================================================

impl TlsSocket {
    fn drive_handshake(&mut self) {
        match self.engine {
            Engine::Accepting(_) => self.drive_accept(),
            Engine::Active(_) => self.drive_handshake_io(),
            Engine::None => {}
        }
    }

    fn drive_handshake_io(&mut self) {
        loop {
            // Flush outbound handshake records first; a full kernel buffer
            // is the want-write condition.
            match self.flush_tls() {
                Err(err) => return self.fail_handshake(err),
                Ok(false) => {
                    self.set_tls_interest(false, true);
                    return;
                }
                Ok(true) => {}
            }

            let handshaking = match &self.engine {
                Engine::Active(conn) => conn.is_handshaking(),
                _ => return,
            };
            if !handshaking {
                return self.handshake_success();
            }

            // Want-read: pull more peer bytes into the engine.
            let fd = self.sock.fd();
            let result = {
                let Engine::Active(conn) = &mut self.engine else {
                    return;
                };
                let mut reader = FdReader {
                    fd,
                    raw_bytes_received: &mut self.raw_bytes_received,
                    watcher: &mut self.record_watcher,
                    tee: None,
                };
                conn.read_tls(&mut reader)
            };
            match result {
                Ok(0) => {
                    return self.fail_handshake(TransportError::eof(
                        "connection closed during handshake",
                    ))
                }
                Ok(_) => {
                    if let Err(err) = self.process_packets() {
                        return self.fail_handshake(err);
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    let wants_write = matches!(&self.engine, Engine::Active(c) if c.wants_write());
                    if wants_write {
                        continue;
                    }
                    self.set_tls_interest(true, false);
                    return;
                }
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => {}
                Err(err) => {
                    return self.fail_handshake(TransportError::internal(
                        "recv() failed during handshake",
                        err.raw_os_error(),
                    ))
                }
            }
        }
    }

    fn handshake_success(&mut self) {
        let closing = self.state == TlsState::ConnectingClosing;
        self.handshake_complete = true;
        self.handshake_timer.cancel();
        self.state = TlsState::Established;
        // The legitimate handshake records have all been seen; from here on
        // a handshake-type record means renegotiation.
        self.record_watcher.saw_handshake_record = false;

        if let Engine::Active(conn) = &self.engine {
            self.session_reused =
                conn.handshake_kind() == Some(rustls::HandshakeKind::Resumed);
            self.selected_alpn = conn.alpn_protocol().map(|proto| proto.to_vec());
            self.negotiated_cipher = conn
                .negotiated_cipher_suite()
                .map(|suite| format!("{:?}", suite.suite()));
            self.protocol_version = conn.protocol_version();
        }
        self.hello_buf = Vec::new();
        info!(
            fd = self.sock.fd(),
            server = self.server,
            reused = self.session_reused,
            cipher = ?self.negotiated_cipher,
            "TLS handshake completed"
        );

        // Post-handshake verification hook: the callback sees the peer's
        // end-entity certificate and may veto the connection.
        let callback = self.handshake_callback.take();
        if let Some(cb) = callback.clone() {
            let end_entity = self.peer_certificates().into_iter().next();
            if let Some(cert) = end_entity {
                let accepted = cb
                    .try_borrow_mut()
                    .map(|mut cb| cb.handshake_verify(self, true, &cert))
                    .unwrap_or(true);
                if !accepted {
                    self.handshake_callback = callback;
                    return self.fail_handshake(TransportError::ssl(
                        "peer certificate rejected by handshake callback",
                        None,
                    ));
                }
            }
        }

        let original = self.sock.loop_id();
        if let Some(cb) = callback {
            if let Ok(mut cb) = cb.try_borrow_mut() {
                cb.handshake_success(self);
            }
        }
        if let Some(cb) = self.connect_callback.take() {
            if let Ok(mut cb) = cb.try_borrow_mut() {
                cb.connect_success(self);
            }
        }
        if self.sock.loop_id() != original || self.state != TlsState::Established {
            return;
        }

        if closing {
            self.state = TlsState::Closing;
            self.handle_write_tls();
            return;
        }

        // Deferred initial read/write pass.
        let want_read = self.want_read();
        if !self.set_tls_interest(want_read, false) {
            return;
        }
        if want_read {
            match self.deliver_plaintext(&mut 0) {
                DrainOutcome::RemoteClosed => return self.handle_remote_close(),
                DrainOutcome::Stop => return,
                DrainOutcome::Drained => {}
            }
        }
        self.handle_write_tls();
    }

    fn process_packets(&mut self) -> Result<(), TransportError> {
        let fd = self.sock.fd();
        let Engine::Active(conn) = &mut self.engine else {
            return Ok(());
        };
        match conn.process_new_packets() {
            Ok(_) => Ok(()),
            Err(err) => {
                // Flush the alert the engine queued for the peer.
                let mut writer = EorWriter {
                    fd,
                    raw_bytes_written: &mut self.raw_bytes_written,
                    min_eor_raw_byte_no: &mut self.min_eor_raw_byte_no,
                    cork: false,
                };
                let _ = conn.write_tls(&mut writer);

                if self.handshake_complete && matches!(err, rustls::Error::PeerMisbehaved(_)) {
                    // Post-handshake handshake traffic is a renegotiation
                    // attempt; renegotiation is rejected, not supported.
                    self.renegotiate_attempted = true;
                    Err(TransportError::ssl(
                        "peer attempted TLS renegotiation",
                        Some(SSL_INVALID_RENEGOTIATION),
                    ))
                } else {
                    Err(TransportError::ssl(
                        format!("TLS protocol error: {err}"),
                        None,
                    ))
                }
            }
        }
    }
}

// ============================================================================
// Established read path
// ============================================================================

impl TlsSocket {
    fn want_read(&self) -> bool {
        self.state == TlsState::Established
            && self.sock.has_read_callback()
            && !self.sock.is_shut_read()
    }

    fn handle_read_tls(&mut self) {
        let original = self.sock.loop_id();
        let mut reads = 0usize;
        loop {
            if !self.sock.has_read_callback() || self.sock.loop_id() != original {
                return;
            }

            let fd = self.sock.fd();
            let raw = {
                let Engine::Active(conn) = &mut self.engine else {
                    return;
                };
                let mut reader = FdReader {
                    fd,
                    raw_bytes_received: &mut self.raw_bytes_received,
                    watcher: &mut self.record_watcher,
                    tee: None,
                };
                conn.read_tls(&mut reader)
            };

            let mut blocked = false;
            match raw {
                Ok(0) => return self.handle_remote_close(),
                Ok(n) => {
                    trace!(fd, len = n, "Read encrypted data from socket");
                    // A handshake-type record after the handshake finished
                    // is the peer opening a renegotiation; reject it before
                    // the engine sees the message.
                    if self.record_watcher.saw_handshake_record {
                        self.renegotiate_attempted = true;
                        return self.fail_read_tls(TransportError::ssl(
                            "peer attempted TLS renegotiation",
                            Some(SSL_INVALID_RENEGOTIATION),
                        ));
                    }
                    if let Err(err) = self.process_packets() {
                        return self.fail_read_tls(err);
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => blocked = true,
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(err) => {
                    return self.fail_read_tls(TransportError::internal(
                        "recv() failed",
                        err.raw_os_error(),
                    ))
                }
            }

            match self.deliver_plaintext(&mut reads) {
                DrainOutcome::RemoteClosed => return self.handle_remote_close(),
                DrainOutcome::Stop => return,
                DrainOutcome::Drained => {}
            }
            if blocked {
                return;
            }
        }
    }

    /// Drains decrypted plaintext into the read callback's buffers.
    fn deliver_plaintext(&mut self, reads: &mut usize) -> DrainOutcome {
        let original = self.sock.loop_id();
        loop {
            let Some(cb) = self.sock.read_cb() else {
                return DrainOutcome::Stop;
            };
            let result = {
                let Ok(mut cb_ref) = cb.try_borrow_mut() else {
                    return DrainOutcome::Stop;
                };
                let buf = cb_ref.get_read_buffer();
                if buf.is_empty() {
                    drop(cb_ref);
                    self.fail_read_tls(TransportError::bad_args(
                        "get_read_buffer() returned empty buffer",
                    ));
                    return DrainOutcome::Stop;
                }
                let Engine::Active(conn) = &mut self.engine else {
                    return DrainOutcome::Stop;
                };
                conn.reader().read(buf)
            };

            match result {
                Ok(0) => return DrainOutcome::RemoteClosed,
                Ok(n) => {
                    trace!(fd = self.sock.fd(), len = n, "Read plaintext from TLS");
                    self.sock.add_app_bytes_received(n as u64);
                    if let Ok(mut cb_ref) = cb.try_borrow_mut() {
                        cb_ref.read_data_available(self, n);
                    }
                    if self.sock.loop_id() != original || self.state != TlsState::Established {
                        return DrainOutcome::Stop;
                    }
                    *reads += 1;
                    let cap = self.max_reads_cap();
                    if cap != 0 && *reads >= cap {
                        // Plaintext may still be buffered in the engine;
                        // re-announce readiness so the next pass drains it.
                        let _ = self.sock.rearm_events();
                        return DrainOutcome::Stop;
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return DrainOutcome::Drained,
                Err(err) => {
                    self.fail_read_tls(TransportError::ssl(
                        format!("TLS read failed: {err}"),
                        None,
                    ));
                    return DrainOutcome::Stop;
                }
            }
        }
    }

    fn max_reads_cap(&self) -> usize {
        // The plain socket owns the setting; zero means unlimited.
        self.sock.max_reads_per_event()
    }

    fn handle_remote_close(&mut self) {
        info!(fd = self.sock.fd(), "Connection closed by peer");
        self.sock.set_shut_read();
        let keep_write = self.sock.interest_write();
        if !self.set_tls_interest(false, keep_write) {
            return;
        }
        if self.state == TlsState::Established {
            self.state = TlsState::RemoteClosed;
        }
        if let Some(cb) = self.sock.take_read_cb() {
            if let Ok(mut cb) = cb.try_borrow_mut() {
                cb.read_eof(self);
            }
        }
    }
}

// ============================================================================
// Established write path with EOR tracking
// ============================================================================

impl TlsSocket {
    fn write_impl_tls(
        &mut self,
        callback: Option<WriteCb>,
        segments: Vec<Vec<u8>>,
        flags: WriteFlags,
    ) {
        debug_assert!(self.sock.loop_handle().is_in_loop_thread());
        if self.sock.is_shut_write() || self.sock.is_shut_write_pending() {
            return self.invalid_write_tls(callback);
        }

        match self.state {
            TlsState::Established | TlsState::RemoteClosed => {
                if !self.renegotiate_attempted && self.peer_renegotiation_pending() {
                    // The peer opened a renegotiation that the read path has
                    // not consumed yet; no application data may follow it.
                    self.renegotiate_attempted = true;
                    return self.fail_new_write_tls(
                        callback,
                        TransportError::ssl(
                            "peer attempted TLS renegotiation",
                            Some(SSL_CLIENT_RENEGOTIATION_ATTEMPT),
                        ),
                    );
                }
                let mut request = WriteRequest::new(callback, segments, flags);
                if request.is_complete() {
                    if let Some(cb) = request.take_callback() {
                        if let Ok(mut cb) = cb.try_borrow_mut() {
                            cb.write_success(self);
                        }
                    }
                    return;
                }
                self.sock.queue().push_back(request);
                if !self.sock.interest_write() {
                    self.handle_write_tls();
                }
            }
            // Writes submitted during the TCP phase of a chained connect
            // are queued and flushed after the handshake.
            TlsState::Connecting if matches!(self.engine, Engine::None) => {
                self.sock
                    .queue()
                    .push_back(WriteRequest::new(callback, segments, flags));
            }
            TlsState::Uninit
            | TlsState::Accepting
            | TlsState::CacheLookup
            | TlsState::RsaAsyncPending
            | TlsState::Connecting => {
                // Early write: the record layer is not ready for
                // application data.
                self.fail_new_write_tls(
                    callback,
                    TransportError::ssl(
                        "write attempted before TLS handshake completed",
                        Some(SSL_EARLY_WRITE),
                    ),
                );
            }
            TlsState::Closing
            | TlsState::ConnectingClosing
            | TlsState::Closed
            | TlsState::Error => self.invalid_write_tls(callback),
        }
    }

    fn handle_write_tls(&mut self) {
        let original = self.sock.loop_id();
        loop {
            if self.sock.loop_id() != original {
                return;
            }

            match self.flush_tls() {
                Err(err) => return self.fail_write_tls(err),
                Ok(false) => {
                    // Kernel buffer full: stay write-armed and wait.
                    let want_read = self.want_read();
                    if !self.set_tls_interest(want_read, true) {
                        return;
                    }
                    if let Some(t) = self.sock.send_timeout() {
                        self.sock.schedule_send_timer(t);
                    }
                    return;
                }
                Ok(true) => {}
            }

            match self.sock.queue().front().map(WriteRequest::is_complete) {
                None => {
                    // Queue drained and records flushed.
                    let want_read = self.want_read();
                    if !self.set_tls_interest(want_read, false) {
                        return;
                    }
                    self.sock.cancel_send_timer();
                    if self.sock.is_shut_write_pending() {
                        self.sock.promote_write_shutdown();
                        // No close_notify; the half-close is transport
                        // level only.
                        self.sock.kernel_shutdown_write();
                        if self.sock.is_shut_read() {
                            return self.finish_local_close();
                        }
                    }
                    if matches!(self.state, TlsState::Closing | TlsState::ConnectingClosing) {
                        return self.finish_local_close();
                    }
                    return;
                }
                Some(true) => {
                    let mut request = self.sock.queue().pop_front().expect("non-empty queue");
                    if let Some(cb) = request.take_callback() {
                        if let Ok(mut cb) = cb.try_borrow_mut() {
                            cb.write_success(self);
                        }
                    }
                    if !matches!(
                        self.state,
                        TlsState::Established
                            | TlsState::RemoteClosed
                            | TlsState::Closing
                            | TlsState::ConnectingClosing
                    ) {
                        return;
                    }
                    continue;
                }
                Some(false) => {}
            }

            match self.feed_engine() {
                Err(err) => return self.fail_write_tls(err),
                Ok(0) => {
                    // The engine refuses more plaintext until records
                    // drain; wait for writability.
                    let want_read = self.want_read();
                    if !self.set_tls_interest(want_read, true) {
                        return;
                    }
                    if let Some(t) = self.sock.send_timeout() {
                        self.sock.schedule_send_timer(t);
                    }
                    return;
                }
                Ok(_) => {}
            }
        }
    }

    /// Peeks the inbound stream for an unconsumed handshake-type record.
    ///
    /// Only meaningful when the record watcher sits on a record boundary;
    /// mid-record the next byte is payload, not a content type, and the
    /// check is skipped. MSG_PEEK leaves the byte for the read path.
    fn peer_renegotiation_pending(&self) -> bool {
        if !self.handshake_complete || !self.record_watcher.at_record_boundary() {
            return false;
        }
        let fd = self.sock.fd();
        if fd < 0 {
            return false;
        }
        let mut content_type = 0u8;
        let rv = unsafe {
            libc::recv(
                fd,
                &mut content_type as *mut u8 as *mut libc::c_void,
                1,
                libc::MSG_DONTWAIT | libc::MSG_PEEK,
            )
        };
        rv == 1 && content_type == RecordWatcher::CONTENT_TYPE_HANDSHAKE
    }

    /// Feeds the head request's current segment into the engine, advancing
    /// the request cursor and the EOR bookkeeping. Returns the bytes the
    /// engine accepted; 0 means its buffer is full.
    fn feed_engine(&mut self) -> Result<usize, TransportError> {
        let (written, finishes_request, eor) = {
            let Some(request) = self.sock.queue().front_mut() else {
                return Ok(0);
            };
            let flags = request.flags();
            let in_final = request.in_final_segment();
            let Some(slice) = request.current_slice() else {
                return Ok(0);
            };
            let Engine::Active(conn) = &mut self.engine else {
                return Ok(0);
            };
            let written = match conn.writer().write(slice) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::WouldBlock => 0,
                Err(err) => {
                    return Err(TransportError::ssl(
                        format!("TLS write failed: {err}"),
                        None,
                    ))
                }
            };
            let finishes_request = in_final && written == slice.len();
            if written > 0 {
                request.consume(written);
            }
            (written, finishes_request, flags.eor)
        };

        if written > 0 {
            trace!(fd = self.sock.fd(), len = written, "Wrote plaintext to TLS");
            self.sock.add_app_bytes_written(written as u64);
            self.unflushed_app_bytes += written as u64;
            if eor && finishes_request {
                // Remember where this record's final application byte must
                // surface on the wire.
                self.app_eor_byte_no = self.sock.app_bytes_written();
                self.min_eor_raw_byte_no =
                    min_eor_raw_bound(self.raw_bytes_written, self.unflushed_app_bytes);
            }
        }
        Ok(written)
    }

    /// Flushes the engine's pending records to the descriptor. Ok(true)
    /// when fully flushed, Ok(false) when the kernel buffer is full.
    fn flush_tls(&mut self) -> Result<bool, TransportError> {
        let fd = self.sock.fd();
        let cork = self.sock.queue_len() > 1;
        let Engine::Active(conn) = &mut self.engine else {
            return Ok(true);
        };
        loop {
            if !conn.wants_write() {
                self.unflushed_app_bytes = 0;
                return Ok(true);
            }
            let mut writer = EorWriter {
                fd,
                raw_bytes_written: &mut self.raw_bytes_written,
                min_eor_raw_byte_no: &mut self.min_eor_raw_byte_no,
                cork,
            };
            match conn.write_tls(&mut writer) {
                Ok(0) => return Ok(true),
                Ok(n) => trace!(fd, len = n, "Wrote encrypted data to socket"),
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(err) => {
                    return Err(TransportError::internal(
                        "sendmsg() failed",
                        err.raw_os_error(),
                    ))
                }
            }
        }
    }
}

// ============================================================================
// Shutdown and close
// ============================================================================

impl TlsSocket {
    /// Closes after queued writes drain. No close_notify is sent at any
    /// point; graceful TLS closure is out of scope.
    pub fn close(&mut self) {
        if !self.sock.queue_is_empty() {
            match self.state {
                TlsState::Established | TlsState::RemoteClosed => {
                    self.state = TlsState::Closing;
                    self.mark_close_draining();
                    return;
                }
                TlsState::Connecting
                | TlsState::Accepting
                | TlsState::CacheLookup
                | TlsState::RsaAsyncPending => {
                    self.state = TlsState::ConnectingClosing;
                    self.mark_close_draining();
                    return;
                }
                _ => {}
            }
        }
        self.close_now();
    }

    fn mark_close_draining(&mut self) {
        self.sock.set_shut_read();
        self.sock.set_shut_write_pending();
        let keep_write = self.sock.interest_write();
        if !self.set_tls_interest(false, keep_write) {
            return;
        }
        if let Some(cb) = self.sock.take_read_cb() {
            if let Ok(mut cb) = cb.try_borrow_mut() {
                cb.read_eof(self);
            }
        }
    }

    /// Drops the connection immediately; pending callbacks fire with a
    /// local-close error. Repeated calls are safe.
    pub fn close_now(&mut self) {
        self.handshake_timer.cancel();
        match self.state {
            TlsState::Closed | TlsState::Error => {
                let deliveries = self.sock.close_now_quiet();
                if !deliveries.is_empty() {
                    let err = TransportError::local_close("socket closed locally");
                    deliver_all(self, deliveries, &err);
                }
            }
            _ => {
                let was_handshaking = self.connecting();
                self.state = TlsState::Closed;
                let handshake_cb = self.handshake_callback.take();
                let connect_cb = self.connect_callback.take();
                let deliveries = self.sock.close_now_quiet();
                let err = TransportError::local_close("socket closed locally");
                if was_handshaking {
                    if let Some(cb) = handshake_cb {
                        if let Ok(mut cb) = cb.try_borrow_mut() {
                            cb.handshake_error(self, err.clone());
                        }
                    }
                    if let Some(cb) = connect_cb {
                        if let Ok(mut cb) = cb.try_borrow_mut() {
                            cb.connect_error(self, err.clone());
                        }
                    }
                }
                deliver_all(self, deliveries, &err);
            }
        }
    }

    /// Half-closes the write side once queued writes drain. The half-close
    /// is transport level; no close_notify is issued.
    pub fn shutdown_write(&mut self) {
        if self.sock.queue_is_empty() {
            return self.shutdown_write_now();
        }
        self.sock.set_shut_write_pending();
    }

    /// Immediate transport-level write half-close; queued writes fail with
    /// an end-of-file error.
    pub fn shutdown_write_now(&mut self) {
        if self.sock.is_shut_write() {
            return;
        }
        if self.sock.is_shut_read() {
            return self.close_now();
        }
        match self.state {
            TlsState::Established | TlsState::RemoteClosed => {
                self.sock.promote_write_shutdown();
                let want_read = self.want_read();
                if !self.set_tls_interest(want_read, false) {
                    return;
                }
                self.sock.cancel_send_timer();
                self.sock.kernel_shutdown_write();
                let deliveries = self.sock.collect_write_deliveries();
                let err = TransportError::local_close("socket shut down for writes");
                deliver_all(self, deliveries, &err);
            }
            TlsState::Uninit
            | TlsState::Connecting
            | TlsState::Accepting
            | TlsState::CacheLookup
            | TlsState::RsaAsyncPending => {
                self.sock.set_shut_write_pending();
                let deliveries = self.sock.collect_write_deliveries();
                let err = TransportError::local_close("socket shut down for writes");
                deliver_all(self, deliveries, &err);
            }
            _ => {
                warn!(state = ?self.state, "shutdown_write_now() called on finished socket");
            }
        }
    }

    fn finish_local_close(&mut self) {
        self.state = TlsState::Closed;
        self.handshake_timer.cancel();
        let deliveries = self.sock.close_now_quiet();
        let err = TransportError::local_close("socket closed locally");
        deliver_all(self, deliveries, &err);
    }
}

// ============================================================================
// Failure paths
// ============================================================================

impl TlsSocket {
    fn set_tls_interest(&mut self, read: bool, write: bool) -> bool {
        match self.sock.try_set_interest(read, write) {
            Ok(()) => true,
            Err(err) => {
                self.fail_read_tls(TransportError::internal(
                    "failed to update event registration",
                    err.raw_os_error(),
                ));
                false
            }
        }
    }

    fn start_fail_tls(&mut self) {
        self.handshake_timer.cancel();
        self.state = TlsState::Error;
        if self.sock.state() != SocketState::Error {
            self.sock.start_fail();
        }
    }

    fn finish_fail_tls(&mut self) {
        let deliveries = self.sock.collect_fail_deliveries();
        let err = TransportError::internal("socket closing after error", None);
        deliver_all(self, deliveries, &err);
    }

    fn fail_handshake(&mut self, err: TransportError) {
        warn!(fd = self.sock.fd(), server = self.server, %err, "TLS handshake failed");
        self.start_fail_tls();
        if let Some(cb) = self.handshake_callback.take() {
            if let Ok(mut cb) = cb.try_borrow_mut() {
                cb.handshake_error(self, err.clone());
            }
        }
        if let Some(cb) = self.connect_callback.take() {
            if let Ok(mut cb) = cb.try_borrow_mut() {
                cb.connect_error(self, err);
            }
        }
        self.finish_fail_tls();
    }

    fn fail_read_tls(&mut self, err: TransportError) {
        warn!(fd = self.sock.fd(), %err, "TLS read failed");
        self.start_fail_tls();
        if let Some(cb) = self.sock.take_read_cb() {
            if let Ok(mut cb) = cb.try_borrow_mut() {
                cb.read_error(self, err);
            }
        }
        self.finish_fail_tls();
    }

    fn fail_write_tls(&mut self, err: TransportError) {
        warn!(fd = self.sock.fd(), %err, "TLS write failed");
        self.start_fail_tls();
        if let Some(mut request) = self.sock.queue().pop_front() {
            let bytes = request.bytes_written();
            if let Some(cb) = request.take_callback() {
                if let Ok(mut cb) = cb.try_borrow_mut() {
                    cb.write_error(self, bytes, err);
                }
            }
        }
        self.finish_fail_tls();
    }

    fn fail_new_write_tls(&mut self, callback: Option<WriteCb>, err: TransportError) {
        warn!(fd = self.sock.fd(), %err, "TLS write failed");
        self.start_fail_tls();
        if let Some(cb) = callback {
            if let Ok(mut cb) = cb.try_borrow_mut() {
                cb.write_error(self, 0, err);
            }
        }
        self.finish_fail_tls();
    }

    fn invalid_write_tls(&mut self, callback: Option<WriteCb>) {
        let err = TransportError::not_open("write() called with socket in invalid state");
        if matches!(self.state, TlsState::Closed | TlsState::Error) {
            if let Some(cb) = callback {
                if let Ok(mut cb) = cb.try_borrow_mut() {
                    cb.write_error(self, 0, err);
                }
            }
        } else {
            self.start_fail_tls();
            if let Some(cb) = callback {
                if let Ok(mut cb) = cb.try_borrow_mut() {
                    cb.write_error(self, 0, err);
                }
            }
            self.finish_fail_tls();
        }
    }

    fn invalid_read_tls(&mut self, callback: ReadCb) {
        let err =
            TransportError::not_open("set_read_callback() called with socket in invalid state");
        if matches!(self.state, TlsState::Closed | TlsState::Error) {
            if let Ok(mut cb) = callback.try_borrow_mut() {
                cb.read_error(self, err);
            }
        } else {
            self.start_fail_tls();
            if let Ok(mut cb) = callback.try_borrow_mut() {
                cb.read_error(self, err);
            }
            self.finish_fail_tls();
        }
    }

    fn invalid_handshake_state(&mut self, callback: Option<HandshakeCb>) {
        let err = TransportError::already_open("handshake initiated in invalid state");
        if matches!(self.state, TlsState::Closed | TlsState::Error)
            || matches!(self.sock.state(), SocketState::Closed | SocketState::Error)
        {
            if let Some(cb) = callback {
                if let Ok(mut cb) = cb.try_borrow_mut() {
                    cb.handshake_error(self, err);
                }
            }
        } else {
            self.start_fail_tls();
            if let Some(cb) = callback {
                if let Ok(mut cb) = cb.try_borrow_mut() {
                    cb.handshake_error(self, err);
                }
            }
            self.finish_fail_tls();
        }
    }
}

// ============================================================================
// Read subscription
// ============================================================================

impl TlsSocket {
    /// Installs or removes the read subscription.
    ///
    /// Plaintext the engine already decrypted is delivered immediately on
    /// install; otherwise it would sit in the engine with no readable event
    /// left to announce it.
    pub fn set_read_callback(&mut self, callback: Option<ReadCb>) {
        if self.sock.is_shut_read() {
            match callback {
                Some(cb) => self.invalid_read_tls(cb),
                None => self.sock.set_read_callback(None),
            }
            return;
        }
        match self.state {
            TlsState::Closed | TlsState::Error | TlsState::Closing | TlsState::ConnectingClosing => {
                if let Some(cb) = callback {
                    self.invalid_read_tls(cb);
                }
            }
            TlsState::Established => {
                let installed = callback.is_some();
                self.sock.set_read_callback(callback);
                if installed && self.state == TlsState::Established {
                    if let DrainOutcome::RemoteClosed = self.deliver_plaintext(&mut 0) {
                        self.handle_remote_close();
                    }
                }
            }
            _ => {
                // Stored now, armed when the handshake completes.
                self.sock.store_read_cb(callback);
            }
        }
    }

    pub fn has_read_callback(&self) -> bool {
        self.sock.has_read_callback()
    }
}

// ============================================================================
// Event-loop upcalls
// ============================================================================

impl EventHandler for TlsSocket {
    fn io_ready(&mut self, ready: Ready) {
        match self.state {
            TlsState::Connecting | TlsState::ConnectingClosing
                if matches!(self.engine, Engine::None) =>
            {
                // TCP phase of a chained connect.
                self.handle_tcp_connect();
            }
            TlsState::Accepting
            | TlsState::RsaAsyncPending
            | TlsState::Connecting
            | TlsState::ConnectingClosing => self.drive_handshake(),
            TlsState::CacheLookup => {
                // Paused; interest is disarmed, stray events are ignored.
            }
            TlsState::Established | TlsState::RemoteClosed | TlsState::Closing => {
                let original = self.sock.loop_id();
                if ready.writable {
                    self.handle_write_tls();
                }
                if ready.readable {
                    if self.sock.loop_id() != original {
                        return;
                    }
                    if self.want_read() {
                        self.handle_read_tls();
                    }
                }
            }
            TlsState::Uninit | TlsState::Closed | TlsState::Error => {}
        }
    }

    fn timeout_expired(&mut self, id: TimerId) {
        debug_assert!(self.sock.loop_handle().is_in_loop_thread());
        if id == TIMER_HANDSHAKE {
            if self.connecting() {
                self.fail_handshake(TransportError::timed_out("TLS handshake timed out"));
            }
            return;
        }
        match self.state {
            TlsState::Connecting | TlsState::ConnectingClosing
                if matches!(self.engine, Engine::None) =>
            {
                self.fail_handshake(TransportError::timed_out("connect timed out"));
            }
            TlsState::Established | TlsState::RemoteClosed | TlsState::Closing => {
                self.fail_write_tls(TransportError::timed_out("write timed out"));
            }
            _ => {}
        }
    }
}

// ============================================================================
// Transport trait implementation
// ============================================================================

impl Transport for TlsSocket {
    fn write(&mut self, callback: Option<WriteCb>, data: Vec<u8>, flags: WriteFlags) {
        self.write_impl_tls(callback, vec![data], flags)
    }

    fn writev(&mut self, callback: Option<WriteCb>, bufs: Vec<Vec<u8>>, flags: WriteFlags) {
        self.write_impl_tls(callback, bufs, flags)
    }

    fn write_chain(&mut self, callback: Option<WriteCb>, chain: BufferChain, flags: WriteFlags) {
        self.write_impl_tls(callback, chain.into_segments(), flags)
    }

    fn set_read_callback(&mut self, callback: Option<ReadCb>) {
        TlsSocket::set_read_callback(self, callback)
    }

    fn close(&mut self) {
        TlsSocket::close(self)
    }

    fn close_now(&mut self) {
        TlsSocket::close_now(self)
    }

    fn shutdown_write(&mut self) {
        TlsSocket::shutdown_write(self)
    }

    fn shutdown_write_now(&mut self) {
        TlsSocket::shutdown_write_now(self)
    }

    fn good(&self) -> bool {
        TlsSocket::good(self)
    }

    fn connecting(&self) -> bool {
        TlsSocket::connecting(self)
    }

    fn local_address(&self) -> Option<SocketAddr> {
        self.sock.local_address()
    }

    fn peer_address(&self) -> Option<SocketAddr> {
        self.sock.peer_address()
    }

    fn app_bytes_written(&self) -> u64 {
        self.sock.app_bytes_written()
    }

    fn app_bytes_received(&self) -> u64 {
        self.sock.app_bytes_received()
    }
}

#[cfg(test)]
mod tests {
    use super::{crosses_eor_boundary, min_eor_raw_bound, RecordWatcher, MAX_RECORD_OVERHEAD};

    #[test]
    fn record_watcher_flags_handshake_records_across_chunks() {
        let mut watcher = RecordWatcher::default();
        // An application-data record (type 23), fed in awkward fragments.
        let record = [23u8, 3, 3, 0, 4, 1, 2, 3, 4];
        watcher.observe(&record[..2]);
        watcher.observe(&record[2..7]);
        watcher.observe(&record[7..]);
        assert!(!watcher.saw_handshake_record);
        assert!(watcher.at_record_boundary());

        // A handshake record split mid-header trips the flag.
        let record = [22u8, 3, 3, 0, 2, 1, 0];
        watcher.observe(&record[..3]);
        assert!(!watcher.saw_handshake_record);
        watcher.observe(&record[3..]);
        assert!(watcher.saw_handshake_record);
        assert!(watcher.at_record_boundary());
    }

    #[test]
    fn record_watcher_ignores_handshake_bytes_inside_payloads() {
        let mut watcher = RecordWatcher::default();
        // Payload bytes that look like a handshake header must not confuse
        // an aligned walker.
        let record = [23u8, 3, 3, 0, 5, 22, 3, 3, 0, 9];
        watcher.observe(&record);
        assert!(!watcher.saw_handshake_record);
        assert!(watcher.at_record_boundary());
    }

    #[test]
    fn eor_bound_covers_record_framing() {
        // A small record: bound is payload plus one record's overhead.
        assert_eq!(min_eor_raw_bound(0, 100), 100 + MAX_RECORD_OVERHEAD);
        // Raw bytes already written shift the bound.
        assert_eq!(min_eor_raw_bound(5000, 100), 5100 + MAX_RECORD_OVERHEAD);
        // Payloads spanning several records get per-record overhead.
        assert_eq!(
            min_eor_raw_bound(0, 40 * 1024),
            40 * 1024 + 3 * MAX_RECORD_OVERHEAD
        );
    }

    #[test]
    fn boundary_crossing_marks_the_final_chunk() {
        let bound = min_eor_raw_bound(0, 8 * 1024);
        // A mid-stream chunk stays below the bound.
        assert!(!crosses_eor_boundary(0, 4096, bound));
        // The chunk that reaches the bound carries the mark.
        assert!(crosses_eor_boundary(4096, bound as usize, bound));
        // No mark tracked, no crossing.
        assert!(!crosses_eor_boundary(0, usize::MAX / 2, 0));
    }
}
