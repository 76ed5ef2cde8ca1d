//! TLS integration tests: echo over a handshake, SNI-driven context
//! switching with ClientHello capture, ALPN selection, session resumption,
//! early-write rejection, and the handshake verification hook.

use evsock::prelude::*;
use rustls::pki_types::ServerName;
use std::cell::{Cell, RefCell};
use std::io::{Read as _, Write as _};
use std::net::{TcpListener, TcpStream};
use std::os::fd::IntoRawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

// ============================================================================
// Certificate and peer helpers
// ============================================================================

/// A self-signed certificate written out as PEM temp files, plus its DER
/// form for identity assertions.
struct TestCert {
    cert_file: NamedTempFile,
    key_file: NamedTempFile,
    cert_der: Vec<u8>,
}

fn generate_cert(names: &[&str]) -> TestCert {
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    let certified = rcgen::generate_simple_self_signed(names).unwrap();
    let cert_der = certified.cert.der().to_vec();

    let mut cert_file = NamedTempFile::new().unwrap();
    cert_file
        .write_all(certified.cert.pem().as_bytes())
        .unwrap();
    cert_file.flush().unwrap();

    let mut key_file = NamedTempFile::new().unwrap();
    key_file
        .write_all(certified.key_pair.serialize_pem().as_bytes())
        .unwrap();
    key_file.flush().unwrap();

    TestCert {
        cert_file,
        key_file,
        cert_der,
    }
}

impl TestCert {
    fn cert_path(&self) -> &str {
        self.cert_file.path().to_str().unwrap()
    }

    fn key_path(&self) -> &str {
        self.key_file.path().to_str().unwrap()
    }
}

/// rustls config for the blocking server peer used opposite our client.
fn peer_server_config(cert: &TestCert) -> Arc<rustls::ServerConfig> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut std::io::BufReader::new(
        std::fs::File::open(cert.cert_path()).unwrap(),
    ))
    .collect::<Result<_, _>>()
    .unwrap();
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(cert.key_path()).unwrap(),
    ))
    .unwrap()
    .unwrap();
    Arc::new(
        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .unwrap(),
    )
}

/// rustls config for the blocking client peer used opposite our server.
fn peer_client_config(trusted: &TestCert, alpn: Vec<Vec<u8>>) -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut std::io::BufReader::new(
        std::fs::File::open(trusted.cert_path()).unwrap(),
    )) {
        roots.add(cert.unwrap()).unwrap();
    }
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn;
    Arc::new(config)
}

/// Blocking TLS echo peer: handshakes, echoes until EOF or error, returns
/// the number of application bytes echoed.
fn spawn_tls_echo_server(
    listener: TcpListener,
    config: Arc<rustls::ServerConfig>,
    sessions: usize,
) -> thread::JoinHandle<usize> {
    thread::spawn(move || {
        let mut total = 0usize;
        for _ in 0..sessions {
            let (mut tcp, _) = listener.accept().expect("accept failed");
            let mut conn = rustls::ServerConnection::new(config.clone()).unwrap();
            let mut stream = rustls::Stream::new(&mut conn, &mut tcp);
            let mut buf = [0u8; 16 * 1024];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        total += n;
                        if stream.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        }
        total
    })
}

// ============================================================================
// Callback recorder
// ============================================================================

#[derive(Default)]
struct State {
    connect_success: Cell<usize>,
    connect_error: Cell<usize>,
    handshake_success: Cell<usize>,
    handshake_error: Cell<usize>,
    write_success: Cell<usize>,
    write_error: Cell<usize>,
    read_eof: Cell<usize>,
    received: RefCell<Vec<u8>>,
    last_error: RefCell<Option<TransportError>>,
}

struct TestCallback {
    state: Rc<State>,
    buf: Vec<u8>,
    echo: bool,
    veto_handshake: bool,
}

impl TestCallback {
    fn new(state: Rc<State>) -> Rc<RefCell<TestCallback>> {
        Rc::new(RefCell::new(TestCallback {
            state,
            buf: vec![0u8; 16 * 1024],
            echo: false,
            veto_handshake: false,
        }))
    }

    fn echoing(state: Rc<State>) -> Rc<RefCell<TestCallback>> {
        let cb = Self::new(state);
        cb.borrow_mut().echo = true;
        cb
    }

    fn vetoing(state: Rc<State>) -> Rc<RefCell<TestCallback>> {
        let cb = Self::new(state);
        cb.borrow_mut().veto_handshake = true;
        cb
    }
}

impl ConnectCallback for TestCallback {
    fn connect_success(&mut self, _transport: &mut dyn Transport) {
        self.state.connect_success.set(self.state.connect_success.get() + 1);
    }

    fn connect_error(&mut self, _transport: &mut dyn Transport, err: TransportError) {
        self.state.connect_error.set(self.state.connect_error.get() + 1);
        *self.state.last_error.borrow_mut() = Some(err);
    }
}

impl HandshakeCallback for TestCallback {
    fn handshake_verify(
        &mut self,
        _sock: &mut TlsSocket,
        verified: bool,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
    ) -> bool {
        if self.veto_handshake {
            return false;
        }
        verified
    }

    fn handshake_success(&mut self, _sock: &mut TlsSocket) {
        self.state.handshake_success.set(self.state.handshake_success.get() + 1);
    }

    fn handshake_error(&mut self, _sock: &mut TlsSocket, err: TransportError) {
        self.state.handshake_error.set(self.state.handshake_error.get() + 1);
        *self.state.last_error.borrow_mut() = Some(err);
    }
}

impl ReadCallback for TestCallback {
    fn get_read_buffer(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    fn read_data_available(&mut self, transport: &mut dyn Transport, len: usize) {
        self.state.received.borrow_mut().extend_from_slice(&self.buf[..len]);
        if self.echo {
            transport.write(None, self.buf[..len].to_vec(), WriteFlags::NONE);
        }
    }

    fn read_eof(&mut self, _transport: &mut dyn Transport) {
        self.state.read_eof.set(self.state.read_eof.get() + 1);
    }

    fn read_error(&mut self, _transport: &mut dyn Transport, err: TransportError) {
        *self.state.last_error.borrow_mut() = Some(err);
    }
}

impl WriteCallback for TestCallback {
    fn write_success(&mut self, _transport: &mut dyn Transport) {
        self.state.write_success.set(self.state.write_success.get() + 1);
    }

    fn write_error(&mut self, _transport: &mut dyn Transport, _bytes_written: usize, err: TransportError) {
        self.state.write_error.set(self.state.write_error.get() + 1);
        *self.state.last_error.borrow_mut() = Some(err);
    }
}

fn run_until(event_loop: &mut EventLoop, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "test timed out");
        event_loop
            .loop_once(Some(Duration::from_millis(20)))
            .expect("loop_once failed");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn tls_echo_round_trip_with_eor() {
    let cert = generate_cert(&["localhost"]);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = spawn_tls_echo_server(listener, peer_server_config(&cert), 1);

    let ctx = TlsContext::builder()
        .load_trusted_certs(cert.cert_path())
        .unwrap()
        .build();

    let mut event_loop = EventLoop::new().unwrap();
    let state = Rc::new(State::default());
    let callback = TestCallback::new(state.clone());
    let sock = TlsSocket::with_server_name(ctx, &event_loop.handle(), "localhost");
    {
        let mut s = sock.borrow_mut();
        s.connect(
            Some(callback.clone()),
            addr,
            Some(Duration::from_secs(5)),
            &[],
            None,
        );
        s.set_read_callback(Some(callback.clone()));
    }

    run_until(&mut event_loop, || state.connect_success.get() == 1);
    assert!(sock.borrow().handshake_complete());
    assert!(!sock.borrow().session_reused());
    assert!(sock.borrow().negotiated_cipher_name().is_some());
    assert!(sock.borrow().ssl_version().is_some());

    sock.borrow_mut()
        .write(Some(callback.clone()), b"hello".to_vec(), WriteFlags::EOR);
    run_until(&mut event_loop, || {
        state.write_success.get() == 1 && state.received.borrow().len() >= 5
    });
    assert_eq!(&*state.received.borrow(), b"hello");

    {
        let s = sock.borrow();
        assert_eq!(s.app_bytes_written(), 5);
        // Record framing and handshake traffic dominate the raw counters.
        assert!(s.raw_bytes_written() > s.app_bytes_written());
        assert!(s.raw_bytes_received() > s.app_bytes_received());
    }

    sock.borrow_mut().close_now();
    server.join().unwrap();
}

#[test]
fn server_sni_switch_selects_the_matching_context() {
    let default_cert = generate_cert(&["default.example"]);
    let alpha_cert = generate_cert(&["alpha.example"]);

    let alpha_ctx = TlsContext::builder()
        .load_cert_chain(alpha_cert.cert_path())
        .unwrap()
        .load_private_key(alpha_cert.key_path())
        .unwrap()
        .verify_mode(VerifyMode::NoVerify)
        .randomized_advertised_protocols(vec![
            NextProtocolsItem {
                weight: 1,
                protocols: vec![b"echo/1".to_vec()],
            },
            NextProtocolsItem {
                weight: 0,
                protocols: vec![b"never/0".to_vec()],
            },
        ])
        .build();

    let captured_hello: Rc<RefCell<Option<ClientHelloInfo>>> = Rc::new(RefCell::new(None));
    let observer_hello = captured_hello.clone();
    let switch_ctx = alpha_ctx.clone();

    let server_ctx = TlsContext::builder()
        .load_cert_chain(default_cert.cert_path())
        .unwrap()
        .load_private_key(default_cert.key_path())
        .unwrap()
        .verify_mode(VerifyMode::NoVerify)
        .add_client_hello_observer(Box::new(move |_sock, info| {
            *observer_hello.borrow_mut() = Some(info.clone());
        }))
        .server_name_callback(Box::new(move |sock| {
            if sock.server_name() == Some("alpha.example") {
                sock.switch_server_tls_context(switch_ctx.clone());
                ServerNameCallbackResult::Found
            } else {
                ServerNameCallbackResult::NotFound
            }
        }))
        .build();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client = thread::spawn(move || {
        let mut tcp = TcpStream::connect(addr).unwrap();
        let config = peer_client_config(&alpha_cert, vec![b"echo/1".to_vec()]);
        let mut conn = rustls::ClientConnection::new(
            config,
            ServerName::try_from("alpha.example").unwrap(),
        )
        .unwrap();
        let mut stream = rustls::Stream::new(&mut conn, &mut tcp);
        stream.write_all(b"ping").unwrap();
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ping");
        let presented = conn.peer_certificates().unwrap()[0].to_vec();
        (presented, alpha_cert)
    });

    let (tcp, _) = listener.accept().unwrap();
    let fd = tcp.into_raw_fd();

    let mut event_loop = EventLoop::new().unwrap();
    let state = Rc::new(State::default());
    let callback = TestCallback::echoing(state.clone());
    let sock = TlsSocket::from_fd(server_ctx, &event_loop.handle(), fd, true);
    {
        let mut s = sock.borrow_mut();
        s.set_read_callback(Some(callback.clone()));
        s.ssl_accept(Some(callback.clone()), Some(Duration::from_secs(5)), None);
    }

    run_until(&mut event_loop, || {
        state.handshake_success.get() == 1 && state.received.borrow().len() >= 4
    });

    {
        let s = sock.borrow();
        assert!(s.server_name_matched());
        assert_eq!(s.server_name(), Some("alpha.example"));
        assert_eq!(s.selected_alpn_protocol(), Some(&b"echo/1"[..]));
    }
    let hello = captured_hello.borrow().clone().expect("hello captured");
    assert_eq!(hello.server_name.as_deref(), Some("alpha.example"));
    assert!(!hello.cipher_suites.is_empty());
    assert!(hello.extensions.contains(&0), "server_name extension seen");

    // Let the client observe our echo and close; then verify it saw the
    // switched certificate, not the default one.
    run_until(&mut event_loop, || state.read_eof.get() == 1);
    let (presented, alpha_cert) = client.join().unwrap();
    assert_eq!(presented, alpha_cert.cert_der);

    sock.borrow_mut().close_now();
}

#[test]
fn early_write_is_rejected_with_the_tls_pseudo_errno() {
    let cert = generate_cert(&["localhost"]);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client_stream = TcpStream::connect(addr).unwrap();
    let (_server_side, _) = listener.accept().unwrap();

    let ctx = TlsContext::builder()
        .load_trusted_certs(cert.cert_path())
        .unwrap()
        .build();

    let mut event_loop = EventLoop::new().unwrap();
    let state = Rc::new(State::default());
    let callback = TestCallback::new(state.clone());
    let fd = client_stream.into_raw_fd();
    let sock = TlsSocket::from_fd(ctx, &event_loop.handle(), fd, false);

    // No handshake has been started: application writes must fail.
    sock.borrow_mut()
        .write(Some(callback.clone()), b"too soon".to_vec(), WriteFlags::NONE);

    assert_eq!(state.write_error.get(), 1);
    let err = state.last_error.borrow().clone().unwrap();
    assert_eq!(err.kind(), ErrorKind::Ssl);
    assert_eq!(err.errno(), Some(evsock::tls::SSL_EARLY_WRITE));
    assert_eq!(sock.borrow().tls_state(), TlsState::Error);
    drop(event_loop);
}

#[test]
fn session_is_resumed_on_reconnect() {
    let cert = generate_cert(&["localhost"]);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = spawn_tls_echo_server(listener, peer_server_config(&cert), 2);

    // One shared context: its cached client configuration carries the
    // resumption store across connections.
    let ctx = TlsContext::builder()
        .load_trusted_certs(cert.cert_path())
        .unwrap()
        .build();

    let mut event_loop = EventLoop::new().unwrap();
    let mut reused = Vec::new();
    for _ in 0..2 {
        let state = Rc::new(State::default());
        let callback = TestCallback::new(state.clone());
        let sock = TlsSocket::with_server_name(ctx.clone(), &event_loop.handle(), "localhost");
        {
            let mut s = sock.borrow_mut();
            s.connect(
                Some(callback.clone()),
                addr,
                Some(Duration::from_secs(5)),
                &[],
                None,
            );
            s.set_read_callback(Some(callback.clone()));
        }
        run_until(&mut event_loop, || state.connect_success.get() == 1);

        // A round trip makes sure the post-handshake session tickets are
        // consumed before we tear down.
        sock.borrow_mut()
            .write(Some(callback.clone()), b"tick".to_vec(), WriteFlags::NONE);
        run_until(&mut event_loop, || state.received.borrow().len() >= 4);

        reused.push(sock.borrow().session_reused());
        sock.borrow_mut().close_now();
    }

    assert_eq!(reused, vec![false, true]);
    server.join().unwrap();
}

#[test]
fn handshake_verify_can_veto_the_connection() {
    let cert = generate_cert(&["localhost"]);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = spawn_tls_echo_server(listener, peer_server_config(&cert), 1);

    let ctx = TlsContext::builder()
        .load_trusted_certs(cert.cert_path())
        .unwrap()
        .build();

    let tcp = TcpStream::connect(addr).unwrap();
    tcp.set_nonblocking(true).unwrap();
    let fd = tcp.into_raw_fd();

    let mut event_loop = EventLoop::new().unwrap();
    let state = Rc::new(State::default());
    let callback = TestCallback::vetoing(state.clone());
    let sock = TlsSocket::from_fd(ctx, &event_loop.handle(), fd, false);
    sock.borrow_mut().set_server_name("localhost");
    sock.borrow_mut()
        .ssl_connect(Some(callback), Some(Duration::from_secs(5)), None);

    run_until(&mut event_loop, || state.handshake_error.get() == 1);
    assert_eq!(state.handshake_success.get(), 0);
    let err = state.last_error.borrow().clone().unwrap();
    assert_eq!(err.kind(), ErrorKind::Ssl);
    assert_eq!(sock.borrow().tls_state(), TlsState::Error);

    drop(sock);
    server.join().unwrap();
}
