//! Plain-socket integration tests: connect lifecycle, echo round trips,
//! partial-write recovery, the shutdown protocol, and callback accounting.

use evsock::prelude::*;
use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::FromRawFd;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Default)]
struct State {
    connect_success: Cell<usize>,
    connect_error: Cell<usize>,
    write_success: Cell<usize>,
    write_error: Cell<usize>,
    write_error_bytes: Cell<usize>,
    read_eof: Cell<usize>,
    read_error: Cell<usize>,
    received: RefCell<Vec<u8>>,
    last_error: RefCell<Option<TransportError>>,
    log: RefCell<Vec<String>>,
}

struct TestCallback {
    state: Rc<State>,
    name: String,
    buf: Vec<u8>,
}

impl TestCallback {
    fn new(state: Rc<State>) -> Rc<RefCell<TestCallback>> {
        Self::named(state, "cb")
    }

    fn named(state: Rc<State>, name: &str) -> Rc<RefCell<TestCallback>> {
        Rc::new(RefCell::new(TestCallback {
            state,
            name: name.to_string(),
            buf: vec![0u8; 16 * 1024],
        }))
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

impl ReadCallback for TestCallback {
    fn get_read_buffer(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    fn read_data_available(&mut self, _transport: &mut dyn Transport, len: usize) {
        self.state.received.borrow_mut().extend_from_slice(&self.buf[..len]);
    }

    fn read_eof(&mut self, _transport: &mut dyn Transport) {
        self.state.read_eof.set(self.state.read_eof.get() + 1);
    }

    fn read_error(&mut self, _transport: &mut dyn Transport, err: TransportError) {
        self.state.read_error.set(self.state.read_error.get() + 1);
        *self.state.last_error.borrow_mut() = Some(err);
    }
}

impl WriteCallback for TestCallback {
    fn write_success(&mut self, _transport: &mut dyn Transport) {
        self.state.write_success.set(self.state.write_success.get() + 1);
        self.state.log.borrow_mut().push(self.name.clone());
    }

    fn write_error(&mut self, _transport: &mut dyn Transport, bytes_written: usize, err: TransportError) {
        self.state.write_error.set(self.state.write_error.get() + 1);
        self.state.write_error_bytes.set(bytes_written);
        *self.state.last_error.borrow_mut() = Some(err);
        self.state.log.borrow_mut().push(format!("{}-error", self.name));
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

/// Echoes everything it reads back to the peer until EOF, ignoring errors
/// caused by abrupt client teardown.
fn spawn_echo_server(listener: TcpListener) -> thread::JoinHandle<usize> {
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept failed");
        let mut buf = [0u8; 16 * 1024];
        let mut total = 0usize;
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
        total
    })
}

#[test]
fn plain_echo_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = spawn_echo_server(listener);

    let mut event_loop = EventLoop::new().unwrap();
    let state = Rc::new(State::default());
    let callback = TestCallback::new(state.clone());
    let sock = AsyncSocket::new(&event_loop.handle());
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
        s.write(Some(callback.clone()), b"hello".to_vec(), WriteFlags::NONE);
    }

    run_until(&mut event_loop, || {
        state.write_success.get() == 1 && state.received.borrow().len() >= 5
    });
    assert_eq!(state.connect_success.get(), 1);
    assert_eq!(state.connect_error.get(), 0);
    assert_eq!(&*state.received.borrow(), b"hello");
    assert_eq!(sock.borrow().app_bytes_written(), 5);
    assert_eq!(sock.borrow().app_bytes_received(), 5);

    sock.borrow_mut().close_now();
    assert_eq!(state.read_eof.get(), 1);
    server.join().unwrap();
}

#[test]
fn write_chain_releases_and_delivers_all_segments() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = spawn_echo_server(listener);

    let mut event_loop = EventLoop::new().unwrap();
    let state = Rc::new(State::default());
    let callback = TestCallback::new(state.clone());
    let sock = AsyncSocket::new(&event_loop.handle());
    {
        let mut s = sock.borrow_mut();
        s.connect(Some(callback.clone()), addr, Some(Duration::from_secs(5)), &[], None);
        s.set_read_callback(Some(callback.clone()));

        let chain: BufferChain = vec![b"abc".to_vec(), b"defg".to_vec(), b"hij".to_vec()]
            .into_iter()
            .collect();
        assert_eq!(chain.len(), 10);
        s.write_chain(Some(callback.clone()), chain, WriteFlags::NONE);
    }

    run_until(&mut event_loop, || {
        state.write_success.get() == 1 && state.received.borrow().len() >= 10
    });
    assert_eq!(&*state.received.borrow(), b"abcdefghij");

    sock.borrow_mut().close_now();
    server.join().unwrap();
}

#[test]
fn writes_complete_in_submission_order() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = spawn_echo_server(listener);

    let mut event_loop = EventLoop::new().unwrap();
    let state = Rc::new(State::default());
    let reader = TestCallback::new(state.clone());
    let first = TestCallback::named(state.clone(), "first");
    let second = TestCallback::named(state.clone(), "second");
    let sock = AsyncSocket::new(&event_loop.handle());
    {
        let mut s = sock.borrow_mut();
        s.connect(None, addr, Some(Duration::from_secs(5)), &[], None);
        s.set_read_callback(Some(reader));
        s.write(Some(first), vec![1u8; 64 * 1024], WriteFlags::CORK);
        s.writev(
            Some(second),
            vec![vec![2u8; 1024], vec![3u8; 1024]],
            WriteFlags::NONE,
        );
    }

    run_until(&mut event_loop, || state.write_success.get() == 2);
    assert_eq!(*state.log.borrow(), vec!["first", "second"]);

    let expected = 64 * 1024 + 2048;
    run_until(&mut event_loop, || state.received.borrow().len() >= expected);
    sock.borrow_mut().close_now();
    server.join().unwrap();
}

#[test]
fn partial_sends_recover_with_a_single_completion() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = spawn_echo_server(listener);

    let payload = vec![0xA5u8; 256 * 1024];
    let expected = payload.len();

    let mut event_loop = EventLoop::new().unwrap();
    let state = Rc::new(State::default());
    let callback = TestCallback::new(state.clone());
    let sock = AsyncSocket::new(&event_loop.handle());
    {
        let mut s = sock.borrow_mut();
        // A tiny send buffer forces many partial sendmsg passes.
        s.connect(
            Some(callback.clone()),
            addr,
            Some(Duration::from_secs(5)),
            &[SocketOption::SendBufferSize(4096)],
            None,
        );
        s.set_read_callback(Some(callback.clone()));
        s.write(Some(callback.clone()), payload, WriteFlags::NONE);
    }

    run_until(&mut event_loop, || {
        state.write_success.get() == 1 && state.received.borrow().len() >= expected
    });
    assert_eq!(state.write_error.get(), 0);
    assert_eq!(state.received.borrow().len(), expected);

    sock.borrow_mut().close_now();
    assert_eq!(server.join().unwrap(), expected);
}

#[test]
fn write_after_shutdown_is_rejected_and_fails_the_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let mut event_loop = EventLoop::new().unwrap();
    let state = Rc::new(State::default());
    let callback = TestCallback::new(state.clone());
    let sock = AsyncSocket::new(&event_loop.handle());
    sock.borrow_mut().connect(
        Some(callback.clone()),
        addr,
        Some(Duration::from_secs(5)),
        &[],
        None,
    );
    run_until(&mut event_loop, || state.connect_success.get() == 1);

    sock.borrow_mut().shutdown_write();

    let late = Rc::new(State::default());
    let late_cb = TestCallback::new(late.clone());
    sock.borrow_mut().write(Some(late_cb), b"x".to_vec(), WriteFlags::NONE);

    assert_eq!(late.write_error.get(), 1);
    assert_eq!(late.write_error_bytes.get(), 0);
    let err = late.last_error.borrow().clone().unwrap();
    assert_eq!(err.kind(), ErrorKind::NotOpen);
    assert_eq!(sock.borrow().state(), SocketState::Error);
    drop(listener);
}

#[test]
fn close_now_fails_queued_writes_exactly_once() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    // The peer never reads, so a large write cannot drain.

    let mut event_loop = EventLoop::new().unwrap();
    let state = Rc::new(State::default());
    let callback = TestCallback::new(state.clone());
    let sock = AsyncSocket::new(&event_loop.handle());
    sock.borrow_mut().connect(
        Some(callback.clone()),
        addr,
        Some(Duration::from_secs(5)),
        &[SocketOption::SendBufferSize(4096)],
        None,
    );
    run_until(&mut event_loop, || state.connect_success.get() == 1);

    let payload_len = 4 * 1024 * 1024;
    sock.borrow_mut().write(
        Some(callback.clone()),
        vec![0u8; payload_len],
        WriteFlags::NONE,
    );
    assert_eq!(state.write_success.get(), 0, "peer is not reading");

    sock.borrow_mut().close_now();
    assert_eq!(state.write_error.get(), 1);
    assert!(state.write_error_bytes.get() < payload_len);
    let err = state.last_error.borrow().clone().unwrap();
    assert_eq!(err.kind(), ErrorKind::EndOfFile);
    assert!(err.is_local_close());
    assert_eq!(sock.borrow().state(), SocketState::Closed);

    // Repeated close_now is a no-op with no further callbacks.
    sock.borrow_mut().close_now();
    assert_eq!(state.write_error.get(), 1);
    assert_eq!(state.read_eof.get(), 0, "no read callback was installed");
    drop(listener);
}

#[test]
fn shutdown_write_drains_queued_writes_first() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = spawn_echo_server(listener);

    let mut event_loop = EventLoop::new().unwrap();
    let state = Rc::new(State::default());
    let callback = TestCallback::new(state.clone());
    let sock = AsyncSocket::new(&event_loop.handle());
    {
        let mut s = sock.borrow_mut();
        s.connect(
            Some(callback.clone()),
            addr,
            Some(Duration::from_secs(5)),
            &[SocketOption::SendBufferSize(4096)],
            None,
        );
        s.write(Some(callback.clone()), vec![7u8; 64 * 1024], WriteFlags::NONE);
        // Queue is non-empty: this must drain before the FIN goes out.
        s.shutdown_write();
    }

    run_until(&mut event_loop, || state.write_success.get() == 1);
    assert_eq!(state.write_error.get(), 0);
    // The peer echoes everything and then observes our FIN as EOF.
    assert_eq!(server.join().unwrap(), 64 * 1024);
}

#[test]
fn connect_to_refused_port_reports_exactly_one_error() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut event_loop = EventLoop::new().unwrap();
    let state = Rc::new(State::default());
    let callback = TestCallback::new(state.clone());
    let sock = AsyncSocket::new(&event_loop.handle());
    sock.borrow_mut().connect(
        Some(callback.clone()),
        addr,
        Some(Duration::from_secs(5)),
        &[],
        None,
    );

    run_until(&mut event_loop, || state.connect_error.get() == 1);
    assert_eq!(state.connect_success.get(), 0);
    let err = state.last_error.borrow().clone().unwrap();
    assert_eq!(err.kind(), ErrorKind::NotOpen);
    assert_eq!(sock.borrow().state(), SocketState::Error);
}

#[test]
fn send_timeout_fails_the_blocked_write() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    // Peer accepts via the backlog but never reads.

    let mut event_loop = EventLoop::new().unwrap();
    let state = Rc::new(State::default());
    let callback = TestCallback::new(state.clone());
    let sock = AsyncSocket::new(&event_loop.handle());
    sock.borrow_mut().connect(
        Some(callback.clone()),
        addr,
        Some(Duration::from_secs(5)),
        &[SocketOption::SendBufferSize(4096)],
        None,
    );
    run_until(&mut event_loop, || state.connect_success.get() == 1);

    sock.borrow_mut().set_send_timeout(Some(Duration::from_millis(100)));
    sock.borrow_mut().write(
        Some(callback.clone()),
        vec![0u8; 4 * 1024 * 1024],
        WriteFlags::NONE,
    );

    run_until(&mut event_loop, || state.write_error.get() == 1);
    let err = state.last_error.borrow().clone().unwrap();
    assert_eq!(err.kind(), ErrorKind::TimedOut);
    assert_eq!(sock.borrow().state(), SocketState::Error);
    drop(listener);
}

#[test]
fn detach_fd_leaves_an_open_descriptor() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = spawn_echo_server(listener);

    let mut event_loop = EventLoop::new().unwrap();
    let state = Rc::new(State::default());
    let callback = TestCallback::new(state.clone());
    let sock = AsyncSocket::new(&event_loop.handle());
    sock.borrow_mut().connect(
        Some(callback.clone()),
        addr,
        Some(Duration::from_secs(5)),
        &[],
        None,
    );
    run_until(&mut event_loop, || state.connect_success.get() == 1);

    let fd = sock.borrow_mut().detach_fd();
    assert!(fd >= 0);
    assert_eq!(sock.borrow().state(), SocketState::Closed);
    assert_eq!(sock.borrow().fd(), -1);

    // The descriptor still works as a plain blocking stream.
    let mut stream = unsafe { TcpStream::from_raw_fd(fd) };
    stream.set_nonblocking(false).unwrap();
    stream.write_all(b"ping").unwrap();
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"ping");

    drop(stream);
    server.join().unwrap();
}

#[test]
fn peer_eof_disables_further_read_callbacks() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(b"bye").unwrap();
        // Drop closes the connection right after the farewell.
    });

    let mut event_loop = EventLoop::new().unwrap();
    let state = Rc::new(State::default());
    let callback = TestCallback::new(state.clone());
    let sock = AsyncSocket::new(&event_loop.handle());
    {
        let mut s = sock.borrow_mut();
        s.connect(Some(callback.clone()), addr, Some(Duration::from_secs(5)), &[], None);
        s.set_read_callback(Some(callback.clone()));
    }

    run_until(&mut event_loop, || state.read_eof.get() == 1);
    assert_eq!(&*state.received.borrow(), b"bye");
    assert_eq!(state.read_error.get(), 0);
    assert!(!sock.borrow().readable());

    // Installing a new read callback after EOF is a caller error.
    let late = Rc::new(State::default());
    let late_cb = TestCallback::new(late.clone());
    sock.borrow_mut().set_read_callback(Some(late_cb));
    assert_eq!(late.read_error.get(), 1);
    server.join().unwrap();
}
