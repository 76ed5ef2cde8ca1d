use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

/// A kernel socket option a caller can request at connect time (or apply to
/// an already-open connection).
#[derive(Debug, Clone)]
pub enum SocketOption {
    /// TCP_NODELAY: disable Nagle's algorithm.
    NoDelay(bool),
    /// TCP_QUICKACK: send ACKs immediately rather than delayed.
    QuickAck(bool),
    /// TCP_CONGESTION: select the congestion control algorithm by name.
    Congestion(String),
    /// SO_SNDBUF.
    SendBufferSize(usize),
    /// SO_RCVBUF.
    RecvBufferSize(usize),
    /// SO_REUSEADDR.
    ReuseAddr(bool),
    /// SO_LINGER: `None` disables lingering.
    Linger(Option<Duration>),
    /// SO_KEEPALIVE with the given idle time.
    KeepAlive(Duration),
}

impl SocketOption {
    pub(crate) fn apply(&self, fd: RawFd) -> io::Result<()> {
        // The descriptor is owned by the calling socket for the duration of
        // the call; borrow it rather than adopting it.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let sock = SockRef::from(&borrowed);
        match self {
            SocketOption::NoDelay(on) => sock.set_nodelay(*on),
            SocketOption::QuickAck(on) => sock.set_quickack(*on),
            SocketOption::Congestion(name) => sock.set_tcp_congestion(name.as_bytes()),
            SocketOption::SendBufferSize(size) => sock.set_send_buffer_size(*size),
            SocketOption::RecvBufferSize(size) => sock.set_recv_buffer_size(*size),
            SocketOption::ReuseAddr(on) => sock.set_reuse_address(*on),
            SocketOption::Linger(dur) => sock.set_linger(*dur),
            SocketOption::KeepAlive(idle) => {
                sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(*idle))
            }
        }
    }
}
