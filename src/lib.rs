//! Event-driven non-blocking TCP sockets with an optional TLS overlay,
//! built on [mio](https://docs.rs/mio) and [rustls](https://docs.rs/rustls).
//!
//! - **Single-threaded reactor model:** every connection is affined to one
//!   [`EventLoop`]; readiness notifications and timers drive all I/O
//! - **Callback completion semantics:** exactly-once connect and per-write
//!   completion callbacks, plus a persistent read subscription, designed to
//!   sit under RPC framing code
//! - **Vectored writes with a FIFO queue:** partial-write accounting across
//!   scatter/gather segments, CORK/EOR flags mapped to MSG_MORE/MSG_EOR
//! - **TLS overlay:** handshake callbacks with their own timer, server-side
//!   SNI context switching with ClientHello introspection, session
//!   resumption, renegotiation rejection, and end-of-record tracking across
//!   TLS record boundaries
//!
//! # Quick Start
//!
//! ```no_run
//! use evsock::prelude::*;
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! struct Greeter;
//!
//! impl ConnectCallback for Greeter {
//!     fn connect_success(&mut self, transport: &mut dyn Transport) {
//!         transport.write(None, b"hello".to_vec(), WriteFlags::NONE);
//!     }
//!
//!     fn connect_error(&mut self, _transport: &mut dyn Transport, err: TransportError) {
//!         eprintln!("connect failed: {err}");
//!     }
//! }
//!
//! fn main() -> Result<(), evsock::Error> {
//!     let mut event_loop = EventLoop::new()?;
//!     let sock = AsyncSocket::new(&event_loop.handle());
//!
//!     let callback: Rc<RefCell<dyn ConnectCallback>> = Rc::new(RefCell::new(Greeter));
//!     sock.borrow_mut().connect(
//!         Some(callback),
//!         "127.0.0.1:8080".parse().unwrap(),
//!         Some(std::time::Duration::from_secs(5)),
//!         &[],
//!         None,
//!     );
//!
//!     while event_loop.is_active() {
//!         event_loop.loop_once(None)?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Threading model
//!
//! Connections are **not** thread-safe: a connection, its callbacks, and
//! its timers all run on its event loop's thread, and the operations assert
//! this. Constructors return `Rc<RefCell<...>>`; the loop holds only weak
//! references, so dropping every handle is the cancellation mechanism — no
//! callback runs after the last handle is gone, and a connection that is
//! released from inside one of its own callbacks is deallocated only after
//! the callback unwinds.
//!
//! Inside a callback, always operate on the socket through the
//! `&mut dyn Transport` argument rather than borrowing the owning
//! `RefCell` again.
//!
//! # Configuration
//!
//! Construction-time tunables come from the
//! [`config`](https://docs.rs/config/) crate, with `{name}.{key}` lookups
//! falling back to `{key}` for named instances.
//!
//! | Key | Description |
//! |-----|-------------|
//! | `poll_capacity` | Event batch size per poll (default: 256) |
//! | `tls_cert` | Path to a certificate chain (PEM) |
//! | `tls_key` | Path to the matching private key (PEM) |
//! | `tls_ca_cert` | Path to trusted CA certificates (PEM) |

pub mod error;
pub mod reactor;
pub mod socket;
pub mod tls;

pub use error::{Error, ErrorKind, TransportError};
pub use reactor::{EventHandler, EventLoop, LoopHandle, Ready, TimerId};
pub use socket::{
    AsyncSocket, BufferChain, ConnectCallback, ConnectCb, ReadCallback, ReadCb,
    ShutdownSocketSet, SocketOption, SocketState, Transport, WriteCallback, WriteCb, WriteFlags,
};
pub use tls::{
    ClientHelloInfo, HandshakeCallback, HandshakeCb, NextProtocolsItem, PasswordCollector,
    PeerNamePolicy, ServerNameCallbackResult, TlsContext, TlsContextBuilder, TlsSocket, TlsState,
    VerifyMode,
};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::error::{Error, ErrorKind, TransportError};
    pub use crate::reactor::{EventLoop, LoopHandle, Ready};
    pub use crate::socket::{
        AsyncSocket, BufferChain, ConnectCallback, ConnectCb, ReadCallback, ReadCb,
        ShutdownSocketSet, SocketOption, SocketState, Transport, WriteCallback, WriteCb,
        WriteFlags,
    };
    pub use crate::tls::{
        ClientHelloInfo, HandshakeCallback, HandshakeCb, NextProtocolsItem, PeerNamePolicy,
        ServerNameCallbackResult, TlsContext, TlsContextBuilder, TlsSocket, TlsState, VerifyMode,
    };
}
