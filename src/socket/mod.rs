//! Callback-driven non-blocking TCP sockets.
//!
//! [`AsyncSocket`] owns one stream descriptor and drives it from reactor
//! readiness: a persistent read-callback subscription, a FIFO of pending
//! scatter/gather writes with per-request completion callbacks, a two-phase
//! shutdown protocol, and exactly-once connect completion. The
//! [`Transport`] trait is the capability surface handed to callbacks, so
//! the same callback code works against plain and TLS sockets.

mod async_socket;
mod chain;
mod options;
mod shutdown_set;
mod write_queue;

pub use async_socket::AsyncSocket;
pub use chain::BufferChain;
pub use options::SocketOption;
pub use shutdown_set::ShutdownSocketSet;
pub(crate) use write_queue::{WriteQueue, WriteRequest, MAX_WRITE_IOVECS};

use crate::error::TransportError;
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Uninit,
    Connecting,
    Established,
    Closed,
    Error,
}

/// Per-write flags.
///
/// `cork` hints that more data follows (MSG_MORE: the kernel may coalesce
/// with the next write even with TCP_NODELAY set). `eor` marks the final
/// byte of the final segment as an application-level end of record
/// (MSG_EOR).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteFlags {
    pub cork: bool,
    pub eor: bool,
}

impl WriteFlags {
    pub const NONE: WriteFlags = WriteFlags {
        cork: false,
        eor: false,
    };
    pub const CORK: WriteFlags = WriteFlags {
        cork: true,
        eor: false,
    };
    pub const EOR: WriteFlags = WriteFlags {
        cork: false,
        eor: true,
    };
}

/// Completion callback for `connect`.
///
/// Sees exactly one of `connect_success` / `connect_error` per connect call.
pub trait ConnectCallback {
    fn connect_success(&mut self, transport: &mut dyn Transport);
    fn connect_error(&mut self, transport: &mut dyn Transport, err: TransportError);
}

/// Persistent read subscription.
///
/// While installed, the socket asks for a buffer on every readable event
/// and reports how much it filled. `read_eof` / `read_error` is the last
/// read-side callback a connection ever makes.
pub trait ReadCallback {
    /// Returns the buffer the next `recv` fills. An empty buffer is a
    /// caller contract violation and fails the socket with `BadArgs`.
    fn get_read_buffer(&mut self) -> &mut [u8];

    fn read_data_available(&mut self, transport: &mut dyn Transport, len: usize);

    fn read_eof(&mut self, transport: &mut dyn Transport);

    fn read_error(&mut self, transport: &mut dyn Transport, err: TransportError);
}

/// Completion callback for one queued write.
///
/// Sees exactly one of `write_success` / `write_error`; `write_error`
/// reports how many of the request's bytes reached the kernel first.
pub trait WriteCallback {
    fn write_success(&mut self, transport: &mut dyn Transport);
    fn write_error(&mut self, transport: &mut dyn Transport, bytes_written: usize, err: TransportError);
}

pub type ConnectCb = Rc<RefCell<dyn ConnectCallback>>;
pub type ReadCb = Rc<RefCell<dyn ReadCallback>>;
pub type WriteCb = Rc<RefCell<dyn WriteCallback>>;

/// Capability surface a connection exposes to its callbacks.
///
/// Callbacks receive `&mut dyn Transport` instead of a concrete socket so
/// that code written against it drives plain and TLS connections alike,
/// and so a callback can operate on the socket that is currently invoking
/// it without re-entering its owning cell.
pub trait Transport {
    /// Queues a single buffer for transmission.
    fn write(&mut self, callback: Option<WriteCb>, data: Vec<u8>, flags: WriteFlags);

    /// Queues a vector of buffers as one request.
    fn writev(&mut self, callback: Option<WriteCb>, bufs: Vec<Vec<u8>>, flags: WriteFlags);

    /// Queues an owned buffer chain as one request.
    fn write_chain(&mut self, callback: Option<WriteCb>, chain: BufferChain, flags: WriteFlags);

    /// Installs or removes the read subscription.
    fn set_read_callback(&mut self, callback: Option<ReadCb>);

    /// Closes after draining queued writes (when connecting/established).
    fn close(&mut self);

    /// Closes unconditionally, failing queued writes.
    fn close_now(&mut self);

    /// Half-closes the write side once queued writes drain.
    fn shutdown_write(&mut self);

    /// Half-closes the write side immediately, failing queued writes.
    fn shutdown_write_now(&mut self);

    /// Whether the connection is usable (connecting or established and not
    /// shut down in either direction).
    fn good(&self) -> bool;

    fn connecting(&self) -> bool;

    fn local_address(&self) -> Option<SocketAddr>;

    fn peer_address(&self) -> Option<SocketAddr>;

    /// Application payload bytes accepted from callers so far.
    fn app_bytes_written(&self) -> u64;

    /// Application payload bytes handed to the read callback so far.
    fn app_bytes_received(&self) -> u64;
}

/// A callback owed a terminal notification, captured while tearing a
/// connection down.
///
/// Failure and close paths first collect the callbacks they must notify,
/// then deliver with the outermost transport (plain or TLS) as the
/// capability argument. Collection and delivery are separate steps so the
/// TLS overlay can reuse the plain socket's teardown while presenting
/// itself to the callbacks.
pub(crate) enum Delivery {
    ConnectError(ConnectCb),
    WriteError(WriteCb, usize),
    ReadEof(ReadCb),
    ReadError(ReadCb),
}

pub(crate) fn deliver_all(
    transport: &mut dyn Transport,
    deliveries: Vec<Delivery>,
    err: &TransportError,
) {
    // try_borrow_mut: a callback that triggered this teardown from inside
    // its own invocation already knows the outcome and is skipped rather
    // than re-entered.
    for delivery in deliveries {
        match delivery {
            Delivery::ConnectError(cb) => {
                if let Ok(mut cb) = cb.try_borrow_mut() {
                    cb.connect_error(transport, err.clone());
                }
            }
            Delivery::WriteError(cb, bytes) => {
                if let Ok(mut cb) = cb.try_borrow_mut() {
                    cb.write_error(transport, bytes, err.clone());
                }
            }
            Delivery::ReadEof(cb) => {
                if let Ok(mut cb) = cb.try_borrow_mut() {
                    cb.read_eof(transport);
                }
            }
            Delivery::ReadError(cb) => {
                if let Ok(mut cb) = cb.try_borrow_mut() {
                    cb.read_error(transport, err.clone());
                }
            }
        }
    }
}
