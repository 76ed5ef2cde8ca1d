//! TLS overlay for [`crate::socket::AsyncSocket`].
//!
//! [`TlsSocket`] embeds a plain socket by value and reroutes its readiness
//! through a TLS engine: a handshake phase with its own timer and callback,
//! a record-oriented write discipline that preserves end-of-record marks
//! across record boundaries, server-side SNI context switching with
//! ClientHello introspection, and a renegotiation-rejection policy.
//! [`TlsContext`] is the shared configuration and engine factory.

mod client_hello;
mod context;
mod socket;
mod verify;

pub use client_hello::ClientHelloInfo;
pub use context::{
    ClientHelloObserver, NextProtocolsItem, PasswordCollector, PeerNamePolicy, ServerNameCallback,
    ServerNameCallbackResult, TlsContext, TlsContextBuilder, VerifyMode,
};
pub use socket::TlsSocket;

use crate::error::TransportError;
use std::cell::RefCell;
use std::rc::Rc;

/// TLS-specific lifecycle state, layered over the plain socket's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    Uninit,
    /// Server side, waiting for or processing the handshake.
    Accepting,
    /// Accept paused for an asynchronous session-cache lookup.
    CacheLookup,
    /// Reserved for offloaded private-key operations; wired like
    /// `Accepting`.
    RsaAsyncPending,
    /// Client side: TCP connect and/or handshake in progress.
    Connecting,
    Established,
    /// Peer closed its write side; we can still write.
    RemoteClosed,
    /// Local close requested, draining queued writes.
    Closing,
    /// Local close requested before the handshake finished, with writes
    /// queued behind it.
    ConnectingClosing,
    Closed,
    Error,
}

// TLS conditions without a kernel errno are reported through these values,
// chosen outside the valid errno range.

/// A write found an unconsumed renegotiation handshake from the peer on
/// the inbound stream.
pub const SSL_CLIENT_RENEGOTIATION_ATTEMPT: i32 = 900;
/// A read observed a renegotiation handshake from the peer.
pub const SSL_INVALID_RENEGOTIATION: i32 = 901;
/// A write was attempted before the handshake completed.
pub const SSL_EARLY_WRITE: i32 = 902;

/// Completion callback for `ssl_accept` / `ssl_connect`.
pub trait HandshakeCallback {
    /// Runs after the engine's own certificate verification, with the
    /// peer's end-entity certificate. Returning false aborts the
    /// connection.
    fn handshake_verify(
        &mut self,
        _sock: &mut TlsSocket,
        verified: bool,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
    ) -> bool {
        verified
    }

    /// The handshake completed; the socket is established. The callback is
    /// uninstalled before this runs.
    fn handshake_success(&mut self, sock: &mut TlsSocket);

    /// The handshake failed; the error carries the TLS detail and, for the
    /// TLS-specific conditions, one of the pseudo-errnos.
    fn handshake_error(&mut self, sock: &mut TlsSocket, err: TransportError);
}

pub type HandshakeCb = Rc<RefCell<dyn HandshakeCallback>>;
