use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::QlogMode;
use crate::shared::{ConnectionId, ResetToken};

/// Header-level verdict for a datagram that matched no session
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InitialVerdict {
    /// An acceptable initial packet
    Ok,
    /// The client proposed a version we do not speak
    VersionMismatch,
    /// Early data before any handshake; the client must prove its address
    NeedsRetry,
    /// Not a packet that can start a connection
    Ignore,
}

/// Close directive a new session must apply as soon as its initial keys
/// are installed
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InitialClose {
    NoError,
    ServerBusy,
}

/// Everything the session factory needs to build a server session
pub struct ServerSessionArgs<'a, S: Session> {
    pub version: u32,
    /// The client-chosen DCID; becomes the session's primary routing CID
    pub dst_cid: ConnectionId,
    pub src_cid: ConnectionId,
    /// DCID from before a retry round-trip, recovered from the token
    pub orig_dst_cid: Option<ConnectionId>,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub alpn: &'a [u8],
    /// Opaque option bits forwarded from `listen`
    pub session_options: u32,
    pub early_close: InitialClose,
    pub qlog: QlogMode,
    pub secure_ctx: &'a Arc<S::SecureContext>,
}

/// The per-connection collaborator.
///
/// The dispatcher never interprets QUIC beyond the invariant header; this
/// trait is where the real state machine lives. The dispatcher holds a
/// strong reference to a session for as long as any CID binding exists
/// and drops it with the last one.
pub trait Session: Sized {
    /// TLS provider required before the dispatcher will accept connections
    type SecureContext;

    /// Header-level triage of a datagram that matched no session. Pure
    /// packet analysis; must not allocate connection state.
    fn classify(version: u32, data: &[u8]) -> InitialVerdict;

    /// Builds a server session for an acceptable initial packet. `None`
    /// means the packet should be treated as unroutable.
    fn create_server(args: ServerSessionArgs<'_, Self>) -> Option<Arc<Self>>;

    /// Delivers one datagram. Returns `true` iff it was processed cleanly.
    fn receive(&self, data: &[u8], local: SocketAddr, remote: SocketAddr, flags: u32) -> bool;

    /// The stateless reset token peers would use for this session
    fn reset_token(&self) -> ResetToken;

    fn remote(&self) -> SocketAddr;

    /// A CID routing to this session was retired by the dispatcher.
    fn on_cid_retired(&self, _cid: &ConnectionId) {}

    /// The dispatcher released its last reference to this session.
    fn on_close(&self) {}
}
