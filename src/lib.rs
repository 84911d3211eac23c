//! UDP-facing packet dispatch for a server-capable QUIC endpoint.
//!
//! This crate owns one or more bound UDP endpoints and demultiplexes every
//! inbound datagram to an existing session, a newly accepted server
//! session, or a stateless response (version negotiation, retry, stateless
//! reset, or a silent drop), enforcing resource-exhaustion defenses along
//! the way. It performs no per-connection QUIC processing itself: the
//! handshake, loss recovery, and stream machinery live behind the narrow
//! [`Session`] trait, and the UDP socket itself behind [`UdpHandle`].
//!
//! All dispatcher mutation happens on a single thread; there are no
//! internal locks. The only deferred work is UDP send completion, which
//! the host delivers later on the same thread via
//! [`Dispatcher::on_send_done`].

use std::ops;

mod constant_time;
mod varint;

mod shared;
pub use crate::shared::{ConnectionId, ResetToken};

mod packet;
pub use crate::packet::Packet;

mod token;

mod index;
mod rate;

mod endpoint;
pub use crate::endpoint::{EndpointId, SendTicket, UdpHandle};

mod listener;
pub use crate::listener::{DispatchListener, ListenerId, Prev};

mod stats;
pub use crate::stats::DispatchStats;

mod config;
pub use crate::config::{
    ConfigError, DispatchConfig, QlogMode, MAX_RETRY_TOKEN_TTL, MIN_RETRY_TOKEN_TTL,
};

mod session;
pub use crate::session::{InitialClose, InitialVerdict, ServerSessionArgs, Session};

mod dispatch;
pub use crate::dispatch::Dispatcher;


/// The QUIC protocol version implemented
pub const VERSION: u32 = 0x0000_0001;

/// Whether a session was accepted or initiated locally
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a session
    Client = 0,
    /// The acceptor of a session
    Server = 1,
}

impl Side {
    #[inline]
    pub fn is_server(self) -> bool {
        self == Side::Server
    }
}

impl ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// Maximum length of a connection ID, in bytes
pub const MAX_CID_SIZE: usize = 20;

/// Maximum UDP payload the dispatcher will hand to an endpoint
pub const MAX_PKT_SIZE: usize = 1452;

//
// Useful internal constants
//

/// Length of the connection IDs this endpoint issues for itself
pub(crate) const LOC_CID_LEN: usize = 16;
pub(crate) const RESET_TOKEN_SIZE: usize = 16;
pub(crate) const TOKEN_SECRET_SIZE: usize = 16;
pub(crate) const MAX_RETRY_TOKEN_SIZE: usize = 256;
/// Smallest stateless reset that cannot be identified as one by an observer
pub(crate) const MIN_STATELESS_RESET_SIZE: usize = 41;
/// Lower bound on the random prefix of a stateless reset
pub(crate) const MIN_RESET_RAND_SIZE: usize = 5;
