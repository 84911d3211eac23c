use std::io;
use std::net::SocketAddr;
use std::ops::{Index, IndexMut};

use slab::Slab;

/// Host-provided UDP socket hook.
///
/// The dispatcher performs no I/O itself; the host's event loop owns the
/// socket and drives this trait. Inbound datagrams are delivered to
/// [`Dispatcher::on_receive`](crate::Dispatcher::on_receive), read errors
/// to [`Dispatcher::on_error`](crate::Dispatcher::on_error).
pub trait UdpHandle {
    fn local_addr(&self) -> SocketAddr;

    /// Begins delivering inbound datagrams to the dispatcher.
    fn receive_start(&mut self) -> io::Result<()>;

    fn receive_stop(&mut self);

    /// Starts an asynchronous send. On `Ok` the datagram is enqueued and
    /// the host must later invoke
    /// [`Dispatcher::on_send_done`](crate::Dispatcher::on_send_done) with
    /// `ticket` exactly once; on `Err` the send failed synchronously and
    /// no completion follows.
    fn send(&mut self, ticket: SendTicket, data: &[u8], remote: SocketAddr) -> io::Result<()>;
}

/// One bound UDP socket owned by the dispatcher.
///
/// Lifecycle: bound, then (on request) draining, then done once
/// `pending_sends` reaches zero. The done notification fires exactly once
/// and the dispatcher drops the endpoint with it.
pub(crate) struct Endpoint {
    pub(crate) udp: Box<dyn UdpHandle>,
    pub(crate) pending_sends: usize,
    pub(crate) draining: bool,
}

impl Endpoint {
    pub(crate) fn new(udp: Box<dyn UdpHandle>) -> Self {
        Self {
            udp,
            pending_sends: 0,
            draining: false,
        }
    }
}

/// Identifier for an endpoint owned by a dispatcher
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct EndpointId(pub(crate) usize);

impl Index<EndpointId> for Slab<Endpoint> {
    type Output = Endpoint;
    fn index(&self, id: EndpointId) -> &Endpoint {
        &self[id.0]
    }
}

impl IndexMut<EndpointId> for Slab<Endpoint> {
    fn index_mut(&mut self, id: EndpointId) -> &mut Endpoint {
        &mut self[id.0]
    }
}

/// Identifies an in-flight send request from hand-off to completion
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SendTicket(pub(crate) usize);
