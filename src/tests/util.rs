use std::cell::{Cell, RefCell};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use crate::endpoint::{EndpointId, SendTicket, UdpHandle};
use crate::listener::{DispatchListener, Prev};
use crate::session::{InitialClose, InitialVerdict, ServerSessionArgs, Session};
use crate::shared::{ConnectionId, ResetToken};
use crate::{varint, DispatchConfig, Dispatcher, RESET_TOKEN_SIZE, VERSION};

/// Stand-in for the TLS provider; doubles as the knob panel for the
/// session factory.
#[derive(Default)]
pub(crate) struct TestContext {
    /// Makes `create_server` fail, as a real factory would on a bad packet
    pub(crate) reject_sessions: Cell<bool>,
    pub(crate) created: RefCell<Vec<Arc<TestSession>>>,
}

pub(crate) struct TestSession {
    remote: SocketAddr,
    token: ResetToken,
    pub(crate) early_close: InitialClose,
    pub(crate) orig_dst_cid: Option<ConnectionId>,
    /// Datagrams delivered to this session, in arrival order
    pub(crate) received: RefCell<Vec<Vec<u8>>>,
    /// Makes `receive` report the datagram as unprocessable
    pub(crate) reject_datagrams: Cell<bool>,
    pub(crate) closed: Cell<bool>,
    pub(crate) retired_cids: RefCell<Vec<ConnectionId>>,
}

impl TestSession {
    /// A detached session for table-level tests.
    pub(crate) fn bare(remote: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            remote,
            token: ResetToken::from([0; RESET_TOKEN_SIZE]),
            early_close: InitialClose::NoError,
            orig_dst_cid: None,
            received: RefCell::new(Vec::new()),
            reject_datagrams: Cell::new(false),
            closed: Cell::new(false),
            retired_cids: RefCell::new(Vec::new()),
        })
    }
}

impl Session for TestSession {
    type SecureContext = TestContext;

    fn classify(version: u32, data: &[u8]) -> InitialVerdict {
        let Some(&first) = data.first() else {
            return InitialVerdict::Ignore;
        };
        if first & 0x80 == 0 {
            return InitialVerdict::Ignore;
        }
        if version != VERSION {
            return InitialVerdict::VersionMismatch;
        }
        match (first >> 4) & 0b11 {
            0b00 => InitialVerdict::Ok,
            0b01 => InitialVerdict::NeedsRetry,
            _ => InitialVerdict::Ignore,
        }
    }

    fn create_server(args: ServerSessionArgs<'_, Self>) -> Option<Arc<Self>> {
        let ctx = args.secure_ctx;
        if ctx.reject_sessions.get() {
            return None;
        }
        let mut token = [0; RESET_TOKEN_SIZE];
        for (slot, byte) in token.iter_mut().zip(args.dst_cid.iter().cycle()) {
            *slot = *byte;
        }
        let session = Arc::new(Self {
            remote: args.remote,
            token: token.into(),
            early_close: args.early_close,
            orig_dst_cid: args.orig_dst_cid,
            received: RefCell::new(Vec::new()),
            reject_datagrams: Cell::new(false),
            closed: Cell::new(false),
            retired_cids: RefCell::new(Vec::new()),
        });
        ctx.created.borrow_mut().push(session.clone());
        Some(session)
    }

    fn receive(&self, data: &[u8], _local: SocketAddr, _remote: SocketAddr, _flags: u32) -> bool {
        self.received.borrow_mut().push(data.to_vec());
        !self.reject_datagrams.get()
    }

    fn reset_token(&self) -> ResetToken {
        self.token
    }

    fn remote(&self) -> SocketAddr {
        self.remote
    }

    fn on_cid_retired(&self, cid: &ConnectionId) {
        self.retired_cids.borrow_mut().push(*cid);
    }

    fn on_close(&self) {
        self.closed.set(true);
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Outbound {
    pub(crate) ticket: SendTicket,
    pub(crate) data: Vec<u8>,
    pub(crate) remote: SocketAddr,
}

/// Socket double: records sends instead of performing them.
pub(crate) struct TestUdp {
    local: SocketAddr,
    outbound: Rc<RefCell<Vec<Outbound>>>,
    pub(crate) receiving: Rc<Cell<bool>>,
    pub(crate) fail_sends: Rc<Cell<bool>>,
}

impl UdpHandle for TestUdp {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn receive_start(&mut self) -> io::Result<()> {
        self.receiving.set(true);
        Ok(())
    }

    fn receive_stop(&mut self) {
        self.receiving.set(false);
    }

    fn send(&mut self, ticket: SendTicket, data: &[u8], remote: SocketAddr) -> io::Result<()> {
        if self.fail_sends.get() {
            return Err(io::Error::from_raw_os_error(101)); // ENETUNREACH
        }
        self.outbound.borrow_mut().push(Outbound {
            ticket,
            data: data.to_vec(),
            remote,
        });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Error(i64),
    SessionReady,
    ServerBusy(bool),
    EndpointDone(EndpointId),
    Destroy,
}

/// Listener that records every event it sees and optionally forwards to
/// its predecessor.
pub(crate) struct RecordingListener {
    pub(crate) events: Rc<RefCell<Vec<Event>>>,
    pub(crate) forward: bool,
}

impl DispatchListener<TestSession> for RecordingListener {
    fn on_error(&mut self, prev: Prev<'_, TestSession>, code: i64) {
        self.events.borrow_mut().push(Event::Error(code));
        if self.forward {
            prev.on_error(code);
        }
    }

    fn on_session_ready(&mut self, prev: Prev<'_, TestSession>, session: &Arc<TestSession>) {
        self.events.borrow_mut().push(Event::SessionReady);
        if self.forward {
            prev.on_session_ready(session);
        }
    }

    fn on_server_busy(&mut self, prev: Prev<'_, TestSession>, busy: bool) {
        self.events.borrow_mut().push(Event::ServerBusy(busy));
        if self.forward {
            prev.on_server_busy(busy);
        }
    }

    fn on_endpoint_done(&mut self, prev: Prev<'_, TestSession>, endpoint: EndpointId) {
        self.events.borrow_mut().push(Event::EndpointDone(endpoint));
        if self.forward {
            prev.on_endpoint_done(endpoint);
        }
    }

    fn on_destroy(&mut self, prev: Prev<'_, TestSession>) {
        self.events.borrow_mut().push(Event::Destroy);
        if self.forward {
            prev.on_destroy();
        }
    }
}

/// One dispatcher wired to a recording socket and a listening server
/// context.
pub(crate) struct TestDispatch {
    pub(crate) dispatch: Dispatcher<TestSession>,
    pub(crate) ctx: Arc<TestContext>,
    pub(crate) outbound: Rc<RefCell<Vec<Outbound>>>,
    pub(crate) receiving: Rc<Cell<bool>>,
    pub(crate) fail_sends: Rc<Cell<bool>>,
    pub(crate) local: SocketAddr,
    pub(crate) endpoint: EndpointId,
}

impl TestDispatch {
    pub(crate) fn new() -> Self {
        Self::with_config(DispatchConfig::default())
    }

    pub(crate) fn with_config(config: DispatchConfig) -> Self {
        let mut this = Self::without_listen(config);
        this.dispatch.listen(this.ctx.clone(), None, b"h3", 0);
        this
    }

    pub(crate) fn without_listen(config: DispatchConfig) -> Self {
        let mut dispatch = Dispatcher::new(config).unwrap();
        let local = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 4433);
        let outbound = Rc::new(RefCell::new(Vec::new()));
        let receiving = Rc::new(Cell::new(false));
        let fail_sends = Rc::new(Cell::new(false));
        let endpoint = dispatch.add_endpoint(
            Box::new(TestUdp {
                local,
                outbound: outbound.clone(),
                receiving: receiving.clone(),
                fail_sends: fail_sends.clone(),
            }),
            true,
        );
        dispatch.on_endpoint_bound(endpoint);
        Self {
            dispatch,
            ctx: Arc::new(TestContext::default()),
            outbound,
            receiving,
            fail_sends,
            local,
            endpoint,
        }
    }

    pub(crate) fn recv(&mut self, data: &[u8], remote: SocketAddr) {
        self.dispatch
            .on_receive(BytesMut::from(data), self.local, remote, 0);
    }

    pub(crate) fn take_outbound(&mut self) -> Vec<Outbound> {
        self.outbound.borrow_mut().drain(..).collect()
    }
}

pub(crate) fn peer(port: u16) -> SocketAddr {
    SocketAddr::new(Ipv4Addr::new(192, 0, 2, 1).into(), port)
}

/// A short-header datagram carrying a locally sized DCID.
pub(crate) fn short_packet(dcid: &[u8], total: usize) -> Vec<u8> {
    assert!(total > 1 + dcid.len());
    let mut buf = vec![0u8; total];
    buf[0] = 0x4a;
    buf[1..1 + dcid.len()].copy_from_slice(dcid);
    for (i, byte) in buf.iter_mut().enumerate().skip(1 + dcid.len()) {
        *byte = i as u8;
    }
    buf
}

/// A long-header datagram of the given type bits, padded to `total`.
fn long_packet(
    ty_bits: u8,
    version: u32,
    dcid: &[u8],
    scid: &[u8],
    token: &[u8],
    total: usize,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(total);
    buf.put_u8(0b1100_0000 | ty_bits << 4);
    buf.put_u32(version);
    buf.put_u8(dcid.len() as u8);
    buf.put_slice(dcid);
    buf.put_u8(scid.len() as u8);
    buf.put_slice(scid);
    varint::write(token.len() as u64, &mut buf);
    buf.put_slice(token);
    assert!(buf.len() <= total);
    buf.resize(total, 0);
    buf
}

pub(crate) fn initial_packet(
    version: u32,
    dcid: &[u8],
    scid: &[u8],
    token: &[u8],
    total: usize,
) -> Vec<u8> {
    long_packet(0b00, version, dcid, scid, token, total)
}

pub(crate) fn zero_rtt_packet(version: u32, dcid: &[u8], scid: &[u8], total: usize) -> Vec<u8> {
    long_packet(0b01, version, dcid, scid, &[], total)
}
