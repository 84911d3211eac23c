use std::cmp;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::BytesMut;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use ring::hmac;
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::config::{ConfigError, DispatchConfig};
use crate::endpoint::{Endpoint, EndpointId, SendTicket, UdpHandle};
use crate::index::CidIndex;
use crate::listener::{DispatchListener, ListenerChain, ListenerId};
use crate::packet::{self, LongType, Packet, ProtectedHeader};
use crate::rate::RateTables;
use crate::session::{InitialClose, InitialVerdict, ServerSessionArgs, Session};
use crate::shared::{ConnectionId, ResetToken};
use crate::stats::{unix_nanos, DispatchStats};
use crate::token;
use crate::{
    Side, LOC_CID_LEN, MAX_CID_SIZE, MAX_PKT_SIZE, MIN_STATELESS_RESET_SIZE, RESET_TOKEN_SIZE,
    TOKEN_SECRET_SIZE, VERSION,
};

/// Server configuration captured by `listen`
struct ServerContext<S: Session> {
    secure_ctx: Arc<S::SecureContext>,
    alpn: Vec<u8>,
    #[allow(dead_code)] // forwarded to sessions through transport parameters eventually
    preferred_addr: Option<SocketAddr>,
    session_options: u32,
}

/// A datagram handed to the UDP layer, retained until its completion
struct SendRequest<S: Session> {
    packet: Packet,
    #[allow(dead_code)] // keeps the session alive for the duration of the send
    session: Option<Arc<S>>,
    endpoint: EndpointId,
}

/// The datagram demultiplexer at the heart of a server-capable QUIC
/// endpoint.
///
/// Owns the bound UDP endpoints and every table needed to route inbound
/// datagrams: the CID index, the stateless-reset token index, and the
/// per-peer rate tables. Datagrams that match no session either mint a
/// new server session or draw a stateless response.
pub struct Dispatcher<S: Session> {
    rng: StdRng,
    endpoints: Slab<Endpoint>,
    preferred: Option<EndpointId>,
    index: CidIndex<S>,
    rate: RateTables,
    reset_tokens: HashMap<ResetToken, Arc<S>>,
    token_key: hmac::Key,
    reset_key: hmac::Key,
    listening: bool,
    server_busy: bool,
    reset_disabled: bool,
    rx_loss: f64,
    tx_loss: f64,
    config: DispatchConfig,
    server: Option<ServerContext<S>>,
    sends: Slab<SendRequest<S>>,
    listeners: ListenerChain<S>,
    stats: DispatchStats,
}

impl<S: Session> Dispatcher<S> {
    /// Creates a dispatcher with no endpoints.
    ///
    /// Returns `Err` if the configuration is invalid.
    pub fn new(config: DispatchConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut rng = StdRng::from_os_rng();

        let mut token_secret = [0u8; TOKEN_SECRET_SIZE];
        rng.fill_bytes(&mut token_secret);
        let reset_secret = config.reset_secret.unwrap_or_else(|| {
            let mut secret = [0u8; RESET_TOKEN_SIZE];
            rng.fill_bytes(&mut secret);
            secret
        });

        Ok(Self {
            rng,
            endpoints: Slab::new(),
            preferred: None,
            index: CidIndex::new(),
            rate: RateTables::new(),
            reset_tokens: HashMap::new(),
            token_key: hmac::Key::new(hmac::HMAC_SHA256, &token_secret),
            reset_key: hmac::Key::new(hmac::HMAC_SHA256, &reset_secret),
            listening: false,
            server_busy: false,
            reset_disabled: config.disable_stateless_reset,
            rx_loss: 0.0,
            tx_loss: 0.0,
            config,
            server: None,
            sends: Slab::new(),
            listeners: ListenerChain::new(),
            stats: DispatchStats {
                created_at: unix_nanos(SystemTime::now()),
                ..DispatchStats::default()
            },
        })
    }

    /// Adopts a bound UDP socket. The first endpoint added, or any added
    /// with `preferred`, becomes the one stateless responses are sent
    /// from.
    pub fn add_endpoint(&mut self, udp: Box<dyn UdpHandle>, preferred: bool) -> EndpointId {
        let first = self.endpoints.is_empty();
        let id = EndpointId(self.endpoints.insert(Endpoint::new(udp)));
        if preferred || first {
            self.preferred = Some(id);
        }
        if self.listening {
            if let Err(e) = self.endpoints[id].udp.receive_start() {
                warn!("failed to start receiving on new endpoint: {}", e);
            }
        }
        id
    }

    /// Marks the bind of an endpoint complete.
    pub fn on_endpoint_bound(&mut self, endpoint: EndpointId) {
        trace!("endpoint {} bound", self.endpoints[endpoint].udp.local_addr());
        self.stats.bound_at = unix_nanos(SystemTime::now());
    }

    /// Starts accepting connections. Calling twice is a fatal misuse.
    pub fn listen(
        &mut self,
        secure_ctx: Arc<S::SecureContext>,
        preferred_addr: Option<SocketAddr>,
        alpn: &[u8],
        session_options: u32,
    ) {
        assert!(self.server.is_none() && !self.listening, "already listening");
        debug!("starting to listen");
        self.server = Some(ServerContext {
            secure_ctx,
            alpn: alpn.to_vec(),
            preferred_addr,
            session_options,
        });
        self.listening = true;
        self.stats.listen_at = unix_nanos(SystemTime::now());
        for (_, endpoint) in self.endpoints.iter_mut() {
            if let Err(e) = endpoint.udp.receive_start() {
                warn!("failed to start receiving: {}", e);
            }
        }
    }

    /// Stops accepting connections. Established sessions are unaffected.
    pub fn stop_listening(&mut self) {
        debug!("no longer listening");
        self.listening = false;
    }

    /// Marks the server busy. While busy, accepted sessions are closed
    /// immediately after their initial keys are installed.
    pub fn set_server_busy(&mut self, busy: bool) {
        debug!("server busy: {}", busy);
        self.server_busy = busy;
        self.listeners.on_server_busy(busy);
    }

    /// Flips stateless reset emission and recognition. Returns whether
    /// stateless resets are now enabled.
    pub fn toggle_stateless_reset(&mut self) -> bool {
        self.reset_disabled = !self.reset_disabled;
        !self.reset_disabled
    }

    /// Randomly drops received and transmitted packets with the given
    /// probabilities. A diagnostic facility; never enable in production.
    pub fn set_diagnostic_packet_loss(&mut self, rx: f64, tx: f64) {
        assert!((0.0..=1.0).contains(&rx) && (0.0..=1.0).contains(&tx));
        self.rx_loss = rx;
        self.tx_loss = tx;
    }

    /// Stops reception on every endpoint. Sessions stay alive so they can
    /// close gracefully.
    pub fn destroy(&mut self) {
        for (_, endpoint) in self.endpoints.iter_mut() {
            endpoint.udp.receive_stop();
        }
    }

    pub fn push_listener(&mut self, listener: Box<dyn DispatchListener<S>>) -> ListenerId {
        self.listeners.push(listener)
    }

    pub fn remove_listener(&mut self, id: ListenerId) {
        self.listeners.remove(id)
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    //
    // Session registry, driven by sessions and the host
    //

    /// Registers a session under its primary CID and starts counting it
    /// against its peer's connection budget.
    pub fn add_session(&mut self, cid: ConnectionId, session: Arc<S>, side: Side) {
        let remote = session.remote();
        self.index.insert_primary(cid, session);
        match side {
            Side::Server => self.stats.server_sessions += 1,
            Side::Client => self.stats.client_sessions += 1,
        }
        self.rate.inc_conns(remote);
    }

    /// Removes a session's primary CID, every alias pointing at it, and
    /// its reset-token binding, then tells the session it is gone.
    pub fn remove_session(&mut self, cid: &ConnectionId) {
        let Some(session) = self.index.remove_primary(cid) else {
            return;
        };
        self.rate.dec_conns(&session.remote());
        self.reset_tokens.retain(|_, s| !Arc::ptr_eq(s, &session));
        session.on_close();
    }

    /// Routes an additional CID to an existing primary.
    pub fn associate_cid(&mut self, alias: ConnectionId, primary: &ConnectionId) {
        self.index.insert_alias(alias, *primary);
    }

    /// Retires an alias, notifying the session that owned it.
    pub fn disassociate_cid(&mut self, alias: &ConnectionId) {
        let session = self.index.find(alias).cloned();
        if self.index.remove_alias(alias).is_some() {
            if let Some(session) = session {
                session.on_cid_retired(alias);
            }
        }
    }

    /// Indexes a session under its stateless reset token so inbound
    /// resets can be routed to it.
    pub fn associate_reset_token(&mut self, token: ResetToken, session: Arc<S>) {
        if self.reset_tokens.insert(token, session).is_some() {
            warn!("duplicate reset token");
        }
    }

    pub fn disassociate_reset_token(&mut self, token: &ResetToken) {
        self.reset_tokens.remove(token);
    }

    //
    // Datagram path
    //

    /// Processes one inbound datagram. This is the primary entry point
    /// for data received on any endpoint.
    pub fn on_receive(&mut self, data: BytesMut, local: SocketAddr, remote: SocketAddr, flags: u32) {
        trace!("receiving {} bytes on {}", data.len(), local);
        if self.diagnostic_loss(self.rx_loss) {
            debug!("simulating received packet loss");
            return;
        }

        self.stats.bytes_received += data.len() as u64;

        let hdr = match ProtectedHeader::decode(&data, LOC_CID_LEN) {
            Ok(hdr) => hdr,
            Err(e) => {
                trace!("malformed header: {}", e);
                self.stats.packets_ignored += 1;
                return;
            }
        };
        trace!("received a packet for dcid {}", hdr.dst_cid);

        let session = match self.index.find(&hdr.dst_cid).cloned() {
            Some(session) => session,
            None => {
                trace!("no existing session for dcid {}", hdr.dst_cid);
                // A lost-state peer sends short headers we cannot route;
                // an inbound stateless reset also looks like one.
                let short_header =
                    hdr.is_short() && hdr.version == VERSION && hdr.src_cid.is_empty();

                if short_header && self.recognize_stateless_reset(&data, local, remote, flags) {
                    trace!("handled stateless reset");
                    return;
                }

                match self.accept_initial(&hdr, &data, local, remote) {
                    Some(session) => session,
                    None => {
                        debug!("unable to create a server session for dcid {}", hdr.dst_cid);
                        if short_header
                            && self.send_stateless_reset(&hdr.dst_cid, local, remote, data.len())
                        {
                            self.stats.stateless_reset_count += 1;
                            return;
                        }
                        self.stats.packets_ignored += 1;
                        return;
                    }
                }
            }
        };

        if session.receive(&data, local, remote, flags) {
            self.stats.packets_received += 1;
        } else {
            self.stats.packets_ignored += 1;
        }
    }

    /// Reports a read error on an endpoint. Reception continues.
    pub fn on_error(&mut self, endpoint: EndpointId, code: i64) {
        debug!(
            "reading from {} failed: {}",
            self.endpoints[endpoint].udp.local_addr(),
            code
        );
        self.listeners.on_error(code);
    }

    /// Hands a packet to the preferred endpoint. An empty packet is a
    /// no-op; a synchronous failure drops the packet and no completion
    /// follows.
    pub fn send_packet(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        packet: Packet,
        session: Option<Arc<S>>,
    ) -> io::Result<()> {
        if packet.is_empty() {
            return Ok(());
        }
        trace!(
            "sending {} bytes to {} from {} ({})",
            packet.len(),
            remote,
            local,
            packet.diagnostic_label()
        );
        if self.diagnostic_loss(self.tx_loss) {
            debug!("simulating transmitted packet loss");
            return Ok(());
        }

        let endpoint = self.preferred.expect("no preferred endpoint to send from");
        let entry = self.sends.vacant_entry();
        let ticket = SendTicket(entry.key());
        let request = entry.insert(SendRequest {
            packet,
            session,
            endpoint,
        });
        match self.endpoints[endpoint]
            .udp
            .send(ticket, request.packet.data(), remote)
        {
            Ok(()) => {
                self.endpoints[endpoint].pending_sends += 1;
                Ok(())
            }
            Err(e) => {
                let request = self.sends.remove(ticket.0);
                self.on_send(Err(&e), &request.packet);
                Err(e)
            }
        }
    }

    /// Completes the send identified by `ticket`.
    pub fn on_send_done(&mut self, ticket: SendTicket, status: io::Result<()>) {
        let request = self.sends.remove(ticket.0);
        self.on_send(status.as_ref().map(|_| ()), &request.packet);

        let endpoint = request.endpoint;
        let ep = &mut self.endpoints[endpoint];
        ep.pending_sends -= 1;
        if ep.draining && ep.pending_sends == 0 {
            self.finish_endpoint(endpoint);
        }
    }

    /// Requests the endpoint-done notification once every in-flight send
    /// on `endpoint` has completed. Fires immediately when none are.
    pub fn wait_for_drain(&mut self, endpoint: EndpointId) {
        if !self.endpoints.contains(endpoint.0) {
            return;
        }
        let ep = &mut self.endpoints[endpoint];
        ep.draining = true;
        if ep.pending_sends == 0 {
            self.finish_endpoint(endpoint);
        }
    }

    fn finish_endpoint(&mut self, endpoint: EndpointId) {
        debug!("endpoint has no pending sends left");
        self.listeners.on_endpoint_done(endpoint);
        self.endpoints.remove(endpoint.0);
        if self.preferred == Some(endpoint) {
            self.preferred = None;
        }
    }

    fn on_send(&mut self, status: Result<(), &io::Error>, packet: &Packet) {
        match status {
            Ok(()) => {
                trace!("sent {} bytes ({})", packet.len(), packet.diagnostic_label());
                self.stats.bytes_sent += packet.len() as u64;
                self.stats.packets_sent += 1;
            }
            Err(e) => debug!(
                "failed to send {} bytes ({}): {}",
                packet.len(),
                packet.diagnostic_label(),
                e
            ),
        }
    }

    //
    // Unroutable datagrams
    //

    /// Routes a trailing reset token to the session that issued it. The
    /// session's verdict on the datagram propagates.
    fn recognize_stateless_reset(
        &mut self,
        data: &[u8],
        local: SocketAddr,
        remote: SocketAddr,
        flags: u32,
    ) -> bool {
        if self.reset_disabled || data.len() < RESET_TOKEN_SIZE {
            return false;
        }
        let mut candidate = [0u8; RESET_TOKEN_SIZE];
        candidate.copy_from_slice(&data[data.len() - RESET_TOKEN_SIZE..]);
        let Some(session) = self.reset_tokens.get(&ResetToken::from(candidate)) else {
            return false;
        };
        debug!("received a stateless reset token");
        session.receive(data, local, remote, flags)
    }

    /// Vets a datagram that matched no session and, if everything checks
    /// out, builds a server session for it.
    fn accept_initial(
        &mut self,
        hdr: &ProtectedHeader,
        data: &[u8],
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Option<Arc<S>> {
        if !self.listening {
            debug!("dispatcher is not listening");
            return None;
        }

        match S::classify(hdr.version, data) {
            InitialVerdict::VersionMismatch => {
                self.send_version_negotiation(hdr.version, &hdr.dst_cid, &hdr.src_cid, local, remote);
                return None;
            }
            InitialVerdict::NeedsRetry => {
                debug!("early data before a handshake, sending retry");
                self.send_retry(hdr.version, &hdr.dst_cid, &hdr.src_cid, local, remote);
                return None;
            }
            InitialVerdict::Ignore => return None,
            InitialVerdict::Ok => {}
        }

        let mut early_close = InitialClose::NoError;
        if self.server_busy {
            debug!("dispatcher is marked busy");
            early_close = InitialClose::ServerBusy;
        }
        if self.rate.current_conns(&remote) >= self.config.max_conns_per_peer {
            debug!("session count for {} exceeded", remote);
            early_close = InitialClose::ServerBusy;
        }

        // Explicit address validation; pointless when the session is
        // being rejected anyway.
        let mut orig_dst_cid = None;
        if early_close == InitialClose::NoError
            && self.config.validate_address
            && hdr.ty == Some(LongType::Initial)
        {
            if self.config.validate_address_lru && self.rate.is_validated(&remote) {
                trace!("skipping validation for a recently validated address");
            } else {
                let token_bytes = match &hdr.token {
                    Some(range) => &data[range.clone()],
                    None => &[],
                };
                match token::check(
                    &self.token_key,
                    &remote,
                    token_bytes,
                    SystemTime::now(),
                    self.config.retry_token_ttl,
                ) {
                    Some(ocid) => {
                        trace!("retry token accepted");
                        self.rate.set_validated(remote);
                        orig_dst_cid = Some(ocid);
                    }
                    None => {
                        debug!("no valid retry token, sending retry");
                        self.send_retry(hdr.version, &hdr.dst_cid, &hdr.src_cid, local, remote);
                        return None;
                    }
                }
            }
        }

        let session = {
            let server = self
                .server
                .as_ref()
                .expect("listening without server configuration");
            S::create_server(ServerSessionArgs {
                version: hdr.version,
                dst_cid: hdr.dst_cid,
                src_cid: hdr.src_cid,
                orig_dst_cid,
                local,
                remote,
                alpn: &server.alpn,
                session_options: server.session_options,
                early_close,
                qlog: self.config.qlog,
                secure_ctx: &server.secure_ctx,
            })?
        };

        self.add_session(hdr.dst_cid, session.clone(), Side::Server);
        self.associate_reset_token(session.reset_token(), session.clone());
        self.listeners.on_session_ready(&session);
        Some(session)
    }

    fn send_version_negotiation(
        &mut self,
        version: u32,
        dcid: &ConnectionId,
        scid: &ConnectionId,
        local: SocketAddr,
        remote: SocketAddr,
    ) {
        trace!("sending version negotiation to {}", remote);
        let versions = [reserved_version(&remote, version), VERSION];
        let random = self.rng.random::<u8>();
        let mut packet = Packet::labeled("version negotiation", dcid.len() + scid.len() + 15);
        // The peer's SCID is the only CID it will accept as destination.
        let len = packet::write_version_negotiation(packet.data_mut(), random, scid, dcid, &versions);
        packet.set_len(len);
        let _ = self.send_packet(local, remote, packet, None);
    }

    fn send_retry(
        &mut self,
        version: u32,
        dcid: &ConnectionId,
        scid: &ConnectionId,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> bool {
        let token = token::generate(&self.token_key, &remote, dcid, SystemTime::now());
        let new_scid = ConnectionId::random(&mut self.rng, LOC_CID_LEN);
        debug!("sending retry to {} with new scid {}", remote, new_scid);
        let mut packet =
            Packet::labeled("retry", token.len() + 2 * MAX_CID_SIZE + scid.len() + 8);
        match packet::write_retry(packet.data_mut(), version, scid, &new_scid, dcid, &token) {
            Some(len) => {
                packet.set_len(len);
                self.send_packet(local, remote, packet, None).is_ok()
            }
            None => false,
        }
    }

    fn send_stateless_reset(
        &mut self,
        dcid: &ConnectionId,
        local: SocketAddr,
        remote: SocketAddr,
        source_len: usize,
    ) -> bool {
        if self.reset_disabled {
            return false;
        }
        // Two looping defenses: cap the resets a peer can ever draw, and
        // stay strictly smaller than the packet that triggered us.
        if self.rate.current_resets(&remote) >= self.config.max_resets_per_peer {
            return false;
        }
        let pktlen = cmp::min(source_len.saturating_sub(1), MAX_PKT_SIZE);
        if pktlen < MIN_STATELESS_RESET_SIZE {
            return false;
        }

        let token = ResetToken::new(&self.reset_key, dcid);
        let mut packet = Packet::labeled("stateless reset", pktlen);
        let Some(len) = packet::write_stateless_reset(packet.data_mut(), &token, &mut self.rng)
        else {
            return false;
        };
        packet.set_len(len);
        debug!("sending stateless reset for {} to {}", dcid, remote);
        self.rate.inc_resets(remote);
        self.send_packet(local, remote, packet, None).is_ok()
    }

    fn diagnostic_loss(&mut self, prob: f64) -> bool {
        prob > 0.0 && self.rng.random::<f64>() < prob
    }

    #[cfg(test)]
    pub(crate) fn peer_sessions(&self, peer: &SocketAddr) -> u32 {
        self.rate.current_conns(peer)
    }

    #[cfg(test)]
    pub(crate) fn address_validated(&self, peer: &SocketAddr) -> bool {
        self.rate.is_validated(peer)
    }

    #[cfg(test)]
    pub(crate) fn known_sessions(&self) -> usize {
        self.index.session_count()
    }

    #[cfg(test)]
    pub(crate) fn known_reset_tokens(&self) -> usize {
        self.reset_tokens.len()
    }
}

impl<S: Session> Drop for Dispatcher<S> {
    fn drop(&mut self) {
        let now = unix_nanos(SystemTime::now());
        debug!(
            duration = now.saturating_sub(self.stats.created_at),
            bytes_received = self.stats.bytes_received,
            bytes_sent = self.stats.bytes_sent,
            packets_received = self.stats.packets_received,
            packets_sent = self.stats.packets_sent,
            packets_ignored = self.stats.packets_ignored,
            server_sessions = self.stats.server_sessions,
            client_sessions = self.stats.client_sessions,
            stateless_resets = self.stats.stateless_reset_count,
            "dispatcher destroyed"
        );
        self.listeners.on_destroy();
    }
}

/// A version number from the block reserved for negotiation greasing,
/// varied by peer and proposed version so clients cannot rely on it.
pub(crate) fn reserved_version(remote: &SocketAddr, version: u32) -> u32 {
    let mut addr = Vec::with_capacity(19);
    token::encode_addr(&mut addr, remote);
    let h = fnv1a(fnv1a(0x811c_9dc5, &addr), &version.to_be_bytes());
    (h & 0xf0f0_f0f0) | 0x0a0a_0a0a
}

fn fnv1a(seed: u32, data: &[u8]) -> u32 {
    data.iter()
        .fold(seed, |h, &b| (h ^ u32::from(b)).wrapping_mul(0x0100_0193))
}
