use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut};
use ring::hmac;

use crate::constant_time;
use crate::shared::{ConnectionId, ResetToken};
use crate::stats::unix_nanos;
use crate::{MAX_CID_SIZE, MAX_RETRY_TOKEN_SIZE, RESET_TOKEN_SIZE};

// Token layout, all fields covered by the trailing MAC:
//
//   u8     format version (1)
//   u64be  issued-at, unix nanoseconds
//   addr   tag byte (0 = v4, 1 = v6), ip octets, u16be port
//   u8     original DCID length
//   [...]  original DCID
//   [16]   HMAC-SHA-256 over the preceding bytes, truncated

const FORMAT_VERSION: u8 = 1;
const MAC_SIZE: usize = 16;

/// Issues a retry token binding `address` to the DCID the client first
/// chose. Always at most 256 bytes.
pub(crate) fn generate(
    key: &hmac::Key,
    address: &SocketAddr,
    orig_dst_cid: &ConnectionId,
    issued: SystemTime,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MAX_RETRY_TOKEN_SIZE);
    buf.put_u8(FORMAT_VERSION);
    buf.put_u64(unix_nanos(issued));
    encode_addr(&mut buf, address);
    buf.put_u8(orig_dst_cid.len() as u8);
    buf.put_slice(orig_dst_cid);
    let mac = hmac::sign(key, &buf);
    buf.extend_from_slice(&mac.as_ref()[..MAC_SIZE]);
    debug_assert!(buf.len() <= MAX_RETRY_TOKEN_SIZE);
    buf
}

/// Validates a retry token against the peer that presented it. Yields the
/// original DCID the token was issued for, or `None` on any mismatch:
/// forged or truncated MAC, another peer's address, or expiry.
pub(crate) fn check(
    key: &hmac::Key,
    address: &SocketAddr,
    token: &[u8],
    now: SystemTime,
    ttl: Duration,
) -> Option<ConnectionId> {
    if token.len() < MAC_SIZE {
        return None;
    }
    let (body, mac) = token.split_at(token.len() - MAC_SIZE);
    let expected = hmac::sign(key, body);
    if !constant_time::eq(mac, &expected.as_ref()[..MAC_SIZE]) {
        return None;
    }

    let mut r = body;
    if r.remaining() < 1 + 8 {
        return None;
    }
    if r.get_u8() != FORMAT_VERSION {
        return None;
    }
    let issued = UNIX_EPOCH + Duration::from_nanos(r.get_u64());
    if decode_addr(&mut r)? != *address {
        return None;
    }
    if !r.has_remaining() {
        return None;
    }
    let len = r.get_u8() as usize;
    if len > MAX_CID_SIZE || r.remaining() != len {
        return None;
    }
    let orig_dst_cid = ConnectionId::new(&r.chunk()[..len]);

    // A token from the future is merely unexpired.
    if now.duration_since(issued).map_or(false, |age| age > ttl) {
        return None;
    }
    Some(orig_dst_cid)
}

impl ResetToken {
    /// Derives the stateless reset token for `id`: the truncated
    /// HMAC-SHA-256 of the CID under the dispatcher's reset secret.
    pub(crate) fn new(key: &hmac::Key, id: &ConnectionId) -> Self {
        let signature = hmac::sign(key, id);
        let mut token = [0; RESET_TOKEN_SIZE];
        token.copy_from_slice(&signature.as_ref()[..RESET_TOKEN_SIZE]);
        token.into()
    }
}

/// Canonical wire form of a socket address, shared by retry tokens and the
/// reserved-version hash.
pub(crate) fn encode_addr(buf: &mut Vec<u8>, address: &SocketAddr) {
    match address.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(0);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(1);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(address.port());
}

fn decode_addr(r: &mut &[u8]) -> Option<SocketAddr> {
    if !r.has_remaining() {
        return None;
    }
    let ip = match r.get_u8() {
        0 => {
            if r.remaining() < 4 {
                return None;
            }
            let mut octets = [0u8; 4];
            r.copy_to_slice(&mut octets);
            IpAddr::from(octets)
        }
        1 => {
            if r.remaining() < 16 {
                return None;
            }
            let mut octets = [0u8; 16];
            r.copy_to_slice(&mut octets);
            IpAddr::from(octets)
        }
        _ => return None,
    };
    if r.remaining() < 2 {
        return None;
    }
    Some(SocketAddr::new(ip, r.get_u16()))
}
