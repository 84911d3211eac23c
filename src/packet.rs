use std::ops::Range;

use bytes::{Buf, BufMut};
use rand::RngCore;
use ring::aead;
use thiserror::Error;

use crate::shared::{ConnectionId, ResetToken};
use crate::{
    varint, MAX_CID_SIZE, MAX_PKT_SIZE, MIN_RESET_RAND_SIZE, MIN_STATELESS_RESET_SIZE,
    RESET_TOKEN_SIZE, VERSION,
};

pub(crate) const LONG_HEADER_FORM: u8 = 0x80;
const SHORT_FIRST_BYTE: u8 = 0x40;

/// Owned datagram buffer handed to the UDP layer.
///
/// Carries a diagnostic label so send logging can say what kind of packet
/// was in flight. The buffer is allocated at full capacity up front;
/// [`Packet::set_len`] trims it to what an encoder actually produced.
#[derive(Clone)]
pub struct Packet {
    data: Vec<u8>,
    len: usize,
    label: Option<&'static str>,
}

impl Packet {
    /// Allocates an unlabeled packet of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity <= MAX_PKT_SIZE);
        Self {
            data: vec![0; capacity],
            len: capacity,
            label: None,
        }
    }

    /// Allocates a packet of `capacity` bytes carrying a diagnostic label.
    pub fn labeled(label: &'static str, capacity: usize) -> Self {
        let mut packet = Self::new(capacity);
        packet.label = Some(label);
        packet
    }

    /// Bytes currently considered part of the packet.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Full-capacity view for encoders.
    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Trims the packet to the `len` bytes an encoder produced.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.data.len());
        self.len = len;
    }

    pub fn diagnostic_label(&self) -> &'static str {
        self.label.unwrap_or("unspecified")
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub(crate) enum HeaderError {
    #[error("{0}")]
    InvalidHeader(&'static str),
    #[error("illegal connection ID length")]
    IllegalCidLength,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum LongType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

impl LongType {
    fn from_byte(first: u8) -> Self {
        match (first >> 4) & 0b11 {
            0b00 => Self::Initial,
            0b01 => Self::ZeroRtt,
            0b10 => Self::Handshake,
            _ => Self::Retry,
        }
    }
}

/// Invariant-header view of an inbound datagram: version and connection
/// IDs, readable without any crypto context.
///
/// Packet-number protection means nothing past these fields can be
/// examined here; full decoding is the session's concern. For version-1
/// Initial packets the address-validation token's position is also
/// recorded, since retry handling happens before any session exists.
#[derive(Debug)]
pub(crate) struct ProtectedHeader {
    pub(crate) version: u32,
    pub(crate) dst_cid: ConnectionId,
    pub(crate) src_cid: ConnectionId,
    pub(crate) long: bool,
    pub(crate) ty: Option<LongType>,
    pub(crate) token: Option<Range<usize>>,
}

impl ProtectedHeader {
    /// Decodes the invariant header. Short headers are assumed to carry a
    /// locally issued connection ID of `local_cid_len` bytes and report
    /// the implemented protocol version, since no other version can have
    /// produced them.
    pub(crate) fn decode(data: &[u8], local_cid_len: usize) -> Result<Self, HeaderError> {
        let mut r = data;
        if !r.has_remaining() {
            return Err(HeaderError::InvalidHeader("empty datagram"));
        }
        let first = r.get_u8();

        if first & LONG_HEADER_FORM == 0 {
            if r.remaining() < local_cid_len {
                return Err(HeaderError::InvalidHeader("datagram shorter than connection ID"));
            }
            let dst_cid = ConnectionId::new(&r.chunk()[..local_cid_len]);
            return Ok(Self {
                version: VERSION,
                dst_cid,
                src_cid: ConnectionId::new(&[]),
                long: false,
                ty: None,
                token: None,
            });
        }

        if r.remaining() < 4 {
            return Err(HeaderError::InvalidHeader("datagram too short for version"));
        }
        let version = r.get_u32();
        let dst_cid = Self::get_cid(&mut r)?;
        let src_cid = Self::get_cid(&mut r)?;

        // The type bits are only meaningful in a version we implement.
        if version != VERSION {
            return Ok(Self {
                version,
                dst_cid,
                src_cid,
                long: true,
                ty: None,
                token: None,
            });
        }

        let ty = LongType::from_byte(first);
        let mut token = None;
        if ty == LongType::Initial {
            let token_len = varint::read(&mut r)
                .ok_or(HeaderError::InvalidHeader("malformed token length"))?
                as usize;
            if r.remaining() < token_len {
                return Err(HeaderError::InvalidHeader("token longer than packet"));
            }
            let start = data.len() - r.remaining();
            token = Some(start..start + token_len);
        }

        Ok(Self {
            version,
            dst_cid,
            src_cid,
            long: true,
            ty: Some(ty),
            token,
        })
    }

    pub(crate) fn is_short(&self) -> bool {
        !self.long
    }

    fn get_cid(r: &mut &[u8]) -> Result<ConnectionId, HeaderError> {
        if !r.has_remaining() {
            return Err(HeaderError::InvalidHeader("datagram too short for connection ID"));
        }
        let len = r.get_u8() as usize;
        if len > MAX_CID_SIZE {
            return Err(HeaderError::IllegalCidLength);
        }
        if r.remaining() < len {
            return Err(HeaderError::InvalidHeader("connection ID longer than packet"));
        }
        let cid = ConnectionId::new(&r.chunk()[..len]);
        r.advance(len);
        Ok(cid)
    }
}

/// Composes a version negotiation packet into `buf`, echoing the peer's
/// source CID as the packet's destination. Returns the encoded length.
pub(crate) fn write_version_negotiation(
    buf: &mut [u8],
    random: u8,
    dst_cid: &ConnectionId,
    src_cid: &ConnectionId,
    versions: &[u32],
) -> usize {
    let total = 5 + 1 + dst_cid.len() + 1 + src_cid.len() + 4 * versions.len();
    debug_assert!(total <= buf.len());
    let mut w = &mut buf[..];
    w.put_u8(LONG_HEADER_FORM | (random & 0x7f));
    w.put_u32(0); // the version field of a negotiation packet
    w.put_u8(dst_cid.len() as u8);
    w.put_slice(dst_cid);
    w.put_u8(src_cid.len() as u8);
    w.put_slice(src_cid);
    for &version in versions {
        w.put_u32(version);
    }
    total
}

/// Composes a retry packet with its integrity tag. Returns the encoded
/// length, or `None` if it would not fit in `buf`.
pub(crate) fn write_retry(
    buf: &mut [u8],
    version: u32,
    dst_cid: &ConnectionId,
    src_cid: &ConnectionId,
    orig_dst_cid: &ConnectionId,
    token: &[u8],
) -> Option<usize> {
    // The tag covers the original DCID followed by the entire packet, so
    // assemble the pseudo-packet first.
    let mut pseudo = Vec::with_capacity(1 + MAX_CID_SIZE + buf.len());
    pseudo.put_u8(orig_dst_cid.len() as u8);
    pseudo.put_slice(orig_dst_cid);
    let start = pseudo.len();
    pseudo.put_u8(LONG_HEADER_FORM | SHORT_FIRST_BYTE | 0b11 << 4);
    pseudo.put_u32(version);
    pseudo.put_u8(dst_cid.len() as u8);
    pseudo.put_slice(dst_cid);
    pseudo.put_u8(src_cid.len() as u8);
    pseudo.put_slice(src_cid);
    pseudo.put_slice(token);

    let total = pseudo.len() - start + RETRY_TAG_SIZE;
    if total > buf.len() {
        return None;
    }
    let tag = retry_tag(&pseudo);
    buf[..pseudo.len() - start].copy_from_slice(&pseudo[start..]);
    buf[pseudo.len() - start..total].copy_from_slice(&tag);
    Some(total)
}

pub(crate) const RETRY_TAG_SIZE: usize = 16;

/// Integrity tag over a retry pseudo-packet, per the fixed key and nonce
/// RFC 9001 assigns to version 1.
pub(crate) fn retry_tag(pseudo_packet: &[u8]) -> [u8; RETRY_TAG_SIZE] {
    const KEY: [u8; 16] = [
        0xbe, 0x0c, 0x69, 0x0b, 0x9f, 0x66, 0x57, 0x5a, 0x1d, 0x76, 0x6b, 0x54, 0xe3, 0x68, 0xc8,
        0x4e,
    ];
    const NONCE: [u8; 12] = [
        0x46, 0x15, 0x99, 0xd3, 0x5d, 0x63, 0x2b, 0xf2, 0x23, 0x98, 0x25, 0xbb,
    ];

    let key = aead::LessSafeKey::new(aead::UnboundKey::new(&aead::AES_128_GCM, &KEY).unwrap());
    let nonce = aead::Nonce::assume_unique_for_key(NONCE);
    let tag = key
        .seal_in_place_separate_tag(nonce, aead::Aad::from(pseudo_packet), &mut [])
        .unwrap();
    let mut out = [0; RETRY_TAG_SIZE];
    out.copy_from_slice(tag.as_ref());
    out
}

/// Fills `buf` with a stateless reset: a random prefix masked to look like
/// a short-header packet, with the reset token in the trailing bytes.
/// Returns the encoded length, or `None` when `buf` is too small to hold
/// an unidentifiable reset.
pub(crate) fn write_stateless_reset<R: RngCore>(
    buf: &mut [u8],
    token: &ResetToken,
    rng: &mut R,
) -> Option<usize> {
    let len = buf.len();
    if len < MIN_STATELESS_RESET_SIZE {
        return None;
    }
    let pad = len - RESET_TOKEN_SIZE;
    debug_assert!(pad >= MIN_RESET_RAND_SIZE * 5);
    rng.fill_bytes(&mut buf[..pad]);
    buf[0] = SHORT_FIRST_BYTE | buf[0] >> 2;
    buf[pad..].copy_from_slice(token);
    Some(len)
}
