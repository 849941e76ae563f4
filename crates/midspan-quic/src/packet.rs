//! Packet headers and the parsed-packet model.
//!
//! Long headers carry the version and both connection IDs; Initial adds a
//! token, Retry carries the original destination CID plus a retry token,
//! and Version Negotiation lists the supported versions. The short (1-RTT)
//! header carries only the destination CID and packet number. Packet
//! numbers are serialized as four big-endian bytes; header protection
//! masks them in place after payload protection.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    frame::Frame,
    keys::KeyPhase,
    types::{
        ConnectionId, EncryptionLevel, PacketNumber, StatelessResetToken, Version,
        VERSION_NEGOTIATION,
    },
    varint,
};

/// Long-header form bit.
const FORM_LONG: u8 = 0x80;
/// Fixed bit, always set on v1 packets.
const FIXED_BIT: u8 = 0x40;
/// Serialized packet-number width.
pub const PN_LEN: usize = 4;

/// Packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Long header, carries a token
    Initial,
    /// Long header, 0-RTT application data
    ZeroRtt,
    /// Long header, handshake data
    Handshake,
    /// Long header, address-validation retry (unprotected)
    Retry,
    /// Version list for an unsupported client version (unprotected)
    VersionNegotiation,
    /// Short header, 1-RTT application data
    OneRtt,
    /// Token-bearing reset for a connection we have no state for
    StatelessReset,
}

impl PacketType {
    /// The encryption level protecting packets of this type, if any.
    #[must_use]
    pub fn encryption_level(self) -> Option<EncryptionLevel> {
        match self {
            Self::Initial => Some(EncryptionLevel::Initial),
            Self::ZeroRtt => Some(EncryptionLevel::ZeroRtt),
            Self::Handshake => Some(EncryptionLevel::Handshake),
            Self::OneRtt => Some(EncryptionLevel::OneRtt),
            Self::Retry | Self::VersionNegotiation | Self::StatelessReset => None,
        }
    }

    /// Default key phase for this packet type.
    #[must_use]
    pub fn key_phase(self) -> Option<KeyPhase> {
        match self {
            Self::Initial => Some(KeyPhase::Initial),
            Self::ZeroRtt => Some(KeyPhase::ZeroRtt),
            Self::Handshake => Some(KeyPhase::Handshake),
            Self::OneRtt => Some(KeyPhase::Phase0),
            Self::Retry | Self::VersionNegotiation | Self::StatelessReset => None,
        }
    }

    fn long_type_bits(self) -> Option<u8> {
        match self {
            Self::Initial => Some(0),
            Self::ZeroRtt => Some(1),
            Self::Handshake => Some(2),
            Self::Retry => Some(3),
            _ => None,
        }
    }
}

/// Parsed or constructed packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    /// Packet type
    pub packet_type: PacketType,
    /// Wire version (long headers only; `None` for the short form)
    pub version: Option<Version>,
    /// Destination connection ID
    pub dcid: ConnectionId,
    /// Source connection ID (long headers only)
    pub scid: ConnectionId,
    /// Address-validation token (Initial and Retry)
    pub token: Bytes,
    /// Packet number (absent on Retry/VN/StatelessReset)
    pub packet_number: PacketNumber,
    /// Key phase the payload is protected under
    pub key_phase: Option<KeyPhase>,
}

impl PacketHeader {
    /// Serialize, appending the declared payload length for long headers.
    /// Returns the serialized header and the offset of the packet-number
    /// field (for header protection), if the type carries one.
    #[must_use]
    pub fn serialize(&self, payload_len: usize) -> (Vec<u8>, Option<usize>) {
        let mut out = Vec::with_capacity(64);
        match self.packet_type {
            PacketType::OneRtt => {
                let mut first = FIXED_BIT;
                if self.key_phase == Some(KeyPhase::Phase1) {
                    first |= 0x04;
                }
                out.push(first);
                out.extend_from_slice(self.dcid.as_slice());
                let pn_offset = out.len();
                out.extend_from_slice(&(self.packet_number as u32).to_be_bytes());
                (out, Some(pn_offset))
            }
            PacketType::VersionNegotiation => {
                out.push(FORM_LONG);
                out.extend_from_slice(&VERSION_NEGOTIATION.to_be_bytes());
                push_cid(&mut out, &self.dcid);
                push_cid(&mut out, &self.scid);
                (out, None)
            }
            PacketType::StatelessReset => {
                out.push(FIXED_BIT);
                (out, None)
            }
            long => {
                let bits = long.long_type_bits().unwrap_or(0);
                out.push(FORM_LONG | FIXED_BIT | (bits << 4));
                out.extend_from_slice(&self.version.unwrap_or(crate::types::SUPPORTED_VERSIONS[0]).to_be_bytes());
                push_cid(&mut out, &self.dcid);
                push_cid(&mut out, &self.scid);
                if long == PacketType::Initial {
                    push_varint(&mut out, self.token.len() as u64);
                    out.extend_from_slice(&self.token);
                }
                if long == PacketType::Retry {
                    // No length or packet number; the factory appends the
                    // original DCID and retry token as the payload
                    return (out, None);
                }
                push_varint(&mut out, (payload_len + PN_LEN) as u64);
                let pn_offset = out.len();
                out.extend_from_slice(&(self.packet_number as u32).to_be_bytes());
                (out, Some(pn_offset))
            }
        }
    }

    /// Parse a header from the front of a datagram. `short_dcid_len` tells
    /// the parser how many destination-CID bytes a short header carries on
    /// this connection. Returns the header and the payload offset.
    #[must_use]
    pub fn parse(buf: &Bytes, short_dcid_len: usize) -> Option<(Self, usize)> {
        let first = *buf.first()?;
        if first & FORM_LONG == 0 {
            // Short header
            let dcid = ConnectionId::new(buf.get(1..1 + short_dcid_len)?);
            let pn_start = 1 + short_dcid_len;
            let pn_bytes = buf.get(pn_start..pn_start + PN_LEN)?;
            let mut pn = [0u8; 4];
            pn.copy_from_slice(pn_bytes);
            let key_phase =
                if first & 0x04 != 0 { KeyPhase::Phase1 } else { KeyPhase::Phase0 };
            return Some((
                Self {
                    packet_type: PacketType::OneRtt,
                    version: None,
                    dcid,
                    scid: ConnectionId::ZERO,
                    token: Bytes::new(),
                    packet_number: u64::from(u32::from_be_bytes(pn)),
                    key_phase: Some(key_phase),
                },
                pn_start + PN_LEN,
            ));
        }

        let version_bytes = buf.get(1..5)?;
        let mut v = [0u8; 4];
        v.copy_from_slice(version_bytes);
        let version = u32::from_be_bytes(v);

        let mut at = 5;
        let dcid = read_cid(buf, &mut at)?;
        let scid = read_cid(buf, &mut at)?;

        if version == VERSION_NEGOTIATION {
            return Some((
                Self {
                    packet_type: PacketType::VersionNegotiation,
                    version: Some(version),
                    dcid,
                    scid,
                    token: Bytes::new(),
                    packet_number: 0,
                    key_phase: None,
                },
                at,
            ));
        }

        let packet_type = match (first >> 4) & 0x03 {
            0 => PacketType::Initial,
            1 => PacketType::ZeroRtt,
            2 => PacketType::Handshake,
            _ => PacketType::Retry,
        };

        let mut token = Bytes::new();
        if packet_type == PacketType::Initial {
            let (token_len, n) = varint::decode(buf.get(at..)?)?;
            at += n;
            token = buf.slice(at..at.checked_add(token_len as usize)?.min(buf.len()));
            if token.len() != token_len as usize {
                return None;
            }
            at += token_len as usize;
        }

        if packet_type == PacketType::Retry {
            // Everything after the CIDs (original DCID + token) is carried
            // verbatim; the caller copies it unmodified
            return Some((
                Self {
                    packet_type,
                    version: Some(version),
                    dcid,
                    scid,
                    token: buf.slice(at..),
                    packet_number: 0,
                    key_phase: None,
                },
                at,
            ));
        }

        let (length, n) = varint::decode(buf.get(at..)?)?;
        at += n;
        if length < PN_LEN as u64 || buf.len() < at + length as usize {
            return None;
        }
        let pn_bytes = buf.get(at..at + PN_LEN)?;
        let mut pn = [0u8; 4];
        pn.copy_from_slice(pn_bytes);
        at += PN_LEN;

        Some((
            Self {
                packet_type,
                version: Some(version),
                dcid,
                scid,
                token,
                packet_number: u64::from(u32::from_be_bytes(pn)),
                key_phase: packet_type.key_phase(),
            },
            at,
        ))
    }
}

/// A packet: header plus an ordered frame payload (cleartext side).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet header
    pub header: PacketHeader,
    /// Payload bytes (decrypted on receive, cleartext before protect)
    pub payload: Bytes,
}

impl Packet {
    /// A packet is ack-eliciting iff any carried frame is.
    #[must_use]
    pub fn is_ack_eliciting(&self) -> bool {
        let mut at = 0usize;
        while at < self.payload.len() {
            let rest = self.payload.slice(at..);
            let Some((frame, consumed)) = Frame::parse(&rest) else {
                break;
            };
            if frame.is_ack_eliciting() {
                return true;
            }
            at += consumed;
        }
        false
    }
}

/// Outcome of presenting an incoming datagram to the factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketReceiveResult {
    /// Packet decrypted (or was unprotected) and parsed
    Success(Packet),
    /// Protection failed: bad tag or malformed crypto
    Failed,
    /// Keys for the phase will plausibly arrive later; buffer and retry
    NotReady,
    /// Keys were never established for this phase and never will be; drop
    Ignored,
    /// Version is unknown and the packet is not a Version Negotiation
    Unsupported,
}

/// Serialize a stateless reset: unpredictable filler followed by the token.
#[must_use]
pub fn serialize_stateless_reset(token: StatelessResetToken, filler: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(1 + filler.len() + 16);
    out.put_u8(FIXED_BIT);
    out.put_slice(filler);
    out.put_slice(&token.0);
    out.freeze()
}

fn push_cid(out: &mut Vec<u8>, cid: &ConnectionId) {
    out.push(cid.len() as u8);
    out.extend_from_slice(cid.as_slice());
}

fn read_cid(buf: &Bytes, at: &mut usize) -> Option<ConnectionId> {
    let len = usize::from(*buf.get(*at)?);
    if len > ConnectionId::MAX_LEN {
        return None;
    }
    *at += 1;
    let bytes = buf.get(*at..*at + len)?;
    let cid = ConnectionId::new(bytes);
    *at += len;
    Some(cid)
}

fn push_varint(out: &mut Vec<u8>, value: u64) {
    let mut buf = [0u8; 8];
    if let Ok(n) = varint::encode(value, &mut buf) {
        out.extend_from_slice(&buf[..n]);
    }
}
