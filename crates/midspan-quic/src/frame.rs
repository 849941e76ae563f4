//! Wire-format frame codec.
//!
//! Every frame is a tagged variant of [`Frame`]. Parsing borrows from the
//! packet payload via [`bytes::Bytes`] (slices share the backing buffer, so
//! a parsed frame is as cheap as the old buffer-backed mode); constructed
//! frames own their bytes the same way. `store` is a total function: it
//! writes exactly [`Frame::size`] bytes or, when the buffer is too short,
//! writes nothing and returns 0 so the caller can retry with a smaller
//! frame.
//!
//! Type-byte layout: `0x00..=0x0f` are point types, `0x10..=0x17` is STREAM
//! with the O/L/F flags in the low three bits, `0x18` CRYPTO, `0x19`
//! NEW_TOKEN, and anything at `0x1a` or above is unknown.

use std::fmt;

use bytes::Bytes;
use tracing::debug;

use crate::{
    error::FrameError,
    types::{ConnectionId, FrameId, Offset, StreamId},
    varint,
};

/// First type byte of the STREAM range.
const STREAM_TYPE_BASE: u8 = 0x10;
/// First type byte that is not a known frame.
const UNKNOWN_TYPE_THRESHOLD: u8 = 0x1a;

const STREAM_FLAG_OFFSET: u8 = 0x04;
const STREAM_FLAG_LENGTH: u8 = 0x02;
const STREAM_FLAG_FIN: u8 = 0x01;

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// 0x00
    Padding,
    /// 0x01
    RstStream,
    /// 0x02
    ConnectionClose,
    /// 0x03
    ApplicationClose,
    /// 0x04
    MaxData,
    /// 0x05
    MaxStreamData,
    /// 0x06
    MaxStreamId,
    /// 0x07
    Ping,
    /// 0x08
    Blocked,
    /// 0x09
    StreamBlocked,
    /// 0x0a
    StreamIdBlocked,
    /// 0x0b
    NewConnectionId,
    /// 0x0c
    StopSending,
    /// 0x0d
    Ack,
    /// 0x0e
    PathChallenge,
    /// 0x0f
    PathResponse,
    /// 0x10..=0x17, low bits carry O/L/F
    Stream,
    /// 0x18
    Crypto,
    /// 0x19
    NewToken,
    /// 0x1a and above
    Unknown,
}

impl FrameType {
    /// Classify a frame from its first byte.
    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        if byte >= UNKNOWN_TYPE_THRESHOLD {
            Self::Unknown
        } else if byte >= STREAM_TYPE_BASE {
            match byte {
                0x18 => Self::Crypto,
                0x19 => Self::NewToken,
                _ => Self::Stream,
            }
        } else {
            match byte {
                0x00 => Self::Padding,
                0x01 => Self::RstStream,
                0x02 => Self::ConnectionClose,
                0x03 => Self::ApplicationClose,
                0x04 => Self::MaxData,
                0x05 => Self::MaxStreamData,
                0x06 => Self::MaxStreamId,
                0x07 => Self::Ping,
                0x08 => Self::Blocked,
                0x09 => Self::StreamBlocked,
                0x0a => Self::StreamIdBlocked,
                0x0b => Self::NewConnectionId,
                0x0c => Self::StopSending,
                0x0d => Self::Ack,
                0x0e => Self::PathChallenge,
                _ => Self::PathResponse,
            }
        }
    }
}

/// One `(gap, length)` pair in an ACK frame's block section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckBlock {
    /// Unacknowledged packets before this block
    pub gap: u64,
    /// Acknowledged packets in this block
    pub length: u64,
}

/// A STREAM frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    /// Stream the data belongs to
    pub stream_id: StreamId,
    /// Byte offset of `data` within the stream
    pub offset: Offset,
    /// Stream payload
    pub data: Bytes,
    /// Final frame of the stream
    pub fin: bool,
    /// Emit an explicit Length field (the L bit). Authoritative for
    /// serialization; without it the data runs to the end of the packet.
    pub has_length_field: bool,
}

impl StreamFrame {
    /// Serialized length of everything before the stream data.
    #[must_use]
    pub fn header_len(&self) -> usize {
        1 + varint::size_of(self.stream_id)
            + if self.offset != 0 { varint::size_of(self.offset) } else { 0 }
            + if self.has_length_field { varint::size_of(self.data.len() as u64) } else { 0 }
    }

    /// Split at serialized position `at`.
    ///
    /// The left half keeps the original offset and loses FIN; the right
    /// half starts where the left's data ends and inherits FIN and the
    /// length-field presence.
    ///
    /// # Errors
    ///
    /// - `FrameError::BadSplitPoint` unless `header_len() < at < size`
    pub fn split(self, at: usize) -> Result<(Self, Self), FrameError> {
        let header_len = self.header_len();
        let total = header_len + self.data.len();
        if at <= header_len || at >= total {
            return Err(FrameError::BadSplitPoint { at, size: total });
        }

        let left_data_len = at - header_len;
        let mut data = self.data;
        let right_data = data.split_off(left_data_len);

        let left = Self {
            stream_id: self.stream_id,
            offset: self.offset,
            data,
            fin: false,
            has_length_field: self.has_length_field,
        };
        let right = Self {
            stream_id: self.stream_id,
            offset: self.offset + left_data_len as u64,
            data: right_data,
            fin: self.fin,
            has_length_field: self.has_length_field,
        };
        Ok((left, right))
    }
}

/// An ACK frame. Block iteration is stable and in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    /// Largest packet number being acknowledged
    pub largest_ack: u64,
    /// Ack delay, in the transport's delay units
    pub delay: u64,
    /// Packets acknowledged contiguously below `largest_ack`
    pub first_block: u64,
    /// Additional `(gap, length)` blocks
    pub blocks: Vec<AckBlock>,
}

/// A CRYPTO frame: offset-addressed handshake bytes without a stream id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoFrame {
    /// Byte offset within the crypto stream
    pub offset: Offset,
    /// Handshake payload
    pub data: Bytes,
}

/// A NEW_CONNECTION_ID frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConnectionIdFrame {
    /// Sequence number of this connection ID
    pub sequence: u64,
    /// Connection IDs below this sequence should be retired
    pub retire_prior_to: u64,
    /// The advertised connection ID
    pub connection_id: ConnectionId,
    /// Token enabling stateless reset with this ID
    pub reset_token: [u8; 16],
}

/// Smallest meaningful payload unit inside a protected packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A run of padding bytes. One wire byte each; the parser coalesces
    /// consecutive padding bytes into a single frame.
    Padding {
        /// Number of padding bytes (at least 1)
        len: usize,
    },
    /// Ack elicitation
    Ping,
    /// Stream data
    Stream(StreamFrame),
    /// Acknowledgment with block section
    Ack(AckFrame),
    /// Abrupt stream termination
    RstStream {
        /// Stream being terminated
        stream_id: StreamId,
        /// Application error code
        error_code: u64,
        /// Final size of the stream in bytes
        final_offset: Offset,
    },
    /// Transport-level connection close
    ConnectionClose {
        /// Transport error code
        error_code: u64,
        /// Type of the frame that caused the close
        frame_type: u64,
        /// Human-readable reason
        reason: Bytes,
    },
    /// Application-level connection close
    ApplicationClose {
        /// Application error code
        error_code: u64,
        /// Human-readable reason
        reason: Bytes,
    },
    /// Connection-level flow control limit
    MaxData {
        /// New connection data limit
        maximum: u64,
    },
    /// Stream-level flow control limit
    MaxStreamData {
        /// Stream the limit applies to
        stream_id: StreamId,
        /// New stream data limit
        maximum: u64,
    },
    /// Stream-count limit
    MaxStreamId {
        /// Highest stream id the peer may open
        stream_id: StreamId,
    },
    /// Sender blocked on connection flow control
    Blocked {
        /// Connection limit at which blocking occurred
        offset: Offset,
    },
    /// Sender blocked on stream flow control
    StreamBlocked {
        /// Blocked stream
        stream_id: StreamId,
        /// Stream offset at which blocking occurred
        offset: Offset,
    },
    /// Sender blocked on the stream-count limit
    StreamIdBlocked {
        /// Limit at which blocking occurred
        stream_id: StreamId,
    },
    /// Alternative connection ID advertisement
    NewConnectionId(NewConnectionIdFrame),
    /// Request that the peer stop sending on a stream
    StopSending {
        /// Stream to silence
        stream_id: StreamId,
        /// Application error code
        error_code: u64,
    },
    /// Path validation probe
    PathChallenge {
        /// Probe payload, echoed by the peer
        data: [u8; 8],
    },
    /// Path validation answer
    PathResponse {
        /// Echoed probe payload
        data: [u8; 8],
    },
    /// Handshake data
    Crypto(CryptoFrame),
    /// Address validation token for a future connection
    NewToken {
        /// Opaque token bytes (non-empty)
        token: Bytes,
    },
    /// A frame re-emitted after loss, tagged with its original record id.
    /// Serializes exactly as the wrapped frame; only STREAM is wrapped
    /// today.
    Retransmission {
        /// Record id the retransmitter consumed
        frame_id: FrameId,
        /// The frame being re-sent
        inner: Box<Frame>,
    },
}

impl Frame {
    /// This frame's type tag.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Padding { .. } => FrameType::Padding,
            Self::Ping => FrameType::Ping,
            Self::Stream(_) => FrameType::Stream,
            Self::Ack(_) => FrameType::Ack,
            Self::RstStream { .. } => FrameType::RstStream,
            Self::ConnectionClose { .. } => FrameType::ConnectionClose,
            Self::ApplicationClose { .. } => FrameType::ApplicationClose,
            Self::MaxData { .. } => FrameType::MaxData,
            Self::MaxStreamData { .. } => FrameType::MaxStreamData,
            Self::MaxStreamId { .. } => FrameType::MaxStreamId,
            Self::Blocked { .. } => FrameType::Blocked,
            Self::StreamBlocked { .. } => FrameType::StreamBlocked,
            Self::StreamIdBlocked { .. } => FrameType::StreamIdBlocked,
            Self::NewConnectionId(_) => FrameType::NewConnectionId,
            Self::StopSending { .. } => FrameType::StopSending,
            Self::PathChallenge { .. } => FrameType::PathChallenge,
            Self::PathResponse { .. } => FrameType::PathResponse,
            Self::Crypto(_) => FrameType::Crypto,
            Self::NewToken { .. } => FrameType::NewToken,
            Self::Retransmission { inner, .. } => inner.frame_type(),
        }
    }

    /// Serialized size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::Padding { len } => (*len).max(1),
            Self::Ping => 1,
            Self::Stream(f) => f.header_len() + f.data.len(),
            Self::Ack(f) => {
                1 + varint::size_of(f.largest_ack)
                    + varint::size_of(f.delay)
                    + varint::size_of(f.blocks.len() as u64)
                    + varint::size_of(f.first_block)
                    + f.blocks
                        .iter()
                        .map(|b| varint::size_of(b.gap) + varint::size_of(b.length))
                        .sum::<usize>()
            }
            Self::RstStream { stream_id, error_code, final_offset } => {
                1 + varint::size_of(*stream_id)
                    + varint::size_of(*error_code)
                    + varint::size_of(*final_offset)
            }
            Self::ConnectionClose { error_code, frame_type, reason } => {
                1 + varint::size_of(*error_code)
                    + varint::size_of(*frame_type)
                    + varint::size_of(reason.len() as u64)
                    + reason.len()
            }
            Self::ApplicationClose { error_code, reason } => {
                1 + varint::size_of(*error_code)
                    + varint::size_of(reason.len() as u64)
                    + reason.len()
            }
            Self::MaxData { maximum } => 1 + varint::size_of(*maximum),
            Self::MaxStreamData { stream_id, maximum } => {
                1 + varint::size_of(*stream_id) + varint::size_of(*maximum)
            }
            Self::MaxStreamId { stream_id } | Self::StreamIdBlocked { stream_id } => {
                1 + varint::size_of(*stream_id)
            }
            Self::Blocked { offset } => 1 + varint::size_of(*offset),
            Self::StreamBlocked { stream_id, offset } => {
                1 + varint::size_of(*stream_id) + varint::size_of(*offset)
            }
            Self::NewConnectionId(f) => {
                1 + varint::size_of(f.sequence)
                    + varint::size_of(f.retire_prior_to)
                    + 1
                    + f.connection_id.len()
                    + 16
            }
            Self::StopSending { stream_id, error_code } => {
                1 + varint::size_of(*stream_id) + varint::size_of(*error_code)
            }
            Self::PathChallenge { .. } | Self::PathResponse { .. } => 1 + 8,
            Self::Crypto(f) => {
                1 + varint::size_of(f.offset)
                    + varint::size_of(f.data.len() as u64)
                    + f.data.len()
            }
            Self::NewToken { token } => 1 + varint::size_of(token.len() as u64) + token.len(),
            Self::Retransmission { inner, .. } => inner.size(),
        }
    }

    /// True if carrying this frame makes a packet ack-eliciting.
    ///
    /// PADDING, ACK and CONNECTION_CLOSE are not; everything else is.
    #[must_use]
    pub fn is_ack_eliciting(&self) -> bool {
        match self {
            Self::Padding { .. } | Self::Ack(_) | Self::ConnectionClose { .. } => false,
            Self::Retransmission { inner, .. } => inner.is_ack_eliciting(),
            _ => true,
        }
    }

    /// Serialize into `buf`.
    ///
    /// Returns 0 iff `buf.len() < self.size()` (nothing written); otherwise
    /// exactly `size()` bytes are written and that count returned.
    #[must_use]
    pub fn store(&self, buf: &mut [u8]) -> usize {
        let size = self.size();
        if buf.len() < size {
            return 0;
        }

        let mut w = Writer { buf, at: 0, ok: true };
        self.store_fields(&mut w);
        if !w.ok {
            return 0;
        }
        debug_assert_eq!(w.at, size);
        w.at
    }

    fn store_fields(&self, w: &mut Writer<'_>) {
        match self {
            Self::Padding { len } => {
                for _ in 0..(*len).max(1) {
                    w.u8(0x00);
                }
            }
            Self::Ping => w.u8(0x07),
            Self::Stream(f) => {
                let mut type_byte = STREAM_TYPE_BASE;
                if f.offset != 0 {
                    type_byte |= STREAM_FLAG_OFFSET;
                }
                if f.has_length_field {
                    type_byte |= STREAM_FLAG_LENGTH;
                }
                if f.fin {
                    type_byte |= STREAM_FLAG_FIN;
                }
                w.u8(type_byte);
                w.varint(f.stream_id);
                if f.offset != 0 {
                    w.varint(f.offset);
                }
                if f.has_length_field {
                    w.varint(f.data.len() as u64);
                }
                w.bytes(&f.data);
            }
            Self::Ack(f) => {
                w.u8(0x0d);
                w.varint(f.largest_ack);
                w.varint(f.delay);
                w.varint(f.blocks.len() as u64);
                w.varint(f.first_block);
                for block in &f.blocks {
                    w.varint(block.gap);
                    w.varint(block.length);
                }
            }
            Self::RstStream { stream_id, error_code, final_offset } => {
                w.u8(0x01);
                w.varint(*stream_id);
                w.varint(*error_code);
                w.varint(*final_offset);
            }
            Self::ConnectionClose { error_code, frame_type, reason } => {
                w.u8(0x02);
                w.varint(*error_code);
                w.varint(*frame_type);
                w.varint(reason.len() as u64);
                w.bytes(reason);
            }
            Self::ApplicationClose { error_code, reason } => {
                w.u8(0x03);
                w.varint(*error_code);
                w.varint(reason.len() as u64);
                w.bytes(reason);
            }
            Self::MaxData { maximum } => {
                w.u8(0x04);
                w.varint(*maximum);
            }
            Self::MaxStreamData { stream_id, maximum } => {
                w.u8(0x05);
                w.varint(*stream_id);
                w.varint(*maximum);
            }
            Self::MaxStreamId { stream_id } => {
                w.u8(0x06);
                w.varint(*stream_id);
            }
            Self::Blocked { offset } => {
                w.u8(0x08);
                w.varint(*offset);
            }
            Self::StreamBlocked { stream_id, offset } => {
                w.u8(0x09);
                w.varint(*stream_id);
                w.varint(*offset);
            }
            Self::StreamIdBlocked { stream_id } => {
                w.u8(0x0a);
                w.varint(*stream_id);
            }
            Self::NewConnectionId(f) => {
                w.u8(0x0b);
                w.varint(f.sequence);
                w.varint(f.retire_prior_to);
                w.u8(f.connection_id.len() as u8);
                w.bytes(f.connection_id.as_slice());
                w.bytes(&f.reset_token);
            }
            Self::StopSending { stream_id, error_code } => {
                w.u8(0x0c);
                w.varint(*stream_id);
                w.varint(*error_code);
            }
            Self::PathChallenge { data } => {
                w.u8(0x0e);
                w.bytes(data);
            }
            Self::PathResponse { data } => {
                w.u8(0x0f);
                w.bytes(data);
            }
            Self::Crypto(f) => {
                w.u8(0x18);
                w.varint(f.offset);
                w.varint(f.data.len() as u64);
                w.bytes(&f.data);
            }
            Self::NewToken { token } => {
                w.u8(0x19);
                w.varint(token.len() as u64);
                w.bytes(token);
            }
            Self::Retransmission { inner, .. } => inner.store_fields(w),
        }
    }

    /// Parse one frame from the front of `buf`.
    ///
    /// Returns the frame and the bytes consumed. An unknown type byte or a
    /// truncated frame yields `None` with a debug log; the caller decides
    /// whether that is fatal for the packet.
    ///
    /// `buf` should be a [`Bytes`] over the packet payload so stream and
    /// crypto data slices share its allocation.
    #[must_use]
    pub fn parse(buf: &Bytes) -> Option<(Self, usize)> {
        let type_byte = *buf.first()?;
        let mut r = Reader { buf, at: 1 };

        let frame = match FrameType::from_byte(type_byte) {
            FrameType::Unknown => {
                debug!(type_byte, "unknown frame type");
                return None;
            }
            FrameType::Padding => {
                let mut len = 1;
                while r.at < buf.len() && buf[r.at] == 0x00 {
                    r.at += 1;
                    len += 1;
                }
                Self::Padding { len }
            }
            FrameType::Ping => Self::Ping,
            FrameType::Stream => {
                let stream_id = r.varint()?;
                let offset =
                    if type_byte & STREAM_FLAG_OFFSET != 0 { r.varint()? } else { 0 };
                let has_length_field = type_byte & STREAM_FLAG_LENGTH != 0;
                let data = if has_length_field {
                    let len = r.varint()?;
                    r.take(len as usize)?
                } else {
                    r.rest()
                };
                Self::Stream(StreamFrame {
                    stream_id,
                    offset,
                    data,
                    fin: type_byte & STREAM_FLAG_FIN != 0,
                    has_length_field,
                })
            }
            FrameType::Ack => {
                let largest_ack = r.varint()?;
                let delay = r.varint()?;
                let block_count = r.varint()?;
                let first_block = r.varint()?;
                let mut blocks = Vec::with_capacity(block_count.min(64) as usize);
                for _ in 0..block_count {
                    let gap = r.varint()?;
                    let length = r.varint()?;
                    blocks.push(AckBlock { gap, length });
                }
                Self::Ack(AckFrame { largest_ack, delay, first_block, blocks })
            }
            FrameType::RstStream => Self::RstStream {
                stream_id: r.varint()?,
                error_code: r.varint()?,
                final_offset: r.varint()?,
            },
            FrameType::ConnectionClose => {
                let error_code = r.varint()?;
                let frame_type = r.varint()?;
                let len = r.varint()?;
                Self::ConnectionClose { error_code, frame_type, reason: r.take(len as usize)? }
            }
            FrameType::ApplicationClose => {
                let error_code = r.varint()?;
                let len = r.varint()?;
                Self::ApplicationClose { error_code, reason: r.take(len as usize)? }
            }
            FrameType::MaxData => Self::MaxData { maximum: r.varint()? },
            FrameType::MaxStreamData => {
                Self::MaxStreamData { stream_id: r.varint()?, maximum: r.varint()? }
            }
            FrameType::MaxStreamId => Self::MaxStreamId { stream_id: r.varint()? },
            FrameType::Blocked => Self::Blocked { offset: r.varint()? },
            FrameType::StreamBlocked => {
                Self::StreamBlocked { stream_id: r.varint()?, offset: r.varint()? }
            }
            FrameType::StreamIdBlocked => Self::StreamIdBlocked { stream_id: r.varint()? },
            FrameType::NewConnectionId => {
                let sequence = r.varint()?;
                let retire_prior_to = r.varint()?;
                let cid_len = r.u8()?;
                if usize::from(cid_len) > ConnectionId::MAX_LEN {
                    debug!(cid_len, "connection id length out of range");
                    return None;
                }
                let cid = r.take(usize::from(cid_len))?;
                let token_bytes = r.take(16)?;
                let mut reset_token = [0u8; 16];
                reset_token.copy_from_slice(&token_bytes);
                Self::NewConnectionId(NewConnectionIdFrame {
                    sequence,
                    retire_prior_to,
                    connection_id: ConnectionId::new(&cid),
                    reset_token,
                })
            }
            FrameType::StopSending => {
                Self::StopSending { stream_id: r.varint()?, error_code: r.varint()? }
            }
            FrameType::PathChallenge => {
                let mut data = [0u8; 8];
                data.copy_from_slice(&r.take(8)?);
                Self::PathChallenge { data }
            }
            FrameType::PathResponse => {
                let mut data = [0u8; 8];
                data.copy_from_slice(&r.take(8)?);
                Self::PathResponse { data }
            }
            FrameType::Crypto => {
                let offset = r.varint()?;
                let len = r.varint()?;
                Self::Crypto(CryptoFrame { offset, data: r.take(len as usize)? })
            }
            FrameType::NewToken => {
                let len = r.varint()?;
                if len == 0 {
                    debug!("NEW_TOKEN with empty token");
                    return None;
                }
                Self::NewToken { token: r.take(len as usize)? }
            }
        };

        Some((frame, r.at))
    }

    /// Split at serialized position `at`. Only STREAM frames (and their
    /// retransmission wrappers) split; both halves of a wrapper keep the
    /// record id.
    ///
    /// # Errors
    ///
    /// - `FrameError::NotSplittable` for any other frame type
    /// - `FrameError::BadSplitPoint` when `at` is outside the data range
    pub fn split(self, at: usize) -> Result<(Self, Self), FrameError> {
        match self {
            Self::Stream(f) => {
                let (left, right) = f.split(at)?;
                Ok((Self::Stream(left), Self::Stream(right)))
            }
            Self::Retransmission { frame_id, inner } => {
                let (left, right) = inner.split(at)?;
                Ok((
                    Self::Retransmission { frame_id, inner: Box::new(left) },
                    Self::Retransmission { frame_id, inner: Box::new(right) },
                ))
            }
            _ => Err(FrameError::NotSplittable),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream(s) => write!(
                f,
                "type=STREAM size={} id={} offset={} data_len={} fin={}",
                self.size(),
                s.stream_id,
                s.offset,
                s.data.len(),
                s.fin
            ),
            Self::Ack(a) => write!(
                f,
                "type=ACK size={} largest_ack={} blocks={}",
                self.size(),
                a.largest_ack,
                a.blocks.len() + 1
            ),
            Self::Retransmission { frame_id, inner } => {
                write!(f, "type=RETRANSMISSION id={frame_id} inner=[{inner}]")
            }
            _ => write!(f, "type={:?} size={}", self.frame_type(), self.size()),
        }
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    at: usize,
    ok: bool,
}

impl Writer<'_> {
    fn u8(&mut self, byte: u8) {
        if self.at < self.buf.len() {
            self.buf[self.at] = byte;
            self.at += 1;
        } else {
            self.ok = false;
        }
    }

    fn varint(&mut self, value: u64) {
        match varint::encode(value, &mut self.buf[self.at..]) {
            Ok(n) if n > 0 => self.at += n,
            _ => self.ok = false,
        }
    }

    fn bytes(&mut self, src: &[u8]) {
        if self.at + src.len() <= self.buf.len() {
            self.buf[self.at..self.at + src.len()].copy_from_slice(src);
            self.at += src.len();
        } else {
            self.ok = false;
        }
    }
}

struct Reader<'a> {
    buf: &'a Bytes,
    at: usize,
}

impl Reader<'_> {
    fn varint(&mut self) -> Option<u64> {
        let (value, n) = varint::decode(self.buf.get(self.at..)?)?;
        self.at += n;
        Some(value)
    }

    fn u8(&mut self) -> Option<u8> {
        let byte = *self.buf.get(self.at)?;
        self.at += 1;
        Some(byte)
    }

    fn take(&mut self, n: usize) -> Option<Bytes> {
        if self.at + n > self.buf.len() {
            debug!(
                needed = self.at + n,
                have = self.buf.len(),
                "frame truncated"
            );
            return None;
        }
        let out = self.buf.slice(self.at..self.at + n);
        self.at += n;
        Some(out)
    }

    fn rest(&mut self) -> Bytes {
        let out = self.buf.slice(self.at..);
        self.at = self.buf.len();
        out
    }
}
