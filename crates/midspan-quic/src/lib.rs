//! QUIC packet and frame layer for the midspan proxy.
//!
//! This crate is the lower half of the proxy's protocol core: the wire-format
//! frame codec, packet payload/header protection, per-phase key material,
//! the packet factory, the frame-generator scheduling framework, and the
//! retransmission buffer. Everything here is sans-IO: bytes in, bytes and
//! typed results out. Socket plumbing lives in `midspan-server`.

pub mod error;
pub mod factory;
pub mod frame;
pub mod generator;
pub mod keys;
pub mod packet;
pub mod padder;
pub mod pinger;
pub mod protection;
pub mod retransmitter;
pub mod token_creator;
pub mod types;
pub mod varint;

pub use error::{FrameError, PacketError, ProtectionError};
pub use frame::{AckBlock, AckFrame, Frame, FrameType, StreamFrame};
pub use generator::{FrameGenerator, FrameGeneratorManager, GeneratorWeight};
pub use keys::{Context, KeyPhase, KeyRegistry};
pub use packet::{Packet, PacketHeader, PacketReceiveResult, PacketType};
pub use types::{ConnectionId, EncryptionLevel, FrameId, PacketNumber, PacketNumberSpace};
