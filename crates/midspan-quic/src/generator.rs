//! Frame generator framework.
//!
//! A generator is a pluggable producer of frames consulted at
//! packet-assembly time. The manager keeps generators ordered by a static
//! weight (ties resolved by insertion order) and walks them for every
//! packet: `will_generate_frame` then, on true, `generate_frame`, with the
//! remaining packet space shrinking as frames are emitted.
//!
//! Generators that emit retransmittable frames record a [`FrameInfo`] per
//! frame; exactly one of `on_frame_acked` / `on_frame_lost` fires per
//! record, and the record keeper enforces that by removing the record on
//! first delivery.

use std::collections::HashMap;

use bytes::Bytes;

use crate::{
    frame::{Frame, FrameType},
    types::{EncryptionLevel, FrameId, Offset, StreamId},
};

/// Static scheduling weight. Lower runs earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GeneratorWeight {
    /// Handshake-critical frames
    Early = 100,
    /// Control frames that should precede stream data
    BeforeData = 200,
    /// Stream data
    AfterData = 300,
    /// Fillers
    Late = 400,
}

/// Opaque payload a generator attaches to a frame record so it can rebuild
/// the frame on loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameInfoPayload {
    /// Stream data that can be re-sent
    Stream {
        /// Stream id
        stream_id: StreamId,
        /// Offset of the unsent remainder
        offset: Offset,
        /// The data bytes
        data: Bytes,
        /// FIN carried by the lost frame
        fin: bool,
    },
    /// An address-validation token
    Token {
        /// Token bytes
        token: Bytes,
    },
    /// Nothing to rebuild
    None,
}

/// Record of one retransmittable frame a generator emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    /// Id issued by the generator
    pub id: FrameId,
    /// Level the frame was sent at
    pub level: EncryptionLevel,
    /// Type of the recorded frame
    pub frame_type: FrameType,
    /// Rebuild payload
    pub payload: FrameInfoPayload,
}

/// Issues frame ids and owns records until ack or loss consumes them.
#[derive(Debug, Default)]
pub struct FrameRecordKeeper {
    latest_id: FrameId,
    records: HashMap<FrameId, FrameInfo>,
}

impl FrameRecordKeeper {
    /// Issue the next frame id.
    pub fn issue_id(&mut self) -> FrameId {
        let id = self.latest_id;
        self.latest_id += 1;
        id
    }

    /// Store a record under its id.
    pub fn record(&mut self, info: FrameInfo) {
        self.records.insert(info.id, info);
    }

    /// Remove and return the record for `id`. The second delivery for the
    /// same id returns `None`, which is how exactly-one-callback holds.
    pub fn take(&mut self, id: FrameId) -> Option<FrameInfo> {
        self.records.remove(&id)
    }

    /// Records still awaiting an ack/loss verdict.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.records.len()
    }
}

/// A pluggable producer of frames.
pub trait FrameGenerator {
    /// Encryption levels this generator participates in.
    fn level_filter(&self) -> &[EncryptionLevel] {
        const DEFAULT: [EncryptionLevel; 1] = [EncryptionLevel::OneRtt];
        &DEFAULT
    }

    /// True if [`Self::level_filter`] contains `level`.
    fn is_level_matched(&self, level: EncryptionLevel) -> bool {
        self.level_filter().contains(&level)
    }

    /// Would this generator emit a frame into the packet being assembled?
    /// May carry side effects (the pinger's credit accounting does).
    fn will_generate_frame(
        &mut self,
        level: EncryptionLevel,
        current_packet_size: usize,
        ack_eliciting: bool,
        seq_num: u32,
    ) -> bool;

    /// Produce a frame, or `None` when nothing fits.
    fn generate_frame(
        &mut self,
        level: EncryptionLevel,
        connection_credit: u64,
        max_frame_size: u16,
        current_packet_size: usize,
        seq_num: u32,
    ) -> Option<Frame>;

    /// The frame recorded under `id` was acknowledged.
    fn on_frame_acked(&mut self, id: FrameId) {
        let _ = id;
    }

    /// The frame recorded under `id` was declared lost.
    fn on_frame_lost(&mut self, id: FrameId) {
        let _ = id;
    }
}

/// Wrapper for generators that must emit at most one frame per packet.
///
/// Remembers the last sequence number seen; a duplicate within the same
/// packet short-circuits to false without consulting the inner generator.
pub struct OncePerSequence<G> {
    inner: G,
    last_seq: Option<u32>,
}

impl<G: FrameGenerator> OncePerSequence<G> {
    /// Wrap `inner`.
    pub fn new(inner: G) -> Self {
        Self { inner, last_seq: None }
    }

    /// The wrapped generator.
    pub fn inner_mut(&mut self) -> &mut G {
        &mut self.inner
    }
}

impl<G: FrameGenerator> FrameGenerator for OncePerSequence<G> {
    fn level_filter(&self) -> &[EncryptionLevel] {
        self.inner.level_filter()
    }

    fn will_generate_frame(
        &mut self,
        level: EncryptionLevel,
        current_packet_size: usize,
        ack_eliciting: bool,
        seq_num: u32,
    ) -> bool {
        if self.last_seq == Some(seq_num) {
            return false;
        }
        self.last_seq = Some(seq_num);
        self.inner.will_generate_frame(level, current_packet_size, ack_eliciting, seq_num)
    }

    fn generate_frame(
        &mut self,
        level: EncryptionLevel,
        connection_credit: u64,
        max_frame_size: u16,
        current_packet_size: usize,
        seq_num: u32,
    ) -> Option<Frame> {
        self.last_seq = Some(seq_num);
        self.inner.generate_frame(level, connection_credit, max_frame_size, current_packet_size, seq_num)
    }

    fn on_frame_acked(&mut self, id: FrameId) {
        self.inner.on_frame_acked(id);
    }

    fn on_frame_lost(&mut self, id: FrameId) {
        self.inner.on_frame_lost(id);
    }
}

/// Handle returned by [`FrameGeneratorManager::add_generator`].
pub type GeneratorHandle = usize;

/// Keeps generators in weight order and assembles packet payloads.
#[derive(Default)]
pub struct FrameGeneratorManager {
    // (weight, insertion index, generator), kept sorted
    entries: Vec<(GeneratorWeight, usize, Box<dyn FrameGenerator>)>,
    next_insertion: usize,
}

impl FrameGeneratorManager {
    /// Empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `generator` at `weight`. Ties keep insertion order.
    pub fn add_generator(
        &mut self,
        weight: GeneratorWeight,
        generator: Box<dyn FrameGenerator>,
    ) -> GeneratorHandle {
        let insertion = self.next_insertion;
        self.next_insertion += 1;
        let at = self
            .entries
            .partition_point(|(w, i, _)| (*w, *i) <= (weight, insertion));
        self.entries.insert(at, (weight, insertion, generator));
        insertion
    }

    /// Mutable access to a registered generator by handle.
    pub fn generator_mut<'a>(&'a mut self, handle: GeneratorHandle) -> Option<&'a mut (dyn FrameGenerator + 'a)> {
        self.entries
            .iter_mut()
            .find(|(_, i, _)| *i == handle)
            .map(|(_, _, g)| -> &'a mut (dyn FrameGenerator + 'a) { g.as_mut() })
    }

    /// Assemble the frame list for one packet.
    ///
    /// Walks generators in weight order; each willing generator is asked
    /// for a frame, the remaining space shrinks by the frame's size, and
    /// whether the packet is ack-eliciting so far is fed to later
    /// generators.
    pub fn collect_frames(
        &mut self,
        level: EncryptionLevel,
        connection_credit: u64,
        max_packet_size: usize,
        seq_num: u32,
    ) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut remaining = max_packet_size;
        let mut ack_eliciting = false;

        for (_, _, generator) in &mut self.entries {
            if !generator.is_level_matched(level) {
                continue;
            }
            // current_packet_size is the bytes accumulated so far; the
            // remaining space is offered separately as max_frame_size
            let current_size = max_packet_size - remaining;
            if !generator.will_generate_frame(level, current_size, ack_eliciting, seq_num) {
                continue;
            }
            let Some(frame) = generator.generate_frame(
                level,
                connection_credit,
                remaining.min(usize::from(u16::MAX)) as u16,
                current_size,
                seq_num,
            ) else {
                continue;
            };
            let size = frame.size();
            if size > remaining {
                continue;
            }
            remaining -= size;
            ack_eliciting |= frame.is_ack_eliciting();
            frames.push(frame);
            if remaining == 0 {
                break;
            }
        }

        frames
    }
}
