//! PING frame generator.
//!
//! Keeps a per-level count of PING frames that need to go out. Credits are
//! added explicitly with [`Pinger::request`] (e.g. by loss detection
//! probing) and implicitly for a non-ack-eliciting packet that would
//! otherwise never be acknowledged. An already-ack-eliciting packet makes a
//! pending PING unnecessary, so it consumes one credit instead, and the
//! packet right after an ack-eliciting one gets a grace pass before the
//! automatic request resumes.

use crate::{
    frame::Frame,
    generator::FrameGenerator,
    types::EncryptionLevel,
};

const ALL_LEVELS: [EncryptionLevel; 4] = [
    EncryptionLevel::Initial,
    EncryptionLevel::ZeroRtt,
    EncryptionLevel::Handshake,
    EncryptionLevel::OneRtt,
];

fn level_index(level: EncryptionLevel) -> usize {
    match level {
        EncryptionLevel::Initial => 0,
        EncryptionLevel::ZeroRtt => 1,
        EncryptionLevel::Handshake => 2,
        EncryptionLevel::OneRtt => 3,
    }
}

/// PING frame generator.
#[derive(Debug, Default)]
pub struct Pinger {
    need_to_fire: [u64; 4],
    latest_seq: Option<u32>,
    prev_ack_eliciting: bool,
}

impl Pinger {
    /// New pinger with no pending credit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one pending PING at `level`.
    pub fn request(&mut self, level: EncryptionLevel) {
        self.need_to_fire[level_index(level)] += 1;
    }

    /// Remove one pending PING at `level`; never goes below zero.
    pub fn cancel(&mut self, level: EncryptionLevel) {
        let count = &mut self.need_to_fire[level_index(level)];
        *count = count.saturating_sub(1);
    }

    /// Pending PINGs at `level`.
    #[must_use]
    pub fn count(&self, level: EncryptionLevel) -> u64 {
        self.need_to_fire[level_index(level)]
    }
}

impl FrameGenerator for Pinger {
    fn level_filter(&self) -> &[EncryptionLevel] {
        &ALL_LEVELS
    }

    fn will_generate_frame(
        &mut self,
        level: EncryptionLevel,
        current_packet_size: usize,
        ack_eliciting: bool,
        seq_num: u32,
    ) -> bool {
        if !self.is_level_matched(level) {
            return false;
        }
        // Each packet is consulted once; a repeat within the same packet
        // neither fires nor consumes credit
        if self.latest_seq == Some(seq_num) {
            return false;
        }
        self.latest_seq = Some(seq_num);

        if ack_eliciting {
            // The packet elicits an ack by itself; a pending PING is spent
            if self.count(level) > 0 {
                self.cancel(level);
            }
            self.prev_ack_eliciting = true;
            return false;
        }

        if current_packet_size == 0 {
            // Nothing to carry the PING; keep the credit
            return false;
        }

        if self.prev_ack_eliciting {
            // Grace pass: the previous packet already elicited an ack
            self.prev_ack_eliciting = false;
            return self.count(level) > 0;
        }

        if self.count(level) == 0 {
            self.request(level);
        }
        self.count(level) > 0
    }

    fn generate_frame(
        &mut self,
        level: EncryptionLevel,
        _connection_credit: u64,
        max_frame_size: u16,
        _current_packet_size: usize,
        seq_num: u32,
    ) -> Option<Frame> {
        if !self.is_level_matched(level) {
            return None;
        }
        if self.count(level) > 0 && max_frame_size > 0 {
            // One PING answers every pending request at this level
            self.need_to_fire[level_index(level)] = 0;
            self.latest_seq = Some(seq_num);
            return Some(Frame::Ping);
        }
        None
    }
}
