//! PADDING frame generator.
//!
//! Pads Initial packets up to the minimum datagram size required for
//! address amplification protection, and answers explicit padding requests
//! at other levels. Runs at most once per packet via [`OncePerSequence`].

use crate::{
    frame::Frame,
    generator::{FrameGenerator, OncePerSequence},
    types::EncryptionLevel,
};

/// Minimum size of a client Initial datagram.
pub const MINIMUM_INITIAL_PACKET_SIZE: usize = 1200;

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

/// PADDING generator core. Wrap with [`Padder::new`] for the once-per-packet
/// behavior.
#[derive(Debug, Default)]
pub struct PadderCore {
    need_to_fire: [u64; 4],
}

/// Once-per-packet PADDING generator.
pub type Padder = OncePerSequence<PadderCore>;

impl PadderCore {
    /// Request padding for the next packet at `level`.
    pub fn request(&mut self, level: EncryptionLevel) {
        self.need_to_fire[level_index(level)] += 1;
    }

    /// Withdraw a padding request; never goes below zero.
    pub fn cancel(&mut self, level: EncryptionLevel) {
        let count = &mut self.need_to_fire[level_index(level)];
        *count = count.saturating_sub(1);
    }

    /// Outstanding padding requests at `level`.
    #[must_use]
    pub fn count(&self, level: EncryptionLevel) -> u64 {
        self.need_to_fire[level_index(level)]
    }

    fn minimum_packet_size(level: EncryptionLevel) -> usize {
        if level == EncryptionLevel::Initial { MINIMUM_INITIAL_PACKET_SIZE } else { 0 }
    }
}

impl FrameGenerator for PadderCore {
    fn level_filter(&self) -> &[EncryptionLevel] {
        &ALL_LEVELS
    }

    fn will_generate_frame(
        &mut self,
        level: EncryptionLevel,
        current_packet_size: usize,
        _ack_eliciting: bool,
        _seq_num: u32,
    ) -> bool {
        if !self.is_level_matched(level) {
            return false;
        }
        if self.count(level) > 0 {
            return true;
        }
        // Initial packets always pad out to the amplification minimum
        level == EncryptionLevel::Initial
            && current_packet_size > 0
            && current_packet_size < Self::minimum_packet_size(level)
    }

    fn generate_frame(
        &mut self,
        level: EncryptionLevel,
        _connection_credit: u64,
        max_frame_size: u16,
        current_packet_size: usize,
        _seq_num: u32,
    ) -> Option<Frame> {
        if !self.is_level_matched(level) || max_frame_size == 0 {
            return None;
        }

        let needed = Self::minimum_packet_size(level).saturating_sub(current_packet_size);
        let pad_len = needed.clamp(1, usize::from(max_frame_size));
        if self.count(level) > 0 {
            self.cancel(level);
        } else if needed == 0 {
            return None;
        }
        Some(Frame::Padding { len: pad_len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_short_initial_to_minimum() {
        let mut padder = Padder::new(PadderCore::default());
        assert!(padder.will_generate_frame(EncryptionLevel::Initial, 300, false, 0));
        let frame = padder
            .generate_frame(EncryptionLevel::Initial, u64::MAX, u16::MAX, 300, 0)
            .unwrap();
        assert_eq!(frame.size(), MINIMUM_INITIAL_PACKET_SIZE - 300);
    }

    #[test]
    fn full_initial_needs_no_padding() {
        let mut padder = Padder::new(PadderCore::default());
        assert!(!padder.will_generate_frame(
            EncryptionLevel::Initial,
            MINIMUM_INITIAL_PACKET_SIZE,
            false,
            0
        ));
    }

    #[test]
    fn non_initial_only_on_request() {
        let mut padder = Padder::new(PadderCore::default());
        assert!(!padder.will_generate_frame(EncryptionLevel::OneRtt, 100, false, 0));

        padder.inner_mut().request(EncryptionLevel::OneRtt);
        assert!(padder.will_generate_frame(EncryptionLevel::OneRtt, 100, false, 1));
        let frame = padder
            .generate_frame(EncryptionLevel::OneRtt, u64::MAX, 64, 100, 1)
            .unwrap();
        assert!(frame.size() >= 1);
        assert_eq!(padder.inner_mut().count(EncryptionLevel::OneRtt), 0);
    }

    #[test]
    fn once_per_packet() {
        let mut padder = Padder::new(PadderCore::default());
        assert!(padder.will_generate_frame(EncryptionLevel::Initial, 300, false, 5));
        assert!(!padder.will_generate_frame(EncryptionLevel::Initial, 300, false, 5));
    }

    #[test]
    fn padding_capped_by_frame_budget() {
        let mut padder = Padder::new(PadderCore::default());
        let frame = padder
            .generate_frame(EncryptionLevel::Initial, u64::MAX, 50, 300, 0)
            .unwrap();
        assert_eq!(frame.size(), 50);
    }
}
