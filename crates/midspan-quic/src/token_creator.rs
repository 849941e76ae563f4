//! NEW_TOKEN frame generator.
//!
//! Sends the peer one address-validation token for use on a future
//! connection. The token is minted by the caller (it encodes the client
//! address and an expiry, which are transport-runtime concerns); this
//! generator owns the send-once state and re-arms itself when the frame is
//! reported lost.

use bytes::Bytes;

use crate::{
    frame::{Frame, FrameType},
    generator::{FrameGenerator, FrameInfo, FrameInfoPayload, FrameRecordKeeper},
    types::{EncryptionLevel, FrameId},
};

/// NEW_TOKEN generator.
#[derive(Debug, Default)]
pub struct TokenCreator {
    token: Option<Bytes>,
    token_sent: bool,
    records: FrameRecordKeeper,
}

impl TokenCreator {
    /// Generator with no token armed yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the generator with a token to deliver.
    pub fn arm(&mut self, token: Bytes) {
        self.token = Some(token);
        self.token_sent = false;
    }

    /// True once the armed token went out and has not been lost since.
    #[must_use]
    pub fn is_token_sent(&self) -> bool {
        self.token_sent
    }
}

impl FrameGenerator for TokenCreator {
    fn will_generate_frame(
        &mut self,
        level: EncryptionLevel,
        _current_packet_size: usize,
        _ack_eliciting: bool,
        _seq_num: u32,
    ) -> bool {
        if !self.is_level_matched(level) {
            return false;
        }
        self.token.is_some() && !self.token_sent
    }

    fn generate_frame(
        &mut self,
        level: EncryptionLevel,
        _connection_credit: u64,
        max_frame_size: u16,
        _current_packet_size: usize,
        _seq_num: u32,
    ) -> Option<Frame> {
        if !self.is_level_matched(level) || self.token_sent {
            return None;
        }
        let token = self.token.clone()?;
        let frame = Frame::NewToken { token: token.clone() };
        if frame.size() >= usize::from(max_frame_size) {
            // Cancel; a NEW_TOKEN is never split
            return None;
        }

        let id = self.records.issue_id();
        self.records.record(FrameInfo {
            id,
            level,
            frame_type: FrameType::NewToken,
            payload: FrameInfoPayload::Token { token },
        });
        self.token_sent = true;
        Some(frame)
    }

    fn on_frame_acked(&mut self, id: FrameId) {
        let _ = self.records.take(id);
    }

    fn on_frame_lost(&mut self, id: FrameId) {
        if self.records.take(id).is_some() {
            // Deliver again on the next packet
            self.token_sent = false;
        }
    }
}
