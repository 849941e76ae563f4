//! Retransmission buffer.
//!
//! Frame records reported lost are queued here by their owning generators;
//! packet assembly asks for one re-built frame at a time, subject to the
//! packet's remaining space. Oversized stream data is split and the
//! remainder stays queued, so nothing is dropped: after every call each
//! entry present at entry time is either the produced frame or still in
//! the queue (possibly with part of its payload consumed).

use std::collections::VecDeque;

use tracing::warn;

use crate::{
    frame::{Frame, FrameType, StreamFrame},
    generator::{FrameInfo, FrameInfoPayload},
    types::EncryptionLevel,
};

/// Frame types eligible for retransmission buffering.
const RETRANSMITTED_FRAME_TYPES: [FrameType; 1] = [FrameType::Stream];

/// Per-connection retransmission queue.
#[derive(Debug, Default)]
pub struct FrameRetransmitter {
    lost_frame_info_queue: VecDeque<FrameInfo>,
}

impl FrameRetransmitter {
    /// Empty retransmitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued records.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.lost_frame_info_queue.len()
    }

    /// Take ownership of a lost frame's record. Only allow-listed types
    /// are kept; anything else is discarded.
    pub fn save_frame_info(&mut self, info: FrameInfo) {
        if RETRANSMITTED_FRAME_TYPES.contains(&info.frame_type) {
            self.lost_frame_info_queue.push_back(info);
        }
    }

    /// Produce one retransmitted frame that fits in `max_frame_size` at
    /// `level`, or `None` when nothing currently fits.
    ///
    /// Entries for other levels are skipped (moved to a holding deque and
    /// restored afterward in their original order); an entry whose frame
    /// does not fit whole is split, the sent half returned and the
    /// remainder requeued; an entry too large even to split is requeued
    /// and the scan continues.
    pub fn create_retransmitted_frame(
        &mut self,
        level: EncryptionLevel,
        max_frame_size: u16,
    ) -> Option<Frame> {
        if self.lost_frame_info_queue.is_empty() {
            return None;
        }

        let mut holding: VecDeque<FrameInfo> = VecDeque::new();
        let mut produced = None;

        while let Some(info) = self.lost_frame_info_queue.pop_front() {
            if info.level != level {
                holding.push_back(info);
                continue;
            }

            match info.frame_type {
                FrameType::Stream => {
                    match Self::build_stream_frame(info, max_frame_size, &mut holding) {
                        Some(frame) => {
                            produced = Some(frame);
                            break;
                        }
                        None => continue,
                    }
                }
                other => {
                    warn!(?other, "unexpected frame type in retransmit queue");
                }
            }
        }

        // Restore skipped entries, keeping their relative order ahead of
        // anything that was not scanned
        while let Some(info) = holding.pop_back() {
            self.lost_frame_info_queue.push_front(info);
        }

        produced
    }

    fn build_stream_frame(
        info: FrameInfo,
        max_frame_size: u16,
        holding: &mut VecDeque<FrameInfo>,
    ) -> Option<Frame> {
        let FrameInfoPayload::Stream { stream_id, offset, data, fin } = info.payload.clone()
        else {
            warn!("stream record without stream payload");
            return None;
        };

        let frame = Frame::Retransmission {
            frame_id: info.id,
            inner: Box::new(Frame::Stream(StreamFrame {
                stream_id,
                offset,
                data,
                fin,
                has_length_field: true,
            })),
        };

        if frame.size() <= usize::from(max_frame_size) {
            return Some(frame);
        }

        match frame.split(usize::from(max_frame_size)) {
            Ok((left, right)) => {
                // Requeue the unsent remainder with its advanced offset
                if let Frame::Retransmission { inner, .. } = &right
                    && let Frame::Stream(rest) = inner.as_ref()
                {
                    holding.push_back(FrameInfo {
                        payload: FrameInfoPayload::Stream {
                            stream_id: rest.stream_id,
                            offset: rest.offset,
                            data: rest.data.clone(),
                            fin: rest.fin,
                        },
                        ..info
                    });
                }
                Some(left)
            }
            Err(_) => {
                // Too small even to split; keep the record whole
                holding.push_back(info);
                None
            }
        }
    }
}
