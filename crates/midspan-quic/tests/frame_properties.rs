//! Property tests for the frame codec.
//!
//! Every frame variant round-trips through store/parse, stored output is
//! stable under clone, and stream splits conserve payload bytes.

use bytes::Bytes;
use midspan_quic::{
    frame::{AckBlock, AckFrame, CryptoFrame, NewConnectionIdFrame, StreamFrame},
    types::ConnectionId,
    Frame, varint,
};
use proptest::prelude::*;

const VARINT_MAX: u64 = varint::MAX;

fn arb_bytes(max_len: usize) -> impl Strategy<Value = Bytes> {
    prop::collection::vec(any::<u8>(), 0..max_len).prop_map(Bytes::from)
}

fn arb_nonempty_bytes(max_len: usize) -> impl Strategy<Value = Bytes> {
    prop::collection::vec(any::<u8>(), 1..max_len).prop_map(Bytes::from)
}

fn arb_frame() -> impl Strategy<Value = Frame> {
    let v = || 0u64..=VARINT_MAX;
    let arms: Vec<BoxedStrategy<Frame>> = vec![
        (1usize..64).prop_map(|len| Frame::Padding { len }).boxed(),
        Just(Frame::Ping).boxed(),
        (v(), v(), arb_bytes(512), any::<bool>())
            .prop_map(|(stream_id, offset, data, fin)| {
                Frame::Stream(StreamFrame {
                    stream_id,
                    offset,
                    data,
                    fin,
                    has_length_field: true,
                })
            })
            .boxed(),
        (
            v(),
            v(),
            v(),
            prop::collection::vec(
                (v(), v()).prop_map(|(gap, length)| AckBlock { gap, length }),
                0..8,
            ),
        )
            .prop_map(|(largest_ack, delay, first_block, blocks)| {
                Frame::Ack(AckFrame { largest_ack, delay, first_block, blocks })
            })
            .boxed(),
        (v(), v(), v())
            .prop_map(|(stream_id, error_code, final_offset)| Frame::RstStream {
                stream_id,
                error_code,
                final_offset,
            })
            .boxed(),
        (v(), v(), arb_bytes(64))
            .prop_map(|(error_code, frame_type, reason)| Frame::ConnectionClose {
                error_code,
                frame_type,
                reason,
            })
            .boxed(),
        (v(), arb_bytes(64))
            .prop_map(|(error_code, reason)| Frame::ApplicationClose { error_code, reason })
            .boxed(),
        v().prop_map(|maximum| Frame::MaxData { maximum }).boxed(),
        (v(), v())
            .prop_map(|(stream_id, maximum)| Frame::MaxStreamData { stream_id, maximum })
            .boxed(),
        v().prop_map(|stream_id| Frame::MaxStreamId { stream_id }).boxed(),
        v().prop_map(|offset| Frame::Blocked { offset }).boxed(),
        (v(), v())
            .prop_map(|(stream_id, offset)| Frame::StreamBlocked { stream_id, offset })
            .boxed(),
        v().prop_map(|stream_id| Frame::StreamIdBlocked { stream_id }).boxed(),
        (v(), v(), prop::collection::vec(any::<u8>(), 1..=20), any::<[u8; 16]>())
            .prop_map(|(sequence, retire_prior_to, cid, reset_token)| {
                Frame::NewConnectionId(NewConnectionIdFrame {
                    sequence,
                    retire_prior_to,
                    connection_id: ConnectionId::new(&cid),
                    reset_token,
                })
            })
            .boxed(),
        (v(), v())
            .prop_map(|(stream_id, error_code)| Frame::StopSending { stream_id, error_code })
            .boxed(),
        any::<[u8; 8]>().prop_map(|data| Frame::PathChallenge { data }).boxed(),
        any::<[u8; 8]>().prop_map(|data| Frame::PathResponse { data }).boxed(),
        (v(), arb_bytes(512))
            .prop_map(|(offset, data)| Frame::Crypto(CryptoFrame { offset, data }))
            .boxed(),
        arb_nonempty_bytes(128).prop_map(|token| Frame::NewToken { token }).boxed(),
    ];
    prop::strategy::Union::new(arms)
}

proptest! {
    #[test]
    fn frame_round_trip(frame in arb_frame()) {
        let mut wire = vec![0u8; frame.size()];
        let written = frame.store(&mut wire);
        prop_assert_eq!(written, frame.size());

        let (parsed, consumed) = Frame::parse(&Bytes::from(wire)).unwrap();
        prop_assert_eq!(consumed, frame.size());
        prop_assert_eq!(parsed, frame);
    }

    #[test]
    fn store_is_exact_or_zero(frame in arb_frame(), shortfall in 1usize..16) {
        let size = frame.size();
        let mut exact = vec![0u8; size];
        prop_assert_eq!(frame.store(&mut exact), size);

        let mut short = vec![0u8; size.saturating_sub(shortfall)];
        prop_assert_eq!(frame.store(&mut short), 0);
    }

    #[test]
    fn clone_stores_identical_bytes(frame in arb_frame()) {
        let cloned = frame.clone();
        let mut a = vec![0u8; frame.size()];
        let mut b = vec![0u8; cloned.size()];
        let _ = frame.store(&mut a);
        let _ = cloned.store(&mut b);
        prop_assert_eq!(a, b);
    }

    #[test]
    fn split_conserves_payload(
        data in prop::collection::vec(any::<u8>(), 2..2048),
        offset in 0u64..1_000_000,
        fin in any::<bool>(),
        split_fraction in 0.05f64..0.95,
    ) {
        let frame = Frame::Stream(StreamFrame {
            stream_id: 8,
            offset,
            data: Bytes::from(data.clone()),
            fin,
            has_length_field: true,
        });
        let header_len = frame.size() - data.len();
        let at = header_len + 1 + ((data.len() - 2) as f64 * split_fraction) as usize;

        let (left, right) = frame.split(at).unwrap();
        let (Frame::Stream(l), Frame::Stream(r)) = (&left, &right) else {
            return Err(TestCaseError::fail("split produced non-stream frames"));
        };

        prop_assert!(left.size() <= at);
        prop_assert!(!l.fin);
        prop_assert_eq!(r.fin, fin);
        prop_assert_eq!(r.offset, l.offset + l.data.len() as u64);

        let mut joined = l.data.to_vec();
        joined.extend_from_slice(&r.data);
        prop_assert_eq!(joined, data);
    }
}
