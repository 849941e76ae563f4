//! End-to-end scenarios for the QUIC lower half: PING scheduling, the
//! Initial key-derivation vectors, frame splitting, and packet-number
//! monotonicity across the factory.

use bytes::Bytes;
use midspan_quic::{
    Context, EncryptionLevel, Frame, FrameGenerator, KeyPhase, KeyRegistry, PacketReceiveResult,
    StreamFrame,
    factory::PacketFactory,
    keys::InitialMaterial,
    pinger::Pinger,
    types::{ConnectionId, SUPPORTED_VERSIONS},
};

const LEVEL: EncryptionLevel = EncryptionLevel::OneRtt;

#[test]
fn ping_frame_scheduling() {
    let mut pinger = Pinger::new();

    // Quiet packet: a PING is requested automatically and offered
    assert!(pinger.will_generate_frame(LEVEL, usize::MAX, false, 0));
    assert_eq!(pinger.count(LEVEL), 1);

    // Ack-eliciting packet consumes the credit instead
    assert!(!pinger.will_generate_frame(LEVEL, usize::MAX, true, 1));
    assert_eq!(pinger.count(LEVEL), 0);

    // The next quiet packet gets a grace pass
    assert!(!pinger.will_generate_frame(LEVEL, usize::MAX, false, 2));
    assert_eq!(pinger.count(LEVEL), 0);

    // Sustained quiet traffic re-arms the PING
    assert!(pinger.will_generate_frame(LEVEL, usize::MAX, false, 3));
    assert_eq!(pinger.count(LEVEL), 1);
}

#[test]
fn initial_key_derivation_vectors() {
    let cid = ConnectionId::new(&hex::decode("8394c8f03e515708").unwrap());

    let server = InitialMaterial::derive(SUPPORTED_VERSIONS[0], &cid, b"server in");
    assert_eq!(server.key.to_vec(), hex::decode("cf3a5331653c364c88f0f379b6067e37").unwrap());
    assert_eq!(server.iv.to_vec(), hex::decode("0ac1493ca1905853b0bba03e").unwrap());
    assert_eq!(
        server.hp_key.to_vec(),
        hex::decode("c206b8d9b9f0f37644430b490eeaa314").unwrap()
    );

    let client = InitialMaterial::derive(SUPPORTED_VERSIONS[0], &cid, b"client in");
    assert_eq!(client.key.to_vec(), hex::decode("1f369613dd76d5467730efcbe3b1a22d").unwrap());
    assert_eq!(client.iv.to_vec(), hex::decode("fa044b2f42a3fd3b46fb255c").unwrap());
    assert_eq!(
        client.hp_key.to_vec(),
        hex::decode("9f50449e04a0e810283a1e9933adedd2").unwrap()
    );
}

#[test]
fn stream_frame_split_boundary() {
    let frame = Frame::Stream(StreamFrame {
        stream_id: 0,
        offset: 0,
        data: Bytes::from(vec![0xA5; 1000]),
        fin: true,
        has_length_field: true,
    });
    let original = vec![0xA5; 1000];

    let (left, right) = frame.split(500).unwrap();
    let Frame::Stream(l) = &left else { panic!("expected STREAM") };
    let Frame::Stream(r) = &right else { panic!("expected STREAM") };

    assert_eq!(l.offset, 0);
    assert!(!l.fin);
    assert_eq!(r.offset, l.data.len() as u64);
    assert!(r.fin);

    let mut joined = l.data.to_vec();
    joined.extend_from_slice(&r.data);
    assert_eq!(joined, original);
}

#[test]
fn initial_packet_round_trip_between_endpoints() {
    let cid = ConnectionId::new(&hex::decode("8394c8f03e515708").unwrap());
    let mut server_keys = KeyRegistry::new(Context::Server);
    server_keys.initialize_initial_keys(SUPPORTED_VERSIONS[0], &cid);
    let mut client_keys = KeyRegistry::new(Context::Client);
    client_keys.initialize_initial_keys(SUPPORTED_VERSIONS[0], &cid);

    // Server emits; packet numbers climb monotonically
    let mut factory = PacketFactory::new();
    let mut last_pn = None;
    let mut wires = Vec::new();
    for payload in [&b"first"[..], b"second", b"third"] {
        let (header, wire) = factory
            .create_initial_packet(&server_keys, cid, cid, Bytes::new(), &[payload])
            .unwrap();
        if let Some(prev) = last_pn {
            assert!(header.packet_number > prev);
        }
        last_pn = Some(header.packet_number);
        wires.push(wire);
    }

    // Client decrypts every packet with the mirrored registry
    let receive = PacketFactory::new();
    for (i, wire) in wires.into_iter().enumerate() {
        match receive.receive(&client_keys, &Bytes::from(wire), 0) {
            PacketReceiveResult::Success(packet) => {
                assert_eq!(packet.header.packet_number, i as u64);
            }
            other => panic!("expected Success, got {other:?}"),
        }
    }
}

#[test]
fn handshake_before_keys_is_ignored_but_initial_is_buffered() {
    let cid = ConnectionId::new(&[1, 2, 3, 4]);
    let mut sender = KeyRegistry::new(Context::Server);
    sender.initialize_initial_keys(SUPPORTED_VERSIONS[0], &cid);
    sender.install(KeyPhase::Handshake, true, &[1; 16], &[2; 12], &[3; 16]);

    let mut factory = PacketFactory::new();
    let (_, initial_wire) = factory
        .create_initial_packet(&sender, cid, cid, Bytes::new(), &[b"i"])
        .unwrap();
    let (_, handshake_wire) = factory
        .create_handshake_packet(&sender, cid, cid, &[b"h"])
        .unwrap();

    let keyless = KeyRegistry::new(Context::Client);
    let receive = PacketFactory::new();
    assert_eq!(
        receive.receive(&keyless, &Bytes::from(initial_wire), 0),
        PacketReceiveResult::NotReady
    );
    assert_eq!(
        receive.receive(&keyless, &Bytes::from(handshake_wire), 0),
        PacketReceiveResult::Ignored
    );
}
