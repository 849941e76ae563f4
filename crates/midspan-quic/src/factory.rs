//! Packet factory: emit and receive paths.
//!
//! The emit path picks the next packet number from the per-space generator,
//! assembles the cleartext header, and protects the payload; a protection
//! failure drops the packet with a log line. Version Negotiation, Retry and
//! Stateless Reset are emitted unprotected. The receive path classifies an
//! incoming datagram into exactly one [`PacketReceiveResult`].

use bytes::Bytes;
use tracing::debug;

use crate::{
    error::PacketError,
    keys::{KeyPhase, KeyRegistry},
    packet::{Packet, PacketHeader, PacketReceiveResult, PacketType, serialize_stateless_reset},
    protection::PayloadProtector,
    types::{
        ConnectionId, EncryptionLevel, PacketNumber, PacketNumberSpace, StatelessResetToken,
        SUPPORTED_VERSIONS, Version, is_supported_version,
    },
};

/// Monotonic packet-number source for one space.
///
/// Numbers never repeat within a space across the life of a connection,
/// including across key rotation; `reset` is only legal when the key space
/// itself is discarded.
#[derive(Debug, Default)]
pub struct PacketNumberGenerator {
    current: PacketNumber,
}

impl PacketNumberGenerator {
    /// Next packet number. Strictly greater than every number returned
    /// before it.
    pub fn next(&mut self) -> PacketNumber {
        let pn = self.current;
        self.current += 1;
        pn
    }

    /// Restart from zero. Only on key-space discard.
    pub fn reset(&mut self) {
        self.current = 0;
    }
}

/// Upper bound the factory enforces on ciphertext expansion.
const MAX_PACKET_SIZE: usize = 65_527;

/// Packet factory for one connection.
pub struct PacketFactory {
    version: Version,
    pn_generators: [PacketNumberGenerator; PacketNumberSpace::COUNT],
}

impl Default for PacketFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketFactory {
    /// Factory speaking the default version.
    #[must_use]
    pub fn new() -> Self {
        Self { version: SUPPORTED_VERSIONS[0], pn_generators: Default::default() }
    }

    /// Adopt the negotiated version for subsequent long headers.
    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// True once 1-RTT protected packets can be produced.
    #[must_use]
    pub fn is_ready_to_create_protected_packet(&self, keys: &KeyRegistry) -> bool {
        keys.is_encryption_key_available(KeyPhase::Phase0)
            || keys.is_encryption_key_available(KeyPhase::Phase1)
    }

    /// Discard a packet-number space when its keys are dropped.
    pub fn reset_space(&mut self, space: PacketNumberSpace) {
        self.pn_generators[space.index()].reset();
    }

    /// Build and protect an Initial packet.
    ///
    /// # Errors
    ///
    /// - `PacketError::ProtectionFailed`: the packet is dropped
    pub fn create_initial_packet(
        &mut self,
        keys: &KeyRegistry,
        dcid: ConnectionId,
        scid: ConnectionId,
        token: Bytes,
        payload: &[&[u8]],
    ) -> Result<(PacketHeader, Vec<u8>), PacketError> {
        self.create_long_packet(keys, PacketType::Initial, dcid, scid, token, payload)
    }

    /// Build and protect a Handshake packet.
    ///
    /// # Errors
    ///
    /// - `PacketError::ProtectionFailed`: the packet is dropped
    pub fn create_handshake_packet(
        &mut self,
        keys: &KeyRegistry,
        dcid: ConnectionId,
        scid: ConnectionId,
        payload: &[&[u8]],
    ) -> Result<(PacketHeader, Vec<u8>), PacketError> {
        self.create_long_packet(keys, PacketType::Handshake, dcid, scid, Bytes::new(), payload)
    }

    /// Build and protect a 0-RTT packet.
    ///
    /// # Errors
    ///
    /// - `PacketError::ProtectionFailed`: the packet is dropped
    pub fn create_zero_rtt_packet(
        &mut self,
        keys: &KeyRegistry,
        dcid: ConnectionId,
        scid: ConnectionId,
        payload: &[&[u8]],
    ) -> Result<(PacketHeader, Vec<u8>), PacketError> {
        self.create_long_packet(keys, PacketType::ZeroRtt, dcid, scid, Bytes::new(), payload)
    }

    /// Build and protect a short-header (1-RTT) packet under `phase`.
    ///
    /// # Errors
    ///
    /// - `PacketError::ProtectionFailed`: the packet is dropped
    pub fn create_short_header_packet(
        &mut self,
        keys: &KeyRegistry,
        dcid: ConnectionId,
        phase: KeyPhase,
        payload: &[&[u8]],
    ) -> Result<(PacketHeader, Vec<u8>), PacketError> {
        let pn = self.pn_generators[PacketNumberSpace::AppData.index()].next();
        let header = PacketHeader {
            packet_type: PacketType::OneRtt,
            version: None,
            dcid,
            scid: ConnectionId::ZERO,
            token: Bytes::new(),
            packet_number: pn,
            key_phase: Some(phase),
        };
        self.protect_into_wire(keys, header, phase, payload)
    }

    /// Build a Version Negotiation packet (unprotected).
    #[must_use]
    pub fn create_version_negotiation_packet(
        &self,
        dcid: ConnectionId,
        scid: ConnectionId,
    ) -> Vec<u8> {
        let header = PacketHeader {
            packet_type: PacketType::VersionNegotiation,
            version: Some(crate::types::VERSION_NEGOTIATION),
            dcid,
            scid,
            token: Bytes::new(),
            packet_number: 0,
            key_phase: None,
        };
        let (mut wire, _) = header.serialize(0);
        for v in SUPPORTED_VERSIONS {
            wire.extend_from_slice(&v.to_be_bytes());
        }
        wire
    }

    /// Build a Retry packet (unprotected).
    #[must_use]
    pub fn create_retry_packet(
        &self,
        dcid: ConnectionId,
        scid: ConnectionId,
        original_dcid: ConnectionId,
        retry_token: &[u8],
    ) -> Vec<u8> {
        let header = PacketHeader {
            packet_type: PacketType::Retry,
            version: Some(self.version),
            dcid,
            scid,
            token: Bytes::new(),
            packet_number: 0,
            key_phase: None,
        };
        let (mut wire, _) = header.serialize(0);
        wire.push(original_dcid.len() as u8);
        wire.extend_from_slice(original_dcid.as_slice());
        wire.extend_from_slice(retry_token);
        wire
    }

    /// Build a Stateless Reset packet (unprotected).
    #[must_use]
    pub fn create_stateless_reset_packet(
        &self,
        token: StatelessResetToken,
        filler: &[u8],
    ) -> Vec<u8> {
        serialize_stateless_reset(token, filler).to_vec()
    }

    /// Classify and decrypt an incoming datagram.
    ///
    /// Exactly one [`PacketReceiveResult`] is produced:
    /// - unsupported version (and not VN) → `Unsupported`
    /// - Retry / VN / Stateless Reset → `Success` with the payload verbatim
    /// - keys present, AEAD verifies → `Success`
    /// - keys present, AEAD rejects → `Failed`
    /// - Initial or 0-RTT before keys → `NotReady` (they may yet arrive)
    /// - Handshake or 1-RTT before keys → `Ignored` (they never will here)
    #[must_use]
    pub fn receive(
        &self,
        keys: &KeyRegistry,
        datagram: &Bytes,
        short_dcid_len: usize,
    ) -> PacketReceiveResult {
        let Some((header, payload_at)) = PacketHeader::parse(datagram, short_dcid_len) else {
            debug!("undecodable packet header");
            return PacketReceiveResult::Failed;
        };

        if let Some(version) = header.version
            && version != crate::types::VERSION_NEGOTIATION
            && !is_supported_version(version)
        {
            return PacketReceiveResult::Unsupported;
        }

        match header.packet_type {
            PacketType::VersionNegotiation | PacketType::Retry | PacketType::StatelessReset => {
                // Unprotected types: copy the payload verbatim
                let payload = datagram.slice(payload_at.min(datagram.len())..);
                PacketReceiveResult::Success(Packet { header, payload })
            }
            typ => {
                let Some(phase) = header.key_phase else {
                    return PacketReceiveResult::Failed;
                };
                if !keys.is_decryption_key_available(phase) {
                    // NOT_READY: keys will plausibly arrive later (an
                    // Initial for an unknown CID, 0-RTT before the server
                    // derives it). IGNORED: they never will (a Handshake or
                    // 1-RTT packet with no handshake in sight).
                    return match typ {
                        PacketType::Initial | PacketType::ZeroRtt => {
                            PacketReceiveResult::NotReady
                        }
                        _ => PacketReceiveResult::Ignored,
                    };
                }

                let ad = datagram.slice(..payload_at);
                let ciphertext = datagram.slice(payload_at..);
                let protector = PayloadProtector::new(keys);
                match protector.unprotect(&ad, &ciphertext, header.packet_number, phase) {
                    Ok(plain) => PacketReceiveResult::Success(Packet {
                        header,
                        payload: Bytes::from(plain),
                    }),
                    Err(err) => {
                        debug!(%err, "packet unprotect failed");
                        PacketReceiveResult::Failed
                    }
                }
            }
        }
    }

    fn create_long_packet(
        &mut self,
        keys: &KeyRegistry,
        packet_type: PacketType,
        dcid: ConnectionId,
        scid: ConnectionId,
        token: Bytes,
        payload: &[&[u8]],
    ) -> Result<(PacketHeader, Vec<u8>), PacketError> {
        let level = packet_type
            .encryption_level()
            .unwrap_or(EncryptionLevel::Initial);
        let phase = packet_type.key_phase().unwrap_or(KeyPhase::Initial);
        let pn = self.pn_generators[level.pn_space().index()].next();

        let header = PacketHeader {
            packet_type,
            version: Some(self.version),
            dcid,
            scid,
            token,
            packet_number: pn,
            key_phase: Some(phase),
        };
        self.protect_into_wire(keys, header, phase, payload)
    }

    fn protect_into_wire(
        &self,
        keys: &KeyRegistry,
        header: PacketHeader,
        phase: KeyPhase,
        payload: &[&[u8]],
    ) -> Result<(PacketHeader, Vec<u8>), PacketError> {
        let plain_len: usize = payload.iter().map(|b| b.len()).sum();
        let cipher_len = plain_len + keys.tag_len(phase);
        let (mut wire, _pn_offset) = header.serialize(cipher_len);

        let protector = PayloadProtector::new(keys);
        let ciphertext = protector
            .protect(&wire, payload, header.packet_number, phase, MAX_PACKET_SIZE)
            .map_err(|source| {
                debug!(dcid = header.dcid.h32(), scid = header.scid.h32(), %source,
                    "failed to encrypt a packet");
                PacketError::ProtectionFailed {
                    level: header
                        .packet_type
                        .encryption_level()
                        .unwrap_or(EncryptionLevel::OneRtt),
                    source,
                }
            })?;

        wire.extend_from_slice(&ciphertext);
        Ok((header, wire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Context;

    fn cid() -> ConnectionId {
        ConnectionId::new(&[0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08])
    }

    fn server_keys() -> KeyRegistry {
        let mut keys = KeyRegistry::new(Context::Server);
        keys.initialize_initial_keys(SUPPORTED_VERSIONS[0], &cid());
        keys
    }

    fn client_keys() -> KeyRegistry {
        let mut keys = server_keys();
        keys.set_context(Context::Client);
        keys
    }

    #[test]
    fn packet_numbers_monotonic_per_space() {
        let mut factory = PacketFactory::new();
        let keys = server_keys();

        let mut last = None;
        for _ in 0..5 {
            let (header, _) = factory
                .create_initial_packet(&keys, cid(), cid(), Bytes::new(), &[b"x"])
                .unwrap();
            if let Some(prev) = last {
                assert!(header.packet_number > prev);
            }
            last = Some(header.packet_number);
        }
    }

    #[test]
    fn spaces_are_independent() {
        let mut factory = PacketFactory::new();
        let keys = server_keys();

        let (a, _) = factory
            .create_initial_packet(&keys, cid(), cid(), Bytes::new(), &[b"x"])
            .unwrap();
        let (b, _) = factory
            .create_initial_packet(&keys, cid(), cid(), Bytes::new(), &[b"x"])
            .unwrap();
        assert_eq!((a.packet_number, b.packet_number), (0, 1));

        // AppData space unaffected by Initial traffic
        let mut keys1 = server_keys();
        keys1.install(KeyPhase::Phase0, true, &[7u8; 16], &[8u8; 12], &[9u8; 16]);
        let (c, _) = factory
            .create_short_header_packet(&keys1, cid(), KeyPhase::Phase0, &[b"x"])
            .unwrap();
        assert_eq!(c.packet_number, 0);
    }

    #[test]
    fn app_space_survives_key_rotation() {
        let mut factory = PacketFactory::new();
        let mut keys = server_keys();
        keys.install(KeyPhase::Phase0, true, &[1u8; 16], &[2u8; 12], &[3u8; 16]);
        keys.install(KeyPhase::Phase1, true, &[4u8; 16], &[5u8; 12], &[6u8; 16]);

        let (a, _) = factory
            .create_short_header_packet(&keys, cid(), KeyPhase::Phase0, &[b"x"])
            .unwrap();
        // Rotate phases; the number keeps climbing
        let (b, _) = factory
            .create_short_header_packet(&keys, cid(), KeyPhase::Phase1, &[b"x"])
            .unwrap();
        assert!(b.packet_number > a.packet_number);
    }

    #[test]
    fn emit_fails_closed_without_keys() {
        let mut factory = PacketFactory::new();
        let keys = KeyRegistry::new(Context::Server);
        assert!(
            factory
                .create_handshake_packet(&keys, cid(), cid(), &[b"x"])
                .is_err()
        );
    }

    #[test]
    fn receive_round_trip() {
        let mut factory = PacketFactory::new();
        let server = server_keys();
        let client = client_keys();

        let (_, wire) = factory
            .create_initial_packet(&server, cid(), cid(), Bytes::from_static(b"t"), &[b"hello"])
            .unwrap();

        let receive_factory = PacketFactory::new();
        match receive_factory.receive(&client, &Bytes::from(wire), 0) {
            PacketReceiveResult::Success(packet) => {
                assert_eq!(packet.payload.as_ref(), b"hello");
                assert_eq!(packet.header.packet_type, PacketType::Initial);
            }
            other => panic!("expected Success, got {other:?}"),
        }
    }

    #[test]
    fn receive_outcomes() {
        let factory = PacketFactory::new();
        let empty_keys = KeyRegistry::new(Context::Client);

        // Initial without keys: NOT_READY
        let mut emit = PacketFactory::new();
        let server = server_keys();
        let (_, initial_wire) = emit
            .create_initial_packet(&server, cid(), cid(), Bytes::new(), &[b"x"])
            .unwrap();
        assert_eq!(
            factory.receive(&empty_keys, &Bytes::from(initial_wire.clone()), 0),
            PacketReceiveResult::NotReady
        );

        // Handshake without keys: IGNORED
        let mut hs_keys = server_keys();
        hs_keys.install(KeyPhase::Handshake, true, &[1u8; 16], &[2u8; 12], &[3u8; 16]);
        let (_, hs_wire) = emit
            .create_handshake_packet(&hs_keys, cid(), cid(), &[b"x"])
            .unwrap();
        assert_eq!(
            factory.receive(&empty_keys, &Bytes::from(hs_wire), 0),
            PacketReceiveResult::Ignored
        );

        // Corrupted ciphertext with keys present: FAILED
        let client = client_keys();
        let mut corrupt = initial_wire;
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;
        assert_eq!(
            factory.receive(&client, &Bytes::from(corrupt), 0),
            PacketReceiveResult::Failed
        );

        // Unknown version: UNSUPPORTED
        let mut bad_version = Vec::new();
        bad_version.push(0xC0);
        bad_version.extend_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
        bad_version.push(0); // dcid len
        bad_version.push(0); // scid len
        bad_version.push(0x01); // length varint
        bad_version.extend_from_slice(&[0; 8]);
        assert_eq!(
            factory.receive(&client, &Bytes::from(bad_version), 0),
            PacketReceiveResult::Unsupported
        );
    }

    #[test]
    fn version_negotiation_passes_payload_verbatim() {
        let factory = PacketFactory::new();
        let wire = factory.create_version_negotiation_packet(cid(), cid());
        let keys = KeyRegistry::new(Context::Client);
        match factory.receive(&keys, &Bytes::from(wire), 0) {
            PacketReceiveResult::Success(packet) => {
                assert_eq!(packet.header.packet_type, PacketType::VersionNegotiation);
                assert_eq!(packet.payload.len(), 4 * SUPPORTED_VERSIONS.len());
            }
            other => panic!("expected Success, got {other:?}"),
        }
    }

    #[test]
    fn reset_space_restarts_numbering() {
        let mut factory = PacketFactory::new();
        let keys = server_keys();
        let _ = factory.create_initial_packet(&keys, cid(), cid(), Bytes::new(), &[b"x"]);
        factory.reset_space(PacketNumberSpace::Initial);
        let (header, _) = factory
            .create_initial_packet(&keys, cid(), cid(), Bytes::new(), &[b"x"])
            .unwrap();
        assert_eq!(header.packet_number, 0);
    }

    #[test]
    fn stateless_reset_ends_with_token_regardless_of_filler() {
        use rand::{Rng, SeedableRng, rngs::StdRng};

        let factory = PacketFactory::new();
        let token = StatelessResetToken([0xAB; 16]);

        let mut rng = StdRng::seed_from_u64(7);
        for filler_len in [5usize, 40, 1200] {
            let mut filler = vec![0u8; filler_len];
            rng.fill(filler.as_mut_slice());

            let wire = factory.create_stateless_reset_packet(token, &filler);
            assert_eq!(wire.len(), 1 + filler_len + 16);
            // Short-header form bit set, long-header form bit clear
            assert_eq!(wire[0] & 0xC0, 0x40);
            assert_eq!(&wire[wire.len() - 16..], &token.0);
            assert_eq!(&wire[1..1 + filler_len], filler.as_slice());
        }
    }
}
