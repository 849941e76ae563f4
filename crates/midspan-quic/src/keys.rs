//! Per-phase, per-direction packet protection key material.
//!
//! The registry stores `{key, iv, header-protection key}` for each key
//! phase and each direction, plus availability flags. Whether "encryption"
//! means the client or the server slots depends on the registry's
//! [`Context`]: a server encrypts with server keys and decrypts with client
//! keys, and vice versa. Dropping a phase scrubs all six buffers.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::types::{ConnectionId, Version};

/// AES-128-GCM key length.
pub const KEY_LEN: usize = 16;
/// AEAD nonce/IV length.
pub const IV_LEN: usize = 12;
/// AEAD authentication tag length.
pub const TAG_LEN: usize = 16;

/// HKDF salt for Initial secrets, QUIC v1 (RFC 9001 §5.2).
const INITIAL_SALT_V1: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

/// Key phase. Initial/0-RTT/Handshake map one-to-one onto encryption
/// levels; Phase0/Phase1 are the two alternating 1-RTT phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyPhase {
    /// Initial secrets derived from the client destination CID
    Initial,
    /// 0-RTT application keys
    ZeroRtt,
    /// Handshake keys
    Handshake,
    /// 1-RTT keys, key-phase bit 0
    Phase0,
    /// 1-RTT keys, key-phase bit 1
    Phase1,
}

impl KeyPhase {
    /// Number of phases.
    pub const COUNT: usize = 5;

    fn index(self) -> usize {
        match self {
            Self::Initial => 0,
            Self::ZeroRtt => 1,
            Self::Handshake => 2,
            Self::Phase0 => 3,
            Self::Phase1 => 4,
        }
    }
}

/// Which endpoint this registry belongs to. Decides the direction flip
/// between encryption and decryption accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Context {
    /// We are the server: encrypt with server keys, decrypt with client keys
    #[default]
    Server,
    /// We are the client: encrypt with client keys, decrypt with server keys
    Client,
}

/// One direction's material for one phase.
#[derive(Default)]
struct KeySlot {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
    hp_key: [u8; KEY_LEN],
    available: bool,
}

impl KeySlot {
    fn clear(&mut self) {
        self.key.zeroize();
        self.iv.zeroize();
        self.hp_key.zeroize();
        self.available = false;
    }
}

impl Drop for KeySlot {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Packet protection key registry.
#[derive(Default)]
pub struct KeyRegistry {
    ctx: Context,
    client: [KeySlot; KeyPhase::COUNT],
    server: [KeySlot; KeyPhase::COUNT],
}

impl KeyRegistry {
    /// New, empty registry for `ctx`.
    #[must_use]
    pub fn new(ctx: Context) -> Self {
        Self { ctx, ..Self::default() }
    }

    /// Change the context. Flips which direction the encryption and
    /// decryption accessors read.
    pub fn set_context(&mut self, ctx: Context) {
        self.ctx = ctx;
    }

    /// AEAD tag length for `phase`. A single cipher suite is supported, so
    /// this is constant, but callers size buffers through it.
    #[must_use]
    pub fn tag_len(&self, _phase: KeyPhase) -> usize {
        TAG_LEN
    }

    fn local(&self, phase: KeyPhase) -> &KeySlot {
        match self.ctx {
            Context::Server => &self.server[phase.index()],
            Context::Client => &self.client[phase.index()],
        }
    }

    fn peer(&self, phase: KeyPhase) -> &KeySlot {
        match self.ctx {
            Context::Server => &self.client[phase.index()],
            Context::Client => &self.server[phase.index()],
        }
    }

    fn local_mut(&mut self, phase: KeyPhase) -> &mut KeySlot {
        match self.ctx {
            Context::Server => &mut self.server[phase.index()],
            Context::Client => &mut self.client[phase.index()],
        }
    }

    fn peer_mut(&mut self, phase: KeyPhase) -> &mut KeySlot {
        match self.ctx {
            Context::Server => &mut self.client[phase.index()],
            Context::Client => &mut self.server[phase.index()],
        }
    }

    /// True once [`Self::set_encryption_key_available`] was called for
    /// `phase` (and not dropped since).
    #[must_use]
    pub fn is_encryption_key_available(&self, phase: KeyPhase) -> bool {
        self.local(phase).available
    }

    /// Decryption-direction availability.
    #[must_use]
    pub fn is_decryption_key_available(&self, phase: KeyPhase) -> bool {
        self.peer(phase).available
    }

    /// Mark the encryption-direction keys for `phase` usable.
    pub fn set_encryption_key_available(&mut self, phase: KeyPhase) {
        self.local_mut(phase).available = true;
    }

    /// Mark the decryption-direction keys for `phase` usable.
    pub fn set_decryption_key_available(&mut self, phase: KeyPhase) {
        self.peer_mut(phase).available = true;
    }

    /// AEAD key used to protect outgoing packets.
    #[must_use]
    pub fn encryption_key(&self, phase: KeyPhase) -> &[u8; KEY_LEN] {
        &self.local(phase).key
    }

    /// IV used to protect outgoing packets.
    #[must_use]
    pub fn encryption_iv(&self, phase: KeyPhase) -> &[u8; IV_LEN] {
        &self.local(phase).iv
    }

    /// Header-protection key for outgoing packets.
    #[must_use]
    pub fn encryption_key_for_hp(&self, phase: KeyPhase) -> &[u8; KEY_LEN] {
        &self.local(phase).hp_key
    }

    /// AEAD key used to unprotect incoming packets.
    #[must_use]
    pub fn decryption_key(&self, phase: KeyPhase) -> &[u8; KEY_LEN] {
        &self.peer(phase).key
    }

    /// IV used to unprotect incoming packets.
    #[must_use]
    pub fn decryption_iv(&self, phase: KeyPhase) -> &[u8; IV_LEN] {
        &self.peer(phase).iv
    }

    /// Header-protection key for incoming packets.
    #[must_use]
    pub fn decryption_key_for_hp(&self, phase: KeyPhase) -> &[u8; KEY_LEN] {
        &self.peer(phase).hp_key
    }

    /// Install material for one direction of `phase`. `local` selects the
    /// encryption (true) or decryption (false) direction under the current
    /// context. Availability is flagged in the same step.
    pub fn install(
        &mut self,
        phase: KeyPhase,
        local: bool,
        key: &[u8; KEY_LEN],
        iv: &[u8; IV_LEN],
        hp_key: &[u8; KEY_LEN],
    ) {
        let slot = if local { self.local_mut(phase) } else { self.peer_mut(phase) };
        slot.key.copy_from_slice(key);
        slot.iv.copy_from_slice(iv);
        slot.hp_key.copy_from_slice(hp_key);
        slot.available = true;
    }

    /// Drop a phase: zero all six buffers and clear both availability
    /// flags in one step.
    pub fn drop_keys(&mut self, phase: KeyPhase) {
        self.client[phase.index()].clear();
        self.server[phase.index()].clear();
    }

    /// Derive and install both directions of the Initial keys from the
    /// client destination connection ID (RFC 9001 §5.2).
    pub fn initialize_initial_keys(&mut self, version: Version, cid: &ConnectionId) {
        let client = InitialMaterial::derive(version, cid, b"client in");
        let server = InitialMaterial::derive(version, cid, b"server in");

        let (client_slot, server_slot) =
            (&mut self.client[KeyPhase::Initial.index()], &mut self.server[KeyPhase::Initial.index()]);
        client_slot.key = client.key;
        client_slot.iv = client.iv;
        client_slot.hp_key = client.hp_key;
        client_slot.available = true;
        server_slot.key = server.key;
        server_slot.iv = server.iv;
        server_slot.hp_key = server.hp_key;
        server_slot.available = true;
    }
}

/// Derived Initial key material for one direction.
pub struct InitialMaterial {
    /// AEAD key
    pub key: [u8; KEY_LEN],
    /// AEAD IV
    pub iv: [u8; IV_LEN],
    /// Header-protection key
    pub hp_key: [u8; KEY_LEN],
}

impl InitialMaterial {
    /// Derive one direction's Initial keys. `label` is `"client in"` or
    /// `"server in"`.
    #[must_use]
    pub fn derive(_version: Version, cid: &ConnectionId, label: &[u8]) -> Self {
        let (_, initial) = Hkdf::<Sha256>::extract(Some(&INITIAL_SALT_V1), cid.as_slice());

        let mut secret = [0u8; 32];
        expand_label(&initial, label, &mut secret);
        let hk = Hkdf::<Sha256>::from_prk(&secret)
            .unwrap_or_else(|_| unreachable!("expanded secret is hash-sized"));

        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        let mut hp_key = [0u8; KEY_LEN];
        expand_label(&hk, b"quic key", &mut key);
        expand_label(&hk, b"quic iv", &mut iv);
        expand_label(&hk, b"quic hp", &mut hp_key);

        secret.zeroize();
        Self { key, iv, hp_key }
    }
}

/// TLS 1.3 `HKDF-Expand-Label` with an empty context (RFC 8446 §7.1).
fn expand_label(hk: &Hkdf<Sha256>, label: &[u8], out: &mut [u8]) {
    let mut info = Vec::with_capacity(2 + 1 + 6 + label.len() + 1);
    info.extend_from_slice(&(out.len() as u16).to_be_bytes());
    info.push((6 + label.len()) as u8);
    info.extend_from_slice(b"tls13 ");
    info.extend_from_slice(label);
    info.push(0); // empty context
    hk.expand(&info, out)
        .unwrap_or_else(|_| unreachable!("output lengths are far below the HKDF limit"));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cid() -> ConnectionId {
        ConnectionId::new(&[0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08])
    }

    #[test]
    fn server_initial_vectors() {
        let m = InitialMaterial::derive(0x0000_0001, &test_cid(), b"server in");
        assert_eq!(
            m.key.to_vec(),
            hex::decode("cf3a5331653c364c88f0f379b6067e37").unwrap()
        );
        assert_eq!(m.iv.to_vec(), hex::decode("0ac1493ca1905853b0bba03e").unwrap());
        assert_eq!(
            m.hp_key.to_vec(),
            hex::decode("c206b8d9b9f0f37644430b490eeaa314").unwrap()
        );
    }

    #[test]
    fn client_initial_vectors() {
        let m = InitialMaterial::derive(0x0000_0001, &test_cid(), b"client in");
        assert_eq!(
            m.key.to_vec(),
            hex::decode("1f369613dd76d5467730efcbe3b1a22d").unwrap()
        );
        assert_eq!(m.iv.to_vec(), hex::decode("fa044b2f42a3fd3b46fb255c").unwrap());
        assert_eq!(
            m.hp_key.to_vec(),
            hex::decode("9f50449e04a0e810283a1e9933adedd2").unwrap()
        );
    }

    #[test]
    fn context_flips_direction() {
        let mut reg = KeyRegistry::new(Context::Server);
        reg.initialize_initial_keys(0x0000_0001, &test_cid());

        let server_key = *reg.encryption_key(KeyPhase::Initial);
        let client_key = *reg.decryption_key(KeyPhase::Initial);
        assert_ne!(server_key, client_key);

        reg.set_context(Context::Client);
        assert_eq!(*reg.encryption_key(KeyPhase::Initial), client_key);
        assert_eq!(*reg.decryption_key(KeyPhase::Initial), server_key);
    }

    #[test]
    fn drop_keys_scrubs_both_directions() {
        let mut reg = KeyRegistry::new(Context::Server);
        reg.initialize_initial_keys(0x0000_0001, &test_cid());
        assert!(reg.is_encryption_key_available(KeyPhase::Initial));
        assert!(reg.is_decryption_key_available(KeyPhase::Initial));

        reg.drop_keys(KeyPhase::Initial);
        assert!(!reg.is_encryption_key_available(KeyPhase::Initial));
        assert!(!reg.is_decryption_key_available(KeyPhase::Initial));
        assert_eq!(*reg.encryption_key(KeyPhase::Initial), [0u8; KEY_LEN]);
        assert_eq!(*reg.decryption_key(KeyPhase::Initial), [0u8; KEY_LEN]);
        assert_eq!(*reg.encryption_iv(KeyPhase::Initial), [0u8; IV_LEN]);
        assert_eq!(*reg.encryption_key_for_hp(KeyPhase::Initial), [0u8; KEY_LEN]);
    }

    #[test]
    fn availability_tracked_per_phase() {
        let mut reg = KeyRegistry::new(Context::Server);
        assert!(!reg.is_encryption_key_available(KeyPhase::Handshake));
        reg.set_encryption_key_available(KeyPhase::Handshake);
        assert!(reg.is_encryption_key_available(KeyPhase::Handshake));
        assert!(!reg.is_decryption_key_available(KeyPhase::Handshake));
        assert!(!reg.is_encryption_key_available(KeyPhase::Phase0));
    }
}
