//! Packet payload and header protection.
//!
//! Payload protection is AEAD_AES_128_GCM: the nonce is the phase IV XORed
//! with the packet number (network byte order, right-aligned in the IV
//! width), the associated data is the packet header, and the 16-byte tag is
//! appended to the ciphertext. Header protection is a separate AES-128-ECB
//! pass over a 16-byte sample of the ciphertext, producing a 5-byte mask.
//!
//! Every failure mode is fail-closed: a missing key, an AEAD rejection, or
//! an undersized output buffer drops the packet with a typed error.

use aes::{
    Aes128,
    cipher::{BlockEncrypt, KeyInit as AesKeyInit, generic_array::GenericArray},
};
use aes_gcm::{
    Aes128Gcm, Nonce,
    aead::{Aead, Payload},
};
use tracing::debug;

use crate::{
    error::ProtectionError,
    keys::{IV_LEN, KeyPhase, KeyRegistry, TAG_LEN},
    types::PacketNumber,
};

/// Offset into the protected packet-number field at which the header
/// protection sample is drawn (assumes the 4-byte maximum pn encoding).
pub const SAMPLE_OFFSET: usize = 4;
/// Header-protection sample length.
pub const SAMPLE_LEN: usize = 16;
/// Header-protection mask length.
pub const MASK_LEN: usize = 5;

/// Nonce = IV XOR packet number, right-aligned and big-endian.
#[must_use]
pub fn derive_nonce(iv: &[u8; IV_LEN], packet_number: PacketNumber) -> [u8; IV_LEN] {
    let mut nonce = *iv;
    let pn = packet_number.to_be_bytes();
    for (n, p) in nonce[IV_LEN - pn.len()..].iter_mut().zip(pn) {
        *n ^= p;
    }
    nonce
}

/// AEAD protector over a [`KeyRegistry`].
pub struct PayloadProtector<'a> {
    keys: &'a KeyRegistry,
}

impl<'a> PayloadProtector<'a> {
    /// Protector reading keys from `keys`.
    #[must_use]
    pub fn new(keys: &'a KeyRegistry) -> Self {
        Self { keys }
    }

    /// Encrypt `plaintext` (given as a chain of blocks, flattened in
    /// order) under the encryption-direction keys for `phase`.
    ///
    /// Returns ciphertext with the tag appended. `max_ciphertext` is the
    /// caller's output budget and must be at least plaintext + tag.
    ///
    /// # Errors
    ///
    /// - `ProtectionError::KeyNotAvailable` before keys for `phase` exist
    /// - `ProtectionError::InsufficientCapacity` when the budget is short
    /// - `ProtectionError::AeadFailure` if the primitive rejects the input
    pub fn protect(
        &self,
        header_ad: &[u8],
        plaintext: &[&[u8]],
        packet_number: PacketNumber,
        phase: KeyPhase,
        max_ciphertext: usize,
    ) -> Result<Vec<u8>, ProtectionError> {
        if !self.keys.is_encryption_key_available(phase) {
            debug!(?phase, "encryption key not available");
            return Err(ProtectionError::KeyNotAvailable { direction: "encryption", phase });
        }

        let plain_len: usize = plaintext.iter().map(|b| b.len()).sum();
        let required = plain_len + self.keys.tag_len(phase);
        if max_ciphertext < required {
            return Err(ProtectionError::InsufficientCapacity {
                capacity: max_ciphertext,
                required,
            });
        }

        let mut msg = Vec::with_capacity(plain_len);
        for block in plaintext {
            msg.extend_from_slice(block);
        }

        let nonce = derive_nonce(self.keys.encryption_iv(phase), packet_number);
        let cipher = Aes128Gcm::new(self.keys.encryption_key(phase).into());
        cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: &msg, aad: header_ad })
            .map_err(|_| ProtectionError::AeadFailure)
    }

    /// Decrypt and verify `ciphertext` (tag included) under the
    /// decryption-direction keys for `phase`.
    ///
    /// On tag mismatch only the fact of failure is reported; callers must
    /// not log payload contents, and diagnostics are limited to a bounded
    /// prefix of the recovered plaintext via [`plaintext_preview`].
    ///
    /// # Errors
    ///
    /// - `ProtectionError::KeyNotAvailable` before keys for `phase` exist
    /// - `ProtectionError::AeadFailure` on tag mismatch or malformed input
    pub fn unprotect(
        &self,
        header_ad: &[u8],
        ciphertext: &[u8],
        packet_number: PacketNumber,
        phase: KeyPhase,
    ) -> Result<Vec<u8>, ProtectionError> {
        if !self.keys.is_decryption_key_available(phase) {
            debug!(?phase, "decryption key not available");
            return Err(ProtectionError::KeyNotAvailable { direction: "decryption", phase });
        }
        if ciphertext.len() < TAG_LEN {
            return Err(ProtectionError::AeadFailure);
        }

        let nonce = derive_nonce(self.keys.decryption_iv(phase), packet_number);
        let cipher = Aes128Gcm::new(self.keys.decryption_key(phase).into());
        cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad: header_ad })
            .map_err(|_| ProtectionError::AeadFailure)
    }
}

/// Bounded plaintext prefix for diagnostics. Never exposes more than 16
/// bytes regardless of the payload size.
#[must_use]
pub fn plaintext_preview(plain: &[u8]) -> &[u8] {
    &plain[..plain.len().min(16)]
}

/// AES-128-ECB header protection.
pub struct HeaderProtector<'a> {
    keys: &'a KeyRegistry,
}

impl<'a> HeaderProtector<'a> {
    /// Protector reading header-protection keys from `keys`.
    #[must_use]
    pub fn new(keys: &'a KeyRegistry) -> Self {
        Self { keys }
    }

    /// Compute the 5-byte mask for an outgoing packet from `sample`.
    ///
    /// # Errors
    ///
    /// - `ProtectionError::KeyNotAvailable` before keys for `phase` exist
    pub fn mask_for_encryption(
        &self,
        sample: &[u8; SAMPLE_LEN],
        phase: KeyPhase,
    ) -> Result<[u8; MASK_LEN], ProtectionError> {
        if !self.keys.is_encryption_key_available(phase) {
            return Err(ProtectionError::KeyNotAvailable { direction: "encryption", phase });
        }
        Ok(compute_mask(self.keys.encryption_key_for_hp(phase), sample))
    }

    /// Compute the 5-byte mask for an incoming packet from `sample`.
    ///
    /// # Errors
    ///
    /// - `ProtectionError::KeyNotAvailable` before keys for `phase` exist
    pub fn mask_for_decryption(
        &self,
        sample: &[u8; SAMPLE_LEN],
        phase: KeyPhase,
    ) -> Result<[u8; MASK_LEN], ProtectionError> {
        if !self.keys.is_decryption_key_available(phase) {
            return Err(ProtectionError::KeyNotAvailable { direction: "decryption", phase });
        }
        Ok(compute_mask(self.keys.decryption_key_for_hp(phase), sample))
    }

    /// Draw the sample for a packet whose packet-number field begins at
    /// `pn_offset` within `packet`.
    ///
    /// # Errors
    ///
    /// - `ProtectionError::SampleOutOfRange` when the packet is too short
    pub fn sample(packet: &[u8], pn_offset: usize) -> Result<[u8; SAMPLE_LEN], ProtectionError> {
        let start = pn_offset + SAMPLE_OFFSET;
        let bytes = packet
            .get(start..start + SAMPLE_LEN)
            .ok_or(ProtectionError::SampleOutOfRange)?;
        let mut sample = [0u8; SAMPLE_LEN];
        sample.copy_from_slice(bytes);
        Ok(sample)
    }
}

/// Apply a computed mask to the first byte and packet-number bytes of a
/// header. `long_header` selects how many first-byte bits are protected
/// (4 for long headers, 5 for short).
pub fn apply_mask(header: &mut [u8], pn_offset: usize, pn_len: usize, mask: &[u8; MASK_LEN], long_header: bool) {
    if let Some(first) = header.first_mut() {
        *first ^= mask[0] & if long_header { 0x0f } else { 0x1f };
    }
    for i in 0..pn_len.min(4) {
        if let Some(byte) = header.get_mut(pn_offset + i) {
            *byte ^= mask[1 + i];
        }
    }
}

fn compute_mask(hp_key: &[u8; 16], sample: &[u8; SAMPLE_LEN]) -> [u8; MASK_LEN] {
    let cipher = Aes128::new(GenericArray::from_slice(hp_key));
    let mut block = GenericArray::clone_from_slice(sample);
    cipher.encrypt_block(&mut block);
    let mut mask = [0u8; MASK_LEN];
    mask.copy_from_slice(&block[..MASK_LEN]);
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{keys::Context, types::ConnectionId};

    fn registry() -> KeyRegistry {
        let mut reg = KeyRegistry::new(Context::Server);
        reg.initialize_initial_keys(
            0x0000_0001,
            &ConnectionId::new(&[0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08]),
        );
        reg
    }

    #[test]
    fn nonce_xors_right_aligned() {
        let iv = [0u8; IV_LEN];
        let nonce = derive_nonce(&iv, 0x0102);
        assert_eq!(&nonce[..IV_LEN - 2], &[0u8; IV_LEN - 2]);
        assert_eq!(nonce[IV_LEN - 2], 0x01);
        assert_eq!(nonce[IV_LEN - 1], 0x02);
    }

    #[test]
    fn protect_unprotect_round_trip() {
        // Server-protected packet read back with the same registry seen
        // from the client side.
        let server = registry();
        let mut client = registry();
        client.set_context(Context::Client);

        let header = b"fake long header";
        let plaintext: &[&[u8]] = &[b"hello ", b"chained ", b"blocks"];

        let protector = PayloadProtector::new(&server);
        let ciphertext = protector
            .protect(header, plaintext, 7, KeyPhase::Initial, 1024)
            .unwrap();
        assert_eq!(ciphertext.len(), 20 + TAG_LEN);

        let unprotector = PayloadProtector::new(&client);
        let plain = unprotector.unprotect(header, &ciphertext, 7, KeyPhase::Initial).unwrap();
        assert_eq!(plain, b"hello chained blocks");
    }

    #[test]
    fn tampered_tag_rejected() {
        let server = registry();
        let mut client = registry();
        client.set_context(Context::Client);

        let protector = PayloadProtector::new(&server);
        let mut ciphertext = protector
            .protect(b"ad", &[b"payload"], 1, KeyPhase::Initial, 1024)
            .unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;

        let unprotector = PayloadProtector::new(&client);
        assert_eq!(
            unprotector.unprotect(b"ad", &ciphertext, 1, KeyPhase::Initial),
            Err(ProtectionError::AeadFailure)
        );
    }

    #[test]
    fn wrong_packet_number_rejected() {
        let server = registry();
        let mut client = registry();
        client.set_context(Context::Client);

        let ciphertext = PayloadProtector::new(&server)
            .protect(b"ad", &[b"payload"], 1, KeyPhase::Initial, 1024)
            .unwrap();
        assert_eq!(
            PayloadProtector::new(&client).unprotect(b"ad", &ciphertext, 2, KeyPhase::Initial),
            Err(ProtectionError::AeadFailure)
        );
    }

    #[test]
    fn missing_key_fails_closed() {
        let reg = KeyRegistry::new(Context::Server);
        let protector = PayloadProtector::new(&reg);
        assert!(matches!(
            protector.protect(b"ad", &[b"x"], 0, KeyPhase::Handshake, 1024),
            Err(ProtectionError::KeyNotAvailable { direction: "encryption", .. })
        ));
    }

    #[test]
    fn capacity_checked_up_front() {
        let reg = registry();
        let protector = PayloadProtector::new(&reg);
        assert!(matches!(
            protector.protect(b"ad", &[b"0123456789"], 0, KeyPhase::Initial, 10),
            Err(ProtectionError::InsufficientCapacity { required: 26, .. })
        ));
    }

    #[test]
    fn header_mask_depends_on_sample() {
        let reg = registry();
        let hp = HeaderProtector::new(&reg);
        let a = hp.mask_for_encryption(&[0u8; SAMPLE_LEN], KeyPhase::Initial).unwrap();
        let b = hp.mask_for_encryption(&[1u8; SAMPLE_LEN], KeyPhase::Initial).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn apply_mask_is_involutive() {
        let reg = registry();
        let hp = HeaderProtector::new(&reg);
        let mask = hp.mask_for_encryption(&[7u8; SAMPLE_LEN], KeyPhase::Initial).unwrap();

        let original: Vec<u8> = (0u8..16).collect();
        let mut header = original.clone();
        apply_mask(&mut header, 10, 2, &mask, true);
        assert_ne!(header, original);
        apply_mask(&mut header, 10, 2, &mask, true);
        assert_eq!(header, original);
    }

    #[test]
    fn preview_is_bounded() {
        let plain = vec![0xAA; 100];
        assert_eq!(plaintext_preview(&plain).len(), 16);
        assert_eq!(plaintext_preview(&plain[..4]).len(), 4);
    }
}
