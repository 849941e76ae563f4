//! Error types for the QUIC layer.
//!
//! Codec errors are recoverable at the call site (a frame that does not fit
//! is retried smaller, an unknown type byte is skipped); protection errors
//! fail the packet closed. Neither is ever fatal to the process.

use thiserror::Error;

use crate::types::EncryptionLevel;

/// Errors from frame construction and serialization.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// A varint field exceeded the 62-bit encodable range
    #[error("value {0} exceeds the variable-length integer maximum")]
    ValueTooLarge(u64),

    /// Frame bytes ended before all declared fields
    #[error("frame truncated: needed {expected} bytes, had {actual}")]
    Truncated {
        /// Bytes the declared fields required
        expected: usize,
        /// Bytes actually present
        actual: usize,
    },

    /// A split point outside the splittable range was requested
    #[error("cannot split frame of {size} bytes at {at}")]
    BadSplitPoint {
        /// Requested split point
        at: usize,
        /// Total frame size
        size: usize,
    },

    /// Split requested on a frame type that does not support it
    #[error("frame type does not support splitting")]
    NotSplittable,
}

/// Errors from packet payload and header protection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtectionError {
    /// No key material installed for the phase yet
    #[error("no key available for {direction} in phase {phase:?}")]
    KeyNotAvailable {
        /// "encryption" or "decryption"
        direction: &'static str,
        /// Key phase that was consulted
        phase: crate::keys::KeyPhase,
    },

    /// The AEAD primitive rejected the operation (bad tag on unprotect)
    #[error("AEAD operation failed")]
    AeadFailure,

    /// Output buffer cannot hold ciphertext plus tag
    #[error("output capacity {capacity} below required {required}")]
    InsufficientCapacity {
        /// Bytes available
        capacity: usize,
        /// Bytes required (plaintext + tag)
        required: usize,
    },

    /// Header-protection sample could not be drawn from the packet
    #[error("packet too short to draw a header-protection sample")]
    SampleOutOfRange,
}

/// Errors from packet emission.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Payload protection failed; the packet is dropped
    #[error("packet protection failed at {level:?}: {source}")]
    ProtectionFailed {
        /// Encryption level of the dropped packet
        level: EncryptionLevel,
        /// Underlying protection error
        source: ProtectionError,
    },

    /// Header serialization failed
    #[error("header serialization failed: {0}")]
    Header(#[from] FrameError),
}
