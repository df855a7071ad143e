//! Error types for the courier protocol client

use thiserror::Error;

/// Main error type for courier operations
#[derive(Error, Debug)]
pub enum CourierError {
    /// Secure randomness could not be obtained from the OS
    #[error("randomness unavailable: {0}")]
    Randomness(String),

    /// Cryptographic operation failed (key derivation, point parsing, AEAD seal)
    #[error("crypto error: {0}")]
    Crypto(String),

    /// AEAD open failed (wrong key, tampered ciphertext, or mismatched
    /// associated data). Listing code treats this as "skip the item";
    /// single-item operations propagate it.
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// A signature did not verify or could not be recovered
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// A key bundle from the network is missing a pre-key signature
    #[error("key bundle has no pre-key signature")]
    UnsignedPreKey,

    /// Attempted to open a conversation with our own address
    #[error("recipient address is the sender's own address")]
    RecipientIsSender,

    /// The peer has never published a contact bundle
    #[error("recipient {0} is not registered on the network")]
    RecipientNotOnNetwork(String),

    /// A sealed payload names neither our address as sender nor recipient.
    /// Distinct from [`CourierError::DecryptionFailed`] so that tampering
    /// is never masked as mere misaddressing.
    #[error("payload is not addressed to this client")]
    NotAddressed,

    /// A network call exceeded the client's timeout; retryable
    #[error("transport timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// More query requests than the transport's batch limit allows
    #[error("batch of {0} query requests exceeds the limit of {1}")]
    BatchTooLarge(usize, usize),

    /// Error reported by the transport collaborator
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed wire bytes (bundle, envelope payload, invitation)
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Content codec could not encode or decode the payload
    #[error("codec error: {0}")]
    Codec(String),
}

/// Result type alias using CourierError
pub type Result<T> = std::result::Result<T, CourierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CourierError::RecipientNotOnNetwork("0xabc".to_string());
        assert_eq!(
            format!("{}", err),
            "recipient 0xabc is not registered on the network"
        );
    }

    #[test]
    fn test_error_from_postcard() {
        let bad: std::result::Result<u64, _> = postcard::from_bytes(&[]);
        let err: CourierError = bad.unwrap_err().into();
        assert!(matches!(err, CourierError::Serialization(_)));
    }
}
