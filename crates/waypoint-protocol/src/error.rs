//! Error types for the protocol layer.

/// Errors raised while encoding, decoding or validating packets.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed.
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed: malformed bytes, missing fields, or an
    /// unknown payload tag.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The packet decoded but breaks a protocol rule.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),
}
