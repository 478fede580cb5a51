//! Error types for the mongogate data plane.
//!
//! `DecodeError` covers wire-level failures: BSON structure violations and
//! message framing violations. Every variant is fatal for the connection's
//! decode stream; the proxy filter counts it once and stops sniffing.
//! Framing "not enough bytes yet" is not an error; the message decoder
//! simply returns to the caller without consuming.
//!
//! `ConfigError` covers construction-time configuration failures. These are
//! surfaced to the caller building the filter and are never recoverable at
//! runtime.

use thiserror::Error;

/// Errors raised while decoding BSON documents or wire-protocol messages.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// A fixed-size field or length-prefixed region extends past the end of
    /// the message body.
    #[error("short buffer decoding {context}: need {needed} bytes, have {available}")]
    ShortBuffer {
        /// What was being decoded when the buffer ran out.
        context: &'static str,
        /// Bytes required to make progress.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// An element type byte that is not part of the BSON specification.
    #[error("invalid BSON element type {type_byte:#04x} for key {key:?}")]
    BadType {
        /// Key of the offending element.
        key: String,
        /// The unrecognized type byte.
        type_byte: u8,
    },

    /// A cstring field with no NUL terminator before the end of the buffer.
    #[error("unterminated cstring while decoding {context}")]
    BadString {
        /// What was being decoded when the terminator went missing.
        context: &'static str,
    },

    /// A document length prefix that disagrees with its actual contents.
    #[error("BSON document size {size} does not match its encoded contents")]
    BadSize {
        /// The length prefix read off the wire.
        size: i32,
    },

    /// A message header op-code that the codec does not recognize.
    #[error("unknown message op code {op_code}")]
    UnknownOpCode {
        /// The op-code read off the wire.
        op_code: i32,
    },

    /// A message length field smaller than the fixed 16-byte header.
    #[error("message length {length} is shorter than the 16 byte header")]
    RuntMessage {
        /// The length field read off the wire.
        length: i32,
    },

    /// A message length field above the configured cap.
    #[error("message length {length} exceeds the configured cap of {max} bytes")]
    OversizedMessage {
        /// The length field read off the wire.
        length: i64,
        /// The configured maximum message size in bytes.
        max: usize,
    },

    /// A message body with a structural violation not covered by a more
    /// specific variant (missing required document, count mismatch, bytes
    /// left over after the last field).
    #[error("invalid message body: {0}")]
    InvalidMessage(&'static str),
}

/// Errors raised while building configuration objects.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The supplied JSON does not match the expected schema.
    #[error("invalid configuration: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// A fault delay percent outside the 0..=100 range.
    #[error("fault delay percent {0} is out of range (0..=100)")]
    PercentOutOfRange(u32),
}
