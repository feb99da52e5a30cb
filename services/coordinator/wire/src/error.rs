//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Incomplete frame (need more data)
    #[error("incomplete frame: needed {needed} bytes, {available} available")]
    Incomplete {
        /// Bytes required by the field being decoded
        needed: usize,
        /// Bytes left in the buffer
        available: usize,
    },

    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Unknown frame type
    #[error("unknown frame type {0}")]
    Type(u8),

    /// Unknown command identifier
    #[error("unknown command {0:#04x}")]
    Command(u8),

    /// Unknown status or enumerated code
    #[error("unknown code {0:#04x}")]
    Code(u8),

    /// Addressing mode that cannot be represented
    #[error("invalid addressing mode {0}")]
    AddressMode(u8),

    /// Feature recognized but not supported by this coordinator
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Message integrity check failed during decryption
    #[error("MIC verification failed")]
    Mic,

    /// Security material unavailable or invalid
    #[error("security error: {0}")]
    Security(&'static str),

    /// Malformed frame structure
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

/// Ensure `buf` holds at least `needed` more bytes.
pub(crate) fn ensure(buf: &impl bytes::Buf, needed: usize) -> Result<(), WireError> {
    if buf.remaining() < needed {
        Err(WireError::Incomplete {
            needed,
            available: buf.remaining(),
        })
    } else {
        Ok(())
    }
}
