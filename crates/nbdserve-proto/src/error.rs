//! Transmission framing errors.
//!
//! Every error in this module is terminal for the session: once the
//! byte stream from the kernel is out of step there is no way to
//! resynchronize on the next request header, so the engine shuts down
//! and detaches the device.

use thiserror::Error;

/// Failure while decoding a request or encoding a reply.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The 4 magic bytes at the head of a request did not match
    /// `NBD_REQUEST_MAGIC`. The stream is unrecoverable.
    #[error("unexpected request magic {found:#010x}")]
    BadMagic {
        /// The value actually read off the wire.
        found: u32,
    },

    /// Short read, socket EOF, or any other transport failure.
    #[error("transmission stream error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for framing operations.
pub type ProtoResult<T> = Result<T, ProtocolError>;
