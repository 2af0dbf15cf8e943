//! Server-level error types.

use nbdserve_proto::error::ProtocolError;
use thiserror::Error;

/// Rejection of server options at construction time. The server never
/// starts with invalid options.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Block size outside `[512, page_size]`.
    #[error("block size must be between 512 and {page_size}, got {got}")]
    BlockSizeRange { got: u32, page_size: u32 },

    /// Block size not a power of two.
    #[error("block size must be a power of two, got {0}")]
    BlockSizeAlignment(u32),

    /// Device size zero or not a multiple of the block size.
    #[error("device size must be a positive multiple of the block size")]
    SizeAlignment,

    /// Concurrent-ops outside `[1, 128]`.
    #[error("concurrent ops must be between 1 and {max}, got {got}")]
    ConcurrentOpsRange { got: u32, max: u32 },

    /// The block count does not fit the host's pointer width.
    #[error("device size {size} with block size {block_size} exceeds the addressable block count")]
    BlockCountOverflow { size: u64, block_size: u32 },
}

/// Failure while attaching, running, or detaching a server session.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Invalid options; the server never starts.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Opening or configuring the device via ioctl failed.
    #[error("device attach failed: {0}")]
    Attach(#[source] std::io::Error),

    /// The kernel-side wait (DO_IT) or disconnect failed.
    #[error("device control failed: {0}")]
    Device(#[source] std::io::Error),

    /// Generic-netlink attach/detach failed.
    #[error("netlink: {0}")]
    Netlink(String),

    /// The transmission stream broke on the request path.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The transmission stream broke on the reply path.
    #[error("reply write failed: {0}")]
    ReplyWrite(#[source] std::io::Error),

    /// Socketpair or other local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
