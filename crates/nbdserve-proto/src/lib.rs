//! # nbdserve-proto
//!
//! Wire-level types for the NBD kernel transmission protocol.
//!
//! This crate defines the post-handshake framing spoken between the
//! Linux `nbd` driver and a userspace server: the 28-byte request
//! header, the 16-byte simple reply header, the command and flag
//! constants, and the pooled request/reply records the I/O engine
//! recycles on its hot path. The negotiation-phase constants (magics,
//! option ids) are defined here for completeness, but no userspace
//! negotiation exists in this server — the kernel is handed an
//! already-configured socket.

pub mod buffer;
pub mod consts;
pub mod defaults;
pub mod error;
pub mod reply;
pub mod request;

// Re-export commonly used types at the crate root
pub use buffer::BufferPool;
pub use error::{ProtoResult, ProtocolError};
pub use reply::{Reply, ReplyPool};
pub use request::{Request, RequestPool};
