//! # nbdserve-core
//!
//! The request/reply engine and kernel binders behind an NBD userspace
//! server. A [`NbdServer`] owns one end of a socketpair, hands the
//! other end to the kernel's `nbd` driver (legacy ioctls or generic
//! netlink), and executes the kernel's read/write/flush/trim requests
//! against a pluggable [`BlockBackend`].

pub mod backend;
pub mod bytepool;
mod engine;
pub mod error;
mod ioctl;
mod netlink;
pub mod limiter;
pub mod server;

// Re-export commonly used types at the crate root
pub use backend::{BlockBackend, Capabilities};
pub use error::{ConfigError, ServerError};
pub use server::{DeviceOptions, NbdServer};
