//! Pluggable storage backend abstraction.
//!
//! A backend turns byte-addressed reads and writes into whatever
//! substrate it likes — a file, a null sink, a remote object store.
//! The server probes [`BlockBackend::capabilities`] once at
//! construction and advertises the result to the kernel as
//! transmission flags; the engine consults only that probed
//! descriptor when dispatching, never the concrete backend type.

use std::io;

use async_trait::async_trait;

/// Optional features a backend advertises at construction time.
///
/// The kernel honors advertised flags, so a backend reporting `flush`
/// or `trim` here must implement the corresponding method; one that
/// does not report them will never receive the command from a
/// well-behaved kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    /// The device is read-only; the kernel rejects writes itself.
    pub read_only: bool,
    /// `flush` is implemented; advertises `SEND_FLUSH`.
    pub flush: bool,
    /// `trim` is implemented; advertises `SEND_TRIM`.
    pub trim: bool,
}

/// A block storage backend behind an NBD device.
///
/// Offsets and lengths arrive block-aligned (the kernel enforces the
/// device's block size); implementations need not re-check alignment.
#[async_trait]
pub trait BlockBackend: Send + Sync + 'static {
    /// Fill `buf` from the device at `offset`, returning the byte
    /// count.
    ///
    /// Reaching end-of-device after filling the whole buffer is
    /// success, not an error; only a short fill is a failure. The
    /// engine treats any count other than `buf.len()` as an I/O error.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Write `data` to the device at `offset`, returning the byte
    /// count. A count other than `data.len()` is treated as an I/O
    /// error.
    async fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize>;

    /// Release the backend's resources. Called best-effort on
    /// teardown, after the engine has drained.
    async fn close(&self) -> io::Result<()> {
        Ok(())
    }

    /// The features this backend supports. Probed once at server
    /// construction.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Persist all completed writes. Only called when `capabilities`
    /// reported `flush`.
    async fn flush(&self) -> io::Result<()> {
        Err(unsupported())
    }

    /// Discard a byte range. Only called when `capabilities` reported
    /// `trim`. Advisory — a no-op implementation is valid.
    async fn trim(&self, offset: u64, length: u32) -> io::Result<()> {
        let _ = (offset, length);
        Err(unsupported())
    }
}

pub(crate) fn unsupported() -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, "operation not supported by backend")
}
