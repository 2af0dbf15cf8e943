//! Legacy ioctl attachment to /dev/nbdX.
//!
//! The historic control path: hand the kernel one end of a socketpair
//! with SET_SOCK, configure geometry and flags, then block in DO_IT
//! until the device is disconnected. DISCONNECT (from any thread) is
//! the shutdown entry point; teardown is CLEAR_SOCK followed by
//! closing the device descriptor, both best-effort.
//!
//! The NBD ioctls take a plain integer argument (or none), so the raw
//! 0xab00-series request codes go straight to `libc::ioctl`.

use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Mutex;

use tracing::warn;

use nbdserve_proto::consts::{
    NBD_CLEAR_SOCK, NBD_DISCONNECT, NBD_DO_IT, NBD_SET_BLKSIZE, NBD_SET_FLAGS,
    NBD_SET_SIZE_BLOCKS, NBD_SET_SOCK, NBD_SET_TIMEOUT,
};

fn nbd_ioctl(fd: RawFd, request: u64, arg: libc::c_ulong) -> io::Result<()> {
    // SAFETY: every NBD ioctl takes either no argument or a plain
    // integer, never a pointer, so there is no memory for the kernel
    // to scribble on.
    let rc = unsafe { libc::ioctl(fd, request as libc::c_ulong, arg) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Owns the open device node and issues the control ioctls.
///
/// The descriptor is closed at the end of the session via
/// [`close`](Self::close); control calls after that fail with
/// `NotConnected`. DO_IT blocks in the kernel for the whole session,
/// so the lock only guards the descriptor slot — each call copies the
/// fd out and issues the ioctl unlocked, letting DISCONNECT land while
/// DO_IT is parked.
pub(crate) struct IoctlBinder {
    dev: Mutex<Option<File>>,
}

impl IoctlBinder {
    /// Open /dev/nbdX read-write.
    pub(crate) fn open(path: &Path) -> io::Result<Self> {
        let dev = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Self {
            dev: Mutex::new(Some(dev)),
        })
    }

    fn fd(&self) -> io::Result<RawFd> {
        match self.dev.lock().unwrap().as_ref() {
            Some(dev) => Ok(dev.as_raw_fd()),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "device already closed",
            )),
        }
    }

    /// Bind the kernel end of the socketpair and set geometry and
    /// transmission flags, in the order the driver expects.
    pub(crate) fn configure(
        &self,
        sock: RawFd,
        block_size: u32,
        size_blocks: u64,
        flags: u16,
    ) -> io::Result<()> {
        let fd = self.fd()?;
        nbd_ioctl(fd, NBD_SET_SOCK, sock as libc::c_ulong)?;
        nbd_ioctl(fd, NBD_SET_BLKSIZE, block_size as libc::c_ulong)?;
        nbd_ioctl(fd, NBD_SET_SIZE_BLOCKS, size_blocks as libc::c_ulong)?;
        if flags != 0 {
            nbd_ioctl(fd, NBD_SET_FLAGS, flags as libc::c_ulong)?;
        }
        Ok(())
    }

    /// Block in the kernel until the device is disconnected. Must run
    /// on a blocking-capable thread.
    pub(crate) fn do_it(&self) -> io::Result<()> {
        nbd_ioctl(self.fd()?, NBD_DO_IT, 0)
    }

    /// Ask the kernel to disconnect the device. Unblocks `do_it`.
    pub(crate) fn disconnect(&self) -> io::Result<()> {
        nbd_ioctl(self.fd()?, NBD_DISCONNECT, 0)
    }

    /// Drop the kernel's socket reference. Best-effort teardown.
    pub(crate) fn clear_sock(&self) {
        let fd = match self.fd() {
            Ok(fd) => fd,
            Err(_) => return,
        };
        if let Err(e) = nbd_ioctl(fd, NBD_CLEAR_SOCK, 0) {
            warn!("CLEAR_SOCK failed: {}", e);
        }
    }

    /// Close the device descriptor, ending the session's hold on
    /// /dev/nbdX. Later control calls fail with `NotConnected`.
    pub(crate) fn close(&self) {
        self.dev.lock().unwrap().take();
    }

    /// Set the per-request kernel timeout, in seconds. The server
    /// never calls this — the driver's own default handling is kept —
    /// but the control surface is complete for embedders.
    #[allow(dead_code)]
    pub(crate) fn set_timeout(&self, seconds: u64) -> io::Result<()> {
        nbd_ioctl(self.fd()?, NBD_SET_TIMEOUT, seconds as libc::c_ulong)
    }
}
