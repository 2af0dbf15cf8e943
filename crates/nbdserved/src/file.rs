//! File-backed block device.
//!
//! Serves a regular file (or block device node) as the backing store.
//! Reads and writes go through positioned I/O on a shared descriptor;
//! flush maps to fsync and trim punches holes with fallocate. All
//! filesystem calls run inside `tokio::task::spawn_blocking` to keep
//! the async runtime responsive.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use nbdserve_core::backend::{BlockBackend, Capabilities};

fn join_blocking<T>(res: Result<io::Result<T>, tokio::task::JoinError>) -> io::Result<T> {
    match res {
        Ok(inner) => inner,
        Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
    }
}

/// Block device backed by a file.
pub struct FileBackend {
    file: Arc<File>,
    read_only: bool,
    /// Latched once the filesystem rejects hole punching; trim becomes
    /// a no-op from then on.
    punch_hole_unsupported: AtomicBool,
}

impl FileBackend {
    /// Open `path` and return the backend together with the file's
    /// size in bytes. The caller rounds the size down to a block
    /// multiple before handing it to the server.
    pub fn open(path: &Path, read_only: bool) -> io::Result<(Self, u64)> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        let size = file.metadata()?.len();
        Ok((
            Self {
                file: Arc::new(file),
                read_only,
                punch_hole_unsupported: AtomicBool::new(false),
            },
            size,
        ))
    }
}

#[async_trait]
impl BlockBackend for FileBackend {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let file = self.file.clone();
        let len = buf.len();
        let data = join_blocking(
            tokio::task::spawn_blocking(move || {
                let mut data = vec![0u8; len];
                file.read_exact_at(&mut data, offset)?;
                Ok(data)
            })
            .await,
        )?;
        buf.copy_from_slice(&data);
        Ok(len)
    }

    async fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize> {
        let file = self.file.clone();
        let owned = data.to_vec();
        let len = owned.len();
        join_blocking(
            tokio::task::spawn_blocking(move || {
                file.write_all_at(&owned, offset)?;
                Ok(())
            })
            .await,
        )?;
        Ok(len)
    }

    async fn close(&self) -> io::Result<()> {
        if self.read_only {
            return Ok(());
        }
        let file = self.file.clone();
        join_blocking(tokio::task::spawn_blocking(move || file.sync_all()).await)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            read_only: self.read_only,
            flush: true,
            trim: true,
        }
    }

    async fn flush(&self) -> io::Result<()> {
        let file = self.file.clone();
        join_blocking(tokio::task::spawn_blocking(move || file.sync_all()).await)
    }

    async fn trim(&self, offset: u64, length: u32) -> io::Result<()> {
        if self.punch_hole_unsupported.load(Ordering::Relaxed) {
            return Ok(());
        }
        debug!("trim offset={} length={}", offset, length);

        let file = self.file.clone();
        let result = join_blocking(
            tokio::task::spawn_blocking(move || {
                // SAFETY: fallocate takes the descriptor and plain
                // integers; no memory is passed to the kernel.
                let rc = unsafe {
                    libc::fallocate(
                        file.as_raw_fd(),
                        libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                        offset as libc::off_t,
                        length as libc::off_t,
                    )
                };
                if rc < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            })
            .await,
        );

        match result {
            Err(e)
                if matches!(
                    e.raw_os_error(),
                    Some(libc::ENOSYS) | Some(libc::EOPNOTSUPP)
                ) =>
            {
                if !self.punch_hole_unsupported.swap(true, Ordering::Relaxed) {
                    warn!("fallocate(PUNCH_HOLE) not supported on this filesystem; trim disabled");
                }
                Ok(())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_file(len: usize) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut f = File::create(&path).unwrap();
        f.write_all(&vec![0u8; len]).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn read_write_round_trip() {
        let (_dir, path) = scratch_file(4096);
        let (backend, size) = FileBackend::open(&path, false).unwrap();
        assert_eq!(size, 4096);

        let n = backend.write_at(&[1, 2, 3, 4], 512).await.unwrap();
        assert_eq!(n, 4);

        let mut buf = [0u8; 4];
        let n = backend.read_at(&mut buf, 512).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn read_to_exact_end_of_file_succeeds() {
        let (_dir, path) = scratch_file(1024);
        let (backend, _) = FileBackend::open(&path, false).unwrap();

        let mut buf = [0u8; 512];
        assert_eq!(backend.read_at(&mut buf, 512).await.unwrap(), 512);

        // Past the end is an error, not a silent short read.
        assert!(backend.read_at(&mut buf, 768).await.is_err());
    }

    #[tokio::test]
    async fn flush_and_trim_advertised() {
        let (_dir, path) = scratch_file(8192);
        let (backend, _) = FileBackend::open(&path, false).unwrap();
        let caps = backend.capabilities();
        assert!(caps.flush);
        assert!(caps.trim);
        assert!(!caps.read_only);

        backend.flush().await.unwrap();
        // tmpfs may or may not support hole punching; either way trim
        // must not fail (the latch eats unsupported filesystems).
        backend.trim(0, 4096).await.unwrap();
        backend.trim(4096, 4096).await.unwrap();
    }

    #[tokio::test]
    async fn read_only_flag_is_reported() {
        let (_dir, path) = scratch_file(1024);
        let (backend, _) = FileBackend::open(&path, true).unwrap();
        assert!(backend.capabilities().read_only);
    }
}
