//! Null block device.
//!
//! Reads return zeros, writes vanish. Useful for measuring the engine
//! and kernel path without a storage substrate behind them.

use std::io;

use async_trait::async_trait;

use nbdserve_core::backend::BlockBackend;

/// The discard-everything backend.
pub struct NullBackend;

#[async_trait]
impl BlockBackend for NullBackend {
    async fn read_at(&self, buf: &mut [u8], _offset: u64) -> io::Result<usize> {
        buf.fill(0);
        Ok(buf.len())
    }

    async fn write_at(&self, data: &[u8], _offset: u64) -> io::Result<usize> {
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_zeros_swallows_writes() {
        let backend = NullBackend;
        let mut buf = [0xFFu8; 64];
        assert_eq!(backend.read_at(&mut buf, 1 << 30).await.unwrap(), 64);
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(backend.write_at(&[1, 2, 3], 0).await.unwrap(), 3);
    }

    #[test]
    fn advertises_no_optional_capabilities() {
        let caps = NullBackend.capabilities();
        assert!(!caps.flush);
        assert!(!caps.trim);
        assert!(!caps.read_only);
    }
}
