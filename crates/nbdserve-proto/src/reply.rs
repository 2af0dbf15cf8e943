//! Transmission reply record, encoder, and pool.
//!
//! Reply headers are 16 bytes, big-endian:
//! `magic:u32 | err:u32 | handle:u64`. A successful READ reply carries
//! its payload immediately after the header.
//!
//! The record owns a single buffer holding header and payload
//! back-to-back, so the backend fills the payload region in place and
//! the whole message goes out in one write — no scatter-gather, no
//! interleaving with other replies.

use std::io;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::consts::{NBD_REPLY_HEADER_LEN, NBD_REPLY_MAGIC};

/// A reply to a single request.
#[derive(Debug)]
pub struct Reply {
    handle: u64,
    err: u32,
    /// Header + payload, contiguous.
    buf: Vec<u8>,
}

impl Reply {
    /// Create a reply with room for `payload_len` payload bytes.
    pub fn new(handle: u64, payload_len: usize) -> Self {
        Self {
            handle,
            err: 0,
            buf: vec![0u8; NBD_REPLY_HEADER_LEN + payload_len],
        }
    }

    /// The handle echoed back to the kernel.
    pub fn handle(&self) -> u64 {
        self.handle
    }

    /// Mark the reply as failed with a wire error number.
    pub fn set_error(&mut self, err: u32) {
        self.err = err;
    }

    /// The wire error number (0 on success).
    pub fn error(&self) -> u32 {
        self.err
    }

    /// The payload region, for the backend to fill in place.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[NBD_REPLY_HEADER_LEN..]
    }

    /// The payload region.
    pub fn payload(&self) -> &[u8] {
        &self.buf[NBD_REPLY_HEADER_LEN..]
    }

    /// Payload capacity of this record.
    pub fn payload_len(&self) -> usize {
        self.buf.len() - NBD_REPLY_HEADER_LEN
    }

    /// Serialize the reply onto the writer as one message.
    ///
    /// Seals the header into the owned buffer and emits it in a single
    /// `write_all`; the payload rides along only when the reply
    /// succeeded — the kernel stops reading at the header when `err`
    /// is nonzero.
    pub async fn send<W>(&mut self, w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.buf[0..4].copy_from_slice(&NBD_REPLY_MAGIC.to_be_bytes());
        self.buf[4..8].copy_from_slice(&self.err.to_be_bytes());
        self.buf[8..16].copy_from_slice(&self.handle.to_be_bytes());
        if self.err == 0 {
            w.write_all(&self.buf).await
        } else {
            w.write_all(&self.buf[..NBD_REPLY_HEADER_LEN]).await
        }
    }
}

/// Recycler for reply records, indexed by payload capacity so the
/// contiguous header+payload buffer is reused as-is.
pub struct ReplyPool {
    classes: DashMap<usize, Arc<Mutex<Vec<Reply>>>>,
}

impl ReplyPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            classes: DashMap::new(),
        }
    }

    fn class(&self, payload_len: usize) -> Arc<Mutex<Vec<Reply>>> {
        self.classes
            .entry(payload_len)
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone()
    }

    /// Get a reply record with the given payload capacity, reset for
    /// `handle`.
    pub fn get(&self, handle: u64, payload_len: usize) -> Reply {
        let class = self.class(payload_len);
        let recycled = class.lock().unwrap().pop();
        let mut reply = recycled.unwrap_or_else(|| Reply::new(0, payload_len));
        reply.handle = handle;
        reply.err = 0;
        reply
    }

    /// Return a reply record to the free list for its payload size.
    pub fn put(&self, reply: Reply) {
        let class = self.class(reply.payload_len());
        class.lock().unwrap().push(reply);
    }
}

impl Default for ReplyPool {
    fn default() -> Self {
        Self::new()
    }
}
