//! Transmission request record, decoder, and pool.
//!
//! Request headers are 28 bytes, big-endian:
//! `magic:u32 | flags:u16 | cmd:u16 | handle:u64 | offset:u64 | length:u32`.
//! A WRITE carries exactly `length` payload bytes after the header; no
//! other command has a payload.

use std::fmt;
use std::sync::Mutex;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::buffer::BufferPool;
use crate::consts::{
    NBD_CMD_CACHE, NBD_CMD_DISC, NBD_CMD_FLUSH, NBD_CMD_READ, NBD_CMD_TRIM, NBD_CMD_WRITE,
    NBD_CMD_WRITE_ZEROES, NBD_REQUEST_HEADER_LEN, NBD_REQUEST_MAGIC,
};
use crate::error::{ProtoResult, ProtocolError};

/// A single request from the kernel.
///
/// Created by the read loop from the pool, consumed exactly once by a
/// worker, then returned to the pool (payload buffer included).
#[derive(Debug, Default)]
pub struct Request {
    pub flags: u16,
    pub cmd: u16,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
    payload: Option<Vec<u8>>,
}

impl Request {
    /// The WRITE payload, empty for every other command.
    pub fn payload(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or(&[])
    }

    /// Attach a payload, setting `length` to match. Used by in-process
    /// clients and tests; the read loop attaches pooled payloads
    /// directly.
    pub fn set_payload(&mut self, data: Vec<u8>) {
        self.length = data.len() as u32;
        self.payload = Some(data);
    }

    /// Encode the request as it appears on the wire: 28-byte header
    /// followed by the payload, if any.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NBD_REQUEST_HEADER_LEN + self.payload().len());
        out.extend_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.extend_from_slice(&self.cmd.to_be_bytes());
        out.extend_from_slice(&self.handle.to_be_bytes());
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.extend_from_slice(&self.length.to_be_bytes());
        out.extend_from_slice(self.payload());
        out
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cmd {
            NBD_CMD_READ => write!(f, "Read(offset: {}, length: {})", self.offset, self.length),
            NBD_CMD_WRITE => write!(f, "Write(offset: {}, length: {})", self.offset, self.length),
            NBD_CMD_DISC => write!(f, "Disconnect()"),
            NBD_CMD_FLUSH => write!(f, "Flush()"),
            NBD_CMD_TRIM => write!(f, "Trim(offset: {}, length: {})", self.offset, self.length),
            NBD_CMD_CACHE => write!(f, "Cache()"),
            NBD_CMD_WRITE_ZEROES => write!(f, "WriteZeroes()"),
            other => write!(f, "Unknown(cmd: {})", other),
        }
    }
}

/// Recycler for request records and their payload buffers.
///
/// Payload buffers are size-indexed so a queue issuing mixed lengths
/// still coalesces at the common ones.
pub struct RequestPool {
    records: Mutex<Vec<Request>>,
    payloads: BufferPool,
}

impl RequestPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            payloads: BufferPool::new(),
        }
    }

    /// Read the next request off the stream into a pooled record.
    ///
    /// Reads exactly one 28-byte header, verifies the magic, and for a
    /// WRITE reads exactly `length` further payload bytes into a pooled
    /// buffer. On any failure the record (and any partially acquired
    /// payload buffer) goes back to the pool and the error surfaces;
    /// the caller must treat every error as terminal for the stream.
    pub async fn recv<R>(&self, r: &mut R) -> ProtoResult<Request>
    where
        R: AsyncRead + Unpin,
    {
        let mut req = self.records.lock().unwrap().pop().unwrap_or_default();
        match self.fill(r, &mut req).await {
            Ok(()) => Ok(req),
            Err(e) => {
                self.put(req);
                Err(e)
            }
        }
    }

    async fn fill<R>(&self, r: &mut R, req: &mut Request) -> ProtoResult<()>
    where
        R: AsyncRead + Unpin,
    {
        let magic = r.read_u32().await?;
        if magic != NBD_REQUEST_MAGIC {
            return Err(ProtocolError::BadMagic { found: magic });
        }
        req.flags = r.read_u16().await?;
        req.cmd = r.read_u16().await?;
        req.handle = r.read_u64().await?;
        req.offset = r.read_u64().await?;
        req.length = r.read_u32().await?;
        req.payload = None;

        if req.cmd == NBD_CMD_WRITE {
            let mut data = self.payloads.get(req.length as usize);
            if let Err(e) = r.read_exact(&mut data).await {
                self.payloads.put(data);
                return Err(e.into());
            }
            req.payload = Some(data);
        }
        Ok(())
    }

    /// Return a request to the pool, recycling its payload buffer.
    pub fn put(&self, mut req: Request) {
        if let Some(data) = req.payload.take() {
            self.payloads.put(data);
        }
        self.records.lock().unwrap().push(req);
    }
}

impl Default for RequestPool {
    fn default() -> Self {
        Self::new()
    }
}
