//! The request/reply engine.
//!
//! One reader task pulls request headers off the socket in kernel
//! order and feeds a bounded channel; N workers execute requests
//! against the backend in parallel; a mutex around the write half
//! keeps each reply's header and payload contiguous on the wire.
//! Replies may complete out of order — the kernel matches them by
//! handle — so the writer lock enforces message atomicity only, never
//! FIFO.
//!
//! Backend failures are per-request: they come back to the kernel as
//! `EIO` and the engine keeps running. Transport failures (a broken
//! decode, a failed reply write) are terminal: they raise the shared
//! cancellation signal, the fatal channel tells the supervisor to
//! detach the device, and the workers drain out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error, warn};

use nbdserve_proto::consts::{
    NBD_CMD_DISC, NBD_CMD_FLUSH, NBD_CMD_READ, NBD_CMD_TRIM, NBD_CMD_WRITE, NBD_EIO,
};
use nbdserve_proto::defaults::READ_BUFFER_SIZE;
use nbdserve_proto::error::ProtocolError;
use nbdserve_proto::reply::{Reply, ReplyPool};
use nbdserve_proto::request::{Request, RequestPool};

use crate::backend::{unsupported, BlockBackend, Capabilities};

/// Terminal engine failure.
#[derive(Debug, Error)]
pub(crate) enum EngineError {
    #[error(transparent)]
    Decode(#[from] ProtocolError),

    #[error("reply write failed: {0}")]
    ReplyWrite(#[source] std::io::Error),

    /// A sibling worker hit a fatal error; this worker exited at its
    /// next channel receive.
    #[error("engine cancelled")]
    Cancelled,
}

/// Shared flag raised on fatal errors, observed by every worker at its
/// channel receive.
#[derive(Default)]
struct CancelSignal {
    fired: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    fn fire(&self) {
        self.fired.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    async fn fired_wait(&self) {
        loop {
            if self.is_fired() {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_fired() {
                return;
            }
            notified.await;
        }
    }
}

type SharedReceiver = Arc<Mutex<mpsc::Receiver<Request>>>;
type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// The I/O pipeline for one device session.
pub(crate) struct IoEngine {
    backend: Arc<dyn BlockBackend>,
    caps: Capabilities,
    workers: usize,
    requests: RequestPool,
    replies: ReplyPool,
}

impl IoEngine {
    pub(crate) fn new(backend: Arc<dyn BlockBackend>, caps: Capabilities, workers: usize) -> Self {
        Self {
            backend,
            caps,
            workers,
            requests: RequestPool::new(),
            replies: ReplyPool::new(),
        }
    }

    /// Run the session to completion.
    ///
    /// Returns `Ok(())` on a clean disconnect (the kernel sent DISC).
    /// A send on `fatal` asks the supervisor to detach the device; it
    /// fires on decode errors and reply-write errors.
    pub(crate) async fn run(
        self: Arc<Self>,
        stream: UnixStream,
        fatal: mpsc::Sender<()>,
    ) -> Result<(), EngineError> {
        let (read_half, write_half) = stream.into_split();
        let writer: SharedWriter = Arc::new(Mutex::new(write_half));
        let cancel = Arc::new(CancelSignal::default());
        let (tx, rx) = mpsc::channel::<Request>(self.workers);
        let rx: SharedReceiver = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            handles.push(tokio::spawn(worker_loop(
                self.clone(),
                rx.clone(),
                writer.clone(),
                cancel.clone(),
                fatal.clone(),
            )));
        }

        // Reader: one request at a time, in kernel-issue order. The
        // bounded send is the backpressure that caps in-flight work.
        let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, read_half);
        let mut decode_err = None;
        loop {
            match self.requests.recv(&mut reader).await {
                Err(e) => {
                    decode_err = Some(e);
                    break;
                }
                Ok(req) => {
                    if req.cmd == NBD_CMD_DISC {
                        // The kernel does not expect a reply to DISC.
                        debug!("disconnect requested by kernel");
                        self.requests.put(req);
                        break;
                    }
                    if tx.send(req).await.is_err() {
                        break;
                    }
                }
            }
        }
        drop(tx);

        if decode_err.is_some() {
            // The stream is unrecoverable; have the supervisor detach
            // the device so the kernel-side wait unwinds. Workers
            // still drain and reply to everything already accepted —
            // only a reply-write failure suppresses further replies.
            let _ = fatal.try_send(());
        }

        let mut fatal_err = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) | Ok(Err(EngineError::Cancelled)) => {}
                Ok(Err(e)) => {
                    if fatal_err.is_none() {
                        fatal_err = Some(e);
                    }
                }
                Err(e) => error!("worker task failed: {}", e),
            }
        }

        match (decode_err, fatal_err) {
            (Some(e), _) => {
                error!("transmission stream error: {}", e);
                Err(e.into())
            }
            (None, Some(e)) => Err(e),
            (None, None) => Ok(()),
        }
    }

    /// Execute one request against the backend, filling `reply`.
    ///
    /// Never fails the engine: backend and unsupported-command errors
    /// become `EIO` on the reply and a log line.
    async fn dispatch(&self, req: &Request, reply: &mut Reply) {
        let result = match req.cmd {
            NBD_CMD_READ => self.do_read(req, reply).await,
            NBD_CMD_WRITE => self.do_write(req).await,
            NBD_CMD_FLUSH => {
                if self.caps.flush {
                    self.backend.flush().await
                } else {
                    Err(unsupported())
                }
            }
            NBD_CMD_TRIM => {
                if self.caps.trim {
                    self.backend.trim(req.offset, req.length).await
                } else {
                    Err(unsupported())
                }
            }
            _ => {
                warn!("unsupported operation {}", req);
                Err(unsupported())
            }
        };

        if let Err(e) = result {
            warn!("{} failed: {}", req, e);
            reply.set_error(NBD_EIO);
        }
    }

    async fn do_read(&self, req: &Request, reply: &mut Reply) -> std::io::Result<()> {
        let n = self.backend.read_at(reply.payload_mut(), req.offset).await?;
        if n != req.length as usize {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short read: {} of {} bytes", n, req.length),
            ));
        }
        Ok(())
    }

    async fn do_write(&self, req: &Request) -> std::io::Result<()> {
        let data = req.payload();
        let n = self.backend.write_at(data, req.offset).await?;
        if n != data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("short write: {} of {} bytes", n, data.len()),
            ));
        }
        Ok(())
    }
}

async fn recv_next(rx: &SharedReceiver) -> Option<Request> {
    rx.lock().await.recv().await
}

async fn worker_loop(
    engine: Arc<IoEngine>,
    rx: SharedReceiver,
    writer: SharedWriter,
    cancel: Arc<CancelSignal>,
    fatal: mpsc::Sender<()>,
) -> Result<(), EngineError> {
    loop {
        let req = tokio::select! {
            _ = cancel.fired_wait() => return Err(EngineError::Cancelled),
            req = recv_next(&rx) => match req {
                Some(req) => req,
                // Channel closed: the reader saw DISC (or broke) and
                // we have drained.
                None => return Ok(()),
            },
        };

        let payload_len = if req.cmd == NBD_CMD_READ {
            req.length as usize
        } else {
            0
        };
        let mut reply = engine.replies.get(req.handle, payload_len);
        engine.dispatch(&req, &mut reply).await;
        engine.requests.put(req);

        // After a fatal error no further replies go on the wire.
        if cancel.is_fired() {
            engine.replies.put(reply);
            return Err(EngineError::Cancelled);
        }

        let sent = {
            let mut w = writer.lock().await;
            reply.send(&mut *w).await
        };
        engine.replies.put(reply);

        if let Err(e) = sent {
            error!("error writing reply: {}", e);
            cancel.fire();
            let _ = fatal.try_send(());
            return Err(EngineError::ReplyWrite(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::task::JoinHandle;

    use nbdserve_proto::consts::{NBD_CMD_CACHE, NBD_REQUEST_MAGIC};

    /// Reads fill with a constant byte; writes are accepted.
    struct FillBackend(u8);

    #[async_trait]
    impl BlockBackend for FillBackend {
        async fn read_at(&self, buf: &mut [u8], _offset: u64) -> io::Result<usize> {
            buf.fill(self.0);
            Ok(buf.len())
        }
        async fn write_at(&self, data: &[u8], _offset: u64) -> io::Result<usize> {
            Ok(data.len())
        }
    }

    /// Records every write it receives.
    #[derive(Default)]
    struct CaptureBackend {
        writes: std::sync::Mutex<Vec<(u64, Vec<u8>)>>,
    }

    #[async_trait]
    impl BlockBackend for CaptureBackend {
        async fn read_at(&self, buf: &mut [u8], _offset: u64) -> io::Result<usize> {
            buf.fill(0);
            Ok(buf.len())
        }
        async fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize> {
            self.writes.lock().unwrap().push((offset, data.to_vec()));
            Ok(data.len())
        }
    }

    /// Sleeps per read — duration scales with the block index — then
    /// fills the buffer with that index. Tracks peak concurrency.
    struct SleepBackend {
        unit: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SleepBackend {
        fn new(unit: Duration) -> Self {
            Self {
                unit,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BlockBackend for SleepBackend {
        async fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let block = offset / 512;
            tokio::time::sleep(self.unit * (block as u32 + 1)).await;
            buf.fill(block as u8);

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(buf.len())
        }
        async fn write_at(&self, data: &[u8], _offset: u64) -> io::Result<usize> {
            Ok(data.len())
        }
    }

    /// Every operation fails.
    struct BrokenBackend;

    #[async_trait]
    impl BlockBackend for BrokenBackend {
        async fn read_at(&self, _buf: &mut [u8], _offset: u64) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk on fire"))
        }
        async fn write_at(&self, _data: &[u8], _offset: u64) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk on fire"))
        }
    }

    fn start_engine(
        backend: Arc<dyn BlockBackend>,
        caps: Capabilities,
        workers: usize,
    ) -> (
        UnixStream,
        JoinHandle<Result<(), EngineError>>,
        mpsc::Receiver<()>,
    ) {
        let (client, server) = UnixStream::pair().unwrap();
        let engine = Arc::new(IoEngine::new(backend, caps, workers));
        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        let handle = tokio::spawn(engine.run(server, fatal_tx));
        (client, handle, fatal_rx)
    }

    fn request_bytes(cmd: u16, handle: u64, offset: u64, length: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(28 + payload.len());
        out.extend_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&cmd.to_be_bytes());
        out.extend_from_slice(&handle.to_be_bytes());
        out.extend_from_slice(&offset.to_be_bytes());
        out.extend_from_slice(&length.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    async fn read_reply(client: &mut UnixStream, payload_len: usize) -> (u64, u32, Vec<u8>) {
        let mut header = [0u8; 16];
        client.read_exact(&mut header).await.unwrap();
        assert_eq!(&header[0..4], &0x6744_6698u32.to_be_bytes());
        let err = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let handle = u64::from_be_bytes([
            header[8], header[9], header[10], header[11], header[12], header[13], header[14],
            header[15],
        ]);
        let mut payload = vec![0u8; if err == 0 { payload_len } else { 0 }];
        if !payload.is_empty() {
            client.read_exact(&mut payload).await.unwrap();
        }
        (handle, err, payload)
    }

    #[tokio::test]
    async fn read_round_trip() {
        let (mut client, handle, _fatal) =
            start_engine(Arc::new(FillBackend(0xAA)), Capabilities::default(), 1);

        client
            .write_all(&request_bytes(NBD_CMD_READ, 0x2A, 0x200, 0x200, &[]))
            .await
            .unwrap();

        let (h, err, payload) = read_reply(&mut client, 0x200).await;
        assert_eq!(h, 0x2A);
        assert_eq!(err, 0);
        assert_eq!(payload, vec![0xAA; 512]);

        client
            .write_all(&request_bytes(NBD_CMD_DISC, 0, 0, 0, &[]))
            .await
            .unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn write_reaches_backend() {
        let backend = Arc::new(CaptureBackend::default());
        let (mut client, handle, _fatal) =
            start_engine(backend.clone(), Capabilities::default(), 1);

        let payload = [0u8, 1, 2, 3, 4, 5, 6, 7];
        client
            .write_all(&request_bytes(NBD_CMD_WRITE, 0x11, 0, 8, &payload))
            .await
            .unwrap();

        let (h, err, _) = read_reply(&mut client, 0).await;
        assert_eq!(h, 0x11);
        assert_eq!(err, 0);

        client
            .write_all(&request_bytes(NBD_CMD_DISC, 0, 0, 0, &[]))
            .await
            .unwrap();
        handle.await.unwrap().unwrap();

        let writes = backend.writes.lock().unwrap();
        assert_eq!(writes.as_slice(), &[(0u64, payload.to_vec())]);
    }

    #[tokio::test]
    async fn unsupported_command_replies_eio_and_continues() {
        let (mut client, handle, _fatal) =
            start_engine(Arc::new(FillBackend(0)), Capabilities::default(), 1);

        client
            .write_all(&request_bytes(NBD_CMD_CACHE, 0x99, 0, 0, &[]))
            .await
            .unwrap();
        let (h, err, payload) = read_reply(&mut client, 0).await;
        assert_eq!(h, 0x99);
        assert_eq!(err, NBD_EIO);
        assert!(payload.is_empty());

        // The engine survived: a normal read still works.
        client
            .write_all(&request_bytes(NBD_CMD_READ, 0x100, 0, 512, &[]))
            .await
            .unwrap();
        let (h, err, _) = read_reply(&mut client, 512).await;
        assert_eq!(h, 0x100);
        assert_eq!(err, 0);

        client
            .write_all(&request_bytes(NBD_CMD_DISC, 0, 0, 0, &[]))
            .await
            .unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn backend_error_is_per_request() {
        let (mut client, handle, _fatal) =
            start_engine(Arc::new(BrokenBackend), Capabilities::default(), 1);

        client
            .write_all(&request_bytes(NBD_CMD_READ, 7, 0, 512, &[]))
            .await
            .unwrap();
        let (h, err, payload) = read_reply(&mut client, 512).await;
        assert_eq!(h, 7);
        assert_eq!(err, NBD_EIO);
        // No payload follows a failed read.
        assert!(payload.is_empty());

        client
            .write_all(&request_bytes(NBD_CMD_DISC, 0, 0, 0, &[]))
            .await
            .unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn disc_gets_no_reply() {
        let (mut client, handle, _fatal) =
            start_engine(Arc::new(FillBackend(0)), Capabilities::default(), 4);

        client
            .write_all(&request_bytes(NBD_CMD_DISC, 0, 0, 0, &[]))
            .await
            .unwrap();
        handle.await.unwrap().unwrap();

        // The engine dropped its write half without emitting anything.
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bad_magic_is_fatal() {
        let (mut client, handle, mut fatal) =
            start_engine(Arc::new(FillBackend(0)), Capabilities::default(), 2);

        client.write_all(&[0xDE, 0xAD, 0xBE, 0xEF]).await.unwrap();

        let result = handle.await.unwrap();
        match result {
            Err(EngineError::Decode(ProtocolError::BadMagic { found })) => {
                assert_eq!(found, 0xDEAD_BEEF)
            }
            other => panic!("expected BadMagic, got {:?}", other),
        }
        // The supervisor was asked to detach the device.
        assert!(fatal.recv().await.is_some());
    }

    #[tokio::test]
    async fn flush_respects_capability_descriptor() {
        // Backend without flush: the kernel should never send FLUSH,
        // but if it does the reply is EIO, not a crash.
        let (mut client, handle, _fatal) =
            start_engine(Arc::new(FillBackend(0)), Capabilities::default(), 1);

        client
            .write_all(&request_bytes(NBD_CMD_FLUSH, 5, 0, 0, &[]))
            .await
            .unwrap();
        let (h, err, _) = read_reply(&mut client, 0).await;
        assert_eq!(h, 5);
        assert_eq!(err, NBD_EIO);

        client
            .write_all(&request_bytes(NBD_CMD_DISC, 0, 0, 0, &[]))
            .await
            .unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn concurrent_reads_interleave() {
        let backend = Arc::new(SleepBackend::new(Duration::from_millis(20)));
        let workers = 4;
        let (mut client, handle, _fatal) =
            start_engine(backend.clone(), Capabilities::default(), workers);

        // Eight reads with distinct sleep durations (20ms..160ms).
        let start = std::time::Instant::now();
        for i in 0u64..8 {
            client
                .write_all(&request_bytes(NBD_CMD_READ, i + 1, i * 512, 512, &[]))
                .await
                .unwrap();
        }

        let mut seen = std::collections::HashMap::new();
        for _ in 0..8 {
            let (h, err, payload) = read_reply(&mut client, 512).await;
            assert_eq!(err, 0);
            // Payload carries the block index the backend filled in.
            assert_eq!(payload, vec![(h - 1) as u8; 512]);
            assert!(seen.insert(h, ()).is_none(), "duplicate reply for {}", h);
        }
        let elapsed = start.elapsed();

        assert_eq!(seen.len(), 8);
        // Serial execution would be 20+40+..+160 = 720ms; four workers
        // must land well under 2 × max(sleep) + slack.
        assert!(
            elapsed < Duration::from_millis(2 * 160 + 150),
            "took {:?}",
            elapsed
        );
        // In-flight dispatch never exceeds the worker count.
        assert!(backend.peak.load(Ordering::SeqCst) <= workers);

        client
            .write_all(&request_bytes(NBD_CMD_DISC, 0, 0, 0, &[]))
            .await
            .unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn every_request_gets_exactly_one_reply() {
        let (mut client, handle, _fatal) =
            start_engine(Arc::new(FillBackend(0x5C)), Capabilities::default(), 4);

        // A mix of reads, writes, and an unsupported command.
        let mut expected = std::collections::HashSet::new();
        for i in 0u64..5 {
            client
                .write_all(&request_bytes(NBD_CMD_READ, 100 + i, i * 512, 512, &[]))
                .await
                .unwrap();
            expected.insert(100 + i);
        }
        client
            .write_all(&request_bytes(NBD_CMD_WRITE, 200, 0, 4, &[9, 9, 9, 9]))
            .await
            .unwrap();
        expected.insert(200);
        client
            .write_all(&request_bytes(NBD_CMD_CACHE, 300, 0, 0, &[]))
            .await
            .unwrap();
        expected.insert(300);
        client
            .write_all(&request_bytes(NBD_CMD_DISC, 0, 0, 0, &[]))
            .await
            .unwrap();

        let mut got = std::collections::HashSet::new();
        for _ in 0..expected.len() {
            let mut header = [0u8; 16];
            client.read_exact(&mut header).await.unwrap();
            let err = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
            let h = u64::from_be_bytes([
                header[8], header[9], header[10], header[11], header[12], header[13], header[14],
                header[15],
            ]);
            if err == 0 && (100..200).contains(&h) {
                let mut payload = vec![0u8; 512];
                client.read_exact(&mut payload).await.unwrap();
            }
            assert!(got.insert(h), "duplicate reply for handle {}", h);
        }
        assert_eq!(got, expected);

        handle.await.unwrap().unwrap();

        // Nothing after the last reply.
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }
}
