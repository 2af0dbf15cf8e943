//! Server front-end: option validation, capability probing, and the
//! session lifecycle around the engine.
//!
//! A server is immutable after construction. `run()` creates the
//! socketpair, hands one end to the kernel through the chosen binder,
//! and drives the engine on the other end until the session ends.
//! `disconnect()` may be called from any task (typically a signal
//! handler) and is the shutdown entry point; a watchdog issues the
//! same disconnect when the engine reports a fatal transport error.

use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use nbdserve_proto::consts::{
    NBD_FLAG_HAS_FLAGS, NBD_FLAG_READ_ONLY, NBD_FLAG_SEND_FLUSH, NBD_FLAG_SEND_TRIM,
};
use nbdserve_proto::defaults::{DEFAULT_BLOCK_SIZE, DEFAULT_CONCURRENT_OPS, MAX_CONCURRENT_OPS};

use crate::backend::{BlockBackend, Capabilities};
use crate::engine::{EngineError, IoEngine};
use crate::error::{ConfigError, ServerError};
use crate::ioctl::IoctlBinder;
use crate::netlink::NetlinkBinder;

/// Device tuning options.
///
/// A zero `block_size` or `concurrent_ops` selects the default, so a
/// zeroed options struct from a config file behaves sensibly.
#[derive(Debug, Clone, Copy)]
pub struct DeviceOptions {
    /// Device block size in bytes. Must be a power of two between 512
    /// and the system page size.
    pub block_size: u32,
    /// Number of requests executed in parallel (1..=128). This is also
    /// the request channel depth, so it bounds in-flight work.
    pub concurrent_ops: u32,
    /// Advertise the device read-only; the kernel rejects writes.
    pub read_only: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            concurrent_ops: DEFAULT_CONCURRENT_OPS,
            read_only: false,
        }
    }
}

fn page_size() -> u32 {
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n <= 0 {
        4096
    } else {
        n as u32
    }
}

fn validate_options(mut opts: DeviceOptions, size: u64) -> Result<DeviceOptions, ConfigError> {
    let page_size = page_size();
    if opts.block_size == 0 {
        opts.block_size = DEFAULT_BLOCK_SIZE;
    } else if opts.block_size < DEFAULT_BLOCK_SIZE || opts.block_size > page_size {
        return Err(ConfigError::BlockSizeRange {
            got: opts.block_size,
            page_size,
        });
    } else if !opts.block_size.is_power_of_two() {
        return Err(ConfigError::BlockSizeAlignment(opts.block_size));
    }

    if size == 0 || size % opts.block_size as u64 != 0 {
        return Err(ConfigError::SizeAlignment);
    }

    if opts.concurrent_ops == 0 {
        opts.concurrent_ops = DEFAULT_CONCURRENT_OPS;
    } else if opts.concurrent_ops > MAX_CONCURRENT_OPS {
        return Err(ConfigError::ConcurrentOpsRange {
            got: opts.concurrent_ops,
            max: MAX_CONCURRENT_OPS,
        });
    }

    // SET_SIZE_BLOCKS takes a pointer-width argument.
    let blocks = size / opts.block_size as u64;
    if usize::try_from(blocks).is_err() {
        return Err(ConfigError::BlockCountOverflow {
            size,
            block_size: opts.block_size,
        });
    }

    Ok(opts)
}

/// Exactly one attachment mechanism per server instance.
#[derive(Clone)]
enum Attach {
    Ioctl(Arc<IoctlBinder>),
    Netlink(Arc<NetlinkBinder>),
}

impl Attach {
    fn disconnect(&self) -> Result<(), ServerError> {
        match self {
            Attach::Ioctl(binder) => binder.disconnect().map_err(ServerError::Device),
            Attach::Netlink(binder) => binder
                .disconnect()
                .map_err(|e| ServerError::Netlink(e.to_string())),
        }
    }
}

/// An NBD device session: one backend, one kernel device.
pub struct NbdServer {
    backend: Arc<dyn BlockBackend>,
    caps: Capabilities,
    opts: DeviceOptions,
    size: u64,
    attach: Attach,
}

impl NbdServer {
    /// Set up a server on a device node (`/dev/nbdX`) using the legacy
    /// ioctl attachment.
    ///
    /// `size` is the device size in bytes and must be a positive
    /// multiple of the block size. Option validation failures and a
    /// failed device open reject construction; nothing touches the
    /// kernel until [`run`](Self::run).
    pub fn new(
        device: impl AsRef<Path>,
        backend: Arc<dyn BlockBackend>,
        size: u64,
        opts: DeviceOptions,
    ) -> Result<Self, ServerError> {
        let opts = validate_options(opts, size)?;
        let caps = backend.capabilities();
        let binder = IoctlBinder::open(device.as_ref()).map_err(ServerError::Attach)?;
        Ok(Self {
            backend,
            caps,
            opts,
            size,
            attach: Attach::Ioctl(Arc::new(binder)),
        })
    }

    /// Set up a server on device index `index` (`/dev/nbd{index}`)
    /// using the generic-netlink attachment. Allows the kernel to
    /// destroy the device on disconnect and needs no thread parked in
    /// an ioctl.
    pub fn with_netlink(
        index: u32,
        backend: Arc<dyn BlockBackend>,
        size: u64,
        opts: DeviceOptions,
    ) -> Result<Self, ServerError> {
        let opts = validate_options(opts, size)?;
        let caps = backend.capabilities();
        let binder =
            NetlinkBinder::new(index).map_err(|e| ServerError::Netlink(e.to_string()))?;
        Ok(Self {
            backend,
            caps,
            opts,
            size,
            attach: Attach::Netlink(Arc::new(binder)),
        })
    }

    /// The validated options this server runs with.
    pub fn options(&self) -> DeviceOptions {
        self.opts
    }

    /// Device size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    fn read_only(&self) -> bool {
        self.opts.read_only || self.caps.read_only
    }

    /// Flags for the SET_FLAGS ioctl. HAS_FLAGS rides along whenever
    /// any other bit is set.
    fn transmission_flags(&self) -> u16 {
        let mut flags = 0;
        if self.read_only() {
            flags |= NBD_FLAG_READ_ONLY;
        }
        if self.caps.flush {
            flags |= NBD_FLAG_SEND_FLUSH;
        }
        if self.caps.trim {
            flags |= NBD_FLAG_SEND_TRIM;
        }
        if flags != 0 {
            flags |= NBD_FLAG_HAS_FLAGS;
        }
        flags
    }

    /// Flags for the netlink SERVER_FLAGS attribute. The kernel adds
    /// HAS_FLAGS itself on this path.
    fn netlink_server_flags(&self) -> u64 {
        let mut flags = 0u64;
        if self.read_only() {
            flags |= NBD_FLAG_READ_ONLY as u64;
        }
        if self.caps.flush {
            flags |= NBD_FLAG_SEND_FLUSH as u64;
        }
        if self.caps.trim {
            flags |= NBD_FLAG_SEND_TRIM as u64;
        }
        flags
    }

    /// Run the device session to completion.
    ///
    /// Blocks until the kernel disconnects (a clean `Ok`), the
    /// transmission stream breaks (the framing or write error), or
    /// attachment fails. Teardown — CLEAR_SOCK and the device-node
    /// close on the ioctl path, plus the backend close — is
    /// best-effort; a session does not outlive its /dev/nbdX
    /// descriptor.
    pub async fn run(&self) -> Result<(), ServerError> {
        let (kernel_sock, user_sock) = std::os::unix::net::UnixStream::pair()?;
        user_sock.set_nonblocking(true)?;
        let stream = tokio::net::UnixStream::from_std(user_sock)?;

        let engine = Arc::new(IoEngine::new(
            self.backend.clone(),
            self.caps,
            self.opts.concurrent_ops as usize,
        ));
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<()>(1);

        // Watchdog: a fatal engine error detaches the device, which
        // unwinds the kernel-side wait and lets the session drain.
        let attach = self.attach.clone();
        let watchdog = tokio::spawn(async move {
            if fatal_rx.recv().await.is_some() {
                warn!("fatal engine error, detaching device");
                match tokio::task::spawn_blocking(move || attach.disconnect()).await {
                    Ok(Err(e)) => warn!("disconnect after engine failure failed: {}", e),
                    Err(e) => warn!("disconnect task failed: {}", e),
                    Ok(Ok(())) => {}
                }
            }
        });

        let outcome = match &self.attach {
            Attach::Ioctl(binder) => {
                self.run_ioctl(binder, kernel_sock.as_raw_fd(), stream, engine, fatal_tx)
                    .await
            }
            Attach::Netlink(binder) => {
                self.run_netlink(binder, kernel_sock.as_raw_fd(), stream, engine, fatal_tx)
                    .await
            }
        };

        // The kernel holds its own reference once attached; ours can
        // go now that the session is over.
        drop(kernel_sock);
        let _ = watchdog.await;

        if let Err(e) = self.backend.close().await {
            warn!("backend close failed: {}", e);
        }

        outcome
    }

    async fn run_ioctl(
        &self,
        binder: &Arc<IoctlBinder>,
        kernel_fd: RawFd,
        stream: tokio::net::UnixStream,
        engine: Arc<IoEngine>,
        fatal: mpsc::Sender<()>,
    ) -> Result<(), ServerError> {
        let blocks = self.size / self.opts.block_size as u64;
        binder
            .configure(
                kernel_fd,
                self.opts.block_size,
                blocks,
                self.transmission_flags(),
            )
            .map_err(ServerError::Attach)?;
        info!(
            "device configured: {} bytes, block size {}, {} workers",
            self.size, self.opts.block_size, self.opts.concurrent_ops
        );

        let engine_task = tokio::spawn(engine.run(stream, fatal));

        // DO_IT parks this thread in the kernel until disconnect.
        let wait_binder = binder.clone();
        let device_res = match tokio::task::spawn_blocking(move || wait_binder.do_it()).await {
            Ok(res) => res,
            Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
        };

        let engine_res = join_engine(engine_task).await;
        binder.clear_sock();
        binder.close();

        match engine_outcome(engine_res) {
            Ok(()) => device_res.map_err(ServerError::Device),
            err => err,
        }
    }

    async fn run_netlink(
        &self,
        binder: &Arc<NetlinkBinder>,
        kernel_fd: RawFd,
        stream: tokio::net::UnixStream,
        engine: Arc<IoEngine>,
        fatal: mpsc::Sender<()>,
    ) -> Result<(), ServerError> {
        let connect_binder = binder.clone();
        let size = self.size;
        let block_size = self.opts.block_size as u64;
        let flags = self.netlink_server_flags();
        let connected = tokio::task::spawn_blocking(move || {
            connect_binder.connect(&[kernel_fd], size, block_size, flags)
        })
        .await;
        match connected {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ServerError::Netlink(e.to_string())),
            Err(e) => return Err(ServerError::Netlink(e.to_string())),
        }
        info!(
            "nbd{} attached via netlink: {} bytes, block size {}, {} workers",
            binder.index(),
            self.size,
            self.opts.block_size,
            self.opts.concurrent_ops
        );

        // The kernel returned from CONNECT; the engine runs until the
        // session is torn down.
        let engine_res = join_engine(tokio::spawn(engine.run(stream, fatal))).await;
        engine_outcome(engine_res)
    }

    /// Detach the device, ending the session. Safe to call from any
    /// task while `run` is blocked; fails if the device is already
    /// detached.
    pub fn disconnect(&self) -> Result<(), ServerError> {
        self.attach.disconnect()
    }
}

async fn join_engine(
    task: tokio::task::JoinHandle<Result<(), EngineError>>,
) -> Result<(), EngineError> {
    match task.await {
        Ok(res) => res,
        Err(e) => {
            warn!("engine task failed: {}", e);
            Ok(())
        }
    }
}

fn engine_outcome(res: Result<(), EngineError>) -> Result<(), ServerError> {
    match res {
        Ok(()) | Err(EngineError::Cancelled) => Ok(()),
        Err(EngineError::Decode(e)) => Err(e.into()),
        Err(EngineError::ReplyWrite(e)) => Err(ServerError::ReplyWrite(e)),
    }
}
