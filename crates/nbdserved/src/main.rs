//! nbdserved — NBD userspace server daemon.
//!
//! Exposes a backing file (or a null sink) as a kernel block device:
//!
//!   nbdserved --file disk.img                          # /dev/nbd0, ioctl attach
//!   nbdserved --file disk.img --netlink-index 3        # /dev/nbd3, netlink attach
//!   nbdserved --size 68719476736 --concurrent-ops 4    # null backend
//!
//! SIGINT/SIGTERM detach the device and let the session drain.

mod file;
mod null;
#[cfg(feature = "http")]
mod status;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use nbdserve_core::{BlockBackend, DeviceOptions, NbdServer};
#[cfg(feature = "http")]
use nbdserve_proto::defaults::DEFAULT_HTTP_PORT;
use nbdserve_proto::defaults::{DEFAULT_BLOCK_SIZE, DEFAULT_CONCURRENT_OPS, DEFAULT_DEVICE};

/// NBD userspace server
#[derive(Parser, Debug)]
#[command(name = "nbdserved", version, about = "NBD userspace server")]
struct Args {
    /// Path to the /dev/nbdX device node (legacy ioctl attach)
    #[arg(short = 'd', long, default_value = DEFAULT_DEVICE)]
    device: PathBuf,

    /// Attach /dev/nbd<INDEX> via generic netlink instead of ioctls
    #[arg(short = 'n', long, value_name = "INDEX")]
    netlink_index: Option<u32>,

    /// Path to the backing file; without it the null backend is used
    #[arg(short = 'f', long)]
    file: Option<PathBuf>,

    /// Device size in bytes (defaults to the backing file's size;
    /// required with the null backend)
    #[arg(short = 's', long)]
    size: Option<u64>,

    /// Device block size in bytes (power of two, 512..=page size)
    #[arg(short = 'b', long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: u32,

    /// Number of concurrently executing operations (1..=128)
    #[arg(short = 'c', long, default_value_t = DEFAULT_CONCURRENT_OPS)]
    concurrent_ops: u32,

    /// Expose the device read-only
    #[arg(short = 'r', long)]
    read_only: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Localhost port for the HTTP status endpoint (0 to disable)
    #[cfg(feature = "http")]
    #[arg(long, default_value_t = DEFAULT_HTTP_PORT)]
    http_port: u16,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("nbdserved v{} starting", env!("CARGO_PKG_VERSION"));

    // A zero block size means "use the default"; resolve it here so
    // the size rounding below works with the real value.
    let block_size = if args.block_size == 0 {
        DEFAULT_BLOCK_SIZE
    } else {
        args.block_size
    };

    // Pick the backend and settle the device size.
    let (backend, size): (Arc<dyn BlockBackend>, u64) = match &args.file {
        Some(path) => {
            let (backend, file_size) = match file::FileBackend::open(path, args.read_only) {
                Ok(opened) => opened,
                Err(e) => {
                    error!("failed to open {}: {}", path.display(), e);
                    std::process::exit(1);
                }
            };
            let mut size = args.size.unwrap_or(file_size);
            size -= size % block_size as u64;
            (Arc::new(backend), size)
        }
        None => {
            let Some(size) = args.size else {
                error!("--size is required with the null backend");
                std::process::exit(1);
            };
            (Arc::new(null::NullBackend), size)
        }
    };

    let opts = DeviceOptions {
        block_size,
        concurrent_ops: args.concurrent_ops,
        read_only: args.read_only,
    };

    // Netlink exactly when an index is given; ioctls otherwise.
    let server = match args.netlink_index {
        Some(index) => NbdServer::with_netlink(index, backend, size, opts),
        None => NbdServer::new(&args.device, backend, size, opts),
    };
    let server = match server {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!("failed to set up NBD server: {}", e);
            std::process::exit(1);
        }
    };

    #[cfg(feature = "http")]
    if args.http_port != 0 {
        let snapshot = status::Status {
            device: match args.netlink_index {
                Some(index) => format!("/dev/nbd{}", index),
                None => args.device.display().to_string(),
            },
            size,
            block_size: server.options().block_size,
            concurrent_ops: server.options().concurrent_ops,
            read_only: args.read_only,
        };
        let port = args.http_port;
        tokio::spawn(async move {
            if let Err(e) = status::serve(port, snapshot).await {
                warn!("status endpoint failed: {}", e);
            }
        });
    }

    // Detach on SIGINT/SIGTERM; the engine drains and run() returns.
    let signal_server = server.clone();
    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sig) => sig,
                Err(e) => {
                    warn!("failed to install SIGTERM handler: {}", e);
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received, disconnecting"),
            _ = sigterm.recv() => info!("SIGTERM received, disconnecting"),
        }
        if let Err(e) = signal_server.disconnect() {
            warn!("disconnect failed: {}", e);
        }
    });

    match server.run().await {
        Ok(()) => info!("session ended"),
        Err(e) => {
            error!("server error: {}", e);
            std::process::exit(1);
        }
    }
}
