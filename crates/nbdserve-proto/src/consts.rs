/// NBD protocol constants.
///
/// Wire format reference: <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md>

// ─── Transmission Phase ─────────────────────────────────────────────────────

/// Transmission request magic
pub const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;
/// Simple reply magic
pub const NBD_REPLY_MAGIC: u32 = 0x6744_6698;

/// Request header: magic(4) + flags(2) + cmd(2) + handle(8) + offset(8) + length(4)
pub const NBD_REQUEST_HEADER_LEN: usize = 28;
/// Reply header: magic(4) + err(4) + handle(8)
pub const NBD_REPLY_HEADER_LEN: usize = 16;

// Command types (16-bit)
pub const NBD_CMD_READ: u16 = 0;
pub const NBD_CMD_WRITE: u16 = 1;
pub const NBD_CMD_DISC: u16 = 2;
pub const NBD_CMD_FLUSH: u16 = 3;
pub const NBD_CMD_TRIM: u16 = 4;
pub const NBD_CMD_CACHE: u16 = 5;
pub const NBD_CMD_WRITE_ZEROES: u16 = 6;

// Command flags (16-bit)
pub const NBD_CMD_FLAG_FUA: u16 = 1 << 0;
pub const NBD_CMD_FLAG_NO_HOLE: u16 = 1 << 1;
pub const NBD_CMD_FLAG_DF: u16 = 1 << 2;

// ─── Transmission Flags ─────────────────────────────────────────────────────
// Advertised to the kernel at attachment time (SET_FLAGS ioctl or the
// netlink SERVER_FLAGS attribute).

pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const NBD_FLAG_READ_ONLY: u16 = 1 << 1;
pub const NBD_FLAG_SEND_FLUSH: u16 = 1 << 2;
pub const NBD_FLAG_SEND_FUA: u16 = 1 << 3;
pub const NBD_FLAG_ROTATIONAL: u16 = 1 << 4;
pub const NBD_FLAG_SEND_TRIM: u16 = 1 << 5;
pub const NBD_FLAG_SEND_WRITE_ZEROES: u16 = 1 << 6;
pub const NBD_FLAG_SEND_DF: u16 = 1 << 7;
pub const NBD_FLAG_CAN_MULTI_CONN: u16 = 1 << 8;

// Client flags (netlink CLIENT_FLAGS attribute, 64-bit)
pub const NBD_CFLAG_DESTROY_ON_DISCONNECT: u64 = 1 << 0;
pub const NBD_CFLAG_DISCONNECT_ON_CLOSE: u64 = 1 << 1;

// ─── Wire Error Numbers ─────────────────────────────────────────────────────
// The `err` field of a simple reply. This server emits only NBD_EIO.

/// Operation not permitted
pub const NBD_EPERM: u32 = 1;
/// Input/output error
pub const NBD_EIO: u32 = 5;
/// Cannot allocate memory
pub const NBD_ENOMEM: u32 = 12;
/// Invalid argument
pub const NBD_EINVAL: u32 = 22;
/// No space left on device
pub const NBD_ENOSPC: u32 = 28;
/// Value too large (structured-reply extension)
pub const NBD_EOVERFLOW: u32 = 75;
/// Server is shutting down
pub const NBD_ESHUTDOWN: u32 = 108;

// ─── Device Ioctls ──────────────────────────────────────────────────────────
// Request numbers for /dev/nbdX. The argument is a plain integer (or
// absent), so these are the historic 0xab00-series codes rather than
// _IOW-encoded ones.

pub const NBD_SET_SOCK: u64 = 0xab00;
pub const NBD_SET_BLKSIZE: u64 = 0xab01;
pub const NBD_SET_SIZE: u64 = 0xab02;
pub const NBD_DO_IT: u64 = 0xab03;
pub const NBD_CLEAR_SOCK: u64 = 0xab04;
pub const NBD_CLEAR_QUE: u64 = 0xab05;
pub const NBD_PRINT_DEBUG: u64 = 0xab06;
pub const NBD_SET_SIZE_BLOCKS: u64 = 0xab07;
pub const NBD_DISCONNECT: u64 = 0xab08;
pub const NBD_SET_TIMEOUT: u64 = 0xab09;
pub const NBD_SET_FLAGS: u64 = 0xab0a;

// ─── Generic Netlink ────────────────────────────────────────────────────────
// The modern attachment path (kernel >= 4.10).

/// Generic netlink family name
pub const NBD_NL_FAMILY: &str = "nbd";
/// Generic netlink family version
pub const NBD_NL_VERSION: u8 = 1;

// Top-level attributes
pub const NBD_NL_ATTR_INDEX: u16 = 1;
pub const NBD_NL_ATTR_SIZE_BYTES: u16 = 2;
pub const NBD_NL_ATTR_BLOCK_SIZE_BYTES: u16 = 3;
pub const NBD_NL_ATTR_TIMEOUT: u16 = 4;
pub const NBD_NL_ATTR_SERVER_FLAGS: u16 = 5;
pub const NBD_NL_ATTR_CLIENT_FLAGS: u16 = 6;
pub const NBD_NL_ATTR_SOCKETS: u16 = 7;

/// Item attribute within the SOCKETS list
pub const NBD_NL_SOCK_ITEM: u16 = 1;
/// FD attribute within a socket item
pub const NBD_NL_SOCK_FD: u16 = 1;

// Commands
pub const NBD_NL_CMD_CONNECT: u8 = 1;
pub const NBD_NL_CMD_DISCONNECT: u8 = 2;

// ─── Negotiation Phase ──────────────────────────────────────────────────────
// Defined for completeness; this server does no userspace negotiation.

/// Initial server magic: ASCII "NBDMAGIC"
pub const NBD_MAGIC: u64 = 0x4e42_444d_4147_4943;
/// Fixed newstyle negotiation magic: ASCII "IHAVEOPT"
pub const NBD_IHAVEOPT: u64 = 0x4948_4156_454f_5054;
/// Server option reply magic
pub const NBD_OPT_REPLY_MAGIC: u64 = 0x3e88_9045_565a9;

// Handshake flags (server → client, 16-bit)
pub const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const NBD_FLAG_NO_ZEROES: u16 = 1 << 1;

// Client handshake flags (client → server, 32-bit)
pub const NBD_FLAG_C_FIXED_NEWSTYLE: u32 = 1 << 0;
pub const NBD_FLAG_C_NO_ZEROES: u32 = 1 << 1;

// Option types (32-bit)
pub const NBD_OPT_EXPORT_NAME: u32 = 1;
pub const NBD_OPT_ABORT: u32 = 2;
pub const NBD_OPT_LIST: u32 = 3;
pub const NBD_OPT_PEEK_EXPORT: u32 = 4;
pub const NBD_OPT_STARTTLS: u32 = 5;
pub const NBD_OPT_INFO: u32 = 6;
pub const NBD_OPT_GO: u32 = 7;
pub const NBD_OPT_STRUCTURED_REPLY: u32 = 8;

// Option reply types (32-bit)
pub const NBD_REP_ACK: u32 = 1;
pub const NBD_REP_SERVER: u32 = 2;
pub const NBD_REP_INFO: u32 = 3;
pub const NBD_REP_ERR_UNSUP: u32 = (1 << 31) + 1;
pub const NBD_REP_ERR_POLICY: u32 = (1 << 31) + 2;
pub const NBD_REP_ERR_INVALID: u32 = (1 << 31) + 3;
pub const NBD_REP_ERR_PLATFORM: u32 = (1 << 31) + 4;
pub const NBD_REP_ERR_TLS_REQD: u32 = (1 << 31) + 5;
pub const NBD_REP_ERR_UNKNOWN: u32 = (1 << 31) + 6;
pub const NBD_REP_ERR_SHUTDOWN: u32 = (1 << 31) + 7;
pub const NBD_REP_ERR_BLOCK_SIZE_REQD: u32 = (1 << 31) + 8;

// Info types for NBD_OPT_INFO / NBD_OPT_GO replies
pub const NBD_INFO_EXPORT: u16 = 0;
pub const NBD_INFO_NAME: u16 = 1;
pub const NBD_INFO_DESCRIPTION: u16 = 2;
pub const NBD_INFO_BLOCK_SIZE: u16 = 3;
