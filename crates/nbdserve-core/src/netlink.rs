//! Generic-netlink attachment (kernel >= 4.10).
//!
//! Replaces the ioctl path: a CONNECT message hands the kernel the
//! socket fds together with size, block size, and flags, and returns
//! synchronously once the device is live — no thread parked in DO_IT.
//! DISCONNECT carries only the device index. The device index must be
//! known at construction; it is encoded into every message.

use std::os::unix::io::RawFd;
use std::sync::Mutex;

use neli::{
    consts::{genl::NlAttrType, nl::NlmF, nl::NlmFFlags, socket::NlFamily},
    err::NlError,
    genl::{Genlmsghdr, Nlattr},
    impl_var,
    nl::{NlPayload, Nlmsghdr},
    socket::NlSocketHandle,
    types::{Buffer, GenlBuffer},
    Nl,
};

use nbdserve_proto::consts::{
    NBD_CFLAG_DESTROY_ON_DISCONNECT, NBD_FLAG_CAN_MULTI_CONN, NBD_NL_FAMILY, NBD_NL_VERSION,
};

impl_var!(
    NbdCmd, u8,
    Unspec => 0,
    Connect => 1,
    Disconnect => 2,
    Reconfigure => 3,
    LinkDead => 4,
    Status => 5
);
impl neli::consts::genl::Cmd for NbdCmd {}

impl_var!(
    NbdAttr, u16,
    Unspec => 0,
    Index => 1,
    SizeBytes => 2,
    BlockSizeBytes => 3,
    Timeout => 4,
    ServerFlags => 5,
    ClientFlags => 6,
    Sockets => 7
);
impl NlAttrType for NbdAttr {}

impl_var!(
    NbdSockItem, u16,
    Unspec => 0,
    Item => 1
);
impl NlAttrType for NbdSockItem {}

impl_var!(
    NbdSock, u16,
    Unspec => 0,
    Fd => 1
);
impl NlAttrType for NbdSock {}

fn attr<T: NlAttrType, P: Nl>(t: T, p: P) -> Result<Nlattr<T, Buffer>, NlError> {
    Nlattr::new(None, false, false, t, p)
}

/// Connection to the kernel's `nbd` generic-netlink family, bound to
/// one device index.
pub(crate) struct NetlinkBinder {
    sock: Mutex<NlSocketHandle>,
    family: u16,
    index: u32,
}

impl NetlinkBinder {
    /// Dial the generic-netlink bus and resolve the `nbd` family.
    /// Fails when the kernel lacks nbd support (or the module is not
    /// loaded).
    pub(crate) fn new(index: u32) -> Result<Self, NlError> {
        let mut sock = NlSocketHandle::new(NlFamily::Generic)?;
        let family = sock.resolve_genl_family(NBD_NL_FAMILY)?;
        Ok(Self {
            sock: Mutex::new(sock),
            family,
            index,
        })
    }

    fn message(
        &self,
        cmd: NbdCmd,
        attrs: GenlBuffer<NbdAttr, Buffer>,
    ) -> Nlmsghdr<u16, Genlmsghdr<NbdCmd, NbdAttr>> {
        let genl = Genlmsghdr::new(cmd, NBD_NL_VERSION, attrs);
        Nlmsghdr::new(
            None,
            self.family,
            NlmFFlags::new(&[NlmF::Request]),
            None,
            None,
            NlPayload::Payload(genl),
        )
    }

    /// Attach the device: size, block size, flags, and the socket fds
    /// (one nested item per fd). Blocks until the kernel acknowledges
    /// the attachment.
    ///
    /// `DESTROY_ON_DISCONNECT` is always set so the device node does
    /// not linger after the session ends. `CAN_MULTI_CONN` is added
    /// when more than one fd is supplied.
    pub(crate) fn connect(
        &self,
        fds: &[RawFd],
        size_bytes: u64,
        block_size_bytes: u64,
        server_flags: u64,
    ) -> Result<(), NlError> {
        let mut attrs = GenlBuffer::new();
        attrs.push(attr(NbdAttr::Index, self.index)?);
        attrs.push(attr(NbdAttr::SizeBytes, size_bytes)?);
        attrs.push(attr(NbdAttr::BlockSizeBytes, block_size_bytes)?);
        attrs.push(attr(NbdAttr::ClientFlags, NBD_CFLAG_DESTROY_ON_DISCONNECT)?);

        let mut flags = server_flags;
        if fds.len() > 1 {
            flags |= NBD_FLAG_CAN_MULTI_CONN as u64;
        }
        if flags != 0 {
            attrs.push(attr(NbdAttr::ServerFlags, flags)?);
        }

        let mut sockets = Nlattr::new(None, true, false, NbdAttr::Sockets, Buffer::new())?;
        for fd in fds {
            sockets.add_nested_attribute(&Nlattr::new(
                None,
                true,
                false,
                NbdSockItem::Item,
                attr(NbdSock::Fd, *fd as u32)?,
            )?)?;
        }
        attrs.push(sockets);

        let msg = self.message(NbdCmd::Connect, attrs);
        let mut sock = self.sock.lock().unwrap();
        sock.send(msg)?;
        // The kernel answers CONNECT with a message carrying the
        // device index; an nlmsgerr surfaces here as Err.
        let _ack: Option<Nlmsghdr<u16, Genlmsghdr<NbdCmd, NbdAttr>>> = sock.recv()?;
        Ok(())
    }

    /// Detach the device. Fire-and-forget, as the session teardown
    /// races the kernel's own cleanup.
    pub(crate) fn disconnect(&self) -> Result<(), NlError> {
        let mut attrs = GenlBuffer::new();
        attrs.push(attr(NbdAttr::Index, self.index)?);
        let msg = self.message(NbdCmd::Disconnect, attrs);
        self.sock.lock().unwrap().send(msg)?;
        Ok(())
    }

    /// The device index this binder controls.
    pub(crate) fn index(&self) -> u32 {
        self.index
    }
}
