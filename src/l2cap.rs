//! Logical Link Control and Adaptation Protocol (L2CAP) sockets.
//!
//! This is the server-side subset used for the ATT transport listeners:
//! a connection-oriented socket can be bound to an adapter address on a
//! fixed channel (LE) or protocol service multiplexor (BR/EDR), configured
//! for a security level and turned into a listener accepting streams.

use libc::{
    c_int, sockaddr, socklen_t, AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_NONBLOCK, SOCK_SEQPACKET,
    SOL_BLUETOOTH,
};
use num_traits::FromPrimitive;
use std::{
    fmt,
    io::{Error, ErrorKind, Result},
    mem::{size_of, MaybeUninit},
    os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd},
};
use tokio::io::unix::AsyncFd;

use crate::{Address, AddressType};

/// Bluetooth protocol number of L2CAP.
const BTPROTO_L2CAP: c_int = 0;

/// `BT_SECURITY` socket option number.
const BT_SECURITY: c_int = 4;

/// Kernel layout of an L2CAP socket address.
///
/// The device address travels least significant octet first.
#[repr(C)]
struct RawSocketAddr {
    family: libc::sa_family_t,
    psm: u16,
    bdaddr: [u8; 6],
    cid: u16,
    bdaddr_type: u8,
}

/// Kernel layout of the `BT_SECURITY` option value.
#[repr(C)]
struct RawSecurity {
    level: u8,
    key_size: u8,
}

/// An L2CAP socket address.
///
/// Exactly one of [psm](Self::psm) and [cid](Self::cid) is nonzero: ATT
/// runs on the fixed channel 4 over LE and on PSM 31 over BR/EDR.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketAddr {
    /// Adapter or device address; [Address::any] binds every local adapter.
    pub addr: Address,
    /// Address type.
    pub addr_type: AddressType,
    /// Protocol service multiplexor, or 0 on a fixed channel.
    pub psm: u16,
    /// Fixed channel identifier, or 0 when using a PSM.
    pub cid: u16,
}

impl SocketAddr {
    /// Creates a new L2CAP socket address for the specified PSM.
    pub const fn new(addr: Address, addr_type: AddressType, psm: u16) -> Self {
        Self { addr, addr_type, psm, cid: 0 }
    }

    /// Creates a new L2CAP socket address for the specified fixed channel.
    pub const fn new_fixed(addr: Address, addr_type: AddressType, cid: u16) -> Self {
        Self { addr, addr_type, psm: 0, cid }
    }

    fn to_raw(self) -> RawSocketAddr {
        RawSocketAddr {
            family: AF_BLUETOOTH as _,
            psm: self.psm.to_le(),
            bdaddr: self.addr.to_le_bytes(),
            cid: self.cid.to_le(),
            bdaddr_type: self.addr_type as _,
        }
    }

    fn from_raw(raw: &RawSocketAddr) -> Result<Self> {
        if raw.family != AF_BLUETOOTH as libc::sa_family_t {
            return Err(Error::new(ErrorKind::InvalidInput, "not an AF_BLUETOOTH address"));
        }
        let addr_type = AddressType::from_u8(raw.bdaddr_type)
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "unknown Bluetooth address type"))?;
        Ok(Self {
            addr: Address::from_le_bytes(raw.bdaddr),
            addr_type,
            psm: u16::from_le(raw.psm),
            cid: u16::from_le(raw.cid),
        })
    }
}

/// L2CAP socket security level.
///
/// The discriminants match the kernel's `BT_SECURITY_*` values.
#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub enum SecurityLevel {
    /// No security, as used for service discovery.
    Sdp = 0,
    /// Neither encryption nor authentication required.
    Low = 1,
    /// Encryption required.
    Medium = 2,
    /// Encryption and authentication required.
    High = 3,
    /// Like high, restricted to FIPS-approved algorithms.
    Fips = 4,
}

/// L2CAP socket security.
#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Security {
    /// Level.
    pub level: SecurityLevel,
    /// Key size.
    pub key_size: u8,
}

fn check(ret: c_int) -> Result<c_int> {
    if ret < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn open_socket() -> Result<OwnedFd> {
    let fd = check(unsafe {
        libc::socket(AF_BLUETOOTH, SOCK_SEQPACKET | SOCK_NONBLOCK | SOCK_CLOEXEC, BTPROTO_L2CAP)
    })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Reads back a socket address through `getsockname` or `getpeername`.
fn query_addr(
    fd: RawFd, f: unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int,
) -> Result<SocketAddr> {
    let mut raw = MaybeUninit::<RawSocketAddr>::uninit();
    let mut len = size_of::<RawSocketAddr>() as socklen_t;
    check(unsafe { f(fd, raw.as_mut_ptr() as *mut sockaddr, &mut len) })?;
    if len as usize != size_of::<RawSocketAddr>() {
        return Err(Error::new(ErrorKind::InvalidData, "short L2CAP socket address"));
    }
    SocketAddr::from_raw(unsafe { &raw.assume_init() })
}

fn accept_on(fd: RawFd) -> Result<(OwnedFd, SocketAddr)> {
    let mut raw = MaybeUninit::<RawSocketAddr>::uninit();
    let mut len = size_of::<RawSocketAddr>() as socklen_t;
    let conn = check(unsafe {
        libc::accept4(fd, raw.as_mut_ptr() as *mut sockaddr, &mut len, SOCK_NONBLOCK | SOCK_CLOEXEC)
    })?;
    let conn = unsafe { OwnedFd::from_raw_fd(conn) };
    if len as usize != size_of::<RawSocketAddr>() {
        return Err(Error::new(ErrorKind::InvalidData, "short L2CAP socket address"));
    }
    Ok((conn, SocketAddr::from_raw(unsafe { &raw.assume_init() })?))
}

/// An unconnected L2CAP socket, to be bound and configured before it is
/// turned into a [StreamListener].
pub struct Socket {
    fd: AsyncFd<OwnedFd>,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Socket").field("fd", &self.fd.as_raw_fd()).finish()
    }
}

impl Socket {
    /// Creates a new connection-oriented socket in non-blocking mode.
    pub fn new() -> Result<Socket> {
        Ok(Self { fd: AsyncFd::new(open_socket()?)? })
    }

    /// Binds the socket to the given address.
    pub fn bind(&self, sa: SocketAddr) -> Result<()> {
        let raw = sa.to_raw();
        check(unsafe {
            libc::bind(
                self.as_raw_fd(),
                &raw as *const _ as *const sockaddr,
                size_of::<RawSocketAddr>() as socklen_t,
            )
        })?;
        Ok(())
    }

    /// The address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        query_addr(self.as_raw_fd(), libc::getsockname)
    }

    /// Sets the `BT_SECURITY` socket option.
    pub fn set_security(&self, security: Security) -> Result<()> {
        let opt = RawSecurity { level: security.level as u8, key_size: security.key_size };
        check(unsafe {
            libc::setsockopt(
                self.as_raw_fd(),
                SOL_BLUETOOTH,
                BT_SECURITY,
                &opt as *const _ as *const _,
                size_of::<RawSecurity>() as socklen_t,
            )
        })?;
        Ok(())
    }

    /// Starts listening with the given backlog of not-yet-accepted
    /// connections.
    pub fn listen(self, backlog: u32) -> Result<StreamListener> {
        check(unsafe { libc::listen(self.as_raw_fd(), backlog.min(i32::MAX as u32) as c_int) })?;
        Ok(StreamListener { socket: self })
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// An L2CAP socket server, listening for connections.
pub struct StreamListener {
    socket: Socket,
}

impl fmt::Debug for StreamListener {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StreamListener").field("fd", &self.socket.as_raw_fd()).finish()
    }
}

impl StreamListener {
    /// Accepts a new incoming connection from this listener.
    ///
    /// The accepted socket is in non-blocking mode.
    pub async fn accept(&self) -> Result<(Stream, SocketAddr)> {
        loop {
            let mut guard = self.socket.fd.readable().await?;
            match guard.try_io(|fd| accept_on(fd.as_raw_fd())) {
                Ok(result) => {
                    let (fd, sa) = result?;
                    return Ok((Stream { fd: AsyncFd::new(fd)? }, sa));
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl AsRawFd for StreamListener {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// An accepted L2CAP connection.
///
/// The ATT state machine of the owning connection is driven elsewhere;
/// this type only carries the channel until it is attached.
pub struct Stream {
    fd: AsyncFd<OwnedFd>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Stream").field("fd", &self.fd.as_raw_fd()).finish()
    }
}

impl Stream {
    /// The local address of the connection.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        query_addr(self.fd.as_raw_fd(), libc::getsockname)
    }

    /// The address of the connected peer.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        query_addr(self.fd.as_raw_fd(), libc::getpeername)
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl IntoRawFd for Stream {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_inner().into_raw_fd()
    }
}
