//! `AF_QIPCRTR` socket plumbing.
//!
//! The QRTR address family is a plain datagram family: sockets are unbound
//! until first use, addresses are `(node, port)` pairs, and the kernel
//! handles routing between local and remote processors. Everything here is a
//! thin readiness-driven wrapper: a non-blocking file descriptor registered
//! with the tokio reactor through [`AsyncFd`], with the sockaddr encoded and
//! decoded field by field.

use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;

/// Address family of the Qualcomm IPC router.
///
/// Portability shim: some system headers ship the `qrtr` UAPI without the
/// address family macro, so the value is pinned here instead of being read
/// from `libc`.
pub const AF_QIPCRTR: libc::c_int = 42;

/// Well-known control port present on every node.
pub const QRTR_PORT_CTRL: u32 = 0xffff_fffe;

/// A `(node, port)` pair addressing one endpoint on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QrtrAddress {
    pub node: u32,
    pub port: u32,
}

/// Mirror of the kernel's `struct sockaddr_qrtr`.
#[repr(C)]
#[derive(Clone, Copy)]
struct SockaddrQrtr {
    sq_family: libc::sa_family_t,
    sq_node: u32,
    sq_port: u32,
}

impl QrtrAddress {
    fn to_raw(self) -> SockaddrQrtr {
        SockaddrQrtr {
            sq_family: AF_QIPCRTR as libc::sa_family_t,
            sq_node: self.node,
            sq_port: self.port,
        }
    }

    /// `None` when the kernel reported an address outside the QRTR family.
    fn from_raw(raw: &SockaddrQrtr) -> Option<Self> {
        if libc::c_int::from(raw.sq_family) != AF_QIPCRTR {
            return None;
        }
        Some(Self {
            node: raw.sq_node,
            port: raw.sq_port,
        })
    }
}

/// Seam between the bus driver and the kernel, so the decode loop can run
/// against an in-memory packet source in tests.
#[async_trait]
pub(crate) trait ControlSocket: Send + 'static {
    fn local_address(&self) -> io::Result<QrtrAddress>;

    async fn send_to(&self, buf: &[u8], addr: QrtrAddress) -> io::Result<usize>;

    /// Receive exactly one datagram into `buf`, truncating oversized ones.
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Seam between a client channel and the kernel. Shared-reference variant of
/// [`ControlSocket`]: the client handle sends while its receive task reads
/// the same socket, and tests swap in an in-memory endpoint.
#[async_trait]
pub(crate) trait MessageSocket: Send + Sync + 'static {
    async fn send_to(&self, buf: &[u8], addr: QrtrAddress) -> io::Result<usize>;

    /// Receive one datagram and its sender; the address is `None` for a
    /// non-QRTR source.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Option<QrtrAddress>)>;
}

/// A non-blocking `AF_QIPCRTR` datagram socket.
pub struct QrtrSocket {
    inner: AsyncFd<OwnedFd>,
}

impl QrtrSocket {
    /// Open an unbound QRTR datagram socket and register it with the
    /// reactor. Fails with the raw OS error when the kernel lacks QRTR
    /// support.
    pub fn new() -> io::Result<Self> {
        let raw = unsafe {
            libc::socket(
                AF_QIPCRTR,
                libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // socket() returned a fresh descriptor we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Self {
            inner: AsyncFd::new(fd)?,
        })
    }

    /// The local `(node, port)` the kernel assigned to this socket.
    pub fn local_address(&self) -> io::Result<QrtrAddress> {
        let mut raw: SockaddrQrtr = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<SockaddrQrtr>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                self.inner.get_ref().as_raw_fd(),
                (&mut raw as *mut SockaddrQrtr).cast(),
                &mut len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        QrtrAddress::from_raw(&raw).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                "socket address is not AF_QIPCRTR",
            )
        })
    }

    /// Send one datagram to `addr`.
    pub async fn send_to(&self, buf: &[u8], addr: QrtrAddress) -> io::Result<usize> {
        let raw = addr.to_raw();
        loop {
            let mut guard = self.inner.writable().await?;
            let result = guard.try_io(|fd| {
                let n = unsafe {
                    libc::sendto(
                        fd.get_ref().as_raw_fd(),
                        buf.as_ptr().cast(),
                        buf.len(),
                        0,
                        (&raw as *const SockaddrQrtr).cast(),
                        mem::size_of::<SockaddrQrtr>() as libc::socklen_t,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(io_result) => return io_result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive one datagram, reporting the sender. The address is `None`
    /// when the kernel hands back a non-QRTR source.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Option<QrtrAddress>)> {
        loop {
            let mut guard = self.inner.readable().await?;
            let result = guard.try_io(|fd| {
                let mut raw: SockaddrQrtr = unsafe { mem::zeroed() };
                let mut len = mem::size_of::<SockaddrQrtr>() as libc::socklen_t;
                let n = unsafe {
                    libc::recvfrom(
                        fd.get_ref().as_raw_fd(),
                        buf.as_mut_ptr().cast(),
                        buf.len(),
                        0,
                        (&mut raw as *mut SockaddrQrtr).cast(),
                        &mut len,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok((n as usize, QrtrAddress::from_raw(&raw)))
                }
            });
            match result {
                Ok(io_result) => return io_result,
                Err(_would_block) => continue,
            }
        }
    }
}

#[async_trait]
impl ControlSocket for QrtrSocket {
    fn local_address(&self) -> io::Result<QrtrAddress> {
        QrtrSocket::local_address(self)
    }

    async fn send_to(&self, buf: &[u8], addr: QrtrAddress) -> io::Result<usize> {
        QrtrSocket::send_to(self, buf, addr).await
    }

    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (n, _from) = QrtrSocket::recv_from(self, buf).await?;
        Ok(n)
    }
}

#[async_trait]
impl MessageSocket for QrtrSocket {
    async fn send_to(&self, buf: &[u8], addr: QrtrAddress) -> io::Result<usize> {
        QrtrSocket::send_to(self, buf, addr).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Option<QrtrAddress>)> {
        QrtrSocket::recv_from(self, buf).await
    }
}
