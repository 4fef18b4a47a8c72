//! Socket helpers, including transparent proxying.
//!
//! Transparent mode lets the tunnel accept traffic addressed to arbitrary
//! third parties and, on the far side, originate traffic from the original
//! client's address. On Linux this needs `IP_TRANSPARENT` (CAP_NET_ADMIN) and
//! matching TPROXY/REDIRECT rules; original destinations come from
//! `SO_ORIGINAL_DST` for TCP and `IP_ORIGDSTADDR` control messages for UDP.
//! Other platforms report [`TproxyError::Unsupported`].

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};

/// Listen backlog for tunnel listeners
const LISTEN_BACKLOG: i32 = 1024;

/// Transparent proxy errors
#[derive(Debug, thiserror::Error)]
pub enum TproxyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("permission denied setting IP_TRANSPARENT (needs CAP_NET_ADMIN)")]
    PermissionDenied,

    #[error("failed to set {option}: {source}")]
    SocketOption {
        option: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("original destination unavailable: {0}")]
    OriginalDst(String),

    #[error("transparent proxying is not supported on this platform")]
    Unsupported,
}

#[cfg(target_os = "linux")]
mod sys {
    use super::TproxyError;
    use std::io;
    use std::mem;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::os::fd::RawFd;

    const IP_TRANSPARENT: libc::c_int = 19;
    const SO_ORIGINAL_DST: libc::c_int = 80;
    const IP_RECVORIGDSTADDR: libc::c_int = 20;
    const CMSG_BUFFER_SIZE: usize = 64;

    fn set_flag(fd: RawFd, option: libc::c_int, name: &'static str) -> Result<(), TproxyError> {
        let one: libc::c_int = 1;
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_IP,
                option,
                std::ptr::addr_of!(one).cast::<libc::c_void>(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EPERM) {
                return Err(TproxyError::PermissionDenied);
            }
            return Err(TproxyError::SocketOption {
                option: name,
                source: err,
            });
        }
        Ok(())
    }

    pub fn set_ip_transparent(fd: RawFd) -> Result<(), TproxyError> {
        set_flag(fd, IP_TRANSPARENT, "IP_TRANSPARENT")
    }

    pub fn set_ip_recvorigdstaddr(fd: RawFd) -> Result<(), TproxyError> {
        set_flag(fd, IP_RECVORIGDSTADDR, "IP_RECVORIGDSTADDR")
    }

    fn from_sockaddr_in(addr: &libc::sockaddr_in) -> SocketAddrV4 {
        let port = u16::from_be(addr.sin_port);
        let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        SocketAddrV4::new(ip, port)
    }

    pub fn original_dst(fd: RawFd) -> Result<SocketAddrV4, TproxyError> {
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_IP,
                SO_ORIGINAL_DST,
                std::ptr::addr_of_mut!(addr).cast::<libc::c_void>(),
                std::ptr::addr_of_mut!(len),
            )
        };
        if ret != 0 {
            let err = io::Error::last_os_error();
            return Err(TproxyError::OriginalDst(format!(
                "getsockopt SO_ORIGINAL_DST failed: {err}"
            )));
        }
        Ok(from_sockaddr_in(&addr))
    }

    pub fn recv_with_original_dst(
        fd: RawFd,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddrV4, SocketAddrV4)> {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
            iov_len: buf.len(),
        };
        let mut src_addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        // u64 elements keep the control buffer aligned for cmsghdr
        let mut cmsg_buf = [0u64; CMSG_BUFFER_SIZE / 8];

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = std::ptr::addr_of_mut!(src_addr).cast::<libc::c_void>();
        msg.msg_namelen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        msg.msg_iov = std::ptr::addr_of_mut!(iov);
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
        msg.msg_controllen = CMSG_BUFFER_SIZE as _;

        let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if (msg.msg_flags & libc::MSG_CTRUNC) != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "control message truncated",
            ));
        }

        let src = from_sockaddr_in(&src_addr);
        let mut dst = None;
        let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        while !cmsg.is_null() {
            let hdr = unsafe { &*cmsg };
            if hdr.cmsg_level == libc::SOL_IP && hdr.cmsg_type == IP_RECVORIGDSTADDR {
                let addr: libc::sockaddr_in =
                    unsafe { std::ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast()) };
                dst = Some(from_sockaddr_in(&addr));
                break;
            }
            cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
        }

        let dst = dst.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                "original destination missing from control messages",
            )
        })?;
        Ok((n as usize, src, dst))
    }
}

#[cfg(target_os = "linux")]
fn make_transparent(socket: &Socket) -> Result<(), TproxyError> {
    use std::os::fd::AsRawFd;
    sys::set_ip_transparent(socket.as_raw_fd())
}

#[cfg(not(target_os = "linux"))]
fn make_transparent(_socket: &Socket) -> Result<(), TproxyError> {
    Err(TproxyError::Unsupported)
}

/// Bind a TCP listener, optionally with `IP_TRANSPARENT`
pub fn tcp_listener(addr: SocketAddrV4, transparent: bool) -> Result<TcpListener, TproxyError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if transparent {
        make_transparent(&socket)?;
    }
    socket.bind(&SocketAddr::V4(addr).into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into())?)
}

/// Connect to `remote`, impersonating `source` when given
pub async fn tcp_connect(
    source: Option<SocketAddrV4>,
    remote: SocketAddrV4,
) -> Result<TcpStream, TproxyError> {
    let Some(source) = source else {
        return Ok(TcpStream::connect(remote).await?);
    };

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    make_transparent(&socket)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::V4(source).into())?;
    socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(socket.into());
    Ok(socket.connect(SocketAddr::V4(remote)).await?)
}

/// Bind a UDP socket.
///
/// `transparent` allows binding a foreign address and, for listeners, asks
/// the kernel to report each datagram's original destination.
pub fn udp_socket(addr: SocketAddrV4, transparent: bool) -> Result<UdpSocket, TproxyError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if transparent {
        make_transparent(&socket)?;
        #[cfg(target_os = "linux")]
        {
            use std::os::fd::AsRawFd;
            sys::set_ip_recvorigdstaddr(socket.as_raw_fd())?;
        }
    }
    socket.bind(&SocketAddr::V4(addr).into())?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Destination the client originally addressed before redirection
pub fn original_dst(stream: &TcpStream) -> Result<SocketAddrV4, TproxyError> {
    #[cfg(target_os = "linux")]
    {
        use std::os::fd::AsRawFd;
        sys::original_dst(stream.as_raw_fd())
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = stream;
        Err(TproxyError::Unsupported)
    }
}

/// Receive one datagram with its source and original destination.
///
/// The socket must come from [`udp_socket`] with `transparent` set.
pub async fn recv_with_original_dst(
    socket: &UdpSocket,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddrV4, SocketAddrV4)> {
    #[cfg(target_os = "linux")]
    {
        use std::os::fd::AsRawFd;
        let fd = socket.as_raw_fd();
        loop {
            socket.readable().await?;
            match socket.try_io(tokio::io::Interest::READABLE, || {
                sys::recv_with_original_dst(fd, &mut *buf)
            }) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                other => return other,
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (socket, buf);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "transparent proxying is not supported on this platform",
        ))
    }
}

/// Apply SO_RCVBUF / SO_SNDBUF; zero leaves the system default
pub fn set_buffer_sizes(sock: SockRef<'_>, recv: usize, send: usize) -> io::Result<()> {
    if recv > 0 {
        sock.set_recv_buffer_size(recv)?;
    }
    if send > 0 {
        sock.set_send_buffer_size(send)?;
    }
    Ok(())
}

/// Reset the connection instead of closing it gracefully
pub fn force_close(stream: TcpStream) {
    let _ = SockRef::from(&stream).set_linger(Some(Duration::ZERO));
    drop(stream);
}
