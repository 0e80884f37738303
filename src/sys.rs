//! Platform socket plumbing.
//!
//! Everything here speaks BSD sockets through [`socket2`], with raw
//! `setsockopt` calls for the options socket2 does not cover. Options that
//! do not exist on the running platform report [`Error::NotImplemented`]
//! and never fail the socket; callers apply them best-effort.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
use std::os::unix::io::AsRawFd;

use socket2::{Domain, Protocol, Socket, Type};

use crate::errors::Result;

/// Receive/send kernel buffer sizes, zero meaning the system default.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct BufSizes {
    pub(crate) recv: usize,
    pub(crate) send: usize,
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn setsockopt<T>(fd: libc::c_int, level: libc::c_int, opt: libc::c_int, val: T) -> io::Result<()> {
    let payload = &val as *const T as *const libc::c_void;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            payload,
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// SO_REUSEPORT with kernel load balancing across the listening sockets
/// (SO_REUSEPORT_LB on FreeBSD). This is what lets every worker own its own
/// listening descriptor bound to the same address.
pub(crate) fn set_reuse_lb(sock: &Socket) -> Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        sock.set_reuse_port(true)?;
        Ok(())
    }
    #[cfg(target_os = "freebsd")]
    {
        setsockopt(sock.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEPORT_LB, 1 as libc::c_int)?;
        Ok(())
    }
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        let _ = sock;
        Err(crate::errors::Error::NotImplemented)
    }
}

/// IP_FREEBIND (IP_BINDANY elsewhere): allows binding addresses that are
/// not yet configured on any interface.
pub(crate) fn set_freebind(sock: &Socket, v6: bool) -> Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let level = if v6 { libc::IPPROTO_IPV6 } else { libc::IPPROTO_IP };
        setsockopt(sock.as_raw_fd(), level, libc::IP_FREEBIND, 1 as libc::c_int)?;
        Ok(())
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let _ = (sock, v6);
        Err(crate::errors::Error::NotImplemented)
    }
}

/// Forbid fragmentation of outgoing datagrams (path-MTU discovery on
/// Linux, IP_DONTFRAG where that exists instead).
pub(crate) fn set_dontfrag(sock: &Socket, v6: bool) -> Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        const IPV6_MTU_DISCOVER: libc::c_int = 23;
        const IPV6_PMTUDISC_DO: libc::c_int = 2;
        if v6 {
            setsockopt(sock.as_raw_fd(), libc::IPPROTO_IPV6, IPV6_MTU_DISCOVER, IPV6_PMTUDISC_DO)?;
        } else {
            setsockopt(
                sock.as_raw_fd(),
                libc::IPPROTO_IP,
                libc::IP_MTU_DISCOVER,
                libc::IP_PMTUDISC_DO,
            )?;
        }
        Ok(())
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let _ = (sock, v6);
        Err(crate::errors::Error::NotImplemented)
    }
}

/// Caps how long the kernel retries an unacknowledged connection
/// (TCP_USER_TIMEOUT; TCP_KEEPINIT / TCP_CONNECTIONTIMEOUT are the
/// equivalents elsewhere and are not wired up).
pub(crate) fn set_tcp_connect_timeout(sock: &Socket, timeout_ms: u64) -> Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        setsockopt(
            sock.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_USER_TIMEOUT,
            timeout_ms as libc::c_uint,
        )?;
        Ok(())
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let _ = (sock, timeout_ms);
        Err(crate::errors::Error::NotImplemented)
    }
}

/// Hints the kernel to deliver events for this socket on the CPU running
/// its worker.
pub(crate) fn set_incoming_cpu(sock: &Socket, cpu: usize) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        setsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_INCOMING_CPU,
            cpu as libc::c_int,
        )?;
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (sock, cpu);
        Err(crate::errors::Error::NotImplemented)
    }
}

fn apply_buf_sizes(sock: &Socket, sizes: BufSizes) {
    if sizes.recv != 0 {
        let _ = sock.set_recv_buffer_size(sizes.recv);
    }
    if sizes.send != 0 {
        let _ = sock.set_send_buffer_size(sizes.send);
    }
}

fn bound_tcp_listener(addr: SocketAddr, backlog: u32, sizes: BufSizes) -> io::Result<(TcpListener, bool)> {
    let sock = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    sock.set_nonblocking(true)?;
    sock.set_reuse_address(true)?;
    let lb = set_reuse_lb(&sock).is_ok();
    let _ = set_freebind(&sock, addr.is_ipv6());
    apply_buf_sizes(&sock, sizes);
    sock.bind(&addr.into())?;
    sock.listen(backlog as i32)?;
    Ok((sock.into(), lb))
}

/// Opens one listening TCP socket per worker, all bound to `addr`. With
/// load-balancing port reuse each worker gets its own descriptor; without
/// it the first descriptor is `dup()`ed for the rest. Returns the resolved
/// local address (port 0 is resolved by the first bind).
pub(crate) fn tcp_listen_fanout(
    addr: SocketAddr,
    n: usize,
    backlog: u32,
    sizes: BufSizes,
) -> io::Result<(Vec<TcpListener>, SocketAddr)> {
    let (first, lb) = bound_tcp_listener(addr, backlog, sizes)?;
    let resolved = first.local_addr()?;
    let mut out = Vec::with_capacity(n);
    out.push(first);
    for cpu in 1..n {
        let sock = if lb {
            let (l, _) = bound_tcp_listener(resolved, backlog, sizes)?;
            l
        } else {
            out[0].try_clone()?
        };
        let _ = set_incoming_cpu(&Socket::from(sock.try_clone()?), cpu);
        out.push(sock);
    }
    Ok((out, resolved))
}

fn bound_udp(addr: SocketAddr, sizes: BufSizes) -> io::Result<(UdpSocket, bool)> {
    let sock = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_nonblocking(true)?;
    sock.set_reuse_address(true)?;
    let lb = set_reuse_lb(&sock).is_ok();
    let _ = set_freebind(&sock, addr.is_ipv6());
    let _ = set_dontfrag(&sock, addr.is_ipv6());
    apply_buf_sizes(&sock, sizes);
    sock.bind(&addr.into())?;
    Ok((sock.into(), lb))
}

/// UDP equivalent of [`tcp_listen_fanout`].
pub(crate) fn udp_listen_fanout(
    addr: SocketAddr,
    n: usize,
    sizes: BufSizes,
) -> io::Result<(Vec<UdpSocket>, SocketAddr)> {
    let (first, lb) = bound_udp(addr, sizes)?;
    let resolved = first.local_addr()?;
    let mut out = Vec::with_capacity(n);
    out.push(first);
    for _ in 1..n {
        let sock = if lb {
            let (s, _) = bound_udp(resolved, sizes)?;
            s
        } else {
            out[0].try_clone()?
        };
        out.push(sock);
    }
    Ok((out, resolved))
}

fn in_progress(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EINPROGRESS)
}

/// Starts a non-blocking TCP connect. Completion (or failure) is observed
/// through the event loop via writability.
pub(crate) fn tcp_connect(
    local: Option<SocketAddr>,
    peer: SocketAddr,
    sizes: BufSizes,
    timeout_ms: u64,
) -> io::Result<TcpStream> {
    let sock = Socket::new(Domain::for_address(peer), Type::STREAM, Some(Protocol::TCP))?;
    sock.set_nonblocking(true)?;
    let _ = sock.set_tcp_nodelay(true);
    apply_buf_sizes(&sock, sizes);
    if timeout_ms != 0 {
        let _ = set_tcp_connect_timeout(&sock, timeout_ms);
    }
    if let Some(local) = local {
        sock.set_reuse_address(true)?;
        sock.bind(&local.into())?;
    }
    match sock.connect(&peer.into()) {
        Ok(()) => {}
        Err(ref e) if in_progress(e) => {}
        Err(e) => return Err(e),
    }
    Ok(sock.into())
}

/// Creates a connected (filtered to one peer) non-blocking UDP socket.
pub(crate) fn udp_connect(
    local: Option<SocketAddr>,
    peer: SocketAddr,
    sizes: BufSizes,
) -> io::Result<UdpSocket> {
    let sock = Socket::new(Domain::for_address(peer), Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_nonblocking(true)?;
    let _ = set_dontfrag(&sock, peer.is_ipv6());
    apply_buf_sizes(&sock, sizes);
    if let Some(local) = local {
        sock.bind(&local.into())?;
    }
    sock.connect(&peer.into())?;
    Ok(sock.into())
}

/// Pins the calling worker thread to a core, best effort.
pub(crate) fn pin_thread(tid: usize) {
    if let Some(ids) = core_affinity::get_core_ids() {
        if !ids.is_empty() {
            core_affinity::set_for_current(ids[tid % ids.len()]);
        }
    }
}
