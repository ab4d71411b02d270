//! Raw ICMP socket plumbing: creation, per-probe IP options and `recvmsg`
//! with hop-limit ancillary data.

use anyhow::{Context, Result, anyhow};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

/// Largest datagram we expect back (IP header + ICMP + quoted packet + payload)
pub const RECV_BUFFER_SIZE: usize = 65536;

/// Open a raw ICMP (or ICMPv6) socket.
///
/// Reads block for at most `read_slice` so a blocking receive can observe the
/// caller's deadline and cancellation between slices.
pub fn create_probe_socket(ipv6: bool, read_slice: Duration) -> Result<Socket> {
    let (domain, protocol) = if ipv6 {
        (Domain::IPV6, Protocol::ICMPV6)
    } else {
        (Domain::IPV4, Protocol::ICMPV4)
    };

    let socket = Socket::new(domain, Type::RAW, Some(protocol)).with_context(|| {
        format!(
            "Failed to open raw {} socket (needs CAP_NET_RAW)",
            if ipv6 { "ICMPv6" } else { "ICMP" }
        )
    })?;
    socket.set_nonblocking(false)?;
    socket.set_read_timeout(Some(read_slice))?;

    Ok(socket)
}

/// Fail early with a readable hint when raw ICMP sockets are unavailable.
/// A missing IPv6 stack only produces a warning.
pub fn check_permissions() -> Result<()> {
    if create_probe_socket(false, Duration::from_millis(1)).is_err() {
        return Err(anyhow!(
            "Insufficient permissions for raw ICMP sockets.\n\n\
             Fix: run as root, or grant the capability:\n  \
             sudo setcap cap_net_raw+ep $(which netdiag)"
        ));
    }
    if create_probe_socket(true, Duration::from_millis(1)).is_err() {
        tracing::warn!("Raw ICMPv6 socket unavailable; IPv6 probes will report internal errors");
    }
    Ok(())
}

/// Set the outgoing TTL (IPv4) or unicast hop limit (IPv6)
pub fn set_hop_limit(socket: &Socket, ttl: u8, ipv6: bool) -> Result<()> {
    if ipv6 {
        socket.set_unicast_hops_v6(ttl as u32)?;
    } else {
        socket.set_ttl(ttl as u32)?;
    }
    Ok(())
}

fn setsockopt_int(socket: &Socket, level: libc::c_int, name: libc::c_int, val: libc::c_int) -> Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            &val as *const _ as *const libc::c_void,
            std::mem::size_of_val(&val) as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Forbid fragmentation of outgoing probes.
/// - IPv4: IP_MTU_DISCOVER = IP_PMTUDISC_DO
/// - IPv6: IPV6_DONTFRAG = 1
#[cfg(target_os = "linux")]
pub fn set_dont_fragment(socket: &Socket, ipv6: bool) -> Result<()> {
    const IP_MTU_DISCOVER: libc::c_int = 10;
    const IP_PMTUDISC_DO: libc::c_int = 2;
    const IPV6_DONTFRAG: libc::c_int = 62;

    if ipv6 {
        setsockopt_int(socket, libc::IPPROTO_IPV6, IPV6_DONTFRAG, 1)
    } else {
        setsockopt_int(socket, libc::IPPROTO_IP, IP_MTU_DISCOVER, IP_PMTUDISC_DO)
    }
}

/// Forbid fragmentation of outgoing probes (IP_DONTFRAG / IPV6_DONTFRAG).
#[cfg(target_os = "macos")]
pub fn set_dont_fragment(socket: &Socket, ipv6: bool) -> Result<()> {
    const IP_DONTFRAG: libc::c_int = 28;
    const IPV6_DONTFRAG: libc::c_int = 62;

    if ipv6 {
        setsockopt_int(socket, libc::IPPROTO_IPV6, IPV6_DONTFRAG, 1)
    } else {
        setsockopt_int(socket, libc::IPPROTO_IP, IP_DONTFRAG, 1)
    }
}

/// Ask the kernel to attach the reply's TTL / hop limit as ancillary data.
/// Raw IPv4 sockets already see the IP header, so this matters for IPv6.
pub fn enable_recv_hop_limit(socket: &Socket, ipv6: bool) -> Result<()> {
    #[cfg(target_os = "linux")]
    const IP_RECVTTL: libc::c_int = 12;
    #[cfg(target_os = "linux")]
    const IPV6_RECVHOPLIMIT: libc::c_int = 51;
    #[cfg(target_os = "macos")]
    const IP_RECVTTL: libc::c_int = 24;
    #[cfg(target_os = "macos")]
    const IPV6_RECVHOPLIMIT: libc::c_int = 37;

    if ipv6 {
        setsockopt_int(socket, libc::IPPROTO_IPV6, IPV6_RECVHOPLIMIT, 1)
    } else {
        setsockopt_int(socket, libc::IPPROTO_IP, IP_RECVTTL, 1)
    }
}

pub fn send_to(socket: &Socket, packet: &[u8], target: IpAddr) -> Result<usize> {
    let sent = socket.send_to(packet, &SockAddr::from(SocketAddr::new(target, 0)))?;
    Ok(sent)
}

/// One received datagram
#[derive(Debug)]
pub struct Datagram {
    pub len: usize,
    pub source: IpAddr,
    /// TTL / hop limit from ancillary data, when the kernel supplied it
    pub hop_limit: Option<u8>,
}

/// Blocking `recvmsg`. Returns `Ok(None)` when the read slice elapsed
/// without traffic.
pub fn recv_datagram(socket: &Socket, buffer: &mut [u8], ipv6: bool) -> Result<Option<Datagram>> {
    let mut iov = libc::iovec {
        iov_base: buffer.as_mut_ptr() as *mut libc::c_void,
        iov_len: buffer.len(),
    };
    let mut cmsg_buf = [0u8; 64];
    let mut src_storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = &mut src_storage as *mut _ as *mut libc::c_void;
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    // usize on Linux, u32 on macOS
    msg.msg_controllen = cmsg_buf.len() as _;

    let len = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, 0) };
    if len < 0 {
        let err = std::io::Error::last_os_error();
        return match err.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => Ok(None),
            _ => Err(err.into()),
        };
    }

    Ok(Some(Datagram {
        len: len as usize,
        source: sockaddr_to_ip(&src_storage)?,
        hop_limit: hop_limit_from_cmsg(&msg, ipv6),
    }))
}

fn hop_limit_from_cmsg(msg: &libc::msghdr, ipv6: bool) -> Option<u8> {
    // Linux delivers IP_TTL (2); macOS may use IP_TTL (4) or IP_RECVTTL (24)
    #[cfg(target_os = "linux")]
    const V4_TYPES: &[libc::c_int] = &[2];
    #[cfg(target_os = "macos")]
    const V4_TYPES: &[libc::c_int] = &[4, 24];

    let wanted = |hdr: &libc::cmsghdr| {
        if ipv6 {
            hdr.cmsg_level == libc::IPPROTO_IPV6 && hdr.cmsg_type == libc::IPV6_HOPLIMIT
        } else {
            hdr.cmsg_level == libc::IPPROTO_IP && V4_TYPES.contains(&hdr.cmsg_type)
        }
    };

    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            if wanted(&*cmsg) {
                let value = *(libc::CMSG_DATA(cmsg) as *const libc::c_int);
                return u8::try_from(value).ok();
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
    None
}

fn sockaddr_to_ip(storage: &libc::sockaddr_storage) -> Result<IpAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr: &libc::sockaddr_in = unsafe { &*(storage as *const _ as *const _) };
            Ok(IpAddr::V4(Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr))))
        }
        libc::AF_INET6 => {
            let addr: &libc::sockaddr_in6 = unsafe { &*(storage as *const _ as *const _) };
            Ok(IpAddr::V6(Ipv6Addr::from(addr.sin6_addr.s6_addr)))
        }
        family => Err(anyhow!("Unknown address family: {}", family)),
    }
}
