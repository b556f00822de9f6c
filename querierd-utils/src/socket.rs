//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;
use std::os::raw::{c_int, c_void};
use std::os::unix::io::AsRawFd;

use capctl::caps::CapState;
use libc::ip_mreqn;
use tracing::error;
// Normal build: re-export standard socket types.
#[cfg(not(feature = "testing"))]
pub use {socket2::Socket, tokio::io::unix::AsyncFd};

// Test build: export mock sockets.
#[cfg(feature = "testing")]
pub use crate::socket::mock::{AsyncFd, Socket};

// Useful type definition.
type Result<T> = std::io::Result<T>;

// Extension methods for all socket types.
pub trait SocketExt: Sized + AsRawFd {
    // Sets the value of the IP_TOS option for this socket.
    fn set_ipv4_tos(&self, tos: u8) -> Result<()> {
        let optval = tos as c_int;

        setsockopt(
            self,
            libc::IPPROTO_IP,
            libc::IP_TOS,
            &optval as *const _ as *const c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }

    // Sets the value of the IP_TTL option for this socket.
    fn set_ipv4_ttl(&self, ttl: u8) -> Result<()> {
        let optval = ttl as c_int;

        setsockopt(
            self,
            libc::IPPROTO_IP,
            libc::IP_TTL,
            &optval as *const _ as *const c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }

    // Sets the value of the IP_MULTICAST_IF option for this socket.
    fn set_multicast_ifindex_v4(&self, ifindex: u32) -> Result<()> {
        let optval = ip_mreqn {
            imr_multiaddr: libc::in_addr { s_addr: 0 },
            imr_address: libc::in_addr { s_addr: 0 },
            imr_ifindex: ifindex as i32,
        };

        setsockopt(
            self,
            libc::IPPROTO_IP,
            libc::IP_MULTICAST_IF,
            &optval as *const _ as *const c_void,
            std::mem::size_of::<ip_mreqn>() as libc::socklen_t,
        )
    }

    // Executes an operation of the IP_ADD_MEMBERSHIP type.
    fn join_multicast_ifindex_v4(
        &self,
        multiaddr: &Ipv4Addr,
        ifindex: u32,
    ) -> Result<()> {
        let multiaddr: u32 = (*multiaddr).into();

        let optval = ip_mreqn {
            imr_multiaddr: libc::in_addr {
                s_addr: multiaddr.to_be(),
            },
            imr_address: libc::in_addr { s_addr: 0 },
            imr_ifindex: ifindex as c_int,
        };

        setsockopt(
            self,
            libc::IPPROTO_IP,
            libc::IP_ADD_MEMBERSHIP,
            &optval as *const _ as *const c_void,
            std::mem::size_of::<ip_mreqn>() as libc::socklen_t,
        )
    }

    // Executes an operation of the IP_DROP_MEMBERSHIP type.
    fn leave_multicast_ifindex_v4(
        &self,
        multiaddr: &Ipv4Addr,
        ifindex: u32,
    ) -> Result<()> {
        let multiaddr: u32 = (*multiaddr).into();

        let optval = ip_mreqn {
            imr_multiaddr: libc::in_addr {
                s_addr: multiaddr.to_be(),
            },
            imr_address: libc::in_addr { s_addr: 0 },
            imr_ifindex: ifindex as c_int,
        };

        setsockopt(
            self,
            libc::IPPROTO_IP,
            libc::IP_DROP_MEMBERSHIP,
            &optval as *const _ as *const c_void,
            std::mem::size_of::<ip_mreqn>() as libc::socklen_t,
        )
    }
}

// Extension methods for raw IP sockets.
pub trait RawSocketExt: SocketExt {
    // Sets the value of the IP_PKTINFO option for this socket.
    fn set_ipv4_pktinfo(&self, value: bool) -> Result<()>;

    // Sets the value of the IP_HDRINCL option for this socket.
    fn set_ipv4_hdrincl(&self, value: bool) -> Result<()>;
}

// ===== impl Socket =====

#[cfg(not(feature = "testing"))]
impl SocketExt for Socket {}

#[cfg(not(feature = "testing"))]
impl RawSocketExt for Socket {
    fn set_ipv4_pktinfo(&self, value: bool) -> Result<()> {
        let optval = value as c_int;

        setsockopt(
            self,
            libc::IPPROTO_IP,
            libc::IP_PKTINFO,
            &optval as *const _ as *const c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }

    fn set_ipv4_hdrincl(&self, value: bool) -> Result<()> {
        let optval = value as c_int;

        setsockopt(
            self,
            libc::IPPROTO_IP,
            libc::IP_HDRINCL,
            &optval as *const _ as *const c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }
}

// ===== Mock sockets for unit testing =====

pub mod mock {
    #[derive(Debug, Default)]
    pub struct AsyncFd<T>(T);

    #[derive(Debug, Default)]
    pub struct Socket();

    impl<T> AsyncFd<T> {
        pub fn new(inner: T) -> std::io::Result<Self> {
            Ok(Self(inner))
        }

        pub fn get_ref(&self) -> &T {
            &self.0
        }
    }
}

// ===== global functions =====

/// Runs the provided closure with the process's permitted capabilities made
/// effective. Creating and binding the raw IGMP sockets are the only
/// privileged operations left after the daemon drops to an unprivileged
/// user.
pub fn with_capabilities<F, R>(cb: F) -> R
where
    F: FnOnce() -> R,
{
    let mut caps = match CapState::get_current() {
        Ok(caps) => caps,
        Err(error) => {
            error!(%error, "failed to read process capabilities");
            return cb();
        }
    };

    // Raise the permitted set into the effective set.
    caps.effective = caps.permitted;
    if let Err(error) = caps.set_current() {
        error!(%error, "failed to raise capabilities");
    }

    let ret = cb();

    // Clear the effective set again.
    caps.effective.clear();
    if let Err(error) = caps.set_current() {
        error!(%error, "failed to drop capabilities");
    }

    ret
}

fn setsockopt<F: AsRawFd>(
    sock: &F,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: libc::socklen_t,
) -> Result<()> {
    let ret = unsafe {
        libc::setsockopt(sock.as_raw_fd(), level, optname, optval, optlen)
    };
    if ret == -1 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(())
}
