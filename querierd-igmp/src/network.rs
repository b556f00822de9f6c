//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

#[cfg(not(feature = "testing"))]
use std::io::{IoSlice, IoSliceMut};
#[cfg(not(feature = "testing"))]
use std::net::{Ipv4Addr, SocketAddrV4};
#[cfg(not(feature = "testing"))]
use std::ops::Deref;
#[cfg(not(feature = "testing"))]
use std::os::fd::AsRawFd;
#[cfg(not(feature = "testing"))]
use std::sync::Arc;

#[cfg(not(feature = "testing"))]
use bytes::Bytes;
#[cfg(not(feature = "testing"))]
use nix::sys::socket::{self, SockaddrIn};
use querierd_utils::socket::Socket;
#[cfg(not(feature = "testing"))]
use querierd_utils::socket::{AsyncFd, RawSocketExt, with_capabilities};
#[cfg(not(feature = "testing"))]
use tokio::sync::mpsc::error::SendError;
#[cfg(not(feature = "testing"))]
use tokio::sync::mpsc::{Sender, UnboundedReceiver};

#[cfg(not(feature = "testing"))]
use crate::consts::{IGMP_IP_PROTO, RECV_BUF_SIZE};
#[cfg(not(feature = "testing"))]
use crate::error::IoError;
#[cfg(not(feature = "testing"))]
use crate::packet::{Ipv4Hdr, Packet};
#[cfg(not(feature = "testing"))]
use crate::tasks::messages::input::{NetRxPacketMsg, NetTxFailureMsg};
#[cfg(not(feature = "testing"))]
use crate::tasks::messages::output::NetTxPacketMsg;

// ===== global functions =====

// Shared receive socket, one per instance. The ingress interface of each
// packet is recovered from IP_PKTINFO ancillary data.
pub(crate) fn socket_rx() -> Result<Socket, std::io::Error> {
    #[cfg(not(feature = "testing"))]
    {
        use socket2::{Domain, Protocol, Type};

        // Create raw socket.
        let socket = with_capabilities(|| {
            Socket::new(
                Domain::IPV4,
                Type::RAW,
                Some(Protocol::from(IGMP_IP_PROTO)),
            )
        })?;
        socket.set_nonblocking(true)?;
        socket.set_ipv4_pktinfo(true)?;

        Ok(socket)
    }
    #[cfg(feature = "testing")]
    {
        Ok(Socket::default())
    }
}

// Per-interface transmit socket. The IPv4 header is built by the packet
// codec (Router Alert, TOS and TTL control), so IP_HDRINCL is set.
pub(crate) fn socket_tx(ifname: &str) -> Result<Socket, std::io::Error> {
    #[cfg(not(feature = "testing"))]
    {
        use socket2::{Domain, Protocol, Type};

        // Create raw socket.
        let socket = with_capabilities(|| {
            Socket::new(
                Domain::IPV4,
                Type::RAW,
                Some(Protocol::from(IGMP_IP_PROTO)),
            )
        })?;
        with_capabilities(|| socket.bind_device(Some(ifname.as_bytes())))?;
        socket.set_nonblocking(true)?;
        socket.set_ipv4_hdrincl(true)?;

        Ok(socket)
    }
    #[cfg(feature = "testing")]
    {
        Ok(Socket::default())
    }
}

#[cfg(not(feature = "testing"))]
pub(crate) async fn read_loop(
    socket: Arc<AsyncFd<Socket>>,
    net_packet_rxp: Sender<NetRxPacketMsg>,
) -> Result<(), SendError<NetRxPacketMsg>> {
    let mut buf = [0; RECV_BUF_SIZE];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsgspace = nix::cmsg_space!(libc::in_pktinfo);

    loop {
        // Receive data packet.
        match socket
            .async_io(tokio::io::Interest::READABLE, |socket| {
                match socket::recvmsg::<SockaddrIn>(
                    socket.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsgspace),
                    socket::MsgFlags::empty(),
                ) {
                    Ok(msg) => {
                        let ifindex = msg.cmsgs().unwrap().find_map(|cmsg| {
                            if let socket::ControlMessageOwned::Ipv4PacketInfo(
                                pktinfo,
                            ) = cmsg
                            {
                                Some(pktinfo.ipi_ifindex as u32)
                            } else {
                                None
                            }
                        });
                        Ok((ifindex, msg.bytes))
                    }
                    Err(errno) => Err(errno.into()),
                }
            })
            .await
        {
            Ok((ifindex, bytes)) => {
                let Some(ifindex) = ifindex else {
                    IoError::RecvMissingAncillaryData.log();
                    continue;
                };

                // Decode the full IP frame; the source and destination
                // addresses come from the header.
                let mut buf = Bytes::copy_from_slice(&iov[0].deref()[0..bytes]);
                let msg = match Ipv4Hdr::decode(&mut buf) {
                    Ok(hdr) => NetRxPacketMsg {
                        ifindex,
                        src: hdr.src,
                        dst: hdr.dst,
                        packet: Packet::decode(&mut buf),
                    },
                    Err(error) => NetRxPacketMsg {
                        ifindex,
                        src: Ipv4Addr::UNSPECIFIED,
                        dst: Ipv4Addr::UNSPECIFIED,
                        packet: Err(error),
                    },
                };
                net_packet_rxp.send(msg).await?;
            }
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {
                // Retry if the syscall was interrupted (EINTR).
                continue;
            }
            Err(error) => {
                IoError::RecvError(error).log();
            }
        }
    }
}

#[cfg(not(feature = "testing"))]
pub(crate) async fn write_loop(
    socket: Arc<AsyncFd<Socket>>,
    ifindex: u32,
    mut net_tx_packetc: UnboundedReceiver<NetTxPacketMsg>,
    net_tx_failurep: Sender<NetTxFailureMsg>,
) {
    while let Some(NetTxPacketMsg {
        src,
        dst,
        router_alert,
        packet,
    }) = net_tx_packetc.recv().await
    {
        // Send packet out the interface.
        if let Err(error) =
            send_packet(&socket, src, dst, router_alert, &packet).await
        {
            // A dead link warrants an interface state recheck.
            if let IoError::SendError(io_error) = &error
                && io_error.raw_os_error() == Some(libc::ENETDOWN)
            {
                let _ = net_tx_failurep.send(NetTxFailureMsg { ifindex }).await;
            }
            error.log();
        }
    }
}

// ===== helper functions =====

#[cfg(not(feature = "testing"))]
async fn send_packet(
    socket: &AsyncFd<Socket>,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    router_alert: bool,
    packet: &Packet,
) -> Result<usize, IoError> {
    // Encode the full IP frame.
    let buf = packet.encode_ipv4(src, dst, router_alert);

    // Send packet.
    let iov = [IoSlice::new(&buf)];
    let sockaddr: SockaddrIn = SocketAddrV4::new(dst, 0).into();
    socket
        .async_io(tokio::io::Interest::WRITABLE, |socket| {
            socket::sendmsg(
                socket.as_raw_fd(),
                &iov,
                &[],
                socket::MsgFlags::empty(),
                Some(&sockaddr),
            )
            .map_err(|errno| errno.into())
        })
        .await
        .map_err(IoError::SendError)
}
