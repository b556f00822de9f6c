//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![allow(clippy::single_match)]

use std::collections::BTreeSet;
use std::net::IpAddr;

use futures::channel::mpsc::UnboundedReceiver;
use futures::{StreamExt, TryStreamExt};
use ipnetwork::IpNetwork;
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{
    LinkAttribute, LinkFlags, LinkLayerType, LinkMessage,
};
use netlink_sys::{AsyncSocket, SocketAddr};
use querierd_utils::ibus::{IbusMsg, IbusSender};
use querierd_utils::southbound::{
    AddressFlags, AddressMsg, InterfaceFlags, InterfaceUpdateMsg,
};
use libc::{RTNLGRP_IPV4_IFADDR, RTNLGRP_LINK};
use rtnetlink::{Handle, new_connection};
use tracing::{trace, warn};

pub type NetlinkMonitor =
    UnboundedReceiver<(NetlinkMessage<RouteNetlinkMessage>, SocketAddr)>;

// ===== helper functions =====

fn process_newlink_msg(ibus_tx: &IbusSender, msg: LinkMessage) {
    trace!(?msg, "received RTM_NEWLINK message");

    // Fetch interface attributes.
    let ifindex = msg.header.index;
    let mut ifname = None;

    let mut flags = InterfaceFlags::empty();
    if msg.header.link_layer_type == LinkLayerType::Loopback {
        flags.insert(InterfaceFlags::LOOPBACK);
    }
    if msg.header.flags.contains(LinkFlags::Up) {
        flags.insert(InterfaceFlags::OPERATIVE);
    }
    if msg.header.flags.contains(LinkFlags::Multicast) {
        flags.insert(InterfaceFlags::MULTICAST);
    }
    for attr in msg.attributes.into_iter() {
        match attr {
            LinkAttribute::IfName(attr_ifname) => ifname = Some(attr_ifname),
            _ => (),
        }
    }
    let Some(ifname) = ifname else {
        return;
    };

    let _ = ibus_tx.send(IbusMsg::InterfaceUpd(InterfaceUpdateMsg {
        ifname,
        ifindex,
        flags,
    }));
}

fn process_dellink_msg(ibus_tx: &IbusSender, msg: LinkMessage) {
    trace!(?msg, "received RTM_DELLINK message");

    let _ = ibus_tx.send(IbusMsg::InterfaceDel(msg.header.index));
}

fn process_addr_msg(ibus_tx: &IbusSender, msg: AddressMessage, add: bool) {
    trace!(?msg, add, "received address message");

    // Fetch address attributes.
    let ifindex = msg.header.index;
    let prefix_len = msg.header.prefix_len;
    let mut addr = None;
    for attr in msg.attributes.into_iter() {
        match attr {
            AddressAttribute::Address(attr_addr) => addr = Some(attr_addr),
            _ => (),
        }
    }

    // Only IPv4 addresses are of interest.
    let Some(IpAddr::V4(addr)) = addr else {
        return;
    };
    let Ok(addr) = IpNetwork::new(addr.into(), prefix_len) else {
        return;
    };

    let msg = AddressMsg {
        ifindex,
        addr,
        flags: AddressFlags::empty(),
    };
    let msg = if add {
        IbusMsg::InterfaceAddressAdd(msg)
    } else {
        IbusMsg::InterfaceAddressDel(msg)
    };
    let _ = ibus_tx.send(msg);
}

fn process_msg(
    ibus_tx: &IbusSender,
    msg: NetlinkMessage<RouteNetlinkMessage>,
) {
    if let NetlinkPayload::InnerMessage(msg) = msg.payload {
        match msg {
            RouteNetlinkMessage::NewLink(msg) => {
                process_newlink_msg(ibus_tx, msg)
            }
            RouteNetlinkMessage::DelLink(msg) => {
                process_dellink_msg(ibus_tx, msg)
            }
            RouteNetlinkMessage::NewAddress(msg) => {
                process_addr_msg(ibus_tx, msg, true)
            }
            RouteNetlinkMessage::DelAddress(msg) => {
                process_addr_msg(ibus_tx, msg, false)
            }
            _ => (),
        }
    }
}

// Dumps all links and addresses, warning about configured interfaces the
// kernel doesn't know about.
async fn dump(
    handle: &Handle,
    ibus_tx: &IbusSender,
    config_ifaces: &[String],
) {
    let mut present = BTreeSet::new();

    // Fetch interface information.
    let mut links = handle.link().get().execute();
    while let Some(msg) = links
        .try_next()
        .await
        .expect("Failed to fetch interface information")
    {
        for attr in msg.attributes.iter() {
            if let LinkAttribute::IfName(ifname) = attr {
                present.insert(ifname.clone());
            }
        }
        process_newlink_msg(ibus_tx, msg);
    }

    for ifname in config_ifaces {
        if !present.contains(ifname) {
            warn!(interface = %ifname, "configured interface not present");
        }
    }

    // Fetch address information.
    let mut addresses = handle.address().get().execute();
    while let Some(msg) = addresses
        .try_next()
        .await
        .expect("Failed to fetch interface address information")
    {
        process_addr_msg(ibus_tx, msg, true);
    }
}

async fn init() -> (Handle, NetlinkMonitor) {
    // Create netlink socket.
    let (conn, handle, _) =
        new_connection().expect("Failed to create netlink socket");
    tokio::spawn(conn);

    // Start netlink monitor.
    let (mut conn, _, monitor) =
        new_connection().expect("Failed to create netlink socket");
    let groups = [RTNLGRP_LINK, RTNLGRP_IPV4_IFADDR]
        .iter()
        .map(|group| 1 << (group - 1))
        .fold(0, std::ops::BitOr::bitor);
    let addr = SocketAddr::new(0, groups);
    conn.socket_mut()
        .socket_mut()
        .bind(&addr)
        .expect("Failed to bind netlink socket");
    tokio::spawn(conn);

    (handle, monitor)
}

// ===== global functions =====

// Feeds kernel link and address state into the instance: an initial dump,
// then events from the netlink monitor.
pub(crate) async fn start(ibus_tx: IbusSender, config_ifaces: Vec<String>) {
    let (handle, mut monitor) = init().await;

    dump(&handle, &ibus_tx, &config_ifaces).await;

    while let Some((message, _)) = monitor.next().await {
        process_msg(&ibus_tx, message);
    }
}
