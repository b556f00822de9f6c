//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use ipnetwork::IpNetwork;
use querierd_utils::southbound::{
    AddressFlags, AddressMsg, InterfaceFlags, InterfaceUpdateMsg,
};

use crate::debug::InterfaceInactiveReason;
use crate::instance::Instance;

// ===== global functions =====

pub(crate) fn process_iface_update(
    instance: &mut Instance,
    msg: InterfaceUpdateMsg,
) {
    // Loopback and non-multicast-capable interfaces are of no interest.
    if msg.flags.contains(InterfaceFlags::LOOPBACK)
        || !msg.flags.contains(InterfaceFlags::MULTICAST)
    {
        return;
    }

    // Add or update interface. Newly learned interfaces pick up their
    // configuration by name.
    let config = instance
        .config
        .interfaces
        .get(&msg.ifname)
        .cloned()
        .unwrap_or_default();
    let iface = instance.interfaces.add(&msg.ifname, msg.ifindex, config);
    let ifindex = iface.system.ifindex;
    iface.system.flags = msg.flags;

    // Check if IGMP needs to be activated or deactivated on this interface.
    if let Some((mut instance, interfaces)) = instance.as_up()
        && let Some(iface) = interfaces.get_mut_by_ifindex(ifindex)
    {
        iface.update(&mut instance);
    }
}

pub(crate) fn process_iface_del(instance: &mut Instance, ifindex: u32) {
    if let Some((mut instance, interfaces)) = instance.as_up()
        && let Some(iface) = interfaces.get_mut_by_ifindex(ifindex)
    {
        iface.stop(&mut instance, InterfaceInactiveReason::OperationalDown);
    }

    instance.interfaces.remove(ifindex);
}

pub(crate) fn process_addr_add(instance: &mut Instance, msg: AddressMsg) {
    let IpNetwork::V4(addr) = msg.addr else {
        return;
    };
    if msg.flags.contains(AddressFlags::UNNUMBERED) {
        return;
    }

    // Lookup interface.
    let Some(iface) = instance.interfaces.get_mut_by_ifindex(msg.ifindex)
    else {
        return;
    };

    // Add address. Applying the same address twice leaves a single record.
    if !iface.system.addr_list.insert(addr.ip()) {
        return;
    }

    if let Some((mut instance, interfaces)) = instance.as_up()
        && let Some(iface) = interfaces.get_mut_by_ifindex(msg.ifindex)
    {
        iface.update(&mut instance);

        // The address change may affect the querier election.
        if iface.state.active {
            iface.refresh_election(&mut instance);
        }
    }
}

pub(crate) fn process_addr_del(instance: &mut Instance, msg: AddressMsg) {
    let IpNetwork::V4(addr) = msg.addr else {
        return;
    };
    if msg.flags.contains(AddressFlags::UNNUMBERED) {
        return;
    }

    // Lookup interface.
    let Some(iface) = instance.interfaces.get_mut_by_ifindex(msg.ifindex)
    else {
        return;
    };

    // Remove address.
    if !iface.system.addr_list.remove(&addr.ip()) {
        return;
    }

    if let Some((mut instance, interfaces)) = instance.as_up()
        && let Some(iface) = interfaces.get_mut_by_ifindex(msg.ifindex)
        && iface.state.active
    {
        iface.refresh_election(&mut instance);
    }
}
