//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use crate::consts::{IGMP_TIMER_SCALE, MAX_LOCAL_GROUP};
use crate::debug::Debug;
use crate::error::Error;
use crate::group::{Group, GroupCompat};
use crate::instance::InstanceUpView;
use crate::interface::{Interface, Interfaces, OtherQuerier};
use crate::northbound::configuration::IgmpVersion;
use crate::packet::{
    DecodeResult, GroupRecordType, MembershipQuery, MembershipReportV3,
    Packet,
};
use crate::tasks;

// ===== Network packet receipt =====

pub(crate) fn process_packet(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    ifindex: u32,
    src: Ipv4Addr,
    _dst: Ipv4Addr,
    packet: DecodeResult<Packet>,
) -> Result<(), Error> {
    // Lookup interface.
    let Some(iface) = interfaces.get_mut_by_ifindex(ifindex) else {
        return Ok(());
    };

    // Ignore packets received on inactive interfaces.
    if !iface.state.active {
        return Ok(());
    }

    // Decode packet.
    let packet = match packet {
        Ok(packet) => packet,
        Err(error) => {
            instance.state.statistics.update_error(&error);
            return Err(Error::PacketDecodeError(ifindex, src, error));
        }
    };

    Debug::PacketRx(&iface.name, &src, &packet).log();
    instance.state.statistics.update_rcvd(&packet);

    // Process packet based on type.
    match packet {
        Packet::MembershipQuery(query) => {
            process_membership_query(iface, instance, src, query);
        }
        Packet::MembershipReportV1(report) => {
            if let Some(group_addr) = report.group_addr {
                process_group_report(
                    iface,
                    instance,
                    src,
                    group_addr,
                    GroupCompat::V1,
                );
            }
        }
        Packet::MembershipReportV2(report) => {
            if let Some(group_addr) = report.group_addr {
                process_group_report(
                    iface,
                    instance,
                    src,
                    group_addr,
                    GroupCompat::V2,
                );
            }
        }
        Packet::MembershipReportV3(report) => {
            process_report_v3(iface, instance, src, report);
        }
        Packet::LeaveGroup(leave) => {
            if let Some(group_addr) = leave.group_addr {
                process_leave(iface, instance, src, group_addr, false);
            }
        }
    }

    Ok(())
}

// Processes an incoming membership query: warn about version mismatches,
// run the querier election, and handle group-specific queries when some
// other router is the querier.
fn process_membership_query(
    iface: &mut Interface,
    instance: &mut InstanceUpView<'_>,
    src: Ipv4Addr,
    query: MembershipQuery,
) {
    let ifindex = iface.system.ifindex;

    iface.version_mismatch_warn(src, query.version);

    // Proxy queries never win elections.
    if src.is_unspecified() {
        Debug::ProxyQueryIgnore(&iface.name).log();
        return;
    }

    // Querier election. The query may come from a router with a lower
    // source address than the current querier (who might be us), or from a
    // router that just started up and doesn't know the querier yet.
    let is_current_querier = iface
        .state
        .other_querier
        .as_ref()
        .is_some_and(|other| other.addr == src);
    if !is_current_querier {
        let cur = iface
            .state
            .other_querier
            .as_ref()
            .map(|other| other.addr)
            .or(iface.state.curr_addr)
            .map(u32::from)
            .unwrap_or(0);
        if u32::from(src) >= cur {
            return;
        }

        Debug::QuerierDefeat(&iface.name, src).log();
        match &mut iface.state.other_querier {
            Some(other) => {
                other.addr = src;
                other.ctime = Utc::now();
            }
            None => {
                iface.state.querier = false;
                let timeout = Duration::from_secs(
                    instance.config.other_querier_present_interval().into(),
                );
                let timeout_task = tasks::other_querier_timeout(
                    ifindex,
                    timeout,
                    &instance.tx.protocol_input.other_querier_timeout,
                );
                iface.state.other_querier = Some(OtherQuerier {
                    addr: src,
                    ctime: Utc::now(),
                    timeout_task,
                });
            }
        }
    }

    // Reset the timer since the querier is alive.
    if let Some(other) = &mut iface.state.other_querier
        && other.addr == src
    {
        let timeout = Duration::from_secs(
            instance.config.other_querier_present_interval().into(),
        );
        other.timeout_task.reset(Some(timeout));
    }

    // A group-specific query we did not source shortens our membership
    // timer to [Last Member Query Count] times the Max Response Time in
    // the packet (RFC 3376, section 6.6.1).
    if !iface.state.querier
        && iface.config.version != IgmpVersion::V1
        && let Some(group_addr) = query.group_addr
        && Some(src) != iface.state.curr_addr
        && let Some(group) = iface.groups.get_mut(&group_addr)
        && group.retransmit.is_none()
        && !group.static_entry
    {
        let timeout = instance.config.last_member_query_count() as u32
            * query.max_resp_time as u32
            / IGMP_TIMER_SCALE as u32;
        Debug::GroupTimerShorten(&group_addr, timeout).log();
        group.membership_reset(
            ifindex,
            timeout,
            &instance.tx.protocol_input.group_timeout,
        );
    }
}

// Processes an accepted membership report for a group.
fn process_group_report(
    iface: &mut Interface,
    instance: &mut InstanceUpView<'_>,
    src: Ipv4Addr,
    group_addr: Ipv4Addr,
    version: GroupCompat,
) {
    // Do not track LAN-scoped groups.
    if u32::from(group_addr) <= u32::from(MAX_LOCAL_GROUP) {
        Debug::GroupReportIgnore(&group_addr, "LAN scoped group").log();
        return;
    }

    let ifindex = iface.system.ifindex;
    let gmi = instance.config.group_membership_interval();

    match iface.groups.get_mut(&group_addr) {
        Some(group) => {
            if group.static_entry {
                Debug::GroupReportIgnore(&group_addr, "static group").log();
                return;
            }

            // Reports only ever lower the compatibility version; the
            // upgrade timer steps it back up.
            if version < group.compat {
                group.compat = version;
                Debug::GroupCompatChange(&group_addr, version).log();
            }

            group.update_reporter(src);

            // A report answers any in-progress group-specific query
            // sequence and restores the full membership lifetime.
            group.retransmit_stop();
            group.membership_reset(
                ifindex,
                gmi,
                &instance.tx.protocol_input.group_timeout,
            );

            // Every older-version report rewinds the upgrade timer.
            if group.compat < GroupCompat::V3 && version < GroupCompat::V3 {
                group.version_reset(
                    ifindex,
                    gmi,
                    &instance.tx.protocol_input.group_version_timeout,
                );
            }
        }
        None => {
            let mut group = Group::new(group_addr, version);
            group.update_reporter(src);
            group.membership_reset(
                ifindex,
                gmi,
                &instance.tx.protocol_input.group_timeout,
            );
            if group.compat < GroupCompat::V3 {
                group.version_reset(
                    ifindex,
                    gmi,
                    &instance.tx.protocol_input.group_version_timeout,
                );
            }
            iface.groups.insert(group_addr, group);
        }
    }
}

// Walks the group records of an IGMPv3 membership report, mapping each
// record type onto join and leave operations (RFC 3376 with the lightweight
// profile of RFC 5790).
fn process_report_v3(
    iface: &mut Interface,
    instance: &mut InstanceUpView<'_>,
    src: Ipv4Addr,
    report: MembershipReportV3,
) {
    for record in &report.group_records {
        let group_addr = record.group_addr;

        match record.record_type {
            GroupRecordType::ModeIsInclude
            | GroupRecordType::ChangeToInclude => {
                if record.sources.is_empty() {
                    // TO_IN({}) is an IGMPv2-style (*,G) leave.
                    process_leave(iface, instance, src, group_addr, true);
                } else {
                    for source in &record.sources {
                        Debug::GroupSourceJoin(source, &group_addr).log();
                        process_group_report(
                            iface,
                            instance,
                            src,
                            group_addr,
                            GroupCompat::V3,
                        );
                    }
                }
            }
            GroupRecordType::ModeIsExclude
            | GroupRecordType::ChangeToExclude => {
                if record.sources.is_empty() {
                    // TO_EX({}) is a (*,G) join.
                    process_group_report(
                        iface,
                        instance,
                        src,
                        group_addr,
                        GroupCompat::V3,
                    );
                } else {
                    // LW-IGMPv3 does not use TO_EX({x}).
                    Debug::GroupReportIgnore(
                        &group_addr,
                        "source filtering not supported",
                    )
                    .log();
                }
            }
            GroupRecordType::AllowNewSources => {
                for source in &record.sources {
                    Debug::GroupSourceJoin(source, &group_addr).log();
                    process_group_report(
                        iface,
                        instance,
                        src,
                        group_addr,
                        GroupCompat::V3,
                    );
                }
            }
            GroupRecordType::BlockOldSources => {
                for source in &record.sources {
                    Debug::GroupSourceBlock(source, &group_addr).log();
                    process_leave(iface, instance, src, group_addr, true);
                }
            }
        }
    }
}

// Processes an IGMPv2 Leave Group message, an IGMPv3 BLOCK(), or an IGMPv3
// TO_IN({}) record. `v3` distinguishes the IGMPv3-sourced forms for the
// compatibility checks of RFC 3376, section 7.3.2.
fn process_leave(
    iface: &mut Interface,
    instance: &mut InstanceUpView<'_>,
    _src: Ipv4Addr,
    group_addr: Ipv4Addr,
    v3: bool,
) {
    let ifindex = iface.system.ifindex;

    if !iface.state.querier {
        Debug::GroupLeaveIgnore(&group_addr, "not the querier").log();
        return;
    }
    if iface.config.version == IgmpVersion::V1 {
        Debug::GroupLeaveIgnore(&group_addr, "interface in IGMPv1 mode")
            .log();
        return;
    }

    let Some(group) = iface.groups.get_mut(&group_addr) else {
        Debug::GroupLeaveIgnore(&group_addr, "group not found").log();
        return;
    };
    if group.static_entry {
        Debug::GroupLeaveIgnore(&group_addr, "static group").log();
        return;
    }
    // Ignore an IGMPv2 LEAVE while an IGMPv1 host is present, and an
    // IGMPv3 BLOCK/TO_IN({}) while an IGMPv2 host is present.
    if group.compat == GroupCompat::V1 {
        Debug::GroupLeaveIgnore(&group_addr, "IGMPv1 host exists").log();
        return;
    }
    if group.compat == GroupCompat::V2 && v3 {
        Debug::GroupLeaveIgnore(&group_addr, "IGMPv2 host exists").log();
        return;
    }
    // Still waiting for a reply to a previous query.
    if group.retransmit.is_some() {
        Debug::GroupLeaveIgnore(&group_addr, "pending group-specific query")
            .log();
        return;
    }

    // Lower the membership lifetime and start the group-specific query
    // sequence; the first query goes out right away.
    group.membership_reset(
        ifindex,
        instance.config.last_member_query_time(),
        &instance.tx.protocol_input.group_timeout,
    );
    group.retransmit_start(
        ifindex,
        instance.config.last_member_query_count().saturating_sub(1),
        instance.config.last_member_query_interval,
        &instance.tx.protocol_input.group_query_timeout,
    );
    Debug::GroupLeaveAccept(&group_addr).log();

    iface.send_group_query(instance, group_addr);
}

// ===== General query interval =====

pub(crate) fn process_query_interval(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    ifindex: u32,
) {
    let Some(iface) = interfaces.get_mut_by_ifindex(ifindex) else {
        return;
    };

    if iface.state.active && iface.state.querier {
        iface.send_general_query(instance);
    }
}

// ===== Other querier present timeout =====

// The active querier went silent; assume the role.
pub(crate) fn process_other_querier_timeout(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    ifindex: u32,
) {
    let Some(iface) = interfaces.get_mut_by_ifindex(ifindex) else {
        return;
    };
    let Some(other) = iface.state.other_querier.take() else {
        return;
    };

    Debug::QuerierTimeout(&iface.name, other.addr).log();
    iface.assume_querier(instance);
}

// ===== Group membership timeout =====

pub(crate) fn process_group_timeout(
    _instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    ifindex: u32,
    group_addr: Ipv4Addr,
) {
    let Some(iface) = interfaces.get_mut_by_ifindex(ifindex) else {
        return;
    };

    // Dropping the entry cancels any remaining timers.
    if iface.groups.remove(&group_addr).is_some() {
        Debug::GroupDelete(&group_addr).log();
    }
}

// ===== Group-specific query retransmit =====

pub(crate) fn process_group_query_timeout(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    ifindex: u32,
    group_addr: Ipv4Addr,
) {
    let Some(iface) = interfaces.get_mut_by_ifindex(ifindex) else {
        return;
    };
    let Some(group) = iface.groups.get_mut(&group_addr) else {
        return;
    };
    let Some(retransmit) = &mut group.retransmit else {
        return;
    };

    if retransmit.left == 0 {
        // Sequence complete; the shortened membership timer decides the
        // group's fate.
        group.retransmit = None;
        return;
    }
    retransmit.left -= 1;
    retransmit.task.reset(None);

    iface.send_group_query(instance, group_addr);
}

// ===== Group compatibility-version timeout =====

// Hosts speaking the older version have been quiet for a full membership
// interval; step the group's compatibility mode back up.
pub(crate) fn process_group_version_timeout(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    ifindex: u32,
    group_addr: Ipv4Addr,
) {
    let Some(iface) = interfaces.get_mut_by_ifindex(ifindex) else {
        return;
    };
    let Some(group) = iface.groups.get_mut(&group_addr) else {
        return;
    };

    // The firing task cannot be reset, only replaced.
    group.version_stop();

    if group.compat < GroupCompat::V3 {
        group.compat = group.compat.upgrade();
        Debug::GroupCompatChange(&group_addr, group.compat).log();
    }
    if group.compat < GroupCompat::V3 {
        group.version_reset(
            ifindex,
            instance.config.group_membership_interval(),
            &instance.tx.protocol_input.group_version_timeout,
        );
    }
}

// ===== Packet transmission failure =====

pub(crate) fn process_net_tx_failure(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    ifindex: u32,
) {
    let Some(iface) = interfaces.get_mut_by_ifindex(ifindex) else {
        return;
    };

    warn!(
        interface = %iface.name,
        "transmission failed, rechecking interface state"
    );
    iface.update(instance);
}
