//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//
// Scenario tests driving a full IGMP instance. Sockets are mocked (the
// "testing" feature relays outbound packets to a channel) while the protocol
// timers run against tokio's paused clock, so time-driven behavior is
// deterministic: awaiting an input auto-advances the clock to the next timer
// deadline.

use std::net::Ipv4Addr;
use std::time::Duration;

use const_addrs::ip4;
use ipnetwork::IpNetwork;
use querierd_igmp::group::GroupCompat;
use querierd_igmp::instance::{
    Instance, InstanceChannelsTx, ProtocolInputChannelsRx,
};
use querierd_igmp::interface::Interface;
use querierd_igmp::northbound::configuration::{
    IgmpVersion, InstanceCfg, InterfaceCfg,
};
use querierd_igmp::packet::{
    DecodeError, GroupRecord, GroupRecordType, IgmpV2Message, LeaveGroupV2,
    MembershipQuery, MembershipReportV1, MembershipReportV2,
    MembershipReportV3, Packet, PacketType, QueryVersion,
};
use querierd_igmp::tasks::messages::input::NetRxPacketMsg;
use querierd_igmp::tasks::messages::output::NetTxPacketMsg;
use querierd_igmp::tasks::messages::{ProtocolInputMsg, ProtocolOutputMsg};
use querierd_utils::ibus::IbusMsg;
use querierd_utils::southbound::{
    AddressFlags, AddressMsg, InterfaceFlags, InterfaceUpdateMsg,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

const ETH0: u32 = 2;

struct Harness {
    instance: Instance,
    proto_rx: ProtocolInputChannelsRx,
    out_rx: mpsc::Receiver<ProtocolOutputMsg>,
}

impl Harness {
    fn new() -> Harness {
        Harness::with_config(InstanceCfg::default())
    }

    fn with_config(config: InstanceCfg) -> Harness {
        let (proto_tx, proto_rx) = Instance::protocol_input_channels();
        let (out_tx, out_rx) = mpsc::channel(64);
        let tx = InstanceChannelsTx {
            protocol_input: proto_tx,
            protocol_output: out_tx,
        };
        let mut instance = Instance::new("test".to_owned(), config, tx);
        instance.start().unwrap();

        Harness {
            instance,
            proto_rx,
            out_rx,
        }
    }

    fn iface_up(&mut self, ifname: &str, ifindex: u32, addr: Ipv4Addr) {
        self.instance.process_ibus_msg(IbusMsg::InterfaceUpd(
            InterfaceUpdateMsg {
                ifname: ifname.to_owned(),
                ifindex,
                flags: InterfaceFlags::OPERATIVE | InterfaceFlags::MULTICAST,
            },
        ));
        self.addr_add(ifindex, addr);
    }

    fn addr_add(&mut self, ifindex: u32, addr: Ipv4Addr) {
        self.instance.process_ibus_msg(IbusMsg::InterfaceAddressAdd(
            AddressMsg {
                ifindex,
                addr: IpNetwork::new(addr.into(), 24).unwrap(),
                flags: AddressFlags::empty(),
            },
        ));
    }

    fn iface(&self, ifindex: u32) -> &Interface {
        self.instance
            .interfaces
            .iter()
            .find(|iface| iface.system.ifindex == ifindex)
            .unwrap()
    }

    fn rx(
        &mut self,
        ifindex: u32,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        packet: Packet,
    ) {
        self.instance.process_protocol_msg(ProtocolInputMsg::NetRxPacket(
            NetRxPacketMsg {
                ifindex,
                src,
                dst,
                packet: Ok(packet),
            },
        ));
    }

    // Collects everything the Tx relay has emitted, without letting the
    // clock advance meaningfully.
    async fn outputs(&mut self) -> Vec<NetTxPacketMsg> {
        let mut msgs = vec![];
        while let Ok(Some(ProtocolOutputMsg::NetTxPacket(msg))) =
            timeout(Duration::from_millis(10), self.out_rx.recv()).await
        {
            msgs.push(msg);
        }
        msgs
    }

    // Processes any input messages that are already pending.
    async fn drain_inputs(&mut self) {
        while let Ok(Some(msg)) =
            timeout(Duration::from_millis(10), self.proto_rx.recv()).await
        {
            self.instance.process_protocol_msg(msg);
        }
    }

    // Waits for the next input message, letting the clock advance up to
    // `secs` seconds.
    async fn next_input(&mut self, secs: u64) -> Option<ProtocolInputMsg> {
        timeout(Duration::from_secs(secs), self.proto_rx.recv())
            .await
            .ok()
            .flatten()
    }
}

fn report_v1(group_addr: Ipv4Addr) -> Packet {
    Packet::MembershipReportV1(MembershipReportV1(IgmpV2Message {
        igmp_type: PacketType::MembershipReportV1,
        max_resp_time: 0,
        checksum: 0,
        group_addr: Some(group_addr),
    }))
}

fn report_v2(group_addr: Ipv4Addr) -> Packet {
    Packet::MembershipReportV2(MembershipReportV2(IgmpV2Message {
        igmp_type: PacketType::MembershipReportV2,
        max_resp_time: 0,
        checksum: 0,
        group_addr: Some(group_addr),
    }))
}

fn report_v3_join(group_addr: Ipv4Addr) -> Packet {
    Packet::MembershipReportV3(MembershipReportV3 {
        checksum: 0,
        group_records: vec![GroupRecord {
            record_type: GroupRecordType::ChangeToExclude,
            group_addr,
            sources: vec![],
        }],
    })
}

fn leave_v2(group_addr: Ipv4Addr) -> Packet {
    Packet::LeaveGroup(LeaveGroupV2(IgmpV2Message {
        igmp_type: PacketType::LeaveGroupV2,
        max_resp_time: 0,
        checksum: 0,
        group_addr: Some(group_addr),
    }))
}

fn query_v2(max_resp_time: u16, group_addr: Option<Ipv4Addr>) -> Packet {
    Packet::MembershipQuery(MembershipQuery {
        version: QueryVersion::V2,
        max_resp_time,
        checksum: 0,
        group_addr,
        s_qrv: 0,
        qqic: 0,
        sources: vec![],
    })
}

fn as_query(msg: &NetTxPacketMsg) -> Option<&MembershipQuery> {
    match &msg.packet {
        Packet::MembershipQuery(query) => Some(query),
        _ => None,
    }
}

fn group_queries(msgs: &[NetTxPacketMsg]) -> Vec<&NetTxPacketMsg> {
    msgs.iter()
        .filter(|msg| {
            as_query(msg).is_some_and(|query| query.group_addr.is_some())
        })
        .collect()
}

// ===== Tests =====

// The first router on a segment assumes querier duties and sends a general
// query right away.
#[tokio::test(start_paused = true)]
async fn initial_election() {
    let mut h = Harness::new();
    h.iface_up("eth0", ETH0, ip4!("10.0.0.5"));

    let iface = h.iface(ETH0);
    assert!(iface.state.active);
    assert!(iface.state.querier);
    assert_eq!(iface.state.curr_addr, Some(ip4!("10.0.0.5")));

    let outputs = h.outputs().await;
    let query = outputs.iter().filter_map(as_query).next().unwrap();
    assert_eq!(query.version, QueryVersion::V3);
    assert_eq!(query.max_resp_time, 100);
    assert_eq!(query.group_addr, None);
    assert_eq!(outputs[0].src, ip4!("10.0.0.5"));
    assert_eq!(outputs[0].dst, ip4!("224.0.0.1"));
}

// A query from a lower source address wins the election; when that querier
// goes silent, we take over and query immediately.
#[tokio::test(start_paused = true)]
async fn election_loss_and_takeover() {
    let mut h = Harness::new();
    h.iface_up("eth0", ETH0, ip4!("10.0.0.5"));
    h.drain_inputs().await;
    h.outputs().await;

    // 10.0.0.2 < 10.0.0.5: it becomes the querier.
    h.rx(ETH0, ip4!("10.0.0.2"), ip4!("224.0.0.1"), query_v2(100, None));
    let iface = h.iface(ETH0);
    assert!(!iface.state.querier);
    let other = iface.state.other_querier.as_ref().unwrap();
    assert_eq!(other.addr, ip4!("10.0.0.2"));
    let remaining = other.timeout_task.remaining();
    assert!(remaining > Duration::from_secs(250));
    assert!(remaining <= Duration::from_secs(255));

    // No queries are sent while some other router is the querier.
    // 10.0.0.2 times out after router_timeout seconds and we take over.
    loop {
        let msg = h.next_input(300).await.expect("no querier takeover");
        let takeover =
            matches!(msg, ProtocolInputMsg::OtherQuerierTimeout(_));
        h.instance.process_protocol_msg(msg);
        if takeover {
            break;
        }
    }

    let iface = h.iface(ETH0);
    assert!(iface.state.querier);
    assert!(iface.state.other_querier.is_none());

    let outputs = h.outputs().await;
    assert_eq!(outputs.len(), 1);
    let query = as_query(&outputs[0]).unwrap();
    assert_eq!(query.max_resp_time, 100);
    assert_eq!(query.group_addr, None);
    assert_eq!(outputs[0].src, ip4!("10.0.0.5"));
    assert_eq!(outputs[0].dst, ip4!("224.0.0.1"));
}

// Election monotonicity: a higher-addressed candidate never displaces the
// current querier.
#[tokio::test(start_paused = true)]
async fn election_monotonicity() {
    let mut h = Harness::new();
    h.iface_up("eth0", ETH0, ip4!("10.0.0.5"));

    h.rx(ETH0, ip4!("10.0.0.3"), ip4!("224.0.0.1"), query_v2(100, None));
    let iface = h.iface(ETH0);
    assert_eq!(
        iface.state.other_querier.as_ref().unwrap().addr,
        ip4!("10.0.0.3")
    );

    // Higher than the current querier: ignored.
    h.rx(ETH0, ip4!("10.0.0.4"), ip4!("224.0.0.1"), query_v2(100, None));
    let iface = h.iface(ETH0);
    assert_eq!(
        iface.state.other_querier.as_ref().unwrap().addr,
        ip4!("10.0.0.3")
    );

    // Lower: takes over.
    h.rx(ETH0, ip4!("10.0.0.2"), ip4!("224.0.0.1"), query_v2(100, None));
    let iface = h.iface(ETH0);
    assert_eq!(
        iface.state.other_querier.as_ref().unwrap().addr,
        ip4!("10.0.0.2")
    );
}

// Proxy queries (source 0.0.0.0) never affect the election.
#[tokio::test(start_paused = true)]
async fn proxy_query_ignored() {
    let mut h = Harness::new();
    h.iface_up("eth0", ETH0, ip4!("10.0.0.5"));

    h.rx(ETH0, ip4!("0.0.0.0"), ip4!("224.0.0.1"), query_v2(100, None));

    let iface = h.iface(ETH0);
    assert!(iface.state.querier);
    assert!(iface.state.other_querier.is_none());
}

// A membership record is removed after the Group Membership Interval
// without further reports.
#[tokio::test(start_paused = true)]
async fn group_membership_expiry() {
    let mut h = Harness::new();
    h.iface_up("eth0", ETH0, ip4!("10.0.0.5"));
    h.drain_inputs().await;

    let group_addr = ip4!("239.1.2.3");
    h.rx(ETH0, ip4!("10.0.0.50"), group_addr, report_v2(group_addr));

    let iface = h.iface(ETH0);
    let group = iface.groups.get(&group_addr).unwrap();
    assert_eq!(group.last_reporter, Some(ip4!("10.0.0.50")));
    assert_eq!(group.compat, GroupCompat::V2);
    // GMI = robustness * query_interval + query_response_interval.
    let remaining = group.membership_task.as_ref().unwrap().remaining();
    assert!(remaining > Duration::from_secs(255));
    assert!(remaining <= Duration::from_secs(260));

    loop {
        let msg = h.next_input(261).await.expect("no group expiry");
        let expiry = matches!(msg, ProtocolInputMsg::GroupTimeout(_));
        h.instance.process_protocol_msg(msg);
        if expiry {
            break;
        }
    }

    assert!(h.iface(ETH0).groups.is_empty());
}

// A leave triggers last_member_query_count group-specific queries spaced
// last_member_query_interval apart; absent answers, the group is removed
// after last_member_query_interval * (last_member_query_count + 1).
#[tokio::test(start_paused = true)]
async fn leave_query_train() {
    let mut h = Harness::new();
    h.iface_up("eth0", ETH0, ip4!("10.0.0.5"));
    h.drain_inputs().await;
    h.outputs().await;

    let group_addr = ip4!("239.1.2.3");
    h.rx(ETH0, ip4!("10.0.0.50"), group_addr, report_v2(group_addr));

    h.rx(ETH0, ip4!("10.0.0.50"), ip4!("224.0.0.2"), leave_v2(group_addr));

    // First group-specific query goes out immediately.
    let outputs = h.outputs().await;
    let queries = group_queries(&outputs);
    assert_eq!(queries.len(), 1);
    let query = as_query(queries[0]).unwrap();
    assert_eq!(query.group_addr, Some(group_addr));
    assert_eq!(query.max_resp_time, 10);
    assert_eq!(queries[0].dst, group_addr);

    // A second leave while the sequence is pending is ignored.
    h.rx(ETH0, ip4!("10.0.0.51"), ip4!("224.0.0.2"), leave_v2(group_addr));
    assert!(group_queries(&h.outputs().await).is_empty());

    let iface = h.iface(ETH0);
    let group = iface.groups.get(&group_addr).unwrap();
    let remaining = group.membership_task.as_ref().unwrap().remaining();
    assert!(remaining <= Duration::from_secs(3));

    // Second query one second later.
    let msg = h.next_input(2).await.unwrap();
    assert!(matches!(msg, ProtocolInputMsg::GroupQueryTimeout(_)));
    h.instance.process_protocol_msg(msg);
    let outputs = h.outputs().await;
    assert_eq!(group_queries(&outputs).len(), 1);

    // The sequence ends without a third query.
    let msg = h.next_input(2).await.unwrap();
    assert!(matches!(msg, ProtocolInputMsg::GroupQueryTimeout(_)));
    h.instance.process_protocol_msg(msg);
    assert!(group_queries(&h.outputs().await).is_empty());
    let iface = h.iface(ETH0);
    assert!(iface.groups.get(&group_addr).unwrap().retransmit.is_none());

    // The group expires at t=3.
    let msg = h.next_input(2).await.unwrap();
    assert!(matches!(msg, ProtocolInputMsg::GroupTimeout(_)));
    h.instance.process_protocol_msg(msg);
    assert!(h.iface(ETH0).groups.is_empty());
}

// An IGMPv3 ALLOW_NEW_SOURCES record joins the group for each source.
#[tokio::test(start_paused = true)]
async fn report_v3_allow_sources() {
    let mut h = Harness::new();
    h.iface_up("eth0", ETH0, ip4!("10.0.0.5"));

    let group_addr = ip4!("239.5.5.5");
    let report = Packet::MembershipReportV3(MembershipReportV3 {
        checksum: 0,
        group_records: vec![GroupRecord {
            record_type: GroupRecordType::AllowNewSources,
            group_addr,
            sources: vec![ip4!("192.0.2.10"), ip4!("192.0.2.11")],
        }],
    });
    h.rx(ETH0, ip4!("10.0.0.50"), ip4!("224.0.0.22"), report);

    let iface = h.iface(ETH0);
    let group = iface.groups.get(&group_addr).unwrap();
    assert_eq!(group.compat, GroupCompat::V3);
    assert_eq!(group.last_reporter, Some(ip4!("10.0.0.50")));
    assert!(group.membership_task.is_some());
    // IGMPv3 groups carry no version-upgrade timer.
    assert!(group.version_task.is_none());
}

// A malformed IGMPv3 report creates no state and is counted.
#[tokio::test(start_paused = true)]
async fn report_v3_malformed() {
    let mut h = Harness::new();
    h.iface_up("eth0", ETH0, ip4!("10.0.0.5"));

    h.instance.process_protocol_msg(ProtocolInputMsg::NetRxPacket(
        NetRxPacketMsg {
            ifindex: ETH0,
            src: ip4!("10.0.0.50"),
            dst: ip4!("224.0.0.22"),
            packet: Err(DecodeError::BoundsExceeded),
        },
    ));

    assert!(h.iface(ETH0).groups.is_empty());
    let statistics = &h.instance.state.as_ref().unwrap().statistics;
    assert_eq!(statistics.errors.total, 1);
}

// Older-version reports lower a group's compatibility version; the upgrade
// timer steps it back up once those hosts go quiet.
#[tokio::test(start_paused = true)]
async fn group_version_downgrade_and_upgrade() {
    let mut h = Harness::new();
    h.iface_up("eth0", ETH0, ip4!("10.0.0.5"));
    h.drain_inputs().await;

    let group_addr = ip4!("239.1.2.3");
    h.rx(ETH0, ip4!("10.0.0.50"), group_addr, report_v2(group_addr));
    let iface = h.iface(ETH0);
    let group = iface.groups.get(&group_addr).unwrap();
    assert_eq!(group.compat, GroupCompat::V2);
    assert!(group.version_task.is_some());

    // An IGMPv1 report lowers the version further; an IGMPv3 report does
    // not raise it.
    h.rx(ETH0, ip4!("10.0.0.51"), group_addr, report_v1(group_addr));
    h.rx(ETH0, ip4!("10.0.0.52"), group_addr, report_v3_join(group_addr));
    let iface = h.iface(ETH0);
    assert_eq!(
        iface.groups.get(&group_addr).unwrap().compat,
        GroupCompat::V1
    );

    // Keep the membership alive with IGMPv3 reports (sent on each query
    // interval tick) and let the version timer expire twice.
    let mut upgrades = 0;
    while upgrades < 2 {
        let msg = h.next_input(300).await.expect("no version upgrade");
        match &msg {
            ProtocolInputMsg::QueryInterval(_) => {
                h.instance.process_protocol_msg(msg);
                h.rx(
                    ETH0,
                    ip4!("10.0.0.52"),
                    group_addr,
                    report_v3_join(group_addr),
                );
            }
            ProtocolInputMsg::GroupVersionTimeout(_) => {
                h.instance.process_protocol_msg(msg);
                upgrades += 1;
            }
            _ => h.instance.process_protocol_msg(msg),
        }
    }

    let iface = h.iface(ETH0);
    let group = iface.groups.get(&group_addr).unwrap();
    assert_eq!(group.compat, GroupCompat::V3);
    assert!(group.version_task.is_none());
}

// A group-specific query from the elected querier shortens our membership
// timer; leaves are ignored while we're not the querier.
#[tokio::test(start_paused = true)]
async fn non_querier_behavior() {
    let mut h = Harness::new();
    h.iface_up("eth0", ETH0, ip4!("10.0.0.5"));
    h.drain_inputs().await;
    h.outputs().await;

    // Lose the election.
    h.rx(ETH0, ip4!("10.0.0.2"), ip4!("224.0.0.1"), query_v2(100, None));
    assert!(!h.iface(ETH0).state.querier);

    // Groups are still tracked while not the querier.
    let group_addr = ip4!("239.1.2.3");
    h.rx(ETH0, ip4!("10.0.0.50"), group_addr, report_v2(group_addr));

    // Leaves are not acted upon.
    h.rx(ETH0, ip4!("10.0.0.50"), ip4!("224.0.0.2"), leave_v2(group_addr));
    assert!(group_queries(&h.outputs().await).is_empty());
    let iface = h.iface(ETH0);
    let group = iface.groups.get(&group_addr).unwrap();
    assert!(group.retransmit.is_none());

    // The querier's group-specific query shortens the membership timer to
    // last_member_query_count * max_resp_time.
    h.rx(
        ETH0,
        ip4!("10.0.0.2"),
        group_addr,
        query_v2(10, Some(group_addr)),
    );
    let iface = h.iface(ETH0);
    let group = iface.groups.get(&group_addr).unwrap();
    let remaining = group.membership_task.as_ref().unwrap().remaining();
    assert!(remaining <= Duration::from_secs(2));
}

// Applying the same address twice leaves a single record.
#[tokio::test(start_paused = true)]
async fn address_add_idempotent() {
    let mut h = Harness::new();
    h.iface_up("eth0", ETH0, ip4!("10.0.0.5"));
    h.addr_add(ETH0, ip4!("10.0.0.5"));

    let iface = h.iface(ETH0);
    assert_eq!(iface.system.addr_list.len(), 1);
    assert_eq!(iface.state.curr_addr, Some(ip4!("10.0.0.5")));
}

// Link-local addresses never become the querier source; the lowest usable
// address does.
#[tokio::test(start_paused = true)]
async fn election_address_selection() {
    let mut h = Harness::new();
    h.iface_up("eth0", ETH0, ip4!("169.254.0.1"));

    // No usable source address: queries are suppressed.
    let iface = h.iface(ETH0);
    assert_eq!(iface.state.curr_addr, None);
    assert!(h.outputs().await.is_empty());

    h.addr_add(ETH0, ip4!("192.0.2.10"));
    h.addr_add(ETH0, ip4!("10.0.0.5"));
    let iface = h.iface(ETH0);
    assert_eq!(iface.state.curr_addr, Some(ip4!("10.0.0.5")));
}

// Static groups ignore reports and leaves and carry no timers.
#[tokio::test(start_paused = true)]
async fn static_groups() {
    let group_addr = ip4!("239.9.9.9");
    let mut config = InstanceCfg::default();
    config.interfaces.insert(
        "eth0".to_owned(),
        InterfaceCfg {
            enabled: true,
            version: IgmpVersion::V3,
            join_group: [group_addr].into(),
        },
    );

    let mut h = Harness::with_config(config);
    h.iface_up("eth0", ETH0, ip4!("10.0.0.5"));
    h.drain_inputs().await;
    h.outputs().await;

    let iface = h.iface(ETH0);
    let group = iface.groups.get(&group_addr).unwrap();
    assert!(group.static_entry);
    assert!(group.membership_task.is_none());

    h.rx(ETH0, ip4!("10.0.0.50"), group_addr, report_v2(group_addr));
    h.rx(ETH0, ip4!("10.0.0.50"), ip4!("224.0.0.2"), leave_v2(group_addr));

    let iface = h.iface(ETH0);
    let group = iface.groups.get(&group_addr).unwrap();
    assert!(group.last_reporter.is_none());
    assert!(group.membership_task.is_none());
    assert!(group_queries(&h.outputs().await).is_empty());
}

// IGMPv2-mode interfaces send truncated queries; IGMPv1-mode additionally
// forces the Max Response Time to zero.
#[tokio::test(start_paused = true)]
async fn interface_version_modes() {
    for (version, max_resp_time) in [
        (IgmpVersion::V2, 100),
        (IgmpVersion::V1, 0),
    ] {
        let mut config = InstanceCfg::default();
        config.interfaces.insert(
            "eth0".to_owned(),
            InterfaceCfg {
                enabled: true,
                version,
                join_group: Default::default(),
            },
        );

        let mut h = Harness::with_config(config);
        h.iface_up("eth0", ETH0, ip4!("10.0.0.5"));

        let outputs = h.outputs().await;
        let query = outputs.iter().filter_map(as_query).next().unwrap();
        assert_eq!(query.max_resp_time, max_resp_time);
        match version {
            IgmpVersion::V1 => assert_eq!(query.version, QueryVersion::V1),
            IgmpVersion::V2 => assert_eq!(query.version, QueryVersion::V2),
            IgmpVersion::V3 => unreachable!(),
        }
    }
}
