//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use querierd_utils::UnboundedSender;
use querierd_utils::socket::{AsyncFd, Socket};
#[cfg(not(feature = "testing"))]
use querierd_utils::socket::SocketExt;
use querierd_utils::southbound::InterfaceFlags;
use querierd_utils::task::{IntervalTask, Task, TimeoutTask};
use tokio::sync::mpsc;
use tracing::warn;

use crate::consts::{ALL_REPORTS, ALL_ROUTERS, ALL_SYSTEMS, IGMP_TIMER_SCALE};
use crate::debug::{Debug, InterfaceInactiveReason};
use crate::error::{Error, IoError};
use crate::group::Group;
use crate::instance::InstanceUpView;
use crate::northbound::configuration::{IgmpVersion, InterfaceCfg};
use crate::packet::{MembershipQuery, Packet, QueryVersion};
use crate::tasks::messages::output::NetTxPacketMsg;
use crate::{network, tasks};

/// Multicast groups with members on an interface.
pub type Groups = BTreeMap<Ipv4Addr, Group>;

#[derive(Debug)]
pub struct Interface {
    pub name: String,
    pub system: InterfaceSys,
    pub config: InterfaceCfg,
    pub state: InterfaceState,
    /// Multicast groups with local members on this interface.
    pub groups: Groups,
}

#[derive(Debug)]
pub struct InterfaceSys {
    pub ifindex: u32,
    pub flags: InterfaceFlags,
    /// Configured IPv4 addresses.
    pub addr_list: BTreeSet<Ipv4Addr>,
}

#[derive(Debug, Default)]
pub struct InterfaceState {
    pub active: bool,
    /// Address used to source queries, elected among `addr_list`. While
    /// unset, all outbound queries on this interface are suppressed.
    pub curr_addr: Option<Ipv4Addr>,
    pub prev_addr: Option<Ipv4Addr>,
    /// Whether this router is the elected querier on the segment.
    /// Never true while `other_querier` is present.
    pub querier: bool,
    pub other_querier: Option<OtherQuerier>,
    pub net: Option<InterfaceNet>,
    pub query_interval_task: Option<IntervalTask>,
    /// Rate-limit counter for version mismatch warnings.
    pub version_warn: u32,
}

/// The remote querier that won the election on this segment.
#[derive(Debug)]
pub struct OtherQuerier {
    pub addr: Ipv4Addr,
    pub ctime: DateTime<Utc>,
    /// Other-querier-present timer. Expiry means the remote querier went
    /// silent and we take over.
    pub timeout_task: TimeoutTask,
}

#[derive(Debug)]
pub struct InterfaceNet {
    pub socket_tx: Arc<AsyncFd<Socket>>,
    _net_tx_task: Task<()>,
    pub net_tx_packetp: UnboundedSender<NetTxPacketMsg>,
}

#[derive(Debug, Default)]
pub struct Interfaces {
    ifindex_tree: BTreeMap<u32, Interface>,
    name_tree: BTreeMap<String, u32>,
}

// ===== impl Interface =====

impl Interface {
    fn new(name: String, ifindex: u32, config: InterfaceCfg) -> Interface {
        Debug::InterfaceCreate(&name).log();

        Interface {
            name,
            system: InterfaceSys {
                ifindex,
                flags: InterfaceFlags::default(),
                addr_list: Default::default(),
            },
            config,
            state: InterfaceState::default(),
            groups: Default::default(),
        }
    }

    // Checks if the interface needs to be started or stopped in response to
    // a configuration or link event.
    pub(crate) fn update(&mut self, instance: &mut InstanceUpView<'_>) {
        match self.is_ready() {
            Ok(()) if !self.state.active => {
                if let Err(error) = self.start(instance) {
                    Error::InterfaceStartError(self.name.clone(), error)
                        .log();
                }
            }
            Err(reason) if self.state.active => self.stop(instance, reason),
            _ => (),
        }
    }

    // Returns whether the interface is ready for IGMP operation.
    fn is_ready(&self) -> Result<(), InterfaceInactiveReason> {
        if !self.config.enabled {
            return Err(InterfaceInactiveReason::AdminDown);
        }

        if !self.system.flags.contains(InterfaceFlags::OPERATIVE) {
            return Err(InterfaceInactiveReason::OperationalDown);
        }

        Ok(())
    }

    // Starts IGMP operation on this interface.
    fn start(
        &mut self,
        instance: &mut InstanceUpView<'_>,
    ) -> Result<(), IoError> {
        Debug::InterfaceStart(&self.name).log();

        let ifindex = self.system.ifindex;

        // Join the all-routers and all-reports groups so queries from other
        // routers and IGMPv3 reports are received.
        #[cfg(not(feature = "testing"))]
        {
            let socket_rx = instance.state.net.socket_rx.get_ref();
            socket_rx
                .join_multicast_ifindex_v4(&ALL_ROUTERS, ifindex)
                .map_err(IoError::MulticastJoinError)?;
            socket_rx
                .join_multicast_ifindex_v4(&ALL_REPORTS, ifindex)
                .map_err(IoError::MulticastJoinError)?;
        }

        // Start network Tx task.
        self.state.net =
            Some(InterfaceNet::new(&self.name, ifindex, instance)?);

        // Install statically configured groups.
        for group_addr in &self.config.join_group {
            self.groups
                .insert(*group_addr, Group::new_static(*group_addr));
        }

        // Periodically query for local group memberships.
        self.state.query_interval_task = Some(tasks::query_interval(
            ifindex,
            Duration::from_secs(instance.config.query_interval.into()),
            &instance.tx.protocol_input.query_interval,
        ));

        self.state.active = true;

        // Check if we should assume the querier role.
        self.refresh_election(instance);

        Ok(())
    }

    // Stops IGMP operation on this interface. The record itself is kept so
    // operation resumes when the interface comes back.
    pub(crate) fn stop(
        &mut self,
        instance: &mut InstanceUpView<'_>,
        reason: InterfaceInactiveReason,
    ) {
        if !self.state.active {
            return;
        }

        Debug::InterfaceStop(&self.name, reason).log();

        self.state.query_interval_task = None;
        self.groups.clear();
        self.state.other_querier = None;
        self.state.querier = false;

        #[cfg(not(feature = "testing"))]
        {
            let socket_rx = instance.state.net.socket_rx.get_ref();
            for group in [ALL_ROUTERS, ALL_REPORTS] {
                if let Err(error) = socket_rx
                    .leave_multicast_ifindex_v4(&group, self.system.ifindex)
                {
                    IoError::MulticastLeaveError(error).log();
                }
            }
        }

        self.state.net = None;
        self.state.active = false;
    }

    // Restarts the querier election.
    //
    // Called on every address change, and at interface start.
    pub(crate) fn refresh_election(
        &mut self,
        instance: &mut InstanceUpView<'_>,
    ) {
        // Best local candidate: the numerically lowest configured address
        // that is not an IPv4LL address. 0.0.0.0 is reserved for proxy
        // queries and must never win an election.
        let candidate = self
            .system
            .addr_list
            .iter()
            .filter(|addr| !addr.is_link_local())
            .min()
            .copied();
        if candidate != self.state.curr_addr {
            Debug::InterfaceAddressSelect(&self.name, candidate).log();
            self.state.prev_addr = self.state.curr_addr;
            self.state.curr_addr = candidate;
        }

        match &self.state.other_querier {
            Some(other) => {
                // A local candidate lower than the current querier preempts
                // it immediately.
                if let Some(curr_addr) = self.state.curr_addr
                    && u32::from(curr_addr) < u32::from(other.addr)
                {
                    self.state.other_querier = None;
                    self.assume_querier(instance);
                }
            }
            None => {
                // First election after boot.
                if self.state.prev_addr.is_none() {
                    self.assume_querier(instance);
                }
            }
        }
    }

    // Assumes responsibility for sending periodic membership queries on
    // this segment, until a lower-addressed neighbor is discovered.
    pub(crate) fn assume_querier(&mut self, instance: &mut InstanceUpView<'_>) {
        self.state.querier = true;
        Debug::QuerierAssume(&self.name).log();
        self.send_general_query(instance);
    }

    pub(crate) fn send_general_query(
        &mut self,
        instance: &mut InstanceUpView<'_>,
    ) {
        let max_resp_time =
            instance.config.query_response_interval * IGMP_TIMER_SCALE;
        self.send_query(instance, ALL_SYSTEMS, max_resp_time, None);
    }

    pub(crate) fn send_group_query(
        &mut self,
        instance: &mut InstanceUpView<'_>,
        group_addr: Ipv4Addr,
    ) {
        let max_resp_time =
            instance.config.last_member_query_interval * IGMP_TIMER_SCALE;
        self.send_query(instance, group_addr, max_resp_time, Some(group_addr));
    }

    // Sends a membership query in the version mode configured for this
    // interface:
    //  - IGMPv2: queries are truncated at the group address field.
    //  - IGMPv1: additionally, the Max Response Time is zero.
    fn send_query(
        &mut self,
        instance: &mut InstanceUpView<'_>,
        dst: Ipv4Addr,
        max_resp_time: u16,
        group_addr: Option<Ipv4Addr>,
    ) {
        let query = match self.config.version {
            IgmpVersion::V1 => MembershipQuery {
                version: QueryVersion::V1,
                max_resp_time: 0,
                checksum: 0,
                group_addr,
                s_qrv: 0,
                qqic: 0,
                sources: vec![],
            },
            IgmpVersion::V2 => MembershipQuery {
                version: QueryVersion::V2,
                max_resp_time,
                checksum: 0,
                group_addr,
                s_qrv: 0,
                qqic: 0,
                sources: vec![],
            },
            IgmpVersion::V3 => MembershipQuery {
                version: QueryVersion::V3,
                max_resp_time,
                checksum: 0,
                group_addr,
                s_qrv: instance.config.robustness_variable.min(7),
                qqic: instance.config.query_interval,
                sources: vec![],
            },
        };

        self.send_packet(instance, dst, Packet::MembershipQuery(query));
    }

    // Enqueues a packet for transmission. Suppressed entirely while no
    // usable source address exists on the interface.
    pub(crate) fn send_packet(
        &mut self,
        instance: &mut InstanceUpView<'_>,
        dst: Ipv4Addr,
        packet: Packet,
    ) {
        let Some(src) = self.state.curr_addr else {
            return;
        };
        let Some(net) = &self.state.net else {
            return;
        };

        Debug::PacketTx(&self.name, &dst, &packet).log();
        instance.state.statistics.update_sent(&packet);

        let msg = NetTxPacketMsg {
            #[cfg(feature = "testing")]
            ifname: self.name.clone(),
            src,
            dst,
            router_alert: instance.config.router_alert,
            packet,
        };
        let _ = net.net_tx_packetp.send(msg);
    }

    // Warns about an IGMP version mismatch between a received query and the
    // interface's configured compatibility mode, with an exponentially
    // backed-off warning rate.
    pub(crate) fn version_mismatch_warn(
        &mut self,
        src: Ipv4Addr,
        version: QueryVersion,
    ) {
        let mismatch = matches!(
            (version, self.config.version),
            (QueryVersion::V3, IgmpVersion::V2 | IgmpVersion::V1)
                | (QueryVersion::V2, IgmpVersion::V1)
        );
        if !mismatch {
            return;
        }

        self.state.version_warn += 1;
        let mut count = self.state.version_warn;
        while count != 0 && count & 1 == 0 {
            count >>= 1;
        }
        if count == 1 {
            warn!(
                interface = %self.name,
                source = %src,
                received = %version,
                configured = %self.config.version,
                "IGMP version mismatch"
            );
        }
    }
}

// ===== impl InterfaceNet =====

impl InterfaceNet {
    fn new(
        ifname: &str,
        ifindex: u32,
        instance: &mut InstanceUpView<'_>,
    ) -> Result<Self, IoError> {
        // Create raw socket bound to this device.
        let socket = network::socket_tx(ifname).map_err(IoError::SocketError)?;
        let socket = AsyncFd::new(socket).map_err(IoError::SocketError)?;
        let socket = Arc::new(socket);

        // Start network Tx task.
        let (net_tx_packetp, net_tx_packetc) = mpsc::unbounded_channel();
        let net_tx_task = tasks::net_tx(
            socket.clone(),
            ifindex,
            net_tx_packetc,
            &instance.tx.protocol_input.net_tx_failure,
            #[cfg(feature = "testing")]
            &instance.tx.protocol_output,
        );

        Ok(InterfaceNet {
            socket_tx: socket,
            _net_tx_task: net_tx_task,
            net_tx_packetp,
        })
    }
}

// ===== impl Interfaces =====

impl Interfaces {
    // Adds an interface, or returns the existing record. An interface whose
    // ifindex changed (device recreated) keeps its record under the new
    // index.
    pub(crate) fn add(
        &mut self,
        ifname: &str,
        ifindex: u32,
        config: InterfaceCfg,
    ) -> &mut Interface {
        if let Some(existing) = self.name_tree.get(ifname).copied()
            && existing != ifindex
            && let Some(mut iface) = self.ifindex_tree.remove(&existing)
        {
            iface.system.ifindex = ifindex;
            self.ifindex_tree.insert(ifindex, iface);
        }

        self.name_tree.insert(ifname.to_owned(), ifindex);
        self.ifindex_tree.entry(ifindex).or_insert_with(|| {
            Interface::new(ifname.to_owned(), ifindex, config)
        })
    }

    pub(crate) fn remove(&mut self, ifindex: u32) -> Option<Interface> {
        let iface = self.ifindex_tree.remove(&ifindex)?;

        Debug::InterfaceDelete(&iface.name).log();
        self.name_tree.remove(&iface.name);
        Some(iface)
    }

    pub(crate) fn get_by_ifindex(&self, ifindex: u32) -> Option<&Interface> {
        self.ifindex_tree.get(&ifindex)
    }

    pub(crate) fn get_mut_by_ifindex(
        &mut self,
        ifindex: u32,
    ) -> Option<&mut Interface> {
        self.ifindex_tree.get_mut(&ifindex)
    }

    #[expect(unused)]
    pub(crate) fn get_by_name(&self, ifname: &str) -> Option<&Interface> {
        self.name_tree
            .get(ifname)
            .and_then(|ifindex| self.ifindex_tree.get(ifindex))
    }

    #[expect(unused)]
    pub(crate) fn get_mut_by_name(
        &mut self,
        ifname: &str,
    ) -> Option<&mut Interface> {
        self.name_tree
            .get(ifname)
            .and_then(|ifindex| self.ifindex_tree.get_mut(ifindex))
    }

    // Returns the interface currently sourcing queries from the given
    // address.
    #[expect(unused)]
    pub(crate) fn get_by_addr(&self, addr: Ipv4Addr) -> Option<&Interface> {
        self.iter()
            .find(|iface| iface.state.curr_addr == Some(addr))
    }

    // Returns an iterator visiting all interfaces, ordered by ifindex.
    pub fn iter(&self) -> impl Iterator<Item = &'_ Interface> + '_ {
        self.ifindex_tree.values()
    }

    // Returns an iterator visiting all interfaces with mutable references.
    pub(crate) fn iter_mut(
        &mut self,
    ) -> impl Iterator<Item = &'_ mut Interface> + '_ {
        self.ifindex_tree.values_mut()
    }
}
