//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::Arc;

use chrono::{DateTime, Utc};
use querierd_utils::ibus::{IbusMsg, IbusReceiver};
use querierd_utils::socket::{AsyncFd, Socket};
use querierd_utils::task::Task;
use tokio::sync::mpsc;
use tokio::sync::mpsc::{Receiver, Sender};

use crate::debug::{Debug, InterfaceInactiveReason};
use crate::error::{Error, IoError};
use crate::interface::Interfaces;
use crate::northbound::configuration::InstanceCfg;
use crate::packet::{DecodeError, Packet};
use crate::tasks::messages::input::{
    GroupQueryTimeoutMsg, GroupTimeoutMsg, GroupVersionTimeoutMsg,
    NetRxPacketMsg, NetTxFailureMsg, OtherQuerierTimeoutMsg, QueryIntervalMsg,
};
use crate::tasks::messages::ProtocolInputMsg;
#[cfg(feature = "testing")]
use crate::tasks::messages::ProtocolOutputMsg;
use crate::{events, ibus, network, tasks};

#[derive(Debug)]
pub struct Instance {
    // Instance name.
    pub name: String,
    // Instance configuration data.
    pub config: InstanceCfg,
    // Instance state data.
    pub state: Option<InstanceState>,
    // Instance interfaces.
    pub interfaces: Interfaces,
    // Instance Tx channels.
    pub tx: InstanceChannelsTx,
}

#[derive(Debug)]
pub struct InstanceState {
    // Shared Rx socket and Rx task.
    pub net: InstanceNet,
    // Message statistics.
    pub statistics: Statistics,
}

#[derive(Debug)]
pub struct InstanceNet {
    pub socket_rx: Arc<AsyncFd<Socket>>,
    _net_rx_task: Task<()>,
}

#[derive(Debug, Default)]
pub struct Statistics {
    pub discontinuity_time: DateTime<Utc>,
    pub errors: ErrorStatistics,
    pub msgs_rcvd: MessageStatistics,
    pub msgs_sent: MessageStatistics,
}

#[derive(Debug, Default)]
pub struct ErrorStatistics {
    pub total: u64,
    pub checksum: u64,
    pub too_short: u64,
}

#[derive(Debug, Default)]
pub struct MessageStatistics {
    pub total: u64,
    pub query: u64,
    pub report: u64,
    pub leave: u64,
}

#[derive(Debug)]
pub struct InstanceChannelsTx {
    pub protocol_input: ProtocolInputChannelsTx,
    #[cfg(feature = "testing")]
    pub protocol_output: Sender<ProtocolOutputMsg>,
}

pub struct InstanceUpView<'a> {
    pub name: &'a str,
    pub config: &'a InstanceCfg,
    pub state: &'a mut InstanceState,
    pub tx: &'a InstanceChannelsTx,
}

#[derive(Clone, Debug)]
pub struct ProtocolInputChannelsTx {
    // Packet Rx event.
    pub net_packet_rx: Sender<NetRxPacketMsg>,
    // General query interval.
    pub query_interval: Sender<QueryIntervalMsg>,
    // Other-querier-present timeout.
    pub other_querier_timeout: Sender<OtherQuerierTimeoutMsg>,
    // Group membership timeout.
    pub group_timeout: Sender<GroupTimeoutMsg>,
    // Group-specific query retransmit event.
    pub group_query_timeout: Sender<GroupQueryTimeoutMsg>,
    // Group compatibility-version upgrade event.
    pub group_version_timeout: Sender<GroupVersionTimeoutMsg>,
    // Packet Tx failure event.
    pub net_tx_failure: Sender<NetTxFailureMsg>,
}

#[derive(Debug)]
pub struct ProtocolInputChannelsRx {
    pub net_packet_rx: Receiver<NetRxPacketMsg>,
    pub query_interval: Receiver<QueryIntervalMsg>,
    pub other_querier_timeout: Receiver<OtherQuerierTimeoutMsg>,
    pub group_timeout: Receiver<GroupTimeoutMsg>,
    pub group_query_timeout: Receiver<GroupQueryTimeoutMsg>,
    pub group_version_timeout: Receiver<GroupVersionTimeoutMsg>,
    pub net_tx_failure: Receiver<NetTxFailureMsg>,
}

// ===== impl Instance =====

impl Instance {
    pub fn new(
        name: String,
        config: InstanceCfg,
        tx: InstanceChannelsTx,
    ) -> Instance {
        Instance {
            name,
            config,
            state: None,
            interfaces: Default::default(),
            tx,
        }
    }

    // Opens the shared Rx socket and starts the Rx task. Failure here is
    // fatal: the daemon exits before entering the event loop.
    pub fn start(&mut self) -> Result<(), Error> {
        Debug::InstanceStart.log();

        let net = InstanceNet::new(&self.tx)
            .map_err(Error::InstanceStartError)?;
        self.state = Some(InstanceState {
            net,
            statistics: Default::default(),
        });

        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.state.is_some()
    }

    // Returns a view struct for the instance if it's operational.
    pub(crate) fn as_up(
        &mut self,
    ) -> Option<(InstanceUpView<'_>, &mut Interfaces)> {
        if let Some(state) = &mut self.state {
            let instance = InstanceUpView {
                name: &self.name,
                config: &self.config,
                state,
                tx: &self.tx,
            };
            Some((instance, &mut self.interfaces))
        } else {
            None
        }
    }

    pub fn shutdown(mut self) {
        if let Some((mut instance, interfaces)) = self.as_up() {
            for iface in interfaces.iter_mut() {
                iface.stop(
                    &mut instance,
                    InterfaceInactiveReason::InstanceDown,
                );
            }
        }
        Debug::InstanceStop.log();
    }

    pub fn process_ibus_msg(&mut self, msg: IbusMsg) {
        match msg {
            // Interface update notification.
            IbusMsg::InterfaceUpd(msg) => {
                ibus::rx::process_iface_update(self, msg);
            }
            // Interface delete notification.
            IbusMsg::InterfaceDel(ifindex) => {
                ibus::rx::process_iface_del(self, ifindex);
            }
            // Interface address addition notification.
            IbusMsg::InterfaceAddressAdd(msg) => {
                ibus::rx::process_addr_add(self, msg);
            }
            // Interface address delete notification.
            IbusMsg::InterfaceAddressDel(msg) => {
                ibus::rx::process_addr_del(self, msg);
            }
            // Operational state snapshot request.
            IbusMsg::StateRequest(responder) => {
                let snapshot = serde_json::to_value(self.snapshot())
                    .unwrap_or_default();
                if let Some(responder) = responder {
                    let _ = responder.send(snapshot);
                }
            }
        }
    }

    pub fn process_protocol_msg(&mut self, msg: ProtocolInputMsg) {
        // Ignore event if the instance isn't active.
        let Some((mut instance, interfaces)) = self.as_up() else {
            return;
        };

        if let Err(error) =
            process_protocol_msg(&mut instance, interfaces, msg)
        {
            error.log();
        }
    }

    // Creates channels for all protocol input events.
    pub fn protocol_input_channels()
    -> (ProtocolInputChannelsTx, ProtocolInputChannelsRx) {
        let (net_packet_rxp, net_packet_rxc) = mpsc::channel(4);
        let (query_intervalp, query_intervalc) = mpsc::channel(4);
        let (other_querier_timeoutp, other_querier_timeoutc) =
            mpsc::channel(4);
        let (group_timeoutp, group_timeoutc) = mpsc::channel(4);
        let (group_query_timeoutp, group_query_timeoutc) = mpsc::channel(4);
        let (group_version_timeoutp, group_version_timeoutc) =
            mpsc::channel(4);
        let (net_tx_failurep, net_tx_failurec) = mpsc::channel(4);

        let tx = ProtocolInputChannelsTx {
            net_packet_rx: net_packet_rxp,
            query_interval: query_intervalp,
            other_querier_timeout: other_querier_timeoutp,
            group_timeout: group_timeoutp,
            group_query_timeout: group_query_timeoutp,
            group_version_timeout: group_version_timeoutp,
            net_tx_failure: net_tx_failurep,
        };
        let rx = ProtocolInputChannelsRx {
            net_packet_rx: net_packet_rxc,
            query_interval: query_intervalc,
            other_querier_timeout: other_querier_timeoutc,
            group_timeout: group_timeoutc,
            group_query_timeout: group_query_timeoutc,
            group_version_timeout: group_version_timeoutc,
            net_tx_failure: net_tx_failurec,
        };

        (tx, rx)
    }

    // Main event loop.
    //
    // Events are processed to completion in arrival order on this single
    // task; no other task touches protocol state. The loop ends when the
    // ibus channel closes, which is the daemon's shutdown signal.
    pub async fn run(
        mut self,
        mut ibus_rx: IbusReceiver,
        mut proto_rx: ProtocolInputChannelsRx,
    ) {
        loop {
            tokio::select! {
                msg = ibus_rx.recv() => {
                    let Some(msg) = msg else { break };
                    self.process_ibus_msg(msg);
                }
                Some(msg) = proto_rx.recv() => {
                    self.process_protocol_msg(msg);
                }
            }
        }

        self.shutdown();
    }
}

// ===== impl InstanceNet =====

impl InstanceNet {
    fn new(instance_channels_tx: &InstanceChannelsTx) -> Result<Self, IoError> {
        // Create raw socket.
        let socket = network::socket_rx().map_err(IoError::SocketError)?;
        let socket = AsyncFd::new(socket).map_err(IoError::SocketError)?;
        let socket = Arc::new(socket);

        // Start network Rx task.
        let net_rx_task = tasks::net_rx(
            socket.clone(),
            &instance_channels_tx.protocol_input.net_packet_rx,
        );

        Ok(InstanceNet {
            socket_rx: socket,
            _net_rx_task: net_rx_task,
        })
    }
}

// ===== impl ProtocolInputChannelsRx =====

impl ProtocolInputChannelsRx {
    pub async fn recv(&mut self) -> Option<ProtocolInputMsg> {
        tokio::select! {
            msg = self.net_packet_rx.recv() => {
                msg.map(ProtocolInputMsg::NetRxPacket)
            }
            msg = self.query_interval.recv() => {
                msg.map(ProtocolInputMsg::QueryInterval)
            }
            msg = self.other_querier_timeout.recv() => {
                msg.map(ProtocolInputMsg::OtherQuerierTimeout)
            }
            msg = self.group_timeout.recv() => {
                msg.map(ProtocolInputMsg::GroupTimeout)
            }
            msg = self.group_query_timeout.recv() => {
                msg.map(ProtocolInputMsg::GroupQueryTimeout)
            }
            msg = self.group_version_timeout.recv() => {
                msg.map(ProtocolInputMsg::GroupVersionTimeout)
            }
            msg = self.net_tx_failure.recv() => {
                msg.map(ProtocolInputMsg::NetTxFailure)
            }
        }
    }
}

// ===== impl Statistics =====

impl Statistics {
    pub(crate) fn update_rcvd(&mut self, packet: &Packet) {
        self.discontinuity_time = Utc::now();
        self.msgs_rcvd.update(packet);
    }

    pub(crate) fn update_sent(&mut self, packet: &Packet) {
        self.discontinuity_time = Utc::now();
        self.msgs_sent.update(packet);
    }

    pub(crate) fn update_error(&mut self, error: &DecodeError) {
        self.discontinuity_time = Utc::now();
        self.errors.total += 1;
        match error {
            DecodeError::InvalidChecksum => self.errors.checksum += 1,
            DecodeError::InsufficientData => self.errors.too_short += 1,
            _ => (),
        }
    }
}

// ===== impl MessageStatistics =====

impl MessageStatistics {
    fn update(&mut self, packet: &Packet) {
        self.total += 1;
        match packet {
            Packet::MembershipQuery(..) => self.query += 1,
            Packet::MembershipReportV1(..)
            | Packet::MembershipReportV2(..)
            | Packet::MembershipReportV3(..) => self.report += 1,
            Packet::LeaveGroup(..) => self.leave += 1,
        }
    }
}

// ===== global functions =====

/// Starts the protocol instance and spawns its event loop, returning the
/// task handle. The loop runs until the ibus channel closes. Failure to
/// open the raw IGMP socket is fatal and reported to the caller before any
/// event is processed.
pub fn spawn_protocol_task(
    name: String,
    config: InstanceCfg,
    ibus_rx: IbusReceiver,
) -> Result<Task<()>, Error> {
    let (proto_tx, proto_rx) = Instance::protocol_input_channels();
    #[cfg(feature = "testing")]
    let (proto_output_tx, _proto_output_rx) = mpsc::channel(4);
    let tx = InstanceChannelsTx {
        protocol_input: proto_tx,
        #[cfg(feature = "testing")]
        protocol_output: proto_output_tx,
    };

    let mut instance = Instance::new(name, config, tx);
    instance.start()?;

    Ok(Task::spawn(instance.run(ibus_rx, proto_rx)))
}

// ===== helper functions =====

fn process_protocol_msg(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    msg: ProtocolInputMsg,
) -> Result<(), Error> {
    match msg {
        // Received network packet.
        ProtocolInputMsg::NetRxPacket(msg) => {
            events::process_packet(
                instance, interfaces, msg.ifindex, msg.src, msg.dst,
                msg.packet,
            )?;
        }
        // General query interval has ticked.
        ProtocolInputMsg::QueryInterval(msg) => {
            events::process_query_interval(instance, interfaces, msg.ifindex);
        }
        // Other querier present timer has expired.
        ProtocolInputMsg::OtherQuerierTimeout(msg) => {
            events::process_other_querier_timeout(
                instance,
                interfaces,
                msg.ifindex,
            );
        }
        // Group membership timer has expired.
        ProtocolInputMsg::GroupTimeout(msg) => {
            events::process_group_timeout(
                instance,
                interfaces,
                msg.ifindex,
                msg.group_addr,
            );
        }
        // Time to send another group-specific query.
        ProtocolInputMsg::GroupQueryTimeout(msg) => {
            events::process_group_query_timeout(
                instance,
                interfaces,
                msg.ifindex,
                msg.group_addr,
            );
        }
        // Group compatibility-version timer has expired.
        ProtocolInputMsg::GroupVersionTimeout(msg) => {
            events::process_group_version_timeout(
                instance,
                interfaces,
                msg.ifindex,
                msg.group_addr,
            );
        }
        // Packet transmission failed.
        ProtocolInputMsg::NetTxFailure(msg) => {
            events::process_net_tx_failure(instance, interfaces, msg.ifindex);
        }
    }

    Ok(())
}
