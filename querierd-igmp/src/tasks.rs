//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use querierd_utils::socket::{AsyncFd, Socket};
use querierd_utils::task::{IntervalTask, Task, TimeoutTask};
use tokio::sync::mpsc::{Sender, UnboundedReceiver};
use tracing::{Instrument, debug_span};

use crate::network;

//
// IGMP tasks diagram:
//                                     +--------------+
//                                     |    daemon    |
//                                     +--------------+
//                                           | ^
//                                           | |
//                              ibus_rx (1x) V | (1x) state replies
//                                     +--------------+
//                                     |              |
//                      net_rx (1x) -> |              | -> (Nx) net_tx
//              query_interval (Nx) -> |              |
//       other_querier_timeout (Nx) -> |   instance   |
//               group_timeout (Nx) -> |              |
//         group_query_timeout (Nx) -> |              |
//       group_version_timeout (Nx) -> |              |
//                                     +--------------+
//

// IGMP inter-task message types.
pub mod messages {
    use serde::{Deserialize, Serialize};

    // Type aliases.
    pub type ProtocolInputMsg = input::ProtocolMsg;
    pub type ProtocolOutputMsg = output::ProtocolMsg;

    // Input messages (child task -> main task).
    pub mod input {
        use std::net::Ipv4Addr;

        use super::*;
        use crate::packet::{DecodeResult, Packet};

        #[derive(Debug, Deserialize, Serialize)]
        pub enum ProtocolMsg {
            NetRxPacket(NetRxPacketMsg),
            QueryInterval(QueryIntervalMsg),
            OtherQuerierTimeout(OtherQuerierTimeoutMsg),
            GroupTimeout(GroupTimeoutMsg),
            GroupQueryTimeout(GroupQueryTimeoutMsg),
            GroupVersionTimeout(GroupVersionTimeoutMsg),
            NetTxFailure(NetTxFailureMsg),
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct NetRxPacketMsg {
            pub ifindex: u32,
            pub src: Ipv4Addr,
            pub dst: Ipv4Addr,
            pub packet: DecodeResult<Packet>,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct QueryIntervalMsg {
            pub ifindex: u32,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct OtherQuerierTimeoutMsg {
            pub ifindex: u32,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct GroupTimeoutMsg {
            pub ifindex: u32,
            pub group_addr: Ipv4Addr,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct GroupQueryTimeoutMsg {
            pub ifindex: u32,
            pub group_addr: Ipv4Addr,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct GroupVersionTimeoutMsg {
            pub ifindex: u32,
            pub group_addr: Ipv4Addr,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct NetTxFailureMsg {
            pub ifindex: u32,
        }
    }

    // Output messages (main task -> child task).
    pub mod output {
        use std::net::Ipv4Addr;

        use super::*;
        use crate::packet::Packet;

        #[derive(Debug, Serialize)]
        pub enum ProtocolMsg {
            NetTxPacket(NetTxPacketMsg),
        }

        #[derive(Debug, Serialize)]
        pub struct NetTxPacketMsg {
            #[cfg(feature = "testing")]
            pub ifname: String,
            pub src: Ipv4Addr,
            pub dst: Ipv4Addr,
            pub router_alert: bool,
            pub packet: Packet,
        }
    }
}

// ===== IGMP tasks =====

// Network Rx task.
pub(crate) fn net_rx(
    socket: Arc<AsyncFd<Socket>>,
    net_packet_rxp: &Sender<messages::input::NetRxPacketMsg>,
) -> Task<()> {
    #[cfg(not(feature = "testing"))]
    {
        let span1 = debug_span!("network");
        let _span1_guard = span1.enter();
        let span2 = debug_span!("input");
        let _span2_guard = span2.enter();

        let net_packet_rxp = net_packet_rxp.clone();

        Task::spawn_supervised(move || {
            let socket = socket.clone();
            let net_packet_rxp = net_packet_rxp.clone();
            async move {
                let _ = network::read_loop(socket, net_packet_rxp).await;
            }
            .in_current_span()
        })
    }
    #[cfg(feature = "testing")]
    {
        Task::spawn(async move { std::future::pending().await })
    }
}

// Network Tx task.
#[allow(unused_mut)]
pub(crate) fn net_tx(
    socket: Arc<AsyncFd<Socket>>,
    ifindex: u32,
    mut net_packet_txc: UnboundedReceiver<messages::output::NetTxPacketMsg>,
    net_tx_failurep: &Sender<messages::input::NetTxFailureMsg>,
    #[cfg(feature = "testing")] proto_output_tx: &Sender<
        messages::ProtocolOutputMsg,
    >,
) -> Task<()> {
    #[cfg(not(feature = "testing"))]
    {
        let span1 = debug_span!("network");
        let _span1_guard = span1.enter();
        let span2 = debug_span!("output");
        let _span2_guard = span2.enter();

        let net_tx_failurep = net_tx_failurep.clone();
        Task::spawn(
            async move {
                network::write_loop(
                    socket,
                    ifindex,
                    net_packet_txc,
                    net_tx_failurep,
                )
                .await;
            }
            .in_current_span(),
        )
    }
    #[cfg(feature = "testing")]
    {
        let proto_output_tx = proto_output_tx.clone();
        Task::spawn(async move {
            // Relay message to the test framework.
            while let Some(msg) = net_packet_txc.recv().await {
                let msg = messages::ProtocolOutputMsg::NetTxPacket(msg);
                let _ = proto_output_tx.send(msg).await;
            }
        })
    }
}

// Periodic general query timer.
pub(crate) fn query_interval(
    ifindex: u32,
    interval: Duration,
    query_intervalp: &Sender<messages::input::QueryIntervalMsg>,
) -> IntervalTask {
    let query_intervalp = query_intervalp.clone();
    IntervalTask::new(interval, true, move || {
        let query_intervalp = query_intervalp.clone();
        async move {
            let msg = messages::input::QueryIntervalMsg { ifindex };
            let _ = query_intervalp.send(msg).await;
        }
    })
}

// Other-querier-present timeout.
pub(crate) fn other_querier_timeout(
    ifindex: u32,
    timeout: Duration,
    other_querier_timeoutp: &Sender<messages::input::OtherQuerierTimeoutMsg>,
) -> TimeoutTask {
    let other_querier_timeoutp = other_querier_timeoutp.clone();
    TimeoutTask::new(timeout, move || async move {
        let msg = messages::input::OtherQuerierTimeoutMsg { ifindex };
        let _ = other_querier_timeoutp.send(msg).await;
    })
}

// Group membership timeout.
pub(crate) fn group_timeout(
    ifindex: u32,
    group_addr: Ipv4Addr,
    timeout: Duration,
    group_timeoutp: &Sender<messages::input::GroupTimeoutMsg>,
) -> TimeoutTask {
    let group_timeoutp = group_timeoutp.clone();
    TimeoutTask::new(timeout, move || async move {
        let msg = messages::input::GroupTimeoutMsg {
            ifindex,
            group_addr,
        };
        let _ = group_timeoutp.send(msg).await;
    })
}

// Group-specific query retransmit timer.
pub(crate) fn group_query_timeout(
    ifindex: u32,
    group_addr: Ipv4Addr,
    timeout: Duration,
    group_query_timeoutp: &Sender<messages::input::GroupQueryTimeoutMsg>,
) -> TimeoutTask {
    let group_query_timeoutp = group_query_timeoutp.clone();
    TimeoutTask::new(timeout, move || async move {
        let msg = messages::input::GroupQueryTimeoutMsg {
            ifindex,
            group_addr,
        };
        let _ = group_query_timeoutp.send(msg).await;
    })
}

// Group compatibility-version upgrade timer.
pub(crate) fn group_version_timeout(
    ifindex: u32,
    group_addr: Ipv4Addr,
    timeout: Duration,
    group_version_timeoutp: &Sender<messages::input::GroupVersionTimeoutMsg>,
) -> TimeoutTask {
    let group_version_timeoutp = group_version_timeoutp.clone();
    TimeoutTask::new(timeout, move || async move {
        let msg = messages::input::GroupVersionTimeoutMsg {
            ifindex,
            group_addr,
        };
        let _ = group_version_timeoutp.send(msg).await;
    })
}
