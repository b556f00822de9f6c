//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;

use tracing::{debug, debug_span, info};

use crate::group::GroupCompat;
use crate::packet::Packet;

// IGMP debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    InstanceStart,
    InstanceStop,
    InterfaceCreate(&'a str),
    InterfaceDelete(&'a str),
    InterfaceStart(&'a str),
    InterfaceStop(&'a str, InterfaceInactiveReason),
    InterfaceAddressSelect(&'a str, Option<Ipv4Addr>),
    QuerierAssume(&'a str),
    QuerierDefeat(&'a str, Ipv4Addr),
    QuerierTimeout(&'a str, Ipv4Addr),
    ProxyQueryIgnore(&'a str),
    PacketRx(&'a str, &'a Ipv4Addr, &'a Packet),
    PacketTx(&'a str, &'a Ipv4Addr, &'a Packet),
    GroupCreate(&'a Ipv4Addr, GroupCompat),
    GroupDelete(&'a Ipv4Addr),
    GroupCompatChange(&'a Ipv4Addr, GroupCompat),
    GroupReportIgnore(&'a Ipv4Addr, &'static str),
    GroupSourceJoin(&'a Ipv4Addr, &'a Ipv4Addr),
    GroupSourceBlock(&'a Ipv4Addr, &'a Ipv4Addr),
    GroupLeaveAccept(&'a Ipv4Addr),
    GroupLeaveIgnore(&'a Ipv4Addr, &'static str),
    GroupTimerShorten(&'a Ipv4Addr, u32),
}

// Reason why IGMP is inactive on an interface.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InterfaceInactiveReason {
    InstanceDown,
    AdminDown,
    OperationalDown,
}

// ===== impl Debug =====

impl Debug<'_> {
    // Log debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::InstanceStart | Debug::InstanceStop => {
                // Parent span(s): igmp-instance
                debug!("{}", self);
            }
            Debug::InterfaceCreate(name)
            | Debug::InterfaceDelete(name)
            | Debug::InterfaceStart(name) => {
                // Parent span(s): igmp-instance
                debug_span!("interface", %name).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::InterfaceStop(name, reason) => {
                // Parent span(s): igmp-instance
                debug_span!("interface", %name).in_scope(|| {
                    debug!(%reason, "{}", self);
                });
            }
            Debug::InterfaceAddressSelect(name, addr) => {
                let address = match addr {
                    Some(addr) => addr.to_string(),
                    None => "none".to_owned(),
                };
                debug_span!("interface", %name).in_scope(|| {
                    info!(%address, "{}", self);
                });
            }
            Debug::QuerierAssume(name) | Debug::ProxyQueryIgnore(name) => {
                debug_span!("interface", %name).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::QuerierDefeat(name, addr)
            | Debug::QuerierTimeout(name, addr) => {
                debug_span!("interface", %name).in_scope(|| {
                    debug!(address = %addr, "{}", self);
                });
            }
            Debug::PacketRx(name, addr, packet) => {
                // Parent span(s): igmp-instance
                debug_span!("network").in_scope(|| {
                    debug_span!("input", interface = %name, source = %addr)
                        .in_scope(|| {
                            let data =
                                serde_json::to_string(&packet).unwrap();
                            debug!(%data, "{}", self);
                        });
                });
            }
            Debug::PacketTx(name, addr, packet) => {
                // Parent span(s): igmp-instance
                debug_span!("network").in_scope(|| {
                    debug_span!("output", interface = %name, destination = %addr)
                        .in_scope(|| {
                            let data =
                                serde_json::to_string(&packet).unwrap();
                            debug!(%data, "{}", self);
                        });
                });
            }
            Debug::GroupCreate(addr, compat)
            | Debug::GroupCompatChange(addr, compat) => {
                debug!(group = %addr, version = %compat, "{}", self);
            }
            Debug::GroupDelete(addr) | Debug::GroupLeaveAccept(addr) => {
                debug!(group = %addr, "{}", self);
            }
            Debug::GroupReportIgnore(addr, reason)
            | Debug::GroupLeaveIgnore(addr, reason) => {
                debug!(group = %addr, %reason, "{}", self);
            }
            Debug::GroupSourceJoin(source, group)
            | Debug::GroupSourceBlock(source, group) => {
                debug!(%source, %group, "{}", self);
            }
            Debug::GroupTimerShorten(addr, secs) => {
                debug!(group = %addr, %secs, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::InstanceStart => {
                write!(f, "starting instance")
            }
            Debug::InstanceStop => {
                write!(f, "stopping instance")
            }
            Debug::InterfaceCreate(..) => {
                write!(f, "interface created")
            }
            Debug::InterfaceDelete(..) => {
                write!(f, "interface deleted")
            }
            Debug::InterfaceStart(..) => {
                write!(f, "starting interface")
            }
            Debug::InterfaceStop(..) => {
                write!(f, "stopping interface")
            }
            Debug::InterfaceAddressSelect(..) => {
                write!(f, "selected querier candidate address")
            }
            Debug::QuerierAssume(..) => {
                write!(f, "assuming querier duties")
            }
            Debug::QuerierDefeat(..) => {
                write!(f, "other querier elected")
            }
            Debug::QuerierTimeout(..) => {
                write!(f, "other querier timed out")
            }
            Debug::ProxyQueryIgnore(..) => {
                write!(f, "ignoring proxy query")
            }
            Debug::PacketRx(..) | Debug::PacketTx(..) => {
                write!(f, "packet")
            }
            Debug::GroupCreate(..) => {
                write!(f, "group created")
            }
            Debug::GroupDelete(..) => {
                write!(f, "group deleted")
            }
            Debug::GroupCompatChange(..) => {
                write!(f, "group compatibility mode changed")
            }
            Debug::GroupReportIgnore(..) => {
                write!(f, "ignoring membership report")
            }
            Debug::GroupSourceJoin(..) => {
                write!(f, "source join")
            }
            Debug::GroupSourceBlock(..) => {
                write!(f, "source block")
            }
            Debug::GroupLeaveAccept(..) => {
                write!(f, "accepted group leave")
            }
            Debug::GroupLeaveIgnore(..) => {
                write!(f, "ignoring group leave")
            }
            Debug::GroupTimerShorten(..) => {
                write!(f, "membership timer shortened")
            }
        }
    }
}

// ===== impl InterfaceInactiveReason =====

impl std::fmt::Display for InterfaceInactiveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterfaceInactiveReason::InstanceDown => {
                write!(f, "IGMP instance down")
            }
            InterfaceInactiveReason::AdminDown => {
                write!(f, "administrative status down")
            }
            InterfaceInactiveReason::OperationalDown => {
                write!(f, "operational status down")
            }
        }
    }
}
