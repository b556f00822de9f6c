//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::consts::{
    DFLT_LAST_MEMBER_QUERY_INTERVAL, DFLT_QUERY_INTERVAL,
    DFLT_QUERY_RESPONSE_INTERVAL, DFLT_ROBUSTNESS_VARIABLE,
};

// IGMP instance configuration.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
#[serde(default)]
pub struct InstanceCfg {
    /// Period of general membership queries, in seconds.
    pub query_interval: u16,
    /// Max Response Time advertised in general queries, in seconds.
    pub query_response_interval: u16,
    /// Spacing of group-specific queries sent on a leave, in seconds.
    pub last_member_query_interval: u16,
    /// Robustness variable (RFC 3376, section 8.1).
    pub robustness_variable: u8,
    /// Whether to include the IPv4 Router Alert option on output.
    pub router_alert: bool,
    /// Other-querier-present timeout override, in seconds.
    pub router_timeout: Option<u16>,
    /// Per-interface configuration.
    pub interfaces: BTreeMap<String, InterfaceCfg>,
}

// IGMP interface configuration.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
#[serde(default)]
pub struct InterfaceCfg {
    pub enabled: bool,
    /// Compatibility version this interface operates in.
    pub version: IgmpVersion,
    /// Statically joined groups.
    pub join_group: BTreeSet<Ipv4Addr>,
}

/// Interface IGMP compatibility version.
///
/// Orthogonal to the querier role: an interface in any version mode may or
/// may not be the elected querier.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum IgmpVersion {
    V1,
    V2,
    #[default]
    V3,
}

// ===== impl InstanceCfg =====

impl InstanceCfg {
    /// Group Membership Interval: lifetime of a membership record absent new
    /// reports.
    pub(crate) fn group_membership_interval(&self) -> u32 {
        self.robustness_variable as u32 * self.query_interval as u32
            + self.query_response_interval as u32
    }

    /// Other Querier Present Interval: how long to wait before taking over
    /// from a silent remote querier.
    pub(crate) fn other_querier_present_interval(&self) -> u32 {
        match self.router_timeout {
            Some(timeout) => timeout as u32,
            None => {
                self.robustness_variable as u32 * self.query_interval as u32
                    + self.query_response_interval as u32 / 2
            }
        }
    }

    /// Number of group-specific queries sent on a leave.
    pub(crate) fn last_member_query_count(&self) -> u8 {
        self.robustness_variable
    }

    /// Remaining lifetime of a membership record once a leave was accepted.
    pub(crate) fn last_member_query_time(&self) -> u32 {
        self.last_member_query_interval as u32
            * (self.last_member_query_count() as u32 + 1)
    }
}

impl Default for InstanceCfg {
    fn default() -> InstanceCfg {
        InstanceCfg {
            query_interval: DFLT_QUERY_INTERVAL,
            query_response_interval: DFLT_QUERY_RESPONSE_INTERVAL,
            last_member_query_interval: DFLT_LAST_MEMBER_QUERY_INTERVAL,
            robustness_variable: DFLT_ROBUSTNESS_VARIABLE,
            router_alert: true,
            router_timeout: None,
            interfaces: Default::default(),
        }
    }
}

// ===== impl IgmpVersion =====

impl std::fmt::Display for IgmpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IgmpVersion::V1 => write!(f, "IGMPv1"),
            IgmpVersion::V2 => write!(f, "IGMPv2"),
            IgmpVersion::V3 => write!(f, "IGMPv3"),
        }
    }
}

// ===== impl InterfaceCfg =====

impl Default for InterfaceCfg {
    fn default() -> InterfaceCfg {
        InterfaceCfg {
            enabled: true,
            version: IgmpVersion::default(),
            join_group: Default::default(),
        }
    }
}
