//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::group::{Group, GroupCompat};
use crate::instance::Instance;
use crate::interface::Interface;
use crate::northbound::configuration::IgmpVersion;

// Read-only snapshot of an interface's operational state.
#[derive(Debug, Serialize)]
pub struct InterfaceView {
    pub name: String,
    pub ifindex: u32,
    pub up: bool,
    pub curr_addr: Option<Ipv4Addr>,
    pub version: IgmpVersion,
    pub querier: bool,
    pub other_querier: Option<OtherQuerierView>,
    pub groups: Vec<GroupView>,
}

#[derive(Debug, Serialize)]
pub struct OtherQuerierView {
    pub addr: Ipv4Addr,
    pub since: DateTime<Utc>,
    /// Seconds until the other-querier-present timer expires.
    pub expires: u64,
}

#[derive(Debug, Serialize)]
pub struct GroupView {
    pub group_addr: Ipv4Addr,
    pub last_reporter: Option<Ipv4Addr>,
    pub version: GroupCompat,
    pub created: DateTime<Utc>,
    /// Seconds until the membership timer expires. Absent for static
    /// entries.
    pub expires: Option<u64>,
    pub static_entry: bool,
}

// ===== impl Instance =====

impl Instance {
    /// Returns a read-only snapshot of all interfaces and their group
    /// memberships.
    pub fn snapshot(&self) -> Vec<InterfaceView> {
        self.interfaces.iter().map(InterfaceView::new).collect()
    }
}

// ===== impl InterfaceView =====

impl InterfaceView {
    fn new(iface: &Interface) -> InterfaceView {
        InterfaceView {
            name: iface.name.clone(),
            ifindex: iface.system.ifindex,
            up: iface.state.active,
            curr_addr: iface.state.curr_addr,
            version: iface.config.version,
            querier: iface.state.querier,
            other_querier: iface.state.other_querier.as_ref().map(|other| {
                OtherQuerierView {
                    addr: other.addr,
                    since: other.ctime,
                    expires: other.timeout_task.remaining().as_secs(),
                }
            }),
            groups: iface.groups.values().map(GroupView::new).collect(),
        }
    }
}

// ===== impl GroupView =====

impl GroupView {
    fn new(group: &Group) -> GroupView {
        GroupView {
            group_addr: group.group_addr,
            last_reporter: group.last_reporter,
            version: group.compat,
            created: group.created,
            expires: group
                .membership_remaining()
                .map(|remaining| remaining.as_secs()),
            static_entry: group.static_entry,
        }
    }
}
