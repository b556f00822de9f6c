//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//
// Dynamic multicast group membership tracking (RFC 2236 and RFC 3376).
//
// Groups are learned from membership reports received from hosts and live in
// `Interface.groups`. Statically configured groups (`InterfaceCfg.join_group`)
// use the same records, flagged immutable: they carry no timers and ignore
// both reports and leaves.

use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use querierd_utils::Sender;
use querierd_utils::task::TimeoutTask;
use serde::{Deserialize, Serialize};

use crate::debug::Debug;
use crate::tasks;
use crate::tasks::messages::input::{
    GroupQueryTimeoutMsg, GroupTimeoutMsg, GroupVersionTimeoutMsg,
};

/// Multicast group membership state on an interface.
#[derive(Debug)]
pub struct Group {
    /// Multicast group address.
    pub group_addr: Ipv4Addr,
    /// Last host whose report was accepted for this group.
    pub last_reporter: Option<Ipv4Addr>,
    /// Compatibility version of the group (lowest version heard from).
    pub compat: GroupCompat,
    /// Statically configured entry, immune to reports and leaves.
    pub static_entry: bool,
    /// Time when the group was created.
    pub created: DateTime<Utc>,
    /// Group membership timer. Expiry deletes the group.
    pub membership_task: Option<TimeoutTask>,
    /// Group-specific query sequence triggered by a leave. While present,
    /// further leaves for this group are ignored.
    pub retransmit: Option<RetransmitQuery>,
    /// Timer for stepping the compatibility version back up.
    /// Present exactly while `compat` is below V3.
    pub version_task: Option<TimeoutTask>,
}

/// In-progress group-specific query sequence.
#[derive(Debug)]
pub struct RetransmitQuery {
    /// Queries still to be sent when the timer next fires.
    pub left: u8,
    pub task: TimeoutTask,
}

/// Host compatibility version (RFC 3376, section 7.3.2).
///
/// Only ever lowered by received reports; the version timer steps it back up
/// once the older hosts have been silent for a full membership interval.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum GroupCompat {
    V1 = 1,
    V2 = 2,
    V3 = 3,
}

// ===== impl Group =====

impl Group {
    pub(crate) fn new(group_addr: Ipv4Addr, compat: GroupCompat) -> Group {
        Debug::GroupCreate(&group_addr, compat).log();

        Group {
            group_addr,
            last_reporter: None,
            compat,
            static_entry: false,
            created: Utc::now(),
            membership_task: None,
            retransmit: None,
            version_task: None,
        }
    }

    pub(crate) fn new_static(group_addr: Ipv4Addr) -> Group {
        let mut group = Group::new(group_addr, GroupCompat::V3);
        group.static_entry = true;
        group
    }

    // Starts or restarts the membership timer.
    pub(crate) fn membership_reset(
        &mut self,
        ifindex: u32,
        timeout: u32,
        group_timeoutp: &Sender<GroupTimeoutMsg>,
    ) {
        let timeout = Duration::from_secs(timeout.into());

        if let Some(task) = &mut self.membership_task {
            task.reset(Some(timeout));
        } else {
            self.membership_task = Some(tasks::group_timeout(
                ifindex,
                self.group_addr,
                timeout,
                group_timeoutp,
            ));
        }
    }

    pub(crate) fn membership_remaining(&self) -> Option<Duration> {
        self.membership_task.as_ref().map(TimeoutTask::remaining)
    }

    // Starts a group-specific query sequence. `left` is the number of
    // queries still to send after the one already sent by the caller.
    pub(crate) fn retransmit_start(
        &mut self,
        ifindex: u32,
        left: u8,
        interval: u16,
        group_query_timeoutp: &Sender<GroupQueryTimeoutMsg>,
    ) {
        let interval = Duration::from_secs(interval.into());
        let task = tasks::group_query_timeout(
            ifindex,
            self.group_addr,
            interval,
            group_query_timeoutp,
        );
        self.retransmit = Some(RetransmitQuery { left, task });
    }

    pub(crate) fn retransmit_stop(&mut self) {
        self.retransmit = None;
    }

    // Starts or restarts the version-upgrade timer.
    pub(crate) fn version_reset(
        &mut self,
        ifindex: u32,
        timeout: u32,
        group_version_timeoutp: &Sender<GroupVersionTimeoutMsg>,
    ) {
        let timeout = Duration::from_secs(timeout.into());

        if let Some(task) = &mut self.version_task {
            task.reset(Some(timeout));
        } else {
            self.version_task = Some(tasks::group_version_timeout(
                ifindex,
                self.group_addr,
                timeout,
                group_version_timeoutp,
            ));
        }
    }

    pub(crate) fn version_stop(&mut self) {
        self.version_task = None;
    }

    pub(crate) fn update_reporter(&mut self, reporter: Ipv4Addr) {
        self.last_reporter = Some(reporter);
    }
}

// ===== impl GroupCompat =====

impl GroupCompat {
    // The next step on the way back to IGMPv3.
    pub(crate) fn upgrade(self) -> GroupCompat {
        match self {
            GroupCompat::V1 => GroupCompat::V2,
            GroupCompat::V2 | GroupCompat::V3 => GroupCompat::V3,
        }
    }
}

impl std::fmt::Display for GroupCompat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupCompat::V1 => write!(f, "IGMPv1"),
            GroupCompat::V2 => write!(f, "IGMPv2"),
            GroupCompat::V3 => write!(f, "IGMPv3"),
        }
    }
}
