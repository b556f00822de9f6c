//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;

// IGMP IP protocol number.
pub const IGMP_IP_PROTO: i32 = 2;

// Receive buffer size, reused across packets.
pub const RECV_BUF_SIZE: usize = 8192;

// IPv4 header length, without and with the Router Alert option.
pub const IP_HDR_LENGTH: usize = 20;
pub const IP_HDR_RAOPT_LENGTH: usize = 24;

// IPv4 TOS used for all IGMP output (Internet Control).
pub const IGMP_TOS: u8 = 0xc0;

// IPv4 Router Alert option (RFC 2113).
pub const IPOPT_RA: [u8; 4] = [148, 4, 0, 0];

// Fixed part of every IGMP message.
pub const IGMP_HDR_LENGTH: usize = 8;

// Minimum length of an IGMPv3 membership query.
pub const IGMP_QUERY_V3_MIN_LENGTH: usize = 12;

// Fixed part of an IGMPv3 group record.
pub const IGMP_GREC_MIN_LENGTH: usize = 8;

// Max Resp Time and QQIC are expressed in tenths of seconds.
pub const IGMP_TIMER_SCALE: u16 = 10;

// Well-known multicast destinations.
pub const ALL_SYSTEMS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);
pub const ALL_ROUTERS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 2);
pub const ALL_REPORTS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 22);

// Groups up to and including this address are LAN-scoped and never tracked.
pub const MAX_LOCAL_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 255);

// Protocol defaults (RFC 3376, section 8).
pub const DFLT_QUERY_INTERVAL: u16 = 125;
pub const DFLT_QUERY_RESPONSE_INTERVAL: u16 = 10;
pub const DFLT_LAST_MEMBER_QUERY_INTERVAL: u16 = 1;
pub const DFLT_ROBUSTNESS_VARIABLE: u8 = 2;
