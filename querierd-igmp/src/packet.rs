//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;
use std::ops::Deref;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use internet_checksum::Checksum;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use querierd_utils::bytes::{BytesExt, BytesMutExt};
use serde::{Deserialize, Serialize};

use crate::consts::{
    IGMP_GREC_MIN_LENGTH, IGMP_HDR_LENGTH, IGMP_IP_PROTO,
    IGMP_QUERY_V3_MIN_LENGTH, IGMP_TOS, IP_HDR_LENGTH, IP_HDR_RAOPT_LENGTH,
    IPOPT_RA,
};

// Type aliases.
pub type DecodeResult<T> = Result<T, DecodeError>;

// Decode errors.
#[derive(Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum DecodeError {
    InsufficientData,
    InvalidChecksum,
    InvalidIpVersion(u8),
    InvalidIpProtocol(u8),
    InvalidLength(usize),
    InvalidQueryLength(usize),
    UnknownPacketType(u8),
    BoundsExceeded,
}

// IGMP Packet Type.
//
// IANA registry:
// https://www.iana.org/assignments/igmp-type-numbers/igmp-type-numbers.xhtml#igmp-type-numbers-2
#[derive(Clone, Copy, Debug, Eq, Hash, FromPrimitive, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum PacketType {
    MembershipQuery = 0x11,
    MembershipReportV1 = 0x12,
    MembershipReportV2 = 0x16,
    LeaveGroupV2 = 0x17,
    MembershipReportV3 = 0x22,
}

// Query versions, detected from the payload length (RFC 3376, section 7.1).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum QueryVersion {
    V1,
    V2,
    V3,
}

// Minimal view of the IPv4 header carried by every received IGMP frame,
// and builder for the header of every emitted one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Ipv4Hdr {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub router_alert: bool,
}

//
// 0                   1                   2                   3
// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |  Type = 0x11  | Max Resp Code |           Checksum            |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                         Group Address                         |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// | Resv  |S| QRV |     QQIC      |     Number of Sources (N)     |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                       Source Address [1..N]                   |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
// The last two rows exist in IGMPv3 queries only. An 8-byte query with a
// zero Max Resp Code is IGMPv1; an 8-byte query with a non-zero code is
// IGMPv2. Max Resp Code and QQIC are stored decoded (tenths of seconds and
// seconds respectively); the wire float code is applied on encode.
//
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct MembershipQuery {
    pub version: QueryVersion,
    pub max_resp_time: u16,
    pub checksum: u16,
    pub group_addr: Option<Ipv4Addr>,
    pub s_qrv: u8,
    pub qqic: u16,
    pub sources: Vec<Ipv4Addr>,
}

// Fixed 8-byte layout shared by the IGMPv1/v2 message family.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct IgmpV2Message {
    pub igmp_type: PacketType,
    pub max_resp_time: u8,
    pub checksum: u16,
    pub group_addr: Option<Ipv4Addr>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct MembershipReportV1(pub IgmpV2Message);

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct MembershipReportV2(pub IgmpV2Message);

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct LeaveGroupV2(pub IgmpV2Message);

// IGMPv3 group record types (RFC 3376, section 4.2.12).
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, Hash, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum GroupRecordType {
    ModeIsInclude = 1,
    ModeIsExclude = 2,
    ChangeToInclude = 3,
    ChangeToExclude = 4,
    AllowNewSources = 5,
    BlockOldSources = 6,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct GroupRecord {
    pub record_type: GroupRecordType,
    pub group_addr: Ipv4Addr,
    pub sources: Vec<Ipv4Addr>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct MembershipReportV3 {
    pub checksum: u16,
    pub group_records: Vec<GroupRecord>,
}

// IGMP packets.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum Packet {
    MembershipQuery(MembershipQuery),
    MembershipReportV1(MembershipReportV1),
    MembershipReportV2(MembershipReportV2),
    MembershipReportV3(MembershipReportV3),
    LeaveGroup(LeaveGroupV2),
}

// ===== impl Ipv4Hdr =====

impl Ipv4Hdr {
    // Parses and validates the IPv4 header of a received frame, advancing
    // `buf` to the start of the IGMP payload.
    pub fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let frame_len = buf.len();
        if frame_len < IP_HDR_LENGTH {
            return Err(DecodeError::InsufficientData);
        }

        let mut hdr = buf.clone();
        let ver_ihl = hdr.get_u8();
        let version = ver_ihl >> 4;
        if version != 4 {
            return Err(DecodeError::InvalidIpVersion(version));
        }
        let hdr_len = ((ver_ihl & 0x0f) << 2) as usize;
        if hdr_len < IP_HDR_LENGTH || hdr_len > frame_len {
            return Err(DecodeError::InvalidLength(hdr_len));
        }

        let _tos = hdr.get_u8();
        let total_len = hdr.get_u16() as usize;
        // The kernel hands over exactly one IP packet per read, so the
        // advertised total length must match the receive length.
        if total_len != frame_len {
            return Err(DecodeError::InvalidLength(total_len));
        }
        if total_len - hdr_len < IGMP_HDR_LENGTH {
            return Err(DecodeError::InsufficientData);
        }

        let _id = hdr.get_u16();
        let _frag = hdr.get_u16();
        let _ttl = hdr.get_u8();
        let proto = hdr.get_u8();
        if proto as i32 != IGMP_IP_PROTO {
            return Err(DecodeError::InvalidIpProtocol(proto));
        }
        let _checksum = hdr.get_u16();
        let src = hdr.get_ipv4();
        let dst = hdr.get_ipv4();

        // Scan options for Router Alert.
        let mut router_alert = false;
        let mut options = &buf.as_ref()[IP_HDR_LENGTH..hdr_len];
        while let Some(&opt_type) = options.first() {
            match opt_type {
                // End of options.
                0 => break,
                // NOP.
                1 => options = &options[1..],
                _ => {
                    if opt_type == IPOPT_RA[0] {
                        router_alert = true;
                    }
                    let opt_len = options.get(1).copied().unwrap_or(0) as usize;
                    if opt_len < 2 || opt_len > options.len() {
                        break;
                    }
                    options = &options[opt_len..];
                }
            }
        }

        buf.advance(hdr_len);

        Ok(Ipv4Hdr {
            src,
            dst,
            router_alert,
        })
    }

    // Appends an IPv4 header for an IGMP payload of `data_len` bytes.
    //
    // TTL is 1 for multicast destinations and 255 otherwise; the header
    // checksum covers the Router Alert option when present and is computed
    // last.
    pub fn encode(&self, buf: &mut BytesMut, data_len: usize) {
        let hdr_len = if self.router_alert {
            IP_HDR_RAOPT_LENGTH
        } else {
            IP_HDR_LENGTH
        };

        buf.put_u8(0x40 | (hdr_len >> 2) as u8);
        buf.put_u8(IGMP_TOS);
        buf.put_u16((hdr_len + data_len) as u16);
        // Identification, flags and fragment offset are zero; the packets
        // are far too small to fragment.
        buf.put_u32(0);
        buf.put_u8(if self.dst.is_multicast() { 1 } else { 255 });
        buf.put_u8(IGMP_IP_PROTO as u8);
        buf.put_u16(0);
        buf.put_ipv4(&self.src);
        buf.put_ipv4(&self.dst);
        if self.router_alert {
            buf.put_slice(&IPOPT_RA);
        }

        update_cksum(buf, 0, 10);
    }
}

// ===== impl Packet =====

impl Packet {
    // Decodes the IGMP payload of a received frame.
    pub fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        if buf.len() < IGMP_HDR_LENGTH {
            return Err(DecodeError::InsufficientData);
        }

        let pkt_type = buf.clone().get_u8();
        let pkt_type = match PacketType::from_u8(pkt_type) {
            Some(pkt_type) => pkt_type,
            None => return Err(DecodeError::UnknownPacketType(pkt_type)),
        };

        let packet = match pkt_type {
            PacketType::MembershipQuery => {
                Packet::MembershipQuery(MembershipQuery::decode(buf)?)
            }
            PacketType::MembershipReportV1 => Packet::MembershipReportV1(
                MembershipReportV1(IgmpV2Message::decode(buf, pkt_type)?),
            ),
            PacketType::MembershipReportV2 => Packet::MembershipReportV2(
                MembershipReportV2(IgmpV2Message::decode(buf, pkt_type)?),
            ),
            PacketType::LeaveGroupV2 => Packet::LeaveGroup(LeaveGroupV2(
                IgmpV2Message::decode(buf, pkt_type)?,
            )),
            PacketType::MembershipReportV3 => {
                Packet::MembershipReportV3(MembershipReportV3::decode(buf)?)
            }
        };
        Ok(packet)
    }

    // Encodes the IGMP payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(255);

        match self {
            Packet::MembershipQuery(query) => query.encode(&mut buf),
            Packet::MembershipReportV1(report) => report.0.encode(&mut buf),
            Packet::MembershipReportV2(report) => report.0.encode(&mut buf),
            Packet::MembershipReportV3(report) => report.encode(&mut buf),
            Packet::LeaveGroup(leave) => leave.0.encode(&mut buf),
        }

        buf.freeze()
    }

    // Encodes a full IPv4 frame carrying this packet.
    pub fn encode_ipv4(
        &self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        router_alert: bool,
    ) -> Bytes {
        let payload = self.encode();
        let hdr = Ipv4Hdr {
            src,
            dst,
            router_alert,
        };

        let mut buf =
            BytesMut::with_capacity(IP_HDR_RAOPT_LENGTH + payload.len());
        hdr.encode(&mut buf, payload.len());
        buf.put_slice(&payload);
        buf.freeze()
    }
}

// ===== impl MembershipQuery =====

impl MembershipQuery {
    pub fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let buf_orig = buf.clone();
        let query_len = buf.len();

        let _pkt_type = buf.get_u8();
        let code = buf.get_u8();
        let checksum = buf.get_u16();
        verify_cksum(buf_orig.as_ref())?;
        let group_addr = buf.get_opt_ipv4();

        // RFC 3376, section 7.1.
        let query = if query_len == IGMP_HDR_LENGTH {
            MembershipQuery {
                version: if code == 0 {
                    QueryVersion::V1
                } else {
                    QueryVersion::V2
                },
                max_resp_time: code as u16,
                checksum,
                group_addr,
                s_qrv: 0,
                qqic: 0,
                sources: vec![],
            }
        } else if query_len >= IGMP_QUERY_V3_MIN_LENGTH {
            let s_qrv = buf.get_u8();
            let qqic = float_decode(buf.get_u8());
            let nsrcs = buf.get_u16() as usize;
            if buf.remaining() < nsrcs * 4 {
                return Err(DecodeError::BoundsExceeded);
            }
            let sources = (0..nsrcs).map(|_| buf.get_ipv4()).collect();

            MembershipQuery {
                version: QueryVersion::V3,
                max_resp_time: float_decode(code),
                checksum,
                group_addr,
                s_qrv,
                qqic,
                sources,
            }
        } else {
            return Err(DecodeError::InvalidQueryLength(query_len));
        };

        Ok(query)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(PacketType::MembershipQuery as u8);
        match self.version {
            // IGMPv1 routers MUST send queries with a Max Response Time
            // of 0; IGMPv2 queries are truncated at the group field.
            QueryVersion::V1 => buf.put_u8(0),
            QueryVersion::V2 => buf.put_u8(self.max_resp_time as u8),
            QueryVersion::V3 => buf.put_u8(float_encode(self.max_resp_time)),
        }
        buf.put_u16(0);
        buf.put_ipv4(&self.group_addr.unwrap_or(Ipv4Addr::UNSPECIFIED));

        if self.version == QueryVersion::V3 {
            buf.put_u8(self.s_qrv & 0x07);
            buf.put_u8(float_encode(self.qqic));
            buf.put_u16(self.sources.len() as u16);
            for source in &self.sources {
                buf.put_ipv4(source);
            }
        }

        update_cksum(buf, 0, 2);
    }
}

// ===== impl IgmpV2Message =====

impl IgmpV2Message {
    pub fn decode(
        buf: &mut Bytes,
        expected_type: PacketType,
    ) -> DecodeResult<Self> {
        let buf_orig = buf.clone();

        if buf.len() < IGMP_HDR_LENGTH {
            return Err(DecodeError::InsufficientData);
        }

        let pkt_type = buf.get_u8();
        let pkt_type = match PacketType::from_u8(pkt_type) {
            Some(pkt_type) => pkt_type,
            None => return Err(DecodeError::UnknownPacketType(pkt_type)),
        };
        if pkt_type != expected_type {
            return Err(DecodeError::UnknownPacketType(pkt_type as u8));
        }

        let max_resp_time = buf.get_u8();
        let checksum = buf.get_u16();
        verify_cksum(buf_orig.as_ref())?;
        let group_addr = buf.get_opt_ipv4();

        Ok(IgmpV2Message {
            igmp_type: pkt_type,
            max_resp_time,
            checksum,
            group_addr,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.igmp_type as u8);
        buf.put_u8(self.max_resp_time);
        buf.put_u16(0);
        buf.put_ipv4(&self.group_addr.unwrap_or(Ipv4Addr::UNSPECIFIED));

        update_cksum(buf, 0, 2);
    }
}

impl Deref for MembershipReportV1 {
    type Target = IgmpV2Message;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Deref for MembershipReportV2 {
    type Target = IgmpV2Message;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Deref for LeaveGroupV2 {
    type Target = IgmpV2Message;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ===== impl MembershipReportV3 =====

impl MembershipReportV3 {
    pub fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let buf_orig = buf.clone();

        let _pkt_type = buf.get_u8();
        let _reserved = buf.get_u8();
        let checksum = buf.get_u16();
        verify_cksum(buf_orig.as_ref())?;
        let _reserved = buf.get_u16();
        let ngrec = buf.get_u16();

        // Walk the group records, validating each advertised size against
        // the end of the payload. A record that would overflow invalidates
        // the whole report.
        let mut group_records = Vec::with_capacity(ngrec as usize);
        for _ in 0..ngrec {
            if buf.remaining() < IGMP_GREC_MIN_LENGTH {
                return Err(DecodeError::BoundsExceeded);
            }

            let record_type = buf.get_u8();
            let aux_data_len = buf.get_u8() as usize;
            let nsrcs = buf.get_u16() as usize;
            let group_addr = buf.get_ipv4();

            if buf.remaining() < nsrcs * 4 + aux_data_len * 4 {
                return Err(DecodeError::BoundsExceeded);
            }
            let sources = (0..nsrcs).map(|_| buf.get_ipv4()).collect();
            buf.advance(aux_data_len * 4);

            // RFC 3376, section 4.2.12: unrecognized record types MUST be
            // silently ignored.
            let Some(record_type) = GroupRecordType::from_u8(record_type)
            else {
                continue;
            };

            group_records.push(GroupRecord {
                record_type,
                group_addr,
                sources,
            });
        }

        Ok(MembershipReportV3 {
            checksum,
            group_records,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(PacketType::MembershipReportV3 as u8);
        buf.put_u8(0);
        buf.put_u16(0);
        buf.put_u16(0);
        buf.put_u16(self.group_records.len() as u16);
        for record in &self.group_records {
            buf.put_u8(record.record_type as u8);
            buf.put_u8(0);
            buf.put_u16(record.sources.len() as u16);
            buf.put_ipv4(&record.group_addr);
            for source in &record.sources {
                buf.put_ipv4(source);
            }
        }

        update_cksum(buf, 0, 2);
    }
}

// ===== impl QueryVersion =====

impl std::fmt::Display for QueryVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryVersion::V1 => write!(f, "IGMPv1"),
            QueryVersion::V2 => write!(f, "IGMPv2"),
            QueryVersion::V3 => write!(f, "IGMPv3"),
        }
    }
}

// ===== impl DecodeError =====

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::InsufficientData => {
                write!(f, "packet too short")
            }
            DecodeError::InvalidChecksum => {
                write!(f, "invalid checksum")
            }
            DecodeError::InvalidIpVersion(version) => {
                write!(f, "invalid IP version: {version}")
            }
            DecodeError::InvalidIpProtocol(proto) => {
                write!(f, "invalid IP protocol: {proto}")
            }
            DecodeError::InvalidLength(len) => {
                write!(f, "inconsistent packet length: {len}")
            }
            DecodeError::InvalidQueryLength(len) => {
                write!(f, "invalid membership query length: {len}")
            }
            DecodeError::UnknownPacketType(pkt_type) => {
                write!(f, "unknown packet type: 0x{pkt_type:02x}")
            }
            DecodeError::BoundsExceeded => {
                write!(f, "group record overflows the report")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

// ===== global functions =====

fn update_cksum(buf: &mut BytesMut, start: usize, cksum_pos: usize) {
    let mut cksum = Checksum::new();
    cksum.add_bytes(&buf[start..]);
    buf[cksum_pos..cksum_pos + 2].copy_from_slice(&cksum.checksum());
}

fn verify_cksum(data: &[u8]) -> DecodeResult<()> {
    let mut cksum = Checksum::new();
    cksum.add_bytes(data);
    if cksum.checksum() != [0, 0] {
        return Err(DecodeError::InvalidChecksum);
    }
    Ok(())
}

// RFC 3376, section 4.1.1: Max Resp Code and QQIC are 8-bit floating point
// values when they exceed 127:
//
//      0 1 2 3 4 5 6 7
//     +-+-+-+-+-+-+-+-+
//     |1| exp | mant  |
//     +-+-+-+-+-+-+-+-+
//
//     value = (mant | 0x10) << (exp + 3)
//
// Values wrap modulo 2^15, the largest the code can carry.
pub fn float_encode(value: u16) -> u8 {
    let value = value & 0x7fff;
    if value < 128 {
        return value as u8;
    }

    // Highest set bit is in [7, 14]; the implicit mantissa bit sits at
    // position exp + 7.
    let exp = (15 - value.leading_zeros() as u8) - 7;
    let mant = (value >> (exp + 3)) as u8 & 0x0f;
    0x80 | (exp << 4) | mant
}

pub fn float_decode(code: u8) -> u16 {
    if code < 128 {
        return code as u16;
    }

    let exp = (code >> 4) & 0x07;
    let mant = (code & 0x0f) as u16;
    (mant | 0x10) << (exp + 3)
}
