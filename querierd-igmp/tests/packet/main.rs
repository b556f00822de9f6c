//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::LazyLock as Lazy;

use bytes::{Bytes, BytesMut};
use const_addrs::ip4;
use querierd_igmp::packet::{
    DecodeError, DecodeResult, GroupRecord, GroupRecordType, IgmpV2Message,
    Ipv4Hdr, LeaveGroupV2, MembershipQuery, MembershipReportV1,
    MembershipReportV2, MembershipReportV3, Packet, PacketType, QueryVersion,
    float_decode, float_encode,
};

//
// Helper functions.
//

fn test_decode_packet(bytes: &[u8], packet_expected: &Packet) {
    let mut buf = Bytes::copy_from_slice(bytes);
    let packet_actual = Packet::decode(&mut buf).unwrap();
    assert_eq!(*packet_expected, packet_actual);
}

fn test_encode_packet(bytes_expected: &[u8], packet: &Packet) {
    let bytes_actual = packet.encode();
    assert_eq!(bytes_expected, bytes_actual.as_ref());
}

fn test_decode_error(bytes: &[u8], error_expected: DecodeError) {
    let mut buf = Bytes::copy_from_slice(bytes);
    let result: DecodeResult<Packet> = Packet::decode(&mut buf);
    assert_eq!(result, Err(error_expected));
}

//
// Test packets.
//

static QUERY_V1: Lazy<(Vec<u8>, Packet)> = Lazy::new(|| {
    (
        vec![0x11, 0x00, 0xee, 0xff, 0x00, 0x00, 0x00, 0x00],
        Packet::MembershipQuery(MembershipQuery {
            version: QueryVersion::V1,
            max_resp_time: 0,
            checksum: 0xeeff,
            group_addr: None,
            s_qrv: 0,
            qqic: 0,
            sources: vec![],
        }),
    )
});

static QUERY_V2: Lazy<(Vec<u8>, Packet)> = Lazy::new(|| {
    (
        vec![0x11, 0x64, 0xfd, 0x96, 0xef, 0x01, 0x02, 0x03],
        Packet::MembershipQuery(MembershipQuery {
            version: QueryVersion::V2,
            max_resp_time: 100,
            checksum: 0xfd96,
            group_addr: Some(ip4!("239.1.2.3")),
            s_qrv: 0,
            qqic: 0,
            sources: vec![],
        }),
    )
});

static QUERY_V3_GENERAL: Lazy<(Vec<u8>, Packet)> = Lazy::new(|| {
    (
        vec![
            0x11, 0x64, 0xec, 0x1e, 0x00, 0x00, 0x00, 0x00, 0x02, 0x7d, 0x00,
            0x00,
        ],
        Packet::MembershipQuery(MembershipQuery {
            version: QueryVersion::V3,
            max_resp_time: 100,
            checksum: 0xec1e,
            group_addr: None,
            s_qrv: 2,
            qqic: 125,
            sources: vec![],
        }),
    )
});

// Max Resp Code above 127 uses the float code (0xc7 <-> 2944 tenths of a
// second).
static QUERY_V3_SOURCES: Lazy<(Vec<u8>, Packet)> = Lazy::new(|| {
    (
        vec![
            0x11, 0xc7, 0x35, 0xae, 0xef, 0x05, 0x05, 0x05, 0x02, 0x7d, 0x00,
            0x01, 0xc0, 0x00, 0x02, 0x01,
        ],
        Packet::MembershipQuery(MembershipQuery {
            version: QueryVersion::V3,
            max_resp_time: 2944,
            checksum: 0x35ae,
            group_addr: Some(ip4!("239.5.5.5")),
            s_qrv: 2,
            qqic: 125,
            sources: vec![ip4!("192.0.2.1")],
        }),
    )
});

static REPORT_V1: Lazy<(Vec<u8>, Packet)> = Lazy::new(|| {
    (
        vec![0x12, 0x00, 0xfc, 0xfa, 0xef, 0x01, 0x02, 0x03],
        Packet::MembershipReportV1(MembershipReportV1(IgmpV2Message {
            igmp_type: PacketType::MembershipReportV1,
            max_resp_time: 0,
            checksum: 0xfcfa,
            group_addr: Some(ip4!("239.1.2.3")),
        })),
    )
});

static REPORT_V2: Lazy<(Vec<u8>, Packet)> = Lazy::new(|| {
    (
        vec![0x16, 0x00, 0x06, 0xfb, 0xe1, 0x01, 0x02, 0x03],
        Packet::MembershipReportV2(MembershipReportV2(IgmpV2Message {
            igmp_type: PacketType::MembershipReportV2,
            max_resp_time: 0,
            checksum: 0x06fb,
            group_addr: Some(ip4!("225.1.2.3")),
        })),
    )
});

static REPORT_V2_BAD_CHECKSUM: Lazy<Vec<u8>> =
    Lazy::new(|| vec![0x16, 0x00, 0x06, 0xfc, 0xe1, 0x01, 0x02, 0x03]);

static LEAVE_V2: Lazy<(Vec<u8>, Packet)> = Lazy::new(|| {
    (
        vec![0x17, 0x00, 0xf7, 0xfa, 0xef, 0x01, 0x02, 0x03],
        Packet::LeaveGroup(LeaveGroupV2(IgmpV2Message {
            igmp_type: PacketType::LeaveGroupV2,
            max_resp_time: 0,
            checksum: 0xf7fa,
            group_addr: Some(ip4!("239.1.2.3")),
        })),
    )
});

static REPORT_V3_ALLOW: Lazy<(Vec<u8>, Packet)> = Lazy::new(|| {
    (
        vec![
            0x22, 0x00, 0x60, 0xdb, 0x00, 0x00, 0x00, 0x01, 0x05, 0x00, 0x00,
            0x02, 0xef, 0x05, 0x05, 0x05, 0xc0, 0x00, 0x02, 0x0a, 0xc0, 0x00,
            0x02, 0x0b,
        ],
        Packet::MembershipReportV3(MembershipReportV3 {
            checksum: 0x60db,
            group_records: vec![GroupRecord {
                record_type: GroupRecordType::AllowNewSources,
                group_addr: ip4!("239.5.5.5"),
                sources: vec![ip4!("192.0.2.10"), ip4!("192.0.2.11")],
            }],
        }),
    )
});

// One group record advertising two sources while carrying only one.
static REPORT_V3_TRUNCATED: Lazy<Vec<u8>> = Lazy::new(|| {
    vec![
        0x22, 0x00, 0x22, 0xe7, 0x00, 0x00, 0x00, 0x01, 0x05, 0x00, 0x00,
        0x02, 0xef, 0x05, 0x05, 0x05, 0xc0, 0x00, 0x02, 0x0a,
    ]
});

//
// Tests.
//

#[test]
fn test_decode_query_v1() {
    let (ref bytes, ref packet) = *QUERY_V1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_query_v1() {
    let (ref bytes, ref packet) = *QUERY_V1;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_query_v2() {
    let (ref bytes, ref packet) = *QUERY_V2;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_query_v2() {
    let (ref bytes, ref packet) = *QUERY_V2;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_query_v3_general() {
    let (ref bytes, ref packet) = *QUERY_V3_GENERAL;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_query_v3_general() {
    let (ref bytes, ref packet) = *QUERY_V3_GENERAL;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_query_v3_sources() {
    let (ref bytes, ref packet) = *QUERY_V3_SOURCES;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_query_v3_sources() {
    let (ref bytes, ref packet) = *QUERY_V3_SOURCES;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_report_v1() {
    let (ref bytes, ref packet) = *REPORT_V1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_decode_report_v2() {
    let (ref bytes, ref packet) = *REPORT_V2;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_report_v2() {
    let (ref bytes, ref packet) = *REPORT_V2;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_report_v2_bad_checksum() {
    test_decode_error(&REPORT_V2_BAD_CHECKSUM, DecodeError::InvalidChecksum);
}

#[test]
fn test_decode_leave() {
    let (ref bytes, ref packet) = *LEAVE_V2;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_leave() {
    let (ref bytes, ref packet) = *LEAVE_V2;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_report_v3() {
    let (ref bytes, ref packet) = *REPORT_V3_ALLOW;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_report_v3() {
    let (ref bytes, ref packet) = *REPORT_V3_ALLOW;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_report_v3_truncated() {
    test_decode_error(&REPORT_V3_TRUNCATED, DecodeError::BoundsExceeded);
}

#[test]
fn test_decode_short_packet() {
    test_decode_error(&[0x16, 0x00, 0x06], DecodeError::InsufficientData);
}

#[test]
fn test_decode_invalid_query_length() {
    // A 10-byte query is neither IGMPv1/v2 (8) nor IGMPv3 (>= 12).
    //
    // Checksum over 11 00 ?? ?? 00000000 0000: 0x1100 -> 0xeeff.
    let bytes =
        [0x11, 0x00, 0xee, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
    test_decode_error(&bytes, DecodeError::InvalidQueryLength(10));
}

//
// IPv4 header.
//

#[test]
fn test_encode_ipv4_hdr() {
    let hdr = Ipv4Hdr {
        src: ip4!("10.0.0.5"),
        dst: ip4!("224.0.0.1"),
        router_alert: true,
    };
    let mut buf = BytesMut::new();
    hdr.encode(&mut buf, 8);

    assert_eq!(
        buf.as_ref(),
        [
            0x46, 0xc0, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x01, 0x02, 0x3a,
            0x12, 0x0a, 0x00, 0x00, 0x05, 0xe0, 0x00, 0x00, 0x01, 0x94, 0x04,
            0x00, 0x00,
        ]
    );

    // The checksum of a valid header recomputes to zero.
    let mut cksum = internet_checksum::Checksum::new();
    cksum.add_bytes(&buf);
    assert_eq!(cksum.checksum(), [0, 0]);
}

#[test]
fn test_decode_ipv4_frame() {
    let frame = [
        0x45, 0x00, 0x00, 0x1c, 0x00, 0x00, 0x00, 0x00, 0x01, 0x02, 0xcc,
        0xaa, 0x0a, 0x00, 0x00, 0x32, 0xe1, 0x01, 0x02, 0x03, 0x16, 0x00,
        0x06, 0xfb, 0xe1, 0x01, 0x02, 0x03,
    ];

    let mut buf = Bytes::copy_from_slice(&frame);
    let hdr = Ipv4Hdr::decode(&mut buf).unwrap();
    assert_eq!(hdr.src, ip4!("10.0.0.50"));
    assert_eq!(hdr.dst, ip4!("225.1.2.3"));
    assert!(!hdr.router_alert);

    let (_, ref packet) = *REPORT_V2;
    assert_eq!(Packet::decode(&mut buf).unwrap(), *packet);
}

#[test]
fn test_decode_ipv4_frame_length_mismatch() {
    // Total length field says 28, actual frame is 27 bytes.
    let frame = [
        0x45, 0x00, 0x00, 0x1c, 0x00, 0x00, 0x00, 0x00, 0x01, 0x02, 0xcc,
        0xaa, 0x0a, 0x00, 0x00, 0x32, 0xe1, 0x01, 0x02, 0x03, 0x16, 0x00,
        0x06, 0xfb, 0xe1, 0x01, 0x02,
    ];

    let mut buf = Bytes::copy_from_slice(&frame);
    assert_eq!(
        Ipv4Hdr::decode(&mut buf),
        Err(DecodeError::InvalidLength(28))
    );
}

#[test]
fn test_roundtrip_full_frame() {
    let (_, ref packet) = *QUERY_V3_GENERAL;
    let frame = packet.encode_ipv4(ip4!("10.0.0.5"), ip4!("224.0.0.1"), true);

    let mut buf = Bytes::copy_from_slice(&frame);
    let hdr = Ipv4Hdr::decode(&mut buf).unwrap();
    assert_eq!(hdr.src, ip4!("10.0.0.5"));
    assert_eq!(hdr.dst, ip4!("224.0.0.1"));
    assert!(hdr.router_alert);
    assert_eq!(Packet::decode(&mut buf).unwrap(), *packet);
}

//
// Float code (RFC 3376, section 4.1.1).
//

#[test]
fn test_float_code_small_values() {
    for value in 0..128 {
        assert_eq!(float_encode(value), value as u8);
        assert_eq!(float_decode(float_encode(value)), value);
    }
}

#[test]
fn test_float_code_large_values() {
    for value in 128..32768u16 {
        let code = float_encode(value);
        assert!(code >= 0x80);

        // The decoded value is never larger than the original, and the
        // error is bounded by the representation granularity.
        let decoded = float_decode(code);
        let granularity = 1u16 << (((code >> 4) & 0x07) + 3);
        assert!(decoded <= value);
        assert!(value - decoded < granularity);

        // Re-encoding the decoded value is the identity.
        assert_eq!(float_encode(decoded), code);
    }
}

#[test]
fn test_float_code_known_values() {
    assert_eq!(float_encode(128), 0x80);
    assert_eq!(float_decode(0x80), 128);
    assert_eq!(float_decode(0xff), 31744);
    assert_eq!(float_encode(31744), 0xff);
    // The maximum representable value.
    assert_eq!(float_decode(float_encode(32767)), 31744);
}

#[test]
fn test_float_code_wraps() {
    // Values of 2^15 and above wrap around.
    assert_eq!(float_encode(32768), 0);
    assert_eq!(float_encode(32768 + 100), 100);
}
