//! Byte-level parsing of ICMP replies and extended socket errors.

use hoplite_core::TraceError;

pub(crate) const ICMP_TIME_EXCEEDED: u8 = 11;
pub(crate) const ICMP_DEST_UNREACHABLE: u8 = 3;
/// Destination Unreachable code marking "Port Unreachable".
pub(crate) const ICMP_CODE_PORT_UNREACHABLE: u8 = 3;

/// The quoted probe inside an ICMP error always starts with a plain
/// 20-byte IPv4 header; routers do not quote options.
const QUOTED_IPV4_HEADER_LEN: usize = 20;
const ICMP_HEADER_LEN: usize = 8;
const IPV4_IHL_MASK: u8 = 0x0F;

/// A decoded raw-socket ICMP reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawReply {
    pub icmp_type: u8,
    pub icmp_code: u8,
    /// First 16-bit field of the quoted transport header: the source port
    /// of the probe that triggered this reply.
    pub probe_port: u16,
}

impl RawReply {
    pub(crate) fn reached(&self) -> bool {
        self.icmp_type == ICMP_DEST_UNREACHABLE && self.icmp_code == ICMP_CODE_PORT_UNREACHABLE
    }
}

/// Parses a datagram read from a raw ICMPv4 socket: outer IPv4 header,
/// ICMP header, quoted IPv4 header, then the quoted transport ports.
///
/// Only TimeExceeded and DestinationUnreachable are traceroute replies;
/// any other type is a parse failure and the caller keeps reading.
pub(crate) fn parse_raw_reply(buf: &[u8]) -> Result<RawReply, TraceError> {
    let first = *buf
        .first()
        .ok_or_else(|| TraceError::MalformedPacket("empty packet".into()))?;

    match first >> 4 {
        4 => {}
        6 => return Err(TraceError::MalformedPacket("ipv6 not supported".into())),
        version => {
            return Err(TraceError::MalformedPacket(format!(
                "unexpected IP version {version}"
            )))
        }
    }

    let outer_len = usize::from(first & IPV4_IHL_MASK) * 4;
    if buf.len() < outer_len + ICMP_HEADER_LEN {
        return Err(TraceError::MalformedPacket(format!(
            "packet too short for ICMP header: {} bytes",
            buf.len()
        )));
    }

    let icmp = &buf[outer_len..];
    let icmp_type = icmp[0];
    let icmp_code = icmp[1];
    if icmp_type != ICMP_TIME_EXCEEDED && icmp_type != ICMP_DEST_UNREACHABLE {
        return Err(TraceError::MalformedPacket(format!(
            "unexpected ICMP type {icmp_type}"
        )));
    }

    let quoted = &icmp[ICMP_HEADER_LEN..];
    if quoted.len() < QUOTED_IPV4_HEADER_LEN + 4 {
        return Err(TraceError::MalformedPacket(format!(
            "quoted segment too short: {} bytes",
            quoted.len()
        )));
    }
    let transport = &quoted[QUOTED_IPV4_HEADER_LEN..];
    let probe_port = u16::from_be_bytes([transport[0], transport[1]]);

    Ok(RawReply {
        icmp_type,
        icmp_code,
        probe_port,
    })
}

/// Kernel `sock_extended_err`, decoded from the first 16 bytes of a
/// `SOL_IP`/`IP_RECVERR` control message. Multi-byte fields are
/// little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SockExtendedErr {
    pub errno: u32,
    pub origin: u8,
    pub icmp_type: u8,
    pub icmp_code: u8,
    pub info: u32,
    pub data: u32,
}

const MIN_EXTENDED_ERR_LEN: usize = 16;

pub(crate) fn parse_sock_extended_err(data: &[u8]) -> Result<SockExtendedErr, TraceError> {
    if data.len() < MIN_EXTENDED_ERR_LEN {
        return Err(TraceError::MalformedPacket(format!(
            "extended error too short: {} bytes",
            data.len()
        )));
    }
    Ok(SockExtendedErr {
        errno: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
        origin: data[4],
        icmp_type: data[5],
        icmp_code: data[6],
        info: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
        data: u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
    })
}

/// Extracts the quoted destination port from the data buffer of an
/// error-queue read: an IHL-prefixed IPv4 header followed by at least four
/// bytes of UDP header.
pub(crate) fn quoted_dst_port(data: &[u8]) -> Result<u16, TraceError> {
    let first = *data
        .first()
        .ok_or_else(|| TraceError::MalformedPacket("empty error payload".into()))?;

    let header_len = usize::from(first & IPV4_IHL_MASK) * 4;
    if data.len() < header_len + 4 {
        return Err(TraceError::MalformedPacket(
            "error payload too small for UDP header".into(),
        ));
    }
    Ok(u16::from_be_bytes([
        data[header_len + 2],
        data[header_len + 3],
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a raw ICMPv4 reply wrapping a probe sent from `probe_port`.
    fn raw_reply(icmp_type: u8, icmp_code: u8, probe_port: u16, dst_port: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        // Outer IPv4 header, IHL 5.
        buf.push(0x45);
        buf.extend_from_slice(&[0; 19]);
        // ICMP header: type, code, checksum, unused.
        buf.push(icmp_type);
        buf.push(icmp_code);
        buf.extend_from_slice(&[0; 6]);
        // Quoted IPv4 header of the probe.
        buf.push(0x45);
        buf.extend_from_slice(&[0; 19]);
        // Quoted transport ports.
        buf.extend_from_slice(&probe_port.to_be_bytes());
        buf.extend_from_slice(&dst_port.to_be_bytes());
        buf
    }

    #[test]
    fn time_exceeded_is_an_intermediate_hop() {
        let reply = parse_raw_reply(&raw_reply(11, 0, 31999, 443)).unwrap();
        assert_eq!(reply.probe_port, 31999);
        assert!(!reply.reached());
    }

    #[test]
    fn port_unreachable_marks_the_destination() {
        let reply = parse_raw_reply(&raw_reply(3, 3, 30500, 443)).unwrap();
        assert!(reply.reached());

        // Any other unreachable code is still an intermediate hop.
        let host_unreachable = parse_raw_reply(&raw_reply(3, 1, 30500, 443)).unwrap();
        assert!(!host_unreachable.reached());
    }

    #[test]
    fn unexpected_types_are_rejected() {
        let echo_reply = raw_reply(0, 0, 30500, 443);
        let err = parse_raw_reply(&echo_reply).unwrap_err();
        assert!(err.to_string().contains("unexpected ICMP type"));
    }

    #[test]
    fn ipv6_is_rejected() {
        let err = parse_raw_reply(&[0x60; 48]).unwrap_err();
        assert!(err.to_string().contains("ipv6 not supported"));
    }

    #[test]
    fn truncated_packets_are_rejected() {
        assert!(parse_raw_reply(&[]).is_err());
        assert!(parse_raw_reply(&[0x45; 10]).is_err());

        let mut short = raw_reply(11, 0, 31999, 443);
        short.truncate(short.len() - 8);
        assert!(parse_raw_reply(&short).is_err());
    }

    #[test]
    fn extended_err_fields_are_little_endian() {
        let mut data = [0u8; 16];
        data[0..4].copy_from_slice(&113u32.to_le_bytes()); // errno
        data[4] = 2; // origin
        data[5] = 11; // type
        data[6] = 0; // code
        data[8..12].copy_from_slice(&7u32.to_le_bytes()); // info
        data[12..16].copy_from_slice(&9u32.to_le_bytes()); // data

        let ee = parse_sock_extended_err(&data).unwrap();
        assert_eq!(ee.errno, 113);
        assert_eq!(ee.origin, 2);
        assert_eq!(ee.icmp_type, 11);
        assert_eq!(ee.icmp_code, 0);
        assert_eq!(ee.info, 7);
        assert_eq!(ee.data, 9);
    }

    #[test]
    fn short_extended_err_is_rejected() {
        let err = parse_sock_extended_err(&[0u8; 15]).unwrap_err();
        assert!(err.to_string().contains("extended error too short"));
    }

    #[test]
    fn quoted_dst_port_honors_the_ihl() {
        // IHL 5: the UDP header starts at byte 20.
        let mut data = vec![0u8; 24];
        data[0] = 0x45;
        data[22..24].copy_from_slice(&33434u16.to_be_bytes());
        assert_eq!(quoted_dst_port(&data).unwrap(), 33434);

        // IHL 6: one 4-byte option shifts the UDP header to byte 24.
        let mut with_options = vec![0u8; 28];
        with_options[0] = 0x46;
        with_options[26..28].copy_from_slice(&53u16.to_be_bytes());
        assert_eq!(quoted_dst_port(&with_options).unwrap(), 53);
    }

    #[test]
    fn short_error_payloads_are_rejected() {
        assert!(quoted_dst_port(&[]).is_err());
        let mut data = vec![0u8; 23];
        data[0] = 0x45;
        assert!(quoted_dst_port(&data).is_err());
    }
}
