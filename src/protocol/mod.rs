use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::error::{Error, Result};

/// Link-layer type of the capture, determines how to parse raw frame bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    #[default]
    Ethernet,
    LinuxSll,
    RawIp,
}

impl LinkType {
    /// Map a pcap DLT_* value, if supported.
    pub fn from_dlt(dlt: i32) -> Option<Self> {
        match dlt {
            1 => Some(LinkType::Ethernet),       // DLT_EN10MB
            12 | 101 => Some(LinkType::RawIp),   // DLT_RAW
            113 => Some(LinkType::LinuxSll),     // DLT_LINUX_SLL
            _ => None,
        }
    }
}

/// Network-layer endpoints of one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpInfo {
    pub src: IpAddr,
    pub dst: IpAddr,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
}

/// Transport-layer fields of one TCP segment. Borrows the frame payload.
#[derive(Debug, Clone, Copy)]
pub struct TcpInfo<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub payload: &'a [u8],
}

/// Per-packet descriptors derived from the wire headers. Never persisted.
#[derive(Debug, Clone, Copy)]
pub struct PacketInfo<'a> {
    pub ip: IpInfo,
    pub tcp: TcpInfo<'a>,
}

impl<'a> PacketInfo<'a> {
    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(self.ip.src, self.tcp.src_port, self.ip.dst, self.tcp.dst_port)
    }

    /// A client SYN: SYN set, ACK clear.
    pub fn is_client_syn(&self) -> bool {
        self.tcp.flags.syn && !self.tcp.flags.ack
    }
}

/// Which way a segment travels within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn index(self) -> usize {
        match self {
            Direction::ClientToServer => 0,
            Direction::ServerToClient => 1,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }

    pub const BOTH: [Direction; 2] = [Direction::ClientToServer, Direction::ServerToClient];
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ClientToServer => write!(f, "C->S"),
            Direction::ServerToClient => write!(f, "S->C"),
        }
    }
}

/// Bidirectional session identifier, normalized so (A->B) == (B->A).
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct SessionKey {
    pub addr_a: IpAddr,
    pub port_a: u16,
    pub addr_b: IpAddr,
    pub port_b: u16,
}

impl SessionKey {
    pub fn new(src: IpAddr, src_port: u16, dst: IpAddr, dst_port: u16) -> Self {
        // Normalize IPv6-mapped-IPv4 (::ffff:x.x.x.x) to plain IPv4 so that
        // dual-stack captures map to the same session.
        let src = normalize_ip(src);
        let dst = normalize_ip(dst);
        if (src, src_port) <= (dst, dst_port) {
            SessionKey {
                addr_a: src,
                port_a: src_port,
                addr_b: dst,
                port_b: dst_port,
            }
        } else {
            SessionKey {
                addr_a: dst,
                port_a: dst_port,
                addr_b: src,
                port_b: src_port,
            }
        }
    }
}

/// Convert IPv6-mapped-IPv4 addresses to their IPv4 equivalent.
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        other => other,
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} <-> {}:{}",
            self.addr_a, self.port_a, self.addr_b, self.port_b
        )
    }
}

/// Parse raw frame bytes into packet descriptors.
///
/// Returns `Ok(None)` for frames that are well formed but carry no TCP
/// segment (ARP, UDP, ICMP, IP fragments).
pub fn parse_frame(data: &[u8], link_type: LinkType) -> Result<Option<PacketInfo<'_>>> {
    let sliced = match link_type {
        LinkType::Ethernet => SlicedPacket::from_ethernet(data),
        LinkType::RawIp => SlicedPacket::from_ip(data),
        LinkType::LinuxSll => {
            // Linux cooked capture v1: 16-byte header, then IP packet
            if data.len() < 16 {
                return Err(Error::MalformedPacket("truncated SLL header".into()));
            }
            SlicedPacket::from_ip(&data[16..])
        }
    }
    .map_err(|e| Error::MalformedPacket(e.to_string()))?;

    let ip = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => IpInfo {
            src: IpAddr::V4(ipv4.header().source_addr()),
            dst: IpAddr::V4(ipv4.header().destination_addr()),
        },
        Some(NetSlice::Ipv6(ipv6)) => IpInfo {
            src: IpAddr::V6(ipv6.header().source_addr()),
            dst: IpAddr::V6(ipv6.header().destination_addr()),
        },
        _ => return Ok(None),
    };
    let ip = IpInfo {
        src: normalize_ip(ip.src),
        dst: normalize_ip(ip.dst),
    };

    let tcp = match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => TcpInfo {
            src_port: tcp.source_port(),
            dst_port: tcp.destination_port(),
            seq: tcp.sequence_number(),
            ack: tcp.acknowledgment_number(),
            flags: TcpFlags {
                syn: tcp.syn(),
                ack: tcp.ack(),
                fin: tcp.fin(),
                rst: tcp.rst(),
                psh: tcp.psh(),
            },
            payload: tcp.payload(),
        },
        _ => return Ok(None),
    };

    Ok(Some(PacketInfo { ip, tcp }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn session_key_bidirectional() {
        let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let k1 = SessionKey::new(a, 1234, b, 443);
        let k2 = SessionKey::new(b, 443, a, 1234);
        assert_eq!(k1, k2);
    }

    #[test]
    fn session_key_different_ports_not_equal() {
        let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let k1 = SessionKey::new(a, 443, b, 1234);
        let k2 = SessionKey::new(a, 1234, b, 443);
        assert_ne!(k1, k2);
    }

    #[test]
    fn session_key_mapped_ipv6_matches_ipv4() {
        let v4 = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5));
        let mapped = IpAddr::V6(Ipv4Addr::new(192, 168, 1, 5).to_ipv6_mapped());
        let server = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(
            SessionKey::new(v4, 5000, server, 443),
            SessionKey::new(mapped, 5000, server, 443)
        );
    }

    #[test]
    fn session_key_display() {
        let a = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
        let b = IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8));
        let s = SessionKey::new(a, 80, b, 443).to_string();
        assert!(s.contains("1.2.3.4"));
        assert!(s.contains("5.6.7.8"));
        assert!(s.contains("<->"));
    }

    #[test]
    fn link_type_from_dlt() {
        assert_eq!(LinkType::from_dlt(1), Some(LinkType::Ethernet));
        assert_eq!(LinkType::from_dlt(101), Some(LinkType::RawIp));
        assert_eq!(LinkType::from_dlt(113), Some(LinkType::LinuxSll));
        assert_eq!(LinkType::from_dlt(105), None);
    }

    fn build_eth_tcp_packet(seq: u32, ack: u32, flags_byte: u8, payload: &[u8]) -> Vec<u8> {
        use etherparse::PacketBuilder;
        let builder = PacketBuilder::ethernet2([0; 6], [0; 6])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(40000, 443, seq, 65535)
            .ack(ack);
        let mut buf = Vec::new();
        builder.write(&mut buf, payload).unwrap();
        // eth(14) + ipv4(20) + tcp flags offset(13)
        buf[14 + 20 + 13] = flags_byte;
        buf
    }

    #[test]
    fn parse_ethernet_tcp_frame() {
        let data = build_eth_tcp_packet(100, 555, 0x18, b"hello");
        let pkt = parse_frame(&data, LinkType::Ethernet).unwrap().unwrap();
        assert_eq!(pkt.ip.src, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(pkt.ip.dst, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(pkt.tcp.src_port, 40000);
        assert_eq!(pkt.tcp.dst_port, 443);
        assert_eq!(pkt.tcp.seq, 100);
        assert_eq!(pkt.tcp.ack, 555);
        assert!(pkt.tcp.flags.psh);
        assert!(pkt.tcp.flags.ack);
        assert_eq!(pkt.tcp.payload, b"hello");
    }

    #[test]
    fn parse_syn_flags() {
        let data = build_eth_tcp_packet(0, 0, 0x02, &[]);
        let pkt = parse_frame(&data, LinkType::Ethernet).unwrap().unwrap();
        assert!(pkt.is_client_syn());
        assert!(!pkt.tcp.flags.fin);
        assert!(pkt.tcp.payload.is_empty());
    }

    #[test]
    fn parse_raw_ip_frame() {
        let eth = build_eth_tcp_packet(7, 0, 0x10, b"x");
        let pkt = parse_frame(&eth[14..], LinkType::RawIp).unwrap().unwrap();
        assert_eq!(pkt.tcp.seq, 7);
    }

    #[test]
    fn parse_linux_sll_frame() {
        let eth = build_eth_tcp_packet(9, 0, 0x10, b"sll");
        let mut sll = vec![0u8; 16];
        sll[14] = 0x08;
        sll.extend_from_slice(&eth[14..]);
        let pkt = parse_frame(&sll, LinkType::LinuxSll).unwrap().unwrap();
        assert_eq!(pkt.tcp.payload, b"sll");
    }

    #[test]
    fn parse_ipv6_frame() {
        use etherparse::PacketBuilder;
        let src = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1).octets();
        let dst = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 2).octets();
        let builder = PacketBuilder::ethernet2([0; 6], [0; 6])
            .ipv6(src, dst, 64)
            .tcp(5000, 443, 1, 1024);
        let mut buf = Vec::new();
        builder.write(&mut buf, b"v6").unwrap();
        let pkt = parse_frame(&buf, LinkType::Ethernet).unwrap().unwrap();
        assert_eq!(pkt.ip.dst, IpAddr::V6(Ipv6Addr::from(dst)));
        assert_eq!(pkt.tcp.payload, b"v6");
    }

    #[test]
    fn udp_frame_is_ignored() {
        use etherparse::PacketBuilder;
        let builder = PacketBuilder::ethernet2([0; 6], [0; 6])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .udp(5000, 53);
        let mut buf = Vec::new();
        builder.write(&mut buf, b"dns").unwrap();
        assert!(parse_frame(&buf, LinkType::Ethernet).unwrap().is_none());
    }

    #[test]
    fn truncated_frame_is_malformed() {
        assert!(matches!(
            parse_frame(&[0, 1, 2], LinkType::Ethernet),
            Err(Error::MalformedPacket(_))
        ));
        assert!(parse_frame(&[0u8; 10], LinkType::LinuxSll).is_err());
    }
}
