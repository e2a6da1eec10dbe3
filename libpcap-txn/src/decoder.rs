//! Layer decoder: from a captured frame to a flow tuple and an application payload

use crate::error::DecodeError;
use crate::ip_defrag::DefragEngine;
use crate::layers::{LinkLayerType, NetworkLayerType, TransportLayerType};
use libpcap_tools::{Duration, FiveTuple, Frame, Linktype};
use pnet_packet::ethernet::EthernetPacket;
use pnet_packet::ipv4::{Ipv4Flags, Ipv4Packet};
use pnet_packet::ipv6::Ipv6Packet;
use pnet_packet::tcp::{TcpFlags, TcpPacket};
use pnet_packet::udp::UdpPacket;
use pnet_packet::vlan::VlanPacket;
use std::borrow::Cow;
use std::net::IpAddr;
use std::ops::Range;
use tracing::trace;

const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88a8;

const IPV6_HOP_BY_HOP: u8 = 0;
const IPV6_ROUTING: u8 = 43;
const IPV6_FRAGMENT: u8 = 44;
const IPV6_DEST_OPTIONS: u8 = 60;

/// Transport layer information needed by the demux
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportHeader {
    Tcp {
        seq: u32,
        syn: bool,
        fin: bool,
        rst: bool,
    },
    Udp,
}

/// A decoded packet, ready to be dispatched to a protocol
#[derive(Debug)]
pub struct DecodedPacket<'a> {
    pub tuple: FiveTuple,
    pub transport: TransportHeader,
    /// Frame data, or reassembled datagram
    data: Cow<'a, [u8]>,
    payload: Range<usize>,
}

impl<'a> DecodedPacket<'a> {
    /// Application layer payload
    pub fn payload(&self) -> &[u8] {
        &self.data[self.payload.clone()]
    }

    /// True if the payload comes from a reassembled datagram
    pub fn is_reassembled(&self) -> bool {
        matches!(self.data, Cow::Owned(_))
    }
}

/// Skip link layer and return the network layer type and data
pub fn network_layer(link_type: Linktype, data: &[u8]) -> Result<(NetworkLayerType, &[u8]), DecodeError> {
    let link = LinkLayerType::from_linktype(link_type)
        .ok_or(DecodeError::UnsupportedLinkType(link_type.0))?;
    match link {
        LinkLayerType::Ethernet => {
            let eth = EthernetPacket::new(data).ok_or(DecodeError::Truncated("ethernet"))?;
            let mut ethertype = eth.get_ethertype().0;
            let mut offset = EthernetPacket::minimum_packet_size();
            while ethertype == ETHERTYPE_VLAN || ethertype == ETHERTYPE_QINQ {
                let vlan = VlanPacket::new(&data[offset..]).ok_or(DecodeError::Truncated("vlan"))?;
                trace!("vlan id {}", vlan.get_vlan_identifier());
                ethertype = vlan.get_ethertype().0;
                offset += VlanPacket::minimum_packet_size();
            }
            let l3 = NetworkLayerType::from_ethertype(ethertype)
                .ok_or(DecodeError::UnsupportedEtherType(ethertype))?;
            Ok((l3, &data[offset..]))
        }
        LinkLayerType::Null => {
            if data.len() < 4 {
                return Err(DecodeError::Truncated("null"));
            }
            // the address family is in host byte order of the capturing system: use IP version instead
            let data = &data[4..];
            let l3 = NetworkLayerType::from_ip_version(data)
                .ok_or(DecodeError::InvalidIpHeader("unknown IP version"))?;
            Ok((l3, data))
        }
        LinkLayerType::Raw => {
            let l3 = NetworkLayerType::from_ip_version(data)
                .ok_or(DecodeError::InvalidIpHeader("unknown IP version"))?;
            Ok((l3, data))
        }
        LinkLayerType::LinuxSll => {
            if data.len() < 16 {
                return Err(DecodeError::Truncated("linux sll"));
            }
            let ethertype = u16::from_be_bytes([data[14], data[15]]);
            let l3 = NetworkLayerType::from_ethertype(ethertype)
                .ok_or(DecodeError::UnsupportedEtherType(ethertype))?;
            Ok((l3, &data[16..]))
        }
    }
}

/// Decodes frames, reassembling IPv4 fragments
pub struct Decoder {
    ipv4_defrag: Box<dyn DefragEngine>,
}

impl Decoder {
    pub fn new(ipv4_defrag: Box<dyn DefragEngine>) -> Self {
        Decoder { ipv4_defrag }
    }

    /// Decode a frame
    ///
    /// Returns `Ok(None)` if the frame was consumed without producing a
    /// packet: a buffered fragment, or an empty TCP segment.
    pub fn decode<'a>(&mut self, frame: &Frame<'a>) -> Result<Option<DecodedPacket<'a>>, DecodeError> {
        let (l3, data) = network_layer(frame.link_type, frame.data)?;
        let l3 = match l3 {
            NetworkLayerType::Ipv4 => self.handle_l3_ipv4(data, frame.ts)?,
            NetworkLayerType::Ipv6 => handle_l3_ipv6(data)?,
        };
        let l3 = match l3 {
            Some(l3) => l3,
            None => return Ok(None),
        };
        handle_l4(l3)
    }

    /// Drop expired fragment buffers
    pub fn expire(&mut self, now: Duration) -> usize {
        self.ipv4_defrag.expire(now)
    }

    pub fn pending_fragments(&self) -> usize {
        self.ipv4_defrag.pending()
    }

    fn handle_l3_ipv4<'a>(&mut self, data: &'a [u8], ts: Duration) -> Result<Option<L3Data<'a>>, DecodeError> {
        let (total_length, header_len) = {
            let ipv4 = Ipv4Packet::new(data).ok_or(DecodeError::Truncated("IPv4"))?;
            if ipv4.get_version() != 4 {
                return Err(DecodeError::InvalidIpHeader("IPv4 version"));
            }
            let header_len = ipv4.get_header_length() as usize * 4;
            let total_length = ipv4.get_total_length() as usize;
            if header_len < 20 || header_len > data.len() {
                return Err(DecodeError::InvalidIpHeader("IPv4 header length"));
            }
            if total_length < header_len {
                return Err(DecodeError::InvalidIpHeader("IPv4 total length"));
            }
            if total_length > data.len() {
                return Err(DecodeError::Truncated("IPv4"));
            }
            (total_length, header_len)
        };
        // remove padding
        let data = &data[..total_length];
        let ipv4 = Ipv4Packet::new(data).ok_or(DecodeError::Truncated("IPv4"))?;
        let proto = ipv4.get_next_level_protocol().0;
        let src = IpAddr::V4(ipv4.get_source());
        let dst = IpAddr::V4(ipv4.get_destination());

        // check IP fragmentation before decoding the transport layer
        let more_fragments = ipv4.get_flags() & Ipv4Flags::MoreFragments != 0;
        if more_fragments || ipv4.get_fragment_offset() != 0 {
            let datagram = match self.ipv4_defrag.update(data, ts)? {
                Some(datagram) => datagram,
                None => {
                    trace!("fragment buffered (id={})", ipv4.get_identification());
                    return Ok(None);
                }
            };
            trace!("using defrag buffer len={}", datagram.len());
            // header of the first fragment
            let first_header_len = (datagram[0] & 0x0f) as usize * 4;
            let l4 = first_header_len..datagram.len();
            return Ok(Some(L3Data {
                proto,
                src,
                dst,
                data: Cow::Owned(datagram),
                l4,
            }));
        }
        Ok(Some(L3Data {
            proto,
            src,
            dst,
            data: Cow::Borrowed(data),
            l4: header_len..total_length,
        }))
    }
}

struct L3Data<'a> {
    /// Transport protocol number
    proto: u8,
    src: IpAddr,
    dst: IpAddr,
    data: Cow<'a, [u8]>,
    /// Transport layer range in `data`
    l4: Range<usize>,
}

fn handle_l3_ipv6(data: &[u8]) -> Result<Option<L3Data<'_>>, DecodeError> {
    let ipv6 = Ipv6Packet::new(data).ok_or(DecodeError::Truncated("IPv6"))?;
    if ipv6.get_version() != 6 {
        return Err(DecodeError::InvalidIpHeader("IPv6 version"));
    }
    let header_len = Ipv6Packet::minimum_packet_size();
    let payload_length = ipv6.get_payload_length() as usize;
    let end = if payload_length == 0 {
        // jumbogram, or unset by capture offload
        data.len()
    } else {
        header_len + payload_length
    };
    if end > data.len() {
        return Err(DecodeError::Truncated("IPv6"));
    }
    let mut next_header = ipv6.get_next_header().0;
    let mut offset = header_len;
    loop {
        match next_header {
            IPV6_HOP_BY_HOP | IPV6_ROUTING | IPV6_DEST_OPTIONS => {
                if offset + 8 > end {
                    return Err(DecodeError::Truncated("IPv6 extension header"));
                }
                let ext_len = (data[offset + 1] as usize + 1) * 8;
                if offset + ext_len > end {
                    return Err(DecodeError::Truncated("IPv6 extension header"));
                }
                next_header = data[offset];
                offset += ext_len;
            }
            IPV6_FRAGMENT => return Err(DecodeError::UnsupportedTransport(IPV6_FRAGMENT)),
            _ => break,
        }
    }
    Ok(Some(L3Data {
        proto: next_header,
        src: IpAddr::V6(ipv6.get_source()),
        dst: IpAddr::V6(ipv6.get_destination()),
        data: Cow::Borrowed(data),
        l4: offset..end,
    }))
}

fn handle_l4(l3: L3Data<'_>) -> Result<Option<DecodedPacket<'_>>, DecodeError> {
    let L3Data {
        proto,
        src,
        dst,
        data,
        l4,
    } = l3;
    let tuple = |src_port, dst_port| FiveTuple {
        proto,
        src,
        dst,
        src_port,
        dst_port,
    };
    let transport_type =
        TransportLayerType::from_proto(proto).ok_or(DecodeError::UnsupportedTransport(proto))?;
    let l4_data = &data[l4.clone()];
    let (tuple, transport, payload) = match transport_type {
        TransportLayerType::Tcp => {
            let tcp = TcpPacket::new(l4_data).ok_or(DecodeError::Truncated("TCP"))?;
            let data_offset = tcp.get_data_offset() as usize * 4;
            if data_offset < 20 || data_offset > l4_data.len() {
                return Err(DecodeError::Truncated("TCP"));
            }
            let flags = tcp.get_flags();
            let transport = TransportHeader::Tcp {
                seq: tcp.get_sequence(),
                syn: flags & TcpFlags::SYN != 0,
                fin: flags & TcpFlags::FIN != 0,
                rst: flags & TcpFlags::RST != 0,
            };
            let tuple = tuple(tcp.get_source(), tcp.get_destination());
            let payload = (l4.start + data_offset)..l4.end;
            if payload.is_empty() && !matches!(transport, TransportHeader::Tcp { fin: true, .. }) {
                return Ok(None);
            }
            (tuple, transport, payload)
        }
        TransportLayerType::Udp => {
            let udp = UdpPacket::new(l4_data).ok_or(DecodeError::Truncated("UDP"))?;
            let header_len = UdpPacket::minimum_packet_size();
            let length = udp.get_length() as usize;
            // length may be zero for jumbograms
            let end = if length >= header_len && length <= l4_data.len() {
                l4.start + length
            } else {
                l4.end
            };
            let tuple = tuple(udp.get_source(), udp.get_destination());
            (tuple, TransportHeader::Udp, (l4.start + header_len)..end)
        }
    };
    Ok(Some(DecodedPacket {
        tuple,
        transport,
        data,
        payload,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip_defrag::IPDefragEngine;
    use pnet_packet::ethernet::{EtherTypes, MutableEthernetPacket};
    use pnet_packet::ip::IpNextHeaderProtocols;
    use pnet_packet::ipv4::MutableIpv4Packet;
    use pnet_packet::tcp::MutableTcpPacket;
    use pnet_packet::vlan::MutableVlanPacket;
    use std::net::Ipv4Addr;

    fn ipv4_tcp(payload: &[u8], flags: u8) -> Vec<u8> {
        let mut buf = vec![0u8; 40 + payload.len()];
        {
            let mut ip = MutableIpv4Packet::new(&mut buf).expect("ipv4");
            ip.set_version(4);
            ip.set_header_length(5);
            ip.set_total_length((40 + payload.len()) as u16);
            ip.set_ttl(64);
            ip.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
            ip.set_source(Ipv4Addr::new(10, 0, 0, 1));
            ip.set_destination(Ipv4Addr::new(10, 0, 0, 2));
        }
        {
            let mut tcp = MutableTcpPacket::new(&mut buf[20..]).expect("tcp");
            tcp.set_source(40000);
            tcp.set_destination(5432);
            tcp.set_sequence(1000);
            tcp.set_data_offset(5);
            tcp.set_flags(flags.into());
            tcp.set_payload(payload);
        }
        buf
    }

    fn ethernet(ethertype: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 14 + payload.len()];
        let mut eth = MutableEthernetPacket::new(&mut buf).expect("ethernet");
        eth.set_ethertype(pnet_packet::ethernet::EtherType(ethertype));
        eth.set_payload(payload);
        buf
    }

    fn frame(link_type: Linktype, data: &[u8]) -> Frame<'_> {
        Frame {
            ts: Duration::from_secs(1),
            link_type,
            data,
            index: 0,
        }
    }

    fn decoder() -> Decoder {
        Decoder::new(Box::new(IPDefragEngine::default()))
    }

    #[test]
    fn decode_ethernet_tcp_with_padding() {
        let mut ip = ipv4_tcp(b"hello", 0x18);
        // ethernet trailer
        ip.extend_from_slice(&[0u8; 6]);
        let data = ethernet(EtherTypes::Ipv4.0, &ip);
        let mut d = decoder();
        let p = d
            .decode(&frame(Linktype::ETHERNET, &data))
            .expect("decode")
            .expect("packet");
        assert_eq!(p.payload(), b"hello");
        assert_eq!(p.tuple.src_port, 40000);
        assert_eq!(p.tuple.dst_port, 5432);
        assert_eq!(p.tuple.proto, 6);
        assert!(matches!(p.transport, TransportHeader::Tcp { seq: 1000, fin: false, .. }));
        assert!(!p.is_reassembled());
    }

    #[test]
    fn decode_vlan_and_raw() {
        let ip = ipv4_tcp(b"x", 0x18);
        let mut vlan_buf = vec![0u8; 4 + ip.len()];
        {
            let mut vlan = MutableVlanPacket::new(&mut vlan_buf).expect("vlan");
            vlan.set_vlan_identifier(42);
            vlan.set_ethertype(EtherTypes::Ipv4);
            vlan.set_payload(&ip);
        }
        let data = ethernet(ETHERTYPE_VLAN, &vlan_buf);
        let mut d = decoder();
        let p = d.decode(&frame(Linktype::ETHERNET, &data)).expect("decode");
        assert_eq!(p.expect("packet").payload(), b"x");
        let p = d.decode(&frame(Linktype::RAW, &ip)).expect("decode");
        assert_eq!(p.expect("packet").payload(), b"x");
    }

    #[test]
    fn decode_drops_empty_segments() {
        let mut d = decoder();
        // pure ACK
        let ip = ipv4_tcp(b"", 0x10);
        assert!(d.decode(&frame(Linktype::RAW, &ip)).expect("decode").is_none());
        // FIN is kept
        let ip = ipv4_tcp(b"", 0x11);
        assert!(d.decode(&frame(Linktype::RAW, &ip)).expect("decode").is_some());
    }

    #[test]
    fn decode_errors() {
        let mut d = decoder();
        let ip = ipv4_tcp(b"hello", 0x18);
        assert_eq!(
            d.decode(&frame(Linktype::RAW, &ip[..30])).unwrap_err(),
            DecodeError::Truncated("IPv4")
        );
        let data = ethernet(0x0806, &[0u8; 28]);
        assert_eq!(
            d.decode(&frame(Linktype::ETHERNET, &data)).unwrap_err(),
            DecodeError::UnsupportedEtherType(0x0806)
        );
        assert_eq!(
            d.decode(&frame(Linktype(147), &ip)).unwrap_err(),
            DecodeError::UnsupportedLinkType(147)
        );
        let mut icmp = ip.clone();
        icmp[9] = 1;
        assert_eq!(
            d.decode(&frame(Linktype::RAW, &icmp)).unwrap_err(),
            DecodeError::UnsupportedTransport(1)
        );
    }
}
