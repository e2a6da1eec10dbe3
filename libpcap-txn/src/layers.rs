use libpcap_tools::Linktype;
use pnet_packet::ethernet::EtherTypes;
use pnet_packet::ip::IpNextHeaderProtocols;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkLayerType {
    Ethernet,
    /// BSD loopback encapsulation (4 bytes address family)
    Null,
    /// No link layer: data starts with the IP header
    Raw,
    /// Linux cooked capture
    LinuxSll,
}

impl LinkLayerType {
    pub fn from_linktype(link_type: Linktype) -> Option<LinkLayerType> {
        match link_type {
            Linktype::ETHERNET => Some(LinkLayerType::Ethernet),
            Linktype::NULL | Linktype::LOOP => Some(LinkLayerType::Null),
            Linktype::RAW | Linktype::IPV4 | Linktype::IPV6 => Some(LinkLayerType::Raw),
            Linktype::LINUX_SLL => Some(LinkLayerType::LinuxSll),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum NetworkLayerType {
    Ipv4 = EtherTypes::Ipv4.0,
    Ipv6 = EtherTypes::Ipv6.0,
}

impl NetworkLayerType {
    pub fn from_ethertype(ethertype: u16) -> Option<NetworkLayerType> {
        match ethertype {
            0x0800 => Some(NetworkLayerType::Ipv4),
            0x86dd => Some(NetworkLayerType::Ipv6),
            _ => None,
        }
    }

    /// Guess network layer from the version nibble of the IP header
    pub fn from_ip_version(data: &[u8]) -> Option<NetworkLayerType> {
        match data.first()? >> 4 {
            4 => Some(NetworkLayerType::Ipv4),
            6 => Some(NetworkLayerType::Ipv6),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum TransportLayerType {
    Tcp = IpNextHeaderProtocols::Tcp.0,
    Udp = IpNextHeaderProtocols::Udp.0,
}

impl TransportLayerType {
    pub fn from_proto(proto: u8) -> Option<TransportLayerType> {
        match proto {
            6 => Some(TransportLayerType::Tcp),
            17 => Some(TransportLayerType::Udp),
            _ => None,
        }
    }
}
