use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// Network 5-tuple: layer 4 protocol, source and destination addresses and ports
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FiveTuple {
    pub proto: u8,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FiveTuple {
    pub fn get_reverse(&self) -> FiveTuple {
        FiveTuple {
            proto: self.proto,
            src: self.dst,
            dst: self.src,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }

    /// Return the direction-independent form of the tuple
    ///
    /// Both directions of a connection have the same canonical tuple, with the
    /// smallest (address, port) endpoint as source.
    pub fn canonical(&self) -> FiveTuple {
        if (self.src, self.src_port) <= (self.dst, self.dst_port) {
            self.clone()
        } else {
            self.get_reverse()
        }
    }

    /// Length of IP addresses: 4 for IPv4, 16 for IPv6
    pub fn ip_length(&self) -> u8 {
        match self.src {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 16,
        }
    }
}

impl Default for FiveTuple {
    fn default() -> Self {
        FiveTuple {
            proto: 0,
            src: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            dst: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            src_port: 0,
            dst_port: 0,
        }
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} [{}]",
            self.src, self.src_port, self.dst, self.dst_port, self.proto
        )
    }
}
