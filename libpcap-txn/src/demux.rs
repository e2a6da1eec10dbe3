//! Transport demultiplexer: routes decoded packets to protocol parsers
//!
//! TCP connections are tracked (keyed by canonical tuple) from their first
//! packet, owned by the protocol selected at that time, until both sides
//! sent FIN or the protocol's connection timeout expires. Sequence numbers
//! are followed per direction to detect lost, retransmitted or overlapping
//! data.

use crate::decoder::{DecodedPacket, TransportHeader};
use crate::expiring_map::ExpiringMap;
use crate::protocols::{ConnectionState, Protocol};
use crate::stream::Direction;
use fnv::FnvHashMap;
use libpcap_tools::{Duration, FiveTuple, Packet};
use std::num::Wrapping;
use tracing::{debug, trace, warn};

const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// A tracked TCP connection
#[derive(Debug)]
pub struct Connection {
    /// Index of the owning protocol
    protocol: usize,
    /// Tuple of the first packet seen (`Direction::Original`)
    tuple: FiveTuple,
    state: ConnectionState,
    /// Next expected sequence number, per direction
    next_seq: [Option<Wrapping<u32>>; 2],
    fin: [bool; 2],
}

impl Connection {
    fn direction(&self, tuple: &FiveTuple) -> Direction {
        if *tuple == self.tuple {
            Direction::Original
        } else {
            Direction::Reverse
        }
    }
}

/// Demux statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DemuxStats {
    pub tcp_segments: usize,
    pub udp_datagrams: usize,
    /// Packets not matching any protocol port
    pub unknown_port: usize,
    pub retransmissions: usize,
    pub gaps: usize,
    pub expired_connections: usize,
}

pub struct Demux {
    protocols: Vec<Protocol>,
    tcp_ports: FnvHashMap<u16, usize>,
    udp_ports: FnvHashMap<u16, usize>,
    connections: ExpiringMap<FiveTuple, Connection>,
    stats: DemuxStats,
}

fn register_port(map: &mut FnvHashMap<u16, usize>, port: u16, idx: usize, protocols: &[Protocol]) {
    match map.get(&port) {
        Some(&other) if other != idx => warn!(
            "Port {} already used by {}, ignoring it for {}",
            port,
            protocols[other].name(),
            protocols[idx].name()
        ),
        _ => {
            map.insert(port, idx);
        }
    }
}

impl Demux {
    pub fn new(protocols: Vec<Protocol>) -> Self {
        let mut tcp_ports = FnvHashMap::default();
        let mut udp_ports = FnvHashMap::default();
        for (idx, p) in protocols.iter().enumerate() {
            for &port in p.ports() {
                register_port(&mut tcp_ports, port, idx, &protocols);
            }
            for &port in p.udp_ports() {
                register_port(&mut udp_ports, port, idx, &protocols);
            }
        }
        Demux {
            protocols,
            tcp_ports,
            udp_ports,
            connections: ExpiringMap::new(DEFAULT_CONNECTION_TIMEOUT),
            stats: DemuxStats::default(),
        }
    }

    pub fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    pub fn stats(&self) -> &DemuxStats {
        &self.stats
    }

    /// Number of tracked connections
    pub fn connections(&self) -> usize {
        self.connections.len()
    }

    /// Select a protocol from the destination port, then the source port
    fn lookup(ports: &FnvHashMap<u16, usize>, tuple: &FiveTuple) -> Option<usize> {
        ports
            .get(&tuple.dst_port)
            .or_else(|| ports.get(&tuple.src_port))
            .copied()
    }

    pub fn handle(&mut self, pkt: &DecodedPacket, ts: Duration) {
        match pkt.transport {
            TransportHeader::Tcp { seq, syn, fin, .. } => self.handle_tcp(pkt, seq, syn, fin, ts),
            TransportHeader::Udp => self.handle_udp(pkt, ts),
        }
    }

    fn handle_udp(&mut self, pkt: &DecodedPacket, ts: Duration) {
        self.stats.udp_datagrams += 1;
        let idx = match Self::lookup(&self.udp_ports, &pkt.tuple) {
            Some(idx) => idx,
            None => {
                self.stats.unknown_port += 1;
                return;
            }
        };
        let packet = Packet {
            ts,
            tuple: pkt.tuple.clone(),
            payload: pkt.payload(),
        };
        self.protocols[idx].parse_udp(&packet);
    }

    fn handle_tcp(&mut self, pkt: &DecodedPacket, seq: u32, syn: bool, fin: bool, ts: Duration) {
        self.stats.tcp_segments += 1;
        let key = pkt.tuple.canonical();
        if self.connections.get(&key, ts).is_none() {
            let idx = match Self::lookup(&self.tcp_ports, &pkt.tuple) {
                Some(idx) => idx,
                None => {
                    self.stats.unknown_port += 1;
                    return;
                }
            };
            let protocol = &self.protocols[idx];
            trace!("new {} connection {}", protocol.name(), pkt.tuple);
            let conn = Connection {
                protocol: idx,
                tuple: pkt.tuple.clone(),
                state: protocol.new_connection(),
                next_seq: [None, None],
                fin: [false, false],
            };
            self.connections
                .insert_with_ttl(key.clone(), conn, protocol.connection_timeout(), ts);
        }
        let conn = match self.connections.get_mut(&key, ts) {
            Some(conn) => conn,
            None => return,
        };
        let protocol = &self.protocols[conn.protocol];
        let dir = conn.direction(&pkt.tuple);
        let d = dir.index();

        let seq = Wrapping(seq) + Wrapping(syn as u32);
        let mut payload = pkt.payload();
        if let Some(expected) = conn.next_seq[d] {
            let diff = (seq - expected).0 as i32;
            if diff > 0 {
                // data between expected and seq was not captured
                self.stats.gaps += 1;
                debug!("{} bytes lost in {} ({:?})", diff, pkt.tuple, dir);
                if protocol.gap_in_stream(&mut conn.state, &pkt.tuple, dir, diff as usize) {
                    conn.state = protocol.new_connection();
                }
            } else if diff < 0 {
                let overlap = diff.unsigned_abs() as usize;
                if overlap >= payload.len() {
                    trace!("retransmission in {} ({:?})", pkt.tuple, dir);
                    self.stats.retransmissions += 1;
                    payload = &[];
                } else {
                    payload = &payload[overlap..];
                }
            }
        }
        if !payload.is_empty() || conn.next_seq[d].is_none() {
            let end = seq + Wrapping(pkt.payload().len() as u32);
            conn.next_seq[d] = Some(end);
        }

        if !payload.is_empty() {
            let packet = Packet {
                ts,
                tuple: pkt.tuple.clone(),
                payload,
            };
            protocol.parse(&mut conn.state, &packet, dir);
        }

        if fin && !conn.fin[d] {
            conn.fin[d] = true;
            protocol.received_fin(&mut conn.state, &pkt.tuple, dir);
            if let Some(next) = conn.next_seq[d].as_mut() {
                *next += Wrapping(1);
            }
        }
        if conn.fin == [true, true] {
            trace!("connection closed {}", pkt.tuple);
            self.connections.remove(&key);
        } else {
            self.connections.touch(&key, ts);
        }
    }

    /// Drop connections idle for longer than their timeout
    pub fn expire(&mut self, now: Duration) -> usize {
        let n = self.connections.sweep(now).len();
        self.stats.expired_connections += n;
        n
    }
}
