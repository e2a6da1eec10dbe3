#![allow(dead_code)]

use crossbeam_channel::{unbounded, Receiver};
use libpcap_tools::{Config, Duration, Frame, FrameAnalyzer, Linktype};
use libpcap_txn::{build_protocols, Analyzer, Protocol, TransactionEvent};
use pnet_base::MacAddr;
use pnet_packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::{Ipv4Flags, MutableIpv4Packet};
use pnet_packet::tcp::MutableTcpPacket;
use std::net::Ipv4Addr;
use std::sync::Arc;

pub const CLIENT: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
pub const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

pub const FIN: u8 = 0x01;
pub const PSH: u8 = 0x08;
pub const ACK: u8 = 0x10;

pub fn ms(ms: u64) -> Duration {
    Duration::from_micros(ms * 1000)
}

pub fn ethernet(datagram: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 14 + datagram.len()];
    {
        let mut eth = MutableEthernetPacket::new(&mut buf).expect("ethernet");
        eth.set_source(MacAddr(0x02, 0x00, 0x00, 0x00, 0x00, 0x01));
        eth.set_destination(MacAddr(0x02, 0x00, 0x00, 0x00, 0x00, 0x02));
        eth.set_ethertype(EtherTypes::Ipv4);
        eth.set_payload(datagram);
    }
    buf
}

pub fn ipv4_tcp(src: Ipv4Addr, dst: Ipv4Addr, id: u16, segment: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 20 + segment.len()];
    {
        let mut ip = MutableIpv4Packet::new(&mut buf).expect("ipv4");
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length((20 + segment.len()) as u16);
        ip.set_identification(id);
        ip.set_ttl(64);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
        ip.set_source(src);
        ip.set_destination(dst);
        ip.set_payload(segment);
    }
    buf
}

pub fn tcp(src_port: u16, dst_port: u16, seq: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 20 + payload.len()];
    {
        let mut tcp = MutableTcpPacket::new(&mut buf).expect("tcp");
        tcp.set_source(src_port);
        tcp.set_destination(dst_port);
        tcp.set_sequence(seq);
        tcp.set_data_offset(5);
        tcp.set_flags(flags.into());
        tcp.set_window(65535);
        tcp.set_payload(payload);
    }
    buf
}

/// Split an IPv4 datagram (20-byte header) into fragments of `chunk` bytes
pub fn fragment(datagram: &[u8], chunk: usize) -> Vec<Vec<u8>> {
    assert_eq!(chunk % 8, 0);
    let (header, payload) = datagram.split_at(20);
    payload
        .chunks(chunk)
        .enumerate()
        .map(|(i, data)| {
            let offset = i * chunk;
            let more = offset + data.len() < payload.len();
            let mut buf = header.to_vec();
            buf.extend_from_slice(data);
            {
                let mut ip = MutableIpv4Packet::new(&mut buf).expect("ipv4");
                ip.set_total_length((20 + data.len()) as u16);
                ip.set_fragment_offset((offset / 8) as u16);
                ip.set_flags(if more { Ipv4Flags::MoreFragments } else { 0 });
            }
            buf
        })
        .collect()
}

/// Both directions of a TCP connection, with their sequence numbers
pub struct TcpFlow {
    pub client: (Ipv4Addr, u16),
    pub server: (Ipv4Addr, u16),
    seq: [u32; 2],
    ip_id: u16,
}

impl TcpFlow {
    pub fn new(client: Ipv4Addr, client_port: u16, server_port: u16) -> Self {
        TcpFlow {
            client: (client, client_port),
            server: (SERVER, server_port),
            seq: [1_000, 4_000_000_000],
            ip_id: 1,
        }
    }

    /// IPv4 datagram carrying `payload`, from the client (side 0) or the server (side 1)
    pub fn datagram(&mut self, side: usize, flags: u8, payload: &[u8]) -> Vec<u8> {
        let ((src, sport), (dst, dport)) = if side == 0 {
            (self.client, self.server)
        } else {
            (self.server, self.client)
        };
        let segment = tcp(sport, dport, self.seq[side], flags, payload);
        self.seq[side] = self.seq[side].wrapping_add(payload.len() as u32);
        if flags & FIN != 0 {
            self.seq[side] = self.seq[side].wrapping_add(1);
        }
        self.ip_id = self.ip_id.wrapping_add(1);
        ipv4_tcp(src, dst, self.ip_id, &segment)
    }

    pub fn client(&mut self, payload: &[u8]) -> Vec<u8> {
        ethernet(&self.datagram(0, ACK | PSH, payload))
    }

    pub fn server(&mut self, payload: &[u8]) -> Vec<u8> {
        ethernet(&self.datagram(1, ACK | PSH, payload))
    }

    pub fn client_fin(&mut self) -> Vec<u8> {
        ethernet(&self.datagram(0, ACK | FIN, &[]))
    }

    pub fn server_fin(&mut self) -> Vec<u8> {
        ethernet(&self.datagram(1, ACK | FIN, &[]))
    }

    /// Simulate `n` bytes sent by the server but not captured
    pub fn lose_server(&mut self, n: usize) {
        self.seq[1] = self.seq[1].wrapping_add(n as u32);
    }
}

/// Ethernet frames with their capture timestamps
#[derive(Default)]
pub struct Capture {
    pub frames: Vec<(Duration, Vec<u8>)>,
}

impl Capture {
    pub fn push(&mut self, ts: Duration, frame: Vec<u8>) {
        self.frames.push((ts, frame));
    }

    pub fn run<A: FrameAnalyzer>(&self, analyzer: &mut A) {
        analyzer.init().expect("init");
        for (i, (ts, data)) in self.frames.iter().enumerate() {
            let frame = Frame {
                ts: *ts,
                link_type: Linktype::ETHERNET,
                data,
                index: i + 1,
            };
            analyzer.handle_frame(&frame).expect("handle_frame");
        }
        analyzer.teardown();
    }
}

/// Hand a single frame to an analyzer
pub fn feed<A: FrameAnalyzer>(analyzer: &mut A, ts: Duration, data: &[u8]) {
    let frame = Frame {
        ts,
        link_type: Linktype::ETHERNET,
        data,
        index: 0,
    };
    analyzer.handle_frame(&frame).expect("handle_frame");
}

/// Protocols publishing to a channel
pub fn protocols(config: &Config) -> (Vec<Protocol>, Receiver<TransactionEvent>) {
    let (sender, receiver) = unbounded();
    let protocols = build_protocols(config, Arc::new(sender)).expect("protocols");
    (protocols, receiver)
}

pub fn analyzer(config: &Config) -> (Analyzer, Receiver<TransactionEvent>) {
    let (protocols, receiver) = protocols(config);
    let analyzer = Analyzer::new(protocols, config).expect("analyzer");
    (analyzer, receiver)
}

pub fn events(receiver: &Receiver<TransactionEvent>) -> Vec<TransactionEvent> {
    receiver.try_iter().collect()
}

pub mod pgsql {
    fn frame(typ: u8, body: &[u8]) -> Vec<u8> {
        let mut v = vec![typ];
        v.extend_from_slice(&(body.len() as u32 + 4).to_be_bytes());
        v.extend_from_slice(body);
        v
    }

    fn cstring(v: &mut Vec<u8>, s: &str) {
        v.extend_from_slice(s.as_bytes());
        v.push(0);
    }

    pub fn query(q: &str) -> Vec<u8> {
        let mut body = Vec::new();
        cstring(&mut body, q);
        frame(b'Q', &body)
    }

    pub fn row_description(fields: &[&str]) -> Vec<u8> {
        let mut body = (fields.len() as u16).to_be_bytes().to_vec();
        for name in fields {
            cstring(&mut body, name);
            body.extend_from_slice(&0u32.to_be_bytes()); // table OID
            body.extend_from_slice(&0u16.to_be_bytes()); // column index
            body.extend_from_slice(&25u32.to_be_bytes()); // type OID (text)
            body.extend_from_slice(&(-1i16).to_be_bytes()); // type length
            body.extend_from_slice(&(-1i32).to_be_bytes()); // type modifier
            body.extend_from_slice(&0u16.to_be_bytes()); // text format
        }
        frame(b'T', &body)
    }

    pub fn data_row(values: &[&str]) -> Vec<u8> {
        let mut body = (values.len() as u16).to_be_bytes().to_vec();
        for value in values {
            body.extend_from_slice(&(value.len() as u32).to_be_bytes());
            body.extend_from_slice(value.as_bytes());
        }
        frame(b'D', &body)
    }

    pub fn command_complete(tag: &str) -> Vec<u8> {
        let mut body = Vec::new();
        cstring(&mut body, tag);
        frame(b'C', &body)
    }

    pub fn ready_for_query() -> Vec<u8> {
        frame(b'Z', b"I")
    }

    pub fn error(severity: &str, code: &str, message: &str) -> Vec<u8> {
        let mut body = Vec::new();
        for (typ, value) in [(b'S', severity), (b'C', code), (b'M', message)] {
            body.push(typ);
            cstring(&mut body, value);
        }
        body.push(0);
        frame(b'E', &body)
    }

    /// RowDescription, DataRows, CommandComplete then ReadyForQuery
    pub fn select_response(fields: &[&str], rows: &[&[&str]]) -> Vec<u8> {
        let mut v = row_description(fields);
        for row in rows {
            v.extend(data_row(row));
        }
        v.extend(command_complete(&format!("SELECT {}", rows.len())));
        v.extend(ready_for_query());
        v
    }
}

pub mod mongo {
    pub enum Bson<'a> {
        Str(&'a str),
        I32(i32),
        I64(i64),
        Doc(Vec<(&'a str, Bson<'a>)>),
        Array(Vec<Bson<'a>>),
    }

    fn element(v: &mut Vec<u8>, key: &str, value: &Bson) {
        let typ = match value {
            Bson::Str(_) => 0x02,
            Bson::I32(_) => 0x10,
            Bson::I64(_) => 0x12,
            Bson::Doc(_) => 0x03,
            Bson::Array(_) => 0x04,
        };
        v.push(typ);
        v.extend_from_slice(key.as_bytes());
        v.push(0);
        match value {
            Bson::Str(s) => {
                v.extend_from_slice(&(s.len() as i32 + 1).to_le_bytes());
                v.extend_from_slice(s.as_bytes());
                v.push(0);
            }
            Bson::I32(n) => v.extend_from_slice(&n.to_le_bytes()),
            Bson::I64(n) => v.extend_from_slice(&n.to_le_bytes()),
            Bson::Doc(fields) => v.extend(encode(fields)),
            Bson::Array(items) => {
                let keys: Vec<String> = (0..items.len()).map(|i| i.to_string()).collect();
                let mut body = Vec::new();
                for (key, item) in keys.iter().zip(items) {
                    element(&mut body, key, item);
                }
                v.extend(wrap(body));
            }
        }
    }

    fn wrap(body: Vec<u8>) -> Vec<u8> {
        let mut doc = (body.len() as i32 + 5).to_le_bytes().to_vec();
        doc.extend(body);
        doc.push(0);
        doc
    }

    pub fn encode(fields: &[(&str, Bson)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (key, value) in fields {
            element(&mut body, key, value);
        }
        wrap(body)
    }

    /// Document `{"v": "xxx..."}` of exactly `size` bytes
    pub fn document_of_size(size: usize) -> Vec<u8> {
        let value = "x".repeat(size - 13);
        let doc = encode(&[("v", Bson::Str(&value))]);
        assert_eq!(doc.len(), size);
        doc
    }

    fn message(request_id: i32, response_to: i32, op_code: i32, body: &[u8]) -> Vec<u8> {
        let mut v = (body.len() as i32 + 16).to_le_bytes().to_vec();
        v.extend_from_slice(&request_id.to_le_bytes());
        v.extend_from_slice(&response_to.to_le_bytes());
        v.extend_from_slice(&op_code.to_le_bytes());
        v.extend_from_slice(body);
        v
    }

    pub fn query(request_id: i32, collection: &str, doc: &[u8]) -> Vec<u8> {
        let mut body = 0u32.to_le_bytes().to_vec();
        body.extend_from_slice(collection.as_bytes());
        body.push(0);
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&(-1i32).to_le_bytes());
        body.extend_from_slice(doc);
        message(request_id, 0, 2004, &body)
    }

    pub fn insert(request_id: i32, collection: &str, docs: &[Vec<u8>]) -> Vec<u8> {
        let mut body = 0u32.to_le_bytes().to_vec();
        body.extend_from_slice(collection.as_bytes());
        body.push(0);
        for doc in docs {
            body.extend_from_slice(doc);
        }
        message(request_id, 0, 2002, &body)
    }

    pub fn reply(request_id: i32, response_to: i32, docs: &[Vec<u8>]) -> Vec<u8> {
        let mut body = 0u32.to_le_bytes().to_vec();
        body.extend_from_slice(&0i64.to_le_bytes());
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&(docs.len() as i32).to_le_bytes());
        for doc in docs {
            body.extend_from_slice(doc);
        }
        message(request_id, response_to, 1, &body)
    }

    /// OP_MSG with a single body section
    pub fn msg(request_id: i32, response_to: i32, doc: &[u8]) -> Vec<u8> {
        let mut body = 0u32.to_le_bytes().to_vec();
        body.push(0);
        body.extend_from_slice(doc);
        message(request_id, response_to, 2013, &body)
    }
}
