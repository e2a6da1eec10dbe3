use crate::error::DefragError;
use crate::expiring_map::ExpiringMap;
use libpcap_tools::Duration;
use pnet_macros_support::packet::Packet as PnetPacket;
use pnet_packet::ipv4::{checksum, Ipv4Flags, Ipv4Packet, MutableIpv4Packet};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tracing::{debug, trace, warn};

pub const DEFAULT_DEFRAG_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_DATAGRAMS: usize = 1024;
pub const DEFAULT_MAX_FRAGMENTS: usize = 128;

const MAX_DATAGRAM_SIZE: usize = 65535;

/// Defragmentation engine
pub trait DefragEngine: Send {
    /// Update the engine with a new IPv4 fragment (header and payload)
    ///
    /// Returns `None` if the fragment was buffered, and the full reassembled
    /// datagram when the last missing fragment was received. Fragment data is
    /// copied: no reference to `datagram` is kept after the call.
    fn update(&mut self, datagram: &[u8], now: Duration) -> Result<Option<Vec<u8>>, DefragError>;

    /// Drop buffers for datagrams not completed in time. Returns the number of dropped buffers.
    fn expire(&mut self, now: Duration) -> usize;

    /// Number of datagrams being reassembled
    fn pending(&self) -> usize;
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
struct FragmentKey {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    id: u16,
    proto: u8,
}

#[derive(Default)]
struct DefragData {
    /// Header of the first fragment
    header: Option<Vec<u8>>,
    /// Payload length, known when the last fragment is received
    total_len: Option<usize>,
    /// Non-overlapping payload chunks, by offset
    fragments: BTreeMap<usize, Vec<u8>>,
}

impl DefragData {
    /// Insert the parts of the fragment not already covered by previous fragments
    fn insert(&mut self, offset: usize, data: &[u8]) {
        let end = offset + data.len();
        let mut cursor = offset;
        let mut pieces = Vec::new();
        for (&start, chunk) in self.fragments.range(..end) {
            let chunk_end = start + chunk.len();
            if chunk_end <= cursor {
                continue;
            }
            if start > cursor {
                pieces.push((cursor, start));
            }
            cursor = chunk_end;
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            pieces.push((cursor, end));
        }
        if pieces.len() != 1 || pieces[0] != (offset, end) {
            trace!("defrag: overlapping fragment at offset {}", offset);
        }
        for (start, stop) in pieces {
            self.fragments
                .insert(start, data[start - offset..stop - offset].to_vec());
        }
    }

    fn is_complete(&self) -> bool {
        let total_len = match (self.total_len, &self.header) {
            (Some(total_len), Some(_)) => total_len,
            _ => return false,
        };
        let mut cursor = 0;
        for (&start, chunk) in &self.fragments {
            if start > cursor {
                return false;
            }
            cursor = cursor.max(start + chunk.len());
        }
        cursor >= total_len
    }

    fn reassemble(self) -> Option<Vec<u8>> {
        let header = self.header?;
        let total_len = self.total_len?;
        let mut buffer = Vec::with_capacity(header.len() + total_len);
        buffer.extend_from_slice(&header);
        for chunk in self.fragments.into_values() {
            buffer.extend_from_slice(&chunk);
        }
        buffer.truncate(header.len() + total_len);
        let length = u16::try_from(buffer.len()).ok()?;
        let mut ipv4 = MutableIpv4Packet::new(&mut buffer)?;
        ipv4.set_total_length(length);
        ipv4.set_flags(ipv4.get_flags() & !Ipv4Flags::MoreFragments);
        ipv4.set_fragment_offset(0);
        ipv4.set_checksum(0);
        let cksum = checksum(&ipv4.to_immutable());
        ipv4.set_checksum(cksum);
        Some(buffer)
    }
}

/// IPv4 fragments reassembly, keyed by (source, destination, identification, protocol)
pub struct IPDefragEngine {
    ip_fragments: ExpiringMap<FragmentKey, DefragData>,
    max_datagrams: usize,
    max_fragments: usize,
}

impl Default for IPDefragEngine {
    fn default() -> Self {
        IPDefragEngine::new(
            DEFAULT_DEFRAG_TIMEOUT,
            DEFAULT_MAX_DATAGRAMS,
            DEFAULT_MAX_FRAGMENTS,
        )
    }
}

impl IPDefragEngine {
    pub fn new(timeout: Duration, max_datagrams: usize, max_fragments: usize) -> IPDefragEngine {
        IPDefragEngine {
            ip_fragments: ExpiringMap::new(timeout),
            max_datagrams: max_datagrams.max(1),
            max_fragments: max_fragments.max(1),
        }
    }
}

impl DefragEngine for IPDefragEngine {
    fn update(&mut self, datagram: &[u8], now: Duration) -> Result<Option<Vec<u8>>, DefragError> {
        let ipv4 = Ipv4Packet::new(datagram).ok_or(DefragError::InvalidHeader)?;
        let header_len = ipv4.get_header_length() as usize * 4;
        let total_length = ipv4.get_total_length() as usize;
        if header_len < 20 || total_length < header_len || datagram.len() < total_length {
            return Err(DefragError::InvalidHeader);
        }
        let payload = &datagram[header_len..total_length];
        let offset = ipv4.get_fragment_offset() as usize * 8;
        let more_fragments = ipv4.get_flags() & Ipv4Flags::MoreFragments != 0;
        let end = offset + payload.len();
        if header_len + end > MAX_DATAGRAM_SIZE {
            return Err(DefragError::TooLarge);
        }
        if more_fragments && payload.len() % 8 != 0 {
            return Err(DefragError::Misaligned(payload.len()));
        }
        let key = FragmentKey {
            src: ipv4.get_source(),
            dst: ipv4.get_destination(),
            id: ipv4.get_identification(),
            proto: ipv4.get_next_level_protocol().0,
        };
        trace!(
            "defrag: fragment id={} offset={} len={} mf={}",
            key.id,
            offset,
            payload.len(),
            more_fragments
        );

        if self.ip_fragments.get(&key, now).is_none() {
            if self.ip_fragments.len() >= self.max_datagrams {
                if let Some((old, _)) = self.ip_fragments.evict_oldest() {
                    warn!(
                        "defrag: too many datagrams in flight, dropping id={} {} -> {}",
                        old.id, old.src, old.dst
                    );
                }
            }
            self.ip_fragments
                .insert(key.clone(), DefragData::default(), now);
        }

        let max_fragments = self.max_fragments;
        let result = match self.ip_fragments.get_mut(&key, now) {
            Some(f) => update_data(f, &ipv4, header_len, offset, payload, more_fragments, max_fragments),
            None => Err(DefragError::InvalidHeader),
        };
        match result {
            Ok(true) => {
                debug!("defrag: done for id {}", key.id);
                Ok(self
                    .ip_fragments
                    .remove(&key)
                    .and_then(DefragData::reassemble))
            }
            Ok(false) => Ok(None),
            Err(e) => {
                // the whole datagram is unusable
                self.ip_fragments.remove(&key);
                Err(e)
            }
        }
    }

    fn expire(&mut self, now: Duration) -> usize {
        let expired = self.ip_fragments.sweep(now);
        for (key, _) in &expired {
            debug!(
                "defrag: timeout for id={} {} -> {}",
                key.id, key.src, key.dst
            );
        }
        expired.len()
    }

    fn pending(&self) -> usize {
        self.ip_fragments.len()
    }
}

/// Add fragment to buffer. Returns true if the datagram is complete.
fn update_data(
    f: &mut DefragData,
    ipv4: &Ipv4Packet,
    header_len: usize,
    offset: usize,
    payload: &[u8],
    more_fragments: bool,
    max_fragments: usize,
) -> Result<bool, DefragError> {
    let end = offset + payload.len();
    if !more_fragments {
        match f.total_len {
            Some(total_len) if total_len != end => return Err(DefragError::ConflictingEnd),
            _ => f.total_len = Some(end),
        }
    }
    if let Some(total_len) = f.total_len {
        if end > total_len {
            return Err(DefragError::ConflictingEnd);
        }
    }
    if offset == 0 && f.header.is_none() {
        f.header = Some(ipv4.packet()[..header_len].to_vec());
    }
    if f.fragments.len() >= max_fragments {
        return Err(DefragError::TooManyFragments);
    }
    f.insert(offset, payload);
    Ok(f.is_complete())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet_packet::ip::IpNextHeaderProtocols;

    fn fragment(id: u16, offset: usize, more: bool, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 20 + payload.len()];
        let mut ip = MutableIpv4Packet::new(&mut buf).expect("ipv4");
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length((20 + payload.len()) as u16);
        ip.set_identification(id);
        ip.set_flags(if more { Ipv4Flags::MoreFragments } else { 0 });
        ip.set_fragment_offset((offset / 8) as u16);
        ip.set_ttl(64);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Udp);
        ip.set_source(Ipv4Addr::new(10, 0, 0, 1));
        ip.set_destination(Ipv4Addr::new(10, 0, 0, 2));
        ip.set_payload(payload);
        buf
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn defrag_out_of_order() {
        let payload = data(100);
        let mut engine = IPDefragEngine::default();
        let now = Duration::from_secs(1);
        let f3 = fragment(7, 80, false, &payload[80..]);
        let f1 = fragment(7, 0, true, &payload[..40]);
        let f2 = fragment(7, 40, true, &payload[40..80]);
        assert_eq!(engine.update(&f3, now), Ok(None));
        assert_eq!(engine.update(&f1, now), Ok(None));
        assert_eq!(engine.pending(), 1);
        let res = engine.update(&f2, now).expect("defrag").expect("complete");
        let ip = Ipv4Packet::new(&res).expect("ipv4");
        assert_eq!(ip.get_total_length(), 120);
        assert_eq!(ip.get_flags() & Ipv4Flags::MoreFragments, 0);
        assert_eq!(ip.get_fragment_offset(), 0);
        assert_eq!(ip.get_checksum(), checksum(&ip));
        assert_eq!(ip.payload(), &payload[..]);
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn defrag_overlap_keeps_first_data() {
        let payload = data(48);
        let mut engine = IPDefragEngine::default();
        let now = Duration::from_secs(1);
        assert_eq!(engine.update(&fragment(1, 0, true, &payload[..24]), now), Ok(None));
        // overlapping fragment with different content
        let bogus = vec![0xffu8; 16];
        assert_eq!(engine.update(&fragment(1, 16, true, &bogus), now), Ok(None));
        let res = engine
            .update(&fragment(1, 32, false, &payload[32..]), now)
            .expect("defrag")
            .expect("complete");
        let ip = Ipv4Packet::new(&res).expect("ipv4");
        assert_eq!(&ip.payload()[..24], &payload[..24]);
        assert_eq!(&ip.payload()[24..32], &bogus[8..]);
        assert_eq!(&ip.payload()[32..], &payload[32..]);
    }

    #[test]
    fn defrag_timeout_and_errors() {
        let payload = data(64);
        let mut engine = IPDefragEngine::default();
        assert_eq!(
            engine.update(&fragment(2, 0, true, &payload[..32]), Duration::from_secs(1)),
            Ok(None)
        );
        assert_eq!(engine.expire(Duration::from_secs(20)), 0);
        assert_eq!(engine.expire(Duration::from_secs(40)), 1);
        // last fragment alone does not complete the datagram
        assert_eq!(
            engine.update(&fragment(2, 32, false, &payload[32..]), Duration::from_secs(40)),
            Ok(None)
        );
        assert_eq!(
            engine.update(&fragment(3, 0, true, &payload[..30]), Duration::from_secs(40)),
            Err(DefragError::Misaligned(30))
        );
        assert_eq!(
            engine.update(&fragment(2, 8, false, &payload[8..16]), Duration::from_secs(40)),
            Err(DefragError::ConflictingEnd)
        );
        assert_eq!(engine.pending(), 0);
        assert_eq!(
            engine.update(&fragment(4, 65528, false, &payload[..16]), Duration::from_secs(40)),
            Err(DefragError::TooLarge)
        );
    }

    #[test]
    fn defrag_max_datagrams() {
        let payload = data(16);
        let mut engine = IPDefragEngine::new(Duration::from_secs(30), 2, 8);
        let now = Duration::from_secs(1);
        for id in 0..3 {
            assert_eq!(engine.update(&fragment(id, 0, true, &payload[..8]), now), Ok(None));
        }
        assert_eq!(engine.pending(), 2);
    }
}
