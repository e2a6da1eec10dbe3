use crate::analyzer::FrameAnalyzer;
use crate::config::Config;
use crate::duration::{Duration, MICROS_PER_SEC};
use crate::error::Error;
use crate::packet::Frame;
use pcap_parser::{Block, Linktype, PcapBlockOwned, PcapError};
use std::io::Read;
use tracing::{debug, error, trace, warn};

/// Information related to a network interface used for capture
#[derive(Clone, Copy, Debug)]
struct InterfaceInfo {
    link_type: Linktype,
    /// Number of timestamp units per second
    ts_unit: u64,
    /// Offset added to timestamps, in seconds
    ts_offset: i64,
}

/// Number of units per second, from a pcapng `if_tsresol` option
///
/// If the most significant bit is set, the resolution is a negative power
/// of 2, else a negative power of 10.
fn ts_unit(if_tsresol: u8) -> u64 {
    let exp = u32::from(if_tsresol & 0x7f);
    let unit = if if_tsresol & 0x80 != 0 {
        2u64.checked_pow(exp)
    } else {
        10u64.checked_pow(exp)
    };
    unit.unwrap_or(u64::from(MICROS_PER_SEC))
}

/// Convert a timestamp in `unit` units per second to a `Duration`
fn build_ts(ts: u64, unit: u64, offset: i64) -> Duration {
    let unit = unit.max(1);
    let secs = (ts / unit) as i64 + offset;
    let frac = ts % unit;
    let micros = (u128::from(frac) * u128::from(MICROS_PER_SEC) / u128::from(unit)) as u32;
    Duration::new(secs.clamp(0, i64::from(u32::MAX)) as u32, micros)
}

/// pcap/pcap-ng reading engine
///
/// `PcapEngine` iterates over a capture input, handles the format (pcap
/// datalink, timestamp resolution, interfaces) and calls the analyzer for
/// each captured frame.
///
/// ## example
///
/// ```
/// use libpcap_tools::{Config, Error, Frame, FrameAnalyzer, PcapEngine};
/// #[derive(Default)]
/// pub struct CountAnalyzer {
///     frames: usize,
/// }
///
/// impl FrameAnalyzer for CountAnalyzer {
///     fn handle_frame(&mut self, _frame: &Frame) -> Result<(), Error> {
///         self.frames += 1;
///         Ok(())
///     }
/// }
///
/// let config = Config::default();
/// let mut engine = PcapEngine::new(CountAnalyzer::default(), &config);
///
/// // `engine.run()` can take any `mut Read` as input
/// use std::io::Cursor;
/// let mut input = Cursor::new(vec![1, 2, 3, 4, 5]);
/// let res = engine.run(&mut input);
/// assert!(res.is_err());
/// ```
pub struct PcapEngine<A: FrameAnalyzer> {
    analyzer: A,
    capacity: usize,

    interfaces: Vec<InterfaceInfo>,
    frame_index: usize,
}

impl<A: FrameAnalyzer> PcapEngine<A> {
    pub fn new(analyzer: A, config: &Config) -> Self {
        let capacity = config
            .get_usize("buffer_initial_capacity")
            .unwrap_or(128 * 1024);
        PcapEngine {
            analyzer,
            capacity,
            interfaces: Vec::new(),
            frame_index: 0,
        }
    }

    pub fn analyzer(&self) -> &A {
        &self.analyzer
    }

    pub fn analyzer_mut(&mut self) -> &mut A {
        &mut self.analyzer
    }

    pub fn into_analyzer(self) -> A {
        self.analyzer
    }

    /// Main function: given a reader, read all pcap data and call analyzer for each frame
    pub fn run(&mut self, reader: &mut (dyn Read + Send)) -> Result<(), Error> {
        let mut reader = pcap_parser::create_reader(self.capacity, reader)
            .map_err(|e| Error::Pcap(format!("{:?}", e)))?;

        self.analyzer.init()?;
        let mut block_index = 0;
        let mut last_incomplete_index = None;

        loop {
            match reader.next() {
                Ok((offset, block)) => {
                    self.handle_block(&block)?;
                    block_index += 1;
                    reader.consume(offset);
                }
                Err(PcapError::Eof) => break,
                Err(PcapError::Incomplete(_)) => {
                    if last_incomplete_index == Some(block_index) {
                        warn!(
                            "Could not read complete data block (block_index={})",
                            block_index
                        );
                        warn!("Hint: the reader buffer size may be too small, or the input file may be truncated.");
                        break;
                    }
                    last_incomplete_index = Some(block_index);
                    // refill the buffer
                    debug!("need refill");
                    reader
                        .refill()
                        .map_err(|e| Error::Pcap(format!("{:?}", e)))?;
                }
                Err(e) => {
                    error!("error while reading: {:?}", e);
                    return Err(Error::Pcap(format!("{:?}", e)));
                }
            }
        }

        self.analyzer.teardown();
        Ok(())
    }

    fn handle_block(&mut self, block: &PcapBlockOwned) -> Result<(), Error> {
        let (if_info, ts, data) = match block {
            PcapBlockOwned::LegacyHeader(hdr) => {
                let ts_unit = if hdr.is_nanosecond_precision() {
                    1_000_000_000
                } else {
                    1_000_000
                };
                trace!("Legacy pcap, link type: {:?}", hdr.network);
                self.interfaces = vec![InterfaceInfo {
                    link_type: hdr.network,
                    ts_unit,
                    ts_offset: 0,
                }];
                return Ok(());
            }
            PcapBlockOwned::Legacy(b) => {
                let if_info = *self
                    .interfaces
                    .first()
                    .ok_or(Error::Generic("Packet before pcap header"))?;
                let ts = Duration::new(
                    b.ts_sec,
                    (u64::from(b.ts_usec) * 1_000_000 / if_info.ts_unit) as u32,
                );
                let caplen = (b.caplen as usize).min(b.data.len());
                (if_info, ts, &b.data[..caplen])
            }
            PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                // reset section-related variables
                self.interfaces.clear();
                return Ok(());
            }
            PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                let if_info = InterfaceInfo {
                    link_type: idb.linktype,
                    ts_unit: ts_unit(idb.if_tsresol),
                    ts_offset: idb.if_tsoffset as i64,
                };
                trace!("pcapng interface, link type: {:?}", if_info.link_type);
                self.interfaces.push(if_info);
                return Ok(());
            }
            PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                let if_info = *self
                    .interfaces
                    .get(epb.if_id as usize)
                    .ok_or(Error::Generic("Invalid interface ID (EnhancedPacket)"))?;
                let ts_raw = (u64::from(epb.ts_high) << 32) | u64::from(epb.ts_low);
                let ts = build_ts(ts_raw, if_info.ts_unit, if_info.ts_offset);
                let caplen = (epb.caplen as usize).min(epb.data.len());
                (if_info, ts, &epb.data[..caplen])
            }
            PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                let if_info = *self
                    .interfaces
                    .first()
                    .ok_or(Error::Generic("Packet before interface (SimplePacket)"))?;
                let caplen = (spb.origlen as usize).min(spb.data.len());
                (if_info, Duration::default(), &spb.data[..caplen])
            }
            _ => {
                trace!("ignoring block");
                return Ok(());
            }
        };
        self.frame_index += 1;
        let frame = Frame {
            ts,
            link_type: if_info.link_type,
            data,
            index: self.frame_index,
        };
        self.analyzer.handle_frame(&frame)
    }
}
