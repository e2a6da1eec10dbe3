use crate::decoder::Decoder;
use crate::demux::{Demux, DemuxStats};
use crate::ip_defrag::{
    IPDefragEngine, DEFAULT_DEFRAG_TIMEOUT, DEFAULT_MAX_DATAGRAMS, DEFAULT_MAX_FRAGMENTS,
};
use crate::protocols::Protocol;
use libpcap_tools::{Config, Duration, Error, Frame, FrameAnalyzer};
use tracing::{debug, info, trace};

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Analyzer statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AnalyzerStats {
    pub frames: usize,
    pub decode_errors: usize,
    /// Frames consumed without producing a packet (fragments, empty segments)
    pub consumed: usize,
    pub expired_transactions: usize,
    pub expired_fragments: usize,
}

/// Settings of an [`Analyzer`], read from the configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AnalyzerConfig {
    pub defrag_timeout: Duration,
    pub max_datagrams: usize,
    pub max_fragments: usize,
    pub sweep_interval: Duration,
}

impl AnalyzerConfig {
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Ok(AnalyzerConfig {
            defrag_timeout: config
                .get_secs("ip.defrag_timeout")?
                .unwrap_or(DEFAULT_DEFRAG_TIMEOUT),
            max_datagrams: config
                .get_usize("ip.defrag_max_datagrams")
                .unwrap_or(DEFAULT_MAX_DATAGRAMS),
            max_fragments: config
                .get_usize("ip.defrag_max_fragments")
                .unwrap_or(DEFAULT_MAX_FRAGMENTS),
            sweep_interval: config
                .get_secs("sweep_interval")?
                .unwrap_or(DEFAULT_SWEEP_INTERVAL),
        })
    }
}

/// Single-threaded analyzer: decodes frames, and dispatches packets to protocols
///
/// Expired state (fragments, connections and transactions) is swept each
/// time the capture clock advances by `sweep_interval`.
pub struct Analyzer {
    decoder: Decoder,
    demux: Demux,
    sweep_interval: Duration,
    next_sweep: Option<Duration>,
    stats: AnalyzerStats,
}

impl Analyzer {
    pub fn new(protocols: Vec<Protocol>, config: &Config) -> Result<Analyzer, Error> {
        let settings = AnalyzerConfig::from_config(config)?;
        Ok(Analyzer::with_settings(protocols, settings))
    }

    pub fn with_settings(protocols: Vec<Protocol>, settings: AnalyzerConfig) -> Analyzer {
        let ipv4_defrag = IPDefragEngine::new(
            settings.defrag_timeout,
            settings.max_datagrams,
            settings.max_fragments,
        );
        Analyzer {
            decoder: Decoder::new(Box::new(ipv4_defrag)),
            demux: Demux::new(protocols),
            sweep_interval: settings.sweep_interval,
            next_sweep: None,
            stats: AnalyzerStats::default(),
        }
    }

    pub fn stats(&self) -> &AnalyzerStats {
        &self.stats
    }

    pub fn demux_stats(&self) -> &DemuxStats {
        self.demux.stats()
    }

    /// Number of tracked connections
    pub fn connections(&self) -> usize {
        self.demux.connections()
    }

    /// Number of datagrams waiting for fragments
    pub fn pending_fragments(&self) -> usize {
        self.decoder.pending_fragments()
    }

    /// Evict all state expired at `now`
    pub fn sweep(&mut self, now: Duration) {
        self.stats.expired_fragments += self.decoder.expire(now);
        let connections = self.demux.expire(now);
        let transactions: usize = self.demux.protocols().iter().map(|p| p.expire(now)).sum();
        self.stats.expired_transactions += transactions;
        if connections > 0 || transactions > 0 {
            debug!(
                "sweep at {}: {} connections, {} transactions expired",
                now, connections, transactions
            );
        }
    }

    fn maybe_sweep(&mut self, ts: Duration) {
        match self.next_sweep {
            Some(next) if ts < next => (),
            Some(_) => {
                self.sweep(ts);
                self.next_sweep = Some(ts + self.sweep_interval);
            }
            None => self.next_sweep = Some(ts + self.sweep_interval),
        }
    }
}

impl FrameAnalyzer for Analyzer {
    fn handle_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        self.stats.frames += 1;
        self.maybe_sweep(frame.ts);
        match self.decoder.decode(frame) {
            Ok(Some(pkt)) => {
                trace!("frame {}: {} ({} bytes)", frame.index, pkt.tuple, pkt.payload().len());
                self.demux.handle(&pkt, frame.ts);
            }
            Ok(None) => self.stats.consumed += 1,
            Err(e) => {
                debug!("frame {}: dropped: {}", frame.index, e);
                self.stats.decode_errors += 1;
            }
        }
        Ok(())
    }

    fn teardown(&mut self) {
        let pending: usize = self.demux.protocols().iter().map(|p| p.pending()).sum();
        info!(
            "Analyzer: {} frames, {} decode errors, {} connections, {} connections with pending transactions",
            self.stats.frames,
            self.stats.decode_errors,
            self.demux.connections(),
            pending
        );
        for p in self.demux.protocols() {
            let stats = p.store_stats();
            if stats.unmatched_responses > 0 || stats.dropped_requests > 0 {
                info!(
                    "{}: {} unmatched responses, {} dropped requests",
                    p.name(),
                    stats.unmatched_responses,
                    stats.dropped_requests
                );
            }
        }
        debug!("Analyzer: {:?} {:?}", self.stats, self.demux.stats());
    }
}
