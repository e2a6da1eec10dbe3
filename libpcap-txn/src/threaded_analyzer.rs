use crate::analyzer::{Analyzer, AnalyzerConfig};
use crate::decoder::network_layer;
use crate::layers::NetworkLayerType;
use crate::protocols::Protocol;
use crossbeam_channel::{unbounded, Sender};
use fnv::FnvHasher;
use libpcap_tools::{Config, Duration, Error, Frame, FrameAnalyzer, Linktype};
use std::hash::Hasher;
use std::thread;
use tracing::{debug, trace, warn};

/// A frame copied for a worker thread
#[derive(Debug)]
pub struct OwnedFrame {
    pub ts: Duration,
    pub link_type: Linktype,
    pub data: Vec<u8>,
    pub index: usize,
}

impl OwnedFrame {
    fn as_frame(&self) -> Frame<'_> {
        Frame {
            ts: self.ts,
            link_type: self.link_type,
            data: &self.data,
            index: self.index,
        }
    }
}

pub enum Job {
    Exit,
    PrintDebug,
    New(OwnedFrame),
}

pub struct Worker {
    pub(crate) id: usize,
    pub(crate) handler: thread::JoinHandle<()>,
}

/// Multi-threaded analyzer
///
/// The main thread only decodes the link layer, and dispatches frames to
/// workers using a hash of the IP addresses. The hash is symmetric, so both
/// directions of a connection (and all fragments of a datagram) are handled
/// by the same worker. Each worker runs its own [`Analyzer`], with its own
/// transaction stores: workers do not run on the same capture clock, so a
/// worker must not sweep the requests of another one.
pub struct ThreadedAnalyzer {
    protocols: Vec<Protocol>,
    settings: AnalyzerConfig,
    n_workers: usize,

    local_jobs: Vec<Sender<Job>>,
    workers: Vec<Worker>,
}

impl ThreadedAnalyzer {
    pub fn new(protocols: Vec<Protocol>, config: &Config) -> Result<Self, Error> {
        let settings = AnalyzerConfig::from_config(config)?;
        let n_workers = config
            .get_usize("num_threads")
            .filter(|&n| n > 0)
            .unwrap_or_else(num_cpus::get);
        Ok(ThreadedAnalyzer {
            protocols,
            settings,
            n_workers,
            local_jobs: Vec::new(),
            workers: Vec::new(),
        })
    }

    pub fn n_workers(&self) -> usize {
        self.n_workers
    }

    fn dispatch(&self, frame: &Frame) {
        let i = match network_layer(frame.link_type, frame.data) {
            Ok((l3, data)) => fan_out(l3, data, self.local_jobs.len()),
            Err(e) => {
                debug!("frame {}: dropped: {}", frame.index, e);
                return;
            }
        };
        debug_assert!(i < self.local_jobs.len());
        let job = Job::New(OwnedFrame {
            ts: frame.ts,
            link_type: frame.link_type,
            data: frame.data.to_vec(),
            index: frame.index,
        });
        if self.local_jobs[i].send(job).is_err() {
            warn!("worker {} is not running, dropping frame {}", i, frame.index);
        }
    }
}

fn run_worker(i: usize, analyzer: &mut Analyzer, job: Job) -> bool {
    match job {
        Job::Exit => {
            analyzer.teardown();
            return false;
        }
        Job::PrintDebug => {
            debug!(
                "thread {}: {} connections, {} pending fragments",
                i,
                analyzer.connections(),
                analyzer.pending_fragments()
            );
        }
        Job::New(frame) => {
            trace!("thread {}: got a job", i);
            if let Err(e) = analyzer.handle_frame(&frame.as_frame()) {
                warn!("thread {}: handle_frame failed (idx={}): {}", i, frame.index, e);
            }
        }
    }
    true
}

impl FrameAnalyzer for ThreadedAnalyzer {
    fn init(&mut self) -> Result<(), Error> {
        self.local_jobs.reserve(self.n_workers);
        for i in 0..self.n_workers {
            let (sender, receiver) = unbounded::<Job>();
            let protocols: Vec<_> = self.protocols.iter().map(Protocol::fork).collect();
            let settings = self.settings;
            let handler = thread::Builder::new()
                .name(format!("worker {}", i))
                .spawn(move || {
                    debug!("worker thread {} starting", i);
                    let mut analyzer = Analyzer::with_settings(protocols, settings);
                    while let Ok(job) = receiver.recv() {
                        if !run_worker(i, &mut analyzer, job) {
                            break;
                        }
                    }
                })?;
            self.local_jobs.push(sender);
            self.workers.push(Worker { id: i, handler });
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        if self.local_jobs.is_empty() {
            return Err(Error::Generic("threaded analyzer is not initialized"));
        }
        self.dispatch(frame);
        Ok(())
    }

    fn teardown(&mut self) {
        debug!("main: exit");
        for job in self.local_jobs.iter() {
            let _ = job.send(Job::PrintDebug);
            let _ = job.send(Job::Exit);
        }
        while let Some(w) = self.workers.pop() {
            if w.handler.join().is_err() {
                warn!("panic occurred in worker {}", w.id);
            }
        }
        self.local_jobs.clear();
        debug!("main: all workers ended");
    }
}

/// Select a worker from the XOR of source and destination addresses
pub(crate) fn fan_out(l3: NetworkLayerType, data: &[u8], n_workers: usize) -> usize {
    if n_workers <= 1 {
        return 0;
    }
    let mut hasher = FnvHasher::default();
    match l3 {
        NetworkLayerType::Ipv4 if data.len() >= 20 => {
            let mut buf = [0u8; 4];
            for (i, b) in buf.iter_mut().enumerate() {
                *b = data[12 + i] ^ data[16 + i];
            }
            hasher.write(&buf);
        }
        NetworkLayerType::Ipv6 if data.len() >= 40 => {
            let mut buf = [0u8; 16];
            for (i, b) in buf.iter_mut().enumerate() {
                *b = data[8 + i] ^ data[24 + i];
            }
            hasher.write(&buf);
        }
        _ => return n_workers - 1,
    }
    (hasher.finish() % n_workers as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_out_is_symmetric() {
        let mut ip = [0u8; 20];
        ip[12..16].copy_from_slice(&[192, 168, 1, 10]);
        ip[16..20].copy_from_slice(&[10, 0, 3, 7]);
        let mut rev = ip;
        rev[12..16].copy_from_slice(&ip[16..20]);
        rev[16..20].copy_from_slice(&ip[12..16]);
        for n in 1..8 {
            let a = fan_out(NetworkLayerType::Ipv4, &ip, n);
            assert!(a < n);
            assert_eq!(a, fan_out(NetworkLayerType::Ipv4, &rev, n));
        }
        // truncated header: last worker
        assert_eq!(fan_out(NetworkLayerType::Ipv6, &ip, 4), 3);
    }
}
