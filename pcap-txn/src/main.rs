#![warn(clippy::all)]

use clap::{crate_version, Parser};
use flate2::read::GzDecoder;
use libpcap_tools::{Config, FrameAnalyzer, PcapEngine};
use libpcap_txn::output::{create_file, get_output_dir, JsonLinesPublisher};
use libpcap_txn::{build_protocols, Analyzer, Publisher, ThreadedAnalyzer};
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn, Level};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use xz2::read::XzDecoder;

/// Reconstruct application transactions from a pcap file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, value_name = "CONFIG")]
    config: Option<String>,

    /// Output directory (events and log file)
    #[arg(short, long)]
    outdir: Option<String>,

    /// Events file name, relative to the output directory
    #[arg(short = 'w', long, default_value = "transactions.json")]
    output: String,

    /// Number of jobs to run (default: 1, 0: auto)
    #[arg(short, long)]
    jobs: Option<u8>,

    /// Input file
    input: Option<String>,
}

fn load_config(config: &mut Config, filename: &str) -> Result<(), io::Error> {
    debug!("Loading configuration {filename}");
    let path = Path::new(&filename);
    let file = File::open(path)?;
    config
        .load_config(file)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

fn config_error(e: libpcap_tools::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
}

fn open_input(input_filename: &str) -> io::Result<Box<dyn io::Read + Send>> {
    if input_filename == "-" {
        return Ok(Box::new(io::stdin()));
    }
    let path = Path::new(input_filename);
    let file = File::open(path)?;
    let reader: Box<dyn io::Read + Send> = if input_filename.ends_with(".gz") {
        Box::new(GzDecoder::new(file))
    } else if input_filename.ends_with(".xz") {
        Box::new(XzDecoder::new(file))
    } else if input_filename.ends_with(".lz4") {
        Box::new(lz4::Decoder::new(file)?)
    } else {
        Box::new(file)
    };
    Ok(reader)
}

fn run<A: FrameAnalyzer>(
    analyzer: A,
    config: &Config,
    reader: &mut (dyn io::Read + Send),
) -> io::Result<()> {
    let mut engine = PcapEngine::new(analyzer, config);
    engine
        .run(reader)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    // load config
    let mut config = Config::default();
    if let Some(filename) = args.config {
        load_config(&mut config, &filename)?;
    }
    // override config options from command-line arguments
    if let Some(jobs) = args.jobs {
        config.set("num_threads", jobs).map_err(config_error)?;
    }
    if let Some(dir) = args.outdir {
        config.set("output_dir", dir.as_str()).map_err(config_error)?;
    }

    // Open log file
    let log_file = config.get("log_file").unwrap_or("pcap-txn.log");
    let output_dir = get_output_dir(&config);
    let file_appender = RollingFileAppender::new(Rotation::NEVER, output_dir, log_file);
    let env_filter = EnvFilter::try_from_env("PCAP_TXN_LOG")
        .unwrap_or_else(|_| EnvFilter::from_default_env().add_directive(Level::INFO.into()));
    tracing_subscriber::fmt()
        .with_writer(file_appender)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .compact()
        .init();

    info!("pcap-txn {}", crate_version!());

    let input_filename = match args.input.as_ref() {
        Some(s) => s.as_str(),
        None => {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "Input file name cannot be empty",
            ));
        }
    };
    let mut input_reader = open_input(input_filename)?;

    let events = create_file(output_dir, &args.output)?;
    let publisher = Arc::new(JsonLinesPublisher::new(events));
    let protocols =
        build_protocols(&config, publisher.clone() as Arc<dyn Publisher>).map_err(config_error)?;
    if protocols.is_empty() {
        warn!("No protocol enabled");
    }

    let num_threads = config.get_usize("num_threads").unwrap_or(1);
    if num_threads == 1 {
        let analyzer = Analyzer::new(protocols, &config).map_err(config_error)?;
        run(analyzer, &config, &mut input_reader)?;
    } else {
        let analyzer = ThreadedAnalyzer::new(protocols, &config).map_err(config_error)?;
        info!("Using {} worker threads", analyzer.n_workers());
        run(analyzer, &config, &mut input_reader)?;
    }
    publisher.flush()?;

    info!("pcap-txn: done, exiting");
    Ok(())
}
