use crate::event::TransactionEvent;
use crate::publisher::Publisher;
use libpcap_tools::Config;
use std::fs::File;
use std::io::{self, BufWriter, Error, Write};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tracing::warn;

/// Get the base prefix of output directory (or "." if not specified)
pub fn get_output_dir(config: &Config) -> &str {
    config.get("output_dir").unwrap_or(".")
}

/// Create a file to output data
pub fn create_file<P: AsRef<str>>(base: &str, filename: P) -> Result<File, Error> {
    let mut path = PathBuf::from(base);
    path.push(filename.as_ref());
    File::create(path)
}

/// Publisher writing one JSON object per line
pub struct JsonLinesPublisher<W: Write + Send> {
    writer: Mutex<BufWriter<W>>,
}

impl<W: Write + Send> JsonLinesPublisher<W> {
    pub fn new(writer: W) -> Self {
        JsonLinesPublisher {
            writer: Mutex::new(BufWriter::new(writer)),
        }
    }

    pub fn flush(&self) -> io::Result<()> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }
}

impl<W: Write + Send> Publisher for JsonLinesPublisher<W> {
    fn publish(&self, event: TransactionEvent) {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let res = serde_json::to_writer(&mut *writer, &event)
            .map_err(io::Error::from)
            .and_then(|_| writer.write_all(b"\n"));
        if let Err(e) = res {
            warn!("could not write event: {}", e);
        }
    }
}
