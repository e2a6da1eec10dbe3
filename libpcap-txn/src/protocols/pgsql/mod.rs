//! Postgres-like protocol: transaction reconstruction
//!
//! Clients may pipeline requests, so pending transactions are queued and
//! matched with responses in order.

mod parse;

pub use parse::*;

use super::ProtocolConfig;
use crate::event::{Details, Status, TransactionEvent};
use crate::publisher::Publisher;
use crate::stream::{Direction, ParseStep};
use crate::transaction::{QueuePolicy, TransactionStore};
use libpcap_tools::{Config, Duration, Error, FiveTuple, Packet};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub const DEFAULT_PORTS: &[u16] = &[5432];
const DEFAULT_MAX_ROWS: usize = 10;
const DEFAULT_MAX_ROW_LENGTH: usize = 1024;

/// Protocol-specific fields of a pgsql event
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PgsqlDetails {
    pub num_rows: usize,
    pub num_fields: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_severity: Option<String>,
}

/// A request waiting for its response
#[derive(Debug)]
pub struct PgsqlTransaction {
    pub ts: Duration,
    pub tuple: FiveTuple,
    pub query: String,
    pub method: String,
    pub bytes_in: usize,
    pub notes: Vec<String>,
}

/// Per-connection state: one stream per direction
#[derive(Debug, Default)]
pub struct PgsqlConnection {
    streams: [PgsqlStream; 2],
}

impl PgsqlConnection {
    /// Return the stream for `dir`, and the stream of the other direction
    fn streams(&mut self, dir: Direction) -> (&mut PgsqlStream, &mut PgsqlStream) {
        let [original, reverse] = &mut self.streams;
        match dir {
            Direction::Original => (original, reverse),
            Direction::Reverse => (reverse, original),
        }
    }
}

#[derive(Clone)]
pub struct PgsqlProtocol {
    config: Arc<ProtocolConfig>,
    parser: PgsqlParser,
    store: TransactionStore<PgsqlTransaction>,
    publisher: Arc<dyn Publisher>,
}

/// Split a query string into its statements
fn split_queries(query: &str) -> impl Iterator<Item = &str> {
    query.split(';').map(str::trim).filter(|q| !q.is_empty())
}

/// Extract the method (first word) from a query
fn query_method(query: &str) -> String {
    query
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_uppercase()
}

/// Dump field names and rows as CSV
fn dump_csv(fields: &[String], rows: &[Vec<String>]) -> String {
    let mut wtr = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());
    let res = std::iter::once(fields)
        .filter(|f| !f.is_empty())
        .chain(rows.iter().map(|r| r.as_slice()))
        .try_for_each(|record| wtr.write_record(record));
    if let Err(e) = res {
        debug!("pgsql: could not dump rows: {}", e);
    }
    match wtr.into_inner() {
        Ok(v) => String::from_utf8_lossy(&v).into_owned(),
        Err(_) => String::new(),
    }
}

impl PgsqlProtocol {
    pub fn new(config: &Config, publisher: Arc<dyn Publisher>) -> Result<Self, Error> {
        let prefix = "protocols.pgsql";
        let protocol_config = ProtocolConfig::from_config(config, prefix, DEFAULT_PORTS)?;
        let parser = PgsqlParser {
            max_rows: config
                .get_usize(format!("{}.max_rows", prefix))
                .unwrap_or(DEFAULT_MAX_ROWS),
            max_row_length: config
                .get_usize(format!("{}.max_row_length", prefix))
                .unwrap_or(DEFAULT_MAX_ROW_LENGTH),
        };
        let store = TransactionStore::new(
            "pgsql",
            QueuePolicy::Pipelined,
            protocol_config.transaction_timeout,
        );
        Ok(PgsqlProtocol {
            config: Arc::new(protocol_config),
            parser,
            store,
            publisher,
        })
    }

    /// Same protocol with an empty transaction store
    pub fn fork(&self) -> Self {
        PgsqlProtocol {
            store: self.store.fork(),
            ..self.clone()
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn store(&self) -> &TransactionStore<PgsqlTransaction> {
        &self.store
    }

    pub fn parse(&self, conn: &mut PgsqlConnection, pkt: &Packet, dir: Direction) {
        let (stream, other) = conn.streams(dir);
        if !stream.buf.append(pkt.payload, self.config.max_stream_size) {
            debug!("pgsql: stream data too large, dropping stream ({})", pkt.tuple);
            stream.reset();
            return;
        }
        if other.seen_ssl_request {
            stream.expect_ssl_response = true;
        }
        while !stream.buf.data.is_empty() {
            match self.parser.parse_step(stream, pkt.ts) {
                ParseStep::Invalid => {
                    // retry parsing with the next segment
                    debug!("pgsql: ignoring message, dropping stream data ({})", pkt.tuple);
                    stream.reset();
                    break;
                }
                ParseStep::NeedMore => break,
                ParseStep::Complete => {
                    if let Some(msg) = stream.buf.message.take() {
                        match msg.kind {
                            MessageKind::SslRequest => stream.seen_ssl_request = true,
                            MessageKind::SslResponse => {
                                stream.expect_ssl_response = false;
                                other.seen_ssl_request = false;
                            }
                            _ if msg.to_export => self.handle_message(msg, &pkt.tuple),
                            _ => (),
                        }
                    }
                    stream.buf.prepare_for_new_message();
                }
            }
        }
    }

    /// Handle lost bytes in one direction. Returns true if the connection state should be dropped
    pub fn gap_in_stream(
        &self,
        conn: &mut PgsqlConnection,
        tuple: &FiveTuple,
        dir: Direction,
        nbytes: usize,
    ) -> bool {
        let (stream, _) = conn.streams(dir);
        let has_enough = stream
            .buf
            .message
            .as_ref()
            .is_some_and(|m| m.has_enough_data());
        if !has_enough {
            debug!("pgsql: gap of {} bytes, dropping stream ({})", nbytes, tuple);
            return true;
        }
        // publish what was received, marked as incomplete
        debug!("pgsql: message not complete, but sending to the next layer");
        if let Some(mut msg) = stream.buf.message.take() {
            msg.end = stream.buf.parse_offset;
            msg.incomplete = true;
            msg.to_export = true;
            self.handle_message(msg, tuple);
        }
        stream.buf.reset();
        false
    }

    pub fn received_fin(&self, _conn: &mut PgsqlConnection, tuple: &FiveTuple, dir: Direction) {
        trace!("pgsql: FIN received ({}, {:?})", tuple, dir);
    }

    /// Parse a datagram, holding one complete message
    pub fn parse_udp(&self, pkt: &Packet) {
        let mut stream = PgsqlStream::default();
        if !stream.buf.append(pkt.payload, self.config.max_stream_size) {
            debug!("pgsql: datagram too large, dropping ({})", pkt.tuple);
            return;
        }
        match self.parser.parse_step(&mut stream, pkt.ts) {
            ParseStep::Complete => {
                if let Some(msg) = stream.buf.message.take() {
                    if msg.to_export {
                        self.handle_message(msg, &pkt.tuple);
                    }
                }
            }
            step => debug!("pgsql: could not parse datagram ({:?})", step),
        }
    }

    pub fn expire(&self, now: Duration) -> usize {
        self.store.sweep(now)
    }

    fn handle_message(&self, msg: PgsqlMessage, tuple: &FiveTuple) {
        let size = msg.size();
        let ts = msg.ts;
        let note = match msg.kind {
            MessageKind::Request { .. } => "Packet loss while capturing the request",
            _ => "Packet loss while capturing the response",
        };
        let notes = if msg.incomplete {
            vec![note.to_owned()]
        } else {
            Vec::new()
        };
        match msg.kind {
            MessageKind::Request { query } => {
                // the query might contain a list of commands separated by ';'
                for q in split_queries(&query) {
                    trace!("pgsql: request {}", q);
                    let txn = PgsqlTransaction {
                        ts,
                        tuple: tuple.clone(),
                        query: q.to_owned(),
                        method: query_method(q),
                        bytes_in: size,
                        notes: notes.clone(),
                    };
                    self.store.on_request(tuple, txn, ts);
                }
            }
            MessageKind::Response(data) => match self.store.on_response(tuple, ts) {
                Some(txn) => {
                    let event = self.build_event(txn, data, ts, size, notes);
                    self.publisher.publish(event);
                }
                None => warn!("pgsql: response from unknown transaction, ignoring ({})", tuple),
            },
            _ => (),
        }
    }

    fn build_event(
        &self,
        txn: PgsqlTransaction,
        data: ResponseData,
        ts: Duration,
        size: usize,
        mut notes: Vec<String>,
    ) -> TransactionEvent {
        let (src, dst) = TransactionEvent::endpoints(&txn.tuple);
        let status = if data.error.is_some() {
            Status::Error
        } else {
            Status::Ok
        };
        let response = if self.config.send_response {
            Some(dump_csv(&data.fields, &data.rows))
        } else {
            None
        };
        let details = PgsqlDetails {
            num_rows: data.num_rows,
            num_fields: data.num_fields,
            error_code: data.error.as_ref().map(|e| e.code.clone()),
            error_message: data.error.as_ref().map(|e| e.message.clone()),
            error_severity: data.error.map(|e| e.severity),
        };
        let mut all_notes = txn.notes;
        all_notes.append(&mut notes);
        TransactionEvent {
            protocol: "pgsql",
            timestamp: txn.ts,
            src,
            dst,
            status,
            method: txn.method,
            request: self.config.send_request.then(|| txn.query.clone()),
            resource: txn.query,
            response_time_us: ts.saturating_sub(txn.ts).as_micros(),
            bytes_in: txn.bytes_in,
            bytes_out: size,
            response,
            notes: all_notes,
            details: Details::Pgsql(details),
        }
    }
}
