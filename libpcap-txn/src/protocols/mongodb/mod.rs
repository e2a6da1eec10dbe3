//! MongoDB protocol: transaction reconstruction
//!
//! A connection is assumed to have at most one outstanding request. Writes
//! using legacy opcodes (and `OP_MSG` with `moreToCome`) have no reply and
//! are published immediately.

mod bson;
mod commands;
mod parse;

pub use bson::{parse_document, Document};
pub use commands::is_database_command;
pub use parse::*;

use super::ProtocolConfig;
use crate::event::{Details, Status, TransactionEvent};
use crate::publisher::Publisher;
use crate::stream::{Direction, ParseStep};
use crate::transaction::{QueuePolicy, TransactionStore};
use libpcap_tools::{Config, Duration, Error, FiveTuple, Packet};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub const DEFAULT_PORTS: &[u16] = &[27017];
const DEFAULT_MAX_DOCS: usize = 10;
const DEFAULT_MAX_DOC_LENGTH: usize = 5000;

/// Protocol-specific fields of a mongodb event
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MongodbDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_collection_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_to_skip: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_to_return: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starting_from: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_returned: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A request waiting for its response
#[derive(Debug)]
pub struct MongodbTransaction {
    pub ts: Duration,
    pub tuple: FiveTuple,
    pub request_id: i32,
    pub method: String,
    pub resource: String,
    pub bytes_in: usize,
    pub documents: Vec<Document>,
    pub details: MongodbDetails,
    pub notes: Vec<String>,
}

/// Per-connection state: one stream per direction
#[derive(Debug, Default)]
pub struct MongodbConnection {
    streams: [MongoStream; 2],
    /// Timestamp of the first segment of the current message
    start_ts: [Duration; 2],
}

impl MongodbConnection {
    fn stream(&mut self, dir: Direction) -> (&mut MongoStream, &mut Duration) {
        (
            &mut self.streams[dir.index()],
            &mut self.start_ts[dir.index()],
        )
    }
}

/// What a response adds to a transaction
#[derive(Debug, Default)]
struct ResponseInfo {
    documents: Vec<Document>,
    cursor_id: Option<i64>,
    starting_from: Option<i32>,
    number_returned: Option<i32>,
    error: Option<String>,
}

#[derive(Clone)]
pub struct MongodbProtocol {
    config: Arc<ProtocolConfig>,
    max_docs: usize,
    max_doc_length: usize,
    store: TransactionStore<MongodbTransaction>,
    publisher: Arc<dyn Publisher>,
}

/// Serialize documents, one per line
///
/// At most `max_docs` documents are written (followed by `[...]` if some are
/// missing), each truncated to `max_doc_length` characters. A limit of 0
/// means unlimited.
pub fn format_documents(docs: &[Document], max_docs: usize, max_doc_length: usize) -> String {
    let limit = if max_docs == 0 { docs.len() } else { max_docs };
    let mut lines: Vec<String> = docs
        .iter()
        .take(limit)
        .map(|d| {
            let s = serde_json::to_string(d).unwrap_or_default();
            if max_doc_length > 0 && s.chars().count() > max_doc_length {
                let mut t: String = s.chars().take(max_doc_length).collect();
                t.push_str(" ...");
                t
            } else {
                s
            }
        })
        .collect();
    if docs.len() > limit {
        lines.push("[...]".to_owned());
    }
    lines.join("\n")
}

/// Split a full collection name (`db.collection`) and return the database
fn database_name(collection: &str) -> &str {
    collection.split('.').next().unwrap_or_default()
}

fn command_resource(db: &str, value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => format!("{}.{}", db, s),
        _ => db.to_owned(),
    }
}

/// Expand cursor replies (`cursor.firstBatch` / `cursor.nextBatch`) into their documents
fn expand_cursor(doc: &Document) -> Option<(Vec<Document>, Option<i64>)> {
    let cursor = doc.get("cursor")?.as_object()?;
    let batch = cursor
        .get("firstBatch")
        .or_else(|| cursor.get("nextBatch"))?
        .as_array()?;
    let docs = batch
        .iter()
        .filter_map(|v| v.as_object().cloned())
        .collect();
    Some((docs, cursor.get("id").and_then(Value::as_i64)))
}

/// Return the error message of a reply document, if any
fn document_error(doc: &Document) -> Option<String> {
    if let Some(err) = doc.get("$err") {
        return Some(err.as_str().map_or_else(|| err.to_string(), str::to_owned));
    }
    let ok = doc.get("ok")?;
    let failed = match ok {
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::Bool(b) => !b,
        _ => false,
    };
    if failed {
        let msg = doc
            .get("errmsg")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        Some(msg.to_owned())
    } else {
        None
    }
}

impl MongodbProtocol {
    pub fn new(config: &Config, publisher: Arc<dyn Publisher>) -> Result<Self, Error> {
        let prefix = "protocols.mongodb";
        let protocol_config = ProtocolConfig::from_config(config, prefix, DEFAULT_PORTS)?;
        let max_docs = config
            .get_usize(format!("{}.max_docs", prefix))
            .unwrap_or(DEFAULT_MAX_DOCS);
        let max_doc_length = config
            .get_usize(format!("{}.max_doc_length", prefix))
            .unwrap_or(DEFAULT_MAX_DOC_LENGTH);
        let store = TransactionStore::new(
            "mongodb",
            QueuePolicy::SingleOutstanding,
            protocol_config.transaction_timeout,
        );
        Ok(MongodbProtocol {
            config: Arc::new(protocol_config),
            max_docs,
            max_doc_length,
            store,
            publisher,
        })
    }

    /// Same protocol with an empty transaction store
    pub fn fork(&self) -> Self {
        MongodbProtocol {
            store: self.store.fork(),
            ..self.clone()
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn store(&self) -> &TransactionStore<MongodbTransaction> {
        &self.store
    }

    pub fn parse(&self, conn: &mut MongodbConnection, pkt: &Packet, dir: Direction) {
        let (stream, start_ts) = conn.stream(dir);
        if stream.data.is_empty() {
            *start_ts = pkt.ts;
        }
        if !stream.append(pkt.payload, self.config.max_stream_size) {
            debug!("mongodb: stream data too large, dropping stream ({})", pkt.tuple);
            return;
        }
        while !stream.data.is_empty() {
            match parse_step(stream, *start_ts) {
                ParseStep::Invalid => {
                    debug!("mongodb: ignoring message, dropping stream data ({})", pkt.tuple);
                    stream.reset();
                    break;
                }
                ParseStep::NeedMore => break,
                ParseStep::Complete => {
                    if let Some(msg) = stream.message.take() {
                        self.handle_message(msg, &pkt.tuple);
                    }
                    stream.prepare_for_new_message();
                    *start_ts = pkt.ts;
                }
            }
        }
    }

    /// Handle lost bytes in one direction. Returns true if the connection state should be dropped
    ///
    /// If the header of the current message was received, the message is
    /// still used (without its body).
    pub fn gap_in_stream(
        &self,
        conn: &mut MongodbConnection,
        tuple: &FiveTuple,
        dir: Direction,
        nbytes: usize,
    ) -> bool {
        let (stream, start_ts) = conn.stream(dir);
        let header = match parse_header(stream.remaining()) {
            Ok((_, header)) => header,
            Err(_) => {
                debug!("mongodb: gap of {} bytes, dropping stream ({})", nbytes, tuple);
                return true;
            }
        };
        debug!("mongodb: message not complete, but sending to the next layer");
        let msg = MongoMessage {
            ts: *start_ts,
            header,
            body: MongoBody::Missing,
            size: header.message_length,
            incomplete: true,
        };
        stream.reset();
        self.handle_message(msg, tuple);
        false
    }

    pub fn received_fin(&self, _conn: &mut MongodbConnection, tuple: &FiveTuple, dir: Direction) {
        trace!("mongodb: FIN received ({}, {:?})", tuple, dir);
    }

    /// Parse a datagram, holding one complete message
    pub fn parse_udp(&self, pkt: &Packet) {
        let mut stream = MongoStream::new();
        if !stream.append(pkt.payload, self.config.max_stream_size) {
            debug!("mongodb: datagram too large, dropping ({})", pkt.tuple);
            return;
        }
        match parse_step(&mut stream, pkt.ts) {
            ParseStep::Complete => {
                if let Some(msg) = stream.message.take() {
                    self.handle_message(msg, &pkt.tuple);
                }
            }
            step => debug!("mongodb: could not parse datagram ({:?})", step),
        }
    }

    pub fn expire(&self, now: Duration) -> usize {
        self.store.sweep(now)
    }

    fn handle_message(&self, msg: MongoMessage, tuple: &FiveTuple) {
        if msg.header.is_response() {
            self.on_response(msg, tuple);
            return;
        }
        let fire_and_forget = msg.is_fire_and_forget();
        let ts = msg.ts;
        let txn = self.new_transaction(msg, tuple);
        trace!("mongodb: request {} {}", txn.method, txn.resource);
        if fire_and_forget {
            let event = self.build_event(txn, ResponseInfo::default(), ts, 0, Vec::new());
            self.publisher.publish(event);
        } else {
            self.store.on_request(tuple, txn, ts);
        }
    }

    fn new_transaction(&self, msg: MongoMessage, tuple: &FiveTuple) -> MongodbTransaction {
        let mut details = MongodbDetails::default();
        let method;
        let resource;
        let mut documents = Vec::new();
        match msg.body {
            MongoBody::Query {
                collection,
                number_to_skip,
                number_to_return,
                query,
                ..
            } => {
                details.number_to_skip = Some(number_to_skip);
                details.number_to_return = Some(number_to_return);
                match query.iter().next() {
                    Some((key, value)) if is_database_command(key) => {
                        method = key.clone();
                        resource = command_resource(database_name(&collection), Some(value));
                    }
                    _ => {
                        method = OpCode::Query.method().to_owned();
                        resource = collection.clone();
                    }
                }
                details.full_collection_name = Some(collection);
                documents.push(query);
            }
            MongoBody::GetMore {
                collection,
                number_to_return,
                cursor_id,
            } => {
                method = OpCode::GetMore.method().to_owned();
                resource = collection.clone();
                details.full_collection_name = Some(collection);
                details.number_to_return = Some(number_to_return);
                details.cursor_id = Some(cursor_id);
            }
            MongoBody::Insert {
                collection,
                documents: docs,
                ..
            } => {
                method = OpCode::Insert.method().to_owned();
                resource = collection.clone();
                details.full_collection_name = Some(collection);
                documents = docs;
            }
            MongoBody::Update {
                collection,
                selector,
                update,
                ..
            } => {
                method = OpCode::Update.method().to_owned();
                resource = collection.clone();
                details.full_collection_name = Some(collection);
                documents = vec![selector, update];
            }
            MongoBody::Delete {
                collection,
                selector,
                ..
            } => {
                method = OpCode::Delete.method().to_owned();
                resource = collection.clone();
                details.full_collection_name = Some(collection);
                documents.push(selector);
            }
            MongoBody::KillCursors { cursor_ids } => {
                method = OpCode::KillCursors.method().to_owned();
                resource = String::new();
                details.cursor_id = cursor_ids.first().copied();
            }
            MongoBody::Msg {
                body, sequences, ..
            } => {
                match body.as_ref().and_then(|b| b.iter().next()) {
                    Some((key, value)) => {
                        let db = body
                            .as_ref()
                            .and_then(|b| b.get("$db"))
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        method = key.clone();
                        resource = command_resource(db, Some(value));
                    }
                    None => {
                        method = OpCode::Msg.method().to_owned();
                        resource = String::new();
                    }
                }
                documents.extend(body);
                documents.extend(sequences.into_iter().flat_map(|s| s.documents));
            }
            MongoBody::Reply { .. } | MongoBody::Missing => {
                method = msg.header.op_code.method().to_owned();
                resource = String::new();
            }
        }
        let notes = if msg.incomplete {
            vec!["Packet loss while capturing the request".to_owned()]
        } else {
            Vec::new()
        };
        MongodbTransaction {
            ts: msg.ts,
            tuple: tuple.clone(),
            request_id: msg.header.request_id,
            method,
            resource,
            bytes_in: msg.size,
            documents,
            details,
            notes,
        }
    }

    fn on_response(&self, msg: MongoMessage, tuple: &FiveTuple) {
        let txn = match self.store.on_response(tuple, msg.ts) {
            Some(txn) => txn,
            None => {
                warn!("mongodb: response from unknown transaction, ignoring ({})", tuple);
                return;
            }
        };
        if txn.request_id != msg.header.response_to {
            debug!(
                "mongodb: response to {} does not match request {} ({})",
                msg.header.response_to, txn.request_id, tuple
            );
        }
        let mut info = ResponseInfo::default();
        match msg.body {
            MongoBody::Reply {
                flags,
                cursor_id,
                starting_from,
                number_returned,
                documents,
            } => {
                info.cursor_id = Some(cursor_id);
                info.starting_from = Some(starting_from);
                info.number_returned = Some(number_returned);
                info.error = documents.first().and_then(document_error);
                if info.error.is_none() && flags & REPLY_QUERY_FAILURE != 0 {
                    info.error = Some("query failure".to_owned());
                }
                info.documents = match documents.as_slice() {
                    [doc] => match expand_cursor(doc) {
                        Some((docs, _)) => docs,
                        None => documents,
                    },
                    _ => documents,
                };
            }
            MongoBody::Msg {
                body, sequences, ..
            } => {
                if let Some(body) = body {
                    info.error = document_error(&body);
                    match expand_cursor(&body) {
                        Some((docs, cursor_id)) => {
                            info.documents = docs;
                            info.cursor_id = cursor_id;
                        }
                        None => info.documents.push(body),
                    }
                }
                info.documents
                    .extend(sequences.into_iter().flat_map(|s| s.documents));
                info.number_returned = Some(info.documents.len() as i32);
            }
            _ => (),
        }
        let notes = if msg.incomplete {
            vec!["Packet loss while capturing the response".to_owned()]
        } else {
            Vec::new()
        };
        let event = self.build_event(txn, info, msg.ts, msg.size, notes);
        self.publisher.publish(event);
    }

    fn build_event(
        &self,
        txn: MongodbTransaction,
        info: ResponseInfo,
        ts: Duration,
        size: usize,
        mut notes: Vec<String>,
    ) -> TransactionEvent {
        let (src, dst) = TransactionEvent::endpoints(&txn.tuple);
        let status = if info.error.is_some() {
            Status::Error
        } else {
            Status::Ok
        };
        let request = self
            .config
            .send_request
            .then(|| format_documents(&txn.documents, self.max_docs, self.max_doc_length));
        let response = self
            .config
            .send_response
            .then(|| format_documents(&info.documents, self.max_docs, self.max_doc_length));
        let mut details = txn.details;
        details.cursor_id = info.cursor_id.or(details.cursor_id);
        details.starting_from = info.starting_from;
        details.number_returned = info.number_returned;
        details.error = info.error;
        let mut all_notes = txn.notes;
        all_notes.append(&mut notes);
        TransactionEvent {
            protocol: "mongodb",
            timestamp: txn.ts,
            src,
            dst,
            status,
            method: txn.method,
            resource: txn.resource,
            response_time_us: ts.saturating_sub(txn.ts).as_micros(),
            bytes_in: txn.bytes_in,
            bytes_out: size,
            request,
            response,
            notes: all_notes,
            details: Details::Mongodb(details),
        }
    }
}
