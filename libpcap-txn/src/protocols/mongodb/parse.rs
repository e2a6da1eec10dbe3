//! MongoDB wire protocol parser
//!
//! Every message starts with a 16-bytes header (all integers are little-endian):
//! message length (including header), request ID, response-to ID, opcode.

use super::bson::{parse_cstring, parse_document, parse_documents, Document};
use crate::stream::{ParseStep, Stream};
use libpcap_tools::Duration;
use nom::bytes::complete::take;
use nom::combinator::cond;
use nom::error::{Error, ErrorKind};
use nom::multi::count;
use nom::number::complete::{le_i32, le_i64, le_u32, le_u8};
use nom::{Err, IResult};
use tracing::trace;

pub const HEADER_LEN: usize = 16;
pub const MAX_MESSAGE_LEN: usize = 48_000_000;

/// `OP_REPLY` flag: query failed, the reply holds one document with an `$err` field
pub const REPLY_QUERY_FAILURE: u32 = 0x2;
/// `OP_MSG` flag: the message ends with a CRC-32C checksum
pub const MSG_CHECKSUM_PRESENT: u32 = 0x1;
/// `OP_MSG` flag: the sender will not wait for a reply
pub const MSG_MORE_TO_COME: u32 = 0x2;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpCode {
    Reply,
    Update,
    Insert,
    Query,
    GetMore,
    Delete,
    KillCursors,
    Msg,
}

impl OpCode {
    pub fn from_i32(v: i32) -> Option<OpCode> {
        match v {
            1 => Some(OpCode::Reply),
            2001 => Some(OpCode::Update),
            2002 => Some(OpCode::Insert),
            2004 => Some(OpCode::Query),
            2005 => Some(OpCode::GetMore),
            2006 => Some(OpCode::Delete),
            2007 => Some(OpCode::KillCursors),
            2013 => Some(OpCode::Msg),
            _ => None,
        }
    }

    /// Default method name of requests with this opcode
    pub fn method(self) -> &'static str {
        match self {
            OpCode::Reply => "reply",
            OpCode::Update => "update",
            OpCode::Insert => "insert",
            OpCode::Query => "find",
            OpCode::GetMore => "getMore",
            OpCode::Delete => "delete",
            OpCode::KillCursors => "killCursors",
            OpCode::Msg => "msg",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MsgHeader {
    pub message_length: usize,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: OpCode,
}

impl MsgHeader {
    pub fn is_response(&self) -> bool {
        match self.op_code {
            OpCode::Reply => true,
            OpCode::Msg => self.response_to != 0,
            _ => false,
        }
    }
}

/// Document sequence of an `OP_MSG` (section kind 1)
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentSequence {
    pub identifier: String,
    pub documents: Vec<Document>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum MongoBody {
    Reply {
        flags: u32,
        cursor_id: i64,
        starting_from: i32,
        number_returned: i32,
        documents: Vec<Document>,
    },
    Update {
        collection: String,
        flags: u32,
        selector: Document,
        update: Document,
    },
    Insert {
        flags: u32,
        collection: String,
        documents: Vec<Document>,
    },
    Query {
        flags: u32,
        collection: String,
        number_to_skip: i32,
        number_to_return: i32,
        query: Document,
        fields: Option<Document>,
    },
    GetMore {
        collection: String,
        number_to_return: i32,
        cursor_id: i64,
    },
    Delete {
        collection: String,
        flags: u32,
        selector: Document,
    },
    KillCursors {
        cursor_ids: Vec<i64>,
    },
    Msg {
        flags: u32,
        body: Option<Document>,
        sequences: Vec<DocumentSequence>,
    },
    /// Body was not received (packet loss)
    Missing,
}

#[derive(Debug)]
pub struct MongoMessage {
    pub ts: Duration,
    pub header: MsgHeader,
    pub body: MongoBody,
    /// Size of the message, in bytes
    pub size: usize,
    pub incomplete: bool,
}

impl MongoMessage {
    /// The sender does not expect a response
    pub fn is_fire_and_forget(&self) -> bool {
        match self.body {
            MongoBody::Insert { .. }
            | MongoBody::Update { .. }
            | MongoBody::Delete { .. }
            | MongoBody::KillCursors { .. } => true,
            MongoBody::Msg { flags, .. } => {
                !self.header.is_response() && flags & MSG_MORE_TO_COME != 0
            }
            _ => false,
        }
    }
}

pub type MongoStream = Stream<(), MongoMessage>;

fn fail<T>(i: &[u8], kind: ErrorKind) -> IResult<&[u8], T> {
    Err(Err::Error(Error::new(i, kind)))
}

/// Parse the message header. Fails on unknown opcodes or invalid lengths.
pub fn parse_header(i: &[u8]) -> IResult<&[u8], MsgHeader> {
    let (i, message_length) = le_u32(i)?;
    let message_length = message_length as usize;
    if !(HEADER_LEN..=MAX_MESSAGE_LEN).contains(&message_length) {
        return fail(i, ErrorKind::LengthValue);
    }
    let (i, request_id) = le_i32(i)?;
    let (i, response_to) = le_i32(i)?;
    let (i, code) = le_i32(i)?;
    let op_code = match OpCode::from_i32(code) {
        Some(op) => op,
        None => return fail(i, ErrorKind::Switch),
    };
    let header = MsgHeader {
        message_length,
        request_id,
        response_to,
        op_code,
    };
    Ok((i, header))
}

fn parse_reply(i: &[u8]) -> IResult<&[u8], MongoBody> {
    let (i, flags) = le_u32(i)?;
    let (i, cursor_id) = le_i64(i)?;
    let (i, starting_from) = le_i32(i)?;
    let (i, number_returned) = le_i32(i)?;
    let (i, documents) = parse_documents(i)?;
    let body = MongoBody::Reply {
        flags,
        cursor_id,
        starting_from,
        number_returned,
        documents,
    };
    Ok((i, body))
}

fn parse_update(i: &[u8]) -> IResult<&[u8], MongoBody> {
    let (i, _zero) = le_i32(i)?;
    let (i, collection) = parse_cstring(i)?;
    let (i, flags) = le_u32(i)?;
    let (i, selector) = parse_document(i)?;
    let (i, update) = parse_document(i)?;
    let body = MongoBody::Update {
        collection,
        flags,
        selector,
        update,
    };
    Ok((i, body))
}

fn parse_insert(i: &[u8]) -> IResult<&[u8], MongoBody> {
    let (i, flags) = le_u32(i)?;
    let (i, collection) = parse_cstring(i)?;
    let (i, documents) = parse_documents(i)?;
    let body = MongoBody::Insert {
        flags,
        collection,
        documents,
    };
    Ok((i, body))
}

fn parse_query(i: &[u8]) -> IResult<&[u8], MongoBody> {
    let (i, flags) = le_u32(i)?;
    let (i, collection) = parse_cstring(i)?;
    let (i, number_to_skip) = le_i32(i)?;
    let (i, number_to_return) = le_i32(i)?;
    let (i, query) = parse_document(i)?;
    let (i, fields) = cond(!i.is_empty(), parse_document)(i)?;
    let body = MongoBody::Query {
        flags,
        collection,
        number_to_skip,
        number_to_return,
        query,
        fields,
    };
    Ok((i, body))
}

fn parse_get_more(i: &[u8]) -> IResult<&[u8], MongoBody> {
    let (i, _zero) = le_i32(i)?;
    let (i, collection) = parse_cstring(i)?;
    let (i, number_to_return) = le_i32(i)?;
    let (i, cursor_id) = le_i64(i)?;
    let body = MongoBody::GetMore {
        collection,
        number_to_return,
        cursor_id,
    };
    Ok((i, body))
}

fn parse_delete(i: &[u8]) -> IResult<&[u8], MongoBody> {
    let (i, _zero) = le_i32(i)?;
    let (i, collection) = parse_cstring(i)?;
    let (i, flags) = le_u32(i)?;
    let (i, selector) = parse_document(i)?;
    let body = MongoBody::Delete {
        collection,
        flags,
        selector,
    };
    Ok((i, body))
}

fn parse_kill_cursors(i: &[u8]) -> IResult<&[u8], MongoBody> {
    let (i, _zero) = le_i32(i)?;
    let (i, n) = le_i32(i)?;
    // each cursor ID takes 8 bytes: do not trust the count for the allocation
    if n < 0 || n as usize > i.len() / 8 {
        return fail(i, ErrorKind::LengthValue);
    }
    let (i, cursor_ids) = count(le_i64, n as usize)(i)?;
    Ok((i, MongoBody::KillCursors { cursor_ids }))
}

fn parse_document_sequence(i: &[u8]) -> IResult<&[u8], DocumentSequence> {
    let (i, size) = le_i32(i)?;
    if size < 4 {
        return fail(i, ErrorKind::LengthValue);
    }
    let (rem, content) = take(size as usize - 4)(i)?;
    let (content, identifier) = parse_cstring(content)?;
    let (_, documents) = parse_documents(content)?;
    let seq = DocumentSequence {
        identifier,
        documents,
    };
    Ok((rem, seq))
}

/// Split the trailing CRC-32C from the sections
fn split_checksum(i: &[u8]) -> IResult<&[u8], &[u8]> {
    if i.len() < 4 {
        return fail(i, ErrorKind::Eof);
    }
    let (sections, crc) = i.split_at(i.len() - 4);
    Ok((sections, crc))
}

fn parse_msg(i: &[u8]) -> IResult<&[u8], MongoBody> {
    let (i, flags) = le_u32(i)?;
    // the checksum is not verified
    let (mut i, _checksum) = cond(flags & MSG_CHECKSUM_PRESENT != 0, split_checksum)(i)?;
    let mut body = None;
    let mut sequences = Vec::new();
    while !i.is_empty() {
        let (rem, kind) = le_u8(i)?;
        i = match kind {
            0 => {
                let (rem, doc) = parse_document(rem)?;
                body = Some(doc);
                rem
            }
            1 => {
                let (rem, seq) = parse_document_sequence(rem)?;
                sequences.push(seq);
                rem
            }
            _ => return fail(rem, ErrorKind::Switch),
        };
    }
    let body = MongoBody::Msg {
        flags,
        body,
        sequences,
    };
    Ok((i, body))
}

/// Parse the body of a message, depending on its opcode
pub fn parse_body(op_code: OpCode, i: &[u8]) -> IResult<&[u8], MongoBody> {
    match op_code {
        OpCode::Reply => parse_reply(i),
        OpCode::Update => parse_update(i),
        OpCode::Insert => parse_insert(i),
        OpCode::Query => parse_query(i),
        OpCode::GetMore => parse_get_more(i),
        OpCode::Delete => parse_delete(i),
        OpCode::KillCursors => parse_kill_cursors(i),
        OpCode::Msg => parse_msg(i),
    }
}

/// Parse one message from the stream
pub fn parse_step(s: &mut MongoStream, ts: Duration) -> ParseStep {
    let data = s.remaining();
    if data.len() < 4 {
        return ParseStep::NeedMore;
    }
    let message_length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if !(HEADER_LEN..=MAX_MESSAGE_LEN).contains(&message_length) {
        trace!("mongodb: invalid message length {}", message_length);
        return ParseStep::Invalid;
    }
    if data.len() < HEADER_LEN {
        return ParseStep::NeedMore;
    }
    let header = match parse_header(data) {
        Ok((_, header)) => header,
        Err(_) => {
            trace!("mongodb: invalid message header");
            return ParseStep::Invalid;
        }
    };
    if data.len() < message_length {
        trace!(
            "mongodb: waiting for more data ({}/{})",
            data.len(),
            message_length
        );
        return ParseStep::NeedMore;
    }
    let body = match parse_body(header.op_code, &data[HEADER_LEN..message_length]) {
        Ok((_, body)) => body,
        Err(e) => {
            trace!("mongodb: could not parse {:?} body: {:?}", header.op_code, e);
            return ParseStep::Invalid;
        }
    };
    trace!("mongodb: {:?} message, {} bytes", header.op_code, message_length);
    s.message = Some(MongoMessage {
        ts,
        header,
        body,
        size: message_length,
        incomplete: false,
    });
    s.parse_offset += message_length;
    ParseStep::Complete
}
