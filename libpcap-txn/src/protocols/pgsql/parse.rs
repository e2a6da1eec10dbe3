//! Postgres frontend/backend protocol parser
//!
//! After the startup phase, every frame has a one-byte type, followed by a
//! big-endian 32-bit length (including itself, but not the type byte). The
//! startup, SSL and cancel requests have no type byte and are recognized by
//! their code.

use crate::stream::{ParseStep, Stream};
use libpcap_tools::Duration;
use std::borrow::Cow;
use tracing::{debug, trace, warn};

const CANCEL_REQUEST_CODE: u32 = 80877102;
const SSL_REQUEST_CODE: u32 = 80877103;
const STARTUP_MESSAGE_CODE: u32 = 196608;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PgsqlState {
    #[default]
    Start,
    /// Reading rows of a response
    GetData,
    /// Reading the frames of an extended query request, until Sync
    ExtendedQuery,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    pub severity: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResponseData {
    pub fields: Vec<String>,
    /// Format of each field: 0 for text, 1 for binary
    pub fields_format: Vec<u16>,
    /// Stored rows, limited by configuration
    pub rows: Vec<Vec<String>>,
    pub num_rows: usize,
    pub num_fields: usize,
    pub error: Option<ErrorInfo>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum MessageKind {
    #[default]
    Pending,
    Request {
        query: String,
    },
    Response(ResponseData),
    SslRequest,
    SslResponse,
}

#[derive(Clone, Debug, Default)]
pub struct PgsqlMessage {
    /// Timestamp of the first packet of the message
    pub ts: Duration,
    pub start: usize,
    pub end: usize,
    pub kind: MessageKind,
    pub to_export: bool,
    pub incomplete: bool,
}

impl PgsqlMessage {
    pub fn new(ts: Duration) -> Self {
        PgsqlMessage {
            ts,
            ..PgsqlMessage::default()
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// Test if a message interrupted by a gap is worth publishing
    pub fn has_enough_data(&self) -> bool {
        match &self.kind {
            MessageKind::Request { query } => !query.is_empty(),
            MessageKind::Response(data) => !data.rows.is_empty(),
            _ => false,
        }
    }

    fn response_data(&mut self) -> &mut ResponseData {
        if !matches!(self.kind, MessageKind::Response(_)) {
            self.kind = MessageKind::Response(ResponseData::default());
        }
        match &mut self.kind {
            MessageKind::Response(data) => data,
            _ => unreachable!(),
        }
    }
}

/// One direction of a connection
#[derive(Debug, Default)]
pub struct PgsqlStream {
    pub buf: Stream<PgsqlState, PgsqlMessage>,
    pub seen_ssl_request: bool,
    pub expect_ssl_response: bool,
}

impl PgsqlStream {
    pub fn reset(&mut self) {
        self.buf.reset();
        self.seen_ssl_request = false;
        self.expect_ssl_response = false;
    }
}

#[derive(Debug)]
enum SpecialCommand {
    None,
    Incomplete,
    Cancel(usize),
    Ssl(usize),
    Startup(usize),
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let b = data.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let b = data.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

/// Read a null-terminated string. Returns the string and the number of bytes consumed
fn read_cstring(data: &[u8]) -> Option<(Cow<'_, str>, usize)> {
    let pos = data.iter().position(|&b| b == 0)?;
    Some((String::from_utf8_lossy(&data[..pos]), pos + 1))
}

/// Read a string that must fill the whole frame body, including the final null byte
fn pgsql_string(body: &[u8]) -> Option<Cow<'_, str>> {
    match body.split_last() {
        None => Some(Cow::Borrowed("")),
        Some((0, s)) => Some(String::from_utf8_lossy(s)),
        _ => None,
    }
}

fn pgsql_valid_type(t: u8) -> bool {
    matches!(
        t,
        b'1' | b'2' | b'3'
            | b'A' | b'B' | b'C' | b'D' | b'E' | b'F' | b'G' | b'H' | b'I' | b'K'
            | b'N' | b'P' | b'Q' | b'R' | b'S' | b'T' | b'V' | b'W' | b'X' | b'Z'
            | b'c' | b'd' | b'f' | b'n' | b'p' | b's' | b't'
    )
}

fn special_command(data: &[u8]) -> SpecialCommand {
    if data.len() < 8 {
        // frame types are never null, but lengths of special commands always start with 0
        if data.first() == Some(&0) {
            return SpecialCommand::Incomplete;
        }
        return SpecialCommand::None;
    }
    let (length, code) = match (read_u32(data, 0), read_u32(data, 4)) {
        (Some(length), Some(code)) => (length as usize, code),
        _ => return SpecialCommand::None,
    };
    match (length, code) {
        (16, CANCEL_REQUEST_CODE) => SpecialCommand::Cancel(length),
        (8, SSL_REQUEST_CODE) => SpecialCommand::Ssl(length),
        (_, STARTUP_MESSAGE_CODE) => SpecialCommand::Startup(length),
        _ => SpecialCommand::None,
    }
}

fn message(m: &mut Option<PgsqlMessage>) -> &mut PgsqlMessage {
    m.get_or_insert_with(PgsqlMessage::default)
}

/// Type and length of the frame at the current offset, if fully buffered
enum Frame {
    Invalid,
    NeedMore,
    Ready { typ: u8, length: usize },
}

fn next_frame(s: &Stream<PgsqlState, PgsqlMessage>) -> Frame {
    let rem = s.remaining();
    if rem.len() < 5 {
        return Frame::NeedMore;
    }
    let typ = rem[0];
    let length = match read_u32(rem, 1) {
        Some(length) => length as usize,
        None => return Frame::NeedMore,
    };
    if length < 4 {
        // length should include the size of itself (int32)
        trace!("invalid pgsql frame length {}", length);
        return Frame::Invalid;
    }
    if rem.len() < length + 1 {
        trace!("wait for more data (type {}, length {})", typ as char, length);
        return Frame::NeedMore;
    }
    Frame::Ready { typ, length }
}

/// Pgsql parser, holding the limits of stored response data
#[derive(Clone, Debug)]
pub struct PgsqlParser {
    pub max_rows: usize,
    pub max_row_length: usize,
}

impl PgsqlParser {
    /// Run one step of the state machine on the stream
    pub fn parse_step(&self, s: &mut PgsqlStream, ts: Duration) -> ParseStep {
        let expect_ssl_response = s.expect_ssl_response;
        let buf = &mut s.buf;
        if buf.message.is_none() {
            buf.message = Some(PgsqlMessage::new(ts));
        }
        trace!("pgsql parse_step state={:?} offset={}", buf.state, buf.parse_offset);
        match buf.state {
            PgsqlState::Start => self.parse_message_start(buf, expect_ssl_response),
            PgsqlState::GetData => self.parse_message_data(buf),
            PgsqlState::ExtendedQuery => parse_extended_query(buf),
        }
    }

    fn parse_message_start(
        &self,
        s: &mut Stream<PgsqlState, PgsqlMessage>,
        expect_ssl_response: bool,
    ) -> ParseStep {
        loop {
            let rem = s.remaining();
            if expect_ssl_response && matches!(rem.first(), Some(b'N') | Some(b'S')) {
                // one byte reply to an SSL request seen in the other direction
                trace!("pgsql: reply for SSL request {}", rem[0] as char);
                let m = message(&mut s.message);
                m.start = s.parse_offset;
                s.parse_offset += 1;
                m.end = s.parse_offset;
                m.kind = MessageKind::SslResponse;
                return ParseStep::Complete;
            }
            if rem.len() < 5 {
                return ParseStep::NeedMore;
            }
            let length = match special_command(rem) {
                SpecialCommand::None => return self.parse_command(s),
                SpecialCommand::Incomplete => return ParseStep::NeedMore,
                SpecialCommand::Ssl(length) => {
                    if rem.len() < length {
                        return ParseStep::NeedMore;
                    }
                    // one byte reply (S or N) expected in the other direction
                    debug!("pgsql: SSL request");
                    let m = message(&mut s.message);
                    m.start = s.parse_offset;
                    s.parse_offset += length;
                    m.end = s.parse_offset;
                    m.kind = MessageKind::SslRequest;
                    return ParseStep::Complete;
                }
                SpecialCommand::Startup(length) | SpecialCommand::Cancel(length) => length,
            };
            if length < 8 {
                return ParseStep::Invalid;
            }
            if rem.len() < length {
                return ParseStep::NeedMore;
            }
            trace!("pgsql: skipping startup/cancel message, length={}", length);
            s.parse_offset += length;
        }
    }

    fn parse_command(&self, s: &mut Stream<PgsqlState, PgsqlMessage>) -> ParseStep {
        let offset = s.parse_offset;
        let (typ, length) = match next_frame(s) {
            Frame::Invalid => return ParseStep::Invalid,
            Frame::NeedMore => return ParseStep::NeedMore,
            Frame::Ready { typ, length } => (typ, length),
        };
        let body = &s.data[offset + 5..offset + 1 + length];
        trace!("pgsql type {}, length={}", typ as char, length);
        let m = message(&mut s.message);
        m.start = offset;
        match typ {
            b'Q' => {
                let query = match pgsql_string(body) {
                    Some(query) => query.into_owned(),
                    None => return ParseStep::Invalid,
                };
                trace!("simple query: {}", query);
                m.kind = MessageKind::Request { query };
                m.to_export = true;
            }
            b'T' => {
                m.to_export = true;
                if let Err(e) = parse_fields(body, m.response_data()) {
                    debug!("pgsql: parse_fields failed: {}", e);
                    return ParseStep::Invalid;
                }
                s.parse_offset = offset + 1 + length;
                s.state = PgsqlState::GetData;
                return self.parse_message_data(s);
            }
            b'I' | b'C' => {
                // EmptyQueryResponse substitutes CommandComplete for empty queries
                if typ == b'C' && pgsql_string(body).is_none() {
                    return ParseStep::Invalid;
                }
                m.response_data();
                m.to_export = true;
            }
            b'Z' => {
                // ReadyForQuery: backend ready for a new query cycle
                m.to_export = false;
            }
            b'E' => {
                m.response_data().error = Some(parse_error(body));
                m.to_export = true;
            }
            b'P' => {
                // Parse: statement name, then query
                let query = match read_cstring(body)
                    .and_then(|(_, consumed)| read_cstring(&body[consumed..]))
                {
                    Some((query, _)) => query.into_owned(),
                    None => {
                        debug!("pgsql: invalid extended query request");
                        return ParseStep::Invalid;
                    }
                };
                trace!("parse in an extended query request: {}", query);
                m.to_export = !query.starts_with("SET ");
                m.kind = MessageKind::Request { query };
                s.parse_offset = offset + 1 + length;
                m.end = s.parse_offset;
                s.state = PgsqlState::ExtendedQuery;
                return parse_extended_query(s);
            }
            b'1' => {
                // ParseComplete: response to an extended query
                m.response_data();
                m.to_export = true;
                s.parse_offset = offset + 1 + length;
                s.state = PgsqlState::GetData;
                return self.parse_message_data(s);
            }
            t if pgsql_valid_type(t) => {
                trace!("pgsql: skipping frame {}", t as char);
                m.to_export = false;
            }
            t => {
                debug!("pgsql: invalid frame type 0x{:02x}", t);
                return ParseStep::Invalid;
            }
        }
        s.parse_offset = offset + 1 + length;
        m.end = s.parse_offset;
        ParseStep::Complete
    }

    fn parse_message_data(&self, s: &mut Stream<PgsqlState, PgsqlMessage>) -> ParseStep {
        // RowDescription, zero or more DataRow, CommandComplete
        loop {
            let (typ, length) = match next_frame(s) {
                Frame::Invalid => return ParseStep::Invalid,
                Frame::NeedMore => return ParseStep::NeedMore,
                Frame::Ready { typ, length } => (typ, length),
            };
            let offset = s.parse_offset;
            let body = &s.data[offset + 5..offset + 1 + length];
            let m = message(&mut s.message);
            let next = offset + 1 + length;
            match typ {
                b'D' => {
                    if let Err(e) = self.parse_data_row(body, m.response_data()) {
                        debug!("pgsql: invalid data row: {}", e);
                        return ParseStep::Invalid;
                    }
                    s.parse_offset = next;
                }
                b'C' | b'I' => {
                    if typ == b'C' {
                        match pgsql_string(body) {
                            Some(tag) => trace!("CommandComplete tag={}", tag),
                            None => return ParseStep::Invalid,
                        }
                    }
                    s.parse_offset = next;
                    m.end = next;
                    s.state = PgsqlState::Start;
                    return ParseStep::Complete;
                }
                b'E' => {
                    m.response_data().error = Some(parse_error(body));
                    s.parse_offset = next;
                    m.end = next;
                    s.state = PgsqlState::Start;
                    return ParseStep::Complete;
                }
                b'T' => {
                    if let Err(e) = parse_fields(body, m.response_data()) {
                        debug!("pgsql: parse_fields failed: {}", e);
                        return ParseStep::Invalid;
                    }
                    s.parse_offset = next;
                }
                b'2' | b'n' | b't' => {
                    // BindComplete, NoData, ParameterDescription
                    s.parse_offset = next;
                }
                t => {
                    warn!(
                        "pgsql parser expected data message, but received frame of type 0x{:02x}",
                        t
                    );
                    return ParseStep::Invalid;
                }
            }
        }
    }

    fn parse_data_row(&self, body: &[u8], data: &mut ResponseData) -> Result<(), &'static str> {
        let count = read_u16(body, 0).ok_or("empty data row")? as usize;
        let mut off = 2;
        let mut row = Vec::with_capacity(count);
        let mut row_length = 0;
        for i in 0..count {
            let column_length = read_u32(body, off).ok_or("data row buffer too short")? as i32;
            off += 4;
            let mut value: &[u8] = &[];
            if column_length > 0 {
                let column_length = column_length as usize;
                value = body
                    .get(off..off + column_length)
                    .ok_or("invalid column length")?;
                off += column_length;
            }
            let text = data.fields_format.get(i).map_or(true, |&f| f == 0);
            if !text {
                value = &[];
            }
            if row_length < self.max_row_length {
                let keep = value.len().min(self.max_row_length - row_length);
                row.push(String::from_utf8_lossy(&value[..keep]).into_owned());
                row_length += keep;
            }
        }
        if off < body.len() {
            return Err("field count too small for data row");
        }
        data.num_rows += 1;
        if data.rows.len() < self.max_rows {
            data.rows.push(row);
        }
        Ok(())
    }
}

fn parse_fields(body: &[u8], data: &mut ResponseData) -> Result<(), &'static str> {
    let count = read_u16(body, 0).ok_or("empty fields buffer")? as usize;
    let mut off = 2;
    let mut fields = Vec::with_capacity(count);
    let mut formats = Vec::with_capacity(count);
    for _ in 0..count {
        let (name, consumed) = body
            .get(off..)
            .and_then(read_cstring)
            .ok_or("can not read column field")?;
        fields.push(name.into_owned());
        // table OID, column index, type OID, column length, type modifier
        off += consumed + 4 + 2 + 4 + 2 + 4;
        let format = read_u16(body, off).ok_or("field buffer too short for field count")?;
        formats.push(format);
        off += 2;
    }
    if off < body.len() {
        return Err("field count too small for field buffer");
    }
    trace!("pgsql fields: {:?}", fields);
    data.num_fields = count;
    data.fields = fields;
    data.fields_format = formats;
    Ok(())
}

fn parse_error(body: &[u8]) -> ErrorInfo {
    let mut info = ErrorInfo::default();
    let mut off = 0;
    while off < body.len() {
        let typ = body[off];
        if typ == 0 {
            break;
        }
        let (value, consumed) = match read_cstring(&body[off + 1..]) {
            Some(v) => v,
            None => {
                debug!("pgsql: failed to read error field");
                break;
            }
        };
        match typ {
            b'M' => info.message = value.into_owned(),
            b'C' => info.code = value.into_owned(),
            b'S' => info.severity = value.into_owned(),
            _ => (),
        }
        off += consumed + 1;
    }
    trace!("pgsql error: {} {} {}", info.severity, info.code, info.message);
    info
}

fn parse_extended_query(s: &mut Stream<PgsqlState, PgsqlMessage>) -> ParseStep {
    // Parse, Bind, Describe, Execute, Sync
    loop {
        let (typ, length) = match next_frame(s) {
            Frame::Invalid => return ParseStep::Invalid,
            Frame::NeedMore => return ParseStep::NeedMore,
            Frame::Ready { typ, length } => (typ, length),
        };
        let next = s.parse_offset + 1 + length;
        match typ {
            b'B' | b'D' | b'E' | b'C' | b'H' => {
                s.parse_offset = next;
            }
            b'S' => {
                s.parse_offset = next;
                message(&mut s.message).end = next;
                s.state = PgsqlState::Start;
                return ParseStep::Complete;
            }
            t => {
                warn!(
                    "pgsql parser expected extended query message, but received frame of type 0x{:02x}",
                    t
                );
                return ParseStep::Invalid;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(typ: u8, body: &[u8]) -> Vec<u8> {
        let mut v = vec![typ];
        v.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
        v.extend_from_slice(body);
        v
    }

    fn parser() -> PgsqlParser {
        PgsqlParser {
            max_rows: 2,
            max_row_length: 8,
        }
    }

    fn stream(data: &[u8]) -> PgsqlStream {
        let mut s = PgsqlStream::default();
        s.buf.append(data, 1 << 20);
        s
    }

    fn row_description(names: &[&str]) -> Vec<u8> {
        let mut body = (names.len() as u16).to_be_bytes().to_vec();
        for name in names {
            body.extend_from_slice(name.as_bytes());
            body.push(0);
            body.extend_from_slice(&[0u8; 18]);
            body.extend_from_slice(&0u16.to_be_bytes());
        }
        frame(b'T', &body)
    }

    fn data_row(values: &[&str]) -> Vec<u8> {
        let mut body = (values.len() as u16).to_be_bytes().to_vec();
        for v in values {
            body.extend_from_slice(&(v.len() as u32).to_be_bytes());
            body.extend_from_slice(v.as_bytes());
        }
        frame(b'D', &body)
    }

    #[test]
    fn simple_query() {
        let mut s = stream(&frame(b'Q', b"SELECT 1\0"));
        assert_eq!(parser().parse_step(&mut s, Duration::default()), ParseStep::Complete);
        let m = s.buf.message.as_ref().expect("message");
        assert_eq!(
            m.kind,
            MessageKind::Request {
                query: "SELECT 1".into()
            }
        );
        assert!(m.to_export);
        assert_eq!(m.size(), 14);
    }

    #[test]
    fn rows_with_limits() {
        let mut data = row_description(&["id", "name"]);
        data.extend(data_row(&["1", "alice_long_name"]));
        data.extend(data_row(&["2", "bob"]));
        data.extend(data_row(&["3", "carol"]));
        data.extend(frame(b'C', b"SELECT 3\0"));
        let mut s = stream(&data[..20]);
        let p = parser();
        assert_eq!(p.parse_step(&mut s, Duration::default()), ParseStep::NeedMore);
        s.buf.append(&data[20..], 1 << 20);
        assert_eq!(p.parse_step(&mut s, Duration::default()), ParseStep::Complete);
        let m = s.buf.message.as_ref().expect("message");
        match &m.kind {
            MessageKind::Response(r) => {
                assert_eq!(r.fields, vec!["id", "name"]);
                assert_eq!(r.num_rows, 3);
                assert_eq!(r.num_fields, 2);
                assert_eq!(r.rows.len(), 2);
                // row length is limited to 8 bytes
                assert_eq!(r.rows[0], vec!["1", "alice_l"]);
                assert!(r.error.is_none());
            }
            k => panic!("unexpected message {:?}", k),
        }
        assert_eq!(m.end, data.len());
    }

    #[test]
    fn error_response() {
        let mut s = stream(&frame(
            b'E',
            b"SERROR\0C42P01\0Mrelation \"foo\" does not exist\0\0",
        ));
        assert_eq!(parser().parse_step(&mut s, Duration::default()), ParseStep::Complete);
        match &s.buf.message.as_ref().expect("message").kind {
            MessageKind::Response(r) => {
                let e = r.error.as_ref().expect("error");
                assert_eq!(e.code, "42P01");
                assert_eq!(e.severity, "ERROR");
                assert_eq!(e.message, "relation \"foo\" does not exist");
            }
            k => panic!("unexpected message {:?}", k),
        }
    }

    #[test]
    fn invalid_type_and_length() {
        let mut s = stream(&frame(b'x', b"abc"));
        assert_eq!(parser().parse_step(&mut s, Duration::default()), ParseStep::Invalid);
        let mut s = stream(&[b'Q', 0, 0, 0, 2, 0]);
        assert_eq!(parser().parse_step(&mut s, Duration::default()), ParseStep::Invalid);
    }

    #[test]
    fn ssl_and_startup() {
        let mut data = 8u32.to_be_bytes().to_vec();
        data.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
        let mut s = stream(&data[..6]);
        let p = parser();
        assert_eq!(p.parse_step(&mut s, Duration::default()), ParseStep::NeedMore);
        s.buf.append(&data[6..], 1 << 20);
        assert_eq!(p.parse_step(&mut s, Duration::default()), ParseStep::Complete);
        assert_eq!(
            s.buf.message.as_ref().map(|m| &m.kind),
            Some(&MessageKind::SslRequest)
        );

        // startup message is skipped, query is parsed
        let mut startup = 16u32.to_be_bytes().to_vec();
        startup.extend_from_slice(&STARTUP_MESSAGE_CODE.to_be_bytes());
        startup.extend_from_slice(b"user\0me\0");
        startup.extend(frame(b'Q', b"BEGIN\0"));
        let mut s = stream(&startup);
        assert_eq!(p.parse_step(&mut s, Duration::default()), ParseStep::Complete);
        assert_eq!(
            s.buf.message.as_ref().map(|m| &m.kind),
            Some(&MessageKind::Request {
                query: "BEGIN".into()
            })
        );

        let mut s = stream(b"N");
        s.expect_ssl_response = true;
        assert_eq!(p.parse_step(&mut s, Duration::default()), ParseStep::Complete);
        assert_eq!(
            s.buf.message.as_ref().map(|m| &m.kind),
            Some(&MessageKind::SslResponse)
        );
    }

    #[test]
    fn extended_query() {
        let mut req = frame(b'P', b"\0SELECT * FROM t WHERE id = $1\0\0\0");
        req.extend(frame(b'B', b"\0\0\0\0\0\0\0\0"));
        req.extend(frame(b'D', b"P\0"));
        req.extend(frame(b'E', b"\0\0\0\0\0"));
        let mut s = stream(&req);
        let p = parser();
        assert_eq!(p.parse_step(&mut s, Duration::default()), ParseStep::NeedMore);
        assert!(s.buf.message.as_ref().is_some_and(|m| m.has_enough_data()));
        s.buf.append(&frame(b'S', b""), 1 << 20);
        assert_eq!(p.parse_step(&mut s, Duration::default()), ParseStep::Complete);
        let m = s.buf.message.as_ref().expect("message");
        assert!(m.to_export);
        assert_eq!(
            m.kind,
            MessageKind::Request {
                query: "SELECT * FROM t WHERE id = $1".into()
            }
        );

        let mut resp = frame(b'1', b"");
        resp.extend(frame(b'2', b""));
        resp.extend(row_description(&["v"]));
        resp.extend(data_row(&["42"]));
        resp.extend(frame(b'C', b"SELECT 1\0"));
        let mut s = stream(&resp);
        assert_eq!(p.parse_step(&mut s, Duration::default()), ParseStep::Complete);
        match &s.buf.message.as_ref().expect("message").kind {
            MessageKind::Response(r) => assert_eq!(r.rows, vec![vec!["42".to_string()]]),
            k => panic!("unexpected message {:?}", k),
        }
    }
}
