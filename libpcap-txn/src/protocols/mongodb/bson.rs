//! Minimal BSON decoder, converting documents to JSON values
//!
//! Types without a JSON equivalent use the MongoDB extended JSON notation
//! (`$oid`, `$date`, ...).

use nom::bytes::complete::{take, take_till};
use nom::error::{Error, ErrorKind};
use nom::number::complete::{le_f64, le_i32, le_i64, le_u32, le_u8};
use nom::{Err, IResult};
use serde_json::{json, Map, Number, Value};

/// Maximum nesting level of documents
pub const MAX_DEPTH: usize = 32;

pub type Document = Map<String, Value>;

fn fail<T>(i: &[u8], kind: ErrorKind) -> IResult<&[u8], T> {
    Err(Err::Error(Error::new(i, kind)))
}

fn hex(b: &[u8]) -> String {
    base16ct::lower::encode_string(b)
}

/// Null-terminated string
pub fn parse_cstring(i: &[u8]) -> IResult<&[u8], String> {
    let (i, s) = take_till(|c| c == 0)(i)?;
    let (i, _) = take(1usize)(i)?;
    Ok((i, String::from_utf8_lossy(s).into_owned()))
}

/// BSON string: length (including the final null byte), then data
fn parse_string(i: &[u8]) -> IResult<&[u8], String> {
    let (i, len) = le_i32(i)?;
    if len < 1 {
        return fail(i, ErrorKind::LengthValue);
    }
    let (i, s) = take(len as usize)(i)?;
    match s.split_last() {
        Some((0, s)) => Ok((i, String::from_utf8_lossy(s).into_owned())),
        _ => fail(i, ErrorKind::Verify),
    }
}

/// Parse a document, returning its fields in order
pub fn parse_document(i: &[u8]) -> IResult<&[u8], Document> {
    parse_document_depth(i, 0)
}

fn parse_document_depth(i: &[u8], depth: usize) -> IResult<&[u8], Document> {
    if depth > MAX_DEPTH {
        return fail(i, ErrorKind::TooLarge);
    }
    let (i, len) = le_i32(i)?;
    if len < 5 {
        return fail(i, ErrorKind::LengthValue);
    }
    let (rem, mut content) = take(len as usize - 4)(i)?;
    let mut doc = Map::new();
    loop {
        let (i, element_type) = le_u8(content)?;
        if element_type == 0 {
            break;
        }
        let (i, key) = parse_cstring(i)?;
        let (i, value) = parse_element(i, element_type, depth)?;
        doc.insert(key, value);
        content = i;
    }
    Ok((rem, doc))
}

fn parse_element(i: &[u8], element_type: u8, depth: usize) -> IResult<&[u8], Value> {
    match element_type {
        0x01 => {
            let (i, f) = le_f64(i)?;
            let v = Number::from_f64(f).map_or_else(|| Value::String(f.to_string()), Value::Number);
            Ok((i, v))
        }
        0x02 => {
            let (i, s) = parse_string(i)?;
            Ok((i, Value::String(s)))
        }
        0x03 => {
            let (i, doc) = parse_document_depth(i, depth + 1)?;
            Ok((i, Value::Object(doc)))
        }
        0x04 => {
            let (i, doc) = parse_document_depth(i, depth + 1)?;
            Ok((i, Value::Array(doc.into_iter().map(|(_, v)| v).collect())))
        }
        0x05 => {
            let (i, len) = le_i32(i)?;
            if len < 0 {
                return fail(i, ErrorKind::LengthValue);
            }
            let (i, subtype) = le_u8(i)?;
            let (i, data) = take(len as usize)(i)?;
            Ok((i, json!({"$binary": hex(data), "$type": format!("{:02x}", subtype)})))
        }
        0x06 | 0x0A => Ok((i, Value::Null)),
        0x07 => {
            let (i, oid) = take(12usize)(i)?;
            Ok((i, json!({ "$oid": hex(oid) })))
        }
        0x08 => {
            let (i, b) = le_u8(i)?;
            Ok((i, Value::Bool(b != 0)))
        }
        0x09 => {
            let (i, d) = le_i64(i)?;
            Ok((i, json!({ "$date": d })))
        }
        0x0B => {
            let (i, pattern) = parse_cstring(i)?;
            let (i, options) = parse_cstring(i)?;
            Ok((i, json!({"$regex": pattern, "$options": options})))
        }
        0x0C => {
            let (i, ns) = parse_string(i)?;
            let (i, oid) = take(12usize)(i)?;
            Ok((i, json!({"$dbPointer": {"$ref": ns, "$id": {"$oid": hex(oid)}}})))
        }
        0x0D => {
            let (i, code) = parse_string(i)?;
            Ok((i, json!({ "$code": code })))
        }
        0x0E => {
            let (i, symbol) = parse_string(i)?;
            Ok((i, json!({ "$symbol": symbol })))
        }
        0x0F => {
            let (i, _total) = le_i32(i)?;
            let (i, code) = parse_string(i)?;
            let (i, scope) = parse_document_depth(i, depth + 1)?;
            Ok((i, json!({"$code": code, "$scope": scope})))
        }
        0x10 => {
            let (i, v) = le_i32(i)?;
            Ok((i, Value::from(v)))
        }
        0x11 => {
            let (i, increment) = le_u32(i)?;
            let (i, timestamp) = le_u32(i)?;
            Ok((i, json!({"$timestamp": {"t": timestamp, "i": increment}})))
        }
        0x12 => {
            let (i, v) = le_i64(i)?;
            Ok((i, Value::from(v)))
        }
        0x13 => {
            let (i, d) = take(16usize)(i)?;
            Ok((i, json!({ "$numberDecimal": hex(d) })))
        }
        0xFF => Ok((i, json!({ "$minKey": 1 }))),
        0x7F => Ok((i, json!({ "$maxKey": 1 }))),
        _ => fail(i, ErrorKind::Switch),
    }
}

/// Parse all documents until the end of input
pub fn parse_documents(mut i: &[u8]) -> IResult<&[u8], Vec<Document>> {
    let mut docs = Vec::new();
    while !i.is_empty() {
        let (rem, doc) = parse_document(i)?;
        docs.push(doc);
        i = rem;
    }
    Ok((i, docs))
}
