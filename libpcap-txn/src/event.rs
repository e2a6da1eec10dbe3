//! Transaction events, as handed to the publisher

use crate::protocols::mongodb::MongodbDetails;
use crate::protocols::pgsql::PgsqlDetails;
use libpcap_tools::{Duration, FiveTuple};
use serde::Serialize;
use std::net::IpAddr;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum Status {
    #[serde(rename = "OK")]
    Ok,
    Error,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

/// Protocol-specific fields of an event
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Details {
    Pgsql(PgsqlDetails),
    Mongodb(MongodbDetails),
}

/// One completed transaction
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TransactionEvent {
    pub protocol: &'static str,
    /// Timestamp of the request
    pub timestamp: Duration,
    /// Client endpoint (sender of the request)
    pub src: Endpoint,
    /// Server endpoint
    pub dst: Endpoint,
    pub status: Status,
    pub method: String,
    pub resource: String,
    /// Time between the request and the response, in microseconds
    pub response_time_us: u64,
    /// Size of the request, in bytes
    pub bytes_in: usize,
    /// Size of the response, in bytes
    pub bytes_out: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    pub details: Details,
}

impl TransactionEvent {
    /// Build the endpoints of an event from the tuple of the request
    pub fn endpoints(tuple: &FiveTuple) -> (Endpoint, Endpoint) {
        let src = Endpoint {
            ip: tuple.src,
            port: tuple.src_port,
        };
        let dst = Endpoint {
            ip: tuple.dst,
            port: tuple.dst_port,
        };
        (src, dst)
    }
}
