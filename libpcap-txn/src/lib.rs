//! Passive reconstruction of application transactions from captured packets
//!
//! Frames are decoded ([`Decoder`]), IPv4 fragments reassembled, and TCP/UDP
//! payloads dispatched ([`Demux`]) to protocol stream parsers. Requests and
//! responses are correlated by a per-protocol [`TransactionStore`], and each
//! completed transaction is handed to a [`Publisher`] as a
//! [`TransactionEvent`].

mod analyzer;
pub use analyzer::*;

mod threaded_analyzer;
pub use threaded_analyzer::*;

pub mod decoder;
pub use decoder::{DecodedPacket, Decoder, TransportHeader};

pub mod demux;
pub use demux::{Demux, DemuxStats};

mod error;
pub use error::*;

pub mod event;
pub use event::*;

pub mod expiring_map;

pub mod ip_defrag;
pub use ip_defrag::{DefragEngine, IPDefragEngine};

pub mod layers;

pub mod output;

pub mod protocols;
pub use protocols::{build_protocols, Protocol, ProtocolConfig};

mod publisher;
pub use publisher::*;

pub mod stream;

pub mod transaction;
pub use transaction::{QueuePolicy, StoreStats, TransactionStore};
