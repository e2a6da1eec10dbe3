mod analyzer;
mod config;
mod duration;
mod engine;
mod error;
mod five_tuple;
mod packet;

pub use analyzer::*;
pub use config::Config;
pub use duration::*;
pub use engine::PcapEngine;
pub use error::*;
pub use five_tuple::*;
pub use packet::*;

pub use pcap_parser::Linktype;
