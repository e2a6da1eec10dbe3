//! Application protocols
//!
//! Each protocol provides a stream parser (one per connection direction)
//! and owns a transaction store. The set of protocols is closed: adding a
//! protocol means adding a variant to [`Protocol`] and [`ConnectionState`].

pub mod mongodb;
pub mod pgsql;

use crate::publisher::Publisher;
use crate::stream::Direction;
use crate::transaction::StoreStats;
use libpcap_tools::{Config, Duration, Error, FiveTuple, Packet};
use std::sync::Arc;
use tracing::{info, warn};

use self::mongodb::{MongodbConnection, MongodbProtocol};
use self::pgsql::{PgsqlConnection, PgsqlProtocol};

const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_STREAM_SIZE: usize = 10 * 1024 * 1024;

/// Settings shared by all protocols, read from `protocols.<name>`
#[derive(Clone, Debug)]
pub struct ProtocolConfig {
    pub enabled: bool,
    /// TCP ports, by order of preference
    pub ports: Vec<u16>,
    pub udp_ports: Vec<u16>,
    /// Include the request body in events
    pub send_request: bool,
    /// Include the response body in events
    pub send_response: bool,
    pub transaction_timeout: Duration,
    /// Maximum amount of buffered data per direction (`tcp.max_stream_size`)
    pub max_stream_size: usize,
}

impl ProtocolConfig {
    pub fn from_config(
        config: &Config,
        prefix: &str,
        default_ports: &[u16],
    ) -> Result<Self, Error> {
        let key = |k: &str| format!("{}.{}", prefix, k);
        Ok(ProtocolConfig {
            enabled: config.get_bool(key("enabled")).unwrap_or(true),
            ports: config
                .get_u16_list(key("ports"))
                .unwrap_or_else(|| default_ports.to_vec()),
            udp_ports: config.get_u16_list(key("udp_ports")).unwrap_or_default(),
            send_request: config.get_bool(key("send_request")).unwrap_or(false),
            send_response: config.get_bool(key("send_response")).unwrap_or(false),
            transaction_timeout: config
                .get_secs(key("transaction_timeout"))?
                .unwrap_or(DEFAULT_TRANSACTION_TIMEOUT),
            max_stream_size: config
                .get_usize("tcp.max_stream_size")
                .unwrap_or(DEFAULT_MAX_STREAM_SIZE),
        })
    }
}

/// Protocol-specific state of one connection
#[derive(Debug)]
pub enum ConnectionState {
    Pgsql(Box<PgsqlConnection>),
    Mongodb(Box<MongodbConnection>),
}

/// A protocol analyzer
///
/// Cloning a protocol is cheap: clones share the same transaction store.
/// [`Protocol::fork`] gives a copy with its own store.
#[derive(Clone)]
pub enum Protocol {
    Pgsql(PgsqlProtocol),
    Mongodb(MongodbProtocol),
}

macro_rules! with_state {
    ($self:ident, $state:ident, $p:ident, $c:ident => $e:expr, $default:expr) => {
        match ($self, $state) {
            (Protocol::Pgsql($p), ConnectionState::Pgsql($c)) => $e,
            (Protocol::Mongodb($p), ConnectionState::Mongodb($c)) => $e,
            (p, _) => {
                warn!("{}: connection state belongs to another protocol", p.name());
                $default
            }
        }
    };
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Pgsql(_) => "pgsql",
            Protocol::Mongodb(_) => "mongodb",
        }
    }

    fn config(&self) -> &ProtocolConfig {
        match self {
            Protocol::Pgsql(p) => p.config(),
            Protocol::Mongodb(p) => p.config(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config().enabled
    }

    /// TCP ports, by order of preference
    pub fn ports(&self) -> &[u16] {
        &self.config().ports
    }

    pub fn udp_ports(&self) -> &[u16] {
        &self.config().udp_ports
    }

    /// Idle time after which connection and transaction state is dropped
    pub fn connection_timeout(&self) -> Duration {
        self.config().transaction_timeout
    }

    /// Create the state of a new connection
    pub fn new_connection(&self) -> ConnectionState {
        match self {
            Protocol::Pgsql(_) => ConnectionState::Pgsql(Box::default()),
            Protocol::Mongodb(_) => ConnectionState::Mongodb(Box::default()),
        }
    }

    /// Parse the payload of a TCP segment
    pub fn parse(&self, state: &mut ConnectionState, pkt: &Packet, dir: Direction) {
        with_state!(self, state, p, c => p.parse(c, pkt, dir), ())
    }

    /// Handle bytes lost in one direction. Returns true if the connection state should be dropped
    pub fn gap_in_stream(
        &self,
        state: &mut ConnectionState,
        tuple: &FiveTuple,
        dir: Direction,
        nbytes: usize,
    ) -> bool {
        with_state!(self, state, p, c => p.gap_in_stream(c, tuple, dir, nbytes), true)
    }

    pub fn received_fin(&self, state: &mut ConnectionState, tuple: &FiveTuple, dir: Direction) {
        with_state!(self, state, p, c => p.received_fin(c, tuple, dir), ())
    }

    /// Parse a UDP datagram
    pub fn parse_udp(&self, pkt: &Packet) {
        match self {
            Protocol::Pgsql(p) => p.parse_udp(pkt),
            Protocol::Mongodb(p) => p.parse_udp(pkt),
        }
    }

    /// Evict expired transactions. Returns the number of evicted transactions
    pub fn expire(&self, now: Duration) -> usize {
        match self {
            Protocol::Pgsql(p) => p.expire(now),
            Protocol::Mongodb(p) => p.expire(now),
        }
    }

    /// Number of connections with pending transactions
    pub fn pending(&self) -> usize {
        match self {
            Protocol::Pgsql(p) => p.store().len(),
            Protocol::Mongodb(p) => p.store().len(),
        }
    }

    pub fn store_stats(&self) -> StoreStats {
        match self {
            Protocol::Pgsql(p) => p.store().stats(),
            Protocol::Mongodb(p) => p.store().stats(),
        }
    }

    /// Same protocol and settings, with an empty transaction store
    ///
    /// Analyzers running on separate capture clocks must not share stores.
    pub fn fork(&self) -> Protocol {
        match self {
            Protocol::Pgsql(p) => Protocol::Pgsql(p.fork()),
            Protocol::Mongodb(p) => Protocol::Mongodb(p.fork()),
        }
    }
}

/// Build the set of enabled protocols
///
/// Returns an error if a protocol setting is invalid.
pub fn build_protocols(
    config: &Config,
    publisher: Arc<dyn Publisher>,
) -> Result<Vec<Protocol>, Error> {
    let all = vec![
        Protocol::Pgsql(PgsqlProtocol::new(config, publisher.clone())?),
        Protocol::Mongodb(MongodbProtocol::new(config, publisher)?),
    ];
    let protocols = all
        .into_iter()
        .filter(|p| {
            if p.enabled() {
                info!(
                    "Protocol {}: tcp ports {:?}, udp ports {:?}",
                    p.name(),
                    p.ports(),
                    p.udp_ports()
                );
            }
            p.enabled()
        })
        .collect();
    Ok(protocols)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::NullPublisher;

    #[test]
    fn protocol_config() {
        let mut config = Config::default();
        config.set("protocols.pgsql.ports", vec![5432, 5433]).expect("set");
        config.set("protocols.pgsql.send_request", true).expect("set");
        config.set("protocols.pgsql.transaction_timeout", 2).expect("set");
        config.set("tcp.max_stream_size", 1000).expect("set");
        let c =
            ProtocolConfig::from_config(&config, "protocols.pgsql", &[1]).expect("config");
        assert!(c.enabled);
        assert_eq!(c.ports, vec![5432, 5433]);
        assert!(c.send_request);
        assert!(!c.send_response);
        assert_eq!(c.transaction_timeout, Duration::from_secs(2));
        assert_eq!(c.max_stream_size, 1000);
        let c = ProtocolConfig::from_config(&config, "protocols.mongodb", &[27017])
            .expect("config");
        assert_eq!(c.ports, vec![27017]);
        assert!(c.udp_ports.is_empty());
        assert_eq!(c.transaction_timeout, DEFAULT_TRANSACTION_TIMEOUT);
    }

    #[test]
    fn disabled_protocols() {
        let mut config = Config::default();
        config.set("protocols.mongodb.enabled", false).expect("set");
        let protocols = build_protocols(&config, Arc::new(NullPublisher)).expect("protocols");
        let names: Vec<_> = protocols.iter().map(Protocol::name).collect();
        assert_eq!(names, vec!["pgsql"]);
    }

    #[test]
    fn invalid_transaction_timeout() {
        let mut config = Config::default();
        config.set("protocols.mongodb.transaction_timeout", 1i64 << 33).expect("set");
        assert!(ProtocolConfig::from_config(&config, "protocols.mongodb", &[27017]).is_err());
        assert!(build_protocols(&config, Arc::new(NullPublisher)).is_err());
    }

    #[test]
    fn forked_protocols_have_their_own_store() {
        let protocols =
            build_protocols(&Config::default(), Arc::new(NullPublisher)).expect("protocols");
        let forked: Vec<_> = protocols.iter().map(Protocol::fork).collect();
        for (p, f) in protocols.iter().zip(forked.iter()) {
            assert_eq!(p.name(), f.name());
            assert_eq!(p.ports(), f.ports());
            assert_eq!(p.connection_timeout(), f.connection_timeout());
        }
        if let (Protocol::Pgsql(p), Protocol::Pgsql(f)) = (&protocols[0], &forked[0]) {
            let tuple = FiveTuple::default();
            let txn = pgsql::PgsqlTransaction {
                ts: Duration::from_secs(1),
                tuple: tuple.clone(),
                query: "SELECT 1".to_owned(),
                method: "SELECT".to_owned(),
                bytes_in: 13,
                notes: Vec::new(),
            };
            p.store().on_request(&tuple, txn, Duration::from_secs(1));
            assert_eq!(protocols[0].pending(), 1);
            assert_eq!(forked[0].pending(), 0);
            assert!(f.store().on_response(&tuple, Duration::from_secs(2)).is_none());
            assert_eq!(forked[0].store_stats().unmatched_responses, 1);
            assert_eq!(protocols[0].store_stats().unmatched_responses, 0);
        } else {
            panic!("unexpected protocol order");
        }
    }

    #[test]
    fn state_mismatch_is_ignored() {
        let protocols =
            build_protocols(&Config::default(), Arc::new(NullPublisher)).expect("protocols");
        let mut state = protocols[1].new_connection();
        assert!(matches!(state, ConnectionState::Mongodb(_)));
        let tuple = FiveTuple::default();
        assert!(protocols[0].gap_in_stream(&mut state, &tuple, Direction::Original, 10));
    }
}
