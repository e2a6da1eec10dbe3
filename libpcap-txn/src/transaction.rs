//! Request/response correlation
//!
//! Each protocol owns one [`TransactionStore`]. Pending requests are queued
//! per connection (using the canonical tuple as key) and matched with
//! responses in strict FIFO order.

use crate::expiring_map::ExpiringMap;
use libpcap_tools::{Duration, FiveTuple};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// How a store handles a request when another one is already pending
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueuePolicy {
    /// Requests are appended: multiple outstanding requests are allowed
    Pipelined,
    /// A new request replaces the pending one, with a warning
    SingleOutstanding,
}

struct Pending<T> {
    deadline: Duration,
    txn: T,
}

/// Correlation errors seen by a store
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Responses without a pending request
    pub unmatched_responses: usize,
    /// Requests replaced before their response (single outstanding policy)
    pub dropped_requests: usize,
}

struct StoreInner<T> {
    queues: ExpiringMap<FiveTuple, VecDeque<Pending<T>>>,
    /// Deadline of every queued request, oldest first
    deadlines: BTreeMap<(Duration, u64), FiveTuple>,
    seq: u64,
    stats: StoreStats,
}

impl<T> StoreInner<T> {
    fn new(timeout: Duration) -> Self {
        StoreInner {
            queues: ExpiringMap::new(timeout),
            deadlines: BTreeMap::new(),
            seq: 0,
            stats: StoreStats::default(),
        }
    }

    /// Drop requests from the front of the queue that expired at `now`
    fn prune(queue: &mut VecDeque<Pending<T>>, now: Duration) -> usize {
        let mut n = 0;
        while queue.front().is_some_and(|p| p.deadline < now) {
            queue.pop_front();
            n += 1;
        }
        n
    }

    fn schedule(&mut self, key: FiveTuple, deadline: Duration) {
        self.seq += 1;
        self.deadlines.insert((deadline, self.seq), key);
    }

    /// Prune the queues holding requests expired at `now`
    ///
    /// Entries of requests that were already answered or evicted are
    /// discarded when their deadline passes.
    fn prune_expired(&mut self, now: Duration) -> usize {
        let mut n = 0;
        while let Some(entry) = self.deadlines.first_entry() {
            if entry.key().0 >= now {
                break;
            }
            let key = entry.remove();
            let empty = match self.queues.get_mut(&key, now) {
                Some(queue) => {
                    n += Self::prune(queue, now);
                    queue.is_empty()
                }
                None => false,
            };
            if empty {
                self.queues.remove(&key);
            }
        }
        n
    }
}

/// Pending transactions of a protocol
///
/// Clones share the same pending requests. Use [`TransactionStore::fork`] to
/// get an independent store, for example one per analyzer thread.
pub struct TransactionStore<T> {
    name: &'static str,
    policy: QueuePolicy,
    timeout: Duration,
    inner: Arc<Mutex<StoreInner<T>>>,
}

impl<T> Clone for TransactionStore<T> {
    fn clone(&self) -> Self {
        TransactionStore {
            name: self.name,
            policy: self.policy,
            timeout: self.timeout,
            inner: self.inner.clone(),
        }
    }
}

impl<T> TransactionStore<T> {
    pub fn new(name: &'static str, policy: QueuePolicy, timeout: Duration) -> Self {
        TransactionStore {
            name,
            policy,
            timeout,
            inner: Arc::new(Mutex::new(StoreInner::new(timeout))),
        }
    }

    /// Create an empty store with the same settings
    pub fn fork(&self) -> Self {
        TransactionStore::new(self.name, self.policy, self.timeout)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new request for the connection
    pub fn on_request(&self, tuple: &FiveTuple, txn: T, now: Duration) {
        let key = tuple.canonical();
        let deadline = now + self.timeout;
        let pending = Pending { deadline, txn };
        let mut inner = self.lock();
        match inner.queues.get_mut(&key, now) {
            Some(queue) => {
                StoreInner::prune(queue, now);
                let mut dropped = 0;
                match self.policy {
                    QueuePolicy::Pipelined => queue.push_back(pending),
                    QueuePolicy::SingleOutstanding => {
                        if !queue.is_empty() {
                            warn!(
                                "{}: two requests without a response on {}, dropping the old one",
                                self.name, tuple
                            );
                            dropped = queue.len();
                            queue.clear();
                        }
                        queue.push_back(pending);
                    }
                }
                inner.stats.dropped_requests += dropped;
                inner.queues.touch(&key, now);
            }
            None => {
                let mut queue = VecDeque::with_capacity(1);
                queue.push_back(pending);
                inner.queues.insert(key.clone(), queue, now);
            }
        }
        inner.schedule(key, deadline);
    }

    /// Take the oldest pending request of the connection
    ///
    /// Returns `None` if there is no (non-expired) pending request; it is
    /// counted in [`StoreStats::unmatched_responses`]. The caller is
    /// responsible for reporting the unmatched response.
    pub fn on_response(&self, tuple: &FiveTuple, now: Duration) -> Option<T> {
        let key = tuple.canonical();
        let mut inner = self.lock();
        let (txn, empty) = match inner.queues.get_mut(&key, now) {
            Some(queue) => {
                StoreInner::prune(queue, now);
                let txn = queue.pop_front().map(|p| p.txn);
                (txn, queue.is_empty())
            }
            None => (None, false),
        };
        if empty {
            inner.queues.remove(&key);
        }
        if txn.is_none() {
            inner.stats.unmatched_responses += 1;
        }
        txn
    }

    /// Number of pending requests for the connection
    pub fn pending(&self, tuple: &FiveTuple, now: Duration) -> usize {
        let key = tuple.canonical();
        let mut inner = self.lock();
        match inner.queues.get_mut(&key, now) {
            Some(queue) => {
                StoreInner::prune(queue, now);
                queue.len()
            }
            None => 0,
        }
    }

    /// Evict all requests expired at `now`. Evicted requests are never published.
    ///
    /// Returns the number of evicted requests.
    pub fn sweep(&self, now: Duration) -> usize {
        let mut inner = self.lock();
        let n: usize = inner
            .queues
            .sweep(now)
            .iter()
            .map(|(_, queue)| queue.len())
            .sum();
        // keys kept alive by recent requests may still hold old ones
        n + inner.prune_expired(now)
    }

    pub fn stats(&self) -> StoreStats {
        self.lock().stats
    }

    /// Number of connections with pending requests
    pub fn len(&self) -> usize {
        self.lock().queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn scheduled(&self) -> usize {
        self.lock().deadlines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn tuple() -> FiveTuple {
        FiveTuple {
            proto: 6,
            src: IpAddr::V4(Ipv4Addr::new(192, 168, 0, 10)),
            dst: IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1)),
            src_port: 41000,
            dst_port: 5432,
        }
    }

    #[test]
    fn pipelined_requests_match_in_order() {
        let store = TransactionStore::new("test", QueuePolicy::Pipelined, Duration::from_secs(10));
        let t = tuple();
        store.on_request(&t, "first", Duration::from_secs(1));
        store.on_request(&t, "second", Duration::from_secs(2));
        assert_eq!(store.pending(&t, Duration::from_secs(2)), 2);
        // responses travel in the other direction
        let r = t.get_reverse();
        assert_eq!(store.on_response(&r, Duration::from_secs(3)), Some("first"));
        assert_eq!(store.on_response(&r, Duration::from_secs(3)), Some("second"));
        assert_eq!(store.on_response(&r, Duration::from_secs(3)), None);
        assert!(store.is_empty());
    }

    #[test]
    fn single_outstanding_overwrites() {
        let store = TransactionStore::new(
            "test",
            QueuePolicy::SingleOutstanding,
            Duration::from_secs(10),
        );
        let t = tuple();
        store.on_request(&t, 1, Duration::from_secs(1));
        store.on_request(&t, 2, Duration::from_secs(2));
        assert_eq!(store.pending(&t, Duration::from_secs(2)), 1);
        assert_eq!(store.stats().dropped_requests, 1);
        assert_eq!(store.on_response(&t, Duration::from_secs(3)), Some(2));
        assert_eq!(store.on_response(&t, Duration::from_secs(3)), None);
        assert_eq!(
            store.stats(),
            StoreStats {
                unmatched_responses: 1,
                dropped_requests: 1,
            }
        );
    }

    #[test]
    fn forked_stores_are_independent() {
        let store = TransactionStore::new("test", QueuePolicy::Pipelined, Duration::from_secs(10));
        let fork = store.fork();
        assert_eq!(fork.timeout(), store.timeout());
        let t = tuple();
        store.on_request(&t, 1, Duration::from_secs(85));
        // a fork running ahead in capture time does not evict the request
        assert_eq!(fork.sweep(Duration::from_secs(100)), 0);
        assert_eq!(fork.on_response(&t, Duration::from_secs(100)), None);
        assert_eq!(store.on_response(&t, Duration::from_secs(90)), Some(1));
        assert_eq!(store.stats().unmatched_responses, 0);
        assert_eq!(fork.stats().unmatched_responses, 1);
        // clones share the pending requests
        let clone = store.clone();
        store.on_request(&t, 2, Duration::from_secs(91));
        assert_eq!(clone.pending(&t, Duration::from_secs(91)), 1);
    }

    #[test]
    fn expired_requests_are_evicted() {
        let store = TransactionStore::new("test", QueuePolicy::Pipelined, Duration::from_secs(10));
        let t = tuple();
        store.on_request(&t, 1, Duration::from_secs(0));
        store.on_request(&t, 2, Duration::from_secs(8));
        // first request expired, but the key is kept alive by the second one
        assert_eq!(store.sweep(Duration::from_secs(11)), 1);
        assert_eq!(store.pending(&t, Duration::from_secs(11)), 1);
        assert_eq!(store.sweep(Duration::from_secs(30)), 1);
        assert!(store.is_empty());
        assert_eq!(store.scheduled(), 0);
        // lazy expiry
        store.on_request(&t, 3, Duration::from_secs(40));
        assert_eq!(store.on_response(&t, Duration::from_secs(51)), None);
    }

    #[test]
    fn sweep_only_visits_expired_requests() {
        let store = TransactionStore::new("test", QueuePolicy::Pipelined, Duration::from_secs(10));
        let t = tuple();
        let mut other = tuple();
        other.src_port = 41001;
        store.on_request(&t, 1, Duration::from_secs(0));
        store.on_request(&t, 2, Duration::from_secs(8));
        store.on_request(&other, 3, Duration::from_secs(9));
        assert_eq!(store.on_response(&other, Duration::from_secs(9)), Some(3));
        assert_eq!(store.scheduled(), 3);
        // only the first request expired; the answered one is still scheduled
        assert_eq!(store.sweep(Duration::from_secs(11)), 1);
        assert_eq!(store.scheduled(), 2);
        assert_eq!(store.pending(&t, Duration::from_secs(11)), 1);
        // answered requests are not counted as evicted
        assert_eq!(store.sweep(Duration::from_secs(20)), 1);
        assert_eq!(store.scheduled(), 0);
        assert!(store.is_empty());
    }
}
