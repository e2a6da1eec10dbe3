//! Key/value map with per-entry expiration, driven by the capture clock
//!
//! Expired entries are removed either lazily, when accessed, or by a call to
//! [`ExpiringMap::sweep`]. The map never reads the system clock: all
//! operations take the current capture time as argument.

use fnv::FnvHashMap;
use libpcap_tools::Duration;
use std::collections::BTreeMap;
use std::hash::Hash;

struct Slot<V> {
    value: V,
    ttl: Duration,
    deadline: Duration,
    token: u64,
}

pub struct ExpiringMap<K, V> {
    entries: FnvHashMap<K, Slot<V>>,
    /// Index of entries, ordered by deadline. The token makes keys unique and
    /// identifies the current slot of the entry.
    deadlines: BTreeMap<(Duration, u64), K>,
    ttl: Duration,
    next_token: u64,
}

impl<K, V> ExpiringMap<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Create a map where entries live for `ttl` after their last insert or touch
    pub fn new(ttl: Duration) -> Self {
        ExpiringMap {
            entries: FnvHashMap::default(),
            deadlines: BTreeMap::new(),
            ttl,
            next_token: 0,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn schedule(&mut self, key: K, deadline: Duration) -> u64 {
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        self.deadlines.insert((deadline, token), key);
        token
    }

    /// Insert an entry using the default TTL, returning the previous value if any
    pub fn insert(&mut self, key: K, value: V, now: Duration) -> Option<V> {
        let ttl = self.ttl;
        self.insert_with_ttl(key, value, ttl, now)
    }

    pub fn insert_with_ttl(&mut self, key: K, value: V, ttl: Duration, now: Duration) -> Option<V> {
        let deadline = now + ttl;
        let token = self.schedule(key.clone(), deadline);
        let slot = Slot {
            value,
            ttl,
            deadline,
            token,
        };
        let old = self.entries.insert(key, slot)?;
        self.deadlines.remove(&(old.deadline, old.token));
        if old.deadline < now {
            None
        } else {
            Some(old.value)
        }
    }

    /// Remove the entry if it has expired at `now`
    fn expire_entry(&mut self, key: &K, now: Duration) {
        let expired = matches!(self.entries.get(key), Some(slot) if slot.deadline < now);
        if expired {
            self.remove(key);
        }
    }

    pub fn get(&mut self, key: &K, now: Duration) -> Option<&V> {
        self.expire_entry(key, now);
        self.entries.get(key).map(|slot| &slot.value)
    }

    pub fn get_mut(&mut self, key: &K, now: Duration) -> Option<&mut V> {
        self.expire_entry(key, now);
        self.entries.get_mut(key).map(|slot| &mut slot.value)
    }

    /// Extend the lifetime of an entry, as if it was inserted at `now`
    ///
    /// Returns false if the entry does not exist or has already expired.
    pub fn touch(&mut self, key: &K, now: Duration) -> bool {
        self.expire_entry(key, now);
        let token = self.next_token;
        let (old, deadline) = match self.entries.get_mut(key) {
            Some(slot) => {
                let old = (slot.deadline, slot.token);
                slot.deadline = now + slot.ttl;
                slot.token = token;
                (old, slot.deadline)
            }
            None => return false,
        };
        self.deadlines.remove(&old);
        self.schedule(key.clone(), deadline);
        true
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.entries.remove(key)?;
        self.deadlines.remove(&(slot.deadline, slot.token));
        Some(slot.value)
    }

    /// Remove all entries expired at `now`, oldest first
    pub fn sweep(&mut self, now: Duration) -> Vec<(K, V)> {
        let mut evicted = Vec::new();
        while let Some(entry) = self.deadlines.first_entry() {
            let (deadline, token) = *entry.key();
            if deadline >= now {
                break;
            }
            let key = entry.remove();
            let current = matches!(self.entries.get(&key), Some(slot) if slot.token == token);
            if current {
                if let Some(slot) = self.entries.remove(&key) {
                    evicted.push((key, slot.value));
                }
            }
        }
        evicted
    }

    /// Remove the entry with the closest deadline, expired or not
    pub fn evict_oldest(&mut self) -> Option<(K, V)> {
        while let Some(((_, token), key)) = self.deadlines.pop_first() {
            let current = matches!(self.entries.get(&key), Some(slot) if slot.token == token);
            if current {
                return self.entries.remove(&key).map(|slot| (key, slot.value));
            }
        }
        None
    }

    /// Iterate over all entries, including expired ones not yet swept
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.entries.iter_mut().map(|(k, slot)| (k, &mut slot.value))
    }

    /// Remove all entries
    pub fn drain(&mut self) -> Vec<(K, V)> {
        self.deadlines.clear();
        self.entries
            .drain()
            .map(|(k, slot)| (k, slot.value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::ExpiringMap;
    use libpcap_tools::Duration;

    fn ts(secs: u32) -> Duration {
        Duration::from_secs(secs)
    }

    #[test]
    fn lazy_expiry_on_access() {
        let mut m = ExpiringMap::new(ts(10));
        m.insert("a", 1, ts(100));
        assert_eq!(m.get(&"a", ts(110)), Some(&1));
        assert_eq!(m.get(&"a", Duration::new(110, 1)), None);
        assert!(m.is_empty());
    }

    #[test]
    fn sweep_evicts_oldest_first() {
        let mut m = ExpiringMap::new(ts(10));
        m.insert("b", 2, ts(105));
        m.insert("a", 1, ts(100));
        m.insert_with_ttl("c", 3, ts(60), ts(100));
        let evicted = m.sweep(ts(120));
        assert_eq!(evicted, vec![("a", 1), ("b", 2)]);
        assert_eq!(m.len(), 1);
        assert!(m.sweep(ts(130)).is_empty());
    }

    #[test]
    fn touch_and_reinsert_move_deadline() {
        let mut m = ExpiringMap::new(ts(10));
        m.insert("a", 1, ts(100));
        assert!(m.touch(&"a", ts(108)));
        assert!(m.sweep(ts(115)).is_empty());
        assert_eq!(m.insert("a", 5, ts(115)), Some(1));
        assert!(m.sweep(ts(120)).is_empty());
        assert_eq!(m.sweep(ts(126)), vec![("a", 5)]);
        assert!(!m.touch(&"a", ts(126)));
    }

    #[test]
    fn remove_and_get_mut() {
        let mut m = ExpiringMap::new(ts(10));
        m.insert(1u32, vec![1u8], ts(0));
        if let Some(v) = m.get_mut(&1, ts(1)) {
            v.push(2);
        }
        assert_eq!(m.remove(&1), Some(vec![1, 2]));
        assert!(m.sweep(ts(100)).is_empty());
    }
}
