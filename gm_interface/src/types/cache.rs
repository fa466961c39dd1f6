// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use itertools::Itertools;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// A [`BTreeMap`]-backed cache supporting capacity- and duration-based expiry.
///
/// Backs the router's seen-message map, the CRL version cache and the
/// connection ping tracker. Expired entries are invisible to `get` but only
/// reclaimed by `remove_expired`, which the owning component runs from its
/// periodic sweep.
#[derive(Debug)]
pub struct Cache<K, V>
where
    K: Ord + Clone,
{
    items: BTreeMap<K, Entry<V>>,
    item_duration: Option<Duration>,
    capacity: usize,
    next_seq: u64,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    inserted: Instant,
    // insertion order, to break ties when two entries land on the same tick
    seq: u64,
    duration: Option<Duration>,
}

impl<V> Entry<V> {
    fn expired(&self) -> bool {
        self.duration
            .map(|d| self.inserted.elapsed() >= d)
            .unwrap_or(false)
    }
}

#[allow(clippy::len_without_is_empty)]
impl<K, V> Cache<K, V>
where
    K: Ord + Clone,
{
    /// Creating capacity based `Cache`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: BTreeMap::new(),
            item_duration: None,
            capacity,
            next_seq: 0,
        }
    }

    /// Creating time based `Cache`.
    pub fn with_expiry_duration(duration: Duration) -> Self {
        Self {
            items: BTreeMap::new(),
            item_duration: Some(duration),
            capacity: usize::MAX,
            next_seq: 0,
        }
    }

    /// Creating dual-feature capacity and time based `Cache`.
    pub fn with_expiry_duration_and_capacity(duration: Duration, capacity: usize) -> Self {
        Self {
            items: BTreeMap::new(),
            item_duration: Some(duration),
            capacity,
            next_seq: 0,
        }
    }

    /// Returns the number of items in the cache, expired entries included.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if the cache contains no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether a live (non-expired) entry exists for `key`.
    pub fn contains_key(&self, key: &K) -> bool {
        self.items
            .get(key)
            .map(|item| !item.expired())
            .unwrap_or(false)
    }

    /// Get a value from the cache if one is set and not expired.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.items
            .get(key)
            .filter(|item| !item.expired())
            .map(|item| &item.value)
    }

    /// Set a value in the cache and return the previous live value, if any.
    ///
    /// `custom_duration` overrides the cache-wide duration for this entry.
    /// If the new item causes the cache to exceed its capacity, the oldest
    /// entries are removed.
    pub fn insert(&mut self, key: K, value: V, custom_duration: Option<Duration>) -> Option<V> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let replaced = self
            .items
            .insert(
                key,
                Entry {
                    value,
                    inserted: Instant::now(),
                    seq,
                    duration: custom_duration.or(self.item_duration),
                },
            )
            .and_then(|item| (!item.expired()).then(|| item.value));
        self.remove_expired();
        self.drop_excess();
        replaced
    }

    /// Remove expired items from the cache storage.
    pub fn remove_expired(&mut self) {
        let expired_keys: Vec<_> = self
            .items
            .iter()
            .filter(|(_, item)| item.expired())
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired_keys {
            let _prev = self.items.remove(&key);
        }
    }

    /// Remove items that exceed capacity, oldest first.
    fn drop_excess(&mut self) {
        let len = self.len();
        if len > self.capacity {
            let excess = len - self.capacity;
            let excess_keys: Vec<_> = self
                .items
                .iter()
                .sorted_by_key(|(_, item)| item.seq)
                .take(excess)
                .map(|(key, _)| key.clone())
                .collect();
            for key in excess_keys {
                let _prev = self.items.remove(&key);
            }
        }
    }

    /// Keep only the `count` most recently inserted entries.
    pub fn retain_newest(&mut self, count: usize) {
        if self.len() <= count {
            return;
        }
        let keep: Vec<_> = self
            .items
            .iter()
            .sorted_by_key(|(_, item)| std::cmp::Reverse(item.seq))
            .take(count)
            .map(|(key, _)| key.clone())
            .collect();
        self.items.retain(|key, _| keep.contains(key));
    }

    /// Remove an item from the cache, returning the removed value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.items.remove(key).map(|item| item.value)
    }

    /// Keys of all live entries.
    pub fn keys(&self) -> Vec<K> {
        self.items
            .iter()
            .filter(|(_, item)| !item.expired())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Clear the cache, removing all items.
    pub fn clear(&mut self) {
        self.items.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::Cache;
    use std::time::Duration;

    const KEY: &str = "key";
    const VALUE: &str = "VALUE";

    #[test]
    fn set_and_get_value_with_default_duration() {
        let mut cache = Cache::with_expiry_duration(Duration::from_secs(2));
        let _prev = cache.insert(KEY.to_string(), VALUE, None);
        assert_eq!(cache.get(&KEY.to_string()), Some(&VALUE));
    }

    #[test]
    fn set_do_not_get_expired_value() {
        let mut cache = Cache::with_expiry_duration(Duration::from_secs(0));
        let _prev = cache.insert(KEY.to_string(), VALUE, None);
        assert_eq!(cache.get(&KEY.to_string()), None);
        assert!(!cache.contains_key(&KEY.to_string()));
    }

    #[test]
    fn custom_duration_overrides_default() {
        let mut cache = Cache::with_expiry_duration(Duration::from_secs(0));
        let _prev = cache.insert(KEY.to_string(), VALUE, Some(Duration::from_secs(2)));
        assert_eq!(cache.get(&KEY.to_string()), Some(&VALUE));
    }

    #[test]
    fn remove_expired_keeps_live_entries() {
        let mut cache = Cache::with_expiry_duration(Duration::from_secs(2));
        let _prev = cache.insert(KEY.to_string(), VALUE, None);
        cache.remove_expired();
        assert_eq!(cache.get(&KEY.to_string()), Some(&VALUE));
    }

    #[test]
    fn drop_excess_evicts_oldest_first() {
        let mut cache = Cache::with_capacity(1);
        let _prev = cache.insert("a".to_string(), 1, None);
        let _prev = cache.insert("b".to_string(), 2, None);
        assert_eq!(cache.get(&"a".to_string()), None);
        assert_eq!(cache.get(&"b".to_string()), Some(&2));
    }

    #[test]
    fn retain_newest_keeps_most_recent() {
        let mut cache = Cache::with_capacity(usize::MAX);
        for i in 0..10u32 {
            let _prev = cache.insert(format!("key-{i}"), i, None);
        }
        cache.retain_newest(3);
        assert_eq!(cache.len(), 3);
        assert!(cache.contains_key(&"key-9".to_string()));
    }
}
