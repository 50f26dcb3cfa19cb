//! Local key-value store where the record with the latest expiration wins.

use std::num::NonZeroUsize;

use bytes::Bytes;
use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::common::{DhtTime, Id};

/// Default maximum number of records kept by [LocalStorage].
pub const MAX_VALUES: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A value together with the time it stops being valid.
pub struct StoredValue {
    pub value: Bytes,
    pub expiration_time: DhtTime,
}

impl StoredValue {
    pub fn new(value: Bytes, expiration_time: DhtTime) -> Self {
        Self {
            value,
            expiration_time,
        }
    }
}

#[derive(Debug)]
/// In memory records, one per key.
///
/// Conflicts are resolved by expiration time alone: a write is accepted only
/// if it expires strictly later than what is already stored. Expired records
/// are never returned and are dropped lazily.
///
/// Live records are never evicted: once full, expired records are dropped to
/// make room, and writes for new keys are rejected if none expired.
pub struct LocalStorage {
    values: LruCache<Id, StoredValue>,
}

impl LocalStorage {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            values: LruCache::new(capacity),
        }
    }

    /// Store `value` under `key` unless a record expiring at the same time or
    /// later is already held, or the store is full of records still valid at `now`.
    ///
    /// Returns `true` if the write was accepted.
    pub fn put(
        &mut self,
        key: Id,
        value: Bytes,
        expiration_time: DhtTime,
        now: DhtTime,
    ) -> bool {
        if expiration_time.is_nan() {
            return false;
        }

        match self.values.peek(&key) {
            Some(existing) if existing.expiration_time >= expiration_time => return false,
            Some(_) => {}
            None => {
                if self.values.len() >= self.values.cap().get() {
                    self.remove_expired(now);
                }

                if self.values.len() >= self.values.cap().get() {
                    return false;
                }
            }
        }

        self.values.put(key, StoredValue::new(value, expiration_time));

        true
    }

    /// Returns the record for `key` if it is still valid at `now`.
    pub fn get(&mut self, key: &Id, now: DhtTime) -> Option<StoredValue> {
        let expired = match self.values.get(key) {
            Some(stored) if stored.expiration_time > now => return Some(stored.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.values.pop(key);
        }

        None
    }

    /// Drop every record that expired before `now`.
    pub fn remove_expired(&mut self, now: DhtTime) -> usize {
        let expired = self
            .values
            .iter()
            .filter(|(_, stored)| stored.expiration_time <= now)
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();

        for key in &expired {
            self.values.pop(key);
        }

        expired.len()
    }

    /// Number of records held, including expired ones not yet dropped.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Default for LocalStorage {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(MAX_VALUES).unwrap_or(NonZeroUsize::MIN))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn put_then_get() {
        let mut storage = LocalStorage::default();
        let key = Id::random();

        assert!(storage.put(key, "v".into(), 100.0, 0.0));
        assert_eq!(
            storage.get(&key, 99.0),
            Some(StoredValue::new("v".into(), 100.0))
        );
    }

    #[test]
    fn lower_expiration_is_rejected() {
        let mut storage = LocalStorage::default();
        let key = Id::random();

        assert!(storage.put(key, "v1".into(), 100.0, 0.0));
        assert!(!storage.put(key, "v2".into(), 50.0, 0.0));

        assert_eq!(
            storage.get(&key, 0.0),
            Some(StoredValue::new("v1".into(), 100.0))
        );
    }

    #[test]
    fn equal_expiration_is_rejected() {
        let mut storage = LocalStorage::default();
        let key = Id::random();

        assert!(storage.put(key, "v1".into(), 100.0, 0.0));
        assert!(!storage.put(key, "v2".into(), 100.0, 0.0));

        assert_eq!(storage.get(&key, 0.0).unwrap().value, Bytes::from("v1"));
    }

    #[test]
    fn latest_expiration_wins_regardless_of_order() {
        let writes = [("a", 10.0), ("b", 30.0), ("c", 20.0)];

        let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

        for order in orders {
            let mut storage = LocalStorage::default();
            let key = Id::random();

            for index in order {
                let (value, expiration_time) = writes[index];
                storage.put(key, value.into(), expiration_time, 0.0);
            }

            assert_eq!(
                storage.get(&key, 0.0),
                Some(StoredValue::new("b".into(), 30.0))
            );
        }
    }

    #[test]
    fn never_returns_expired() {
        let mut storage = LocalStorage::default();
        let key = Id::random();

        storage.put(key, "v".into(), 100.0, 0.0);

        assert!(storage.get(&key, 100.0).is_none());
        assert!(storage.get(&key, 150.0).is_none());
    }

    #[test]
    fn expired_records_are_dropped() {
        let mut storage = LocalStorage::default();

        storage.put(Id::random(), "old".into(), 10.0, 0.0);
        storage.put(Id::random(), "old".into(), 20.0, 0.0);
        storage.put(Id::random(), "fresh".into(), 1000.0, 0.0);

        assert_eq!(storage.remove_expired(50.0), 2);
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn nan_is_rejected() {
        let mut storage = LocalStorage::default();

        assert!(!storage.put(Id::random(), "v".into(), f64::NAN, 0.0));
        assert!(storage.is_empty());
    }

    #[test]
    fn bounded_capacity() {
        let mut storage = LocalStorage::new(NonZeroUsize::new(2).unwrap());

        assert!(storage.put(Id::random(), "v".into(), 100.0, 0.0));
        assert!(storage.put(Id::random(), "v".into(), 100.0, 0.0));

        for _ in 0..3 {
            assert!(!storage.put(Id::random(), "v".into(), 100.0, 0.0));
        }

        assert_eq!(storage.len(), 2);
    }

    #[test]
    fn full_store_keeps_live_records() {
        let mut storage = LocalStorage::new(NonZeroUsize::new(2).unwrap());
        let key = Id::random();

        assert!(storage.put(key, "v1".into(), 1e12, 0.0));
        storage.put(Id::random(), "other".into(), 1e12, 0.0);
        storage.put(Id::random(), "other".into(), 1e12, 0.0);

        assert!(!storage.put(key, "v2".into(), 1e11, 0.0));
        assert_eq!(
            storage.get(&key, 0.0),
            Some(StoredValue::new("v1".into(), 1e12))
        );
    }

    #[test]
    fn full_store_drops_expired_to_make_room() {
        let mut storage = LocalStorage::new(NonZeroUsize::new(2).unwrap());
        let live = Id::random();
        let new = Id::random();

        storage.put(live, "live".into(), 1000.0, 0.0);
        storage.put(Id::random(), "old".into(), 10.0, 0.0);

        assert!(storage.put(new, "new".into(), 1000.0, 50.0));
        assert_eq!(storage.len(), 2);
        assert!(storage.get(&live, 50.0).is_some());
        assert!(storage.get(&new, 50.0).is_some());
    }
}
