//! Per-key value storage with quota accounting and listeners.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::common::{Filter, InfoHash, TypeStore, Value, ValueId};
use crate::messages::ListenId;

/// Values kept under a single key.
pub const MAX_VALUES: usize = 2048;

/// Foreign listeners must refresh within this window.
pub const LISTEN_EXPIRE_TIME: Duration = Duration::from_secs(30);

/// How often a storage checks whether its values still belong here.
pub const MAX_STORAGE_MAINTENANCE_EXPIRE_TIME: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub(crate) struct ValueStorage {
    pub data: Rc<Value>,
    pub time: Instant,
}

/// A remote peer subscribed to updates on a key we hold.
#[derive(Debug, Clone)]
pub(crate) struct Listener {
    pub id: InfoHash,
    pub addr: SocketAddr,
    pub rid: ListenId,
    pub time: Instant,
}

/// A local subscription on a key we hold.
pub(crate) struct LocalListener {
    pub filter: Filter,
    pub get_cb: crate::dht::GetCallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StoreError {
    /// Admitting the value would exceed the storage quota.
    QuotaExceeded,
    /// The key already tracks [MAX_VALUES] values.
    TooManyValues,
    /// The value type's policy refused the store or the overwrite.
    PolicyRefused,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct StoreChange {
    /// Index of the stored value within the storage.
    pub index: usize,
    pub size_delta: isize,
    pub count_delta: isize,
    /// Whether the payload changed, i.e. listeners should hear about it.
    pub changed: bool,
}

pub(crate) struct Storage {
    pub id: InfoHash,
    /// Next time the persistence pass should look at this key.
    pub maintenance_time: Instant,
    pub listeners: Vec<Listener>,
    pub local_listeners: HashMap<usize, LocalListener>,
    values: Vec<ValueStorage>,
    total_size: usize,
}

impl Storage {
    pub fn new(id: InfoHash, now: Instant) -> Storage {
        Storage {
            id,
            maintenance_time: now + MAX_STORAGE_MAINTENANCE_EXPIRE_TIME,
            listeners: Vec::new(),
            local_listeners: HashMap::new(),
            values: Vec::new(),
            total_size: 0,
        }
    }

    // === Getters ===

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn values(&self) -> &[ValueStorage] {
        &self.values
    }

    pub fn get_by_id(&self, vid: ValueId) -> Option<Rc<Value>> {
        self.values
            .iter()
            .find(|v| v.data.id == vid)
            .map(|v| v.data.clone())
    }

    pub fn get(&self, filter: Option<&Filter>) -> Vec<Rc<Value>> {
        self.values
            .iter()
            .filter(|v| filter.map_or(true, |f| f(&v.data)))
            .map(|v| v.data.clone())
            .collect()
    }

    // === Store and expiry ===

    /// Store or refresh a value. `size_left` is how much of the node-wide
    /// quota remains for growth.
    pub fn store(
        &mut self,
        types: &TypeStore,
        value: Rc<Value>,
        created: Instant,
        size_left: isize,
    ) -> Result<StoreChange, StoreError> {
        let vt = types.get(value.value_type);

        if let Some(index) = self.values.iter().position(|v| v.data.id == value.id) {
            if self.values[index].data == value {
                // Same payload: refresh the clock, nobody needs to hear.
                self.values[index].time = created;
                return Ok(StoreChange {
                    index,
                    size_delta: 0,
                    count_delta: 0,
                    changed: false,
                });
            }

            if !vt.can_edit(&self.id, &self.values[index].data, &value) {
                return Err(StoreError::PolicyRefused);
            }
            let size_delta = value.size() as isize - self.values[index].data.size() as isize;
            if size_delta > size_left {
                return Err(StoreError::QuotaExceeded);
            }
            self.total_size = (self.total_size as isize + size_delta) as usize;
            self.values[index] = ValueStorage {
                data: value,
                time: created,
            };
            return Ok(StoreChange {
                index,
                size_delta,
                count_delta: 0,
                changed: true,
            });
        }

        if !vt.can_store(&self.id, &value) {
            return Err(StoreError::PolicyRefused);
        }
        if self.values.len() >= MAX_VALUES {
            return Err(StoreError::TooManyValues);
        }
        let size = value.size() as isize;
        if size > size_left {
            return Err(StoreError::QuotaExceeded);
        }

        self.total_size += value.size();
        self.values.push(ValueStorage {
            data: value,
            time: created,
        });
        Ok(StoreChange {
            index: self.values.len() - 1,
            size_delta: size,
            count_delta: 1,
            changed: true,
        })
    }

    /// Drop values past their type's expiration. Returns `(size, count)`
    /// freed.
    pub fn expire(&mut self, types: &TypeStore, now: Instant) -> (usize, usize) {
        let mut freed_size = 0;
        let mut freed_count = 0;
        self.values.retain(|v| {
            let expiration = types.get(v.data.value_type).expiration;
            if v.time + expiration <= now {
                debug!(key = %self.id, vid = v.data.id, "expiring value");
                freed_size += v.data.size();
                freed_count += 1;
                false
            } else {
                true
            }
        });
        self.total_size -= freed_size;
        (freed_size, freed_count)
    }

    // === Listeners ===

    /// Register or refresh the foreign listener for `(key, node id)`.
    pub fn add_listener(&mut self, id: InfoHash, addr: SocketAddr, rid: ListenId, now: Instant) {
        if let Some(l) = self.listeners.iter_mut().find(|l| l.id == id) {
            l.addr = addr;
            l.rid = rid;
            l.time = now;
        } else {
            self.listeners.push(Listener {
                id,
                addr,
                rid,
                time: now,
            });
        }
    }

    /// Drop foreign listeners that stopped refreshing.
    pub fn expire_listeners(&mut self, now: Instant) {
        self.listeners
            .retain(|l| l.time + LISTEN_EXPIRE_TIME > now);
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("id", &self.id)
            .field("values", &self.values.len())
            .field("total_size", &self.total_size)
            .field("listeners", &self.listeners.len())
            .field("local_listeners", &self.local_listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::ValueType;

    fn value(id: ValueId, payload: &[u8]) -> Rc<Value> {
        Rc::new(Value::new(id, 0, payload.to_vec()))
    }

    #[test]
    fn total_size_tracks_values() {
        let mut st = Storage::new(InfoHash::random(), Instant::now());
        let types = TypeStore::new();
        let now = Instant::now();

        st.store(&types, value(1, b"aa"), now, isize::MAX).unwrap();
        st.store(&types, value(2, b"bbb"), now, isize::MAX).unwrap();

        let expected: usize = st.values().iter().map(|v| v.data.size()).sum();
        assert_eq!(st.total_size(), expected);
        assert_eq!(st.value_count(), 2);
    }

    #[test]
    fn same_payload_refreshes_without_change() {
        let mut st = Storage::new(InfoHash::random(), Instant::now());
        let types = TypeStore::new();
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(60);

        st.store(&types, value(1, b"x"), t0, isize::MAX).unwrap();
        let change = st.store(&types, value(1, b"x"), t1, isize::MAX).unwrap();

        assert!(!change.changed);
        assert_eq!(change.size_delta, 0);
        assert_eq!(st.values()[0].time, t1);
    }

    #[test]
    fn overwrite_respects_edit_policy() {
        let mut types = TypeStore::new();
        types.register(
            ValueType::new(9, "SEALED", Duration::from_secs(600))
                .with_edit_policy(|_, _, _| false),
        );
        let mut st = Storage::new(InfoHash::random(), Instant::now());
        let now = Instant::now();

        st.store(&types, Rc::new(Value::new(1, 9, &b"a"[..])), now, isize::MAX)
            .unwrap();
        let err = st
            .store(&types, Rc::new(Value::new(1, 9, &b"b"[..])), now, isize::MAX)
            .unwrap_err();
        assert_eq!(err, StoreError::PolicyRefused);
    }

    #[test]
    fn quota_is_enforced() {
        let mut st = Storage::new(InfoHash::random(), Instant::now());
        let types = TypeStore::new();
        let now = Instant::now();

        let v = value(1, &[0u8; 100]);
        let size = v.size() as isize;
        assert_eq!(
            st.store(&types, v.clone(), now, size - 1).unwrap_err(),
            StoreError::QuotaExceeded
        );
        assert!(st.store(&types, v, now, size).is_ok());
    }

    #[test]
    fn expire_frees_size_and_count() {
        let mut st = Storage::new(InfoHash::random(), Instant::now());
        let types = TypeStore::new();
        let t0 = Instant::now();

        st.store(&types, value(1, b"a"), t0, isize::MAX).unwrap();
        st.store(&types, value(2, b"b"), t0 + Duration::from_secs(500), isize::MAX)
            .unwrap();

        let user_data_expiry = types.get(0).expiration;
        let (size, count) = st.expire(&types, t0 + user_data_expiry);

        assert_eq!(count, 1);
        assert!(size > 0);
        assert_eq!(st.value_count(), 1);
        assert_eq!(st.get_by_id(2).unwrap().id, 2);
        assert_eq!(
            st.total_size(),
            st.values().iter().map(|v| v.data.size()).sum::<usize>()
        );
    }

    #[test]
    fn listener_refresh_and_expiry() {
        let mut st = Storage::new(InfoHash::random(), Instant::now());
        let id = InfoHash::random();
        let addr = SocketAddr::from(([127, 0, 0, 1], 4222));
        let t0 = Instant::now();

        st.add_listener(id, addr, 1, t0);
        st.add_listener(id, addr, 2, t0 + Duration::from_secs(10));
        assert_eq!(st.listeners.len(), 1);
        assert_eq!(st.listeners[0].rid, 2);

        st.expire_listeners(t0 + Duration::from_secs(10) + LISTEN_EXPIRE_TIME);
        assert!(st.listeners.is_empty());
    }
}
