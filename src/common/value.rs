//! Typed values stored under content-addressed keys.
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::common::InfoHash;

/// Identifier of a value within a key, chosen by the publisher.
pub type ValueId = u64;

/// Registered value type identifier.
pub type TypeId = u16;

/// Fixed per-value bookkeeping overhead counted against the storage quota.
const VALUE_OVERHEAD: usize = 32;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A value published under a key. The payload is opaque to the node; the
/// value codec interprets it on the client side.
pub struct Value {
    pub id: ValueId,
    pub value_type: TypeId,
    pub data: Bytes,
}

impl Value {
    pub fn new(id: ValueId, value_type: TypeId, data: impl Into<Bytes>) -> Value {
        Value {
            id,
            value_type,
            data: data.into(),
        }
    }

    /// Bytes this value accounts for against storage quotas.
    pub fn size(&self) -> usize {
        self.data.len() + VALUE_OVERHEAD
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value")
            .field("id", &self.id)
            .field("type", &self.value_type)
            .field("size", &self.data.len())
            .finish()
    }
}

/// Client-side value filter. Applied before delivering values to get/listen
/// callbacks; never applied on the serving node.
pub type Filter = Rc<dyn Fn(&Value) -> bool>;

/// Filter accepting everything.
pub fn all_filter() -> Filter {
    Rc::new(|_| true)
}

#[derive(Clone)]
/// Behavior attached to a [TypeId]: how long values of this type live, and
/// whether a store or an overwrite is admissible.
pub struct ValueType {
    pub id: TypeId,
    pub name: &'static str,
    pub expiration: Duration,
    /// Whether a brand-new value may be stored under `key`.
    store_policy: Rc<dyn Fn(&InfoHash, &Value) -> bool>,
    /// Whether `new` may replace `old` under `key`.
    edit_policy: Rc<dyn Fn(&InfoHash, &Value, &Value) -> bool>,
}

impl ValueType {
    pub fn new(id: TypeId, name: &'static str, expiration: Duration) -> ValueType {
        ValueType {
            id,
            name,
            expiration,
            store_policy: Rc::new(|_, _| true),
            edit_policy: Rc::new(|_, _, _| true),
        }
    }

    /// Fallback type for unregistered type ids.
    pub fn user_data() -> ValueType {
        ValueType::new(0, "USER_DATA", Duration::from_secs(10 * 60))
    }

    pub fn with_store_policy(
        mut self,
        policy: impl Fn(&InfoHash, &Value) -> bool + 'static,
    ) -> ValueType {
        self.store_policy = Rc::new(policy);
        self
    }

    pub fn with_edit_policy(
        mut self,
        policy: impl Fn(&InfoHash, &Value, &Value) -> bool + 'static,
    ) -> ValueType {
        self.edit_policy = Rc::new(policy);
        self
    }

    pub fn can_store(&self, key: &InfoHash, value: &Value) -> bool {
        (self.store_policy)(key, value)
    }

    pub fn can_edit(&self, key: &InfoHash, old: &Value, new: &Value) -> bool {
        (self.edit_policy)(key, old, new)
    }
}

impl Debug for ValueType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueType")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("expiration", &self.expiration)
            .finish()
    }
}

#[derive(Debug)]
/// Registry of value types known to this node.
pub struct TypeStore {
    types: HashMap<TypeId, ValueType>,
    user_data: ValueType,
}

impl TypeStore {
    pub fn new() -> TypeStore {
        TypeStore {
            types: HashMap::new(),
            user_data: ValueType::user_data(),
        }
    }

    pub fn register(&mut self, value_type: ValueType) {
        self.types.insert(value_type.id, value_type);
    }

    /// The type registered for `id`, or `USER_DATA` when unknown.
    pub fn get(&self, id: TypeId) -> &ValueType {
        self.types.get(&id).unwrap_or(&self.user_data)
    }
}

impl Default for TypeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unknown_type_falls_back_to_user_data() {
        let types = TypeStore::new();
        assert_eq!(types.get(42).name, "USER_DATA");
        assert_eq!(types.get(42).expiration, Duration::from_secs(600));
    }

    #[test]
    fn registered_type_wins() {
        let mut types = TypeStore::new();
        types.register(ValueType::new(7, "TEST", Duration::from_secs(5)));
        assert_eq!(types.get(7).name, "TEST");
    }

    #[test]
    fn edit_policy_applies() {
        let vt = ValueType::new(1, "FROZEN", Duration::from_secs(60))
            .with_edit_policy(|_, old, new| old.data == new.data);

        let key = InfoHash::random();
        let a = Value::new(1, 1, &b"x"[..]);
        let b = Value::new(1, 1, &b"y"[..]);
        assert!(vt.can_edit(&key, &a, &a));
        assert!(!vt.can_edit(&key, &a, &b));
    }

    #[test]
    fn value_size_includes_overhead() {
        let v = Value::new(1, 0, &b"abcd"[..]);
        assert_eq!(v.size(), 4 + VALUE_OVERHEAD);
    }
}
