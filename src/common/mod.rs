//! Common types shared across the crate.

mod id;
mod node;
mod value;

pub use id::{InfoHash, HASH_BITS, HASH_SIZE};
pub use node::{
    Confirm, Family, Node, NodeExport, NodeRef, MAX_RESPONSE_TIME, NODE_EXPIRE_TIME,
    NODE_GOOD_TIME,
};
pub use value::{all_filter, Filter, TypeId, TypeStore, Value, ValueId, ValueType};
