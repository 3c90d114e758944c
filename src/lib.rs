#![doc = include_str!("../README.md")]

// Public modules
mod common;
mod error;

pub mod dht;
pub mod engine;
pub mod messages;
pub mod scheduler;

pub use crate::common::{
    all_filter, Confirm, Family, Filter, InfoHash, Node, NodeExport, NodeRef, TypeStore, Value,
    ValueId, ValueType, HASH_BITS, HASH_SIZE, MAX_RESPONSE_TIME, NODE_EXPIRE_TIME,
};
pub use dht::{Config, Dht, GetCallback, DoneCallback, ShutdownCallback, Status};
pub use error::Error;

// Alias Result to be the crate Result.
pub type Result<T, E = error::Error> = core::result::Result<T, E>;
