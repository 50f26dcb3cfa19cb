#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

mod common;
mod dht;
mod error;

#[cfg(feature = "async")]
pub mod async_dht;
pub mod rpc;

pub use crate::common::{
    get_dht_time, DhtTime, Id, KBucket, LocalStorage, Node, RoutingTable, StoredValue,
};
pub use bytes::Bytes;
pub use dht::{Dht, DhtBuilder, DhtWasShutdown, Testnet};
pub use error::{Error, Result};

pub use crate::common::messages;
