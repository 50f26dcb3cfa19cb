//! Miscellaneous common structs used throughout the library.

mod id;
pub mod messages;
mod node;
mod routing_table;
mod storage;
mod time;

pub use id::*;
pub use messages::*;
pub use node::*;
pub use routing_table::*;
pub use storage::*;
pub use time::*;
