//! Miscellaneous common structs used throughout the library.

mod id;
mod kbucket;
pub mod messages;
mod node;
mod routing_table;

pub use id::*;
pub use kbucket::*;
pub use messages::*;
pub use node::*;
pub use routing_table::*;
