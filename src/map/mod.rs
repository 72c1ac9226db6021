//! Concurrent map structures.
//!
//! [`ShardedMap`] splits its key space across independently locked
//! segments and fans bulk traversals out onto a worker pool.

pub mod sharded;

pub use sharded::{MapConfig, ShardedMap};
