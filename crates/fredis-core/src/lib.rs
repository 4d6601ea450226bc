//! Keyspace database for the FrankenRedis storage core.
//!
//! A [`Database`] is two dictionaries over the same key bytes: the
//! keyspace proper (key → [`Object`]) and the expires table (key →
//! absolute unix-millisecond deadline). The request thread owns both
//! exclusively; the only other party that ever touches their contents
//! is the lazy-free worker, which receives already-detached entries
//! and whole retired tables to drop.

mod db;

pub use db::{Database, Keyspace, Expires, LAZYFREE_THRESHOLD};
