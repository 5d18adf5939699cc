//! Storage adapters for DualStore.
//!
//! This module provides the two external boundaries of the synchronization
//! engine behind traits:
//! - [`LocalStore`]: the persistent local store, partitioned by store group
//! - [`RemoteTransport`]: the method-based remote API with status codes
//!
//! # Design Principles
//! - Thin pass-through: adapters never consult the journal
//! - Async operations: all I/O operations are async
//! - Unified error semantics: transports report every failure as a status,
//!   `0` meaning no response reached the transport

pub mod http;
pub mod memory;
pub mod memory_remote;
pub mod remote;
pub mod sqlite;
pub mod store;

pub use http::HttpRemote;
pub use memory::MemoryStore;
pub use memory_remote::MemoryRemote;
pub use remote::{RemoteRequest, RemoteTransport};
pub use sqlite::SqliteStore;
pub use store::LocalStore;
