//! Common types shared across DualStore modules.
//!
//! This module provides the error taxonomy, entity and identifier types,
//! and the operation vocabulary used by the storage adapters and the
//! synchronization engine.

pub mod error;
pub mod operation;
pub mod types;

pub use error::{Error, Result};
pub use operation::{Method, Operation, SyncOptions};
pub use types::{
    Attributes, Collection, Entity, ModelId, Record, Routing, StoreGroup, DEFAULT_ID_ATTRIBUTE,
    TEMPORARY_ID_LEN,
};
