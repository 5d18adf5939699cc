//! Remote transport trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use dualstore_common::{Method, Result, StoreGroup};

/// A request to the remote API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRequest {
    /// CRUD method.
    pub method: Method,
    /// Group (collection endpoint) the request targets.
    pub store_group: StoreGroup,
    /// Target identifier; `None` addresses the whole group.
    pub id: Option<String>,
    /// Payload for create and update.
    pub body: Option<Value>,
}

impl RemoteRequest {
    /// Create an entity within a group.
    pub fn create(store_group: StoreGroup, body: Value) -> Self {
        Self {
            method: Method::Create,
            store_group,
            id: None,
            body: Some(body),
        }
    }

    /// Read one entity.
    pub fn read(store_group: StoreGroup, id: impl Into<String>) -> Self {
        Self {
            method: Method::Read,
            store_group,
            id: Some(id.into()),
            body: None,
        }
    }

    /// Read the whole group.
    pub fn read_all(store_group: StoreGroup) -> Self {
        Self {
            method: Method::Read,
            store_group,
            id: None,
            body: None,
        }
    }

    /// Update one entity.
    pub fn update(store_group: StoreGroup, id: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Update,
            store_group,
            id: Some(id.into()),
            body: Some(body),
        }
    }

    /// Delete one entity.
    pub fn delete(store_group: StoreGroup, id: impl Into<String>) -> Self {
        Self {
            method: Method::Delete,
            store_group,
            id: Some(id.into()),
            body: None,
        }
    }
}

/// Method-based request/response transport to the remote API.
///
/// Implementations report every failure as [`dualstore_common::Error::Remote`]
/// with the response status, or status `0` when no response was received.
/// Classifying failures as connectivity problems is left to the caller.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Get the transport name (e.g., "http", "memory").
    fn name(&self) -> &str;

    /// Send a request and return the decoded response body.
    async fn send(&self, request: RemoteRequest) -> Result<Value>;
}
