//! In-memory remote transport for testing.
//!
//! Emulates a REST backend that assigns `srv-N` identifiers, with fault
//! injection to simulate connectivity loss and application errors.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::remote::{RemoteRequest, RemoteTransport};
use dualstore_common::{Error, Method, Result, StoreGroup, DEFAULT_ID_ATTRIBUTE};

#[derive(Default)]
struct RemoteState {
    groups: HashMap<String, Vec<Map<String, Value>>>,
    next_id: u64,
    offline: Option<u16>,
    fail_next: VecDeque<u16>,
    fail_on_method: HashMap<Method, u16>,
    fail_on_id: HashMap<String, u16>,
    requests: Vec<RemoteRequest>,
}

/// In-memory remote transport.
pub struct MemoryRemote {
    id_attribute: String,
    envelope: Option<String>,
    state: Mutex<RemoteState>,
}

impl MemoryRemote {
    /// Create an empty remote using the default identifier attribute.
    pub fn new() -> Self {
        Self::with_id_attribute(DEFAULT_ID_ATTRIBUTE)
    }

    /// Create an empty remote storing identifiers under `id_attribute`.
    pub fn with_id_attribute(id_attribute: impl Into<String>) -> Self {
        Self {
            id_attribute: id_attribute.into(),
            envelope: None,
            state: Mutex::new(RemoteState {
                next_id: 1,
                ..RemoteState::default()
            }),
        }
    }

    /// Wrap every non-delete response as `{"<key>": <payload>}`.
    pub fn with_envelope(mut self, key: impl Into<String>) -> Self {
        self.envelope = Some(key.into());
        self
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        // Poisoning only happens in a panicking test; keep the log readable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail every request with `status` until [`MemoryRemote::go_online`].
    pub fn go_offline(&self, status: u16) {
        self.state().offline = Some(status);
    }

    /// Stop failing requests.
    pub fn go_online(&self) {
        self.state().offline = None;
    }

    /// Fail the next request with `status`.
    pub fn fail_next(&self, status: u16) {
        self.state().fail_next.push_back(status);
    }

    /// Fail every request of `method` with `status`.
    pub fn fail_on(&self, method: Method, status: u16) {
        self.state().fail_on_method.insert(method, status);
    }

    /// Fail every request addressing `id` with `status`.
    pub fn fail_on_id(&self, id: impl Into<String>, status: u16) {
        self.state().fail_on_id.insert(id.into(), status);
    }

    /// Remove every injected failure.
    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.offline = None;
        state.fail_next.clear();
        state.fail_on_method.clear();
        state.fail_on_id.clear();
    }

    /// Store a record directly, bypassing the request log.
    ///
    /// # Errors
    /// - `record` is not an object or has no identifier
    pub fn seed(&self, group: &StoreGroup, record: Value) -> Result<()> {
        let Value::Object(map) = record else {
            return Err(Error::Validation("seed record must be an object".to_string()));
        };
        if !map.contains_key(&self.id_attribute) {
            return Err(Error::Validation(format!(
                "seed record has no '{}' attribute",
                self.id_attribute
            )));
        }
        self.state()
            .groups
            .entry(group.as_str().to_string())
            .or_default()
            .push(map);
        Ok(())
    }

    /// Current records of a group.
    pub fn records(&self, group: &StoreGroup) -> Vec<Value> {
        self.state()
            .groups
            .get(group.as_str())
            .map(|records| records.iter().cloned().map(Value::Object).collect())
            .unwrap_or_default()
    }

    /// Every request received so far, including failed ones.
    pub fn requests(&self) -> Vec<RemoteRequest> {
        self.state().requests.clone()
    }

    /// Number of requests received so far.
    pub fn request_count(&self) -> usize {
        self.state().requests.len()
    }

    fn injected_failure(&self, state: &mut RemoteState, request: &RemoteRequest) -> Option<u16> {
        if let Some(status) = state.offline {
            return Some(status);
        }
        if let Some(status) = state.fail_next.pop_front() {
            return Some(status);
        }
        if let Some(status) = state.fail_on_method.get(&request.method) {
            return Some(*status);
        }
        request
            .id
            .as_ref()
            .and_then(|id| state.fail_on_id.get(id).copied())
    }

    fn matches_id(&self, record: &Map<String, Value>, id: &str) -> bool {
        match record.get(&self.id_attribute) {
            Some(Value::String(s)) => s == id,
            Some(Value::Number(n)) => n.to_string() == id,
            _ => false,
        }
    }

    fn not_found(request: &RemoteRequest) -> Error {
        Error::remote(
            404,
            format!(
                "{} not found in {}",
                request.id.as_deref().unwrap_or("<none>"),
                request.store_group
            ),
        )
    }

    fn body_object(request: &RemoteRequest) -> Result<Map<String, Value>> {
        match &request.body {
            Some(Value::Object(map)) => Ok(map.clone()),
            _ => Err(Error::remote(400, "request body must be an object")),
        }
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteTransport for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send(&self, request: RemoteRequest) -> Result<Value> {
        let mut state = self.state();
        state.requests.push(request.clone());

        if let Some(status) = self.injected_failure(&mut state, &request) {
            return Err(Error::remote(status, format!("injected failure for {}", request.method)));
        }

        let response = self.respond(&mut state, &request)?;
        Ok(match &self.envelope {
            Some(key) if request.method != Method::Delete => {
                let mut wrapped = Map::new();
                wrapped.insert(key.clone(), response);
                Value::Object(wrapped)
            }
            _ => response,
        })
    }
}

impl MemoryRemote {
    fn respond(&self, state: &mut RemoteState, request: &RemoteRequest) -> Result<Value> {
        let group = request.store_group.as_str().to_string();

        match (request.method, request.id.as_deref()) {
            (Method::Create, _) => {
                let mut body = Self::body_object(request)?;
                let id = format!("srv-{}", state.next_id);
                state.next_id += 1;
                body.insert(self.id_attribute.clone(), Value::String(id));
                state.groups.entry(group).or_default().push(body.clone());
                Ok(Value::Object(body))
            }
            (Method::Read, None) => Ok(Value::Array(
                state
                    .groups
                    .get(&group)
                    .map(|records| records.iter().cloned().map(Value::Object).collect())
                    .unwrap_or_default(),
            )),
            (Method::Read, Some(id)) => state
                .groups
                .get(&group)
                .and_then(|records| records.iter().find(|r| self.matches_id(r, id)))
                .cloned()
                .map(Value::Object)
                .ok_or_else(|| Self::not_found(request)),
            (Method::Update, Some(id)) => {
                let body = Self::body_object(request)?;
                let record = state
                    .groups
                    .get_mut(&group)
                    .and_then(|records| records.iter_mut().find(|r| self.matches_id(r, id)))
                    .ok_or_else(|| Self::not_found(request))?;
                for (key, value) in body {
                    if key != self.id_attribute {
                        record.insert(key, value);
                    }
                }
                Ok(Value::Object(record.clone()))
            }
            (Method::Delete, Some(id)) => {
                let records = state
                    .groups
                    .get_mut(&group)
                    .ok_or_else(|| Self::not_found(request))?;
                let index = records
                    .iter()
                    .position(|r| self.matches_id(r, id))
                    .ok_or_else(|| Self::not_found(request))?;
                records.remove(index);
                Ok(json!({}))
            }
            (method, None) => Err(Error::remote(
                400,
                format!("{} requires an identifier", method),
            )),
        }
    }
}
