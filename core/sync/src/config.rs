//! Orchestrator configuration.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use dualstore_common::{Error, Result};

/// Status codes treated as "remote unreachable" unless configured otherwise.
pub const DEFAULT_OFFLINE_STATUS_CODES: [u16; 2] = [408, 502];

/// Scope of the gate that keeps reads local while changes are pending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadGate {
    /// Pending changes in any group keep every read local.
    #[default]
    Global,
    /// Only pending changes in the read's own group keep it local.
    Group,
}

/// Configuration for the dual storage orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DualStorageConfig {
    /// Response statuses classified as connectivity failures.
    ///
    /// Status `0` (no response at all) is always offline.
    pub offline_status_codes: Vec<u16>,
    /// Treat the remote as unreachable without contacting it.
    pub force_offline: bool,
    /// Read gate scope.
    pub read_gate: ReadGate,
    /// JSON pointer to the payload inside an enveloped remote response,
    /// e.g. `/data` for `{"data": [...]}`.
    pub response_pointer: Option<String>,
}

impl Default for DualStorageConfig {
    fn default() -> Self {
        Self {
            offline_status_codes: DEFAULT_OFFLINE_STATUS_CODES.to_vec(),
            force_offline: false,
            read_gate: ReadGate::default(),
            response_pointer: None,
        }
    }
}

impl DualStorageConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from a JSON file. Missing fields take defaults.
    ///
    /// # Errors
    /// - File cannot be read or is not valid JSON
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        Ok(config.normalized())
    }

    /// Replace the offline status codes. Duplicates are dropped.
    pub fn with_offline_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.offline_status_codes = codes.into_iter().collect();
        self.normalized()
    }

    /// Set the initial forced-offline flag.
    pub fn with_force_offline(mut self, force_offline: bool) -> Self {
        self.force_offline = force_offline;
        self
    }

    /// Set the read gate scope.
    pub fn with_read_gate(mut self, read_gate: ReadGate) -> Self {
        self.read_gate = read_gate;
        self
    }

    /// Unwrap remote payloads found at `pointer`.
    pub fn with_response_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.response_pointer = Some(pointer.into());
        self
    }

    /// Extract the payload of a remote response.
    ///
    /// # Errors
    /// - `Validation` when the response has nothing at the configured pointer
    pub fn unwrap_response(&self, response: Value) -> Result<Value> {
        let Some(pointer) = &self.response_pointer else {
            return Ok(response);
        };
        match response.pointer(pointer) {
            Some(payload) => Ok(payload.clone()),
            None => Err(Error::Validation(format!(
                "remote response has nothing at {}",
                pointer
            ))),
        }
    }

    /// Whether a failure with `status` means the remote is unreachable.
    pub fn is_offline_status(&self, status: u16) -> bool {
        status == 0 || self.offline_status_codes.contains(&status)
    }

    fn normalized(mut self) -> Self {
        let mut seen = Vec::with_capacity(self.offline_status_codes.len());
        self.offline_status_codes.retain(|code| {
            if seen.contains(code) {
                false
            } else {
                seen.push(*code);
                true
            }
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = DualStorageConfig::default();
        assert!(config.is_offline_status(408));
        assert!(config.is_offline_status(502));
        assert!(config.is_offline_status(0));
        assert!(!config.is_offline_status(500));
        assert!(!config.force_offline);
        assert_eq!(config.read_gate, ReadGate::Global);
    }

    #[test]
    fn test_custom_codes_are_deduplicated() {
        let config = DualStorageConfig::new().with_offline_status_codes([503, 504, 503]);
        assert_eq!(config.offline_status_codes, vec![503, 504]);
        assert!(!config.is_offline_status(502));
    }

    #[test]
    fn test_from_file_fills_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"read_gate": "group"}"#).unwrap();

        let config = DualStorageConfig::from_file(&path).unwrap();
        assert_eq!(config.read_gate, ReadGate::Group);
        assert_eq!(config.offline_status_codes, vec![408, 502]);
    }

    #[test]
    fn test_response_pointer_unwraps_envelope() {
        let config = DualStorageConfig::new().with_response_pointer("/data");
        let payload = config
            .unwrap_response(serde_json::json!({"data": [{"id": "c1"}], "total": 1}))
            .unwrap();
        assert_eq!(payload, serde_json::json!([{"id": "c1"}]));

        let err = config
            .unwrap_response(serde_json::json!({"items": []}))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_without_pointer_response_is_untouched() {
        let config = DualStorageConfig::default();
        let response = serde_json::json!({"data": []});
        assert_eq!(config.unwrap_response(response.clone()).unwrap(), response);
    }

    #[test]
    fn test_from_file_rejects_garbage() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(DualStorageConfig::from_file(&path).is_err());
    }
}
