//! Common types used throughout DualStore.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Length of a temporary identifier (hyphenated UUID shape).
pub const TEMPORARY_ID_LEN: usize = 36;

/// Default name of the identifier attribute in remote payloads.
pub const DEFAULT_ID_ATTRIBUTE: &str = "id";

/// Attribute set of an entity.
pub type Attributes = Map<String, Value>;

/// Logical grouping (table/collection name) for entities and journal entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreGroup(String);

impl StoreGroup {
    /// Create a new StoreGroup from a string.
    ///
    /// # Errors
    /// - Returns a validation error if `name` is empty
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(crate::Error::Validation(
                "storeGroup cannot be empty".to_string(),
            ));
        }
        Ok(Self(name))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entity identifier.
///
/// A temporary identifier is generated locally when an entity is created
/// while the remote is unreachable. It is promoted to a permanent one exactly
/// once, when the create reaches the remote, and never demoted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ModelId {
    /// Locally generated placeholder.
    Temporary(String),
    /// Assigned by the remote.
    Permanent(String),
}

impl ModelId {
    /// Generate a fresh temporary identifier.
    pub fn temporary() -> Self {
        ModelId::Temporary(Uuid::new_v4().to_string())
    }

    /// Wrap a remote-issued identifier.
    ///
    /// # Errors
    /// - Returns a validation error if `id` is empty
    pub fn permanent(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::Validation(
                "permanent identifier cannot be empty".to_string(),
            ));
        }
        Ok(ModelId::Permanent(id))
    }

    /// Interpret a raw identifier of unknown provenance.
    ///
    /// Falls back to the shape heuristic: a 36-character UUID-shaped token is
    /// taken as temporary. Prefer the explicit constructors whenever the
    /// origin of the identifier is known.
    pub fn classify(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if raw.len() == TEMPORARY_ID_LEN && Uuid::parse_str(&raw).is_ok() {
            ModelId::Temporary(raw)
        } else {
            ModelId::Permanent(raw)
        }
    }

    /// Get the raw identifier.
    pub fn as_str(&self) -> &str {
        match self {
            ModelId::Temporary(id) | ModelId::Permanent(id) => id,
        }
    }

    /// Check whether this identifier was generated locally.
    pub fn is_temporary(&self) -> bool {
        matches!(self, ModelId::Temporary(_))
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-entity routing override.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Routing {
    /// Coordinate local store, remote and journal.
    #[default]
    Dual,
    /// Only ever touch the local store.
    Local,
    /// Only ever touch the remote.
    Remote,
}

/// A persisted local record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Identifier of the record within its group.
    pub id: ModelId,
    /// Group the record belongs to.
    pub store_group: StoreGroup,
    /// Stored attributes (without the identifier).
    pub attributes: Attributes,
    /// Deleted locally, remote deletion still pending.
    #[serde(default)]
    pub deleted: bool,
}

/// Extract an identifier string from a payload value.
fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// An entity as seen by the synchronization layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    id: Option<ModelId>,
    store_group: StoreGroup,
    id_attribute: String,
    attributes: Attributes,
    routing: Routing,
}

impl Entity {
    /// Create an entity without identifier in the given group.
    pub fn new(store_group: StoreGroup) -> Self {
        Self {
            id: None,
            store_group,
            id_attribute: DEFAULT_ID_ATTRIBUTE.to_string(),
            attributes: Attributes::new(),
            routing: Routing::Dual,
        }
    }

    /// Create an identifier-only placeholder.
    pub fn placeholder(store_group: StoreGroup, id: ModelId) -> Self {
        Self::new(store_group).with_id(id)
    }

    /// Set the identifier.
    pub fn with_id(mut self, id: ModelId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the name of the identifier attribute.
    pub fn with_id_attribute(mut self, id_attribute: impl Into<String>) -> Self {
        self.id_attribute = id_attribute.into();
        self
    }

    /// Set the routing override.
    pub fn with_routing(mut self, routing: Routing) -> Self {
        self.routing = routing;
        self
    }

    /// Replace the attributes with the fields of a JSON object.
    ///
    /// An identifier found under the id attribute is taken as permanent.
    ///
    /// # Errors
    /// - `value` is not a JSON object
    pub fn with_attributes(mut self, value: Value) -> crate::Result<Self> {
        let Value::Object(map) = value else {
            return Err(crate::Error::Validation(
                "entity attributes must be a JSON object".to_string(),
            ));
        };
        self.attributes = Attributes::new();
        self.absorb(map);
        Ok(self)
    }

    /// Build an entity from a remote payload.
    ///
    /// # Errors
    /// - Payload is not an object or carries no identifier
    pub fn from_remote(
        store_group: StoreGroup,
        id_attribute: &str,
        payload: &Value,
    ) -> crate::Result<Self> {
        let entity = Self::new(store_group)
            .with_id_attribute(id_attribute)
            .with_attributes(payload.clone())?;
        if entity.id.is_none() {
            return Err(crate::Error::Validation(format!(
                "remote record has no '{}' attribute",
                id_attribute
            )));
        }
        Ok(entity)
    }

    /// Rebuild an entity from a local record.
    pub fn from_record(record: Record, id_attribute: &str) -> Self {
        Self {
            id: Some(record.id),
            store_group: record.store_group,
            id_attribute: id_attribute.to_string(),
            attributes: record.attributes,
            routing: Routing::Dual,
        }
    }

    /// Get the identifier, if any.
    pub fn id(&self) -> Option<&ModelId> {
        self.id.as_ref()
    }

    /// Replace the identifier.
    pub fn set_id(&mut self, id: Option<ModelId>) {
        self.id = id;
    }

    /// Check whether the entity carries a temporary identifier.
    pub fn has_temp_id(&self) -> bool {
        self.id.as_ref().is_some_and(ModelId::is_temporary)
    }

    /// Get the store group.
    pub fn store_group(&self) -> &StoreGroup {
        &self.store_group
    }

    /// Get the name of the identifier attribute.
    pub fn id_attribute(&self) -> &str {
        &self.id_attribute
    }

    /// Get the routing override.
    pub fn routing(&self) -> Routing {
        self.routing
    }

    /// Get the attributes.
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Get a single attribute.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Set a single attribute.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.attributes.insert(key.into(), value);
    }

    /// Attributes plus identifier, as sent to the remote and returned to callers.
    pub fn to_payload(&self) -> Value {
        let mut map = self.attributes.clone();
        if let Some(id) = &self.id {
            map.insert(self.id_attribute.clone(), Value::String(id.as_str().to_string()));
        }
        Value::Object(map)
    }

    /// Convert into a local record.
    ///
    /// # Errors
    /// - The entity has no identifier yet
    pub fn to_record(&self) -> crate::Result<Record> {
        let id = self.id.clone().ok_or_else(|| {
            crate::Error::Validation("cannot store an entity without identifier".to_string())
        })?;
        Ok(Record {
            id,
            store_group: self.store_group.clone(),
            attributes: self.attributes.clone(),
            deleted: false,
        })
    }

    /// Merge a remote response into this entity.
    ///
    /// Non-object responses (e.g. an empty delete body) leave it unchanged.
    pub fn merge_response(&mut self, response: &Value) {
        if let Value::Object(map) = response {
            self.absorb(map.clone());
        }
    }

    /// Clone of this entity with a remote response merged in.
    pub fn updated_with_response(&self, response: &Value) -> Self {
        let mut updated = self.clone();
        updated.merge_response(response);
        updated
    }

    fn absorb(&mut self, map: Attributes) {
        for (key, value) in map {
            if key == self.id_attribute {
                if let Some(id) = id_from_value(&value) {
                    self.id = Some(ModelId::Permanent(id));
                }
            } else {
                self.attributes.insert(key, value);
            }
        }
    }
}

/// An in-memory collection of entities of one store group.
#[derive(Debug, Clone, PartialEq)]
pub struct Collection {
    store_group: StoreGroup,
    id_attribute: String,
    routing: Routing,
    entities: Vec<Entity>,
}

impl Collection {
    /// Create an empty collection.
    pub fn new(store_group: StoreGroup) -> Self {
        Self {
            store_group,
            id_attribute: DEFAULT_ID_ATTRIBUTE.to_string(),
            routing: Routing::Dual,
            entities: Vec::new(),
        }
    }

    /// Set the name of the identifier attribute used by member entities.
    pub fn with_id_attribute(mut self, id_attribute: impl Into<String>) -> Self {
        self.id_attribute = id_attribute.into();
        self
    }

    /// Set the routing override.
    pub fn with_routing(mut self, routing: Routing) -> Self {
        self.routing = routing;
        self
    }

    /// Get the store group.
    pub fn store_group(&self) -> &StoreGroup {
        &self.store_group
    }

    /// Get the name of the identifier attribute.
    pub fn id_attribute(&self) -> &str {
        &self.id_attribute
    }

    /// Get the routing override.
    pub fn routing(&self) -> Routing {
        self.routing
    }

    /// New member entity (no identifier yet).
    pub fn new_entity(&self) -> Entity {
        Entity::new(self.store_group.clone())
            .with_id_attribute(self.id_attribute.clone())
            .with_routing(self.routing)
    }

    /// Look up a member by raw identifier.
    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entities
            .iter()
            .find(|e| e.id().is_some_and(|i| i.as_str() == id))
    }

    /// Look up a member by raw identifier, mutably.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Entity> {
        self.entities
            .iter_mut()
            .find(|e| e.id().is_some_and(|i| i.as_str() == id))
    }

    /// Position of a member by raw identifier.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.entities
            .iter()
            .position(|e| e.id().is_some_and(|i| i.as_str() == id))
    }

    /// Add an entity, replacing a member with the same identifier.
    pub fn upsert(&mut self, entity: Entity) {
        let existing = entity.id().and_then(|id| self.position(id.as_str()));
        match existing {
            Some(index) => self.entities[index] = entity,
            None => self.entities.push(entity),
        }
    }

    /// Remove a member by raw identifier.
    pub fn remove(&mut self, id: &str) -> Option<Entity> {
        self.position(id).map(|index| self.entities.remove(index))
    }

    /// Replace all members.
    pub fn set_entities(&mut self, entities: Vec<Entity>) {
        self.entities = entities;
    }

    /// Get all members.
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// Get all members, mutably.
    pub fn entities_mut(&mut self) -> &mut [Entity] {
        &mut self.entities
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn customers() -> StoreGroup {
        StoreGroup::new("customers").unwrap()
    }

    #[test]
    fn test_store_group_empty_fails() {
        assert!(StoreGroup::new("").is_err());
        assert!(StoreGroup::new("  ").is_err());
    }

    #[test]
    fn test_temporary_id_shape() {
        let id = ModelId::temporary();
        assert!(id.is_temporary());
        assert_eq!(id.as_str().len(), TEMPORARY_ID_LEN);
    }

    #[test]
    fn test_classify_heuristic() {
        let temp = ModelId::temporary();
        assert_eq!(ModelId::classify(temp.as_str()), temp);
        assert_eq!(
            ModelId::classify("srv-1"),
            ModelId::Permanent("srv-1".to_string())
        );
        // 36 characters but not UUID-shaped
        let odd = "x".repeat(TEMPORARY_ID_LEN);
        assert!(!ModelId::classify(odd).is_temporary());
    }

    #[test]
    fn test_model_id_serialization_keeps_tag() {
        let id = ModelId::temporary();
        let json = serde_json::to_string(&id).unwrap();
        let back: ModelId = serde_json::from_str(&json).unwrap();
        assert!(back.is_temporary());
    }

    #[test]
    fn test_with_attributes_extracts_id() {
        let entity = Entity::new(customers())
            .with_id_attribute("_id")
            .with_attributes(json!({"_id": "srv-9", "name": "Tom"}))
            .unwrap();

        assert_eq!(entity.id(), Some(&ModelId::Permanent("srv-9".into())));
        assert_eq!(entity.get("name"), Some(&json!("Tom")));
        assert!(entity.get("_id").is_none());
    }

    #[test]
    fn test_with_attributes_rejects_non_object() {
        assert!(Entity::new(customers()).with_attributes(json!([1])).is_err());
    }

    #[test]
    fn test_merge_response_promotes_id() {
        let mut entity = Entity::new(customers())
            .with_id(ModelId::temporary())
            .with_attributes(json!({"name": "Tom"}))
            .unwrap();

        entity.merge_response(&json!({"id": 42, "age": 30}));

        assert_eq!(entity.id(), Some(&ModelId::Permanent("42".into())));
        assert_eq!(entity.get("name"), Some(&json!("Tom")));
        assert_eq!(entity.get("age"), Some(&json!(30)));
    }

    #[test]
    fn test_merge_non_object_is_noop() {
        let entity = Entity::new(customers()).with_id(ModelId::Permanent("a".into()));
        let updated = entity.updated_with_response(&Value::Null);
        assert_eq!(updated, entity);
    }

    #[test]
    fn test_payload_includes_id() {
        let entity = Entity::new(customers())
            .with_id_attribute("_id")
            .with_id(ModelId::Permanent("srv-1".into()))
            .with_attributes(json!({"name": "Tom"}))
            .unwrap();
        assert_eq!(entity.to_payload(), json!({"_id": "srv-1", "name": "Tom"}));
    }

    #[test]
    fn test_to_record_requires_id() {
        assert!(Entity::new(customers()).to_record().is_err());
    }

    #[test]
    fn test_from_remote_requires_id() {
        assert!(Entity::from_remote(customers(), "id", &json!({"name": "x"})).is_err());
        let e = Entity::from_remote(customers(), "id", &json!({"id": "r1"})).unwrap();
        assert!(!e.has_temp_id());
    }

    #[test]
    fn test_collection_upsert_and_remove() {
        let mut collection = Collection::new(customers());
        let a = collection
            .new_entity()
            .with_id(ModelId::Permanent("a".into()));
        collection.upsert(a.clone());
        let mut a2 = a.clone();
        a2.set("name", json!("Ann"));
        collection.upsert(a2);

        assert_eq!(collection.len(), 1);
        assert_eq!(collection.get("a").unwrap().get("name"), Some(&json!("Ann")));
        assert!(collection.remove("a").is_some());
        assert!(collection.is_empty());
    }

    proptest! {
        #[test]
        fn prop_classify_never_marks_short_ids_temporary(raw in "[a-z0-9-]{1,35}") {
            prop_assert!(!ModelId::classify(raw).is_temporary());
        }
    }
}
