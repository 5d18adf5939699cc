//! Synchronization orchestrator.
//!
//! Routes every CRUD intent to the local store, the remote, or both, keeps
//! the journal in step with what the remote has confirmed, and promotes
//! temporary identifiers once a create reaches the remote.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use dualstore_common::{
    Collection, Entity, Error, Method, ModelId, Operation, Result, Routing, StoreGroup,
    SyncOptions,
};
use dualstore_storage::{LocalStore, RemoteRequest, RemoteTransport};

use crate::config::{DualStorageConfig, ReadGate};
use crate::journal::{JournalKind, JournalStore};

/// Where the result of an operation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Served by the local store (forced local, gated read, or degraded write).
    Local,
    /// Confirmed by the remote.
    Remote,
}

/// Result of a single orchestrated operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncOutcome {
    /// Response body (remote response, local payload, or query result).
    pub value: Value,
    /// Which side produced it.
    pub source: Source,
}

impl SyncOutcome {
    fn local(value: Value) -> Self {
        Self {
            value,
            source: Source::Local,
        }
    }

    fn remote(value: Value) -> Self {
        Self {
            value,
            source: Source::Remote,
        }
    }
}

/// What a dispatched operation acts on.
pub enum Target<'a> {
    /// A single entity.
    Entity(&'a mut Entity),
    /// A whole collection.
    Collection(&'a mut Collection),
    /// A store group without a concrete entity (reset).
    Group(StoreGroup),
    /// Nothing in particular (clear, closeall, hasDirtyOrDestroyed).
    Global,
}

/// Whether a connectivity failure may degrade into a journaled local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Absorb {
    Yes,
    No,
}

/// Reshapes a remote payload before it is merged into entities and stored.
pub type ResponseParser = Arc<dyn Fn(&StoreGroup, Value) -> Result<Value> + Send + Sync>;

fn require_id(entity: &Entity, method: Method) -> Result<String> {
    entity
        .id()
        .map(|id| id.as_str().to_string())
        .ok_or_else(|| {
            Error::Validation(format!(
                "{} in {} requires an entity identifier",
                method,
                entity.store_group()
            ))
        })
}

/// Offline-first synchronization orchestrator.
pub struct DualStorage<L: LocalStore + ?Sized, R: RemoteTransport + ?Sized> {
    /// Local persistent store.
    local: Arc<L>,
    /// Remote transport.
    remote: Arc<R>,
    /// Pending-change journal.
    journal: Arc<JournalStore>,
    /// Configuration.
    config: DualStorageConfig,
    /// Runtime forced-offline toggle.
    force_offline: AtomicBool,
    /// Optional reshaping of remote payloads.
    parser: Option<ResponseParser>,
}

impl<L: LocalStore, R: RemoteTransport> DualStorage<L, R> {
    /// Create a new orchestrator.
    pub fn new(local: L, remote: R, journal: JournalStore, config: DualStorageConfig) -> Self {
        Self::from_arc(Arc::new(local), Arc::new(remote), Arc::new(journal), config)
    }
}

impl<L: LocalStore + ?Sized, R: RemoteTransport + ?Sized> DualStorage<L, R> {
    /// Create a new orchestrator from shared components.
    pub fn from_arc(
        local: Arc<L>,
        remote: Arc<R>,
        journal: Arc<JournalStore>,
        config: DualStorageConfig,
    ) -> Self {
        let force_offline = AtomicBool::new(config.force_offline);
        Self {
            local,
            remote,
            journal,
            config,
            force_offline,
            parser: None,
        }
    }

    /// Reshape every remote payload (except delete responses) before use.
    ///
    /// Runs after the configured response pointer, if any.
    pub fn with_response_parser<F>(mut self, parser: F) -> Self
    where
        F: Fn(&StoreGroup, Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.parser = Some(Arc::new(parser));
        self
    }

    /// Get the local store.
    pub fn local(&self) -> &Arc<L> {
        &self.local
    }

    /// Get the remote transport.
    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// Get the journal.
    pub fn journal(&self) -> &Arc<JournalStore> {
        &self.journal
    }

    /// Get the configuration.
    pub fn config(&self) -> &DualStorageConfig {
        &self.config
    }

    /// Emulate (or stop emulating) a lost connection.
    pub fn set_force_offline(&self, force_offline: bool) {
        self.force_offline.store(force_offline, Ordering::SeqCst);
        info!("Forced offline mode {}", if force_offline { "on" } else { "off" });
    }

    /// Whether the remote is currently treated as unreachable by fiat.
    pub fn is_forced_offline(&self) -> bool {
        self.force_offline.load(Ordering::SeqCst)
    }

    /// Dispatch any operation of the vocabulary.
    ///
    /// # Errors
    /// - `Validation` when the target does not fit the operation
    /// - Whatever the dispatched operation reports
    pub async fn sync(
        &self,
        operation: Operation,
        target: Target<'_>,
        options: &SyncOptions,
    ) -> Result<SyncOutcome> {
        match (operation, target) {
            (Operation::Create, Target::Entity(entity)) => self.create(entity, options).await,
            (Operation::Read, Target::Entity(entity)) => self.read(entity, options).await,
            (Operation::Read, Target::Collection(collection)) => {
                self.fetch(collection, options).await
            }
            (Operation::Update, Target::Entity(entity)) => self.update(entity, options).await,
            (Operation::Delete, Target::Entity(entity)) => self.delete(entity, options).await,
            (Operation::Reset, target) => {
                let group = match target {
                    Target::Entity(entity) => entity.store_group().clone(),
                    Target::Collection(collection) => collection.store_group().clone(),
                    Target::Group(group) => group,
                    Target::Global => {
                        return Err(Error::Validation(
                            "reset requires a store group".to_string(),
                        ))
                    }
                };
                let removed = self.reset(&group).await?;
                Ok(SyncOutcome::local(Value::from(removed)))
            }
            (Operation::Clear, _) => {
                self.clear().await?;
                Ok(SyncOutcome::local(Value::Null))
            }
            (Operation::CloseAll, _) => {
                self.close_all().await?;
                Ok(SyncOutcome::local(Value::Null))
            }
            (Operation::HasDirtyOrDestroyed, _) => Ok(SyncOutcome::local(Value::Bool(
                self.has_dirty_or_destroyed().await?,
            ))),
            (operation, _) => Err(Error::Validation(format!(
                "{} is not supported for this target",
                operation
            ))),
        }
    }

    /// Create an entity.
    pub async fn create(&self, entity: &mut Entity, options: &SyncOptions) -> Result<SyncOutcome> {
        match entity.routing() {
            Routing::Local => Ok(SyncOutcome::local(
                self.local_create(entity, options).await?,
            )),
            Routing::Remote => self.remote_only(Method::Create, entity).await,
            Routing::Dual => self.dual_create(entity, options, Absorb::Yes).await,
        }
    }

    /// Read one entity.
    pub async fn read(&self, entity: &mut Entity, options: &SyncOptions) -> Result<SyncOutcome> {
        match entity.routing() {
            Routing::Local => Ok(SyncOutcome::local(self.local_read(entity).await?)),
            Routing::Remote => self.remote_only(Method::Read, entity).await,
            Routing::Dual => self.dual_read(entity, options).await,
        }
    }

    /// Read a whole collection.
    ///
    /// Without `options.add` the collection's members are replaced; with it,
    /// fetched entities are merged into the existing members.
    pub async fn fetch(
        &self,
        collection: &mut Collection,
        options: &SyncOptions,
    ) -> Result<SyncOutcome> {
        match collection.routing() {
            Routing::Local => Ok(SyncOutcome::local(
                self.local_fetch(collection, options).await?,
            )),
            Routing::Remote => self.remote_fetch(collection, options).await,
            Routing::Dual => self.dual_fetch(collection, options).await,
        }
    }

    /// Update an entity.
    pub async fn update(&self, entity: &mut Entity, options: &SyncOptions) -> Result<SyncOutcome> {
        match entity.routing() {
            Routing::Local => Ok(SyncOutcome::local(
                self.local_update(entity, options).await?,
            )),
            Routing::Remote => self.remote_only(Method::Update, entity).await,
            Routing::Dual => self.dual_update(entity, options, Absorb::Yes).await,
        }
    }

    /// Delete an entity.
    pub async fn delete(&self, entity: &Entity, options: &SyncOptions) -> Result<SyncOutcome> {
        match entity.routing() {
            Routing::Local => Ok(SyncOutcome::local(
                self.local_delete(entity, options).await?,
            )),
            Routing::Remote => {
                let mut target = entity.clone();
                self.remote_only(Method::Delete, &mut target).await
            }
            Routing::Dual => self.dual_delete(entity, options, Absorb::Yes).await,
        }
    }

    /// Create an entity without identifier, update one that has one.
    pub async fn save(&self, entity: &mut Entity, options: &SyncOptions) -> Result<SyncOutcome> {
        if entity.id().is_none() {
            self.create(entity, options).await
        } else {
            self.update(entity, options).await
        }
    }

    /// Drop every pending change of one group, returning how many were removed.
    pub async fn reset(&self, group: &StoreGroup) -> Result<usize> {
        self.journal.reset(group).await
    }

    /// Empty both journals.
    pub async fn clear(&self) -> Result<()> {
        self.journal.clear().await
    }

    /// Release local store connections.
    pub async fn close_all(&self) -> Result<()> {
        self.local.close_all().await
    }

    /// Whether any change is pending anywhere.
    pub async fn has_dirty_or_destroyed(&self) -> Result<bool> {
        self.journal.has_dirty_or_destroyed().await
    }

    /// Repair journal/store drift left by an interrupted write.
    ///
    /// - A dirty entry whose local record is gone is dropped.
    /// - A record flagged deleted without a destroyed entry gets one when its
    ///   identifier is permanent, and is purged when it is temporary.
    ///
    /// Returns the number of repairs.
    pub async fn reconcile(&self, group: &StoreGroup) -> Result<usize> {
        let mut repaired = 0;

        for entry in self.journal.find_all_dirty(group).await? {
            if self.local.get(group, &entry.model_id).await?.is_none() {
                warn!(
                    "Dropping orphaned dirty entry for {} in {}",
                    entry.model_id, group
                );
                self.journal
                    .remove_entry(JournalKind::Dirty, &entry.id)
                    .await?;
                repaired += 1;
            }
        }

        let destroyed: HashSet<String> = self
            .journal
            .find_all_destroyed(group)
            .await?
            .into_iter()
            .map(|entry| entry.model_id)
            .collect();

        for record in self.local.list(group).await? {
            if !record.deleted || destroyed.contains(record.id.as_str()) {
                continue;
            }
            let entity = Entity::placeholder(group.clone(), record.id.clone());
            if record.id.is_temporary() {
                warn!("Purging unsynced deleted record {} in {}", record.id, group);
                self.local.delete(group, record.id.as_str()).await?;
                self.journal.remove_dirty(&entity).await?;
            } else {
                warn!("Re-queueing deletion of {} in {}", record.id, group);
                self.journal.add_destroyed(&entity).await?;
                self.journal.remove_dirty(&entity).await?;
            }
            repaired += 1;
        }

        if repaired > 0 {
            info!("Reconciled {}: {} repairs", group, repaired);
        }
        Ok(repaired)
    }

    // ---- remote plumbing ----

    async fn call_remote(&self, request: RemoteRequest) -> Result<Value> {
        if self.is_forced_offline() {
            debug!(
                "Forced offline, not sending {} to {}",
                request.method, request.store_group
            );
            return Err(Error::remote(502, "Fake bad gateway"));
        }
        debug!(
            "Sending {} {} via {}",
            request.method,
            request.store_group,
            self.remote.name()
        );
        let method = request.method;
        let group = request.store_group.clone();
        let response = self.remote.send(request).await?;
        if method == Method::Delete {
            return Ok(response);
        }
        self.parse_response(&group, response)
    }

    fn parse_response(&self, group: &StoreGroup, response: Value) -> Result<Value> {
        let payload = self.config.unwrap_response(response)?;
        match &self.parser {
            Some(parser) => parser(group, payload),
            None => Ok(payload),
        }
    }

    /// Turn an offline remote failure into `Connectivity`; leave others as is.
    fn surface(&self, err: Error) -> Error {
        match err {
            Error::Remote { status, message } if self.config.is_offline_status(status) => {
                Error::Connectivity { status, message }
            }
            other => other,
        }
    }

    /// `Ok` when the failure is absorbed and the caller continues locally.
    fn degrade(&self, err: Error, absorb: Absorb, method: Method, group: &StoreGroup) -> Result<()> {
        match self.surface(err) {
            Error::Connectivity { status, message } if absorb == Absorb::Yes => {
                warn!(
                    "Remote unreachable for {} in {} (status {}): {}; continuing locally",
                    method, group, status, message
                );
                Ok(())
            }
            other => Err(other),
        }
    }

    async fn reads_gated(&self, group: &StoreGroup) -> Result<bool> {
        match self.config.read_gate {
            ReadGate::Global => self.journal.has_dirty_or_destroyed().await,
            ReadGate::Group => self.journal.has_dirty_or_destroyed_in(group).await,
        }
    }

    async fn remote_only(&self, method: Method, entity: &mut Entity) -> Result<SyncOutcome> {
        let group = entity.store_group().clone();
        let request = match method {
            Method::Create => RemoteRequest::create(group, entity.to_payload()),
            Method::Read => RemoteRequest::read(group, require_id(entity, method)?),
            Method::Update => {
                RemoteRequest::update(group, require_id(entity, method)?, entity.to_payload())
            }
            Method::Delete => RemoteRequest::delete(group, require_id(entity, method)?),
        };

        let response = self
            .call_remote(request)
            .await
            .map_err(|err| self.surface(err))?;
        if method != Method::Delete {
            entity.merge_response(&response);
        }
        Ok(SyncOutcome::remote(response))
    }

    async fn remote_fetch(
        &self,
        collection: &mut Collection,
        options: &SyncOptions,
    ) -> Result<SyncOutcome> {
        let response = self
            .call_remote(RemoteRequest::read_all(collection.store_group().clone()))
            .await
            .map_err(|err| self.surface(err))?;
        let fetched = self.entities_from_response(collection, &response)?;
        Self::apply_fetch(collection, fetched, options);
        Ok(SyncOutcome::remote(response))
    }

    fn entities_from_response(
        &self,
        collection: &Collection,
        response: &Value,
    ) -> Result<Vec<Entity>> {
        let Value::Array(items) = response else {
            return Err(Error::Validation(format!(
                "remote read of {} did not return an array",
                collection.store_group()
            )));
        };

        items
            .iter()
            .map(|item| {
                let fetched = Entity::from_remote(
                    collection.store_group().clone(),
                    collection.id_attribute(),
                    item,
                )?
                .with_routing(collection.routing());
                Ok(
                    match fetched.id().and_then(|id| collection.get(id.as_str())) {
                        Some(existing) => existing.updated_with_response(item),
                        None => fetched,
                    },
                )
            })
            .collect()
    }

    fn apply_fetch(collection: &mut Collection, fetched: Vec<Entity>, options: &SyncOptions) {
        if options.add {
            for entity in fetched {
                collection.upsert(entity);
            }
        } else {
            collection.set_entities(fetched);
        }
    }

    // ---- local path ----

    async fn local_create(&self, entity: &mut Entity, options: &SyncOptions) -> Result<Value> {
        if options.add && !options.merge {
            let entry = self.journal.find_dirty(entity).await?;
            return Ok(match entry {
                Some(entry) => serde_json::to_value(entry)?,
                None => Value::Null,
            });
        }

        if entity.id().is_none() {
            entity.set_id(Some(ModelId::temporary()));
        }
        self.local.insert(entity.to_record()?).await?;
        if options.dirty {
            self.journal.add_dirty(entity).await?;
        }
        debug!(
            "Created {} locally in {}{}",
            entity.id().map(ModelId::as_str).unwrap_or_default(),
            entity.store_group(),
            if options.dirty { " (dirty)" } else { "" }
        );
        Ok(entity.to_payload())
    }

    async fn local_read(&self, entity: &mut Entity) -> Result<Value> {
        let id = require_id(entity, Method::Read)?;
        let record = self
            .local
            .get(entity.store_group(), &id)
            .await?
            .filter(|record| !record.deleted)
            .ok_or_else(|| {
                Error::NotFound(format!("{} in {}", id, entity.store_group()))
            })?;

        entity.set_id(Some(record.id));
        for (key, value) in record.attributes {
            entity.set(key, value);
        }
        Ok(entity.to_payload())
    }

    async fn local_fetch(
        &self,
        collection: &mut Collection,
        options: &SyncOptions,
    ) -> Result<Value> {
        let entities: Vec<Entity> = self
            .local
            .list_live(collection.store_group())
            .await?
            .into_iter()
            .map(|record| {
                Entity::from_record(record, collection.id_attribute())
                    .with_routing(collection.routing())
            })
            .collect();

        let value = Value::Array(entities.iter().map(Entity::to_payload).collect());
        Self::apply_fetch(collection, entities, options);
        Ok(value)
    }

    async fn local_update(&self, entity: &Entity, options: &SyncOptions) -> Result<Value> {
        self.local.put(entity.to_record()?).await?;
        if options.dirty {
            self.journal.add_dirty(entity).await?;
        } else {
            self.journal.remove_dirty(entity).await?;
        }
        Ok(entity.to_payload())
    }

    async fn local_delete(&self, entity: &Entity, options: &SyncOptions) -> Result<Value> {
        let id = require_id(entity, Method::Delete)?;
        let group = entity.store_group();

        if options.dirty && !entity.has_temp_id() {
            // Keep the record until the remote confirms the deletion.
            self.local.mark_deleted(group, &id).await?;
            self.journal.add_destroyed(entity).await?;
            self.journal.remove_dirty(entity).await?;
            debug!("Queued deletion of {} in {}", id, group);
        } else {
            self.local.delete(group, &id).await?;
            self.journal.remove_dirty(entity).await?;
            self.journal.remove_destroyed(entity).await?;
            debug!("Deleted {} locally in {}", id, group);
        }
        Ok(Value::Null)
    }

    /// Delete every local record of a group that has no pending change.
    async fn clear_synced(&self, group: &StoreGroup) -> Result<()> {
        let mut pending: HashSet<String> = HashSet::new();
        for entry in self.journal.find_all_dirty(group).await? {
            pending.insert(entry.model_id);
        }
        for entry in self.journal.find_all_destroyed(group).await? {
            pending.insert(entry.model_id);
        }

        for record in self.local.list(group).await? {
            if !pending.contains(record.id.as_str()) {
                self.local.delete(group, record.id.as_str()).await?;
            }
        }
        Ok(())
    }

    // ---- dual path ----

    pub(crate) async fn dual_create(
        &self,
        entity: &mut Entity,
        options: &SyncOptions,
        absorb: Absorb,
    ) -> Result<SyncOutcome> {
        let request = RemoteRequest::create(entity.store_group().clone(), entity.to_payload());
        match self.call_remote(request).await {
            Ok(response) => {
                let mut created = entity.updated_with_response(&response);
                if created.id().is_none() {
                    warn!(
                        "Remote create in {} returned no identifier",
                        entity.store_group()
                    );
                }
                self.local_create(&mut created, &options.clean()).await?;
                *entity = created;
                Ok(SyncOutcome::remote(response))
            }
            Err(err) => {
                self.degrade(err, absorb, Method::Create, entity.store_group())?;
                let value = self.local_create(entity, &options.degraded()).await?;
                Ok(SyncOutcome::local(value))
            }
        }
    }

    async fn dual_read(&self, entity: &mut Entity, options: &SyncOptions) -> Result<SyncOutcome> {
        if self.reads_gated(entity.store_group()).await? {
            debug!(
                "Changes pending, serving read in {} locally",
                entity.store_group()
            );
            return Ok(SyncOutcome::local(self.local_read(entity).await?));
        }

        let request = RemoteRequest::read(
            entity.store_group().clone(),
            require_id(entity, Method::Read)?,
        );
        match self.call_remote(request).await {
            Ok(response) => {
                let fetched = entity.updated_with_response(&response);
                self.local_update(&fetched, &options.clean()).await?;
                *entity = fetched;
                Ok(SyncOutcome::remote(response))
            }
            Err(err) => {
                self.degrade(err, Absorb::Yes, Method::Read, entity.store_group())?;
                Ok(SyncOutcome::local(self.local_read(entity).await?))
            }
        }
    }

    async fn dual_fetch(
        &self,
        collection: &mut Collection,
        options: &SyncOptions,
    ) -> Result<SyncOutcome> {
        let group = collection.store_group().clone();
        if self.reads_gated(&group).await? {
            debug!("Changes pending, serving fetch of {} locally", group);
            return Ok(SyncOutcome::local(
                self.local_fetch(collection, options).await?,
            ));
        }

        match self.call_remote(RemoteRequest::read_all(group.clone())).await {
            Ok(response) => {
                let fetched = self.entities_from_response(collection, &response)?;
                if !options.add {
                    self.clear_synced(&group).await?;
                }
                for entity in &fetched {
                    self.local_update(entity, &options.clean()).await?;
                }
                debug!("Fetched {} records of {} from remote", fetched.len(), group);
                Self::apply_fetch(collection, fetched, options);
                Ok(SyncOutcome::remote(response))
            }
            Err(err) => {
                self.degrade(err, Absorb::Yes, Method::Read, &group)?;
                Ok(SyncOutcome::local(
                    self.local_fetch(collection, options).await?,
                ))
            }
        }
    }

    pub(crate) async fn dual_update(
        &self,
        entity: &mut Entity,
        options: &SyncOptions,
        absorb: Absorb,
    ) -> Result<SyncOutcome> {
        let id = entity.id().cloned().ok_or_else(|| {
            Error::Validation(format!(
                "update in {} requires an entity identifier",
                entity.store_group()
            ))
        })?;
        if id.is_temporary() {
            return self.promote(entity, id, options, absorb).await;
        }

        let request =
            RemoteRequest::update(entity.store_group().clone(), id.as_str(), entity.to_payload());
        match self.call_remote(request).await {
            Ok(response) => {
                let updated = entity.updated_with_response(&response);
                self.local_update(&updated, &options.clean()).await?;
                *entity = updated;
                Ok(SyncOutcome::remote(response))
            }
            Err(err) => {
                self.degrade(err, absorb, Method::Update, entity.store_group())?;
                let value = self.local_update(entity, &options.degraded()).await?;
                Ok(SyncOutcome::local(value))
            }
        }
    }

    /// Push an entity that only exists locally as a remote create.
    async fn promote(
        &self,
        entity: &mut Entity,
        temporary: ModelId,
        options: &SyncOptions,
        absorb: Absorb,
    ) -> Result<SyncOutcome> {
        entity.set_id(None);
        let request = RemoteRequest::create(entity.store_group().clone(), entity.to_payload());
        let result = self.call_remote(request).await;
        entity.set_id(Some(temporary.clone()));

        match result {
            Ok(response) => {
                let promoted = entity.updated_with_response(&response);
                if promoted.has_temp_id() {
                    return Err(Error::Validation(format!(
                        "remote create for {} in {} returned no '{}'",
                        temporary,
                        entity.store_group(),
                        entity.id_attribute()
                    )));
                }

                self.local.put(promoted.to_record()?).await?;
                self.local_delete(entity, &SyncOptions::new()).await?;
                info!(
                    "Promoted {} to {} in {}",
                    temporary,
                    promoted.id().map(ModelId::as_str).unwrap_or_default(),
                    entity.store_group()
                );
                *entity = promoted;
                Ok(SyncOutcome::remote(response))
            }
            Err(err) => {
                self.degrade(err, absorb, Method::Create, entity.store_group())?;
                let value = self.local_update(entity, &options.degraded()).await?;
                Ok(SyncOutcome::local(value))
            }
        }
    }

    pub(crate) async fn dual_delete(
        &self,
        entity: &Entity,
        options: &SyncOptions,
        absorb: Absorb,
    ) -> Result<SyncOutcome> {
        let id = require_id(entity, Method::Delete)?;
        if entity.has_temp_id() {
            debug!("{} never reached the remote, deleting locally", id);
            return Ok(SyncOutcome::local(
                self.local_delete(entity, &options.clean()).await?,
            ));
        }

        match self
            .call_remote(RemoteRequest::delete(entity.store_group().clone(), id))
            .await
        {
            Ok(response) => {
                self.local_delete(entity, &options.clean()).await?;
                Ok(SyncOutcome::remote(response))
            }
            Err(err) => {
                self.degrade(err, absorb, Method::Delete, entity.store_group())?;
                let value = self.local_delete(entity, &options.degraded()).await?;
                Ok(SyncOutcome::local(value))
            }
        }
    }

    /// Create or update along the dual path regardless of routing.
    pub(crate) async fn dual_save(
        &self,
        entity: &mut Entity,
        options: &SyncOptions,
        absorb: Absorb,
    ) -> Result<SyncOutcome> {
        if entity.id().is_none() {
            self.dual_create(entity, options, absorb).await
        } else {
            self.dual_update(entity, options, absorb).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dualstore_storage::{MemoryRemote, MemoryStore};
    use serde_json::json;

    fn customers() -> StoreGroup {
        StoreGroup::new("customers").unwrap()
    }

    fn storage() -> DualStorage<MemoryStore, MemoryRemote> {
        DualStorage::new(
            MemoryStore::new(),
            MemoryRemote::new(),
            JournalStore::in_memory().unwrap(),
            DualStorageConfig::default(),
        )
    }

    fn tom() -> Entity {
        Entity::new(customers())
            .with_attributes(json!({"name": "Tom"}))
            .unwrap()
    }

    #[tokio::test]
    async fn test_online_create_stores_permanent_record() {
        let storage = storage();
        let mut entity = tom();

        let outcome = storage.create(&mut entity, &SyncOptions::new()).await.unwrap();

        assert_eq!(outcome.source, Source::Remote);
        assert_eq!(outcome.value["id"], "srv-1");
        assert_eq!(entity.id(), Some(&ModelId::Permanent("srv-1".into())));
        assert!(storage.local().get(&customers(), "srv-1").await.unwrap().is_some());
        assert!(!storage.has_dirty_or_destroyed().await.unwrap());
    }

    #[tokio::test]
    async fn test_application_error_is_propagated_without_journal() {
        let storage = storage();
        storage.remote().fail_next(500);
        let mut entity = tom();

        let err = storage
            .create(&mut entity, &SyncOptions::new())
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(500));
        assert!(!err.is_connectivity());
        assert!(entity.id().is_none());
        assert!(storage.local().is_empty());
        assert!(!storage.has_dirty_or_destroyed().await.unwrap());
    }

    #[tokio::test]
    async fn test_status_zero_is_always_offline() {
        let storage = DualStorage::new(
            MemoryStore::new(),
            MemoryRemote::new(),
            JournalStore::in_memory().unwrap(),
            DualStorageConfig::new().with_offline_status_codes([503]),
        );
        storage.remote().go_offline(0);
        let mut entity = tom();

        let outcome = storage.create(&mut entity, &SyncOptions::new()).await.unwrap();

        assert_eq!(outcome.source, Source::Local);
        assert!(entity.has_temp_id());
    }

    #[tokio::test]
    async fn test_custom_offline_codes_replace_defaults() {
        let storage = DualStorage::new(
            MemoryStore::new(),
            MemoryRemote::new(),
            JournalStore::in_memory().unwrap(),
            DualStorageConfig::new().with_offline_status_codes([503]),
        );
        storage.remote().fail_next(502);

        let err = storage
            .create(&mut tom(), &SyncOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(502));
    }

    #[tokio::test]
    async fn test_offline_create_with_failing_store_leaves_no_journal() {
        let storage = storage();
        storage.remote().go_offline(502);
        storage.local().set_fail_writes(true);
        let mut entity = tom();

        let err = storage
            .create(&mut entity, &SyncOptions::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::LocalStorage(_)));
        assert!(storage.local().is_empty());
        assert!(!storage.has_dirty_or_destroyed().await.unwrap());
    }

    #[tokio::test]
    async fn test_online_update_with_failing_store_propagates() {
        let storage = storage();
        let mut entity = tom();
        storage.create(&mut entity, &SyncOptions::new()).await.unwrap();

        storage.local().set_fail_writes(true);
        entity.set("name", json!("Tim"));
        let err = storage
            .update(&mut entity, &SyncOptions::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::LocalStorage(_)));
        assert!(!err.is_connectivity());
        assert!(!storage.has_dirty_or_destroyed().await.unwrap());
        let record = storage.local().get(&customers(), "srv-1").await.unwrap().unwrap();
        assert_eq!(record.attributes["name"], "Tom");
    }

    #[tokio::test]
    async fn test_response_parser_reshapes_remote_payloads() {
        let storage = DualStorage::new(
            MemoryStore::new(),
            MemoryRemote::new().with_envelope("customer"),
            JournalStore::in_memory().unwrap(),
            DualStorageConfig::default(),
        )
        .with_response_parser(|group, mut response| {
            response
                .get_mut("customer")
                .map(Value::take)
                .ok_or_else(|| Error::Validation(format!("unexpected payload from {}", group)))
        });
        let mut entity = tom();

        let outcome = storage.create(&mut entity, &SyncOptions::new()).await.unwrap();

        assert_eq!(outcome.value["id"], "srv-1");
        assert_eq!(entity.id(), Some(&ModelId::Permanent("srv-1".into())));
        let record = storage.local().get(&customers(), "srv-1").await.unwrap().unwrap();
        assert_eq!(record.attributes["name"], "Tom");
        assert!(!record.attributes.contains_key("customer"));

        let mut copy = Entity::placeholder(customers(), ModelId::Permanent("srv-1".into()));
        let outcome = storage.read(&mut copy, &SyncOptions::new()).await.unwrap();
        assert_eq!(outcome.source, Source::Remote);
        assert_eq!(copy.get("name"), Some(&json!("Tom")));
    }

    #[tokio::test]
    async fn test_force_offline_never_contacts_remote() {
        let storage = storage();
        storage.set_force_offline(true);
        let mut entity = tom();

        let outcome = storage.create(&mut entity, &SyncOptions::new()).await.unwrap();

        assert_eq!(outcome.source, Source::Local);
        assert_eq!(storage.remote().request_count(), 0);
        assert!(storage
            .journal()
            .find_dirty(&entity)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_local_routing_skips_remote_and_journal() {
        let storage = storage();
        let mut entity = tom().with_routing(Routing::Local);

        let outcome = storage.create(&mut entity, &SyncOptions::new()).await.unwrap();

        assert_eq!(outcome.source, Source::Local);
        assert!(entity.has_temp_id());
        assert_eq!(storage.remote().request_count(), 0);
        assert!(!storage.has_dirty_or_destroyed().await.unwrap());
    }

    #[tokio::test]
    async fn test_remote_routing_surfaces_connectivity() {
        let storage = storage();
        storage.remote().go_offline(502);
        let mut entity = tom().with_routing(Routing::Remote);

        let err = storage
            .create(&mut entity, &SyncOptions::new())
            .await
            .unwrap_err();

        assert!(err.is_connectivity());
        assert!(storage.local().is_empty());
        assert!(!storage.has_dirty_or_destroyed().await.unwrap());
    }

    #[tokio::test]
    async fn test_remote_routing_never_writes_locally() {
        let storage = storage();
        let mut entity = tom().with_routing(Routing::Remote);

        let outcome = storage.create(&mut entity, &SyncOptions::new()).await.unwrap();

        assert_eq!(outcome.source, Source::Remote);
        assert_eq!(entity.id(), Some(&ModelId::Permanent("srv-1".into())));
        assert!(storage.local().is_empty());
    }

    #[tokio::test]
    async fn test_additive_local_create_is_a_lookup() {
        let storage = storage();
        let mut entity = tom().with_routing(Routing::Local);

        let outcome = storage
            .create(&mut entity, &SyncOptions::additive())
            .await
            .unwrap();

        assert_eq!(outcome.value, Value::Null);
        assert!(storage.local().is_empty());

        let merged = SyncOptions {
            merge: true,
            ..SyncOptions::additive()
        };
        storage.create(&mut entity, &merged).await.unwrap();
        assert_eq!(storage.local().len(), 1);
    }

    #[tokio::test]
    async fn test_read_without_id_is_validation_error() {
        let storage = storage();
        let err = storage
            .read(&mut tom(), &SyncOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_online_read_refreshes_local_copy() {
        let storage = storage();
        storage
            .remote()
            .seed(&customers(), json!({"id": "c1", "name": "Remote"}))
            .unwrap();
        let mut entity = Entity::placeholder(customers(), ModelId::Permanent("c1".into()));

        let outcome = storage.read(&mut entity, &SyncOptions::new()).await.unwrap();

        assert_eq!(outcome.source, Source::Remote);
        assert_eq!(entity.get("name"), Some(&json!("Remote")));
        let record = storage.local().get(&customers(), "c1").await.unwrap().unwrap();
        assert_eq!(record.attributes["name"], "Remote");
    }

    #[tokio::test]
    async fn test_offline_read_falls_back_to_local() {
        let storage = storage();
        let mut entity = tom();
        storage.create(&mut entity, &SyncOptions::new()).await.unwrap();
        storage.remote().go_offline(408);

        let mut copy = Entity::placeholder(customers(), ModelId::Permanent("srv-1".into()));
        let outcome = storage.read(&mut copy, &SyncOptions::new()).await.unwrap();

        assert_eq!(outcome.source, Source::Local);
        assert_eq!(copy.get("name"), Some(&json!("Tom")));
    }

    #[tokio::test]
    async fn test_fetch_replace_drops_stale_local_records() {
        let storage = storage();
        let mut stale = tom().with_routing(Routing::Local);
        storage.create(&mut stale, &SyncOptions::new()).await.unwrap();
        storage
            .remote()
            .seed(&customers(), json!({"id": "c1", "name": "Ann"}))
            .unwrap();

        let mut collection = Collection::new(customers());
        let outcome = storage
            .fetch(&mut collection, &SyncOptions::new())
            .await
            .unwrap();

        assert_eq!(outcome.source, Source::Remote);
        assert_eq!(collection.len(), 1);
        let records = storage.local().list(&customers()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id.as_str(), "c1");
    }

    #[tokio::test]
    async fn test_fetch_additive_keeps_members() {
        let storage = storage();
        storage
            .remote()
            .seed(&customers(), json!({"id": "c2", "name": "Bob"}))
            .unwrap();
        let mut collection = Collection::new(customers());
        collection.upsert(
            collection
                .new_entity()
                .with_id(ModelId::Permanent("c1".into())),
        );

        storage
            .fetch(&mut collection, &SyncOptions::additive())
            .await
            .unwrap();

        assert_eq!(collection.len(), 2);
        assert!(collection.get("c1").is_some());
        assert!(collection.get("c2").is_some());
    }

    #[tokio::test]
    async fn test_online_update_clears_dirty() {
        let storage = storage();
        let mut entity = tom();
        storage.create(&mut entity, &SyncOptions::new()).await.unwrap();

        storage.remote().go_offline(502);
        entity.set("name", json!("Tim"));
        storage.update(&mut entity, &SyncOptions::new()).await.unwrap();
        assert!(storage.journal().find_dirty(&entity).await.unwrap().is_some());

        storage.remote().go_online();
        let outcome = storage.update(&mut entity, &SyncOptions::new()).await.unwrap();

        assert_eq!(outcome.source, Source::Remote);
        assert!(storage.journal().find_dirty(&entity).await.unwrap().is_none());
        assert_eq!(
            storage.remote().records(&customers())[0]["name"],
            json!("Tim")
        );
    }

    #[tokio::test]
    async fn test_update_with_temporary_id_promotes() {
        let storage = storage();
        storage.remote().go_offline(502);
        let mut entity = tom();
        storage.create(&mut entity, &SyncOptions::new()).await.unwrap();
        let temporary = entity.id().cloned().unwrap();

        storage.remote().go_online();
        entity.set("age", json!(30));
        let outcome = storage.save(&mut entity, &SyncOptions::new()).await.unwrap();

        assert_eq!(outcome.source, Source::Remote);
        assert_eq!(entity.id(), Some(&ModelId::Permanent("srv-1".into())));
        assert!(storage
            .local()
            .get(&customers(), temporary.as_str())
            .await
            .unwrap()
            .is_none());
        let record = storage.local().get(&customers(), "srv-1").await.unwrap().unwrap();
        assert_eq!(record.attributes["age"], 30);
        assert!(!storage.has_dirty_or_destroyed().await.unwrap());

        // The temporary id is never sent to the remote.
        let create = &storage.remote().requests()[1];
        assert_eq!(create.method, Method::Create);
        assert!(create.body.as_ref().unwrap().get("id").is_none());
    }

    #[tokio::test]
    async fn test_offline_promotion_restores_temporary_id() {
        let storage = storage();
        storage.remote().go_offline(502);
        let mut entity = tom();
        storage.create(&mut entity, &SyncOptions::new()).await.unwrap();
        let temporary = entity.id().cloned().unwrap();

        entity.set("age", json!(31));
        let outcome = storage.update(&mut entity, &SyncOptions::new()).await.unwrap();

        assert_eq!(outcome.source, Source::Local);
        assert_eq!(entity.id(), Some(&temporary));
        let record = storage
            .local()
            .get(&customers(), temporary.as_str())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.attributes["age"], 31);
        assert_eq!(
            storage.journal().count(JournalKind::Dirty, None).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_online_delete_clears_everything() {
        let storage = storage();
        let mut entity = tom();
        storage.create(&mut entity, &SyncOptions::new()).await.unwrap();

        let outcome = storage.delete(&entity, &SyncOptions::new()).await.unwrap();

        assert_eq!(outcome.source, Source::Remote);
        assert!(storage.local().is_empty());
        assert!(storage.remote().records(&customers()).is_empty());
        assert!(!storage.has_dirty_or_destroyed().await.unwrap());
    }

    #[tokio::test]
    async fn test_dispatch_covers_vocabulary() {
        let storage = storage();
        storage.set_force_offline(true);
        let mut entity = tom();

        storage
            .sync(Operation::Create, Target::Entity(&mut entity), &SyncOptions::new())
            .await
            .unwrap();
        let pending = storage
            .sync(Operation::HasDirtyOrDestroyed, Target::Global, &SyncOptions::new())
            .await
            .unwrap();
        assert_eq!(pending.value, Value::Bool(true));

        let reset = storage
            .sync(Operation::Reset, Target::Group(customers()), &SyncOptions::new())
            .await
            .unwrap();
        assert_eq!(reset.value, json!(1));

        storage
            .sync(Operation::CloseAll, Target::Global, &SyncOptions::new())
            .await
            .unwrap();
        storage
            .sync(Operation::Clear, Target::Global, &SyncOptions::new())
            .await
            .unwrap();

        let err = storage
            .sync(Operation::Update, Target::Global, &SyncOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_reconcile_repairs_drift() {
        let storage = storage();

        // Dirty entry without a local record.
        let ghost = Entity::placeholder(customers(), ModelId::temporary());
        storage.journal().add_dirty(&ghost).await.unwrap();

        // Flagged record without a destroyed entry.
        let flagged = tom().with_id(ModelId::Permanent("srv-7".into()));
        storage.local().insert(flagged.to_record().unwrap()).await.unwrap();
        storage.local().mark_deleted(&customers(), "srv-7").await.unwrap();

        let repaired = storage.reconcile(&customers()).await.unwrap();

        assert_eq!(repaired, 2);
        assert!(storage.journal().find_dirty(&ghost).await.unwrap().is_none());
        assert!(storage
            .journal()
            .find_destroyed(&flagged)
            .await
            .unwrap()
            .is_some());
        assert_eq!(storage.reconcile(&customers()).await.unwrap(), 0);
    }
}
