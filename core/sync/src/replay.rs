//! Bulk replay of pending changes against the remote.
//!
//! Entries are replayed one at a time in journal order. The first failure
//! stops the replay; entries not yet attempted stay queued. Connectivity
//! failures are not absorbed here, so an unreachable remote stops the
//! replay like any other error.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use dualstore_common::{Collection, Entity, Error, ModelId, Result, SyncOptions};
use dualstore_storage::{LocalStore, RemoteTransport};

use crate::engine::{Absorb, DualStorage};

/// Remote responses keyed by entity identifier.
pub type ResponseMap = BTreeMap<String, Value>;

/// Outcome of a full dirty-then-destroyed replay.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplayReport {
    /// Responses of replayed saves, keyed by identifier after the save.
    pub dirty: ResponseMap,
    /// Responses of replayed deletions.
    pub destroyed: ResponseMap,
}

impl ReplayReport {
    /// Total number of replayed entries.
    pub fn len(&self) -> usize {
        self.dirty.len() + self.destroyed.len()
    }

    /// Check if nothing was replayed.
    pub fn is_empty(&self) -> bool {
        self.dirty.is_empty() && self.destroyed.is_empty()
    }
}

fn interrupted(model_id: String, responses: &ResponseMap, source: Error) -> Error {
    warn!("Replay stopped at {}: {}", model_id, source);
    Error::ReplayInterrupted {
        model_id,
        completed: responses.keys().cloned().collect(),
        source: Box::new(source),
    }
}

impl<L: LocalStore + ?Sized, R: RemoteTransport + ?Sized> DualStorage<L, R> {
    /// Re-issue a save for every dirty member of `collection`.
    ///
    /// Members are matched to entries by identifier; entries without a
    /// member are skipped and stay queued. Promoted members carry their
    /// permanent identifier afterwards.
    ///
    /// # Errors
    /// - `ReplayInterrupted` wrapping the first failure
    pub async fn sync_dirty(&self, collection: &mut Collection) -> Result<ResponseMap> {
        let group = collection.store_group().clone();
        let entries = self.journal().find_all_dirty(&group).await?;
        info!("Replaying {} dirty entries of {}", entries.len(), group);

        let mut responses = ResponseMap::new();
        for entry in entries {
            let Some(entity) = collection.get_mut(&entry.model_id) else {
                debug!("{} not in collection, leaving it queued", entry.model_id);
                continue;
            };

            match self
                .dual_save(entity, &SyncOptions::new(), Absorb::No)
                .await
            {
                Ok(outcome) => {
                    let key = entity
                        .id()
                        .map(|id| id.as_str().to_string())
                        .unwrap_or(entry.model_id);
                    responses.insert(key, outcome.value);
                }
                Err(err) => return Err(interrupted(entry.model_id, &responses, err)),
            }
        }

        info!("Replayed {} dirty entries of {}", responses.len(), group);
        Ok(responses)
    }

    /// Re-issue a delete for every destroyed entry of the collection's group.
    ///
    /// # Errors
    /// - `ReplayInterrupted` wrapping the first failure
    pub async fn sync_destroyed(&self, collection: &Collection) -> Result<ResponseMap> {
        let group = collection.store_group();
        let entries = self.journal().find_all_destroyed(group).await?;
        info!("Replaying {} destroyed entries of {}", entries.len(), group);

        let mut responses = ResponseMap::new();
        for entry in entries {
            let placeholder =
                Entity::placeholder(group.clone(), ModelId::Permanent(entry.model_id.clone()))
                    .with_id_attribute(collection.id_attribute());

            match self
                .dual_delete(&placeholder, &SyncOptions::new(), Absorb::No)
                .await
            {
                Ok(outcome) => {
                    responses.insert(entry.model_id, outcome.value);
                }
                Err(err) => return Err(interrupted(entry.model_id, &responses, err)),
            }
        }

        info!("Replayed {} destroyed entries of {}", responses.len(), group);
        Ok(responses)
    }

    /// Replay dirty entries, then destroyed ones.
    ///
    /// A failure in the destroyed phase does not undo the dirty phase.
    pub async fn sync_dirty_and_destroyed(
        &self,
        collection: &mut Collection,
    ) -> Result<ReplayReport> {
        let dirty = self.sync_dirty(collection).await?;
        let destroyed = self.sync_destroyed(collection).await?;
        Ok(ReplayReport { dirty, destroyed })
    }
}
