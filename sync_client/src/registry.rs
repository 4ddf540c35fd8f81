//! Entity registry.
//!
//! Maps participant ids to vehicles. At most one record per id, at most one
//! local record. Remote records are spawned through a [`BodyFactory`] at a
//! configured spawn point.

use std::{collections::HashMap, time::Instant};

use sync_shared::{
    body::{BodyFactory, EntityBody},
    entity::{EntityId, SpawnPoint},
    wire::SyncSample,
};
use tracing::{debug, info, warn};

use crate::entity_sync::{EntitySync, SyncMode, SyncTuning};

/// One participating vehicle.
pub struct EntityRecord {
    pub id: EntityId,
    pub sync: EntitySync,
    pub body: Box<dyn EntityBody>,
}

impl EntityRecord {
    pub fn new(id: EntityId, mode: SyncMode, tuning: SyncTuning, body: Box<dyn EntityBody>) -> Self {
        let sync = EntitySync::new(mode, tuning, body.as_ref());
        Self { id, sync, body }
    }

    pub fn local(id: EntityId, tuning: SyncTuning, body: Box<dyn EntityBody>) -> Self {
        Self::new(id, SyncMode::Local, tuning, body)
    }

    pub fn remote(id: EntityId, tuning: SyncTuning, body: Box<dyn EntityBody>) -> Self {
        Self::new(id, SyncMode::Remote, tuning, body)
    }

    pub fn is_local(&self) -> bool {
        self.sync.is_local()
    }
}

impl std::fmt::Debug for EntityRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRecord")
            .field("id", &self.id)
            .field("mode", &self.sync.mode())
            .finish()
    }
}

/// Result of routing an inbound sample to its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Stored as the remote record's new target.
    Applied,
    /// Addressed to the local record; dropped.
    RejectedLocal,
    /// No record with that id; dropped.
    Unknown,
}

pub struct EntityRegistry {
    records: HashMap<EntityId, EntityRecord>,
    local: Option<EntityId>,
    spawn_points: Vec<SpawnPoint>,
    factory: Box<dyn BodyFactory>,
    tuning: SyncTuning,
    racing: bool,
}

impl EntityRegistry {
    pub fn new(spawn_points: Vec<SpawnPoint>, tuning: SyncTuning, factory: Box<dyn BodyFactory>) -> Self {
        Self {
            records: HashMap::new(),
            local: None,
            spawn_points,
            factory,
            tuning,
            racing: false,
        }
    }

    pub fn tuning(&self) -> SyncTuning {
        self.tuning
    }

    /// Adds a record. Empty ids, duplicates (first write wins) and a second
    /// local record are rejected.
    pub fn register(&mut self, mut record: EntityRecord) -> bool {
        if record.id.is_empty() {
            warn!("Rejecting entity with empty id");
            return false;
        }
        if self.records.contains_key(&record.id) {
            debug!(id = %record.id, "Entity already registered");
            return false;
        }
        if record.is_local() {
            if let Some(existing) = &self.local {
                warn!(id = %record.id, local = %existing, "Rejecting second local entity");
                return false;
            }
            record.body.set_input_enabled(self.racing);
            self.local = Some(record.id.clone());
        }
        info!(id = %record.id, local = record.is_local(), "Entity registered");
        self.records.insert(record.id.clone(), record);
        true
    }

    /// Removes and returns the record, if present.
    pub fn unregister(&mut self, id: &EntityId) -> Option<EntityRecord> {
        let record = self.records.remove(id)?;
        if self.local.as_ref() == Some(id) {
            self.local = None;
        }
        info!(id = %id, "Entity unregistered");
        Some(record)
    }

    /// Drops every remote record, keeping the local one. Returns how many
    /// were removed.
    pub fn clear_remote(&mut self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| r.is_local());
        let removed = before - self.records.len();
        if removed > 0 {
            info!(removed, "Remote entities cleared");
        }
        removed
    }

    /// Routes an inbound sample to its record.
    pub fn dispatch(&mut self, sample: &SyncSample) -> DispatchOutcome {
        let Some(record) = self.records.get_mut(&sample.id) else {
            debug!(id = %sample.id, "Update for unknown entity");
            return DispatchOutcome::Unknown;
        };
        if record.sync.receive(sample) {
            DispatchOutcome::Applied
        } else {
            warn!(id = %sample.id, "Rejecting inbound update for local entity");
            DispatchOutcome::RejectedLocal
        }
    }

    /// Spawns a remote record. Slots are handed out round-robin by current
    /// registry size, not by availability.
    pub fn spawn_remote(&mut self, id: &EntityId) -> bool {
        if id.is_empty() || self.records.contains_key(id) {
            return false;
        }
        if self.spawn_points.is_empty() {
            warn!(id = %id, "No spawn points; not spawning remote entity");
            return false;
        }
        let slot = self.records.len() % self.spawn_points.len();
        let at = self.spawn_points[slot];
        let body = self.factory.spawn(id, &at);
        info!(id = %id, slot, "Spawning remote entity");
        self.register(EntityRecord::remote(id.clone(), self.tuning, body))
    }

    /// Promotes a record to local or demotes it to remote.
    pub fn set_local(&mut self, id: &EntityId, local: bool) -> bool {
        if local {
            if let Some(existing) = &self.local {
                if existing != id {
                    warn!(id = %id, local = %existing, "Another entity is already local");
                    return false;
                }
            }
        }
        let racing = self.racing;
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        if local {
            record.sync.set_mode(SyncMode::Local, record.body.as_ref());
            record.body.set_input_enabled(racing);
            self.local = Some(id.clone());
        } else {
            record.sync.set_mode(SyncMode::Remote, record.body.as_ref());
            record.body.set_input_enabled(false);
            if self.local.as_ref() == Some(id) {
                self.local = None;
            }
        }
        true
    }

    /// Moves a record to a new id, e.g. when the local vehicle adopts the id
    /// the server assigned. Fails if `new` is taken.
    pub fn rekey(&mut self, old: &EntityId, new: &EntityId) -> bool {
        if old == new {
            return self.records.contains_key(old);
        }
        if new.is_empty() || self.records.contains_key(new) {
            warn!(old = %old, new = %new, "Cannot rekey entity");
            return false;
        }
        let Some(mut record) = self.records.remove(old) else {
            return false;
        };
        record.id = new.clone();
        if self.local.as_ref() == Some(old) {
            self.local = Some(new.clone());
        }
        info!(old = %old, new = %new, "Entity rekeyed");
        self.records.insert(new.clone(), record);
        true
    }

    /// Opens the race gate: local input enabled.
    pub fn start_race(&mut self) {
        self.set_racing(true);
    }

    pub fn stop_race(&mut self) {
        self.set_racing(false);
    }

    fn set_racing(&mut self, racing: bool) {
        if self.racing == racing {
            return;
        }
        self.racing = racing;
        info!(racing, "Race gate");
        if let Some(id) = &self.local {
            if let Some(record) = self.records.get_mut(id) {
                record.body.set_input_enabled(racing);
            }
        }
    }

    pub fn is_racing(&self) -> bool {
        self.racing
    }

    /// Advances every record. Returns the local sample if one is due.
    pub fn tick(&mut self, dt: f32, now: Instant, clock: f64) -> Option<SyncSample> {
        let mut outbound = None;
        for record in self.records.values_mut() {
            if record.is_local() {
                outbound = record
                    .sync
                    .tick_local(now, clock, &record.id, record.body.as_ref());
            } else {
                record.sync.tick_remote(dt, record.body.as_mut());
            }
        }
        outbound
    }

    pub fn get(&self, id: &EntityId) -> Option<&EntityRecord> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &EntityId) -> Option<&mut EntityRecord> {
        self.records.get_mut(id)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Ids in sorted order.
    pub fn ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<_> = self.records.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn local_id(&self) -> Option<&EntityId> {
        self.local.as_ref()
    }
}
