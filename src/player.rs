//! overpass/src/player.rs
//! Cache of players announced by the upstream server for one session.

use crate::packet::{HITBOX_METADATA_KEY, Metadata, MetadataValue};
use dashmap::DashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    pub name: String,
    pub runtime_id: u64,
    pub unique_id: i64,
    /// Last metadata snapshot received from the server.
    pub metadata: Metadata,
    /// Metadata as sent to the client, i.e. `metadata` with proxy overrides.
    pub dirty_metadata: Metadata,
}

impl Player {
    fn refresh(&mut self, hitbox: Option<f32>) {
        self.dirty_metadata = with_overrides(&self.metadata, hitbox);
    }
}

/// Returns `metadata` with the hitbox key forced to `hitbox`, if given.
pub fn with_overrides(metadata: &Metadata, hitbox: Option<f32>) -> Metadata {
    let mut dirty = metadata.clone();
    if let Some(size) = hitbox {
        dirty.insert(HITBOX_METADATA_KEY, MetadataValue::Float(size));
    }
    dirty
}

/// Players keyed by name. Shared by the inbound pump (writer) and command
/// handling (reader and override writer).
pub struct PlayerRegistry {
    players: DashMap<String, Player>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self {
            players: DashMap::new(),
        }
    }

    /// Caches a newly announced player and returns the metadata the client
    /// should see.
    pub fn register(
        &self,
        name: &str,
        runtime_id: u64,
        unique_id: i64,
        metadata: Metadata,
        hitbox: Option<f32>,
    ) -> Metadata {
        let mut player = Player {
            name: name.to_string(),
            runtime_id,
            unique_id,
            metadata,
            dirty_metadata: Metadata::new(),
        };
        player.refresh(hitbox);
        let dirty = player.dirty_metadata.clone();
        self.players.insert(name.to_string(), player);
        dirty
    }

    /// Evicts the player with `unique_id`. Runtime ids may be reused, so they
    /// are never used for removal.
    pub fn remove_by_unique_id(&self, unique_id: i64) -> Option<Player> {
        let name = self
            .players
            .iter()
            .find(|entry| entry.unique_id == unique_id)
            .map(|entry| entry.key().clone())?;
        // The iterator's shard guard is released above; removing while holding
        // it would deadlock on the same shard.
        self.players.remove(&name).map(|(_, player)| player)
    }

    /// Stores a new server snapshot for the player with `runtime_id` and
    /// returns the metadata the client should see, or `None` if the entity is
    /// not a cached player.
    pub fn update_metadata(
        &self,
        runtime_id: u64,
        metadata: &Metadata,
        hitbox: Option<f32>,
    ) -> Option<Metadata> {
        let mut dirty = None;
        for mut entry in self.players.iter_mut() {
            if entry.runtime_id == runtime_id {
                entry.metadata = metadata.clone();
                entry.refresh(hitbox);
                dirty = Some(entry.dirty_metadata.clone());
            }
        }
        dirty
    }

    /// Reapplies overrides to every player and returns `(runtime_id, metadata)`
    /// pairs to sync to the client, ordered by runtime id. `None` restores the
    /// server's copy.
    pub fn apply_hitbox(&self, hitbox: Option<f32>) -> Vec<(u64, Metadata)> {
        let mut synced: Vec<(u64, Metadata)> = self
            .players
            .iter_mut()
            .map(|mut entry| {
                entry.refresh(hitbox);
                (entry.runtime_id, entry.dirty_metadata.clone())
            })
            .collect();
        synced.sort_by_key(|(runtime_id, _)| *runtime_id);
        synced
    }

    pub fn get(&self, name: &str) -> Option<Player> {
        self.players.get(name).map(|entry| entry.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}

impl Default for PlayerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
