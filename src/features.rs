//! overpass/src/features.rs
//! Feature toggles applied by the relay.

use serde::Serialize;
use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
};

/// Default hitbox width written into player metadata when the feature is on.
pub const DEFAULT_HITBOX_SIZE: f32 = 0.6;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum Feature {
    AntiKnockback,
    /// Drops client flight requests that match the forced flight state.
    Fly,
    KillAura,
    Haste,
    Heal,
    Speed,
    JumpBoost,
    SlowFalling,
    NightVision,
    NoClip,
    Reach,
    Hitbox,
}

/// Toggle state for one client. Written by command handling, read by both pumps.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyState {
    active: BTreeSet<Feature>,
    hitbox_size: f32,
}

pub type SharedState = Arc<Mutex<ProxyState>>;

impl ProxyState {
    pub fn new() -> Self {
        Self {
            active: BTreeSet::new(),
            hitbox_size: DEFAULT_HITBOX_SIZE,
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn is_active(&self, feature: Feature) -> bool {
        self.active.contains(&feature)
    }

    pub fn set(&mut self, feature: Feature, on: bool) {
        if on {
            self.active.insert(feature);
        } else {
            self.active.remove(&feature);
        }
    }

    /// Flips `feature` and returns its new value.
    pub fn toggle(&mut self, feature: Feature) -> bool {
        let on = !self.is_active(feature);
        self.set(feature, on);
        on
    }

    pub fn set_hitbox_size(&mut self, size: f32) {
        self.hitbox_size = size;
    }

    /// The value to force into player metadata, if hitbox overriding is on.
    pub fn hitbox_override(&self) -> Option<f32> {
        self.is_active(Feature::Hitbox).then_some(self.hitbox_size)
    }
}

impl Default for ProxyState {
    fn default() -> Self {
        Self::new()
    }
}
