//! overpass/src/packet.rs
//! Protocol-agnostic packet model shared by the transport and the relay pumps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata key the proxy overrides to enlarge player hitboxes.
pub const HITBOX_METADATA_KEY: u32 = 53;

/// Effect duration used when activating a status effect ("forever").
pub const INFINITE_EFFECT_DURATION: i32 = 999_999_999;

/// Effect duration used when removing a status effect.
pub const REMOVE_EFFECT_DURATION: i32 = 1;

/// Entity metadata as sent by the server: small integer key to typed value.
pub type Metadata = BTreeMap<u32, MetadataValue>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum MetadataValue {
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    String(String),
    Vec3(Vec3),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Input device the client reports. Forced to the configured mode by the relay.
///
/// Besides the camelCase names, the labels shown in the game's settings are
/// accepted.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum InputMode {
    #[default]
    #[serde(alias = "Mouse & Keyboard")]
    MouseKeyboard,
    #[serde(alias = "Touch")]
    Touch,
    #[serde(alias = "Controller")]
    GamePad,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Ability {
    Flying,
    MayFly,
    NoClip,
    Other(u32),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum GameType {
    Survival,
    Creative,
    Adventure,
}

impl GameType {
    pub fn display_name(self) -> &'static str {
        match self {
            GameType::Survival => "Survival",
            GameType::Creative => "Creative",
            GameType::Adventure => "Adventure",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EffectOperation {
    Add,
    Remove,
}

/// Status effects the proxy applies. Serialized as the game's numeric effect id.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(into = "u32", try_from = "u32")]
pub enum EffectType {
    Speed,
    Haste,
    JumpBoost,
    Regeneration,
    NightVision,
    SlowFalling,
}

impl From<EffectType> for u32 {
    fn from(effect: EffectType) -> u32 {
        match effect {
            EffectType::Speed => 1,
            EffectType::Haste => 3,
            EffectType::JumpBoost => 8,
            EffectType::Regeneration => 10,
            EffectType::NightVision => 16,
            EffectType::SlowFalling => 27,
        }
    }
}

impl TryFrom<u32> for EffectType {
    type Error = String;

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        match id {
            1 => Ok(EffectType::Speed),
            3 => Ok(EffectType::Haste),
            8 => Ok(EffectType::JumpBoost),
            10 => Ok(EffectType::Regeneration),
            16 => Ok(EffectType::NightVision),
            27 => Ok(EffectType::SlowFalling),
            other => Err(format!("unsupported effect id {other}")),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TextKind {
    Raw,
    Tip,
    Popup,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PlayStatus {
    LoginSuccess,
    LoginFailed,
    PlayerSpawn,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum InteractAction {
    Interact,
    Attack,
}

/// Every packet the relay reads, rewrites or emits.
///
/// Packets the relay has no interest in travel as `Unknown` and are forwarded
/// byte-for-byte.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum Packet {
    #[serde(rename_all = "camelCase")]
    Login {
        username: String,
        input_mode: InputMode,
        #[serde(default)]
        auth_token: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    StartGame { runtime_id: u64, unique_id: i64 },
    #[serde(rename_all = "camelCase")]
    LocalPlayerInitialized { runtime_id: u64 },
    RequestChunkRadius { radius: i32 },
    PlayStatus { status: PlayStatus },
    Disconnect { message: String },
    #[serde(rename_all = "camelCase")]
    AddPlayer {
        username: String,
        runtime_id: u64,
        unique_id: i64,
        #[serde(default)]
        metadata: Metadata,
    },
    #[serde(rename_all = "camelCase")]
    RemoveActor { unique_id: i64 },
    #[serde(rename_all = "camelCase")]
    SetActorData {
        runtime_id: u64,
        metadata: Metadata,
        #[serde(default)]
        tick: u64,
    },
    #[serde(rename_all = "camelCase")]
    SetActorMotion { runtime_id: u64, velocity: Vec3 },
    Transfer { address: String, port: u16 },
    #[serde(rename_all = "camelCase")]
    MoveActorAbsolute { runtime_id: u64, position: Vec3 },
    #[serde(rename_all = "camelCase")]
    PlayerAuthInput {
        input_mode: InputMode,
        position: Vec3,
        #[serde(default)]
        tick: u64,
    },
    RequestAbility { ability: Ability, value: bool },
    #[serde(rename_all = "camelCase")]
    CommandRequest { command_line: String },
    #[serde(rename_all = "camelCase")]
    StatusEffect {
        runtime_id: u64,
        operation: EffectOperation,
        effect: EffectType,
        amplifier: i32,
        particles: bool,
        duration: i32,
    },
    ChatText { kind: TextKind, message: String },
    #[serde(rename_all = "camelCase")]
    SetPlayerGameType { game_type: GameType },
    #[serde(rename_all = "camelCase")]
    EntityInteract {
        target_runtime_id: u64,
        action: InteractAction,
        hotbar_slot: u8,
        position: Vec3,
    },
    Unknown {
        id: u32,
        #[serde(default)]
        payload: Vec<u8>,
    },
}

impl Packet {
    /// Short packet name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Login { .. } => "Login",
            Packet::StartGame { .. } => "StartGame",
            Packet::LocalPlayerInitialized { .. } => "LocalPlayerInitialized",
            Packet::RequestChunkRadius { .. } => "RequestChunkRadius",
            Packet::PlayStatus { .. } => "PlayStatus",
            Packet::Disconnect { .. } => "Disconnect",
            Packet::AddPlayer { .. } => "AddPlayer",
            Packet::RemoveActor { .. } => "RemoveActor",
            Packet::SetActorData { .. } => "SetActorData",
            Packet::SetActorMotion { .. } => "SetActorMotion",
            Packet::Transfer { .. } => "Transfer",
            Packet::MoveActorAbsolute { .. } => "MoveActorAbsolute",
            Packet::PlayerAuthInput { .. } => "PlayerAuthInput",
            Packet::RequestAbility { .. } => "RequestAbility",
            Packet::CommandRequest { .. } => "CommandRequest",
            Packet::StatusEffect { .. } => "StatusEffect",
            Packet::ChatText { .. } => "ChatText",
            Packet::SetPlayerGameType { .. } => "SetPlayerGameType",
            Packet::EntityInteract { .. } => "EntityInteract",
            Packet::Unknown { .. } => "Unknown",
        }
    }
}
