//! overpass/src/command.rs
//! In-band chat commands: parsing, feature toggles and client feedback.

use crate::{
    features::{Feature, ProxyState},
    packet::{
        EffectOperation, EffectType, GameType, INFINITE_EFFECT_DURATION, Packet,
        REMOVE_EFFECT_DURATION, TextKind,
    },
    player::PlayerRegistry,
};

pub const CHAT_PREFIX: &str = "§9[§1P§9] §r§f";
pub const TIP_PREFIX: &str = "§9- ";

const HELP_LINES: &[&str] = &[
    "§9List of Commands",
    "§9",
    "§9Combat",
    "§1§l => §r§9hitbox <size>",
    "§1§l => §r§9antikb",
    "§1§l => §r§9killaura",
    "§1§l => §r§9heal",
    "§9",
    "§9Others",
    "§1§l => §r§9gamemode <type>",
    "§1§l => §r§9haste",
    "§1§l => §r§9slowfalling",
    "§1§l => §r§9nightvision",
    "§1§l => §r§9speed",
    "§1§l => §r§9jumpboost",
];

/// A command typed by the player, already lower-cased and stripped of the prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub verb: String,
    pub args: Vec<String>,
}

impl Command {
    /// Parses `line` if it starts with `prefix`; other command lines belong to
    /// the server.
    pub fn parse(line: &str, prefix: &str) -> Option<Command> {
        let line = line.to_lowercase();
        let rest = line.strip_prefix(&prefix.to_lowercase())?;
        let mut parts = rest.split_whitespace().map(str::to_string);
        let verb = parts.next().unwrap_or_default();
        Some(Command {
            verb,
            args: parts.collect(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("Usage: {0}")]
    Usage(String),
    #[error("Invalid hitbox size \"{0}\"!")]
    InvalidNumber(String),
    #[error("Unknown \"{0}\" game mode!")]
    UnknownGameMode(String),
    #[error("Unknown command \"{verb}\"! Type {prefix}help for a list.")]
    UnknownCommand { verb: String, prefix: String },
}

struct EffectSpec {
    effect: EffectType,
    add_amplifier: i32,
    remove_amplifier: i32,
}

struct Toggle {
    verb: &'static str,
    feature: Feature,
    label: &'static str,
    effect: Option<EffectSpec>,
}

const fn effect(effect: EffectType, add_amplifier: i32, remove_amplifier: i32) -> Option<EffectSpec> {
    Some(EffectSpec {
        effect,
        add_amplifier,
        remove_amplifier,
    })
}

const TOGGLES: &[Toggle] = &[
    Toggle { verb: "antikb", feature: Feature::AntiKnockback, label: "AntiKB", effect: None },
    Toggle { verb: "killaura", feature: Feature::KillAura, label: "KillAura", effect: None },
    Toggle { verb: "haste", feature: Feature::Haste, label: "Haste", effect: effect(EffectType::Haste, 2, 2) },
    Toggle { verb: "heal", feature: Feature::Heal, label: "Heal", effect: effect(EffectType::Regeneration, 5, 5) },
    Toggle { verb: "speed", feature: Feature::Speed, label: "Speed", effect: effect(EffectType::Speed, 50, 2) },
    Toggle { verb: "jumpboost", feature: Feature::JumpBoost, label: "JumpBoost", effect: effect(EffectType::JumpBoost, 2, 2) },
    Toggle { verb: "slowfalling", feature: Feature::SlowFalling, label: "SlowFalling", effect: effect(EffectType::SlowFalling, 2, 2) },
    Toggle { verb: "nightvision", feature: Feature::NightVision, label: "NightVision", effect: effect(EffectType::NightVision, 2, 2) },
];

/// What a command may touch while it runs.
pub struct CommandContext<'a> {
    pub state: &'a mut ProxyState,
    pub players: &'a PlayerRegistry,
    /// Runtime id of the local player, target of status effects.
    pub runtime_id: u64,
}

/// Executes player commands against the session state. Returns the packets to
/// send to the client; nothing a command produces goes to the server.
pub struct CommandDispatcher {
    prefix: String,
}

impl CommandDispatcher {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn dispatch(&self, command: &Command, ctx: CommandContext<'_>) -> Vec<Packet> {
        match self.execute(command, ctx) {
            Ok(packets) => packets,
            Err(e) => vec![chat(&format!("§c{e}"))],
        }
    }

    fn execute(&self, command: &Command, ctx: CommandContext<'_>) -> Result<Vec<Packet>, CommandError> {
        match command.verb.as_str() {
            "help" => Ok(HELP_LINES.iter().map(|line| chat(line)).collect()),
            "gamemode" => self.gamemode(&command.args),
            "hitbox" => self.hitbox(&command.args, ctx),
            verb => match TOGGLES.iter().find(|t| t.verb == verb) {
                Some(toggle) => Ok(apply_toggle(toggle, ctx)),
                None => Err(CommandError::UnknownCommand {
                    verb: verb.to_string(),
                    prefix: self.prefix.clone(),
                }),
            },
        }
    }

    fn gamemode(&self, args: &[String]) -> Result<Vec<Packet>, CommandError> {
        let [token] = args else {
            return Err(CommandError::Usage(format!("{}gamemode <mode>", self.prefix)));
        };
        let game_type = parse_game_type(token)
            .ok_or_else(|| CommandError::UnknownGameMode(token.clone()))?;
        Ok(vec![
            Packet::SetPlayerGameType { game_type },
            chat(&format!(
                "§aSet own game mode to §9{}§a!",
                game_type.display_name()
            )),
        ])
    }

    fn hitbox(&self, args: &[String], ctx: CommandContext<'_>) -> Result<Vec<Packet>, CommandError> {
        let Some(raw) = args.first() else {
            return Err(CommandError::Usage(format!("{}hitbox <size>", self.prefix)));
        };
        let size: f32 = raw
            .parse()
            .ok()
            .filter(|size: &f32| size.is_finite() && *size >= 0.0)
            .ok_or_else(|| CommandError::InvalidNumber(raw.clone()))?;

        let mut packets = Vec::new();
        if size == 0.0 {
            ctx.state.set(Feature::Hitbox, false);
            packets.extend(sync_packets(ctx.players.apply_hitbox(None)));
            packets.extend(deactivated("HitBox"));
        } else {
            ctx.state.set_hitbox_size(size);
            ctx.state.set(Feature::Hitbox, true);
            packets.extend(sync_packets(ctx.players.apply_hitbox(Some(size))));
            packets.extend(activated(&format!("HitBox §1{raw}")));
        }
        Ok(packets)
    }
}

fn apply_toggle(toggle: &Toggle, ctx: CommandContext<'_>) -> Vec<Packet> {
    let on = ctx.state.toggle(toggle.feature);
    let mut packets = Vec::with_capacity(3);
    if let Some(spec) = &toggle.effect {
        packets.push(Packet::StatusEffect {
            runtime_id: ctx.runtime_id,
            operation: if on { EffectOperation::Add } else { EffectOperation::Remove },
            effect: spec.effect,
            amplifier: if on { spec.add_amplifier } else { spec.remove_amplifier },
            particles: false,
            duration: if on { INFINITE_EFFECT_DURATION } else { REMOVE_EFFECT_DURATION },
        });
    }
    if on {
        packets.extend(activated(toggle.label));
    } else {
        packets.extend(deactivated(toggle.label));
    }
    packets
}

fn parse_game_type(token: &str) -> Option<GameType> {
    match token {
        "0" | "s" | "survival" => Some(GameType::Survival),
        "1" | "c" | "creative" => Some(GameType::Creative),
        "2" | "a" | "adventure" => Some(GameType::Adventure),
        _ => None,
    }
}

fn sync_packets(synced: Vec<(u64, crate::packet::Metadata)>) -> impl Iterator<Item = Packet> {
    synced
        .into_iter()
        .map(|(runtime_id, metadata)| Packet::SetActorData {
            runtime_id,
            metadata,
            tick: 0,
        })
}

pub fn chat(message: &str) -> Packet {
    Packet::ChatText {
        kind: TextKind::Raw,
        message: format!("{CHAT_PREFIX}{message}"),
    }
}

pub fn tip(message: &str) -> Packet {
    Packet::ChatText {
        kind: TextKind::Tip,
        message: format!("{TIP_PREFIX}{message}{TIP_PREFIX}"),
    }
}

fn activated(label: &str) -> [Packet; 2] {
    let message = format!("§aThe §9{label}§a has been successfully activated!");
    [chat(&message), tip(&message)]
}

fn deactivated(label: &str) -> [Packet; 2] {
    let message = format!("§cThe §9{label}§c has been successfully deactivated!");
    [chat(&message), tip(&message)]
}
