//! overpass/src/types.rs
//! Core data structures, type aliases, and constants.

use crate::packet::InputMode;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};
use tokio::task::JoinHandle;

/// Options supplied by the embedding host as JSON.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyOptions {
    pub upstream_host: String,
    pub upstream_port: u16,
    /// Optional `socks5://` URL the upstream dial goes through.
    pub upstream_proxy: Option<String>,
    /// Address transfer-hop listeners bind to.
    pub bind_host: String,
    /// Address the client is redirected to on a transfer.
    pub advertise_host: String,
    /// The first transfer hop listens on `transfer_port_base + 1`.
    pub transfer_port_base: u16,
    pub command_prefix: String,
    pub input_mode: InputMode,
    pub auth_token: Option<String>,
    pub chunk_radius: i32,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            upstream_host: "127.0.0.1".to_string(),
            upstream_port: 19132,
            upstream_proxy: None,
            bind_host: "0.0.0.0".to_string(),
            advertise_host: "127.0.0.1".to_string(),
            transfer_port_base: 19133,
            command_prefix: "/.".to_string(),
            input_mode: InputMode::MouseKeyboard,
            auth_token: None,
            chunk_radius: 16,
        }
    }
}

/// Where a listener sends the sessions it accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Game data the upstream hands out at join: identity of the local player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameData {
    pub runtime_id: u64,
    pub unique_id: i64,
}

// Error codes
pub type ProxyError = i32;
pub const PROXY_OK: ProxyError = 0;
pub const PROXY_ERR_INTERNAL: ProxyError = -1;
pub const PROXY_ERR_BAD_PARAM: ProxyError = -2;
pub const PROXY_ERR_NOT_FOUND: ProxyError = -3;

// Handles
pub type ProxyListener = u64;
pub type ProxyConnection = u64;

// Per-connection metrics
#[derive(Default)]
pub struct ConnMetrics {
    /// Packets forwarded client -> server.
    pub packets_sent: AtomicU64,
    /// Packets forwarded server -> client.
    pub packets_recv: AtomicU64,
    /// Packets the relay swallowed in either direction.
    pub packets_dropped: AtomicU64,
}

impl ConnMetrics {
    pub fn snapshot(&self) -> ConnMetricsSnapshot {
        ConnMetricsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::SeqCst),
            packets_recv: self.packets_recv.load(Ordering::SeqCst),
            packets_dropped: self.packets_dropped.load(Ordering::SeqCst),
        }
    }
}

// Snapshot structs for JSON serialization
#[derive(Serialize)]
pub struct MetricsSnapshot {
    pub total_conn: u64,
    pub active_conn: u64,
    pub total_packets_sent: u64,
    pub total_packets_recv: u64,
    pub total_packets_dropped: u64,
    pub connections: HashMap<ProxyConnection, ConnMetricsSnapshot>,
}

#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct ConnMetricsSnapshot {
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub packets_dropped: u64,
}

pub struct ListenerState {
    pub listeners: HashMap<ProxyListener, JoinHandle<()>>,
}

impl ListenerState {
    pub fn new() -> Self {
        ListenerState {
            listeners: HashMap::new(),
        }
    }
}

pub struct ConnectionManager {
    pub connections: HashMap<ProxyConnection, JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        ConnectionManager {
            connections: HashMap::new(),
        }
    }

    pub fn insert(&mut self, id: ProxyConnection, h: JoinHandle<()>) {
        self.connections.insert(id, h);
    }

    pub fn remove(&mut self, id: &ProxyConnection) -> Option<JoinHandle<()>> {
        self.connections.remove(id)
    }
}
