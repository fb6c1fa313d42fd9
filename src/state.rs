//! overpass/src/state.rs
//! Process-wide registries used by the host surface.

use crate::types::{ConnMetrics, ConnectionManager, ListenerState, ProxyConnection, ProxyOptions};
use lazy_static::lazy_static;
use std::{
    collections::HashMap,
    sync::{Arc, RwLock, atomic::AtomicU64},
};
use tracing_subscriber::{filter::EnvFilter, reload::Handle as ReloadHandle};

// Global metrics counters
pub static TOTAL_CONN: AtomicU64 = AtomicU64::new(0);
pub static ACTIVE_CONN: AtomicU64 = AtomicU64::new(0);
pub static TOTAL_PACKETS_SENT: AtomicU64 = AtomicU64::new(0);
pub static TOTAL_PACKETS_RECV: AtomicU64 = AtomicU64::new(0);
pub static TOTAL_PACKETS_DROPPED: AtomicU64 = AtomicU64::new(0);

lazy_static! {
    pub static ref OPTIONS: RwLock<ProxyOptions> = RwLock::new(ProxyOptions::default());
    pub static ref CONN_METRICS: std::sync::Mutex<HashMap<ProxyConnection, Arc<ConnMetrics>>> =
        std::sync::Mutex::new(HashMap::new());
    // Runtime the host-started listeners and their sessions run on.
    pub static ref RUNTIME: tokio::runtime::Runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build proxy runtime");
    pub static ref LISTENER_STATE: Arc<std::sync::Mutex<ListenerState>> =
        Arc::new(std::sync::Mutex::new(ListenerState::new()));
    pub static ref CONN_MANAGER: Arc<std::sync::Mutex<ConnectionManager>> =
        Arc::new(std::sync::Mutex::new(ConnectionManager::new()));
    pub static ref LISTENER_COUNTER: AtomicU64 = AtomicU64::new(1);
    pub static ref CONN_COUNTER: AtomicU64 = AtomicU64::new(1);
    pub static ref RELOAD_HANDLE: std::sync::Mutex<Option<ReloadHandle<EnvFilter, tracing_subscriber::Registry>>> =
        std::sync::Mutex::new(None);
}
