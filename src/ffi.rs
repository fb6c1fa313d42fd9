//! overpass/src/ffi.rs
//! FFI interface functions.

use crate::{
    connection::{release_conn, serve},
    logging,
    state::{
        ACTIVE_CONN, CONN_MANAGER, CONN_METRICS, LISTENER_COUNTER, LISTENER_STATE, OPTIONS,
        RUNTIME, TOTAL_CONN, TOTAL_PACKETS_DROPPED, TOTAL_PACKETS_RECV, TOTAL_PACKETS_SENT,
    },
    transfer::ProxyContext,
    types::{
        MetricsSnapshot, PROXY_ERR_BAD_PARAM, PROXY_ERR_INTERNAL, PROXY_ERR_NOT_FOUND, PROXY_OK,
        ProxyConnection, ProxyError, ProxyListener, ProxyOptions, Upstream,
    },
};
use serde::Serialize;
use std::{
    ffi::{CStr, CString},
    os::raw::{c_char, c_uint, c_ushort},
    ptr,
    sync::atomic::Ordering,
};
use tokio::net::TcpListener;
use tracing::{error, info};

/// `s` must be null or a valid NUL-terminated string.
unsafe fn read_str<'a>(s: *const c_char) -> Option<&'a str> {
    if s.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(s) }.to_str().ok()
}

fn to_json_ptr<T: Serialize>(value: &T) -> *const c_char {
    match serde_json::to_string(value) {
        Ok(json_str) => match CString::new(json_str) {
            Ok(c_str) => c_str.into_raw(),
            Err(_) => ptr::null(),
        },
        Err(_) => ptr::null(),
    }
}

/// Set global options from a JSON string. Listeners started afterwards use them.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn proxy_set_options(options_json: *const c_char) -> ProxyError {
    let Some(json_str) = (unsafe { read_str(options_json) }) else {
        return PROXY_ERR_BAD_PARAM;
    };
    let options: ProxyOptions = match serde_json::from_str(json_str) {
        Ok(opts) => opts,
        Err(e) => {
            error!("Failed to parse options JSON: {}", e);
            return PROXY_ERR_BAD_PARAM;
        }
    };

    *OPTIONS.write().unwrap() = options;
    info!("Updated global options");
    PROXY_OK
}

/// Initialize global logging level
#[unsafe(no_mangle)]
pub unsafe extern "C" fn proxy_init_logging(level: *const c_char) -> ProxyError {
    let Some(lvl) = (unsafe { read_str(level) }) else {
        return PROXY_ERR_BAD_PARAM;
    };
    logging::init_logging(lvl);
    PROXY_OK
}

/// Set log level at runtime
#[unsafe(no_mangle)]
pub unsafe extern "C" fn proxy_set_log_level(level: *const c_char) -> ProxyError {
    let Some(lvl) = (unsafe { read_str(level) }) else {
        return PROXY_ERR_BAD_PARAM;
    };
    if logging::set_log_level(lvl) {
        PROXY_OK
    } else {
        PROXY_ERR_INTERNAL
    }
}

/// Start a root listener proxying to the configured upstream.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn proxy_start_listener(
    bind_addr: *const c_char,
    bind_port: c_ushort,
    out_listener: *mut ProxyListener,
) -> ProxyError {
    logging::init_logging("info");
    if out_listener.is_null() {
        return PROXY_ERR_BAD_PARAM;
    }
    let Some(addr) = (unsafe { read_str(bind_addr) }) else {
        return PROXY_ERR_BAD_PARAM;
    };
    let options = OPTIONS.read().unwrap().clone();
    let upstream = Upstream {
        host: options.upstream_host.clone(),
        port: options.upstream_port,
    };
    let ctx = ProxyContext::new(options);

    let id = LISTENER_COUNTER.fetch_add(1, Ordering::SeqCst);
    let listen_str = format!("{}:{}", addr, bind_port);
    info!(listener = id, %listen_str, "Starting listener");
    let handle = RUNTIME.spawn(async move {
        let listener = match TcpListener::bind(&listen_str).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind listener {}: {}", id, e);
                return;
            }
        };
        info!("Bound {}", listen_str);
        serve(id, listener, upstream, ctx).await;
    });
    unsafe { ptr::write(out_listener, id) };
    LISTENER_STATE.lock().unwrap().listeners.insert(id, handle);
    PROXY_OK
}

/// Stop a listener. Sessions it already accepted keep running.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn proxy_stop_listener(listener: ProxyListener) -> ProxyError {
    let mut st = LISTENER_STATE.lock().unwrap();
    if let Some(h) = st.listeners.remove(&listener) {
        h.abort();
        PROXY_OK
    } else {
        PROXY_ERR_NOT_FOUND
    }
}

/// Disconnect a connection
#[unsafe(no_mangle)]
pub unsafe extern "C" fn proxy_disconnect(conn_id: ProxyConnection) -> ProxyError {
    let Some(h) = CONN_MANAGER.lock().unwrap().remove(&conn_id) else {
        return PROXY_ERR_NOT_FOUND;
    };
    h.abort();
    release_conn(conn_id);
    PROXY_OK
}

/// Shutdown all listeners and connections, transfer hops included.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn proxy_shutdown() -> ProxyError {
    for (_, h) in LISTENER_STATE.lock().unwrap().listeners.drain() {
        h.abort();
    }
    unsafe { proxy_kick_all() };
    PROXY_OK
}

/// Disconnect all active connections and returns the number of connections kicked.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn proxy_kick_all() -> c_uint {
    let handles: Vec<_> = CONN_MANAGER.lock().unwrap().connections.drain().collect();
    let kicked_count = handles.len();
    for (conn_id, handle) in handles {
        handle.abort();
        release_conn(conn_id);
    }
    kicked_count as c_uint
}

/// Takes a snapshot of all metrics and returns it as a JSON string.
/// The caller is responsible for freeing the returned string using `proxy_free_string`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn proxy_get_metrics() -> *const c_char {
    let connections = CONN_METRICS
        .lock()
        .unwrap()
        .iter()
        .map(|(id, metrics)| (*id, metrics.snapshot()))
        .collect();

    to_json_ptr(&MetricsSnapshot {
        total_conn: TOTAL_CONN.load(Ordering::SeqCst),
        active_conn: ACTIVE_CONN.load(Ordering::SeqCst),
        total_packets_sent: TOTAL_PACKETS_SENT.load(Ordering::SeqCst),
        total_packets_recv: TOTAL_PACKETS_RECV.load(Ordering::SeqCst),
        total_packets_dropped: TOTAL_PACKETS_DROPPED.load(Ordering::SeqCst),
        connections,
    })
}

/// Takes a snapshot of a single connection's metrics and returns it as a JSON string.
/// The caller is responsible for freeing the returned string using `proxy_free_string`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn proxy_get_connection_metrics(conn_id: ProxyConnection) -> *const c_char {
    match CONN_METRICS.lock().unwrap().get(&conn_id) {
        Some(metrics) => to_json_ptr(&metrics.snapshot()),
        None => ptr::null(),
    }
}

/// Frees a string that was allocated by Rust and passed to another language.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn proxy_free_string(s: *mut c_char) {
    if !s.is_null() {
        unsafe {
            let _ = CString::from_raw(s);
        }
    }
}
