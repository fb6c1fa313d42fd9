//! overpass/src/connection.rs
//! Accept loop and per-connection workflow.

use crate::{
    features::{ProxyState, SharedState},
    handshake::{self, LoginData},
    packet::InputMode,
    relay::Session,
    state::{
        ACTIVE_CONN, CONN_COUNTER, CONN_MANAGER, CONN_METRICS, LISTENER_COUNTER, LISTENER_STATE,
        TOTAL_CONN,
    },
    transfer::{ProxyContext, TransferChain},
    transport::{self, FramedConn, PacketConn, TransportError},
    types::{ConnMetrics, ProxyConnection, ProxyListener, Upstream},
};
use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};

/// How long a transfer hop waits for its client before closing.
pub const HOP_ACCEPT_TIMEOUT: Duration = Duration::from_secs(60);

/// Accepts clients and proxies each one to `upstream`. Every client starts a
/// chain with fresh feature state.
pub async fn serve(listener_id: ProxyListener, listener: TcpListener, upstream: Upstream, ctx: ProxyContext) {
    info!(listener = listener_id, %upstream, "Accepting connections");
    loop {
        match listener.accept().await {
            Ok((inb, _)) => accept_conn(inb, &upstream, &ctx, ProxyState::shared()),
            Err(e) => {
                error!(listener = listener_id, "Accept error: {}", e);
                break;
            }
        }
    }
}

/// Spawns a transfer hop on the current runtime and registers it as a
/// listener. The hop serves the one client of `state`'s chain and then closes.
pub fn spawn_hop(
    listener: TcpListener,
    upstream: Upstream,
    ctx: ProxyContext,
    state: SharedState,
) -> ProxyListener {
    let id = LISTENER_COUNTER.fetch_add(1, Ordering::SeqCst);
    // Registered under the lock so the hop cannot deregister before it is inserted.
    let mut st = LISTENER_STATE.lock().unwrap();
    let handle = tokio::spawn(serve_hop(id, listener, upstream, ctx, state));
    st.listeners.insert(id, handle);
    id
}

async fn serve_hop(
    listener_id: ProxyListener,
    listener: TcpListener,
    upstream: Upstream,
    ctx: ProxyContext,
    state: SharedState,
) {
    match tokio::time::timeout(HOP_ACCEPT_TIMEOUT, listener.accept()).await {
        Ok(Ok((inb, _))) => accept_conn(inb, &upstream, &ctx, state),
        Ok(Err(e)) => error!(listener = listener_id, "Accept error: {}", e),
        Err(_) => info!(listener = listener_id, %upstream, "Transfer hop expired unused"),
    }
    LISTENER_STATE.lock().unwrap().listeners.remove(&listener_id);
}

fn accept_conn(inb: TcpStream, upstream: &Upstream, ctx: &ProxyContext, state: SharedState) {
    let conn_id = CONN_COUNTER.fetch_add(1, Ordering::SeqCst);
    TOTAL_CONN.fetch_add(1, Ordering::SeqCst);
    ACTIVE_CONN.fetch_add(1, Ordering::SeqCst);
    let metrics = Arc::new(ConnMetrics::default());
    CONN_METRICS.lock().unwrap().insert(conn_id, metrics.clone());

    let chain = TransferChain::new(ctx.clone(), state);
    let mut conns = CONN_MANAGER.lock().unwrap();
    let h = tokio::spawn(handle_conn(conn_id, inb, upstream.clone(), chain, metrics));
    conns.insert(conn_id, h);
}

/// Main connection workflow
pub async fn handle_conn(
    conn_id: ProxyConnection,
    inbound: TcpStream,
    upstream: Upstream,
    chain: Arc<TransferChain>,
    metrics: Arc<ConnMetrics>,
) {
    let peer = inbound
        .peer_addr()
        .map_or_else(|_| "0.0.0.0".to_string(), |addr| addr.to_string());
    let client = Arc::new(FramedConn::new(Box::new(inbound), peer));
    let options = chain.context().options();

    // Login
    let mut login = match handshake::accept_login(&*client).await {
        Ok(login) => login,
        Err(e) => {
            error!(conn = conn_id, peer = client.peer(), "Login failed: {}", e);
            client.close().await;
            release_conn(conn_id);
            return;
        }
    };
    info!(conn = conn_id, username = %login.username, "Player logging in");
    rewrite_login(&mut login, options.input_mode, options.auth_token.as_deref());

    // Establish outbound connection
    let server = match transport::dial(&upstream.host, upstream.port, options.upstream_proxy.as_deref()).await {
        Ok(server) => {
            info!(conn = conn_id, %upstream, "Proxying connection");
            Arc::new(server)
        }
        Err(e) => {
            error!(conn = conn_id, %upstream, "Failed to connect to upstream: {}", e);
            client
                .disconnect("Could not connect to the destination server.")
                .await;
            release_conn(conn_id);
            return;
        }
    };

    let started = async {
        let game = handshake::join_upstream(&*server, &login).await?;
        handshake::spawn(&*client, &*server, &game, options.chunk_radius).await?;
        Ok::<_, TransportError>(game)
    };
    let game = match started.await {
        Ok(game) => game,
        Err(e) => {
            error!(conn = conn_id, "Startup failed: {}", e);
            match e.disconnect_reason() {
                Some(reason) => client.disconnect(reason).await,
                None => client.close().await,
            }
            server.close().await;
            release_conn(conn_id);
            return;
        }
    };

    let session = Session::new(conn_id, client, server, game, chain, metrics);
    session.run().await;
    info!(conn = conn_id, "Connection closed");
    release_conn(conn_id);
}

/// Forces the configured input mode and credential onto the upstream login.
fn rewrite_login(login: &mut LoginData, input_mode: InputMode, auth_token: Option<&str>) {
    login.input_mode = input_mode;
    if let Some(token) = auth_token {
        login.auth_token = Some(token.to_string());
    }
}

/// Drops a connection's bookkeeping. Safe to call more than once.
pub fn release_conn(conn_id: ProxyConnection) {
    CONN_MANAGER.lock().unwrap().remove(&conn_id);
    if CONN_METRICS.lock().unwrap().remove(&conn_id).is_some() {
        ACTIVE_CONN.fetch_sub(1, Ordering::SeqCst);
    }
}
