//! overpass/src/transfer.rs
//! Transfer chaining: each upstream transfer is answered with a fresh local
//! listener so the client stays behind the proxy.

use crate::{
    connection,
    features::SharedState,
    packet::Packet,
    transport::{PacketConn, TransportError},
    types::{ProxyConnection, ProxyOptions, Upstream},
};
use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU16, Ordering},
    },
};
use tokio::net::TcpListener;
use tracing::info;

/// Shared by a root listener and every hop spawned beneath it.
#[derive(Clone)]
pub struct ProxyContext {
    options: Arc<ProxyOptions>,
    next_port: Arc<AtomicU16>,
}

impl ProxyContext {
    pub fn new(options: ProxyOptions) -> Self {
        let next_port = Arc::new(AtomicU16::new(options.transfer_port_base));
        Self {
            options: Arc::new(options),
            next_port,
        }
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    /// Hands out the next hop port. Ports are never reused, so this returns
    /// `None` once the port range is used up.
    pub fn allocate_port(&self) -> Option<u16> {
        self.next_port
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |port| port.checked_add(1))
            .ok()
            .map(|prev| prev + 1)
    }
}

/// The hops of one client. Every session in the chain shares its feature state.
pub struct TransferChain {
    ctx: ProxyContext,
    state: SharedState,
}

impl TransferChain {
    pub fn new(ctx: ProxyContext, state: SharedState) -> Arc<Self> {
        Arc::new(Self { ctx, state })
    }

    pub fn context(&self) -> &ProxyContext {
        &self.ctx
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Starts a listener that proxies to `address:port` and sends the client
    /// there. The listener is bound before the client is told about it.
    pub async fn redirect<C: PacketConn>(
        &self,
        conn_id: ProxyConnection,
        client: &C,
        address: &str,
        port: u16,
    ) -> Result<u16, TransportError> {
        let options = self.ctx.options();
        let local_port = self.ctx.allocate_port().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "transfer ports exhausted")
        })?;
        let listener = TcpListener::bind((options.bind_host.as_str(), local_port)).await?;
        let upstream = Upstream {
            host: address.to_string(),
            port,
        };
        info!(conn = conn_id, %upstream, local_port, "Chaining transfer");
        connection::spawn_hop(listener, upstream, self.ctx.clone(), self.state.clone());

        client
            .write_packet(&Packet::Transfer {
                address: options.advertise_host.clone(),
                port: local_port,
            })
            .await?;
        Ok(local_port)
    }
}
