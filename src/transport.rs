//! overpass/src/transport.rs
//! Packet transport: the connection capability the relay is written against,
//! plus a framed implementation over any tokio byte stream.

use crate::{packet::Packet, protocol};
use std::{
    future::Future,
    sync::atomic::{AtomicBool, Ordering},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::{Mutex, Notify},
};
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The remote end closed the connection and stated a reason.
    #[error("{0}")]
    Disconnected(String),
    /// The connection was closed locally.
    #[error("connection closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed packet: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("upstream proxy error: {0}")]
    Proxy(String),
}

impl TransportError {
    /// Reason string when the peer ended the connection deliberately.
    pub fn disconnect_reason(&self) -> Option<&str> {
        match self {
            TransportError::Disconnected(reason) => Some(reason),
            _ => None,
        }
    }
}

/// One side of a relayed session.
///
/// Reads and writes may happen concurrently from different tasks. `close` is
/// idempotent and makes a pending `read_packet` return `TransportError::Closed`.
pub trait PacketConn: Send + Sync + 'static {
    fn read_packet(&self) -> impl Future<Output = Result<Packet, TransportError>> + Send;

    fn write_packet(&self, pk: &Packet)
    -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Tells the peer why the connection ends, then closes it.
    fn disconnect(&self, reason: &str) -> impl Future<Output = ()> + Send;

    fn close(&self) -> impl Future<Output = ()> + Send;

    fn is_closed(&self) -> bool;
}

// A unified async stream trait so TCP and SOCKS5 streams share one code path.
pub trait AsyncStreamTrait: AsyncRead + AsyncWrite + Unpin + Send {}

// Implement this trait for any type that satisfies the bounds. This is a "blanket implementation".
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStreamTrait for T {}

pub type AsyncStream = dyn AsyncStreamTrait;

/// Length-prefixed JSON packet frames over a byte stream.
pub struct FramedConn {
    peer: String,
    reader: Mutex<BufReader<ReadHalf<Box<AsyncStream>>>>,
    writer: Mutex<WriteHalf<Box<AsyncStream>>>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl FramedConn {
    pub fn new(stream: Box<AsyncStream>, peer: impl Into<String>) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            peer: peer.into(),
            reader: Mutex::new(BufReader::new(read)),
            writer: Mutex::new(write),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl PacketConn for FramedConn {
    async fn read_packet(&self) -> Result<Packet, TransportError> {
        // Registered before the flag check so a concurrent close is never missed.
        let shutdown = self.shutdown.notified();
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut reader = self.reader.lock().await;
        let body = tokio::select! {
            frame = protocol::read_frame(&mut *reader) => frame?,
            _ = shutdown => return Err(TransportError::Closed),
        };
        match protocol::decode_packet(&body)? {
            Packet::Disconnect { message } => Err(TransportError::Disconnected(message)),
            pk => Ok(pk),
        }
    }

    async fn write_packet(&self, pk: &Packet) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let body = protocol::encode_packet(pk)?;
        let mut writer = self.writer.lock().await;
        protocol::write_frame(&mut *writer, &body).await?;
        Ok(())
    }

    async fn disconnect(&self, reason: &str) {
        if !self.is_closed() {
            let pk = Packet::Disconnect {
                message: reason.to_string(),
            };
            if let Err(e) = self.write_packet(&pk).await {
                debug!(peer = %self.peer, "Failed to deliver disconnect: {}", e);
            }
        }
        self.close().await;
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Connects to `host:port`, optionally through a `socks5://` upstream proxy.
pub async fn dial(
    host: &str,
    port: u16,
    proxy_url: Option<&str>,
) -> Result<FramedConn, TransportError> {
    let backend = format!("{}:{}", host, port);
    let stream: Box<AsyncStream> = match proxy_url.filter(|u| !u.is_empty()) {
        Some(proxy_url) => {
            let url = Url::parse(proxy_url).map_err(|e| TransportError::Proxy(e.to_string()))?;
            if url.scheme() != "socks5" {
                return Err(TransportError::Proxy(format!(
                    "unsupported proxy scheme {}",
                    url.scheme()
                )));
            }
            let proxy_host = url.host_str().unwrap_or_default();
            let proxy_port = url.port().unwrap_or(1080);
            let proxy_backend = format!("{}:{}", proxy_host, proxy_port);
            let username = url.username();
            let password = url.password().unwrap_or_default();

            let stream = if !username.is_empty() {
                Socks5Stream::connect_with_password(
                    &*proxy_backend,
                    &*backend,
                    username,
                    password,
                )
                .await
            } else {
                Socks5Stream::connect(&*proxy_backend, &*backend).await
            }
            .map_err(|e| TransportError::Proxy(e.to_string()))?;
            Box::new(stream)
        }
        None => Box::new(TcpStream::connect(&backend).await?),
    };
    Ok(FramedConn::new(stream, backend))
}
