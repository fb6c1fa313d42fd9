//! overpass/src/testing.rs
//! In-memory `PacketConn` used by unit tests to drive the relay.

use crate::{
    packet::Packet,
    transport::{PacketConn, TransportError},
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::{Mutex, Notify, mpsc};

pub struct MockConn {
    incoming: Mutex<mpsc::UnboundedReceiver<Result<Packet, TransportError>>>,
    outgoing: mpsc::UnboundedSender<Packet>,
    closed: AtomicBool,
    shutdown: Notify,
    close_calls: AtomicUsize,
    disconnects: std::sync::Mutex<Vec<String>>,
}

/// The far end of a [`MockConn`]: feeds packets in and observes what was written.
pub struct MockPeer {
    pub tx: mpsc::UnboundedSender<Result<Packet, TransportError>>,
    pub rx: mpsc::UnboundedReceiver<Packet>,
}

impl MockPeer {
    pub fn send(&self, pk: Packet) {
        self.tx.send(Ok(pk)).unwrap();
    }

    pub fn fail(&self, err: TransportError) {
        self.tx.send(Err(err)).unwrap();
    }

    /// Next packet written to the connection, failing the test after a second.
    pub async fn recv(&mut self) -> Packet {
        tokio::time::timeout(Duration::from_secs(1), self.rx.recv())
            .await
            .expect("timed out waiting for packet")
            .expect("connection dropped")
    }

    /// Packets written so far without waiting.
    pub fn drain(&mut self) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Ok(pk) = self.rx.try_recv() {
            packets.push(pk);
        }
        packets
    }
}

impl MockConn {
    pub fn pair() -> (Arc<MockConn>, MockPeer) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let conn = MockConn {
            incoming: Mutex::new(in_rx),
            outgoing: out_tx,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            close_calls: AtomicUsize::new(0),
            disconnects: std::sync::Mutex::new(Vec::new()),
        };
        (
            Arc::new(conn),
            MockPeer {
                tx: in_tx,
                rx: out_rx,
            },
        )
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> Vec<String> {
        self.disconnects.lock().unwrap().clone()
    }
}

impl PacketConn for MockConn {
    async fn read_packet(&self) -> Result<Packet, TransportError> {
        let shutdown = self.shutdown.notified();
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            next = incoming.recv() => next.unwrap_or(Err(TransportError::Closed)),
            _ = shutdown => Err(TransportError::Closed),
        }
    }

    async fn write_packet(&self, pk: &Packet) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.outgoing
            .send(pk.clone())
            .map_err(|_| TransportError::Closed)
    }

    async fn disconnect(&self, reason: &str) {
        self.disconnects.lock().unwrap().push(reason.to_string());
        self.close().await;
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shutdown.notify_waiters();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
