//! overpass/src/relay.rs
//! The two packet pumps of a session and the per-packet rewrite rules.

use crate::{
    command::{Command, CommandContext, CommandDispatcher},
    features::Feature,
    packet::{Ability, InputMode, InteractAction, Metadata, Packet},
    player::PlayerRegistry,
    state::{TOTAL_PACKETS_DROPPED, TOTAL_PACKETS_RECV, TOTAL_PACKETS_SENT},
    transfer::TransferChain,
    transport::{PacketConn, TransportError},
    types::{ConnMetrics, GameData, ProxyConnection},
};
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, direct::NotKeyed},
};
use nonzero_ext::nonzero;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

/// The error that ended a pump, and which connection it came from.
#[derive(Debug)]
struct Fault {
    side: Side,
    error: TransportError,
}

impl Fault {
    fn client(error: TransportError) -> Self {
        Fault {
            side: Side::Client,
            error,
        }
    }

    fn server(error: TransportError) -> Self {
        Fault {
            side: Side::Server,
            error,
        }
    }
}

/// One client connection paired with one upstream connection.
pub struct Session<C: PacketConn> {
    id: ProxyConnection,
    client: Arc<C>,
    server: Arc<C>,
    game: GameData,
    chain: Arc<TransferChain>,
    players: PlayerRegistry,
    dispatcher: CommandDispatcher,
    // At most one kill-aura attack per second for the whole session.
    kill_aura: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    metrics: Arc<ConnMetrics>,
    terminated: AtomicBool,
}

impl<C: PacketConn> Session<C> {
    pub fn new(
        id: ProxyConnection,
        client: Arc<C>,
        server: Arc<C>,
        game: GameData,
        chain: Arc<TransferChain>,
        metrics: Arc<ConnMetrics>,
    ) -> Self {
        let dispatcher = CommandDispatcher::new(chain.context().options().command_prefix.clone());
        Self {
            id,
            client,
            server,
            game,
            chain,
            players: PlayerRegistry::new(),
            dispatcher,
            kill_aura: RateLimiter::direct(Quota::per_second(nonzero!(1u32))),
            metrics,
            terminated: AtomicBool::new(false),
        }
    }

    pub fn players(&self) -> &PlayerRegistry {
        &self.players
    }

    /// Relays until either side fails. Both connections are closed on return.
    pub async fn run(&self) {
        info!(conn = self.id, runtime_id = self.game.runtime_id, "Session started");
        tokio::join!(self.pump_outbound(), self.pump_inbound());
    }

    // client -> server
    async fn pump_outbound(&self) {
        let fault = loop {
            let pk = match self.client.read_packet().await {
                Ok(pk) => pk,
                Err(e) => break Fault::client(e),
            };
            match self.on_client_packet(pk).await {
                Ok(Some(pk)) => {
                    if let Err(e) = self.server.write_packet(&pk).await {
                        break Fault::server(e);
                    }
                    self.metrics.packets_sent.fetch_add(1, Ordering::Relaxed);
                    TOTAL_PACKETS_SENT.fetch_add(1, Ordering::Relaxed);
                }
                Ok(None) => self.count_dropped(),
                Err(fault) => break fault,
            }
        };
        self.shutdown(fault).await;
    }

    // server -> client
    async fn pump_inbound(&self) {
        let fault = loop {
            let pk = match self.server.read_packet().await {
                Ok(pk) => pk,
                Err(e) => break Fault::server(e),
            };
            match self.on_server_packet(pk).await {
                Ok(Some(pk)) => {
                    if let Err(e) = self.client.write_packet(&pk).await {
                        break Fault::client(e);
                    }
                    self.metrics.packets_recv.fetch_add(1, Ordering::Relaxed);
                    TOTAL_PACKETS_RECV.fetch_add(1, Ordering::Relaxed);
                }
                Ok(None) => self.count_dropped(),
                Err(fault) => break fault,
            }
        };
        self.shutdown(fault).await;
    }

    /// Applies client-side rules. `None` means the packet is swallowed.
    async fn on_client_packet(&self, mut pk: Packet) -> Result<Option<Packet>, Fault> {
        match &mut pk {
            Packet::PlayerAuthInput { input_mode, .. } => {
                *input_mode = self.input_mode();
            }
            Packet::RequestAbility {
                ability: Ability::Flying,
                value,
            } => {
                if *value == self.is_active(Feature::Fly) {
                    debug!(conn = self.id, "Dropping redundant flight request");
                    return Ok(None);
                }
            }
            Packet::CommandRequest { command_line } => {
                if let Some(command) = Command::parse(command_line, self.dispatcher.prefix()) {
                    info!(conn = self.id, verb = %command.verb, "Running proxy command");
                    let replies = self.run_command(&command);
                    for reply in &replies {
                        self.client.write_packet(reply).await.map_err(Fault::client)?;
                    }
                    return Ok(None);
                }
            }
            _ => {}
        }
        Ok(Some(pk))
    }

    /// Applies server-side rules. `None` means the packet is swallowed.
    async fn on_server_packet(&self, mut pk: Packet) -> Result<Option<Packet>, Fault> {
        match &mut pk {
            Packet::AddPlayer {
                username,
                runtime_id,
                unique_id,
                metadata,
            } => {
                *metadata = self.register_player(username, *runtime_id, *unique_id, metadata.clone());
            }
            Packet::RemoveActor { unique_id } => {
                if let Some(player) = self.players.remove_by_unique_id(*unique_id) {
                    debug!(conn = self.id, player = %player.name, "Player removed");
                }
            }
            Packet::SetActorData {
                runtime_id,
                metadata,
                ..
            } => {
                if let Some(dirty) = self.update_player(*runtime_id, metadata) {
                    *metadata = dirty;
                }
            }
            Packet::SetActorMotion { runtime_id, .. } => {
                if *runtime_id == self.game.runtime_id && self.is_active(Feature::AntiKnockback) {
                    return Ok(None);
                }
            }
            Packet::Transfer { address, port } => {
                info!(conn = self.id, %address, port = *port, "Upstream requested transfer");
                match self.chain.redirect(self.id, &*self.client, address, *port).await {
                    Ok(_) => return Ok(None),
                    Err(TransportError::Closed) => return Err(Fault::client(TransportError::Closed)),
                    Err(e) => {
                        error!(
                            conn = self.id,
                            "Could not chain transfer, forwarding it as-is: {}", e
                        );
                    }
                }
            }
            Packet::MoveActorAbsolute {
                runtime_id,
                position,
            } => {
                if *runtime_id != self.game.runtime_id
                    && self.is_active(Feature::KillAura)
                    && self.kill_aura.check().is_ok()
                {
                    let attack = Packet::EntityInteract {
                        target_runtime_id: *runtime_id,
                        action: InteractAction::Attack,
                        hotbar_slot: 0,
                        position: *position,
                    };
                    self.server.write_packet(&attack).await.map_err(Fault::server)?;
                }
            }
            _ => {}
        }
        Ok(Some(pk))
    }

    async fn shutdown(&self, fault: Fault) {
        let reason = match (fault.side, &fault.error) {
            (Side::Server, TransportError::Disconnected(reason)) => {
                info!(conn = self.id, %reason, "Upstream disconnected");
                Some(reason.as_str())
            }
            (Side::Client, TransportError::Disconnected(reason)) => {
                info!(conn = self.id, %reason, "Client disconnected");
                None
            }
            (_, TransportError::Closed) => None,
            (side, e) => {
                debug!(conn = self.id, ?side, "Relay failed: {}", e);
                None
            }
        };
        self.terminate(reason).await;
    }

    /// Closes both connections once; later calls do nothing. Closing also
    /// wakes the sibling pump, which then exits through here.
    async fn terminate(&self, reason: Option<&str>) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        match reason {
            Some(reason) => self.client.disconnect(reason).await,
            None => self.client.close().await,
        }
        self.server.close().await;
    }

    fn count_dropped(&self) {
        self.metrics.packets_dropped.fetch_add(1, Ordering::Relaxed);
        TOTAL_PACKETS_DROPPED.fetch_add(1, Ordering::Relaxed);
    }

    fn input_mode(&self) -> InputMode {
        self.chain.context().options().input_mode
    }

    fn is_active(&self, feature: Feature) -> bool {
        self.chain.state().lock().unwrap().is_active(feature)
    }

    // The registry is only touched with the state lock held, state first,
    // so a player is never cached against a hitbox size that just changed.

    fn run_command(&self, command: &Command) -> Vec<Packet> {
        let mut state = self.chain.state().lock().unwrap();
        self.dispatcher.dispatch(
            command,
            CommandContext {
                state: &mut state,
                players: &self.players,
                runtime_id: self.game.runtime_id,
            },
        )
    }

    fn register_player(&self, name: &str, runtime_id: u64, unique_id: i64, metadata: Metadata) -> Metadata {
        let state = self.chain.state().lock().unwrap();
        self.players
            .register(name, runtime_id, unique_id, metadata, state.hitbox_override())
    }

    fn update_player(&self, runtime_id: u64, metadata: &Metadata) -> Option<Metadata> {
        let state = self.chain.state().lock().unwrap();
        self.players
            .update_metadata(runtime_id, metadata, state.hitbox_override())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::CHAT_PREFIX,
        features::ProxyState,
        packet::{HITBOX_METADATA_KEY, Metadata, MetadataValue, TextKind, Vec3},
        player::with_overrides,
        testing::{MockConn, MockPeer},
        transfer::ProxyContext,
        types::ProxyOptions,
    };
    use std::time::Duration;
    use tokio::task::JoinHandle;

    const LOCAL: u64 = 1;

    struct Harness {
        session: Arc<Session<MockConn>>,
        client: Arc<MockConn>,
        server: Arc<MockConn>,
        client_peer: MockPeer,
        server_peer: MockPeer,
        task: JoinHandle<()>,
    }

    impl Harness {
        fn start() -> Self {
            Self::start_with(ProxyOptions::default())
        }

        fn start_with(options: ProxyOptions) -> Self {
            let (client, client_peer) = MockConn::pair();
            let (server, server_peer) = MockConn::pair();
            let session = Arc::new(session(options, client.clone(), server.clone()));
            let task = tokio::spawn({
                let session = session.clone();
                async move { session.run().await }
            });
            Harness {
                session,
                client,
                server,
                client_peer,
                server_peer,
                task,
            }
        }

        /// Runs a proxy command and consumes the `replies` packets it sends back.
        async fn command(&mut self, line: &str, replies: usize) -> Vec<Packet> {
            self.client_peer.send(Packet::CommandRequest {
                command_line: line.to_string(),
            });
            let mut packets = Vec::new();
            for _ in 0..replies {
                packets.push(self.client_peer.recv().await);
            }
            packets
        }
    }

    fn session(options: ProxyOptions, client: Arc<MockConn>, server: Arc<MockConn>) -> Session<MockConn> {
        let chain = TransferChain::new(ProxyContext::new(options), ProxyState::shared());
        Session::new(
            1,
            client,
            server,
            GameData {
                runtime_id: LOCAL,
                unique_id: -1,
            },
            chain,
            Arc::new(ConnMetrics::default()),
        )
    }

    /// Options whose first transfer hop lands on a port that was just free.
    fn loopback_hop_options() -> (ProxyOptions, u16) {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let options = ProxyOptions {
            bind_host: "127.0.0.1".to_string(),
            advertise_host: "127.0.0.1".to_string(),
            transfer_port_base: port - 1,
            ..ProxyOptions::default()
        };
        (options, port)
    }

    async fn wait_stopped(task: JoinHandle<()>) {
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("session did not stop")
            .unwrap();
    }

    fn marker(id: u32) -> Packet {
        Packet::Unknown {
            id,
            payload: Vec::new(),
        }
    }

    fn add_player(name: &str, runtime_id: u64, unique_id: i64, hitbox: f32) -> Packet {
        Packet::AddPlayer {
            username: name.to_string(),
            runtime_id,
            unique_id,
            metadata: [(HITBOX_METADATA_KEY, MetadataValue::Float(hitbox))]
                .into_iter()
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_unrelated_packets_pass_both_ways() {
        let mut h = Harness::start();
        h.client_peer.send(marker(1));
        h.server_peer.send(marker(2));
        assert_eq!(h.server_peer.recv().await, marker(1));
        assert_eq!(h.client_peer.recv().await, marker(2));
    }

    #[tokio::test]
    async fn test_input_mode_is_forced() {
        let mut h = Harness::start();
        h.client_peer.send(Packet::PlayerAuthInput {
            input_mode: InputMode::Touch,
            position: Vec3::default(),
            tick: 4,
        });
        assert_eq!(
            h.server_peer.recv().await,
            Packet::PlayerAuthInput {
                input_mode: InputMode::MouseKeyboard,
                position: Vec3::default(),
                tick: 4,
            }
        );
    }

    #[tokio::test]
    async fn test_flight_request_matching_forced_state_is_dropped() {
        let mut h = Harness::start();
        h.client_peer.send(Packet::RequestAbility {
            ability: Ability::Flying,
            value: false,
        });
        h.client_peer.send(Packet::RequestAbility {
            ability: Ability::Flying,
            value: true,
        });
        assert_eq!(
            h.server_peer.recv().await,
            Packet::RequestAbility {
                ability: Ability::Flying,
                value: true,
            }
        );
    }

    #[tokio::test]
    async fn test_proxy_commands_never_reach_the_server() {
        let mut h = Harness::start();
        let replies = h.command("/.gamemode 9", 1).await;
        assert_eq!(
            replies,
            vec![Packet::ChatText {
                kind: TextKind::Raw,
                message: format!("{CHAT_PREFIX}§cUnknown \"9\" game mode!"),
            }]
        );
        h.client_peer.send(Packet::CommandRequest {
            command_line: "/spawn".to_string(),
        });
        // Only the server's own command comes through.
        assert_eq!(
            h.server_peer.recv().await,
            Packet::CommandRequest {
                command_line: "/spawn".to_string(),
            }
        );
        assert!(h.server_peer.drain().is_empty());
    }

    #[tokio::test]
    async fn test_joining_player_gets_current_hitbox() {
        let mut h = Harness::start();
        h.command("/.hitbox 1.2", 2).await;

        h.server_peer.send(add_player("P3", 30, 300, 0.6));
        match h.client_peer.recv().await {
            Packet::AddPlayer { metadata, .. } => {
                assert_eq!(metadata.get(&HITBOX_METADATA_KEY), Some(&MetadataValue::Float(1.2)));
            }
            other => panic!("unexpected packet {other:?}"),
        }
        let cached = h.session.players().get("P3").unwrap();
        assert_eq!(cached.metadata.get(&HITBOX_METADATA_KEY), Some(&MetadataValue::Float(0.6)));
    }

    #[tokio::test]
    async fn test_actor_data_keeps_override_and_caches_server_copy() {
        let mut h = Harness::start();
        h.server_peer.send(add_player("P1", 10, 100, 0.6));
        h.client_peer.recv().await;
        h.command("/.hitbox 3", 3).await;

        let update: Metadata = [
            (HITBOX_METADATA_KEY, MetadataValue::Float(0.6)),
            (0, MetadataValue::Long(2)),
        ]
        .into_iter()
        .collect();
        h.server_peer.send(Packet::SetActorData {
            runtime_id: 10,
            metadata: update.clone(),
            tick: 9,
        });
        match h.client_peer.recv().await {
            Packet::SetActorData { metadata, .. } => {
                assert_eq!(metadata.get(&HITBOX_METADATA_KEY), Some(&MetadataValue::Float(3.0)));
                assert_eq!(metadata.get(&0), Some(&MetadataValue::Long(2)));
            }
            other => panic!("unexpected packet {other:?}"),
        }
        assert_eq!(h.session.players().get("P1").unwrap().metadata, update);
    }

    #[tokio::test]
    async fn test_remove_actor_evicts_player() {
        let mut h = Harness::start();
        h.server_peer.send(add_player("P1", 10, 100, 0.6));
        h.server_peer.send(Packet::RemoveActor { unique_id: 100 });
        h.client_peer.recv().await;
        h.client_peer.recv().await;
        assert!(h.session.players().is_empty());
    }

    #[tokio::test]
    async fn test_anti_knockback_drops_local_motion_only() {
        let mut h = Harness::start();
        h.command("/.antikb", 2).await;

        let local = Packet::SetActorMotion {
            runtime_id: LOCAL,
            velocity: Vec3::new(0.0, 0.4, 1.0),
        };
        let other = Packet::SetActorMotion {
            runtime_id: 7,
            velocity: Vec3::new(0.0, 0.4, 1.0),
        };
        h.server_peer.send(local);
        h.server_peer.send(other.clone());
        assert_eq!(h.client_peer.recv().await, other);
    }

    #[tokio::test]
    async fn test_kill_aura_attacks_at_most_once_per_cooldown() {
        let mut h = Harness::start();
        h.command("/.killaura", 2).await;

        for x in [1.0, 1.5] {
            h.server_peer.send(Packet::MoveActorAbsolute {
                runtime_id: 7,
                position: Vec3::new(x, 64.0, 0.0),
            });
        }
        h.client_peer.recv().await;
        h.client_peer.recv().await;

        let attacks: Vec<_> = h
            .server_peer
            .drain()
            .into_iter()
            .filter(|pk| matches!(pk, Packet::EntityInteract { .. }))
            .collect();
        assert_eq!(
            attacks,
            vec![Packet::EntityInteract {
                target_runtime_id: 7,
                action: InteractAction::Attack,
                hotbar_slot: 0,
                position: Vec3::new(1.0, 64.0, 0.0),
            }]
        );
    }

    #[tokio::test]
    async fn test_kill_aura_off_never_attacks() {
        let mut h = Harness::start();
        h.server_peer.send(Packet::MoveActorAbsolute {
            runtime_id: 7,
            position: Vec3::default(),
        });
        h.client_peer.recv().await;
        assert!(h.server_peer.drain().is_empty());
    }

    #[tokio::test]
    async fn test_upstream_disconnect_reaches_client_and_closes_once() {
        let h = Harness::start();
        h.server_peer
            .fail(TransportError::Disconnected("You were kicked".to_string()));
        wait_stopped(h.task).await;

        assert_eq!(h.client.disconnects(), vec!["You were kicked".to_string()]);
        assert_eq!(h.client.close_calls(), 1);
        assert_eq!(h.server.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_io_failure_closes_both_silently() {
        let h = Harness::start();
        h.client_peer.fail(TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        )));
        wait_stopped(h.task).await;

        assert!(h.client.disconnects().is_empty());
        assert_eq!(h.client.close_calls(), 1);
        assert_eq!(h.server.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_client_disconnect_closes_both_once() {
        let h = Harness::start();
        h.client_peer
            .fail(TransportError::Disconnected("Leaving".to_string()));
        wait_stopped(h.task).await;

        assert!(h.client.disconnects().is_empty());
        assert_eq!(h.client.close_calls(), 1);
        assert_eq!(h.server.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_transfer_is_answered_with_a_local_hop() {
        let (options, hop_port) = loopback_hop_options();
        let mut h = Harness::start_with(options);
        h.server_peer.send(Packet::Transfer {
            address: "10.0.0.9".to_string(),
            port: 19132,
        });
        h.server_peer.send(marker(1));

        assert_eq!(
            h.client_peer.recv().await,
            Packet::Transfer {
                address: "127.0.0.1".to_string(),
                port: hop_port,
            }
        );
        assert_eq!(h.client_peer.recv().await, marker(1));
        tokio::net::TcpStream::connect(("127.0.0.1", hop_port))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_transfer_is_forwarded_when_hop_cannot_bind() {
        let (options, hop_port) = loopback_hop_options();
        let _taken = std::net::TcpListener::bind(("127.0.0.1", hop_port)).unwrap();
        let mut h = Harness::start_with(options);
        let transfer = Packet::Transfer {
            address: "10.0.0.9".to_string(),
            port: 19132,
        };
        h.server_peer.send(transfer.clone());
        h.server_peer.send(marker(1));

        assert_eq!(h.client_peer.recv().await, transfer);
        assert_eq!(h.client_peer.recv().await, marker(1));
    }

    #[test]
    fn test_players_track_hitbox_changed_concurrently() {
        let (client, _client_peer) = MockConn::pair();
        let (server, _server_peer) = MockConn::pair();
        let session = session(ProxyOptions::default(), client, server);
        let metadata: Metadata = [(HITBOX_METADATA_KEY, MetadataValue::Float(0.6))]
            .into_iter()
            .collect();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..200u64 {
                    session.register_player(&format!("P{i}"), 10 + i, 100 + i as i64, metadata.clone());
                }
            });
            scope.spawn(|| {
                for i in 0..200 {
                    let line = if i % 2 == 0 { "/.hitbox 1.2" } else { "/.hitbox 0" };
                    session.run_command(&Command::parse(line, "/.").unwrap());
                }
            });
        });

        let expected = session.chain.state().lock().unwrap().hitbox_override();
        for i in 0..200 {
            let player = session.players().get(&format!("P{i}")).unwrap();
            assert_eq!(player.dirty_metadata, with_overrides(&player.metadata, expected));
        }
    }
}
