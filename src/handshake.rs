//! overpass/src/handshake.rs
//! Session startup: client login, upstream join and the two spawn sequences.

use crate::{
    packet::{InputMode, Packet, PlayStatus},
    transport::{PacketConn, TransportError},
    types::GameData,
};
use tracing::debug;

/// Identity the client presented at login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginData {
    pub username: String,
    pub input_mode: InputMode,
    pub auth_token: Option<String>,
}

impl LoginData {
    fn to_packet(&self) -> Packet {
        Packet::Login {
            username: self.username.clone(),
            input_mode: self.input_mode,
            auth_token: self.auth_token.clone(),
        }
    }
}

/// Waits for the client's login.
pub async fn accept_login<C: PacketConn>(client: &C) -> Result<LoginData, TransportError> {
    loop {
        match client.read_packet().await? {
            Packet::Login {
                username,
                input_mode,
                auth_token,
            } => {
                return Ok(LoginData {
                    username,
                    input_mode,
                    auth_token,
                });
            }
            other => debug!(packet = other.name(), "Skipping packet before login"),
        }
    }
}

/// Logs in upstream on behalf of the client and waits for the game data.
pub async fn join_upstream<C: PacketConn>(
    server: &C,
    login: &LoginData,
) -> Result<GameData, TransportError> {
    server.write_packet(&login.to_packet()).await?;
    loop {
        match server.read_packet().await? {
            Packet::StartGame {
                runtime_id,
                unique_id,
            } => {
                return Ok(GameData {
                    runtime_id,
                    unique_id,
                });
            }
            other => debug!(packet = other.name(), "Skipping packet before start game"),
        }
    }
}

/// Starts the game on the client and waits until it reports it has spawned.
pub async fn spawn_client<C: PacketConn>(client: &C, game: &GameData) -> Result<(), TransportError> {
    client
        .write_packet(&Packet::StartGame {
            runtime_id: game.runtime_id,
            unique_id: game.unique_id,
        })
        .await?;
    loop {
        match client.read_packet().await? {
            Packet::LocalPlayerInitialized { .. } => return Ok(()),
            other => debug!(packet = other.name(), "Skipping client packet during spawn"),
        }
    }
}

/// Requests chunks upstream and waits for the spawn status.
pub async fn spawn_upstream<C: PacketConn>(server: &C, chunk_radius: i32) -> Result<(), TransportError> {
    server
        .write_packet(&Packet::RequestChunkRadius {
            radius: chunk_radius,
        })
        .await?;
    loop {
        match server.read_packet().await? {
            Packet::PlayStatus {
                status: PlayStatus::PlayerSpawn,
            } => return Ok(()),
            other => debug!(packet = other.name(), "Skipping server packet during spawn"),
        }
    }
}

/// Runs both spawn sequences concurrently; the session starts once both finish.
pub async fn spawn<C: PacketConn>(
    client: &C,
    server: &C,
    game: &GameData,
    chunk_radius: i32,
) -> Result<(), TransportError> {
    tokio::try_join!(
        spawn_client(client, game),
        spawn_upstream(server, chunk_radius)
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockConn;

    #[tokio::test]
    async fn test_full_startup_sequence() {
        let (client, mut client_peer) = MockConn::pair();
        let (server, mut server_peer) = MockConn::pair();

        client_peer.send(Packet::Login {
            username: "Steve".to_string(),
            input_mode: InputMode::Touch,
            auth_token: None,
        });
        let login = accept_login(&*client).await.unwrap();
        assert_eq!(login.username, "Steve");

        server_peer.send(Packet::Unknown { id: 1, payload: vec![] });
        server_peer.send(Packet::StartGame { runtime_id: 3, unique_id: -3 });
        let game = join_upstream(&*server, &login).await.unwrap();
        assert_eq!(game, GameData { runtime_id: 3, unique_id: -3 });
        assert!(matches!(server_peer.recv().await, Packet::Login { .. }));

        client_peer.send(Packet::LocalPlayerInitialized { runtime_id: 3 });
        server_peer.send(Packet::PlayStatus { status: PlayStatus::PlayerSpawn });
        spawn(&*client, &*server, &game, 8).await.unwrap();

        assert_eq!(
            client_peer.recv().await,
            Packet::StartGame { runtime_id: 3, unique_id: -3 }
        );
        assert_eq!(server_peer.recv().await, Packet::RequestChunkRadius { radius: 8 });
    }

    #[tokio::test]
    async fn test_upstream_rejection_carries_reason() {
        let (server, server_peer) = MockConn::pair();
        server_peer.fail(TransportError::Disconnected("Server is full".to_string()));

        let login = LoginData {
            username: "Alex".to_string(),
            input_mode: InputMode::MouseKeyboard,
            auth_token: None,
        };
        let err = join_upstream(&*server, &login).await.unwrap_err();
        assert_eq!(err.disconnect_reason(), Some("Server is full"));
    }
}
