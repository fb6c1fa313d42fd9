//! overpass/src/lib.rs
//! Man-in-the-middle game proxy core: packet relay with client-side feature
//! injection, in-game proxy commands, transfer chaining and metrics, exposed
//! to an embedding host through a C ABI.

pub mod command;
pub mod connection;
pub mod features;
pub mod ffi;
pub mod handshake;
pub mod logging;
pub mod packet;
pub mod player;
pub(crate) mod protocol;
pub mod relay;
pub mod state;
pub mod transfer;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use features::{Feature, ProxyState, SharedState};
pub use packet::Packet;
pub use relay::Session;
pub use transfer::{ProxyContext, TransferChain};
pub use transport::{FramedConn, PacketConn, TransportError};
pub use types::*;
