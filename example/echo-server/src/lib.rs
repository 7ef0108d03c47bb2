//! Echo server built from two modules: `game` holds the connected agents and
//! echoes what they say; `gate` owns the TCP listener and one agent task per
//! connection.

pub mod game;
pub mod gate;
pub mod wire;


use game::{Game, GameProto};
use gate::Gate;
use module_kit_runtime::{Registry, RegistryError, ServerConfig};
use std::net::SocketAddr;

pub const GAME: &str = "game";
pub const GATE: &str = "gate";

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("failed to bind gate: {0}")]
    Bind(#[from] std::io::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Register the game and gate modules. Returns the gate's bound address.
pub async fn start(
    registry: &Registry,
    config: &ServerConfig,
    addr: &str,
) -> Result<SocketAddr, StartError> {
    registry.register(Game::new(&config.module(GAME)), GAME)?;
    let game = registry.search::<GameProto>(GAME)?;

    let gate = Gate::bind(addr, &config.module(GATE), game).await?;
    let local_addr = gate.local_addr();
    registry.register(gate, GATE)?;

    Ok(local_addr)
}
