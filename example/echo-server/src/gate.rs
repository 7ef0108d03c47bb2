//! Gate module: accepts TCP connections and runs one agent task per
//! connection. Agents decode client lines into game commands.

use crate::game::{GameCmd, GameProto, GameReply};
use crate::wire::{self, ClientMsg, ServerMsg};
use module_kit_runtime::{
    variant, Module, ModuleConfig, Protocol, RpcError, ServerHandle, Skeleton,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};

const OUTBOX_LEN: usize = 64;

pub enum GateCmd {
    Connected {
        agent: u64,
        peer: SocketAddr,
        task: AbortHandle,
    },
    Disconnected {
        agent: u64,
    },
    Agents,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateId {
    Connected,
    Disconnected,
    Agents,
}

pub struct GateProto;

impl Protocol for GateProto {
    type Id = GateId;
    type Command = GateCmd;
    type Reply = usize;

    fn id(command: &GateCmd) -> GateId {
        match command {
            GateCmd::Connected { .. } => GateId::Connected,
            GateCmd::Disconnected { .. } => GateId::Disconnected,
            GateCmd::Agents => GateId::Agents,
        }
    }
}

pub struct Gate {
    skeleton: Skeleton<Gate>,
    game: ServerHandle<GameProto>,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    accept_task: Option<JoinHandle<()>>,
    agents: HashMap<u64, AbortHandle>,
    peak_online: usize,
}

impl Gate {
    /// Bind the listening socket. Accepting starts once the module is
    /// registered.
    pub async fn bind(
        addr: &str,
        config: &ModuleConfig,
        game: ServerHandle<GameProto>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            skeleton: Skeleton::new(config),
            game,
            listener: Some(listener),
            local_addr,
            accept_task: None,
            agents: HashMap::new(),
            peak_online: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Module for Gate {
    type Protocol = GateProto;

    fn skeleton(&self) -> &Skeleton<Self> {
        &self.skeleton
    }

    fn skeleton_mut(&mut self) -> &mut Skeleton<Self> {
        &mut self.skeleton
    }

    fn on_init(&mut self) {
        self.skeleton.register_variant(
            GateId::Connected,
            variant!(GateCmd::Connected { agent, peer, task } => (agent, peer, task)),
            |gate: &mut Gate, (agent, peer, task)| {
                tracing::debug!(agent, %peer, "agent connected");
                gate.agents.insert(agent, task);

                // Track the game's view of the population off the hot path.
                gate.skeleton
                    .async_call(&gate.game, GameCmd::Online, |gate: &mut Gate, result| {
                        match result {
                            Ok(GameReply::Online(n)) => gate.peak_online = gate.peak_online.max(n),
                            Ok(_) => {}
                            Err(e) => tracing::warn!("online query failed: {}", e),
                        }
                    });
                Ok(gate.agents.len())
            },
        );
        self.skeleton.register_variant(
            GateId::Disconnected,
            variant!(GateCmd::Disconnected { agent } => agent),
            |gate: &mut Gate, agent| {
                gate.agents.remove(&agent);
                Ok(gate.agents.len())
            },
        );
        self.skeleton
            .register(GateId::Agents, |gate: &mut Gate, _| Ok(gate.agents.len()));

        self.skeleton
            .register_command("peak", "highest number of agents seen online", |gate: &mut Gate, _| {
                Ok(gate.peak_online.to_string())
            });

        if let Some(listener) = self.listener.take() {
            tracing::info!(addr = %self.local_addr, "gate listening");
            self.accept_task = Some(tokio::spawn(accept_loop(
                listener,
                self.skeleton.server(),
                self.game.clone(),
            )));
        }
    }

    fn on_destroy(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        for (_, agent) in self.agents.drain() {
            agent.abort();
        }
        tracing::info!(peak = self.peak_online, "gate closed");
    }
}

async fn accept_loop(
    listener: TcpListener,
    gate: ServerHandle<GateProto>,
    game: ServerHandle<GameProto>,
) {
    let mut next_agent = 0u64;
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("accept failed: {}", e);
                continue;
            }
        };

        next_agent += 1;
        let agent = next_agent;
        let (admitted, admission) = oneshot::channel();
        let task = tokio::spawn(run_agent(agent, stream, game.clone(), gate.clone(), admission));

        // The agent starts only after `Connected` is queued, so its
        // `Disconnected` always lands behind it.
        let connected = GateCmd::Connected {
            agent,
            peer,
            task: task.abort_handle(),
        };
        match gate.send(connected).await {
            Ok(()) => {
                let _ = admitted.send(());
            }
            Err(e) => {
                tracing::warn!(agent, "gate refused connection: {}", e);
                task.abort();
                if matches!(e, RpcError::ServerClosed) {
                    return;
                }
            }
        }
    }
}

/// One connection: once admitted by the gate, register with the game,
/// forward decoded lines to it and write back whatever lands in the outbox.
async fn run_agent(
    agent: u64,
    stream: TcpStream,
    game: ServerHandle<GameProto>,
    gate: ServerHandle<GateProto>,
    admission: oneshot::Receiver<()>,
) {
    if admission.await.is_err() {
        return;
    }

    let (reader, mut writer) = stream.into_split();
    let (outbox, mut inbox) = mpsc::channel(OUTBOX_LEN);

    if let Err(e) = game.call(GameCmd::Join { agent, outbox }).await {
        tracing::warn!(agent, "join failed: {}", e);
        let _ = gate.go(GateCmd::Disconnected { agent });
        return;
    }

    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    let reply = match serde_json::from_str::<ClientMsg>(&line) {
                        Ok(msg) => game.go(command_for(agent, msg)).err().map(|e| ServerMsg::Error {
                            message: e.to_string(),
                        }),
                        Err(e) => Some(ServerMsg::Error {
                            message: format!("bad message: {}", e),
                        }),
                    };
                    if let Some(reply) = reply {
                        if wire::write_msg(&mut writer, &reply).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(agent, "read failed: {}", e);
                    break;
                }
            },
            msg = inbox.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = wire::write_msg(&mut writer, &msg).await {
                        tracing::debug!(agent, "write failed: {}", e);
                        break;
                    }
                }
                // Outbox dropped by the game: kicked.
                None => break,
            },
        }
    }

    match game.call(GameCmd::CloseAgent { agent }).await {
        Ok(GameReply::Online(online)) => tracing::debug!(agent, online, "agent closed"),
        Ok(_) => {}
        Err(e) => tracing::warn!(agent, "close agent failed: {}", e),
    }
    let _ = gate.go(GateCmd::Disconnected { agent });
}

fn command_for(agent: u64, msg: ClientMsg) -> GameCmd {
    match msg {
        ClientMsg::Say { text } => GameCmd::Say { agent, text },
        ClientMsg::Rename { name } => GameCmd::Rename { agent, name },
        ClientMsg::Who => GameCmd::Who { agent },
    }
}
