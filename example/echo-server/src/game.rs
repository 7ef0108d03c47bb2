//! Game module: owns every connected agent's outbox and echoes what they say
//! to everyone.

use crate::wire::ServerMsg;
use module_kit_runtime::{
    variant, Cron, CronExpr, Module, ModuleConfig, Protocol, RpcError, Skeleton,
};
use std::collections::HashMap;
use tokio::sync::mpsc;

pub const MAX_NAME_LEN: usize = 32;

pub enum GameCmd {
    Join {
        agent: u64,
        outbox: mpsc::Sender<ServerMsg>,
    },
    Say {
        agent: u64,
        text: String,
    },
    Rename {
        agent: u64,
        name: String,
    },
    Who {
        agent: u64,
    },
    CloseAgent {
        agent: u64,
    },
    Online,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GameId {
    Join,
    Say,
    Rename,
    Who,
    CloseAgent,
    Online,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameReply {
    Done,
    Online(usize),
}

pub struct GameProto;

impl Protocol for GameProto {
    type Id = GameId;
    type Command = GameCmd;
    type Reply = GameReply;

    fn id(command: &GameCmd) -> GameId {
        match command {
            GameCmd::Join { .. } => GameId::Join,
            GameCmd::Say { .. } => GameId::Say,
            GameCmd::Rename { .. } => GameId::Rename,
            GameCmd::Who { .. } => GameId::Who,
            GameCmd::CloseAgent { .. } => GameId::CloseAgent,
            GameCmd::Online => GameId::Online,
        }
    }
}

struct Agent {
    name: String,
    outbox: mpsc::Sender<ServerMsg>,
}

pub struct Game {
    skeleton: Skeleton<Game>,
    agents: HashMap<u64, Agent>,
    said: u64,
    heartbeat: Option<Cron<Game>>,
}

impl Game {
    pub fn new(config: &ModuleConfig) -> Self {
        Self {
            skeleton: Skeleton::new(config),
            agents: HashMap::new(),
            said: 0,
            heartbeat: None,
        }
    }

    fn send_to(&self, agent: u64, msg: ServerMsg) {
        if let Some(target) = self.agents.get(&agent) {
            if target.outbox.try_send(msg).is_err() {
                tracing::warn!(agent, "outbox full, message dropped");
            }
        }
    }

    fn broadcast(&self, msg: ServerMsg) {
        for (agent, target) in &self.agents {
            if target.outbox.try_send(msg.clone()).is_err() {
                tracing::warn!(agent, "outbox full, broadcast dropped");
            }
        }
    }

    fn join(
        &mut self,
        agent: u64,
        outbox: mpsc::Sender<ServerMsg>,
    ) -> Result<GameReply, RpcError> {
        let name = format!("agent-{}", agent);
        self.agents.insert(
            agent,
            Agent {
                name: name.clone(),
                outbox,
            },
        );
        self.send_to(agent, ServerMsg::Welcome { agent, name });
        tracing::info!(agent, online = self.agents.len(), "agent joined");
        Ok(GameReply::Done)
    }

    fn say(&mut self, agent: u64, text: String) -> Result<GameReply, RpcError> {
        let from = match self.agents.get(&agent) {
            Some(sender) => sender.name.clone(),
            None => return Err(RpcError::handler(format!("unknown agent {}", agent))),
        };
        self.said += 1;
        self.broadcast(ServerMsg::Echo { from, text });
        Ok(GameReply::Done)
    }

    fn rename(&mut self, agent: u64, name: String) -> Result<GameReply, RpcError> {
        let name = name.trim().to_string();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            self.send_to(
                agent,
                ServerMsg::Error {
                    message: format!("name must be 1 to {} characters", MAX_NAME_LEN),
                },
            );
            return Ok(GameReply::Done);
        }
        if let Some(target) = self.agents.get_mut(&agent) {
            tracing::debug!(agent, from = %target.name, to = %name, "agent renamed");
            target.name = name;
        }
        Ok(GameReply::Done)
    }

    fn who(&mut self, agent: u64) -> Result<GameReply, RpcError> {
        let mut names: Vec<String> = self.agents.values().map(|a| a.name.clone()).collect();
        names.sort();
        self.send_to(agent, ServerMsg::Who { names });
        Ok(GameReply::Done)
    }

    fn close_agent(&mut self, agent: u64) -> Result<GameReply, RpcError> {
        if self.agents.remove(&agent).is_some() {
            tracing::info!(agent, online = self.agents.len(), "agent left");
        }
        Ok(GameReply::Online(self.agents.len()))
    }
}

impl Module for Game {
    type Protocol = GameProto;

    fn skeleton(&self) -> &Skeleton<Self> {
        &self.skeleton
    }

    fn skeleton_mut(&mut self) -> &mut Skeleton<Self> {
        &mut self.skeleton
    }

    fn on_init(&mut self) {
        self.skeleton.register_variant(
            GameId::Join,
            variant!(GameCmd::Join { agent, outbox } => (agent, outbox)),
            |game: &mut Game, (agent, outbox)| game.join(agent, outbox),
        );
        self.skeleton.register_variant(
            GameId::Say,
            variant!(GameCmd::Say { agent, text } => (agent, text)),
            |game: &mut Game, (agent, text)| game.say(agent, text),
        );
        self.skeleton.register_variant(
            GameId::Rename,
            variant!(GameCmd::Rename { agent, name } => (agent, name)),
            |game: &mut Game, (agent, name)| game.rename(agent, name),
        );
        self.skeleton.register_variant(
            GameId::Who,
            variant!(GameCmd::Who { agent } => agent),
            Game::who,
        );
        self.skeleton.register_variant(
            GameId::CloseAgent,
            variant!(GameCmd::CloseAgent { agent } => agent),
            Game::close_agent,
        );
        self.skeleton.register(GameId::Online, |game: &mut Game, _| {
            Ok(GameReply::Online(game.agents.len()))
        });

        self.skeleton
            .register_command("online", "number of connected agents", |game: &mut Game, _| {
                Ok(game.agents.len().to_string())
            });
        self.skeleton
            .register_command("kick", "kick <agent>: disconnect an agent", |game: &mut Game, args| {
                let agent: u64 = args
                    .first()
                    .and_then(|a| a.parse().ok())
                    .ok_or_else(|| RpcError::handler("usage: kick <agent>"))?;
                // Dropping the outbox ends the agent's connection.
                match game.agents.remove(&agent) {
                    Some(kicked) => Ok(format!("kicked {}", kicked.name)),
                    None => Err(RpcError::handler(format!("no agent {}", agent))),
                }
            });

        match CronExpr::parse("0 * * * * *") {
            Ok(every_minute) => {
                self.heartbeat = Some(self.skeleton.cron_func(every_minute, |game: &mut Game| {
                    tracing::info!(online = game.agents.len(), said = game.said, "heartbeat");
                }));
            }
            Err(e) => tracing::error!("heartbeat disabled: {}", e),
        }
    }

    fn on_destroy(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }
        tracing::info!(said = self.said, "game closed");
    }
}
