//! Tests for the skeleton loop, driven directly (without a registry).

use super::{init, Module, Skeleton, SkeletonState};
use crate::config::ModuleConfig;
use crate::rpc::ServerHandle;
use module_kit_protocol::{ConsoleCommand, Protocol, RpcError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

// ============================================================================
// Test module
// ============================================================================

#[derive(Debug)]
enum CalcCmd {
    Add(i64, i64),
    Boom,
    Count,
    Counter,
    PokeSelf,
    Relay(Box<CalcCmd>),
    Schedule(u64),
    Defer(u64),
    Log,
    Ask(Box<CalcCmd>),
    Note(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CalcId {
    Add,
    Boom,
    Count,
    Counter,
    PokeSelf,
    Relay,
    Schedule,
    Defer,
    Log,
    Ask,
    Note,
}

#[derive(Debug, Clone, PartialEq)]
enum CalcReply {
    Num(i64),
    Text(String),
    Done,
}

struct CalcProto;

impl Protocol for CalcProto {
    type Id = CalcId;
    type Command = CalcCmd;
    type Reply = CalcReply;

    fn id(command: &CalcCmd) -> CalcId {
        match command {
            CalcCmd::Add(..) => CalcId::Add,
            CalcCmd::Boom => CalcId::Boom,
            CalcCmd::Count => CalcId::Count,
            CalcCmd::Counter => CalcId::Counter,
            CalcCmd::PokeSelf => CalcId::PokeSelf,
            CalcCmd::Relay(_) => CalcId::Relay,
            CalcCmd::Schedule(_) => CalcId::Schedule,
            CalcCmd::Defer(_) => CalcId::Defer,
            CalcCmd::Log => CalcId::Log,
            CalcCmd::Ask(_) => CalcId::Ask,
            CalcCmd::Note(_) => CalcId::Note,
        }
    }
}

struct Calc {
    skeleton: Skeleton<Calc>,
    peer: Option<ServerHandle<CalcProto>>,
    count: i64,
    log: Vec<String>,
}

impl Calc {
    fn new(peer: Option<ServerHandle<CalcProto>>) -> Self {
        Self {
            skeleton: Skeleton::new(&ModuleConfig::default()),
            peer,
            count: 0,
            log: Vec::new(),
        }
    }
}

impl Module for Calc {
    type Protocol = CalcProto;

    fn skeleton(&self) -> &Skeleton<Self> {
        &self.skeleton
    }

    fn skeleton_mut(&mut self) -> &mut Skeleton<Self> {
        &mut self.skeleton
    }

    fn on_init(&mut self) {
        self.skeleton.register(CalcId::Add, |_: &mut Calc, cmd| match cmd {
            CalcCmd::Add(a, b) => Ok(CalcReply::Num(a + b)),
            _ => unreachable!(),
        });
        self.skeleton.register(CalcId::Boom, |_: &mut Calc, _| panic!("boom"));
        self.skeleton.register(CalcId::Count, |calc: &mut Calc, _| {
            calc.count += 1;
            Ok(CalcReply::Done)
        });
        self.skeleton.register(CalcId::Counter, |calc: &mut Calc, _| {
            Ok(CalcReply::Num(calc.count))
        });
        self.skeleton.register(CalcId::PokeSelf, |calc: &mut Calc, _| {
            calc.skeleton.go_rpc(CalcCmd::Count);
            Ok(CalcReply::Done)
        });
        self.skeleton.register(CalcId::Relay, |calc: &mut Calc, cmd| {
            let CalcCmd::Relay(inner) = cmd else {
                unreachable!()
            };
            let Some(peer) = calc.peer.clone() else {
                return Err(RpcError::handler("no peer"));
            };
            calc.skeleton
                .async_call(&peer, *inner, |calc: &mut Calc, result| {
                    calc.log.push(match result {
                        Ok(reply) => format!("ok {:?}", reply),
                        Err(e) => format!("err {}", e),
                    })
                });
            Ok(CalcReply::Done)
        });
        self.skeleton.register(CalcId::Schedule, |calc: &mut Calc, cmd| {
            let CalcCmd::Schedule(ms) = cmd else {
                unreachable!()
            };
            calc.skeleton
                .after_func(Duration::from_millis(ms), |calc: &mut Calc| {
                    calc.log.push("timer".to_string())
                });
            Ok(CalcReply::Done)
        });
        self.skeleton.register(CalcId::Defer, |calc: &mut Calc, cmd| {
            let CalcCmd::Defer(ms) = cmd else {
                unreachable!()
            };
            calc.skeleton.go(
                move || std::thread::sleep(Duration::from_millis(ms)),
                |calc: &mut Calc| calc.log.push("task".to_string()),
            );
            Ok(CalcReply::Done)
        });
        self.skeleton.register(CalcId::Log, |calc: &mut Calc, _| {
            Ok(CalcReply::Text(calc.log.join(";")))
        });
        self.skeleton.register_variant(
            CalcId::Ask,
            crate::variant!(CalcCmd::Ask(inner) => *inner),
            |calc: &mut Calc, inner| {
                let Some(peer) = calc.peer.clone() else {
                    return Err(RpcError::handler("no peer"));
                };
                // The loop must not block on a peer; the reply comes back as
                // a call to our own server.
                let reply = calc.skeleton.syn_call(&peer, inner);
                let own = calc.skeleton.server();
                tokio::spawn(async move {
                    let line = match reply.await {
                        Ok(reply) => format!("sync ok {:?}", reply),
                        Err(e) => format!("sync err {}", e),
                    };
                    let _ = own.send(CalcCmd::Note(line)).await;
                });
                Ok(CalcReply::Done)
            },
        );
        self.skeleton.register_variant(
            CalcId::Note,
            crate::variant!(CalcCmd::Note(line) => line),
            |calc: &mut Calc, line| {
                calc.log.push(line);
                Ok(CalcReply::Done)
            },
        );

        self.skeleton
            .register_command("sum", "sum integer arguments", |_: &mut Calc, args| {
                let mut total = 0i64;
                for arg in args {
                    total += arg
                        .parse::<i64>()
                        .map_err(|_| RpcError::handler(format!("not a number: {}", arg)))?;
                }
                Ok(total.to_string())
            });
    }
}

struct Running {
    server: ServerHandle<CalcProto>,
    close: oneshot::Sender<()>,
    task: JoinHandle<Calc>,
}

impl Running {
    async fn stop(self) -> Calc {
        let _ = self.close.send(());
        timeout(Duration::from_secs(2), self.task)
            .await
            .expect("loop did not stop")
            .expect("loop panicked")
    }
}

fn start(mut calc: Calc) -> Running {
    init(&mut calc);
    assert_eq!(calc.skeleton.state(), SkeletonState::Initialized);
    let server = calc.skeleton.server();
    let (close, rx) = oneshot::channel();
    Running {
        server,
        close,
        task: tokio::spawn(calc.run(rx)),
    }
}

async fn wait_for_log(server: &ServerHandle<CalcProto>, needle: &str) -> String {
    timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(CalcReply::Text(log)) = server.call(CalcCmd::Log).await {
                if log.contains(needle) {
                    return log;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("log never contained {:?}", needle))
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_loop_serves_calls_and_survives_panics() {
    let running = start(Calc::new(None));

    assert_eq!(
        running.server.call(CalcCmd::Add(2, 3)).await,
        Ok(CalcReply::Num(5))
    );

    let err = running.server.call(CalcCmd::Boom).await.unwrap_err();
    assert!(err.to_string().contains("boom"));

    assert_eq!(
        running.server.call(CalcCmd::Add(1, 1)).await,
        Ok(CalcReply::Num(2))
    );

    let calc = running.stop().await;
    assert_eq!(calc.skeleton.state(), SkeletonState::Closed);
}

#[tokio::test]
async fn test_async_call_between_modules() {
    let callee = start(Calc::new(None));
    let caller = start(Calc::new(Some(callee.server.clone())));

    caller
        .server
        .call(CalcCmd::Relay(Box::new(CalcCmd::Add(2, 3))))
        .await
        .unwrap();
    wait_for_log(&caller.server, "ok Num(5)").await;

    // A panic in the callee reaches the caller's callback as an error.
    caller
        .server
        .call(CalcCmd::Relay(Box::new(CalcCmd::Boom)))
        .await
        .unwrap();
    let log = wait_for_log(&caller.server, "err").await;
    assert!(log.contains("err boom"));

    let caller = caller.stop().await;
    assert_eq!(caller.skeleton.pending_async_calls(), 0);
    callee.stop().await;
}

#[tokio::test]
async fn test_syn_call_between_modules() {
    let callee = start(Calc::new(None));
    let caller = start(Calc::new(Some(callee.server.clone())));

    caller
        .server
        .call(CalcCmd::Ask(Box::new(CalcCmd::Add(20, 22))))
        .await
        .unwrap();
    wait_for_log(&caller.server, "sync ok Num(42)").await;

    caller
        .server
        .call(CalcCmd::Ask(Box::new(CalcCmd::Boom)))
        .await
        .unwrap();
    let log = wait_for_log(&caller.server, "sync err").await;
    assert!(log.contains("sync err boom"));

    // A stopped peer answers with a closed-server error.
    callee.stop().await;
    caller
        .server
        .call(CalcCmd::Ask(Box::new(CalcCmd::Add(1, 1))))
        .await
        .unwrap();
    wait_for_log(&caller.server, "sync err server closed").await;

    caller.stop().await;
}

#[tokio::test]
async fn test_go_rpc_reaches_own_server() {
    let running = start(Calc::new(None));

    running.server.call(CalcCmd::PokeSelf).await.unwrap();
    running.server.call(CalcCmd::PokeSelf).await.unwrap();

    timeout(Duration::from_secs(2), async {
        while running.server.call(CalcCmd::Counter).await != Ok(CalcReply::Num(2)) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("self calls never ran");

    running.stop().await;
}

#[tokio::test]
async fn test_timers_and_tasks_complete_on_loop() {
    let running = start(Calc::new(None));

    running.server.call(CalcCmd::Schedule(10)).await.unwrap();
    running.server.call(CalcCmd::Defer(10)).await.unwrap();

    wait_for_log(&running.server, "timer").await;
    wait_for_log(&running.server, "task").await;

    running.stop().await;
}

#[tokio::test]
async fn test_close_runs_outstanding_completions() {
    let running = start(Calc::new(None));

    running.server.call(CalcCmd::Defer(50)).await.unwrap();
    let calc = running.stop().await;

    assert_eq!(calc.log, vec!["task".to_string()]);
    assert!(calc.skeleton.executor_idle());
}

#[tokio::test]
async fn test_closed_module_refuses_calls() {
    let running = start(Calc::new(None));
    let server = running.server.clone();
    running.stop().await;

    assert_eq!(
        server.call(CalcCmd::Add(1, 2)).await,
        Err(RpcError::ServerClosed)
    );
}

#[tokio::test]
async fn test_console_commands() {
    let mut calc = Calc::new(None);
    calc.on_init();
    assert_eq!(
        calc.skeleton.command_help(),
        &[("sum".to_string(), "sum integer arguments".to_string())]
    );

    let commands = calc.skeleton.commands();
    let (close, rx) = oneshot::channel();
    let task = tokio::spawn(calc.run(rx));

    let reply = commands
        .call(ConsoleCommand::new("sum", vec!["1".into(), "2".into(), "39".into()]))
        .await;
    assert_eq!(reply, Ok("42".to_string()));

    let err = commands
        .call(ConsoleCommand::new("sum", vec!["x".into()]))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "not a number: x");

    assert!(matches!(
        commands.call(ConsoleCommand::new("nope", vec![])).await,
        Err(RpcError::NotRegistered(_))
    ));

    let _ = close.send(());
    task.await.unwrap();
}

#[test]
#[should_panic(expected = "after the module loop started")]
fn test_register_after_start_panics() {
    let mut calc = Calc::new(None);
    calc.skeleton.start();
    calc.skeleton
        .register(CalcId::Add, |_: &mut Calc, _| Ok(CalcReply::Done));
}

#[test]
fn test_new_skeleton_clamps_config() {
    let config = ModuleConfig {
        rpc_queue_len: 0,
        task_queue_len: -1,
        ..ModuleConfig::default()
    };
    let skeleton = Skeleton::<Calc>::new(&config);

    assert_eq!(skeleton.state(), SkeletonState::Constructed);
    assert_eq!(skeleton.settings().rpc_queue_len, 1);
    assert_eq!(skeleton.settings().task_queue_len, 1);
}
