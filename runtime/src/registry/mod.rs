//! Process-wide table of running modules.
//!
//! Modules register under a unique name, are started on their own task and
//! are looked up by name to obtain a typed handle of their server.

use crate::error::RegistryError;
use crate::recover;
use crate::rpc::ServerHandle;
use crate::skeleton::{self, Module, SkeletonState};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use module_kit_protocol::Protocol;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;


/// Names containing this are reserved for remote modules.
pub const REMOTE_DELIMITER: char = ':';

/// Type-erased teardown of a module handed back by its loop.
trait Teardown: Send {
    fn teardown(&mut self);
}

impl<M: Module> Teardown for M {
    fn teardown(&mut self) {
        self.on_destroy();
        self.skeleton_mut().set_state(SkeletonState::Destroyed);
    }
}

struct ModuleEntry {
    close_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<Box<dyn Teardown>>,
    /// `ServerHandle<M::Protocol>` of the module.
    server: Box<dyn Any + Send + Sync>,
}

/// Registry of running modules.
pub struct Registry {
    modules: DashMap<String, ModuleEntry>,
    order: Mutex<Vec<String>>,
    next_name: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            modules: DashMap::new(),
            order: Mutex::new(Vec::new()),
            next_name: AtomicU64::new(1),
        }
    }

    /// Register and start `module` under `name`. An empty name gets a
    /// generated numeric one. Returns the name used.
    ///
    /// `on_init` runs synchronously on the caller; a panic in it propagates.
    pub fn register<M: Module>(&self, mut module: M, name: &str) -> Result<String, RegistryError> {
        let name = if name.is_empty() {
            self.next_name.fetch_add(1, Ordering::SeqCst).to_string()
        } else {
            name.to_string()
        };
        if name.contains(REMOTE_DELIMITER) {
            return Err(RegistryError::RemoteNotSupported(name));
        }
        if self.modules.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }

        skeleton::init(&mut module);
        let server = module.skeleton().server();

        let vacant = match self.modules.entry(name.clone()) {
            Entry::Occupied(_) => return Err(RegistryError::DuplicateName(name)),
            Entry::Vacant(vacant) => vacant,
        };

        let (close_tx, close_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let module = module.run(close_rx).await;
            Box::new(module) as Box<dyn Teardown>
        });

        vacant.insert(ModuleEntry {
            close_tx: Some(close_tx),
            task,
            server: Box::new(server),
        });
        self.order.lock().push(name.clone());

        tracing::info!(module = %name, "module registered");
        Ok(name)
    }

    /// Typed handle of module `name`'s server.
    pub fn search<P: Protocol>(&self, name: &str) -> Result<ServerHandle<P>, RegistryError> {
        if name.contains(REMOTE_DELIMITER) {
            return Err(RegistryError::RemoteNotSupported(name.to_string()));
        }

        let entry = self
            .modules
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        entry
            .server
            .downcast_ref::<ServerHandle<P>>()
            .cloned()
            .ok_or_else(|| RegistryError::ProtocolMismatch(name.to_string()))
    }

    /// Synchronous call into module `name`.
    pub async fn call<P: Protocol>(
        &self,
        name: &str,
        command: P::Command,
    ) -> Result<P::Reply, RegistryError> {
        let server = self.search::<P>(name)?;
        Ok(server.call(command).await?)
    }

    /// Fire-and-forget call into module `name`.
    pub fn send<P: Protocol>(&self, name: &str, command: P::Command) -> Result<(), RegistryError> {
        let server = self.search::<P>(name)?;
        Ok(server.go(command)?)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.order.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Stop module `name`: signal close, wait for its loop to return, then
    /// run `on_destroy`. A panic in `on_destroy` is logged.
    pub async fn destroy_one(&self, name: &str) -> Result<(), RegistryError> {
        let (_, mut entry) = self
            .modules
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        self.order.lock().retain(|n| n != name);

        if let Some(tx) = entry.close_tx.take() {
            let _ = tx.send(());
        }

        match entry.task.await {
            Ok(mut module) => {
                if let Err(fault) = recover::recover(|| module.teardown()) {
                    fault.log(&format!("module {} on_destroy", name));
                }
            }
            Err(e) => tracing::error!(module = %name, "module loop failed: {}", e),
        }

        tracing::info!(module = %name, "module destroyed");
        Ok(())
    }

    /// Destroy every module, most recently registered first.
    pub async fn destroy(&self) {
        let names: Vec<String> = self.order.lock().iter().rev().cloned().collect();
        for name in names {
            if let Err(e) = self.destroy_one(&name).await {
                tracing::warn!(module = %name, "destroy failed: {}", e);
            }
        }
    }
}
