//! Server and per-module configuration, loaded from JSON.

use crate::error::ConfigError;
use crate::recover;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Queue lengths and timeouts of one module. Every field is optional in the
/// JSON form; values `<= 0` are clamped to 1 by [`ModuleConfig::init`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    pub task_queue_len: i64,
    pub timer_queue_len: i64,
    pub async_return_queue_len: i64,
    pub rpc_queue_len: i64,
    /// How long a server waits for room in a caller's return queue.
    pub rpc_return_timeout_ms: i64,
    /// How long an async call waits for room in a full server queue.
    pub async_call_timeout_ms: i64,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            task_queue_len: 1024,
            timer_queue_len: 1024,
            async_return_queue_len: 1024,
            rpc_queue_len: 1024,
            rpc_return_timeout_ms: 100,
            async_call_timeout_ms: 10,
        }
    }
}

/// Validated [`ModuleConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleSettings {
    pub task_queue_len: usize,
    pub timer_queue_len: usize,
    pub async_return_queue_len: usize,
    pub rpc_queue_len: usize,
    pub rpc_return_timeout: Duration,
    pub async_call_timeout: Duration,
}

impl ModuleConfig {
    /// Clamp non-positive queue lengths to 1 and convert to settings.
    /// Negative timeouts become zero.
    pub fn init(&self) -> ModuleSettings {
        let len = |v: i64| v.max(1) as usize;
        let ms = |v: i64| Duration::from_millis(v.max(0) as u64);

        ModuleSettings {
            task_queue_len: len(self.task_queue_len),
            timer_queue_len: len(self.timer_queue_len),
            async_return_queue_len: len(self.async_return_queue_len),
            rpc_queue_len: len(self.rpc_queue_len),
            rpc_return_timeout: ms(self.rpc_return_timeout_ms),
            async_call_timeout: ms(self.async_call_timeout_ms),
        }
    }
}

/// Process-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `debug`, `release`, `error` or `fatal`.
    pub log_level: String,
    /// Byte budget for stack traces of recovered panics; 0 disables them.
    pub stack_buf_len: usize,
    pub modules: HashMap<String, ModuleConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "debug".to_string(),
            stack_buf_len: recover::DEFAULT_STACK_BUF_LEN,
            modules: HashMap::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Configuration of module `name`, or the defaults.
    pub fn module(&self, name: &str) -> ModuleConfig {
        self.modules.get(name).cloned().unwrap_or_default()
    }

    /// Apply process-wide settings.
    pub fn apply(&self) {
        recover::set_stack_buf_len(self.stack_buf_len);
    }
}
