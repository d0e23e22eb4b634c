//! Client contexts and agent configuration.
//!
//! Both files live under `~/.kubegate/` and are YAML. Environment
//! overrides are read through a lookup function so callers (and tests) can
//! supply something other than the process environment.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Client configuration file name.
pub const CONFIG_FILE: &str = "config.yaml";
/// Agent configuration file name.
pub const AGENT_CONFIG_FILE: &str = "agent-config.yaml";
/// Backend used when none is configured.
pub const DEFAULT_BACKEND: &str = "rabbitmq";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] serde_yaml::Error),
    #[error("Context not found: {0}")]
    ContextNotFound(String),
    #[error("No current context set, run `kubegate config use-context <name>`")]
    NoCurrentContext,
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
    #[error("Home directory not found")]
    NoHomeDir,
}

/// `~/.kubegate`.
///
/// # Errors
/// Returns error if the home directory cannot be determined.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(".kubegate"))
        .ok_or(ConfigError::NoHomeDir)
}

/// Process environment lookup, empty values treated as unset.
#[must_use]
pub fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn default_backend() -> String {
    DEFAULT_BACKEND.to_string()
}

/// A named broker endpoint a client can talk to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Context {
    pub name: String,
    /// Broker URL. For SQS, an optional endpoint override.
    #[serde(default)]
    pub rabbitmq_url: String,
    #[serde(default)]
    pub command_queue: String,
    /// Prefix of the reply queues created for this context.
    #[serde(default)]
    pub reply_queue: String,
    #[serde(default = "default_backend")]
    pub backend: String,
}

/// Client configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub current_context: String,
    #[serde(default)]
    pub contexts: Vec<Context>,
}

impl Config {
    /// `~/.kubegate/config.yaml`.
    ///
    /// # Errors
    /// Returns error if the home directory cannot be determined.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(config_dir()?.join(CONFIG_FILE))
    }

    /// Read the file as stored. A missing file is an empty configuration.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(data) if data.trim().is_empty() => Ok(Self::default()),
            Ok(data) => serde_yaml::from_str(&data).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Read the file and apply environment overrides.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load<F>(path: &Path, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::load_file(path)?;
        config.apply_overrides(lookup);
        Ok(config)
    }

    /// Apply `CURRENT_CONTEXT`, then `RABBITMQ_URL`, `COMMAND_QUEUE`,
    /// `REPLY_QUEUE` and `BACKEND` to the selected context.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(current) = lookup("CURRENT_CONTEXT") {
            self.current_context = current;
        }
        let current = self.current_context.clone();
        let Some(context) = self.contexts.iter_mut().find(|c| c.name == current) else {
            return;
        };
        if let Some(url) = lookup("RABBITMQ_URL") {
            context.rabbitmq_url = url;
        }
        if let Some(queue) = lookup("COMMAND_QUEUE") {
            context.command_queue = queue;
        }
        if let Some(queue) = lookup("REPLY_QUEUE") {
            context.reply_queue = queue;
        }
        if let Some(backend) = lookup("BACKEND") {
            context.backend = backend;
        }
    }

    /// Write the configuration, replacing the file atomically.
    ///
    /// # Errors
    /// Returns error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let data = serde_yaml::to_string(self)?;
        write_atomic(path, data.as_bytes())
    }

    /// Look up a context by name.
    ///
    /// # Errors
    /// Returns error if no context has that name.
    pub fn get_context(&self, name: &str) -> Result<&Context, ConfigError> {
        self.contexts
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| ConfigError::ContextNotFound(name.to_string()))
    }

    /// The selected context.
    ///
    /// # Errors
    /// Returns error if none is selected or the selected one does not exist.
    pub fn current(&self) -> Result<&Context, ConfigError> {
        if self.current_context.is_empty() {
            return Err(ConfigError::NoCurrentContext);
        }
        self.get_context(&self.current_context)
    }

    /// Add a context or replace the one with the same name.
    pub fn set_context(&mut self, context: Context) {
        match self.contexts.iter_mut().find(|c| c.name == context.name) {
            Some(existing) => *existing = context,
            None => self.contexts.push(context),
        }
    }

    /// Select a context.
    ///
    /// # Errors
    /// Returns error if no context has that name.
    pub fn use_context(&mut self, name: &str) -> Result<(), ConfigError> {
        self.get_context(name)?;
        self.current_context = name.to_string();
        Ok(())
    }

    /// Remove a context, clearing the selection if it was selected.
    ///
    /// # Errors
    /// Returns error if no context has that name.
    pub fn delete_context(&mut self, name: &str) -> Result<(), ConfigError> {
        let index = self
            .contexts
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| ConfigError::ContextNotFound(name.to_string()))?;
        self.contexts.remove(index);
        if self.current_context == name {
            self.current_context.clear();
        }
        Ok(())
    }
}

/// Agent configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AgentConfig {
    #[serde(default)]
    pub rabbitmq_url: String,
    #[serde(default)]
    pub command_queue: String,
    #[serde(default = "default_backend")]
    pub backend: String,
}

impl AgentConfig {
    /// `~/.kubegate/agent-config.yaml`.
    ///
    /// # Errors
    /// Returns error if the home directory cannot be determined.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(config_dir()?.join(AGENT_CONFIG_FILE))
    }

    /// Resolve the agent configuration.
    ///
    /// `KUBEGATE_RABBITMQ_URL` and `KUBEGATE_RABBITMQ_QUEUE`, when both set,
    /// replace the file entirely. `KUBEGATE_BACKEND` overrides the backend
    /// either way.
    ///
    /// # Errors
    /// Returns error if the file is needed but unreadable, or if no command
    /// queue is configured.
    pub fn load<F>(path: &Path, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match (lookup("KUBEGATE_RABBITMQ_URL"), lookup("KUBEGATE_RABBITMQ_QUEUE")) {
            (Some(rabbitmq_url), Some(command_queue)) => Self {
                rabbitmq_url,
                command_queue,
                backend: default_backend(),
            },
            _ => {
                let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                serde_yaml::from_str(&data).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
        };

        if let Some(backend) = lookup("KUBEGATE_BACKEND") {
            config.backend = backend;
        }
        if config.backend.is_empty() {
            config.backend = default_backend();
        }
        if config.command_queue.is_empty() {
            return Err(ConfigError::Missing("command-queue"));
        }
        Ok(config)
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
    }
    let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
    temp_name.push(".tmp");
    let temp = path.with_file_name(temp_name);
    std::fs::write(&temp, data).map_err(io_err)?;
    std::fs::rename(&temp, path).map_err(io_err)
}
