//! KubeGate: run kubectl against clusters reachable only through a
//! message broker.
//!
//! Provides:
//! - `Config` / `AgentConfig` - Client contexts and agent settings
//! - `Client` - Send a command and wait for the agent's output
//! - `run_agent` - Serve commands on the cluster side
//! - Logging setup

pub mod agent;
pub mod client;
pub mod config;
pub mod logging;

pub use agent::run_agent;
pub use client::{Client, ClientError};
pub use config::{AgentConfig, Config, ConfigError, Context};
pub use logging::{LogConfig, init_logging};
