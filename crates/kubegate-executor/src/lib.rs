//! Command execution for the KubeGate agent.
//!
//! Provides:
//! - Command building utilities
//! - Base64 substitution of `-f`/`--filename` arguments
//! - `KubectlExecutor` - Run kubectl with a timeout
//! - `Agent` - Drain the command queue and reply with the output

pub mod agent;
pub mod command;
pub mod filearg;
pub mod kubectl;

pub use agent::Agent;
pub use command::{CommandBuildError, CommandBuilder, CommandParts, resolve_executable_path};
pub use filearg::{DecodedArgs, FileArgError, decode_file_args, encode_file_args};
pub use kubectl::{CommandExecutor, DEFAULT_KUBECTL_TIMEOUT, ExecError, KubectlExecutor};
