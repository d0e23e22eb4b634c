use std::{sync::Arc, time::Duration};

use anyhow::{Context as _, Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use kubegate::{
    AgentConfig, Client, Config, Context, LogConfig, config::env_lookup, init_logging, run_agent,
};
use kubegate_core::CancellationToken;
use kubegate_executor::{CommandBuilder, KubectlExecutor};
use kubegate_session::FileSessionStore;
use kubegate_transport::BackendRegistry;

#[derive(Parser, Debug)]
#[command(name = "kubegate")]
#[command(version)]
#[command(about = "Run kubectl against private clusters through a message broker.")]
#[command(
    long_about = "Run kubectl against private clusters through a message broker.\n\n\
    Any unrecognised subcommand is sent to the agent as a kubectl command, \
    so `kubegate get pods` is the same as `kubegate run get pods`."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send a kubectl command to the agent of the current context
    Run {
        /// Seconds to wait for the agent's response
        #[arg(long, default_value_t = 30)]
        timeout: u64,

        /// kubectl arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Start the agent inside the cluster
    Agent {
        /// Seconds a single kubectl run may take
        #[arg(long, default_value_t = 300)]
        kubectl_timeout: u64,

        /// kubectl executable (and any fixed leading arguments)
        #[arg(long, default_value = "kubectl")]
        kubectl: String,
    },

    /// Delete the cached reply queue and its session record
    Cleanup,

    /// Manage client contexts
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },

    #[command(external_subcommand)]
    Kubectl(Vec<String>),
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Add or update a context and switch to it
    SetContext {
        /// Name of the context
        #[arg(short, long)]
        name: String,

        /// Broker URL (AMQP URI, or SQS endpoint override)
        #[arg(short = 'u', long = "queue-url", alias = "rabbitmq-url")]
        url: String,

        /// Queue the agent listens on
        #[arg(short, long)]
        command_queue: String,

        /// Prefix for the reply queues of this context
        #[arg(short, long, default_value = "reply-queue")]
        reply_queue: String,

        /// Backend type (rabbitmq, sqs, pubsub, azure)
        #[arg(short, long, default_value = "rabbitmq")]
        backend: String,
    },

    /// List all contexts
    GetContexts,

    /// Switch to a context
    UseContext {
        /// Context name
        name: String,
    },

    /// Delete a context
    DeleteContext {
        /// Context name
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&LogConfig::from_env()) {
        eprintln!("Warning: failed to initialize logging: {e}");
    }

    match cli.command {
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
        Some(Commands::Run { timeout, args }) => run(&args, Duration::from_secs(timeout)).await,
        Some(Commands::Kubectl(args)) => run(&args, kubegate_core::DEFAULT_RESPONSE_TIMEOUT).await,
        Some(Commands::Agent {
            kubectl_timeout,
            kubectl,
        }) => agent(&kubectl, Duration::from_secs(kubectl_timeout)).await,
        Some(Commands::Cleanup) => cleanup().await,
        Some(Commands::Config { config_command }) => handle_config_command(config_command),
    }
}

fn session_store() -> Result<FileSessionStore> {
    FileSessionStore::default_path()
        .map(FileSessionStore::new)
        .context("Home directory not found")
}

async fn run(args: &[String], timeout: Duration) -> Result<()> {
    let config = Config::load(&Config::default_path()?, env_lookup).context("Failed to load config")?;
    let context = config.current().context("Failed to get current context")?;
    let store = session_store()?;

    let registry = BackendRegistry::with_defaults();
    let client = Client::connect(&registry, context, store)
        .await
        .with_context(|| format!("Failed to connect using context {}", context.name))?
        .with_timeout(timeout);

    let result = client.run(args).await;
    if let Err(e) = client.close().await {
        tracing::warn!("Failed to close connection: {e}");
    }
    let output = result.context("Failed to get response from agent")?;
    print!("{output}");
    Ok(())
}

async fn cleanup() -> Result<()> {
    let config = Config::load(&Config::default_path()?, env_lookup).context("Failed to load config")?;
    let context = config.current().context("Failed to get current context")?;

    let registry = BackendRegistry::with_defaults();
    let client = Client::connect(&registry, context, session_store()?)
        .await
        .with_context(|| format!("Failed to connect using context {}", context.name))?;
    let result = client.sessions().cleanup().await;
    if let Err(e) = client.close().await {
        tracing::warn!("Failed to close connection: {e}");
    }
    result.context("Failed to clean up session")?;
    println!("Session cleaned up");
    Ok(())
}

async fn agent(kubectl: &str, kubectl_timeout: Duration) -> Result<()> {
    let config = AgentConfig::load(&AgentConfig::default_path()?, env_lookup)
        .context("Failed to load agent config")?;
    println!("Starting KubeGate agent on queue {}...", config.command_queue);

    let executor =
        Arc::new(KubectlExecutor::new(CommandBuilder::new(kubectl)).with_timeout(kubectl_timeout));
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested");
                cancel.cancel();
            }
        }
    });

    run_agent(&BackendRegistry::with_defaults(), &config, executor, cancel)
        .await
        .context("Agent encountered an error")
}

fn handle_config_command(command: ConfigCommands) -> Result<()> {
    let path = Config::default_path()?;
    // Env overrides are not applied here so they never end up in the file.
    let mut config = Config::load_file(&path).context("Failed to load config")?;

    match command {
        ConfigCommands::SetContext {
            name,
            url,
            command_queue,
            reply_queue,
            backend,
        } => {
            if name.trim().is_empty() || command_queue.trim().is_empty() {
                bail!("--name and --command-queue must not be empty");
            }
            config.set_context(Context {
                name: name.clone(),
                rabbitmq_url: url,
                command_queue,
                reply_queue,
                backend,
            });
            config.use_context(&name)?;
            config.save(&path).context("Failed to save config")?;
            println!("Context set and switched to: {name}");
        }
        ConfigCommands::GetContexts => {
            println!("Available contexts:");
            for ctx in &config.contexts {
                println!(
                    "- {} (BrokerURL: {}, ReplyQueue: {}, CommandQueue: {}, Backend: {})",
                    ctx.name, ctx.rabbitmq_url, ctx.reply_queue, ctx.command_queue, ctx.backend
                );
            }
            println!("Current context: {}", config.current_context);
        }
        ConfigCommands::UseContext { name } => {
            config.use_context(&name)?;
            config.save(&path).context("Failed to save config")?;
            println!("Switched to context: {name}");
        }
        ConfigCommands::DeleteContext { name } => {
            config.delete_context(&name)?;
            config.save(&path).context("Failed to save config")?;
            println!("Context deleted successfully: {name}");
        }
    }
    Ok(())
}
