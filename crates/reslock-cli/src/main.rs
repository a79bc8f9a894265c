//! Reslock CLI - per-resource read/write locking

use clap::{Parser, Subcommand};
use reslock_core::config::Config;
use reslock_core::locking::{LockMode, LockingStack, ResourceIdentifier};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "reslock")]
#[command(author, version, about = "Per-resource read/write locking", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Remove dangling locks of the configured backend
    Sweep,

    /// List lock artifacts currently present
    List,

    /// Acquire a lock, hold it, then release it
    Hold {
        /// Resource identifier
        identifier: String,
        /// Take a shared (read) lock instead of an exclusive one
        #[arg(long)]
        read: bool,
        /// Seconds to hold the lock
        #[arg(long, default_value_t = 5)]
        secs: u64,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("reslock=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => Config::config_path()?,
    };

    let result = match cli.command {
        Commands::Sweep => cmd_sweep(&config_path, cli.quiet).await,
        Commands::List => cmd_list(&config_path, cli.quiet).await,
        Commands::Hold {
            identifier,
            read,
            secs,
        } => cmd_hold(&config_path, &identifier, read, secs, cli.quiet).await,
        Commands::Config { action } => cmd_config(&config_path, action, cli.quiet),
    };

    if let Err(e) = &result
        && let Some(error) = e.downcast_ref::<reslock_core::Error>()
    {
        eprintln!("Error [{}]: {}", error.code(), error);
        if let Some(suggestion) = error.suggestion() {
            eprintln!("Hint: {}", suggestion);
        }
        std::process::exit(1);
    }
    result
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn build_stack(config_path: &Path) -> anyhow::Result<LockingStack> {
    let config = Config::load_from(config_path)?;
    let stack = LockingStack::from_config(&config.locker)
        .await
        .map_err(reslock_core::Error::from)?;
    Ok(stack)
}

async fn cmd_sweep(config_path: &Path, quiet: bool) -> anyhow::Result<()> {
    let stack = build_stack(config_path).await?;
    let report = stack
        .sweep()
        .run()
        .await
        .map_err(reslock_core::Error::from)?;

    if !quiet {
        println!("Backend: {}", stack.locker().backend());
        println!("{}", report.summary());
    }
    Ok(())
}

async fn cmd_list(config_path: &Path, quiet: bool) -> anyhow::Result<()> {
    let stack = build_stack(config_path).await?;
    let artifacts = stack
        .locker()
        .artifacts()
        .await
        .map_err(reslock_core::Error::from)?;

    if artifacts.is_empty() {
        if !quiet {
            println!("No locks held.");
        }
        return Ok(());
    }

    for artifact in artifacts {
        println!("{}", artifact);
    }
    Ok(())
}

async fn cmd_hold(
    config_path: &Path,
    identifier: &str,
    read: bool,
    secs: u64,
    quiet: bool,
) -> anyhow::Result<()> {
    let stack = build_stack(config_path).await?;
    let identifier = ResourceIdentifier::new(identifier).map_err(reslock_core::Error::from)?;
    let mode = if read { LockMode::Read } else { LockMode::Write };

    stack
        .coordinator()
        .with_lock(&identifier, mode, || async {
            if !quiet {
                println!("Holding {} lock on {} for {}s", mode, identifier, secs);
            }
            info!(resource = %identifier, mode = %mode, secs, "Holding lock");
            tokio::time::sleep(Duration::from_secs(secs)).await;
            Ok::<_, reslock_core::Error>(())
        })
        .await?;

    if !quiet {
        println!("Released {} lock on {}", mode, identifier);
    }
    Ok(())
}

fn cmd_config(config_path: &Path, action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load_from(config_path)?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load_from(config_path)?;
            config.set(&key, &value)?;
            config.save_to(config_path)?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load_from(config_path)?;
            let items = config.list()?;
            for (key, value) in items {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Path => {
            println!("{}", config_path.display());
        }
    }
    Ok(())
}
