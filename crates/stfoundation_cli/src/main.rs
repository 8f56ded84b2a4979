//! Maintenance entry point for persistence stacks.
//!
//! # Responsibility
//! - Verify `stfoundation_core` linkage (`ping`).
//! - Run store maintenance for a JSON config: status, sync, reset, purge.
//! - Keep output deterministic for quick local sanity checks.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use stfoundation_core::{ConfigProvider, PersistenceStack, StoreConfig};

/// Store maintenance tools for stfoundation persistence stacks.
#[derive(Parser)]
#[command(name = "stfoundation_cli")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print core linkage and version (default)
    Ping,

    /// Print record counts per entity and mirror state
    Status {
        /// Path to the store config JSON
        config: PathBuf,
    },

    /// Push pending local changes, then pull remote changes
    Sync {
        /// Path to the store config JSON
        config: PathBuf,
    },

    /// Delete every local record of every entity kind
    Reset {
        /// Path to the store config JSON
        config: PathBuf,
    },

    /// Delete remote zones and reset the local store
    Purge {
        /// Path to the store config JSON
        config: PathBuf,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Status { .. } => "status",
            Self::Sync { .. } => "sync",
            Self::Reset { .. } => "reset",
            Self::Purge { .. } => "purge",
        }
    }

    fn config(&self) -> Option<&Path> {
        match self {
            Self::Ping => None,
            Self::Status { config } | Self::Sync { config } | Self::Reset { config } | Self::Purge { config } => {
                Some(config)
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = run(cli.command.unwrap_or(Command::Ping)).await;
    stfoundation_core::flush_logging();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn ping() {
    println!("stfoundation_core ping={}", stfoundation_core::ping());
    println!("stfoundation_core version={}", stfoundation_core::core_version());
}

async fn load_stack(config_path: &Path) -> Result<PersistenceStack, String> {
    let config = StoreConfig::from_file(config_path).map_err(|err| err.to_string())?;
    let log_dir = std::path::absolute(config.group_dir().join("logs")).map_err(|err| err.to_string())?;
    if let Err(err) = stfoundation_core::init_logging(stfoundation_core::default_log_level(), &log_dir) {
        eprintln!("warning: logging disabled: {err}");
    }

    let config: Arc<dyn ConfigProvider> = Arc::new(config);
    Ok(PersistenceStack::load(config).await)
}

async fn run(command: Command) -> Result<(), String> {
    let name = command.name();
    let Some(config) = command.config() else {
        ping();
        return Ok(());
    };
    let stack = load_stack(config).await?;
    log::info!("event=cli_command module=cli status=start command={name}");

    match command {
        Command::Status { .. } => {
            for entity in stack.store().schema().entity_names() {
                let count = stack.store().count(entity).await.map_err(|err| err.to_string())?;
                println!("{entity}={count}");
            }
            println!("mirror_linked={}", stack.mirror().is_linked().await);
            println!("mirror_enabled={}", stack.mirror().is_enabled());
        }
        Command::Sync { .. } => {
            let active = stack.reinitiate().await;
            let pushed = stack.mirror().push_pending().await.map_err(|err| err.to_string())?;
            let pulled = stack.mirror().pull().await.map_err(|err| err.to_string())?;
            println!("mirror_enabled={active} pushed={pushed} pulled={pulled}");
        }
        Command::Reset { .. } => {
            stack.store().reset_all().await.map_err(|err| err.to_string())?;
            println!("reset=ok");
        }
        Command::Purge { .. } => {
            stack.mirror().purge_remote().await.map_err(|err| err.to_string())?;
            println!("purge=ok");
        }
        Command::Ping => {}
    }
    log::info!("event=cli_command module=cli status=ok command={name}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Cli, Command};
    use clap::{CommandFactory, Parser};
    use std::path::Path;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_arguments_means_ping() {
        let cli = Cli::try_parse_from(["stfoundation_cli"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn maintenance_commands_require_a_config() {
        let cli = Cli::try_parse_from(["stfoundation_cli", "sync", "budget.json"]).unwrap();
        let command = cli.command.unwrap();
        assert_eq!(command.name(), "sync");
        assert_eq!(command.config(), Some(Path::new("budget.json")));
        assert!(matches!(command, Command::Sync { .. }));

        assert!(Cli::try_parse_from(["stfoundation_cli", "purge"]).is_err());
        assert!(Cli::try_parse_from(["stfoundation_cli", "compact", "budget.json"]).is_err());
    }
}
