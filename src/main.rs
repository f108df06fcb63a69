use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use treesync::config::Config;
use treesync::control::{send_command, CommandRequest};
use treesync::daemon::{run_daemon_with_shutdown, DaemonOptions};

#[derive(Parser, Debug)]
#[command(name = "treesync", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sync daemon
    Daemon {
        /// Log file (defaults to logs/treesync.log next to the config)
        #[arg(long = "log-path")]
        log_path: Option<PathBuf>,
    },
    /// Send a command to a running daemon: status, sync_now, files, stop
    Ctl {
        command: String,
        /// JSON arguments, e.g. '{"prefix":"docs/"}' for files
        #[arg(long = "args")]
        args: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    match cli.command {
        Commands::Daemon { log_path } => {
            let shutdown = Arc::new(tokio::sync::Notify::new());
            let on_signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_signal.notify_one();
                }
            });
            run_daemon_with_shutdown(cfg, DaemonOptions { log_path }, shutdown).await?;
        }
        Commands::Ctl { command, args } => {
            let args = match args {
                Some(raw) => serde_json::from_str(&raw).context("parse --args json")?,
                None => serde_json::Value::Null,
            };
            let request = CommandRequest { command, args };
            let response = send_command(&cfg.socket_file(), &request, cfg.socket_timeout()).await?;
            if response.error {
                anyhow::bail!("{}", response.message);
            }
            println!("{}", response.message);
        }
    }

    Ok(())
}
