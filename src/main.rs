mod commands;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use tracing::warn;

use pykids_core::batch::FlushOutcome;
use pykids_core::{logging, Config, Core};

#[derive(Parser, Debug)]
#[command(name = "pykids")]
#[command(about = "Offline-tolerant client for the PyKIDS learning API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/pykids/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// PyKIDS API base URL
  #[arg(long)]
  api_url: Option<String>,

  /// Start offline: writes go to the offline queue and no health probe runs
  #[arg(long)]
  offline: bool,

  /// Keep state in memory only; nothing is persisted and no log file is written
  #[arg(long)]
  ephemeral: bool,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let log_dir = if args.ephemeral {
    None
  } else {
    logging::default_log_dir()
  };
  let _guard = logging::init(log_dir.as_deref())?;

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Override API URL if specified on command line
  if let Some(url) = args.api_url {
    config.api.url = url;
  }
  if args.offline {
    config.connectivity.probe_interval_secs = 0;
  }

  let core = Core::from_config(config, args.ephemeral)?;
  core.start();
  if args.offline {
    core.connectivity().set_online(false);
  }

  let result = commands::run(&core, args.command).await;

  // Page-unload analogue: nothing batched may be left behind
  for outcome in core.shutdown().await {
    if let FlushOutcome::Failed { batch, error } = outcome {
      warn!(owner_id = %batch.owner_id, count = batch.updates.len(), %error, "Unsent progress");
    }
  }

  result
}
