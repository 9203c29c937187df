//! Subcommands of the `pykids` binary.

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use pykids_core::api::cached_client::{Fetch, Recorded};
use pykids_core::api::types::LessonProgress;
use pykids_core::offline::SyncOutcome;
use pykids_core::Core;

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Show a learner's profile
  Profile { user: String },

  /// Show a learner's lesson progress
  Progress { user: String },

  /// Show a learner's analytics
  Analytics { user: String },

  /// Record a lesson result; sent on exit, or queued offline
  Complete {
    user: String,
    module: String,
    topic: String,
    #[arg(long)]
    score: Option<u32>,
    /// Record the attempt without marking the lesson completed
    #[arg(long)]
    incomplete: bool,
  },

  /// Change a learner's avatar
  Avatar { user: String, avatar: String },

  /// Replay the offline queue now
  Sync,

  /// Show connectivity and queue sizes
  Status,

  /// Show the error log, newest first
  Errors {
    #[arg(short = 'n', long, default_value_t = 10)]
    limit: usize,
    /// Empty the log instead of printing it
    #[arg(long)]
    clear: bool,
  },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn show<T: Serialize>(fetch: Fetch<T>) -> Result<()> {
  match fetch {
    Fetch::Ready(result) => {
      eprintln!("source: {:?}", result.source);
      print_json(&result.data)
    }
    Fetch::Cancelled => Err(eyre!("Read was cancelled")),
    Fetch::Failed(record) => Err(eyre!(
      "{} failure ({}): {}",
      record.kind,
      record.severity,
      record.message
    )),
  }
}

pub async fn run(core: &Core, command: Command) -> Result<()> {
  let client = core.client();
  let live = CancellationToken::new();

  match command {
    Command::Profile { user } => show(client.profile(&user, &live).await),
    Command::Progress { user } => show(client.progress(&user, &live).await),
    Command::Analytics { user } => show(client.analytics(&user, &live).await),
    Command::Complete {
      user,
      module,
      topic,
      score,
      incomplete,
    } => {
      let mut update = LessonProgress::new(module, topic, !incomplete);
      if let Some(score) = score {
        update = update.with_score(score);
      }
      match client.record_progress(&user, update)? {
        Recorded::Batched => println!("Queued for {}", user),
        Recorded::Offline(id) => println!("Stored offline as {}", id),
      }
      Ok(())
    }
    Command::Avatar { user, avatar } => match client.update_avatar(&user, &avatar).await {
      Ok(profile) => print_json(&profile),
      Err(record) => Err(eyre!("{} failure: {}", record.kind, record.message)),
    },
    Command::Sync => {
      let synchronizer = core
        .synchronizer()
        .ok_or_else(|| eyre!("Offline storage is disabled"))?;
      match synchronizer.sync_offline_data().await {
        SyncOutcome::Completed(report) => {
          println!(
            "Replayed {}, failed {}, kept {}",
            report.replayed.len(),
            report.failed.len(),
            report.retained
          );
          for nav in &report.drained_navigation {
            println!("  navigation {} at {}", nav.path, nav.queued_at);
          }
          for action in &report.drained_actions {
            println!("  action {} at {}", action.action_name, action.queued_at);
          }
        }
        SyncOutcome::Offline => println!("Offline, nothing sent"),
        SyncOutcome::AlreadyRunning => println!("A sync is already running"),
      }
      Ok(())
    }
    Command::Status => {
      let online = core.connectivity().is_online();
      println!("connectivity:  {}", if online { "online" } else { "offline" });
      match core.offline() {
        Some(offline) => {
          let queue = offline.snapshot();
          println!(
            "offline queue: {} progress, {} navigation, {} actions",
            queue.progress_updates.len(),
            queue.navigation.len(),
            queue.actions.len()
          );
        }
        None => println!("offline queue: disabled"),
      }
      println!("retry queue:   {}", core.retry().len());
      println!("error log:     {}", core.classifier().log().len());
      Ok(())
    }
    Command::Errors { limit, clear } => {
      if clear {
        core.classifier().clear_log()?;
        println!("Error log cleared");
        return Ok(());
      }
      for record in core.classifier().recent(limit) {
        println!(
          "{} [{}/{}] {}{}",
          record.occurred_at.format("%Y-%m-%d %H:%M:%S"),
          record.kind,
          record.severity,
          record.message,
          if record.retryable {
            format!(" (retries left: {})", record.remaining_attempts())
          } else {
            String::new()
          }
        );
      }
      Ok(())
    }
  }
}
