mod builder;
mod cache;
mod config;
mod crm;
mod drivers;
mod error;
mod logging;
mod manager;
mod nested;
mod refresh;
#[cfg(test)]
mod test_support;

use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::cache::JsonFileStorage;
use crate::crm::client::CrmClient;
use crate::crm::notify::WebhookNotifier;
use crate::crm::types::EntityKind;
use crate::manager::DeliveryManager;

#[derive(Parser, Debug)]
#[command(name = "delivery-cache")]
#[command(about = "Caches CRM supplies, shipments and deliveries and serves driver views")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./delivery-cache.yaml or $XDG_CONFIG_HOME/delivery-cache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Rebuild the whole cache from the CRM and save it
  Load,
  /// Merge records modified in the last few minutes
  Refresh {
    #[arg(long, default_value_t = 1)]
    since_minutes: i64,
  },
  /// Print the raw cache and the nested structure
  Get,
  /// Print one delivery with everything related to it
  Delivery {
    id: i64,
    /// Print only the driver contact
    #[arg(long)]
    driver: bool,
  },
  /// Print one driver's deliveries
  Driver {
    id: i64,
    /// Include finished deliveries
    #[arg(long)]
    all: bool,
  },
  /// Print every driver's deliveries via the driver index
  Drivers,
  /// Print deliveries grouped by driver
  Grouped {
    /// Include finished deliveries
    #[arg(long)]
    all: bool,
  },
  /// Find the driver with this phone number
  Phone { number: String },
  /// Move a CRM item to another stage
  MoveStage {
    entity: EntityKind,
    id: i64,
    stage: String,
  },
  /// Re-fetch document download links for cached waybills and powers of attorney
  BackfillDocs,
  /// Refresh periodically until interrupted
  Watch {
    #[arg(long, default_value_t = 60)]
    interval_secs: u64,
  },
}

type Manager = DeliveryManager<CrmClient, WebhookNotifier>;

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  let client = CrmClient::new(&config)?;
  let notifier = WebhookNotifier::new(config.notify.webhook_url.clone());
  let storage = JsonFileStorage::new(config.cache.snapshot_path.clone());
  let manager = DeliveryManager::new(client, notifier, Box::new(storage), &config.crm);

  let force_reload = matches!(args.command, Command::Load);
  manager.initialize(force_reload).await;

  run(&manager, args.command).await
}

async fn run(manager: &Manager, command: Command) -> Result<()> {
  match command {
    Command::Load => print_json(&json!({"status": "loaded"})),
    Command::Refresh { since_minutes } => {
      let since = Utc::now() - ChronoDuration::minutes(since_minutes);
      let summary = manager.refresh(since).await;
      print_json(&summary)
    }
    Command::Get => print_json(&json!({
      "cache": manager.cache_snapshot().await,
      "structure": manager.get_nested_structure().await,
    })),
    Command::Delivery { id, driver } => {
      let detail = manager.get_delivery_detail(id).await?;
      if driver {
        print_json(&json!({"driver": detail.driver}))
      } else {
        print_json(&detail)
      }
    }
    Command::Driver { id, all } => print_json(&manager.get_deliveries_by_driver(Some(id), !all).await),
    Command::Drivers => print_json(&manager.drivers_deliveries().await),
    Command::Grouped { all } => print_json(&manager.get_deliveries_by_driver(None, !all).await),
    Command::Phone { number } => {
      let driver_id = manager.find_driver_by_phone(&number).await;
      print_json(&json!({"driver_id": driver_id}))
    }
    Command::MoveStage { entity, id, stage } => {
      if !manager.move_to_stage(entity, id, &stage).await {
        return Err(eyre!("Failed to move {} {} to stage {}", entity, id, stage));
      }
      print_json(&json!({"status": "moved"}))
    }
    Command::BackfillDocs => {
      manager.backfill_document_urls().await;
      print_json(&json!({"status": "backfilled"}))
    }
    Command::Watch { interval_secs } => watch(manager, interval_secs).await,
  }
}

/// Refresh every `interval_secs`, each pass covering everything modified
/// since the previous pass started.
async fn watch(manager: &Manager, interval_secs: u64) -> Result<()> {
  let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  // The first tick completes immediately
  ticker.tick().await;

  let mut last_update = Utc::now();
  info!("Watching for changes every {}s", interval_secs);

  loop {
    tokio::select! {
      _ = ticker.tick() => {}
      _ = tokio::signal::ctrl_c() => {
        info!("Interrupted, stopping");
        return Ok(());
      }
    }

    let started = Utc::now();
    let summary = manager.refresh(last_update).await;
    last_update = started;

    let index = manager.build_driver_index().await;
    let resolved = manager.resolve_driver_index(&index).await;
    info!(
      "Refresh done ({} merged, {} notified); driver index covers {} drivers, {} deliveries",
      summary.merged,
      summary.notified,
      index.len(),
      resolved.values().map(Vec::len).sum::<usize>()
    );
  }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let text = serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to serialize output: {}", e))?;
  println!("{}", text);
  Ok(())
}
