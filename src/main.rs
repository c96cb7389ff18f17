mod actions;
mod api;
mod app;
mod cache;
mod config;
mod event;
mod host;
mod install;
mod logging;
mod notify;
mod reachability;
mod sync;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::api::StorefrontClient;
use crate::app::{App, Components};
use crate::cache::{CacheManager, CacheStore, NamespaceResolver, NoopStore, SqliteStore};
use crate::config::{Config, SyncDriver};
use crate::event::{Event, EventHandler};
use crate::host::{BridgeViews, HostOutput, HostPeriodicSync};
use crate::sync::{IntervalSyncHost, PeriodicSyncHost, SyncScheduler};

/// Granularity of banner and toast expiry checks
const TICK_RATE: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "storefront-offline")]
#[command(about = "Offline-resilience daemon for a retail web client, driven over stdio")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/storefront-offline/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Path to the cache database
  #[arg(short, long)]
  database: Option<PathBuf>,

  /// Storefront origin, e.g. https://shop.example.com
  #[arg(short, long)]
  origin: Option<String>,

  /// Directory for the log file
  #[arg(long)]
  log_dir: Option<PathBuf>,

  /// Start in the offline state
  #[arg(long)]
  offline: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Command line overrides
  if let Some(origin) = args.origin {
    config.origin = origin;
  }
  if let Some(database) = args.database {
    config.cache.database = Some(database);
  }
  if args.offline {
    config.reachability.initial_online = false;
  }

  let _log_guard = logging::init(&config.log, args.log_dir.as_deref())?;
  info!(origin = %config.origin, "Starting storefront-offline");

  let events = EventHandler::new(TICK_RATE);
  let (out, commands) = HostOutput::channel();
  let writer = tokio::spawn(host::write_commands(commands, tokio::io::stdout()));

  let components = build_components(&config, &events, &out)?;
  let mut app = App::new(config, components, out);
  app.run(events).await?;

  // Dropping the app closes the command stream so the writer can finish
  drop(app);
  writer
    .await
    .map_err(|e| color_eyre::eyre::eyre!("Host writer failed: {}", e))??;

  Ok(())
}

/// Construct every component with its collaborators, honoring the host's
/// capabilities.
fn build_components(config: &Config, events: &EventHandler, out: &HostOutput) -> Result<Components> {
  let capabilities = &config.capabilities;
  let client = StorefrontClient::new(&config.origin)?;

  let store: Arc<dyn CacheStore> = if capabilities.cache_storage {
    Arc::new(SqliteStore::open_at(config.cache.database.as_deref())?)
  } else {
    info!("Cache storage unavailable, caching disabled");
    Arc::new(NoopStore)
  };
  let resolver = NamespaceResolver::new(&config.origin, &config.cache)?;
  let cache = CacheManager::new(
    store,
    Arc::new(client.clone()),
    resolver,
    config.cache.proximity_px,
    capabilities.clone(),
  )?;

  let periodic: Option<Arc<dyn PeriodicSyncHost>> = if capabilities.periodic_sync {
    let host: Arc<dyn PeriodicSyncHost> = match config.sync.driver {
      SyncDriver::Internal => {
        let tx = events.sender();
        Arc::new(IntervalSyncHost::new(move |name: &str| {
          let _ = tx.send(Event::Wake(name.to_string()));
        }))
      }
      SyncDriver::Host => Arc::new(HostPeriodicSync::new(out.clone())),
    };
    Some(host)
  } else {
    None
  };
  let scheduler = SyncScheduler::new(periodic, api::sync_handlers(&client));

  let views = BridgeViews::new(out.clone());
  let notifications = notify::NotificationRouter::new(
    &config.origin,
    config.notifications.clone(),
    Arc::new(views.clone()),
  )?;

  let actions = actions::QuickActionRunner::new(Arc::new(client), &config.origin, capabilities.share)?;

  Ok(Components {
    reachability: reachability::ReachabilityMonitor::new(&config.reachability),
    cache,
    scheduler,
    notifications,
    install: install::InstallCoordinator::new(),
    actions,
    views,
  })
}
