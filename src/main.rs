use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

use shopsync::config::{self, Config};
use shopsync::logging;
use shopsync::{
  DataService, HttpDataService, Mutation, SyncEngineContext, SyncEvent, SyncState,
};

#[derive(Parser, Debug)]
#[command(name = "shopsync")]
#[command(about = "Offline-first sync queue and cache for the storefront data service")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shopsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show connectivity, queue and storage state
  Status,
  /// Refresh the offline catalog
  Prefetch {
    /// Also download product images
    #[arg(long)]
    images: bool,
  },
  /// List products, from the network or the offline catalog
  Products,
  /// Send pending actions now
  Sync,
  /// Queue a user action
  Enqueue {
    #[command(subcommand)]
    action: EnqueueCommand,
  },
  /// Remove expired cache entries
  Sweep,
  /// Cache an image and print its local reference
  Image { url: String },
  /// Run the engine, printing events until Ctrl-C
  Watch,
}

#[derive(Subcommand, Debug)]
enum EnqueueCommand {
  WishlistAdd {
    #[arg(long)]
    user: String,
    #[arg(long)]
    product: String,
  },
  WishlistRemove {
    id: String,
  },
  ReviewCreate {
    #[arg(long)]
    user: String,
    #[arg(long)]
    product: String,
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=5))]
    rating: u8,
    #[arg(long)]
    comment: Option<String>,
  },
  ReviewDelete {
    id: String,
  },
}

impl From<EnqueueCommand> for Mutation {
  fn from(command: EnqueueCommand) -> Self {
    match command {
      EnqueueCommand::WishlistAdd { user, product } => Mutation::WishlistAdd {
        user_id: user,
        product_id: product,
      },
      EnqueueCommand::WishlistRemove { id } => Mutation::WishlistRemove { id },
      EnqueueCommand::ReviewCreate {
        user,
        product,
        rating,
        comment,
      } => Mutation::ReviewCreate {
        product_id: product,
        user_id: user,
        rating,
        comment,
      },
      EnqueueCommand::ReviewDelete { id } => Mutation::ReviewDelete { id },
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let _log_guard = logging::init(&config::data_dir()?.join("logs"), args.verbose)?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let service = Arc::new(HttpDataService::new(&config)?);

  let online = service.ping().await.is_ok();
  info!(online, url = %config.service.url, "data service checked");

  let ctx = SyncEngineContext::from_config(&config, service.clone(), online)?;

  match args.command {
    Command::Status => print_state(&ctx.state()),
    Command::Prefetch { images } => {
      let report = ctx.cache_products_for_offline(images).await;
      println!(
        "cached {} products, {} categories, {} images",
        report.products, report.categories, report.images
      );
    }
    Command::Products => match ctx.products().await {
      Some(result) => {
        println!("{} products ({:?})", result.data.len(), result.source);
        for product in &result.data {
          println!("  {}  {}", product.id, product.name);
        }
      }
      None => println!("no products available offline"),
    },
    Command::Sync => match ctx.sync_pending_actions().await {
      Some(outcome) => println!(
        "delivered {}, retrying {}, dropped {}",
        outcome.succeeded, outcome.retained, outcome.dropped
      ),
      None if !online => println!("offline, {} actions pending", ctx.pending_count()),
      None => println!("nothing to sync"),
    },
    Command::Enqueue { action } => {
      let id = ctx.add_pending_action(action.into());
      println!("queued {}", id);
      if let Some(outcome) = ctx.sync_pending_actions().await {
        println!("delivered {}", outcome.succeeded);
      }
    }
    Command::Sweep => {
      let removed = ctx.clear_expired_cache();
      println!("removed {} expired entries", removed);
      if let Some(estimate) = ctx.update_storage_usage() {
        println!("storage: {} bytes used", estimate.used);
      }
    }
    Command::Image { url } => {
      if !ctx.cache_image(&url).await {
        println!("could not cache {}", url);
      }
      println!("{}", ctx.get_cached_image(&url));
    }
    Command::Watch => {
      let probe_interval = Duration::from_secs(config.connectivity.probe_interval_secs);
      let probe: Arc<dyn DataService> = service;
      ctx.spawn_probe(probe, probe_interval);
      watch(&ctx).await;
    }
  }

  ctx.shutdown();
  Ok(())
}

async fn watch(ctx: &SyncEngineContext) {
  print_state(&ctx.state());
  let mut events = ctx.subscribe();
  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      event = events.recv() => match event {
        Ok(event) => print_event(&event),
        Err(RecvError::Lagged(missed)) => println!("... {} events missed", missed),
        Err(RecvError::Closed) => break,
      },
    }
  }
}

fn print_state(state: &SyncState) {
  println!("online:    {}", state.is_online);
  println!("syncing:   {}", state.is_syncing);
  println!("pending:   {}", state.pending_count);
  match state.last_sync_time {
    Some(at) => println!("last sync: {}", at.to_rfc3339()),
    None => println!("last sync: never"),
  }
  if let Some(storage) = state.storage {
    match storage.quota {
      Some(quota) => println!("storage:   {} / {} bytes", storage.used, quota),
      None => println!("storage:   {} bytes", storage.used),
    }
  }
}

fn print_event(event: &SyncEvent) {
  match event {
    SyncEvent::Connectivity(true) => println!("online"),
    SyncEvent::Connectivity(false) => println!("offline"),
    SyncEvent::SyncStarted => println!("sync started"),
    SyncEvent::SyncFinished {
      succeeded,
      retained,
      dropped,
    } => println!(
      "sync finished: {} delivered, {} retrying, {} dropped",
      succeeded, retained, dropped
    ),
    SyncEvent::CacheProgress(progress) if progress.total > 0 => {
      println!("caching images {}/{}", progress.current, progress.total)
    }
    SyncEvent::CacheProgress(_) => {}
    SyncEvent::StorageUsage(estimate) => println!("storage: {} bytes used", estimate.used),
  }
}
