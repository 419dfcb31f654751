use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use restaurant_sync::config::Config;
use restaurant_sync::db::LocalStore;
use restaurant_sync::gateway::{Endpoints, HttpGateway};
use restaurant_sync::models::NewReview;
use restaurant_sync::proxy::{CacheProxy, HttpFetcher, ProxyRequest, SqliteStorage};
use restaurant_sync::sync::{QueuedAction, SyncTrigger};
use restaurant_sync::RestaurantDirectory;

#[derive(Parser, Debug)]
#[command(name = "restaurant-sync")]
#[command(about = "Offline-tolerant restaurant directory client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/restaurant-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Base URL of the remote restaurant service
  #[arg(long)]
  gateway: Option<String>,

  /// Origin that relative proxy paths resolve against
  #[arg(long)]
  origin: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List restaurants, optionally filtered
  Restaurants {
    #[arg(long, default_value = "all")]
    cuisine: String,
    #[arg(long, default_value = "all")]
    neighborhood: String,
  },
  /// Show one restaurant
  Restaurant { id: i64 },
  Neighborhoods,
  Cuisines,
  /// Show reviews for a restaurant, including queued submissions
  Reviews { id: i64 },
  /// Toggle the favorite flag of a restaurant
  Favorite { id: i64 },
  /// Submit a review
  Review {
    #[arg(long)]
    restaurant: i64,
    #[arg(long)]
    name: String,
    #[arg(long)]
    rating: u8,
    #[arg(long)]
    comments: String,
    /// Post immediately instead of queueing
    #[arg(long)]
    direct: bool,
  },
  /// List queued mutations
  Queue,
  /// Run one replay pass
  Sync,
  /// Replay whenever connectivity allows, until Ctrl-C
  Watch,
  /// Route one GET request through the cache proxy
  Fetch { url: String },
  /// Pre-cache the app shell and populate the restaurant store
  Install,
  /// Delete superseded caches
  Activate,
}

/// Initialize the tracing subscriber for logging.
///
/// The returned guard flushes the log file and must be held until exit.
fn init_tracing(log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
  // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

  let (file_layer, guard) = match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "restaurant-sync.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (
        Some(fmt::layer().with_ansi(false).with_writer(writer)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(io::stderr))
    .with(file_layer)
    .with(filter)
    .init();

  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(gateway) = args.gateway {
    config.gateway.url = gateway;
  }
  if let Some(origin) = args.origin {
    config.origin = origin;
  }

  let _log_guard = init_tracing(config.log_dir.as_ref());
  info!(gateway = %config.gateway.url, "restaurant-sync starting");

  let endpoints = Endpoints::parse(&config.gateway.url)?;
  let gateway = Arc::new(HttpGateway::new(endpoints.clone(), config.gateway.timeout())?);
  let store_path = match &config.store.path {
    Some(path) => path.clone(),
    None => LocalStore::default_path()?,
  };
  let directory = RestaurantDirectory::new(
    Arc::clone(&gateway),
    LocalStore::new(store_path),
    endpoints,
  );

  match args.command {
    Command::Restaurants {
      cuisine,
      neighborhood,
    } => {
      for r in directory
        .fetch_restaurants_by_filter(&cuisine, &neighborhood)
        .await?
      {
        let star = if r.is_favorite { " *" } else { "" };
        println!(
          "{}\t{}\t{}\t{}{}",
          r.id, r.name, r.neighborhood, r.cuisine_type, star
        );
      }
    }
    Command::Restaurant { id } => {
      let r = directory.fetch_restaurant_by_id(id).await?;
      println!("{} ({})", r.name, r.cuisine_type);
      println!("  {}", r.address);
      println!("  neighborhood: {}", r.neighborhood);
      println!("  favorite:     {}", r.is_favorite);
      println!("  page:         {}", r.details_url());
      println!("  image:        {}", r.image_url());
      for (day, hours) in &r.operating_hours {
        println!("  {:<10} {}", day, hours);
      }
    }
    Command::Neighborhoods => {
      for n in directory.fetch_neighborhoods().await? {
        println!("{}", n);
      }
    }
    Command::Cuisines => {
      for c in directory.fetch_cuisines().await? {
        println!("{}", c);
      }
    }
    Command::Reviews { id } => {
      for review in directory.fetch_reviews_for_restaurant(id).await? {
        let date = review
          .created_at
          .map(|d| d.format("%Y-%m-%d").to_string())
          .unwrap_or_default();
        println!(
          "{}/5  {}  {}\n      {}",
          review.rating, review.name, date, review.comments
        );
      }
      for review in directory.pending_reviews(id)? {
        println!(
          "{}/5  {}  (pending)\n      {}",
          review.rating, review.name, review.comments
        );
      }
    }
    Command::Favorite { id } => {
      let (mut trigger, registration) =
        SyncTrigger::new(Arc::clone(&gateway), config.sync.probe_interval());
      let directory = directory.with_registration(registration);

      let restaurant = directory.fetch_restaurant_by_id(id).await?;
      let updated = directory.enqueue_favorite_toggle(&restaurant)?;
      println!(
        "{} is {} a favorite",
        updated.name,
        if updated.is_favorite { "now" } else { "no longer" }
      );
      // Deliver right away when online; otherwise it stays queued.
      trigger.step(directory.dispatcher()).await;
    }
    Command::Review {
      restaurant,
      name,
      rating,
      comments,
      direct,
    } => {
      let review = NewReview {
        restaurant_id: restaurant,
        name,
        rating,
        comments,
      };
      if direct {
        let confirmed = directory.submit_review(&review).await?;
        println!("Posted review {}", confirmed.id);
      } else {
        let (mut trigger, registration) =
          SyncTrigger::new(Arc::clone(&gateway), config.sync.probe_interval());
        let directory = directory.with_registration(registration);
        let queue_id = directory.enqueue_review_submission(review)?;
        println!("Queued review as entry {}", queue_id);
        trigger.step(directory.dispatcher()).await;
      }
    }
    Command::Queue => {
      for entry in directory.dispatcher().pending()? {
        match entry.action {
          QueuedAction::Known(action) => println!(
            "{}\t{}\t{}\t{}",
            entry.queue_id,
            action.name(),
            action.restaurant_id(),
            action.url()
          ),
          QueuedAction::Unrecognized { action, .. } => println!(
            "{}\t{}\t(unrecognized)",
            entry.queue_id,
            action.as_deref().unwrap_or("?")
          ),
        }
      }
    }
    Command::Sync => {
      let report = directory.dispatcher().replay().await?;
      println!(
        "delivered {}, retained {}, unrecognized {}",
        report.delivered.len(),
        report.retained.len(),
        report.unrecognized.len()
      );
    }
    Command::Watch => {
      let (trigger, registration) =
        SyncTrigger::new(Arc::clone(&gateway), config.sync.probe_interval());
      // Nothing registers here; entries queued by other invocations are
      // found through the queue on each online tick.
      drop(registration);
      info!("Watching for synchronization opportunities");
      trigger
        .run(directory.dispatcher(), async {
          let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    }
    Command::Fetch { url } => {
      let proxy = build_proxy(&config)?;
      let request = ProxyRequest::get(proxy.resolve(&url)?);
      let served = proxy.handle(&request).await?;
      let cached = served
        .cached_at
        .map(|at| format!(", cached {}", at.format("%Y-%m-%d %H:%M:%S UTC")))
        .unwrap_or_default();
      println!(
        "{} {:?} via {:?} ({} bytes{})",
        served.response.status,
        served.route,
        served.source,
        served.response.body.len(),
        cached
      );
      if let Some(refresh) = served.refresh {
        refresh.await?;
      }
    }
    Command::Install => {
      let proxy = build_proxy(&config)?;
      let cached = proxy.install().await?;
      let restaurants = directory.populate_restaurants().await?;
      println!(
        "Cached {} resources in {}, stored {} restaurants",
        cached,
        config.cache.generation().tag(),
        restaurants.len()
      );
    }
    Command::Activate => {
      let proxy = build_proxy(&config)?;
      for name in proxy.activate()? {
        println!("Deleted cache {}", name);
      }
    }
  }

  Ok(())
}

fn build_proxy(config: &Config) -> Result<CacheProxy<SqliteStorage, HttpFetcher>> {
  let path = config
    .cache_path()
    .ok_or_else(|| eyre!("Could not determine cache directory"))?;
  let origin = Url::parse(&config.origin)
    .map_err(|e| eyre!("Invalid origin {}: {}", config.origin, e))?;

  Ok(
    CacheProxy::new(
      SqliteStorage::open(path)?,
      HttpFetcher::new(config.gateway.timeout())?,
      origin,
      config.cache.generation(),
    )
    .with_third_party_cache(config.cache.third_party.clone())
    .with_precache(config.cache.precache.clone()),
  )
}
