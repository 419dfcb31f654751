//! Durable dispatch queue of mutations awaiting remote confirmation.
//!
//! User mutations are appended to the `dispatch-queue` collection and replayed
//! in insertion order against the remote gateway. Delivery is at-least-once:
//! an entry is deleted only after the remote accepted it, so a failure between
//! the remote call and the delete causes the call to be repeated on the next
//! replay.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::db::{Collection, LocalStore, Record};
use crate::error::{Error, Result};
use crate::gateway::{Endpoints, RemoteGateway};
use crate::models::{NewReview, Review};

pub const TOGGLE_FAVORITE: &str = "toggle-favorite";
pub const ADD_REVIEW: &str = "add-review";

/// A mutation intent, tagged by its `action` name in storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum DispatchAction {
  /// Set the favorite flag of a restaurant. `url` carries the desired state.
  ToggleFavorite {
    url: Url,
    restaurant_id: i64,
    is_favorite: bool,
  },
  AddReview {
    url: Url,
    #[serde(flatten)]
    review: NewReview,
  },
}

impl DispatchAction {
  pub fn toggle_favorite(endpoints: &Endpoints, restaurant_id: i64, is_favorite: bool) -> Self {
    DispatchAction::ToggleFavorite {
      url: endpoints.favorite(restaurant_id, is_favorite),
      restaurant_id,
      is_favorite,
    }
  }

  pub fn add_review(endpoints: &Endpoints, review: NewReview) -> Self {
    DispatchAction::AddReview {
      url: endpoints.restaurant_reviews(review.restaurant_id),
      review,
    }
  }

  /// Action name, also used as the synchronization tag.
  pub fn name(&self) -> &'static str {
    match self {
      DispatchAction::ToggleFavorite { .. } => TOGGLE_FAVORITE,
      DispatchAction::AddReview { .. } => ADD_REVIEW,
    }
  }

  pub fn restaurant_id(&self) -> i64 {
    match self {
      DispatchAction::ToggleFavorite { restaurant_id, .. } => *restaurant_id,
      DispatchAction::AddReview { review, .. } => review.restaurant_id,
    }
  }

  pub fn url(&self) -> &Url {
    match self {
      DispatchAction::ToggleFavorite { url, .. } | DispatchAction::AddReview { url, .. } => url,
    }
  }

  /// Reject malformed intents before they are queued.
  pub fn validate(&self) -> Result<()> {
    if !matches!(self.url().scheme(), "http" | "https") {
      return Err(Error::InvalidPayload(format!(
        "{} url must be http(s), got {}",
        self.name(),
        self.url()
      )));
    }
    match self {
      DispatchAction::ToggleFavorite { restaurant_id, .. } if *restaurant_id <= 0 => {
        Err(Error::InvalidPayload(format!(
          "restaurant_id must be positive, got {}",
          restaurant_id
        )))
      }
      DispatchAction::ToggleFavorite { .. } => Ok(()),
      DispatchAction::AddReview { review, .. } => review.validate(),
    }
  }
}

impl Record for DispatchAction {
  const COLLECTION: Collection = Collection::DispatchQueue;

  /// Queue ids are assigned by the store in insertion order.
  fn key(&self) -> Option<i64> {
    None
  }
}

/// Payload of a stored entry.
#[derive(Debug, Clone, PartialEq)]
pub enum QueuedAction {
  Known(DispatchAction),
  /// Stored payload this version cannot execute. Kept in the queue.
  Unrecognized { action: Option<String>, data: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
  pub queue_id: i64,
  pub action: QueuedAction,
}

impl QueueEntry {
  fn decode(queue_id: i64, data: String) -> Self {
    let action = match serde_json::from_str::<DispatchAction>(&data) {
      Ok(action) => QueuedAction::Known(action),
      Err(_) => {
        let action = serde_json::from_str::<serde_json::Value>(&data)
          .ok()
          .and_then(|v| v.get("action").and_then(|a| a.as_str()).map(String::from));
        QueuedAction::Unrecognized { action, data }
      }
    };
    Self { queue_id, action }
  }
}

/// Persistence used by the dispatcher.
///
/// Each call is independent; there is no atomicity across calls.
pub trait QueueBackend: Send + Sync {
  fn append(&self, action: &DispatchAction) -> Result<i64>;

  /// Queue ids in ascending (insertion) order.
  fn pending_keys(&self) -> Result<Vec<i64>>;

  fn load(&self, queue_id: i64) -> Result<Option<QueueEntry>>;

  fn remove(&self, queue_id: i64) -> Result<bool>;

  /// Store a review confirmed by the remote.
  fn record_review(&self, review: &Review) -> Result<()>;
}

impl QueueBackend for LocalStore {
  fn append(&self, action: &DispatchAction) -> Result<i64> {
    self.open()?.add(action)
  }

  fn pending_keys(&self) -> Result<Vec<i64>> {
    self.open()?.keys(Collection::DispatchQueue)
  }

  fn load(&self, queue_id: i64) -> Result<Option<QueueEntry>> {
    let data = self.open()?.get_raw(Collection::DispatchQueue, queue_id)?;
    Ok(data.map(|data| QueueEntry::decode(queue_id, data)))
  }

  fn remove(&self, queue_id: i64) -> Result<bool> {
    self.open()?.delete_key(Collection::DispatchQueue, queue_id)
  }

  fn record_review(&self, review: &Review) -> Result<()> {
    self.open()?.put(review)?;
    Ok(())
  }
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
  /// Entries confirmed by the remote and removed from the queue
  pub delivered: Vec<i64>,
  /// Entries that failed and stay queued for the next pass
  pub retained: Vec<i64>,
  /// Entries with an unknown action, left in place
  pub unrecognized: Vec<i64>,
}

impl ReplayReport {
  pub fn is_drained(&self) -> bool {
    self.retained.is_empty() && self.unrecognized.is_empty()
  }
}

/// Appends mutation intents and replays them against the remote gateway.
pub struct Dispatcher<G: RemoteGateway, Q: QueueBackend> {
  gateway: Arc<G>,
  queue: Arc<Q>,
  /// Serializes replay passes within this process.
  replaying: Arc<Mutex<()>>,
}

impl<G: RemoteGateway, Q: QueueBackend> Clone for Dispatcher<G, Q> {
  fn clone(&self) -> Self {
    Self {
      gateway: Arc::clone(&self.gateway),
      queue: Arc::clone(&self.queue),
      replaying: Arc::clone(&self.replaying),
    }
  }
}

impl<G: RemoteGateway, Q: QueueBackend> Dispatcher<G, Q> {
  pub fn new(gateway: Arc<G>, queue: Arc<Q>) -> Self {
    Self {
      gateway,
      queue,
      replaying: Arc::new(Mutex::new(())),
    }
  }

  /// Durably append an intent. No network call is made.
  pub fn enqueue(&self, action: &DispatchAction) -> Result<i64> {
    action.validate()?;
    let queue_id = self.queue.append(action)?;
    info!(
      queue_id,
      action = action.name(),
      restaurant_id = action.restaurant_id(),
      "Queued mutation"
    );
    Ok(queue_id)
  }

  /// Every entry still queued, oldest first.
  pub fn pending(&self) -> Result<Vec<QueueEntry>> {
    let mut entries = Vec::new();
    for queue_id in self.queue.pending_keys()? {
      if let Some(entry) = self.queue.load(queue_id)? {
        entries.push(entry);
      }
    }
    Ok(entries)
  }

  /// Walk the queue oldest first and apply each entry remotely.
  ///
  /// Entries are processed one at a time so later toggles for a restaurant
  /// never overtake earlier ones. A failing entry is logged and retained
  /// without stopping the pass. Concurrent calls wait for the running pass
  /// and then see only what it left behind.
  pub async fn replay(&self) -> Result<ReplayReport> {
    let _guard = self.replaying.lock().await;
    let mut report = ReplayReport::default();

    for queue_id in self.queue.pending_keys()? {
      let entry = match self.queue.load(queue_id) {
        Ok(Some(entry)) => entry,
        // Removed since the keys were read
        Ok(None) => continue,
        Err(e) => {
          warn!(queue_id, error = %e, "Failed to read queue entry");
          report.retained.push(queue_id);
          continue;
        }
      };

      match entry.action {
        QueuedAction::Known(action) => match self.apply(queue_id, &action).await {
          Ok(()) => {
            debug!(queue_id, action = action.name(), "Delivered queued mutation");
            report.delivered.push(queue_id);
          }
          Err(e) => {
            warn!(
              queue_id,
              action = action.name(),
              restaurant_id = action.restaurant_id(),
              error = %e,
              "Replay failed, keeping entry"
            );
            report.retained.push(queue_id);
          }
        },
        QueuedAction::Unrecognized { action, .. } => {
          warn!(
            queue_id,
            action = action.as_deref().unwrap_or("<missing>"),
            "Unrecognized queue action, keeping entry"
          );
          report.unrecognized.push(queue_id);
        }
      }
    }

    if !report.delivered.is_empty() || !report.retained.is_empty() {
      info!(
        delivered = report.delivered.len(),
        retained = report.retained.len(),
        unrecognized = report.unrecognized.len(),
        "Replay finished"
      );
    }
    Ok(report)
  }

  async fn apply(&self, queue_id: i64, action: &DispatchAction) -> Result<()> {
    match action {
      DispatchAction::ToggleFavorite { url, .. } => {
        self.gateway.put_favorite(url).await?;
      }
      DispatchAction::AddReview { review, .. } => {
        let confirmed = self.gateway.post_review(review).await?;
        self.queue.record_review(&confirmed)?;
      }
    }
    self.queue.remove(queue_id)?;
    Ok(())
  }
}
