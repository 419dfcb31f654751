//! Restaurant directory: the operations the view layer calls.
//!
//! Reads go through the local store with the remote gateway as the source of
//! truth; mutations are applied optimistically to the store and queued for
//! replay.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::db::{LocalStore, StoreHandle};
use crate::error::{Error, Result};
use crate::gateway::{Endpoints, RemoteGateway};
use crate::models::{distinct, NewReview, Restaurant, Review};
use crate::sync::{DispatchAction, Dispatcher, QueuedAction, SyncRegistration};

/// Filter value that matches everything.
const ANY: &str = "all";

/// Restaurant directory backed by the local store, with offline support.
pub struct RestaurantDirectory<G: RemoteGateway> {
  gateway: Arc<G>,
  store: Arc<LocalStore>,
  endpoints: Endpoints,
  dispatcher: Dispatcher<G, LocalStore>,
  registration: Option<SyncRegistration>,
}

impl<G: RemoteGateway> Clone for RestaurantDirectory<G> {
  fn clone(&self) -> Self {
    Self {
      gateway: Arc::clone(&self.gateway),
      store: Arc::clone(&self.store),
      endpoints: self.endpoints.clone(),
      dispatcher: self.dispatcher.clone(),
      registration: self.registration.clone(),
    }
  }
}

impl<G: RemoteGateway> RestaurantDirectory<G> {
  pub fn new(gateway: Arc<G>, store: LocalStore, endpoints: Endpoints) -> Self {
    let store = Arc::new(store);
    let dispatcher = Dispatcher::new(Arc::clone(&gateway), Arc::clone(&store));
    Self {
      gateway,
      store,
      endpoints,
      dispatcher,
      registration: None,
    }
  }

  /// Register sync opportunities with a running trigger after each enqueue.
  pub fn with_registration(mut self, registration: SyncRegistration) -> Self {
    self.registration = Some(registration);
    self
  }

  pub fn dispatcher(&self) -> &Dispatcher<G, LocalStore> {
    &self.dispatcher
  }

  /// Run `op` against a freshly opened store handle.
  fn local<T>(&self, op: impl FnOnce(&StoreHandle) -> Result<T>) -> Result<T> {
    let handle = self.store.open()?;
    op(&handle)
  }

  /// All restaurants, from the store when it has any.
  pub async fn fetch_restaurants(&self) -> Result<Vec<Restaurant>> {
    match self.local(|s| s.get_all::<Restaurant>()) {
      Ok(restaurants) if !restaurants.is_empty() => return Ok(restaurants),
      Ok(_) => debug!("Store empty, populating restaurants"),
      Err(e @ Error::StoreUnavailable(_)) => {
        warn!(error = %e, "Store unavailable, reading restaurants from network");
        return self.gateway.fetch_restaurants().await;
      }
      Err(e) => return Err(e),
    }
    self.populate_restaurants().await
  }

  /// Fetch from the remote and replace the stored restaurants.
  pub async fn populate_restaurants(&self) -> Result<Vec<Restaurant>> {
    let restaurants = self.gateway.fetch_restaurants().await?;
    match self.local(|s| s.replace_all(&restaurants)) {
      Ok(()) => debug!(count = restaurants.len(), "Populated restaurants"),
      Err(e @ Error::StoreUnavailable(_)) => {
        warn!(error = %e, "Store unavailable, restaurants not persisted")
      }
      Err(e) => return Err(e),
    }
    Ok(restaurants)
  }

  /// Look up one restaurant. A miss forces a full refetch before giving up.
  pub async fn fetch_restaurant_by_id(&self, id: i64) -> Result<Restaurant> {
    match self.local(|s| s.get::<Restaurant>(id)) {
      Ok(Some(restaurant)) => return Ok(restaurant),
      Ok(None) => debug!(restaurant_id = id, "Restaurant not stored, refetching"),
      Err(e @ Error::StoreUnavailable(_)) => {
        warn!(error = %e, "Store unavailable, refetching restaurants");
      }
      Err(e) => return Err(e),
    }

    self
      .populate_restaurants()
      .await?
      .into_iter()
      .find(|r| r.id == id)
      .ok_or_else(|| Error::NotFound(format!("restaurant {}", id)))
  }

  /// Restaurants matching a cuisine and neighborhood; `all` matches any.
  pub async fn fetch_restaurants_by_filter(
    &self,
    cuisine: &str,
    neighborhood: &str,
  ) -> Result<Vec<Restaurant>> {
    let mut restaurants = self.fetch_restaurants().await?;
    restaurants.retain(|r| {
      (cuisine == ANY || r.cuisine_type == cuisine)
        && (neighborhood == ANY || r.neighborhood == neighborhood)
    });
    Ok(restaurants)
  }

  pub async fn fetch_neighborhoods(&self) -> Result<Vec<String>> {
    let restaurants = self.fetch_restaurants().await?;
    Ok(distinct(restaurants.iter().map(|r| r.neighborhood.as_str())))
  }

  pub async fn fetch_cuisines(&self) -> Result<Vec<String>> {
    let restaurants = self.fetch_restaurants().await?;
    Ok(distinct(restaurants.iter().map(|r| r.cuisine_type.as_str())))
  }

  /// Reviews from the network, cached locally; stored reviews when offline.
  pub async fn fetch_reviews_for_restaurant(&self, restaurant_id: i64) -> Result<Vec<Review>> {
    match self.gateway.fetch_reviews(restaurant_id).await {
      Ok(reviews) => {
        let stored = self.local(|s| {
          for review in &reviews {
            s.put(review)?;
          }
          Ok(())
        });
        if let Err(e) = stored {
          warn!(restaurant_id, error = %e, "Failed to cache reviews");
        }
        Ok(reviews)
      }
      Err(e) if e.is_network() => {
        debug!(restaurant_id, error = %e, "Offline, reading stored reviews");
        self.local(|s| s.get_all_where(|r: &Review| r.restaurant_id == restaurant_id))
      }
      Err(e) => Err(e),
    }
  }

  /// Flip the favorite flag locally and queue the change for the remote.
  ///
  /// An invalid toggle is rejected before anything is written. Once stored,
  /// the local change is never rolled back. Returns the updated record.
  pub fn enqueue_favorite_toggle(&self, restaurant: &Restaurant) -> Result<Restaurant> {
    let mut updated = restaurant.clone();
    updated.is_favorite = !restaurant.is_favorite;
    let action = DispatchAction::toggle_favorite(&self.endpoints, updated.id, updated.is_favorite);
    action.validate()?;

    self.local(|s| match s.update_where(updated.id, &updated) {
      Err(Error::NotFound(_)) => s.put(&updated).map(|_| ()),
      other => other,
    })?;
    self.dispatcher.enqueue(&action)?;
    self.register(action.name());
    Ok(updated)
  }

  /// Queue a review for posting on the next synchronization.
  pub fn enqueue_review_submission(&self, review: NewReview) -> Result<i64> {
    let action = DispatchAction::add_review(&self.endpoints, review);
    let queue_id = self.dispatcher.enqueue(&action)?;
    self.register(action.name());
    Ok(queue_id)
  }

  /// Post a review immediately, for hosts without background synchronization.
  pub async fn submit_review(&self, review: &NewReview) -> Result<Review> {
    review.validate()?;
    let confirmed = self.gateway.post_review(review).await?;
    if let Err(e) = self.local(|s| s.put(&confirmed)) {
      warn!(review_id = confirmed.id, error = %e, "Failed to store confirmed review");
    }
    Ok(confirmed)
  }

  /// Review submissions for a restaurant still waiting in the queue.
  pub fn pending_reviews(&self, restaurant_id: i64) -> Result<Vec<NewReview>> {
    let pending = self
      .dispatcher
      .pending()?
      .into_iter()
      .filter_map(|entry| match entry.action {
        QueuedAction::Known(DispatchAction::AddReview { review, .. })
          if review.restaurant_id == restaurant_id =>
        {
          Some(review)
        }
        _ => None,
      })
      .collect();
    Ok(pending)
  }

  fn register(&self, tag: &str) {
    match &self.registration {
      Some(registration) => registration.register(tag),
      None => debug!(tag, "No sync host, mutation waits for the next replay"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::gateway::fake::{restaurant, FakeGateway};
  use crate::sync::SyncTrigger;
  use std::time::Duration;
  use tempfile::TempDir;

  fn restaurants() -> Vec<Restaurant> {
    vec![
      restaurant(1, "Mission Chinese Food", "Manhattan", "Asian"),
      restaurant(2, "Emily", "Brooklyn", "Pizza"),
      restaurant(3, "Kang Ho Dong Baekjeong", "Manhattan", "Asian"),
      restaurant(7, "Katz's Delicatessen", "Manhattan", "American"),
    ]
  }

  fn setup() -> (TempDir, Arc<FakeGateway>, RestaurantDirectory<FakeGateway>) {
    let dir = TempDir::new().unwrap();
    let gateway = Arc::new(FakeGateway::new(restaurants()));
    let directory = RestaurantDirectory::new(
      Arc::clone(&gateway),
      LocalStore::new(dir.path().join("store.db")),
      Endpoints::parse("http://localhost:1337").unwrap(),
    );
    (dir, gateway, directory)
  }

  fn review(restaurant_id: i64) -> NewReview {
    NewReview {
      restaurant_id,
      name: "Ada".into(),
      rating: 5,
      comments: "Best pastrami in town".into(),
    }
  }

  #[tokio::test]
  async fn test_empty_store_populates_from_remote() {
    let (_dir, gateway, directory) = setup();

    let fetched = directory.fetch_restaurants().await.unwrap();
    assert_eq!(fetched, restaurants());
    assert_eq!(gateway.calls(), vec!["GET restaurants"]);

    // Served from the store afterwards, even offline.
    gateway.set_online(false);
    assert_eq!(directory.fetch_restaurants().await.unwrap(), restaurants());
    assert_eq!(gateway.calls().len(), 1);
  }

  #[tokio::test]
  async fn test_offline_favorite_toggle_is_replayed_once() {
    let (_dir, gateway, directory) = setup();
    directory.fetch_restaurants().await.unwrap();
    gateway.set_online(false);

    let katz = directory.fetch_restaurant_by_id(7).await.unwrap();
    let updated = directory.enqueue_favorite_toggle(&katz).unwrap();
    assert!(updated.is_favorite);
    assert!(directory.fetch_restaurant_by_id(7).await.unwrap().is_favorite);

    let pending = directory.dispatcher().pending().unwrap();
    assert_eq!(pending.len(), 1);
    match &pending[0].action {
      QueuedAction::Known(DispatchAction::ToggleFavorite {
        url, restaurant_id, ..
      }) => {
        assert_eq!(*restaurant_id, 7);
        assert_eq!(
          url.as_str(),
          "http://localhost:1337/restaurants/7/?is_favorite=true"
        );
      }
      other => panic!("unexpected entry {:?}", other),
    }

    // Offline replay keeps the entry.
    assert_eq!(directory.dispatcher().replay().await.unwrap().retained.len(), 1);

    gateway.set_online(true);
    let report = directory.dispatcher().replay().await.unwrap();
    assert_eq!(report.delivered.len(), 1);
    assert!(directory.dispatcher().pending().unwrap().is_empty());

    let again = directory.dispatcher().replay().await.unwrap();
    assert!(again.delivered.is_empty());
    let puts = gateway
      .calls()
      .iter()
      .filter(|c| c.starts_with("PUT"))
      .count();
    assert_eq!(puts, 2);
  }

  #[tokio::test]
  async fn test_invalid_favorite_toggle_writes_nothing() {
    let (_dir, _gateway, directory) = setup();
    let ghost = restaurant(0, "Nowhere", "Queens", "Pizza");

    let result = directory.enqueue_favorite_toggle(&ghost);
    assert!(matches!(result, Err(Error::InvalidPayload(_))));
    assert_eq!(directory.local(|s| s.get::<Restaurant>(0)).unwrap(), None);
    assert!(directory.dispatcher().pending().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_missing_restaurant_fails_only_after_refetch() {
    let (_dir, gateway, directory) = setup();

    let result = directory.fetch_restaurant_by_id(999).await;
    assert!(matches!(result, Err(Error::NotFound(_))));
    assert_eq!(gateway.calls(), vec!["GET restaurants"]);
  }

  #[tokio::test]
  async fn test_filters_and_distinct_values() {
    let (_dir, _gateway, directory) = setup();

    let asian = directory
      .fetch_restaurants_by_filter("Asian", "all")
      .await
      .unwrap();
    assert_eq!(asian.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 3]);

    let everything = directory
      .fetch_restaurants_by_filter("all", "all")
      .await
      .unwrap();
    assert_eq!(everything.len(), 4);

    let brooklyn_asian = directory
      .fetch_restaurants_by_filter("Asian", "Brooklyn")
      .await
      .unwrap();
    assert!(brooklyn_asian.is_empty());

    assert_eq!(
      directory.fetch_neighborhoods().await.unwrap(),
      vec!["Manhattan", "Brooklyn"]
    );
    assert_eq!(
      directory.fetch_cuisines().await.unwrap(),
      vec!["Asian", "Pizza", "American"]
    );
  }

  #[tokio::test]
  async fn test_reviews_fall_back_to_store_when_offline() {
    let (_dir, gateway, directory) = setup();
    directory.submit_review(&review(7)).await.unwrap();
    directory.submit_review(&review(2)).await.unwrap();

    let online = directory.fetch_reviews_for_restaurant(7).await.unwrap();
    assert_eq!(online.len(), 1);

    gateway.set_online(false);
    let offline = directory.fetch_reviews_for_restaurant(7).await.unwrap();
    let ids = |reviews: &[Review]| reviews.iter().map(|r| r.id).collect::<Vec<_>>();
    assert_eq!(ids(&offline), ids(&online));
  }

  #[tokio::test]
  async fn test_direct_submission_surfaces_failures() {
    let (_dir, gateway, directory) = setup();
    gateway.set_online(false);
    let result = directory.submit_review(&review(7)).await;
    assert!(matches!(result, Err(Error::Network(_))));

    let mut invalid = review(7);
    invalid.name = "  ".into();
    let result = directory.submit_review(&invalid).await;
    assert!(matches!(result, Err(Error::InvalidPayload(_))));
  }

  #[tokio::test]
  async fn test_queued_review_is_pending_until_replayed() {
    let (_dir, _gateway, directory) = setup();
    let (trigger, registration) = SyncTrigger::new(
      Arc::new(FakeGateway::new(Vec::new())),
      Duration::from_secs(30),
    );
    let directory = directory.with_registration(registration.clone());

    directory.enqueue_review_submission(review(7)).unwrap();
    assert_eq!(directory.pending_reviews(7).unwrap(), vec![review(7)]);
    assert!(directory.pending_reviews(2).unwrap().is_empty());
    assert_eq!(registration.pending_tags(), vec!["add-review"]);

    let mut trigger = trigger;
    trigger.step(directory.dispatcher()).await;
    assert!(directory.pending_reviews(7).unwrap().is_empty());
    assert!(registration.pending_tags().is_empty());
    assert_eq!(directory.fetch_reviews_for_restaurant(7).await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_unavailable_store_reads_through_network() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let gateway = Arc::new(FakeGateway::new(restaurants()));
    let directory = RestaurantDirectory::new(
      Arc::clone(&gateway),
      LocalStore::new(blocker.join("store.db")),
      Endpoints::parse("http://localhost:1337").unwrap(),
    );

    assert_eq!(directory.fetch_restaurants().await.unwrap().len(), 4);
    assert_eq!(directory.fetch_restaurant_by_id(2).await.unwrap().name, "Emily");
    let katz = restaurant(7, "Katz's Delicatessen", "Manhattan", "American");
    assert!(matches!(
      directory.enqueue_favorite_toggle(&katz),
      Err(Error::StoreUnavailable(_))
    ));
  }
}
