//! In-memory gateway for tests.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

use super::RemoteGateway;
use crate::error::{Error, Result};
use crate::models::{NewReview, Restaurant, Review};
use crate::sync::ConnectivityProbe;

/// Remote service double: serves a fixed restaurant list, records every
/// call, and fails every call with a network error while offline. While
/// rejecting it stays reachable but answers every call with a 500.
pub(crate) struct FakeGateway {
  pub restaurants: Mutex<Vec<Restaurant>>,
  pub reviews: Mutex<Vec<Review>>,
  pub calls: Mutex<Vec<String>>,
  online: AtomicBool,
  rejecting: AtomicBool,
  next_review_id: AtomicI64,
  latency: Duration,
}

impl FakeGateway {
  pub fn new(restaurants: Vec<Restaurant>) -> Self {
    Self {
      restaurants: Mutex::new(restaurants),
      reviews: Mutex::new(Vec::new()),
      calls: Mutex::new(Vec::new()),
      online: AtomicBool::new(true),
      rejecting: AtomicBool::new(false),
      next_review_id: AtomicI64::new(100),
      latency: Duration::ZERO,
    }
  }

  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = latency;
    self
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn set_rejecting(&self, rejecting: bool) {
    self.rejecting.store(rejecting, Ordering::SeqCst);
  }

  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  async fn call(&self, description: String) -> Result<()> {
    self.calls.lock().unwrap().push(description);
    if !self.latency.is_zero() {
      tokio::time::sleep(self.latency).await;
    }
    if !self.online.load(Ordering::SeqCst) {
      Err(Error::Network("connection refused".into()))
    } else if self.rejecting.load(Ordering::SeqCst) {
      Err(Error::RemoteRejected {
        status: 500,
        body: "internal error".into(),
      })
    } else {
      Ok(())
    }
  }
}

pub(crate) fn restaurant(id: i64, name: &str, neighborhood: &str, cuisine: &str) -> Restaurant {
  Restaurant {
    id,
    name: name.to_string(),
    neighborhood: neighborhood.to_string(),
    cuisine_type: cuisine.to_string(),
    address: String::new(),
    latlng: None,
    photograph: Some(id.to_string()),
    operating_hours: Default::default(),
    is_favorite: false,
  }
}

#[async_trait]
impl RemoteGateway for FakeGateway {
  async fn fetch_restaurants(&self) -> Result<Vec<Restaurant>> {
    self.call("GET restaurants".into()).await?;
    Ok(self.restaurants.lock().unwrap().clone())
  }

  async fn fetch_reviews(&self, restaurant_id: i64) -> Result<Vec<Review>> {
    self.call(format!("GET reviews {}", restaurant_id)).await?;
    Ok(
      self
        .reviews
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.restaurant_id == restaurant_id)
        .cloned()
        .collect(),
    )
  }

  async fn post_review(&self, review: &NewReview) -> Result<Review> {
    self
      .call(format!("POST review {} {}", review.restaurant_id, review.name))
      .await?;
    let confirmed = Review {
      id: self.next_review_id.fetch_add(1, Ordering::SeqCst),
      restaurant_id: review.restaurant_id,
      name: review.name.clone(),
      rating: review.rating,
      comments: review.comments.clone(),
      created_at: Some(Utc::now()),
    };
    self.reviews.lock().unwrap().push(confirmed.clone());
    Ok(confirmed)
  }

  async fn put_favorite(&self, url: &Url) -> Result<()> {
    self.call(format!("PUT {}", url)).await
  }
}

#[async_trait]
impl ConnectivityProbe for FakeGateway {
  async fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }
}
