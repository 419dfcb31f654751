//! Remote gateway: the REST service holding restaurants, reviews and favorites.
//!
//! The core only depends on the [`RemoteGateway`] contract; [`HttpGateway`]
//! is the `reqwest` implementation used by the command line host.

pub mod client;
#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use url::Url;

use crate::error::{Error, Result};
use crate::models::{NewReview, Restaurant, Review};

pub use client::HttpGateway;

/// Request/response contract of the remote service.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
  /// `GET {restaurants}`
  async fn fetch_restaurants(&self) -> Result<Vec<Restaurant>>;

  /// `GET {reviews}?restaurant_id=ID`
  async fn fetch_reviews(&self, restaurant_id: i64) -> Result<Vec<Review>>;

  /// `POST {reviews}`; the remote assigns `id` and `createdAt`.
  async fn post_review(&self, review: &NewReview) -> Result<Review>;

  /// `PUT {restaurants}/{id}/?is_favorite={true|false}`, using a URL built by
  /// [`Endpoints::favorite`].
  async fn put_favorite(&self, url: &Url) -> Result<()>;
}

/// URL layout of the remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
  base: Url,
}

impl Endpoints {
  pub fn new(base: Url) -> Result<Self> {
    if base.cannot_be_a_base() {
      return Err(Error::InvalidPayload(format!(
        "gateway url {} cannot carry a path",
        base
      )));
    }
    Ok(Self { base })
  }

  pub fn parse(base: &str) -> Result<Self> {
    let url = Url::parse(base)
      .map_err(|e| Error::InvalidPayload(format!("invalid gateway url {}: {}", base, e)))?;
    Self::new(url)
  }

  pub fn base(&self) -> &Url {
    &self.base
  }

  fn endpoint(&self, segments: &[&str]) -> Url {
    let mut url = self.base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
      path.pop_if_empty().extend(segments);
    }
    url
  }

  pub fn restaurants(&self) -> Url {
    self.endpoint(&["restaurants"])
  }

  pub fn reviews(&self) -> Url {
    self.endpoint(&["reviews"])
  }

  pub fn reviews_for(&self, restaurant_id: i64) -> Url {
    let mut url = self.endpoint(&["reviews", ""]);
    url
      .query_pairs_mut()
      .append_pair("restaurant_id", &restaurant_id.to_string());
    url
  }

  /// Favorite URL carrying the desired absolute state, so repeating the
  /// request leaves the remote in the same state.
  pub fn favorite(&self, restaurant_id: i64, is_favorite: bool) -> Url {
    let id = restaurant_id.to_string();
    let mut url = self.endpoint(&["restaurants", &id, ""]);
    url
      .query_pairs_mut()
      .append_pair("is_favorite", if is_favorite { "true" } else { "false" });
    url
  }

  /// Per-restaurant review URL recorded on queued review submissions.
  pub fn restaurant_reviews(&self, restaurant_id: i64) -> Url {
    let id = restaurant_id.to_string();
    self.endpoint(&["reviews", &id])
  }
}
