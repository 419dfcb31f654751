use async_trait::async_trait;
use reqwest::{header, Client};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{Endpoints, RemoteGateway};
use crate::error::{Error, Result};
use crate::models::{NewReview, Restaurant, Review};
use crate::sync::ConnectivityProbe;

/// Remote gateway client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpGateway {
  client: Client,
  endpoints: Endpoints,
}

impl HttpGateway {
  pub fn new(endpoints: Endpoints, timeout: Duration) -> Result<Self> {
    let client = Client::builder().timeout(timeout).build()?;
    Ok(Self { client, endpoints })
  }

  pub fn endpoints(&self) -> &Endpoints {
    &self.endpoints
  }

  /// Check if response is successful, returning an error with body if not.
  async fn check_response(response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
      Ok(response)
    } else {
      let status = response.status();
      let body = response.text().await.unwrap_or_default();
      Err(Error::from_status(status, &body))
    }
  }

  async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let text = response.text().await?;
    Ok(serde_json::from_str(&text)?)
  }

  async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
    debug!(url = %url, "GET");
    let response = self
      .client
      .get(url)
      .header(header::ACCEPT, "application/json; charset=utf-8")
      .send()
      .await?;
    let response = Self::check_response(response).await?;
    Self::read_json(response).await
  }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
  async fn fetch_restaurants(&self) -> Result<Vec<Restaurant>> {
    self.get(self.endpoints.restaurants()).await
  }

  async fn fetch_reviews(&self, restaurant_id: i64) -> Result<Vec<Review>> {
    self.get(self.endpoints.reviews_for(restaurant_id)).await
  }

  async fn post_review(&self, review: &NewReview) -> Result<Review> {
    let url = self.endpoints.reviews();
    debug!(url = %url, restaurant_id = review.restaurant_id, "POST review");
    let response = self.client.post(url).json(review).send().await?;
    let response = Self::check_response(response).await?;
    Self::read_json(response).await
  }

  async fn put_favorite(&self, url: &Url) -> Result<()> {
    debug!(url = %url, "PUT favorite");
    let response = self.client.put(url.clone()).send().await?;
    Self::check_response(response).await?;
    Ok(())
  }
}

#[async_trait]
impl ConnectivityProbe for HttpGateway {
  /// Any HTTP answer, even an error status, means the gateway is reachable.
  async fn is_online(&self) -> bool {
    self
      .client
      .head(self.endpoints.restaurants())
      .send()
      .await
      .is_ok()
  }
}
