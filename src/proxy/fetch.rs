//! Network side of the proxy.

use async_trait::async_trait;
use reqwest::{Client, Method};
use std::time::Duration;
use url::Url;

use super::traits::CachedResponse;
use crate::error::Result;

/// Performs the real network request for an intercepted request.
#[async_trait]
pub trait Fetcher: Send + Sync {
  /// Any HTTP answer is `Ok`, including error statuses. `Err` means the
  /// network could not be reached.
  async fn fetch(&self, method: &Method, url: &Url) -> Result<CachedResponse>;
}

#[derive(Clone)]
pub struct HttpFetcher {
  client: Client,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = Client::builder().timeout(timeout).build()?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, method: &Method, url: &Url) -> Result<CachedResponse> {
    let response = self
      .client
      .request(method.clone(), url.clone())
      .send()
      .await?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await?.to_vec();

    Ok(CachedResponse {
      status,
      headers,
      body,
    })
  }
}
