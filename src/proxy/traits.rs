//! Core types for the response cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::classify::Route;

/// A stored or freshly fetched HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl CachedResponse {
  /// Successful response with no body, served when a third-party asset can
  /// be neither fetched nor found in the cache.
  pub fn empty() -> Self {
    Self {
      status: 200,
      headers: Vec::new(),
      body: Vec::new(),
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// A cache entry with its storage timestamp.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: CachedResponse,
  pub cached_at: DateTime<Utc>,
}

/// Indicates where a proxied response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Served from a cache generation
  Cache,
  /// Nothing cached and the network failed; an empty placeholder was served
  Fallback,
}

/// Result of handling one intercepted request.
#[derive(Debug)]
pub struct ProxyResponse {
  pub response: CachedResponse,
  pub source: CacheSource,
  /// Policy that handled the request; `None` for non-GET passthrough.
  pub route: Option<Route>,
  /// Background refresh started for the app shell, if any.
  pub refresh: Option<JoinHandle<()>>,
  /// When the served copy was stored, for responses served from a cache.
  pub cached_at: Option<DateTime<Utc>>,
}

impl ProxyResponse {
  pub(crate) fn new(response: CachedResponse, source: CacheSource, route: Option<Route>) -> Self {
    Self {
      response,
      source,
      route,
      refresh: None,
      cached_at: None,
    }
  }

  pub(crate) fn from_cache(entry: CachedEntry, route: Route) -> Self {
    Self {
      cached_at: Some(entry.cached_at),
      ..Self::new(entry.response, CacheSource::Cache, Some(route))
    }
  }
}

/// Versioned name of the app content cache, e.g. `mws-restaurant-v14`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
  family: String,
  version: u32,
}

impl Generation {
  pub fn new(family: impl Into<String>, version: u32) -> Self {
    Self {
      family: family.into(),
      version,
    }
  }

  pub fn tag(&self) -> String {
    format!("{}-v{}", self.family, self.version)
  }

  /// Whether a cache name is a generation of this family, `{family}-v{N}`.
  pub fn owns(&self, cache_name: &str) -> bool {
    cache_name
      .strip_prefix(self.family.as_str())
      .and_then(|rest| rest.strip_prefix("-v"))
      .is_some_and(|v| !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()))
  }
}
