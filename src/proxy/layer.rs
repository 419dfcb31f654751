//! Cache proxy that applies a caching policy to every intercepted request.

use reqwest::Method;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use super::classify::{classify, static_key, Route, APP_SHELL};
use super::fetch::Fetcher;
use super::storage::CacheStorage;
use super::traits::{CacheSource, CachedEntry, CachedResponse, Generation, ProxyResponse};
use crate::error::{Error, Result};

/// Meta key holding the last activated generation tag.
const ACTIVE_GENERATION: &str = "active_generation";

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
  pub method: Method,
  pub url: Url,
}

impl ProxyRequest {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
    }
  }
}

/// Cache proxy sitting between the application and the network.
///
/// App content lives in the current generation cache; maps and fonts live in
/// a separate third-party cache so their lifecycle is independent.
pub struct CacheProxy<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  origin: Url,
  generation: Generation,
  third_party: String,
  precache: Vec<String>,
}

impl<S, F> CacheProxy<S, F>
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
{
  pub fn new(storage: S, fetcher: F, origin: Url, generation: Generation) -> Self {
    Self {
      storage: Arc::new(storage),
      fetcher: Arc::new(fetcher),
      origin,
      generation,
      third_party: "GOOGLE_MAPS_CACHE".to_string(),
      precache: vec![APP_SHELL.to_string()],
    }
  }

  /// Set the name of the third-party asset cache.
  pub fn with_third_party_cache(mut self, name: impl Into<String>) -> Self {
    self.third_party = name.into();
    self
  }

  /// Set the paths cached by [`CacheProxy::install`].
  pub fn with_precache(mut self, paths: Vec<String>) -> Self {
    self.precache = paths;
    self
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Resolve a path or absolute URL against the app origin.
  pub fn resolve(&self, target: &str) -> Result<Url> {
    self
      .origin
      .join(target)
      .map_err(|e| Error::InvalidPayload(format!("invalid url {}: {}", target, e)))
  }

  /// Handle one intercepted request.
  pub async fn handle(&self, request: &ProxyRequest) -> Result<ProxyResponse> {
    // Non-GET requests go straight to the network, untouched.
    if request.method != Method::GET {
      let response = self.fetcher.fetch(&request.method, &request.url).await?;
      return Ok(ProxyResponse::new(response, CacheSource::Network, None));
    }

    let route = classify(&request.url);
    debug!(url = %request.url, ?route, "Intercepted request");

    match route {
      Route::AppShell => self.app_shell().await,
      Route::ThirdParty => Ok(self.third_party_asset(&request.url).await),
      Route::RemoteApi => {
        let response = self.fetcher.fetch(&Method::GET, &request.url).await?;
        Ok(ProxyResponse::new(
          response,
          CacheSource::Network,
          Some(Route::RemoteApi),
        ))
      }
      Route::Static => self.static_asset(&request.url).await,
    }
  }

  /// Cache first, and always refresh the cached copy for next time.
  async fn app_shell(&self) -> Result<ProxyResponse> {
    let index = self.resolve(APP_SHELL)?;
    let cache = self.generation.tag();

    if let Some(entry) = self.lookup(&cache, index.as_str()) {
      let mut served = ProxyResponse::from_cache(entry, Route::AppShell);
      served.refresh = Some(self.spawn_refresh(cache, index));
      return Ok(served);
    }

    let response = self.fetcher.fetch(&Method::GET, &index).await?;
    self.store(&cache, index.as_str(), &response);
    Ok(ProxyResponse::new(
      response,
      CacheSource::Network,
      Some(Route::AppShell),
    ))
  }

  fn spawn_refresh(&self, cache: String, url: Url) -> tokio::task::JoinHandle<()> {
    let proxy = self.clone();
    tokio::spawn(async move {
      match proxy.fetcher.fetch(&Method::GET, &url).await {
        Ok(response) => proxy.store(&cache, url.as_str(), &response),
        Err(e) => debug!(url = %url, error = %e, "Background refresh failed"),
      }
    })
  }

  /// Cache first in the third-party cache; an empty success when that fails.
  async fn third_party_asset(&self, url: &Url) -> ProxyResponse {
    let cache = self.third_party.clone();
    match self.cache_first(&cache, url, url.as_str(), Route::ThirdParty).await {
      Ok(served) => served,
      Err(e) => {
        warn!(url = %url, error = %e, "Failed to load third-party asset");
        ProxyResponse::new(
          CachedResponse::empty(),
          CacheSource::Fallback,
          Some(Route::ThirdParty),
        )
      }
    }
  }

  /// Cache first ignoring the query string; one more network attempt on failure.
  async fn static_asset(&self, url: &Url) -> Result<ProxyResponse> {
    let cache = self.generation.tag();
    let key = static_key(url);
    match self.cache_first(&cache, url, &key, Route::Static).await {
      Ok(served) => Ok(served),
      Err(e) => {
        warn!(url = %url, error = %e, "Error on fetch, retrying");
        let response = self.fetcher.fetch(&Method::GET, url).await?;
        self.store(&cache, &key, &response);
        Ok(ProxyResponse::new(
          response,
          CacheSource::Network,
          Some(Route::Static),
        ))
      }
    }
  }

  async fn cache_first(
    &self,
    cache: &str,
    url: &Url,
    key: &str,
    route: Route,
  ) -> Result<ProxyResponse> {
    if let Some(entry) = self.lookup(cache, key) {
      return Ok(ProxyResponse::from_cache(entry, route));
    }

    let response = self.fetcher.fetch(&Method::GET, url).await?;
    self.store(cache, key, &response);
    Ok(ProxyResponse::new(response, CacheSource::Network, Some(route)))
  }

  /// Storage read failures count as a miss.
  fn lookup(&self, cache: &str, key: &str) -> Option<CachedEntry> {
    match self.storage.match_entry(cache, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(cache, key, error = %e, "Cache lookup failed");
        None
      }
    }
  }

  /// Best-effort write; only successful responses are cached.
  fn store(&self, cache: &str, key: &str, response: &CachedResponse) {
    if !response.is_success() {
      debug!(cache, key, status = response.status, "Not caching unsuccessful response");
      return;
    }
    if let Err(e) = self.storage.put_entry(cache, key, response) {
      warn!(cache, key, error = %e, "Failed to write cache entry");
    }
  }

  /// Pre-cache the app shell into the current generation.
  ///
  /// All-or-nothing: if any resource cannot be fetched successfully nothing
  /// is written.
  pub async fn install(&self) -> Result<usize> {
    let cache = self.generation.tag();
    let mut entries = Vec::with_capacity(self.precache.len());

    for path in &self.precache {
      let url = self.resolve(path)?;
      let response = self.fetcher.fetch(&Method::GET, &url).await?;
      if !response.is_success() {
        return Err(Error::RemoteRejected {
          status: response.status,
          body: format!("precache of {} failed", url),
        });
      }
      let key = match classify(&url) {
        Route::Static => static_key(&url),
        _ => url.to_string(),
      };
      entries.push((key, response));
    }

    self.storage.put_all(&cache, &entries)?;
    debug!(cache = %cache, count = entries.len(), "Installed app shell");
    Ok(entries.len())
  }

  /// Delete every superseded cache.
  ///
  /// Older generations of the app content family are always removed. The
  /// third-party cache is removed when this generation is activated for the
  /// first time. Returns the deleted cache names.
  pub fn activate(&self) -> Result<Vec<String>> {
    let current = self.generation.tag();
    let fresh = self.storage.meta(ACTIVE_GENERATION)?.as_deref() != Some(current.as_str());

    let mut deleted = Vec::new();
    for name in self.storage.cache_names()? {
      let superseded = name != current && self.generation.owns(&name);
      let stale_third_party = fresh && name == self.third_party;
      if (superseded || stale_third_party) && self.storage.delete_cache(&name)? {
        deleted.push(name);
      }
    }

    self.storage.set_meta(ACTIVE_GENERATION, &current)?;
    debug!(generation = %current, fresh, deleted = ?deleted, "Activated cache generation");
    Ok(deleted)
  }
}

impl<S: CacheStorage, F: Fetcher> Clone for CacheProxy<S, F> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      fetcher: Arc::clone(&self.fetcher),
      origin: self.origin.clone(),
      generation: self.generation.clone(),
      third_party: self.third_party.clone(),
      precache: self.precache.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::proxy::storage::SqliteStorage;
  use async_trait::async_trait;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use std::sync::Mutex;

  /// In-memory network: a fixed set of URLs, switchable offline.
  #[derive(Default)]
  struct FakeNetwork {
    pages: Mutex<HashMap<String, CachedResponse>>,
    offline: AtomicBool,
    /// Number of upcoming fetches that fail even when online
    fail_next: AtomicUsize,
    calls: Mutex<Vec<(Method, String)>>,
  }

  impl FakeNetwork {
    fn serve(&self, url: &str, body: &str) {
      self.pages.lock().unwrap().insert(
        url.to_string(),
        CachedResponse {
          status: 200,
          headers: Vec::new(),
          body: body.as_bytes().to_vec(),
        },
      );
    }

    fn calls_to(&self, url: &str) -> usize {
      self
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, u)| u == url)
        .count()
    }
  }

  #[async_trait]
  impl Fetcher for Arc<FakeNetwork> {
    async fn fetch(&self, method: &Method, url: &Url) -> Result<CachedResponse> {
      self
        .calls
        .lock()
        .unwrap()
        .push((method.clone(), url.to_string()));
      if self.offline.load(Ordering::SeqCst) {
        return Err(Error::Network("offline".into()));
      }
      if self
        .fail_next
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
      {
        return Err(Error::Network("connection reset".into()));
      }
      Ok(
        self
          .pages
          .lock()
          .unwrap()
          .get(url.as_str())
          .cloned()
          .unwrap_or(CachedResponse {
            status: 404,
            headers: Vec::new(),
            body: Vec::new(),
          }),
      )
    }
  }

  fn proxy(version: u32) -> (Arc<FakeNetwork>, CacheProxy<SqliteStorage, Arc<FakeNetwork>>) {
    let network = Arc::new(FakeNetwork::default());
    let proxy = CacheProxy::new(
      SqliteStorage::open_in_memory().unwrap(),
      Arc::clone(&network),
      Url::parse("http://localhost:8000/").unwrap(),
      Generation::new("mws-restaurant", version),
    );
    (network, proxy)
  }

  fn get(url: &str) -> ProxyRequest {
    ProxyRequest::get(Url::parse(url).unwrap())
  }

  #[tokio::test]
  async fn test_static_asset_cache_first_ignoring_query() {
    let (network, proxy) = proxy(1);
    network.serve("http://localhost:8000/css/styles.css?v=1", "body{}");

    let first = proxy
      .handle(&get("http://localhost:8000/css/styles.css?v=1"))
      .await
      .unwrap();
    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(first.route, Some(Route::Static));
    assert!(first.cached_at.is_none());

    network.offline.store(true, Ordering::SeqCst);
    let second = proxy
      .handle(&get("http://localhost:8000/css/styles.css?v=2"))
      .await
      .unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.response.body, b"body{}");
    let cached_at = second.cached_at.expect("cache hit carries its timestamp");
    assert!(cached_at <= chrono::Utc::now());
  }

  #[tokio::test]
  async fn test_static_asset_retries_once_on_failure() {
    let (network, proxy) = proxy(1);
    network.serve("http://localhost:8000/js/main.js", "main()");
    network.fail_next.store(1, Ordering::SeqCst);

    let served = proxy
      .handle(&get("http://localhost:8000/js/main.js"))
      .await
      .unwrap();
    assert_eq!(served.source, CacheSource::Network);
    assert_eq!(network.calls_to("http://localhost:8000/js/main.js"), 2);

    // The retried response was cached.
    let cached = proxy
      .storage()
      .match_entry("mws-restaurant-v1", "http://localhost:8000/js/main.js")
      .unwrap();
    assert!(cached.is_some());
  }

  #[tokio::test]
  async fn test_static_asset_offline_and_uncached_fails() {
    let (network, proxy) = proxy(1);
    network.offline.store(true, Ordering::SeqCst);
    let result = proxy.handle(&get("http://localhost:8000/img/1.jpg")).await;
    assert!(matches!(result, Err(Error::Network(_))));
  }

  #[tokio::test]
  async fn test_error_statuses_are_not_cached() {
    let (network, proxy) = proxy(1);
    let served = proxy
      .handle(&get("http://localhost:8000/missing.png"))
      .await
      .unwrap();
    assert_eq!(served.response.status, 404);
    assert!(proxy
      .storage()
      .entry_keys("mws-restaurant-v1")
      .unwrap()
      .is_empty());
    assert_eq!(network.calls_to("http://localhost:8000/missing.png"), 1);
  }

  #[tokio::test]
  async fn test_app_shell_serves_cache_and_refreshes() {
    let (network, proxy) = proxy(1);
    network.serve("http://localhost:8000/index.html", "v1");

    // Miss: fetched from network and cached.
    let first = proxy.handle(&get("http://localhost:8000/")).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);
    assert!(first.refresh.is_none());

    // Hit: cached copy served, refresh fetches the new version.
    network.serve("http://localhost:8000/index.html", "v2");
    let second = proxy
      .handle(&get("http://localhost:8000/index.html"))
      .await
      .unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.response.body, b"v1");
    second.refresh.unwrap().await.unwrap();

    let third = proxy.handle(&get("http://localhost:8000/")).await.unwrap();
    assert_eq!(third.response.body, b"v2");
    if let Some(refresh) = third.refresh {
      refresh.await.unwrap();
    }
  }

  #[tokio::test]
  async fn test_third_party_uses_separate_cache_and_empty_fallback() {
    let (network, proxy) = proxy(1);
    network.serve("https://maps.googleapis.com/maps/api/js?key=k", "maps");

    let served = proxy
      .handle(&get("https://maps.googleapis.com/maps/api/js?key=k"))
      .await
      .unwrap();
    assert_eq!(served.route, Some(Route::ThirdParty));
    assert_eq!(
      proxy.storage().entry_keys("GOOGLE_MAPS_CACHE").unwrap(),
      vec!["https://maps.googleapis.com/maps/api/js?key=k"]
    );
    assert!(proxy
      .storage()
      .entry_keys("mws-restaurant-v1")
      .unwrap()
      .is_empty());

    network.offline.store(true, Ordering::SeqCst);
    let tile = proxy
      .handle(&get("https://maps.gstatic.com/tile.png"))
      .await
      .unwrap();
    assert_eq!(tile.source, CacheSource::Fallback);
    assert_eq!(tile.response.status, 200);
    assert!(tile.response.body.is_empty());
  }

  #[tokio::test]
  async fn test_remote_api_and_non_get_bypass_cache() {
    let (network, proxy) = proxy(1);
    network.serve("http://localhost:1337/restaurants/7", "{}");

    for _ in 0..2 {
      let served = proxy
        .handle(&get("http://localhost:1337/restaurants/7"))
        .await
        .unwrap();
      assert_eq!(served.source, CacheSource::Network);
      assert_eq!(served.route, Some(Route::RemoteApi));
    }
    assert_eq!(network.calls_to("http://localhost:1337/restaurants/7"), 2);

    let put = ProxyRequest {
      method: Method::PUT,
      url: Url::parse("http://localhost:8000/css/styles.css").unwrap(),
    };
    let served = proxy.handle(&put).await.unwrap();
    assert_eq!(served.route, None);
    assert!(proxy.storage().cache_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let (network, proxy) = proxy(1);
    let proxy = proxy.with_precache(vec!["/index.html".into(), "/css/styles.css".into()]);
    network.serve("http://localhost:8000/index.html", "index");

    assert!(proxy.install().await.is_err());
    assert!(proxy.storage().cache_names().unwrap().is_empty());

    network.serve("http://localhost:8000/css/styles.css", "css");
    assert_eq!(proxy.install().await.unwrap(), 2);
    assert_eq!(
      proxy.storage().entry_keys("mws-restaurant-v1").unwrap(),
      vec![
        "http://localhost:8000/css/styles.css",
        "http://localhost:8000/index.html"
      ]
    );
  }

  #[tokio::test]
  async fn test_activate_removes_prior_generations() {
    let (_network, old) = proxy(2);
    let response = CachedResponse::empty();
    old.storage().put_entry("mws-restaurant-v2", "a", &response).unwrap();
    old.storage().put_entry("unrelated", "x", &response).unwrap();
    old.activate().unwrap();
    old.storage().put_entry("GOOGLE_MAPS_CACHE", "tile", &response).unwrap();

    // Same storage, next generation.
    let new = CacheProxy {
      generation: Generation::new("mws-restaurant", 3),
      ..old.clone()
    };
    new.storage().put_entry("mws-restaurant-v3", "b", &response).unwrap();

    let mut deleted = new.activate().unwrap();
    deleted.sort();
    assert_eq!(deleted, vec!["GOOGLE_MAPS_CACHE", "mws-restaurant-v2"]);
    assert_eq!(
      new.storage().cache_names().unwrap(),
      vec!["mws-restaurant-v3", "unrelated"]
    );
    assert!(new.storage().entry_keys("mws-restaurant-v2").unwrap().is_empty());

    // Re-activating the same generation keeps the third-party cache.
    new.storage().put_entry("GOOGLE_MAPS_CACHE", "tile", &response).unwrap();
    assert!(new.activate().unwrap().is_empty());
    assert!(new
      .storage()
      .cache_names()
      .unwrap()
      .contains(&"GOOGLE_MAPS_CACHE".to_string()));
  }
}
