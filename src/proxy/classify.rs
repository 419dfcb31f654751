//! Routing of intercepted GET requests to a caching policy.

use url::Url;

/// Path of the single stale-while-revalidate resource.
pub const APP_SHELL: &str = "/index.html";

/// Path segments that identify remote API collections.
const API_COLLECTIONS: [&str; 2] = ["restaurants", "reviews"];

/// Caching policy for a request. First match wins, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
  /// `/` or `/index.html`: cache first, always refreshed in the background
  AppShell,
  /// Maps and fonts providers: cache first in a separate cache, empty
  /// response when unavailable
  ThirdParty,
  /// Restaurant and review endpoints: never intercepted
  RemoteApi,
  /// Everything else: cache first, query string ignored
  Static,
}

pub fn classify(url: &Url) -> Route {
  if url.path() == "/" || url.path() == APP_SHELL {
    Route::AppShell
  } else if is_third_party(url) {
    Route::ThirdParty
  } else if is_remote_api(url) {
    Route::RemoteApi
  } else {
    Route::Static
  }
}

/// `https://(maps|fonts).(googleapis|gstatic).com`
fn is_third_party(url: &Url) -> bool {
  if url.scheme() != "https" {
    return false;
  }
  let Some(host) = url.host_str() else {
    return false;
  };
  let mut labels = host.split('.');
  matches!(
    (labels.next(), labels.next(), labels.next(), labels.next()),
    (
      Some("maps" | "fonts"),
      Some("googleapis" | "gstatic"),
      Some("com"),
      None
    )
  )
}

fn is_remote_api(url: &Url) -> bool {
  matches!(url.scheme(), "http" | "https")
    && url
      .path_segments()
      .map(|mut segments| segments.any(|s| API_COLLECTIONS.contains(&s)))
      .unwrap_or(false)
}

/// Cache key for static assets: the URL without query string or fragment.
pub fn static_key(url: &Url) -> String {
  let mut key = url.clone();
  key.set_query(None);
  key.set_fragment(None);
  key.into()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_each_class_routes_to_one_policy() {
    let origin = url("http://localhost:8000/");
    let cases = [
      (origin.join("/index.html").unwrap(), Route::AppShell),
      (origin.join("/").unwrap(), Route::AppShell),
      (url("https://maps.googleapis.com/x"), Route::ThirdParty),
      (url("https://fonts.gstatic.com/s/roboto.woff2"), Route::ThirdParty),
      (url("http://localhost:1337/restaurants/7"), Route::RemoteApi),
      (url("http://localhost:1337/reviews/?restaurant_id=3"), Route::RemoteApi),
      (origin.join("/css/styles.css").unwrap(), Route::Static),
      (origin.join("/restaurant.html?id=4").unwrap(), Route::Static),
    ];

    for (target, expected) in cases {
      assert_eq!(classify(&target), expected, "{}", target);
      // Stable across repeated calls.
      assert_eq!(classify(&target), expected, "{}", target);
    }
  }

  #[test]
  fn test_third_party_requires_https_and_exact_host() {
    assert_eq!(classify(&url("http://maps.googleapis.com/x")), Route::Static);
    assert_eq!(
      classify(&url("https://evil.maps.googleapis.com.example/x")),
      Route::Static
    );
  }

  #[test]
  fn test_static_key_ignores_query_and_fragment() {
    let a = url("http://localhost:8000/restaurant.html?id=1#reviews");
    let b = url("http://localhost:8000/restaurant.html?id=2");
    assert_eq!(static_key(&a), static_key(&b));
    assert_eq!(static_key(&a), "http://localhost:8000/restaurant.html");
  }
}
