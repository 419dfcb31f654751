//! Error taxonomy shared by the store, gateway, proxy and dispatch queue.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
  /// No persistent storage could be opened. Offline features are unusable,
  /// read-through network paths keep working.
  #[error("Local store unavailable: {0}")]
  StoreUnavailable(String),

  #[error("Store schema upgrade failed: {0}")]
  SchemaUpgrade(String),

  #[error("Not found: {0}")]
  NotFound(String),

  #[error("Network error: {0}")]
  Network(String),

  #[error("Remote rejected request with status {status}: {body}")]
  RemoteRejected { status: u16, body: String },

  /// A mutation payload failed validation before it reached the queue.
  #[error("Invalid payload: {0}")]
  InvalidPayload(String),

  #[error("Storage error: {0}")]
  Storage(#[from] rusqlite::Error),

  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl Error {
  /// Truncate a response body to avoid logging excessive data
  fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
      return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
      end -= 1;
    }
    format!(
      "{}... (truncated, {} total bytes)",
      &body[..end],
      body.len()
    )
  }

  pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
    Error::RemoteRejected {
      status: status.as_u16(),
      body: Self::truncate_body(body),
    }
  }

  /// True for failures that mean "the remote could not be reached", as opposed
  /// to the remote answering with a refusal.
  pub fn is_network(&self) -> bool {
    matches!(self, Error::Network(_))
  }
}

impl From<reqwest::Error> for Error {
  fn from(e: reqwest::Error) -> Self {
    Error::Network(e.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_from_status_keeps_short_body() {
    let err = Error::from_status(reqwest::StatusCode::BAD_REQUEST, "missing name");
    match err {
      Error::RemoteRejected { status, body } => {
        assert_eq!(status, 400);
        assert_eq!(body, "missing name");
      }
      other => panic!("unexpected error: {other:?}"),
    }
  }

  #[test]
  fn test_from_status_truncates_long_body() {
    let body = "x".repeat(MAX_ERROR_BODY_LENGTH + 20);
    let err = Error::from_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR, &body);
    let Error::RemoteRejected { body, .. } = err else {
      panic!("expected RemoteRejected");
    };
    assert!(body.starts_with(&"x".repeat(MAX_ERROR_BODY_LENGTH)));
    assert!(body.ends_with("(truncated, 520 total bytes)"));
  }

  #[test]
  fn test_is_network() {
    assert!(Error::Network("offline".into()).is_network());
    assert!(!Error::NotFound("restaurant 1".into()).is_network());
  }
}
