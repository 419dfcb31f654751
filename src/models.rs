//! Restaurant directory records as exchanged with the remote service and
//! persisted in the local store.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Photograph used when a restaurant has none.
const FALLBACK_IMAGE: &str = "/img/10.jpg";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
  pub lat: f64,
  pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Restaurant {
  pub id: i64,
  pub name: String,
  #[serde(default)]
  pub neighborhood: String,
  #[serde(default)]
  pub cuisine_type: String,
  #[serde(default)]
  pub address: String,
  pub latlng: Option<LatLng>,
  pub photograph: Option<String>,
  /// Day name to opening hours text
  #[serde(default)]
  pub operating_hours: BTreeMap<String, String>,
  /// The remote service stores this as text after a PUT, so both `true` and
  /// `"true"` are accepted.
  #[serde(default, deserialize_with = "deserialize_flag")]
  pub is_favorite: bool,
}

impl Restaurant {
  /// Relative link to the restaurant details page.
  pub fn details_url(&self) -> String {
    format!("./restaurant.html?id={}", self.id)
  }

  pub fn image_url(&self) -> String {
    match self.photograph.as_deref() {
      None | Some("") => FALLBACK_IMAGE.to_string(),
      Some(p) if p.ends_with(".jpg") => format!("/img/{}", p),
      Some(p) => format!("/img/{}.jpg", p),
    }
  }
}

fn deserialize_flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
  D: Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Flag {
    Bool(bool),
    Text(String),
  }

  Ok(match Option::<Flag>::deserialize(deserializer)? {
    Some(Flag::Bool(b)) => b,
    Some(Flag::Text(s)) => s.eq_ignore_ascii_case("true"),
    None => false,
  })
}

/// A review as confirmed by the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
  pub id: i64,
  pub restaurant_id: i64,
  pub name: String,
  pub rating: u8,
  #[serde(default)]
  pub comments: String,
  #[serde(
    rename = "createdAt",
    default,
    deserialize_with = "deserialize_timestamp",
    serialize_with = "serialize_timestamp"
  )]
  pub created_at: Option<DateTime<Utc>>,
}

/// Accepts epoch milliseconds or RFC 3339 text.
fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
  D: Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Raw {
    Millis(i64),
    Text(String),
  }

  match Option::<Raw>::deserialize(deserializer)? {
    None => Ok(None),
    Some(Raw::Millis(ms)) => Ok(Utc.timestamp_millis_opt(ms).single()),
    Some(Raw::Text(s)) => DateTime::parse_from_rfc3339(&s)
      .map(|dt| Some(dt.with_timezone(&Utc)))
      .map_err(serde::de::Error::custom),
  }
}

fn serialize_timestamp<S>(value: &Option<DateTime<Utc>>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
  S: Serializer,
{
  match value {
    Some(dt) => serializer.serialize_i64(dt.timestamp_millis()),
    None => serializer.serialize_none(),
  }
}

/// Review body posted to the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReview {
  pub restaurant_id: i64,
  pub name: String,
  pub rating: u8,
  pub comments: String,
}

impl NewReview {
  /// Reject payloads the remote would refuse, before they reach the queue.
  pub fn validate(&self) -> Result<()> {
    if self.restaurant_id <= 0 {
      return Err(Error::InvalidPayload(format!(
        "restaurant_id must be positive, got {}",
        self.restaurant_id
      )));
    }
    if self.name.trim().is_empty() {
      return Err(Error::InvalidPayload("reviewer name is required".into()));
    }
    if !(1..=5).contains(&self.rating) {
      return Err(Error::InvalidPayload(format!(
        "rating must be between 1 and 5, got {}",
        self.rating
      )));
    }
    if self.comments.trim().is_empty() {
      return Err(Error::InvalidPayload("review comments are required".into()));
    }
    Ok(())
  }
}

/// Distinct values in first-seen order.
pub(crate) fn distinct<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
  let mut out: Vec<String> = Vec::new();
  for v in values {
    if !out.iter().any(|seen| seen == v) {
      out.push(v.to_string());
    }
  }
  out
}
