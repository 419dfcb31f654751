//! Versioned, additive schema for the local store.
//!
//! Each step only creates what is missing, so rerunning a step against a
//! store that already has the collection leaves its data untouched.

/// Logical name of the store, also used as the default file stem.
pub const STORE_NAME: &str = "mws-restaurant";

/// Highest schema version this build understands. Only ever increases.
pub const STORE_VERSION: u32 = 2;

/// Upgrade steps, applied in order for every version above the recorded one.
pub const MIGRATIONS: &[(u32, &str)] = &[
  (
    1,
    r#"
-- Restaurants keyed by their remote id
CREATE TABLE IF NOT EXISTS restaurants (
    key INTEGER PRIMARY KEY,
    data TEXT NOT NULL
);
"#,
  ),
  (
    2,
    r#"
CREATE TABLE IF NOT EXISTS restaurants (
    key INTEGER PRIMARY KEY,
    data TEXT NOT NULL
);

-- Server-confirmed reviews keyed by their remote id
CREATE TABLE IF NOT EXISTS reviews (
    key INTEGER PRIMARY KEY,
    data TEXT NOT NULL
);

-- Pending mutations; AUTOINCREMENT keeps keys monotonic even after deletes
CREATE TABLE IF NOT EXISTS dispatch_queue (
    key INTEGER PRIMARY KEY AUTOINCREMENT,
    data TEXT NOT NULL
);
"#,
  ),
];
