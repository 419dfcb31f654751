//! Offline-tolerant client core for a restaurant directory service.
//!
//! Reads are served from a local SQLite store populated from the remote
//! gateway, static assets go through a tiered cache proxy, and favorite or
//! review mutations are queued durably and replayed when connectivity returns.

pub mod config;
pub mod db;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod models;
pub mod proxy;
pub mod sync;

pub use directory::RestaurantDirectory;
pub use error::{Error, Result};
