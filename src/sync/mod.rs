//! Offline mutation queue and the trigger that replays it.

pub mod dispatch;
pub mod trigger;

pub use dispatch::{
  DispatchAction, Dispatcher, QueueBackend, QueueEntry, QueuedAction, ReplayReport, ADD_REVIEW,
  TOGGLE_FAVORITE,
};
pub use trigger::{ConnectivityProbe, SyncHandler, SyncRegistration, SyncTrigger, CONNECTIVITY};
