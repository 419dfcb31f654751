//! Synchronization trigger: decides when a replay pass should run.
//!
//! Callers register a tag whenever they queue work. The trigger wakes on a
//! registration or on a periodic probe tick, checks connectivity, and hands
//! each pending tag to the [`SyncHandler`]. While online, every tick also asks
//! the handler whether retryable work is left and fires [`CONNECTIVITY`] if so,
//! which covers entries retained by a failed pass and entries queued by other
//! processes.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::dispatch::{Dispatcher, QueueBackend, QueuedAction};
use crate::error::Result;
use crate::gateway::RemoteGateway;

/// Tag used when the trigger fires without a registration.
pub const CONNECTIVITY: &str = "connectivity";

/// Reports whether the remote service is reachable.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
  async fn is_online(&self) -> bool;
}

/// Invoked with a tag when a synchronization opportunity arises.
#[async_trait]
pub trait SyncHandler: Send + Sync {
  /// Returns `true` when nothing retryable is left, which clears the tag.
  async fn on_sync(&self, tag: &str) -> Result<bool>;

  /// Whether durable work is waiting, registered or not.
  async fn has_pending(&self) -> Result<bool>;
}

#[async_trait]
impl<G, Q> SyncHandler for Dispatcher<G, Q>
where
  G: RemoteGateway,
  Q: QueueBackend,
{
  async fn on_sync(&self, tag: &str) -> Result<bool> {
    debug!(tag, "Sync opportunity");
    let report = self.replay().await?;
    // Unrecognized entries cannot succeed on retry and do not hold the tag.
    Ok(report.retained.is_empty())
  }

  async fn has_pending(&self) -> Result<bool> {
    Ok(
      self
        .pending()?
        .iter()
        .any(|entry| matches!(entry.action, QueuedAction::Known(_))),
    )
  }
}

type PendingTags = Arc<Mutex<BTreeSet<String>>>;

/// Handle for requesting synchronization opportunities.
#[derive(Clone)]
pub struct SyncRegistration {
  pending: PendingTags,
  wake: mpsc::UnboundedSender<()>,
}

impl SyncRegistration {
  /// Record a pending tag and wake the trigger.
  pub fn register(&self, tag: &str) {
    if let Ok(mut pending) = self.pending.lock() {
      pending.insert(tag.to_string());
    }
    debug!(tag, "Registered sync");
    // No receiver means no trigger is running; the tag is still recorded.
    let _ = self.wake.send(());
  }

  pub fn pending_tags(&self) -> Vec<String> {
    self
      .pending
      .lock()
      .map(|pending| pending.iter().cloned().collect())
      .unwrap_or_default()
  }
}

/// Event source driving the synchronization handler.
///
/// Holds only the receiving end of the wake channel, so once every
/// [`SyncRegistration`] is dropped the trigger keeps running on ticks alone.
pub struct SyncTrigger<P: ConnectivityProbe> {
  probe: Arc<P>,
  pending: PendingTags,
  wake: mpsc::UnboundedReceiver<()>,
  interval: Duration,
  /// Last observed connectivity, `None` before the first probe
  online: Option<bool>,
}

impl<P: ConnectivityProbe> SyncTrigger<P> {
  pub fn new(probe: Arc<P>, interval: Duration) -> (Self, SyncRegistration) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending: PendingTags = Arc::new(Mutex::new(BTreeSet::new()));
    let trigger = Self {
      probe,
      pending: Arc::clone(&pending),
      wake: rx,
      interval,
      online: None,
    };
    (trigger, SyncRegistration { pending, wake: tx })
  }

  /// Probe connectivity and fire the handler for every pending tag.
  ///
  /// Pending tags are taken before the handler runs, so a registration made
  /// during the pass survives it. A tag whose pass left work behind is put
  /// back. With nothing registered, [`CONNECTIVITY`] fires on coming online
  /// and on any online step where the handler still has work. Returns the
  /// tags fired.
  pub async fn step<H: SyncHandler + ?Sized>(&mut self, handler: &H) -> Vec<String> {
    let online = self.probe.is_online().await;
    let came_online = online && self.online != Some(true);
    if self.online != Some(online) {
      info!(online, "Connectivity changed");
    }
    self.online = Some(online);
    if !online {
      return Vec::new();
    }

    let mut tags = self.take_pending();
    if tags.is_empty() && (came_online || self.has_pending(handler).await) {
      tags.push(CONNECTIVITY.to_string());
    }

    for tag in &tags {
      match handler.on_sync(tag).await {
        Ok(true) => {}
        Ok(false) => {
          debug!(tag = %tag, "Work left after sync, keeping tag");
          self.restore(tag);
        }
        Err(e) => {
          warn!(tag = %tag, error = %e, "Sync handler failed");
          self.restore(tag);
        }
      }
    }
    tags
  }

  /// Run until `shutdown` resolves.
  pub async fn run<H, S>(mut self, handler: &H, shutdown: S)
  where
    H: SyncHandler + ?Sized,
    S: Future<Output = ()>,
  {
    let mut tick = tokio::time::interval(self.interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tokio::pin!(shutdown);
    let mut registrations_open = true;

    loop {
      tokio::select! {
        _ = &mut shutdown => break,
        _ = tick.tick() => {}
        woke = self.wake.recv(), if registrations_open => {
          if woke.is_none() {
            debug!("All registrations dropped, continuing on ticks");
            registrations_open = false;
            continue;
          }
        }
      }
      self.step(handler).await;
    }
    debug!("Sync trigger stopped");
  }

  async fn has_pending<H: SyncHandler + ?Sized>(&self, handler: &H) -> bool {
    handler.has_pending().await.unwrap_or_else(|e| {
      warn!(error = %e, "Could not inspect queued work");
      false
    })
  }

  fn take_pending(&self) -> Vec<String> {
    self
      .pending
      .lock()
      .map(|mut pending| std::mem::take(&mut *pending).into_iter().collect())
      .unwrap_or_default()
  }

  /// Put a tag back without waking; the next tick retries it.
  fn restore(&self, tag: &str) {
    if let Ok(mut pending) = self.pending.lock() {
      pending.insert(tag.to_string());
    }
  }
}
