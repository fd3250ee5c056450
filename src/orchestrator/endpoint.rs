//! Process-wide choice between the primary and fallback model
//!
//! Rate limits apply to the shared account, so the choice is global rather
//! than per session. The flag is read and written without coordinating with
//! in-flight requests: a scheduled revert racing a new failover resolves
//! last-write-wins. This is best effort, not linearizable.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// Model endpoint in use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Primary,
    Fallback,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Primary => "primary",
            Endpoint::Fallback => "fallback",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failover flag with a scheduled revert to the primary endpoint
#[derive(Default)]
pub struct EndpointSelector {
    fallback_active: Arc<AtomicBool>,
    revert: Mutex<Option<JoinHandle<()>>>,
}

impl EndpointSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Endpoint {
        if self.fallback_active.load(Ordering::SeqCst) {
            Endpoint::Fallback
        } else {
            Endpoint::Primary
        }
    }

    /// Route traffic to the fallback endpoint for `hold`
    ///
    /// Replaces any revert scheduled by an earlier failover. Must be called
    /// from within a tokio runtime.
    pub fn fail_over(&self, hold: Duration) {
        self.fallback_active.store(true, Ordering::SeqCst);

        let flag = self.fallback_active.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(hold).await;
            flag.store(false, Ordering::SeqCst);
            info!("switching to primary model");
        });

        if let Some(previous) = self.replace_revert(Some(task)) {
            previous.abort();
        }
    }

    /// Cancel any pending revert and go back to the primary endpoint now
    pub fn reset(&self) {
        if let Some(previous) = self.replace_revert(None) {
            previous.abort();
        }
        self.fallback_active.store(false, Ordering::SeqCst);
    }

    fn replace_revert(&self, task: Option<JoinHandle<()>>) -> Option<JoinHandle<()>> {
        match self.revert.lock() {
            Ok(mut guard) => std::mem::replace(&mut *guard, task),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), task),
        }
    }
}

impl Drop for EndpointSelector {
    fn drop(&mut self) {
        if let Some(task) = self.replace_revert(None) {
            task.abort();
        }
    }
}
