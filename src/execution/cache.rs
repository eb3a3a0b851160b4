//! Shared step cache
//!
//! Steps carrying a `cache-key` run at most once per fingerprint across all
//! concurrently running jobs. Only successful results are stored; a failed
//! populator leaves the slot empty so the next caller runs the step itself.

use crate::core::{Outcome, StepAction, StepReason, StepResult};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::debug;

/// Fingerprint of a cacheable step: key, command and environment
pub fn fingerprint(key: &str, action: &StepAction, env: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update([0u8]);
    match action {
        StepAction::Run(cmd) => {
            hasher.update(b"run:");
            hasher.update(cmd.as_bytes());
        }
        StepAction::Uses { action, with } => {
            hasher.update(b"uses:");
            hasher.update(action.as_bytes());
            for (k, v) in with {
                hasher.update([0u8]);
                hasher.update(k.as_bytes());
                hasher.update(b"=");
                hasher.update(v.as_bytes());
            }
        }
    }
    for (k, v) in env {
        hasher.update([0u8]);
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Atomic get-or-populate store for step results
#[derive(Debug, Default)]
pub struct StepCache {
    entries: Mutex<HashMap<String, Arc<OnceCell<StepResult>>>>,
}

impl StepCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, fingerprint: &str) -> Arc<OnceCell<StepResult>> {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries
            .entry(fingerprint.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Return the cached result for `fingerprint`, or run `populate`.
    ///
    /// Concurrent callers for the same fingerprint wait for the one running
    /// the step. A restored result is marked with [`StepReason::CacheRestored`].
    pub async fn get_or_populate<F, Fut>(&self, fingerprint: &str, populate: F) -> StepResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StepResult>,
    {
        let slot = self.slot(fingerprint);
        let mut populated = false;
        let ran = &mut populated;

        let result = slot
            .get_or_try_init(move || async move {
                *ran = true;
                let result = populate().await;
                if result.outcome == Outcome::Success {
                    Ok(result)
                } else {
                    Err(result)
                }
            })
            .await;

        match result {
            Ok(cached) if !populated => {
                debug!("Restored step '{}' from cache", cached.name);
                StepResult {
                    reason: StepReason::CacheRestored,
                    attempts: 0,
                    ..cached.clone()
                }
            }
            Ok(fresh) => fresh.clone(),
            Err(failed) => failed,
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .map(|entries| entries.values().filter(|slot| slot.initialized()).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
