//! Event context - metadata about what triggered a run

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Metadata describing the triggering event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventContext {
    /// Event type, e.g. `push` or `pull_request`
    pub event_name: String,

    /// Repository identifier, e.g. `rust-lang/rust-analyzer`
    pub repository: String,

    /// Full git ref, e.g. `refs/heads/auto`
    pub git_ref: String,

    /// Who triggered the run
    pub actor: String,

    /// Pusher identity for push events (defaults to the actor)
    pub pusher: String,
}

impl EventContext {
    /// Build a context from CLI-style inputs.
    ///
    /// A bare branch name is normalized to `refs/heads/<branch>`.
    pub fn new(event_name: &str, git_ref: &str, actor: &str) -> Self {
        let git_ref = if git_ref.starts_with("refs/") || git_ref.is_empty() {
            git_ref.to_string()
        } else {
            format!("refs/heads/{}", git_ref)
        };

        Self {
            event_name: event_name.to_string(),
            repository: String::new(),
            git_ref,
            actor: actor.to_string(),
            pusher: actor.to_string(),
        }
    }

    pub fn with_repository(mut self, repository: &str) -> Self {
        self.repository = repository.to_string();
        self
    }

    pub fn with_pusher(mut self, pusher: &str) -> Self {
        self.pusher = pusher.to_string();
        self
    }

    /// Short ref name: `refs/heads/auto` -> `auto`, `refs/tags/v1` -> `v1`
    pub fn ref_name(&self) -> &str {
        self.git_ref
            .strip_prefix("refs/heads/")
            .or_else(|| self.git_ref.strip_prefix("refs/tags/"))
            .unwrap_or(&self.git_ref)
    }
}

/// Merge environment layers, later layers shadowing earlier ones
pub fn merge_env<'a, I>(layers: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = &'a BTreeMap<String, String>>,
{
    let mut merged = BTreeMap::new();
    for layer in layers {
        for (key, value) in layer {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Snapshot of the current process environment.
///
/// Variables whose name or value is not valid UTF-8 are left out.
pub fn process_env() -> BTreeMap<String, String> {
    std::env::vars_os()
        .filter_map(|(key, value)| match (key.into_string(), value.into_string()) {
            (Ok(key), Ok(value)) => Some((key, value)),
            (Ok(key), Err(_)) => {
                warn!("Ignoring environment variable {} with a non-UTF-8 value", key);
                None
            }
            (Err(key), _) => {
                warn!("Ignoring environment variable {:?} with a non-UTF-8 name", key);
                None
            }
        })
        .collect()
}
