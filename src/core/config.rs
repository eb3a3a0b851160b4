//! Pipeline configuration from YAML

use crate::core::{context::EventContext, error::ConfigError};
use regex::Regex;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

/// Top-level pipeline configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name
    #[serde(default = "default_pipeline_name")]
    pub name: String,

    /// Events that trigger the pipeline (absent = every event)
    #[serde(default, rename = "on")]
    pub triggers: Option<TriggerConfig>,

    /// Pipeline-level environment defaults
    #[serde(default)]
    env: BTreeMap<String, Value>,

    /// Engine defaults
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Single logical gate aggregating the pipeline verdict
    #[serde(default)]
    pub gate: Option<GateConfig>,

    /// Jobs in declaration order
    #[serde(
        deserialize_with = "deserialize_ordered_jobs",
        serialize_with = "serialize_ordered_jobs"
    )]
    pub jobs: Vec<JobConfig>,
}

fn default_pipeline_name() -> String {
    "pipeline".to_string()
}

/// `on:` accepts a single event, a list of events, or a mapping with filters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TriggerConfig {
    Single(String),
    List(Vec<String>),
    Map(BTreeMap<String, Option<EventFilter>>),
}

/// Branch filters for one event type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default)]
    pub branches: Vec<String>,

    #[serde(default, rename = "branches-ignore")]
    pub branches_ignore: Vec<String>,
}

impl TriggerConfig {
    /// Whether this event should start a run at all
    pub fn matches(&self, event: &EventContext) -> bool {
        match self {
            TriggerConfig::Single(name) => *name == event.event_name,
            TriggerConfig::List(names) => names.iter().any(|n| *n == event.event_name),
            TriggerConfig::Map(events) => match events.get(&event.event_name) {
                None => false,
                Some(None) => true,
                Some(Some(filter)) => filter.matches(event.ref_name()),
            },
        }
    }
}

impl EventFilter {
    fn matches(&self, branch: &str) -> bool {
        if !self.branches.is_empty() && !self.branches.iter().any(|p| branch_matches(p, branch)) {
            return false;
        }
        !self.branches_ignore.iter().any(|p| branch_matches(p, branch))
    }
}

/// Glob match for branch filters: `*` stays within a path segment, `**` crosses them
fn branch_matches(pattern: &str, branch: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == branch;
    }
    let escaped = regex::escape(pattern)
        .replace(r"\*\*", ".*")
        .replace(r"\*", "[^/]*");
    Regex::new(&format!("^{}$", escaped))
        .map(|re| re.is_match(branch))
        .unwrap_or(false)
}

/// Engine defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DefaultsConfig {
    /// Maximum number of job instances running at once
    #[serde(default)]
    pub concurrency: Option<usize>,

    /// Pipeline-wide timeout; expiry cancels the run
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Per-step timeout unless overridden
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,

    /// How long in-flight steps get to wind down after cancellation
    #[serde(default)]
    pub grace_period_secs: Option<u64>,

    /// Retry policy for network-sensitive steps
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    1000
}

/// Delay growth between attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Fixed,
    #[default]
    Exponential,
}

/// Explicit gate block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Display name of the gate
    #[serde(default)]
    pub name: Option<String>,

    /// Jobs whose outcomes decide the verdict
    #[serde(default, deserialize_with = "deserialize_one_or_many")]
    pub needs: Vec<String>,

    /// Activation condition; false means the run is a no-op for this event
    #[serde(default, rename = "if")]
    pub condition: Option<String>,
}

/// Which branch of a success/failure gate pair a job represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateRole {
    Success,
    Failure,
}

impl fmt::Display for GateRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateRole::Success => write!(f, "success"),
            GateRole::Failure => write!(f, "failure"),
        }
    }
}

/// Job configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Job name (the mapping key)
    #[serde(skip)]
    pub name: String,

    #[serde(default, rename = "if")]
    pub condition: Option<String>,

    /// Execution target selector
    #[serde(default, rename = "runs-on")]
    pub runs_on: Option<String>,

    #[serde(default, deserialize_with = "deserialize_one_or_many")]
    pub needs: Vec<String>,

    #[serde(default)]
    pub strategy: Option<StrategyConfig>,

    #[serde(default)]
    env: BTreeMap<String, Value>,

    #[serde(default)]
    pub steps: Vec<StepConfig>,

    #[serde(default, rename = "timeout-secs")]
    pub timeout_secs: Option<u64>,

    /// Marks this job as one branch of a legacy success/failure gate pair
    #[serde(default)]
    pub gate: Option<GateRole>,
}

/// Matrix strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default = "default_fail_fast", rename = "fail-fast")]
    pub fail_fast: bool,

    /// Axis name -> values, plus optional `include` / `exclude`
    #[serde(default)]
    pub matrix: Mapping,
}

fn default_fail_fast() -> bool {
    true
}

/// Matrix definition split into axes and adjustments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatrixSpec {
    /// Axes in declaration order
    pub axes: Vec<(String, Vec<String>)>,
    pub include: Vec<BTreeMap<String, String>>,
    pub exclude: Vec<BTreeMap<String, String>>,
}

/// Step configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StepConfig {
    #[serde(default)]
    pub name: Option<String>,

    /// Shell command
    #[serde(default)]
    pub run: Option<String>,

    /// External action reference
    #[serde(default)]
    pub uses: Option<String>,

    /// Action inputs
    #[serde(default)]
    with: BTreeMap<String, Value>,

    #[serde(default, rename = "if")]
    pub condition: Option<String>,

    #[serde(default)]
    env: BTreeMap<String, Value>,

    #[serde(default)]
    pub continue_on_error: bool,

    /// Network-sensitive steps are retried by policy
    #[serde(default)]
    pub network: bool,

    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Shared cache key; the step runs once per fingerprint
    #[serde(default)]
    pub cache_key: Option<String>,

    #[serde(default)]
    pub working_directory: Option<String>,
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse pipeline configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation; expressions and the dependency graph are
    /// checked when the definition is built
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for job in &self.jobs {
            if !seen.insert(&job.name) {
                return Err(ConfigError::DuplicateJob(job.name.clone()));
            }
            if job.steps.is_empty() {
                return Err(ConfigError::EmptyJob(job.name.clone()));
            }
            for (index, step) in job.steps.iter().enumerate() {
                if step.run.is_some() == step.uses.is_some() {
                    return Err(ConfigError::InvalidStep {
                        job: job.name.clone(),
                        index,
                    });
                }
            }
            job.matrix()?;
        }

        if let Some(retry) = &self.defaults.retry {
            if retry.max_attempts == 0 {
                return Err(ConfigError::InvalidRetry(
                    "max-attempts must be at least 1".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Pipeline environment as strings
    pub fn env_as_string_map(&self) -> BTreeMap<String, String> {
        stringify_map(&self.env)
    }

    /// Whether the event should start a run
    pub fn is_triggered_by(&self, event: &EventContext) -> bool {
        self.triggers.as_ref().map_or(true, |t| t.matches(event))
    }
}

impl JobConfig {
    pub fn env_as_string_map(&self) -> BTreeMap<String, String> {
        stringify_map(&self.env)
    }

    pub fn fail_fast(&self) -> bool {
        self.strategy.as_ref().map_or(true, |s| s.fail_fast)
    }

    /// Split the raw matrix mapping into axes, `include` and `exclude`
    pub fn matrix(&self) -> Result<MatrixSpec, ConfigError> {
        let mut spec = MatrixSpec::default();
        let Some(strategy) = &self.strategy else {
            return Ok(spec);
        };

        for (key, value) in &strategy.matrix {
            let key = key.as_str().ok_or_else(|| {
                self.invalid_matrix("axis names must be strings")
            })?;
            match key {
                "include" => spec.include = self.coordinates(value)?,
                "exclude" => spec.exclude = self.coordinates(value)?,
                axis => {
                    let values = value.as_sequence().ok_or_else(|| {
                        self.invalid_matrix(&format!("axis '{}' must be a list", axis))
                    })?;
                    spec.axes
                        .push((axis.to_string(), values.iter().map(stringify).collect()));
                }
            }
        }
        Ok(spec)
    }

    fn invalid_matrix(&self, message: &str) -> ConfigError {
        ConfigError::InvalidMatrix {
            job: self.name.clone(),
            message: message.to_string(),
        }
    }

    fn coordinates(&self, value: &Value) -> Result<Vec<BTreeMap<String, String>>, ConfigError> {
        let entries = value.as_sequence().ok_or_else(|| {
            self.invalid_matrix("include/exclude must be a list of mappings")
        })?;
        entries
            .iter()
            .map(|entry| {
                let map = entry.as_mapping().ok_or_else(|| {
                    self.invalid_matrix("include/exclude entries must be mappings")
                })?;
                Ok(map
                    .iter()
                    .map(|(k, v)| (stringify(k), stringify(v)))
                    .collect())
            })
            .collect()
    }
}

impl StepConfig {
    pub fn env_as_string_map(&self) -> BTreeMap<String, String> {
        stringify_map(&self.env)
    }

    pub fn with_as_string_map(&self) -> BTreeMap<String, String> {
        stringify_map(&self.with)
    }
}


/// Render a YAML scalar the way it would appear in a shell environment
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

fn stringify_map(map: &BTreeMap<String, Value>) -> BTreeMap<String, String> {
    map.iter().map(|(k, v)| (k.clone(), stringify(v))).collect()
}

fn deserialize_one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

/// Jobs are a YAML mapping; keep declaration order and move the key into `name`
fn deserialize_ordered_jobs<'de, D>(deserializer: D) -> Result<Vec<JobConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    struct JobsVisitor;

    impl<'de> Visitor<'de> for JobsVisitor {
        type Value = Vec<JobConfig>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a mapping of job name to job definition")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut jobs = Vec::new();
            while let Some((name, mut job)) = map.next_entry::<String, JobConfig>()? {
                job.name = name;
                jobs.push(job);
            }
            Ok(jobs)
        }
    }

    deserializer.deserialize_map(JobsVisitor)
}

fn serialize_ordered_jobs<S>(jobs: &[JobConfig], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut map = serializer.serialize_map(Some(jobs.len()))?;
    for job in jobs {
        map.serialize_entry(&job.name, job)?;
    }
    map.end()
}
