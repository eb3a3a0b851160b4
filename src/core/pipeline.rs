//! Pipeline domain model
//!
//! A [`PipelineDefinition`] is the validated, immutable form of a
//! [`PipelineConfig`]: conditions are parsed, matrix placeholders checked,
//! the dependency graph built and the gate folded into a single entity.

use crate::core::{
    config::{Backoff, GateRole, JobConfig, MatrixSpec, PipelineConfig, StepConfig, TriggerConfig},
    context::EventContext,
    error::ConfigError,
    expression::{Condition, Scope},
    graph::DependencyGraph,
    matrix::{self, Coordinate},
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

const DEFAULT_STEP_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_GRACE_PERIOD_SECS: u64 = 10;
const DEFAULT_CONCURRENCY: usize = 4;

/// Retry policy for network-sensitive steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(1000),
            backoff: Backoff::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential => self
                .delay
                .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1))),
        }
    }
}

/// Engine settings resolved from the `defaults` block
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub concurrency: usize,
    /// Pipeline-wide timeout
    pub timeout: Option<Duration>,
    pub step_timeout: Duration,
    pub grace_period: Duration,
    pub retry: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout: None,
            step_timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS),
            grace_period: Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS),
            retry: RetryPolicy::default(),
        }
    }
}

/// What a step does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Shell command
    Run(String),
    /// External action with inputs
    Uses {
        action: String,
        with: BTreeMap<String, String>,
    },
}

/// A step of a job template
#[derive(Debug, Clone)]
pub struct StepTemplate {
    pub name: String,
    pub action: StepAction,
    pub condition: Option<Condition>,
    pub env: BTreeMap<String, String>,
    pub continue_on_error: bool,
    pub network: bool,
    pub timeout: Option<Duration>,
    pub cache_key: Option<String>,
    pub working_directory: Option<String>,
}

impl StepTemplate {
    fn from_config(config: &StepConfig, scope: &Scope, job: &str) -> Result<Self, ConfigError> {
        let action = match (&config.run, &config.uses) {
            (Some(run), None) => StepAction::Run(run.clone()),
            (None, Some(uses)) => StepAction::Uses {
                action: uses.clone(),
                with: config.with_as_string_map(),
            },
            _ => {
                return Err(ConfigError::InvalidStep {
                    job: job.to_string(),
                    index: 0,
                })
            }
        };

        let name = config.name.clone().unwrap_or_else(|| match &action {
            StepAction::Run(cmd) => format!("Run {}", cmd.lines().next().unwrap_or_default()),
            StepAction::Uses { action, .. } => format!("Run {}", action),
        });

        let step = Self {
            condition: parse_condition(config.condition.as_deref(), scope)?,
            env: config.env_as_string_map(),
            continue_on_error: config.continue_on_error,
            network: config.network,
            timeout: config.timeout_secs.map(Duration::from_secs),
            cache_key: config.cache_key.clone(),
            working_directory: config.working_directory.clone(),
            name,
            action,
        };
        step.check_placeholders(job, &scope.axes)?;
        Ok(step)
    }

    fn templated_fields(&self) -> Vec<&str> {
        let mut fields = vec![self.name.as_str()];
        match &self.action {
            StepAction::Run(cmd) => fields.push(cmd),
            StepAction::Uses { action, with } => {
                fields.push(action);
                fields.extend(with.values().map(String::as_str));
            }
        }
        fields.extend(self.env.values().map(String::as_str));
        fields.extend(self.cache_key.as_deref());
        fields.extend(self.working_directory.as_deref());
        fields
    }

    fn check_placeholders(&self, job: &str, axes: &BTreeSet<String>) -> Result<(), ConfigError> {
        for field in self.templated_fields() {
            matrix::check_placeholders(job, field, axes)?;
        }
        Ok(())
    }

    /// Copy with matrix placeholders substituted
    fn bind(&self, coordinate: &Coordinate) -> Self {
        let sub = |s: &String| matrix::substitute(s, coordinate);
        Self {
            name: sub(&self.name),
            action: match &self.action {
                StepAction::Run(cmd) => StepAction::Run(sub(cmd)),
                StepAction::Uses { action, with } => StepAction::Uses {
                    action: sub(action),
                    with: with.iter().map(|(k, v)| (k.clone(), sub(v))).collect(),
                },
            },
            condition: self.condition.clone(),
            env: self.env.iter().map(|(k, v)| (k.clone(), sub(v))).collect(),
            continue_on_error: self.continue_on_error,
            network: self.network,
            timeout: self.timeout,
            cache_key: self.cache_key.as_ref().map(sub),
            working_directory: self.working_directory.as_ref().map(sub),
        }
    }
}

/// A job as declared, before matrix expansion
#[derive(Debug, Clone)]
pub struct JobTemplate {
    pub name: String,
    pub condition: Option<Condition>,
    pub runs_on: Option<String>,
    pub matrix: MatrixSpec,
    pub fail_fast: bool,
    pub needs: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub steps: Vec<StepTemplate>,
    pub timeout: Option<Duration>,
    pub gate_role: Option<GateRole>,
}

impl JobTemplate {
    fn from_config(config: &JobConfig, jobs: &BTreeSet<String>) -> Result<Self, ConfigError> {
        let matrix = config.matrix()?;
        let scope = Scope {
            label: format!("job '{}'", config.name),
            axes: matrix::declared_axes(&matrix),
            needs: config.needs.iter().cloned().collect(),
            jobs: jobs.clone(),
        };

        let env = config.env_as_string_map();
        for field in config.runs_on.iter().chain(env.values()) {
            matrix::check_placeholders(&config.name, field, &scope.axes)?;
        }

        let steps = config
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| {
                let step_scope = Scope {
                    label: format!("step {} of job '{}'", index, config.name),
                    ..scope.clone()
                };
                StepTemplate::from_config(step, &step_scope, &config.name).map_err(|e| match e {
                    ConfigError::InvalidStep { job, .. } => ConfigError::InvalidStep { job, index },
                    other => other,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: config.name.clone(),
            condition: parse_condition(config.condition.as_deref(), &scope)?,
            runs_on: config.runs_on.clone(),
            fail_fast: config.fail_fast(),
            needs: config.needs.clone(),
            env,
            steps,
            timeout: config.timeout_secs.map(Duration::from_secs),
            gate_role: config.gate,
            matrix,
        })
    }

    /// Expand into concrete instances, one per matrix coordinate
    pub fn instances(&self) -> Vec<JobInstance> {
        matrix::expand(&self.matrix)
            .into_iter()
            .map(|coordinate| self.bind(coordinate))
            .collect()
    }

    fn bind(&self, coordinate: Coordinate) -> JobInstance {
        JobInstance {
            job: self.name.clone(),
            display_name: matrix::display_name(&self.name, &coordinate),
            runs_on: self
                .runs_on
                .as_ref()
                .map(|r| matrix::substitute(r, &coordinate)),
            env: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), matrix::substitute(v, &coordinate)))
                .collect(),
            steps: self.steps.iter().map(|s| s.bind(&coordinate)).collect(),
            coordinate,
        }
    }
}

/// A job template bound to one matrix coordinate
#[derive(Debug, Clone)]
pub struct JobInstance {
    pub job: String,
    pub coordinate: Coordinate,
    pub display_name: String,
    pub runs_on: Option<String>,
    pub env: BTreeMap<String, String>,
    pub steps: Vec<StepTemplate>,
}

/// The single logical gate of a pipeline
#[derive(Debug, Clone)]
pub enum Gate {
    /// `gate:` block
    Explicit {
        name: String,
        needs: Vec<String>,
        condition: Option<Condition>,
    },
    /// Two jobs marked `gate: success` and `gate: failure`, folded together
    Pair {
        success: String,
        failure: String,
        needs: Vec<String>,
    },
}

impl Gate {
    pub fn name(&self) -> &str {
        match self {
            Gate::Explicit { name, .. } => name,
            Gate::Pair { success, .. } => success,
        }
    }

    pub fn needs(&self) -> &[String] {
        match self {
            Gate::Explicit { needs, .. } | Gate::Pair { needs, .. } => needs,
        }
    }
}

/// Validated pipeline
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    pub name: String,
    triggers: Option<TriggerConfig>,
    pub env: BTreeMap<String, String>,
    pub settings: EngineSettings,
    pub jobs: Vec<JobTemplate>,
    pub graph: DependencyGraph,
    pub gate: Option<Gate>,
}

impl PipelineDefinition {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_config(&PipelineConfig::from_file(path)?)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Self::from_config(&PipelineConfig::from_yaml(yaml)?)
    }

    /// Build and validate the definition; nothing runs if this fails
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let graph = DependencyGraph::build(
            config
                .jobs
                .iter()
                .map(|j| (j.name.as_str(), j.needs.as_slice())),
        )?;

        let names: BTreeSet<String> = config.jobs.iter().map(|j| j.name.clone()).collect();
        let jobs = config
            .jobs
            .iter()
            .map(|j| JobTemplate::from_config(j, &names))
            .collect::<Result<Vec<_>, _>>()?;

        let gate = Self::fold_gate(config, &jobs, &names)?;

        Ok(Self {
            name: config.name.clone(),
            triggers: config.triggers.clone(),
            env: config.env_as_string_map(),
            settings: Self::settings(config),
            jobs,
            graph,
            gate,
        })
    }

    fn settings(config: &PipelineConfig) -> EngineSettings {
        let defaults = &config.defaults;
        let base = EngineSettings::default();
        EngineSettings {
            concurrency: defaults.concurrency.unwrap_or(base.concurrency).max(1),
            timeout: defaults.timeout_secs.map(Duration::from_secs),
            step_timeout: defaults
                .step_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(base.step_timeout),
            grace_period: defaults
                .grace_period_secs
                .map(Duration::from_secs)
                .unwrap_or(base.grace_period),
            retry: defaults
                .retry
                .as_ref()
                .map(|r| RetryPolicy {
                    max_attempts: r.max_attempts,
                    delay: Duration::from_millis(r.delay_ms),
                    backoff: r.backoff,
                })
                .unwrap_or(base.retry),
        }
    }

    /// Resolve the gate: an explicit block, a success/failure job pair, or none
    fn fold_gate(
        config: &PipelineConfig,
        jobs: &[JobTemplate],
        names: &BTreeSet<String>,
    ) -> Result<Option<Gate>, ConfigError> {
        let mut success = None;
        let mut failure = None;
        for job in jobs {
            let slot = match job.gate_role {
                Some(GateRole::Success) => &mut success,
                Some(GateRole::Failure) => &mut failure,
                None => continue,
            };
            if slot.is_some() {
                return Err(ConfigError::DuplicateGate(
                    job.gate_role.map(|r| r.to_string()).unwrap_or_default(),
                ));
            }
            *slot = Some(job);
        }

        if let Some(block) = &config.gate {
            if success.is_some() || failure.is_some() {
                return Err(ConfigError::AmbiguousGate);
            }
            for need in &block.needs {
                if !names.contains(need) {
                    return Err(ConfigError::UnknownDependency {
                        job: "gate".to_string(),
                        dependency: need.clone(),
                    });
                }
            }
            let scope = Scope {
                label: "gate".to_string(),
                axes: BTreeSet::new(),
                needs: block.needs.iter().cloned().collect(),
                jobs: names.clone(),
            };
            return Ok(Some(Gate::Explicit {
                name: block.name.clone().unwrap_or_else(|| "gate".to_string()),
                needs: block.needs.clone(),
                condition: parse_condition(block.condition.as_deref(), &scope)?,
            }));
        }

        match (success, failure) {
            (None, None) => Ok(None),
            (Some(_), None) => Err(ConfigError::IncompleteGate("success".to_string())),
            (None, Some(_)) => Err(ConfigError::IncompleteGate("failure".to_string())),
            (Some(s), Some(f)) => {
                let s_needs: BTreeSet<&String> = s.needs.iter().collect();
                let f_needs: BTreeSet<&String> = f.needs.iter().collect();
                if s_needs != f_needs {
                    return Err(ConfigError::GateNeedsMismatch {
                        success: s.name.clone(),
                        failure: f.name.clone(),
                    });
                }
                Ok(Some(Gate::Pair {
                    success: s.name.clone(),
                    failure: f.name.clone(),
                    needs: s.needs.clone(),
                }))
            }
        }
    }

    pub fn job(&self, name: &str) -> Option<&JobTemplate> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// Whether the event should start a run
    pub fn is_triggered_by(&self, event: &EventContext) -> bool {
        self.triggers.as_ref().map_or(true, |t| t.matches(event))
    }

    /// Total number of job instances after matrix expansion
    pub fn instance_count(&self) -> usize {
        self.jobs.iter().map(|j| j.instances().len()).sum()
    }
}

fn parse_condition(source: Option<&str>, scope: &Scope) -> Result<Option<Condition>, ConfigError> {
    let Some(source) = source else {
        return Ok(None);
    };
    let condition = Condition::parse(source).map_err(|e| relabel(e, &scope.label))?;
    condition.validate(scope)?;
    Ok(Some(condition))
}

/// Attach the location to errors raised by the expression parser
fn relabel(err: ConfigError, label: &str) -> ConfigError {
    match err {
        ConfigError::UnknownIdentifier { expr, ident, .. } => ConfigError::UnknownIdentifier {
            scope: label.to_string(),
            expr,
            ident,
        },
        ConfigError::UnknownFunction { expr, name, .. } => ConfigError::UnknownFunction {
            scope: label.to_string(),
            expr,
            name,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUST_ANALYZER_CI: &str = r#"
name: CI
on:
  pull_request:
  push:
    branches: [auto, try]
env:
  CARGO_INCREMENTAL: 0
  CI: 1
jobs:
  rust:
    if: github.repository == 'rust-lang/rust-analyzer'
    runs-on: ${{ matrix.os }}
    env:
      CC: deny_c
    strategy:
      fail-fast: false
      matrix:
        os: [ubuntu-latest, windows-latest, macos-latest]
    steps:
      - uses: actions/checkout@v4
      - name: Test on ${{ matrix.os }}
        run: cargo test
        network: true
  typescript:
    steps:
      - run: npm ci
  end-success:
    gate: success
    needs: [rust, typescript]
    if: github.event.pusher.name == 'bors' && success()
    steps:
      - run: exit 0
  end-failure:
    gate: failure
    needs: [typescript, rust]
    if: github.event.pusher.name == 'bors' && (failure() || cancelled())
    steps:
      - run: exit 1
"#;

    #[test]
    fn test_build_definition() {
        let def = PipelineDefinition::from_yaml(RUST_ANALYZER_CI).unwrap();
        assert_eq!(def.jobs.len(), 4);
        assert_eq!(def.graph.layer_of("end-success"), Some(1));
        assert_eq!(def.instance_count(), 6);

        match def.gate {
            Some(Gate::Pair { ref success, ref failure, .. }) => {
                assert_eq!(success, "end-success");
                assert_eq!(failure, "end-failure");
            }
            ref other => panic!("Expected gate pair, got {:?}", other),
        }
    }

    #[test]
    fn test_instances_bind_matrix_values() {
        let def = PipelineDefinition::from_yaml(RUST_ANALYZER_CI).unwrap();
        let instances = def.job("rust").unwrap().instances();
        assert_eq!(instances.len(), 3);
        assert_eq!(instances[1].display_name, "rust (os=windows-latest)");
        assert_eq!(instances[1].runs_on.as_deref(), Some("windows-latest"));
        assert_eq!(instances[1].steps[1].name, "Test on windows-latest");
        assert_eq!(instances[0].steps[0].name, "Run actions/checkout@v4");
    }

    #[test]
    fn test_gate_needs_mismatch() {
        let yaml = RUST_ANALYZER_CI.replace("needs: [typescript, rust]", "needs: [rust]");
        match PipelineDefinition::from_yaml(&yaml) {
            Err(ConfigError::GateNeedsMismatch { success, failure }) => {
                assert_eq!(success, "end-success");
                assert_eq!(failure, "end-failure");
            }
            other => panic!("Expected GateNeedsMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_incomplete_and_ambiguous_gate() {
        let yaml = r#"
jobs:
  a:
    steps: [ { run: "true" } ]
  done:
    gate: success
    needs: a
    steps: [ { run: "true" } ]
"#;
        assert!(matches!(
            PipelineDefinition::from_yaml(yaml),
            Err(ConfigError::IncompleteGate(_))
        ));

        let both = format!("gate:\n  needs: [a]\n{}", RUST_ANALYZER_CI.replace("name: CI\n", ""));
        assert!(matches!(
            PipelineDefinition::from_yaml(&both),
            Err(ConfigError::AmbiguousGate)
        ));
    }

    #[test]
    fn test_explicit_gate_block() {
        let yaml = r#"
gate:
  needs: [build]
  if: github.event.pusher.name == 'bors'
jobs:
  build:
    steps: [ { run: make } ]
"#;
        let def = PipelineDefinition::from_yaml(yaml).unwrap();
        match def.gate {
            Some(Gate::Explicit { ref needs, ref condition, .. }) => {
                assert_eq!(needs, &vec!["build".to_string()]);
                assert!(condition.is_some());
            }
            ref other => panic!("Expected explicit gate, got {:?}", other),
        }

        let unknown = yaml.replace("needs: [build]", "needs: [deploy]");
        assert!(matches!(
            PipelineDefinition::from_yaml(&unknown),
            Err(ConfigError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_condition_errors_name_location() {
        let yaml = r#"
jobs:
  a:
    steps: [ { run: "true" } ]
  b:
    needs: a
    if: needs.c.result == 'success'
    steps: [ { run: "true" } ]
"#;
        match PipelineDefinition::from_yaml(yaml) {
            Err(ConfigError::UnknownIdentifier { scope, ident, .. }) => {
                assert_eq!(scope, "job 'b'");
                assert_eq!(ident, "needs.c.result");
            }
            other => panic!("Expected UnknownIdentifier, got {:?}", other),
        }

        let bad_fn = yaml.replace("needs.c.result == 'success'", "hashFiles('x')");
        match PipelineDefinition::from_yaml(&bad_fn) {
            Err(ConfigError::UnknownFunction { scope, .. }) => assert_eq!(scope, "job 'b'"),
            other => panic!("Expected UnknownFunction, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_matrix_placeholder() {
        let yaml = r#"
jobs:
  build:
    strategy:
      matrix:
        os: [linux]
    steps:
      - run: cargo build --target ${{ matrix.target }}
"#;
        assert!(matches!(
            PipelineDefinition::from_yaml(yaml),
            Err(ConfigError::UnknownMatrixAxis { .. })
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let yaml = r#"
jobs:
  a:
    needs: b
    steps: [ { run: "true" } ]
  b:
    needs: a
    steps: [ { run: "true" } ]
"#;
        assert!(matches!(
            PipelineDefinition::from_yaml(yaml),
            Err(ConfigError::Cycle(_))
        ));
    }

    #[test]
    fn test_settings_and_retry_backoff() {
        let yaml = r#"
defaults:
  concurrency: 2
  timeout-secs: 60
  retry: { max-attempts: 4, delay-ms: 100, backoff: exponential }
jobs:
  a:
    steps: [ { run: "true" } ]
"#;
        let def = PipelineDefinition::from_yaml(yaml).unwrap();
        assert_eq!(def.settings.concurrency, 2);
        assert_eq!(def.settings.timeout, Some(Duration::from_secs(60)));
        assert_eq!(def.settings.retry.max_attempts, 4);
        assert_eq!(def.settings.retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(def.settings.retry.delay_for(3), Duration::from_millis(400));

        let fixed = RetryPolicy {
            backoff: Backoff::Fixed,
            ..def.settings.retry
        };
        assert_eq!(fixed.delay_for(3), Duration::from_millis(100));
    }

    #[test]
    fn test_triggers() {
        let def = PipelineDefinition::from_yaml(RUST_ANALYZER_CI).unwrap();
        assert!(def.is_triggered_by(&EventContext::new("push", "try", "bors")));
        assert!(!def.is_triggered_by(&EventContext::new("push", "master", "bors")));
    }
}
