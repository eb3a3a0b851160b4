//! Test: Definition errors - rejected before anything runs

use ci_engine::core::{ConfigError, PipelineDefinition};

#[test]
fn test_cycle_is_rejected_with_participants() {
    let yaml = r#"
jobs:
  a: { needs: c, steps: [ { run: a } ] }
  b: { needs: a, steps: [ { run: b } ] }
  c: { needs: b, steps: [ { run: c } ] }
  d: { steps: [ { run: d } ] }
"#;
    match PipelineDefinition::from_yaml(yaml) {
        Err(ConfigError::Cycle(cycle)) => {
            assert!(cycle.involves("a") && cycle.involves("b") && cycle.involves("c"));
            assert!(!cycle.involves("d"));
        }
        other => panic!("expected a cycle error, got {:?}", other.map(|d| d.name)),
    }
}

#[test]
fn test_unknown_dependency() {
    let yaml = r#"
jobs:
  test: { needs: build, steps: [ { run: test } ] }
"#;
    assert!(matches!(
        PipelineDefinition::from_yaml(yaml),
        Err(ConfigError::UnknownDependency { ref job, ref dependency }) if job == "test" && dependency == "build"
    ));
}

#[test]
fn test_condition_references_undeclared_need() {
    let yaml = r#"
jobs:
  build: { steps: [ { run: build } ] }
  lint: { steps: [ { run: lint } ] }
  deploy:
    needs: build
    if: needs.lint.result == 'success'
    steps: [ { run: deploy } ]
"#;
    assert!(matches!(
        PipelineDefinition::from_yaml(yaml),
        Err(ConfigError::UndeclaredNeed { ref job, .. }) if job == "lint"
    ));
}

#[test]
fn test_condition_syntax_error() {
    let yaml = r#"
jobs:
  build:
    if: github.ref == 'refs/heads/main' &&
    steps: [ { run: build } ]
"#;
    assert!(matches!(
        PipelineDefinition::from_yaml(yaml),
        Err(ConfigError::Syntax { .. })
    ));
}

#[test]
fn test_unknown_matrix_axis_in_placeholder() {
    let yaml = r#"
jobs:
  build:
    strategy:
      matrix:
        os: [linux]
    steps: [ { run: "build --target ${{ matrix.target }}" } ]
"#;
    assert!(matches!(
        PipelineDefinition::from_yaml(yaml),
        Err(ConfigError::UnknownMatrixAxis { ref axis, .. }) if axis == "target"
    ));
}

#[test]
fn test_gate_pair_needs_must_match() {
    let yaml = include_str!("../../demos/rust-analyzer-ci.yaml")
        .replace("needs: [typo-check, typescript, rust-cross, rust]", "needs: [rust]");
    assert!(matches!(
        PipelineDefinition::from_yaml(&yaml),
        Err(ConfigError::GateNeedsMismatch { .. })
    ));
}

#[test]
fn test_demo_pipeline_is_valid() {
    let def = PipelineDefinition::from_yaml(include_str!("../../demos/rust-analyzer-ci.yaml")).unwrap();
    assert_eq!(def.name, "CI");
    assert_eq!(def.instance_count(), 10);
    assert_eq!(def.graph.layers().len(), 2);
    assert_eq!(def.gate.as_ref().map(|g| g.needs().len()), Some(4));
}
