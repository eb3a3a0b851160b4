//! CLI output formatting

use crate::{
    core::{JobReason, Outcome, PipelineDefinition, StepReason, Verdict},
    execution::ExecutionEvent,
    persistence::RunSummary,
    report::{JobReport, PipelineReport},
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");
pub static STOP: Emoji<'_, '_> = Emoji("🛑 ", "x ");

/// Create a progress bar over job instances
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    if let Ok(template) =
        ProgressStyle::default_bar().template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        progress.set_style(template.progress_chars("#>-"));
    }
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

fn outcome_icon(outcome: Outcome) -> Emoji<'static, 'static> {
    match outcome {
        Outcome::Success => CHECK,
        Outcome::Failure => CROSS,
        Outcome::Skipped => SKIP,
        Outcome::Cancelled => STOP,
    }
}

/// Format an outcome for display
pub fn format_outcome(outcome: Outcome) -> String {
    match outcome {
        Outcome::Success => style("SUCCESS").green().to_string(),
        Outcome::Failure => style("FAILURE").red().to_string(),
        Outcome::Skipped => style("SKIPPED").dim().to_string(),
        Outcome::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

/// Format a verdict for display
pub fn format_verdict(verdict: Verdict) -> String {
    match verdict {
        Verdict::Success => style("SUCCESS").green().bold().to_string(),
        Verdict::Failure => style("FAILURE").red().bold().to_string(),
        Verdict::NoMatch => style("NO MATCH").blue().bold().to_string(),
    }
}

/// Human-readable job reason
pub fn format_reason(reason: &JobReason) -> String {
    match reason {
        JobReason::Completed => "completed".to_string(),
        JobReason::StepFailed { step, exit_code } => {
            format!("step '{}' exited with {}", step, exit_code)
        }
        JobReason::Timeout { step } => format!("step '{}' timed out", step),
        JobReason::RunnerError { step } => format!("step '{}' could not be run", step),
        JobReason::Cancelled { cause } => format!("cancelled ({:?})", cause),
        JobReason::ConditionFalse => "condition was false".to_string(),
        JobReason::UpstreamFailed { job } => format!("needed job '{}' failed", job),
        JobReason::UpstreamCancelled { job } => format!("needed job '{}' was cancelled", job),
        JobReason::EmptyMatrix => "matrix has no entries".to_string(),
        JobReason::Crashed => "worker crashed".to_string(),
    }
}

fn format_step_reason(reason: &StepReason) -> String {
    match reason {
        StepReason::Completed => "completed".to_string(),
        StepReason::ExitCode { code } => format!("exit code {}", code),
        StepReason::Timeout { after_secs } => format!("timed out after {}s", after_secs),
        StepReason::RunnerError { message } => message.clone(),
        StepReason::Cancelled { cause } => format!("cancelled ({:?})", cause),
        StepReason::ConditionFalse => "condition was false".to_string(),
        StepReason::Halted => "not run after earlier failure".to_string(),
        StepReason::CacheRestored => "restored from cache".to_string(),
    }
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::PipelineStarted {
            run_id,
            pipeline,
            instances,
        } => format!(
            "{} Starting pipeline {} ({}) with {} jobs",
            ROCKET,
            style(pipeline).bold(),
            style(&run_id.to_string()[..8]).dim(),
            instances
        ),
        ExecutionEvent::JobStarted { job } => format!("{} {}", SPINNER, style(job).cyan()),
        ExecutionEvent::JobSkipped { job, reason } => format!(
            "{} {} {}",
            SKIP,
            style(job).dim(),
            style(format!("({})", format_reason(reason))).dim()
        ),
        ExecutionEvent::StepStarted { job, step } => {
            format!("{} {} / {}", SPINNER, style(job).dim(), style(step).cyan())
        }
        ExecutionEvent::StepRetrying {
            job,
            step,
            attempt,
            max_attempts,
            delay,
        } => format!(
            "{} {} / {} (attempt {}/{} in {})",
            WARN,
            style(job).dim(),
            style(step).yellow(),
            attempt,
            max_attempts,
            format_duration(delay.as_millis() as u64)
        ),
        ExecutionEvent::StepFinished {
            job,
            step,
            outcome,
            duration_ms,
        } => format!(
            "{}{} / {} {}",
            outcome_icon(*outcome),
            style(job).dim(),
            step,
            style(format_duration(*duration_ms)).dim()
        ),
        ExecutionEvent::JobFinished {
            job,
            outcome,
            reason,
        } => match outcome {
            Outcome::Success => format!("{}{}", CHECK, style(job).green()),
            _ => format!(
                "{}{} {}",
                outcome_icon(*outcome),
                style(job).bold(),
                style(format!("({})", format_reason(reason))).dim()
            ),
        },
        ExecutionEvent::PipelineFinished { run_id, verdict } => format!(
            "{} Pipeline ({}) finished: {}",
            INFO,
            style(&run_id.to_string()[..8]).dim(),
            format_verdict(*verdict)
        ),
    }
}

/// One line per job instance, with failing step detail
pub fn format_job_report(job: &JobReport) -> String {
    let mut out = format!(
        "{}{} {} {}",
        outcome_icon(job.outcome),
        style(&job.display_name).bold(),
        format_outcome(job.outcome),
        style(format_duration(job.duration_ms)).dim()
    );
    if job.outcome != Outcome::Success {
        out.push_str(&format!("\n    {}", style(format_reason(&job.reason)).dim()));
    }
    if job.tolerated_failures > 0 {
        out.push_str(&format!(
            "\n    {} {} tolerated step failure(s)",
            WARN, job.tolerated_failures
        ));
    }
    for step in &job.steps {
        if step.outcome == Outcome::Failure {
            out.push_str(&format!(
                "\n    {}{} ({}, {} attempt(s))",
                CROSS,
                step.name,
                format_step_reason(&step.reason),
                step.attempts
            ));
            if !step.output.is_empty() {
                for line in format_output(&step.output, 10).lines() {
                    out.push_str(&format!("\n      {}", line));
                }
            }
        }
    }
    out
}

/// Render the final report for a terminal
pub fn format_report(report: &PipelineReport) -> String {
    let mut out = String::new();
    if !report.triggered {
        out.push_str(&format!(
            "{} Pipeline {} is not triggered by '{}' on {}\n",
            INFO,
            style(&report.pipeline).bold(),
            report.event.event_name,
            report.event.git_ref
        ));
    }
    for job in &report.jobs {
        out.push_str(&format_job_report(job));
        out.push('\n');
    }

    let gate = report.gate.as_deref().unwrap_or("all jobs");
    out.push_str(&format!(
        "\n{} {}: {} via {} ({} succeeded, {} failed, {} skipped, {} cancelled) in {}",
        INFO,
        style(&report.pipeline).bold(),
        format_verdict(report.verdict),
        style(gate).cyan(),
        report.count(Outcome::Success),
        report.count(Outcome::Failure),
        report.count(Outcome::Skipped),
        report.count(Outcome::Cancelled),
        format_duration(report.duration_ms())
    ));
    out
}

/// Render layers and instances of a definition
pub fn format_plan(definition: &PipelineDefinition) -> String {
    let mut out = format!("{} {}\n", INFO, style(&definition.name).bold());
    for (index, layer) in definition.graph.layers().iter().enumerate() {
        out.push_str(&format!("  {}\n", style(format!("Layer {}", index)).cyan()));
        for name in layer {
            let Some(job) = definition.job(name) else {
                continue;
            };
            let instances = job.instances();
            if instances.len() == 1 && instances[0].coordinate.is_empty() {
                out.push_str(&format!("    {}\n", name));
            } else {
                out.push_str(&format!("    {} ({} instances)\n", name, instances.len()));
                for instance in instances {
                    out.push_str(&format!("      {}\n", style(instance.display_name).dim()));
                }
            }
        }
    }
    if let Some(gate) = &definition.gate {
        out.push_str(&format!(
            "  {} {} over [{}]\n",
            style("Gate").cyan(),
            gate.name(),
            gate.needs().join(", ")
        ));
    }
    out
}

/// Format a stored run for display
pub fn format_run_summary(summary: &RunSummary) -> String {
    let icon = match summary.verdict {
        Verdict::Success => CHECK,
        Verdict::Failure => CROSS,
        Verdict::NoMatch => INFO,
    };
    format!(
        "{}{} - {} - {} {} @ {} - {} ({}/{} succeeded)",
        icon,
        style(&summary.run_id.to_string()[..8]).dim(),
        style(&summary.pipeline).bold(),
        summary.event_name,
        summary.git_ref,
        style(summary.started_at.format("%Y-%m-%d %H:%M:%S")).dim(),
        format_verdict(summary.verdict),
        summary.succeeded,
        summary.total()
    )
}

/// Format milliseconds compactly
pub fn format_duration(ms: u64) -> String {
    let secs = ms / 1000;
    if ms < 1000 {
        format!("{}ms", ms)
    } else if secs < 60 {
        format!("{}.{}s", secs, (ms % 1000) / 100)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

/// Keep the last `max_lines` lines of step output
pub fn format_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();

    if lines.len() <= max_lines {
        output.to_string()
    } else {
        let kept = lines[lines.len() - max_lines..].join("\n");
        format!(
            "{}\n{}",
            style(format!("... ({} earlier lines)", lines.len() - max_lines)).dim(),
            kept
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CancelCause;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(250), "250ms");
        assert_eq!(format_duration(2_500), "2.5s");
        assert_eq!(format_duration(125_000), "2m 5s");
        assert_eq!(format_duration(3_725_000), "1h 2m 5s");
    }

    #[test]
    fn test_format_reason() {
        assert_eq!(
            format_reason(&JobReason::StepFailed {
                step: "Test".to_string(),
                exit_code: 101
            }),
            "step 'Test' exited with 101"
        );
        assert_eq!(
            format_reason(&JobReason::Cancelled {
                cause: CancelCause::FailFast
            }),
            "cancelled (FailFast)"
        );
    }

    #[test]
    fn test_format_output_keeps_tail() {
        console::set_colors_enabled(false);
        let output = (1..=5).map(|i| format!("line {}", i)).collect::<Vec<_>>().join("\n");
        let formatted = format_output(&output, 2);
        assert!(formatted.starts_with("... (3 earlier lines)"));
        assert!(formatted.ends_with("line 4\nline 5"));
        assert_eq!(format_output("short", 2), "short");
    }

    #[test]
    fn test_format_plan_lists_instances() {
        console::set_colors_enabled(false);
        let def = PipelineDefinition::from_yaml(
            r#"
jobs:
  rust:
    strategy:
      matrix:
        os: [ubuntu, windows]
    steps: [ { run: cargo test } ]
  end:
    needs: rust
    steps: [ { run: "true" } ]
"#,
        )
        .unwrap();
        let plan = format_plan(&def);
        assert!(plan.contains("Layer 0"));
        assert!(plan.contains("rust (2 instances)"));
        assert!(plan.contains("rust (os=windows)"));
        assert!(plan.contains("Layer 1"));
    }
}
