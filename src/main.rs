use anyhow::{Context, Result};
use ci_engine::{
    cli::{
        commands::{HistoryCommand, PlanCommand, RunCommand, ValidateCommand},
        output::*,
        Cli, Command,
    },
    core::{
        context::{merge_env, process_env},
        CancelCause, PipelineDefinition,
    },
    execution::{ExecutionEngine, ExecutionEvent},
    persistence::{PersistenceBackend, RunSummary},
    runner::{ActionPolicy, ShellRunner},
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Exit code for definition errors
const EXIT_INVALID: i32 = 2;

#[tokio::main]
async fn main() {
    let cli = Cli::from_args();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let code = match dispatch(&cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {:#}", CROSS, err);
            1
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: &Cli) -> Result<i32> {
    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd).await,
        Command::Validate(cmd) => validate_pipeline(cmd),
        Command::Plan(cmd) => show_plan(cmd),
        Command::History(cmd) => show_history(cmd).await,
    }
}

async fn run_pipeline(cmd: &RunCommand) -> Result<i32> {
    let mut definition = match PipelineDefinition::from_file(&cmd.file) {
        Ok(definition) => definition,
        Err(e) => {
            eprintln!("{} {}", CROSS, style(e).red());
            return Ok(EXIT_INVALID);
        }
    };
    if let Some(secs) = cmd.timeout_secs {
        definition.settings.timeout = Some(Duration::from_secs(secs));
    }

    let mut runner = ShellRunner::new();
    if let Some(dir) = &cmd.workdir {
        runner = runner.with_workdir(dir);
    }
    if cmd.stub_actions {
        runner = runner.with_action_policy(ActionPolicy::Stub);
    }

    let overrides: BTreeMap<String, String> = cmd.env.iter().cloned().collect();
    let engine = ExecutionEngine::new(runner, cmd.strategy())
        .with_base_env(merge_env([&process_env(), &overrides]));

    let cancel = engine.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling the run");
            cancel.cancel(CancelCause::Aborted);
        }
    });

    let progress = (!cmd.json).then(|| create_progress_bar(definition.instance_count()));
    if let Some(progress) = progress.clone() {
        engine.add_event_handler(move |event| match &event {
            ExecutionEvent::StepStarted { job, step } => {
                progress.set_message(format!("{} / {}", job, step));
            }
            ExecutionEvent::JobSkipped { .. } | ExecutionEvent::JobFinished { .. } => {
                progress.inc(1);
                progress.println(format_execution_event(&event));
            }
            ExecutionEvent::StepRetrying { .. } | ExecutionEvent::PipelineStarted { .. } => {
                progress.println(format_execution_event(&event));
            }
            _ => {}
        });
    }

    let event = cmd.event_context();
    let report = engine
        .execute(&definition, &event)
        .await
        .context("Pipeline run failed")?;

    if let Some(progress) = progress {
        progress.finish_and_clear();
    }

    if !cmd.no_history {
        match open_store().await {
            Ok(store) => {
                if let Err(e) = store.save_run(&RunSummary::from_report(&report)).await {
                    warn!("Failed to save run to history: {:#}", e);
                }
            }
            Err(e) => warn!("Run history unavailable: {:#}", e),
        }
    }

    if cmd.json {
        println!("{}", report.to_json()?);
    } else {
        println!("{}", format_report(&report));
    }

    Ok(report.exit_code())
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<i32> {
    match PipelineDefinition::from_file(&cmd.file) {
        Ok(definition) => {
            if cmd.json {
                let data = serde_json::json!({
                    "valid": true,
                    "name": definition.name,
                    "jobs": definition.jobs.len(),
                    "instances": definition.instance_count(),
                    "gate": definition.gate.as_ref().map(|g| g.name()),
                });
                println!("{}", serde_json::to_string_pretty(&data)?);
            } else {
                println!("{} Pipeline definition is valid!", CHECK);
                println!("  Name: {}", style(&definition.name).bold());
                println!("  Jobs: {}", style(definition.jobs.len()).cyan());
                println!("  Instances: {}", style(definition.instance_count()).cyan());
                println!("  Layers: {}", style(definition.graph.layers().len()).cyan());
            }
            Ok(0)
        }
        Err(e) => {
            if cmd.json {
                let data = serde_json::json!({ "valid": false, "error": e.to_string() });
                println!("{}", serde_json::to_string_pretty(&data)?);
            } else {
                println!("{} Validation failed:", CROSS);
                println!("  {}", style(e).red());
            }
            Ok(EXIT_INVALID)
        }
    }
}

fn show_plan(cmd: &PlanCommand) -> Result<i32> {
    let definition = match PipelineDefinition::from_file(&cmd.file) {
        Ok(definition) => definition,
        Err(e) => {
            eprintln!("{} {}", CROSS, style(e).red());
            return Ok(EXIT_INVALID);
        }
    };

    if cmd.json {
        let layers: Vec<Vec<serde_json::Value>> = definition
            .graph
            .layers()
            .iter()
            .map(|layer| {
                layer
                    .iter()
                    .filter_map(|name| definition.job(name))
                    .map(|job| {
                        let instances: Vec<String> =
                            job.instances().into_iter().map(|i| i.display_name).collect();
                        serde_json::json!({ "job": job.name, "needs": job.needs, "instances": instances })
                    })
                    .collect()
            })
            .collect();
        let data = serde_json::json!({
            "pipeline": definition.name,
            "layers": layers,
            "gate": definition.gate.as_ref().map(|g| serde_json::json!({ "name": g.name(), "needs": g.needs() })),
        });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        print!("{}", format_plan(&definition));
    }
    Ok(0)
}

async fn show_history(cmd: &HistoryCommand) -> Result<i32> {
    let store = open_store().await?;

    if let Some(id) = &cmd.run_id {
        let run_id = uuid::Uuid::parse_str(id).context("Invalid run ID format")?;
        match store.load_run(run_id).await? {
            Some(summary) if cmd.json => println!("{}", serde_json::to_string_pretty(&summary)?),
            Some(summary) => println!("{}", format_run_summary(&summary)),
            None => println!("{} Run not found", WARN),
        }
        return Ok(0);
    }

    let runs = store.list_runs(cmd.pipeline.as_deref(), cmd.limit).await?;
    if cmd.json {
        let data = serde_json::json!({ "runs": runs });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else if runs.is_empty() {
        println!("{} No runs found", INFO);
    } else {
        println!("{} Run history (latest {}):", INFO, cmd.limit);
        for summary in &runs {
            println!("  {}", format_run_summary(summary));
        }
    }
    Ok(0)
}

#[cfg(feature = "sqlite")]
async fn open_store() -> Result<Arc<dyn PersistenceBackend>> {
    let store = ci_engine::persistence::SqliteRunStore::with_default_path().await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn open_store() -> Result<Arc<dyn PersistenceBackend>> {
    Ok(Arc::new(ci_engine::persistence::InMemoryPersistence::new()))
}
