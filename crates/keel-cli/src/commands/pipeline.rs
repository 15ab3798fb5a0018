use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use keel_core::Chart;
use keel_pipeline::{
    CommandBuilder, EnvCredentialProvider, JobKind, Orchestrator, PipelineRun, PipelineSpec,
    RunFailure, Trigger,
};

use super::{
    ApplyArgs, OutputFormat, StateArgs, cancel_on_ctrl_c, load_environment, open_manager,
    print_json,
};
use crate::exit;

pub async fn run(
    file: &Path,
    trigger: Trigger,
    state: &StateArgs,
    apply: &ApplyArgs,
    format: OutputFormat,
) -> anyhow::Result<ExitCode> {
    let spec = PipelineSpec::from_file(file)?;
    let chart = Chart::from_dir(&spec.chart)?;
    let environment = load_environment(spec.environment.as_deref())?;
    let releases = Arc::new(open_manager(state, apply)?);

    let orchestrator = Orchestrator::new(
        spec,
        chart,
        environment,
        Arc::new(CommandBuilder),
        Arc::new(EnvCredentialProvider::new()),
        releases,
    );
    let run = orchestrator
        .run_with_cancel(trigger, cancel_on_ctrl_c())
        .await?;

    match format {
        OutputFormat::Json => print_json(&run)?,
        OutputFormat::Text => print_run(&run),
    }
    Ok(match &run.failure {
        None => ExitCode::SUCCESS,
        Some(failure) => ExitCode::from(exit::for_run_failure(failure)),
    })
}

fn print_run(run: &PipelineRun) {
    println!("pipeline {} run {} ({}): {:?}", run.pipeline, run.id, run.trigger, run.status);
    for job in &run.jobs {
        let detail = match (&job.kind, &job.image, job.revision, &job.error) {
            (_, _, _, Some(error)) => error.clone(),
            (JobKind::Build { .. }, Some(image), _, None) => image.to_string(),
            (JobKind::Deploy, _, Some(revision), None) => format!("revision {revision}"),
            _ => String::new(),
        };
        println!("  {:<24} {:<10} {}", job.id, job.status.to_string(), detail);
    }
    match &run.failure {
        Some(RunFailure::Build { services }) => {
            println!("  deploy skipped: builds failed for {}", services.join(", "))
        }
        Some(RunFailure::Cancelled) => println!("  cancelled"),
        _ => {}
    }
}
