use std::path::Path;
use std::process::ExitCode;

use keel_core::Chart;
use keel_release::ReleaseError;
use keel_state::{ApplyRecord, Release, ResourceAction, Revision};
use serde_json::json;

use super::{
    ApplyArgs, OutputFormat, StateArgs, ValuesArgs, cancel_on_ctrl_c, load_overrides,
    open_manager, print_json,
};

pub async fn apply(
    name: &str,
    chart_dir: &Path,
    values: &ValuesArgs,
    namespace: &str,
    state: &StateArgs,
    apply: &ApplyArgs,
    format: OutputFormat,
) -> anyhow::Result<ExitCode> {
    let chart = Chart::from_dir(chart_dir)?;
    let overrides = load_overrides(values)?;
    let manager = open_manager(state, apply)?;
    let cancel = cancel_on_ctrl_c();

    let result = manager
        .upgrade(name, namespace, &chart, &overrides, &cancel)
        .await;
    report(result, format)
}

pub async fn rollback(
    name: &str,
    target: Revision,
    state: &StateArgs,
    apply: &ApplyArgs,
    format: OutputFormat,
) -> anyhow::Result<ExitCode> {
    let manager = open_manager(state, apply)?;
    let cancel = cancel_on_ctrl_c();
    let result = manager.rollback(name, target, &cancel).await;
    report(result, format)
}

pub fn history(name: &str, state: &StateArgs, format: OutputFormat) -> anyhow::Result<ExitCode> {
    let manager = open_manager(state, &default_apply())?;
    let history = manager.history(name)?;

    match format {
        OutputFormat::Json => {
            let rows: Vec<_> = history
                .iter()
                .map(|r| {
                    json!({
                        "revision": r.revision(),
                        "status": r.status,
                        "cause": r.record.cause.to_string(),
                        "chart": format!("{}-{}", r.record.chart.name, r.record.chart.version),
                        "appVersion": r.record.chart.app_version,
                        "digest": r.record.digest,
                        "createdAt": r.record.created_at,
                        "updatedAt": r.updated_at,
                    })
                })
                .collect();
            print_json(&rows)?;
        }
        OutputFormat::Text => {
            println!(
                "{:<9} {:<12} {:<22} {:<24} {}",
                "REVISION", "STATUS", "CAUSE", "CHART", "DIGEST"
            );
            for r in &history {
                println!(
                    "{:<9} {:<12} {:<22} {:<24} {}",
                    r.revision(),
                    r.status.label(),
                    r.record.cause.to_string(),
                    format!("{}-{}", r.record.chart.name, r.record.chart.version),
                    short_digest(&r.record.digest),
                );
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub fn status(
    name: &str,
    revision: Option<Revision>,
    state: &StateArgs,
    format: OutputFormat,
) -> anyhow::Result<ExitCode> {
    let manager = open_manager(state, &default_apply())?;
    let release = manager.get(name, revision)?;
    let log = manager.status_log(name, release.revision())?;

    match format {
        OutputFormat::Json => print_json(&json!({ "release": release, "log": log }))?,
        OutputFormat::Text => {
            print_release(&release);
            println!("  log:");
            for entry in &log {
                match &entry.note {
                    Some(note) => println!("    {:>10}  {}  ({note})", entry.at, entry.status),
                    None => println!("    {:>10}  {}", entry.at, entry.status),
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Print the outcome of an upgrade or rollback. An apply failure is printed
/// with its attribution, then returned for the exit code.
fn report(result: Result<Release, ReleaseError>, format: OutputFormat) -> anyhow::Result<ExitCode> {
    match result {
        Ok(release) => {
            match format {
                OutputFormat::Json => print_json(&release)?,
                OutputFormat::Text => print_release(&release),
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            if let ReleaseError::Apply {
                release,
                revision,
                outcome,
                ..
            } = &err
            {
                match format {
                    OutputFormat::Json => print_json(&json!({
                        "name": release,
                        "revision": revision,
                        "status": "failed",
                        "outcome": outcome,
                    }))?,
                    OutputFormat::Text => {
                        println!("{release} revision {revision}: failed");
                        print_outcome(outcome);
                    }
                }
            }
            Err(err.into())
        }
    }
}

fn print_release(release: &Release) {
    let record = &release.record;
    println!(
        "{} revision {}: {} ({})",
        record.name, record.revision, release.status, record.cause
    );
    println!(
        "  chart {}-{} (app {}), namespace {}, digest {}",
        record.chart.name,
        record.chart.version,
        record.chart.app_version,
        record.namespace,
        short_digest(&record.digest)
    );
    if let Some(outcome) = &release.outcome {
        print_outcome(outcome);
    }
}

fn print_outcome(outcome: &ApplyRecord) {
    for applied in &outcome.succeeded {
        match &applied.action {
            ResourceAction::Created => println!("  created    {}", applied.id),
            ResourceAction::Patched { fields } => {
                println!("  patched    {} [{}]", applied.id, fields.join(", "))
            }
            ResourceAction::Unchanged => println!("  unchanged  {}", applied.id),
        }
    }
    if let Some(failed) = &outcome.failed {
        println!("  failed     {}: {}", failed.id, failed.error);
    }
    for id in &outcome.not_attempted {
        println!("  skipped    {id}");
    }
    if !outcome.is_complete() {
        let total = outcome.succeeded.len()
            + usize::from(outcome.failed.is_some())
            + outcome.not_attempted.len();
        let reason = if outcome.cancelled { "cancelled" } else { "stopped" };
        println!("  {reason} after {} of {total} resources", outcome.succeeded.len());
    }
}

fn short_digest(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}

/// Read-only commands never apply; default timeouts are fine.
fn default_apply() -> ApplyArgs {
    ApplyArgs {
        call_timeout: 30,
        readiness_timeout: 300,
        poll_interval: 2,
    }
}
