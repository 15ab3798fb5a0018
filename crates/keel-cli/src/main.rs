use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;
mod exit;

use commands::render::ManifestOrder;
use commands::{ApplyArgs, OutputFormat, StateArgs, ValuesArgs};

#[derive(Parser)]
#[command(
    name = "keel",
    about = "Keel: templated multi-service releases and build/deploy pipelines",
    version,
    propagate_version = true
)]
struct Cli {
    /// Log format on stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a chart to a manifest on stdout
    Render {
        /// Chart directory
        chart: PathBuf,
        #[command(flatten)]
        values: ValuesArgs,
        /// Release name visible to templates (default: chart name)
        #[arg(long)]
        release: Option<String>,
        #[arg(short, long, default_value = "default")]
        namespace: String,
        /// Print resources in apply order instead of declaration order
        #[arg(long)]
        apply_order: bool,
        /// Print resources in teardown order: referrers before what they reference
        #[arg(long, conflicts_with = "apply_order")]
        teardown_order: bool,
    },
    /// Install or upgrade a release
    Apply {
        /// Release name
        release: String,
        /// Chart directory
        chart: PathBuf,
        #[command(flatten)]
        values: ValuesArgs,
        #[arg(short, long, default_value = "default")]
        namespace: String,
        #[command(flatten)]
        state: StateArgs,
        #[command(flatten)]
        apply: ApplyArgs,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Re-apply a previous revision as a new revision
    Rollback {
        release: String,
        /// Revision to roll back to
        revision: u64,
        #[command(flatten)]
        state: StateArgs,
        #[command(flatten)]
        apply: ApplyArgs,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// List the revisions of a release, most recent first
    History {
        release: String,
        #[command(flatten)]
        state: StateArgs,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Show one revision (default: current) with its apply outcome
    Status {
        release: String,
        #[arg(long)]
        revision: Option<u64>,
        #[command(flatten)]
        state: StateArgs,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Build/deploy pipelines
    Pipeline {
        #[command(subcommand)]
        action: PipelineAction,
    },
}

#[derive(Subcommand)]
enum PipelineAction {
    /// Run the pipeline once
    Run {
        /// Pipeline definition
        #[arg(short, long, default_value = "keel-pipeline.toml")]
        file: PathBuf,
        /// Git ref of the triggering push; omit for a manual run
        #[arg(long = "ref", requires = "commit")]
        ref_name: Option<String>,
        /// Commit of the triggering push
        #[arg(long, requires = "ref_name")]
        commit: Option<String>,
        /// Who started a manual run
        #[arg(long, env = "USER", default_value = "unknown")]
        actor: String,
        #[command(flatten)]
        state: StateArgs,
        #[command(flatten)]
        apply: ApplyArgs,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

fn init_logging(format: LogFormat) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new("keel=info")?,
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_logging(cli.log_format) {
        eprintln!("error: {err}");
        return ExitCode::from(exit::USAGE);
    }

    match run(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(exit::code_for(&err))
        }
    }
}

async fn run(command: Commands) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Render {
            chart,
            values,
            release,
            namespace,
            apply_order,
            teardown_order,
        } => {
            let order = match (apply_order, teardown_order) {
                (true, _) => ManifestOrder::Apply,
                (_, true) => ManifestOrder::Teardown,
                _ => ManifestOrder::Declared,
            };
            commands::render::render(&chart, &values, release.as_deref(), &namespace, order)
        }
        Commands::Apply {
            release,
            chart,
            values,
            namespace,
            state,
            apply,
            format,
        } => {
            commands::release::apply(&release, &chart, &values, &namespace, &state, &apply, format)
                .await
        }
        Commands::Rollback {
            release,
            revision,
            state,
            apply,
            format,
        } => commands::release::rollback(&release, revision, &state, &apply, format).await,
        Commands::History {
            release,
            state,
            format,
        } => commands::release::history(&release, &state, format),
        Commands::Status {
            release,
            revision,
            state,
            format,
        } => commands::release::status(&release, revision, &state, format),
        Commands::Pipeline { action } => match action {
            PipelineAction::Run {
                file,
                ref_name,
                commit,
                actor,
                state,
                apply,
                format,
            } => {
                let trigger = match (ref_name, commit) {
                    (Some(ref_name), Some(commit)) => {
                        keel_pipeline::Trigger::Event { ref_name, commit }
                    }
                    _ => keel_pipeline::Trigger::Manual { actor },
                };
                commands::pipeline::run(&file, trigger, &state, &apply, format).await
            }
        },
    }
}
