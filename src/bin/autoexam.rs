//! AutoExam command-line client.
//!
//! Run with: cargo run --bin autoexam -- upload answers.csv --output graded.csv

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use autoexam::api::{ExamApiClient, ResultRecord};
use autoexam::validation::validate;
use autoexam::{AppError, ClientConfig, Session, UploadWorkflow, WorkflowEvent};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "autoexam", version, about = "Grade exam answer CSVs with the AutoExam backend")]
struct Cli {
    /// Backend origin, e.g. http://localhost:8000
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate, upload and grade a CSV
    Upload {
        file: PathBuf,
        /// Save the graded CSV here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show the current status of a job as JSON
    Status { id: String },
    /// Keep polling a job uploaded earlier
    Resume {
        id: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Download the graded CSV of a completed job
    Download {
        id: String,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// List previous uploads
    History,
    /// Check a CSV without uploading it
    Validate { file: PathBuf },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "autoexam=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            match err.downcast_ref::<AppError>() {
                Some(app) => {
                    let p = app.to_presentation();
                    eprintln!("{}: {}", p.title, p.message);
                    if let Some(action) = p.action {
                        eprintln!("  → {}", action);
                    }
                }
                None => eprintln!("error: {:#}", err),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(&cli)?;
    let session = Session::new(config)?;
    let interrupt = ctrl_c_token();

    match cli.command {
        Command::Validate { file } => {
            let result = validate(&file, session.config().max_file_size_bytes).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.ok {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Upload { file, output } => {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let workflow = session.workflow()?.with_events(tx);
            let bar = progress_bar()?;

            let job = drive(&workflow, workflow.run(&file), &mut rx, &bar, &interrupt).await?;
            bar.finish_with_message("Completed");
            finish(&workflow, job.result.as_ref(), &job.id, output.as_deref(), &interrupt).await?;
        }
        Command::Resume { id, output } => {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let workflow = session.workflow()?.with_events(tx);
            let bar = progress_bar()?;

            let job = drive(&workflow, workflow.resume(&id), &mut rx, &bar, &interrupt).await?;
            bar.finish_with_message("Completed");
            finish(&workflow, job.result.as_ref(), &job.id, output.as_deref(), &interrupt).await?;
        }
        Command::Status { id } => {
            let record = session.api_client()?.get_result(&id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Download { id, output } => {
            let workflow = session.workflow()?;
            let bytes = workflow.download_to(&id, &output, &interrupt).await?;
            println!("Saved {} ({} bytes)", output.display(), bytes);
        }
        Command::History => {
            let history = session.api_client()?.get_history().await?;
            if history.history.is_empty() {
                println!("No uploads yet");
            }
            for entry in history.history {
                println!(
                    "{:<24} {:<10} {:>6} {:>5}  {}  {}",
                    entry.id,
                    entry.status.as_str(),
                    entry.total_records.map(|n| n.to_string()).unwrap_or_default(),
                    entry
                        .average_score
                        .map(|s| format!("{:.2}", s))
                        .unwrap_or_default(),
                    entry.uploaded_at,
                    entry.filename
                );
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Defaults, then the config file, then `AUTOEXAM_*` variables, then `--api-url`.
fn load_config(cli: &Cli) -> anyhow::Result<ClientConfig> {
    let base = match &cli.config {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    };
    let mut config = base
        .with_env_overrides()
        .context("Invalid AUTOEXAM_* environment override")?;
    if let Some(url) = &cli.api_url {
        config.base_url = url.clone();
    }
    Ok(config)
}

/// Token cancelled on the first Ctrl-C.
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    token
}

fn progress_bar() -> anyhow::Result<ProgressBar> {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}",
        )
        .context("Invalid progress template")?
        .progress_chars("##-"),
    );
    Ok(bar)
}

/// Runs a workflow operation while rendering its events and forwarding Ctrl-C.
async fn drive<F, T>(
    workflow: &UploadWorkflow<ExamApiClient>,
    task: F,
    rx: &mut UnboundedReceiver<WorkflowEvent>,
    bar: &ProgressBar,
    interrupt: &CancellationToken,
) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    tokio::pin!(task);
    let mut interrupted = false;

    let result = loop {
        tokio::select! {
            result = &mut task => break result,
            Some(event) = rx.recv() => render(bar, event),
            _ = interrupt.cancelled(), if !interrupted => {
                interrupted = true;
                bar.set_message("Cancelling...");
                workflow.cancel();
            }
        }
    };
    while let Ok(event) = rx.try_recv() {
        render(bar, event);
    }
    if result.is_err() {
        bar.abandon();
    }
    result
}

fn render(bar: &ProgressBar, event: WorkflowEvent) {
    match event {
        WorkflowEvent::Validated { report } => {
            bar.println(format!("Columns: {}", report.headers.join(" | ")));
            for warning in report.warnings {
                bar.println(format!("warning: {}", warning));
            }
        }
        WorkflowEvent::Progress(progress) => {
            bar.set_position(u64::from(progress.percent));
            bar.set_message(progress.phase);
        }
        WorkflowEvent::State(_) => {}
    }
}

/// Prints the summary and optionally downloads the graded CSV.
async fn finish(
    workflow: &UploadWorkflow<ExamApiClient>,
    result: Option<&ResultRecord>,
    job_id: &str,
    output: Option<&Path>,
    interrupt: &CancellationToken,
) -> anyhow::Result<()> {
    println!("Job:      {}", job_id);
    if let Some(record) = result {
        if let Some(total) = record.total_records {
            println!("Records:  {}", total);
        }
        if let Some(avg) = record.average_score {
            println!("Average:  {:.2}", avg);
        }
        if let Some(distribution) = &record.distribution {
            for (bucket, count) in distribution {
                println!("  {:<8} {}", bucket, count);
            }
        }
    }

    match output {
        Some(path) => {
            let bytes = workflow.download_to(job_id, path, interrupt).await?;
            println!("Saved {} ({} bytes)", path.display(), bytes);
        }
        None => {
            let url = workflow.download_link(job_id).await?;
            println!("Download: {}", url);
        }
    }
    Ok(())
}
