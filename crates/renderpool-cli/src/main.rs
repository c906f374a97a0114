// renderpool CLI
//
// Design Decision: One JSON task per stdin line, one JSON result per stdout line,
// in input order, so the tool composes with jq and shell pipelines.
// Design Decision: Logs go to stderr to keep stdout machine-readable.
// Design Decision: Results stream out while stdin is still being read; the
// number of outstanding tasks is bounded per worker.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use renderpool::{
    PoolConfig, PoolEvent, ProcessWorker, ProcessWorkerConfig, TaskHandle, WorkerPool,
};

/// Tasks allowed in flight or waiting per worker before stdin reading pauses
const BACKLOG_PER_WORKER: usize = 4;

#[derive(Parser, Debug)]
#[command(name = "renderpool")]
#[command(about = "Render JSON tasks from stdin through a pool of worker processes")]
#[command(version)]
struct Cli {
    /// Number of worker processes (default: RENDERPOOL_WORKERS or CPU count)
    #[arg(long, short)]
    workers: Option<usize>,

    /// Per-task timeout in milliseconds (default: RENDERPOOL_TIMEOUT_MS or 180000)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// How long a worker may take to report ready, in milliseconds
    #[arg(long, env = "RENDERPOOL_STARTUP_TIMEOUT_MS", default_value_t = 10_000)]
    startup_timeout_ms: u64,

    /// Worker program to launch
    program: PathBuf,

    /// Arguments passed to the worker program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

/// One line of output
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Outcome {
    Ok {
        line: usize,
        ok: bool,
        output: serde_json::Value,
    },
    Err {
        line: usize,
        ok: bool,
        weak: bool,
        error: String,
    },
}

impl Outcome {
    fn success(line: usize, output: serde_json::Value) -> Self {
        Self::Ok {
            line,
            ok: true,
            output,
        }
    }

    fn failure(line: usize, weak: bool, error: impl ToString) -> Self {
        Self::Err {
            line,
            ok: false,
            weak,
            error: error.to_string(),
        }
    }
}

enum Pending {
    Submitted(TaskHandle<serde_json::Value>),
    Invalid(serde_json::Error),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "renderpool=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = PoolConfig::from_env();
    if let Some(workers) = cli.workers {
        config = config.with_number_of_workers(workers);
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config = config.with_timeout(Duration::from_millis(timeout_ms));
    }

    let worker = ProcessWorkerConfig::new(&cli.program)
        .args(cli.args)
        .with_startup_timeout(Duration::from_millis(cli.startup_timeout_ms));

    tracing::info!(
        workers = config.number_of_workers,
        timeout_ms = config.timeout.as_millis() as u64,
        program = %cli.program.display(),
        "renderpool starting"
    );

    let pool = WorkerPool::with_processes(config, worker);
    watch_timeouts(&pool);

    if let Err(err) = pool.start().await {
        pool.kill();
        return Err(err).context("failed to start worker pool");
    }

    let result = render_stdin(&pool).await;

    pool.kill();
    tracing::info!("renderpool shutdown complete");
    result
}

/// Render stdin line by line, printing each result as soon as it and every
/// earlier result are ready
async fn render_stdin(pool: &WorkerPool<ProcessWorker>) -> Result<()> {
    // Stdin reading pauses while the channel is full.
    let (tx, rx) = mpsc::channel(pool.config().number_of_workers * BACKLOG_PER_WORKER);

    let (submitted, failed) = tokio::join!(
        submit_lines(pool, tx),
        print_results(rx, std::io::stdout())
    );
    let submitted = submitted?;
    let failed = failed?;

    tracing::info!(tasks = submitted, "All tasks rendered");
    if failed > 0 {
        tracing::warn!(failed, "Some tasks failed");
    }
    Ok(())
}

/// Submit every stdin line to the pool, in order
async fn submit_lines(
    pool: &WorkerPool<ProcessWorker>,
    tx: mpsc::Sender<(usize, Pending)>,
) -> Result<usize> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut number = 0usize;
    let mut submitted = 0usize;

    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let pending = match serde_json::from_str::<serde_json::Value>(&line) {
            Ok(task) => Pending::Submitted(pool.execute(task)),
            Err(err) => {
                tracing::warn!(line = number, error = %err, "Skipping malformed task");
                Pending::Invalid(err)
            }
        };
        submitted += 1;
        if tx.send((number, pending)).await.is_err() {
            // The printer stopped; nothing left to report to.
            break;
        }
    }

    Ok(submitted)
}

/// Print results in input order; returns how many failed
async fn print_results(
    mut rx: mpsc::Receiver<(usize, Pending)>,
    mut out: impl Write,
) -> Result<usize> {
    let mut failed = 0usize;

    while let Some((number, task)) = rx.recv().await {
        let outcome = match task {
            Pending::Submitted(handle) => match handle.await {
                Ok(output) => Outcome::success(number, output),
                Err(err) => {
                    failed += 1;
                    Outcome::failure(number, err.is_weak(), &err)
                }
            },
            Pending::Invalid(err) => {
                failed += 1;
                Outcome::failure(number, false, format!("invalid task: {err}"))
            }
        };
        serde_json::to_writer(&mut out, &outcome)?;
        writeln!(out)?;
        out.flush()?;
    }

    Ok(failed)
}

/// Log timeout notifications from the pool
fn watch_timeouts(pool: &WorkerPool<ProcessWorker>) {
    let mut events = pool.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PoolEvent::Timeout { slot }) => {
                    tracing::warn!(%slot, "Worker timed out and is being recycled")
                }
                Ok(PoolEvent::RecycleFailed { slot, error }) => {
                    tracing::error!(%slot, %error, "Worker could not be restarted")
                }
                Ok(PoolEvent::WorkerRecycled { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Missed pool events")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}
