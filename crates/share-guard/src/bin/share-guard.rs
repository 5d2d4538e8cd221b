use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::{future, stream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use share_guard::{
    metrics::{metrics_handler, register_metrics},
    shares::{Clock, SystemClock},
    FraudDetector, FraudPolicy, JsonlReportSink, PoolStages, RunnerConfig, ShareValidator,
    ValidationRunner,
};

#[derive(Parser, Debug)]
#[clap(name = "share-guard")]
#[clap(about = "Validates mining shares and flags abusive submitters", long_about = None)]
struct Args {
    /// Time budget for each pipeline stage, in seconds
    #[clap(long, env = "VALIDATION_TIMEOUT_SEC", default_value = "3")]
    stage_timeout_secs: u64,

    /// Number of stage workers
    #[clap(long, default_value = "4")]
    workers: usize,

    /// Required number of leading zero characters in a share hash
    #[clap(long, default_value = "4")]
    difficulty: usize,

    /// Accepted distance between share timestamp and local clock, in seconds
    #[clap(long, default_value = "120")]
    max_time_drift: u64,

    /// Fraud window length, in seconds
    #[clap(long, default_value = "300")]
    window_seconds: u64,

    /// Shares allowed per identity inside the window
    #[clap(long, default_value = "200")]
    max_shares: usize,

    /// Lowest acceptable average nonce inside the window
    #[clap(long, default_value = "1000.0")]
    min_avg_nonce: f64,

    /// Append fraud reports to this JSONL file
    #[clap(long)]
    fraud_log: Option<PathBuf>,

    /// Read shares from this file instead of stdin
    #[clap(long)]
    input: Option<PathBuf>,

    /// Validations in flight at once
    #[clap(long, default_value = "16")]
    concurrency: usize,

    /// Do not record shares the validator already rejected
    #[clap(long)]
    skip_fraud_on_invalid: bool,

    /// How often idle identities are evicted, in seconds
    #[clap(long, default_value = "60")]
    prune_interval_secs: u64,

    /// Serve Prometheus metrics on this address
    #[clap(long)]
    metrics_bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let policy = FraudPolicy {
        name: "cli".to_string(),
        window_seconds: args.window_seconds,
        max_shares: args.max_shares,
        min_avg_nonce: args.min_avg_nonce,
    };
    let mut detector = FraudDetector::new(policy).context("invalid fraud policy")?;
    if let Some(path) = &args.fraud_log {
        info!("Writing fraud reports to {}", path.display());
        detector = detector.with_sink(Arc::new(JsonlReportSink::new(path)));
    }
    let detector = Arc::new(detector);

    let stages = PoolStages::new(
        ShareValidator::new(args.max_time_drift),
        args.difficulty,
        detector.clone(),
    );
    let config = RunnerConfig {
        stage_timeout: Duration::from_secs(args.stage_timeout_secs),
        workers: args.workers,
        skip_fraud_on_invalid: args.skip_fraud_on_invalid,
    };
    let runner = Arc::new(ValidationRunner::new(Arc::new(stages), config).context("invalid runner config")?);

    info!(
        "Share guard ready: difficulty {}, stage timeout {}s, {} workers",
        args.difficulty, args.stage_timeout_secs, args.workers
    );

    register_metrics()?;
    if let Some(addr) = args.metrics_bind {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind metrics listener on {}", addr))?;
        let router = axum::Router::new().route("/metrics", axum::routing::get(serve_metrics));
        info!("Prometheus metrics on {}", addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    // Evict identities that have gone quiet
    let maintenance = detector.clone();
    let prune_interval = Duration::from_secs(args.prune_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(prune_interval);
        loop {
            interval.tick().await;
            maintenance.prune_idle(SystemClock.now()).await;
        }
    });

    let input: Box<dyn AsyncRead + Unpin + Send> = match &args.input {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };

    tokio::select! {
        res = process(input, runner, args.concurrency.max(1)) => res?,
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Share guard shutting down");
    Ok(())
}

/// Validates newline-delimited JSON shares, writing one decision per line
/// in input order.
async fn process(
    input: Box<dyn AsyncRead + Unpin + Send>,
    runner: Arc<ValidationRunner>,
    concurrency: usize,
) -> anyhow::Result<()> {
    let lines = BufReader::new(input).lines();
    let lines = stream::unfold(lines, |mut lines| async move {
        match lines.next_line().await {
            Ok(Some(line)) => Some((line, lines)),
            Ok(None) => None,
            Err(e) => {
                error!("Failed to read share input: {}", e);
                None
            }
        }
    });

    let mut decisions = Box::pin(
        lines
            .filter(|line| future::ready(!line.trim().is_empty()))
            .filter_map(|line| {
                future::ready(match serde_json::from_str::<serde_json::Value>(&line) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        warn!("Skipping unparsable share line: {}", e);
                        None
                    }
                })
            })
            .map(|value| {
                let runner = runner.clone();
                async move { runner.validate_json(value).await }
            })
            .buffered(concurrency),
    );

    let mut stdout = tokio::io::stdout();
    while let Some(decision) = decisions.next().await {
        let mut line = serde_json::to_string(&decision)?;
        line.push('\n');
        stdout.write_all(line.as_bytes()).await?;
    }
    stdout.flush().await?;
    Ok(())
}

async fn serve_metrics() -> String {
    metrics_handler().unwrap_or_else(|e| {
        error!("Failed to encode metrics: {}", e);
        String::new()
    })
}
