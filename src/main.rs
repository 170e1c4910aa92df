use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use windowgate::config::{LoggingConfig, WindowgateConfig};
use windowgate::error::{LimitExceeded, LimiterError};
use windowgate::ratelimit::{AdmissionMode, KeyResolver, RateLimiter};
use windowgate::store::RedisWindowStore;

/// Exit code used when a grant is rejected.
const EXIT_LIMITED: u8 = 2;

/// Sliding-window rate limiting against a shared Redis instance.
#[derive(Parser, Debug)]
#[command(name = "windowgate", version, about)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, env = "WINDOWGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Redis connection URL, overrides the configuration file
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Maximum entries per window
    #[arg(long)]
    limit: Option<u64>,

    /// Window length in milliseconds
    #[arg(long)]
    duration_ms: Option<u64>,

    /// Admission mode: binary, nary or uniform
    #[arg(long)]
    mode: Option<AdmissionMode>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume quota on a key
    Grant {
        key: String,
        /// Units to consume
        #[arg(short, long, default_value_t = 1)]
        times: u64,
    },
    /// Report usage of a key without consuming quota
    Status { key: String },
    /// Grant one unit on an interval until interrupted
    Watch {
        key: String,
        #[arg(long, default_value_t = 333)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let mut config =
        WindowgateConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(url) = cli.redis_url {
        config.store.redis_url = url;
    }
    if let Some(limit) = cli.limit {
        config.quota.limit = limit;
    }
    if let Some(duration_ms) = cli.duration_ms {
        config.quota.duration_ms = duration_ms;
    }
    if let Some(mode) = cli.mode {
        config.quota.mode = mode;
    }

    init_tracing(&config.logging)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting windowgate");

    let store = RedisWindowStore::connect(&config.store.redis_url)
        .await
        .with_context(|| format!("Failed to connect to {}", config.store.redis_url))?;

    let prefix = config.store.key_prefix.clone();
    let limiter = RateLimiter::keyed_builder()
        .store(Arc::new(store))
        .key(KeyResolver::derived(move |key: &str| match &prefix {
            Some(prefix) => format!("{}:{}", prefix, key),
            None => key.to_string(),
        }))
        .quota(config.quota.clone())
        .build()?;

    match cli.command {
        Command::Grant { key, times } => match limiter.grant_for(&key, times).await {
            Ok(grant) => {
                println!("{}", serde_json::to_string(&grant)?);
                Ok(ExitCode::SUCCESS)
            }
            Err(LimiterError::LimitExceeded(rejection)) => {
                println!("{}", rejection_json(&rejection, None));
                Ok(ExitCode::from(EXIT_LIMITED))
            }
            Err(e) => Err(e.into()),
        },
        Command::Status { key } => {
            let status = limiter.status_for(&key).await?;
            println!("{}", serde_json::to_string(&status)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Watch { key, interval_ms } => {
            watch(&limiter, &key, Duration::from_millis(interval_ms.max(1))).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Grant one unit per tick, printing each outcome, until a shutdown signal.
async fn watch(limiter: &RateLimiter<str>, key: &str, every: Duration) -> anyhow::Result<()> {
    info!(
        key = %key,
        interval_ms = every.as_millis() as u64,
        limit = limiter.quota().limit(),
        duration_ms = limiter.quota().duration_ms(),
        "Watching key"
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                match limiter.grant_for(key, 1).await {
                    Ok(grant) => println!("{}", serde_json::to_string(&grant)?),
                    Err(LimiterError::LimitExceeded(rejection)) => {
                        let status = limiter.status_for(key).await?;
                        debug!(key = %key, retry_after_ms = status.retry_after_ms, "Waiting for capacity");
                        println!("{}", rejection_json(&rejection, Some(status.retry_after_ms)));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    info!(key = %key, "Stopped watching");
    Ok(())
}

fn rejection_json(rejection: &LimitExceeded, retry_after_ms: Option<u64>) -> serde_json::Value {
    let mut value = json!({
        "error": rejection.message,
        "status": rejection.status,
        "status_code": rejection.status_code,
    });
    if let Some(retry_after_ms) = retry_after_ms {
        value["retry_after_ms"] = json!(retry_after_ms);
    }
    value
}

/// Log to stderr so stdout carries only results.
fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .with_context(|| format!("Invalid log level {:?}", logging.level))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    let result = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialise logging: {}", e))
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
