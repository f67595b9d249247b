use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use ratelimit::{
    LimiterConfig, MemoryStore, RateLimiter, RedisConfig, RedisHashStore, RedisStringStore,
    StateStore,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Process-local map
    Memory,
    /// Redis hash with fields "0" and "1"
    RedisHash,
    /// Redis string "<allowance>:<timestamp>"
    RedisString,
}

/// Drive a rate limiter with a burst of calls and report how many were admitted.
#[derive(Debug, Parser)]
#[command(name = "ratelimit-demo", version)]
struct Args {
    #[arg(long, value_enum, env = "RATELIMIT_BACKEND", default_value = "memory")]
    backend: Backend,

    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Prefix for every bucket key stored in Redis
    #[arg(long, env = "RATELIMIT_NAMESPACE")]
    namespace: Option<String>,

    /// Permits granted per interval
    #[arg(long, env = "RATELIMIT_RATE", default_value_t = 1)]
    rate: i64,

    /// Interval over which `rate` permits accrue, e.g. "1s" or "250ms"
    #[arg(long, env = "RATELIMIT_INTERVAL", default_value = "1s", value_parser = parse_interval)]
    interval: Duration,

    /// Bucket capacity
    #[arg(long, env = "RATELIMIT_BURST", default_value_t = 10)]
    burst: i64,

    /// Bucket key; a random one is used when omitted
    #[arg(long)]
    key: Option<String>,

    #[arg(long, default_value_t = 15)]
    calls: u32,

    /// Sleep for the returned wait after every denial
    #[arg(long)]
    sleep: bool,

    /// Use compare-and-set writes instead of plain overwrites
    #[arg(long)]
    exact: bool,

    /// Clear the store before running
    #[arg(long)]
    flush: bool,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn parse_interval(raw: &str) -> std::result::Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(raw)
        .map_err(|e| format!("invalid interval '{}': {}", raw, e))
}

enum Store {
    Memory(MemoryStore),
    RedisHash(RedisHashStore),
    RedisString(RedisStringStore),
}

impl Store {
    async fn open(args: &Args) -> Result<Self> {
        let store = match args.backend {
            Backend::Memory => Store::Memory(MemoryStore::new()),
            Backend::RedisHash => {
                let redis = redis_config(args)?;
                let store = RedisHashStore::connect(&redis.url)
                    .await
                    .context("Failed to connect to Redis")?;
                Store::RedisHash(match redis.namespace {
                    Some(namespace) => store.with_namespace(namespace),
                    None => store,
                })
            }
            Backend::RedisString => {
                let redis = redis_config(args)?;
                let store = RedisStringStore::connect(&redis.url)
                    .await
                    .context("Failed to connect to Redis")?;
                Store::RedisString(match redis.namespace {
                    Some(namespace) => store.with_namespace(namespace),
                    None => store,
                })
            }
        };

        Ok(store)
    }
}

fn redis_config(args: &Args) -> Result<RedisConfig> {
    let redis = RedisConfig {
        url: args.redis_url.clone(),
        namespace: args.namespace.clone(),
    };
    redis.validate_config()?;
    Ok(redis)
}

#[derive(Debug, Default)]
struct Tally {
    successes: u32,
    failures: u32,
}

async fn run<S>(args: &Args, store: S) -> Result<()>
where
    S: ratelimit::AtomicStateStore,
{
    store
        .ping()
        .await
        .context("State store is not reachable")?;
    if args.flush {
        store.flush_all().await.context("Failed to flush store")?;
    }

    let config = LimiterConfig::new(args.rate, args.interval, args.burst);
    let limiter = RateLimiter::from_config(config, store)?;
    let key = args
        .key
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    tracing::info!(key = %key, calls = args.calls, exact = args.exact, "Starting run");

    let mut tally = Tally::default();
    for _ in 0..args.calls {
        let wait = if args.exact {
            limiter.allow_exact(&key).await?
        } else {
            limiter.allow(&key).await?
        };

        if wait.is_zero() {
            tally.successes += 1;
            continue;
        }

        tally.failures += 1;
        if args.sleep {
            tokio::time::sleep(wait).await;
        }
    }

    if args.json {
        let summary = serde_json::json!({
            "key": key,
            "successes": tally.successes,
            "failures": tally.failures,
            "metrics": limiter.metrics().snapshot(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("successes: {}", tally.successes);
        println!("failures: {}", tally.failures);
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("ratelimit={0},ratelimit_demo={0}", args.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        backend = ?args.backend,
        rate = args.rate,
        interval = ?args.interval,
        burst = args.burst,
        "Starting ratelimit demo"
    );

    match Store::open(&args).await? {
        Store::Memory(store) => run(&args, store).await,
        Store::RedisHash(store) => run(&args, store).await,
        Store::RedisString(store) => run(&args, store).await,
    }
}
