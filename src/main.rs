use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratekeeper::config::RatekeeperConfig;
use ratekeeper::ratelimit::{
    Admission, Algorithm, Identity, RateLimitStore, RedisBackend, RoutePolicies, ScopeKind,
    GLOBAL_WARM_UP_KEY,
};

/// Operate on a Ratekeeper store from the command line.
#[derive(Debug, Parser)]
#[command(name = "ratekeeper", version, about)]
struct Cli {
    /// Configuration file (YAML); `RATEKEEPER__*` variables override it
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one or more admission decisions and print each verdict
    Decide {
        /// Resolve limits from the route rule matching this path
        #[arg(long)]
        route: Option<String>,
        #[arg(long)]
        scope: Option<ScopeKind>,
        /// Caller IP address
        #[arg(long)]
        ip: Option<String>,
        /// Authenticated user id
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        algorithm: Option<Algorithm>,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        window: Option<u32>,
        /// Number of decisions to run
        #[arg(long, default_value_t = 1)]
        count: u32,
        /// Pause between decisions, in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
    /// Seed a token bucket unless it already exists
    WarmUp {
        #[arg(long, default_value = GLOBAL_WARM_UP_KEY)]
        key: String,
        #[arg(long)]
        capacity: Option<u32>,
        #[arg(long)]
        expiry: Option<u32>,
    },
    /// Load and validate the configuration, then print it
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Ratekeeper");

    let config = RatekeeperConfig::load(cli.config.as_deref())?;
    info!(
        algorithm = %config.rate_limiting.algorithm,
        limit = config.rate_limiting.limit,
        window_secs = config.rate_limiting.window_secs,
        fail_open = config.rate_limiting.fail_open,
        "Configuration loaded"
    );

    match cli.command {
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::WarmUp { key, capacity, expiry } => {
            let store = RateLimitStore::<RedisBackend>::connect(&config).await?;
            let seeded = store
                .warm_up(
                    &key,
                    capacity.unwrap_or(config.rate_limiting.warm_up_capacity),
                    expiry.unwrap_or(config.rate_limiting.window_secs),
                )
                .await?;
            println!("{}", serde_json::json!({ "key": key, "seeded": seeded }));
        }
        Command::Decide {
            route,
            scope,
            ip,
            user,
            algorithm,
            limit,
            window,
            count,
            interval_ms,
        } => {
            let policies = RoutePolicies::from_config(&config.rate_limiting);
            let mut policy = match route.as_deref() {
                Some(path) => policies.resolve(path),
                None => policies.defaults(),
            };
            policy.algorithm = algorithm.unwrap_or(policy.algorithm);
            policy.limit = limit.unwrap_or(policy.limit);
            policy.window_secs = window.unwrap_or(policy.window_secs);
            policy.scope = scope.unwrap_or(policy.scope);

            let identity = Identity { ip, user };
            let key = identity.scope(policy.scope).base_key();
            let store = RateLimitStore::<RedisBackend>::connect(&config).await?;

            for call in 1..=count {
                let admission = tokio::select! {
                    admission = Admission::check(&store, &identity, &policy) => admission,
                    _ = signal::ctrl_c() => {
                        info!("Received Ctrl+C, stopping");
                        break;
                    }
                };

                let retry_after = match admission {
                    Admission::Allowed => None,
                    Admission::Rejected { retry_after } => Some(retry_after.as_secs()),
                };
                println!(
                    "{}",
                    serde_json::json!({
                        "call": call,
                        "key": key,
                        "algorithm": policy.algorithm,
                        "allowed": admission.is_allowed(),
                        "retry_after_secs": retry_after,
                    })
                );

                if interval_ms > 0 && call < count {
                    tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                }
            }
        }
    }

    Ok(())
}

/// Logs go to stderr so command output on stdout stays machine readable.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}
