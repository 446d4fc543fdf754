use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::http::Method;
use clap::{Parser, Subcommand};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use hub_domain::config::{Config, ConfigSeverity, LogFormat};
use hub_gateway::api;
use hub_gateway::connector::ConnectorLink;
use hub_gateway::state::AppState;
use hub_providers::GeminiClient;
use hub_store::MemoryStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CLI
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Parser)]
#[command(name = "synapse-hub", about = "AI orchestration hub", version)]
struct Cli {
    /// Path to the TOML config file (default: ./config.toml, or $HUB_CONFIG).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the hub server (default when no subcommand is given).
    Serve,
    /// Inspect or validate configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
enum ConfigCommand {
    Validate,
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (config, config_path) = load_config(cli.config.as_deref())?;

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing(&config);
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let issues = config.validate();
            for issue in &issues {
                eprintln!("{issue}");
            }
            let errors = issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count();
            match config_path {
                Some(path) => println!("validated {}", path.display()),
                None => println!("validated built-in defaults (no config file found)"),
            }
            if errors > 0 {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let rendered =
                toml::to_string_pretty(&config).context("serializing effective config")?;
            println!("{rendered}");
            Ok(())
        }
        Some(Command::Version) => {
            println!("synapse-hub {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config loading / tracing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn load_config(cli_path: Option<&std::path::Path>) -> anyhow::Result<(Config, Option<PathBuf>)> {
    let path = cli_path
        .map(PathBuf::from)
        .or_else(|| std::env::var("HUB_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    if !path.exists() {
        // Defaults-only is a supported dev setup.
        return Ok((Config::default(), None));
    }

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: Config =
        toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok((config, Some(path)))
}

/// Initialize structured tracing for the `serve` command.
fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.clone()));

    match (&config.log.format, &config.log.file) {
        (LogFormat::Json, None) => {
            tracing_subscriber::fmt().with_env_filter(filter).json().init();
        }
        (LogFormat::Text, None) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        (format, Some(path)) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .unwrap_or_else(|e| panic!("cannot open log file {path}: {e}"));
            let writer = std::sync::Mutex::new(file);
            match format {
                LogFormat::Json => tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .json()
                    .init(),
                LogFormat::Text => tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .with_ansi(false)
                    .init(),
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("Synapse Hub starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Store ────────────────────────────────────────────────────────
    if !config.db.url.starts_with("memory://") {
        anyhow::bail!(
            "unsupported db.url {:?} — only the in-memory reference store \
             (memory://) ships with this build",
            config.db.url
        );
    }
    let store: Arc<dyn hub_store::TaskStore> = Arc::new(MemoryStore::new());
    tracing::info!("in-memory task store ready");

    // ── Gemini client ────────────────────────────────────────────────
    let llm = Arc::new(
        GeminiClient::from_config(&config.llm).context("initializing Gemini client")?,
    );
    tracing::info!(model = %config.llm.model, "Gemini client ready");

    // ── Connector link ───────────────────────────────────────────────
    let link = Arc::new(ConnectorLink::new());
    tracing::info!(enabled = config.connector.enabled, "connector link ready");

    // ── App state ────────────────────────────────────────────────────
    let state = AppState::build(config.clone(), store, llm, link.clone(), link);
    if state.api_token_hash.is_some() {
        tracing::info!(env_var = %config.server.api_token_env, "API bearer-token auth enabled");
    } else {
        tracing::warn!(
            env_var = %config.server.api_token_env,
            "API bearer-token auth DISABLED — set the env var to enable"
        );
    }

    // ── Command dispatcher (one per connector) ───────────────────────
    if config.connector.enabled {
        state.broker.spawn_dispatcher();
        tracing::info!("command dispatcher started");
    }

    // ── Retention reaper ─────────────────────────────────────────────
    // Period: tasks.cleanup_interval_secs. Failures are logged, never
    // propagated to user calls.
    {
        let broker = state.broker.clone();
        let orchestrator = state.orchestrator.clone();
        let period = config.tasks.clamped().cleanup_interval_secs;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(period));
            loop {
                interval.tick().await;
                broker.reap_expired();
                orchestrator.evict_terminated().await;
                orchestrator.prune_idle_locks();
            }
        });
        tracing::info!(period_secs = period, "retention reaper started");
    }

    // ── Heartbeat monitor ────────────────────────────────────────────
    // Period: connector.heartbeat_interval_secs. Publishes a
    // HeartbeatHealth event whenever the healthy bit flips.
    {
        let link = state.link.clone();
        let events = state.events.clone();
        let interval_secs = config.connector.heartbeat_interval_secs;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            let mut last_healthy: Option<bool> = None;
            loop {
                interval.tick().await;
                let healthy = link.heartbeat_healthy(interval_secs);
                if last_healthy != Some(healthy) {
                    last_healthy = Some(healthy);
                    events.publish(
                        hub_gateway::runtime::events::HubEvent::HeartbeatHealth { healthy },
                    );
                }
            }
        });
        tracing::info!(interval_secs, "heartbeat monitor started");
    }

    // ── CORS layer (config-aware) ────────────────────────────────────
    let cors_layer = cors_layer_from(&config.server.cors);

    // ── Concurrency limit (backpressure protection) ──────────────────
    let max_concurrent = std::env::var("HUB_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(256);
    tracing::info!(max_concurrent, "concurrency limit set");

    // ── Rate limiting (token bucket keyed by client IP) ──────────────
    let rate_limiter = match &config.server.rate_limit {
        Some(rl) => {
            use tower_governor::governor::GovernorConfigBuilder;
            use tower_governor::GovernorLayer;

            // Zero values were already rejected by Config::validate.
            let quota = GovernorConfigBuilder::default()
                .per_second(rl.requests_per_second)
                .burst_size(rl.burst_size)
                .finish()
                .expect("rate_limit bounds are checked by Config::validate");
            tracing::info!(
                per_second = rl.requests_per_second,
                burst = rl.burst_size,
                "request rate limiting active"
            );
            Some(GovernorLayer {
                config: std::sync::Arc::new(quota),
            })
        }
        None => {
            tracing::info!("request rate limiting off");
            None
        }
    };

    // ── Router ───────────────────────────────────────────────────────
    let router = api::router(state.clone())
        .layer(cors_layer)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrent));
    let app = if let Some(limiter) = rate_limiter {
        router.layer(limiter).with_state(state.clone())
    } else {
        router.with_state(state.clone())
    };

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    tracing::info!(addr = %addr, "Synapse Hub listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await
        .context("axum server error")?;

    tracing::info!("Synapse Hub stopped");
    Ok(())
}

/// Resolve on ctrl-c: stop accepting, cancel still-queued commands, and
/// let axum drain in-flight requests.
async fn shutdown_signal(state: AppState) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install ctrl-c handler");
        return;
    }
    let cancelled = state.broker.shutdown();
    tracing::info!(queued_cancelled = cancelled, "shutdown signal received");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CORS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const CORS_METHODS: [Method; 5] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::OPTIONS,
];

/// Build a [`CorsLayer`] from `server.cors.allowed_origins`.
///
/// Two entry forms are understood: a full origin (`http://host:3000`)
/// matched literally, and `http://host:*`, which accepts that host on any
/// port. A bare `"*"` anywhere in the list turns CORS fully open.
fn cors_layer_from(cors: &hub_domain::config::CorsConfig) -> CorsLayer {
    use axum::http::header;

    if cors.allowed_origins.iter().any(|o| o == "*") {
        // Credentialed requests cannot be combined with an open origin.
        tracing::warn!("CORS is wide open; every origin is accepted");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(CORS_METHODS)
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    }

    let mut literal: Vec<String> = Vec::new();
    let mut any_port: Vec<String> = Vec::new();
    for entry in &cors.allowed_origins {
        match entry.strip_suffix(":*") {
            Some(host) => any_port.push(format!("{host}:")),
            None => literal.push(entry.clone()),
        }
    }

    let allow_origin = AllowOrigin::predicate(move |origin, _| {
        let Ok(text) = origin.to_str() else {
            return false;
        };
        if literal.iter().any(|o| o == text) {
            return true;
        }
        // For `host:*` entries, whatever follows the colon must be a bare
        // port number — "http://localhost:9.evil.test" does not qualify.
        any_port.iter().any(|prefix| {
            text.strip_prefix(prefix.as_str())
                .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
        })
    });

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(CORS_METHODS)
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}
