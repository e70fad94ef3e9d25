use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cachegate::admin::{AdminServer, AdminState};
use cachegate::admission::RateLimiter;
use cachegate::config::{parse_duration, Config};
use cachegate::observability::{AccessLogger, MetricsCollector};
use cachegate::proxy::{engine, AppState, BackendForwarder, Gateway, ResponseCache};

#[derive(Parser, Debug)]
#[command(name = "cachegate")]
#[command(about = "Caching, rate-limiting reverse proxy for a single backend")]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Load and validate the configuration, then exit
    #[arg(long)]
    validate_config: bool,

    #[arg(short, long)]
    port: Option<u16>,

    /// Backend origin, e.g. http://localhost:8081
    #[arg(short, long)]
    backend: Option<String>,

    /// Requests per minute per client
    #[arg(long)]
    rate_limit: Option<u32>,

    /// Cache entry lifetime, e.g. 5m
    #[arg(long, value_parser = parse_duration)]
    cache_ttl: Option<Duration>,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(backend) = &self.backend {
            config.backend.url = backend.clone();
        }
        if let Some(rate_limit) = self.rate_limit {
            config.rate_limit.requests_per_minute = rate_limit;
        }
        if let Some(ttl) = self.cache_ttl {
            config.cache.ttl = ttl;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path).await?,
        None => Config::default(),
    };
    args.apply(&mut config);

    init_tracing(&config);

    config.validate().context("Invalid configuration")?;
    if args.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    info!(
        backend = %config.backend.url,
        requests_per_minute = config.rate_limit.requests_per_minute,
        cache_ttl_secs = config.cache.ttl.as_secs(),
        "Starting cachegate"
    );

    let (access_log, access_log_task) = if config.logging.access_log.enabled {
        let (logger, task) = AccessLogger::start(&config.logging.access_log).await?;
        (Some(logger), Some(task))
    } else {
        (None, None)
    };

    if config.metrics.enabled {
        MetricsCollector::install_exporter(&config.metrics)?;
    }

    let metrics = Arc::new(MetricsCollector::new(&config.metrics, access_log.clone()));
    let cache = Arc::new(ResponseCache::new(config.cache.ttl));
    let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));

    let sweeper = cache.start_sweeper(config.cache.sweep_interval);
    let reaper = limiter.start_reaper(config.rate_limit.reap_interval);

    let forwarder = BackendForwarder::new(config.backend_url()?, &config.backend)?;
    let gateway = Arc::new(Gateway::new(
        cache.clone(),
        limiter.clone(),
        metrics.clone(),
        forwarder,
        config.server.trust_forwarded_headers,
        config.server.request_timeout,
    ));

    let app = engine::router(
        AppState {
            gateway,
            metrics: metrics.clone(),
        },
        config.server.request_timeout,
    );

    let shutdown = CancellationToken::new();

    let admin_task = if config.admin.enabled {
        let admin_server = AdminServer::new(
            &config.admin,
            AdminState {
                app_config: Arc::new(config.clone()),
                metrics: metrics.clone(),
                cache: cache.clone(),
                limiter: limiter.clone(),
            },
        );
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.start(shutdown).await {
                error!("Admin server error: {}", e);
            }
        }))
    } else {
        None
    };

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let mut server_task = tokio::spawn(engine::serve(listener, app, shutdown.clone()));

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
        }
        result = &mut server_task => {
            error!("Gateway server exited unexpectedly: {:?}", result);
        }
    }

    shutdown.cancel();

    if !server_task.is_finished() {
        match tokio::time::timeout(config.server.shutdown_timeout, &mut server_task).await {
            Ok(_) => info!("In-flight requests drained"),
            Err(_) => {
                warn!("Shutdown timeout elapsed, dropping remaining connections");
                server_task.abort();
            }
        }
    }

    cache.shutdown();
    limiter.shutdown();
    let _ = sweeper.await;
    let _ = reaper.await;

    if let Some(admin_task) = admin_task {
        let _ = admin_task.await;
    }

    if let Some(access_log) = access_log {
        access_log.shutdown();
    }
    if let Some(task) = access_log_task {
        let _ = task.await;
    }

    info!("cachegate shutdown complete");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| config.logging.level.clone().into());

    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
