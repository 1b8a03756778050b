//! tor-request
//!
//! Sends GET requests to a target through Tor, one distinct exit identity
//! per concurrent request:
//! 1. Checks that the local Tor SOCKS port is reachable
//! 2. Revalidates identities cached by earlier runs
//! 3. Prepares one ready identity per request, rotating circuits as needed
//! 4. Dispatches the requests on up to five workers, replacing identities
//!    that fail, get rate limited or hit server errors

mod cli;
mod config;
mod console;
mod error;
mod metrics;

use std::sync::Arc;

use anyhow::{Context, Result};
use identity_pool::{Dispatcher, IdentityCache, IdentityFactory, Reporter, SessionPool};
use tor_control::{REACHABILITY_TIMEOUT, TorController};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::SocksSessionBuilder;

use crate::cli::{Cli, USAGE};
use crate::config::Config;
use crate::console::{ConsoleReporter, RunSummary};

/// Initialize tracing on stderr with LOG_LEVEL / RUST_LOG support.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match Cli::parse(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("error: {e}\n\n{USAGE}");
            std::process::exit(2);
        }
    };

    let json_logs = cli.json_logs || std::env::var("LOG_FORMAT").is_ok_and(|f| f == "json");
    init_tracing(json_logs);

    info!(target_url = %cli.target, count = cli.count, "starting tor-request");

    let config_path = Config::resolve_path(cli.config_path.as_deref());
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        socks_addr = %config.tor.socks_addr,
        control_addr = %config.tor.control_addr,
        cache_file = %config.pool.cache_file.display(),
        max_workers = config.dispatch.max_workers,
        "configuration loaded"
    );

    if let Some(listen_addr) = config.metrics.listen_addr {
        metrics::install_exporter(listen_addr)?;
        info!(addr = %listen_addr, "metrics listener started");
    }

    tor_control::check_socks(config.tor.socks_addr, REACHABILITY_TIMEOUT)
        .await
        .map_err(|e| error::Error::TorNotRunning {
            addr: config.tor.socks_addr,
            reason: e.to_string(),
        })
        .context("start the tor daemon and try again")?;

    let control = Arc::new(TorController::new(
        config.tor.control_addr,
        config.control_auth(),
        config.control_timeout(),
    ));
    let builder = Arc::new(SocksSessionBuilder::new(config.tor.socks_addr));
    let factory = IdentityFactory::new(control, builder, config.factory_settings());
    let reporter: Arc<dyn Reporter> = Arc::new(ConsoleReporter);

    let pool = Arc::new(
        SessionPool::open(
            factory,
            config.validator(),
            IdentityCache::new(config.pool.cache_file.clone()),
            config.pool_settings(),
            reporter.clone(),
        )
        .await,
    );

    let prepared = pool.prepare(cli.count).await;
    metrics::set_queue_depth(pool.queue_len().await);
    info!(prepared, requested = cli.count, "sessions prepared");

    let dispatcher = Dispatcher::new(pool.clone(), config.dispatch_settings(), reporter);
    let outcomes = dispatcher.run_all(&cli.target, cli.count).await;
    metrics::set_queue_depth(pool.queue_len().await);

    let summary = RunSummary::from_outcomes(cli.count, &outcomes);
    println!("{summary}");
    info!(snapshot = %pool.snapshot().await, "final pool state");

    if !summary.all_done() {
        warn!(failed = summary.failed, "some requests failed");
        std::process::exit(1);
    }
    Ok(())
}
