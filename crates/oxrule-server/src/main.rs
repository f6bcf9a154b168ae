use anyhow::Result;
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusBuilder;
use oxrule_datasource::http::{Auth, HttpQuerierBuilder};
use oxrule_datasource::QuerierBuilder;
use oxrule_engine::{config as rules, Group, Manager, NotifierProvider};
use oxrule_notify::alertmanager::AlertManager;
use oxrule_notify::Notifier;
use oxrule_remotewrite::client::{Client as RwHttpClient, Config as RwConfig};
use oxrule_remotewrite::RwClient;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use oxrule_server::app;
use oxrule_server::config::{DatasourceConfig, RemoteWriteConfig, ServerConfig};
use oxrule_server::reload;
use oxrule_server::state::AppState;

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  oxrule-server [config.toml]                              Start the server");
    eprintln!("  oxrule-server replay <config.toml> <start> <end>         Replay rules over [start, end) (RFC3339) into remote write");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("oxrule=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("replay") => {
            let (Some(config_path), Some(start), Some(end)) =
                (args.get(2), args.get(3), args.get(4))
            else {
                print_usage();
                return Err(anyhow::anyhow!(
                    "replay requires <config.toml>, <start> and <end> arguments"
                ));
            };
            run_replay(config_path, start, end).await
        }
        Some("--help" | "-h") => {
            print_usage();
            Ok(())
        }
        _ => {
            let config_path = args
                .get(1)
                .map(|s| s.as_str())
                .unwrap_or("config/server.toml");
            run_server(config_path).await
        }
    }
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

fn querier_builder(cfg: &DatasourceConfig) -> Result<Arc<dyn QuerierBuilder>> {
    let auth = match (&cfg.bearer_token, &cfg.basic_auth_username) {
        (Some(token), _) => Some(Auth::Bearer(token.clone())),
        (None, Some(username)) => Some(Auth::Basic {
            username: username.clone(),
            password: cfg.basic_auth_password.clone().unwrap_or_default(),
        }),
        (None, None) => None,
    };
    Ok(Arc::new(HttpQuerierBuilder::new(
        http_client(cfg.timeout_secs)?,
        &cfg.url,
        auth,
    )))
}

fn remote_write_client(cfg: &RemoteWriteConfig) -> Result<Arc<RwHttpClient>> {
    let client = RwHttpClient::new(
        RwConfig {
            addr: cfg.url.clone(),
            max_batch_size: cfg.max_batch_size,
            max_queue_size: cfg.max_queue_size,
            concurrency: cfg.concurrency,
            flush_interval: cfg.flush_interval,
            headers: cfg.headers.clone(),
            bearer_token: cfg.bearer_token.clone(),
            ..RwConfig::default()
        },
        http_client(30)?,
    )?;
    Ok(Arc::new(client))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| anyhow::anyhow!("invalid time {raw:?}, expected RFC3339: {e}"))
}

async fn run_server(config_path: &str) -> Result<()> {
    let config = ServerConfig::load(config_path)?;

    tracing::info!(
        http_port = config.http_port,
        datasource = %config.datasource.url,
        rule_files = ?config.rule_files,
        "oxrule-server starting"
    );

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install metrics recorder: {e}"))?;

    let qb = querier_builder(&config.datasource)?;
    let rr = config
        .remote_read
        .as_ref()
        .map(querier_builder)
        .transpose()?;
    let rw: Option<Arc<dyn RwClient>> = match &config.remote_write {
        Some(cfg) => Some(remote_write_client(cfg)? as Arc<dyn RwClient>),
        None => {
            tracing::warn!("remote_write is not configured, rule results will not be persisted");
            None
        }
    };

    let notify_client = http_client(30)?;
    let notifiers: Vec<Arc<dyn Notifier>> = config
        .notifiers
        .iter()
        .map(|n| {
            Arc::new(AlertManager::new(
                &n.url,
                notify_client.clone(),
                &config.external_url,
            )) as Arc<dyn Notifier>
        })
        .collect();
    if notifiers.is_empty() {
        tracing::warn!("No notifiers configured, alerts will not be delivered");
    }
    let provider: NotifierProvider = Arc::new(move || notifiers.clone());

    let groups = rules::load(&config.rule_files)?;
    let manager = Arc::new(Manager::new(
        qb,
        Arc::new(config.evaluation.clone()),
        provider,
        rw,
        rr,
    ));
    manager.start(&groups).await;
    tracing::info!(groups = groups.len(), "Rule groups started");

    let shutdown = CancellationToken::new();
    let reload_handle = if config.reload_interval_secs > 0 {
        Some(reload::spawn(
            Arc::clone(&manager),
            config.rule_files.clone(),
            Duration::from_secs(config.reload_interval_secs),
            reload::fingerprint(&groups),
            shutdown.clone(),
        ))
    } else {
        tracing::info!("Rule file reloading disabled");
        None
    };

    let state = AppState {
        manager: Arc::clone(&manager),
        metrics: Some(metrics_handle),
        start_time: Utc::now(),
        config: Arc::new(config.clone()),
    };

    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let app = app::build_http_app(state);
    let http_listener = tokio::net::TcpListener::bind(http_addr).await?;
    tracing::info!(http = %http_addr, "Server started");

    if let Err(e) = axum::serve(http_listener, app)
        .with_graceful_shutdown(async {
            signal::ctrl_c().await.ok();
            tracing::info!("Shutting down gracefully");
        })
        .await
    {
        tracing::error!(error = %e, "HTTP server error");
    }

    shutdown.cancel();
    if let Some(h) = reload_handle {
        h.await.ok();
    }
    manager.close().await;
    tracing::info!("Server stopped");

    Ok(())
}

/// Evaluates every rule over `[start, end)` and writes the results.
async fn run_replay(config_path: &str, start: &str, end: &str) -> Result<()> {
    let config = ServerConfig::load(config_path)?;
    let start = parse_time(start)?;
    let end = parse_time(end)?;
    if start >= end {
        return Err(anyhow::anyhow!("replay start {start} must be before end {end}"));
    }
    let rw_cfg = config
        .remote_write
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("replay requires remote_write to be configured"))?;

    let qb = querier_builder(&config.datasource)?;
    let rw = remote_write_client(rw_cfg)?;
    let settings = Arc::new(config.evaluation.clone());
    let cfgs = rules::load(&config.rule_files)?;

    tracing::info!(
        groups = cfgs.len(),
        start = %start,
        end = %end,
        max_data_points = config.replay.max_data_points,
        "Replay starting"
    );

    let ctx = CancellationToken::new();
    let cancel = ctx.clone();
    tokio::spawn(async move {
        signal::ctrl_c().await.ok();
        cancel.cancel();
    });

    let mut total = 0;
    let mut result = Ok(());
    for cfg in &cfgs {
        let group = Group::new(cfg, qb.as_ref(), Arc::clone(&settings));
        match group
            .replay(
                &ctx,
                start,
                end,
                rw.as_ref(),
                config.replay.max_data_points,
                config.replay.retry_attempts,
                config.replay.rule_delay,
            )
            .await
        {
            Ok(n) => total += n,
            Err(e) => {
                result = Err(anyhow::anyhow!("replay of group {:?} failed: {e}", cfg.name));
                break;
            }
        }
    }

    // flush whatever was written, even after a failure
    rw.close().await?;
    result?;
    tracing::info!(samples = total, "Replay finished");
    Ok(())
}
