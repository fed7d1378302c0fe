use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::sync::watch;

use testfleet_common::config::Strategy;
use testfleet_common::{load_config, BuildId, FleetConfig, Result, SystemClock, UnitId, WorkerId};
use testfleet_core::ordering::{random, suite_bin_packing, timing_based, OrderingOutput};
use testfleet_core::timing::JsonTimingFile;
use testfleet_core::{Keyspace, Kv, MasterCoordinator, RedisKv, Supervisor, SupervisorOutcome, WorkerLoop};

mod shell_executor;
use shell_executor::ShellExecutor;

/// Shared state for the ambient health/metrics surface (spec SPEC_FULL §6).
struct AppState {
    kv: Arc<RedisKv>,
    metrics_handle: PrometheusHandle,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("testfleet starting");

    let config_path = std::env::var("CQ_CONFIG_FILE").ok().map(PathBuf::from);
    let config = match load_config(config_path.as_deref()) {
        Ok(config) => {
            tracing::info!("configuration loaded successfully");
            Arc::new(config)
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration — refusing to start");
            std::process::exit(1);
        }
    };

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus metrics recorder");

    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let kv = match RedisKv::connect(&redis_url).await {
        Ok(kv) => Arc::new(kv),
        Err(e) => {
            tracing::error!(error = %e, "failed to connect to redis");
            std::process::exit(1);
        }
    };

    let build_id = match std::env::var("CQ_BUILD_ID") {
        Ok(v) => BuildId::new(v),
        Err(_) => {
            tracing::error!("CQ_BUILD_ID must be set");
            std::process::exit(1);
        }
    };
    let worker_id = std::env::var("CQ_WORKER_ID")
        .map(WorkerId::new)
        .unwrap_or_else(|_| WorkerId::new(default_worker_id()));

    let keyspace = Keyspace::new(&build_id, config.namespace.as_deref());
    let clock = Arc::new(SystemClock);

    let app_state = Arc::new(AppState {
        kv: Arc::clone(&kv),
        metrics_handle,
    });
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(app_state);

    let port: u16 = std::env::var("CQ_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind TCP listener");
    tokio::spawn(async move {
        tracing::info!(port, "health/metrics endpoint listening");
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "http server exited");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
    });

    let role = std::env::var("CQ_ROLE").unwrap_or_else(|_| "worker".to_string());
    let outcome = match role.as_str() {
        "supervisor" => run_supervisor(kv, clock, keyspace, config).await,
        "worker" => run_worker(kv, clock, keyspace, worker_id, config, shutdown_rx).await,
        other => {
            tracing::error!(role = other, "unknown CQ_ROLE, expected worker or supervisor");
            std::process::exit(2);
        }
    };

    match outcome {
        Ok(()) => tracing::info!("testfleet exiting cleanly"),
        Err(e) => {
            tracing::error!(error = %e, "testfleet exiting with error");
            std::process::exit(1);
        }
    }
}

async fn run_worker(
    kv: Arc<RedisKv>,
    clock: Arc<SystemClock>,
    keyspace: Keyspace,
    worker_id: WorkerId,
    config: Arc<FleetConfig>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let units = load_units()?;
    let total_units = units.len();

    let coordinator = MasterCoordinator::new(
        Arc::clone(&kv),
        Arc::clone(&clock),
        keyspace.clone(),
        worker_id.clone(),
        Arc::clone(&config),
    );
    let cfg_for_ordering = Arc::clone(&config);
    coordinator
        .run(move || build_ordering(&cfg_for_ordering, units))
        .await?;

    let executor_template = std::env::var("CQ_EXECUTOR_COMMAND")
        .unwrap_or_else(|_| "true {unit}".to_string());
    let executor = Arc::new(ShellExecutor::new(&executor_template));

    let mut worker = WorkerLoop::new(
        kv,
        clock,
        executor,
        keyspace,
        worker_id,
        config,
        shutdown,
    );
    worker.wait_for_master().await?;
    let outcome = worker.run(total_units).await?;
    tracing::info!(?outcome, "worker loop finished");
    worker.shutdown().await
}

async fn run_supervisor(
    kv: Arc<RedisKv>,
    clock: Arc<SystemClock>,
    keyspace: Keyspace,
    config: Arc<FleetConfig>,
) -> Result<()> {
    let failure_file = std::env::var("CQ_FAILURE_FILE").ok().map(PathBuf::from);
    let supervisor = Supervisor::new(kv, clock, keyspace, config, failure_file);
    let outcome = supervisor.run().await?;
    tracing::info!(?outcome, "supervisor finished");
    if outcome != SupervisorOutcome::Exhausted {
        return Err(testfleet_common::FleetError::Internal(format!(
            "build did not exhaust cleanly: {outcome:?}"
        )));
    }
    Ok(())
}

/// Dispatches to the configured ordering strategy (spec §4.3). The
/// Redis-backed EMA timing store only has a single-key update/read
/// surface (spec §5), not a bulk scan; the CLI resolves durations from
/// the JSON fallback file only, per DESIGN.md.
fn build_ordering(config: &FleetConfig, units: Vec<UnitId>) -> OrderingOutput {
    let json_fallback = config
        .timing_file
        .as_ref()
        .and_then(|path| match JsonTimingFile::load(Path::new(path)) {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::warn!(error = %e, path = %path, "failed to load timing file, ignoring");
                None
            }
        });

    match config.strategy {
        Strategy::Random => random::order(units, None),
        Strategy::TimingBased => timing_based::order(
            units,
            None,
            json_fallback.as_ref(),
            config.timing_fallback_duration_ms as f64,
        ),
        Strategy::SuiteBinPacking => suite_bin_packing::order(
            units,
            None,
            json_fallback.as_ref(),
            config.timing_fallback_duration_ms as f64,
            &config.chunking,
        ),
    }
}

/// Reads the newline-delimited unit id list the caller supplies (spec §1
/// "a list of unit descriptors"), from `CQ_UNITS_FILE` or stdin when that
/// var is `-` or unset. Blank lines and `#`-prefixed comments are skipped.
fn load_units() -> Result<Vec<UnitId>> {
    let source = std::env::var("CQ_UNITS_FILE").unwrap_or_else(|_| "-".to_string());
    let content = if source == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| testfleet_common::FleetError::Config(format!("reading stdin: {e}")))?;
        buf
    } else {
        std::fs::read_to_string(&source)
            .map_err(|e| testfleet_common::FleetError::Config(format!("reading {source}: {e}")))?
    };

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(UnitId::new)
        .collect())
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    format!("{host}-{}", std::process::id())
}

/// Health check endpoint: reports whether the KV backend is reachable.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let healthy = state.kv.health_check().await.is_ok();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
    });
    (status, Json(body))
}

/// Prometheus metrics endpoint.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}
