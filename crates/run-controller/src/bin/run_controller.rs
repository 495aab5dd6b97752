/*
 * 5D Labs Agent Platform - Run Controller Service
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Run Controller Service
//!
//! Hosts the run engine inside one process:
//! - Runnable store, event bus and run manager
//! - One polling monitor per Kubernetes framework, plus watch triggers
//! - Health, readiness and metrics endpoints

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use clap::Parser;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use kube::Api;
use run_controller::cluster::Cluster;
use run_controller::config::ControllerConfig;
use run_controller::frameworks::builder::K8sBuilder;
use run_controller::frameworks::FrameworkRegistry;
use run_controller::manager::{
    EventBus, EventHandler, InMemoryRunRepository, KeyedLocks, RunManager, RunnableDispatcher,
};
use run_controller::model::{Credentials, RunnableChangedEvent};
use run_controller::monitor::watcher::spawn_watcher;
use run_controller::monitor::{kubernetes_monitors, spawn_monitor, RunnableMonitor};
use run_controller::runtime::container::ContainerRuntime;
use run_controller::runtime::{
    ClusterSecretService, InMemoryEntities, RuntimeRegistry, StaticConfiguration,
    StaticCredentials,
};
use run_controller::store::{RedbRunnableStore, RunnableStore};
use serde_json::{json, Value};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "run-controller", version, about = "Run execution engine")]
struct Args {
    /// Controller configuration file
    #[arg(long, env = "CONTROLLER_CONFIG_PATH", default_value = "/config/config.yaml")]
    config: String,

    /// Namespace override; defaults to the configured namespace
    #[arg(long, env = "RUN_NAMESPACE")]
    namespace: Option<String>,

    /// HTTP listen address
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind: String,

    /// Log output format: `text` or `json`
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    log_format: String,
}

#[derive(Clone)]
struct AppState {
    manager: Arc<RunManager>,
    store: Arc<dyn RunnableStore>,
    frameworks: Vec<&'static str>,
    ready: Arc<AtomicBool>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.log_format.eq_ignore_ascii_case("json"));

    info!(
        "Starting 5D Labs Run Controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let mut config = load_controller_config(&args.config);
    if let Some(namespace) = args.namespace {
        config.namespace = namespace;
    }
    config.validate()?;
    let config = Arc::new(config);

    let client = kube::Client::try_default().await?;
    info!(namespace = %config.namespace, "Connected to Kubernetes cluster");
    let cluster = Cluster::new(client.clone(), &config.namespace);

    let store: Arc<dyn RunnableStore> = Arc::new(RedbRunnableStore::open(&config.store.path)?);
    info!(path = %config.store.path, "Opened runnable store");

    let cancel = CancellationToken::new();
    let locks = KeyedLocks::new();
    let (events, receiver) = EventBus::<RunnableChangedEvent>::channel(config.events.capacity);

    let frameworks = FrameworkRegistry::kubernetes(&cluster, &config);
    let framework_names = frameworks.names();
    let dispatcher = RunnableDispatcher::new(frameworks, store.clone(), locks.clone(), events.clone());

    let entities = Arc::new(InMemoryEntities::new());
    let mut runtimes = RuntimeRegistry::new();
    runtimes.register(Arc::new(ContainerRuntime::new(
        config.clone(),
        entities.clone(),
        Arc::new(ClusterSecretService::new(cluster.secrets.clone())),
        Arc::new(StaticCredentials::new(Credentials::new(BTreeMap::new()))),
        Arc::new(StaticConfiguration::new(configuration_from_env())),
    )));

    let manager = Arc::new(RunManager::new(
        Arc::new(InMemoryRunRepository::new()),
        runtimes,
        entities,
        dispatcher,
    ));

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    let handler: Arc<dyn EventHandler<RunnableChangedEvent>> = manager.clone();
    tasks.push(receiver.spawn(handler, config.events.workers, cancel.clone()));

    let monitors = kubernetes_monitors(&cluster, &config, &store, &locks, &events);
    for monitor in &monitors {
        let recovered = monitor.cycle().await;
        info!(framework = monitor.framework(), recovered, "Recovery pass finished");
    }
    let interval = Duration::from_secs(config.monitor.interval_seconds);
    for monitor in &monitors {
        tasks.push(spawn_monitor(monitor.clone(), interval, cancel.clone()));
    }
    if config.watcher.enabled {
        tasks.extend(spawn_watchers(&client, &config, &monitors, &cancel));
    }

    let ready = Arc::new(AtomicBool::new(true));
    let state = AppState {
        manager,
        store,
        frameworks: framework_names,
        ready: ready.clone(),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(TimeoutLayer::new(Duration::from_secs(30))),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&args.bind).await?;
    info!("Run controller HTTP server listening on {}", args.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    ready.store(false, Ordering::SeqCst);
    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }
    info!("Run controller stopped");

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,run_controller=debug".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

fn load_controller_config(config_path: &str) -> ControllerConfig {
    if !Path::new(config_path).exists() {
        info!("No configuration at {}, using defaults", config_path);
        return ControllerConfig::default();
    }
    match ControllerConfig::from_mounted_file(config_path) {
        Ok(cfg) => {
            info!("Loaded controller configuration from {}", config_path);
            cfg
        }
        Err(err) => {
            warn!(
                "Failed to load configuration from {}: {}. Using defaults.",
                config_path, err
            );
            ControllerConfig::default()
        }
    }
}

/// `RUN_CONFIG_<KEY>=value` entries become runnable configurations.
fn configuration_from_env() -> BTreeMap<String, String> {
    std::env::vars()
        .filter_map(|(key, value)| {
            key.strip_prefix("RUN_CONFIG_")
                .filter(|k| !k.is_empty())
                .map(|k| (k.to_lowercase(), value))
        })
        .collect()
}

fn spawn_watchers(
    client: &kube::Client,
    config: &Arc<ControllerConfig>,
    monitors: &[Arc<dyn RunnableMonitor>],
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let builder = K8sBuilder::new(config.clone());
    let run_label = builder.run_label_key();
    let namespace = config.namespace.as_str();
    let find = |name: &str| monitors.iter().find(|m| m.framework() == name).cloned();

    let mut handles = Vec::new();
    if let Some(monitor) = find("k8sjob") {
        handles.push(spawn_watcher(
            Api::<Job>::namespaced(client.clone(), namespace),
            builder.framework_selector("k8sjob"),
            run_label.clone(),
            monitor,
            &config.watcher,
            cancel.clone(),
        ));
    }
    if let Some(monitor) = find("k8sbuild") {
        handles.push(spawn_watcher(
            Api::<Job>::namespaced(client.clone(), namespace),
            builder.framework_selector("k8sbuild"),
            run_label.clone(),
            monitor,
            &config.watcher,
            cancel.clone(),
        ));
    }
    if let Some(monitor) = find("k8scronjob") {
        handles.push(spawn_watcher(
            Api::<CronJob>::namespaced(client.clone(), namespace),
            builder.framework_selector("k8scronjob"),
            run_label.clone(),
            monitor,
            &config.watcher,
            cancel.clone(),
        ));
    }
    for name in ["k8sdeployment", "k8sserve"] {
        if let Some(monitor) = find(name) {
            handles.push(spawn_watcher(
                Api::<Deployment>::namespaced(client.clone(), namespace),
                builder.framework_selector(name),
                run_label.clone(),
                monitor,
                &config.watcher,
                cancel.clone(),
            ));
        }
    }
    handles
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "run-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if !state.ready.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({
        "status": "ready",
        "service": "run-controller",
        "version": env!("CARGO_PKG_VERSION")
    })))
}

async fn metrics(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let runs = state
        .manager
        .list()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let mut runs_by_state: BTreeMap<String, usize> = BTreeMap::new();
    for run in &runs {
        *runs_by_state.entry(run.state.to_string()).or_default() += 1;
    }

    let mut runnables: BTreeMap<&str, usize> = BTreeMap::new();
    for framework in &state.frameworks {
        let stored = state
            .store
            .find_all(framework)
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        runnables.insert(*framework, stored.len());
    }

    Ok(Json(json!({
        "service": "run-controller",
        "version": env!("CARGO_PKG_VERSION"),
        "runs": runs.len(),
        "runsByState": runs_by_state,
        "runnables": runnables,
    })))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
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
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
