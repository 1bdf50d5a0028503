//! Application wiring: builds the shared state and the axum router.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::jobs::{JobManager, JobManagerDeps};
use crate::network::NetworkMonitor;
use crate::planner::IncrementalPlanner;
use crate::pool::{ConnectionPool, StubProbe};
use crate::progress::ProgressBus;
use crate::provider::mock::MockProvider;
use crate::provider::registry::ProviderRegistry;
use crate::jobs::model::Provider;
use crate::retry::{BackoffDiscipline, RetryPolicy};
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::webhook::WebhookDispatcher;

use super::routes;

#[derive(Clone)]
pub struct AppState {
    pub job_manager: Arc<JobManager>,
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<dyn Store>,
    pub providers: Arc<ProviderRegistry>,
    pub planner: Arc<IncrementalPlanner>,
    pub network_monitor: NetworkMonitor,
    pub pool: Option<Arc<ConnectionPool>>,
}

/// Seeds the registry with a `MockProvider` for every known provider
/// variant; real hypervisor/cloud SDKs are out of scope (spec §1) and
/// would be registered here the same way, at startup only (spec Design
/// Notes §9 forbids runtime registration).
fn build_provider_registry() -> Arc<ProviderRegistry> {
    let mut builder = ProviderRegistry::builder();
    for variant in Provider::all() {
        builder = builder.register(Arc::new(MockProvider::new(variant)));
    }
    Arc::new(builder.build())
}

/// Builds the router and the background tasks it depends on. Returns the
/// router plus the handles that `main` should run to completion alongside
/// `axum::serve`.
pub async fn build_app(
    config: &Config,
    store: Arc<dyn Store>,
) -> (Router, Arc<JobManager>, Arc<Scheduler>, NetworkMonitor, Option<Arc<ConnectionPool>>) {
    let network_monitor = NetworkMonitor::new(config.network_monitor.probe_hosts.clone());
    let providers = build_provider_registry();
    let planner = Arc::new(IncrementalPlanner::new(store.clone()));
    let progress_bus = ProgressBus::new();
    let webhooks = Arc::new(WebhookDispatcher::new(store.clone()));

    let pool = if config.pool.enabled {
        Some(ConnectionPool::new(
            config.pool.max_connections,
            config.pool.idle_timeout,
            config.pool.health_check_interval,
            Arc::new(StubProbe),
        ))
    } else {
        None
    };

    let retry_defaults = RetryPolicy {
        max_attempts: config.retry_defaults.max_attempts,
        initial_delay: config.retry_defaults.initial_delay,
        max_delay: config.retry_defaults.max_delay,
        multiplier: config.retry_defaults.multiplier,
        discipline: BackoffDiscipline::Exponential,
        jitter: config.retry_defaults.jitter,
        wait_for_network: config.retry_defaults.wait_for_network,
        retryable_categories: Vec::new(),
    };

    let job_manager = JobManager::new(JobManagerDeps {
        store: store.clone(),
        providers: providers.clone(),
        pool: pool.clone(),
        planner: planner.clone(),
        progress_bus,
        webhooks,
        network_monitor: network_monitor.clone(),
        retry_defaults,
    });

    let scheduler = Scheduler::new(
        store.clone(),
        job_manager.clone(),
        config.scheduler.default_timezone.clone(),
    );
    scheduler.load_schedules().await.ok();

    let state = AppState {
        job_manager: job_manager.clone(),
        scheduler: scheduler.clone(),
        store,
        providers,
        planner,
        network_monitor: network_monitor.clone(),
        pool: pool.clone(),
    };

    let router = Router::new()
        .route("/jobs/submit", post(routes::submit_job))
        .route("/jobs/query", post(routes::query_jobs))
        .route("/jobs/cancel", post(routes::cancel_job))
        .route("/jobs/:id/progress", get(routes::job_progress))
        .route("/jobs/:id/stream", get(routes::job_stream))
        .route(
            "/schedules",
            post(routes::create_schedule).get(routes::list_schedules),
        )
        .route(
            "/schedules/:id",
            get(routes::get_schedule)
                .put(routes::update_schedule)
                .delete(routes::delete_schedule),
        )
        .route("/schedules/:id/history", get(routes::schedule_history))
        .route("/cbt/enable", post(routes::cbt_enable))
        .route("/cbt/disable", post(routes::cbt_disable))
        .route("/cbt/status", post(routes::cbt_status))
        .route("/incremental/analyze", post(routes::incremental_analyze))
        .route("/capabilities", get(routes::capabilities))
        .route("/health", get(routes::health))
        .route("/status", get(routes::status))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    (router, job_manager, scheduler, network_monitor, pool)
}
