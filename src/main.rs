use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::Request;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod analytics;
mod config;
mod dashboard;
mod error;
mod health;
mod pipeline;
mod proxy;

use analytics::api::{AnalyticsState, WeightsFn};
use analytics::{Analyzer, AnalyzerConfig, TrafficStore};
use config::Config;
use dashboard::api::DashboardState;
use dashboard::{EventBus, LogStore};
use health::HealthRegistry;
use pipeline::adaptive::{AdaptiveRateLimitStage, AdaptiveRateLimiter};
use pipeline::auth::AuthStage;
use pipeline::breaker::{CircuitBreaker, CircuitBreakerStage};
use pipeline::capture::LogCaptureStage;
use pipeline::logging::LoggingStage;
use pipeline::metrics::MetricsStage;
use pipeline::rate_limit::{RateLimitStage, RateLimiter};
use pipeline::request_id::RequestIdStage;
use pipeline::traffic::TrafficRecorder;
use pipeline::{chain, Handler, Stage};
use proxy::{Balancer, ProxyEngine, RouteTable, Selector, WeightedBalancer};

/// How long in-flight requests get to finish after the shutdown signal.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "adaptive-gateway")]
#[command(about = "Adaptive HTTP reverse-proxy gateway")]
struct Args {
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    #[arg(long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load(&args.config).await?;

    if args.validate_config {
        info!("configuration is valid");
        return Ok(());
    }

    run(config).await
}

async fn run(config: Config) -> Result<()> {
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install metrics recorder: {e}"))?;

    let cancel = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // Health registry probes the union of all route backends.
    let health = Arc::new(HealthRegistry::new(&config.all_backend_urls()));
    tasks.push(health.spawn(config.health_check.interval(), cancel.clone()));

    // Dashboard stores and event stream.
    let log_store = Arc::new(LogStore::new(config.dashboard.log_capacity));
    let events = Arc::new(EventBus::new(config.dashboard.sse_buffer));
    {
        let events = events.clone();
        health.set_on_state_change(Arc::new(move |url, healthy| {
            events.publish("health", &json!({ "url": url, "healthy": healthy }));
        }));
    }

    // Traffic intelligence: store, retention sweep, analyzer.
    let intelligence = if config.analytics.enabled {
        let store = Arc::new(TrafficStore::new(
            config.analytics.bucket_interval,
            config.analytics.retention,
        ));
        tasks.push(store.spawn_retention(cancel.clone()));

        let analyzer = Arc::new(Analyzer::new(
            store.clone(),
            AnalyzerConfig {
                interval: config.analytics.analyzer_interval,
                ..AnalyzerConfig::default()
            },
        ));
        tasks.push(analyzer.spawn(cancel.clone()));

        // Relay anomalies onto the operator event stream.
        let mut anomaly_rx = analyzer.subscribe();
        let anomaly_events = events.clone();
        let anomaly_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = anomaly_cancel.cancelled() => break,
                    received = anomaly_rx.recv() => match received {
                        Ok(anomaly) => anomaly_events.publish("anomaly", &anomaly),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    },
                }
            }
        }));

        Some((store, analyzer))
    } else {
        None
    };

    // Route table and proxy core.
    let prefixes: Vec<String> = config.routes.iter().map(|r| r.path.clone()).collect();
    let table = Arc::new(RouteTable::new(&prefixes));
    let engine = Arc::new(ProxyEngine::new(table.clone(), health.clone())?);

    // Selectors: weighted where enabled and learnable, round-robin/random
    // otherwise.
    let mut weighted_balancers: Vec<Arc<WeightedBalancer>> = Vec::new();
    for route in &config.routes {
        let backends = route.backend_urls();
        let weighted = config.weighted_lb.enabled && backends.len() > 1;
        match (&intelligence, weighted) {
            (Some((_, analyzer)), true) => {
                let balancer = Arc::new(WeightedBalancer::new(
                    backends,
                    analyzer.clone(),
                    Some(health.clone()),
                    config.weighted_lb.rebalance_interval,
                ));
                tasks.push(balancer.spawn(cancel.clone()));
                engine.set_selector(&route.path, balancer.clone() as Arc<dyn Selector>);
                weighted_balancers.push(balancer);
                info!(route = %route.path, "weighted load balancing enabled");
            }
            _ => {
                engine.set_selector(
                    &route.path,
                    Arc::new(Balancer::new(backends, route.strategy, Some(health.clone()))),
                );
            }
        }
        info!(route = %route.path, backends = ?route.backend_urls(), strategy = ?route.strategy, "route registered");
    }

    // Enforcement components.
    let static_limiter = Arc::new(RateLimiter::new(
        config.rate_limit.max_tokens,
        config.rate_limit.refill_rate,
    ));

    let mut breaker = CircuitBreaker::new(
        config.circuit_breaker.threshold,
        config.circuit_breaker.timeout(),
    );
    if let Some((_, analyzer)) = &intelligence {
        breaker = breaker.with_analyzer(analyzer.clone());
    }
    let breaker = Arc::new(breaker);

    let adaptive = intelligence.as_ref().map(|(_, analyzer)| {
        Arc::new(AdaptiveRateLimiter::new(
            static_limiter.clone(),
            analyzer.clone(),
            table.clone(),
            config.adaptive_rate_limit.clone(),
        ))
    });

    // The pipeline, outermost stage first.
    let mut stages: Vec<Arc<dyn Stage>> = vec![Arc::new(RequestIdStage)];
    if config.dashboard.enabled {
        let (capture, drain) = LogCaptureStage::new(log_store.clone(), events.clone(), cancel.clone());
        tasks.push(drain);
        stages.push(Arc::new(capture));
    }
    stages.push(Arc::new(MetricsStage));
    if let Some((store, _)) = &intelligence {
        let (recorder, drain) = TrafficRecorder::new(store.clone(), table.clone(), cancel.clone());
        tasks.push(drain);
        stages.push(Arc::new(recorder));
    }
    stages.push(Arc::new(LoggingStage));
    match &adaptive {
        Some(adaptive) => stages.push(Arc::new(AdaptiveRateLimitStage::new(adaptive.clone()))),
        None => stages.push(Arc::new(RateLimitStage::new(static_limiter.clone()))),
    }
    stages.push(Arc::new(AuthStage::new(&config.auth)));
    stages.push(Arc::new(CircuitBreakerStage::new(breaker)));

    let terminal = {
        let engine = engine.clone();
        Handler::new(move |req| {
            let engine = engine.clone();
            async move { engine.handle(req).await }
        })
    };
    let gateway = chain(terminal, stages);

    // Operator surface; reserved paths bypass the pipeline entirely.
    let mut app = Router::new()
        .route("/health", get(health::health_endpoint).with_state(health.clone()))
        .route(
            "/metrics",
            get(move || {
                let prometheus = prometheus.clone();
                async move { prometheus.render() }
            }),
        );

    if let Some((store, analyzer)) = &intelligence {
        let weights_fn: Option<WeightsFn> = (!weighted_balancers.is_empty()).then(|| {
            let balancers = weighted_balancers.clone();
            Arc::new(move || {
                let mut merged = HashMap::new();
                for balancer in &balancers {
                    merged.extend(balancer.weights());
                }
                merged
            }) as WeightsFn
        });
        app = app.nest(
            "/analytics",
            analytics::api::router(AnalyticsState {
                analyzer: analyzer.clone(),
                store: store.clone(),
                adaptive: adaptive.clone(),
                weights: weights_fn,
                default_multiplier: config.adaptive_rate_limit.multiplier,
            }),
        );
    }

    if config.dashboard.enabled {
        app = app.nest(
            "/dashboard/api",
            dashboard::api::router(DashboardState {
                logs: log_store.clone(),
                events: events.clone(),
            }),
        );
    }

    let app = app
        .fallback(move |req: Request| {
            let gateway = gateway.clone();
            async move { gateway.call(req).await }
        })
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(address = %addr, "gateway listening");

    let drain_started = CancellationToken::new();
    let mut serve_task = {
        let drain = drain_started.clone();
        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { drain.cancelled().await });
        tokio::spawn(async move { server.await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        result = &mut serve_task => {
            result??;
            anyhow::bail!("server exited unexpectedly");
        }
    }

    // Let in-flight requests drain, bounded, then stop the background tasks.
    drain_started.cancel();
    match tokio::time::timeout(SHUTDOWN_DRAIN, serve_task).await {
        Ok(result) => result??,
        Err(_) => warn!("drain timed out, abandoning in-flight requests"),
    }

    cancel.cancel();
    let _ = tokio::time::timeout(
        Duration::from_secs(2),
        futures_util::future::join_all(tasks),
    )
    .await;

    info!("gateway shutdown complete");
    Ok(())
}
