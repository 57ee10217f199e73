//! Wiring of stage handlers onto a bus and store

use crate::config::{AgentConfig, ExecutorKind, StageKind};
use anyhow::{Context, Result};
use axum::Router;
use remedy_lib::{
    alert::{AlertHandler, LogNotifier, Notifier, WebhookNotifier},
    analyzer::{AnalyzerHandler, RuleScorer, SeverityWeights},
    bus::{EventBus, InMemoryBus},
    coordinator::{self, CoordinatorState, RemoteCoordinator},
    health::components,
    http::ops_router,
    monitor::{JsonFileSource, MonitorLoopBuilder, ThresholdClassifier},
    responder::{ActionCatalog, ActionExecutor, CommandExecutor, LogExecutor, ResponderHandler},
    store::{CoordinationStore, MemoryStore},
    Emitter, EventLogger, HealthRegistry, ObservabilityHandler, PipelineMetrics, StageHandler,
    StageRunner,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How often store health and stage uptime are refreshed
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(15);

/// A launched process: the HTTP surface plus its background tasks
pub struct Launched {
    pub router: Router,
    pub tasks: Vec<JoinHandle<()>>,
}

/// Everything a stage needs to attach to the pipeline
struct StageContext {
    config: AgentConfig,
    bus: Arc<dyn EventBus>,
    store: Arc<dyn CoordinationStore>,
    registry: HealthRegistry,
    metrics: PipelineMetrics,
    logger: EventLogger,
    shutdown: watch::Receiver<bool>,
}

impl StageContext {
    fn emitter(&self) -> Emitter {
        Emitter::new(self.bus.clone(), self.metrics.clone())
    }

    /// Subscribe `handler` and run it in the background
    ///
    /// A subscription failure is returned so startup aborts.
    async fn spawn_runner<H: StageHandler>(&self, handler: H) -> Result<JoinHandle<()>> {
        let name = handler.name();
        let runner = StageRunner::new(Arc::new(handler), self.bus.clone())
            .with_poll_timeout(self.config.poll_timeout())
            .subscribe()
            .await?;
        let shutdown = self.shutdown.clone();
        self.logger.log_startup(name, env!("CARGO_PKG_VERSION"));

        Ok(tokio::spawn(async move {
            let stats = runner.run(shutdown).await;
            info!(
                stage = name,
                received = stats.received,
                handled = stats.handled,
                faults = stats.faults,
                "Stage runner drained"
            );
        }))
    }

    fn spawn_monitor(&self) -> Result<JoinHandle<()>> {
        let path = self
            .config
            .monitor
            .source_path
            .clone()
            .context("monitor.source_path is required for the monitor stage")?;
        let monitor = MonitorLoopBuilder::new()
            .source(Arc::new(JsonFileSource::new(path)))
            .classifier(Box::new(ThresholdClassifier::new(
                self.config.monitor.thresholds.clone(),
            )))
            .emitter(self.emitter())
            .interval(Duration::from_secs(self.config.monitor.interval_secs))
            .jitter(Duration::from_millis(self.config.monitor.jitter_ms))
            .node_name(self.config.node_name.clone())
            .build()?;
        self.logger.log_startup("monitor", env!("CARGO_PKG_VERSION"));
        Ok(tokio::spawn(monitor.run(self.shutdown.clone())))
    }

    fn analyzer(&self) -> AnalyzerHandler {
        let scorer = RuleScorer::new(
            SeverityWeights::default(),
            self.config.analyzer.min_confidence,
        );
        AnalyzerHandler::new(Arc::new(scorer))
    }

    fn responder(&self) -> Result<ResponderHandler> {
        let settings = &self.config.responder;
        let catalog = if settings.catalog.is_empty() {
            ActionCatalog::default()
        } else {
            ActionCatalog::new(settings.catalog.iter().cloned())
                .context("Invalid responder.catalog")?
        };
        let executor: Arc<dyn ActionExecutor> = match settings.executor {
            ExecutorKind::Log => Arc::new(LogExecutor),
            ExecutorKind::Command => Arc::new(CommandExecutor::new()),
        };
        info!(
            actions = catalog.len(),
            dry_run = settings.dry_run,
            "Responder catalog loaded"
        );
        Ok(ResponderHandler::new(self.store.clone(), catalog, executor)
            .with_dry_run(settings.dry_run)
            .with_logger(self.logger.clone()))
    }

    fn alert(&self) -> Result<AlertHandler> {
        let settings = &self.config.alert;
        let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier::new())];
        if let Some(url) = &settings.webhook_url {
            notifiers.push(Arc::new(
                WebhookNotifier::new(url).context("Invalid alert.webhook_url")?,
            ));
        }
        Ok(AlertHandler::new(self.store.clone(), notifiers)
            .with_dedup_window(Duration::from_secs(settings.dedup_window_secs))
            .with_min_severity(settings.min_severity)
            .with_logger(self.logger.clone()))
    }

    /// Periodically probe the store and publish stage uptime
    fn spawn_housekeeping(&self, stage: &'static str) -> JoinHandle<()> {
        let store = self.store.clone();
        let registry = self.registry.clone();
        let metrics = self.metrics.clone();
        let mut shutdown = self.shutdown.clone();
        let started = Instant::now();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HOUSEKEEPING_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        registry.probe_store(store.as_ref()).await;
                        metrics.set_stage_uptime(stage, started.elapsed().as_secs_f64());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// Start the process described by `config`
pub async fn launch(
    config: AgentConfig,
    registry: HealthRegistry,
    shutdown: watch::Receiver<bool>,
) -> Result<Launched> {
    registry.register(components::BUS);
    registry.register(components::STORE);
    registry.register(components::STAGE);

    let metrics = PipelineMetrics::new();
    let logger = EventLogger::new(&config.node_name);
    let stage = config.stage;

    if stage == StageKind::Coordinator {
        let state = Arc::new(CoordinatorState::new(
            Arc::new(InMemoryBus::new()),
            Arc::new(MemoryStore::new()),
        ));
        logger.log_startup(stage.as_str(), env!("CARGO_PKG_VERSION"));
        return Ok(Launched {
            router: coordinator::router(state).merge(ops_router(registry)),
            tasks: Vec::new(),
        });
    }

    let (bus, store): (Arc<dyn EventBus>, Arc<dyn CoordinationStore>) = if stage == StageKind::All
    {
        (Arc::new(InMemoryBus::new()), Arc::new(MemoryStore::new()))
    } else {
        let remote = RemoteCoordinator::new(&config.coordinator_url)?;
        remote.health().await.with_context(|| {
            format!(
                "Coordinator at {} failed its health check",
                config.coordinator_url
            )
        })?;
        info!(coordinator_url = %config.coordinator_url, "Coordinator reachable");
        (Arc::new(remote.clone()), Arc::new(remote))
    };

    let ctx = StageContext {
        config,
        bus,
        store,
        registry: registry.clone(),
        metrics,
        logger,
        shutdown,
    };

    let mut tasks = Vec::new();
    match stage {
        StageKind::Monitor => tasks.push(ctx.spawn_monitor()?),
        StageKind::Analyzer => tasks.push(ctx.spawn_runner(ctx.analyzer()).await?),
        StageKind::Responder => tasks.push(ctx.spawn_runner(ctx.responder()?).await?),
        StageKind::Alert => tasks.push(ctx.spawn_runner(ctx.alert()?).await?),
        StageKind::Observability => tasks.push(
            ctx.spawn_runner(ObservabilityHandler::new(ctx.metrics.clone()))
                .await?,
        ),
        StageKind::All => {
            // Sinks first so nothing published upstream is missed
            tasks.push(
                ctx.spawn_runner(ObservabilityHandler::new(ctx.metrics.clone()))
                    .await?,
            );
            tasks.push(ctx.spawn_runner(ctx.alert()?).await?);
            tasks.push(ctx.spawn_runner(ctx.responder()?).await?);
            tasks.push(ctx.spawn_runner(ctx.analyzer()).await?);
            if ctx.config.monitor.source_path.is_some() {
                tasks.push(ctx.spawn_monitor()?);
            } else {
                warn!("monitor.source_path not set; running without a monitor");
            }
        }
        StageKind::Coordinator => {}
    }
    tasks.push(ctx.spawn_housekeeping(stage.as_str()));

    Ok(Launched {
        router: ops_router(registry),
        tasks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    /// Coordinator stand-in that passes the health gate but has no bus routes
    async fn spawn_health_only() -> String {
        let app = Router::new().route("/healthz", get(|| async { "ok" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn config(stage: StageKind, coordinator_url: &str) -> AgentConfig {
        let mut config = AgentConfig::from_sources(None, None).unwrap();
        config.stage = stage;
        config.coordinator_url = coordinator_url.to_string();
        config
    }

    #[tokio::test]
    async fn test_subscribe_failure_aborts_launch() {
        let url = spawn_health_only().await;
        let (_tx, rx) = watch::channel(false);

        let err = match launch(config(StageKind::Analyzer, &url), HealthRegistry::new(), rx).await {
            Ok(_) => panic!("launch should fail"),
            Err(e) => e,
        };
        assert!(format!("{:#}", err).contains("Failed to subscribe analyzer"));
    }

    #[tokio::test]
    async fn test_unreachable_coordinator_aborts_launch() {
        let (_tx, rx) = watch::channel(false);
        let result = launch(
            config(StageKind::Alert, "http://127.0.0.1:9"),
            HealthRegistry::new(),
            rx,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_all_in_one_launch_spawns_stages() {
        let (tx, rx) = watch::channel(false);
        let launched = launch(
            config(StageKind::All, "http://unused:8080"),
            HealthRegistry::new(),
            rx,
        )
        .await
        .unwrap();

        // Four runners plus housekeeping; no monitor without a source
        assert_eq!(launched.tasks.len(), 5);
        tx.send(true).unwrap();
        for task in launched.tasks {
            task.await.unwrap();
        }
    }
}
