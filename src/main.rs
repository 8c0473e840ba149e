use anyhow::Context;
use clap::Parser;
use rugfeed::adapters::{CaptureSource, CdpSource, DirectSource};
use rugfeed::cli::{self, Cli, Commands};
use rugfeed::config::{AppConfig, LoggingConfig};
use rugfeed::coordination::shutdown::{install_signal_handlers, PhaseFuture};
use rugfeed::coordination::{GracefulShutdown, ShutdownConfig, SourceManager};
use rugfeed::persistence::{spawn_writer, EventStore};
use rugfeed::services::{
    EventBus, EventNormalizer, FeedPipeline, FeedStatus, HealthServer, LiveStateProvider, WILDCARD,
};
use rugfeed::supervisor::{IntegrityMonitor, SourceHealthTable};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Bus channel depth between the ingestion loop and the store writer
const WRITER_CHANNEL_CAPACITY: usize = 8192;

const CDP_SOURCE_ID: &str = "cdp";
const DIRECT_SOURCE_ID: &str = "direct";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::load_from(&cli.config).context("loading configuration")?;
    if let Some(root) = &cli.store_root {
        config.store.root_dir = root.clone();
    }

    match &cli.command {
        Some(Commands::Replay {
            session,
            after,
            renormalize,
            speed,
        }) => {
            init_logging_simple();
            if *renormalize {
                cli::renormalize_session(&config.store.root_dir, *session, *after, *speed).await?;
            } else {
                cli::print_session(&config.store.root_dir, *session, *after)?;
            }
        }
        Some(Commands::Manifest { session }) => {
            init_logging_simple();
            cli::list_sessions(&config.store.root_dir, *session)?;
        }
        Some(Commands::Run) | None => {
            init_logging(&config.logging);
            if let Err(errors) = config.validate() {
                for e in &errors {
                    error!("Invalid configuration: {}", e);
                }
                anyhow::bail!("{} configuration error(s)", errors.len());
            }
            run_feed(config).await?;
        }
    }

    Ok(())
}

async fn run_feed(config: AppConfig) -> anyhow::Result<()> {
    let health = Arc::new(SourceHealthTable::new(config.monitor.clone()));
    let integrity = Arc::new(IntegrityMonitor::default());

    let mut sources: Vec<Arc<dyn CaptureSource>> = Vec::new();
    if config.sources.cdp.enabled {
        sources.push(Arc::new(CdpSource::new(
            CDP_SOURCE_ID,
            &config.sources.cdp,
            config.reconnect.clone(),
            health.clone(),
        )?));
    }
    if config.sources.direct.enabled {
        sources.push(Arc::new(DirectSource::new(
            DIRECT_SOURCE_ID,
            &config.sources.direct,
            config.reconnect.clone(),
            health.clone(),
        )?));
    }

    let manager = Arc::new(SourceManager::new(health.clone(), config.monitor.clone()));
    for source in &sources {
        manager.register(source.source_id(), source.kind());
    }

    // Store first: the normalizer resumes after the last durable sequence
    let store = EventStore::open(&config.store).context("opening event store")?;
    let session_id = store.session_id();
    let resume_after = store.last_flushed_sequence();

    let bus = EventBus::new();
    let (writer_rx, _writer_sub) = bus.subscribe_channel(WILDCARD, WRITER_CHANNEL_CAPACITY);
    let writer = Arc::new(spawn_writer(store, &config.store, writer_rx));

    let live = LiveStateProvider::new();
    let _live_sub = live.attach(&bus);

    let mut normalizer = EventNormalizer::new(session_id, integrity.clone());
    normalizer.resume_after(resume_after);

    let mut pipeline = FeedPipeline::new(normalizer, bus.clone(), health.clone(), manager.subscribe());
    for source in &sources {
        pipeline.add_source(source.as_ref());
    }
    let counters = pipeline.counters();

    let shutdown = Arc::new(GracefulShutdown::new(ShutdownConfig::default()));
    install_signal_handlers(shutdown.clone());

    if let Some(port) = config.health.port {
        let status = Arc::new(FeedStatus::new(
            config.monitor.stale_after_ms,
            live.clone(),
            health.clone(),
            integrity.clone(),
            writer.health(),
            manager.subscribe(),
            counters.clone(),
            bus.clone(),
        ));
        let token = shutdown.token();
        tokio::spawn(async move {
            if let Err(e) = HealthServer::new(status, port).run(token).await {
                error!("Health server error: {}", e);
            }
        });
    }

    let (pipeline_stop_tx, pipeline_stop_rx) = watch::channel(false);
    let pipeline_task = tokio::spawn(pipeline.run(pipeline_stop_rx));

    for source in &sources {
        // A failed first attempt is not fatal; the source manager will pick
        // whichever source comes up, and a later connect retries.
        if let Err(e) = source.connect().await {
            warn!(source_id = %source.source_id(), error = %e, "Initial connect failed");
        }
    }
    manager.switch_to_best_source();
    let manager_task = tokio::spawn(manager.clone().run(shutdown.token()));
    let reconnect_task = tokio::spawn(reconnect_idle_sources(
        sources.clone(),
        config.reconnect.max_delay_ms,
        shutdown.token(),
    ));

    info!(%session_id, resume_after, sources = sources.len(), "Feed recorder running");
    shutdown.wait_for_request().await;

    let stop_sources = {
        let sources = sources.clone();
        move || -> PhaseFuture<()> {
            Box::pin(async move {
                for source in &sources {
                    source.disconnect().await;
                }
            })
        }
    };
    let drain_pipeline = {
        let bus = bus.clone();
        move || -> PhaseFuture<()> {
            Box::pin(async move {
                let _ = pipeline_stop_tx.send(true);
                match pipeline_task.await {
                    Ok(stats) => info!(
                        last_sequence = stats.last_sequence,
                        rounds_started = stats.rounds_started,
                        rounds_completed = stats.rounds_completed,
                        "Pipeline drained"
                    ),
                    Err(e) => error!("Pipeline task failed: {}", e),
                }
                // The writer must hold every published envelope before it closes
                bus.drain_channels().await;
            })
        }
    };
    let flush_store = {
        let writer = writer.clone();
        move || -> PhaseFuture<Result<(), String>> {
            Box::pin(async move { writer.close().await.map_err(|e| e.to_string()) })
        }
    };

    let outcome = shutdown
        .execute(stop_sources, drain_pipeline, flush_store)
        .await;

    manager_task.abort();
    reconnect_task.abort();
    info!(
        %session_id,
        last_flushed = writer.last_flushed_sequence(),
        published = bus.published_count(),
        "Feed recorder stopped"
    );
    outcome.map_err(|e| anyhow::anyhow!(e))
}

/// Retry sources whose initial connect failed. Connected sources reconnect
/// on their own; `connect` is a no-op for them.
async fn reconnect_idle_sources(
    sources: Vec<Arc<dyn CaptureSource>>,
    interval_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(std::time::Duration::from_millis(interval_ms.max(1_000)));
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => return,
        }
        if *shutdown.borrow() {
            return;
        }
        for source in &sources {
            if !source.is_connected() {
                if let Err(e) = source.connect().await {
                    warn!(source_id = %source.source_id(), error = %e, "Reconnect attempt failed");
                }
            }
        }
    }
}

fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Layer;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},rugfeed=debug", config.level)));

    // `rolling::daily` panics if it cannot create the first file, so check writability first
    let file_layer = config.dir.as_ref().and_then(|dir| {
        let writable = std::fs::create_dir_all(dir).is_ok()
            && std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(".rugfeed_write_test"))
                .is_ok();
        if !writable {
            eprintln!(
                "Warning: Could not write to log directory {}, file logging disabled",
                dir.display()
            );
            return None;
        }
        let _ = std::fs::remove_file(dir.join(".rugfeed_write_test"));

        let file_appender = tracing_appender::rolling::daily(dir, "rugfeed.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Keep the guard alive for the process lifetime
        Box::leak(Box::new(guard));

        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
    });

    let console_layer = if config.json {
        tracing_subscriber::fmt::layer().json().with_target(true).boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();
}

fn init_logging_simple() {
    // Minimal logging for inspection commands; stdout carries the data
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .try_init();
}
