//! `fleetwatch-worker` -- telemetry health engine.
//!
//! Loads the engine configuration, replays a telemetry dump into the
//! in-memory transport and runs the engine, the notification router and the
//! digest scheduler until Ctrl-C.
//!
//! # Environment variables
//!
//! | Variable                | Required | Default | Description                          |
//! |-------------------------|----------|---------|--------------------------------------|
//! | `FLEETWATCH_CONFIG`     | no       | --      | Engine config JSON file              |
//! | `FLEETWATCH_REGISTRY`   | no       | --      | Source registry JSON replacing the built-in one |
//! | `FLEETWATCH_SNAPSHOT`   | no       | --      | Telemetry dump to replay             |
//! | `REFRESH_INTERVAL_SECS` | no       | `60`    | Seconds between reachability refreshes |
//! | `FLEETWATCH_LANGUAGE`   | no       | `en`    | Message language                     |
//! | `MIN_BATTERY_PERCENT`   | no       | `20`    | Low battery threshold                |

use std::sync::Arc;

use fleetwatch_core::blacklist::Blacklist;
use fleetwatch_events::{
    DigestScheduler, EventBus, LogChannel, LogSink, MessageStyle, NotificationChannel,
    NotificationRouter, StateSink, WebhookChannel,
};
use fleetwatch_worker::config::{parse_json_file, WorkerConfig};
use fleetwatch_worker::transport::{MemoryTelemetry, Telemetry, TelemetryDump};
use fleetwatch_worker::Engine;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Exit code when the source registry cannot be built.
const EXIT_REGISTRY: i32 = 15;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleetwatch_worker=debug,fleetwatch_events=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let worker = WorkerConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid environment");
        std::process::exit(1);
    });

    let sources = match worker.source_registry() {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            tracing::error!(error = %e, "Cannot build the source registry");
            std::process::exit(EXIT_REGISTRY);
        }
    };

    let config = worker.engine_config().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid engine configuration");
        std::process::exit(1);
    });
    let config = Arc::new(config);

    let (blacklist, errors) = Blacklist::from_config(&config.blacklist);
    for e in errors {
        tracing::warn!(error = %e, "Ignoring blacklist entry");
    }
    let blacklist = Arc::new(blacklist);

    let telemetry = match &worker.snapshot_path {
        Some(path) => match parse_json_file::<TelemetryDump>(path) {
            Ok(dump) => MemoryTelemetry::from_dump(dump),
            Err(e) => {
                tracing::error!(error = %e, "Cannot load telemetry dump");
                std::process::exit(1);
            }
        },
        None => MemoryTelemetry::new(),
    };
    let telemetry: Arc<dyn Telemetry> = Arc::new(telemetry);

    tracing::info!(
        sources = sources.len(),
        enabled = config.sources.len(),
        refresh_interval_secs = config.refresh_interval_secs,
        "Starting fleetwatch-worker",
    );

    // --- Notification channels ---
    let mut channels: Vec<Arc<dyn NotificationChannel>> = vec![Arc::new(LogChannel)];
    for target in &config.notifications.webhooks {
        match WebhookChannel::new(target.url.clone()) {
            Ok(channel) => channels.push(Arc::new(channel)),
            Err(e) => tracing::warn!(url = %target.url, error = %e, "Skipping webhook"),
        }
    }

    let sink: Arc<dyn StateSink> = Arc::new(LogSink::new());
    let bus = Arc::new(EventBus::default());
    let style = MessageStyle {
        language: config.language,
        with_adapter_name: config.notifications.with_adapter_name,
    };
    let router = Arc::new(NotificationRouter::new(style, channels, Arc::clone(&sink)));

    let engine = Engine::new(
        telemetry,
        sources,
        Arc::clone(&config),
        Arc::clone(&blacklist),
        Arc::clone(&bus),
        sink,
    );

    let (plans, errors) = config.digest_plans();
    for e in errors {
        tracing::warn!(error = %e, "Digest disabled");
    }
    let digest = DigestScheduler::new(plans, engine.snapshot(), blacklist, Arc::clone(&router));

    let cancel = CancellationToken::new();

    let router_handle = {
        let rx = bus.subscribe();
        let cancel = cancel.clone();
        tokio::spawn(async move { router.run(rx, cancel).await })
    };
    let digest_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { digest.run(cancel).await })
    };
    let engine_handle = tokio::spawn(engine.run(cancel.clone()));

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Cannot listen for shutdown signal");
    }
    tracing::info!("Shutdown requested");
    cancel.cancel();

    for (name, handle) in [
        ("engine", engine_handle),
        ("router", router_handle),
        ("digest", digest_handle),
    ] {
        if let Err(e) = handle.await {
            tracing::error!(task = name, error = %e, "Task failed");
        }
    }
    tracing::info!("fleetwatch-worker stopped");
}
