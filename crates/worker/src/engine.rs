//! The health engine.
//!
//! [`Engine`] owns the device and instance records and is the only task that
//! mutates them. It reacts to transport events, fired confirmation timers and
//! the periodic refresh, then republishes the [`FleetSnapshot`], writes the
//! projected state through the [`StateSink`] and puts health events on the
//! [`EventBus`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Local, Utc};
use fleetwatch_core::blacklist::Blacklist;
use fleetwatch_core::config::EngineConfig;
use fleetwatch_core::profile::{DevicePaths, SourceRegistry};
use fleetwatch_core::projection::{state_entries, AdapterUpdate};
use fleetwatch_core::strategy::StrategyRegistry;
use fleetwatch_core::{FieldState, FleetSnapshot, Timestamp};
use fleetwatch_events::sink::write_all;
use fleetwatch_events::{EventBus, HealthEventEmitter, StateSink};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::aggregator::{DeviceAggregator, DeviceChange};
use crate::instances::{InstanceChange, InstanceMonitor, TimerFired, ADAPTER_UPDATES_PATTERN, HEARTBEAT_PATTERN};
use crate::transport::{glob_to_regex, Telemetry, TransportEvent};

// ---------------------------------------------------------------------------
// ScanGuard
// ---------------------------------------------------------------------------

/// Prevents overlapping full scans.
#[derive(Debug, Default)]
pub struct ScanGuard {
    running: AtomicBool,
}

impl ScanGuard {
    /// Claim the guard. `None` while another scan holds it.
    pub fn try_acquire(self: &Arc<Self>) -> Option<ScanPermit> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ScanPermit {
                guard: Arc::clone(self),
            })
    }

    pub fn is_scanning(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Releases the [`ScanGuard`] on drop.
#[derive(Debug)]
pub struct ScanPermit {
    guard: Arc<ScanGuard>,
}

impl Drop for ScanPermit {
    fn drop(&mut self) {
        self.guard.running.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

enum Wake {
    Cancelled,
    Timer(TimerFired),
    Transport(Result<TransportEvent, RecvError>),
    Refresh,
}

pub struct Engine {
    telemetry: Arc<dyn Telemetry>,
    config: Arc<EngineConfig>,
    blacklist: Arc<Blacklist>,
    devices: DeviceAggregator,
    instances: InstanceMonitor,
    emitter: HealthEventEmitter,
    bus: Arc<EventBus>,
    sink: Arc<dyn StateSink>,
    snapshot_tx: watch::Sender<FleetSnapshot>,
    scan_guard: Arc<ScanGuard>,
    /// Set after the first full scan; the startup state is not notified.
    initialized: bool,
    timer_rx: mpsc::UnboundedReceiver<TimerFired>,
    events: broadcast::Receiver<TransportEvent>,
}

impl Engine {
    pub fn new(
        telemetry: Arc<dyn Telemetry>,
        sources: Arc<SourceRegistry>,
        config: Arc<EngineConfig>,
        blacklist: Arc<Blacklist>,
        bus: Arc<EventBus>,
        sink: Arc<dyn StateSink>,
    ) -> Self {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(FleetSnapshot::default());
        let events = telemetry.events();
        Self {
            devices: DeviceAggregator::new(sources, StrategyRegistry::builtin(), Arc::clone(&config)),
            instances: InstanceMonitor::new(Arc::clone(&config), timer_tx),
            emitter: HealthEventEmitter::new(config.notifications.clone(), Arc::clone(&blacklist)),
            telemetry,
            config,
            blacklist,
            bus,
            sink,
            snapshot_tx,
            scan_guard: Arc::new(ScanGuard::default()),
            initialized: false,
            timer_rx,
            events,
        }
    }

    /// Read-only view of the latest published snapshot.
    pub fn snapshot(&self) -> watch::Receiver<FleetSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn scan_guard(&self) -> Arc<ScanGuard> {
        Arc::clone(&self.scan_guard)
    }

    pub fn devices(&self) -> &DeviceAggregator {
        &self.devices
    }

    pub fn instances(&self) -> &InstanceMonitor {
        &self.instances
    }

    /// Rebuild every record. Dropped when a scan is already running.
    pub async fn full_scan(&mut self) -> bool {
        let Some(_permit) = self.scan_guard.try_acquire() else {
            tracing::debug!("Scan already running, request dropped");
            return false;
        };
        let now = Utc::now();
        let telemetry = Arc::clone(&self.telemetry);

        let changes = self.devices.scan_all(telemetry.as_ref(), now).await;
        self.subscribe_selectors().await;
        self.emit_device_changes(&changes, now).await;

        if self.config.check_instances {
            if let Err(e) = telemetry.subscribe(HEARTBEAT_PATTERN).await {
                tracing::warn!(error = %e, "Heartbeat subscription failed");
            }
            match self.instances.scan(telemetry.as_ref()).await {
                Ok(changes) => self.emit_instance_changes(&changes, now),
                Err(e) => tracing::error!(error = %e, "Instance scan failed"),
            }
        }
        if self.config.check_adapter_updates {
            self.refresh_adapter_updates(now).await;
        }

        self.initialized = true;
        self.publish().await;
        tracing::info!(
            devices = self.devices.devices().len(),
            instances = self.instances.instances().len(),
            "Full scan complete"
        );
        true
    }

    async fn subscribe_selectors(&self) {
        let selectors: Vec<String> = self
            .config
            .sources
            .keys()
            .filter_map(|id| self.devices.selector_of(id).map(str::to_string))
            .collect();
        for selector in selectors {
            if let Err(e) = self.telemetry.subscribe(&selector).await {
                tracing::warn!(selector, error = %e, "Selector subscription failed");
            }
        }
    }

    async fn refresh_adapter_updates(&mut self, now: Timestamp) {
        match self.instances.refresh_adapter_updates(self.telemetry.as_ref()).await {
            Ok(previous) => {
                let updates: Vec<AdapterUpdate> =
                    self.instances.adapter_updates().values().cloned().collect();
                if !self.initialized {
                    return;
                }
                if let Some(event) = self.emitter.adapter_update_event(previous, &updates, now) {
                    self.bus.publish(event);
                }
            }
            Err(e) => tracing::warn!(error = %e, "Adapter update refresh failed"),
        }
    }

    /// Handle one transport event.
    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        let now = Utc::now();
        match event {
            TransportEvent::FieldChanged { path, state } => self.field_changed(&path, &state, now).await,
            TransportEvent::ObjectChanged { path, .. } => {
                tracing::debug!(path, "Object changed, rescanning");
                self.full_scan().await;
            }
            TransportEvent::Deleted { path } => {
                let removed_devices = self.devices.remove(&path);
                let removed_instance = self.instances.remove(&path);
                if !removed_devices.is_empty() || removed_instance.is_some() {
                    self.publish().await;
                }
            }
        }
    }

    async fn field_changed(&mut self, path: &str, state: &FieldState, now: Timestamp) {
        let telemetry = Arc::clone(&self.telemetry);
        let mut touched = false;

        if self.config.check_adapter_updates && pattern_matches(ADAPTER_UPDATES_PATTERN, path) {
            self.refresh_adapter_updates(now).await;
            touched = true;
        }

        if self.config.check_instances {
            if self.instances.watches(path) {
                if let Some(change) = self.instances.apply_field_change(path, state) {
                    self.emit_instance_changes(&[change], now);
                }
                touched = true;
            } else if pattern_matches(HEARTBEAT_PATTERN, path) {
                tracing::info!(path, "New instance detected");
                self.full_scan().await;
                return;
            }
        }

        if self.devices.watches(path) {
            let changes = self
                .devices
                .apply_field_change(telemetry.as_ref(), path, state, now)
                .await;
            self.emit_device_changes(&changes, now).await;
            touched = true;
        } else if self.is_new_device(path) {
            tracing::info!(path, "New device detected");
            self.full_scan().await;
            return;
        }

        if touched {
            self.publish().await;
        }
    }

    fn is_new_device(&self, path: &str) -> bool {
        self.devices.matches_selector(path)
            && DevicePaths::from_match(path).is_some_and(|at| !self.devices.is_known(&at.device))
    }

    /// A confirmation timer fired.
    pub async fn handle_timer(&mut self, fired: TimerFired) {
        let now = Utc::now();
        match self.instances.timer_fired(self.telemetry.as_ref(), fired).await {
            Ok(Some(change)) => {
                self.emit_instance_changes(&[change], now);
                self.publish().await;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Confirmation re-read failed"),
        }
    }

    /// Periodic re-evaluation of reachability and scheduled instances.
    pub async fn refresh(&mut self) {
        self.refresh_at(Utc::now()).await;
    }

    /// [`Engine::refresh`] against an explicit clock reading.
    pub async fn refresh_at(&mut self, now: Timestamp) {
        let changes = self
            .devices
            .periodic_refresh(self.telemetry.as_ref(), now)
            .await;
        self.emit_device_changes(&changes, now).await;

        if self.config.check_instances {
            let changes = self
                .instances
                .refresh_scheduled(&now.with_timezone(&Local));
            self.emit_instance_changes(&changes, now);
        }
        self.publish().await;
    }

    async fn emit_device_changes(&self, changes: &[DeviceChange], now: Timestamp) {
        let mut connections: HashMap<String, Option<FieldState>> = HashMap::new();
        for change in changes {
            let path = &change.after.paths.instance_connection;
            if !connections.contains_key(path) {
                let state = match self.telemetry.read_field(path).await {
                    Ok(state) => state,
                    Err(e) => {
                        tracing::debug!(path, error = %e, "Connection read failed");
                        None
                    }
                };
                connections.insert(path.clone(), state);
            }
            let connection = connections.get(path).and_then(Option::as_ref);
            for event in self
                .emitter
                .device_events(&change.before, &change.after, connection, now)
            {
                self.bus.publish(event);
            }
        }
    }

    fn emit_instance_changes(&self, changes: &[InstanceChange], now: Timestamp) {
        for change in changes {
            if let Some(event) = self.emitter.instance_event(change.before, &change.after, now) {
                self.bus.publish(event);
            }
        }
    }

    /// Publish the snapshot and write the projected state.
    async fn publish(&self) {
        let snapshot = FleetSnapshot {
            devices: self.devices.devices().clone(),
            instances: self.instances.instances().clone(),
            adapter_updates: self.instances.adapter_updates().clone(),
        };
        let entries = state_entries(
            &snapshot,
            &self.blacklist,
            self.config.per_source_lists,
            self.config.check_instances,
        );
        let written = write_all(self.sink.as_ref(), entries).await;
        if written > 0 {
            tracing::debug!(written, "State written");
        }
        self.snapshot_tx.send_replace(snapshot);
    }

    /// Scan, then process events until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        self.full_scan().await;

        let mut refresh = tokio::time::interval(self.config.refresh_interval());
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        refresh.tick().await;

        loop {
            let wake = tokio::select! {
                _ = cancel.cancelled() => Wake::Cancelled,
                Some(fired) = self.timer_rx.recv() => Wake::Timer(fired),
                received = self.events.recv() => Wake::Transport(received),
                _ = refresh.tick() => Wake::Refresh,
            };

            match wake {
                Wake::Cancelled => break,
                Wake::Timer(fired) => self.handle_timer(fired).await,
                Wake::Transport(Ok(event)) => self.handle_transport_event(event).await,
                Wake::Transport(Err(RecvError::Lagged(skipped))) => {
                    tracing::warn!(skipped, "Transport events lagged, rescanning");
                    self.full_scan().await;
                }
                Wake::Transport(Err(RecvError::Closed)) => {
                    tracing::info!("Transport closed");
                    break;
                }
                Wake::Refresh => self.refresh().await,
            }
        }

        self.instances.shutdown().await;
        tracing::info!("Engine stopped");
    }
}

fn pattern_matches(pattern: &str, path: &str) -> bool {
    glob_to_regex(pattern).is_ok_and(|re| re.is_match(path))
}
