// Fleet Orchestrator Engine
// This contains the stores, the flow runner and the loops that drive them

//! # Fleet Orchestrator Engine Module
//!
//! This module contains the orchestration core. The engine is the layer
//! between the domain models and the external world (HTTP server, agent
//! transport, alert delivery).
//!
//! ## Architecture Overview
//!
//! - **Domain Models**: Pure data (in `models/`)
//! - **Engine Layer**: Stores, flow execution and scheduling (this module)
//! - **Server Layer**: HTTP surface (in `server/`)
//!
//! ## Engine Components
//!
//! ### Storage (`storage`, `nats_storage` modules)
//! - `FlowStateStore`: flows, per-session inbound queues and leases, outbound
//!   agent queues
//! - `ClientStore` and `HuntStore`: client records, crash history and hunts
//! - In-memory implementation for a single process, JetStream key-value
//!   implementation for a shared deployment
//!
//! ### Flow Execution (`flow`, `flows`, `runner` modules)
//! - Flow classes with a closed enum of continuations per class
//! - `FlowRunner` dedups envelopes, runs completed requests in order and
//!   commits the result atomically
//!
//! ### Scheduling (`worker`, `hunts` modules)
//! - `Worker` leases ready sessions with bounded concurrency
//! - `HuntCoordinator` fans flows out under a per-hunt token bucket
//!
//! ### Side Channels (`handlers`, `alerts`, `crashes`, `events` modules)
//! - Well-known handlers bound to `W/...` sessions
//! - Alert delivery and crash reporting
//! - Broadcast bus of engine events
//!
//! ## Rust Learning Notes:
//!
//! ### Dependency Injection Without a Framework
//! [`FleetEngine`] wires every collaborator explicitly. Tests build the same
//! graph with [`FleetEngine::with_store`] and a [`MemoryAlertSender`]
//! instead of patching globals.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};

/// Store traits and the in-memory backend
pub mod storage;

/// NATS JetStream key-value backend
pub mod nats_storage;

/// Flow classes, continuations and registries
pub mod flow;

/// Built-in flow classes
pub mod flows;

/// Advances flows when their requests complete
pub mod runner;

/// Alert delivery
pub mod alerts;

/// Crash records and crash alerts
pub mod crashes;

/// Well-known session handlers
pub mod handlers;

/// Session worker loop
pub mod worker;

/// Hunt coordination and rate limiting
pub mod hunts;

/// In-process engine events
pub mod events;


pub use alerts::{AlertDispatcher, AlertSender, MemoryAlertSender};
pub use events::{EngineEvent, EventBus};
pub use flow::{ActionRegistry, FlowRegistry};
pub use handlers::WellKnownRegistry;
pub use hunts::HuntCoordinator;
pub use nats_storage::{NATSStorage, NATSStorageConfig};
pub use runner::FlowRunner;
pub use storage::{FleetStore, InMemoryStorage};
pub use worker::{Worker, WorkerConfig, WorkerHandle};

use crate::config::{Settings, StorageBackend};
use crate::Result;

/// A fully wired engine: one store and every component bound to it
#[derive(Clone)]
pub struct FleetEngine {
    store: Arc<dyn FleetStore>,
    runner: Arc<FlowRunner>,
    handlers: Arc<WellKnownRegistry>,
    hunts: Arc<HuntCoordinator>,
    events: EventBus,
    worker_config: WorkerConfig,
    hunt_tick: Duration,
}

impl FleetEngine {
    /// Build the store the settings select, then the engine around it
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        let store: Arc<dyn FleetStore> = match settings.storage.backend {
            StorageBackend::Memory => {
                info!("Using in-memory storage");
                Arc::new(InMemoryStorage::new())
            }
            StorageBackend::Nats => {
                info!(urls = ?settings.storage.nats_urls, "Using NATS storage");
                Arc::new(NATSStorage::new(NATSStorageConfig::from(&settings.storage)).await?)
            }
        };
        let alerts = AlertDispatcher::from_settings(&settings.alerts);
        Ok(Self::with_store(store, alerts, settings).await)
    }

    /// Wire the engine around an existing store and alert dispatcher
    pub async fn with_store(store: Arc<dyn FleetStore>, alerts: AlertDispatcher, settings: &Settings) -> Self {
        Self::with_flows(store, alerts, FlowRegistry::standard(), settings).await
    }

    /// Same as [`FleetEngine::with_store`] with a custom set of flow classes
    pub async fn with_flows(
        store: Arc<dyn FleetStore>,
        alerts: AlertDispatcher,
        flows: FlowRegistry,
        settings: &Settings,
    ) -> Self {
        let events = EventBus::new();
        let runner = Arc::new(FlowRunner::new(
            store.clone(),
            Arc::new(flows),
            Arc::new(ActionRegistry::standard()),
            alerts.clone(),
            events.clone(),
            settings.worker.lease_ttl(),
        ));
        let handlers = Arc::new(WellKnownRegistry::standard(store.clone(), alerts.clone()));
        let hunts = Arc::new(HuntCoordinator::new(
            runner.clone(),
            alerts,
            settings.hunts.default_client_rate,
        ));
        runner.add_observer(hunts.observer()).await;

        Self {
            store,
            runner,
            handlers,
            hunts,
            events,
            worker_config: WorkerConfig::from_settings(&settings.worker),
            hunt_tick: settings.hunts.tick_interval(),
        }
    }

    pub fn store(&self) -> &Arc<dyn FleetStore> {
        &self.store
    }

    pub fn runner(&self) -> &Arc<FlowRunner> {
        &self.runner
    }

    pub fn handlers(&self) -> &Arc<WellKnownRegistry> {
        &self.handlers
    }

    pub fn hunts(&self) -> &Arc<HuntCoordinator> {
        &self.hunts
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// A worker bound to this engine; several may run side by side
    pub fn worker(&self) -> Worker {
        Worker::new(self.worker_config.clone(), self.runner.clone(), self.handlers.clone())
    }

    /// Start the worker loop and the hunt ticker
    pub fn start_background(&self) -> BackgroundTasks {
        let worker = self.worker().start();
        let ticker = self
            .hunts
            .clone()
            .start_ticker(self.hunt_tick, worker.cancellation_token().clone());
        BackgroundTasks { worker, ticker }
    }
}

/// The engine's long-running tasks
pub struct BackgroundTasks {
    worker: WorkerHandle,
    ticker: JoinHandle<()>,
}

impl BackgroundTasks {
    pub fn is_running(&self) -> bool {
        self.worker.is_running() && !self.ticker.is_finished()
    }

    /// Stop both loops; in-flight sessions finish first
    pub async fn shutdown(self) {
        // the ticker shares the worker's token
        self.worker.shutdown().await;
        if let Err(e) = self.ticker.await {
            error!("Hunt ticker failed: {}", e);
        }
    }
}
