// Worker loop - leases ready sessions and dispatches them

//! # Worker Loop
//!
//! A worker repeatedly leases sessions that have queued envelopes and hands
//! each one to either the [`WellKnownRegistry`] (reserved `W/...` sessions) or
//! the [`FlowRunner`]. Several workers may run against one store; the store's
//! per-session lease guarantees a session is processed by one worker at a time.
//!
//! ```text
//!            lease_ready_sessions(free permits)
//!   store ------------------------------------> worker
//!                                                 | spawn per lease (JoinSet)
//!                                                 v
//!                             well-known? -> handlers.process_session
//!                             otherwise   -> runner.process_session
//!                                                 |
//!                                           release_lease
//! ```
//!
//! When nothing is ready the loop sleeps with an exponential back-off between
//! `idle_backoff_min` and `idle_backoff_max`. Shutdown stops leasing and waits
//! for the in-flight sessions to finish their cycle; no continuation is
//! aborted half way.
//!
//! ## Rust Learning Notes:
//!
//! ### Semaphore Permits Moved into Tasks
//! `Semaphore::try_acquire_owned` returns a permit that is not tied to a
//! borrow of the semaphore. Moving it into the spawned task frees the slot
//! exactly when the task ends, whether it returns normally or panics.
//!
//! ### CancellationToken
//! `tokio_util::sync::CancellationToken` is cloneable and cancel-safe. The loop
//! `select!`s on `token.cancelled()` next to its sleep so shutdown never waits
//! for a full back-off period.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handlers::WellKnownRegistry;
use super::runner::{FlowRunner, SessionOutcome};
use super::storage::{FleetStore, FlowStateStore, SessionLease};
use crate::config::WorkerSettings;
use crate::{FleetError, Result};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Sessions processed in parallel
    pub max_concurrent_sessions: usize,
    pub lease_ttl: Duration,
    pub idle_backoff_min: Duration,
    pub idle_backoff_max: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_settings(&WorkerSettings::default())
    }
}

impl WorkerConfig {
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            max_concurrent_sessions: settings.max_concurrent_sessions.max(1),
            lease_ttl: settings.lease_ttl(),
            idle_backoff_min: Duration::from_millis(settings.idle_backoff_min_ms),
            idle_backoff_max: Duration::from_millis(settings.idle_backoff_max_ms),
        }
    }

    pub fn with_worker_id<S: Into<String>>(mut self, worker_id: S) -> Self {
        self.worker_id = worker_id.into();
        self
    }
}

/// How one leased session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    Flow(SessionOutcome),
    WellKnown { handled: usize },
    /// Another worker took the session over; its envelopes stay queued
    LeaseLost,
    Failed(String),
}

#[derive(Clone)]
pub struct Worker {
    config: WorkerConfig,
    store: Arc<dyn FleetStore>,
    runner: Arc<FlowRunner>,
    handlers: Arc<WellKnownRegistry>,
    permits: Arc<Semaphore>,
}

impl Worker {
    pub fn new(config: WorkerConfig, runner: Arc<FlowRunner>, handlers: Arc<WellKnownRegistry>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_sessions));
        Self {
            store: runner.store().clone(),
            config,
            runner,
            handlers,
            permits,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Process one leased session and release the lease
    ///
    /// Errors are logged and reported in the result; they never escape to the
    /// loop.
    pub async fn dispatch(&self, lease: SessionLease) -> DispatchResult {
        let session_id = lease.session_id.clone();

        let result = if self.handlers.handles(&session_id) {
            self.handlers
                .process_session(&lease)
                .await
                .map(|handled| DispatchResult::WellKnown { handled })
        } else {
            self.runner
                .process_session(&lease)
                .await
                .map(DispatchResult::Flow)
        };

        let outcome = match result {
            Ok(outcome) => {
                debug!(worker_id = %self.config.worker_id, session_id = %session_id, ?outcome, "Dispatched session");
                outcome
            }
            Err(FleetError::ConcurrentModification { .. }) => {
                warn!(
                    worker_id = %self.config.worker_id,
                    session_id = %session_id,
                    "Lost session lease; envelopes stay queued"
                );
                DispatchResult::LeaseLost
            }
            Err(e) => {
                error!(worker_id = %self.config.worker_id, session_id = %session_id, "Session dispatch failed: {}", e);
                DispatchResult::Failed(e.to_string())
            }
        };

        if let Err(e) = self.store.release_lease(&lease).await {
            warn!(session_id = %session_id, "Failed to release lease: {}", e);
        }
        outcome
    }

    /// Lease everything ready (up to the concurrency bound), process it and
    /// wait for completion. Returns the number of sessions processed.
    pub async fn run_once(&self) -> Result<usize> {
        let leases = self
            .store
            .lease_ready_sessions(self.config.max_concurrent_sessions, self.config.lease_ttl)
            .await?;
        let count = leases.len();

        let mut tasks = JoinSet::new();
        for lease in leases {
            let worker = self.clone();
            tasks.spawn(async move { worker.dispatch(lease).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(worker_id = %self.config.worker_id, "Session task panicked: {}", e);
            }
        }
        Ok(count)
    }

    /// Run cycles until no session is ready. Returns the sessions processed.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let processed = self.run_once().await?;
            if processed == 0 {
                return Ok(total);
            }
            total += processed;
        }
    }

    /// Start the loop in the background
    pub fn start(self) -> WorkerHandle {
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let worker_id = self.config.worker_id.clone();

        info!(
            worker_id = %worker_id,
            max_concurrent_sessions = self.config.max_concurrent_sessions,
            "Starting worker"
        );
        let handle = tokio::spawn(async move { self.run(loop_token).await });

        WorkerHandle {
            worker_id,
            handle,
            token,
        }
    }

    async fn run(self, token: CancellationToken) {
        let mut active: JoinSet<()> = JoinSet::new();
        let mut backoff = self.config.idle_backoff_min;

        loop {
            if token.is_cancelled() {
                break;
            }
            while let Some(joined) = active.try_join_next() {
                if let Err(e) = joined {
                    error!(worker_id = %self.config.worker_id, "Session task panicked: {}", e);
                }
            }

            let free = self.permits.available_permits();
            if free == 0 {
                // every slot busy: wait for one to finish
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = active.join_next() => continue,
                }
            }

            let leased = self.store.lease_ready_sessions(free, self.config.lease_ttl).await;
            let idle = match leased {
                Ok(leases) if !leases.is_empty() => {
                    for lease in leases {
                        self.spawn_dispatch(&mut active, lease).await;
                    }
                    false
                }
                Ok(_) => true,
                Err(e) => {
                    warn!(worker_id = %self.config.worker_id, "Failed to lease sessions: {}", e);
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(self.config.idle_backoff_max);
            } else {
                backoff = self.config.idle_backoff_min;
            }
        }

        // let in-flight sessions finish their cycle
        while active.join_next().await.is_some() {}
        info!(worker_id = %self.config.worker_id, "Worker stopped");
    }

    async fn spawn_dispatch(&self, active: &mut JoinSet<()>, lease: SessionLease) {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => {
                let worker = self.clone();
                active.spawn(async move {
                    let _permit = permit;
                    worker.dispatch(lease).await;
                });
            }
            Err(_) => {
                // leased more than we can run; hand it back
                if let Err(e) = self.store.release_lease(&lease).await {
                    warn!(session_id = %lease.session_id, "Failed to release lease: {}", e);
                }
            }
        }
    }
}

/// Handle for controlling a running worker
pub struct WorkerHandle {
    worker_id: String,
    handle: JoinHandle<()>,
    token: CancellationToken,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Stop leasing and wait for in-flight sessions
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            error!(worker_id = %self.worker_id, "Worker task failed: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}
