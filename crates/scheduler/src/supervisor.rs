//! Poller lifecycle management
//!
//! The supervisor starts the configured number of pollers, checks on them
//! periodically and stops them on request. A poller that ends with a fault
//! is process-fatal: the supervisor surfaces it as a [`SupervisorError`]
//! for which [`SupervisorError::is_fatal`] is true, and the host is expected
//! to exit so an external process manager restarts it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::duration_millis;
use crate::persistence::TaskQueueStore;
use crate::pipeline::RunnerRegistry;
use crate::worker::{JobPoller, PollerConfig, PollerError};

/// Kept back from `stop_wait` when sizing the poller drain budget; pollers
/// must hit their own deadline before the supervisor's
pub const STOP_MARGIN: Duration = Duration::from_millis(500);

/// Supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorConfig {
    /// Number of pollers to run
    pub poller_count: usize,

    /// Graceful stop budget
    #[serde(with = "duration_millis")]
    pub stop_wait: Duration,

    /// Period of the poller health check
    #[serde(with = "duration_millis")]
    pub health_check_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poller_count: 1,
            stop_wait: Duration::from_secs(180),
            health_check_interval: Duration::from_secs(10),
        }
    }
}

impl SupervisorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poller_count(mut self, count: usize) -> Self {
        self.poller_count = count;
        self
    }

    pub fn with_stop_wait(mut self, wait: Duration) -> Self {
        self.stop_wait = wait;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Longest drain a poller may take and still finish inside `stop_wait`
    pub fn poller_drain_budget(&self) -> Duration {
        self.stop_wait.saturating_sub(STOP_MARGIN)
    }
}

/// Supervisor errors
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// A poller loop ended with an error
    #[error("poller {poller_id} faulted: {source}")]
    PollerFaulted {
        poller_id: String,
        #[source]
        source: PollerError,
    },

    /// A poller task panicked
    #[error("poller {poller_id} panicked: {message}")]
    PollerPanicked { poller_id: String, message: String },

    /// `start` was called while pollers are registered
    #[error("supervisor is already running")]
    AlreadyStarted,
}

impl SupervisorError {
    /// Whether the process should exit
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::PollerFaulted { .. } | Self::PollerPanicked { .. }
        )
    }
}

/// Result of a health check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// This many pollers are still running
    Running(usize),
    /// Every poller has stopped normally
    AllStopped,
}

struct PollerInstance {
    id: String,
    cancel: CancellationToken,
    handle: JoinHandle<Result<usize, PollerError>>,
}

/// Owns the poller instances of one process
pub struct Supervisor {
    store: Arc<dyn TaskQueueStore>,
    registry: RunnerRegistry,
    poller_config: PollerConfig,
    config: SupervisorConfig,
    instances: Vec<PollerInstance>,
}

impl Supervisor {
    /// Create a supervisor; pollers drain for at most
    /// [`SupervisorConfig::poller_drain_budget`]
    pub fn new(
        store: Arc<dyn TaskQueueStore>,
        registry: RunnerRegistry,
        mut poller_config: PollerConfig,
        config: SupervisorConfig,
    ) -> Self {
        let budget = config.poller_drain_budget();
        if poller_config.wait_time_on_stop > budget {
            debug!(
                requested_ms = poller_config.wait_time_on_stop.as_millis() as u64,
                budget_ms = budget.as_millis() as u64,
                "capping poller drain budget to the stop wait"
            );
            poller_config.wait_time_on_stop = budget;
        }
        Self {
            store,
            registry,
            poller_config,
            config,
            instances: Vec::new(),
        }
    }

    /// Spawn the configured pollers
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        if !self.instances.is_empty() {
            return Err(SupervisorError::AlreadyStarted);
        }

        for index in 0..self.config.poller_count {
            let id = format!("poller-{index}");
            let cancel = CancellationToken::new();
            let poller = JobPoller::new(
                id.clone(),
                Arc::clone(&self.store),
                self.registry.clone(),
                self.poller_config.clone(),
            );
            let handle = tokio::spawn(poller.run(cancel.clone()));
            self.instances.push(PollerInstance { id, cancel, handle });
        }

        info!(
            pollers = self.instances.len(),
            content_types = ?self.registry.content_types(),
            "supervisor started"
        );
        Ok(())
    }

    /// Inspect finished pollers
    ///
    /// Pollers that stopped normally are removed. The first faulted or
    /// panicked poller is returned as a fatal error.
    pub async fn health_check(&mut self) -> Result<Health, SupervisorError> {
        let mut index = 0;
        while index < self.instances.len() {
            if !self.instances[index].handle.is_finished() {
                index += 1;
                continue;
            }

            let instance = self.instances.swap_remove(index);
            match instance.handle.await {
                Ok(Ok(abandoned)) => {
                    info!(poller_id = %instance.id, abandoned, "poller stopped")
                }
                Ok(Err(source)) => {
                    error!(poller_id = %instance.id, error = %source, "poller faulted");
                    return Err(SupervisorError::PollerFaulted {
                        poller_id: instance.id,
                        source,
                    });
                }
                Err(e) if e.is_panic() => {
                    error!(poller_id = %instance.id, error = %e, "poller panicked");
                    return Err(SupervisorError::PollerPanicked {
                        poller_id: instance.id,
                        message: e.to_string(),
                    });
                }
                Err(e) => warn!(poller_id = %instance.id, error = %e, "poller task aborted"),
            }
        }

        if self.instances.is_empty() {
            Ok(Health::AllStopped)
        } else {
            debug!(pollers = self.instances.len(), "pollers healthy");
            Ok(Health::Running(self.instances.len()))
        }
    }

    /// Cancel every poller and wait up to `wait` for them to finish
    ///
    /// Returns `true` and clears the registry if every poller finished in
    /// time; otherwise returns `false` and keeps the registry intact.
    pub async fn stop(&mut self, wait: Duration) -> bool {
        info!(
            pollers = self.instances.len(),
            wait_ms = wait.as_millis() as u64,
            "stopping supervisor"
        );
        for instance in &self.instances {
            instance.cancel.cancel();
        }

        let deadline = Instant::now() + wait;
        loop {
            let remaining = self
                .instances
                .iter()
                .filter(|i| !i.handle.is_finished())
                .count();
            if remaining == 0 {
                break;
            }

            if Instant::now() >= deadline {
                warn!(remaining, "pollers still running at stop deadline");
                return false;
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let finished = join_all(
            self.instances
                .drain(..)
                .map(|instance| async move { (instance.id, instance.handle.await) }),
        )
        .await;
        for (poller_id, result) in finished {
            match result {
                Ok(Ok(0)) => debug!(%poller_id, "poller stopped"),
                Ok(Ok(abandoned)) => warn!(%poller_id, abandoned, "poller abandoned running jobs"),
                Ok(Err(e)) => warn!(%poller_id, error = %e, "poller ended with error"),
                Err(e) => warn!(%poller_id, error = %e, "poller task failed"),
            }
        }
        info!("supervisor stopped");
        true
    }

    /// Number of registered pollers
    pub fn poller_count(&self) -> usize {
        self.instances.len()
    }

    /// Start, then health-check until `shutdown` resolves or every poller stops
    ///
    /// On shutdown the pollers are stopped within the configured stop wait.
    /// A fatal poller error cancels the remaining pollers and is returned.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), SupervisorError>
    where
        F: Future<Output = ()>,
    {
        self.start()?;

        let mut ticker = tokio::time::interval(self.config.health_check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    let wait = self.config.stop_wait;
                    if !self.stop(wait).await {
                        warn!("pollers did not stop within {:?}", wait);
                    }
                    return Ok(());
                }
                _ = ticker.tick() => match self.health_check().await {
                    Ok(Health::AllStopped) => {
                        info!("all pollers stopped");
                        return Ok(());
                    }
                    Ok(Health::Running(_)) => {}
                    Err(e) => {
                        for instance in &self.instances {
                            instance.cancel.cancel();
                        }
                        return Err(e);
                    }
                },
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        for instance in &self.instances {
            instance.cancel.cancel();
        }
    }
}
