//! Scheduler configuration
//!
//! Every component receives its configuration explicitly at construction;
//! [`SchedulerConfig::from_env`] is the only place that reads the process
//! environment.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pipeline::{PipelineConfig, RemoteTaskTimeouts};
use crate::supervisor::SupervisorConfig;
use crate::worker::PollerConfig;

/// Content type served when none is configured
pub const DEFAULT_CONTENT_TYPE: &str = "qlikview";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required variable is not set
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// A variable is set but cannot be parsed
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Which document processor implementation to use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ProcessorEndpoint {
    /// JSON-over-HTTP processor at the given base URL
    Http { base_url: String },
    /// In-process simulator (local development)
    Simulated,
}

impl ProcessorEndpoint {
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("simulated") {
            Self::Simulated
        } else {
            Self::Http {
                base_url: value.trim_end_matches('/').to_string(),
            }
        }
    }
}

/// Complete configuration of one scheduler process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Queue store connection string
    pub database_url: String,

    /// Document processor endpoint
    pub processor: ProcessorEndpoint,

    /// Poller (job monitor) settings
    pub poller: PollerConfig,

    /// Pipeline settings
    pub pipeline: PipelineConfig,

    /// Supervisor settings
    pub supervisor: SupervisorConfig,

    /// Content type tags handled by the reduction runner
    pub content_types: Vec<String>,
}

impl SchedulerConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `DATABASE_URL`: queue store connection string (required)
    /// - `PROCESSOR_ENDPOINT`: processor base URL, or `simulated` (required)
    /// - `MAX_PARALLEL_TASKS`: concurrent jobs per poller (default: 1)
    /// - `TASK_AGE_BEFORE_EXECUTION_SECS`: minimum job age before claiming (default: 30)
    /// - `STOP_WAIT_TIME_SECONDS`: graceful shutdown budget (default: 180); pollers
    ///   drain for this long minus [`STOP_MARGIN`](crate::supervisor::STOP_MARGIN)
    /// - `POLL_INTERVAL_MS`: sleep between poll cycles (default: 1000)
    /// - `HEALTH_CHECK_INTERVAL_SECS`: supervisor health check period (default: 10)
    /// - `REMOTE_MAX_START_DELAY_SECS`: remote task start budget (default: 300)
    /// - `REMOTE_MAX_ELAPSED_RUN_SECS`: remote task run budget (default: 300)
    /// - `REDUCTION_WORKING_ROOT`: parent of per-job working areas
    /// - `REDUCTION_DISTRIBUTION_ROOT`: where reduced content is published
    /// - `REDUCIBLE_CONTENT_TYPES`: comma-separated content type tags (default: qlikview)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let processor = lookup("PROCESSOR_ENDPOINT")
            .map(|v| ProcessorEndpoint::parse(&v))
            .ok_or(ConfigError::Missing("PROCESSOR_ENDPOINT"))?;

        let mut poller = PollerConfig::default();
        if let Some(n) = parse_var::<usize, _>(&lookup, "MAX_PARALLEL_TASKS")? {
            if n == 0 {
                return Err(ConfigError::Invalid {
                    name: "MAX_PARALLEL_TASKS",
                    value: n.to_string(),
                });
            }
            poller = poller.with_max_parallel_tasks(n);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "TASK_AGE_BEFORE_EXECUTION_SECS")? {
            poller = poller.with_task_age_before_execution(Duration::from_secs(secs));
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "POLL_INTERVAL_MS")? {
            poller = poller.with_poll_interval(Duration::from_millis(ms));
        }

        let mut supervisor = SupervisorConfig::default();
        if let Some(secs) = parse_var::<u64, _>(&lookup, "STOP_WAIT_TIME_SECONDS")? {
            supervisor = supervisor.with_stop_wait(Duration::from_secs(secs));
        }
        poller = poller.with_wait_time_on_stop(supervisor.poller_drain_budget());
        if let Some(secs) = parse_var::<u64, _>(&lookup, "HEALTH_CHECK_INTERVAL_SECS")? {
            supervisor = supervisor.with_health_check_interval(Duration::from_secs(secs));
        }

        let mut timeouts = RemoteTaskTimeouts::default();
        if let Some(secs) = parse_var::<u64, _>(&lookup, "REMOTE_MAX_START_DELAY_SECS")? {
            timeouts = timeouts.with_max_start_delay(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "REMOTE_MAX_ELAPSED_RUN_SECS")? {
            timeouts = timeouts.with_max_elapsed_run(Duration::from_secs(secs));
        }

        let mut pipeline = PipelineConfig::default().with_remote_timeouts(timeouts);
        if let Some(root) = lookup("REDUCTION_WORKING_ROOT") {
            pipeline = pipeline.with_working_root(PathBuf::from(root));
        }
        if let Some(root) = lookup("REDUCTION_DISTRIBUTION_ROOT") {
            pipeline = pipeline.with_distribution_root(PathBuf::from(root));
        }

        let content_types = match lookup("REDUCIBLE_CONTENT_TYPES") {
            Some(value) => {
                let tags: Vec<String> = value
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect();
                if tags.is_empty() {
                    return Err(ConfigError::Invalid {
                        name: "REDUCIBLE_CONTENT_TYPES",
                        value,
                    });
                }
                tags
            }
            None => vec![DEFAULT_CONTENT_TYPE.to_string()],
        };

        Ok(Self {
            database_url,
            processor,
            poller,
            pipeline,
            supervisor,
            content_types,
        })
    }
}

fn parse_var<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
