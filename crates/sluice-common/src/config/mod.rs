use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{CommonError, CommonResult};

const DEFAULT_CONFIG: &str = include_str!("default.toml");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub cluster: ClusterConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
}

impl AppConfig {
    /// Load the configuration from the compiled-in defaults,
    /// overridden by environment variables with the `SLUICE_` prefix.
    /// Nested keys use `__` as the separator
    /// (e.g. `SLUICE_CLUSTER__DRIVER_LISTEN_PORT`).
    pub fn load() -> CommonResult<Self> {
        Figment::from(Toml::string(DEFAULT_CONFIG))
            .merge(Env::prefixed("SLUICE_").map(|p| p.as_str().replace("__", ".").into()))
            .extract()
            .map_err(|e| CommonError::InvalidArgument(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub enable_tls: bool,
    pub driver_listen_host: String,
    pub driver_listen_port: u16,
    pub driver_external_host: String,
    pub driver_external_port: u16,
    pub worker_listen_host: String,
    pub worker_listen_port: u16,
    pub worker_external_host: String,
    pub worker_external_port: u16,
    pub rpc_retry_strategy: RetryStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// The number of times a restartable task group is attempted.
    pub task_group_max_attempts: usize,
    /// The delay between attempts for a restartable task group.
    pub task_group_retry_delay_secs: u64,
    /// The total deadline across all attempts for a restartable task group.
    pub task_group_retry_deadline_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// The directory where on-disk shards are spilled.
    pub data_dir: String,
    /// The number of in-flight frames buffered by each operator pipe.
    pub pipe_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Fixed {
        max_count: usize,
        delay_secs: u64,
    },
    ExponentialBackoff {
        max_count: usize,
        initial_delay_secs: u64,
        max_delay_secs: u64,
        factor: u32,
    },
}
