use sluice_common::config::AppConfig;
use sluice_server::retry::RetryStrategy;

use crate::error::{ExecutionError, ExecutionResult};

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub enable_tls: bool,
    pub worker_listen_host: String,
    pub worker_listen_port: u16,
    pub worker_external_host: String,
    /// The externally reachable port; zero means "use the bound port",
    /// which only works when workers and driver share a network.
    pub worker_external_port: u16,
    pub driver_host: String,
    pub driver_port: u16,
    pub data_dir: String,
    pub pipe_buffer: usize,
    pub rpc_retry_strategy: RetryStrategy,
}

impl TryFrom<&AppConfig> for WorkerOptions {
    type Error = ExecutionError;

    fn try_from(config: &AppConfig) -> ExecutionResult<Self> {
        if config.cluster.driver_external_port == 0 {
            return Err(ExecutionError::InvalidArgument(
                "the driver external port must be configured for a worker".to_string(),
            ));
        }
        Ok(Self {
            enable_tls: config.cluster.enable_tls,
            worker_listen_host: config.cluster.worker_listen_host.clone(),
            worker_listen_port: config.cluster.worker_listen_port,
            worker_external_host: config.cluster.worker_external_host.clone(),
            worker_external_port: config.cluster.worker_external_port,
            driver_host: config.cluster.driver_external_host.clone(),
            driver_port: config.cluster.driver_external_port,
            data_dir: config.worker.data_dir.clone(),
            pipe_buffer: config.worker.pipe_buffer,
            rpc_retry_strategy: (&config.cluster.rpc_retry_strategy).into(),
        })
    }
}
