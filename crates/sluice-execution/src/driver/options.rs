use std::sync::Arc;
use std::time::Duration;

use sluice_common::config::AppConfig;

use crate::driver::dispatcher::{Dispatcher, GrpcDispatcher};
use crate::driver::runner::LocalTaskRunner;
use crate::error::ExecutionResult;
use crate::market::SupplyMarket;
use crate::registry::ShardRegistry;

pub struct SchedulerOptions {
    pub enable_tls: bool,
    pub driver_listen_host: String,
    pub driver_listen_port: u16,
    /// The retry policy for restartable task groups: the number of
    /// attempts, the delay between attempts and the total deadline.
    pub task_group_max_attempts: usize,
    pub task_group_retry_delay: Duration,
    pub task_group_retry_deadline: Duration,
    pub registry: Arc<ShardRegistry>,
    pub market: Arc<SupplyMarket>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub local_runner: Arc<dyn LocalTaskRunner>,
}

impl SchedulerOptions {
    pub fn try_new(
        config: &AppConfig,
        local_runner: Arc<dyn LocalTaskRunner>,
    ) -> ExecutionResult<Self> {
        Ok(Self {
            enable_tls: config.cluster.enable_tls,
            driver_listen_host: config.cluster.driver_listen_host.clone(),
            driver_listen_port: config.cluster.driver_listen_port,
            task_group_max_attempts: config.scheduler.task_group_max_attempts.max(1),
            task_group_retry_delay: Duration::from_secs(config.scheduler.task_group_retry_delay_secs),
            task_group_retry_deadline: Duration::from_secs(
                config.scheduler.task_group_retry_deadline_secs,
            ),
            registry: Arc::new(ShardRegistry::new()),
            market: Arc::new(SupplyMarket::new()),
            dispatcher: Arc::new(GrpcDispatcher::new(config.cluster.enable_tls)),
            local_runner,
        })
    }
}
