use std::sync::Arc;

use sluice_common::config::AppConfig;
use sluice_server::actor::ActorSystem;

use crate::driver::{ExecutorTaskRunner, SchedulerActor, SchedulerOptions};
use crate::executor::ExecutorOptions;

pub async fn run_driver(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut system = ActorSystem::new();
    let local_runner = Arc::new(ExecutorTaskRunner::new(ExecutorOptions {
        enable_tls: config.cluster.enable_tls,
        pipe_buffer: config.worker.pipe_buffer,
        dial_retry: (&config.cluster.rpc_retry_strategy).into(),
    }));
    let options = SchedulerOptions::try_new(config, local_runner)?;
    let _handle = system.spawn::<SchedulerActor>(options);
    system.join().await;
    Ok(())
}
