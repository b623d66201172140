use sluice_common::config::AppConfig;
use sluice_server::actor::ActorSystem;

use crate::worker::{WorkerActor, WorkerOptions};

pub async fn run_worker(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut system = ActorSystem::new();
    let options = WorkerOptions::try_from(config)?;
    let _handle = system.spawn::<WorkerActor>(options);
    system.join().await;
    Ok(())
}
