mod actor;
mod entrypoint;
mod options;
mod server;
pub mod shard_store;

pub use actor::{WorkerActor, WorkerEvent};
pub use entrypoint::run_worker;
pub use options::WorkerOptions;

#[allow(clippy::all)]
pub mod rpc {
    tonic::include_proto!("sluice.worker");
}
