mod actor;
mod dispatcher;
mod entrypoint;
mod event;
mod options;
mod runner;
mod server;

pub use actor::SchedulerActor;
pub use dispatcher::{Dispatcher, GrpcDispatcher};
pub use entrypoint::run_driver;
pub use event::SchedulerEvent;
pub use options::SchedulerOptions;
pub use runner::{ExecutorTaskRunner, LocalTaskRunner};

#[allow(clippy::all)]
pub mod rpc {
    tonic::include_proto!("sluice.driver");
}
