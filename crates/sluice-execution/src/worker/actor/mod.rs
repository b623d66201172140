mod core;
mod handler;

use std::sync::Arc;

use tokio::sync::oneshot;
use tonic::transport::Channel;

use crate::driver::rpc::driver_service_client::DriverServiceClient;
use crate::error::ExecutionResult;
use crate::executor::Executor;
use crate::plan::InstructionSet;
use crate::rpc::{ClientHandle, ServerMonitor};
use crate::worker::options::WorkerOptions;
use crate::worker::shard_store::ShardStore;

pub enum WorkerEvent {
    ServerReady {
        /// The local port that the worker server listens on.
        /// This may differ from the port reachable from other nodes.
        port: u16,
        signal: oneshot::Sender<()>,
    },
    ExecuteInstructionSet {
        set: InstructionSet,
        result: oneshot::Sender<ExecutionResult<()>>,
    },
    DeleteDatasetShard {
        name: String,
        result: oneshot::Sender<ExecutionResult<()>>,
    },
    Shutdown,
}

pub struct WorkerActor {
    options: WorkerOptions,
    server: ServerMonitor,
    store: Arc<ShardStore>,
    executor: Arc<Executor>,
    driver_client: ClientHandle<DriverServiceClient<Channel>>,
}
