use std::collections::HashMap;
use std::sync::Mutex;

use prost::Message;
use tonic::transport::Channel;

use crate::error::ExecutionResult;
use crate::plan::{InstructionSet, Location};
use crate::rpc::{ClientHandle, ClientOptions};
use crate::worker::rpc::worker_service_client::WorkerServiceClient;
use crate::worker::rpc::{DeleteDatasetShardRequest, ExecuteInstructionSetRequest};

/// Remote execution as seen by the scheduler. Production uses gRPC
/// worker clients; tests substitute a recording implementation.
#[tonic::async_trait]
pub trait Dispatcher: Send + Sync {
    /// Run one instruction set on the worker at the given location,
    /// returning once the whole pipeline has drained there.
    async fn execute_instruction_set(
        &self,
        location: &Location,
        set: InstructionSet,
    ) -> ExecutionResult<()>;

    async fn delete_dataset_shard(&self, location: &Location, name: &str) -> ExecutionResult<()>;
}

pub struct GrpcDispatcher {
    enable_tls: bool,
    /// Client connections are cached per worker endpoint and shared
    /// across task groups.
    clients: Mutex<HashMap<(String, u32), ClientHandle<WorkerServiceClient<Channel>>>>,
}

impl GrpcDispatcher {
    pub fn new(enable_tls: bool) -> Self {
        Self {
            enable_tls,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self, location: &Location) -> ClientHandle<WorkerServiceClient<Channel>> {
        let key = (location.host.clone(), location.port);
        let mut clients = self.clients.lock().unwrap();
        clients
            .entry(key)
            .or_insert_with(|| {
                ClientHandle::new(ClientOptions::for_location(location, self.enable_tls))
            })
            .clone()
    }
}

#[tonic::async_trait]
impl Dispatcher for GrpcDispatcher {
    async fn execute_instruction_set(
        &self,
        location: &Location,
        set: InstructionSet,
    ) -> ExecutionResult<()> {
        let handle = self.client(location);
        // Clone the client out of the handle so that a long-running
        // execution does not serialize other dispatches to this worker;
        // clones share the underlying HTTP/2 connection.
        let mut client = handle.lock().await?.clone();
        client
            .execute_instruction_set(ExecuteInstructionSetRequest {
                instruction_set: set.encode_to_vec(),
            })
            .await?;
        Ok(())
    }

    async fn delete_dataset_shard(&self, location: &Location, name: &str) -> ExecutionResult<()> {
        let handle = self.client(location);
        let mut client = handle.lock().await?;
        client
            .delete_dataset_shard(DeleteDatasetShardRequest {
                name: name.to_string(),
            })
            .await?;
        Ok(())
    }
}
