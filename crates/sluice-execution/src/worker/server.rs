use std::sync::Arc;

use log::debug;
use prost::Message;
use sluice_server::actor::ActorHandle;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::error::ExecutionError;
use crate::plan;
use crate::worker::rpc::shard_service_server::ShardService;
use crate::worker::rpc::worker_service_server::WorkerService;
use crate::worker::rpc::write_shard_request::Payload;
use crate::worker::rpc::{
    DeleteDatasetShardRequest, DeleteDatasetShardResponse, ExecuteInstructionSetRequest,
    ExecuteInstructionSetResponse, ReadShardRequest, ShardChunk, WriteShardRequest,
    WriteShardResponse,
};
use crate::worker::shard_store::ShardStore;
use crate::worker::{WorkerActor, WorkerEvent};

pub struct WorkerServer {
    handle: ActorHandle<WorkerActor>,
}

impl WorkerServer {
    pub fn new(handle: ActorHandle<WorkerActor>) -> Self {
        Self { handle }
    }
}

#[tonic::async_trait]
impl WorkerService for WorkerServer {
    async fn execute_instruction_set(
        &self,
        request: Request<ExecuteInstructionSetRequest>,
    ) -> Result<Response<ExecuteInstructionSetResponse>, Status> {
        let ExecuteInstructionSetRequest { instruction_set } = request.into_inner();
        let set = plan::InstructionSet::decode(instruction_set.as_slice())
            .map_err(|e| Status::invalid_argument(format!("invalid instruction set: {e}")))?;
        let (tx, rx) = oneshot::channel();
        self.handle
            .send(WorkerEvent::ExecuteInstructionSet { set, result: tx })
            .await
            .map_err(ExecutionError::from)?;
        rx.await.map_err(ExecutionError::from)??;
        Ok(Response::new(ExecuteInstructionSetResponse {}))
    }

    async fn delete_dataset_shard(
        &self,
        request: Request<DeleteDatasetShardRequest>,
    ) -> Result<Response<DeleteDatasetShardResponse>, Status> {
        let DeleteDatasetShardRequest { name } = request.into_inner();
        let (tx, rx) = oneshot::channel();
        self.handle
            .send(WorkerEvent::DeleteDatasetShard { name, result: tx })
            .await
            .map_err(ExecutionError::from)?;
        rx.await.map_err(ExecutionError::from)??;
        Ok(Response::new(DeleteDatasetShardResponse {}))
    }
}

pub struct ShardServer {
    store: Arc<ShardStore>,
}

impl ShardServer {
    pub fn new(store: Arc<ShardStore>) -> Self {
        Self { store }
    }
}

#[tonic::async_trait]
impl ShardService for ShardServer {
    type ReadShardStream = ReceiverStream<Result<ShardChunk, Status>>;

    async fn read_shard(
        &self,
        request: Request<ReadShardRequest>,
    ) -> Result<Response<Self::ReadShardStream>, Status> {
        let ReadShardRequest { name } = request.into_inner();
        debug!("serving shard {name}");
        let mut reader = self.store.read(&name).await;
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            loop {
                match reader.next().await {
                    Ok(Some(data)) => {
                        let chunk = ShardChunk {
                            data: data.to_vec(),
                        };
                        if tx.send(Ok(chunk)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(Status::from(e))).await;
                        break;
                    }
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn write_shard(
        &self,
        request: Request<Streaming<WriteShardRequest>>,
    ) -> Result<Response<WriteShardResponse>, Status> {
        let mut stream = request.into_inner();
        let header = match stream.message().await? {
            Some(WriteShardRequest {
                payload: Some(Payload::Header(header)),
            }) => header,
            _ => {
                return Err(Status::invalid_argument(
                    "the first write message must be the shard header",
                ))
            }
        };
        debug!(
            "receiving shard {} for {} readers",
            header.name, header.reader_count
        );
        let mut writer = self
            .store
            .create(&header.name, header.reader_count as usize, header.on_disk)
            .await
            .map_err(Status::from)?;
        while let Some(message) = stream.message().await? {
            match message.payload {
                Some(Payload::Chunk(chunk)) => {
                    writer.write(chunk.data.into()).await.map_err(Status::from)?;
                }
                _ => {
                    return Err(Status::invalid_argument(
                        "unexpected shard header in the middle of the stream",
                    ))
                }
            }
        }
        writer.close().await.map_err(Status::from)?;
        Ok(Response::new(WriteShardResponse {}))
    }
}
