use std::mem;
use std::sync::Arc;

use log::{error, info, warn};
use sluice_server::actor::{ActorAction, ActorContext, ActorHandle};
use sluice_server::ServerBuilder;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::oneshot;

use crate::driver::rpc::RegisterWorkerRequest;
use crate::error::{ExecutionError, ExecutionResult};
use crate::plan::InstructionSet;
use crate::worker::rpc::shard_service_server::ShardServiceServer;
use crate::worker::rpc::worker_service_server::WorkerServiceServer;
use crate::worker::server::{ShardServer, WorkerServer};
use crate::worker::shard_store::ShardStore;
use crate::worker::{WorkerActor, WorkerEvent};

impl WorkerActor {
    pub(super) fn handle_server_ready(
        &mut self,
        ctx: &mut ActorContext<Self>,
        port: u16,
        signal: oneshot::Sender<()>,
    ) -> ActorAction {
        let server = mem::take(&mut self.server);
        self.server = match server.ready(signal, port) {
            Ok(x) => x,
            Err(e) => {
                error!("{e}");
                return ActorAction::Stop;
            }
        };
        info!("worker server is ready on port {port}");

        let host = self.options.worker_external_host.clone();
        let external_port = if self.options.worker_external_port != 0 {
            self.options.worker_external_port
        } else {
            port
        };
        let client = self.driver_client.clone();
        let retry = self.options.rpc_retry_strategy.clone();
        ctx.spawn(async move {
            let out = retry
                .run(|| {
                    let client = client.clone();
                    let host = host.clone();
                    async move {
                        let mut client = client.lock().await?;
                        client
                            .register_worker(RegisterWorkerRequest {
                                host,
                                port: external_port as u32,
                            })
                            .await?;
                        Ok::<_, ExecutionError>(())
                    }
                })
                .await;
            match out {
                Ok(()) => info!("registered with driver as {host}:{external_port}"),
                Err(e) => error!("failed to register with driver: {e}"),
            }
        });
        ActorAction::Continue
    }

    pub(super) fn handle_execute_instruction_set(
        &mut self,
        ctx: &mut ActorContext<Self>,
        set: InstructionSet,
        result: oneshot::Sender<ExecutionResult<()>>,
    ) -> ActorAction {
        let executor = self.executor.clone();
        ctx.spawn(async move {
            let out = executor.execute_instruction_set(set).await;
            if result.send(out).is_err() {
                warn!("failed to send instruction set result");
            }
        });
        ActorAction::Continue
    }

    pub(super) fn handle_delete_dataset_shard(
        &mut self,
        ctx: &mut ActorContext<Self>,
        name: String,
        result: oneshot::Sender<ExecutionResult<()>>,
    ) -> ActorAction {
        let store = self.store.clone();
        ctx.spawn(async move {
            let out = store.delete(&name).await;
            if result.send(out).is_err() {
                warn!("failed to send shard deletion result");
            }
        });
        ActorAction::Continue
    }

    pub(super) async fn serve(
        handle: ActorHandle<Self>,
        addr: impl ToSocketAddrs + Send,
        store: Arc<ShardStore>,
    ) -> ExecutionResult<()> {
        let listener = TcpListener::bind(addr).await?;
        let port = listener.local_addr()?.port();
        let (tx, rx) = oneshot::channel();
        let worker_service = WorkerServiceServer::new(WorkerServer::new(handle.clone()));
        let shard_service = ShardServiceServer::new(ShardServer::new(store));

        handle
            .send(WorkerEvent::ServerReady { port, signal: tx })
            .await?;

        ServerBuilder::new("sluice_worker", Default::default())
            .add_service(worker_service)
            .await
            .add_service(shard_service)
            .await
            .serve(listener, async {
                let _ = rx.await;
            })
            .await
            .map_err(|e| ExecutionError::InternalError(e.to_string()))
    }
}
