use std::mem;
use std::sync::Arc;

use log::info;
use sluice_server::actor::{Actor, ActorAction, ActorContext};

use crate::executor::{Executor, ExecutorOptions};
use crate::rpc::{ClientHandle, ClientOptions, ServerMonitor};
use crate::worker::shard_store::ShardStore;
use crate::worker::{WorkerActor, WorkerEvent, WorkerOptions};

#[tonic::async_trait]
impl Actor for WorkerActor {
    type Message = WorkerEvent;
    type Options = WorkerOptions;

    fn name() -> &'static str {
        "WorkerActor"
    }

    fn new(options: WorkerOptions) -> Self {
        let driver_client = ClientHandle::new(ClientOptions {
            enable_tls: options.enable_tls,
            host: options.driver_host.clone(),
            port: options.driver_port,
        });
        let store = Arc::new(ShardStore::new(options.data_dir.clone()));
        let executor = Arc::new(Executor::new(ExecutorOptions {
            enable_tls: options.enable_tls,
            pipe_buffer: options.pipe_buffer,
            dial_retry: options.rpc_retry_strategy.clone(),
        }));
        Self {
            options,
            server: ServerMonitor::new(),
            store,
            executor,
            driver_client,
        }
    }

    async fn start(&mut self, ctx: &mut ActorContext<Self>) {
        let addr = (
            self.options.worker_listen_host.clone(),
            self.options.worker_listen_port,
        );
        let server = mem::take(&mut self.server);
        let store = self.store.clone();
        self.server = server
            .start(Self::serve(ctx.handle().clone(), addr, store))
            .await;
    }

    fn receive(&mut self, ctx: &mut ActorContext<Self>, message: WorkerEvent) -> ActorAction {
        match message {
            WorkerEvent::ServerReady { port, signal } => {
                self.handle_server_ready(ctx, port, signal)
            }
            WorkerEvent::ExecuteInstructionSet { set, result } => {
                self.handle_execute_instruction_set(ctx, set, result)
            }
            WorkerEvent::DeleteDatasetShard { name, result } => {
                self.handle_delete_dataset_shard(ctx, name, result)
            }
            WorkerEvent::Shutdown => ActorAction::Stop,
        }
    }

    async fn stop(self, _ctx: &mut ActorContext<Self>) {
        self.server.stop().await;
        info!("worker server has stopped");
    }
}
