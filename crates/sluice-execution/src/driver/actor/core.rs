use std::mem;

use log::info;
use sluice_server::actor::{Actor, ActorAction, ActorContext};

use crate::driver::actor::SchedulerActor;
use crate::driver::event::SchedulerEvent;
use crate::driver::options::SchedulerOptions;
use crate::rpc::ServerMonitor;

#[tonic::async_trait]
impl Actor for SchedulerActor {
    type Message = SchedulerEvent;
    type Options = SchedulerOptions;

    fn name() -> &'static str {
        "SchedulerActor"
    }

    fn new(options: SchedulerOptions) -> Self {
        Self {
            options,
            server: ServerMonitor::new(),
        }
    }

    async fn start(&mut self, ctx: &mut ActorContext<Self>) {
        let addr = (
            self.options.driver_listen_host.clone(),
            self.options.driver_listen_port,
        );
        let server = mem::take(&mut self.server);
        self.server = server.start(Self::serve(ctx.handle().clone(), addr)).await;
    }

    fn receive(&mut self, ctx: &mut ActorContext<Self>, message: SchedulerEvent) -> ActorAction {
        match message {
            SchedulerEvent::ServerReady { port, signal } => {
                self.handle_server_ready(ctx, port, signal)
            }
            SchedulerEvent::RegisterWorker { host, port } => {
                self.handle_register_worker(ctx, host, port)
            }
            SchedulerEvent::SubmitTaskGroup {
                flow,
                task_group,
                bid,
                done,
            } => self.handle_submit_task_group(ctx, flow, task_group, bid, done),
            SchedulerEvent::TaskGroupStatus {
                flow,
                task_group,
                completed,
                error,
            } => self.handle_task_group_status(ctx, flow, task_group, completed, error),
            SchedulerEvent::ReleaseTaskGroupInputs {
                flow,
                task_groups,
                done,
            } => self.handle_release_task_group_inputs(ctx, flow, task_groups, done),
            SchedulerEvent::Shutdown => ActorAction::Stop,
        }
    }

    async fn stop(self, _ctx: &mut ActorContext<Self>) {
        self.server.stop().await;
        info!("driver server has stopped");
    }
}
