use std::mem;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use sluice_server::actor::{ActorAction, ActorContext, ActorHandle};
use sluice_server::retry::RetryStrategy;
use sluice_server::ServerBuilder;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::oneshot;
use tokio::task::JoinSet;

use crate::driver::actor::SchedulerActor;
use crate::driver::dispatcher::Dispatcher;
use crate::driver::event::SchedulerEvent;
use crate::driver::runner::LocalTaskRunner;
use crate::driver::rpc::driver_service_server::DriverServiceServer;
use crate::driver::server::DriverServer;
use crate::error::{ExecutionError, ExecutionResult};
use crate::flow::FlowContext;
use crate::id::TaskGroupId;
use crate::market::{DemandRequirement, SupplyMarket};
use crate::plan::{DataLocation, Instruction, InstructionSet, Location};
use crate::registry::ShardRegistry;

/// The restart policy for restartable task groups.
#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_attempts: usize,
    delay: Duration,
    deadline: Duration,
}

impl SchedulerActor {
    pub(super) fn handle_server_ready(
        &mut self,
        _ctx: &mut ActorContext<Self>,
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
        info!("driver server is ready on port {port}");
        ActorAction::Continue
    }

    pub(super) fn handle_register_worker(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        host: String,
        port: u16,
    ) -> ActorAction {
        info!("worker is available at {host}:{port}");
        self.options.market.add_supply(Location {
            host,
            port: port as u32,
        });
        ActorAction::Continue
    }

    pub(super) fn handle_task_group_status(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        flow: Arc<FlowContext>,
        task_group: TaskGroupId,
        completed: bool,
        error: Option<String>,
    ) -> ActorAction {
        // A pure observation; nothing in the scheduler depends on it.
        debug!(
            "flow {} task group {task_group} status: completed={completed} error={error:?}",
            flow.id
        );
        ActorAction::Continue
    }

    pub(super) fn handle_submit_task_group(
        &mut self,
        ctx: &mut ActorContext<Self>,
        flow: Arc<FlowContext>,
        task_group: TaskGroupId,
        bid: f64,
        done: oneshot::Sender<()>,
    ) -> ActorAction {
        let registry = self.options.registry.clone();
        let market = self.options.market.clone();
        let dispatcher = self.options.dispatcher.clone();
        let local_runner = self.options.local_runner.clone();
        let policy = RetryPolicy {
            max_attempts: self.options.task_group_max_attempts,
            delay: self.options.task_group_retry_delay,
            deadline: self.options.task_group_retry_deadline,
        };
        ctx.spawn(async move {
            run_task_group(
                flow,
                task_group,
                bid,
                registry,
                market,
                dispatcher,
                local_runner,
                policy,
            )
            .await;
            if done.send(()).is_err() {
                warn!("the submitter of task group {task_group} went away");
            }
        });
        ActorAction::Continue
    }

    pub(super) fn handle_release_task_group_inputs(
        &mut self,
        ctx: &mut ActorContext<Self>,
        flow: Arc<FlowContext>,
        task_groups: Vec<TaskGroupId>,
        done: oneshot::Sender<()>,
    ) -> ActorAction {
        let registry = self.options.registry.clone();
        let dispatcher = self.options.dispatcher.clone();
        ctx.spawn(async move {
            let mut deletes = JoinSet::new();
            for task_group in task_groups {
                let group = flow.task_group(task_group);
                let Some(last) = group.tasks.last() else {
                    continue;
                };
                for shard in &flow.task(*last).output_shards {
                    let name = flow.shard_name(*shard);
                    // Skip shards that were never registered.
                    let Some(location) = registry.get(&name) else {
                        continue;
                    };
                    let Some(peer) = location.location else {
                        continue;
                    };
                    let dispatcher = dispatcher.clone();
                    deletes.spawn(async move {
                        if let Err(e) = dispatcher.delete_dataset_shard(&peer, &name).await {
                            warn!("failed to purge shard {name}: {e}");
                        }
                    });
                }
            }
            while deletes.join_next().await.is_some() {}
            let _ = done.send(());
        });
        ActorAction::Continue
    }

    pub(super) async fn serve(
        handle: ActorHandle<Self>,
        addr: impl ToSocketAddrs + Send,
    ) -> ExecutionResult<()> {
        let listener = TcpListener::bind(addr).await?;
        let port = listener.local_addr()?.port();
        let (tx, rx) = oneshot::channel();
        let service = DriverServiceServer::new(DriverServer::new(handle.clone()));

        handle
            .send(SchedulerEvent::ServerReady { port, signal: tx })
            .await?;

        ServerBuilder::new("sluice_driver", Default::default())
            .add_service(service)
            .await
            .serve(listener, async {
                let _ = rx.await;
            })
            .await
            .map_err(|e| ExecutionError::InternalError(e.to_string()))
    }
}

/// Orchestrate one task group from submission to terminal state.
#[allow(clippy::too_many_arguments)]
async fn run_task_group(
    flow: Arc<FlowContext>,
    task_group: TaskGroupId,
    bid: f64,
    registry: Arc<ShardRegistry>,
    market: Arc<SupplyMarket>,
    dispatcher: Arc<dyn Dispatcher>,
    local_runner: Arc<dyn LocalTaskRunner>,
    policy: RetryPolicy,
) {
    let group = flow.task_group(task_group);
    let tasks = &group.tasks;
    let first = tasks[0];
    let last = tasks[tasks.len() - 1];

    if flow.step(flow.task(first).step).is_on_driver_side {
        // Groups on the driver side contain exactly one task.
        let out = local_runner.run(&flow, last, &registry).await;
        if let Err(e) = &out {
            error!("driver-side task group {task_group} failed: {e}");
        }
        flow.mark_task_group_stop(task_group, out.as_ref().err());
        return;
    }

    if !flow.needs_input_from_driver(first) {
        // Block until every upstream producer has published a location.
        let names: Vec<_> = flow
            .task(first)
            .input_shards
            .iter()
            .map(|shard| flow.shard_name(*shard))
            .collect();
        registry.wait_all(names).await;
    }
    if flow.is_input_on_disk(first) && !flow.is_restartable_tasks(tasks) {
        // On-disk inputs outlive their producers only once the producers
        // ran to completion; a non-restartable consumer cannot tolerate
        // partial inputs.
        let parent = flow.step_group(group.parent_step_group);
        for step_group in &parent.parents {
            flow.step_group(*step_group).wait_for_all_tasks().await;
        }
    }

    let picked = market.add_demand(DemandRequirement { task_group }, bid);
    let supply = match picked.await {
        Ok(supply) => supply,
        Err(_) => {
            let e = ExecutionError::InternalError(
                "the market refused the placement demand".to_string(),
            );
            error!("failed to place task group {task_group}: {e}");
            flow.mark_task_group_stop(task_group, Some(&e));
            return;
        }
    };
    let allocation = supply.allocation.clone();

    if flow.needs_input_from_driver(first) {
        // Tell the driver where to deliver the inputs it produces.
        for shard in &flow.task(first).input_shards {
            registry.set(DataLocation {
                name: flow.shard_name(*shard),
                location: Some(allocation.location.clone()),
                on_disk: flow.dataset(shard.dataset).on_disk,
            });
        }
    }
    // Publish the group's external outputs so downstream groups can
    // find them. This happens before dispatch, so every published
    // location is immediately dialable.
    for shard in &flow.task(last).output_shards {
        registry.set(DataLocation {
            name: flow.shard_name(*shard),
            location: Some(allocation.location.clone()),
            on_disk: flow.dataset(shard.dataset).on_disk,
        });
    }

    let attempt = || {
        let flow = flow.clone();
        let registry = registry.clone();
        let dispatcher = dispatcher.clone();
        let location = allocation.location.clone();
        async move {
            let set = compile_instruction_set(&flow, task_group, &registry)?;
            let out = dispatcher.execute_instruction_set(&location, set).await;
            flow.mark_task_group_stop(task_group, out.as_ref().err());
            out
        }
    };
    let out = if flow.is_restartable_tasks(tasks) {
        // Bounded by both the attempt count and the wall-clock deadline;
        // only the final attempt's error is reported.
        let strategy = RetryStrategy::Fixed {
            max_count: policy.max_attempts.saturating_sub(1),
            delay: policy.delay,
        };
        strategy.run_with_deadline(attempt, policy.deadline).await
    } else {
        attempt().await
    };
    if let Err(e) = out {
        error!("task group {task_group} failed: {e}");
    }
    market.return_supply(supply);
}

/// Compile a task group into its executable wire form, resolving the
/// first task's input locations and the last task's output locations
/// against the registry.
fn compile_instruction_set(
    flow: &FlowContext,
    task_group: TaskGroupId,
    registry: &ShardRegistry,
) -> ExecutionResult<InstructionSet> {
    let group = flow.task_group(task_group);
    let count = group.tasks.len();
    let mut instructions = Vec::with_capacity(count);
    for (index, task_id) in group.tasks.iter().enumerate() {
        let task = flow.task(*task_id);
        let step = flow.step(task.step);
        let is_first = index == 0;
        let is_last = index + 1 == count;
        let input_shard_locations = if is_first {
            resolve_locations(flow, registry, &task.input_shards)?
        } else {
            Vec::new()
        };
        let output_shard_locations = if is_last {
            resolve_locations(flow, registry, &task.output_shards)?
        } else {
            Vec::new()
        };
        instructions.push(Instruction {
            name: step.operator.name().to_string(),
            input_shard_locations,
            output_shard_locations,
            operator: Some(step.operator.clone()),
        });
    }
    let reader_count = flow
        .task(group.tasks[count - 1])
        .output_shards
        .first()
        .map(|shard| flow.dataset(shard.dataset).reader_count)
        .unwrap_or(1);
    Ok(InstructionSet {
        instructions,
        reader_count,
    })
}

fn resolve_locations(
    flow: &FlowContext,
    registry: &ShardRegistry,
    shards: &[crate::flow::ShardRef],
) -> ExecutionResult<Vec<DataLocation>> {
    shards
        .iter()
        .map(|shard| {
            let name = flow.shard_name(*shard);
            registry.get(&name).ok_or_else(|| {
                ExecutionError::InternalError(format!("shard {name} has not been registered"))
            })
        })
        .collect()
}
