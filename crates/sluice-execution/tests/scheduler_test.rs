use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sluice_execution::driver::{
    Dispatcher, ExecutorTaskRunner, LocalTaskRunner, SchedulerActor, SchedulerEvent,
    SchedulerOptions,
};
use sluice_execution::error::{ExecutionError, ExecutionResult};
use sluice_execution::executor::ExecutorOptions;
use sluice_execution::flow::{FlowContext, ShardRef};
use sluice_execution::id::{FlowId, TaskGroupId, TaskId};
use sluice_execution::market::SupplyMarket;
use sluice_execution::plan::{rpc, InstructionSet, Location, Operator, Order, OrderBy};
use sluice_execution::registry::ShardRegistry;
use sluice_server::actor::{ActorHandle, ActorSystem};
use sluice_server::retry::RetryStrategy;
use tokio::sync::oneshot;
use tokio::time::Instant;

struct Execution {
    set: InstructionSet,
    at: Instant,
}

#[derive(Default)]
struct FakeDispatcher {
    execute_delay: Duration,
    failures_remaining: AtomicUsize,
    fail_deletes: bool,
    executions: Mutex<Vec<Execution>>,
    deletes: Mutex<Vec<(Location, String)>>,
}

#[tonic::async_trait]
impl Dispatcher for FakeDispatcher {
    async fn execute_instruction_set(
        &self,
        _location: &Location,
        set: InstructionSet,
    ) -> ExecutionResult<()> {
        tokio::time::sleep(self.execute_delay).await;
        self.executions.lock().unwrap().push(Execution {
            set,
            at: Instant::now(),
        });
        let failures = &self.failures_remaining;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ExecutionError::InternalError(
                "injected worker failure".to_string(),
            ));
        }
        Ok(())
    }

    async fn delete_dataset_shard(&self, location: &Location, name: &str) -> ExecutionResult<()> {
        self.deletes
            .lock()
            .unwrap()
            .push((location.clone(), name.to_string()));
        if self.fail_deletes {
            Err(ExecutionError::InternalError(
                "injected delete failure".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

fn scatter(indexes: Vec<i32>) -> Operator {
    Operator::ScatterPartitions(rpc::ScatterPartitions { indexes })
}

fn merge(order_bys: Vec<OrderBy>) -> Operator {
    Operator::MergeSortedTo(rpc::MergeSortedTo { order_bys })
}

fn collect() -> Operator {
    Operator::CollectPartitions(rpc::CollectPartitions {})
}

fn order_by(index: i32) -> OrderBy {
    OrderBy {
        index,
        order: Order::Ascending as i32,
    }
}

fn worker(port: u32) -> Location {
    Location {
        host: "10.0.0.1".to_string(),
        port,
    }
}

fn in_process_runner() -> Arc<dyn LocalTaskRunner> {
    Arc::new(ExecutorTaskRunner::new(ExecutorOptions {
        enable_tls: false,
        pipe_buffer: 16,
        dial_retry: RetryStrategy::Fixed {
            max_count: 2,
            delay: Duration::from_millis(50),
        },
    }))
}

fn options(
    registry: Arc<ShardRegistry>,
    market: Arc<SupplyMarket>,
    dispatcher: Arc<FakeDispatcher>,
    local_runner: Arc<dyn LocalTaskRunner>,
) -> SchedulerOptions {
    SchedulerOptions {
        enable_tls: false,
        driver_listen_host: "127.0.0.1".to_string(),
        driver_listen_port: 0,
        task_group_max_attempts: 3,
        task_group_retry_delay: Duration::from_secs(60),
        task_group_retry_deadline: Duration::from_secs(180),
        registry,
        market,
        dispatcher,
        local_runner,
    }
}

async fn submit(
    handle: &ActorHandle<SchedulerActor>,
    flow: &Arc<FlowContext>,
    task_group: TaskGroupId,
) -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    handle
        .send(SchedulerEvent::SubmitTaskGroup {
            flow: flow.clone(),
            task_group,
            bid: 1.0,
            done: tx,
        })
        .await
        .unwrap();
    rx
}

/// Two-stage streaming hash partition: the downstream merge is submitted
/// first and must block on the registry until the upstream scatter has
/// been placed and its shard locations published.
#[tokio::test]
async fn test_streaming_two_stage_submitted_out_of_order() {
    let registry = Arc::new(ShardRegistry::new());
    let market = Arc::new(SupplyMarket::new());
    let dispatcher = Arc::new(FakeDispatcher::default());
    let mut system = ActorSystem::new();
    let handle =
        system.spawn::<SchedulerActor>(options(
            registry.clone(),
            market.clone(),
            dispatcher.clone(),
            in_process_runner(),
        ));

    let mut flow = FlowContext::new(FlowId::from(1));
    let sg_a = flow.add_step_group(vec![]);
    let step_a = flow.add_step(sg_a, scatter(vec![1]), false, true);
    let ds_a = flow.add_dataset(step_a, 4, false, 1);
    let shards_a: Vec<_> = (0..4).map(|index| ShardRef { dataset: ds_a, index }).collect();
    let task_a = flow.add_task(step_a, 0, vec![], shards_a.clone());
    let group_a = flow.add_task_group(vec![task_a]);

    let sg_b = flow.add_step_group(vec![sg_a]);
    let step_b = flow.add_step(sg_b, merge(vec![order_by(1)]), false, true);
    let ds_b = flow.add_dataset(step_b, 1, false, 1);
    let task_b = flow.add_task(
        step_b,
        0,
        shards_a.clone(),
        vec![ShardRef {
            dataset: ds_b,
            index: 0,
        }],
    );
    let group_b = flow.add_task_group(vec![task_b]);
    let flow = Arc::new(flow);

    market.add_supply(worker(7001));
    market.add_supply(worker(7002));

    let done_b = submit(&handle, &flow, group_b).await;
    let done_a = submit(&handle, &flow, group_a).await;
    done_a.await.unwrap();
    done_b.await.unwrap();

    let executions = dispatcher.executions.lock().unwrap();
    assert_eq!(executions.len(), 2);
    // The scatter is dispatched first even though it was submitted last.
    let set_a = &executions[0].set;
    assert_eq!(set_a.instructions[0].name, "ScatterPartitions");
    let published: Vec<_> = set_a.instructions[0]
        .output_shard_locations
        .iter()
        .map(|x| x.name.clone())
        .collect();
    assert_eq!(
        published,
        vec!["f1-d0-s0", "f1-d0-s1", "f1-d0-s2", "f1-d0-s3"]
    );
    let set_b = &executions[1].set;
    assert_eq!(set_b.instructions[0].name, "MergeSortedTo");
    assert_eq!(set_b.instructions[0].input_shard_locations.len(), 4);
    for location in &set_b.instructions[0].input_shard_locations {
        // Every input the merge dials is the location the scatter
        // published before it was dispatched.
        let registered = registry.get(&location.name).unwrap();
        assert_eq!(location.location, registered.location);
        assert!(location.location.is_some());
    }
    assert_eq!(set_b.reader_count, 1);
}

/// A restartable group is retried after a transient failure, within the
/// attempt and deadline budget, and the final attempt's outcome wins.
#[tokio::test(start_paused = true)]
async fn test_restartable_group_retries_on_failure() {
    let registry = Arc::new(ShardRegistry::new());
    let market = Arc::new(SupplyMarket::new());
    let dispatcher = Arc::new(FakeDispatcher {
        execute_delay: Duration::from_secs(10),
        failures_remaining: AtomicUsize::new(1),
        ..Default::default()
    });
    let mut system = ActorSystem::new();
    let handle =
        system.spawn::<SchedulerActor>(options(
            registry,
            market.clone(),
            dispatcher.clone(),
            in_process_runner(),
        ));

    let mut flow = FlowContext::new(FlowId::from(2));
    let sg = flow.add_step_group(vec![]);
    let step = flow.add_step(sg, scatter(vec![1]), false, true);
    let ds = flow.add_dataset(step, 1, false, 1);
    let task = flow.add_task(step, 0, vec![], vec![ShardRef { dataset: ds, index: 0 }]);
    let group = flow.add_task_group(vec![task]);
    let flow = Arc::new(flow);

    market.add_supply(worker(7001));
    let started = Instant::now();
    let done = submit(&handle, &flow, group).await;
    done.await.unwrap();

    assert_eq!(dispatcher.executions.lock().unwrap().len(), 2);
    assert!(started.elapsed() <= Duration::from_secs(180));
    assert!(started.elapsed() >= Duration::from_secs(70));
    // The second attempt succeeded, so no error is observed.
    assert!(flow.task_group_error(group).is_none());
    assert!(flow.is_task_group_stopped(group));
}

/// A non-restartable group with all-on-disk inputs must wait for the
/// upstream step group to complete, even though the upstream shard
/// locations are registered before the upstream group finishes.
#[tokio::test(start_paused = true)]
async fn test_on_disk_non_restartable_waits_for_upstream_completion() {
    let registry = Arc::new(ShardRegistry::new());
    let market = Arc::new(SupplyMarket::new());
    let dispatcher = Arc::new(FakeDispatcher {
        execute_delay: Duration::from_secs(10),
        ..Default::default()
    });
    let mut system = ActorSystem::new();
    let handle =
        system.spawn::<SchedulerActor>(options(
            registry,
            market.clone(),
            dispatcher.clone(),
            in_process_runner(),
        ));

    let mut flow = FlowContext::new(FlowId::from(3));
    let sg_u = flow.add_step_group(vec![]);
    let step_u = flow.add_step(sg_u, scatter(vec![1]), false, true);
    let ds_u = flow.add_dataset(step_u, 2, true, 1);
    let shards_u: Vec<_> = (0..2).map(|index| ShardRef { dataset: ds_u, index }).collect();
    let task_u = flow.add_task(step_u, 0, vec![], shards_u.clone());
    let group_u = flow.add_task_group(vec![task_u]);

    let sg_d = flow.add_step_group(vec![sg_u]);
    let step_d = flow.add_step(sg_d, collect(), false, false);
    let ds_d = flow.add_dataset(step_d, 1, true, 1);
    let task_d = flow.add_task(
        step_d,
        0,
        shards_u,
        vec![ShardRef {
            dataset: ds_d,
            index: 0,
        }],
    );
    let group_d = flow.add_task_group(vec![task_d]);
    let flow = Arc::new(flow);

    market.add_supply(worker(7001));
    market.add_supply(worker(7002));

    let done_d = submit(&handle, &flow, group_d).await;
    let done_u = submit(&handle, &flow, group_u).await;
    done_u.await.unwrap();
    done_d.await.unwrap();

    let executions = dispatcher.executions.lock().unwrap();
    assert_eq!(executions.len(), 2);
    assert_eq!(executions[0].set.instructions[0].name, "ScatterPartitions");
    assert_eq!(executions[1].set.instructions[0].name, "CollectPartitions");
    // The downstream was not dispatched before the upstream completed.
    let gap = executions[1].at - executions[0].at;
    assert!(gap >= Duration::from_secs(10));
}

struct RecordingLocalRunner {
    ran: Mutex<Vec<TaskId>>,
}

#[tonic::async_trait]
impl LocalTaskRunner for RecordingLocalRunner {
    async fn run(
        &self,
        _flow: &FlowContext,
        task: TaskId,
        _registry: &ShardRegistry,
    ) -> ExecutionResult<()> {
        self.ran.lock().unwrap().push(task);
        Ok(())
    }
}

/// A driver-side group bypasses placement entirely: its single task runs
/// through the local runner, nothing is dispatched to a worker, and the
/// group still reaches a terminal state.
#[tokio::test]
async fn test_driver_side_group_runs_in_process() {
    let registry = Arc::new(ShardRegistry::new());
    let market = Arc::new(SupplyMarket::new());
    let dispatcher = Arc::new(FakeDispatcher::default());
    let runner = Arc::new(RecordingLocalRunner {
        ran: Mutex::new(Vec::new()),
    });
    let mut system = ActorSystem::new();
    let handle = system.spawn::<SchedulerActor>(options(
        registry,
        market,
        dispatcher.clone(),
        runner.clone(),
    ));

    let mut flow = FlowContext::new(FlowId::from(5));
    let sg = flow.add_step_group(vec![]);
    let step = flow.add_step(sg, scatter(vec![1]), true, true);
    let ds = flow.add_dataset(step, 1, false, 1);
    let task = flow.add_task(step, 0, vec![], vec![ShardRef { dataset: ds, index: 0 }]);
    let group = flow.add_task_group(vec![task]);
    let flow = Arc::new(flow);

    // No market supply is needed; the group never asks for placement.
    let done = submit(&handle, &flow, group).await;
    done.await.unwrap();

    assert_eq!(*runner.ran.lock().unwrap(), vec![task]);
    assert!(dispatcher.executions.lock().unwrap().is_empty());
    assert!(flow.is_task_group_stopped(group));
    assert!(flow.task_group_error(group).is_none());
}

/// Release sends one delete per registered output shard, skips
/// unregistered shards, and completes even when deletes fail.
#[tokio::test]
async fn test_release_purges_registered_shards() {
    let registry = Arc::new(ShardRegistry::new());
    let market = Arc::new(SupplyMarket::new());
    let dispatcher = Arc::new(FakeDispatcher {
        fail_deletes: true,
        ..Default::default()
    });
    let mut system = ActorSystem::new();
    let handle =
        system.spawn::<SchedulerActor>(options(
            registry.clone(),
            market,
            dispatcher.clone(),
            in_process_runner(),
        ));

    let mut flow = FlowContext::new(FlowId::from(4));
    let sg = flow.add_step_group(vec![]);
    let step = flow.add_step(sg, scatter(vec![1]), false, true);
    let ds = flow.add_dataset(step, 3, true, 1);
    let shards: Vec<_> = (0..3).map(|index| ShardRef { dataset: ds, index }).collect();
    let task = flow.add_task(step, 0, vec![], shards);
    let group = flow.add_task_group(vec![task]);
    let flow = Arc::new(flow);

    // Only two of the three shards ever got registered.
    for index in 0..2 {
        registry.set(sluice_execution::plan::DataLocation {
            name: format!("f4-d0-s{index}"),
            location: Some(worker(7001)),
            on_disk: true,
        });
    }

    let (tx, rx) = oneshot::channel();
    handle
        .send(SchedulerEvent::ReleaseTaskGroupInputs {
            flow: flow.clone(),
            task_groups: vec![group],
            done: tx,
        })
        .await
        .unwrap();
    rx.await.unwrap();

    let deletes = dispatcher.deletes.lock().unwrap();
    let mut names: Vec<_> = deletes.iter().map(|(_, name)| name.clone()).collect();
    names.sort();
    assert_eq!(names, vec!["f4-d0-s0", "f4-d0-s1"]);
}
