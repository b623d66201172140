use std::sync::Mutex;

use tokio::sync::watch;

use crate::error::ExecutionError;
use crate::id::{DatasetId, FlowId, StepGroupId, StepId, TaskGroupId, TaskId};
use crate::plan::Operator;

/// A reference to one shard of a dataset. Entities reference each other
/// by id; the arenas in [`FlowContext`] own everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardRef {
    pub dataset: DatasetId,
    pub index: usize,
}

#[derive(Debug)]
pub struct DatasetShard {
    pub dataset: DatasetId,
    pub index: usize,
}

#[derive(Debug)]
pub struct Dataset {
    pub id: DatasetId,
    /// The step that produces this dataset.
    pub step: StepId,
    pub shards: Vec<DatasetShard>,
    /// Whether shards are materialized to disk and durable until release,
    /// as opposed to transient streams consumed concurrently.
    pub on_disk: bool,
    /// The planner-declared number of distinct downstream consumers
    /// per shard.
    pub reader_count: u32,
}

#[derive(Debug)]
pub struct Step {
    pub id: StepId,
    pub step_group: StepGroupId,
    /// Driver-side steps run in-process on the driver.
    pub is_on_driver_side: bool,
    /// Restartable steps may be re-executed after failure.
    pub is_restartable: bool,
    pub operator: Operator,
    pub output_dataset: Option<DatasetId>,
}

#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    pub step: StepId,
    pub index: usize,
    pub input_shards: Vec<ShardRef>,
    pub output_shards: Vec<ShardRef>,
}

/// An ordered pipelined chain of tasks that must be co-located and
/// co-executed on one worker. The last task's outputs are the ones
/// published externally.
pub struct TaskGroup {
    pub id: TaskGroupId,
    pub tasks: Vec<TaskId>,
    pub parent_step_group: StepGroupId,
    state: Mutex<TaskGroupState>,
}

#[derive(Default)]
struct TaskGroupState {
    stopped: bool,
    counted: bool,
    error: Option<String>,
}

pub struct StepGroup {
    pub id: StepGroupId,
    pub steps: Vec<StepId>,
    pub parents: Vec<StepGroupId>,
    completion: TaskCompletion,
}

impl StepGroup {
    /// The completion barrier: resolves once every task of the group has
    /// reached a terminal state, success or failure.
    pub async fn wait_for_all_tasks(&self) {
        self.completion.wait().await
    }
}

/// Counts outstanding tasks; the barrier fires when the count drains.
struct TaskCompletion {
    remaining: watch::Sender<usize>,
}

impl TaskCompletion {
    fn new() -> Self {
        Self {
            remaining: watch::channel(0).0,
        }
    }

    fn add(&self, n: usize) {
        self.remaining.send_modify(|x| *x += n);
    }

    fn done(&self, n: usize) {
        self.remaining.send_modify(|x| *x = x.saturating_sub(n));
    }

    async fn wait(&self) {
        let mut rx = self.remaining.subscribe();
        let _ = rx.wait_for(|x| *x == 0).await;
    }
}

/// Owns all flow entities. Cyclic relations between datasets, steps,
/// tasks and groups are expressed as id references into the arenas,
/// so destruction is bulk.
pub struct FlowContext {
    pub id: FlowId,
    datasets: Vec<Dataset>,
    steps: Vec<Step>,
    tasks: Vec<Task>,
    task_groups: Vec<TaskGroup>,
    step_groups: Vec<StepGroup>,
}

impl FlowContext {
    pub fn new(id: FlowId) -> Self {
        Self {
            id,
            datasets: Vec::new(),
            steps: Vec::new(),
            tasks: Vec::new(),
            task_groups: Vec::new(),
            step_groups: Vec::new(),
        }
    }

    pub fn add_step_group(&mut self, parents: Vec<StepGroupId>) -> StepGroupId {
        let id = StepGroupId::from(self.step_groups.len());
        self.step_groups.push(StepGroup {
            id,
            steps: Vec::new(),
            parents,
            completion: TaskCompletion::new(),
        });
        id
    }

    pub fn add_step(
        &mut self,
        step_group: StepGroupId,
        operator: Operator,
        is_on_driver_side: bool,
        is_restartable: bool,
    ) -> StepId {
        let id = StepId::from(self.steps.len());
        self.steps.push(Step {
            id,
            step_group,
            is_on_driver_side,
            is_restartable,
            operator,
            output_dataset: None,
        });
        self.step_groups[usize::from(step_group)].steps.push(id);
        id
    }

    pub fn add_dataset(
        &mut self,
        step: StepId,
        shard_count: usize,
        on_disk: bool,
        reader_count: u32,
    ) -> DatasetId {
        let id = DatasetId::from(self.datasets.len());
        let shards = (0..shard_count)
            .map(|index| DatasetShard { dataset: id, index })
            .collect();
        self.datasets.push(Dataset {
            id,
            step,
            shards,
            on_disk,
            reader_count,
        });
        self.steps[usize::from(step)].output_dataset = Some(id);
        id
    }

    pub fn add_task(
        &mut self,
        step: StepId,
        index: usize,
        input_shards: Vec<ShardRef>,
        output_shards: Vec<ShardRef>,
    ) -> TaskId {
        let id = TaskId::from(self.tasks.len());
        self.tasks.push(Task {
            id,
            step,
            index,
            input_shards,
            output_shards,
        });
        let step_group = self.steps[usize::from(step)].step_group;
        self.step_groups[usize::from(step_group)].completion.add(1);
        id
    }

    pub fn add_task_group(&mut self, tasks: Vec<TaskId>) -> TaskGroupId {
        assert!(!tasks.is_empty(), "a task group must contain tasks");
        let id = TaskGroupId::from(self.task_groups.len());
        let parent_step_group = self.steps[usize::from(self.tasks[usize::from(tasks[0])].step)].step_group;
        self.task_groups.push(TaskGroup {
            id,
            tasks,
            parent_step_group,
            state: Mutex::new(TaskGroupState::default()),
        });
        id
    }

    pub fn dataset(&self, id: DatasetId) -> &Dataset {
        &self.datasets[usize::from(id)]
    }

    pub fn step(&self, id: StepId) -> &Step {
        &self.steps[usize::from(id)]
    }

    pub fn task(&self, id: TaskId) -> &Task {
        &self.tasks[usize::from(id)]
    }

    pub fn task_group(&self, id: TaskGroupId) -> &TaskGroup {
        &self.task_groups[usize::from(id)]
    }

    pub fn step_group(&self, id: StepGroupId) -> &StepGroup {
        &self.step_groups[usize::from(id)]
    }

    /// The globally unique name of a shard, derived from the flow id,
    /// the dataset id and the shard index.
    pub fn shard_name(&self, shard: ShardRef) -> String {
        format!("f{}-d{}-s{}", self.id, shard.dataset, shard.index)
    }

    /// Whether any input shard of the task is produced by a driver-side
    /// step. Such inputs cannot be pre-registered; they are pushed from
    /// the driver once the consumer has been placed.
    pub fn needs_input_from_driver(&self, task: TaskId) -> bool {
        self.task(task)
            .input_shards
            .iter()
            .any(|shard| self.step(self.dataset(shard.dataset).step).is_on_driver_side)
    }

    /// Whether every input shard of the task uses on-disk mode.
    /// A mixed set is treated as streaming.
    pub fn is_input_on_disk(&self, task: TaskId) -> bool {
        self.task(task)
            .input_shards
            .iter()
            .all(|shard| self.dataset(shard.dataset).on_disk)
    }

    /// Whether every task's step is marked restartable.
    pub fn is_restartable_tasks(&self, tasks: &[TaskId]) -> bool {
        tasks
            .iter()
            .all(|task| self.step(self.task(*task).step).is_restartable)
    }

    /// Record the terminal state of a task group attempt and feed the
    /// parent step-group completion barrier. The barrier is fed once per
    /// group; later attempts only update the observed error.
    pub fn mark_task_group_stop(&self, id: TaskGroupId, error: Option<&ExecutionError>) {
        let group = self.task_group(id);
        let count = {
            let mut state = group.state.lock().unwrap();
            state.stopped = true;
            state.error = error.map(|e| e.to_string());
            if state.counted {
                None
            } else {
                state.counted = true;
                Some(group.tasks.len())
            }
        };
        if let Some(count) = count {
            self.step_group(group.parent_step_group)
                .completion
                .done(count);
        }
    }

    pub fn task_group_error(&self, id: TaskGroupId) -> Option<String> {
        self.task_group(id).state.lock().unwrap().error.clone()
    }

    pub fn is_task_group_stopped(&self, id: TaskGroupId) -> bool {
        self.task_group(id).state.lock().unwrap().stopped
    }
}

#[cfg(test)]
mod tests {
    use crate::plan::rpc;

    use super::*;

    fn scatter() -> Operator {
        Operator::ScatterPartitions(rpc::ScatterPartitions { indexes: vec![1] })
    }

    fn single_task_flow() -> (FlowContext, TaskGroupId) {
        let mut flow = FlowContext::new(FlowId::from(1));
        let group = flow.add_step_group(vec![]);
        let step = flow.add_step(group, scatter(), false, true);
        let dataset = flow.add_dataset(step, 2, false, 1);
        let task = flow.add_task(
            step,
            0,
            vec![],
            vec![
                ShardRef { dataset, index: 0 },
                ShardRef { dataset, index: 1 },
            ],
        );
        let task_group = flow.add_task_group(vec![task]);
        (flow, task_group)
    }

    #[test]
    fn test_shard_name() {
        let (flow, task_group) = single_task_flow();
        let task = flow.task(flow.task_group(task_group).tasks[0]);
        let names: Vec<_> = task
            .output_shards
            .iter()
            .map(|s| flow.shard_name(*s))
            .collect();
        assert_eq!(names, vec!["f1-d0-s0", "f1-d0-s1"]);
    }

    #[tokio::test]
    async fn test_barrier_fires_on_mark_stop() {
        let (flow, task_group) = single_task_flow();
        let step_group = flow.task_group(task_group).parent_step_group;
        let wait = flow.step_group(step_group).wait_for_all_tasks();
        tokio::pin!(wait);
        assert!(futures::poll!(wait.as_mut()).is_pending());
        flow.mark_task_group_stop(task_group, None);
        wait.await;
        assert!(flow.is_task_group_stopped(task_group));
        assert!(flow.task_group_error(task_group).is_none());
    }

    #[tokio::test]
    async fn test_mark_stop_counts_once() {
        let (flow, task_group) = single_task_flow();
        let step_group = flow.task_group(task_group).parent_step_group;
        flow.mark_task_group_stop(
            task_group,
            Some(&ExecutionError::InternalError("boom".to_string())),
        );
        flow.mark_task_group_stop(task_group, None);
        flow.step_group(step_group).wait_for_all_tasks().await;
        assert!(flow.task_group_error(task_group).is_none());
    }
}
