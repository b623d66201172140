use crate::error::ExecutionResult;
use crate::executor::{Executor, ExecutorOptions};
use crate::flow::FlowContext;
use crate::id::TaskId;
use crate::plan::{Instruction, InstructionSet};
use crate::registry::ShardRegistry;

/// Executes driver-side tasks in-process. Driver-side groups contain
/// exactly one task; its operator runs on the driver with net channels
/// at both ends, so sources push shards to the workers that will consume
/// them and collectors pull shards from the workers that produced them.
#[tonic::async_trait]
pub trait LocalTaskRunner: Send + Sync {
    async fn run(
        &self,
        flow: &FlowContext,
        task: TaskId,
        registry: &ShardRegistry,
    ) -> ExecutionResult<()>;
}

/// The default runner: the task's operator is driven by the same
/// instruction pipeline the workers use, with every endpoint resolved
/// against the registry.
pub struct ExecutorTaskRunner {
    executor: Executor,
}

impl ExecutorTaskRunner {
    pub fn new(options: ExecutorOptions) -> Self {
        Self {
            executor: Executor::new(options),
        }
    }
}

#[tonic::async_trait]
impl LocalTaskRunner for ExecutorTaskRunner {
    async fn run(
        &self,
        flow: &FlowContext,
        task: TaskId,
        registry: &ShardRegistry,
    ) -> ExecutionResult<()> {
        let task = flow.task(task);
        let step = flow.step(task.step);

        // Input shards are registered when their producing groups are
        // placed. Output shards of a driver-side task are registered by
        // the consuming group once it knows its own worker, so both sides
        // may still be in flight here.
        let mut input_shard_locations = Vec::with_capacity(task.input_shards.len());
        for shard in &task.input_shards {
            input_shard_locations.push(registry.wait(&flow.shard_name(*shard)).await);
        }
        let mut output_shard_locations = Vec::with_capacity(task.output_shards.len());
        for shard in &task.output_shards {
            output_shard_locations.push(registry.wait(&flow.shard_name(*shard)).await);
        }
        let reader_count = task
            .output_shards
            .first()
            .map(|shard| flow.dataset(shard.dataset).reader_count)
            .unwrap_or(1);

        let set = InstructionSet {
            instructions: vec![Instruction {
                name: step.operator.name().to_string(),
                input_shard_locations,
                output_shard_locations,
                operator: Some(step.operator.clone()),
            }],
            reader_count,
        };
        self.executor.execute_instruction_set(set).await
    }
}
