use log::debug;
use sluice_server::retry::RetryStrategy;
use tokio::task::JoinSet;

use crate::error::{ExecutionError, ExecutionResult};
use crate::netchan::{dial_read_channel, dial_write_channel};
use crate::operator;
use crate::pipe::{pipe, PipeReader, PipeWriter};
use crate::plan::{DataLocation, Instruction, InstructionSet, Operator};

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub enable_tls: bool,
    pub pipe_buffer: usize,
    pub dial_retry: RetryStrategy,
}

/// Builds the per-task pipeline of operators connected by in-process
/// pipes and drives it to completion. The first operator's input and the
/// last operator's output connect to net channels; fan-in operators dial
/// every declared input and fan-out operators dial every declared output
/// themselves.
pub struct Executor {
    options: ExecutorOptions,
}

impl Executor {
    pub fn new(options: ExecutorOptions) -> Self {
        Self { options }
    }

    /// Run every operator, net reader and net writer of the instruction
    /// set and return only once all of them have terminated. The first
    /// error is reported; the rest unwind through pipe closure.
    pub async fn execute_instruction_set(&self, set: InstructionSet) -> ExecutionResult<()> {
        let reader_count = set.reader_count;
        let count = set.instructions.len();
        let mut tasks: JoinSet<ExecutionResult<()>> = JoinSet::new();
        let mut prev: Option<PipeReader> = None;
        for (index, instruction) in set.instructions.into_iter().enumerate() {
            let is_first = index == 0;
            let is_last = index + 1 == count;
            prev = self.launch_instruction(
                &mut tasks,
                instruction,
                prev.take(),
                is_first,
                is_last,
                reader_count,
            )?;
        }
        drop(prev);

        let mut first_error = None;
        while let Some(result) = tasks.join_next().await {
            let result = result.unwrap_or_else(|e| Err(e.into()));
            match result {
                Ok(()) => {}
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(e) => debug!("pipeline unwound with: {e}"),
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn launch_instruction(
        &self,
        tasks: &mut JoinSet<ExecutionResult<()>>,
        instruction: Instruction,
        prev: Option<PipeReader>,
        is_first: bool,
        is_last: bool,
        reader_count: u32,
    ) -> ExecutionResult<Option<PipeReader>> {
        let Instruction {
            name,
            input_shard_locations,
            output_shard_locations,
            operator,
        } = instruction;
        let operator = operator.ok_or_else(|| {
            ExecutionError::InvalidArgument(format!("unknown instruction variant: {name}"))
        })?;
        match operator {
            Operator::Script(op) => {
                let input = self.single_input(tasks, &input_shard_locations, prev, is_first)?;
                let (out_tx, out_rx) = self.new_pipe();
                tasks.spawn(operator::script(input, out_tx, op.path, op.args, op.is_pipe));
                self.single_output(tasks, &output_shard_locations, out_rx, is_last, reader_count)
            }
            Operator::LocalSort(op) => {
                let input = self.single_input(tasks, &input_shard_locations, prev, is_first)?;
                let (out_tx, out_rx) = self.new_pipe();
                tasks.spawn(operator::local_sort(input, out_tx, op.order_bys));
                self.single_output(tasks, &output_shard_locations, out_rx, is_last, reader_count)
            }
            Operator::PipeAsArgs(op) => {
                let input = self.single_input(tasks, &input_shard_locations, prev, is_first)?;
                let (out_tx, out_rx) = self.new_pipe();
                tasks.spawn(operator::pipe_as_args(input, out_tx, op.code));
                self.single_output(tasks, &output_shard_locations, out_rx, is_last, reader_count)
            }
            Operator::InputSplitReader(op) => {
                let input = self.single_input(tasks, &input_shard_locations, prev, is_first)?;
                let (out_tx, out_rx) = self.new_pipe();
                tasks.spawn(operator::input_split_reader(input, out_tx, op.input_type));
                self.single_output(tasks, &output_shard_locations, out_rx, is_last, reader_count)
            }
            Operator::LocalTop(op) => {
                let input = self.single_input(tasks, &input_shard_locations, prev, is_first)?;
                let (out_tx, out_rx) = self.new_pipe();
                tasks.spawn(operator::local_top(
                    input,
                    out_tx,
                    op.n.max(0) as usize,
                    op.order_bys,
                ));
                self.single_output(tasks, &output_shard_locations, out_rx, is_last, reader_count)
            }
            Operator::MergeSortedTo(op) => {
                let inputs = self.fan_in(tasks, &input_shard_locations)?;
                let (out_tx, out_rx) = self.new_pipe();
                tasks.spawn(operator::merge_sorted_to(inputs, out_tx, op.order_bys));
                self.single_output(tasks, &output_shard_locations, out_rx, is_last, reader_count)
            }
            Operator::CollectPartitions(_) => {
                let inputs = self.fan_in(tasks, &input_shard_locations)?;
                let (out_tx, out_rx) = self.new_pipe();
                tasks.spawn(operator::collect_partitions(inputs, out_tx));
                self.single_output(tasks, &output_shard_locations, out_rx, is_last, reader_count)
            }
            Operator::JoinPartitionedSorted(op) => {
                let (left, right) = self.two_inputs(tasks, &name, &input_shard_locations)?;
                let (out_tx, out_rx) = self.new_pipe();
                tasks.spawn(operator::join_partitioned_sorted(
                    left,
                    right,
                    op.indexes,
                    op.is_left_outer_join,
                    op.is_right_outer_join,
                    out_tx,
                ));
                self.single_output(tasks, &output_shard_locations, out_rx, is_last, reader_count)
            }
            Operator::CoGroupPartitionedSorted(op) => {
                let (left, right) = self.two_inputs(tasks, &name, &input_shard_locations)?;
                let (out_tx, out_rx) = self.new_pipe();
                tasks.spawn(operator::co_group_partitioned_sorted(
                    left, right, op.indexes, out_tx,
                ));
                self.single_output(tasks, &output_shard_locations, out_rx, is_last, reader_count)
            }
            Operator::LocalHashAndJoinWith(op) => {
                let (left, right) = self.two_inputs(tasks, &name, &input_shard_locations)?;
                let (out_tx, out_rx) = self.new_pipe();
                tasks.spawn(operator::local_hash_and_join_with(
                    left, right, op.indexes, out_tx,
                ));
                self.single_output(tasks, &output_shard_locations, out_rx, is_last, reader_count)
            }
            Operator::ScatterPartitions(op) => {
                let input = self.single_input(tasks, &input_shard_locations, prev, is_first)?;
                let outputs = self.fan_out(tasks, &output_shard_locations)?;
                tasks.spawn(operator::scatter_partitions(input, outputs, op.indexes));
                Ok(self.closed_pipe(is_last))
            }
            Operator::RoundRobin(_) => {
                let input = self.single_input(tasks, &input_shard_locations, prev, is_first)?;
                let outputs = self.fan_out(tasks, &output_shard_locations)?;
                tasks.spawn(operator::round_robin(input, outputs));
                Ok(self.closed_pipe(is_last))
            }
            Operator::Broadcast(_) => {
                let input = self.single_input(tasks, &input_shard_locations, prev, is_first)?;
                let outputs = self.fan_out(tasks, &output_shard_locations)?;
                tasks.spawn(operator::broadcast(input, outputs));
                Ok(self.closed_pipe(is_last))
            }
        }
    }

    fn new_pipe(&self) -> (PipeWriter, PipeReader) {
        pipe(self.options.pipe_buffer)
    }

    /// A fan-out operator does not feed the pipeline's next pipe; any
    /// intra-process successor observes an immediately closed stream.
    fn closed_pipe(&self, is_last: bool) -> Option<PipeReader> {
        if is_last {
            None
        } else {
            let (_, reader) = self.new_pipe();
            Some(reader)
        }
    }

    fn single_input(
        &self,
        tasks: &mut JoinSet<ExecutionResult<()>>,
        inputs: &[DataLocation],
        prev: Option<PipeReader>,
        is_first: bool,
    ) -> ExecutionResult<PipeReader> {
        if !is_first {
            return prev.ok_or_else(|| {
                ExecutionError::InternalError(
                    "an intermediate operator has no preceding pipe".to_string(),
                )
            });
        }
        // The first operator reads from the network; a missing input
        // location means the task is a pure source.
        match inputs.first() {
            Some(location) => self.spawn_net_reader(tasks, location),
            None => {
                let (_, reader) = self.new_pipe();
                Ok(reader)
            }
        }
    }

    fn two_inputs(
        &self,
        tasks: &mut JoinSet<ExecutionResult<()>>,
        name: &str,
        inputs: &[DataLocation],
    ) -> ExecutionResult<(PipeReader, PipeReader)> {
        let [left, right] = inputs else {
            return Err(ExecutionError::InvalidArgument(format!(
                "{name} requires exactly two input shard locations"
            )));
        };
        Ok((
            self.spawn_net_reader(tasks, left)?,
            self.spawn_net_reader(tasks, right)?,
        ))
    }

    fn fan_in(
        &self,
        tasks: &mut JoinSet<ExecutionResult<()>>,
        inputs: &[DataLocation],
    ) -> ExecutionResult<Vec<PipeReader>> {
        inputs
            .iter()
            .map(|location| self.spawn_net_reader(tasks, location))
            .collect()
    }

    fn fan_out(
        &self,
        tasks: &mut JoinSet<ExecutionResult<()>>,
        outputs: &[DataLocation],
    ) -> ExecutionResult<Vec<PipeWriter>> {
        outputs
            .iter()
            .map(|location| self.spawn_net_writer(tasks, location, 1))
            .collect()
    }

    fn single_output(
        &self,
        tasks: &mut JoinSet<ExecutionResult<()>>,
        outputs: &[DataLocation],
        out_rx: PipeReader,
        is_last: bool,
        reader_count: u32,
    ) -> ExecutionResult<Option<PipeReader>> {
        if !is_last {
            return Ok(Some(out_rx));
        }
        let location = outputs.first().ok_or_else(|| {
            ExecutionError::InvalidArgument(
                "the terminal operator has no output shard location".to_string(),
            )
        })?;
        let writer = location.location.clone().ok_or_else(|| {
            ExecutionError::InvalidArgument(format!(
                "output shard {} has no registered location",
                location.name
            ))
        })?;
        tasks.spawn(dial_write_channel(
            writer,
            location.name.clone(),
            out_rx,
            reader_count,
            location.on_disk,
            self.options.enable_tls,
            self.options.dial_retry.clone(),
        ));
        Ok(None)
    }

    fn spawn_net_reader(
        &self,
        tasks: &mut JoinSet<ExecutionResult<()>>,
        location: &DataLocation,
    ) -> ExecutionResult<PipeReader> {
        let peer = location.location.clone().ok_or_else(|| {
            ExecutionError::InvalidArgument(format!(
                "input shard {} has no registered location",
                location.name
            ))
        })?;
        let (tx, rx) = self.new_pipe();
        tasks.spawn(dial_read_channel(
            peer,
            location.name.clone(),
            tx,
            self.options.enable_tls,
            self.options.dial_retry.clone(),
        ));
        Ok(rx)
    }

    fn spawn_net_writer(
        &self,
        tasks: &mut JoinSet<ExecutionResult<()>>,
        location: &DataLocation,
        reader_count: u32,
    ) -> ExecutionResult<PipeWriter> {
        let peer = location.location.clone().ok_or_else(|| {
            ExecutionError::InvalidArgument(format!(
                "output shard {} has no registered location",
                location.name
            ))
        })?;
        let (tx, rx) = self.new_pipe();
        tasks.spawn(dial_write_channel(
            peer,
            location.name.clone(),
            rx,
            reader_count,
            location.on_disk,
            self.options.enable_tls,
            self.options.dial_retry.clone(),
        ));
        Ok(tx)
    }
}
