#[allow(clippy::all)]
pub mod rpc {
    tonic::include_proto!("sluice.plan");
}

pub use rpc::instruction::Operator;
pub use rpc::{DataLocation, Instruction, InstructionSet, Location, Order, OrderBy, Row, Value};

impl Location {
    pub fn url(&self, enable_tls: bool) -> String {
        let scheme = if enable_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

impl DataLocation {
    /// Whether the shard has been registered at a concrete endpoint.
    pub fn is_registered(&self) -> bool {
        self.location.is_some()
    }
}

impl Operator {
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Script(_) => "Script",
            Operator::LocalSort(_) => "LocalSort",
            Operator::PipeAsArgs(_) => "PipeAsArgs",
            Operator::MergeSortedTo(_) => "MergeSortedTo",
            Operator::ScatterPartitions(_) => "ScatterPartitions",
            Operator::RoundRobin(_) => "RoundRobin",
            Operator::CollectPartitions(_) => "CollectPartitions",
            Operator::InputSplitReader(_) => "InputSplitReader",
            Operator::JoinPartitionedSorted(_) => "JoinPartitionedSorted",
            Operator::CoGroupPartitionedSorted(_) => "CoGroupPartitionedSorted",
            Operator::LocalTop(_) => "LocalTop",
            Operator::Broadcast(_) => "Broadcast",
            Operator::LocalHashAndJoinWith(_) => "LocalHashAndJoinWith",
        }
    }
}
