use std::sync::Arc;

use tokio::sync::oneshot;

use crate::flow::FlowContext;
use crate::id::TaskGroupId;

pub enum SchedulerEvent {
    ServerReady {
        /// The local port that the driver server listens on.
        port: u16,
        signal: oneshot::Sender<()>,
    },
    /// A worker advertises itself as compute supply.
    RegisterWorker { host: String, port: u16 },
    /// Place and execute one task group. The sender is signalled exactly
    /// once, when the group has reached a terminal state.
    SubmitTaskGroup {
        flow: Arc<FlowContext>,
        task_group: TaskGroupId,
        bid: f64,
        done: oneshot::Sender<()>,
    },
    /// A status observation; it has no side effects in the scheduler.
    TaskGroupStatus {
        flow: Arc<FlowContext>,
        task_group: TaskGroupId,
        completed: bool,
        error: Option<String>,
    },
    /// Purge the output shards of the given groups from their hosts.
    ReleaseTaskGroupInputs {
        flow: Arc<FlowContext>,
        task_groups: Vec<TaskGroupId>,
        done: oneshot::Sender<()>,
    },
    #[allow(dead_code)]
    Shutdown,
}
