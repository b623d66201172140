mod core;
mod handler;

use crate::driver::options::SchedulerOptions;
use crate::rpc::ServerMonitor;

/// The scheduler: the single consumer of the driver event channel.
/// Each submitted task group is orchestrated by a forked task; the
/// event loop itself never blocks.
pub struct SchedulerActor {
    options: SchedulerOptions,
    server: ServerMonitor,
}
