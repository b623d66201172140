use log::debug;
use sluice_server::actor::ActorHandle;
use tonic::{Request, Response, Status};

use crate::driver::actor::SchedulerActor;
use crate::driver::event::SchedulerEvent;
use crate::driver::rpc::driver_service_server::DriverService;
use crate::driver::rpc::{RegisterWorkerRequest, RegisterWorkerResponse};
use crate::error::ExecutionError;

pub struct DriverServer {
    handle: ActorHandle<SchedulerActor>,
}

impl DriverServer {
    pub fn new(handle: ActorHandle<SchedulerActor>) -> Self {
        Self { handle }
    }
}

#[tonic::async_trait]
impl DriverService for DriverServer {
    async fn register_worker(
        &self,
        request: Request<RegisterWorkerRequest>,
    ) -> Result<Response<RegisterWorkerResponse>, Status> {
        let request = request.into_inner();
        debug!("{request:?}");
        let RegisterWorkerRequest { host, port } = request;
        let port = u16::try_from(port).map_err(|_| {
            Status::invalid_argument("port must be a valid 16-bit unsigned integer")
        })?;
        self.handle
            .send(SchedulerEvent::RegisterWorker { host, port })
            .await
            .map_err(ExecutionError::from)?;
        Ok(Response::new(RegisterWorkerResponse {}))
    }
}
