use std::future::Future;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex, MutexGuard, OnceCell};
use tokio::task::JoinHandle;
use tonic::transport::Channel;

use crate::driver::rpc::driver_service_client::DriverServiceClient;
use crate::error::{ExecutionError, ExecutionResult};
use crate::plan::Location;
use crate::worker::rpc::shard_service_client::ShardServiceClient;
use crate::worker::rpc::worker_service_client::WorkerServiceClient;

/// Tracks the lifecycle of a gRPC server task along with its shutdown
/// signal, so an actor can own the server it serves from.
pub enum ServerMonitor {
    Stopped,
    Pending {
        handle: JoinHandle<ExecutionResult<()>>,
    },
    Running {
        /// The shutdown signal to send to the server.
        signal: oneshot::Sender<()>,
        /// The join handle of the server task.
        handle: JoinHandle<ExecutionResult<()>>,
        /// The local port that the server listens on.
        port: u16,
    },
}

impl Default for ServerMonitor {
    fn default() -> Self {
        Self::Stopped
    }
}

impl ServerMonitor {
    pub fn new() -> Self {
        Self::Stopped
    }

    pub async fn start(self, f: impl Future<Output = ExecutionResult<()>> + Send + 'static) -> Self {
        self.stop().await;
        Self::Pending {
            handle: tokio::spawn(f),
        }
    }

    pub fn ready(self, signal: oneshot::Sender<()>, port: u16) -> ExecutionResult<Self> {
        match self {
            Self::Pending { handle } => Ok(Self::Running {
                signal,
                handle,
                port,
            }),
            _ => Err(ExecutionError::InternalError(
                "the server must be in pending state before it can be ready".to_string(),
            )),
        }
    }

    pub async fn stop(self) {
        match self {
            Self::Stopped => {}
            Self::Pending { handle } => {
                handle.abort();
            }
            Self::Running { signal, handle, .. } => {
                let _ = signal.send(());
                let _ = handle.await;
            }
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Running { port, .. } => Some(*port),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub enable_tls: bool,
    pub host: String,
    pub port: u16,
}

impl ClientOptions {
    pub fn for_location(location: &Location, enable_tls: bool) -> Self {
        Self {
            enable_tls,
            host: location.host.clone(),
            port: location.port as u16,
        }
    }

    pub fn to_url_string(&self) -> String {
        let scheme = if self.enable_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

#[tonic::async_trait]
pub trait ClientBuilder: Sized {
    async fn connect(options: &ClientOptions) -> ExecutionResult<Self>;
}

macro_rules! impl_client_builder {
    ($client_type:ty) => {
        #[tonic::async_trait]
        impl ClientBuilder for $client_type {
            async fn connect(options: &ClientOptions) -> ExecutionResult<Self> {
                Ok(<$client_type>::connect(options.to_url_string()).await?)
            }
        }
    };
}

impl_client_builder!(DriverServiceClient<Channel>);
impl_client_builder!(WorkerServiceClient<Channel>);
impl_client_builder!(ShardServiceClient<Channel>);

/// A handle to a gRPC client that supports connection reuse.
/// The handle can be cheaply cloned and the underlying connection is shared.
#[derive(Debug, Clone)]
pub struct ClientHandle<T> {
    options: Arc<ClientOptions>,
    /// The shared client, lazily initialized. This must be
    /// `Arc<OnceCell<Mutex<T>>>` rather than `OnceCell<Arc<Mutex<T>>>`:
    /// cloning an uninitialized `OnceCell` would let each clone connect
    /// independently and open redundant connections to the server.
    inner: Arc<OnceCell<Mutex<T>>>,
}

impl<T: ClientBuilder> ClientHandle<T> {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options: Arc::new(options),
            inner: Arc::new(OnceCell::new()),
        }
    }

    async fn init(options: Arc<ClientOptions>) -> ExecutionResult<Mutex<T>> {
        let client = T::connect(&options).await?;
        Ok(Mutex::new(client))
    }

    async fn get(&self) -> ExecutionResult<&Mutex<T>> {
        let options = Arc::clone(&self.options);
        self.inner.get_or_try_init(|| Self::init(options)).await
    }

    pub async fn lock(&self) -> ExecutionResult<MutexGuard<'_, T>> {
        Ok(self.get().await?.lock().await)
    }
}
