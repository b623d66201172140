use std::fmt;
use std::time::Duration;

use log::error;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinSet};

const ACTOR_CHANNEL_SIZE: usize = 8;

/// A message-driven state machine with a single-threaded event loop.
/// Messages are processed sequentially, so [`Actor::receive`] must not block;
/// long-running work is forked via [`ActorContext::spawn`] and reports back
/// by sending the actor another message.
#[tonic::async_trait]
pub trait Actor: Sized + Send + 'static {
    type Message: Send + 'static;
    type Options: Send;

    fn name() -> &'static str;
    fn new(options: Self::Options) -> Self;
    async fn start(&mut self, ctx: &mut ActorContext<Self>);
    fn receive(&mut self, ctx: &mut ActorContext<Self>, message: Self::Message) -> ActorAction;
    async fn stop(self, ctx: &mut ActorContext<Self>);
}

pub enum ActorAction {
    Continue,
    Stop,
}

/// The error returned when a message cannot be delivered because
/// the actor has stopped.
#[derive(Debug)]
pub struct ActorSendError;

impl fmt::Display for ActorSendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "the actor has stopped and cannot receive messages")
    }
}

impl std::error::Error for ActorSendError {}

impl<T> From<mpsc::error::SendError<T>> for ActorSendError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        Self
    }
}

pub struct ActorContext<T: Actor> {
    handle: ActorHandle<T>,
    /// Tasks forked by the actor while processing messages.
    /// All remaining tasks are aborted when the actor stops.
    tasks: JoinSet<()>,
}

impl<T: Actor> ActorContext<T> {
    fn new(handle: &ActorHandle<T>) -> Self {
        Self {
            handle: handle.clone(),
            tasks: JoinSet::new(),
        }
    }

    pub fn handle(&self) -> &ActorHandle<T> {
        &self.handle
    }

    /// Fork a task and track it in the context.
    pub fn spawn(&mut self, task: impl std::future::Future<Output = ()> + Send + 'static) -> AbortHandle {
        self.tasks.spawn(task)
    }

    /// Send a message to the actor itself without suspending the event loop.
    pub fn send(&mut self, message: T::Message) {
        let handle = self.handle.clone();
        self.spawn(async move {
            if handle.send(message).await.is_err() {
                error!("failed to send message to the {} actor", T::name());
            }
        });
    }

    /// Send a message to the actor itself after a delay.
    pub fn send_with_delay(&mut self, message: T::Message, delay: Duration) {
        let handle = self.handle.clone();
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            if handle.send(message).await.is_err() {
                error!("failed to send delayed message to the {} actor", T::name());
            }
        });
    }

    /// Join tasks that have completed so the set does not grow unbounded.
    /// Tasks report failures by messaging the actor; panics are logged here.
    fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!("task forked by the {} actor failed: {e}", T::name());
                }
            }
        }
    }
}

pub struct ActorHandle<T: Actor> {
    sender: mpsc::Sender<T::Message>,
    stopped: watch::Receiver<bool>,
}

impl<T: Actor> Clone for ActorHandle<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

impl<T: Actor> ActorHandle<T> {
    pub async fn send(&self, message: T::Message) -> Result<(), ActorSendError> {
        Ok(self.sender.send(message).await?)
    }

    pub async fn wait_for_stop(mut self) {
        // The receiver error is ignored since the sender must have been
        // dropped in that case, which means the actor has stopped.
        let _ = self.stopped.wait_for(|x| *x).await;
    }
}

/// Owns the event loop tasks of one or more actors so the process
/// can wait for all of them to wind down.
pub struct ActorSystem {
    tasks: JoinSet<()>,
}

impl Default for ActorSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl ActorSystem {
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
        }
    }

    pub fn spawn<T: Actor>(&mut self, options: T::Options) -> ActorHandle<T> {
        let (tx, rx) = mpsc::channel(ACTOR_CHANNEL_SIZE);
        let (stopped_tx, stopped_rx) = watch::channel(false);
        let handle = ActorHandle {
            sender: tx,
            stopped: stopped_rx,
        };
        let runner = ActorRunner {
            actor: T::new(options),
            ctx: ActorContext::new(&handle),
            receiver: rx,
            stopped: stopped_tx,
        };
        self.tasks.spawn(runner.run());
        handle
    }

    pub async fn join(&mut self) {
        while self.tasks.join_next().await.is_some() {}
    }
}

struct ActorRunner<T: Actor> {
    actor: T,
    ctx: ActorContext<T>,
    receiver: mpsc::Receiver<T::Message>,
    stopped: watch::Sender<bool>,
}

impl<T: Actor> ActorRunner<T> {
    async fn run(mut self) {
        self.actor.start(&mut self.ctx).await;
        while let Some(message) = self.receiver.recv().await {
            match self.actor.receive(&mut self.ctx, message) {
                ActorAction::Continue => {}
                ActorAction::Stop => break,
            }
            self.ctx.reap();
        }
        self.receiver.close();
        self.actor.stop(&mut self.ctx).await;
        self.ctx.tasks.abort_all();
        let _ = self.stopped.send(true);
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;

    struct EchoActor;

    enum EchoMessage {
        Echo {
            value: String,
            reply: oneshot::Sender<String>,
        },
        Stop,
    }

    #[tonic::async_trait]
    impl Actor for EchoActor {
        type Message = EchoMessage;
        type Options = ();

        fn name() -> &'static str {
            "EchoActor"
        }

        fn new(_options: Self::Options) -> Self {
            Self
        }

        async fn start(&mut self, _ctx: &mut ActorContext<Self>) {}

        fn receive(&mut self, _ctx: &mut ActorContext<Self>, message: Self::Message) -> ActorAction {
            match message {
                EchoMessage::Echo { value, reply } => {
                    let _ = reply.send(value.to_uppercase());
                    ActorAction::Continue
                }
                EchoMessage::Stop => ActorAction::Stop,
            }
        }

        async fn stop(self, _ctx: &mut ActorContext<Self>) {}
    }

    #[tokio::test]
    async fn test_actor_send() {
        let mut system = ActorSystem::new();
        let handle = system.spawn::<EchoActor>(());
        let (tx, rx) = oneshot::channel();
        handle
            .send(EchoMessage::Echo {
                value: "hello".to_string(),
                reply: tx,
            })
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap(), "HELLO");
    }

    #[tokio::test]
    async fn test_actor_stop() {
        let mut system = ActorSystem::new();
        let handle = system.spawn::<EchoActor>(());
        handle.send(EchoMessage::Stop).await.unwrap();
        handle.clone().wait_for_stop().await;
        assert!(handle.send(EchoMessage::Stop).await.is_err());
        system.join().await;
    }
}
