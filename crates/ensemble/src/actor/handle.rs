use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::actor::supervisor::{Directive, Supervisor};
use crate::actor::system::{ActorContext, Behavior};
use crate::actor::Message;
use crate::error::ClusterError;
use crate::types::ActorAddress;

/// Reference to an actor, local or remote.
#[async_trait]
pub trait ActorHandle: Send + Sync {
    /// Address the handle points at.
    fn address(&self) -> &ActorAddress;

    /// Send a message and wait for the reply.
    async fn ask(&self, message: Message) -> Result<Vec<u8>, ClusterError>;

    /// Send a message without waiting for it to be processed.
    async fn tell(&self, message: Message) -> Result<(), ClusterError>;

    /// Stop the actor after the message it is currently processing.
    ///
    /// Returns the number of queued messages that were never delivered.
    async fn stop(&self) -> Result<usize, ClusterError>;
}

/// Shared, type-erased actor handle.
pub type Handle = Arc<dyn ActorHandle>;

enum Envelope {
    Ask {
        message: Message,
        reply: oneshot::Sender<Result<Vec<u8>, ClusterError>>,
    },
    Tell {
        message: Message,
    },
}

/// Handle to an actor running in this process.
#[derive(Clone)]
pub struct LocalHandle {
    inner: Arc<LocalInner>,
}

struct LocalInner {
    id: u64,
    address: ActorAddress,
    tx: mpsc::UnboundedSender<Envelope>,
    stop: CancellationToken,
    task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<usize>>>,
}

impl LocalHandle {
    /// Start the mailbox task of a new actor.
    ///
    /// `on_exit` runs on the mailbox task once it has stopped.
    pub(crate) fn start<B: Behavior>(
        id: u64,
        ctx: ActorContext,
        supervisor: Arc<dyn Supervisor>,
        behavior: B,
        state: B::State,
        on_exit: impl FnOnce() + Send + 'static,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let address = ctx.address().clone();
        let task = tokio::spawn(run_mailbox(
            ctx,
            supervisor,
            behavior,
            state,
            rx,
            stop.clone(),
            on_exit,
        ));
        Self {
            inner: Arc::new(LocalInner {
                id,
                address,
                tx,
                stop,
                task: tokio::sync::Mutex::new(Some(task)),
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether the mailbox no longer accepts messages.
    pub fn is_stopped(&self) -> bool {
        self.inner.tx.is_closed()
    }

    /// Erase the concrete type.
    pub fn into_handle(self) -> Handle {
        Arc::new(self)
    }

    fn closed(&self) -> ClusterError {
        ClusterError::MailboxClosed {
            address: self.inner.address.clone(),
        }
    }
}

#[async_trait]
impl ActorHandle for LocalHandle {
    fn address(&self) -> &ActorAddress {
        &self.inner.address
    }

    async fn ask(&self, message: Message) -> Result<Vec<u8>, ClusterError> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .tx
            .send(Envelope::Ask { message, reply })
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())?
    }

    async fn tell(&self, message: Message) -> Result<(), ClusterError> {
        self.inner
            .tx
            .send(Envelope::Tell { message })
            .map_err(|_| self.closed())
    }

    async fn stop(&self) -> Result<usize, ClusterError> {
        self.inner.stop.cancel();
        let task = self.inner.task.lock().await.take();
        match task {
            Some(task) => task.await.map_err(|e| ClusterError::HandlerFailed {
                reason: format!("mailbox task for {} failed: {e}", self.inner.address),
            }),
            None => Ok(0),
        }
    }
}

async fn run_mailbox<B: Behavior>(
    ctx: ActorContext,
    supervisor: Arc<dyn Supervisor>,
    behavior: B,
    mut state: B::State,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    stop: CancellationToken,
    on_exit: impl FnOnce() + Send + 'static,
) -> usize {
    tracing::debug!(actor = %ctx.address(), "actor started");
    loop {
        let envelope = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            envelope = rx.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let directive = match envelope {
            Envelope::Ask { message, reply } => {
                let result = behavior.receive(&mut state, &ctx, message).await;
                let directive = match &result {
                    Ok(_) => Directive::Resume,
                    Err(e) => supervisor.on_failure(ctx.address(), e),
                };
                let _ = reply.send(result);
                directive
            }
            Envelope::Tell { message } => {
                match behavior.receive(&mut state, &ctx, message).await {
                    Ok(_) => Directive::Resume,
                    Err(e) => supervisor.on_failure(ctx.address(), &e),
                }
            }
        };
        if directive == Directive::Stop {
            break;
        }
    }

    rx.close();
    let mut undelivered = 0;
    while let Ok(envelope) = rx.try_recv() {
        undelivered += 1;
        if let Envelope::Ask { reply, .. } = envelope {
            let _ = reply.send(Err(ClusterError::MailboxClosed {
                address: ctx.address().clone(),
            }));
        }
    }
    tracing::debug!(actor = %ctx.address(), undelivered, "actor stopped");
    on_exit();
    undelivered
}
