//! Client request dispatcher
//!
//! One actor owns both halves of the agent's connection. Callers submit a message
//! through a [`DispatcherHandle`] and wait on a private oneshot channel; the actor
//! assigns the request id, writes the frame, and routes each incoming frame by id.
//! Frames without an id are server pushes: `Command` texts go to the push channel.
//!
//! A caller that gives up (timeout) just drops its receiver. A late reply for its id
//! finds no live slot and is discarded, so correlation of later requests is unaffected.

use std::collections::HashMap;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{constants, ChannelError, Result};
use crate::protocol::message::{Envelope, Message};

/// Depth of the submission queue
const REQUEST_QUEUE: usize = 64;

struct Request {
    message: Message,
    reply: oneshot::Sender<Result<Message>>,
}

/// Cheap, cloneable submission side of a dispatcher
#[derive(Clone)]
pub struct DispatcherHandle {
    requests: mpsc::Sender<Request>,
}

impl std::fmt::Debug for DispatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherHandle")
            .field("closed", &self.requests.is_closed())
            .finish()
    }
}

impl DispatcherHandle {
    /// Send `message` and wait at most `timeout` for the reply carrying its id
    pub async fn request(&self, message: Message, timeout: Duration) -> Result<Message> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request { message, reply })
            .await
            .map_err(|_| ChannelError::Transport(constants::ERR_DISPATCHER_STOPPED.into()))?;

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::ConnectionClosed),
            Err(_) => Err(ChannelError::Timeout),
        }
    }

    /// Whether the actor behind this handle has stopped
    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }
}

/// The actor
pub struct RequestDispatcher<R, W> {
    reader: R,
    writer: W,
    requests: mpsc::Receiver<Request>,
    pending: HashMap<u64, oneshot::Sender<Result<Message>>>,
    pushes: mpsc::Sender<String>,
    next_id: u64,
    cancel: CancellationToken,
}

impl<R, W> RequestDispatcher<R, W>
where
    R: Stream<Item = Result<Vec<u8>>> + Unpin + Send + 'static,
    W: Sink<Vec<u8>, Error = ChannelError> + Unpin + Send + 'static,
{
    /// Start the actor over an authenticated connection.
    ///
    /// The returned task ends with the reason the connection stopped; every
    /// outstanding caller is then woken with `ConnectionClosed`.
    pub fn spawn(
        reader: R,
        writer: W,
        pushes: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> (DispatcherHandle, JoinHandle<Result<()>>) {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        let actor = Self {
            reader,
            writer,
            requests: rx,
            pending: HashMap::new(),
            pushes,
            next_id: 1,
            cancel,
        };
        (DispatcherHandle { requests: tx }, tokio::spawn(actor.run()))
    }

    async fn run(mut self) -> Result<()> {
        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                request = self.requests.recv() => match request {
                    Some(request) => {
                        if let Err(e) = self.submit(request).await {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                },
                frame = self.reader.next() => match frame {
                    Some(Ok(bytes)) => {
                        if let Err(e) = self.route(&bytes).await {
                            break Err(e);
                        }
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Err(ChannelError::ConnectionClosed),
                },
            }
        };

        for (_, waiter) in self.pending.drain() {
            let _ = waiter.send(Err(ChannelError::ConnectionClosed));
        }
        self.writer.close().await.ok();
        result
    }

    async fn submit(&mut self, request: Request) -> Result<()> {
        let Request { message, reply } = request;
        if reply.is_closed() {
            return Ok(());
        }

        let id = self.next_id;
        self.next_id += 1;
        self.pending.retain(|_, waiter| !waiter.is_closed());

        let bytes = match Envelope::with_id(id, message).to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = reply.send(Err(e));
                return Ok(());
            }
        };
        self.pending.insert(id, reply);
        trace!(id, "Request sent");
        self.writer.send(bytes).await
    }

    async fn route(&mut self, bytes: &[u8]) -> Result<()> {
        let envelope = Envelope::from_bytes(bytes)
            .map_err(|e| ChannelError::Protocol(format!("Malformed message: {e}")))?;

        match envelope.id {
            Some(id) => match self.pending.remove(&id) {
                Some(waiter) => {
                    if waiter.send(Ok(envelope.message)).is_err() {
                        debug!(id, "Reply arrived after caller gave up");
                    }
                }
                None => debug!(id, "Discarding reply with no waiting caller"),
            },
            None => match envelope.message {
                Message::Command { text } => {
                    if self.pushes.send(text).await.is_err() {
                        warn!("Command receiver dropped, discarding push");
                    }
                }
                other => warn!(kind = other.kind(), "Unexpected unsolicited message"),
            },
        }
        Ok(())
    }
}
