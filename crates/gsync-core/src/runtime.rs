//! Tokio wiring for the dispatchers
//!
//! Each side owns its dispatcher behind a mutex: a receive task feeds it
//! reassembled messages from the transport, and a [`PeriodicTask`] handles
//! the timer-driven traffic (head announcements on the server, gap retries
//! on clients). Client outcomes are surfaced on an event channel.

use crate::dispatch::{ClientDispatcher, Outbound, ServerDispatcher, ServerStats, Step, SyncEvent};
use crate::error::Result;
use crate::periodic::PeriodicTask;
use crate::scene::Scene;
use crate::transport::{Envelope, Transport};
use crate::wire::{Message, Reassembler, WireCodec};
use gsync_action::{Action, ActionId, ClientId};
use gsync_history::{ActionRecord, RecordId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Codec and transport bound to one local endpoint
struct Link {
    local: ClientId,
    codec: WireCodec,
    transport: Arc<dyn Transport>,
}

impl Link {
    fn send(&self, to: ClientId, message: &Message) -> Result<()> {
        for frame in self.codec.frames(message)? {
            self.transport.unicast(self.local, to, frame)?;
        }
        Ok(())
    }

    fn deliver(&self, outbound: &Outbound) {
        let frames = match self.codec.frames(outbound.message()) {
            Ok(frames) => frames,
            Err(err) => {
                tracing::error!(message = outbound.message().name(), error = %err, "encode failed");
                return;
            }
        };
        let to = match outbound {
            Outbound::Unicast { to, .. } => std::slice::from_ref(to),
            Outbound::Broadcast { to, .. } => to.as_slice(),
        };
        for frame in &frames {
            // Per-peer failures are logged by the transport
            if self.transport.broadcast(self.local, to, frame).is_err() {
                tracing::debug!(message = outbound.message().name(), "partial delivery");
            }
        }
    }
}

/// Per-peer fragment reassembly and decoding
#[derive(Default)]
struct Inbound {
    peers: HashMap<ClientId, Reassembler>,
}

impl Inbound {
    fn accept(&mut self, codec: &WireCodec, envelope: &Envelope) -> Option<Message> {
        let text = match self
            .peers
            .entry(envelope.from)
            .or_default()
            .push(&envelope.frame)
        {
            Ok(Some(text)) => text,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(from = %envelope.from, error = %err, "bad frame dropped");
                return None;
            }
        };
        match codec.decode(&text) {
            Ok(message) => Some(message),
            Err(err) => {
                tracing::warn!(from = %envelope.from, error = %err, "undecodable message dropped");
                None
            }
        }
    }
}

/// Server dispatcher running on the tokio runtime
pub struct ServerRuntime {
    dispatcher: Arc<Mutex<ServerDispatcher>>,
    receiver: JoinHandle<()>,
    heartbeat: PeriodicTask,
}

impl ServerRuntime {
    /// Start serving `inbox`
    ///
    /// # Panics
    /// If called outside a tokio runtime
    pub fn spawn(
        dispatcher: ServerDispatcher,
        codec: WireCodec,
        transport: Arc<dyn Transport>,
        mut inbox: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        let head_interval = dispatcher.config().head_interval();
        let link = Arc::new(Link {
            local: dispatcher.config().server_id,
            codec,
            transport,
        });
        let dispatcher = Arc::new(Mutex::new(dispatcher));

        let receiver = {
            let dispatcher = Arc::clone(&dispatcher);
            let link = Arc::clone(&link);
            tokio::spawn(async move {
                let mut inbound = Inbound::default();
                while let Some(envelope) = inbox.recv().await {
                    let Some(message) = inbound.accept(&link.codec, &envelope) else {
                        continue;
                    };
                    let mut server = dispatcher.lock();
                    for outbound in server.handle(envelope.from, message) {
                        link.deliver(&outbound);
                    }
                }
                tracing::info!("server inbox closed");
            })
        };

        let heartbeat = {
            let dispatcher = Arc::clone(&dispatcher);
            PeriodicTask::spawn("head-announce", head_interval, move || {
                let server = dispatcher.lock();
                if let Some(outbound) = server.head_announcement() {
                    link.deliver(&outbound);
                }
            })
        };

        tracing::info!("server runtime started");
        Self {
            dispatcher,
            receiver,
            heartbeat,
        }
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> ServerStats {
        self.dispatcher.lock().stats()
    }

    /// Read server state under the lock
    pub fn inspect<R>(&self, f: impl FnOnce(&ServerDispatcher) -> R) -> R {
        f(&self.dispatcher.lock())
    }

    /// Forget a disconnected client
    pub fn disconnect(&self, client: ClientId) {
        self.dispatcher.lock().disconnect(client);
    }

    /// Stop both tasks
    pub fn shutdown(self) {
        self.receiver.abort();
        self.heartbeat.stop();
        tracing::info!("server runtime stopped");
    }
}

impl std::fmt::Debug for ServerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRuntime")
            .field("heartbeat", &self.heartbeat)
            .finish_non_exhaustive()
    }
}

/// Dispatcher state plus the outward half of the client runtime
struct ClientShared<S: Scene + Clone> {
    dispatcher: Mutex<ClientDispatcher<S>>,
    link: Link,
    server: ClientId,
    events: mpsc::UnboundedSender<SyncEvent>,
}

impl<S: Scene + Clone> ClientShared<S> {
    /// Send a step's messages, then publish its events
    ///
    /// Called with the dispatcher locked so outbound order matches the order
    /// the dispatcher produced it.
    fn publish(&self, step: Step) {
        for message in &step.outbound {
            if let Err(err) = self.link.send(self.server, message) {
                tracing::warn!(client = %self.link.local, message = message.name(), error = %err, "send failed");
            }
        }
        for event in step.events {
            // Receiver gone means nobody is listening
            if self.events.send(event).is_err() {
                break;
            }
        }
    }

    fn send(&self, message: &Message) -> Result<()> {
        self.link.send(self.server, message)
    }
}

/// Client dispatcher running on the tokio runtime
pub struct ClientRuntime<S: Scene + Clone + 'static> {
    shared: Arc<ClientShared<S>>,
    events: mpsc::UnboundedReceiver<SyncEvent>,
    receiver: JoinHandle<()>,
    gap_retry: PeriodicTask,
}

impl<S: Scene + Clone + 'static> ClientRuntime<S> {
    /// Send `Join` and start the receive loop and gap retries
    ///
    /// # Errors
    /// `SyncError::Codec` or `SyncError::Transport` if the join cannot be sent
    ///
    /// # Panics
    /// If called outside a tokio runtime
    pub fn start(
        mut dispatcher: ClientDispatcher<S>,
        codec: WireCodec,
        transport: Arc<dyn Transport>,
        mut inbox: mpsc::UnboundedReceiver<Envelope>,
    ) -> Result<Self> {
        let retry_interval = dispatcher.config().gap_retry_interval();
        let server = dispatcher.config().server_id;
        let link = Link {
            local: dispatcher.id(),
            codec,
            transport,
        };
        let join = dispatcher.join();
        link.send(server, &join)?;

        let (events_tx, events) = mpsc::unbounded_channel();
        let shared = Arc::new(ClientShared {
            dispatcher: Mutex::new(dispatcher),
            link,
            server,
            events: events_tx,
        });

        let receiver = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let mut inbound = Inbound::default();
                while let Some(envelope) = inbox.recv().await {
                    if envelope.from != shared.server {
                        tracing::warn!(from = %envelope.from, "frame from non-server peer dropped");
                        continue;
                    }
                    let Some(message) = inbound.accept(&shared.link.codec, &envelope) else {
                        continue;
                    };
                    let mut dispatcher = shared.dispatcher.lock();
                    let step = dispatcher.receive(message);
                    shared.publish(step);
                }
                tracing::info!(client = %shared.link.local, "client inbox closed");
            })
        };

        let gap_retry = {
            let shared = Arc::clone(&shared);
            PeriodicTask::spawn("gap-retry", retry_interval, move || {
                let dispatcher = shared.dispatcher.lock();
                if let Some(request) = dispatcher.gap_request() {
                    tracing::debug!(client = %dispatcher.id(), "retrying gap request");
                    if let Err(err) = shared.send(&request) {
                        tracing::warn!(client = %dispatcher.id(), error = %err, "gap retry failed");
                    }
                }
            })
        };

        Ok(Self {
            shared,
            events,
            receiver,
            gap_retry,
        })
    }

    /// This client's id
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.shared.link.local
    }

    /// Apply `action` locally and send it; never waits for the server
    ///
    /// # Errors
    /// See [`ClientDispatcher::submit`]
    pub fn submit(&self, action: Action) -> Result<ActionId> {
        let id = action.id();
        let mut dispatcher = self.shared.dispatcher.lock();
        let step = dispatcher.submit(action)?;
        self.shared.publish(step);
        Ok(id)
    }

    /// Record `action` as done by this client in the replicated ledger
    ///
    /// # Errors
    /// See [`ClientDispatcher::push_record`]
    pub fn record_done(&self, action: &Action) -> Result<RecordId> {
        let record = ActionRecord::done(action.id(), self.id(), [action.target().clone()]);
        let record_id = record.record_id;
        let mut dispatcher = self.shared.dispatcher.lock();
        let message = dispatcher.push_record(record)?;
        self.shared.send(&message)?;
        Ok(record_id)
    }

    /// Remove a ledger record everywhere
    ///
    /// # Errors
    /// See [`ClientDispatcher::delete_record`]
    pub fn delete_record(&self, record_id: RecordId) -> Result<()> {
        let mut dispatcher = self.shared.dispatcher.lock();
        let message = dispatcher.delete_record(record_id)?;
        self.shared.send(&message)
    }

    /// Replace the ledger entry equal to `old`; `false` if none matched
    ///
    /// # Errors
    /// `SyncError::Codec` or `SyncError::Transport` if the op cannot be sent
    pub fn replace_record(&self, old: &ActionRecord, new: ActionRecord) -> Result<bool> {
        let mut dispatcher = self.shared.dispatcher.lock();
        match dispatcher.replace_record(old, new) {
            Some(message) => self.shared.send(&message).map(|()| true),
            None => Ok(false),
        }
    }

    /// Drop this client's redo entries everywhere; returns how many
    ///
    /// # Errors
    /// `SyncError::Codec` or `SyncError::Transport` if an op cannot be sent
    pub fn clear_redos(&self) -> Result<usize> {
        let mut dispatcher = self.shared.dispatcher.lock();
        let messages = dispatcher.clear_redos();
        for message in &messages {
            self.shared.send(message)?;
        }
        Ok(messages.len())
    }

    /// Discard local state and rejoin
    ///
    /// # Errors
    /// `SyncError::Codec` or `SyncError::Transport` if the join cannot be sent
    pub fn resync(&self) -> Result<()> {
        let mut dispatcher = self.shared.dispatcher.lock();
        let join = dispatcher.resync();
        self.shared.send(&join)
    }

    /// Wait for the next protocol event
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        self.events.recv().await
    }

    /// Next protocol event if one is queued
    pub fn try_next_event(&mut self) -> Option<SyncEvent> {
        self.events.try_recv().ok()
    }

    /// Read client state under the lock
    pub fn inspect<R>(&self, f: impl FnOnce(&ClientDispatcher<S>) -> R) -> R {
        f(&self.shared.dispatcher.lock())
    }

    /// Stop both tasks
    pub fn shutdown(self) {
        self.receiver.abort();
        self.gap_retry.stop();
    }
}

impl<S: Scene + Clone + 'static> std::fmt::Debug for ClientRuntime<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRuntime")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}
