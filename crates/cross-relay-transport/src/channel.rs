//! In-process boundary between a primary and its secondaries.
//!
//! Messages are JSON-encoded when posted and decoded on receipt, so the
//! two sides never share memory. Addresses handed to the primary hold
//! weak senders: the primary never keeps a secondary alive, and posting to
//! one that is gone fails with [`TransportError::Disconnected`].

use std::sync::Arc;

use cross_relay_core::{ContextHandle, InboundSink, Port, TransportError};
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};

/// One message crossing into the primary.
#[derive(Debug)]
struct Delivery {
    message: String,
    sender: Option<ContextHandle>,
}

fn encode(message: &Value) -> Result<String, TransportError> {
    Ok(serde_json::to_string(message)?)
}

fn deliver<S: InboundSink + ?Sized>(sink: &S, text: &str, sender: Option<ContextHandle>) {
    match serde_json::from_str::<Value>(text) {
        Ok(message) => sink.receive(message, sender),
        Err(e) => tracing::warn!("Undecodable boundary message: {e}"),
    }
}

/// Port over a weak channel sender.
pub struct WeakPort {
    tx: mpsc::WeakUnboundedSender<String>,
}

impl WeakPort {
    /// Create a port that does not keep the receiving side alive.
    #[must_use]
    pub fn new(tx: &mpsc::UnboundedSender<String>) -> Self {
        Self { tx: tx.downgrade() }
    }
}

impl Port for WeakPort {
    fn post(&self, message: Value) -> Result<(), TransportError> {
        let tx = self.tx.upgrade().ok_or(TransportError::Disconnected)?;
        tx.send(encode(&message)?)
            .map_err(|_| TransportError::Disconnected)
    }
}

/// Port from a secondary to the primary inbox.
///
/// Every post carries the secondary's own address, which the primary
/// keeps when the post is a handshake.
struct ParentPort {
    inbox: mpsc::UnboundedSender<Delivery>,
    reply_to: Option<ContextHandle>,
}

impl Port for ParentPort {
    fn post(&self, message: Value) -> Result<(), TransportError> {
        self.inbox
            .send(Delivery {
                message: encode(&message)?,
                sender: self.reply_to.clone(),
            })
            .map_err(|_| TransportError::Disconnected)
    }
}

/// Primary side of the in-process boundary.
pub struct PrimaryEndpoint {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Default for PrimaryEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl PrimaryEndpoint {
    /// Create a primary inbox with no secondaries.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// Create a new secondary context attached to this primary.
    #[must_use]
    pub fn connect(&self) -> SecondaryEndpoint {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ContextHandle::new(Arc::new(WeakPort::new(&tx)));
        let parent = Arc::new(ParentPort {
            inbox: self.tx.clone(),
            reply_to: Some(handle.clone()),
        });

        SecondaryEndpoint {
            parent,
            handle,
            tx,
            rx,
        }
    }

    /// Port for unrelated traffic sharing the primary's channel.
    ///
    /// Posts through it carry no sender handle.
    #[must_use]
    pub fn shared_port(&self) -> Arc<dyn Port> {
        Arc::new(ParentPort {
            inbox: self.tx.clone(),
            reply_to: None,
        })
    }

    /// Hand every queued message to `sink` without waiting.
    ///
    /// Returns the number of messages delivered.
    pub fn drain<S: InboundSink + ?Sized>(&mut self, sink: &S) -> usize {
        let mut count = 0;
        while let Ok(delivery) = self.rx.try_recv() {
            deliver(sink, &delivery.message, delivery.sender);
            count += 1;
        }
        count
    }

    /// Wait for the next message and hand it to `sink`.
    ///
    /// Returns `false` once no sender remains.
    pub async fn recv_into<S: InboundSink + ?Sized>(&mut self, sink: &S) -> bool {
        match self.rx.recv().await {
            Some(delivery) => {
                deliver(sink, &delivery.message, delivery.sender);
                true
            }
            None => false,
        }
    }

    /// Feed messages into `sink` until every secondary is gone.
    pub fn spawn_pump<S>(self, sink: Arc<S>) -> JoinHandle<()>
    where
        S: InboundSink + ?Sized + 'static,
    {
        let Self { tx, mut rx } = self;
        drop(tx);
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                deliver(sink.as_ref(), &delivery.message, delivery.sender);
            }
            tracing::debug!("Primary pump stopped, no secondaries left");
        })
    }
}

/// Secondary side of the in-process boundary.
///
/// The context lives as long as this endpoint (or its pump task); once
/// it is dropped, the primary's handle for it stops working.
pub struct SecondaryEndpoint {
    parent: Arc<ParentPort>,
    handle: ContextHandle,
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl SecondaryEndpoint {
    /// Port to the primary, for building a secondary relay.
    #[must_use]
    pub fn parent(&self) -> Arc<dyn Port> {
        self.parent.clone()
    }

    /// This context's own address as the primary will see it.
    #[must_use]
    pub const fn handle(&self) -> &ContextHandle {
        &self.handle
    }

    /// Hand every queued message to `sink` without waiting.
    pub fn drain<S: InboundSink + ?Sized>(&mut self, sink: &S) -> usize {
        let mut count = 0;
        while let Ok(text) = self.rx.try_recv() {
            deliver(sink, &text, None);
            count += 1;
        }
        count
    }

    /// Feed messages into `sink` until the task is aborted.
    pub fn spawn_pump<S>(self, sink: Arc<S>) -> JoinHandle<()>
    where
        S: InboundSink + ?Sized + 'static,
    {
        let Self { tx, mut rx, .. } = self;
        tokio::spawn(async move {
            // Keeps the context addressable while the pump runs.
            let _alive = tx;
            while let Some(text) = rx.recv().await {
                deliver(sink.as_ref(), &text, None);
            }
        })
    }
}
