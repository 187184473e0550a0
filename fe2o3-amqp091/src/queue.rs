//! Delivery queues

use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, Mutex};

use crate::{content::Message, error::CloseReason};

/// Items pushed by the engine into a delivery queue
#[derive(Debug)]
pub(crate) enum QueueItem {
    Message(Message),

    /// The consumer was cancelled or the channel closed; nothing follows
    Closed(Option<CloseReason>),
}

/// Error of [`DeliveryQueue::get`]
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GetError {
    /// No message arrived before the timeout
    #[error("No message arrived before the timeout")]
    Empty,

    /// The consumer was cancelled or the channel or connection closed
    #[error("Delivery queue is closed {0:?}")]
    Closed(Option<CloseReason>),
}

#[derive(Debug)]
struct Inner {
    rx: mpsc::UnboundedReceiver<QueueItem>,

    /// Set once the closing item was taken, so that later calls fail immediately
    closed: Option<Option<CloseReason>>,
}

impl Inner {
    fn on_item(&mut self, item: Option<QueueItem>) -> Result<Message, GetError> {
        match item {
            Some(QueueItem::Message(message)) => Ok(message),
            Some(QueueItem::Closed(reason)) => {
                self.closed = Some(reason.clone());
                Err(GetError::Closed(reason))
            }
            None => {
                let reason = self.closed.get_or_insert(None).clone();
                Err(GetError::Closed(reason))
            }
        }
    }
}

/// An ordered buffer of messages delivered to one consumer tag (or returned by the broker).
///
/// Created on first reference by either the application or a delivery; the engine never
/// drops a message on its way into the queue. Handles are cheap to clone and share the same
/// buffer.
#[derive(Debug, Clone)]
pub struct DeliveryQueue {
    inner: Arc<Mutex<Inner>>,
}

/// The engine's side of a [`DeliveryQueue`]
#[derive(Debug)]
pub(crate) struct QueueSender {
    tx: mpsc::UnboundedSender<QueueItem>,
    queue: DeliveryQueue,
}

impl QueueSender {
    pub fn push(&self, message: Message) {
        // The receiver lives in `self.queue`, so this never fails
        let _ = self.tx.send(QueueItem::Message(message));
    }

    pub fn close(self, reason: Option<CloseReason>) {
        let _ = self.tx.send(QueueItem::Closed(reason));
    }

    pub fn queue(&self) -> DeliveryQueue {
        self.queue.clone()
    }
}

impl DeliveryQueue {
    pub(crate) fn channel() -> QueueSender {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = DeliveryQueue {
            inner: Arc::new(Mutex::new(Inner { rx, closed: None })),
        };
        QueueSender { tx, queue }
    }

    /// Waits for the next message. Fails only once the queue is closed and drained.
    pub async fn recv(&self) -> Result<Message, GetError> {
        let mut inner = self.inner.lock().await;
        if let Some(reason) = &inner.closed {
            return Err(GetError::Closed(reason.clone()));
        }
        let item = inner.rx.recv().await;
        inner.on_item(item)
    }

    /// Waits at most `timeout` for the next message, failing with [`GetError::Empty`]
    pub async fn get(&self, timeout: Duration) -> Result<Message, GetError> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(GetError::Empty),
        }
    }

    /// Takes the next message if one is already buffered
    pub fn try_get(&self) -> Result<Message, GetError> {
        let mut inner = match self.inner.try_lock() {
            Ok(inner) => inner,
            Err(_) => return Err(GetError::Empty),
        };
        if let Some(reason) = &inner.closed {
            return Err(GetError::Closed(reason.clone()));
        }
        match inner.rx.try_recv() {
            Ok(item) => inner.on_item(Some(item)),
            Err(mpsc::error::TryRecvError::Empty) => Err(GetError::Empty),
            Err(mpsc::error::TryRecvError::Disconnected) => inner.on_item(None),
        }
    }
}
