//! The FIFO queue abstraction shared by the multiplexer and the dispatcher runner.
//!
//! A sentinel value travels on the same queues as data in the system this crate
//! is modeled on. Here it is instead a tagged variant of the payload, [`Slot`],
//! so it can never collide with a legitimate item.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// An item flowing through a queue, or the terminal end-of-stream marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot<T> {
    Item(T),
    End,
}

impl<T> Slot<T> {
    pub fn is_end(&self) -> bool {
        matches!(self, Slot::End)
    }

    pub fn into_item(self) -> Option<T> {
        match self {
            Slot::Item(item) => Some(item),
            Slot::End => None,
        }
    }
}

/// Result of a non-blocking read: distinguishes "nothing ready yet" from a
/// ready [`Slot`] (which may itself be the terminal sentinel).
pub enum TryTake<T> {
    Item(Slot<T>),
    Empty,
}

/// The queue protocol consumed by the multiplexer and dispatcher runner.
///
/// Implemented by this crate's own channel-backed queues, and implementable by
/// callers who want to plug in an externally constructed queue (the
/// multiplexer's `input_queue`/`output_queue` registration accepts anything
/// behind this trait, not just its own constructors).
#[async_trait]
pub trait QueueLike<T>: Send + Sync {
    /// Blocking put: suspends the caller while the queue is full.
    async fn put(&self, item: Slot<T>);
    /// Blocking take: suspends the caller while the queue is empty.
    async fn take(&self) -> Slot<T>;
    /// Non-blocking take.
    fn try_take(&self) -> TryTake<T>;
}

/// A shared handle to a queue, the type callers pass around.
pub type Queue<T> = Arc<dyn QueueLike<T>>;

enum Sender<T> {
    Bounded(mpsc::Sender<Slot<T>>),
    Unbounded(mpsc::UnboundedSender<Slot<T>>),
}

enum Receiver<T> {
    Bounded(mpsc::Receiver<Slot<T>>),
    Unbounded(mpsc::UnboundedReceiver<Slot<T>>),
}

struct ChannelQueue<T> {
    sender: Sender<T>,
    receiver: AsyncMutex<Receiver<T>>,
}

#[async_trait]
impl<T: Send + 'static> QueueLike<T> for ChannelQueue<T> {
    async fn put(&self, item: Slot<T>) {
        // A dropped receiver means no one is left to deliver to; that is not
        // this producer's problem to raise, the multiplexer/dispatcher treats
        // a closed downstream the same as the end of its own interest.
        match &self.sender {
            Sender::Bounded(sender) => {
                let _ = sender.send(item).await;
            }
            Sender::Unbounded(sender) => {
                let _ = sender.send(item);
            }
        }
    }

    async fn take(&self) -> Slot<T> {
        let mut receiver = self.receiver.lock().await;
        let received = match &mut *receiver {
            Receiver::Bounded(receiver) => receiver.recv().await,
            Receiver::Unbounded(receiver) => receiver.recv().await,
        };
        received.unwrap_or(Slot::End)
    }

    fn try_take(&self) -> TryTake<T> {
        let mut receiver = match self.receiver.try_lock() {
            Ok(guard) => guard,
            // another task is mid-`take()`; from this caller's perspective that
            // is indistinguishable from "nothing ready yet".
            Err(_) => return TryTake::Empty,
        };
        let result = match &mut *receiver {
            Receiver::Bounded(receiver) => receiver.try_recv(),
            Receiver::Unbounded(receiver) => receiver.try_recv(),
        };
        match result {
            Ok(slot) => TryTake::Item(slot),
            Err(mpsc::error::TryRecvError::Empty) => TryTake::Empty,
            Err(mpsc::error::TryRecvError::Disconnected) => TryTake::Item(Slot::End),
        }
    }
}

/// Construct a queue of the given capacity; 0 means unbounded, matching the
/// `maxsize_input` / `maxsize_output` option semantics.
pub fn channel_queue<T: Send + 'static>(capacity: usize) -> Queue<T> {
    if capacity == 0 {
        unbounded_queue()
    } else {
        let (sender, receiver) = mpsc::channel(capacity);
        Arc::new(ChannelQueue {
            sender: Sender::Bounded(sender),
            receiver: AsyncMutex::new(Receiver::Bounded(receiver)),
        })
    }
}

/// Construct an unbounded queue explicitly.
pub fn unbounded_queue<T: Send + 'static>() -> Queue<T> {
    let (sender, receiver) = mpsc::unbounded_channel();
    Arc::new(ChannelQueue {
        sender: Sender::Unbounded(sender),
        receiver: AsyncMutex::new(Receiver::Unbounded(receiver)),
    })
}
