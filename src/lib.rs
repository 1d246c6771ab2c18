//! Queue multiplexers (round-robin and sorted k-way merge) and a
//! condition-indexed event dispatcher.

pub mod condition;
pub mod dispatch;
pub mod error;
pub mod mux;
pub mod queue;

pub mod prelude {
    pub use crate::condition::{Condition, ConditionBuilder, Leaf};
    pub use crate::dispatch::{DispatchOptions, DispatchOutcome, Dispatcher, Handler, RuleIndex, Runner};
    pub use crate::error::HandlerError;
    pub use crate::mux::{MuxOptions, QueueMultiplexer, SortKey, SortedMuxOptions, SortedQueueMultiplexer};
    pub use crate::queue::{channel_queue, unbounded_queue, Queue, QueueLike, Slot, TryTake};
}
