//! Many-to-many queue multiplexers: non-blocking round-robin fan-out and a
//! blocking, key-ordered k-way merge.

mod round_robin;
mod sorted;

pub use round_robin::QueueMultiplexer;
pub use sorted::{SortKey, SortedQueueMultiplexer};

/// Options shared by both multiplexer flavors.
#[derive(Debug, Clone, Copy)]
pub struct MuxOptions {
    /// 0 means unbounded.
    pub maxsize_input: usize,
    /// 0 means unbounded.
    pub maxsize_output: usize,
    /// The merge task does not start sweeping until at least this many input
    /// queues have been registered. 0 means "start as soon as `run()` is
    /// called, whatever is registered".
    pub wait_for_n_input_queues: usize,
    /// Symmetric threshold for output queues.
    pub wait_for_n_output_queues: usize,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            maxsize_input: 0,
            maxsize_output: 0,
            wait_for_n_input_queues: 0,
            wait_for_n_output_queues: 0,
        }
    }
}

/// [`MuxOptions`] plus the sort discipline for [`SortedQueueMultiplexer`].
#[derive(Clone)]
pub struct SortedMuxOptions {
    pub base: MuxOptions,
    pub sort_key: SortKey,
    pub sort_reverse: bool,
}

impl Default for SortedMuxOptions {
    fn default() -> Self {
        Self {
            base: MuxOptions::default(),
            sort_key: SortKey::Identity,
            sort_reverse: false,
        }
    }
}
