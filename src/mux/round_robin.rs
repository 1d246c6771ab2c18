//! Non-blocking round-robin fan-out merge.

use super::MuxOptions;
use crate::queue::{channel_queue, Queue, Slot, TryTake};
use std::collections::HashSet;
use std::sync::Arc;

struct Inner<T> {
    inputs: Vec<Queue<T>>,
    outputs: Vec<Queue<T>>,
    running: bool,
}

/// Merges an arbitrary number of input queues into an arbitrary number of
/// output queues: every non-sentinel item from every input is broadcast to
/// every output, in best-effort round-robin order, followed by exactly one
/// terminal sentinel per output once every input has closed.
pub struct QueueMultiplexer<T> {
    inner: Arc<parking_lot::Mutex<Inner<T>>>,
    options: MuxOptions,
}

impl<T> Clone for QueueMultiplexer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            options: self.options,
        }
    }
}

impl<T> QueueMultiplexer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(options: MuxOptions) -> Self {
        Self {
            inner: Arc::new(parking_lot::Mutex::new(Inner {
                inputs: Vec::new(),
                outputs: Vec::new(),
                running: false,
            })),
            options,
        }
    }

    /// Register an input queue, creating one from [`MuxOptions::maxsize_input`]
    /// when `existing` is `None`.
    pub fn input_queue(&self, existing: Option<Queue<T>>) -> Queue<T> {
        let queue = existing.unwrap_or_else(|| channel_queue(self.options.maxsize_input));
        self.inner.lock().inputs.push(queue.clone());
        queue
    }

    /// Register an output queue, creating one from [`MuxOptions::maxsize_output`]
    /// when `existing` is `None`.
    pub fn output_queue(&self, existing: Option<Queue<T>>) -> Queue<T> {
        let queue = existing.unwrap_or_else(|| channel_queue(self.options.maxsize_output));
        self.inner.lock().outputs.push(queue.clone());
        queue
    }

    /// Spawn the merge task onto the ambient runtime, if it has not already
    /// been spawned. Returns a clone of this handle either way.
    pub fn run(&self) -> Self {
        let mut guard = self.inner.lock();
        if !guard.running {
            guard.running = true;
            drop(guard);
            let inner = self.inner.clone();
            let options = self.options;
            tokio::spawn(async move { merge_loop(inner, options).await });
        }
        self.clone()
    }
}

async fn merge_loop<T>(inner: Arc<parking_lot::Mutex<Inner<T>>>, options: MuxOptions)
where
    T: Clone + Send + Sync + 'static,
{
    loop {
        let ready = {
            let guard = inner.lock();
            guard.inputs.len() >= options.wait_for_n_input_queues
                && guard.outputs.len() >= options.wait_for_n_output_queues
        };
        if ready {
            break;
        }
        tokio::task::yield_now().await;
    }

    let mut closed: HashSet<usize> = HashSet::new();
    loop {
        let (inputs, outputs) = {
            let guard = inner.lock();
            (guard.inputs.clone(), guard.outputs.clone())
        };
        if !inputs.is_empty() && (0..inputs.len()).all(|i| closed.contains(&i)) {
            break;
        }

        let mut progressed = false;
        for (i, input) in inputs.iter().enumerate() {
            if closed.contains(&i) {
                continue;
            }
            match input.try_take() {
                TryTake::Empty => {}
                TryTake::Item(Slot::End) => {
                    tracing::trace!(input = i, "round-robin: input closed");
                    closed.insert(i);
                    progressed = true;
                }
                TryTake::Item(Slot::Item(item)) => {
                    progressed = true;
                    for output in &outputs {
                        output.put(Slot::Item(item.clone())).await;
                    }
                }
            }
        }
        if !progressed {
            tokio::task::yield_now().await;
        }
    }

    let outputs = { inner.lock().outputs.clone() };
    for output in &outputs {
        output.put(Slot::End).await;
    }
    tracing::debug!("round-robin: all inputs closed, terminal sentinel emitted");
}
