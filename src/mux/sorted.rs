//! Blocking, key-ordered k-way merge.

use super::SortedMuxOptions;
use crate::queue::{channel_queue, Queue, Slot};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// How to derive the ordering key from an item.
#[derive(Clone)]
pub enum SortKey {
    /// The item itself is the key.
    Identity,
    /// Dotted-path object lookup; a missing segment at any step yields
    /// `Value::Null`, which sorts before every other JSON type.
    Path(Vec<String>),
    /// Invoked with the whole item, no other arguments.
    Callable(Arc<dyn Fn(&Value) -> Value + Send + Sync>),
}

impl SortKey {
    pub fn path(dotted: impl AsRef<str>) -> Self {
        SortKey::Path(dotted.as_ref().split('.').map(str::to_string).collect())
    }

    pub fn callable(f: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        SortKey::Callable(Arc::new(f))
    }

    fn resolve(&self, item: &Value) -> Value {
        match self {
            SortKey::Identity => item.clone(),
            SortKey::Path(segments) => {
                let mut current = item;
                for segment in segments {
                    match current.as_object().and_then(|map| map.get(segment)) {
                        Some(next) => current = next,
                        None => return Value::Null,
                    }
                }
                current.clone()
            }
            SortKey::Callable(f) => f(item),
        }
    }
}

impl fmt::Debug for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortKey::Identity => f.write_str("Identity"),
            SortKey::Path(segments) => f.debug_tuple("Path").field(segments).finish(),
            SortKey::Callable(_) => f.write_str("Callable(..)"),
        }
    }
}

/// Type-rank-then-value comparison over `serde_json::Value`, since JSON has
/// no total order of its own: `Null < Bool < Number < String < Array <
/// Object`, with `Object` always comparing equal to another `Object` (no
/// sort key should ever resolve to one in practice).
fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    let (ra, rb) = (rank(a), rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .zip(y.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y))
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                match compare_values(xi, yi) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

struct Inner {
    inputs: Vec<Queue<Value>>,
    outputs: Vec<Queue<Value>>,
    running: bool,
}

/// A strictly key-ordered k-way merge of JSON-record inputs, assumed
/// (not verified) to each be individually monotone in the sort key.
pub struct SortedQueueMultiplexer {
    inner: Arc<parking_lot::Mutex<Inner>>,
    options: SortedMuxOptions,
}

impl Clone for SortedQueueMultiplexer {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            options: self.options.clone(),
        }
    }
}

impl SortedQueueMultiplexer {
    pub fn new(options: SortedMuxOptions) -> Self {
        Self {
            inner: Arc::new(parking_lot::Mutex::new(Inner {
                inputs: Vec::new(),
                outputs: Vec::new(),
                running: false,
            })),
            options,
        }
    }

    pub fn input_queue(&self, existing: Option<Queue<Value>>) -> Queue<Value> {
        let queue = existing.unwrap_or_else(|| channel_queue(self.options.base.maxsize_input));
        self.inner.lock().inputs.push(queue.clone());
        queue
    }

    pub fn output_queue(&self, existing: Option<Queue<Value>>) -> Queue<Value> {
        let queue = existing.unwrap_or_else(|| channel_queue(self.options.base.maxsize_output));
        self.inner.lock().outputs.push(queue.clone());
        queue
    }

    pub fn run(&self) -> Self {
        let mut guard = self.inner.lock();
        if !guard.running {
            guard.running = true;
            drop(guard);
            let inner = self.inner.clone();
            let options = self.options.clone();
            tokio::spawn(async move { merge_loop(inner, options).await });
        }
        self.clone()
    }
}

async fn merge_loop(inner: Arc<parking_lot::Mutex<Inner>>, options: SortedMuxOptions) {
    loop {
        let ready = {
            let guard = inner.lock();
            guard.inputs.len() >= options.base.wait_for_n_input_queues
                && guard.outputs.len() >= options.base.wait_for_n_output_queues
        };
        if ready {
            break;
        }
        tokio::task::yield_now().await;
    }

    let mut closed: HashSet<usize> = HashSet::new();
    let mut peek: Vec<Option<(Value, Value)>> = Vec::new();

    loop {
        let (inputs, outputs) = {
            let guard = inner.lock();
            (guard.inputs.clone(), guard.outputs.clone())
        };
        while peek.len() < inputs.len() {
            peek.push(None);
        }

        for (i, input) in inputs.iter().enumerate() {
            if closed.contains(&i) || peek[i].is_some() {
                continue;
            }
            match input.take().await {
                Slot::End => {
                    tracing::trace!(input = i, "sorted merge: input closed");
                    closed.insert(i);
                }
                Slot::Item(item) => {
                    let key = options.sort_key.resolve(&item);
                    peek[i] = Some((key, item));
                }
            }
        }

        if !inputs.is_empty() && (0..inputs.len()).all(|i| closed.contains(&i)) {
            break;
        }

        let mut best: Option<usize> = None;
        for i in 0..inputs.len() {
            if peek[i].is_none() {
                continue;
            }
            best = Some(match best {
                None => i,
                Some(b) => {
                    let (key_i, _) = peek[i].as_ref().unwrap();
                    let (key_b, _) = peek[b].as_ref().unwrap();
                    let cmp = compare_values(key_i, key_b);
                    let better = if options.sort_reverse {
                        cmp == Ordering::Greater
                    } else {
                        cmp == Ordering::Less
                    };
                    if better {
                        i
                    } else {
                        b
                    }
                }
            });
        }

        if let Some(i) = best {
            let (_, item) = peek[i].take().expect("selected slot must be occupied");
            for output in &outputs {
                output.put(Slot::Item(item.clone())).await;
            }
        } else {
            // No inputs registered yet (or none with a filled slot): nothing
            // to block on above, so yield explicitly or this task spins
            // without ever suspending.
            tokio::task::yield_now().await;
        }
    }

    let outputs = { inner.lock().outputs.clone() };
    for output in &outputs {
        output.put(Slot::End).await;
    }
    tracing::debug!("sorted merge: all inputs closed, terminal sentinel emitted");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::MuxOptions;
    use serde_json::json;

    async fn drain(queue: &Queue<Value>) -> Vec<Slot<Value>> {
        let mut items = Vec::new();
        loop {
            let slot = queue.take().await;
            let is_end = slot.is_end();
            items.push(slot);
            if is_end {
                break;
            }
        }
        items
    }

    #[tokio::test]
    async fn sorted_merge_orders_by_timestamp_with_registration_order_tiebreak() {
        let options = SortedMuxOptions {
            base: MuxOptions::default(),
            sort_key: SortKey::path("ts"),
            sort_reverse: false,
        };
        let mux = SortedQueueMultiplexer::new(options);
        let a = mux.input_queue(None);
        let b = mux.input_queue(None);
        let output = mux.output_queue(None);
        mux.run();

        for ts in [1, 2, 3, 4] {
            a.put(Slot::Item(json!({ "ts": ts, "src": "a" }))).await;
        }
        a.put(Slot::End).await;
        for ts in [1, 3] {
            b.put(Slot::Item(json!({ "ts": ts, "src": "b" }))).await;
        }
        b.put(Slot::End).await;

        let received = drain(&output).await;
        let items: Vec<Value> = received
            .into_iter()
            .filter_map(Slot::into_item)
            .collect();
        let ts_sequence: Vec<i64> = items.iter().map(|v| v["ts"].as_i64().unwrap()).collect();
        assert_eq!(ts_sequence, vec![1, 1, 2, 3, 3, 4]);
        // within ts=1, a (registered first) precedes b
        assert_eq!(items[0]["src"], json!("a"));
        assert_eq!(items[1]["src"], json!("b"));
        // within ts=3, a precedes b
        assert_eq!(items[3]["src"], json!("a"));
        assert_eq!(items[4]["src"], json!("b"));
    }

    #[tokio::test]
    async fn missing_sort_key_sorts_first() {
        let options = SortedMuxOptions {
            base: MuxOptions::default(),
            sort_key: SortKey::path("ts"),
            sort_reverse: false,
        };
        let mux = SortedQueueMultiplexer::new(options);
        let a = mux.input_queue(None);
        let output = mux.output_queue(None);
        mux.run();

        a.put(Slot::Item(json!({ "no_ts": true }))).await;
        a.put(Slot::Item(json!({ "ts": 1 }))).await;
        a.put(Slot::End).await;

        let received = drain(&output).await;
        let items: Vec<Value> = received.into_iter().filter_map(Slot::into_item).collect();
        assert_eq!(items[0], json!({ "no_ts": true }));
        assert_eq!(items[1], json!({ "ts": 1 }));
    }

    #[test]
    fn quickcheck_sorted_merge_is_monotone() {
        use quickcheck::QuickCheck;

        fn property(mut streams: Vec<Vec<i64>>) -> bool {
            for stream in &mut streams {
                stream.sort_unstable();
            }
            streams.retain(|s| !s.is_empty());
            if streams.is_empty() {
                return true;
            }

            let runtime = tokio::runtime::Runtime::new().unwrap();
            runtime.block_on(async move {
                let options = SortedMuxOptions {
                    base: MuxOptions::default(),
                    sort_key: SortKey::Identity,
                    sort_reverse: false,
                };
                let mux = SortedQueueMultiplexer::new(options);
                let inputs: Vec<_> = streams.iter().map(|_| mux.input_queue(None)).collect();
                let output = mux.output_queue(None);
                mux.run();

                for (input, stream) in inputs.iter().zip(streams.iter()) {
                    for value in stream {
                        input.put(Slot::Item(json!(value))).await;
                    }
                    input.put(Slot::End).await;
                }

                let received = drain(&output).await;
                let values: Vec<i64> = received
                    .into_iter()
                    .filter_map(Slot::into_item)
                    .map(|v| v.as_i64().unwrap())
                    .collect();
                values.windows(2).all(|pair| pair[0] <= pair[1])
            })
        }

        QuickCheck::new()
            .tests(30)
            .quickcheck(property as fn(Vec<Vec<i64>>) -> bool);
    }
}
