//! Condition-indexed routing of records to subscribed handlers.

mod runner;

pub use runner::Runner;

use crate::condition::Condition;
use crate::error::HandlerError;
use fnv::FnvHashMap;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A registered callback. Ordinary synchronous closures implement this
/// automatically; implement it directly for handlers that need to carry
/// extra state behind a named type.
pub trait Handler: Send + Sync {
    fn call(&self, record: Value) -> Result<Value, HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(Value) -> Result<Value, HandlerError> + Send + Sync,
{
    fn call(&self, record: Value) -> Result<Value, HandlerError> {
        self(record)
    }
}

/// A rule's stable identity; returned by `register`/`register_once`, accepted
/// by `unregister`. Never reused, even after the rule is tombstoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleIndex(usize);

/// Per-dispatcher / per-rule / per-trigger dispatch options. `None` means
/// "inherit from the next layer out"; the effective value used by `trigger`
/// is the shallow override chain: dispatcher defaults, then rule options,
/// then trigger options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    pub async_dispatch: Option<bool>,
    pub debug: Option<bool>,
}

impl DispatchOptions {
    pub fn async_dispatch(mut self, value: bool) -> Self {
        self.async_dispatch = Some(value);
        self
    }

    pub fn debug(mut self, value: bool) -> Self {
        self.debug = Some(value);
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct ResolvedOptions {
    async_dispatch: bool,
    debug: bool,
}

fn merge_options(
    defaults: DispatchOptions,
    rule: DispatchOptions,
    trigger: Option<DispatchOptions>,
) -> ResolvedOptions {
    let pick = |trigger: Option<bool>, rule: Option<bool>, default: Option<bool>| {
        trigger.or(rule).or(default).unwrap_or(false)
    };
    ResolvedOptions {
        async_dispatch: pick(
            trigger.and_then(|o| o.async_dispatch),
            rule.async_dispatch,
            defaults.async_dispatch,
        ),
        debug: pick(trigger.and_then(|o| o.debug), rule.debug, defaults.debug),
    }
}

/// The outcome of dispatching one matched rule. Inline handlers have already
/// run by the time `trigger` returns; async-dispatched handlers are still
/// running on the worker pool and are represented by their `JoinHandle`.
pub enum DispatchOutcome {
    Inline(Result<Value, HandlerError>),
    Spawned(JoinHandle<Result<Value, HandlerError>>),
}

impl fmt::Debug for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchOutcome::Inline(result) => f.debug_tuple("Inline").field(result).finish(),
            DispatchOutcome::Spawned(_) => f.write_str("Spawned(..)"),
        }
    }
}

struct RuleSlot {
    index: RuleIndex,
    condition: Condition,
    handler: Arc<dyn Handler>,
    options: DispatchOptions,
    tombstoned: bool,
}

struct DispatcherInner {
    rules: Vec<RuleSlot>,
    key_index: FnvHashMap<String, BTreeSet<usize>>,
    /// Rules whose condition has no top-level keys at all; they would never
    /// be found by unioning buckets keyed on the triggering record's fields,
    /// so they are seeded into every lookup instead.
    no_key_bucket: BTreeSet<usize>,
    defaults: DispatchOptions,
}

/// A cheaply-cloneable handle to the registration store, secondary index, and
/// dispatch logic. Clones share the same underlying state (like the
/// reference crate's `Variable<T>` handle).
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<parking_lot::Mutex<DispatcherInner>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_defaults(DispatchOptions::default())
    }

    pub fn with_defaults(defaults: DispatchOptions) -> Self {
        Self {
            inner: Arc::new(parking_lot::Mutex::new(DispatcherInner {
                rules: Vec::new(),
                key_index: FnvHashMap::default(),
                no_key_bucket: BTreeSet::new(),
                defaults,
            })),
        }
    }

    /// Register a handler for `condition`. Returns a stable index usable with
    /// `unregister`.
    pub fn register<H>(&self, handler: H, condition: Condition, options: DispatchOptions) -> RuleIndex
    where
        H: Fn(Value) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.register_arc(Arc::new(handler), condition, options)
    }

    pub fn register_arc(
        &self,
        handler: Arc<dyn Handler>,
        condition: Condition,
        options: DispatchOptions,
    ) -> RuleIndex {
        let mut inner = self.inner.lock();
        let index = RuleIndex(inner.rules.len());
        Self::insert_rule(&mut inner, index, condition, handler, options);
        tracing::debug!(rule = index.0, "registered");
        index
    }

    /// Like [`Dispatcher::register`], but the handler unregisters itself after
    /// its first invocation completes, whether it succeeded or failed.
    pub fn register_once<H>(&self, handler: H, condition: Condition, options: DispatchOptions) -> RuleIndex
    where
        H: Fn(Value) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        // A strong `Dispatcher` clone here would close a reference cycle: the
        // wrapped handler lives inside `DispatcherInner.rules`, which lives
        // behind this same `Arc`, so the dispatcher would never free itself
        // once a single once-rule is registered. Weak breaks the cycle; the
        // handler only needs the dispatcher to still be alive at fire time.
        let weak = Arc::downgrade(&self.inner);
        let mut inner = self.inner.lock();
        let index = RuleIndex(inner.rules.len());
        let wrapped = move |record: Value| -> Result<Value, HandlerError> {
            let result = handler(record);
            if let Some(inner) = weak.upgrade() {
                Dispatcher { inner }.unregister_index(index);
            }
            result
        };
        Self::insert_rule(&mut inner, index, condition, Arc::new(wrapped), options);
        tracing::debug!(rule = index.0, "registered (once)");
        index
    }

    fn insert_rule(
        inner: &mut DispatcherInner,
        index: RuleIndex,
        condition: Condition,
        handler: Arc<dyn Handler>,
        options: DispatchOptions,
    ) {
        debug_assert_eq!(index.0, inner.rules.len());
        for key in condition.keys() {
            inner.key_index.entry(key.to_string()).or_default().insert(index.0);
        }
        if condition.is_empty() {
            inner.no_key_bucket.insert(index.0);
        }
        inner.rules.push(RuleSlot {
            index,
            condition,
            handler,
            options,
            tombstoned: false,
        });
    }

    /// Tombstone a single rule by its stable index. A no-op on an
    /// out-of-range or already-tombstoned index; tombstones are terminal
    /// and never resurrected.
    pub fn unregister_index(&self, index: RuleIndex) {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.rules.get_mut(index.0) else {
            return;
        };
        if slot.tombstoned {
            return;
        }
        slot.tombstoned = true;
        let keys: Vec<String> = slot.condition.keys().map(str::to_string).collect();
        let is_empty = slot.condition.is_empty();
        for key in keys {
            if let Some(bucket) = inner.key_index.get_mut(&key) {
                bucket.remove(&index.0);
            }
        }
        if is_empty {
            inner.no_key_bucket.remove(&index.0);
        }
        tracing::debug!(rule = index.0, "unregistered");
    }

    /// Tombstone every live rule registered with this exact handler
    /// (compared by pointer identity) and, if `condition` is given, whose
    /// condition also compares equal (conditions containing callable leaves
    /// never compare equal to anything, so such rules are only reachable by
    /// index).
    pub fn unregister_handler(&self, handler: &Arc<dyn Handler>, condition: Option<&Condition>) {
        let matches: Vec<RuleIndex> = {
            let inner = self.inner.lock();
            inner
                .rules
                .iter()
                .filter(|slot| !slot.tombstoned && Arc::ptr_eq(&slot.handler, handler))
                .filter(|slot| condition.map_or(true, |c| &slot.condition == c))
                .map(|slot| slot.index)
                .collect()
        };
        for index in matches {
            self.unregister_index(index);
        }
    }

    /// Look up and invoke every live rule whose condition matches `record`,
    /// in ascending registration order. Returns immediately; entries for
    /// async-dispatched rules carry a `JoinHandle` rather than a ready
    /// result.
    pub fn trigger(&self, record: Value, options: Option<DispatchOptions>) -> Vec<DispatchOutcome> {
        let (candidates, defaults) = {
            let inner = self.inner.lock();
            let mut indices: BTreeSet<usize> = inner.no_key_bucket.clone();
            if let Some(object) = record.as_object() {
                for key in object.keys() {
                    if let Some(bucket) = inner.key_index.get(key) {
                        indices.extend(bucket.iter().copied());
                    }
                }
            }
            let candidates = indices
                .into_iter()
                .filter_map(|i| inner.rules.get(i))
                .filter(|slot| !slot.tombstoned)
                .map(|slot| (slot.index, slot.condition.clone(), slot.handler.clone(), slot.options))
                .collect::<Vec<_>>();
            (candidates, inner.defaults)
        };

        let mut outcomes = Vec::new();
        for (index, condition, handler, rule_options) in candidates {
            if !condition.matches(&record) {
                continue;
            }
            let resolved = merge_options(defaults, rule_options, options);
            if resolved.debug {
                tracing::debug!(rule = index.0, async_dispatch = resolved.async_dispatch, "dispatching");
            }
            if resolved.async_dispatch {
                let handler = handler.clone();
                let record = record.clone();
                let join = tokio::task::spawn_blocking(move || call_handler(handler.as_ref(), record));
                outcomes.push(DispatchOutcome::Spawned(join));
            } else {
                outcomes.push(DispatchOutcome::Inline(call_handler(handler.as_ref(), record.clone())));
            }
        }
        outcomes
    }
}

fn call_handler(handler: &dyn Handler, record: Value) -> Result<Value, HandlerError> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler.call(record))) {
        Ok(result) => result,
        Err(payload) => Err(HandlerError::Panicked(panic_message(&payload))),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked with a non-string payload".to_string()
    }
}
