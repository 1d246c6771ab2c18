//! Binds a single ingress queue to a [`Dispatcher`](super::Dispatcher).

use super::{DispatchOutcome, Dispatcher};
use crate::queue::Queue;
use serde_json::Value;
use tokio::task::JoinHandle;

/// Repeatedly takes from an ingress queue and triggers a dispatcher with each
/// record, until the queue's terminal sentinel arrives.
pub struct Runner {
    dispatcher: Dispatcher,
    ingress: Queue<Value>,
}

impl Runner {
    pub fn new(dispatcher: Dispatcher, ingress: Queue<Value>) -> Self {
        Self { dispatcher, ingress }
    }

    /// Spawn the ingress loop onto the ambient runtime. The returned handle
    /// resolves once the ingress queue closes; the dispatch outcomes of each
    /// triggered record are discarded by the loop itself, so callers that
    /// need per-record outcomes should call [`Dispatcher::trigger`] directly
    /// instead of going through a `Runner`.
    pub fn run(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let slot = self.ingress.take().await;
                let Some(record) = slot.into_item() else {
                    tracing::debug!("runner: ingress closed");
                    break;
                };
                let outcomes = self.dispatcher.trigger(record, None);
                log_outcomes(&outcomes);
            }
        })
    }
}

fn log_outcomes(outcomes: &[DispatchOutcome]) {
    for outcome in outcomes {
        if let DispatchOutcome::Inline(Err(error)) = outcome {
            tracing::debug!(%error, "runner: handler reported failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchOptions, Dispatcher};
    use crate::queue::{channel_queue, Slot};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn runner_triggers_dispatcher_until_sentinel() {
        let dispatcher = Dispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        dispatcher.register(
            move |record| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok(record)
            },
            crate::condition::Condition::any(),
            DispatchOptions::default(),
        );

        let ingress: Queue<Value> = channel_queue(4);
        ingress.put(Slot::Item(json!({ "n": 1 }))).await;
        ingress.put(Slot::Item(json!({ "n": 2 }))).await;
        ingress.put(Slot::End).await;

        let runner = Runner::new(dispatcher, ingress);
        runner.run().await.expect("runner task should not panic");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
