//! Inbound dispatch: topic -> consumers -> `consume`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::consumer::ConsumerContext;
use crate::registry::ConsumerResolver;
use crate::selector::{ConsumerDescriptor, ConsumerServiceSelector};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch cancelled")]
    Cancelled,

    #[error("no consumer subscribed to topic '{topic}' (group: {group:?})")]
    NoConsumer { topic: String, group: Option<String> },

    #[error("consumer type '{0}' is not registered with the resolver")]
    Unresolved(&'static str),

    #[error("consumer {consumer} ({group}) failed: {source}")]
    Consumer {
        consumer: &'static str,
        group: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Invokes every consumer matched for a message.
///
/// Candidate lists are cached per topic; the routing table is immutable once
/// the selector is built.
pub struct Dispatcher {
    selector: Arc<dyn ConsumerServiceSelector>,
    resolver: Arc<dyn ConsumerResolver>,
    cache: RwLock<HashMap<String, Arc<Vec<ConsumerDescriptor>>>>,
}

impl Dispatcher {
    pub fn new(
        selector: Arc<dyn ConsumerServiceSelector>,
        resolver: Arc<dyn ConsumerResolver>,
    ) -> Self {
        Self {
            selector,
            resolver,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Groups subscribed to `topic`, in routing order.
    pub fn groups_for(&self, topic: &str) -> Vec<String> {
        let mut groups = Vec::new();
        for d in self.candidates(topic).iter() {
            if !groups.contains(&d.group_name) {
                groups.push(d.group_name.clone());
            }
        }
        groups
    }

    fn candidates(&self, topic: &str) -> Arc<Vec<ConsumerDescriptor>> {
        if let Ok(cache) = self.cache.read() {
            if let Some(hit) = cache.get(topic) {
                return hit.clone();
            }
        }

        let selected = Arc::new(
            self.selector
                .select_best_candidate(topic, self.selector.select_candidates()),
        );

        // A poisoned cache only costs a recomputation next time.
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(topic.to_string(), selected.clone());
        }
        selected
    }

    /// Invoke every consumer of `context.topic` (or only `context.group`).
    ///
    /// Returns how many consumers ran. The first consumer error stops the
    /// fan-out and is returned.
    pub async fn dispatch(
        &self,
        context: &ConsumerContext,
        cancel: &CancellationToken,
    ) -> Result<usize, DispatchError> {
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let candidates = self.candidates(&context.topic);
        let targets: Vec<&ConsumerDescriptor> = candidates
            .iter()
            .filter(|d| context.group.as_ref().is_none_or(|g| &d.group_name == g))
            .collect();

        if targets.is_empty() {
            return Err(DispatchError::NoConsumer {
                topic: context.topic.clone(),
                group: context.group.clone(),
            });
        }

        let mut invoked = 0;
        for descriptor in targets {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            let consumer = self
                .resolver
                .resolve(descriptor)
                .ok_or(DispatchError::Unresolved(descriptor.impl_type))?;

            debug!(
                topic = %context.topic,
                group = %descriptor.group_name,
                consumer = descriptor.impl_type,
                "dispatching"
            );

            if let Err(err) = consumer.consume(context, cancel).await {
                warn!(
                    topic = %context.topic,
                    group = %descriptor.group_name,
                    consumer = descriptor.impl_type,
                    error = %err,
                    "consumer failed"
                );
                return Err(DispatchError::Consumer {
                    consumer: descriptor.impl_type,
                    group: descriptor.group_name.clone(),
                    source: err.into(),
                });
            }
            invoked += 1;
        }

        Ok(invoked)
    }
}

impl core::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::consumer::{Consumer, ConsumerError};
    use crate::message::Content;
    use crate::registry::ConsumerRegistry;
    use crate::selector::{DefaultConsumerSelector, SelectorOptions};

    #[derive(Clone, Default)]
    struct Calls(Arc<Mutex<Vec<&'static str>>>);

    struct Recording {
        name: &'static str,
        calls: Calls,
        fail: bool,
    }

    #[async_trait]
    impl Consumer for Recording {
        async fn consume(&self, _: &ConsumerContext, _: &CancellationToken) -> Result<(), ConsumerError> {
            self.calls.0.lock().unwrap().push(self.name);
            if self.fail {
                anyhow::bail!("{} refused", self.name);
            }
            Ok(())
        }
    }

    fn dispatcher(entries: &[(&'static str, &'static str, bool)], calls: &Calls) -> Dispatcher {
        let mut registry = ConsumerRegistry::new();
        for &(name, group, fail) in entries {
            let calls = calls.clone();
            registry.register_raw(name, "orders.placed", Some(group.to_string()), move || {
                Arc::new(Recording { name, calls: calls.clone(), fail }) as Arc<dyn Consumer>
            });
        }
        let selector = DefaultConsumerSelector::new(&registry, &SelectorOptions::default()).unwrap();
        Dispatcher::new(Arc::new(selector), Arc::new(registry))
    }

    fn context() -> ConsumerContext {
        ConsumerContext::new("orders.placed", Content::new(serde_json::json!({"id": 1})))
    }

    #[tokio::test]
    async fn fans_out_to_every_group() {
        let calls = Calls::default();
        let d = dispatcher(&[("Billing", "billing", false), ("Shipping", "shipping", false)], &calls);

        let invoked = d.dispatch(&context(), &CancellationToken::new()).await.unwrap();

        assert_eq!(invoked, 2);
        assert_eq!(*calls.0.lock().unwrap(), vec!["Billing", "Shipping"]);
    }

    #[tokio::test]
    async fn pinned_group_only_reaches_that_group() {
        let calls = Calls::default();
        let d = dispatcher(&[("Billing", "billing", false), ("Shipping", "shipping", false)], &calls);

        let ctx = context().for_group("shipping.v1");
        d.dispatch(&ctx, &CancellationToken::new()).await.unwrap();

        assert_eq!(*calls.0.lock().unwrap(), vec!["Shipping"]);
    }

    #[tokio::test]
    async fn first_consumer_error_propagates() {
        let calls = Calls::default();
        let d = dispatcher(&[("Billing", "billing", true), ("Shipping", "shipping", false)], &calls);

        let err = d.dispatch(&context(), &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, DispatchError::Consumer { consumer: "Billing", .. }));
        assert_eq!(*calls.0.lock().unwrap(), vec!["Billing"]);
    }

    #[tokio::test]
    async fn unknown_topic_is_an_error() {
        let d = dispatcher(&[], &Calls::default());
        let ctx = ConsumerContext::new("nobody.listens", Content::new(serde_json::Value::Null));

        let err = d.dispatch(&ctx, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoConsumer { .. }));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let calls = Calls::default();
        let d = dispatcher(&[("Billing", "billing", false)], &calls);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(d.dispatch(&context(), &cancel).await, Err(DispatchError::Cancelled)));
        assert!(calls.0.lock().unwrap().is_empty());
    }
}
