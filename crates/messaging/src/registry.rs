//! Static consumer registration.
//!
//! Each registration pairs a consumer type with one message type and carries a
//! factory that produces a live consumer instance on demand. This replaces any
//! runtime discovery: the full table is known once the registry is built.

use std::sync::Arc;

use crate::consumer::{Consumer, Handles, MessageContract, TypedConsumer};
use crate::selector::ConsumerDescriptor;

/// Produces a consumer instance for one unit of work.
pub type ConsumerFactory = Arc<dyn Fn() -> Arc<dyn Consumer> + Send + Sync>;

/// One (consumer type × message type) entry.
#[derive(Clone)]
pub struct ConsumerRegistration {
    pub consumer_type: &'static str,
    pub message_type: &'static str,
    /// Explicit group; falls back to the selector's default group.
    pub group: Option<String>,
    factory: ConsumerFactory,
}

impl ConsumerRegistration {
    pub fn instantiate(&self) -> Arc<dyn Consumer> {
        (self.factory)()
    }
}

impl core::fmt::Debug for ConsumerRegistration {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConsumerRegistration")
            .field("consumer_type", &self.consumer_type)
            .field("message_type", &self.message_type)
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

/// Produces a live consumer for a descriptor.
pub trait ConsumerResolver: Send + Sync {
    fn resolve(&self, descriptor: &ConsumerDescriptor) -> Option<Arc<dyn Consumer>>;
}

/// Registration table, in registration order.
#[derive(Debug, Default, Clone)]
pub struct ConsumerRegistry {
    entries: Vec<ConsumerRegistration>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `C` as a handler of `M` in the default group.
    pub fn register<M, C, F>(&mut self, factory: F) -> &mut Self
    where
        M: MessageContract,
        C: Handles<M>,
        F: Fn() -> C + Send + Sync + 'static,
    {
        self.push_typed::<M, C, F>(None, factory)
    }

    /// Register `C` as a handler of `M` in an explicit group.
    pub fn register_in_group<M, C, F>(&mut self, group: impl Into<String>, factory: F) -> &mut Self
    where
        M: MessageContract,
        C: Handles<M>,
        F: Fn() -> C + Send + Sync + 'static,
    {
        self.push_typed::<M, C, F>(Some(group.into()), factory)
    }

    /// Register an untyped consumer under explicit type names.
    pub fn register_raw<F>(
        &mut self,
        consumer_type: &'static str,
        message_type: &'static str,
        group: Option<String>,
        factory: F,
    ) -> &mut Self
    where
        F: Fn() -> Arc<dyn Consumer> + Send + Sync + 'static,
    {
        self.entries.push(ConsumerRegistration {
            consumer_type,
            message_type,
            group,
            factory: Arc::new(factory),
        });
        self
    }

    fn push_typed<M, C, F>(&mut self, group: Option<String>, factory: F) -> &mut Self
    where
        M: MessageContract,
        C: Handles<M>,
        F: Fn() -> C + Send + Sync + 'static,
    {
        let factory: ConsumerFactory =
            Arc::new(move || Arc::new(TypedConsumer::<C, M>::new(Arc::new(factory()))) as Arc<dyn Consumer>);
        self.entries.push(ConsumerRegistration {
            consumer_type: std::any::type_name::<C>(),
            message_type: M::NAME,
            group,
            factory,
        });
        self
    }

    /// Every registration, one per (consumer type × message type) pair.
    pub fn get_all(&self) -> &[ConsumerRegistration] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ConsumerResolver for ConsumerRegistry {
    fn resolve(&self, descriptor: &ConsumerDescriptor) -> Option<Arc<dyn Consumer>> {
        // Latest matching registration wins, consistent with selector de-duplication.
        self.entries
            .iter()
            .rev()
            .find(|entry| {
                entry.consumer_type == descriptor.impl_type
                    && entry.message_type == descriptor.message_type
                    && entry.group == descriptor.registered_group
            })
            .map(ConsumerRegistration::instantiate)
    }
}

impl<R> ConsumerResolver for Arc<R>
where
    R: ConsumerResolver + ?Sized,
{
    fn resolve(&self, descriptor: &ConsumerDescriptor) -> Option<Arc<dyn Consumer>> {
        (**self).resolve(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{ConsumerContext, ConsumerError};
    use async_trait::async_trait;
    use serde::Deserialize;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Deserialize)]
    struct Created;
    #[derive(Debug, Deserialize)]
    struct Deleted;

    impl MessageContract for Created {
        const NAME: &'static str = "item.created";
    }
    impl MessageContract for Deleted {
        const NAME: &'static str = "item.deleted";
    }

    struct Auditor;

    #[async_trait]
    impl Handles<Created> for Auditor {
        async fn handle(&self, _: Created, _: &ConsumerContext, _: &CancellationToken) -> Result<(), ConsumerError> {
            Ok(())
        }
    }

    #[async_trait]
    impl Handles<Deleted> for Auditor {
        async fn handle(&self, _: Deleted, _: &ConsumerContext, _: &CancellationToken) -> Result<(), ConsumerError> {
            Ok(())
        }
    }

    #[test]
    fn one_entry_per_message_type() {
        let mut registry = ConsumerRegistry::new();
        registry
            .register::<Created, _, _>(|| Auditor)
            .register::<Deleted, _, _>(|| Auditor);

        let all = registry.get_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].consumer_type, all[1].consumer_type);
        assert_eq!(all[0].message_type, "item.created");
        assert_eq!(all[1].message_type, "item.deleted");
    }

    #[test]
    fn resolves_by_consumer_and_message_type() {
        let mut registry = ConsumerRegistry::new();
        registry.register_in_group::<Created, _, _>("audit", || Auditor);

        let descriptor = ConsumerDescriptor {
            topic_name: "item.created".to_string(),
            group_name: "audit.v1".to_string(),
            impl_type: std::any::type_name::<Auditor>(),
            message_type: "item.created",
            registered_group: Some("audit".to_string()),
        };
        assert!(registry.resolve(&descriptor).is_some());

        let unknown = ConsumerDescriptor {
            message_type: "item.deleted",
            ..descriptor
        };
        assert!(registry.resolve(&unknown).is_none());
    }

    struct Tagged(&'static str);

    #[async_trait]
    impl Handles<Created> for Tagged {
        async fn handle(&self, _: Created, _: &ConsumerContext, _: &CancellationToken) -> Result<(), ConsumerError> {
            anyhow::bail!("{}", self.0)
        }
    }

    #[tokio::test]
    async fn same_consumer_type_resolves_per_group() {
        let mut registry = ConsumerRegistry::new();
        registry
            .register_in_group::<Created, _, _>("billing", || Tagged("billing"))
            .register_in_group::<Created, _, _>("audit", || Tagged("audit"));

        let descriptor = |group: &str| ConsumerDescriptor {
            topic_name: "item.created".to_string(),
            group_name: format!("{group}.v1"),
            impl_type: std::any::type_name::<Tagged>(),
            message_type: "item.created",
            registered_group: Some(group.to_string()),
        };
        let context = ConsumerContext::new("item.created", crate::message::Content::new(serde_json::Value::Null));
        let cancel = CancellationToken::new();

        for group in ["billing", "audit"] {
            let consumer = registry.resolve(&descriptor(group)).unwrap();
            let err = consumer.consume(&context, &cancel).await.unwrap_err();
            assert_eq!(err.to_string(), group);
        }
    }
}
