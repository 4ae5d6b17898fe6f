//! Topic/group routing table built from the consumer registry.
//!
//! Every registration becomes a [`ConsumerDescriptor`]:
//!
//! - **topic**: the message type name, unless a topic mapping overrides it
//! - **group**: `"<group>.<version>"`, falling back to `"default"` and `"v1"`
//!
//! Distinct groups on one topic are independent fan-out targets. Two
//! registrations landing on the same `(topic, group)` pair are resolved by the
//! configured [`DuplicateConsumerPolicy`].

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, warn};

use crate::registry::ConsumerRegistry;

const FALLBACK_GROUP: &str = "default";
const FALLBACK_VERSION: &str = "v1";

/// A routable consumer: where it listens and what implements it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerDescriptor {
    pub topic_name: String,
    pub group_name: String,
    /// Registered consumer type name (resolution key).
    pub impl_type: &'static str,
    pub message_type: &'static str,
    /// Group as registered, before defaults and versioning are applied.
    pub registered_group: Option<String>,
}

/// What to do when two registrations claim the same `(topic, group)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum DuplicateConsumerPolicy {
    /// Fail selector construction.
    #[default]
    Reject,
    /// Keep the most recent registration.
    LastRegistrationWins,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("duplicate consumer for topic '{topic}' in group '{group}': {existing} and {duplicate}")]
    DuplicateConsumer {
        topic: String,
        group: String,
        existing: &'static str,
        duplicate: &'static str,
    },
}

/// Routing options.
#[derive(Debug, Clone)]
pub struct SelectorOptions {
    pub default_group: String,
    pub version: String,
    /// Message type name -> topic override.
    pub topic_map: HashMap<String, String>,
    pub duplicate_policy: DuplicateConsumerPolicy,
}

impl Default for SelectorOptions {
    fn default() -> Self {
        Self {
            default_group: FALLBACK_GROUP.to_string(),
            version: FALLBACK_VERSION.to_string(),
            topic_map: HashMap::new(),
            duplicate_policy: DuplicateConsumerPolicy::default(),
        }
    }
}

impl SelectorOptions {
    pub fn with_default_group(mut self, group: impl Into<String>) -> Self {
        self.default_group = group.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_topic(mut self, message_type: impl Into<String>, topic: impl Into<String>) -> Self {
        self.topic_map.insert(message_type.into(), topic.into());
        self
    }

    pub fn with_duplicate_policy(mut self, policy: DuplicateConsumerPolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    /// `"<default_group>.<version>"`, the group of registrations without one.
    pub fn default_group_name(&self) -> String {
        self.group_for(None)
    }

    fn topic_for(&self, message_type: &str) -> String {
        self.topic_map
            .get(message_type)
            .cloned()
            .unwrap_or_else(|| message_type.to_string())
    }

    fn group_for(&self, explicit: Option<&str>) -> String {
        let group = explicit
            .filter(|g| !g.trim().is_empty())
            .unwrap_or(&self.default_group);
        let group = if group.trim().is_empty() { FALLBACK_GROUP } else { group };
        let version = if self.version.trim().is_empty() {
            FALLBACK_VERSION
        } else {
            &self.version
        };
        format!("{group}.{version}")
    }
}

/// Chooses which consumers receive a message.
pub trait ConsumerServiceSelector: Send + Sync {
    /// Every routable descriptor.
    fn select_candidates(&self) -> &[ConsumerDescriptor];

    /// Descriptors whose topic matches `topic` exactly.
    fn select_best_candidate(
        &self,
        topic: &str,
        candidates: &[ConsumerDescriptor],
    ) -> Vec<ConsumerDescriptor> {
        candidates
            .iter()
            .filter(|d| d.topic_name == topic)
            .cloned()
            .collect()
    }
}

/// Selector backed by a snapshot of the registry.
#[derive(Debug, Clone)]
pub struct DefaultConsumerSelector {
    descriptors: Vec<ConsumerDescriptor>,
}

impl DefaultConsumerSelector {
    pub fn new(registry: &ConsumerRegistry, options: &SelectorOptions) -> Result<Self, SelectorError> {
        let mut descriptors: Vec<ConsumerDescriptor> = Vec::with_capacity(registry.len());

        for registration in registry.get_all() {
            let descriptor = ConsumerDescriptor {
                topic_name: options.topic_for(registration.message_type),
                group_name: options.group_for(registration.group.as_deref()),
                impl_type: registration.consumer_type,
                message_type: registration.message_type,
                registered_group: registration.group.clone(),
            };

            let existing = descriptors.iter().position(|d| {
                d.topic_name == descriptor.topic_name && d.group_name == descriptor.group_name
            });

            match (existing, options.duplicate_policy) {
                (None, _) => descriptors.push(descriptor),
                (Some(idx), DuplicateConsumerPolicy::Reject) => {
                    return Err(SelectorError::DuplicateConsumer {
                        topic: descriptor.topic_name,
                        group: descriptor.group_name,
                        existing: descriptors[idx].impl_type,
                        duplicate: descriptor.impl_type,
                    });
                }
                (Some(idx), DuplicateConsumerPolicy::LastRegistrationWins) => {
                    warn!(
                        topic = %descriptor.topic_name,
                        group = %descriptor.group_name,
                        replaced = descriptors[idx].impl_type,
                        consumer = descriptor.impl_type,
                        "duplicate consumer registration replaced"
                    );
                    descriptors[idx] = descriptor;
                }
            }
        }

        debug!(count = descriptors.len(), "consumer descriptors built");
        Ok(Self { descriptors })
    }

    /// Distinct groups subscribed to `topic`.
    pub fn groups_for(&self, topic: &str) -> Vec<String> {
        let groups: BTreeSet<&str> = self
            .descriptors
            .iter()
            .filter(|d| d.topic_name == topic)
            .map(|d| d.group_name.as_str())
            .collect();
        groups.into_iter().map(str::to_string).collect()
    }

    /// Distinct topics with at least one consumer.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.descriptors.iter().map(|d| d.topic_name.clone()).collect();
        topics.sort();
        topics.dedup();
        topics
    }
}

impl ConsumerServiceSelector for DefaultConsumerSelector {
    fn select_candidates(&self) -> &[ConsumerDescriptor] {
        &self.descriptors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::consumer::{Consumer, ConsumerContext, ConsumerError};
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct Noop;

    #[async_trait]
    impl Consumer for Noop {
        async fn consume(&self, _: &ConsumerContext, _: &CancellationToken) -> Result<(), ConsumerError> {
            Ok(())
        }
    }

    fn noop() -> Arc<dyn Consumer> {
        Arc::new(Noop)
    }

    #[test]
    fn group_and_version_fall_back_to_defaults() {
        let mut registry = ConsumerRegistry::new();
        registry.register_raw("Billing", "orders.placed", None, noop);

        let options = SelectorOptions::default().with_default_group("").with_version("");
        let selector = DefaultConsumerSelector::new(&registry, &options).unwrap();

        assert_eq!(selector.select_candidates()[0].group_name, "default.v1");
    }

    #[test]
    fn topic_map_overrides_message_type_name() {
        let mut registry = ConsumerRegistry::new();
        registry.register_raw("Billing", "OrderPlaced", Some("billing".into()), noop);

        let options = SelectorOptions::default()
            .with_version("v2")
            .with_topic("OrderPlaced", "orders.placed");
        let selector = DefaultConsumerSelector::new(&registry, &options).unwrap();

        let d = &selector.select_candidates()[0];
        assert_eq!(d.topic_name, "orders.placed");
        assert_eq!(d.group_name, "billing.v2");
    }

    #[test]
    fn best_candidate_matches_topic_exactly() {
        let mut registry = ConsumerRegistry::new();
        registry
            .register_raw("A", "orders.placed", None, noop)
            .register_raw("B", "Orders.Placed", Some("other".into()), noop)
            .register_raw("C", "orders.placed.v2", Some("third".into()), noop);

        let selector = DefaultConsumerSelector::new(&registry, &SelectorOptions::default()).unwrap();
        let best = selector.select_best_candidate("orders.placed", selector.select_candidates());

        assert_eq!(best.len(), 1);
        assert_eq!(best[0].impl_type, "A");
    }

    #[test]
    fn duplicate_topic_group_is_rejected_by_default() {
        let mut registry = ConsumerRegistry::new();
        registry
            .register_raw("A", "orders.placed", None, noop)
            .register_raw("B", "orders.placed", None, noop);

        let err = DefaultConsumerSelector::new(&registry, &SelectorOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            SelectorError::DuplicateConsumer { existing: "A", duplicate: "B", .. }
        ));
    }

    #[test]
    fn last_registration_wins_when_configured() {
        let mut registry = ConsumerRegistry::new();
        registry
            .register_raw("A", "orders.placed", None, noop)
            .register_raw("B", "orders.placed", None, noop);

        let options =
            SelectorOptions::default().with_duplicate_policy(DuplicateConsumerPolicy::LastRegistrationWins);
        let selector = DefaultConsumerSelector::new(&registry, &options).unwrap();

        assert_eq!(selector.select_candidates().len(), 1);
        assert_eq!(selector.select_candidates()[0].impl_type, "B");
    }

    #[test]
    fn distinct_groups_are_separate_targets() {
        let mut registry = ConsumerRegistry::new();
        registry
            .register_raw("Billing", "orders.placed", Some("billing".into()), noop)
            .register_raw("Shipping", "orders.placed", Some("shipping".into()), noop);

        let selector = DefaultConsumerSelector::new(&registry, &SelectorOptions::default()).unwrap();
        assert_eq!(
            selector.groups_for("orders.placed"),
            vec!["billing.v1".to_string(), "shipping.v1".to_string()]
        );
        assert_eq!(selector.topics(), vec!["orders.placed".to_string()]);
    }

    #[test]
    fn groups_are_distinct_and_ordered() {
        let mut registry = ConsumerRegistry::new();
        registry
            .register_raw("Shipping", "orders.placed", Some("shipping".into()), noop)
            .register_raw("Audit", "orders.cancelled", Some("audit".into()), noop)
            .register_raw("Billing", "orders.placed", Some("billing".into()), noop)
            .register_raw("Audit", "orders.placed", Some("audit".into()), noop);

        let selector = DefaultConsumerSelector::new(&registry, &SelectorOptions::default()).unwrap();
        assert_eq!(
            selector.groups_for("orders.placed"),
            vec!["audit.v1".to_string(), "billing.v1".to_string(), "shipping.v1".to_string()]
        );
    }
}
