//! Wiring: builds the publisher, receive path and background workers from a
//! store, a transport and the consumer registrations.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use courier_core::CoreError;
use courier_messaging::{
    ConsumerRegistry, DefaultConsumerSelector, Dispatcher, JsonSerializer, SelectorOptions,
    Serializer, Transport, TransportSubscription,
};

use crate::config::CourierOptions;
use crate::jobs::{CronEvaluator, JobRunner, JobScheduler, JobStore, SchedulerConfig};
use crate::message_store::MessageStore;
use crate::outbox::MessagePublisher;
use crate::receiver::ReceiveExecutor;
use crate::sender::MessageSender;
use crate::workers::{
    DelayedPromoter, ExpiryCollector, RetryReaper, SchedulerWorker, WorkerHandle, spawn_periodic,
};

struct SchedulerParts {
    store: Arc<dyn JobStore>,
    cron: Arc<dyn CronEvaluator>,
    runner: Arc<dyn JobRunner>,
}

/// Builder for a [`Courier`].
pub struct CourierBuilder<S: MessageStore + 'static> {
    options: CourierOptions,
    store: Arc<S>,
    transport: Arc<dyn Transport>,
    serializer: Arc<dyn Serializer>,
    registry: ConsumerRegistry,
    selector_options: Option<SelectorOptions>,
    scheduler: Option<SchedulerParts>,
}

impl<S: MessageStore + 'static> CourierBuilder<S> {
    pub fn new(options: CourierOptions, store: Arc<S>, transport: Arc<dyn Transport>) -> Self {
        Self {
            options,
            store,
            transport,
            serializer: Arc::new(JsonSerializer),
            registry: ConsumerRegistry::new(),
            selector_options: None,
            scheduler: None,
        }
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_consumers(mut self, registry: ConsumerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Override routing options. Defaults come from [`CourierOptions::selector_options`].
    pub fn with_selector_options(mut self, options: SelectorOptions) -> Self {
        self.selector_options = Some(options);
        self
    }

    pub fn with_scheduler(
        mut self,
        store: Arc<dyn JobStore>,
        cron: Arc<dyn CronEvaluator>,
        runner: Arc<dyn JobRunner>,
    ) -> Self {
        self.scheduler = Some(SchedulerParts { store, cron, runner });
        self
    }

    /// Validate options and consumer routing, then assemble the components.
    pub fn build(self) -> Result<Courier<S>, CoreError> {
        self.options.validate()?;

        let selector_options = self
            .selector_options
            .unwrap_or_else(|| self.options.selector_options());
        let selector = DefaultConsumerSelector::new(&self.registry, &selector_options)
            .map_err(|e| CoreError::configuration(e.to_string()))?;
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(selector), Arc::new(self.registry)));

        let sender = Arc::new(MessageSender::new(
            self.store.clone(),
            self.transport,
            self.options.clone(),
        ));
        let publisher = Arc::new(MessagePublisher::new(self.store.clone(), sender.clone()));
        let receiver = Arc::new(ReceiveExecutor::new(
            self.store.clone(),
            self.serializer,
            dispatcher,
            self.options.clone(),
        ));

        Ok(Courier {
            options: self.options,
            store: self.store,
            sender,
            publisher,
            receiver,
            scheduler: self.scheduler,
        })
    }
}

/// An assembled engine.
pub struct Courier<S: MessageStore + 'static> {
    options: CourierOptions,
    store: Arc<S>,
    sender: Arc<MessageSender<S>>,
    publisher: Arc<MessagePublisher<S>>,
    receiver: Arc<ReceiveExecutor<S>>,
    scheduler: Option<SchedulerParts>,
}

impl<S: MessageStore + 'static> Courier<S> {
    pub fn builder(options: CourierOptions, store: Arc<S>, transport: Arc<dyn Transport>) -> CourierBuilder<S> {
        CourierBuilder::new(options, store, transport)
    }

    pub fn options(&self) -> &CourierOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn sender(&self) -> &Arc<MessageSender<S>> {
        &self.sender
    }

    pub fn publisher(&self) -> &Arc<MessagePublisher<S>> {
        &self.publisher
    }

    pub fn receiver(&self) -> &Arc<ReceiveExecutor<S>> {
        &self.receiver
    }

    /// Spawn the reaper, collector, promoter and (if configured) scheduler
    /// loops on the current tokio runtime.
    pub fn start(&self) -> WorkerHandle {
        let cancel = CancellationToken::new();
        let mut handle = WorkerHandle::new(cancel.clone());
        let options = &self.options;

        let reaper = RetryReaper::new(
            self.store.clone(),
            self.sender.clone(),
            self.receiver.clone(),
            options.clone(),
        );
        handle.push(spawn_periodic(Arc::new(reaper), options.failed_retry_interval, cancel.clone()));

        let promoter = DelayedPromoter::new(self.store.clone(), self.sender.clone(), options.clone());
        handle.push(spawn_periodic(Arc::new(promoter), options.delayed_poll_interval, cancel.clone()));

        let mut collector = ExpiryCollector::new(self.store.clone(), options.clone());
        if let Some(parts) = &self.scheduler {
            collector = collector.with_job_store(parts.store.clone());

            let scheduler = JobScheduler::new(
                parts.store.clone(),
                parts.cron.clone(),
                parts.runner.clone(),
                SchedulerConfig::from_options(options),
            );
            handle.push(spawn_periodic(
                Arc::new(SchedulerWorker::new(scheduler)),
                options.scheduler_poll_interval,
                cancel.clone(),
            ));
        }
        handle.push(spawn_periodic(
            Arc::new(collector),
            options.collector_cleaning_interval,
            cancel,
        ));

        info!(
            workers = handle.len(),
            instance = %options.instance_id,
            storage_lock = options.use_storage_lock,
            "courier workers started"
        );
        handle
    }

    /// Feed messages from `subscription` into the receive path until the
    /// subscription closes or `handle` is shut down.
    pub fn attach(&self, mut subscription: TransportSubscription, handle: &mut WorkerHandle) {
        let receiver = self.receiver.clone();
        let cancel = handle.cancellation_token().clone();

        handle.push(tokio::spawn(async move {
            loop {
                let raw = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = subscription.recv() => match next {
                        Some(raw) => raw,
                        None => break,
                    },
                };
                let topic = raw.topic.clone();
                if let Err(err) = receiver.on_message(raw, &cancel).await {
                    warn!(topic = %topic, error = %err, "failed to store inbound message");
                }
            }
        }));
    }
}
