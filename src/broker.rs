// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Celery AMQP Broker
//!
//! `AmqpCeleryBroker` is the transport the task-queue client consumes from. Opening
//! it connects, provisions the topology and subscribes to the task queue; afterwards
//! `receive` pulls one delivery and decodes it into a `TaskMessage`.
//!
//! ```text
//! Uninitialized -> Connected -> Provisioned -> Consuming
//!                                                 |  ^
//!                                  connection loss v  | reconnect()
//!                                             Reconnecting
//! ```
//!
//! Setup failures are returned as typed errors; `open_with_retry` and `reconnect`
//! retry them with exponential backoff. Per-message failures (`Decode`) leave the
//! subscription untouched, so a consuming loop can log them and carry on.

use crate::{
    channel::{AmqpChannel, Connector, LapinConnector},
    codec::{self, TaskMessage},
    config::{AckPolicy, BrokerConfig},
    consumer::TaskConsumer,
    errors::{BrokerError, ChannelError},
    otel,
    topology::AmqpTopology,
};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
    KeyValue,
};
use std::{borrow::Cow, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Uninitialized,
    Connected,
    Provisioned,
    Consuming,
    Reconnecting,
    Closed,
}

pub struct AmqpCeleryBroker {
    config: BrokerConfig,
    connector: Arc<dyn Connector>,
    channel: Option<Arc<dyn AmqpChannel>>,
    consumer: Option<TaskConsumer>,
    state: BrokerState,
    cancel: CancellationToken,
    tracer: BoxedTracer,
}

impl AmqpCeleryBroker {
    /// A broker that has not touched the network yet.
    pub fn new(config: BrokerConfig, connector: Arc<dyn Connector>) -> Self {
        AmqpCeleryBroker {
            config,
            connector,
            channel: None,
            consumer: None,
            state: BrokerState::Uninitialized,
            cancel: CancellationToken::new(),
            tracer: global::tracer("amqp consumer"),
        }
    }

    /// Connects to `config.address` with lapin and starts consuming.
    pub async fn connect(config: BrokerConfig) -> Result<Self, BrokerError> {
        Self::open(config, Arc::new(LapinConnector)).await
    }

    /// Connects, provisions and subscribes once. The first failure is returned.
    pub async fn open(
        config: BrokerConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, BrokerError> {
        let mut broker = Self::new(config, connector);

        if let Err(err) = broker.establish().await {
            broker.release().await;
            return Err(err);
        }

        Ok(broker)
    }

    /// Like `open`, retrying transient setup failures according to `config.backoff`.
    pub async fn open_with_retry(
        config: BrokerConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, BrokerError> {
        let mut broker = Self::new(config, connector);
        broker.establish_with_backoff().await?;
        Ok(broker)
    }

    /// Pulls one delivery from the task queue and decodes it.
    pub async fn receive(&mut self) -> Result<TaskMessage, BrokerError> {
        let consumer = match (self.state, self.consumer.as_mut()) {
            (BrokerState::Consuming, Some(consumer)) => consumer,
            _ => return Err(BrokerError::NotConsuming),
        };

        let delivery = match consumer
            .next(&self.cancel, self.config.receive_timeout)
            .await
        {
            Ok(delivery) => delivery,
            Err(err) => {
                if err.is_connection_loss() {
                    warn!(error = err.to_string(), "lost the broker connection");
                    self.state = BrokerState::Reconnecting;
                }
                return Err(err);
            }
        };

        let (_ctx, mut span) = otel::new_span(&delivery.properties, &self.tracer, "celery receive");

        match codec::decode(&delivery.data) {
            Ok(message) => {
                if consumer.ack_policy() == AckPolicy::AfterDecode {
                    consumer.ack(&delivery).await?;
                }

                span.set_attribute(KeyValue::new("celery.task", message.task.clone()));
                span.set_attribute(KeyValue::new("celery.task_id", message.id.clone()));
                span.set_status(Status::Ok);

                debug!(id = message.id, task = message.task, "task message received");
                Ok(message)
            }
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("malformed task message"),
                });

                match consumer.ack_policy() {
                    AckPolicy::AfterDecode => {
                        warn!(
                            delivery_tag = delivery.delivery_tag,
                            "rejecting malformed task message"
                        );
                        if let Err(nack_err) = consumer.reject(&delivery, false).await {
                            error!(
                                error = nack_err.to_string(),
                                decode_error = err.to_string(),
                                "failure to reject malformed task message"
                            );
                        }
                    }
                    AckPolicy::Immediate => {
                        // already acknowledged, the broker will not redeliver it
                        warn!(
                            delivery_tag = delivery.delivery_tag,
                            "dropping malformed task message"
                        );
                    }
                }

                Err(err)
            }
        }
    }

    /// Publishing through the consuming broker is not provided; use a `TaskPublisher`.
    pub async fn send(&self, _message: &TaskMessage) -> Result<(), BrokerError> {
        Err(BrokerError::Unsupported(
            "publishing task messages through the consuming broker",
        ))
    }

    /// Rebuilds the connection, topology and subscription after a connection loss.
    pub async fn reconnect(&mut self) -> Result<(), BrokerError> {
        if self.state == BrokerState::Consuming {
            return Ok(());
        }

        self.release().await;
        self.state = BrokerState::Reconnecting;
        self.establish_with_backoff().await
    }

    /// Cancels the subscription and closes the connection.
    pub async fn close(&mut self) {
        self.release().await;
        self.state = BrokerState::Closed;
        info!("broker closed");
    }

    /// Token that, once cancelled, makes pending and future `receive` calls return
    /// `BrokerError::Cancelled`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> BrokerState {
        self.state
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Deliveries received and not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.consumer.as_ref().map_or(0, TaskConsumer::unacked)
    }

    async fn establish(&mut self) -> Result<(), BrokerError> {
        let channel = self
            .connector
            .connect(&self.config.address, &self.config.connection_name)
            .await?;
        self.channel = Some(channel.clone());
        self.state = BrokerState::Connected;
        debug!("broker connected");

        let mut topology = AmqpTopology::new(channel.clone());
        topology.install(&self.config).await?;
        self.state = BrokerState::Provisioned;
        debug!("broker topology provisioned");

        let mut consumer = TaskConsumer::new(channel, self.config.ack_policy);
        consumer.subscribe(&self.config.queue.name).await?;
        self.consumer = Some(consumer);
        self.state = BrokerState::Consuming;

        info!(
            queue = self.config.queue.name,
            prefetch = self.config.prefetch,
            "consuming task messages"
        );

        Ok(())
    }

    async fn establish_with_backoff(&mut self) -> Result<(), BrokerError> {
        if let Err(err) = self.config.backoff.validate() {
            error!(error = err.to_string(), "refusing to retry with this backoff");
            return Err(err);
        }

        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match self.establish().await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            self.release().await;

            if !is_retryable(&err) || !self.config.backoff.should_retry(attempt) {
                error!(error = err.to_string(), attempt, "giving up connecting to the broker");
                self.state = BrokerState::Uninitialized;
                return Err(err);
            }

            let delay = self.config.backoff.delay_for_attempt(attempt);
            warn!(
                error = err.to_string(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "broker setup failed, retrying"
            );
            self.state = BrokerState::Reconnecting;

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(BrokerError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Best effort teardown of the current subscription and channel.
    async fn release(&mut self) {
        if let Some(mut consumer) = self.consumer.take() {
            if let Err(err) = consumer.unsubscribe().await {
                debug!(error = err.to_string(), "consumer was already gone");
            }
        }

        if let Some(channel) = self.channel.take() {
            if let Err(err) = channel.close().await {
                debug!(error = err.to_string(), "channel was already closed");
            }
        }
    }
}

/// Setup failures worth another attempt: the network, not the configuration.
fn is_retryable(err: &BrokerError) -> bool {
    match err {
        BrokerError::Connection(_) | BrokerError::Channel(_) => true,
        BrokerError::DeclareExchange { source, .. }
        | BrokerError::DeclareQueue { source, .. }
        | BrokerError::BindQueue { source, .. }
        | BrokerError::Subscription { source, .. } => matches!(source, ChannelError::Closed(_)),
        _ => false,
    }
}
