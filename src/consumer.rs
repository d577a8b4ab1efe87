// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Task Queue Consumer
//!
//! Holds the single subscription of a broker instance and hands out deliveries one at
//! a time. `next` is the only place where a caller waits for the network; it can be
//! bounded by a timeout and interrupted through a `CancellationToken`.
//!
//! Under `AckPolicy::Immediate` a delivery is acknowledged as soon as it is pulled,
//! before anyone looked at its body. Under `AckPolicy::AfterDecode` the caller settles
//! it with `ack` or `reject`.

use crate::{
    channel::{AmqpChannel, Delivery, DeliveryStream},
    config::AckPolicy,
    errors::BrokerError,
};
use futures_util::StreamExt;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

struct Subscription {
    queue: String,
    consumer_tag: String,
    stream: DeliveryStream,
}

pub struct TaskConsumer {
    channel: Arc<dyn AmqpChannel>,
    ack_policy: AckPolicy,
    subscription: Option<Subscription>,
    unacked: usize,
}

impl TaskConsumer {
    pub fn new(channel: Arc<dyn AmqpChannel>, ack_policy: AckPolicy) -> TaskConsumer {
        TaskConsumer {
            channel,
            ack_policy,
            subscription: None,
            unacked: 0,
        }
    }

    /// Opens the subscription on `queue`. Fails if one is already active.
    pub async fn subscribe(&mut self, queue: &str) -> Result<(), BrokerError> {
        if let Some(active) = &self.subscription {
            warn!(queue = active.queue, "subscription already active");
            return Err(BrokerError::AlreadySubscribed(active.queue.clone()));
        }

        let consumer_tag = format!("celery-rabbitmq-{}", Uuid::new_v4());

        let stream = match self.channel.consume(queue, &consumer_tag).await {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to create the consumer");
                Err(BrokerError::Subscription {
                    queue: queue.to_owned(),
                    source: err,
                })
            }
            Ok(s) => Ok(s),
        }?;

        debug!(queue, consumer_tag, "subscription opened");

        self.subscription = Some(Subscription {
            queue: queue.to_owned(),
            consumer_tag,
            stream,
        });
        self.unacked = 0;

        Ok(())
    }

    /// Waits for the next delivery.
    ///
    /// A failed or exhausted delivery stream ends the subscription and is reported as
    /// `BrokerError::Connection`.
    pub async fn next(
        &mut self,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<Delivery, BrokerError> {
        let subscription = self.subscription.as_mut().ok_or(BrokerError::NotConsuming)?;

        let pull = async {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, subscription.stream.next())
                    .await
                    .map_err(|_| BrokerError::Timeout),
                None => Ok(subscription.stream.next().await),
            }
        };

        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
            item = pull => item?,
        };

        match item {
            Some(Ok(delivery)) => {
                self.unacked += 1;
                debug!(
                    delivery_tag = delivery.delivery_tag,
                    redelivered = delivery.redelivered,
                    "delivery received"
                );

                if self.ack_policy == AckPolicy::Immediate {
                    if let Err(err) = self.ack(&delivery).await {
                        // the delivery is not handed out, so it is not in flight either
                        self.unacked = self.unacked.saturating_sub(1);
                        return Err(err);
                    }
                }

                Ok(delivery)
            }
            Some(Err(err)) => {
                error!(error = err.to_string(), "errors consume msg");
                self.subscription = None;
                Err(BrokerError::Connection(err.to_string()))
            }
            None => {
                warn!("delivery stream closed by the broker");
                self.subscription = None;
                Err(BrokerError::Connection("delivery stream closed".to_owned()))
            }
        }
    }

    pub async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        if let Err(err) = self.channel.ack(delivery.delivery_tag).await {
            error!(error = err.to_string(), "error whiling ack msg");
            return Err(BrokerError::Ack(delivery.delivery_tag));
        }

        self.unacked = self.unacked.saturating_sub(1);
        Ok(())
    }

    /// Negative-acknowledges a delivery. Without `requeue` the broker dead-letters it
    /// when the queue has a DLQ and drops it otherwise.
    pub async fn reject(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        if let Err(err) = self.channel.nack(delivery.delivery_tag, requeue).await {
            error!(error = err.to_string(), "error whiling nack msg");
            return Err(BrokerError::Nack(delivery.delivery_tag));
        }

        self.unacked = self.unacked.saturating_sub(1);
        Ok(())
    }

    /// Cancels the active subscription, if any.
    pub async fn unsubscribe(&mut self) -> Result<(), BrokerError> {
        let Some(subscription) = self.subscription.take() else {
            return Ok(());
        };

        let result = self.channel.cancel(&subscription.consumer_tag).await;

        match result {
            Err(err) => {
                error!(error = err.to_string(), "error to cancel the consumer");
                Err(BrokerError::Subscription {
                    queue: subscription.queue,
                    source: err,
                })
            }
            _ => {
                debug!(queue = subscription.queue, "subscription cancelled");
                Ok(())
            }
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// Deliveries handed out and not settled yet.
    pub fn unacked(&self) -> usize {
        self.unacked
    }

    pub fn ack_policy(&self) -> AckPolicy {
        self.ack_policy
    }
}
