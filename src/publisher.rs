// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Task Message Publisher
//!
//! Producer side of the task queue. Messages are published persistently to the
//! configured exchange with the queue name as routing key, as JSON, with the current
//! OpenTelemetry context in their headers.
//!
//! The consuming broker (`AmqpCeleryBroker`) does not publish; producers own a
//! `TaskPublisher` on a channel of their own.

use crate::{
    channel::{AmqpChannel, Connector},
    codec::{self, TaskMessage, CONTENT_ENCODING, CONTENT_TYPE},
    config::BrokerConfig,
    errors::BrokerError,
    exchange::ExchangeConfig,
    otel,
    queue::QueueConfig,
};
use lapin::{
    types::{FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use std::sync::Arc;
use tracing::{debug, error};

/// AMQP delivery mode of messages that survive a broker restart
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

pub struct TaskPublisher {
    channel: Arc<dyn AmqpChannel>,
    exchange: ExchangeConfig,
    queue: QueueConfig,
}

impl TaskPublisher {
    pub fn new(channel: Arc<dyn AmqpChannel>, exchange: ExchangeConfig, queue: QueueConfig) -> Self {
        TaskPublisher {
            channel,
            exchange,
            queue,
        }
    }

    /// Opens a dedicated channel for publishing to the topology of `config`.
    pub async fn connect(
        config: &BrokerConfig,
        connector: &dyn Connector,
    ) -> Result<Self, BrokerError> {
        let channel = connector
            .connect(&config.address, &config.connection_name)
            .await?;

        Ok(TaskPublisher::new(
            channel,
            config.exchange.clone(),
            config.queue.clone(),
        ))
    }

    pub async fn publish(&self, ctx: &Context, message: &TaskMessage) -> Result<(), BrokerError> {
        let body = codec::encode(message)?;

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(CONTENT_TYPE))
            .with_content_encoding(ShortString::from(CONTENT_ENCODING))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_message_id(ShortString::from(message.id.clone()))
            .with_correlation_id(ShortString::from(message.id.clone()))
            .with_headers(FieldTable::from(otel::inject(ctx)));

        match self
            .channel
            .publish(&self.exchange.name, &self.queue.name, body, properties)
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(BrokerError::Publishing(err.to_string()))
            }
            _ => {
                debug!(id = message.id, task = message.task, "task message published");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{channel::MockAmqpChannel, errors::ChannelError};
    use serde_json::json;

    #[tokio::test]
    async fn publishes_persistent_json_routed_by_queue_name() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_publish()
            .withf(|exchange, routing_key, payload, props| {
                let decoded = codec::decode(payload).unwrap();
                exchange == "default"
                    && routing_key == "celery"
                    && decoded.id == "abc"
                    && decoded.args == vec![json!(1), json!(2)]
                    && *props.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE)
                    && props.content_type().as_ref().map(|c| c.as_str()) == Some(CONTENT_TYPE)
                    && props.message_id().as_ref().map(|c| c.as_str()) == Some("abc")
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let publisher = TaskPublisher::new(
            Arc::new(channel),
            ExchangeConfig::default(),
            QueueConfig::default(),
        );

        let message = TaskMessage::new("add")
            .with_id("abc")
            .with_args(vec![json!(1), json!(2)]);
        publisher.publish(&Context::new(), &message).await.unwrap();
    }

    #[tokio::test]
    async fn publish_failure_is_reported() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_publish()
            .returning(|_, _, _, _| Err(ChannelError::Closed("connection reset".to_owned())));

        let publisher = TaskPublisher::new(
            Arc::new(channel),
            ExchangeConfig::default(),
            QueueConfig::default(),
        );

        assert!(matches!(
            publisher
                .publish(&Context::new(), &TaskMessage::new("add"))
                .await,
            Err(BrokerError::Publishing(_))
        ));
    }
}
