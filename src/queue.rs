// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Configuration
//!
//! The queue workers consume tasks from. It can optionally carry a Dead Letter Queue
//! (DLQ), which receives deliveries the consumer rejects when decoding fails under
//! `AckPolicy::AfterDecode`.

use lapin::{
    options::QueueDeclareOptions,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Name of the queue declared when none is configured
pub const DEFAULT_QUEUE_NAME: &str = "celery";
/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";

/// Definition of the task queue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) dead_letter: bool,
}

impl Default for QueueConfig {
    /// A durable, non auto-delete queue named `celery`.
    fn default() -> Self {
        QueueConfig {
            name: DEFAULT_QUEUE_NAME.to_owned(),
            durable: true,
            auto_delete: false,
            dead_letter: false,
        }
    }
}

impl QueueConfig {
    /// Creates a queue definition with the given name and the default flags.
    pub fn new(name: &str) -> QueueConfig {
        QueueConfig {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Sets whether the queue survives broker restarts.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Sets whether the queue is removed once its last consumer goes away.
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// Adds a Dead Letter Queue named after the main queue with a "-dlq" suffix.
    pub fn with_dlq(mut self) -> Self {
        self.dead_letter = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn dlq_name(&self) -> Option<String> {
        self.dead_letter.then(|| format!("{}-dlq", self.name))
    }

    pub(crate) fn declare_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: false,
            durable: self.durable,
            exclusive: false,
            auto_delete: self.auto_delete,
            nowait: false,
        }
    }

    /// Arguments of the main queue: dead lettering through the default exchange
    /// straight into the DLQ when one is configured.
    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();

        if let Some(dlq_name) = self.dlq_name() {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from("")),
            );
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(dlq_name)),
            );
        }

        FieldTable::from(args)
    }
}
