// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Celery AMQP Broker
//!
//! `BrokerError` is what every public operation of this crate returns. Variants are
//! grouped into setup failures (connection, channel and topology), per-message
//! failures (decode, ack) and control-flow outcomes (cancellation, timeout), and the
//! classification helpers let a consuming loop tell them apart without matching on
//! every variant.
//!
//! `ChannelError` is the narrower error of the `AmqpChannel` capability, mapped from
//! `lapin::Error` so that provisioning and consuming logic can be exercised against
//! a fake channel.

use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use thiserror::Error;

/// Represents errors that can occur while talking to the broker through a channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The broker refused a declaration whose arguments differ from the existing entity
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The referenced exchange or queue does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The channel or its connection is no longer usable
    #[error("channel closed: {0}")]
    Closed(String),

    /// Any other protocol level failure
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<lapin::Error> for ChannelError {
    fn from(err: lapin::Error) -> Self {
        match &err {
            lapin::Error::ProtocolError(amqp) => match amqp.kind() {
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                    ChannelError::PreconditionFailed(amqp.to_string())
                }
                AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => {
                    ChannelError::NotFound(amqp.to_string())
                }
                _ => ChannelError::Protocol(amqp.to_string()),
            },
            lapin::Error::InvalidChannelState(_)
            | lapin::Error::InvalidConnectionState(_)
            | lapin::Error::IOError(_) => ChannelError::Closed(err.to_string()),
            _ => ChannelError::Protocol(err.to_string()),
        }
    }
}

/// Represents errors that can occur during broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker configuration holds values that cannot be used
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Error establishing a connection to the broker, or losing it while consuming
    #[error("failure to connect: {0}")]
    Connection(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    Channel(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare exchange `{name}`: {source}")]
    DeclareExchange { name: String, source: ChannelError },

    /// Error declaring a queue with the given name
    #[error("failure to declare queue `{name}`: {source}")]
    DeclareQueue { name: String, source: ChannelError },

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{queue}` to exchange `{exchange}`: {source}")]
    BindQueue {
        queue: String,
        exchange: String,
        source: ChannelError,
    },

    /// An entity was redeclared with parameters that differ from its first declaration
    #[error("`{0}` is already declared with different parameters")]
    TopologyMismatch(String),

    /// Error configuring the prefetch window
    #[error("failure to configure qos: {0}")]
    Qos(String),

    /// A subscription is already active on this consumer
    #[error("a subscription is already active on queue `{0}`")]
    AlreadySubscribed(String),

    /// Error opening or cancelling a subscription
    #[error("failure to subscribe to queue `{queue}`: {source}")]
    Subscription { queue: String, source: ChannelError },

    /// No subscription is active
    #[error("consumer is not subscribed")]
    NotConsuming,

    /// The delivery body is not a valid task message
    #[error("failure to decode task message: {0}")]
    Decode(String),

    /// The task message could not be serialized
    #[error("failure to encode task message: {0}")]
    Encode(String),

    /// Error acknowledging a delivery
    #[error("failure to ack delivery `{0}`")]
    Ack(u64),

    /// Error negative-acknowledging a delivery
    #[error("failure to nack delivery `{0}`")]
    Nack(u64),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    Publishing(String),

    /// The operation is not provided by this broker
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The wait for a delivery was cancelled by the caller
    #[error("receive cancelled")]
    Cancelled,

    /// No delivery arrived within the configured receive timeout
    #[error("receive timed out")]
    Timeout,
}

impl BrokerError {
    /// Failures raised while connecting, provisioning or subscribing.
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            BrokerError::InvalidConfig(_)
                | BrokerError::Connection(_)
                | BrokerError::Channel(_)
                | BrokerError::DeclareExchange { .. }
                | BrokerError::DeclareQueue { .. }
                | BrokerError::BindQueue { .. }
                | BrokerError::TopologyMismatch(_)
                | BrokerError::Qos(_)
                | BrokerError::AlreadySubscribed(_)
                | BrokerError::Subscription { .. }
        )
    }

    /// Failures scoped to a single delivery. The subscription stays usable.
    pub fn is_message_failure(&self) -> bool {
        matches!(
            self,
            BrokerError::Decode(_) | BrokerError::Ack(_) | BrokerError::Nack(_)
        )
    }

    /// Failures after which the channel has to be rebuilt.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, BrokerError::Connection(_) | BrokerError::Channel(_))
    }
}
