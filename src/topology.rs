// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Topology Provisioning
//!
//! Declares the exchange and queue tasks flow through, binds them, and sets the
//! prefetch window of the channel.
//!
//! Declarations are idempotent. `AmqpTopology` remembers what it already declared on
//! its channel: an identical redeclaration returns immediately, while a
//! redeclaration with different flags is rejected with
//! `BrokerError::TopologyMismatch` instead of being forwarded to the broker. Entities
//! that already exist on the broker with other flags come back from the broker as a
//! `PRECONDITION_FAILED`, surfaced as `ChannelError::PreconditionFailed` inside the
//! declare error.

use crate::{
    channel::AmqpChannel,
    config::BrokerConfig,
    errors::BrokerError,
    exchange::ExchangeConfig,
    queue::QueueConfig,
};
use lapin::types::FieldTable;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, error};

/// Declares topology on a single channel and tracks what has been declared on it.
pub struct AmqpTopology {
    channel: Arc<dyn AmqpChannel>,
    exchanges: HashMap<String, ExchangeConfig>,
    queues: HashMap<String, QueueConfig>,
    bindings: HashSet<(String, String)>,
    prefetch: Option<u16>,
}

impl AmqpTopology {
    pub fn new(channel: Arc<dyn AmqpChannel>) -> AmqpTopology {
        AmqpTopology {
            channel,
            exchanges: HashMap::default(),
            queues: HashMap::default(),
            bindings: HashSet::default(),
            prefetch: None,
        }
    }

    /// Provisions everything a consumer of `cfg` needs, in order: exchange, queue
    /// (and its DLQ), binding, prefetch.
    pub async fn install(&mut self, cfg: &BrokerConfig) -> Result<(), BrokerError> {
        self.declare_exchange(&cfg.exchange).await?;
        self.declare_queue(&cfg.queue).await?;
        self.bind_queue(&cfg.queue, &cfg.exchange).await?;
        self.set_prefetch(cfg.prefetch).await
    }

    pub async fn declare_exchange(&mut self, def: &ExchangeConfig) -> Result<(), BrokerError> {
        if let Some(declared) = self.exchanges.get(&def.name) {
            return if declared == def {
                debug!("exchange: {} already declared", def.name);
                Ok(())
            } else {
                error!(name = def.name, "exchange redeclared with different parameters");
                Err(BrokerError::TopologyMismatch(def.name.clone()))
            };
        }

        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .declare_exchange(&def.name, def.kind, def.declare_options())
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                Err(BrokerError::DeclareExchange {
                    name: def.name.clone(),
                    source: err,
                })
            }
            _ => Ok(()),
        }?;

        self.exchanges.insert(def.name.clone(), def.clone());
        debug!("exchange: {} was created", def.name);

        Ok(())
    }

    pub async fn declare_queue(&mut self, def: &QueueConfig) -> Result<(), BrokerError> {
        if let Some(declared) = self.queues.get(&def.name) {
            return if declared == def {
                debug!("queue: {} already declared", def.name);
                Ok(())
            } else {
                error!(name = def.name, "queue redeclared with different parameters");
                Err(BrokerError::TopologyMismatch(def.name.clone()))
            };
        }

        if let Some(dlq_name) = def.dlq_name() {
            self.declare(&dlq_name, def, FieldTable::default()).await?;
        }

        self.declare(&def.name, def, def.arguments()).await?;

        self.queues.insert(def.name.clone(), def.clone());
        Ok(())
    }

    async fn declare(
        &self,
        name: &str,
        def: &QueueConfig,
        arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        debug!("creating queue: {}", name);

        match self
            .channel
            .declare_queue(name, def.declare_options(), arguments)
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name, "error to declare the queue");
                Err(BrokerError::DeclareQueue {
                    name: name.to_owned(),
                    source: err,
                })
            }
            _ => {
                debug!("queue: {} was created", name);
                Ok(())
            }
        }
    }

    /// Binds `queue` to `exchange` with the queue name as routing key.
    pub async fn bind_queue(
        &mut self,
        queue: &QueueConfig,
        exchange: &ExchangeConfig,
    ) -> Result<(), BrokerError> {
        let key = (queue.name.clone(), exchange.name.clone());
        if self.bindings.contains(&key) {
            return Ok(());
        }

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue.name, exchange.name, queue.name
        );

        match self
            .channel
            .bind_queue(&queue.name, &exchange.name, &queue.name)
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(BrokerError::BindQueue {
                    queue: queue.name.clone(),
                    exchange: exchange.name.clone(),
                    source: err,
                })
            }
            _ => Ok(()),
        }?;

        self.bindings.insert(key);
        Ok(())
    }

    /// Sets how many unacknowledged deliveries the broker may push to this channel.
    pub async fn set_prefetch(&mut self, count: u16) -> Result<(), BrokerError> {
        // zero means "unlimited" to the broker
        if count == 0 {
            return Err(BrokerError::Qos("prefetch count must be positive".to_owned()));
        }

        if self.prefetch == Some(count) {
            return Ok(());
        }

        if let Err(err) = self.channel.set_prefetch(count).await {
            error!(error = err.to_string(), count, "error to configure qos");
            return Err(BrokerError::Qos(err.to_string()));
        }

        debug!("prefetch set to {}", count);
        self.prefetch = Some(count);
        Ok(())
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.prefetch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::MockAmqpChannel,
        errors::ChannelError,
        exchange::ExchangeKind,
        queue::AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
    };
    use mockall::Sequence;

    #[tokio::test]
    async fn install_declares_default_topology_in_order() {
        let mut channel = MockAmqpChannel::new();
        let mut seq = Sequence::new();

        channel
            .expect_declare_exchange()
            .withf(|name, kind, opts| {
                name == "default" && *kind == ExchangeKind::Direct && opts.durable && opts.auto_delete
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        channel
            .expect_declare_queue()
            .withf(|name, opts, args| {
                name == "celery" && opts.durable && !opts.auto_delete && args.inner().is_empty()
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        channel
            .expect_bind_queue()
            .withf(|queue, exchange, key| queue == "celery" && exchange == "default" && key == "celery")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        channel
            .expect_set_prefetch()
            .withf(|count| *count == 4)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let mut topology = AmqpTopology::new(Arc::new(channel));
        topology.install(&BrokerConfig::default()).await.unwrap();
        assert_eq!(topology.prefetch(), Some(4));
    }

    #[tokio::test]
    async fn identical_redeclare_is_a_no_op() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_exchange()
            .times(1)
            .returning(|_, _, _| Ok(()));
        channel
            .expect_declare_queue()
            .times(1)
            .returning(|_, _, _| Ok(()));
        channel.expect_set_prefetch().times(1).returning(|_| Ok(()));

        let mut topology = AmqpTopology::new(Arc::new(channel));
        let exchange = ExchangeConfig::default();
        let queue = QueueConfig::default();

        topology.declare_exchange(&exchange).await.unwrap();
        topology.declare_exchange(&exchange.clone()).await.unwrap();
        topology.declare_queue(&queue).await.unwrap();
        topology.declare_queue(&QueueConfig::new("celery")).await.unwrap();
        topology.set_prefetch(4).await.unwrap();
        topology.set_prefetch(4).await.unwrap();
    }

    #[tokio::test]
    async fn mismatched_redeclare_is_rejected() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_exchange()
            .times(1)
            .returning(|_, _, _| Ok(()));
        channel
            .expect_declare_queue()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut topology = AmqpTopology::new(Arc::new(channel));
        topology.declare_exchange(&ExchangeConfig::default()).await.unwrap();
        topology.declare_queue(&QueueConfig::default()).await.unwrap();

        assert_eq!(
            topology
                .declare_exchange(&ExchangeConfig::default().auto_delete(false))
                .await,
            Err(BrokerError::TopologyMismatch("default".to_owned()))
        );
        assert_eq!(
            topology
                .declare_exchange(&ExchangeConfig::default().kind(ExchangeKind::Fanout))
                .await,
            Err(BrokerError::TopologyMismatch("default".to_owned()))
        );
        assert_eq!(
            topology
                .declare_queue(&QueueConfig::default().durable(false))
                .await,
            Err(BrokerError::TopologyMismatch("celery".to_owned()))
        );
    }

    #[tokio::test]
    async fn broker_precondition_failure_is_surfaced() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_declare_queue().times(1).returning(|_, _, _| {
            Err(ChannelError::PreconditionFailed(
                "inequivalent arg 'durable'".to_owned(),
            ))
        });

        let mut topology = AmqpTopology::new(Arc::new(channel));
        let err = topology.declare_queue(&QueueConfig::default()).await.unwrap_err();

        assert!(matches!(
            err,
            BrokerError::DeclareQueue {
                ref name,
                source: ChannelError::PreconditionFailed(_),
            } if name == "celery"
        ));
        assert!(err.is_setup_failure());
    }

    #[tokio::test]
    async fn dlq_is_declared_before_the_main_queue() {
        let mut channel = MockAmqpChannel::new();
        let mut seq = Sequence::new();

        channel
            .expect_declare_queue()
            .withf(|name, _, args| name == "tasks-dlq" && args.inner().is_empty())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        channel
            .expect_declare_queue()
            .withf(|name, _, args| {
                name == "tasks" && args.inner().contains_key(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        let mut topology = AmqpTopology::new(Arc::new(channel));
        topology
            .declare_queue(&QueueConfig::new("tasks").with_dlq())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn zero_prefetch_is_rejected() {
        let channel = MockAmqpChannel::new();
        let mut topology = AmqpTopology::new(Arc::new(channel));

        assert!(matches!(
            topology.set_prefetch(0).await,
            Err(BrokerError::Qos(_))
        ));
        assert_eq!(topology.prefetch(), None);
    }
}
