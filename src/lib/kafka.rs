//! Thin wrappers around the Kafka client.
//!
//! The rest of the server never touches rdkafka types directly: producers
//! are fire-and-forget byte sinks, the job consumer is a polled byte source
//! with an explicit fatal-error classification.

use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message as _;
use rdkafka::producer::{BaseRecord, DefaultProducerContext, Producer, ThreadedProducer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset, TopicPartitionList};
use tracing::warn;

use crate::error::SserverResult;

/// Producer option sets per stream, mirroring their delivery requirements:
/// the share log can buffer aggressively, solved shares must leave the
/// process immediately, common events sit in between.
pub const SHARE_LOG_OPTIONS: &[(&str, &str)] = &[
    ("queue.buffering.max.messages", "10000000"),
    ("queue.buffering.max.ms", "1000"),
    ("batch.num.messages", "10000"),
];

pub const SOLVED_SHARE_OPTIONS: &[(&str, &str)] = &[
    // 0 is an illegal value here; 1 delivers as soon as possible
    ("queue.buffering.max.ms", "1"),
];

pub const COMMON_EVENTS_OPTIONS: &[(&str, &str)] = &[
    ("queue.buffering.max.messages", "500000"),
    ("queue.buffering.max.ms", "1000"),
    ("batch.num.messages", "10000"),
];

/// Fire-and-forget producer bound to a single topic.
pub struct KafkaProducer {
    inner: ThreadedProducer<DefaultProducerContext>,
    topic: String,
}

impl KafkaProducer {
    pub fn new(brokers: &str, topic: &str, options: &[(&str, &str)]) -> SserverResult<Self> {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", brokers);
        for (key, value) in options {
            config.set(*key, *value);
        }
        let inner: ThreadedProducer<DefaultProducerContext> = config.create()?;
        Ok(Self {
            inner,
            topic: topic.to_string(),
        })
    }

    /// Confirms the topic is reachable; used at setup so a misconfigured
    /// broker refuses to start instead of silently dropping messages.
    pub fn check_alive(&self, timeout: Duration) -> SserverResult<()> {
        self.inner
            .client()
            .fetch_metadata(Some(&self.topic), timeout)?;
        Ok(())
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Queues a payload for delivery. Queue-full and other client errors are
    /// logged and the payload dropped; share submission is at-least-once.
    pub fn produce(&self, payload: &[u8]) {
        let record = BaseRecord::<(), [u8]>::to(&self.topic).payload(payload);
        if let Err((e, _)) = self.inner.send(record) {
            warn!("kafka produce to `{}` failed: {}", self.topic, e);
        }
    }

    pub fn flush(&self, timeout: Duration) {
        if let Err(e) = self.inner.flush(timeout) {
            warn!("kafka flush of `{}` failed: {}", self.topic, e);
        }
    }
}

/// Consumer for the inbound job topic, pinned to one partition and starting
/// from the newest message.
pub struct JobConsumer {
    inner: StreamConsumer,
    topic: String,
}

impl JobConsumer {
    pub fn new(brokers: &str, topic: &str, partition: i32) -> SserverResult<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", format!("sserver-{}", topic))
            .set("enable.auto.commit", "false")
            .set("fetch.wait.max.ms", "10")
            .create()?;

        // we only need the latest job; history is useless to a miner
        let mut assignment = TopicPartitionList::new();
        assignment.add_partition_offset(topic, partition, Offset::OffsetTail(1))?;
        consumer.assign(&assignment)?;

        Ok(Self {
            inner: consumer,
            topic: topic.to_string(),
        })
    }

    pub fn check_alive(&self, timeout: Duration) -> SserverResult<()> {
        self.inner
            .client()
            .fetch_metadata(Some(&self.topic), timeout)?;
        Ok(())
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Polls for one message. `None` on timeout, `Some(Ok(payload))` on a
    /// message, `Some(Err(_))` on a receive error.
    pub async fn poll(&self, timeout: Duration) -> Option<Result<Vec<u8>, KafkaError>> {
        match tokio::time::timeout(timeout, self.inner.recv()).await {
            Err(_) => None,
            Ok(Ok(message)) => Some(Ok(message.payload().unwrap_or_default().to_vec())),
            Ok(Err(e)) => Some(Err(e)),
        }
    }

    /// An unknown topic or partition is a configuration bug: crashing beats
    /// silently never notifying miners again.
    pub fn is_fatal(e: &KafkaError) -> bool {
        matches!(
            e,
            KafkaError::MessageConsumption(RDKafkaErrorCode::UnknownPartition)
                | KafkaError::MessageConsumption(RDKafkaErrorCode::UnknownTopic)
        )
    }
}
