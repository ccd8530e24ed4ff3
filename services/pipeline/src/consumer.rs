//! Kafka consumer wrapper for the capture pipeline.
//!
//! A [`ConsumerGroup`] runs several [`CaptureConsumer`] members in one Kafka
//! consumer group. The broker hands each partition to exactly one member, so
//! messages of a partition are handled in order while partitions progress
//! in parallel.
//!
//! Offsets are committed manually. A handler returning a retryable error
//! leaves the offset uncommitted and rewinds the partition so the same
//! message is delivered again; any other error is logged and committed so
//! the member moves on.

use crate::config::KafkaConfig;
use crate::producer::MESSAGE_TYPE_HEADER;
use metrics::counter;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    Create(String),

    #[error("Failed to subscribe to {topics:?}: {message}")]
    Subscribe { topics: Vec<String>, message: String },

    #[error("Undecodable payload: {0}")]
    Decode(String),

    #[error("Failed to commit offsets: {0}")]
    Commit(String),

    /// The message cannot be processed; it is committed and skipped
    #[error("Message rejected: {0}")]
    Fatal(String),

    /// A downstream dependency failed; the message is redelivered
    #[error("Transient failure: {0}")]
    Retryable(String),
}

impl ConsumerError {
    /// Whether the message should be redelivered rather than skipped
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConsumerError::Retryable(_))
    }
}

/// Where a message came from
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    /// Broker or producer timestamp, milliseconds since the epoch
    pub timestamp: Option<i64>,
    /// UTF-8 headers; others are dropped
    pub headers: HashMap<String, String>,
}

/// A message detached from the client buffer so it can cross await points
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub payload: Vec<u8>,
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ConsumerError> {
        serde_json::from_slice(&self.payload).map_err(|e| ConsumerError::Decode(e.to_string()))
    }

    pub fn key_str(&self) -> Option<String> {
        let key = self.metadata.key.as_deref()?;
        std::str::from_utf8(key).ok().map(str::to_owned)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.metadata.headers.get(name).map(String::as_str)
    }

    pub fn message_type(&self) -> Option<&str> {
        self.header(MESSAGE_TYPE_HEADER)
    }
}

impl From<&BorrowedMessage<'_>> for IncomingMessage {
    fn from(msg: &BorrowedMessage<'_>) -> Self {
        let headers: HashMap<String, String> = msg
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .filter_map(|h| {
                        let value = std::str::from_utf8(h.value?).ok()?;
                        Some((h.key.to_string(), value.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            metadata: MessageMetadata {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                key: msg.key().map(<[u8]>::to_vec),
                timestamp: msg.timestamp().to_millis(),
                headers,
            },
        }
    }
}

/// Per-message processing for one topic
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError>;

    /// Called for a message that failed fatally, before it is committed
    async fn on_error(&self, message: IncomingMessage, error: ConsumerError) {
        warn!(
            topic = %message.metadata.topic,
            partition = message.metadata.partition,
            offset = message.metadata.offset,
            error = %error,
            "Skipping message"
        );
    }
}

/// What the member did with a message after its handler returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Committed,
    Skipped,
    Redelivered,
}

/// One member of a Kafka consumer group
pub struct CaptureConsumer {
    consumer: StreamConsumer,
    config: KafkaConfig,
    stop: watch::Sender<bool>,
}

impl CaptureConsumer {
    pub fn new(config: KafkaConfig) -> Result<Self, ConsumerError> {
        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| ConsumerError::Create(e.to_string()))?;

        debug!(
            client_id = %config.client_id,
            group = %config.consumer.group_id,
            "Kafka consumer created"
        );

        let (stop, _) = watch::channel(false);
        Ok(Self {
            consumer,
            config,
            stop,
        })
    }

    pub fn subscribe(&self, topics: &[&str]) -> Result<(), ConsumerError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| ConsumerError::Subscribe {
                topics: topics.iter().map(|t| t.to_string()).collect(),
                message: e.to_string(),
            })
    }

    /// Commit the consumer's current position synchronously
    pub fn commit(&self) -> Result<(), ConsumerError> {
        self.consumer
            .commit_consumer_state(CommitMode::Sync)
            .map_err(|e| ConsumerError::Commit(e.to_string()))
    }

    /// Ask [`CaptureConsumer::run`] to return after the current message
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
    }

    /// Consume until shutdown, handing each message to `handler`
    #[instrument(
        skip(self, handler),
        fields(client = %self.config.client_id, group = %self.config.consumer.group_id)
    )]
    pub async fn run<H: MessageHandler + ?Sized>(&self, handler: Arc<H>) -> Result<(), ConsumerError> {
        let mut stop = self.stop.subscribe();
        if *stop.borrow() {
            return Ok(());
        }

        info!("Consumer started");

        loop {
            let incoming = tokio::select! {
                _ = stop.changed() => break,
                received = self.consumer.recv() => match received {
                    Ok(message) => IncomingMessage::from(&message),
                    Err(e) => {
                        error!(error = %e, "Kafka receive error");
                        continue;
                    }
                },
            };

            let disposition = self.dispatch(handler.as_ref(), incoming).await;
            debug!(?disposition, "Message settled");
        }

        info!("Consumer stopping");
        if !self.config.consumer.enable_auto_commit {
            if let Err(e) = self.commit() {
                debug!(error = %e, "No offsets committed on shutdown");
            }
        }

        Ok(())
    }

    /// Hand one message to the handler and settle its offset
    async fn dispatch<H: MessageHandler + ?Sized>(
        &self,
        handler: &H,
        incoming: IncomingMessage,
    ) -> Disposition {
        let metadata = incoming.metadata.clone();
        let topic = metadata.topic.clone();

        match handler.handle(incoming.clone()).await {
            Ok(()) => {
                counter!("pipeline.messages.processed", "topic" => topic).increment(1);
                self.commit_offset(&metadata);
                Disposition::Committed
            }
            Err(e) if e.is_retryable() => {
                counter!("pipeline.messages.redelivered", "topic" => topic).increment(1);
                warn!(
                    partition = metadata.partition,
                    offset = metadata.offset,
                    error = %e,
                    "Message will be redelivered"
                );
                tokio::time::sleep(self.config.redelivery_delay()).await;
                self.rewind(&metadata);
                Disposition::Redelivered
            }
            Err(e) => {
                counter!("pipeline.messages.failed", "topic" => topic).increment(1);
                handler.on_error(incoming, e).await;
                self.commit_offset(&metadata);
                Disposition::Skipped
            }
        }
    }

    /// Commit the offset following this message. With auto commit the
    /// offset is only stored, and the next auto commit picks it up.
    fn commit_offset(&self, metadata: &MessageMetadata) {
        let mut offsets = TopicPartitionList::new();
        let settled = offsets
            .add_partition_offset(
                &metadata.topic,
                metadata.partition,
                Offset::Offset(metadata.offset + 1),
            )
            .and_then(|_| {
                if self.config.consumer.enable_auto_commit {
                    self.consumer.store_offsets(&offsets)
                } else {
                    self.consumer.commit(&offsets, CommitMode::Async)
                }
            });

        if let Err(e) = settled {
            warn!(
                partition = metadata.partition,
                offset = metadata.offset,
                error = %e,
                "Offset commit failed"
            );
        }
    }

    /// Move the partition back so this message is fetched again
    fn rewind(&self, metadata: &MessageMetadata) {
        if let Err(e) = self.consumer.seek(
            &metadata.topic,
            metadata.partition,
            Offset::Offset(metadata.offset),
            SEEK_TIMEOUT,
        ) {
            error!(
                partition = metadata.partition,
                offset = metadata.offset,
                error = %e,
                "Failed to rewind partition for redelivery"
            );
        }
    }
}

/// A pool of consumers sharing one consumer group
pub struct ConsumerGroup {
    members: Vec<Arc<CaptureConsumer>>,
}

impl ConsumerGroup {
    /// Create `consumer.concurrency` members subscribed to `topics`
    pub fn new(config: &KafkaConfig, topics: &[&str]) -> Result<Self, ConsumerError> {
        let size = config.consumer.concurrency.max(1);
        let mut members = Vec::with_capacity(size);

        for index in 0..size {
            let mut member_config = config.clone();
            member_config.client_id = format!("{}-{}", config.client_id, index);

            let consumer = CaptureConsumer::new(member_config)?;
            consumer.subscribe(topics)?;
            members.push(Arc::new(consumer));
        }

        info!(
            group = %config.consumer.group_id,
            members = size,
            topics = ?topics,
            "Consumer group ready"
        );

        Ok(Self { members })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Run every member on the given runtime with a shared handler
    pub fn spawn<H: MessageHandler + 'static>(
        &self,
        handler: Arc<H>,
        runtime: &tokio::runtime::Handle,
    ) -> Vec<JoinHandle<()>> {
        self.members
            .iter()
            .cloned()
            .map(|member| {
                let handler = handler.clone();
                runtime.spawn(async move {
                    if let Err(e) = member.run(handler).await {
                        error!(error = %e, "Consumer member stopped with error");
                    }
                })
            })
            .collect()
    }

    /// Signal every member to stop
    pub fn shutdown(&self) {
        for member in &self.members {
            member.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(headers: HashMap<String, String>) -> IncomingMessage {
        IncomingMessage {
            payload: br#"{"image_info": {}}"#.to_vec(),
            metadata: MessageMetadata {
                topic: "processed-topic".to_string(),
                partition: 4,
                offset: 812,
                key: Some(b"550e8400-e29b-41d4-a716-446655440000".to_vec()),
                timestamp: Some(1_746_091_800_000),
                headers,
            },
        }
    }

    #[test]
    fn test_key_and_headers() {
        let headers = HashMap::from([(
            MESSAGE_TYPE_HEADER.to_string(),
            "capture_event".to_string(),
        )]);
        let message = message(headers);

        assert_eq!(message.message_type(), Some("capture_event"));
        assert_eq!(
            message.key_str().as_deref(),
            Some("550e8400-e29b-41d4-a716-446655440000")
        );
        assert_eq!(message.header("missing"), None);

        let mut binary_key = message.clone();
        binary_key.metadata.key = Some(vec![0xff, 0xfe]);
        assert_eq!(binary_key.key_str(), None);
    }

    #[test]
    fn test_decode_error_is_not_retryable() {
        let mut message = message(HashMap::new());
        message.payload = b"not json".to_vec();

        let err = tokio_test::assert_err!(message.decode_json::<serde_json::Value>());
        assert!(matches!(err, ConsumerError::Decode(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ConsumerError::Retryable("s3 down".into()).is_retryable());
        assert!(!ConsumerError::Fatal("no region".into()).is_retryable());
        assert!(!ConsumerError::Commit("rebalance".into()).is_retryable());
    }

    struct Rejecting;

    #[async_trait::async_trait]
    impl MessageHandler for Rejecting {
        async fn handle(&self, _message: IncomingMessage) -> Result<(), ConsumerError> {
            Err(ConsumerError::Fatal("rejected".into()))
        }
    }

    #[tokio::test]
    async fn test_default_on_error_does_not_panic() {
        let handler = Rejecting;
        let incoming = message(HashMap::new());
        let err = tokio_test::assert_err!(handler.handle(incoming.clone()).await);
        handler.on_error(incoming, err).await;
    }
}
