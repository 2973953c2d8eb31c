use flow_common::feature::DecodeError;
use flow_common::sink::SinkError;
use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::partition::Partition;

/// Errors listing the partitions of the input topic. Fatal at startup.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("failed to reach the kafka cluster: {0}")]
    Kafka(#[from] KafkaError),
    #[error("topic {0} does not exist")]
    TopicNotFound(String),
    #[error("topic {0} has no partitions")]
    NoPartitions(String),
    #[error("partition discovery was interrupted: {0}")]
    Interrupted(#[from] tokio::task::JoinError),
}

/// Errors opening one partition at its newest offset. Fatal at startup.
#[derive(Error, Debug)]
pub enum SubscriptionError {
    #[error("failed to create a consumer for {partition}: {source}")]
    Client {
        partition: Partition,
        #[source]
        source: KafkaError,
    },
    #[error("failed to assign {partition} at the newest offset: {source}")]
    Assign {
        partition: Partition,
        #[source]
        source: KafkaError,
    },
    #[error("{0} is not available")]
    Unavailable(Partition),
}

/// A partition source failing mid-stream. Only stops the worker that observed it.
#[derive(Error, Debug)]
pub enum WorkerReadError {
    #[error("kafka error while reading {partition}: {source}")]
    Kafka {
        partition: Partition,
        #[source]
        source: KafkaError,
    },
    #[error("connection lost while reading {partition}: {reason}")]
    Connection { partition: Partition, reason: String },
}

impl WorkerReadError {
    pub fn partition(&self) -> &Partition {
        match self {
            WorkerReadError::Kafka { partition, .. } => partition,
            WorkerReadError::Connection { partition, .. } => partition,
        }
    }
}

/// Errors that stop the whole pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    #[error("failed to decode message at {partition} offset {offset}: {source}")]
    Decode {
        partition: Partition,
        offset: i64,
        #[source]
        source: DecodeError,
    },
    #[error("failed to write to the sink: {0}")]
    Sink(#[from] SinkError),
}
