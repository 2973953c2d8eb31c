use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use flow_common::metrics::KAFKA_CONSUMER_ERRORS;
use metrics::counter;
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{DiscoveryError, SubscriptionError, WorkerReadError};
use crate::partition::{Partition, RawMessage};
use crate::source::{MessageLog, PartitionHandle};

/// Kafka as the partitioned message log. Every partition gets its own
/// consumer, manually assigned, so no group rebalancing ever moves a
/// partition between workers and no offsets are committed.
pub struct KafkaMessageLog {
    client_config: ClientConfig,
    metadata_timeout: Duration,
}

impl KafkaMessageLog {
    pub fn new(config: &Config) -> Self {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("group.id", &config.kafka_consumer_group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("allow.auto.create.topics", "false")
            .set("auto.offset.reset", "latest");

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);

        Self {
            client_config,
            metadata_timeout: config.kafka_metadata_timeout_ms.0,
        }
    }
}

#[async_trait]
impl MessageLog for KafkaMessageLog {
    type Handle = KafkaPartitionHandle;

    async fn partitions(&self, topic: &str) -> Result<Vec<Partition>, DiscoveryError> {
        info!("connecting to Kafka brokers to list partitions of {}", topic);

        let client_config = self.client_config.clone();
        let timeout = self.metadata_timeout;
        let topic = topic.to_owned();

        // Metadata requests block the calling thread until the broker answers
        tokio::task::spawn_blocking(move || -> Result<Vec<Partition>, DiscoveryError> {
            let consumer: BaseConsumer = client_config.create()?;
            let metadata = consumer.fetch_metadata(Some(&topic), timeout)?;

            let Some(found) = metadata.topics().iter().find(|t| t.name() == topic) else {
                return Err(DiscoveryError::TopicNotFound(topic));
            };
            if let Some(err) = found.error() {
                debug!("metadata error for topic {}: {:?}", topic, err);
                return Err(DiscoveryError::TopicNotFound(topic));
            }

            let mut numbers: Vec<i32> = found.partitions().iter().map(|p| p.id()).collect();
            if numbers.is_empty() {
                return Err(DiscoveryError::NoPartitions(topic));
            }
            numbers.sort_unstable();

            Ok(numbers
                .into_iter()
                .map(|n| Partition::new(topic.clone(), n))
                .collect())
        })
        .await?
    }

    async fn open_at_newest(
        &self,
        partition: &Partition,
    ) -> Result<KafkaPartitionHandle, SubscriptionError> {
        let consumer: StreamConsumer =
            self.client_config
                .create()
                .map_err(|source| SubscriptionError::Client {
                    partition: partition.clone(),
                    source,
                })?;

        let assign_err = |source| SubscriptionError::Assign {
            partition: partition.clone(),
            source,
        };
        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(partition.topic(), partition.partition_number(), Offset::End)
            .map_err(assign_err)?;
        consumer.assign(&assignment).map_err(assign_err)?;

        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            "attached to partition at newest offset"
        );

        Ok(KafkaPartitionHandle {
            partition: partition.clone(),
            consumer,
        })
    }
}

/// What a partition consumer does after `recv` returned an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorAction {
    /// librdkafka recovers on its own: wait, then read again
    Retry {
        error: &'static str,
        backoff: Duration,
    },
    /// The consumer was shut down
    Closed,
    /// The partition cannot be read anymore
    Fail,
}

fn retry(error: &'static str, backoff_ms: u64) -> ErrorAction {
    ErrorAction::Retry {
        error,
        backoff: Duration::from_millis(backoff_ms),
    }
}

fn classify_consumer_error(e: &KafkaError) -> ErrorAction {
    match e {
        KafkaError::MessageConsumption(code) => match code {
            RDKafkaErrorCode::PartitionEOF => retry("partition_eof", 0),
            RDKafkaErrorCode::OperationTimedOut => retry("op_timed_out", 0),
            // auto.offset.reset seeks back to the newest offset
            RDKafkaErrorCode::OffsetOutOfRange => retry("offset_out_of_range", 500),
            _ => retry("consumer", 100),
        },
        KafkaError::Global(code) => match code {
            RDKafkaErrorCode::AllBrokersDown => retry("all_brokers_down", 1000),
            RDKafkaErrorCode::BrokerTransportFailure => retry("broker_transport", 1000),
            RDKafkaErrorCode::Authentication => ErrorAction::Fail,
            _ => retry("global", 500),
        },
        KafkaError::Canceled => ErrorAction::Closed,
        _ => ErrorAction::Fail,
    }
}

/// Backoff grows with consecutive errors, capped at five times the base.
fn retry_delay(base: Duration, consecutive_errors: u32) -> Duration {
    base * consecutive_errors.clamp(1, 5)
}

pub struct KafkaPartitionHandle {
    partition: Partition,
    consumer: StreamConsumer,
}

#[async_trait]
impl PartitionHandle for KafkaPartitionHandle {
    fn partition(&self) -> &Partition {
        &self.partition
    }

    async fn next_message(&mut self) -> Option<Result<RawMessage, WorkerReadError>> {
        // A manually assigned StreamConsumer never ends on its own: the handle
        // is closed by dropping it.
        let mut consecutive_errors: u32 = 0;
        loop {
            let source = match self.consumer.recv().await {
                Ok(message) => {
                    return Some(Ok(RawMessage::new(
                        self.partition.clone(),
                        message.offset(),
                        Bytes::copy_from_slice(message.payload().unwrap_or_default()),
                    )))
                }
                Err(e) => e,
            };

            match classify_consumer_error(&source) {
                ErrorAction::Retry { error, backoff } => {
                    consecutive_errors += 1;
                    warn!(
                        topic = self.partition.topic(),
                        partition = self.partition.partition_number(),
                        error = %source,
                        consecutive_errors,
                        "transient kafka error, reading again"
                    );
                    counter!(KAFKA_CONSUMER_ERRORS, "level" => "warn", "error" => error)
                        .increment(1);
                    tokio::time::sleep(retry_delay(backoff, consecutive_errors)).await;
                }
                ErrorAction::Closed => {
                    info!(
                        topic = self.partition.topic(),
                        partition = self.partition.partition_number(),
                        "kafka consumer canceled"
                    );
                    return None;
                }
                ErrorAction::Fail => {
                    error!(
                        topic = self.partition.topic(),
                        partition = self.partition.partition_number(),
                        error = %source,
                        "fatal kafka error"
                    );
                    counter!(KAFKA_CONSUMER_ERRORS, "level" => "fatal", "error" => "consumer")
                        .increment(1);
                    return Some(Err(WorkerReadError::Kafka {
                        partition: self.partition.clone(),
                        source,
                    }));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use envconfig::Envconfig;

    use super::*;

    #[test]
    fn transient_errors_are_retried() {
        for code in [
            RDKafkaErrorCode::PartitionEOF,
            RDKafkaErrorCode::OperationTimedOut,
            RDKafkaErrorCode::OffsetOutOfRange,
            RDKafkaErrorCode::BrokerTransportFailure,
        ] {
            let action = classify_consumer_error(&KafkaError::MessageConsumption(code));
            assert!(
                matches!(action, ErrorAction::Retry { .. }),
                "{code:?} gave {action:?}"
            );
        }

        for code in [
            RDKafkaErrorCode::AllBrokersDown,
            RDKafkaErrorCode::BrokerTransportFailure,
            RDKafkaErrorCode::OperationTimedOut,
        ] {
            let action = classify_consumer_error(&KafkaError::Global(code));
            assert!(
                matches!(action, ErrorAction::Retry { .. }),
                "{code:?} gave {action:?}"
            );
        }

        assert_eq!(
            classify_consumer_error(&KafkaError::MessageConsumption(
                RDKafkaErrorCode::OffsetOutOfRange
            )),
            retry("offset_out_of_range", 500)
        );
    }

    #[test]
    fn unrecoverable_errors_stop_the_worker() {
        for e in [
            KafkaError::MessageConsumptionFatal(RDKafkaErrorCode::Fatal),
            KafkaError::Global(RDKafkaErrorCode::Authentication),
            KafkaError::ClientCreation("bad config".to_owned()),
        ] {
            assert_eq!(classify_consumer_error(&e), ErrorAction::Fail, "{e:?}");
        }
    }

    #[test]
    fn canceled_consumer_is_closed() {
        assert_eq!(
            classify_consumer_error(&KafkaError::Canceled),
            ErrorAction::Closed
        );
    }

    #[test]
    fn retry_delay_grows_then_caps() {
        let base = Duration::from_millis(100);
        assert_eq!(retry_delay(base, 0), Duration::from_millis(100));
        assert_eq!(retry_delay(base, 1), Duration::from_millis(100));
        assert_eq!(retry_delay(base, 3), Duration::from_millis(300));
        assert_eq!(retry_delay(base, 50), Duration::from_millis(500));
        assert_eq!(retry_delay(Duration::ZERO, 4), Duration::ZERO);
    }

    #[test]
    fn client_config_assigns_manually_without_statistics() {
        let env = HashMap::from([
            ("KAFKA_HOSTS".to_owned(), "kafka-0:9092".to_owned()),
            ("KAFKA_CONSUMER_GROUP".to_owned(), "flows".to_owned()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();
        let log = KafkaMessageLog::new(&config);

        assert_eq!(log.client_config.get("bootstrap.servers"), Some("kafka-0:9092"));
        assert_eq!(log.client_config.get("group.id"), Some("flows"));
        assert_eq!(log.client_config.get("enable.auto.commit"), Some("false"));
        assert_eq!(log.client_config.get("auto.offset.reset"), Some("latest"));
        assert_eq!(log.client_config.get("statistics.interval.ms"), None);
        assert_eq!(log.client_config.get("security.protocol"), None);
        assert_eq!(log.metadata_timeout, Duration::from_secs(10));
    }
}
