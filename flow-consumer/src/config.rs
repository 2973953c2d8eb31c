use std::str::FromStr;
use std::time;

use bytes::Bytes;
use envconfig::Envconfig;
use health::HealthStrategy;

use crate::driver::DecodeFailurePolicy;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "test")]
    pub kafka_topic: String,

    // Partitions are assigned manually, the group is never joined nor committed to
    #[envconfig(default = "flow-feature-consumer")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "10000")]
    pub kafka_metadata_timeout_ms: EnvMsDuration,

    #[envconfig(default = "feature.csv")]
    pub output_path: String,

    #[envconfig(default = "1000")]
    pub delivery_buffer_size: usize,

    #[envconfig(default = "fatal")]
    pub decode_failure_policy: DecodeFailurePolicy,

    // Payload that stops the pipeline when received on any partition, empty to disable
    #[envconfig(default = "q")]
    pub shutdown_sentinel: String,

    #[envconfig(default = "0.0.0.0:3310")]
    pub bind_address: String,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(default = "any")]
    pub health_strategy: HealthStrategy,

    #[envconfig(default = "30000")]
    pub worker_liveness_deadline_ms: EnvMsDuration,

    #[envconfig(default = "text")]
    pub log_format: LogFormat,

    pub log_file: Option<String>,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// The in-band stop payload, if enabled.
    pub fn sentinel(&self) -> Option<Bytes> {
        if self.shutdown_sentinel.is_empty() {
            None
        } else {
            Some(Bytes::from(self.shutdown_sentinel.clone()))
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("Unknown log format: {s}, must be text or json")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.kafka_hosts, "localhost:9092");
        assert_eq!(config.kafka_topic, "test");
        assert_eq!(config.output_path, "feature.csv");
        assert_eq!(config.decode_failure_policy, DecodeFailurePolicy::Fatal);
        assert_eq!(config.health_strategy, HealthStrategy::Any);
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.kafka_metadata_timeout_ms.0, time::Duration::from_secs(10));
        assert_eq!(config.sentinel(), Some(Bytes::from_static(b"q")));
        assert!(config.log_file.is_none());
    }

    #[test]
    fn overrides() {
        let env: HashMap<String, String> = [
            ("KAFKA_TOPIC", "flows"),
            ("DECODE_FAILURE_POLICY", "skip"),
            ("SHUTDOWN_SENTINEL", ""),
            ("DELIVERY_BUFFER_SIZE", "8"),
            ("LOG_FORMAT", "JSON"),
            ("LOG_FILE", "./consumer.log"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();

        let config = Config::init_from_hashmap(&env).unwrap();

        assert_eq!(config.kafka_topic, "flows");
        assert_eq!(config.decode_failure_policy, DecodeFailurePolicy::Skip);
        assert_eq!(config.sentinel(), None);
        assert_eq!(config.delivery_buffer_size, 8);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.log_file.as_deref(), Some("./consumer.log"));
    }

    #[test]
    fn rejects_unknown_policy() {
        let env: HashMap<String, String> =
            HashMap::from([("DECODE_FAILURE_POLICY".to_owned(), "ignore".to_owned())]);
        assert!(Config::init_from_hashmap(&env).is_err());
    }
}
