use std::fmt;

use bytes::Bytes;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: String, partition_number: i32) -> Self {
        Self {
            topic,
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

/// One message as delivered by a partition, payload untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    partition: Partition,
    offset: i64,
    payload: Bytes,
}

impl RawMessage {
    pub fn new(partition: Partition, offset: i64, payload: Bytes) -> Self {
        Self {
            partition,
            offset,
            payload,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}
