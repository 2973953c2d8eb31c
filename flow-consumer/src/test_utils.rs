//! An in-memory partitioned log, for exercising the pipeline without Kafka.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{DiscoveryError, SubscriptionError, WorkerReadError};
use crate::partition::{Partition, RawMessage};
use crate::source::{MessageLog, PartitionHandle};

type FeedItem = Result<(i64, Bytes), String>;

struct Feed {
    sender: Mutex<Option<mpsc::UnboundedSender<FeedItem>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<FeedItem>>>,
    next_offset: AtomicI64,
}

impl Feed {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            next_offset: AtomicI64::new(0),
        }
    }

    fn push(&self, item: FeedItem) {
        if let Some(sender) = self.sender.lock().unwrap().as_ref() {
            // The handle may already be dropped, messages are then lost like on a real log
            drop(sender.send(item));
        }
    }
}

/// Each partition is an unbounded queue fed through a [`PartitionProducer`].
/// A partition can be opened once; its handle sees whatever is produced on it.
pub struct InMemoryLog {
    topic: String,
    feeds: Vec<Arc<Feed>>,
    unavailable: HashSet<i32>,
    open_handles: Arc<AtomicUsize>,
}

impl InMemoryLog {
    pub fn new(topic: &str, partitions: i32) -> Self {
        Self {
            topic: topic.to_owned(),
            feeds: (0..partitions).map(|_| Arc::new(Feed::new())).collect(),
            unavailable: HashSet::new(),
            open_handles: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make opening `partition` fail.
    pub fn with_unavailable_partition(mut self, partition: i32) -> Self {
        self.unavailable.insert(partition);
        self
    }

    pub fn producer(&self, partition: i32) -> PartitionProducer {
        PartitionProducer {
            feed: self.feeds[partition as usize].clone(),
        }
    }

    /// Handles opened and not dropped yet.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageLog for InMemoryLog {
    type Handle = InMemoryPartitionHandle;

    async fn partitions(&self, topic: &str) -> Result<Vec<Partition>, DiscoveryError> {
        if topic != self.topic {
            return Err(DiscoveryError::TopicNotFound(topic.to_owned()));
        }
        if self.feeds.is_empty() {
            return Err(DiscoveryError::NoPartitions(topic.to_owned()));
        }
        Ok((0..self.feeds.len() as i32)
            .map(|n| Partition::new(topic.to_owned(), n))
            .collect())
    }

    async fn open_at_newest(
        &self,
        partition: &Partition,
    ) -> Result<InMemoryPartitionHandle, SubscriptionError> {
        let number = partition.partition_number();
        if self.unavailable.contains(&number) {
            return Err(SubscriptionError::Unavailable(partition.clone()));
        }
        let receiver = usize::try_from(number)
            .ok()
            .and_then(|n| self.feeds.get(n))
            .and_then(|feed| feed.receiver.lock().unwrap().take())
            .ok_or_else(|| SubscriptionError::Unavailable(partition.clone()))?;

        self.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(InMemoryPartitionHandle {
            partition: partition.clone(),
            receiver,
            open_handles: self.open_handles.clone(),
        })
    }
}

pub struct InMemoryPartitionHandle {
    partition: Partition,
    receiver: mpsc::UnboundedReceiver<FeedItem>,
    open_handles: Arc<AtomicUsize>,
}

impl Drop for InMemoryPartitionHandle {
    fn drop(&mut self) {
        self.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PartitionHandle for InMemoryPartitionHandle {
    fn partition(&self) -> &Partition {
        &self.partition
    }

    async fn next_message(&mut self) -> Option<Result<RawMessage, WorkerReadError>> {
        let item = self.receiver.recv().await?;
        Some(match item {
            Ok((offset, payload)) => Ok(RawMessage::new(self.partition.clone(), offset, payload)),
            Err(reason) => Err(WorkerReadError::Connection {
                partition: self.partition.clone(),
                reason,
            }),
        })
    }
}

#[derive(Clone)]
pub struct PartitionProducer {
    feed: Arc<Feed>,
}

impl PartitionProducer {
    pub fn send(&self, payload: impl Into<Bytes>) {
        let offset = self.feed.next_offset.fetch_add(1, Ordering::SeqCst);
        self.feed.push(Ok((offset, payload.into())));
    }

    /// Deliver a read error to the partition handle.
    pub fn fail(&self, reason: &str) {
        self.feed.push(Err(reason.to_owned()));
    }

    /// Close the partition: its handle returns `None` once drained.
    pub fn close(&self) {
        drop(self.feed.sender.lock().unwrap().take());
    }
}
