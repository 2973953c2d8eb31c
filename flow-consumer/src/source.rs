use async_trait::async_trait;

use crate::error::{DiscoveryError, SubscriptionError, WorkerReadError};
use crate::partition::{Partition, RawMessage};

/// The partitioned message log the pipeline reads from.
#[async_trait]
pub trait MessageLog: Send + Sync {
    type Handle: PartitionHandle;

    /// List every partition of `topic`, in partition number order.
    async fn partitions(&self, topic: &str) -> Result<Vec<Partition>, DiscoveryError>;

    /// Attach to `partition` so that only messages produced from now on are returned.
    async fn open_at_newest(&self, partition: &Partition)
        -> Result<Self::Handle, SubscriptionError>;
}

/// A consumption handle on exactly one partition. Dropping it releases the
/// underlying connection.
#[async_trait]
pub trait PartitionHandle: Send + 'static {
    fn partition(&self) -> &Partition;

    /// Wait for the next message, in partition order. Returns `None` once the
    /// source is closed. Must be cancel safe: dropping the future before it
    /// completes must not lose a message.
    async fn next_message(&mut self) -> Option<Result<RawMessage, WorkerReadError>>;
}
