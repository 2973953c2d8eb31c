//! Partition Worker - forwards the messages of a single partition to the delivery path
//!
//! Each partition gets its own task, so:
//! 1. Ordering is preserved within each partition
//! 2. Partitions are consumed in parallel
//! 3. A failing partition only stops its own worker
//!
//! Workers never decode. They stop when the coordinator cancels them, when
//! their source closes, or on the first read error the source reports. The
//! source retries transient broker errors itself; workers never reopen.

use std::time::Duration;

use flow_common::metrics::{MESSAGES_RECEIVED, PARTITION_WORKERS_ACTIVE, WORKER_READ_ERRORS};
use health::HealthHandle;
use metrics::{counter, gauge};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::delivery::{Delivery, DeliverySender};
use crate::error::WorkerReadError;
use crate::partition::Partition;
use crate::source::PartitionHandle;

#[derive(Debug, Clone)]
pub struct PartitionWorkerConfig {
    /// A worker not reporting for this long is considered stalled
    pub liveness_deadline: Duration,
    /// How often an idle worker reports healthy
    pub liveness_interval: Duration,
}

impl PartitionWorkerConfig {
    /// Report several times per deadline so one late tick does not fail the probe.
    pub fn from_deadline(deadline: Duration) -> Self {
        Self {
            liveness_deadline: deadline,
            liveness_interval: (deadline / 4).max(Duration::from_millis(10)),
        }
    }
}

impl Default for PartitionWorkerConfig {
    fn default() -> Self {
        Self::from_deadline(Duration::from_secs(30))
    }
}

/// Why a worker stopped.
#[derive(Debug)]
pub enum WorkerExit {
    /// The coordinator closed the partition
    Cancelled,
    /// The partition source reported it has no more messages
    SourceClosed,
    /// The partition source failed
    ReadFailed(WorkerReadError),
    /// The driver is gone, nobody reads the delivery path anymore
    DeliveryClosed,
    /// The worker task panicked
    Panicked,
}

impl WorkerExit {
    pub fn is_failure(&self) -> bool {
        matches!(self, WorkerExit::ReadFailed(_) | WorkerExit::Panicked)
    }
}

/// A spawned worker attached to one partition.
pub struct PartitionWorker {
    partition: Partition,
    handle: JoinHandle<WorkerExit>,
}

impl PartitionWorker {
    /// Spawn a worker that owns `source` until it exits.
    pub fn spawn<H: PartitionHandle>(
        source: H,
        delivery: DeliverySender,
        shutdown: CancellationToken,
        liveness: HealthHandle,
        config: &PartitionWorkerConfig,
    ) -> Self {
        let partition = source.partition().clone();
        let interval = config.liveness_interval;

        let handle = tokio::spawn(async move {
            Self::run_worker(source, delivery, shutdown, liveness, interval).await
        });

        Self { partition, handle }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the worker task to end.
    pub async fn join(self) -> (Partition, WorkerExit) {
        let exit = match self.handle.await {
            Ok(exit) => exit,
            Err(e) => {
                warn!("partition worker for {} panicked: {}", self.partition, e);
                WorkerExit::Panicked
            }
        };
        (self.partition, exit)
    }

    /// The main worker loop
    async fn run_worker<H: PartitionHandle>(
        mut source: H,
        delivery: DeliverySender,
        shutdown: CancellationToken,
        liveness: HealthHandle,
        liveness_interval: Duration,
    ) -> WorkerExit {
        let partition = source.partition().clone();
        let partition_label = partition.partition_number().to_string();
        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            "starting partition worker"
        );
        gauge!(PARTITION_WORKERS_ACTIVE).increment(1.0);

        let mut ticker = tokio::time::interval(liveness_interval);

        let exit = loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break WorkerExit::Cancelled,

                _ = ticker.tick() => liveness.report_healthy().await,

                next = source.next_message() => match next {
                    None => break WorkerExit::SourceClosed,
                    Some(Err(e)) => {
                        error!(
                            topic = partition.topic(),
                            partition = partition.partition_number(),
                            error = %e,
                            "failed to read from partition, stopping its worker"
                        );
                        counter!(WORKER_READ_ERRORS, "partition" => partition_label.clone())
                            .increment(1);
                        break WorkerExit::ReadFailed(e);
                    }
                    Some(Ok(message)) => {
                        debug!(
                            topic = partition.topic(),
                            partition = partition.partition_number(),
                            offset = message.offset(),
                            "forwarding message"
                        );
                        counter!(MESSAGES_RECEIVED, "partition" => partition_label.clone())
                            .increment(1);

                        // Not raced against shutdown: a pulled message is always
                        // handed over, the driver keeps draining until the sentinel.
                        if delivery.send(Delivery::Message(message)).await.is_err() {
                            break WorkerExit::DeliveryClosed;
                        }
                    }
                },
            }
        };

        gauge!(PARTITION_WORKERS_ACTIVE).decrement(1.0);
        match &exit {
            WorkerExit::ReadFailed(_) => liveness.report_unhealthy().await,
            _ => liveness.deregister().await,
        }

        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            exit = ?exit,
            "partition worker shutting down"
        );
        // The source is dropped here, closing its connection
        drop(source);
        exit
    }
}
