//! Fan-in Coordinator - one worker per partition, one delivery path for all of them
//!
//! Startup is all-or-nothing: every partition of the topic is opened at its
//! newest offset before any worker starts, and failing to open a single one
//! aborts the run. Once started, all workers run concurrently. A supervisor
//! task collects them as they exit and, once the last one is gone, enqueues
//! the shutdown sentinel. Everything a worker forwarded is therefore ahead of
//! the sentinel on the delivery path.

use futures::stream::{FuturesUnordered, StreamExt};
use health::HealthRegistry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::delivery::{Delivery, DeliverySender};
use crate::error::PipelineError;
use crate::partition::Partition;
use crate::source::{MessageLog, PartitionHandle};
use crate::worker::{PartitionWorker, PartitionWorkerConfig, WorkerExit};

/// How one partition worker ended.
#[derive(Debug)]
pub struct WorkerReport {
    pub partition: Partition,
    pub exit: WorkerExit,
}

pub struct FanInCoordinator {
    topic: String,
    partitions: Vec<Partition>,
    shutdown: CancellationToken,
    supervisor: JoinHandle<Vec<WorkerReport>>,
}

impl FanInCoordinator {
    /// Discover the partitions of `topic`, attach to each of them at the newest
    /// offset and start forwarding into `delivery`.
    pub async fn start<L: MessageLog>(
        log: &L,
        topic: &str,
        delivery: DeliverySender,
        liveness: &HealthRegistry,
        config: &PartitionWorkerConfig,
    ) -> Result<Self, PipelineError> {
        let partitions = log.partitions(topic).await?;
        info!(topic, partitions = partitions.len(), "discovered partitions");

        // Open everything first: handles opened so far are dropped on failure
        let mut handles = Vec::with_capacity(partitions.len());
        for partition in &partitions {
            match log.open_at_newest(partition).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!(
                        topic,
                        partition = partition.partition_number(),
                        error = %e,
                        "failed to open partition, aborting startup"
                    );
                    return Err(e.into());
                }
            }
        }

        let shutdown = CancellationToken::new();
        let mut workers = Vec::with_capacity(handles.len());
        for handle in handles {
            let component = format!("partition-{}", handle.partition().partition_number());
            let health = liveness
                .register(component, config.liveness_deadline)
                .await;
            workers.push(PartitionWorker::spawn(
                handle,
                delivery.clone(),
                shutdown.clone(),
                health,
                config,
            ));
        }

        let supervisor = tokio::spawn(Self::supervise(workers, delivery));

        Ok(Self {
            topic: topic.to_owned(),
            partitions,
            shutdown,
            supervisor,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// A token that closes every partition when cancelled, for signal handlers.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Close every partition, wait for all workers to exit and return how they ended.
    pub async fn shutdown(self) -> Vec<WorkerReport> {
        info!(topic = %self.topic, "closing all partitions");
        self.shutdown.cancel();

        match self.supervisor.await {
            Ok(reports) => reports,
            Err(e) => {
                error!("partition supervisor failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Collect workers in the order they finish, then send the sentinel.
    async fn supervise(
        workers: Vec<PartitionWorker>,
        delivery: DeliverySender,
    ) -> Vec<WorkerReport> {
        let mut running: FuturesUnordered<_> =
            workers.into_iter().map(PartitionWorker::join).collect();
        let mut reports = Vec::with_capacity(running.len());

        while let Some((partition, exit)) = running.next().await {
            if exit.is_failure() {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    exit = ?exit,
                    remaining = running.len(),
                    "partition worker failed, other partitions keep consuming"
                );
            } else {
                info!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    remaining = running.len(),
                    "partition worker exited"
                );
            }
            reports.push(WorkerReport { partition, exit });
        }

        info!("all partition workers exited, sending shutdown sentinel");
        if delivery.send(Delivery::Shutdown).await.is_err() {
            warn!("delivery path closed before the shutdown sentinel could be sent");
        }
        reports
    }
}
