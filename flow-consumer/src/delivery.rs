//! The delivery path: one bounded channel shared by every partition worker
//! and drained by the pipeline driver.
//!
//! Each worker sends in the order its partition delivered, so per-partition
//! order survives the fan-in. Nothing orders messages across partitions.

use tokio::sync::mpsc;

use crate::partition::RawMessage;

#[derive(Debug)]
pub enum Delivery {
    Message(RawMessage),
    /// Sent by the coordinator once every worker has exited. Never decoded.
    Shutdown,
}

pub type DeliverySender = mpsc::Sender<Delivery>;
pub type DeliveryReceiver = mpsc::Receiver<Delivery>;

pub fn channel(capacity: usize) -> (DeliverySender, DeliveryReceiver) {
    mpsc::channel(capacity.max(1))
}
