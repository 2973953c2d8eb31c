use std::str::FromStr;
use std::time::Instant;

use bytes::Bytes;
use flow_common::feature::{FeatureMessage, FlowFeature};
use flow_common::metrics::{DECODE_ERRORS, PIPELINE_STOPPED, RECORDS_WRITTEN, SINK_WRITE_SECONDS};
use flow_common::sink::SinkWriter;
use metrics::{counter, histogram};
use tracing::{debug, error, info, warn};

use crate::delivery::{Delivery, DeliveryReceiver};
use crate::error::PipelineError;
use crate::partition::RawMessage;

/// What the driver does with a payload that does not decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeFailurePolicy {
    /// Stop the pipeline with the decode error
    Fatal,
    /// Log the error, count it and move on to the next message
    Skip,
}

impl FromStr for DecodeFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "fatal" => Ok(DecodeFailurePolicy::Fatal),
            "skip" => Ok(DecodeFailurePolicy::Skip),
            _ => Err(format!(
                "Unknown decode failure policy: {s}, must be fatal or skip"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The coordinator enqueued the shutdown sentinel after its last worker exited
    Shutdown,
    /// A partition delivered the in-band stop payload
    Sentinel,
    /// Every sender of the delivery path was dropped
    DeliveryClosed,
}

impl StopReason {
    fn as_str(&self) -> &'static str {
        match self {
            StopReason::Shutdown => "shutdown",
            StopReason::Sentinel => "sentinel",
            StopReason::DeliveryClosed => "delivery_closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverSummary {
    pub records_written: u64,
    pub records_skipped: u64,
    pub stop_reason: StopReason,
}

/// Single consumer of the delivery path and sole owner of the sink.
pub struct PipelineDriver<S: SinkWriter> {
    receiver: DeliveryReceiver,
    sink: S,
    decode_failure_policy: DecodeFailurePolicy,
    sentinel: Option<Bytes>,
    records_written: u64,
    records_skipped: u64,
}

impl<S: SinkWriter> PipelineDriver<S> {
    pub fn new(receiver: DeliveryReceiver, sink: S, policy: DecodeFailurePolicy) -> Self {
        Self {
            receiver,
            sink,
            decode_failure_policy: policy,
            sentinel: None,
            records_written: 0,
            records_skipped: 0,
        }
    }

    /// Stop when a partition delivers exactly this payload.
    pub fn with_sentinel(mut self, sentinel: Option<Bytes>) -> Self {
        self.sentinel = sentinel;
        self
    }

    /// Write the header, then decode and write every delivered message until
    /// the sentinel arrives. Each record is flushed before the next message is
    /// read. Blocks as long as nothing is delivered.
    pub async fn run(&mut self) -> Result<DriverSummary, PipelineError> {
        self.sink.write_header(&FlowFeature::COLUMNS)?;
        self.sink.flush()?;
        info!("csv header written, waiting for messages");

        let stop_reason = loop {
            match self.receiver.recv().await {
                None => break StopReason::DeliveryClosed,
                Some(Delivery::Shutdown) => break StopReason::Shutdown,
                Some(Delivery::Message(message)) if self.is_sentinel(&message) => {
                    info!(
                        topic = message.partition().topic(),
                        partition = message.partition().partition_number(),
                        offset = message.offset(),
                        "received stop payload"
                    );
                    break StopReason::Sentinel;
                }
                Some(Delivery::Message(message)) => self.process(message)?,
            }
        };

        counter!(PIPELINE_STOPPED, "reason" => stop_reason.as_str()).increment(1);
        if stop_reason == StopReason::DeliveryClosed {
            warn!("delivery path closed without a shutdown sentinel");
        }

        Ok(DriverSummary {
            records_written: self.records_written,
            records_skipped: self.records_skipped,
            stop_reason,
        })
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    fn is_sentinel(&self, message: &RawMessage) -> bool {
        self.sentinel
            .as_ref()
            .is_some_and(|sentinel| sentinel == message.payload())
    }

    fn process(&mut self, message: RawMessage) -> Result<(), PipelineError> {
        let decoded = match FeatureMessage::decode(message.payload()) {
            Ok(decoded) => decoded,
            Err(e) => {
                counter!(DECODE_ERRORS).increment(1);
                return match self.decode_failure_policy {
                    DecodeFailurePolicy::Fatal => {
                        error!(
                            topic = message.partition().topic(),
                            partition = message.partition().partition_number(),
                            offset = message.offset(),
                            error = %e,
                            "failed to decode message"
                        );
                        Err(PipelineError::Decode {
                            partition: message.partition().clone(),
                            offset: message.offset(),
                            source: e,
                        })
                    }
                    DecodeFailurePolicy::Skip => {
                        warn!(
                            topic = message.partition().topic(),
                            partition = message.partition().partition_number(),
                            offset = message.offset(),
                            error = %e,
                            "skipping message that failed to decode"
                        );
                        self.records_skipped += 1;
                        Ok(())
                    }
                };
            }
        };

        let start = Instant::now();
        self.sink.write_record(&decoded.feature)?;
        self.sink.flush()?;
        histogram!(SINK_WRITE_SECONDS).record(start.elapsed().as_secs_f64());
        counter!(RECORDS_WRITTEN).increment(1);
        self.records_written += 1;

        debug!(
            topic = message.partition().topic(),
            partition = message.partition().partition_number(),
            offset = message.offset(),
            producer = %decoded.name,
            "record written"
        );
        Ok(())
    }
}
