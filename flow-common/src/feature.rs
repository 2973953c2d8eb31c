//! Flow feature records as published by the feature extractor.
//!
//! A message is a JSON envelope naming the producer and carrying one
//! feature object. Decoding is all-or-nothing: every field listed in
//! [`FlowFeature::COLUMNS`] must be present and well typed, otherwise the
//! whole message is rejected. Keys the CSV schema does not carry (TCP flag
//! counters, initial window sizes) are ignored.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("received empty payload")]
    Empty,
    #[error("invalid feature message: {0}")]
    Json(#[from] serde_json::Error),
}

/// The JSON envelope of one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMessage {
    pub name: String,
    pub feature: FlowFeature,
}

impl FeatureMessage {
    /// Decode one message payload. Pure: identical bytes give identical messages.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Statistics of one bidirectional flow. "Up" is client to server, "down" the reverse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowFeature {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub transport_layer: u16,

    // packet inter-arrival times
    pub up_time_mean: f64,
    pub up_time_std: f64,
    pub up_time_min: f64,
    pub up_time_max: f64,
    pub down_time_mean: f64,
    pub down_time_std: f64,
    pub down_time_min: f64,
    pub down_time_max: f64,
    pub time_mean: f64,
    pub time_std: f64,
    pub time_min: f64,
    pub time_max: f64,

    // packet lengths
    pub up_packet_len_mean: f64,
    pub up_packet_len_std: f64,
    pub up_packet_len_min: f64,
    pub up_packet_len_max: f64,
    pub down_packet_len_mean: f64,
    pub down_packet_len_std: f64,
    pub down_packet_len_min: f64,
    pub down_packet_len_max: f64,
    pub packet_len_mean: f64,
    pub packet_len_std: f64,
    pub packet_len_min: f64,
    pub packet_len_max: f64,

    pub duration: f64,
    pub up_packet_num: i64,
    pub up_packet_num_minute: f64,
    pub down_packet_num: i64,
    pub down_packet_num_minute: f64,
    pub packet_num: i64,
    pub packet_num_minute: f64,
    pub down_up_packet_percent: f64,
    pub up_head_len_percent: f64,
    pub down_head_len_percent: f64,
    pub extension_num: i64,
    pub server_name: String,
}

impl FlowFeature {
    /// CSV header, in the order `to_row` emits values.
    pub const COLUMNS: [&'static str; 41] = [
        "SrcIP",
        "DstIP",
        "SrcPort",
        "DstPort",
        "TransportLayer",
        "UpTimeMean",
        "UpTimeStd",
        "UpTimeMin",
        "UpTimeMax",
        "DownTimeMean",
        "DownTimeStd",
        "DownTimeMin",
        "DownTimeMax",
        "TimeMean",
        "TimeStd",
        "TimeMin",
        "TimeMax",
        "UpPacketLenMean",
        "UpPacketLenStd",
        "UpPacketLenMin",
        "UpPacketLenMax",
        "DownPacketLenMean",
        "DownPacketLenStd",
        "DownPacketLenMin",
        "DownPacketLenMax",
        "PacketLenMean",
        "PacketLenStd",
        "PacketLenMin",
        "PacketLenMax",
        "Duration",
        "UpPacketNum",
        "UpPacketNumMinute",
        "DownPacketNum",
        "DownPacketNumMinute",
        "PacketNum",
        "PacketNumMinute",
        "DownUpPacketPercent",
        "UpHeadLenPercent",
        "DownHeadLenPercent",
        "ExtensionNum",
        "ServerName",
    ];

    /// Render every field as CSV text: floats with 4 fixed decimals, integers
    /// and addresses in their canonical form, the server name verbatim.
    pub fn to_row(&self) -> Vec<String> {
        let fixed = |v: f64| format!("{v:.4}");

        vec![
            self.src_ip.to_string(),
            self.dst_ip.to_string(),
            self.src_port.to_string(),
            self.dst_port.to_string(),
            self.transport_layer.to_string(),
            fixed(self.up_time_mean),
            fixed(self.up_time_std),
            fixed(self.up_time_min),
            fixed(self.up_time_max),
            fixed(self.down_time_mean),
            fixed(self.down_time_std),
            fixed(self.down_time_min),
            fixed(self.down_time_max),
            fixed(self.time_mean),
            fixed(self.time_std),
            fixed(self.time_min),
            fixed(self.time_max),
            fixed(self.up_packet_len_mean),
            fixed(self.up_packet_len_std),
            fixed(self.up_packet_len_min),
            fixed(self.up_packet_len_max),
            fixed(self.down_packet_len_mean),
            fixed(self.down_packet_len_std),
            fixed(self.down_packet_len_min),
            fixed(self.down_packet_len_max),
            fixed(self.packet_len_mean),
            fixed(self.packet_len_std),
            fixed(self.packet_len_min),
            fixed(self.packet_len_max),
            fixed(self.duration),
            self.up_packet_num.to_string(),
            fixed(self.up_packet_num_minute),
            self.down_packet_num.to_string(),
            fixed(self.down_packet_num_minute),
            self.packet_num.to_string(),
            fixed(self.packet_num_minute),
            fixed(self.down_up_packet_percent),
            fixed(self.up_head_len_percent),
            fixed(self.down_head_len_percent),
            self.extension_num.to_string(),
            self.server_name.clone(),
        ]
    }
}
