//! Prometheus remote-write messages.

use crate::Result;
use oxrule_common::TimeSeries;
use prost::Message;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WriteRequest {
    #[prost(message, repeated, tag = "1")]
    pub timeseries: Vec<PbTimeSeries>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbTimeSeries {
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<PbLabel>,
    #[prost(message, repeated, tag = "2")]
    pub samples: Vec<PbSample>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbLabel {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbSample {
    #[prost(double, tag = "1")]
    pub value: f64,
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

impl From<&TimeSeries> for PbTimeSeries {
    fn from(ts: &TimeSeries) -> Self {
        Self {
            labels: ts
                .labels
                .iter()
                .map(|l| PbLabel {
                    name: l.name.clone(),
                    value: l.value.clone(),
                })
                .collect(),
            samples: ts
                .samples
                .iter()
                .map(|s| PbSample {
                    value: s.value,
                    timestamp: s.timestamp,
                })
                .collect(),
        }
    }
}

/// Serialises `series` into a snappy-compressed `WriteRequest`.
///
/// Uses the raw block format, as the remote-write protocol requires.
pub fn encode_write_request(series: &[TimeSeries]) -> Result<Vec<u8>> {
    let req = WriteRequest {
        timeseries: series.iter().map(PbTimeSeries::from).collect(),
    };
    let raw = req.encode_to_vec();
    Ok(snap::raw::Encoder::new().compress_vec(&raw)?)
}
