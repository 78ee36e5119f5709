use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

pub mod cluster;
pub mod framer;
pub mod grid;
pub mod heatmap;
pub mod packet;

#[cfg(test)]
pub(crate) mod testdata;

#[derive(Error, Debug)]
pub enum RadarError {
    #[error("I/O operation failed")]
    Io(#[from] std::io::Error),
    #[error("Serial port: {0}")]
    Serial(#[from] serialport::Error),
    #[error("Cannot parse JSON '{0}'")]
    ParseJson(String),
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
    #[error("Pipeline is not configured")]
    NotConfigured,
    #[error("Pipeline is already running")]
    AlreadyRunning,
    #[error("Pipeline is not running")]
    NotRunning,
    #[error("Pipeline is being accessed by another caller")]
    Busy,
    #[error("Timeout")]
    Timeout,
    #[error("Channel '{0}' is closed")]
    ChannelClosed(&'static str),
    #[error("Truncated {what}: need {needed} bytes, have {available}")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("Invalid recording: {0}")]
    InvalidRecording(String),
    #[error("Thread '{0}' panicked")]
    ThreadPanicked(String),
}

/// A complete packet cut from the sensor byte stream, magic preamble included.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl Packet {
    pub fn new(payload: Vec<u8>, received_at: DateTime<Utc>) -> Self {
        Packet {
            payload,
            received_at,
        }
    }
}

/// Which side of the vehicle the sensor looks at. The near side is the right
/// side, the far side across the road is the left side.
#[derive(
    clap::ValueEnum,
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum VehicleSide {
    Left = 0,
    #[default]
    Right = 1,
}

/// One interpolated point of the Cartesian query grid; `strength` is NaN
/// where nothing could be interpolated or the value is below the floor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InterpolationData {
    pub x: f64,
    pub y: f64,
    pub strength: f64,
}

impl InterpolationData {
    pub fn new(x: f64, y: f64, strength: f64) -> Self {
        InterpolationData { x, y, strength }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusteredObject {
    pub x: f64,
    pub y: f64,
    pub time: DateTime<Utc>,
    pub side: VehicleSide,
    pub mean_strength: f64,
    pub point_count: usize,
}

impl ClusteredObject {
    pub fn distance_to(&self, x: f64, y: f64) -> f64 {
        ((self.x - x) * (self.x - x) + (self.y - y) * (self.y - y)).sqrt()
    }

    pub fn to_csv_string(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.x,
            self.y,
            self.time.to_rfc3339(),
            self.side,
            self.mean_strength,
            self.point_count
        )
    }

    pub fn get_csv_header() -> &'static str {
        "x,y,time,side,meanStrength,pointCount"
    }
}

impl fmt::Display for ClusteredObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cluster at ({:.2}, {:.2}) strength {:.0} size {} [{}]",
            self.side,
            self.x,
            self.y,
            self.mean_strength,
            self.point_count,
            self.time.format("%H:%M:%S%.3f")
        )
    }
}

/// Counters shared by all threads of a pipeline run.
#[derive(Debug, Default)]
pub struct Statistics {
    pub packets_framed: AtomicU64,
    pub bytes_dropped: AtomicU64,
    pub packets_processed: AtomicU64,
    pub broken_packets: AtomicU64,
    pub clusters_emitted: AtomicU64,
    pub packets_saved: AtomicU64,
    pub save_failures: AtomicU64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        for counter in [
            &self.packets_framed,
            &self.bytes_dropped,
            &self.packets_processed,
            &self.broken_packets,
            &self.clusters_emitted,
            &self.packets_saved,
            &self.save_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "framed {} processed {} broken {} clusters {} saved {} (failed {}) dropped {} bytes",
            self.packets_framed.load(Ordering::Relaxed),
            self.packets_processed.load(Ordering::Relaxed),
            self.broken_packets.load(Ordering::Relaxed),
            self.clusters_emitted.load(Ordering::Relaxed),
            self.packets_saved.load(Ordering::Relaxed),
            self.save_failures.load(Ordering::Relaxed),
            self.bytes_dropped.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn vehicle_side_names() {
        assert_eq!(VehicleSide::from_str("LEFT").unwrap(), VehicleSide::Left);
        assert_eq!(VehicleSide::from_str("right").unwrap(), VehicleSide::Right);
        assert_eq!(VehicleSide::Left.to_string(), "left");
        assert_eq!(VehicleSide::Right as u8, 1);
        assert!(VehicleSide::from_str("up").is_err());
    }

    #[test]
    fn cluster_distance_and_csv() {
        let time = DateTime::from_timestamp(1_600_000_000, 0).unwrap();
        let cluster = ClusteredObject {
            x: 3.0,
            y: 4.0,
            time,
            side: VehicleSide::Left,
            mean_strength: 1800.5,
            point_count: 7,
        };
        assert_eq!(cluster.distance_to(0.0, 0.0), 5.0);
        assert_eq!(
            cluster.to_csv_string(),
            "3,4,2020-09-13T12:26:40+00:00,left,1800.5,7"
        );

        let json = serde_json::to_string(&cluster).unwrap();
        assert!(json.contains("\"meanStrength\":1800.5"));
        assert!(json.contains("\"side\":\"left\""));
    }
}
