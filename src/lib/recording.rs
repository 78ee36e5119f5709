use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::radar::packet::{MAGIC, PACKET_LENGTH_OFFSET, read_u32_le};
use crate::radar::{ClusteredObject, Packet, RadarError};

pub const RAW_FILE_NAME: &str = "mmWaveRawData.bin";
pub const CLUSTER_FILE_NAME: &str = "mmWaveClusters.csv";

const TIMESTAMP_LENGTH: usize = 8;

///
/// Where a run persists what it sees. Both calls may come from several
/// threads at once; they report success instead of failing the run.
///
pub trait PacketSink: Send + Sync {
    fn save_packet(&self, raw: &[u8], received_at: DateTime<Utc>) -> bool;

    fn save_clusters(&self, clusters: &[ClusteredObject]) -> bool;
}

struct RecordFile {
    path: PathBuf,
    file: Option<File>,
    header: Option<&'static str>,
}

impl RecordFile {
    fn new(path: PathBuf, header: Option<&'static str>) -> Self {
        RecordFile {
            path,
            file: None,
            header,
        }
    }

    fn append(&mut self, record: &[u8]) -> Result<(), RadarError> {
        if self.file.is_none() {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            if let Some(header) = self.header {
                if file.metadata()?.len() == 0 {
                    writeln!(file, "{}", header)?;
                }
            }
            debug!("Appending to '{}'", self.path.display());
            self.file = Some(file);
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(record)?;
        }
        Ok(())
    }
}

/// Appends raw packets and clusters of a run to two files in one directory.
///
/// Raw packets are stored back to back, each preceded by its receive time
/// as little endian i64 microseconds since the Unix epoch.
pub struct RunRecorder {
    raw: Mutex<RecordFile>,
    clusters: Mutex<RecordFile>,
}

impl RunRecorder {
    pub fn new(directory: &Path) -> Result<Self, RadarError> {
        fs::create_dir_all(directory)?;
        info!("Recording to '{}'", directory.display());

        Ok(RunRecorder {
            raw: Mutex::new(RecordFile::new(directory.join(RAW_FILE_NAME), None)),
            clusters: Mutex::new(RecordFile::new(
                directory.join(CLUSTER_FILE_NAME),
                Some(ClusteredObject::get_csv_header()),
            )),
        })
    }

    pub fn raw_path(&self) -> PathBuf {
        self.raw.lock().unwrap_or_else(PoisonError::into_inner).path.clone()
    }

    pub fn cluster_path(&self) -> PathBuf {
        self.clusters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .path
            .clone()
    }

    pub fn append_packet(&self, raw: &[u8], received_at: DateTime<Utc>) -> Result<(), RadarError> {
        let mut record = Vec::with_capacity(TIMESTAMP_LENGTH + raw.len());
        record.extend_from_slice(&received_at.timestamp_micros().to_le_bytes());
        record.extend_from_slice(raw);

        self.raw
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .append(&record)
    }

    pub fn append_clusters(&self, clusters: &[ClusteredObject]) -> Result<(), RadarError> {
        if clusters.is_empty() {
            return Ok(());
        }
        let lines: String = clusters
            .iter()
            .map(|c| c.to_csv_string() + "\n")
            .collect();

        self.clusters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .append(lines.as_bytes())
    }
}

impl PacketSink for RunRecorder {
    fn save_packet(&self, raw: &[u8], received_at: DateTime<Utc>) -> bool {
        match self.append_packet(raw, received_at) {
            Ok(()) => true,
            Err(e) => {
                warn!("Cannot save packet: {}", e);
                false
            }
        }
    }

    fn save_clusters(&self, clusters: &[ClusteredObject]) -> bool {
        match self.append_clusters(clusters) {
            Ok(()) => true,
            Err(e) => {
                warn!("Cannot save {} clusters: {}", clusters.len(), e);
                false
            }
        }
    }
}

/// Reads back a raw packet recording. Each packet's length comes from its
/// own header.
pub fn read_recording(path: &Path) -> Result<Vec<Packet>, RadarError> {
    let data = fs::read(path)?;
    let mut packets = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let record = &data[pos..];
        if record.len() < TIMESTAMP_LENGTH + PACKET_LENGTH_OFFSET + 4 {
            return Err(RadarError::Truncated {
                what: "recorded packet header",
                needed: TIMESTAMP_LENGTH + PACKET_LENGTH_OFFSET + 4,
                available: record.len(),
            });
        }
        let mut micros = [0u8; TIMESTAMP_LENGTH];
        micros.copy_from_slice(&record[..TIMESTAMP_LENGTH]);
        let received_at =
            DateTime::from_timestamp_micros(i64::from_le_bytes(micros)).unwrap_or_default();

        let packet = &record[TIMESTAMP_LENGTH..];
        if packet[..MAGIC.len()] != MAGIC {
            return Err(RadarError::InvalidRecording(format!(
                "'{}' has no packet at offset {}",
                path.display(),
                pos + TIMESTAMP_LENGTH
            )));
        }
        let length = read_u32_le(packet, PACKET_LENGTH_OFFSET).unwrap_or_default() as usize;
        if packet.len() < length || length < PACKET_LENGTH_OFFSET + 4 {
            return Err(RadarError::Truncated {
                what: "recorded packet",
                needed: length,
                available: packet.len(),
            });
        }

        packets.push(Packet::new(packet[..length].to_vec(), received_at));
        pos += TIMESTAMP_LENGTH + length;
    }

    info!("Read {} packets from '{}'", packets.len(), path.display());
    Ok(packets)
}

/// Whether the file starts like a packet recording rather than a plain
/// capture of the DATA port
pub fn looks_like_recording(path: &Path) -> Result<bool, RadarError> {
    let mut start = [0u8; TIMESTAMP_LENGTH + 8];
    let mut file = File::open(path)?;
    match file.read_exact(&mut start) {
        Ok(()) => Ok(start[TIMESTAMP_LENGTH..] == MAGIC),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radar::VehicleSide;
    use crate::radar::testdata;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("mmwave-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn raw_packets_read_back() {
        let dir = scratch_dir("raw");
        let recorder = RunRecorder::new(&dir).unwrap();
        let first = testdata::zero_heatmap_packet();
        let second = testdata::packet_with_tlvs(&[(1, vec![5; 20])]);
        let t1 = DateTime::from_timestamp_micros(1_700_000_000_123_456).unwrap();
        let t2 = DateTime::from_timestamp_micros(1_700_000_000_223_456).unwrap();

        assert!(recorder.save_packet(&first, t1));
        assert!(recorder.save_packet(&second, t2));
        assert_eq!(
            fs::metadata(recorder.raw_path()).unwrap().len() as usize,
            16 + first.len() + second.len()
        );
        assert!(looks_like_recording(&recorder.raw_path()).unwrap());

        let packets = read_recording(&recorder.raw_path()).unwrap();
        assert_eq!(
            packets,
            vec![Packet::new(first, t1), Packet::new(second, t2)]
        );
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn truncated_recording() {
        let dir = scratch_dir("truncated");
        let recorder = RunRecorder::new(&dir).unwrap();
        recorder
            .append_packet(&testdata::zero_heatmap_packet(), Utc::now())
            .unwrap();
        let mut data = fs::read(recorder.raw_path()).unwrap();
        data.truncate(data.len() - 100);
        fs::write(recorder.raw_path(), &data).unwrap();

        assert!(matches!(
            read_recording(&recorder.raw_path()),
            Err(RadarError::Truncated { .. })
        ));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn stream_capture_is_not_a_recording() {
        let dir = scratch_dir("capture");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("capture.dat");
        fs::write(&path, testdata::zero_heatmap_packet()).unwrap();
        assert!(!looks_like_recording(&path).unwrap());
        fs::write(&path, [1, 2, 3]).unwrap();
        assert!(!looks_like_recording(&path).unwrap());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn cluster_csv_has_one_header() {
        let dir = scratch_dir("clusters");
        let cluster = ClusteredObject {
            x: 0.5,
            y: 2.25,
            time: DateTime::from_timestamp(1_600_000_000, 0).unwrap(),
            side: VehicleSide::Right,
            mean_strength: 2100.,
            point_count: 9,
        };

        let recorder = RunRecorder::new(&dir).unwrap();
        assert!(recorder.save_clusters(&[cluster.clone()]));
        assert!(recorder.save_clusters(&[]));
        drop(recorder);
        let recorder = RunRecorder::new(&dir).unwrap();
        assert!(recorder.save_clusters(&[cluster.clone(), cluster]));

        let text = fs::read_to_string(recorder.cluster_path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "x,y,time,side,meanStrength,pointCount");
        assert_eq!(lines[1], "0.5,2.25,2020-09-13T12:26:40+00:00,right,2100,9");
        assert_eq!(lines[3], lines[1]);
        fs::remove_dir_all(&dir).unwrap();
    }
}
