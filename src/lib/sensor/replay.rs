use log::info;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;

use super::{ByteSource, MemorySource, SourceRead};
use crate::radar::RadarError;
use crate::recording;

pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Plays back a byte stream captured from the DATA port.
pub struct ReplaySource {
    path: PathBuf,
    chunk_size: usize,
    reader: Option<BufReader<File>>,
    replayed: u64,
}

impl ReplaySource {
    pub fn new(path: PathBuf) -> Self {
        ReplaySource {
            path,
            chunk_size: DEFAULT_CHUNK_SIZE,
            reader: None,
            replayed: 0,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

impl ByteSource for ReplaySource {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn open(&mut self) -> Result<(), RadarError> {
        let file = File::open(&self.path)?;
        info!(
            "Replaying {} ({} bytes)",
            self.path.display(),
            file.metadata()?.len()
        );
        self.reader = Some(BufReader::new(file));
        self.replayed = 0;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<SourceRead, RadarError> {
        let reader = self.reader.as_mut().ok_or(RadarError::NotRunning)?;
        let wanted = self.chunk_size.min(buf.len());
        let n = reader.read(&mut buf[..wanted])?;
        if n == 0 {
            return Ok(SourceRead::Finished);
        }
        self.replayed += n as u64;
        Ok(SourceRead::Bytes(n))
    }

    fn drain(&mut self) -> Result<Vec<u8>, RadarError> {
        let mut rest = Vec::new();
        if let Some(reader) = self.reader.as_mut() {
            reader.read_to_end(&mut rest)?;
            self.replayed += rest.len() as u64;
        }
        Ok(rest)
    }

    fn stop(&mut self) -> Result<(), RadarError> {
        if self.reader.take().is_some() {
            info!("Replay of {} stopped after {} bytes", self.path.display(), self.replayed);
        }
        Ok(())
    }
}

/// Source for a replay file: a packet recording is played back packet by
/// packet, anything else as a raw capture of the DATA port.
pub fn open_replay(path: PathBuf) -> Result<Box<dyn ByteSource>, RadarError> {
    if recording::looks_like_recording(&path)? {
        let packets = recording::read_recording(&path)?;
        Ok(Box::new(MemorySource::new(
            packets.into_iter().map(|p| p.payload).collect(),
        )))
    } else {
        Ok(Box::new(ReplaySource::new(path)))
    }
}
