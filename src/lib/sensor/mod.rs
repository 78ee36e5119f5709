use log::trace;
use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

use crate::radar::RadarError;

pub mod replay;
pub mod serial;

pub use replay::{ReplaySource, open_replay};
pub use serial::SerialSensor;

/// Outcome of one poll of a byte source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRead {
    /// This many bytes were placed at the start of the buffer
    Bytes(usize),
    /// Nothing worth reading yet, poll again
    Idle,
    /// The source has nothing more to give
    Finished,
}

///
/// Anything that produces the sensor byte stream. The reader thread of a
/// pipeline run owns the source for the duration of the run and hands it
/// back when the run ends.
///
pub trait ByteSource: Send {
    fn name(&self) -> String;

    ///
    /// Prepare the source, for a sensor this opens the ports and starts the
    /// sensor. A failure here fails the start of the run.
    ///
    fn open(&mut self) -> Result<(), RadarError>;

    fn read(&mut self, buf: &mut [u8]) -> Result<SourceRead, RadarError>;

    ///
    /// Everything already received but not yet read, called once when the
    /// read loop is told to stop.
    ///
    fn drain(&mut self) -> Result<Vec<u8>, RadarError> {
        Ok(Vec::new())
    }

    fn stop(&mut self) -> Result<(), RadarError>;
}

const IDLE_PAUSE: Duration = Duration::from_millis(5);

/// A byte stream held in memory, handed out in the chunks it was given in.
pub struct MemorySource {
    chunks: VecDeque<Vec<u8>>,
    keep_open: bool,
    opened: bool,
}

impl MemorySource {
    pub fn new(chunks: Vec<Vec<u8>>) -> Self {
        MemorySource {
            chunks: chunks.into(),
            keep_open: false,
            opened: false,
        }
    }

    pub fn from_stream(bytes: &[u8], chunk_size: usize) -> Self {
        Self::new(bytes.chunks(chunk_size.max(1)).map(|c| c.to_vec()).collect())
    }

    /// Report idle instead of finished once all chunks are read, like a
    /// sensor that went quiet
    pub fn keep_open(mut self) -> Self {
        self.keep_open = true;
        self
    }

    pub fn remaining(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }
}

impl ByteSource for MemorySource {
    fn name(&self) -> String {
        "memory".to_string()
    }

    fn open(&mut self) -> Result<(), RadarError> {
        self.opened = true;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<SourceRead, RadarError> {
        if !self.opened {
            return Err(RadarError::NotRunning);
        }
        let Some(chunk) = self.chunks.front_mut() else {
            if self.keep_open {
                thread::sleep(IDLE_PAUSE);
                return Ok(SourceRead::Idle);
            }
            return Ok(SourceRead::Finished);
        };

        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n == chunk.len() {
            self.chunks.pop_front();
        } else {
            chunk.drain(..n);
        }
        trace!("memory source: {} bytes", n);
        Ok(SourceRead::Bytes(n))
    }

    fn drain(&mut self) -> Result<Vec<u8>, RadarError> {
        Ok(self.chunks.drain(..).flatten().collect())
    }

    fn stop(&mut self) -> Result<(), RadarError> {
        self.opened = false;
        Ok(())
    }
}
