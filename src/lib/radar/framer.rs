use chrono::{DateTime, Utc};
use log::{debug, trace, warn};

use super::Packet;
use super::packet::{HEADER_LENGTH, MAGIC, PACKET_LENGTH_OFFSET, TLV_HEADER_LENGTH, read_u32_le};

/// Smallest packet that can hold the header and one TLV record
pub const MIN_PACKET_LENGTH: usize = HEADER_LENGTH + TLV_HEADER_LENGTH;
/// Length of a heatmap packet as the sensor sends it, padded to a multiple of 32
pub const NOMINAL_PACKET_LENGTH: usize = 8256;
/// Anything longer than this is a magic look-alike inside sample data
pub const MAX_PACKET_LENGTH: usize = 1 << 20;

/// Cuts the undelimited sensor byte stream into packets.
///
/// The buffer is owned by the single thread that feeds it, no locking.
/// Bytes before a magic preamble can never start a packet and are dropped;
/// the last 7 bytes are kept when no magic was seen as they may hold the
/// start of a preamble that is split over two reads.
#[derive(Debug, Default)]
pub struct PacketFramer {
    buf: Vec<u8>,
    bytes_dropped: u64,
}

impl PacketFramer {
    pub fn new() -> Self {
        PacketFramer {
            buf: Vec::with_capacity(4 * NOMINAL_PACKET_LENGTH),
            bytes_dropped: 0,
        }
    }

    /// Appends `bytes` and returns every packet that is now complete, stamped
    /// with the current time.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Packet> {
        self.feed_at(bytes, Utc::now())
    }

    pub fn feed_at(&mut self, bytes: &[u8], now: DateTime<Utc>) -> Vec<Packet> {
        self.buf.extend_from_slice(bytes);

        let mut packets = Vec::new();
        let mut pos = 0;

        loop {
            let start = match find_magic(&self.buf[pos..]) {
                Some(offset) => pos + offset,
                None => {
                    let keep_from = self.buf.len().saturating_sub(MAGIC.len() - 1).max(pos);
                    self.drop_bytes(keep_from - pos);
                    pos = keep_from;
                    break;
                }
            };
            self.drop_bytes(start - pos);
            pos = start;

            let declared = match read_u32_le(&self.buf, start + PACKET_LENGTH_OFFSET) {
                Some(length) => length as usize,
                None => break, // wait for the length field
            };
            if !(MIN_PACKET_LENGTH..=MAX_PACKET_LENGTH).contains(&declared) {
                warn!(
                    "Ignoring magic at {} with implausible packet length {}",
                    start, declared
                );
                self.drop_bytes(1);
                pos = start + 1;
                continue;
            }
            if self.buf.len() < start + declared {
                trace!(
                    "Packet of {} bytes incomplete, have {}",
                    declared,
                    self.buf.len() - start
                );
                break;
            }

            packets.push(Packet::new(self.buf[start..start + declared].to_vec(), now));
            pos = start + declared;
        }

        self.buf.drain(..pos);
        if !packets.is_empty() {
            debug!(
                "Framed {} packets, {} bytes buffered",
                packets.len(),
                self.buf.len()
            );
        }
        packets
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Total number of bytes discarded because no packet could start there
    pub fn bytes_dropped(&self) -> u64 {
        self.bytes_dropped
    }

    fn drop_bytes(&mut self, n: usize) {
        if n > 0 {
            trace!("Dropping {} bytes without magic", n);
            self.bytes_dropped += n as u64;
        }
    }
}

fn find_magic(data: &[u8]) -> Option<usize> {
    data.windows(MAGIC.len()).position(|w| w == MAGIC)
}
