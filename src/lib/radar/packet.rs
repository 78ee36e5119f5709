use log::{trace, warn};

use super::{Packet, RadarError};

/*
 Packet layout as sent by the sensor on its DATA port, all fields little endian:

   offset  0: magic             02 01 04 03 06 05 08 07
   offset  8: version           u32
   offset 12: packet length     u32, includes magic and header
   offset 16: platform          u32
   offset 20: frame number      u32
   offset 24: cpu cycles        u32
   offset 28: detected objects  u32
   offset 32: number of TLVs    u32
   offset 36: sub frame number  u32
   offset 40: TLV records, each a u32 type, u32 length and `length` payload bytes
*/

pub const MAGIC: [u8; 8] = [2, 1, 4, 3, 6, 5, 8, 7];
pub const PACKET_LENGTH_OFFSET: usize = 12;
pub const HEADER_LENGTH: usize = 40;
pub const TLV_HEADER_LENGTH: usize = 8;

pub const TLV_AZIMUTH_HEATMAP: u32 = 4;

/// Little endian u32 at `offset`, if the slice is long enough.
pub fn read_u32_le(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub version: u32,
    pub packet_length: u32,
    pub platform: u32,
    pub frame_num: u32,
    pub cpu_cycles: u32,
    pub num_det_obj: u32,
    pub num_tlvs: u32,
    pub sub_frame_num: u32,
}

impl Header {
    pub fn parse(payload: &[u8]) -> Result<Header, RadarError> {
        if payload.len() < HEADER_LENGTH {
            return Err(RadarError::Truncated {
                what: "packet header",
                needed: HEADER_LENGTH,
                available: payload.len(),
            });
        }
        let field = |n: usize| read_u32_le(payload, MAGIC.len() + n * 4).unwrap_or_default();

        Ok(Header {
            version: field(0),
            packet_length: field(1),
            platform: field(2),
            frame_num: field(3),
            cpu_cycles: field(4),
            num_det_obj: field(5),
            num_tlvs: field(6),
            sub_frame_num: field(7),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LENGTH] {
        let mut bytes = [0u8; HEADER_LENGTH];
        bytes[..MAGIC.len()].copy_from_slice(&MAGIC);
        let fields = [
            self.version,
            self.packet_length,
            self.platform,
            self.frame_num,
            self.cpu_cycles,
            self.num_det_obj,
            self.num_tlvs,
            self.sub_frame_num,
        ];
        for (n, value) in fields.iter().enumerate() {
            let offset = MAGIC.len() + n * 4;
            bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }
        bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub tlv_type: u32,
    pub length: u32,
    /// Offset of the payload within the packet
    pub offset: usize,
    pub payload: &'a [u8],
}

/// Walks the `num_tlvs` records that follow the header. Stops early when a
/// record does not fit in the packet.
pub struct TlvIter<'a> {
    data: &'a [u8],
    offset: usize,
    remaining: u32,
}

impl<'a> Iterator for TlvIter<'a> {
    type Item = Tlv<'a>;

    fn next(&mut self) -> Option<Tlv<'a>> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let (tlv_type, length) = match (
            read_u32_le(self.data, self.offset),
            read_u32_le(self.data, self.offset + 4),
        ) {
            (Some(t), Some(l)) => (t, l),
            _ => {
                warn!(
                    "TLV header at offset {} beyond packet end {}",
                    self.offset,
                    self.data.len()
                );
                self.remaining = 0;
                return None;
            }
        };
        let start = self.offset + TLV_HEADER_LENGTH;
        let end = start.saturating_add(length as usize);
        if end > self.data.len() {
            warn!(
                "TLV type {} length {} at offset {} exceeds packet length {}",
                tlv_type,
                length,
                self.offset,
                self.data.len()
            );
            self.remaining = 0;
            return None;
        }
        trace!("TLV type {} length {} at offset {}", tlv_type, length, start);

        self.offset = end;
        Some(Tlv {
            tlv_type,
            length,
            offset: start,
            payload: &self.data[start..end],
        })
    }
}

pub fn parse(packet: &Packet) -> Result<(Header, TlvIter<'_>), RadarError> {
    parse_payload(&packet.payload)
}

pub fn parse_payload(payload: &[u8]) -> Result<(Header, TlvIter<'_>), RadarError> {
    let header = Header::parse(payload)?;
    let tlvs = TlvIter {
        data: payload,
        offset: HEADER_LENGTH,
        remaining: header.num_tlvs,
    };
    Ok((header, tlvs))
}

/// The azimuth heatmap record of a packet. When a packet carries more than
/// one, the last one wins.
pub fn azimuth_heatmap(payload: &[u8]) -> Result<Option<Tlv<'_>>, RadarError> {
    let (_header, tlvs) = parse_payload(payload)?;
    Ok(last_azimuth_heatmap(tlvs))
}

pub fn last_azimuth_heatmap(tlvs: TlvIter<'_>) -> Option<Tlv<'_>> {
    tlvs.filter(|tlv| {
        if tlv.tlv_type != TLV_AZIMUTH_HEATMAP {
            trace!("Skipping TLV type {} ({} bytes)", tlv.tlv_type, tlv.length);
            return false;
        }
        true
    })
    .last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radar::testdata;

    #[test]
    fn header_fields() {
        let header = Header {
            version: 0x0102_0304,
            packet_length: 8256,
            platform: 0xa1642,
            frame_num: 77,
            cpu_cycles: 123_456_789,
            num_det_obj: 3,
            num_tlvs: 1,
            sub_frame_num: 0,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[..8], &MAGIC);
        assert_eq!(&bytes[12..16], &[0x40, 0x20, 0, 0]);
        assert_eq!(&bytes[8..12], &[4, 3, 2, 1]);

        let first = Header::parse(&bytes).unwrap();
        let second = Header::parse(&bytes).unwrap();
        assert_eq!(first, header);
        assert_eq!(first, second);
    }

    #[test]
    fn short_header() {
        match Header::parse(&MAGIC) {
            Err(RadarError::Truncated {
                needed, available, ..
            }) => {
                assert_eq!(needed, HEADER_LENGTH);
                assert_eq!(available, 8);
            }
            r => panic!("Unexpected {:?}", r),
        }
    }

    #[test]
    fn skips_other_tlvs() {
        let heatmap = vec![0x11u8; 8192];
        let packet = testdata::packet_with_tlvs(&[
            (1, vec![0xaa; 24]),
            (TLV_AZIMUTH_HEATMAP, heatmap.clone()),
            (7, vec![0xbb; 3]),
        ]);

        let (header, tlvs) = parse_payload(&packet).unwrap();
        assert_eq!(header.num_tlvs, 3);
        assert_eq!(header.packet_length as usize, packet.len());
        let types: Vec<u32> = tlvs.map(|t| t.tlv_type).collect();
        assert_eq!(types, vec![1, 4, 7]);

        let tlv = azimuth_heatmap(&packet).unwrap().unwrap();
        assert_eq!(tlv.offset, HEADER_LENGTH + TLV_HEADER_LENGTH + 24 + TLV_HEADER_LENGTH);
        assert_eq!(tlv.payload, &heatmap[..]);
    }

    #[test]
    fn framed_packet_parse() {
        let received_at = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let packet = Packet::new(
            testdata::packet_with_tlvs(&[(4, vec![1; 32]), (4, vec![2; 16])]),
            received_at,
        );

        let (header, tlvs) = parse(&packet).unwrap();
        assert_eq!(header.packet_length as usize, packet.payload.len());
        let tlv = last_azimuth_heatmap(tlvs).unwrap();
        assert_eq!(tlv.payload, &[2u8; 16][..]);

        let short = Packet::new(MAGIC.to_vec(), received_at);
        assert!(matches!(parse(&short), Err(RadarError::Truncated { .. })));
    }

    #[test]
    fn truncated_tlv_stops_walk() {
        let mut packet = testdata::packet_with_tlvs(&[(2, vec![1; 16]), (4, vec![0; 64])]);
        packet.truncate(packet.len() - 10);

        let (_, tlvs) = parse_payload(&packet).unwrap();
        let types: Vec<u32> = tlvs.map(|t| t.tlv_type).collect();
        assert_eq!(types, vec![2]);
        assert!(azimuth_heatmap(&packet).unwrap().is_none());
    }
}
