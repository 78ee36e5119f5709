// Synthetic sensor packets for the unit tests

use std::ops::RangeInclusive;

use super::heatmap::{HEATMAP_LENGTH, VIRTUAL_ANTENNAS};
use super::packet::{HEADER_LENGTH, Header, TLV_AZIMUTH_HEATMAP, TLV_HEADER_LENGTH};

pub(crate) fn packet_with_tlvs(tlvs: &[(u32, Vec<u8>)]) -> Vec<u8> {
    let length = HEADER_LENGTH
        + tlvs
            .iter()
            .map(|(_, p)| TLV_HEADER_LENGTH + p.len())
            .sum::<usize>();
    let header = Header {
        version: 0x0301_0004,
        packet_length: length as u32,
        platform: 0xa1642,
        frame_num: 1,
        cpu_cycles: 0,
        num_det_obj: 0,
        num_tlvs: tlvs.len() as u32,
        sub_frame_num: 0,
    };

    let mut packet = Vec::with_capacity(length);
    packet.extend_from_slice(&header.to_bytes());
    for (tlv_type, payload) in tlvs {
        packet.extend_from_slice(&tlv_type.to_le_bytes());
        packet.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        packet.extend_from_slice(payload);
    }
    packet
}

pub(crate) fn heatmap_bytes(samples: &[i16]) -> Vec<u8> {
    assert_eq!(samples.len() * 2, HEATMAP_LENGTH);
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

pub(crate) fn heatmap_packet(samples: &[i16]) -> Vec<u8> {
    packet_with_tlvs(&[(TLV_AZIMUTH_HEATMAP, heatmap_bytes(samples))])
}

pub(crate) fn zero_heatmap_packet() -> Vec<u8> {
    heatmap_packet(&vec![0i16; HEATMAP_LENGTH / 2])
}

/// Samples that put `re` on every virtual antenna of the given range bins, a
/// target straight ahead of the sensor.
pub(crate) fn broadside_target(re: i16, ranges: RangeInclusive<usize>) -> Vec<i16> {
    let mut samples = vec![0i16; HEATMAP_LENGTH / 2];
    for range in ranges {
        for antenna in 0..VIRTUAL_ANTENNAS {
            let pair = range * VIRTUAL_ANTENNAS + antenna;
            samples[2 * pair] = 0; // imaginary part comes first
            samples[2 * pair + 1] = re;
        }
    }
    samples
}
