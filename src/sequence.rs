use crate::sign;
use crate::stats::StreamStats;

/// Serialized size of a `RecordHeader` inside a send buffer.
pub const RECORD_HEADER_LEN: usize = 24;

/// Per-sequence send-buffer capacity. When a sequence fills up the program
/// builder rolls over to a fresh one.
const SEQUENCE_CAPACITY: usize = 1 << 20;

/// Fixed header preceding every packet in a send buffer. Timestamps are
/// relative scheduling hints, not wall-clock times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub captured_len: u32,
    pub wire_len: u32,
    pub ts_sec: i64,
    pub ts_usec: i64,
}

impl RecordHeader {
    pub fn ts_usec_total(&self) -> i64 {
        self.ts_sec * 1_000_000 + self.ts_usec
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.captured_len.to_le_bytes());
        buf.extend_from_slice(&self.wire_len.to_le_bytes());
        buf.extend_from_slice(&self.ts_sec.to_le_bytes());
        buf.extend_from_slice(&self.ts_usec.to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> RecordHeader {
        let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let i64_at = |i: usize| {
            i64::from_le_bytes([
                buf[i],
                buf[i + 1],
                buf[i + 2],
                buf[i + 3],
                buf[i + 4],
                buf[i + 5],
                buf[i + 6],
                buf[i + 7],
            ])
        };
        RecordHeader {
            captured_len: u32_at(0),
            wire_len: u32_at(4),
            ts_sec: i64_at(8),
            ts_usec: i64_at(16),
        }
    }
}

/// A pre-serialized, contiguous send buffer of packet records plus playback
/// metadata. The engine plays one sequence back as a unit.
#[derive(Debug, Clone, Default)]
pub struct PacketSequence {
    buffer: Vec<u8>,
    pub packets: u64,
    pub bytes: u64,
    /// Programmed time for one pass: the sum of inter-packet deltas.
    pub usec_duration: i64,
    /// Tail delay applied after this sequence finishes one pass.
    pub usec_delay: i64,
    /// Byte offset of the L4 checksum in every packet of this sequence,
    /// 0 when the sequence is not T-Tag eligible.
    pub ttag_l4_cksum_offset: u16,
    /// Per-stream contribution of one pass of this sequence.
    pub stream_stats_meta: StreamStats,
    last_ts: Option<i64>,
    track_stream_stats: bool,
}

impl PacketSequence {
    pub fn new(track_stream_stats: bool) -> Self {
        PacketSequence {
            track_stream_stats,
            ..Default::default()
        }
    }

    /// True iff `extra` more bytes still fit in the send buffer.
    pub fn has_free_space(&self, extra: usize) -> bool {
        self.buffer.len() + extra <= SEQUENCE_CAPACITY
    }

    /// Relative timestamp of the last appended record, microseconds.
    pub fn last_ts_usec(&self) -> Option<i64> {
        self.last_ts
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Copy one record into the buffer. Fails iff the capacity would be
    /// exceeded; a record is never split across the buffer end.
    pub fn append(&mut self, hdr: RecordHeader, packet: &[u8]) -> bool {
        debug_assert_eq!(hdr.captured_len as usize, packet.len());
        if !self.has_free_space(RECORD_HEADER_LEN + packet.len()) {
            return false;
        }
        hdr.write_to(&mut self.buffer);
        self.buffer.extend_from_slice(packet);

        let ts = hdr.ts_usec_total();
        if let Some(last) = self.last_ts {
            self.usec_duration += ts - last;
        }
        self.last_ts = Some(ts);
        self.packets += 1;
        self.bytes += u64::from(hdr.captured_len);

        if self.track_stream_stats {
            if let Some(guid) = sign::packet_guid(packet) {
                let entry = self.stream_stats_meta.entry(guid).or_default();
                entry.tx_pkts += 1;
                entry.tx_bytes += u64::from(hdr.captured_len);
            }
        }
        if self.ttag_l4_cksum_offset == 0 {
            if let Some(ofs) = sign::ttag_l4_cksum_offset(packet) {
                self.ttag_l4_cksum_offset = ofs;
            }
        }
        true
    }

    /// Walk the records in insertion order.
    pub fn records(&self) -> Records<'_> {
        Records { rest: &self.buffer }
    }

    /// Walk the records with mutable access to each payload; T-Tag stamping
    /// happens in place.
    pub fn records_mut(&mut self) -> RecordsMut<'_> {
        RecordsMut {
            rest: &mut self.buffer,
        }
    }
}

pub struct Records<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Records<'a> {
    type Item = (RecordHeader, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let hdr = RecordHeader::read_from(self.rest);
        let total = RECORD_HEADER_LEN + hdr.captured_len as usize;
        let (record, rest) = self.rest.split_at(total);
        self.rest = rest;
        Some((hdr, &record[RECORD_HEADER_LEN..]))
    }
}

pub struct RecordsMut<'a> {
    rest: &'a mut [u8],
}

impl<'a> Iterator for RecordsMut<'a> {
    type Item = (RecordHeader, &'a mut [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let hdr = RecordHeader::read_from(self.rest);
        let total = RECORD_HEADER_LEN + hdr.captured_len as usize;
        let (record, rest) = std::mem::take(&mut self.rest).split_at_mut(total);
        self.rest = rest;
        Some((hdr, &mut record[RECORD_HEADER_LEN..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hdr(len: u32, sec: i64, usec: i64) -> RecordHeader {
        RecordHeader {
            captured_len: len,
            wire_len: len,
            ts_sec: sec,
            ts_usec: usec,
        }
    }

    #[test]
    fn append_accumulates_metadata() {
        let mut seq = PacketSequence::new(false);
        assert!(seq.append(hdr(100, 0, 0), &[0xaa; 100]));
        assert!(seq.append(hdr(64, 0, 1500), &[0xbb; 64]));
        assert!(seq.append(hdr(64, 1, 500), &[0xcc; 64]));
        assert_eq!(seq.packets, 3);
        assert_eq!(seq.bytes, 228);
        // 1500us then 999_000us between the second and third record
        assert_eq!(seq.usec_duration, 1_000_500);
        assert_eq!(seq.last_ts_usec(), Some(1_000_500));
    }

    #[test]
    fn records_roundtrip_in_order() {
        let mut seq = PacketSequence::new(false);
        let payloads: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 10 + usize::from(i)]).collect();
        for (i, p) in payloads.iter().enumerate() {
            assert!(seq.append(hdr(p.len() as u32, 0, i as i64 * 1000), p));
        }
        let seen: Vec<(RecordHeader, Vec<u8>)> =
            seq.records().map(|(h, p)| (h, p.to_vec())).collect();
        assert_eq!(seen.len(), 5);
        for (i, (h, p)) in seen.iter().enumerate() {
            assert_eq!(h.captured_len as usize, payloads[i].len());
            assert_eq!(h.ts_usec, i as i64 * 1000);
            assert_eq!(p, &payloads[i]);
        }
    }

    #[test]
    fn records_mut_can_rewrite_payloads() {
        let mut seq = PacketSequence::new(false);
        assert!(seq.append(hdr(8, 0, 0), &[0u8; 8]));
        assert!(seq.append(hdr(8, 0, 10), &[1u8; 8]));
        for (_, packet) in seq.records_mut() {
            packet[0] = 0xff;
        }
        let firsts: Vec<u8> = seq.records().map(|(_, p)| p[0]).collect();
        assert_eq!(firsts, vec![0xff, 0xff]);
    }

    #[test]
    fn oversized_append_is_refused() {
        let mut seq = PacketSequence::new(false);
        let huge = vec![0u8; 2 << 20];
        assert!(!seq.append(hdr(huge.len() as u32, 0, 0), &huge));
        assert!(seq.is_empty());
        assert_eq!(seq.packets, 0);
    }

    #[test]
    fn guid_meta_collected_when_tracking() {
        let mut packet = vec![0u8; 40];
        let n = packet.len();
        packet[n - 11..n - 7].copy_from_slice(&0x42u32.to_be_bytes());
        packet[n - 7] = sign::TYPE_LEN_GUID;
        packet[n - 5] = sign::TYPE_LEN_TTAG_PLACEHOLDER;
        packet[n - 4..].copy_from_slice(&sign::MAGIC.to_be_bytes());

        let mut seq = PacketSequence::new(true);
        assert!(seq.append(hdr(40, 0, 0), &packet));
        assert!(seq.append(hdr(40, 0, 100), &packet));
        let meta = seq.stream_stats_meta.get(&0x42).unwrap();
        assert_eq!(meta.tx_pkts, 2);
        assert_eq!(meta.tx_bytes, 80);

        // untracked sequences collect nothing
        let mut seq = PacketSequence::new(false);
        assert!(seq.append(hdr(40, 0, 0), &packet));
        assert!(seq.stream_stats_meta.is_empty());
    }
}
