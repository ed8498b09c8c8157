//! Program assembly: packets arrive in stream order grouped into packet
//! sets; each set becomes a group of one or more send sequences with repeat
//! and delay metadata.

use crate::sequence::{PacketSequence, RecordHeader, RECORD_HEADER_LEN};
use crate::ttag::TtagMarkers;

/// A packet set: consecutive sequences played back to back and repeated as a
/// unit, with an inter-repeat gap carried by the last sequence's tail delay.
#[derive(Debug, Clone, Default)]
pub struct Group {
    pub repeats: u64,
    pub sequences: Vec<PacketSequence>,
}

impl Group {
    /// Packets emitted by one full play of this group.
    pub fn packets_per_play(&self) -> u64 {
        self.repeats * self.sequences.iter().map(|s| s.packets).sum::<u64>()
    }
}

/// A fully assembled transmit program.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub groups: Vec<Group>,
    /// Group index to loop back to after the final group, None for one-shot.
    pub return_to: Option<usize>,
    /// Gap before looping back, microseconds.
    pub loop_delay_usec: i64,
    pub ttag_markers: TtagMarkers,
    /// Packets in one full revolution, counting every repeat.
    pub packet_list_size: u64,
}

impl Program {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Builds a `Program` from `begin_packet_set`/`append` calls, rolling over
/// to a fresh sequence whenever a send buffer fills up.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    program: Program,
    track_stream_stats: bool,
    set_size: u64,
    packet_count: u64,
    open: bool,
}

impl ProgramBuilder {
    pub fn new(track_stream_stats: bool) -> Self {
        ProgramBuilder {
            track_stream_stats,
            ..Default::default()
        }
    }

    /// Applies to sequences opened from now on.
    pub fn set_stream_stats_tracking(&mut self, enable: bool) {
        self.track_stream_stats = enable;
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn program_mut(&mut self) -> &mut Program {
        &mut self.program
    }

    /// Open a new packet set of `size` packets, played `repeats` times with
    /// the given gap between repeats.
    pub fn begin_packet_set(&mut self, size: u64, repeats: u64, delay_sec: i64, delay_nsec: i64) {
        debug_assert!(repeats >= 1);
        let mut seq = PacketSequence::new(self.track_stream_stats);
        seq.usec_delay = delay_sec * 1_000_000 + delay_nsec / 1000;
        self.program.groups.push(Group {
            repeats,
            sequences: vec![seq],
        });
        self.set_size = size;
        self.packet_count = 0;
        self.open = true;
    }

    /// Append one packet with its relative timestamp to the open set.
    pub fn append(&mut self, sec: i64, nsec: i64, packet: &[u8]) -> bool {
        assert!(self.open, "append without an open packet set");
        let hdr = RecordHeader {
            captured_len: packet.len() as u32,
            wire_len: packet.len() as u32,
            ts_sec: sec,
            ts_usec: nsec / 1000,
        };

        let group = self.program.groups.last_mut().expect("open packet set");
        let repeats = group.repeats;
        let full = !group
            .sequences
            .last()
            .expect("group holds a sequence")
            .has_free_space(2 * RECORD_HEADER_LEN + packet.len());
        if full {
            // Close the full sequence: its tail delay becomes the gap to the
            // incoming packet.
            let closed = group.sequences.last_mut().expect("group holds a sequence");
            if let Some(last_ts) = closed.last_ts_usec() {
                closed.usec_delay = hdr.ts_usec_total() - last_ts;
            }
            group
                .sequences
                .push(PacketSequence::new(self.track_stream_stats));
        }
        let ok = group
            .sequences
            .last_mut()
            .expect("group holds a sequence")
            .append(hdr, packet);
        if ok {
            self.packet_count += 1;
            self.program.packet_list_size += repeats;
        }

        if self.packet_count == self.set_size {
            self.close_set();
        }
        ok
    }

    /// The set is complete. When it spilled over several sequences, the
    /// inter-repeat gap moves from the first sequence to the last and the
    /// first sequence plays with no tail delay.
    fn close_set(&mut self) {
        let group = self.program.groups.last_mut().expect("open packet set");
        if group.sequences.len() > 1 {
            let head_delay = group.sequences[0].usec_delay;
            group.sequences[0].usec_delay = 0;
            let last = group.sequences.len() - 1;
            group.sequences[last].usec_delay = head_delay;
            log::debug!(
                "packet set closed across {} sequences, inter-repeat gap {head_delay}us",
                group.sequences.len()
            );
        }
        self.open = false;
        self.set_size = 0;
        self.packet_count = 0;
    }

    /// When enabled, the engine returns to the first group after the final
    /// one until stopped.
    pub fn set_loop(&mut self, enable: bool, delay_sec: i64, delay_nsec: i64) {
        self.program.return_to = enable.then_some(0);
        self.program.loop_delay_usec = delay_sec * 1_000_000 + delay_nsec / 1000;
    }

    pub fn set_ttag_markers(&mut self, indices: &[u32], repeat_interval: u32) {
        self.program.ttag_markers = TtagMarkers::from_indices(indices, repeat_interval);
        if let Some(first) = self.program.ttag_markers.first_pkt {
            log::debug!(
                "ttag repeat interval {repeat_interval}, first pkt {first}, delta markers {:?}",
                self.program.ttag_markers.deltas
            );
        }
    }

    /// Drop the assembled program. The caller ensures the engine is not
    /// running.
    pub fn clear(&mut self) {
        self.program = Program::default();
        self.set_size = 0;
        self.packet_count = 0;
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_list_size_counts_repeats() {
        let mut builder = ProgramBuilder::new(false);
        builder.begin_packet_set(2, 5, 0, 10_000_000);
        assert!(builder.append(0, 0, &[0u8; 64]));
        assert!(builder.append(0, 1_000_000, &[0u8; 64]));
        builder.begin_packet_set(1, 2, 0, 0);
        assert!(builder.append(0, 0, &[0u8; 100]));

        let program = builder.program();
        assert_eq!(program.packet_list_size, 2 * 5 + 1 * 2);
        assert_eq!(program.groups.len(), 2);
        assert_eq!(program.groups[0].repeats, 5);
        assert_eq!(program.groups[0].sequences.len(), 1);
        assert_eq!(program.groups[0].sequences[0].usec_delay, 10_000);
        assert_eq!(program.groups[0].packets_per_play(), 10);
        assert_eq!(program.groups[1].packets_per_play(), 2);
    }

    #[test]
    fn rollover_splits_a_set_across_sequences() {
        let mut builder = ProgramBuilder::new(false);
        builder.begin_packet_set(3, 4, 2, 0);
        let big = vec![0u8; 400_000];
        assert!(builder.append(0, 0, &big));
        assert!(builder.append(0, 1_000_000, &big));
        // the third packet does not fit: the first sequence closes with the
        // timestamp gap as its tail delay
        assert!(builder.append(0, 2_000_000, &big));

        let program = builder.program();
        assert_eq!(program.groups.len(), 1);
        let group = &program.groups[0];
        assert_eq!(group.sequences.len(), 2);
        assert_eq!(group.sequences[0].packets, 2);
        assert_eq!(group.sequences[1].packets, 1);
        // set closure moved the head's current delay (the rollover gap) to
        // the tail sequence and zeroed the head
        assert_eq!(group.sequences[0].usec_delay, 0);
        assert_eq!(group.sequences[1].usec_delay, 1000);
        assert_eq!(program.packet_list_size, 3 * 4);
        assert_eq!(group.packets_per_play(), 12);
    }

    #[test]
    fn single_sequence_set_keeps_its_gap() {
        let mut builder = ProgramBuilder::new(false);
        builder.begin_packet_set(1, 3, 0, 5_000_000);
        assert!(builder.append(0, 0, &[0u8; 64]));
        let program = builder.program();
        assert_eq!(program.groups[0].sequences[0].usec_delay, 5_000);
    }

    #[test]
    fn loop_mode_and_clear() {
        let mut builder = ProgramBuilder::new(false);
        builder.begin_packet_set(1, 1, 0, 0);
        assert!(builder.append(0, 0, &[0u8; 64]));
        builder.set_loop(true, 0, 5_000_000);
        assert_eq!(builder.program().return_to, Some(0));
        assert_eq!(builder.program().loop_delay_usec, 5_000);
        builder.set_loop(false, 0, 0);
        assert_eq!(builder.program().return_to, None);

        builder.clear();
        assert!(builder.program().is_empty());
        assert_eq!(builder.program().packet_list_size, 0);
    }

    #[test]
    #[should_panic(expected = "append without an open packet set")]
    fn append_requires_an_open_set() {
        let mut builder = ProgramBuilder::new(false);
        builder.append(0, 0, &[0u8; 64]);
    }
}
