//! The transmit scheduler and sequence player: walks an assembled program at
//! microsecond timing, stamps T-Tags just in time, and reconciles per-stream
//! statistics after each run.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::clock::{self, Accuracy, Delay};
use crate::error::TxError;
use crate::program::ProgramBuilder;
use crate::sign;
use crate::sink::PacketSink;
use crate::stats::{wrapped_delta, StatsLedger, StatsSnapshot, StreamStats};
use crate::ttag::TtagStamper;

/// Poll period for start/stop synchronization with the run thread.
const STATE_POLL: Duration = Duration::from_millis(10);
/// Sequences programmed to finish within this bound may take the batched
/// sink path.
const SEND_QUEUE_CUTOFF_USEC: i64 = 1_000_000;
/// Per-record pacing inside `send_sequence`.
const SYNC_TRANSMIT: bool = true;

const NOT_STARTED: u8 = 0;
const RUNNING: u8 = 1;
const FINISHED: u8 = 2;

/// Plays an assembled program onto a `PacketSink`, honoring per-packet
/// delays, group repetition, loop mode and T-Tag stamping. One OS thread is
/// dedicated to the run loop; `start`/`stop`/`clear` come from the
/// controlling thread.
pub struct TxEngine<S: PacketSink + Send + 'static> {
    shared: Arc<Shared<S>>,
    handle: Option<JoinHandle<()>>,
}

struct Shared<S> {
    state: AtomicU8,
    stop: AtomicBool,
    stats: Arc<StatsLedger>,
    /// f64 seconds, stored as bits.
    last_tx_duration: AtomicU64,
    core: Mutex<Core<S>>,
    stream_stats: Mutex<StreamStats>,
}

/// Everything the run thread mutates. The mutex is held for the whole run;
/// the program is only edited while the engine is idle.
struct Core<S> {
    sink: S,
    builder: ProgramBuilder,
    stamper: TtagStamper,
    delay: Delay,
    track_stream_stats: bool,
    last_stats: StatsSnapshot,
}

impl<S: PacketSink + Send + 'static> TxEngine<S> {
    /// The stats ledger is owned by the caller so external observers can
    /// share it across runs.
    pub fn new(sink: S, stats: Arc<StatsLedger>) -> Self {
        TxEngine {
            shared: Arc::new(Shared {
                state: AtomicU8::new(NOT_STARTED),
                stop: AtomicBool::new(false),
                stats,
                last_tx_duration: AtomicU64::new(0f64.to_bits()),
                core: Mutex::new(Core {
                    sink,
                    builder: ProgramBuilder::new(false),
                    stamper: TtagStamper::default(),
                    delay: Delay::new(Accuracy::High),
                    track_stream_stats: false,
                    last_stats: StatsSnapshot::default(),
                }),
                stream_stats: Mutex::new(StreamStats::new()),
            }),
            handle: None,
        }
    }

    fn lock_core(&self) -> MutexGuard<'_, Core<S>> {
        self.shared.core.lock().expect("engine thread panicked")
    }

    pub fn set_rate_accuracy(&self, accuracy: Accuracy) -> Result<(), TxError> {
        if self.is_running() {
            return Err(TxError::Misconfiguration(
                "cannot switch rate accuracy while transmitting",
            ));
        }
        self.lock_core().delay = Delay::new(accuracy);
        match accuracy {
            Accuracy::High => log::warn!("rate accuracy set to High - busy wait"),
            Accuracy::Low => log::warn!("rate accuracy set to Low - OS sleep"),
        }
        Ok(())
    }

    pub fn set_stream_stats_tracking(&self, enable: bool) {
        let mut core = self.lock_core();
        core.track_stream_stats = enable;
        core.builder.set_stream_stats_tracking(enable);
    }

    pub fn set_packet_list_loop_mode(&self, enable: bool, delay_sec: i64, delay_nsec: i64) {
        self.lock_core().builder.set_loop(enable, delay_sec, delay_nsec);
    }

    pub fn set_packet_list_ttag_markers(&self, indices: &[u32], repeat_interval: u32) {
        self.lock_core()
            .builder
            .set_ttag_markers(indices, repeat_interval);
    }

    /// Open the next packet set: the following `size` appends form one group
    /// played `repeats` times.
    pub fn loop_next_packet_set(&self, size: u64, repeats: u64, delay_sec: i64, delay_nsec: i64) {
        self.lock_core()
            .builder
            .begin_packet_set(size, repeats, delay_sec, delay_nsec);
    }

    pub fn append_to_packet_list(&self, sec: i64, nsec: i64, packet: &[u8]) -> bool {
        self.lock_core().builder.append(sec, nsec, packet)
    }

    pub fn clear_packet_list(&self) {
        assert!(!self.is_running(), "clear_packet_list while transmitting");
        self.lock_core().builder.clear();
    }

    /// Replace the sink. The previous one is dropped here, releasing its
    /// handle exactly once.
    pub fn set_sink(&self, sink: S) -> Result<(), TxError> {
        if self.is_running() {
            return Err(TxError::Misconfiguration(
                "cannot replace the sink while transmitting",
            ));
        }
        self.lock_core().sink = sink;
        Ok(())
    }

    pub fn stats(&self) -> Arc<StatsLedger> {
        Arc::clone(&self.shared.stats)
    }

    pub fn stream_stats(&self) -> StreamStats {
        self.shared
            .stream_stats
            .lock()
            .expect("stream stats poisoned")
            .clone()
    }

    pub fn clear_stream_stats(&self) {
        self.shared
            .stream_stats
            .lock()
            .expect("stream stats poisoned")
            .clear();
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == RUNNING
    }

    /// Duration of the last run in seconds.
    pub fn last_tx_duration(&self) -> f64 {
        f64::from_bits(self.shared.last_tx_duration.load(Ordering::Relaxed))
    }

    /// Launch the run thread and block until it leaves `NotStarted`.
    pub fn start(&mut self) -> Result<(), TxError> {
        if self.is_running() {
            return Err(TxError::Misconfiguration(
                "transmit start requested but already running",
            ));
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join(); // reap the previous run
        }
        self.shared.stop.store(false, Ordering::Release);
        self.shared.state.store(NOT_STARTED, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("wireplay-tx".into())
            .spawn(move || shared.run())?;
        self.handle = Some(handle);
        while self.shared.state.load(Ordering::Acquire) == NOT_STARTED {
            thread::sleep(STATE_POLL);
        }
        Ok(())
    }

    /// Request cancellation and block until the run thread finishes. The
    /// program and counters stay intact.
    pub fn stop(&mut self) -> Result<(), TxError> {
        if !self.is_running() {
            return Err(TxError::Misconfiguration(
                "transmit stop requested but not running",
            ));
        }
        self.shared.stop.store(true, Ordering::Release);
        while self.shared.state.load(Ordering::Acquire) == RUNNING {
            thread::sleep(STATE_POLL);
        }
        self.wait();
        Ok(())
    }

    /// Block until the current run, if any, finishes on its own.
    pub fn wait(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl<S: PacketSink + Send + 'static> Drop for TxEngine<S> {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.wait();
    }
}

impl<S: PacketSink + Send + 'static> Shared<S> {
    fn run(&self) {
        let mut core = self.core.lock().expect("engine mutex poisoned");
        let core = &mut *core;

        if core.builder.program().is_empty() {
            log::debug!("empty packet list, nothing to transmit");
            self.last_tx_duration
                .store(0f64.to_bits(), Ordering::Relaxed);
            self.stop.store(false, Ordering::Release);
            self.state.store(FINISHED, Ordering::Release);
            return;
        }

        for (g, group) in core.builder.program().groups.iter().enumerate() {
            log::debug!(
                "group[{g}]: repeats = {}, pkts per play = {}",
                group.repeats,
                group.packets_per_play()
            );
            for (s, seq) in group.sequences.iter().enumerate() {
                log::debug!(
                    "group[{g}] seq[{s}]: repeats = {}, pkts = {}, bytes = {}, \
                     usec_delay = {}, usec_duration = {}, ttag_l4_cksum_ofs = {}",
                    group.repeats,
                    seq.packets,
                    seq.bytes,
                    seq.usec_delay,
                    seq.usec_duration,
                    seq.ttag_l4_cksum_offset
                );
            }
        }

        core.last_stats = self.stats.snapshot();
        core.stamper
            .arm(&core.builder.program().ttag_markers, self.stats.pkts());

        let start_ts = clock::now();
        self.state.store(RUNNING, Ordering::Release);

        let mut overhead: i64 = 0; // scheduler debt, never positive
        if let Err(err) = self.play(core, &mut overhead) {
            match err {
                TxError::Cancelled => log::debug!("transmit cancelled, overhead = {overhead}"),
                err => log::error!("transmit aborted: {err}, overhead = {overhead}"),
            }
        }

        let secs = clock::diff_usec(start_ts, clock::now()) as f64 / 1e6;
        self.last_tx_duration.store(secs.to_bits(), Ordering::Relaxed);
        log::debug!("tx duration = {secs}s");

        if core.track_stream_stats {
            self.update_tx_stream_stats(core);
        }

        self.stop.store(false, Ordering::Release);
        self.state.store(FINISHED, Ordering::Release);
    }

    /// The outer walk: groups in list order, each repeated, looping back
    /// while loop mode holds. Only `stop` ends a looping program.
    fn play(&self, core: &mut Core<S>, overhead: &mut i64) -> Result<(), TxError> {
        let mut start_group = 0;
        loop {
            let group_count = core.builder.program().groups.len();
            for g in start_group..group_count {
                let repeats = core.builder.program().groups[g].repeats;
                let seq_count = core.builder.program().groups[g].sequences.len();
                for _ in 0..repeats {
                    for s in 0..seq_count {
                        self.play_sequence(core, g, s, overhead)?;
                        let tail = core.builder.program().groups[g].sequences[s].usec_delay;
                        apply_delay(&core.delay, tail, overhead);
                    }
                }
            }
            match core.builder.program().return_to {
                Some(idx) => {
                    let loop_delay = core.builder.program().loop_delay_usec;
                    apply_delay(&core.delay, loop_delay, overhead);
                    start_group = idx;
                }
                None => return Ok(()),
            }
        }
    }

    fn play_sequence(
        &self,
        core: &mut Core<S>,
        g: usize,
        s: usize,
        overhead: &mut i64,
    ) -> Result<(), TxError> {
        let ttag_active = core.stamper.is_armed();
        let seq = &core.builder.program().groups[g].sequences[s];
        if seq.is_empty() {
            return Ok(());
        }

        // Batched path: short sequences only, and never when a T-Tag could
        // come due (stamping happens per packet).
        if !ttag_active
            && core.sink.supports_send_queue()
            && seq.usec_duration <= SEND_QUEUE_CUTOFF_USEC
        {
            let ovr_start = clock::now();
            core.sink.send_queue(seq, SYNC_TRANSMIT)?;
            self.stats.add(seq.packets, seq.bytes);
            *overhead += seq.usec_duration - clock::diff_usec(ovr_start, clock::now());
            debug_assert!(*overhead <= 0);
            if self.stop.load(Ordering::Acquire) {
                return Err(TxError::Cancelled);
            }
            return Ok(());
        }

        self.send_sequence(core, g, s, overhead, SYNC_TRANSMIT)
    }

    /// Per-record playback: stamp, pace, sink, account, restore, poll stop.
    fn send_sequence(
        &self,
        core: &mut Core<S>,
        g: usize,
        s: usize,
        overhead: &mut i64,
        sync: bool,
    ) -> Result<(), TxError> {
        let Core {
            sink,
            builder,
            stamper,
            delay,
            ..
        } = core;
        let seq = &mut builder.program_mut().groups[g].sequences[s];
        let cksum_offset = seq.ttag_l4_cksum_offset;

        let mut records = seq.records_mut().peekable();
        // Gap anchor: the first record plays immediately.
        let mut ts = match records.peek() {
            Some((hdr, _)) => hdr.ts_usec_total(),
            None => return Ok(()),
        };

        let mut ovr_start = clock::now();
        for (hdr, packet) in records {
            let stamped = stamper.stamp(packet, cksum_offset, self.stats.pkts());

            if sync {
                let mut usec = hdr.ts_usec_total() - ts;
                *overhead -= clock::diff_usec(ovr_start, clock::now());
                debug_assert!(*overhead <= 0);
                usec += *overhead;
                if usec > 0 {
                    delay.wait(usec as u64);
                    *overhead = 0;
                } else {
                    *overhead = usec;
                }
                ts = hdr.ts_usec_total();
                ovr_start = clock::now();
            }

            let sent = sink.send_packet(packet);
            if sent.is_ok() {
                self.stats.add(1, u64::from(hdr.captured_len));
            }
            if let Some(undo) = stamped {
                stamper.restore(packet, undo, cksum_offset);
            }
            sent?;

            if self.stop.load(Ordering::Acquire) {
                return Err(TxError::Cancelled);
            }
        }
        Ok(())
    }

    /// Attribute the packets of the last run to per-stream tallies: whole
    /// revolutions in closed form, the trailing partial revolution by
    /// walking the program (and, inside a cut sequence, the buffer itself).
    fn update_tx_stream_stats(&self, core: &Core<S>) {
        let program = core.builder.program();
        if program.packet_list_size == 0 {
            return;
        }
        let pkts = wrapped_delta(self.stats.pkts(), core.last_stats.pkts);
        let revolutions = pkts / program.packet_list_size;
        let mut partial = pkts % program.packet_list_size;
        log::debug!(
            "tx pkts = {pkts}, packet_list_size = {}, revolutions = {revolutions}, partial = {partial}",
            program.packet_list_size
        );

        let mut totals = self.stream_stats.lock().expect("stream stats poisoned");

        if revolutions > 0 {
            for group in &program.groups {
                for seq in &group.sequences {
                    for (guid, meta) in &seq.stream_stats_meta {
                        let entry = totals.entry(*guid).or_default();
                        entry.tx_pkts += revolutions * group.repeats * meta.tx_pkts;
                        entry.tx_bytes += revolutions * group.repeats * meta.tx_bytes;
                    }
                }
            }
        }

        if partial == 0 {
            return;
        }

        'walk: for group in &program.groups {
            for _ in 0..group.repeats {
                for seq in &group.sequences {
                    debug_assert!(seq.packets > 0);
                    if partial >= seq.packets {
                        // the whole sequence went out
                        for (guid, meta) in &seq.stream_stats_meta {
                            let entry = totals.entry(*guid).or_default();
                            entry.tx_pkts += meta.tx_pkts;
                            entry.tx_bytes += meta.tx_bytes;
                        }
                        partial -= seq.packets;
                        if partial == 0 {
                            break 'walk;
                        }
                    } else {
                        // the sequence was cut: attribute record by record
                        for (hdr, packet) in seq.records() {
                            if partial == 0 {
                                break;
                            }
                            if let Some(guid) = sign::packet_guid(packet) {
                                let entry = totals.entry(guid).or_default();
                                entry.tx_pkts += 1;
                                entry.tx_bytes += u64::from(hdr.captured_len);
                            }
                            partial -= 1;
                        }
                        debug_assert_eq!(partial, 0);
                        break 'walk;
                    }
                }
            }
        }
    }
}

/// Overhead-aware delay: sleep the requested time minus the accumulated
/// debt, or bank the remainder.
fn apply_delay(delay: &Delay, usec: i64, overhead: &mut i64) {
    let usecs = usec + *overhead;
    if usecs > 0 {
        delay.wait(usecs as u64);
        *overhead = 0;
    } else {
        *overhead = usecs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_policy_banks_debt() {
        let delay = Delay::new(Accuracy::Low);
        let mut overhead = -300i64;
        apply_delay(&delay, 100, &mut overhead);
        assert_eq!(overhead, -200);
        apply_delay(&delay, 0, &mut overhead);
        assert_eq!(overhead, -200);
        apply_delay(&delay, 500, &mut overhead);
        assert_eq!(overhead, 0);
    }
}
