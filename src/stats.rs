use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Transmit tally of one logical stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamStatsTuple {
    pub tx_pkts: u64,
    pub tx_bytes: u64,
}

/// stream guid -> cumulative tally
pub type StreamStats = HashMap<u32, StreamStatsTuple>;

/// Cumulative packet/byte counters, written by the engine thread and read by
/// external observers. Relaxed atomic loads give readers well-defined values
/// without any locking.
#[derive(Debug, Default)]
pub struct StatsLedger {
    pkts: AtomicU64,
    bytes: AtomicU64,
}

/// Point-in-time copy of the ledger, taken at engine start and used for
/// post-run stream-stat attribution.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatsSnapshot {
    pub pkts: u64,
    pub bytes: u64,
}

impl StatsLedger {
    /// A ledger whose counters start at the given values. Lets a caller hand
    /// the engine a view that already accumulated traffic elsewhere.
    pub fn starting_at(pkts: u64, bytes: u64) -> Self {
        StatsLedger {
            pkts: AtomicU64::new(pkts),
            bytes: AtomicU64::new(bytes),
        }
    }

    pub fn pkts(&self) -> u64 {
        self.pkts.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn add(&self, pkts: u64, bytes: u64) {
        self.pkts.fetch_add(pkts, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            pkts: self.pkts(),
            bytes: self.bytes(),
        }
    }
}

/// Counter delta since `last`, with modular handling of 64-bit wrap.
pub fn wrapped_delta(current: u64, last: u64) -> u64 {
    current.wrapping_sub(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_accumulates() {
        let ledger = StatsLedger::default();
        ledger.add(3, 300);
        ledger.add(1, 64);
        assert_eq!(ledger.pkts(), 4);
        assert_eq!(ledger.bytes(), 364);
        let snap = ledger.snapshot();
        assert_eq!(snap.pkts, 4);
        assert_eq!(snap.bytes, 364);
    }

    #[test]
    fn delta_handles_wrap() {
        assert_eq!(wrapped_delta(10, 4), 6);
        // counter wrapped: started at MAX-2, eleven packets later it reads 8
        let last = u64::MAX - 2;
        let current = last.wrapping_add(11);
        assert_eq!(current, 8);
        assert_eq!(wrapped_delta(current, last), 11);
    }
}
