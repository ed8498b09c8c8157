use std::time::{Duration, Instant};

/// Accuracy of the inter-packet delay primitive.
///
/// High spins on the monotonic clock and burns a CPU; it is required when
/// per-packet gaps are in the tens of microseconds. Low sleeps through the
/// OS scheduler and may over- or undersleep by milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accuracy {
    High,
    Low,
}

pub type Timestamp = Instant;

pub fn now() -> Timestamp {
    Instant::now()
}

/// Microseconds elapsed from `a` to `b`. Negative when `b` is earlier;
/// callers treat negative results as zero.
pub fn diff_usec(a: Timestamp, b: Timestamp) -> i64 {
    match b.checked_duration_since(a) {
        Some(d) => d.as_micros() as i64,
        None => -(a.duration_since(b).as_micros() as i64),
    }
}

/// The delay primitive selected for one engine instance. Selection happens
/// before `start`; switching while running is not supported.
#[derive(Debug, Clone, Copy)]
pub struct Delay {
    accuracy: Accuracy,
}

impl Delay {
    pub fn new(accuracy: Accuracy) -> Self {
        Delay { accuracy }
    }

    pub fn accuracy(&self) -> Accuracy {
        self.accuracy
    }

    /// Block the calling thread for `usec` microseconds.
    pub fn wait(&self, usec: u64) {
        match self.accuracy {
            Accuracy::High => busy_wait(usec),
            Accuracy::Low => std::thread::sleep(Duration::from_micros(usec)),
        }
    }
}

fn busy_wait(usec: u64) {
    let target = Instant::now() + Duration::from_micros(usec);
    while Instant::now() < target {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_is_signed() {
        let a = now();
        let b = a + Duration::from_micros(1500);
        assert_eq!(diff_usec(a, b), 1500);
        assert_eq!(diff_usec(b, a), -1500);
        assert_eq!(diff_usec(a, a), 0);
    }

    #[test]
    fn busy_wait_reaches_target() {
        let before = now();
        Delay::new(Accuracy::High).wait(2000);
        assert!(diff_usec(before, now()) >= 2000);
    }

    #[test]
    fn sleep_wait_reaches_target() {
        let before = now();
        Delay::new(Accuracy::Low).wait(1000);
        assert!(diff_usec(before, now()) >= 1000);
    }
}
