//! In this module, we implement the monitoring state shared between the
//! capture thread and the controller: whether the source is alive, plus
//! running counts of what has passed through the ring buffer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SourceStatus {
    alive: AtomicBool,
    readouts: AtomicU64,
    scans: AtomicU64,
    sweeps: AtomicU64,
}

/// Plain copy of the counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub alive: bool,
    pub readouts: u64,
    pub scans: u64,
    pub sweeps: u64,
}

impl SourceStatus {
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn record_readout(&self) {
        self.readouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scan(&self) {
        self.scans.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sweep(&self) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            alive: self.is_alive(),
            readouts: self.readouts.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let status = SourceStatus::default();
        assert!(!status.is_alive());
        status.set_alive(true);
        status.record_readout();
        status.record_readout();
        status.record_scan();
        status.record_sweep();
        assert_eq!(
            status.snapshot(),
            StatusSnapshot {
                alive: true,
                readouts: 2,
                scans: 1,
                sweeps: 1
            }
        );
    }
}
