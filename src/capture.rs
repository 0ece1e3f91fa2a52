//! This module contains all the capture logic

// The capture thread will do one thing: pull readouts from the source and
// push them, tagged with sweep boundaries, through an rtrb ring buffer to be
// stitched on the consumer side. Nothing here touches a Measurement.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, TryRecvError};
use rtrb::{Producer, PushError};
use tracing::{error, info, warn};

use crate::{error::SourceError, monitoring::SourceStatus, settings::Settings};

// How long the producer sleeps when the ring buffer is full
const BACKOFF: Duration = Duration::from_millis(1);

/// One bounded-bandwidth power capture
#[derive(Clone, Debug, PartialEq)]
pub struct Readout {
    /// Lower edge of the capture in Hz
    pub start_freq: f64,
    /// Width of the capture in Hz
    pub bandwidth: f64,
    /// Power samples in dB, evenly spaced across the bandwidth
    pub samples: Vec<f64>,
    /// The source already discarded the roll-off edges
    pub edges_cropped: bool,
}

impl Readout {
    pub fn new(start_freq: f64, bandwidth: f64, samples: Vec<f64>) -> Self {
        Self {
            start_freq,
            bandwidth,
            samples,
            edges_cropped: false,
        }
    }

    pub fn end_freq(&self) -> f64 {
        self.start_freq + self.bandwidth
    }

    /// Width of one source sample in Hz
    pub fn sample_width(&self) -> f64 {
        match self.samples.len() {
            0 => self.bandwidth,
            n => self.bandwidth / n as f64,
        }
    }

    /// Center frequency of sample `k`
    pub fn sample_freq(&self, k: usize) -> f64 {
        self.start_freq + (k as f64 + 0.5) * self.sample_width()
    }

    /// Lower and upper edge of sample `k`
    pub fn sample_span(&self, k: usize) -> (f64, f64) {
        let width = self.sample_width();
        let lo = self.start_freq + k as f64 * width;
        (lo, lo + width)
    }
}

/// A batch of readouts. The flags, not the number of readouts, mark sweep boundaries.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Scan {
    pub reads: Vec<Readout>,
    pub is_first_of_scan: bool,
    pub is_last_of_scan: bool,
}

/// Called from the controller to unblock a source stuck in `next_readout`
pub type HaltHandle = Box<dyn FnOnce() + Send>;

/// Something that yields readouts. `next_readout` may block; `Ok(None)` means
/// the source is exhausted.
pub trait CaptureSource: Send + 'static {
    fn next_readout(&mut self) -> Result<Option<Readout>, SourceError>;

    /// Whether the underlying process or device is still running
    fn is_alive(&mut self) -> bool;

    /// A handle that makes a blocked `next_readout` return promptly. Sources
    /// that never block for long can leave this as `None`; `stop()` then
    /// waits for the current read to finish.
    fn halt_handle(&self) -> Option<HaltHandle> {
        None
    }
}

/// Opens a fresh source for each launch
pub trait SourceFactory {
    type Source: CaptureSource;

    fn open(&mut self, settings: &Settings) -> Result<Self::Source, SourceError>;
}

/// Plays back a fixed list of readouts, then reports exhaustion
#[derive(Debug, Default)]
pub struct ReplaySource {
    reads: VecDeque<Readout>,
}

impl ReplaySource {
    pub fn new<I: IntoIterator<Item = Readout>>(reads: I) -> Self {
        Self {
            reads: reads.into_iter().collect(),
        }
    }
}

impl CaptureSource for ReplaySource {
    fn next_readout(&mut self) -> Result<Option<Readout>, SourceError> {
        Ok(self.reads.pop_front())
    }

    fn is_alive(&mut self) -> bool {
        !self.reads.is_empty()
    }
}

/// Replays the same readouts on every launch
#[derive(Clone, Debug, Default)]
pub struct ReplayFactory {
    pub reads: Vec<Readout>,
}

impl SourceFactory for ReplayFactory {
    type Source = ReplaySource;

    fn open(&mut self, _settings: &Settings) -> Result<Self::Source, SourceError> {
        Ok(ReplaySource::new(self.reads.clone()))
    }
}

/// Everything the capture thread needs besides the source itself
pub struct AcquisitionLoop {
    pub producer: Producer<Scan>,
    /// Disconnects when the controller wants us gone
    pub stop: Receiver<()>,
    pub next_is_first: Arc<AtomicBool>,
    pub status: Arc<SourceStatus>,
    /// Upper edge of the sweep in Hz
    pub high_freq: f64,
    /// Readouts per scan, unless a sweep boundary flushes early
    pub batch_size: usize,
}

impl AcquisitionLoop {
    fn cancelled(&self) -> bool {
        !matches!(self.stop.try_recv(), Err(TryRecvError::Empty))
    }

    /// Push a scan, backing off while the ring buffer is full. Returns false if
    /// we were cancelled before it went through.
    fn send(&mut self, mut scan: Scan) -> bool {
        loop {
            match self.producer.push(scan) {
                Ok(()) => {
                    self.status.record_scan();
                    return true;
                }
                Err(PushError::Full(s)) => {
                    if self.cancelled() {
                        return false;
                    }
                    scan = s;
                    thread::sleep(BACKOFF);
                }
            }
        }
    }

    /// Tag and push whatever is pending. Flags are set before the push.
    fn flush(&mut self, pending: &mut Vec<Readout>, last: bool) -> bool {
        let scan = Scan {
            reads: std::mem::take(pending),
            is_first_of_scan: self.next_is_first.swap(false, Ordering::AcqRel),
            is_last_of_scan: last,
        };
        if last {
            self.next_is_first.store(true, Ordering::Release);
            self.status.record_sweep();
        }
        self.send(scan)
    }

    /// The capture thread body. Runs until cancelled or until the source is
    /// exhausted or fails.
    pub fn run<S: CaptureSource>(mut self, mut source: S) {
        self.status.set_alive(source.is_alive());
        let batch_size = self.batch_size.max(1);
        let mut pending = Vec::with_capacity(batch_size);
        let mut last_start: Option<f64> = None;
        // A sweep is open once any readout has been flushed without closing it
        let mut open = false;

        info!("Starting acquisition");
        while !self.cancelled() {
            let read = match source.next_readout() {
                Ok(Some(read)) => read,
                Ok(None) => {
                    info!("Capture source exhausted");
                    break;
                }
                Err(e) => {
                    error!("Capture source failed - {}", e);
                    break;
                }
            };
            self.status.record_readout();
            self.status.set_alive(source.is_alive());

            // Frequency went backwards, so the previous sweep is over even
            // though it never reached the top of the band
            if matches!(last_start, Some(prev) if read.start_freq < prev)
                && (open || !pending.is_empty())
            {
                warn!(
                    freq = read.start_freq,
                    "Sweep wrapped before reaching the upper edge"
                );
                if !self.flush(&mut pending, true) {
                    break;
                }
                open = false;
            }
            last_start = Some(read.start_freq);

            let closes = read.end_freq() >= self.high_freq - read.sample_width();
            pending.push(read);
            if closes || pending.len() >= batch_size {
                if !self.flush(&mut pending, closes) {
                    break;
                }
                open = !closes;
            }
        }

        if !pending.is_empty() && !self.cancelled() {
            // Partial sweep, hand it over without closing it
            self.flush(&mut pending, false);
        }
        self.status.set_alive(false);
        info!("Acquisition stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use rtrb::RingBuffer;

    fn drain(consumer: &mut rtrb::Consumer<Scan>) -> Vec<Scan> {
        let mut scans = vec![];
        while let Ok(scan) = consumer.pop() {
            scans.push(scan);
        }
        scans
    }

    fn run_loop(reads: Vec<Readout>, batch_size: usize) -> Vec<Scan> {
        let (producer, mut consumer) = RingBuffer::new(64);
        let (_stop_tx, stop_rx) = bounded(0);
        let lp = AcquisitionLoop {
            producer,
            stop: stop_rx,
            next_is_first: Arc::new(AtomicBool::new(true)),
            status: Arc::new(SourceStatus::default()),
            high_freq: 4e6,
            batch_size,
        };
        lp.run(ReplaySource::new(reads));
        drain(&mut consumer)
    }

    fn hop(start: f64) -> Readout {
        Readout::new(start, 1e6, vec![-50.0; 4])
    }

    #[test]
    fn test_sample_freqs() {
        let r = hop(1e6);
        assert_eq!(r.sample_width(), 250e3);
        assert_eq!(r.sample_freq(0), 1.125e6);
        assert_eq!(r.sample_span(1), (1.25e6, 1.5e6));
        assert_eq!(r.end_freq(), 2e6);
    }

    #[test]
    fn test_sweep_flags() {
        let reads = vec![hop(0.0), hop(1e6), hop(2e6), hop(3e6), hop(0.0), hop(1e6)];
        let scans = run_loop(reads, 2);
        assert_eq!(scans.len(), 3);
        assert!(scans[0].is_first_of_scan && !scans[0].is_last_of_scan);
        assert!(!scans[1].is_first_of_scan && scans[1].is_last_of_scan);
        assert_eq!(scans[1].reads.len(), 2);
        // Leftover partial sweep, handed over unclosed
        assert!(scans[2].is_first_of_scan && !scans[2].is_last_of_scan);
        assert_eq!(scans[2].reads.len(), 2);
    }

    #[test]
    fn test_wrap_closes_sweep_with_empty_scan() {
        let reads = vec![hop(0.0), hop(1e6), hop(0.0), hop(1e6), hop(2e6), hop(3e6)];
        let scans = run_loop(reads, 2);
        assert_eq!(scans.len(), 4);
        assert!(scans[0].is_first_of_scan);
        assert!(scans[1].reads.is_empty());
        assert!(scans[1].is_last_of_scan);
        assert!(scans[2].is_first_of_scan);
        assert!(scans[3].is_last_of_scan);
    }

    #[test]
    fn test_cancelled_loop_exits() {
        let (producer, mut consumer) = RingBuffer::new(4);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        drop(stop_tx);
        let status = Arc::new(SourceStatus::default());
        let lp = AcquisitionLoop {
            producer,
            stop: stop_rx,
            next_is_first: Arc::new(AtomicBool::new(true)),
            status: status.clone(),
            high_freq: 4e6,
            batch_size: 1,
        };
        lp.run(ReplaySource::new(vec![hop(0.0)]));
        assert!(drain(&mut consumer).is_empty());
        assert!(!status.is_alive());
    }
}
