//! Reassembles a continuous spectrum from bandwidth-limited readouts

use tracing::{debug, trace};

use crate::{
    capture::{Readout, Scan},
    measurement::Measurement,
    settings::Settings,
};

/// Consumer side of the ring buffer. Writes readouts into the working
/// measurement and reports when a sweep completes.
#[derive(Debug, Default)]
pub struct MeasurementAssembler {
    in_sweep: bool,
    /// Samples that fell outside the band since launch
    skipped: u64,
}

/// Samples to drop from each edge of a readout of `len` samples
pub fn crop_count(len: usize, percent: u32) -> usize {
    len * percent as usize / 200
}

impl MeasurementAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sweep has started but not reached its last scan
    pub fn in_sweep(&self) -> bool {
        self.in_sweep
    }

    pub fn skipped_samples(&self) -> u64 {
        self.skipped
    }

    /// Forget the sweep in flight, e.g. after the capture thread stopped
    pub fn abort(&mut self) {
        if self.in_sweep {
            debug!("Abandoning partial sweep");
        }
        self.in_sweep = false;
    }

    /// Write one readout into `meas`. Every bin a kept sample overlaps takes
    /// its value, so bins never fall between samples. Overlapping bins take
    /// the latest sample.
    pub fn stitch(&mut self, read: &Readout, meas: &mut Measurement, percent: u32) {
        let n = read.samples.len();
        let crop = if read.edges_cropped {
            0
        } else {
            crop_count(n, percent)
        };
        if 2 * crop >= n {
            debug!(freq = read.start_freq, "Readout has nothing left after cropping");
            return;
        }
        for (k, power) in read.samples.iter().enumerate().take(n - crop).skip(crop) {
            let (lo, hi) = read.sample_span(k);
            match meas.bins_overlapping(lo, hi) {
                Some(bins) => meas.spectrum[bins].iter_mut().for_each(|v| *v = *power),
                None => self.skipped += 1,
            }
        }
    }

    /// Feed one scan. Returns a snapshot of the finished sweep when the scan
    /// closes one.
    pub fn ingest(
        &mut self,
        scan: Scan,
        meas: &mut Measurement,
        settings: &Settings,
    ) -> Option<Measurement> {
        if scan.is_first_of_scan {
            if self.in_sweep {
                debug!("New sweep started before the previous one closed");
            }
            meas.reset(settings);
            self.in_sweep = true;
        }
        if !self.in_sweep {
            trace!(reads = scan.reads.len(), "Dropping scan outside of a sweep");
            return None;
        }
        for read in &scan.reads {
            self.stitch(read, meas, settings.percent);
        }
        if scan.is_last_of_scan {
            self.in_sweep = false;
            meas.num_scans = 1;
            return Some(meas.clone());
        }
        None
    }
}
