//! Hold-depth averaging of finished sweeps.
//!
//! Statistics are recomputed in one batch once `num_average_hold` sweeps have
//! been collected, so max/min are exact over that window. Between folds the
//! average/max/min arrays keep their previous values.

use tracing::{debug, warn};

use crate::{error::ControllerError, measurement::Measurement};

#[derive(Debug)]
pub struct AveragingEngine {
    /// Sweeps seen since the last fold
    measurement_count: usize,
    num_average_hold: usize,
    prev_measurements: Vec<Vec<f64>>,
}

impl Default for AveragingEngine {
    fn default() -> Self {
        Self {
            measurement_count: 0,
            num_average_hold: 1,
            prev_measurements: vec![],
        }
    }
}

impl AveragingEngine {
    pub fn new(num_average_hold: usize) -> Result<Self, ControllerError> {
        let mut engine = Self::default();
        engine.set_hold(num_average_hold)?;
        Ok(engine)
    }

    pub fn hold(&self) -> usize {
        self.num_average_hold
    }

    pub fn measurement_count(&self) -> usize {
        self.measurement_count
    }

    pub fn prev_measurements(&self) -> &[Vec<f64>] {
        &self.prev_measurements
    }

    /// Change the hold depth. Held sweeps are discarded.
    pub fn set_hold(&mut self, num_average_hold: usize) -> Result<(), ControllerError> {
        if num_average_hold == 0 {
            return Err(ControllerError::InvalidHoldDepth);
        }
        self.num_average_hold = num_average_hold;
        self.clear();
        Ok(())
    }

    pub fn clear(&mut self) {
        self.prev_measurements.clear();
        self.measurement_count = 0;
    }

    /// Hold a finished sweep, folding into `target` once the hold depth is
    /// reached. Returns true if a fold happened.
    pub fn push(&mut self, spectrum: &[f64], target: &mut Measurement) -> bool {
        self.prev_measurements.push(spectrum.to_vec());
        self.measurement_count += 1;
        if self.measurement_count >= self.num_average_hold {
            self.fold(target)
        } else {
            false
        }
    }

    /// Recompute average/max/min from every held sweep and write them into
    /// `target`, then start a new window. Does nothing with no held sweeps.
    pub fn fold(&mut self, target: &mut Measurement) -> bool {
        let n = self.prev_measurements.len();
        if n == 0 {
            return false;
        }
        let bins = target.bin_count();
        if self.prev_measurements.iter().any(|m| m.len() != bins) {
            warn!("Held sweeps do not match the current bin layout, discarding");
            self.clear();
            return false;
        }

        let mut average = vec![0.0; bins];
        let mut max = vec![f64::NEG_INFINITY; bins];
        let mut min = vec![f64::INFINITY; bins];
        for held in &self.prev_measurements {
            for (i, v) in held.iter().enumerate() {
                average[i] += v;
                max[i] = max[i].max(*v);
                min[i] = min[i].min(*v);
            }
        }
        average.iter_mut().for_each(|v| *v /= n as f64);

        target.average = average;
        target.max = max;
        target.min = min;
        target.num_scans = n as u32;
        debug!(sweeps = n, "Folded averages");
        self.clear();
        true
    }
}
