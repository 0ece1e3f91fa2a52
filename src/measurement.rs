//! Stitched sweep results and the bin <-> frequency math

use std::ops::RangeInclusive;

use crate::settings::Settings;

// Fraction of a bin by which a span may cross a bin edge and still not count
// as overlapping it
const EDGE_SLACK: f64 = 1e-6;

/// Selects one of the four arrays of a [`Measurement`]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum BaselineMode {
    Spectrum,
    #[default]
    Average,
    Max,
    Min,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Measurement {
    pub settings: Settings,
    /// Latest raw sweep in dB
    pub spectrum: Vec<f64>,
    pub average: Vec<f64>,
    pub max: Vec<f64>,
    pub min: Vec<f64>,
    /// Sweeps folded into the statistics
    pub num_scans: u32,
    /// Hz per output bin
    pub step_freq: f64,
}

impl Measurement {
    /// An all-zero measurement laid out for `settings`
    pub fn new(settings: Settings) -> Self {
        let n = settings.bin_count();
        let mut meas = Self {
            settings,
            spectrum: vec![0.0; n],
            average: vec![0.0; n],
            max: vec![0.0; n],
            min: vec![0.0; n],
            num_scans: 0,
            step_freq: 0.0,
        };
        meas.step_freq = meas.get_hertz_per_bin();
        meas
    }

    /// Prepare for a new sweep. Only `spectrum` is cleared unless the bin
    /// layout changed, in which case the statistics restart too.
    pub fn reset(&mut self, settings: &Settings) {
        let n = settings.bin_count();
        if self.settings != *settings || self.spectrum.len() != n {
            *self = Measurement::new(settings.clone());
        } else {
            self.settings = settings.clone();
            self.spectrum.iter_mut().for_each(|v| *v = 0.0);
        }
    }

    pub fn bin_count(&self) -> usize {
        self.spectrum.len()
    }

    pub fn get_low_freq(&self) -> f64 {
        self.settings.low_freq_hz()
    }

    pub fn get_high_freq(&self) -> f64 {
        self.settings.high_freq_hz()
    }

    pub fn get_freq_range(&self) -> f64 {
        self.get_high_freq() - self.get_low_freq()
    }

    pub fn get_hertz_per_bin(&self) -> f64 {
        match self.bin_count() {
            0 => 0.0,
            n => self.get_freq_range() / n as f64,
        }
    }

    pub fn get_number_of_scans(&self) -> u32 {
        self.num_scans
    }

    pub fn get_bin_center_freq(&self, idx: usize) -> f64 {
        self.get_low_freq() + (idx as f64 + 0.5) * self.get_hertz_per_bin()
    }

    /// Bin holding `freq`, clamped to the first/last bin when `freq` is out of range
    pub fn get_bin_for_freq(&self, freq: f64) -> usize {
        let n = self.bin_count();
        let hpb = self.get_hertz_per_bin();
        if n == 0 || hpb <= 0.0 || freq.is_nan() {
            return 0;
        }
        let idx = ((freq - self.get_low_freq()) / hpb).floor();
        if idx <= 0.0 {
            0
        } else {
            (idx as usize).min(n - 1)
        }
    }

    /// Bin holding `freq`, or `None` outside `[low, high]`
    pub fn checked_bin_for_freq(&self, freq: f64) -> Option<usize> {
        if self.bin_count() == 0 || freq < self.get_low_freq() || freq > self.get_high_freq() {
            return None;
        }
        Some(self.get_bin_for_freq(freq))
    }

    /// Bins whose span overlaps `[lo, hi)`, or `None` when it misses the band
    pub fn bins_overlapping(&self, lo: f64, hi: f64) -> Option<RangeInclusive<usize>> {
        let n = self.bin_count();
        let hpb = self.get_hertz_per_bin();
        if n == 0 || hpb <= 0.0 || lo.is_nan() || hi.is_nan() {
            return None;
        }
        let low = self.get_low_freq();
        let first = ((lo - low) / hpb + EDGE_SLACK).floor().max(0.0);
        let last = ((hi - low) / hpb - EDGE_SLACK).ceil() - 1.0;
        if last < first || last < 0.0 || first > (n - 1) as f64 {
            return None;
        }
        Some(first as usize..=(last as usize).min(n - 1))
    }

    pub fn get_baseline_bin(&self, mode: BaselineMode) -> &[f64] {
        match mode {
            BaselineMode::Spectrum => &self.spectrum,
            BaselineMode::Average => &self.average,
            BaselineMode::Max => &self.max,
            BaselineMode::Min => &self.min,
        }
    }
}

/// A snapshot handed to a display, with which traces to show
#[derive(Clone, Debug)]
pub struct Measure {
    pub show_spectrum: bool,
    pub show_average: bool,
    pub show_max: bool,
    pub show_min: bool,
    pub meas: Measurement,
}

impl Measure {
    pub fn new(meas: Measurement) -> Self {
        Self {
            show_spectrum: true,
            show_average: false,
            show_max: false,
            show_min: false,
            meas,
        }
    }

    /// The selected traces, in spectrum/average/max/min order
    pub fn visible(&self) -> Vec<(BaselineMode, &[f64])> {
        [
            (BaselineMode::Spectrum, self.show_spectrum),
            (BaselineMode::Average, self.show_average),
            (BaselineMode::Max, self.show_max),
            (BaselineMode::Min, self.show_min),
        ]
        .into_iter()
        .filter(|(_, shown)| *shown)
        .map(|(mode, _)| (mode, self.meas.get_baseline_bin(mode)))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::FreqUnits;

    fn fm_band() -> Settings {
        Settings {
            samp_rate: 20_000_000,
            min_freq: 88.0,
            max_freq: 108.0,
            nbins: 100,
            percent: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_layout() {
        let m = Measurement::new(fm_band());
        assert_eq!(m.bin_count(), 100);
        assert_eq!(m.get_freq_range(), 20e6);
        assert_eq!(m.get_hertz_per_bin(), 200e3);
        assert_eq!(m.step_freq, 200e3);
        assert_eq!(m.average.len(), 100);
        assert_eq!(m.min.len(), 100);
    }

    #[test]
    fn test_bin_center_inverse() {
        for settings in [
            fm_band(),
            Settings::default(),
            Settings {
                min_freq: 24.0,
                max_freq: 1.7,
                min_freq_units: FreqUnits::MHz,
                max_freq_units: FreqUnits::GHz,
                nbins: 10,
                ..Default::default()
            },
        ] {
            let m = Measurement::new(settings);
            for i in 0..m.bin_count() {
                let f = m.get_bin_center_freq(i);
                assert_eq!(m.get_bin_for_freq(f), i);
                assert!(m.get_low_freq() <= f && f <= m.get_high_freq());
            }
        }
    }

    #[test]
    fn test_out_of_range_clamps() {
        let m = Measurement::new(fm_band());
        assert_eq!(m.get_bin_for_freq(1e6), 0);
        assert_eq!(m.get_bin_for_freq(2e9), 99);
        assert_eq!(m.get_bin_for_freq(108e6), 99);
        assert_eq!(m.checked_bin_for_freq(1e6), None);
        assert_eq!(m.checked_bin_for_freq(108e6), Some(99));
        assert_eq!(m.checked_bin_for_freq(88e6), Some(0));
    }

    #[test]
    fn test_bins_overlapping() {
        let m = Measurement::new(fm_band());
        // Exactly one bin, touching neighbours only at the edges
        assert_eq!(m.bins_overlapping(88.2e6, 88.4e6), Some(1..=1));
        // A coarse span covers every bin it touches
        assert_eq!(m.bins_overlapping(88.3e6, 88.9e6), Some(1..=4));
        // Clipped at both ends of the band
        assert_eq!(m.bins_overlapping(80e6, 88.1e6), Some(0..=0));
        assert_eq!(m.bins_overlapping(107.9e6, 120e6), Some(99..=99));
        assert_eq!(m.bins_overlapping(70e6, 88e6), None);
        assert_eq!(m.bins_overlapping(108e6, 110e6), None);
    }

    #[test]
    fn test_reset_keeps_statistics() {
        let mut m = Measurement::new(fm_band());
        m.spectrum[3] = -40.0;
        m.average[3] = -50.0;
        m.reset(&fm_band());
        assert_eq!(m.spectrum[3], 0.0);
        assert_eq!(m.average[3], -50.0);
        let other = Settings { nbins: 50, ..fm_band() };
        m.reset(&other);
        assert_eq!(m.bin_count(), 50);
        assert!(m.average.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_measure_visible() {
        let mut m = Measurement::new(fm_band());
        m.max[0] = 5.0;
        let mut measure = Measure::new(m);
        measure.show_spectrum = false;
        measure.show_max = true;
        let shown = measure.visible();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].0, BaselineMode::Max);
        assert_eq!(shown[0].1[0], 5.0);
    }
}
