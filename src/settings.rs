//! Sweep configuration and the geometry it implies

use std::{
    fmt,
    io::{BufRead, Write},
    str::FromStr,
};

use crate::error::SettingsError;

// Relative tolerance for the practical equality of frequencies
const FREQ_EPSILON: f64 = 1e-9;

/// Largest stitched sweep we are willing to allocate
pub const MAX_BINS: usize = 1 << 24;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum FreqUnits {
    Hz,
    KHz,
    #[default]
    MHz,
    GHz,
}

impl FreqUnits {
    pub fn multiplier(self) -> f64 {
        match self {
            FreqUnits::Hz => 1.0,
            FreqUnits::KHz => 1e3,
            FreqUnits::MHz => 1e6,
            FreqUnits::GHz => 1e9,
        }
    }

    /// Convert a magnitude in these units to Hz
    pub fn to_hz(self, val: f64) -> f64 {
        val * self.multiplier()
    }
}

impl fmt::Display for FreqUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FreqUnits::Hz => "Hz",
            FreqUnits::KHz => "kHz",
            FreqUnits::MHz => "MHz",
            FreqUnits::GHz => "GHz",
        };
        f.write_str(s)
    }
}

impl FromStr for FreqUnits {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Numeric codes are accepted for files written by older tooling
        match s.to_ascii_lowercase().as_str() {
            "hz" | "0" => Ok(FreqUnits::Hz),
            "khz" | "1" => Ok(FreqUnits::KHz),
            "mhz" | "2" => Ok(FreqUnits::MHz),
            "ghz" | "3" => Ok(FreqUnits::GHz),
            _ => Err(SettingsError::UnknownUnits(s.to_owned())),
        }
    }
}

impl FreqUnits {
    pub(crate) fn code(self) -> u32 {
        match self {
            FreqUnits::Hz => 0,
            FreqUnits::KHz => 1,
            FreqUnits::MHz => 2,
            FreqUnits::GHz => 3,
        }
    }

    pub(crate) fn from_code(code: u32) -> Result<Self, SettingsError> {
        match code {
            0 => Ok(FreqUnits::Hz),
            1 => Ok(FreqUnits::KHz),
            2 => Ok(FreqUnits::MHz),
            3 => Ok(FreqUnits::GHz),
            _ => Err(SettingsError::UnknownUnits(code.to_string())),
        }
    }
}

/// Everything needed to run one sweep. Immutable while a sweep is running.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Tuner sample rate in Hz, which is also the bandwidth of one hop
    pub samp_rate: u32,
    pub min_freq: f64,
    pub min_freq_units: FreqUnits,
    pub max_freq: f64,
    pub max_freq_units: FreqUnits,
    pub gain: f32,
    /// Output bins per hop
    pub nbins: u32,
    /// Percentage of each hop discarded at its edges (half on each side)
    pub percent: u32,
    /// Samples the source averages into each readout
    pub nsamples: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            samp_rate: 2_400_000,
            min_freq: 88.0,
            min_freq_units: FreqUnits::MHz,
            max_freq: 108.0,
            max_freq_units: FreqUnits::MHz,
            gain: 0.0,
            nbins: 256,
            percent: 20,
            nsamples: 1,
        }
    }
}

/// Field names in stream order
pub const FIELDS: [&str; 9] = [
    "samp_rate",
    "min_freq",
    "min_freq_units",
    "max_freq",
    "max_freq_units",
    "gain",
    "nbins",
    "percent",
    "nsamples",
];

fn parse_field<T: FromStr>(field: &'static str, token: Option<&str>) -> Result<T, SettingsError> {
    let token = token.ok_or(SettingsError::MissingField(field))?;
    token.parse().map_err(|_| SettingsError::InvalidField {
        field,
        value: token.to_owned(),
    })
}

impl Settings {
    pub fn low_freq_hz(&self) -> f64 {
        self.min_freq_units.to_hz(self.min_freq)
    }

    pub fn high_freq_hz(&self) -> f64 {
        self.max_freq_units.to_hz(self.max_freq)
    }

    pub fn freq_range_hz(&self) -> f64 {
        self.high_freq_hz() - self.low_freq_hz()
    }

    /// Bandwidth of a hop that survives the edge crop
    pub fn usable_bandwidth(&self) -> f64 {
        self.samp_rate as f64 * (1.0 - self.percent as f64 / 100.0)
    }

    /// Number of hops the source needs to cover the range
    pub fn hop_count(&self) -> usize {
        let usable = self.usable_bandwidth();
        let range = self.freq_range_hz();
        if usable <= 0.0 || range <= 0.0 {
            return 1;
        }
        // Float to int casts saturate, so absurd ranges land on usize::MAX
        ((range / usable).ceil() as usize).max(1)
    }

    /// Total bins of a stitched sweep. Saturates for settings that would not
    /// pass [`Settings::validate`].
    pub fn bin_count(&self) -> usize {
        (self.nbins as usize).saturating_mul(self.hop_count())
    }

    /// Total bins of a stitched sweep, refusing layouts above [`MAX_BINS`]
    pub fn checked_bin_count(&self) -> Result<usize, SettingsError> {
        let hops = self.hop_count();
        (self.nbins as usize)
            .checked_mul(hops)
            .filter(|bins| *bins <= MAX_BINS)
            .ok_or(SettingsError::TooManyBins {
                hops,
                nbins: self.nbins,
                limit: MAX_BINS,
            })
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let (min, max) = (self.low_freq_hz(), self.high_freq_hz());
        if !min.is_finite() || !max.is_finite() || min >= max {
            return Err(SettingsError::InvalidRange { min, max });
        }
        if self.samp_rate == 0 {
            return Err(SettingsError::InvalidField {
                field: "samp_rate",
                value: self.samp_rate.to_string(),
            });
        }
        if self.nbins == 0 {
            return Err(SettingsError::InvalidField {
                field: "nbins",
                value: self.nbins.to_string(),
            });
        }
        if self.percent >= 100 {
            return Err(SettingsError::InvalidField {
                field: "percent",
                value: self.percent.to_string(),
            });
        }
        self.checked_bin_count()?;
        Ok(())
    }

    /// Write all fields on one line, space separated, in [`FIELDS`] order
    pub fn to_stream<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        writeln!(
            w,
            "{} {} {} {} {} {} {} {} {}",
            self.samp_rate,
            self.min_freq,
            self.min_freq_units,
            self.max_freq,
            self.max_freq_units,
            self.gain,
            self.nbins,
            self.percent,
            self.nsamples
        )
    }

    /// Read one line written by [`Settings::to_stream`]
    pub fn from_stream<R: BufRead>(r: &mut R) -> Result<Self, SettingsError> {
        let mut line = String::new();
        if r.read_line(&mut line)? == 0 {
            return Err(SettingsError::Empty);
        }
        line.parse()
    }

    pub(crate) fn from_fields<'a, I>(mut tokens: I) -> Result<Self, SettingsError>
    where
        I: Iterator<Item = &'a str>,
    {
        let settings = Settings {
            samp_rate: parse_field(FIELDS[0], tokens.next())?,
            min_freq: parse_field(FIELDS[1], tokens.next())?,
            min_freq_units: parse_field(FIELDS[2], tokens.next())?,
            max_freq: parse_field(FIELDS[3], tokens.next())?,
            max_freq_units: parse_field(FIELDS[4], tokens.next())?,
            gain: parse_field(FIELDS[5], tokens.next())?,
            nbins: parse_field(FIELDS[6], tokens.next())?,
            percent: parse_field(FIELDS[7], tokens.next())?,
            nsamples: parse_field(FIELDS[8], tokens.next())?,
        };
        if let Some(extra) = tokens.next() {
            return Err(SettingsError::Trailing(extra.to_owned()));
        }
        Ok(settings)
    }

    /// Field values as strings in [`FIELDS`] order
    pub(crate) fn to_fields(&self) -> [String; 9] {
        [
            self.samp_rate.to_string(),
            self.min_freq.to_string(),
            self.min_freq_units.to_string(),
            self.max_freq.to_string(),
            self.max_freq_units.to_string(),
            self.gain.to_string(),
            self.nbins.to_string(),
            self.percent.to_string(),
            self.nsamples.to_string(),
        ]
    }
}

impl FromStr for Settings {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(SettingsError::Empty);
        }
        Settings::from_fields(s.split_whitespace())
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_fields().join(" "))
    }
}

fn freq_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= FREQ_EPSILON * a.abs().max(b.abs()).max(1.0)
}

/// Practical equality: two settings are equal when they produce the same bin
/// layout. Gain and nsamples only affect capture and are ignored.
impl PartialEq for Settings {
    fn eq(&self, other: &Self) -> bool {
        freq_eq(self.low_freq_hz(), other.low_freq_hz())
            && freq_eq(self.high_freq_hz(), other.high_freq_hz())
            && self.samp_rate == other.samp_rate
            && self.nbins == other.nbins
            && self.percent == other.percent
    }
}
