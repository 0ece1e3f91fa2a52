//! Argument parsing for running from the command line

use std::{fs::File, io::BufReader, path::PathBuf};

use clap::Parser;

use crate::{
    controller::ControllerConfig,
    error::SettingsError,
    settings::{FreqUnits, Settings},
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Lower edge of the sweep
    #[clap(long, default_value_t = 88.0)]
    pub min_freq: f64,
    /// Upper edge of the sweep
    #[clap(long, default_value_t = 108.0)]
    pub max_freq: f64,
    /// Units for both frequency edges (Hz, kHz, MHz, GHz)
    #[clap(short, long, default_value = "MHz", value_parser = valid_units)]
    pub units: FreqUnits,
    /// Tuner sample rate in Hz
    #[clap(short, long, default_value_t = 2_400_000)]
    #[clap(value_parser = clap::value_parser!(u32).range(1..))]
    pub samp_rate: u32,
    /// Tuner gain in dB, 0 for automatic
    #[clap(short, long, default_value_t = 0.0)]
    pub gain: f32,
    /// Output bins per hop
    #[clap(short, long, default_value_t = 256)]
    #[clap(value_parser = clap::value_parser!(u32).range(1..))]
    pub nbins: u32,
    /// Percentage of each hop cropped at its edges
    #[clap(short, long, default_value_t = 20)]
    #[clap(value_parser = clap::value_parser!(u32).range(0..100))]
    pub percent: u32,
    /// Samples averaged into each readout
    #[clap(long, default_value_t = 1)]
    pub nsamples: u32,
    /// Settings file (one line, as written by the library) overriding the flags above
    #[clap(long)]
    pub settings: Option<PathBuf>,
    /// Sweeps folded together before average/max/min are recomputed
    #[clap(long, default_value_t = 4)]
    #[clap(value_parser = clap::value_parser!(u64).range(1..))]
    pub hold: u64,
    /// Ring buffer capacity
    #[clap(short, long, default_value_t = 256)]
    pub capacity: usize,
    /// Readouts batched into each scan
    #[clap(long, default_value_t = 4)]
    pub batch: usize,
    /// Finished sweeps kept in memory, 0 for unbounded
    #[clap(long, default_value_t = 64)]
    pub history: usize,
    /// Milliseconds between updates
    #[clap(long, default_value_t = 33)]
    pub frame_ms: u64,
    /// Stop after this many sweeps
    #[clap(long)]
    pub sweeps: Option<usize>,
    /// Replay an rtl_power CSV file instead of running rtl_power
    #[clap(long)]
    pub replay: Option<PathBuf>,
    /// rtl_power executable
    #[clap(long, default_value = "rtl_power")]
    pub rtl_power: PathBuf,
    /// RTL-SDR device index
    #[clap(short, long)]
    pub device: Option<u32>,
    /// Measurement CSV to write on exit (defaults to a timestamped name)
    #[clap(short, long)]
    pub output: Option<PathBuf>,
    /// Also write binary .meta/.raw files next to the CSV
    #[clap(long)]
    pub binary: bool,
    /// Baseline measurement CSV to compare against
    #[clap(long)]
    pub baseline: Option<PathBuf>,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

impl Args {
    pub fn sweep_settings(&self) -> Result<Settings, SettingsError> {
        if let Some(path) = &self.settings {
            return Settings::from_stream(&mut BufReader::new(File::open(path)?));
        }
        Ok(Settings {
            samp_rate: self.samp_rate,
            min_freq: self.min_freq,
            min_freq_units: self.units,
            max_freq: self.max_freq,
            max_freq_units: self.units,
            gain: self.gain,
            nbins: self.nbins,
            percent: self.percent,
            nsamples: self.nsamples,
        })
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            average_hold: self.hold as usize,
            queue_capacity: self.capacity,
            batch_size: self.batch,
            history_limit: self.history,
        }
    }
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

fn valid_units(s: &str) -> Result<FreqUnits, String> {
    s.parse().map_err(|_| "Units must be one of Hz, kHz, MHz, GHz".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_to_settings() {
        let args = Args::parse_from([
            "sweep_stitcher",
            "--min-freq",
            "430",
            "--max-freq",
            "440",
            "-n",
            "128",
            "-p",
            "10",
            "--hold",
            "8",
        ]);
        let settings = args.sweep_settings().unwrap();
        assert_eq!(settings.low_freq_hz(), 430e6);
        assert_eq!(settings.nbins, 128);
        assert_eq!(settings.percent, 10);
        assert_eq!(args.controller_config().average_hold, 8);
    }

    #[test]
    fn test_bad_units_rejected() {
        assert!(Args::try_parse_from(["sweep_stitcher", "-u", "furlongs"]).is_err());
        let args = Args::try_parse_from(["sweep_stitcher", "-u", "kHz"]).unwrap();
        assert_eq!(args.units, FreqUnits::KHz);
    }

    #[test]
    fn test_full_crop_rejected() {
        assert!(Args::try_parse_from(["sweep_stitcher", "-p", "100"]).is_err());
    }

    #[test]
    fn test_convert_filter() {
        assert_eq!(
            convert_filter(log::LevelFilter::Debug),
            tracing_subscriber::filter::LevelFilter::DEBUG
        );
    }
}
