//! Capture sources backed by `rtl_power` output, either live from a child
//! process or replayed from a file it wrote earlier.
//!
//! Each output line is one hop:
//! `date, time, hz_low, hz_high, hz_step, samples, db, db, ...`

use std::{
    ffi::OsString,
    fs::File,
    io::Read,
    path::PathBuf,
    process::{Child, ChildStdout, Command, Stdio},
    sync::{Arc, Mutex},
};

use csv::{ReaderBuilder, StringRecord, Trim};
use tracing::{info, warn};

use crate::{
    capture::{CaptureSource, HaltHandle, Readout, SourceFactory},
    error::SourceError,
    settings::Settings,
};

// date, time, low, high, step, samples, at least one power value
const MIN_FIELDS: usize = 7;

/// A CSV reader set up for `rtl_power` output: no header, ragged rows,
/// padded fields
pub fn record_reader<R: Read>(r: R) -> csv::Reader<R> {
    ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(r)
}

fn parse_error(record: &StringRecord, reason: &'static str) -> SourceError {
    SourceError::Parse {
        line: record.iter().collect::<Vec<_>>().join(","),
        reason,
    }
}

fn parse_freq(record: &StringRecord, column: usize) -> Result<f64, SourceError> {
    record
        .get(column)
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| parse_error(record, "bad frequency field"))
}

/// Build a readout from one record of `rtl_power` output. `rtl_power` crops
/// hop edges itself, so the readout is flagged as already cropped.
pub fn parse_record(record: &StringRecord) -> Result<Readout, SourceError> {
    if record.len() < MIN_FIELDS {
        return Err(parse_error(record, "too few fields"));
    }
    let low = parse_freq(record, 2)?;
    let high = parse_freq(record, 3)?;
    if high <= low {
        return Err(parse_error(record, "empty frequency span"));
    }
    let samples = record
        .iter()
        .skip(6)
        .map(str::parse::<f64>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| parse_error(record, "bad power value"))?;
    let mut read = Readout::new(low, high - low, samples);
    read.edges_cropped = true;
    Ok(read)
}

/// Parse a single line of `rtl_power` output
pub fn parse_line(line: &str) -> Result<Readout, SourceError> {
    let mut record = StringRecord::new();
    if !record_reader(line.as_bytes()).read_record(&mut record)? {
        return Err(parse_error(&record, "too few fields"));
    }
    parse_record(&record)
}

/// Reads hops from anything that yields `rtl_power` lines
#[derive(Debug)]
pub struct RtlPowerReader<R> {
    reader: csv::Reader<R>,
    record: StringRecord,
    eof: bool,
}

impl<R: Read> RtlPowerReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: record_reader(reader),
            record: StringRecord::new(),
            eof: false,
        }
    }
}

impl<R: Read + Send + 'static> CaptureSource for RtlPowerReader<R> {
    fn next_readout(&mut self) -> Result<Option<Readout>, SourceError> {
        loop {
            match self.reader.read_record(&mut self.record) {
                Ok(true) => {}
                Ok(false) => {
                    self.eof = true;
                    return Ok(None);
                }
                Err(e) if e.is_io_error() => return Err(e.into()),
                Err(e) => {
                    warn!("Skipping unreadable line - {}", e);
                    continue;
                }
            }
            // A torn line shouldn't take the whole acquisition down
            match parse_record(&self.record) {
                Ok(read) => return Ok(Some(read)),
                Err(e) => warn!("Skipping line - {}", e),
            }
        }
    }

    fn is_alive(&mut self) -> bool {
        !self.eof
    }
}

/// Replays an `rtl_power` CSV file on every launch
#[derive(Clone, Debug)]
pub struct RtlPowerFile {
    pub path: PathBuf,
}

impl SourceFactory for RtlPowerFile {
    type Source = RtlPowerReader<File>;

    fn open(&mut self, _settings: &Settings) -> Result<Self::Source, SourceError> {
        let file = File::open(&self.path)?;
        info!(path = %self.path.display(), "Replaying rtl_power output");
        Ok(RtlPowerReader::new(file))
    }
}

/// A running `rtl_power` child process
pub struct RtlPowerProcess {
    child: Arc<Mutex<Child>>,
    reader: RtlPowerReader<ChildStdout>,
}

fn kill(child: &Mutex<Child>) {
    if let Ok(mut child) = child.lock() {
        // Already exited is fine
        let _ = child.kill();
        let _ = child.wait();
    }
}

impl CaptureSource for RtlPowerProcess {
    fn next_readout(&mut self) -> Result<Option<Readout>, SourceError> {
        self.reader.next_readout()
    }

    fn is_alive(&mut self) -> bool {
        match self.child.lock() {
            Ok(mut child) => matches!(child.try_wait(), Ok(None)),
            Err(_) => false,
        }
    }

    fn halt_handle(&self) -> Option<HaltHandle> {
        let child = self.child.clone();
        Some(Box::new(move || kill(&child)))
    }
}

impl Drop for RtlPowerProcess {
    fn drop(&mut self) {
        kill(&self.child);
    }
}

/// Spawns `rtl_power` configured from the settings of each launch
#[derive(Clone, Debug)]
pub struct RtlPowerFactory {
    pub program: PathBuf,
    pub device: Option<u32>,
    /// Seconds `rtl_power` integrates for each line
    pub integration: u32,
}

impl Default for RtlPowerFactory {
    fn default() -> Self {
        Self {
            program: PathBuf::from("rtl_power"),
            device: None,
            integration: 1,
        }
    }
}

impl RtlPowerFactory {
    /// Arguments for a continuous sweep matching `settings`
    pub fn args(&self, settings: &Settings) -> Vec<OsString> {
        let bin_hz = settings.freq_range_hz() / settings.bin_count() as f64;
        let mut args: Vec<OsString> = vec![
            "-f".into(),
            format!(
                "{:.0}:{:.0}:{:.0}",
                settings.low_freq_hz(),
                settings.high_freq_hz(),
                bin_hz
            )
            .into(),
            "-i".into(),
            self.integration.to_string().into(),
            "-c".into(),
            format!("{}%", settings.percent).into(),
        ];
        // Omitting the gain leaves the tuner on automatic gain
        if settings.gain > 0.0 {
            args.push("-g".into());
            args.push(settings.gain.to_string().into());
        }
        if let Some(device) = self.device {
            args.push("-d".into());
            args.push(device.to_string().into());
        }
        args
    }
}

impl SourceFactory for RtlPowerFactory {
    type Source = RtlPowerProcess;

    fn open(&mut self, settings: &Settings) -> Result<Self::Source, SourceError> {
        let args = self.args(settings);
        info!(program = %self.program.display(), ?args, "Spawning rtl_power");
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(SourceError::Spawn)?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                return Err(SourceError::NoStdout);
            }
        };
        Ok(RtlPowerProcess {
            child: Arc::new(Mutex::new(child)),
            reader: RtlPowerReader::new(stdout),
        })
    }
}
