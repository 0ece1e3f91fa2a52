use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Missing settings field: {0}")]
    MissingField(&'static str),
    #[error("Invalid value for {field}: {value}")]
    InvalidField { field: &'static str, value: String },
    #[error("Unknown frequency units: {0}")]
    UnknownUnits(String),
    #[error("Minimum frequency {min} Hz is not below maximum {max} Hz")]
    InvalidRange { min: f64, max: f64 },
    #[error("{hops} hops of {nbins} bins exceeds the limit of {limit} bins")]
    TooManyBins { hops: usize, nbins: u32, limit: usize },
    #[error("Settings stream is empty")]
    Empty,
    #[error("Trailing data in settings stream: {0}")]
    Trailing(String),
    #[error("Error reading settings: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum FileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Bad settings header: {0}")]
    Settings(#[from] SettingsError),
    #[error("Missing settings header")]
    MissingHeader,
    #[error("Line {line}: expected {expected} columns, found {found}")]
    ColumnCount {
        line: u64,
        expected: usize,
        found: usize,
    },
    #[error("Line {line}, column {column}: invalid number {value:?}")]
    InvalidNumber {
        line: u64,
        column: usize,
        value: String,
    },
    #[error("Line {line}: frequency {found} Hz does not match bin center {expected} Hz")]
    BinFrequency { line: u64, expected: f64, found: f64 },
    #[error("Expected {expected} bins, found {found}")]
    BinCount { expected: usize, found: usize },
    #[error("Raw payload is {found} bytes, expected {expected}")]
    LengthMismatch { expected: usize, found: usize },
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to start capture process: {0}")]
    Spawn(std::io::Error),
    #[error("Capture process has no stdout")]
    NoStdout,
    #[error("Error reading from capture source: {0}")]
    Read(#[from] std::io::Error),
    #[error("Error reading capture output: {0}")]
    Csv(#[from] csv::Error),
    #[error("Malformed readout line {line:?}: {reason}")]
    Parse { line: String, reason: &'static str },
}

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Acquisition is already running")]
    AlreadyRunning,
    #[error("A launch is already queued")]
    LaunchQueued,
    #[error("A sweep is in progress")]
    SweepInProgress,
    #[error("Hold depth must be at least 1")]
    InvalidHoldDepth,
    #[error("No measurement to capture")]
    NothingToCapture,
    #[error("Invalid settings: {0}")]
    Settings(#[from] SettingsError),
    #[error("Capture source error: {0}")]
    Source(#[from] SourceError),
    #[error("Failed to spawn acquisition thread: {0}")]
    Thread(std::io::Error),
}
