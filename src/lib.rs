//! Stitches bandwidth-limited power readouts from a swept receiver into
//! full-range spectra, with hold-depth averaging and baseline subtraction.

pub mod args;
pub mod averaging;
pub mod capture;
pub mod controller;
pub mod error;
pub mod exfil;
pub mod measurement;
pub mod monitoring;
pub mod rtl_power;
pub mod settings;
pub mod stitch;

pub use capture::{CaptureSource, Readout, Scan, SourceFactory};
pub use controller::{ControllerConfig, SweepController};
pub use measurement::{BaselineMode, Measure, Measurement};
pub use settings::{FreqUnits, Settings};
