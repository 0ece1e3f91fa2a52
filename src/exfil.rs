//! This module is responsible for getting measurements onto disk and back.
//!
//! Two formats are supported:
//! * CSV: one header row with the settings fields (plus `num_scans`), then one
//!   row per bin with `freq_hz,spectrum_db,average_db,max_db,min_db`
//! * Binary: a "meta" file with settings, `num_scans`, `step_freq` and the bin
//!   count, and a "raw" file with the four arrays back to back as f64. Both
//!   are written in host byte order.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use byte_slice_cast::AsByteSlice;
use byteorder::{ByteOrder, NativeEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Datelike, Timelike, Utc};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use tracing::debug;

use crate::{
    error::FileError,
    measurement::Measurement,
    settings::{FreqUnits, Settings, FIELDS},
};

/// Settings fields plus the scan count
pub const HEADER_COLUMNS: usize = FIELDS.len() + 1;
/// freq, spectrum, average, max, min
pub const DATA_COLUMNS: usize = 5;

/// Timestamp used in output file names
pub fn file_timestamp(time: &DateTime<Utc>) -> String {
    format!(
        "{}-{:02}-{:02}-{:02}{:02}{:02}",
        time.year(),
        time.month(),
        time.day(),
        time.hour(),
        time.minute(),
        time.second()
    )
}

/// `sweep-<timestamp>.<ext>` for right now
pub fn timestamped_name(ext: &str) -> String {
    format!("sweep-{}.{}", file_timestamp(&Utc::now()), ext)
}

fn parse_number(record: &StringRecord, column: usize, line: u64) -> Result<f64, FileError> {
    let field = record.get(column).unwrap_or_default();
    field.trim().parse().map_err(|_| FileError::InvalidNumber {
        line,
        column,
        value: field.to_owned(),
    })
}

impl Measurement {
    pub fn write_csv<W: Write>(&self, w: W) -> Result<(), FileError> {
        let mut writer = WriterBuilder::new().flexible(true).from_writer(w);
        let mut header = self.settings.to_fields().to_vec();
        header.push(self.num_scans.to_string());
        writer.write_record(&header)?;
        for i in 0..self.bin_count() {
            writer.write_record(&[
                self.get_bin_center_freq(i).to_string(),
                self.spectrum[i].to_string(),
                self.average[i].to_string(),
                self.max[i].to_string(),
                self.min[i].to_string(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn to_csv(&self) -> Result<String, FileError> {
        let mut buf = Vec::new();
        self.write_csv(&mut buf)?;
        // The csv writer only ever emits what we gave it, which is all UTF-8
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    pub fn read_csv<R: Read>(r: R) -> Result<Self, FileError> {
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(r);
        let mut records = reader.records();

        let header = records.next().ok_or(FileError::MissingHeader)??;
        if header.len() != HEADER_COLUMNS {
            return Err(FileError::ColumnCount {
                line: 1,
                expected: HEADER_COLUMNS,
                found: header.len(),
            });
        }
        let settings = Settings::from_fields(header.iter().take(FIELDS.len()).map(str::trim))?;
        settings.validate()?;
        let num_scans = header[FIELDS.len()]
            .trim()
            .parse()
            .map_err(|_| FileError::InvalidNumber {
                line: 1,
                column: FIELDS.len(),
                value: header[FIELDS.len()].to_owned(),
            })?;

        let mut meas = Measurement::new(settings);
        meas.num_scans = num_scans;
        let expected = meas.bin_count();
        let half_bin = meas.get_hertz_per_bin() / 2.0;

        let mut found = 0;
        for (i, record) in records.enumerate() {
            let record = record?;
            let line = i as u64 + 2;
            if record.len() != DATA_COLUMNS {
                return Err(FileError::ColumnCount {
                    line,
                    expected: DATA_COLUMNS,
                    found: record.len(),
                });
            }
            if i >= expected {
                found = i + 1;
                continue;
            }
            let freq = parse_number(&record, 0, line)?;
            let center = meas.get_bin_center_freq(i);
            if (freq - center).abs() > half_bin {
                return Err(FileError::BinFrequency {
                    line,
                    expected: center,
                    found: freq,
                });
            }
            meas.spectrum[i] = parse_number(&record, 1, line)?;
            meas.average[i] = parse_number(&record, 2, line)?;
            meas.max[i] = parse_number(&record, 3, line)?;
            meas.min[i] = parse_number(&record, 4, line)?;
            found = i + 1;
        }
        if found != expected {
            return Err(FileError::BinCount { expected, found });
        }
        Ok(meas)
    }

    pub fn from_csv(s: &str) -> Result<Self, FileError> {
        Self::read_csv(s.as_bytes())
    }

    pub fn save_csv<P: AsRef<Path>>(&self, path: P) -> Result<(), FileError> {
        let file = File::create(path.as_ref())?;
        self.write_csv(BufWriter::new(file))?;
        debug!(path = %path.as_ref().display(), bins = self.bin_count(), "Wrote CSV");
        Ok(())
    }

    pub fn load_csv<P: AsRef<Path>>(path: P) -> Result<Self, FileError> {
        Self::read_csv(BufReader::new(File::open(path)?))
    }

    pub fn write_bin_meta<W: Write>(&self, w: &mut W) -> Result<(), FileError> {
        let s = &self.settings;
        w.write_u32::<NativeEndian>(s.samp_rate)?;
        w.write_f64::<NativeEndian>(s.min_freq)?;
        w.write_u32::<NativeEndian>(s.min_freq_units.code())?;
        w.write_f64::<NativeEndian>(s.max_freq)?;
        w.write_u32::<NativeEndian>(s.max_freq_units.code())?;
        w.write_f32::<NativeEndian>(s.gain)?;
        w.write_u32::<NativeEndian>(s.nbins)?;
        w.write_u32::<NativeEndian>(s.percent)?;
        w.write_u32::<NativeEndian>(s.nsamples)?;
        w.write_u32::<NativeEndian>(self.num_scans)?;
        w.write_f64::<NativeEndian>(self.step_freq)?;
        w.write_u64::<NativeEndian>(self.bin_count() as u64)?;
        Ok(())
    }

    pub fn write_bin_raw<W: Write>(&self, w: &mut W) -> Result<(), FileError> {
        for arr in [&self.spectrum, &self.average, &self.max, &self.min] {
            w.write_all(arr.as_byte_slice())?;
        }
        Ok(())
    }

    /// Populate settings and counters from a meta payload. The arrays are
    /// resized (zeroed) to the stored bin count, ready for [`Measurement::read_bin_raw`].
    pub fn read_bin_meta<R: Read>(&mut self, r: &mut R) -> Result<(), FileError> {
        let settings = Settings {
            samp_rate: r.read_u32::<NativeEndian>()?,
            min_freq: r.read_f64::<NativeEndian>()?,
            min_freq_units: FreqUnits::from_code(r.read_u32::<NativeEndian>()?)?,
            max_freq: r.read_f64::<NativeEndian>()?,
            max_freq_units: FreqUnits::from_code(r.read_u32::<NativeEndian>()?)?,
            gain: r.read_f32::<NativeEndian>()?,
            nbins: r.read_u32::<NativeEndian>()?,
            percent: r.read_u32::<NativeEndian>()?,
            nsamples: r.read_u32::<NativeEndian>()?,
        };
        let num_scans = r.read_u32::<NativeEndian>()?;
        let step_freq = r.read_f64::<NativeEndian>()?;
        let bin_count = r.read_u64::<NativeEndian>()? as usize;
        settings.validate()?;
        if bin_count != settings.bin_count() {
            return Err(FileError::BinCount {
                expected: settings.bin_count(),
                found: bin_count,
            });
        }
        *self = Measurement::new(settings);
        self.num_scans = num_scans;
        self.step_freq = step_freq;
        Ok(())
    }

    /// Fill the arrays from a raw payload. The payload must hold exactly four
    /// arrays of the length set up by the meta payload.
    pub fn read_bin_raw<R: Read>(&mut self, r: &mut R) -> Result<(), FileError> {
        let n = self.bin_count();
        let expected = 4 * n * std::mem::size_of::<f64>();
        let mut bytes = Vec::with_capacity(expected);
        r.read_to_end(&mut bytes)?;
        if bytes.len() != expected {
            return Err(FileError::LengthMismatch {
                expected,
                found: bytes.len(),
            });
        }
        let stride = n * std::mem::size_of::<f64>();
        for (chunk, arr) in bytes.chunks_exact(stride.max(1)).zip([
            &mut self.spectrum,
            &mut self.average,
            &mut self.max,
            &mut self.min,
        ]) {
            NativeEndian::read_f64_into(chunk, arr);
        }
        Ok(())
    }

    pub fn save_bin<P: AsRef<Path>>(&self, meta: P, raw: P) -> Result<(), FileError> {
        let mut w = BufWriter::new(File::create(meta)?);
        self.write_bin_meta(&mut w)?;
        w.flush()?;
        let mut w = BufWriter::new(File::create(raw)?);
        self.write_bin_raw(&mut w)?;
        w.flush()?;
        Ok(())
    }

    pub fn from_bin_file_meta<P: AsRef<Path>>(path: P, meas: &mut Measurement) -> Result<(), FileError> {
        meas.read_bin_meta(&mut BufReader::new(File::open(path)?))
    }

    pub fn from_bin_file_raw<P: AsRef<Path>>(path: P, meas: &mut Measurement) -> Result<(), FileError> {
        meas.read_bin_raw(&mut BufReader::new(File::open(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SettingsError;
    use std::io::Cursor;

    fn sample() -> Measurement {
        let settings = Settings {
            samp_rate: 1_000_000,
            min_freq: 100.0,
            max_freq: 102.0,
            // Two hops of four bins
            nbins: 4,
            percent: 0,
            gain: 12.5,
            ..Default::default()
        };
        let mut m = Measurement::new(settings);
        for i in 0..m.bin_count() {
            m.spectrum[i] = -60.0 + i as f64 * 0.37;
            m.average[i] = -61.25 + i as f64 * 0.1;
            m.max[i] = -55.5 - i as f64 / 3.0;
            m.min[i] = -70.125;
        }
        m.num_scans = 4;
        m
    }

    fn assert_arrays_close(a: &[f64], b: &[f64]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-9, "{} != {}", x, y);
        }
    }

    #[test]
    fn test_timestamp() {
        let time = DateTime::parse_from_rfc3339("2023-04-05T06:07:08Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(file_timestamp(&time), "2023-04-05-060708");
    }

    #[test]
    fn test_csv_round_trip() {
        let m = sample();
        let csv = m.to_csv().unwrap();
        assert_eq!(csv.lines().count(), 1 + m.bin_count());
        let back = Measurement::from_csv(&csv).unwrap();
        assert_eq!(back.settings, m.settings);
        assert_eq!(back.num_scans, 4);
        assert_arrays_close(&back.spectrum, &m.spectrum);
        assert_arrays_close(&back.average, &m.average);
        assert_arrays_close(&back.max, &m.max);
        assert_arrays_close(&back.min, &m.min);
    }

    #[test]
    fn test_csv_rejects_wrong_column_count() {
        let csv = sample().to_csv().unwrap();
        let mut lines: Vec<String> = csv.lines().map(str::to_owned).collect();
        lines[3] = lines[3].rsplit_once(',').unwrap().0.to_owned();
        let err = Measurement::from_csv(&lines.join("\n")).unwrap_err();
        assert!(matches!(
            err,
            FileError::ColumnCount {
                line: 4,
                expected: 5,
                found: 4
            }
        ));
    }

    #[test]
    fn test_csv_rejects_truncation_and_garbage() {
        let csv = sample().to_csv().unwrap();
        let truncated: Vec<&str> = csv.lines().take(5).collect();
        assert!(matches!(
            Measurement::from_csv(&truncated.join("\n")),
            Err(FileError::BinCount {
                expected: 8,
                found: 4
            })
        ));

        let garbage = csv.replacen("-60", "abc", 1);
        assert!(matches!(
            Measurement::from_csv(&garbage),
            Err(FileError::InvalidNumber { line: 2, .. })
        ));

        assert!(matches!(
            Measurement::from_csv(""),
            Err(FileError::MissingHeader)
        ));
    }

    #[test]
    fn test_csv_rejects_misplaced_bins() {
        let m = sample();
        let csv = m.to_csv().unwrap();
        let first_freq = m.get_bin_center_freq(0).to_string();
        let moved = csv.replacen(&format!("\n{},", first_freq), "\n50000000,", 1);
        assert!(matches!(
            Measurement::from_csv(&moved),
            Err(FileError::BinFrequency { line: 2, .. })
        ));
    }

    #[test]
    fn test_csv_rejects_bad_settings_header() {
        let inverted = "2000000,108,MHz,88,MHz,0,256,20,1,0\n";
        assert!(matches!(
            Measurement::from_csv(inverted),
            Err(FileError::Settings(SettingsError::InvalidRange { .. }))
        ));

        // A range this wide would need more bins than we can address
        let huge = "1,1,Hz,1e300,Hz,0,2,0,1,0\n";
        assert!(matches!(
            Measurement::from_csv(huge),
            Err(FileError::Settings(SettingsError::TooManyBins { .. }))
        ));
        // Overflows to infinity once converted to Hz
        let infinite = "1,1,Hz,1e300,GHz,0,2,0,1,0\n";
        assert!(matches!(
            Measurement::from_csv(infinite),
            Err(FileError::Settings(SettingsError::InvalidRange { .. }))
        ));
    }

    #[test]
    fn test_binary_meta_rejects_bad_settings() {
        let mut m = sample();
        m.settings.max_freq = 1e300;
        m.settings.max_freq_units = FreqUnits::Hz;
        let mut meta = Vec::new();
        m.write_bin_meta(&mut meta).unwrap();
        let mut back = Measurement::new(Settings::default());
        assert!(matches!(
            back.read_bin_meta(&mut Cursor::new(meta)),
            Err(FileError::Settings(SettingsError::TooManyBins { .. }))
        ));

        let mut m = sample();
        m.settings.min_freq = 200.0;
        let mut meta = Vec::new();
        m.write_bin_meta(&mut meta).unwrap();
        assert!(matches!(
            back.read_bin_meta(&mut Cursor::new(meta)),
            Err(FileError::Settings(SettingsError::InvalidRange { .. }))
        ));
        // Nothing was loaded
        assert_eq!(back.settings, Settings::default());
    }

    #[test]
    fn test_binary_round_trip() {
        let m = sample();
        let mut meta = Vec::new();
        let mut raw = Vec::new();
        m.write_bin_meta(&mut meta).unwrap();
        m.write_bin_raw(&mut raw).unwrap();
        assert_eq!(raw.len(), 4 * 8 * 8);

        let mut back = Measurement::new(Settings::default());
        back.read_bin_meta(&mut Cursor::new(meta)).unwrap();
        assert_eq!(back.bin_count(), 8);
        back.read_bin_raw(&mut Cursor::new(raw)).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn test_binary_raw_length_mismatch() {
        let m = sample();
        let mut meta = Vec::new();
        let mut raw = Vec::new();
        m.write_bin_meta(&mut meta).unwrap();
        m.write_bin_raw(&mut raw).unwrap();
        raw.truncate(raw.len() - 8);

        let mut back = Measurement::new(Settings::default());
        back.read_bin_meta(&mut Cursor::new(meta)).unwrap();
        assert!(matches!(
            back.read_bin_raw(&mut Cursor::new(raw)),
            Err(FileError::LengthMismatch {
                expected: 256,
                found: 248
            })
        ));
    }

    #[test]
    fn test_binary_meta_bin_count_mismatch() {
        let mut m = sample();
        m.spectrum.push(0.0);
        let mut meta = Vec::new();
        m.write_bin_meta(&mut meta).unwrap();
        let mut back = Measurement::new(Settings::default());
        assert!(matches!(
            back.read_bin_meta(&mut Cursor::new(meta)),
            Err(FileError::BinCount {
                expected: 8,
                found: 9
            })
        ));
    }
}
