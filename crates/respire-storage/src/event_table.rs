//! Textual event-table (bdt/edt) writer and reader
//!
//! Lines are fixed-width decimal `(code, time)` pairs. The bdt flavor uses
//! `%5d%8d` with a 0.5 ms sub-tick and sentinel header rows of (11, 1111111);
//! the edt flavor uses `%5d%10d`, a 0.1 ms sub-tick and (33, 3333333). Codes
//! below 4096 are spike channels, codes at or above 4096 carry an analog
//! channel id in the high bits and a 12-bit sample in the low bits.

use crate::error::{Result, StorageError};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Event-table flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFormat {
    /// 0.5 ms sub-ticks, `%5d%8d`
    Bdt,
    /// 0.1 ms sub-ticks, `%5d%10d`
    Edt,
}

impl Default for EventFormat {
    fn default() -> Self {
        Self::Bdt
    }
}

impl EventFormat {
    /// Pick the flavor from an output filename (edt by extension)
    pub fn from_name(name: &str) -> Self {
        if name.to_ascii_lowercase().ends_with(".edt") {
            Self::Edt
        } else {
            Self::Bdt
        }
    }

    /// Output sub-tick duration in ms
    pub fn sub_tick_ms(&self) -> f64 {
        match self {
            Self::Bdt => 0.5,
            Self::Edt => 0.1,
        }
    }

    /// Sentinel header row written twice at the top of the file
    pub fn sentinel(&self) -> (i32, i64) {
        match self {
            Self::Bdt => (11, 1111111),
            Self::Edt => (33, 3333333),
        }
    }

    fn time_width(&self) -> usize {
        match self {
            Self::Bdt => 8,
            Self::Edt => 10,
        }
    }

    /// Convert a 0-based step number to output sub-ticks
    pub fn sub_ticks(&self, stepnum: i64, step_ms: f64) -> i64 {
        ((stepnum + 1) as f64 * step_ms / self.sub_tick_ms()) as i64
    }

    /// Render one record line (without the newline)
    pub fn render(&self, code: i32, time: i64) -> String {
        format!("{:5}{:width$}", code, time, width = self.time_width())
    }
}

/// Streaming writer for an event table
#[derive(Debug)]
pub struct EventTableWriter {
    out: BufWriter<File>,
    format: EventFormat,
}

impl EventTableWriter {
    /// Create the file and write the two sentinel header rows
    pub fn create(path: &Path, format: EventFormat) -> Result<Self> {
        let mut out = BufWriter::new(File::create(path)?);
        let (code, time) = format.sentinel();
        for _ in 0..2 {
            out.write_all(format.render(code, time as i64).as_bytes())?;
            out.write_all(b"\n")?;
        }
        Ok(Self { out, format })
    }

    /// The flavor this writer emits
    pub fn format(&self) -> EventFormat {
        self.format
    }

    /// Append one (code, time) record
    pub fn write(&mut self, code: i32, time: i64) -> Result<()> {
        self.out.write_all(self.format.render(code, time).as_bytes())?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    /// Flush buffered records to disk
    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// One parsed event-table record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    /// Channel/analog code
    pub code: i32,
    /// Time in output sub-ticks
    pub time: i64,
}

/// Whole-file reader used by the post-run marker pass
#[derive(Debug)]
pub struct EventTableReader {
    /// Records after the sentinel header, in file order
    pub records: Vec<EventRecord>,
    /// Sentinel row found in the header
    pub sentinel: (i32, i64),
}

fn parse_line(line: &str, lineno: usize) -> Result<EventRecord> {
    if line.len() < 6 {
        return Err(StorageError::MalformedRecord {
            line: lineno,
            reason: "record shorter than a code field".into(),
        });
    }
    let code = line[..5]
        .trim()
        .parse::<i32>()
        .map_err(|_| StorageError::MalformedRecord {
            line: lineno,
            reason: "bad code field".into(),
        })?;
    let time = line[5..]
        .trim()
        .parse::<i64>()
        .map_err(|_| StorageError::MalformedRecord {
            line: lineno,
            reason: "bad time field".into(),
        })?;
    Ok(EventRecord { code, time })
}

impl EventTableReader {
    /// Read an event table from a file
    pub fn open(path: &Path) -> Result<Self> {
        Self::read(BufReader::new(File::open(path)?))
    }

    /// Read an event table from any reader
    pub fn read(input: impl Read) -> Result<Self> {
        let mut lines = BufReader::new(input).lines().enumerate();

        let (n, first) = match lines.next() {
            None => return Err(StorageError::truncated("empty event table")),
            Some((n, line)) => (n + 1, line?),
        };
        let sentinel_rec = parse_line(&first, n)?;
        // second header row
        match lines.next() {
            None => return Err(StorageError::truncated("missing second header row")),
            Some((_, line)) => {
                line?;
            }
        }

        let mut records = Vec::new();
        for (n, line) in lines {
            let line = line?;
            if line.trim().is_empty() {
                break;
            }
            records.push(parse_line(&line, n + 1)?);
        }
        Ok(Self {
            records,
            sentinel: (sentinel_rec.code, sentinel_rec.time),
        })
    }

    /// Extract the analog channel with the given id as (value, time) pairs.
    ///
    /// Values are de-biased from the 12-bit encoding back to signed.
    pub fn analog_channel(&self, id: i32) -> (Vec<i32>, Vec<i64>) {
        let base = id * 4096;
        let mut values = Vec::new();
        let mut times = Vec::new();
        for rec in &self.records {
            if rec.code / 4096 == id {
                let mut val = rec.code - base;
                if val > 2047 {
                    val -= 4096;
                }
                values.push(val);
                times.push(rec.time);
            }
        }
        (values, times)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_format_selection() {
        assert_eq!(EventFormat::from_name("run.bdt"), EventFormat::Bdt);
        assert_eq!(EventFormat::from_name("run.EDT"), EventFormat::Edt);
        assert_eq!(EventFormat::from_name("plain"), EventFormat::Bdt);
    }

    #[test]
    fn test_render_widths() {
        assert_eq!(EventFormat::Bdt.render(101, 42), "  101      42");
        assert_eq!(EventFormat::Edt.render(101, 42), "  101        42");
    }

    #[test]
    fn test_sub_ticks() {
        // 0.5 ms steps in bdt: one output sub-tick per step
        assert_eq!(EventFormat::Bdt.sub_ticks(0, 0.5), 1);
        assert_eq!(EventFormat::Bdt.sub_ticks(9, 0.5), 10);
        // 0.5 ms steps in edt: five sub-ticks per step
        assert_eq!(EventFormat::Edt.sub_ticks(0, 0.5), 5);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bdt");
        let mut w = EventTableWriter::create(&path, EventFormat::Bdt).unwrap();
        w.write(101, 10).unwrap();
        w.write(4096 + 2048, 20).unwrap();
        w.flush().unwrap();
        drop(w);

        let r = EventTableReader::open(&path).unwrap();
        assert_eq!(r.sentinel, (11, 1111111));
        assert_eq!(r.records.len(), 2);
        assert_eq!(r.records[0].code, 101);
        assert_eq!(r.records[1].time, 20);
    }

    #[test]
    fn test_analog_extraction() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bdt");
        let mut w = EventTableWriter::create(&path, EventFormat::Bdt).unwrap();
        w.write(101, 5).unwrap();
        w.write(4096 + 2048, 10).unwrap(); // id 1, value 0
        w.write(4096 + 2148, 15).unwrap(); // id 1, value 100
        w.write(4096 + 4000, 20).unwrap(); // id 1, raw 4000 de-biases to -96
        w.flush().unwrap();
        drop(w);

        let r = EventTableReader::open(&path).unwrap();
        let (values, times) = r.analog_channel(1);
        assert_eq!(values, vec![0, 100, -96]);
        assert_eq!(times, vec![10, 15, 20]);
    }
}
