//! Plot-block rendering and the numbered wave-file writer
//!
//! Plot output is grouped into blocks of up to 100 ticks. Each block carries
//! a header (row count, step size, channel descriptions) followed by one row
//! of (value, spike-flag) pairs per tick per channel. In file mode every
//! block lands in its own `wave.SS.NNNN` file, written under a `.tmp` name
//! and renamed once complete so a polling viewer never sees a partial block.
//! In socket mode the same text is framed and sent by the caller.

use crate::error::{Result, StorageError};
use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Per-channel description repeated in every block header
#[derive(Debug, Clone, PartialEq)]
pub struct PlotChannelInfo {
    /// 1-based population index
    pub pop: i32,
    /// 1-based cell/fiber index or encoded scale
    pub cell: i32,
    /// Variable code
    pub var: i32,
    /// Style hint, recomputed per tick (burster flag, afferent offset)
    pub typ: i32,
    /// Display label
    pub label: String,
}

/// Renders block header and row text shared by file and socket sinks
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockEncoder;

impl BlockEncoder {
    /// Render the block header: row count, step size, channel table
    pub fn header(nrecs: usize, step_ms: f64, channels: &[PlotChannelInfo]) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{:12} {:.6}", nrecs, step_ms);
        let _ = writeln!(out, "{:12}", channels.len());
        for ch in channels {
            let _ = writeln!(
                out,
                "{:3} {:3} {:3} {} {}",
                ch.pop, ch.cell, ch.var, ch.typ, ch.label
            );
        }
        out
    }

    /// Render one tick's rows: one (value, spike) line per channel
    pub fn rows(values: &[(f64, i32)]) -> String {
        let mut out = String::new();
        for &(val, spike) in values {
            let _ = writeln!(out, "{:12.8} {}", val, spike);
        }
        out
    }
}

/// Highest block number plus one; the counter wraps back to zero here
pub const BLOCK_NUMBER_WRAP: u32 = 10000;

/// Writes each plot block to its own numbered file
#[derive(Debug)]
pub struct WaveFileWriter {
    dir: PathBuf,
    spawn: i32,
    block_number: u32,
    current: Option<(fs::File, PathBuf, PathBuf)>,
}

impl WaveFileWriter {
    /// Create a writer placing files under `dir` tagged with the spawn number
    pub fn new(dir: &Path, spawn: i32) -> Self {
        Self {
            dir: dir.to_path_buf(),
            spawn,
            block_number: 0,
            current: None,
        }
    }

    /// The number the next block will carry
    pub fn block_number(&self) -> u32 {
        self.block_number
    }

    fn names(&self) -> (PathBuf, PathBuf) {
        let name = format!("wave.{:02}.{:04}", self.spawn, self.block_number);
        let final_path = self.dir.join(&name);
        let tmp_path = self.dir.join(format!("{}.tmp", name));
        (final_path, tmp_path)
    }

    /// Open the next block file and write its header
    pub fn begin_block(
        &mut self,
        nrecs: usize,
        step_ms: f64,
        channels: &[PlotChannelInfo],
    ) -> Result<()> {
        if self.current.is_some() {
            return Err(StorageError::Misuse {
                reason: "begin_block with a block already open",
            });
        }
        let (final_path, tmp_path) = self.names();
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(BlockEncoder::header(nrecs, step_ms, channels).as_bytes())?;
        self.current = Some((file, tmp_path, final_path));
        Ok(())
    }

    /// Append one tick's rows to the open block
    pub fn rows(&mut self, values: &[(f64, i32)]) -> Result<()> {
        match &mut self.current {
            None => Err(StorageError::Misuse {
                reason: "rows without an open block",
            }),
            Some((file, _, _)) => {
                file.write_all(BlockEncoder::rows(values).as_bytes())?;
                Ok(())
            }
        }
    }

    /// Flush, close, and rename the open block into place
    pub fn end_block(&mut self) -> Result<()> {
        match self.current.take() {
            None => Err(StorageError::Misuse {
                reason: "end_block without an open block",
            }),
            Some((mut file, tmp_path, final_path)) => {
                file.flush()?;
                drop(file);
                fs::rename(&tmp_path, &final_path)?;
                self.block_number += 1;
                if self.block_number == BLOCK_NUMBER_WRAP {
                    self.block_number = 0;
                }
                Ok(())
            }
        }
    }

    /// Abandon a partially written block, removing its temp file
    pub fn abort_block(&mut self) {
        if let Some((file, tmp_path, _)) = self.current.take() {
            drop(file);
            let _ = fs::remove_file(tmp_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn channels() -> Vec<PlotChannelInfo> {
        vec![
            PlotChannelInfo {
                pop: 1,
                cell: 1,
                var: 1,
                typ: 0,
                label: "Vm".into(),
            },
            PlotChannelInfo {
                pop: 2,
                cell: 1,
                var: -1,
                typ: 0,
                label: "volume".into(),
            },
        ]
    }

    #[test]
    fn test_header_layout() {
        let text = BlockEncoder::header(100, 0.5, &channels());
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "         100 0.500000");
        assert_eq!(lines.next().unwrap(), "           2");
        assert_eq!(lines.next().unwrap(), "  1   1   1 0 Vm");
        assert_eq!(lines.next().unwrap(), "  2   1  -1 0 volume");
    }

    #[test]
    fn test_row_layout() {
        let text = BlockEncoder::rows(&[(-60.0, 1), (0.125, 0)]);
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "-60.00000000 1");
        assert_eq!(lines.next().unwrap(), "  0.12500000 0");
    }

    #[test]
    fn test_file_blocks_rename_and_wrap() {
        let dir = tempdir().unwrap();
        let mut w = WaveFileWriter::new(dir.path(), 2);
        w.begin_block(1, 0.5, &channels()).unwrap();
        w.rows(&[(1.0, 0), (2.0, 1)]).unwrap();
        w.end_block().unwrap();

        let produced = dir.path().join("wave.02.0000");
        assert!(produced.exists());
        assert!(!dir.path().join("wave.02.0000.tmp").exists());
        assert_eq!(w.block_number(), 1);

        let text = fs::read_to_string(produced).unwrap();
        assert!(text.contains("  1.00000000 0"));
    }

    #[test]
    fn test_misuse_errors() {
        let dir = tempdir().unwrap();
        let mut w = WaveFileWriter::new(dir.path(), 0);
        assert!(w.rows(&[(0.0, 0)]).is_err());
        assert!(w.end_block().is_err());
        w.begin_block(1, 0.5, &channels()).unwrap();
        assert!(w.begin_block(1, 0.5, &channels()).is_err());
        w.abort_block();
    }
}
