//! Binary channel archive ("RARC")
//!
//! A time-indexed, channel-oriented container for spike events and waveform
//! samples. The simulator writes one record per tick per subscribed channel;
//! the same format serves as the afferent signal input, read back through a
//! memory map. Layout, little-endian throughout:
//!
//! ```text
//! [ header, 64 bytes ][ channel table, 32 bytes per channel ][ records... ]
//! ```
//!
//! Each record is 12 bytes: channel u32, time-in-µs u32, value f32 (1.0 for
//! events). Header and data regions carry CRC32 checksums; the header
//! checksum is computed with its own field zeroed.

use crate::error::{Result, StorageError};
use crate::magic;
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

/// Archive format version this build reads and writes
pub const ARCHIVE_VERSION: u32 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 64;
/// Channel table entry size in bytes
pub const CHANNEL_ENTRY_SIZE: usize = 32;
/// Record size in bytes
pub const RECORD_SIZE: usize = 12;

const TITLE_LEN: usize = 20;

/// What a channel carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Point events (spikes, analog codes)
    Event,
    /// Regularly sampled waveform
    Wave,
}

impl ChannelKind {
    fn to_byte(self) -> u8 {
        match self {
            Self::Event => 0,
            Self::Wave => 1,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Event),
            1 => Some(Self::Wave),
            _ => None,
        }
    }
}

/// One channel of the archive, fixed at file creation
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveChannel {
    /// What the channel carries
    pub kind: ChannelKind,
    /// Caller-assigned channel id (event code, plot row)
    pub id: u32,
    /// Sample spacing in µs for wave channels; 0 for event channels
    pub sample_interval_us: u32,
    /// Short display title (at most 20 bytes, truncated)
    pub title: String,
}

impl ArchiveChannel {
    /// Event channel constructor
    pub fn event(id: u32, title: &str) -> Self {
        Self {
            kind: ChannelKind::Event,
            id,
            sample_interval_us: 0,
            title: title.to_string(),
        }
    }

    /// Wave channel constructor
    pub fn wave(id: u32, sample_interval_us: u32, title: &str) -> Self {
        Self {
            kind: ChannelKind::Wave,
            id,
            sample_interval_us,
            title: title.to_string(),
        }
    }

    fn encode(&self) -> [u8; CHANNEL_ENTRY_SIZE] {
        let mut buf = [0u8; CHANNEL_ENTRY_SIZE];
        buf[0] = self.kind.to_byte();
        buf[4..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.sample_interval_us.to_le_bytes());
        let title = self.title.as_bytes();
        let n = title.len().min(TITLE_LEN);
        buf[12..12 + n].copy_from_slice(&title[..n]);
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        let kind = ChannelKind::from_byte(buf[0]).ok_or(StorageError::Truncated {
            reason: format!("unknown channel kind {}", buf[0]),
        })?;
        let id = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let sample_interval_us = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let title_bytes = &buf[12..12 + TITLE_LEN];
        let end = title_bytes.iter().position(|&b| b == 0).unwrap_or(TITLE_LEN);
        let title = String::from_utf8_lossy(&title_bytes[..end]).into_owned();
        Ok(Self {
            kind,
            id,
            sample_interval_us,
            title,
        })
    }
}

#[derive(Debug, Clone)]
struct Header {
    tick_us: u32,
    channel_count: u32,
    record_count: u64,
    data_checksum: u32,
}

impl Header {
    fn encode(&self, header_checksum: u32) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&magic::ARCHIVE);
        buf[4..8].copy_from_slice(&ARCHIVE_VERSION.to_le_bytes());
        buf[8..12].copy_from_slice(&self.tick_us.to_le_bytes());
        buf[12..16].copy_from_slice(&self.channel_count.to_le_bytes());
        buf[16..24].copy_from_slice(&self.record_count.to_le_bytes());
        buf[24..28].copy_from_slice(&self.data_checksum.to_le_bytes());
        buf[28..32].copy_from_slice(&header_checksum.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<(Self, u32)> {
        if buf.len() < HEADER_SIZE {
            return Err(StorageError::truncated("file shorter than header"));
        }
        if buf[0..4] != magic::ARCHIVE {
            return Err(StorageError::InvalidMagic {
                expected: magic::ARCHIVE,
            });
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != ARCHIVE_VERSION {
            return Err(StorageError::UnsupportedVersion {
                version,
                supported: ARCHIVE_VERSION,
            });
        }
        let header = Self {
            tick_us: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            channel_count: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            record_count: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            data_checksum: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
        };
        let stored = u32::from_le_bytes(buf[28..32].try_into().unwrap());
        Ok((header, stored))
    }

    fn checksum(&self, channels: &[ArchiveChannel]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.encode(0));
        for ch in channels {
            hasher.update(&ch.encode());
        }
        hasher.finalize()
    }
}

/// Streaming archive writer
#[derive(Debug)]
pub struct ArchiveWriter {
    file: File,
    header: Header,
    channels: Vec<ArchiveChannel>,
    data_hasher: crc32fast::Hasher,
}

impl ArchiveWriter {
    /// Create an archive; the channel table is fixed from here on
    pub fn create(path: &Path, tick_us: u32, channels: Vec<ArchiveChannel>) -> Result<Self> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let header = Header {
            tick_us,
            channel_count: channels.len() as u32,
            record_count: 0,
            data_checksum: 0,
        };
        file.write_all(&header.encode(0))?;
        for ch in &channels {
            file.write_all(&ch.encode())?;
        }
        Ok(Self {
            file,
            header,
            channels,
            data_hasher: crc32fast::Hasher::new(),
        })
    }

    /// The fixed channel table
    pub fn channels(&self) -> &[ArchiveChannel] {
        &self.channels
    }

    fn write_record(&mut self, channel: u32, time_us: u32, value: f32) -> Result<()> {
        if channel as usize >= self.channels.len() {
            return Err(StorageError::NoSuchChannel { channel });
        }
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..4].copy_from_slice(&channel.to_le_bytes());
        buf[4..8].copy_from_slice(&time_us.to_le_bytes());
        buf[8..12].copy_from_slice(&value.to_le_bytes());
        self.file.write_all(&buf)?;
        self.data_hasher.update(&buf);
        self.header.record_count += 1;
        Ok(())
    }

    /// Append an event record
    pub fn write_event(&mut self, channel: u32, time_us: u32) -> Result<()> {
        self.write_record(channel, time_us, 1.0)
    }

    /// Append a waveform sample
    pub fn write_wave(&mut self, channel: u32, time_us: u32, value: f32) -> Result<()> {
        self.write_record(channel, time_us, value)
    }

    /// Seal the archive: patch counts and checksums into the header
    pub fn finish(mut self) -> Result<()> {
        self.header.data_checksum = self.data_hasher.finalize();
        let header_checksum = self.header.checksum(&self.channels);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.encode(header_checksum))?;
        self.file.flush()?;
        Ok(())
    }
}

/// One decoded record
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArchiveRecord {
    /// 0-based channel index
    pub channel: u32,
    /// Time in µs
    pub time_us: u32,
    /// Sample value; 1.0 for events
    pub value: f32,
}

/// Memory-mapped archive reader
#[derive(Debug)]
pub struct ArchiveReader {
    map: Mmap,
    header: Header,
    channels: Vec<ArchiveChannel>,
}

impl ArchiveReader {
    /// Open and validate an archive
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        // Safety: the map is read-only and lives as long as the reader.
        let map = unsafe { Mmap::map(&file)? };
        let (header, stored_header_crc) = Header::decode(&map)?;

        let table_end = HEADER_SIZE + header.channel_count as usize * CHANNEL_ENTRY_SIZE;
        if map.len() < table_end {
            return Err(StorageError::truncated("channel table"));
        }
        let mut channels = Vec::with_capacity(header.channel_count as usize);
        for n in 0..header.channel_count as usize {
            let off = HEADER_SIZE + n * CHANNEL_ENTRY_SIZE;
            channels.push(ArchiveChannel::decode(&map[off..off + CHANNEL_ENTRY_SIZE])?);
        }

        if header.checksum(&channels) != stored_header_crc {
            return Err(StorageError::ChecksumMismatch { section: "header" });
        }

        let data_end = table_end + header.record_count as usize * RECORD_SIZE;
        if map.len() < data_end {
            return Err(StorageError::truncated("record data"));
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&map[table_end..data_end]);
        if hasher.finalize() != header.data_checksum {
            return Err(StorageError::ChecksumMismatch { section: "data" });
        }

        Ok(Self {
            map,
            header,
            channels,
        })
    }

    /// Simulation tick duration recorded at creation, in µs
    pub fn tick_us(&self) -> u32 {
        self.header.tick_us
    }

    /// The channel table
    pub fn channels(&self) -> &[ArchiveChannel] {
        &self.channels
    }

    /// Index of the first wave channel, the conventional afferent input
    pub fn first_wave_channel(&self) -> Option<u32> {
        self.channels
            .iter()
            .position(|ch| ch.kind == ChannelKind::Wave)
            .map(|n| n as u32)
    }

    fn record(&self, n: usize) -> ArchiveRecord {
        let off = HEADER_SIZE
            + self.channels.len() * CHANNEL_ENTRY_SIZE
            + n * RECORD_SIZE;
        let buf = &self.map[off..off + RECORD_SIZE];
        ArchiveRecord {
            channel: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            time_us: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            value: f32::from_le_bytes(buf[8..12].try_into().unwrap()),
        }
    }

    /// Iterate all records in file order
    pub fn records(&self) -> impl Iterator<Item = ArchiveRecord> + '_ {
        (0..self.header.record_count as usize).map(move |n| self.record(n))
    }

    /// All (time, value) samples of one channel, in file order
    pub fn channel_samples(&self, channel: u32) -> Result<Vec<(u32, f32)>> {
        if channel as usize >= self.channels.len() {
            return Err(StorageError::NoSuchChannel { channel });
        }
        Ok(self
            .records()
            .filter(|r| r.channel == channel)
            .map(|r| (r.time_us, r.value))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_sample_archive(path: &Path) {
        let channels = vec![
            ArchiveChannel::event(101, "101 C  2"),
            ArchiveChannel::wave(0, 500, "An  1"),
        ];
        let mut w = ArchiveWriter::create(path, 500, channels).unwrap();
        w.write_event(0, 500).unwrap();
        w.write_wave(1, 500, 0.25).unwrap();
        w.write_wave(1, 1000, 0.5).unwrap();
        w.write_event(0, 1500).unwrap();
        w.finish().unwrap();
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.rarc");
        write_sample_archive(&path);

        let r = ArchiveReader::open(&path).unwrap();
        assert_eq!(r.tick_us(), 500);
        assert_eq!(r.channels().len(), 2);
        assert_eq!(r.channels()[0].kind, ChannelKind::Event);
        assert_eq!(r.channels()[1].sample_interval_us, 500);
        assert_eq!(r.first_wave_channel(), Some(1));

        let samples = r.channel_samples(1).unwrap();
        assert_eq!(samples, vec![(500, 0.25), (1000, 0.5)]);

        let events = r.channel_samples(0).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].0, 1500);
    }

    #[test]
    fn test_corruption_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.rarc");
        write_sample_archive(&path);

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        match ArchiveReader::open(&path) {
            Err(StorageError::ChecksumMismatch { section }) => assert_eq!(section, "data"),
            other => panic!("expected checksum mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.rarc");
        std::fs::write(&path, vec![0u8; 128]).unwrap();
        assert!(matches!(
            ArchiveReader::open(&path),
            Err(StorageError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_unknown_channel_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.rarc");
        let mut w = ArchiveWriter::create(&path, 500, vec![ArchiveChannel::event(1, "e")]).unwrap();
        assert!(w.write_event(3, 0).is_err());
    }
}
