//! Afferent signal sources and the tick resampler
//!
//! An afferent fiber population is driven by an external timebase-stamped
//! signal. The source interface is deliberately narrow — advertise a sample
//! period, answer "the sample in this half-open µs window" — so a waveform
//! archive on disk and a live external process look identical to the
//! engine. The resampler bridges the source clock and the simulation tick:
//! faster sources are averaged over the tick (including the sample carried
//! from the previous call), slower sources are held, equal rates pass
//! through. A missing sample yields no value and the fiber emits no events.

use crate::error::Result;
use respire_model::AfferentMap;
use respire_storage::ArchiveReader;
use std::path::Path;

/// A timebase-stamped signal source
pub trait SignalSource: std::fmt::Debug {
    /// Source sample period in µs
    fn sample_interval_us(&self) -> u64;
    /// First sample with time in [start, stop), as (time µs, value)
    fn read(&mut self, start_us: u64, stop_us: u64) -> Option<(u64, f32)>;
}

/// Signal source backed by a waveform archive channel
#[derive(Debug)]
pub struct ArchiveSource {
    samples: Vec<(u32, f32)>,
    interval_us: u64,
    cursor: usize,
}

impl ArchiveSource {
    /// Open the first wave channel of an archive file
    pub fn open(path: &Path) -> Result<Option<Self>> {
        let reader = ArchiveReader::open(path)?;
        let chan = match reader.first_wave_channel() {
            None => {
                log::warn!("{}: no wave channel, afferent source disabled", path.display());
                return Ok(None);
            }
            Some(chan) => chan,
        };
        let interval_us = u64::from(reader.channels()[chan as usize].sample_interval_us).max(1);
        let samples = reader.channel_samples(chan)?;
        log::info!(
            "{}: afferent source, {} samples at {} µs",
            path.display(),
            samples.len(),
            interval_us
        );
        Ok(Some(Self {
            samples,
            interval_us,
            cursor: 0,
        }))
    }

    /// Source over explicit samples, for tests and synthetic drives
    pub fn from_samples(samples: Vec<(u32, f32)>, interval_us: u64) -> Self {
        Self {
            samples,
            interval_us,
            cursor: 0,
        }
    }
}

impl SignalSource for ArchiveSource {
    fn sample_interval_us(&self) -> u64 {
        self.interval_us
    }

    fn read(&mut self, start_us: u64, stop_us: u64) -> Option<(u64, f32)> {
        // sequential scans dominate; resume from the cursor and back up if
        // the caller asked for an earlier window
        while self.cursor > 0 && u64::from(self.samples[self.cursor - 1].0) >= start_us {
            self.cursor -= 1;
        }
        while let Some(&(t, v)) = self.samples.get(self.cursor) {
            let t = u64::from(t);
            if t < start_us {
                self.cursor += 1;
            } else if t < stop_us {
                return Some((t, v));
            } else {
                return None;
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cadence {
    Faster,
    Slower,
    Same,
}

/// Resampler bridging a source clock to simulation ticks
#[derive(Debug)]
pub struct AfferentInput {
    source: Box<dyn SignalSource>,
    cadence: Cadence,
    /// read cursor on the source clock, µs
    start_time: u64,
    /// carried sample straddling the tick boundary (faster) or held (slower)
    carry: f64,
    src_step: u64,
    sim_step: u64,
    /// current source interval, slower cadence only
    src_right: u64,
    /// current sim interval
    sim_left: u64,
    sim_right: u64,
}

impl AfferentInput {
    /// Wrap a source for a simulation with the given tick length
    pub fn new(mut source: Box<dyn SignalSource>, sim_step_us: u64) -> Self {
        let src_step = source.sample_interval_us();
        let cadence = match src_step.cmp(&sim_step_us) {
            std::cmp::Ordering::Less => Cadence::Faster,
            std::cmp::Ordering::Greater => Cadence::Slower,
            std::cmp::Ordering::Equal => Cadence::Same,
        };
        let mut carry = f64::NAN;
        let mut start_time = 0;
        if cadence == Cadence::Slower {
            // prime the held value so the first ticks have a sample
            if let Some((_, v)) = source.read(0, src_step) {
                carry = f64::from(v);
            }
            start_time = src_step;
        }
        Self {
            source,
            cadence,
            start_time,
            carry,
            src_step,
            sim_step: sim_step_us,
            src_right: src_step,
            sim_left: 0,
            sim_right: sim_step_us,
        }
    }

    /// The sample for the current tick; None when the source has no data.
    /// Advances to the next tick interval either way.
    pub fn next(&mut self) -> Option<f64> {
        let result = match self.cadence {
            Cadence::Faster => self.next_faster(),
            Cadence::Slower => self.next_slower(),
            Cadence::Same => self.next_same(),
        };
        self.sim_left += self.sim_step;
        self.sim_right += self.sim_step;
        result
    }

    fn next_faster(&mut self) -> Option<f64> {
        let mut sum = 0.0;
        let mut n = 0usize;
        if self.carry.is_finite() {
            sum += self.carry;
            n += 1;
        }
        loop {
            let (t, v) = self
                .source
                .read(self.start_time, self.start_time + self.src_step)?;
            self.start_time += self.src_step;
            if t >= self.sim_right {
                // straddles the boundary; carried into the next tick
                self.carry = f64::from(v);
                break;
            }
            sum += f64::from(v);
            n += 1;
        }
        if n == 0 {
            None
        } else {
            Some(sum / n as f64)
        }
    }

    fn next_slower(&mut self) -> Option<f64> {
        if self.src_right <= self.sim_left {
            // the tick cursor crossed into the next source sample
            if let Some((_, v)) = self
                .source
                .read(self.start_time, self.start_time + self.src_step)
            {
                self.carry = f64::from(v);
            }
            self.start_time += self.src_step;
            self.src_right += self.src_step;
        }
        self.carry.is_finite().then_some(self.carry)
    }

    fn next_same(&mut self) -> Option<f64> {
        let (_, v) = self
            .source
            .read(self.start_time, self.start_time + self.src_step)?;
        self.start_time += self.src_step;
        Some(f64::from(v))
    }
}

/// Map a signal value to a firing probability by linear interpolation on the
/// ascending (value, probability) table. Values outside the table give 0.
pub fn interpolate(map: &AfferentMap, value: f64) -> f64 {
    let n = map.values.len();
    for idx in 0..n.saturating_sub(1) {
        let (v0, v1) = (map.values[idx], map.values[idx + 1]);
        if value >= v0 && value < v1 {
            let (p0, p1) = (map.probabilities[idx], map.probabilities[idx + 1]);
            return (p1 - p0) / (v1 - v0) * (value - v0) + p0;
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_source(interval_us: u64, count: usize, slope: f32) -> Box<dyn SignalSource> {
        let samples = (0..count)
            .map(|n| ((n as u64 * interval_us) as u32, n as f32 * slope))
            .collect();
        Box::new(ArchiveSource::from_samples(samples, interval_us))
    }

    #[test]
    fn test_faster_source_averages_over_tick() {
        // 0.2 ms source, 1 ms tick, unit-slope ramp: each tick's value is
        // the mean of the five source samples covering it
        let mut input = AfferentInput::new(ramp_source(200, 100, 1.0), 1000);
        let first = input.next().unwrap();
        assert!((first - (0.0 + 1.0 + 2.0 + 3.0 + 4.0) / 5.0).abs() < 1e-6);
        let second = input.next().unwrap();
        assert!((second - (5.0 + 6.0 + 7.0 + 8.0 + 9.0) / 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_slower_source_holds() {
        // 2 ms source, 0.5 ms tick: each source sample is held four ticks
        let mut input = AfferentInput::new(ramp_source(2000, 10, 1.0), 500);
        let values: Vec<f64> = (0..8).map(|_| input.next().unwrap()).collect();
        assert_eq!(values, vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_same_rate_passthrough() {
        let mut input = AfferentInput::new(ramp_source(500, 5, 2.0), 500);
        assert_eq!(input.next(), Some(0.0));
        assert_eq!(input.next(), Some(2.0));
        assert_eq!(input.next(), Some(4.0));
    }

    #[test]
    fn test_exhausted_source_yields_none() {
        let mut input = AfferentInput::new(ramp_source(500, 2, 1.0), 500);
        assert!(input.next().is_some());
        assert!(input.next().is_some());
        assert!(input.next().is_none());
    }

    #[test]
    fn test_interpolate_table() {
        let map = AfferentMap {
            values: vec![0.0, 0.5, 1.0],
            probabilities: vec![0.0, 0.2, 1.0],
            ..Default::default()
        };
        assert_eq!(interpolate(&map, -0.1), 0.0);
        assert!((interpolate(&map, 0.25) - 0.1).abs() < 1e-12);
        assert!((interpolate(&map, 0.75) - 0.6).abs() < 1e-12);
        // at and past the top of the table: outside the half-open range
        assert_eq!(interpolate(&map, 1.0), 0.0);
        assert_eq!(interpolate(&map, 2.0), 0.0);
    }

    #[test]
    fn test_identity_table_is_idempotent() {
        let map = AfferentMap {
            values: vec![0.0, 1.0],
            probabilities: vec![0.0, 1.0],
            ..Default::default()
        };
        for &c in &[0.0, 0.125, 0.5, 0.99] {
            assert!((interpolate(&map, c) - c).abs() < 1e-12);
        }
    }
}
