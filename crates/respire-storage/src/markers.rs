//! Post-run inspiratory/expiratory marker insertion
//!
//! After a run that produced an event table with an analog channel, this
//! pass smooths the analog samples with a triangular-wave kernel, watches the
//! normalized slope for threshold crossings, and merges synthetic marker
//! events into a new table: code 97 at inspiratory onsets, 98 at expiratory
//! onsets, plus optional fixed pulse pairs from the description. The merged
//! file is named for downstream clustering tools:
//! `YYYY-MM-DD_001_simIE<spawn>.<ext>`.

use crate::error::Result;
use crate::event_table::EventTableReader;
use respire_model::MarkerParams;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Inspiratory onset marker code
pub const MARKER_INSP: i32 = 97;
/// Expiratory onset marker code
pub const MARKER_EXP: i32 = 98;

/// Build the triangular-wave smoothing kernel, normalized by its absolute sum
fn smoothing_kernel(len: usize) -> Vec<f64> {
    use std::f64::consts::PI;
    let mut kernel = vec![0.0; len];
    let mut accum = 0.0;
    for (n, k) in kernel.iter_mut().enumerate() {
        let rk = n as f64 * 2.0 * PI / (len as f64 - 1.0);
        *k = if rk <= PI / 2.0 {
            2.0 * rk / PI
        } else if rk <= 3.0 * PI / 2.0 {
            2.0 - 2.0 * rk / PI
        } else {
            2.0 * rk / PI - 4.0
        };
        accum += k.abs();
    }
    for k in &mut kernel {
        *k /= accum;
    }
    kernel
}

/// Detect marker events on an analog trace.
///
/// `values`/`times` are the de-biased analog samples and their sub-tick
/// times; `tics_per_sample` is the nominal spacing used for gap detection.
fn detect_markers(
    values: &[i32],
    times: &[i64],
    params: &MarkerParams,
    tics_per_sample: i64,
) -> Vec<(i32, i64)> {
    let isamp = params.sample as usize;
    let ism = params.smooth as usize;
    let kernel = smoothing_kernel(ism);
    let num = values.len();
    let mut markers = Vec::new();

    let mut curr = 0usize;
    let mut imax: isize = -1;
    let mut imin: isize = -1;
    let mut iflg = false;

    while num - curr >= isamp {
        if imax < curr as isize {
            let mut best = curr;
            for k in curr + 1..curr + isamp {
                if values[best] < values[k] {
                    best = k;
                }
            }
            imax = best as isize;
        }
        if imin < curr as isize {
            let mut best = curr;
            for k in curr + 1..curr + isamp {
                if values[best] > values[k] {
                    best = k;
                }
            }
            imin = best as isize;
        }

        let last = curr + isamp - 1;
        if last > 0 && times[last] - times[last - 1] > tics_per_sample * 2 {
            log::info!("gap detected in analog channel, restarting window");
            imax = -1;
            imin = -1;
            iflg = false;
            curr += 1;
            continue;
        }

        let spread = (values[imax as usize] - values[imin as usize]) as f64;
        let mut y = 0.0;
        if spread / 2.0 != 0.0 {
            for (i, k) in kernel.iter().enumerate() {
                if let Some(idx) = last.checked_sub(i) {
                    y += values[idx] as f64 / spread / 2.0 * k;
                }
            }
        }

        if y > params.plus && !iflg {
            iflg = true;
            let idx = (last as isize - ism as isize / 2 - 40).clamp(0, num as isize - 1);
            markers.push((MARKER_INSP, times[idx as usize]));
        }
        if y < params.minus && iflg {
            iflg = false;
            let idx = (last as isize - ism as isize / 2 + 10).clamp(0, num as isize - 1);
            markers.push((MARKER_EXP, times[idx as usize]));
        }
        curr += 1;
    }
    markers
}

fn civil_from_days(days: i64) -> (i64, u32, u32) {
    // Days-to-date conversion over the proleptic Gregorian calendar
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (y + i64::from(m <= 2), m, d)
}

fn today_tag() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let (y, m, d) = civil_from_days(secs.div_euclid(86400));
    format!("{:04}-{:02}-{:02}", y, m, d)
}

/// Run the marker pass over a produced event table.
///
/// Returns the merged file's path, or `None` when detection was skipped
/// (parameters unset, too few samples, or no pulses found).
pub fn insert_markers(
    table_path: &Path,
    out_dir: &Path,
    spawn: i32,
    analog_id: i32,
    step_ms: f64,
    params: &MarkerParams,
) -> Result<Option<PathBuf>> {
    if !params.enabled() {
        log::info!("marker detection not performed because parameter(s) are zero");
        return Ok(None);
    }

    let table = EventTableReader::open(table_path)?;
    let (values, times) = table.analog_channel(analog_id);

    if values.len() < params.sample as usize {
        log::warn!(
            "only {} analog samples for a {}-sample window, markers skipped",
            values.len(),
            params.sample
        );
        return Ok(None);
    }
    if values.len() < params.smooth as usize {
        log::warn!(
            "only {} analog samples for a {}-point kernel, markers skipped",
            values.len(),
            params.smooth
        );
        return Ok(None);
    }

    let ticks_in_sec = (1000.0 / step_ms).ceil() as i64;
    let tics_per_sample = ticks_in_sec / i64::from(params.freq);

    let mut merge = Vec::new();
    let mut pulse_count = 0usize;
    for pulse in [params.pulse1, params.pulse2].into_iter().flatten() {
        let (code, start_ms, stop_ms) = pulse;
        merge.push((code, (f64::from(start_ms) / step_ms) as i64));
        merge.push((code, (f64::from(stop_ms) / step_ms) as i64));
        pulse_count += 2;
    }

    merge.extend(detect_markers(&values, &times, params, tics_per_sample));
    if merge.len() <= pulse_count {
        log::info!("no pulses found in the analog channel, no marker file created");
        return Ok(None);
    }
    merge.sort_by_key(|&(_, time)| time);

    let ext = table_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let out_path = out_dir.join(format!("{}_001_simIE{}{}", today_tag(), spawn, ext));
    let mut out = BufWriter::new(File::create(&out_path)?);

    let (scode, stime) = table.sentinel;
    for _ in 0..2 {
        writeln!(out, "{:5}{:8}", scode, stime)?;
    }

    // merge the table's records and the sorted markers by time;
    // markers win ties
    let mut orig = table.records.iter().peekable();
    let mut mark = merge.iter().peekable();
    loop {
        match (orig.peek(), mark.peek()) {
            (None, None) => break,
            (Some(rec), None) => {
                writeln!(out, "{:5}{:8}", rec.code, rec.time)?;
                orig.next();
            }
            (None, Some(&&(code, time))) => {
                writeln!(out, "{:5}{:8}", code, time)?;
                mark.next();
            }
            (Some(rec), Some(&&(code, time))) => {
                if rec.time < time {
                    writeln!(out, "{:5}{:8}", rec.code, rec.time)?;
                    orig.next();
                } else {
                    writeln!(out, "{:5}{:8}", code, time)?;
                    mark.next();
                }
            }
        }
    }
    out.flush()?;
    Ok(Some(out_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_table::{EventFormat, EventTableWriter};
    use tempfile::tempdir;

    #[test]
    fn test_kernel_normalized() {
        let k = smoothing_kernel(51);
        let sum: f64 = k.iter().map(|v| v.abs()).sum();
        assert!((sum - 1.0).abs() < 1e-12);
        // triangular wave starts at zero and rises
        assert!(k[0].abs() < 1e-12);
        assert!(k[1] > 0.0);
    }

    #[test]
    fn test_civil_from_days() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(19724), (2024, 1, 2));
    }

    fn square_wave_table(path: &Path, params: &MarkerParams) {
        // analog channel 1 carrying a slow square wave
        let mut w = EventTableWriter::create(path, EventFormat::Bdt).unwrap();
        let period = params.sample as i64 * 4;
        for n in 0..period * 4 {
            let high = (n / (period / 2)) % 2 == 1;
            let val = if high { 500 } else { -500 };
            let code = 4096 + (val + 2048);
            w.write(code as i32, n * 10).unwrap();
        }
        w.flush().unwrap();
    }

    #[test]
    fn test_marker_insertion_on_square_wave() {
        let dir = tempdir().unwrap();
        let table = dir.path().join("run.bdt");
        let params = MarkerParams {
            sample: 100,
            smooth: 21,
            plus: 0.01,
            minus: -0.01,
            freq: 200,
            pulse1: None,
            pulse2: None,
        };
        square_wave_table(&table, &params);

        let out = insert_markers(&table, dir.path(), 0, 1, 0.5, &params)
            .unwrap()
            .expect("markers should be produced");
        let merged = EventTableReader::open(&out).unwrap();
        let codes: Vec<i32> = merged
            .records
            .iter()
            .map(|r| r.code)
            .filter(|&c| c == MARKER_INSP || c == MARKER_EXP)
            .collect();
        assert!(codes.contains(&MARKER_INSP));
        assert!(codes.contains(&MARKER_EXP));
        // times stay sorted after the merge
        let times: Vec<i64> = merged.records.iter().map(|r| r.time).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_disabled_params_skip() {
        let dir = tempdir().unwrap();
        let table = dir.path().join("run.bdt");
        let mut w = EventTableWriter::create(&table, EventFormat::Bdt).unwrap();
        w.write(101, 1).unwrap();
        w.flush().unwrap();
        drop(w);

        let params = MarkerParams::default();
        let out = insert_markers(&table, dir.path(), 0, 1, 0.5, &params).unwrap();
        assert!(out.is_none());
    }
}
