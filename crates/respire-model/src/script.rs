//! Run-script parser
//!
//! The run script is a line-oriented text input that names the description
//! file and selects outputs:
//!
//! ```text
//! net.rnd                      <- description filename
//! 0                            <- update interval (0 = never)
//! E                            <- enable plot output (blank line skips)
//! 0                            <- spawn number
//! 1,1,1,Vm cell 1              <- plot channels, blank line terminates
//!
//! Y                            <- save spike table (bdt/edt)
//! N                            <- save spike archive
//! N                            <- save waveform archive
//! Y                            <- analog pool output
//! 1                            <- analog id
//! 1                            <- analog population
//! 200                          <- analog rate (per second)
//! 100                          <- analog time constant (ms)
//! 0.5                          <- analog scale factor
//! out.bdt                      <- spike-table filename
//! C 1,1                        <- spike channels, blank line terminates
//! ```

use crate::codes::VAR_LAST;
use crate::error::{ModelError, Result};

/// One plot channel request
#[derive(Debug, Clone, PartialEq)]
pub struct PlotSpec {
    /// 1-based population index (interpretation depends on the variable code)
    pub pop: i32,
    /// 1-based cell/fiber index, or an encoded scale for pooled variables
    pub cell: i32,
    /// Variable code (see [`crate::codes`])
    pub var: i32,
    /// Display label
    pub label: String,
}

/// Which side of the network a spike channel records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpikeSource {
    /// A cell population instance
    Cell,
    /// A fiber population instance
    Fiber,
}

/// One spike-table channel request
#[derive(Debug, Clone, PartialEq)]
pub struct SpikeChannel {
    /// Cell or fiber side
    pub source: SpikeSource,
    /// 1-based population index
    pub pop: i32,
    /// 1-based instance index; cells accept the wildcard 999999999
    pub cell: i32,
}

/// Analog pool (population total) output parameters
#[derive(Debug, Clone, PartialEq)]
pub struct AnalogSpec {
    /// Analog channel id; event codes are id·4096 + value
    pub id: i32,
    /// 1-based cell population whose spikes are pooled
    pub pop: i32,
    /// Output interval in ms (1000 / requested rate, integer division)
    pub interval_ms: i32,
    /// Per-interval exponential decay exp(−interval/τ)
    pub decay: f64,
    /// Scale factor applied to the pooled count
    pub scale: f64,
}

/// Plot output section of the script
#[derive(Debug, Clone, PartialEq)]
pub struct PlotSection {
    /// Run tag distinguishing concurrent spawns
    pub spawn_number: i32,
    /// Requested channels in script order
    pub channels: Vec<PlotSpec>,
}

/// The parsed run script
#[derive(Debug, Clone, PartialEq)]
pub struct RunScript {
    /// Description filename (resolved relative to the script by the caller)
    pub description_file: String,
    /// Mid-run parameter update interval in steps; 0 = never
    pub update_interval: i64,
    /// Plot output, when enabled and at least one channel was given
    pub plot: Option<PlotSection>,
    /// Write the bdt/edt event table
    pub save_spike_times: bool,
    /// Write the binary spike archive
    pub save_spike_archive: bool,
    /// Write the binary waveform archive
    pub save_wave_archive: bool,
    /// Analog pool output, when enabled
    pub analog: Option<AnalogSpec>,
    /// Event output filename; present when any save switch is on
    pub output_name: Option<String>,
    /// Spike channels in script order
    pub spike_channels: Vec<SpikeChannel>,
}

struct Lines<'a> {
    iter: std::iter::Enumerate<std::str::Lines<'a>>,
}

impl<'a> Lines<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            iter: src.lines().enumerate(),
        }
    }

    /// Next line, trimmed of trailing CR; None at end of input
    fn next(&mut self) -> Option<(usize, &'a str)> {
        self.iter
            .next()
            .map(|(n, line)| (n + 1, line.trim_end_matches(['\r', '\n'])))
    }

    fn require(&mut self, expected: &str) -> Result<(usize, &'a str)> {
        self.next().ok_or_else(|| ModelError::ScriptTruncated {
            expected: expected.into(),
        })
    }
}

fn is_blank(line: &str) -> bool {
    !line.chars().any(|c| c.is_ascii_graphic())
}

fn parse_yes_no(line: &str, lineno: usize, what: &str) -> Result<bool> {
    match line.trim().chars().next() {
        Some('y') | Some('Y') => Ok(true),
        Some('n') | Some('N') => Ok(false),
        _ => Err(ModelError::ScriptLine {
            line: lineno,
            reason: format!("expected Y or N for {}", what),
        }),
    }
}

fn parse_int(line: &str, lineno: usize, what: &str) -> Result<i64> {
    line.trim()
        .parse::<i64>()
        .map_err(|_| ModelError::ScriptLine {
            line: lineno,
            reason: format!("expected integer for {}", what),
        })
}

fn parse_float(line: &str, lineno: usize, what: &str) -> Result<f64> {
    line.trim()
        .parse::<f64>()
        .map_err(|_| ModelError::ScriptLine {
            line: lineno,
            reason: format!("expected number for {}", what),
        })
}

/// Parse a plot channel line: `pop,cell[,var],label`.
///
/// Up to three leading comma-separated integers are scanned; the remainder
/// after the following comma is the label. A two-field line defaults the
/// variable code to 1 (V_m).
fn parse_plot_line(line: &str) -> Option<PlotSpec> {
    let mut rest = line;
    let mut nums = Vec::new();
    while nums.len() < 3 {
        let trimmed = rest.trim_start();
        let digits: usize = trimmed
            .char_indices()
            .take_while(|&(n, c)| c.is_ascii_digit() || (n == 0 && (c == '-' || c == '+')))
            .count();
        if digits == 0 {
            break;
        }
        let (num, tail) = trimmed.split_at(
            trimmed
                .char_indices()
                .nth(digits)
                .map(|(n, _)| n)
                .unwrap_or(trimmed.len()),
        );
        nums.push(num.parse::<i64>().ok()?);
        rest = tail;
        let tail = rest.trim_start();
        match tail.strip_prefix(',') {
            Some(after) => rest = after,
            None => break,
        }
    }
    if nums.len() < 2 {
        return None;
    }
    let var = if nums.len() >= 3 { nums[2] as i32 } else { 1 };
    Some(PlotSpec {
        pop: nums[0] as i32,
        cell: nums[1] as i32,
        var,
        label: rest.trim().to_string(),
    })
}

fn parse_spike_line(line: &str) -> Option<SpikeChannel> {
    let mut it = line.trim_start().chars();
    let tag = it.next()?;
    let source = match tag {
        'C' | 'c' => SpikeSource::Cell,
        'F' | 'f' => SpikeSource::Fiber,
        _ => return None,
    };
    let rest: String = it.collect();
    let mut parts = rest.splitn(2, ',');
    let pop = parts.next()?.trim().parse::<i32>().ok()?;
    let cell = parts.next()?.trim().parse::<i32>().ok()?;
    Some(SpikeChannel { source, pop, cell })
}

impl RunScript {
    /// Parse a run script from text
    pub fn parse(src: &str) -> Result<Self> {
        let mut lines = Lines::new(src);

        let (_, first) = lines.require("description filename")?;
        let description_file = first.trim().to_string();
        if description_file.is_empty() {
            return Err(ModelError::ScriptLine {
                line: 1,
                reason: "empty description filename".into(),
            });
        }

        let (n, line) = lines.require("update interval")?;
        let update_interval = parse_int(line, n, "update interval")?;
        if update_interval < 0 {
            return Err(ModelError::ScriptLine {
                line: n,
                reason: "negative update interval".into(),
            });
        }

        // plot enable: lines until a blank (no plot) or a line starting with E
        let mut plot = None;
        loop {
            let (_, line) = lines.require("plot enable line")?;
            if is_blank(line) {
                break;
            }
            if line.trim().starts_with(['e', 'E']) {
                let (n, line) = lines.require("spawn number")?;
                let spawn_number = parse_int(line, n, "spawn number")? as i32;
                let mut channels = Vec::new();
                loop {
                    let (n, line) = lines.require("plot channel or blank terminator")?;
                    if is_blank(line) {
                        break;
                    }
                    match parse_plot_line(line) {
                        Some(spec) if spec.var != 0 && spec.var >= VAR_LAST => {
                            channels.push(spec)
                        }
                        _ => {
                            log::warn!("script line {}: bad plot channel {:?}, skipping", n, line)
                        }
                    }
                }
                if !channels.is_empty() {
                    plot = Some(PlotSection {
                        spawn_number,
                        channels,
                    });
                }
                break;
            }
        }

        let (n, line) = lines.require("save spike table Y/N")?;
        let save_spike_times = parse_yes_no(line, n, "spike table")?;
        let (n, line) = lines.require("save spike archive Y/N")?;
        let save_spike_archive = parse_yes_no(line, n, "spike archive")?;
        let (n, line) = lines.require("save waveform archive Y/N")?;
        let save_wave_archive = parse_yes_no(line, n, "waveform archive")?;

        let mut analog = None;
        let mut output_name = None;
        let mut spike_channels = Vec::new();

        if save_spike_times || save_spike_archive || save_wave_archive {
            let (n, line) = lines.require("analog pool Y/N")?;
            if parse_yes_no(line, n, "analog pool")? {
                let (n, line) = lines.require("analog id")?;
                let id = parse_int(line, n, "analog id")? as i32;
                let (n, line) = lines.require("analog population")?;
                let pop = parse_int(line, n, "analog population")? as i32;
                let (n, line) = lines.require("analog rate")?;
                let rate = parse_int(line, n, "analog rate")?;
                if rate <= 0 {
                    return Err(ModelError::ScriptLine {
                        line: n,
                        reason: "analog rate must be positive".into(),
                    });
                }
                let interval_ms = (1000 / rate) as i32;
                let (n, line) = lines.require("analog time constant")?;
                let tc = parse_float(line, n, "analog time constant")?;
                let (n, line) = lines.require("analog scale factor")?;
                let scale = parse_float(line, n, "analog scale factor")?;
                analog = Some(AnalogSpec {
                    id,
                    pop,
                    interval_ms,
                    decay: (-f64::from(interval_ms) / tc).exp(),
                    scale,
                });
            }

            let (n, line) = lines.require("output filename")?;
            let name = line.trim().to_string();
            if name.is_empty() {
                return Err(ModelError::ScriptLine {
                    line: n,
                    reason: "empty output filename".into(),
                });
            }
            output_name = Some(name);

            loop {
                let line = match lines.next() {
                    None => break,
                    Some((_, line)) => line,
                };
                if is_blank(line) {
                    break;
                }
                match parse_spike_line(line) {
                    Some(ch) if ch.pop == 0 && ch.cell == 0 => break,
                    Some(ch) => spike_channels.push(ch),
                    None => log::warn!("bad spike channel line {:?}, skipping", line),
                }
            }
        }

        Ok(Self {
            description_file,
            update_interval,
            plot,
            save_spike_times,
            save_spike_archive,
            save_wave_archive,
            analog,
            output_name,
            spike_channels,
        })
    }

    /// True when the output filename selects the 0.1 ms (edt) event format
    pub fn is_edt(&self) -> bool {
        self.output_name
            .as_deref()
            .map(|name| name.to_ascii_lowercase().ends_with(".edt"))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = "net.rnd\n\
                        0\n\
                        E\n\
                        3\n\
                        1,1,1,Vm cell 1\n\
                        2,1,-1,lung volume\n\
                        \n\
                        Y\n\
                        N\n\
                        N\n\
                        Y\n\
                        1\n\
                        1\n\
                        200\n\
                        100\n\
                        0.5\n\
                        out.bdt\n\
                        C 1,1\n\
                        F 1,1\n\
                        \n";

    #[test]
    fn test_parse_full_script() {
        let s = RunScript::parse(FULL).unwrap();
        assert_eq!(s.description_file, "net.rnd");
        assert_eq!(s.update_interval, 0);
        let plot = s.plot.as_ref().unwrap();
        assert_eq!(plot.spawn_number, 3);
        assert_eq!(plot.channels.len(), 2);
        assert_eq!(plot.channels[0].var, 1);
        assert_eq!(plot.channels[0].label, "Vm cell 1");
        assert_eq!(plot.channels[1].var, -1);
        assert!(s.save_spike_times);
        assert!(!s.save_spike_archive);
        let analog = s.analog.as_ref().unwrap();
        assert_eq!(analog.interval_ms, 5);
        assert!((analog.decay - (-5.0_f64 / 100.0).exp()).abs() < 1e-12);
        assert_eq!(s.output_name.as_deref(), Some("out.bdt"));
        assert_eq!(s.spike_channels.len(), 2);
        assert_eq!(s.spike_channels[1].source, SpikeSource::Fiber);
        assert!(!s.is_edt());
    }

    #[test]
    fn test_no_plot_section() {
        let src = "net.rnd\n100\n\nN\nN\nN\n";
        let s = RunScript::parse(src).unwrap();
        assert!(s.plot.is_none());
        assert!(s.output_name.is_none());
        assert_eq!(s.update_interval, 100);
    }

    #[test]
    fn test_two_field_plot_defaults_vm() {
        let src = "net.rnd\n0\nE\n0\n1,2,cell two\n\nN\nN\nN\n";
        let s = RunScript::parse(src).unwrap();
        let plot = s.plot.unwrap();
        assert_eq!(plot.channels[0].var, 1);
        assert_eq!(plot.channels[0].cell, 2);
        assert_eq!(plot.channels[0].label, "cell two");
    }

    #[test]
    fn test_edt_selection() {
        let src = "net.rnd\n0\n\nY\nN\nN\nN\nrun.EDT\n\n";
        let s = RunScript::parse(src).unwrap();
        assert!(s.is_edt());
    }

    #[test]
    fn test_truncated_script() {
        assert!(RunScript::parse("net.rnd\n0\n").is_err());
    }

    #[test]
    fn test_wildcard_spike_channel() {
        let src = "net.rnd\n0\n\nY\nN\nN\nN\nout.bdt\nC 2,999999999\n\n";
        let s = RunScript::parse(src).unwrap();
        assert_eq!(s.spike_channels[0].cell, 999999999);
    }
}
