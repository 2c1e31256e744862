//! Per-tick plot channel evaluation
//!
//! Each subscribed channel resolves to a (value, spike-flag) pair every
//! tick: cell state variables, binned population rates over a rolling
//! window, fiber event flags, afferent signals, or lung state fields. Lung
//! channels smuggle an offset and a scale through the pop/cell fields,
//! divided down by 10⁴; pooled rates encode a bin width and a divisor in
//! the cell field. The style hint (`typ`) is recomputed each tick so the
//! viewer can pick burster scaling or afferent offsets.

use crate::lung::LungState;
use crate::network::Network;
use respire_model::codes;
use respire_model::{CellKind, PlotSpec};

/// Runtime state of one plot channel
#[derive(Debug)]
pub struct PlotChannel {
    /// The request from the run script
    pub spec: PlotSpec,
    /// Style hint recomputed per tick
    pub typ: i32,
    /// Value of the current tick
    pub val: f64,
    /// Spike flag of the current tick
    pub spike: i32,
    /// Rolling per-tick spike counts for binned rates
    counts: Vec<i32>,
    /// Sum over the rolling window
    sum: i32,
}

impl PlotChannel {
    /// Wrap a script request
    pub fn new(spec: PlotSpec) -> Self {
        Self {
            spec,
            typ: 0,
            val: 0.0,
            spike: 0,
            counts: Vec::new(),
            sum: 0,
        }
    }

    fn rate_window(&mut self, bins: usize) -> usize {
        if self.counts.len() != bins {
            self.counts = vec![0; bins];
            self.sum = 0;
        }
        bins
    }

    /// Fold this tick's population spike count into the rolling window and
    /// return the windowed rate in spikes/s per instance, divided by `mult`.
    fn binned_rate(
        &mut self,
        bins: usize,
        spike_count: i32,
        instances: usize,
        step_ms: f64,
        mult: f64,
        stepnum: i64,
    ) -> f64 {
        let bins = self.rate_window(bins);
        let idx = (stepnum % bins as i64) as usize;
        self.sum += spike_count - self.counts[idx];
        self.counts[idx] = spike_count;
        let denom = if instances == 0 { 1 } else { instances };
        f64::from(self.sum) / (bins as f64 * step_ms / 1000.0) / denom as f64 / mult
    }

    /// Evaluate this channel for the current tick
    pub fn evaluate(&mut self, net: &Network, lung: &LungState, stepnum: i64, step_ms: f64) {
        let var = self.spec.var;
        let p = self.spec.pop as i64 - 1;
        let c = self.spec.cell as i64 - 1;

        if var > 0 && (p < 0 || p as usize >= net.cellpops.len()) {
            return;
        }
        self.spike = 0;
        self.typ = i32::from(
            var >= 0
                && (p as usize) < net.cellpops.len()
                && net.cellpops[p as usize].kind == CellKind::Burster,
        );

        // lung fields carry a (pop, cell)-encoded offset and scale
        let lung_scaled = |value: f64| {
            (value - (p + 1) as f64 / 10000.0) / ((c + 1) as f64 / 10000.0)
        };

        match var {
            1 => {
                let pop = &net.cellpops[p as usize];
                if (c as usize) < pop.cells.len() {
                    let cell = &pop.cells[c as usize];
                    self.val = cell.vm_prev;
                    if pop.kind == CellKind::Burster {
                        self.val += 50.0;
                    }
                    self.spike = i32::from(cell.spike);
                } else {
                    self.val = 0.0;
                    self.spike = 0;
                }
            }
            2 => {
                let pop = &net.cellpops[p as usize];
                if (c as usize) < pop.cells.len() {
                    let gk = pop.cells[c as usize].gk;
                    self.val = if pop.kind == CellKind::Burster {
                        gk * 60.0
                    } else {
                        -20.0 + gk * 10.0
                    };
                }
            }
            3 => {
                let pop = &net.cellpops[p as usize];
                if (c as usize) < pop.cells.len() {
                    self.val = pop.cells[c as usize].thr;
                    if pop.kind == CellKind::Burster {
                        self.val += 50.0;
                    }
                } else {
                    self.val = 0.0;
                    self.spike = 0;
                }
            }
            -1 => self.val = lung_scaled(lung.volume),
            -2 => self.val = lung_scaled(lung.flow),
            -3 => self.val = lung_scaled(lung.pressure),
            -4 => self.val = lung_scaled(lung.phr_d),
            -5 => self.val = lung_scaled(lung.u),
            -6 => self.val = lung_scaled(lung.lma),
            -7 => self.val = lung_scaled(lung.vdi),
            -8 => self.val = lung_scaled(lung.vab),
            -9 => self.val = lung_scaled(lung.vdi_t),
            -10 => self.val = lung_scaled(lung.vab_t),
            -11 => self.val = lung_scaled(lung.pdi),
            -12 => self.val = lung_scaled(lung.pab),
            -13 => self.val = lung_scaled(lung.pl),
            -14 => self.val = lung_scaled(lung.phr_d.clamp(0.0, 1.0)),
            -15 => self.val = lung_scaled(lung.u.clamp(0.0, 1.0)),
            -16 => self.val = lung_scaled(lung.lma.clamp(-1.0, 1.0)),
            codes::VAR_STD_FIBER | codes::VAR_AFFERENT_EVENT => {
                self.val = 0.0;
                self.spike = self.fiber_state(net, p, c);
            }
            codes::VAR_AFFERENT_SIGNAL => {
                self.afferent_signal(net, p, c);
                self.spike = 0;
            }
            codes::VAR_AFFERENT_BOTH => {
                self.afferent_signal(net, p, c);
                self.spike = self.fiber_state(net, p, c);
            }
            codes::VAR_AFFERENT_INST | codes::VAR_AFFERENT_BIN => {
                // cell field encodes a divisor in the low 16 bits and a bin
                // width in ms in the high bits
                let mult = f64::from((self.spec.cell & 0xffff) + 1);
                let binwidth_ms = f64::from(self.spec.cell >> 16);
                let bins = if var == codes::VAR_AFFERENT_INST {
                    1
                } else {
                    (binwidth_ms / step_ms + 0.5).floor().max(1.0) as usize
                };
                if p >= 0 && (p as usize) < net.fiberpops.len() {
                    let fp = &net.fiberpops[p as usize];
                    let spikes = fp.fibers.iter().filter(|f| f.fired).count() as i32;
                    self.val =
                        self.binned_rate(bins, spikes, fp.fibers.len(), step_ms, mult, stepnum);
                }
            }
            var if var >= 4 => {
                // var − 4 is the bin width in ms; 4 itself is one tick
                let mult = (c + 1) as f64;
                let bins = if var == 4 {
                    1
                } else {
                    (f64::from(var - 4) / step_ms + 0.5).floor().max(1.0) as usize
                };
                let pop = &net.cellpops[p as usize];
                let spikes = pop.cells.iter().filter(|cell| cell.spike).count() as i32;
                self.val = self.binned_rate(bins, spikes, pop.cells.len(), step_ms, mult, stepnum);
            }
            _ => {
                log::warn!("plot channel with unknown variable code {}", var);
            }
        }
    }

    fn fiber_state(&self, net: &Network, p: i64, c: i64) -> i32 {
        if p >= 0
            && (p as usize) < net.fiberpops.len()
            && c >= 0
            && (c as usize) < net.fiberpops[p as usize].fibers.len()
        {
            i32::from(net.fiberpops[p as usize].fibers[c as usize].fired)
        } else {
            0
        }
    }

    fn afferent_signal(&mut self, net: &Network, p: i64, c: i64) {
        if p >= 0
            && (p as usize) < net.fiberpops.len()
            && c >= 0
            && (c as usize) < net.fiberpops[p as usize].fibers.len()
        {
            let fp = &net.fiberpops[p as usize];
            self.val = fp.fibers[c as usize].signal + fp.map.offset;
            self.typ = fp.map.offset as i32;
        } else {
            self.val = 0.0;
            self.typ = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::NetworkBuilder;
    use respire_model::NetworkDescription;

    fn small_net() -> Network {
        let desc = NetworkDescription::parse(
            r#"
respire description 1
global { step = 0.5  step_count = 100 }
syntype 1 { name = "s"  kind = "normal"  time_constant = 1.5 }
cellpop 1 { name = "cells"  count = 4  thresh = 10 }
fiberpop 1 {
    name = "fibers"  kind = "stochastic"  count = 2  probability = 1
    start = 0  stop = 50  seed = 3
}
"#,
        )
        .unwrap();
        NetworkBuilder::new(&desc).build().unwrap()
    }

    fn spec(pop: i32, cell: i32, var: i32) -> PlotSpec {
        PlotSpec {
            pop,
            cell,
            var,
            label: "t".into(),
        }
    }

    #[test]
    fn test_vm_channel() {
        let mut net = small_net();
        net.cellpops[0].cells[1].vm_prev = -42.5;
        net.cellpops[0].cells[1].spike = true;
        let mut ch = PlotChannel::new(spec(1, 2, 1));
        ch.evaluate(&net, &LungState::default(), 0, 0.5);
        assert_eq!(ch.val, -42.5);
        assert_eq!(ch.spike, 1);
    }

    #[test]
    fn test_out_of_range_cell_yields_zero() {
        let net = small_net();
        let mut ch = PlotChannel::new(spec(1, 99, 1));
        ch.evaluate(&net, &LungState::default(), 0, 0.5);
        assert_eq!(ch.val, 0.0);
        assert_eq!(ch.spike, 0);
    }

    #[test]
    fn test_lung_channel_scaling() {
        let net = small_net();
        let lung = LungState {
            volume: 25.0,
            ..Default::default()
        };
        // pop and cell fields encode offset 2/10⁴ and scale 5/10⁴
        let mut ch = PlotChannel::new(spec(2, 5, -1));
        ch.evaluate(&net, &lung, 0, 0.5);
        let expected = (25.0 - 2.0 / 10000.0) / (5.0 / 10000.0);
        assert!((ch.val - expected).abs() < 1e-9);
    }

    #[test]
    fn test_fiber_event_channel() {
        let mut net = small_net();
        net.fiberpops[0].fibers[0].fired = true;
        let mut ch = PlotChannel::new(spec(1, 1, codes::VAR_STD_FIBER));
        ch.evaluate(&net, &LungState::default(), 0, 0.5);
        assert_eq!(ch.spike, 1);
        assert_eq!(ch.val, 0.0);
    }

    #[test]
    fn test_afferent_signal_offset() {
        let mut net = small_net();
        net.fiberpops[0].fibers[1].signal = 0.25;
        net.fiberpops[0].map.offset = 2.0;
        let mut ch = PlotChannel::new(spec(1, 2, codes::VAR_AFFERENT_SIGNAL));
        ch.evaluate(&net, &LungState::default(), 0, 0.5);
        assert!((ch.val - 2.25).abs() < 1e-12);
        assert_eq!(ch.typ, 2);
    }

    #[test]
    fn test_instantaneous_rate() {
        let mut net = small_net();
        for cell in &mut net.cellpops[0].cells {
            cell.spike = true;
        }
        // var 4 = one-tick window; 4 cells all firing at 0.5 ms steps is
        // 2000 spikes/s/cell
        let mut ch = PlotChannel::new(spec(1, 1, 4));
        ch.evaluate(&net, &LungState::default(), 0, 0.5);
        assert!((ch.val - 2000.0).abs() < 1e-9);
    }

    #[test]
    fn test_binned_rate_rolls() {
        let mut net = small_net();
        // var 8 → 4 ms bin → 8 ticks at 0.5 ms
        let mut ch = PlotChannel::new(spec(1, 1, 8));
        for step in 0..8 {
            for cell in &mut net.cellpops[0].cells {
                cell.spike = step % 2 == 0;
            }
            ch.evaluate(&net, &LungState::default(), step, 0.5);
        }
        // half the ticks firing: 1000 spikes/s/cell
        assert!((ch.val - 1000.0).abs() < 1e-9, "val {}", ch.val);
    }
}
