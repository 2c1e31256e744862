//! Network builder
//!
//! Turns a parsed description into the runtime graph in two passes over the
//! terminal wiring. The first pass counts which (target cell, synapse type)
//! pairs are actually touched and tracks the largest delay aimed at each, so
//! slots can be materialized with queues sized to the observed maximum
//! rather than the global one. The second pass attaches every terminal to
//! its slot. All wiring choices draw from a per-instance stream seeded
//! `(instance+1)·seed`, in a fixed draw order that must not change:
//! receiver cell, a discarded legacy delay draw, then the delay itself —
//! except that a link with exactly NCT−MCT terminals gets the delays
//! MCT, MCT+1, …, NCT−1 deterministically and skips the third draw.

use crate::afferent::{AfferentInput, ArchiveSource, SignalSource};
use crate::error::{EngineError, Result};
use crate::expr::Expr;
use crate::network::{
    Cell, CellPop, Fiber, FiberPop, LearnEntry, Network, SynSlot, SynTypeParams, Terminal,
    LEARN_SIZE,
};
use crate::rng::{self, GaussianStream, Lcg};
use respire_model::{
    FiberKind, NetworkDescription, SynKind, TargetDescription,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Builds a runtime [`Network`] from a description
pub struct NetworkBuilder<'a> {
    desc: &'a NetworkDescription,
    input_dir: Option<PathBuf>,
    source_overrides: HashMap<usize, Box<dyn SignalSource>>,
}

/// One wiring decision produced by the terminal stream
#[derive(Debug, Clone, Copy)]
struct Wiring {
    /// 0-based receiver population
    pop: usize,
    /// 0-based receiver cell
    cell: usize,
    /// Conduction delay in ticks
    delay: i32,
}

/// Draw one terminal's wiring. `tidx` is the terminal's index within its
/// target record, used by the deterministic delay branch.
fn draw_terminal(
    stream: &mut Lcg,
    tp: &TargetDescription,
    target_cells: usize,
    tidx: i32,
) -> Wiring {
    let cell = (stream.uniform() * target_cells as f64) as usize;
    // legacy extra draw: the result is discarded but the stream must
    // advance, or archived runs stop reproducing
    let _ = stream.uniform();
    let delay = if tp.terminals == tp.nct - tp.mct {
        tp.mct + tidx
    } else {
        tp.mct + (stream.uniform() * f64::from(tp.nct - tp.mct)) as i32
    };
    Wiring {
        pop: tp.pop - 1,
        cell,
        delay,
    }
}

/// Per-(pop, cell, type) bookkeeping of the counting pass
#[derive(Debug, Clone, Copy, Default)]
struct SlotTally {
    used: bool,
    max_delay: i32,
}

impl<'a> NetworkBuilder<'a> {
    /// Start a builder over a description
    pub fn new(desc: &'a NetworkDescription) -> Self {
        Self {
            desc,
            input_dir: None,
            source_overrides: HashMap::new(),
        }
    }

    /// Directory afferent signal files are resolved against
    pub fn with_input_dir(mut self, dir: &Path) -> Self {
        self.input_dir = Some(dir.to_path_buf());
        self
    }

    /// Replace the signal source of a 1-based afferent fiber population,
    /// for tests and externally driven runs
    pub fn with_signal_source(mut self, pop: usize, source: Box<dyn SignalSource>) -> Self {
        self.source_overrides.insert(pop, source);
        self
    }

    fn syntype_params(&self, step: f64) -> Vec<SynTypeParams> {
        self.desc
            .syntypes
            .iter()
            .map(|st| SynTypeParams {
                kind: st.kind,
                eq: st.eq,
                dcs: (-step / st.time_constant).exp(),
                parent: st.parent,
                learn_window: st.learn_window,
                learn_max: st.learn_max,
                learn_delta: st.learn_delta,
            })
            .collect()
    }

    /// For every source instance and target record, feed each terminal's
    /// wiring to `visit(source instance, record, terminal index, wiring)`.
    fn for_terminals<S>(
        sources: usize,
        targets: &[TargetDescription],
        cellpop_sizes: &[usize],
        mut visit: S,
    ) -> Result<()>
    where
        S: FnMut(usize, &TargetDescription, i32, Wiring),
    {
        for instance in 0..sources {
            for tp in targets {
                if tp.terminals == 0 {
                    continue;
                }
                let mut stream = Lcg::new((instance as i32 + 1).wrapping_mul(tp.seed));
                for tidx in 0..tp.terminals {
                    let target_cells = cellpop_sizes[tp.pop - 1];
                    let w = draw_terminal(&mut stream, tp, target_cells, tidx);
                    if w.cell >= target_cells {
                        return Err(EngineError::build(format!(
                            "terminal draw hit cell {} of population {} (size {})",
                            w.cell + 1,
                            tp.pop,
                            target_cells
                        )));
                    }
                    visit(instance, tp, tidx, w);
                }
            }
        }
        Ok(())
    }

    fn open_afferent(&mut self, pn: usize, step: f64) -> Result<Option<AfferentInput>> {
        let fp = &self.desc.fiberpops[pn];
        let sim_step_us = (step * 1000.0) as u64;
        if let Some(source) = self.source_overrides.remove(&(pn + 1)) {
            return Ok(Some(AfferentInput::new(source, sim_step_us)));
        }
        if fp.afferent.file.is_empty() {
            return Ok(None);
        }
        let path = match &self.input_dir {
            Some(dir) => dir.join(&fp.afferent.file),
            None => PathBuf::from(&fp.afferent.file),
        };
        match ArchiveSource::open(&path)? {
            None => Ok(None),
            Some(source) => Ok(Some(AfferentInput::new(Box::new(source), sim_step_us))),
        }
    }

    /// Build the runtime network
    pub fn build(mut self) -> Result<Network> {
        let desc = self.desc;
        let step = desc.global.step;
        let syntypes = self.syntype_params(step);
        let cellpop_sizes: Vec<usize> = desc.cellpops.iter().map(|cp| cp.count).collect();

        for (pn, cp) in desc.cellpops.iter().enumerate() {
            if !cp.injected_expression.is_empty() {
                // surface bad formulas before any simulation work
                let expr = Expr::parse(&cp.injected_expression)?;
                for var in expr.variables() {
                    if var != "V" {
                        return Err(EngineError::expression(
                            &cp.injected_expression,
                            format!(
                                "unknown identifier {:?} in injected current of population {}",
                                var,
                                pn + 1
                            ),
                        ));
                    }
                }
            }
        }

        // counting pass: which slots exist, and the largest delay per slot
        let mut tallies: Vec<Vec<Vec<SlotTally>>> = cellpop_sizes
            .iter()
            .map(|&count| vec![vec![SlotTally::default(); syntypes.len()]; count])
            .collect();
        let mut tally = |_inst: usize, tp: &TargetDescription, _tidx: i32, w: Wiring| {
            let t = &mut tallies[w.pop][w.cell][tp.syntype - 1];
            t.used = true;
            if w.delay > t.max_delay {
                t.max_delay = w.delay;
            }
        };
        for cp in &desc.cellpops {
            Self::for_terminals(cp.count, &cp.targets, &cellpop_sizes, &mut tally)?;
        }
        for fp in &desc.fiberpops {
            Self::for_terminals(fp.count, &fp.targets, &cellpop_sizes, &mut tally)?;
        }

        // materialize cells and their slots
        let presynaptic = desc.global.presynaptic;
        let mut slots: Vec<SynSlot> = Vec::new();
        let mut cellpops: Vec<CellPop> = Vec::new();
        let mut learn_cellpops = Vec::new();
        for (pn, cp) in desc.cellpops.iter().enumerate() {
            let has_learn = cp
                .targets
                .iter()
                .any(|tp| syntypes[tp.syntype - 1].kind == SynKind::Learn);
            if has_learn {
                learn_cellpops.push(pn);
            }

            let mut gauss = GaussianStream::new(rng::gaussian_seed(pn));
            let target_count: usize = cp.targets.iter().map(|tp| tp.terminals as usize).sum();
            let mut cells = Vec::with_capacity(cp.count);
            for cn in 0..cp.count {
                let slot_start = slots.len() as u32;
                for (stn, st) in syntypes.iter().enumerate() {
                    let t = tallies[pn][cn][stn];
                    if !t.used {
                        continue;
                    }
                    let q_len = (t.max_delay + 1) as usize;
                    let fill = if presynaptic && matches!(st.kind, SynKind::Pre | SynKind::Post)
                    {
                        1.0
                    } else {
                        0.0
                    };
                    slots.push(SynSlot {
                        g: 0.0,
                        eq: st.eq,
                        dcs: st.dcs,
                        q: vec![fill; q_len],
                        pop: pn,
                        cell: cn,
                        syntype: stn + 1,
                        kind: st.kind,
                        parent: st.parent,
                        initial_strength: 0.0,
                        learned_strength: 0.0,
                        learn_window: st.learn_window,
                        learn_max: st.learn_max,
                        learn_delta: st.learn_delta,
                        history: if st.kind == SynKind::Learn {
                            vec![LearnEntry::free(); LEARN_SIZE]
                        } else {
                            Vec::new()
                        },
                    });
                }
                let slot_count = slots.len() as u32 - slot_start;
                cells.push(Cell {
                    vm_prev: 0.0,
                    vm: desc.global.v_m0,
                    gk: 0.0,
                    thr: cp.thresh + gauss.next() * cp.thresh_sd,
                    gnoise_e: 0.0,
                    gnoise_i: 0.0,
                    spike: false,
                    slot_start,
                    slot_count,
                    targets: Vec::with_capacity(target_count),
                });
            }

            let ic_expression = if cp.injected_expression.is_empty() {
                None
            } else {
                Some(Expr::parse(&cp.injected_expression)?)
            };
            cellpops.push(CellPop {
                name: cp.name.clone(),
                kind: cp.kind,
                cells,
                targets: cp.targets.clone(),
                r0: -0.5 * step / cp.t_mem,
                dcg: (-step / cp.t_gk).exp(),
                dcth: (-step / cp.t_th).exp(),
                b: cp.b,
                mgc: cp.mgc,
                th0: cp.thresh,
                th0_sd: cp.thresh_sd,
                ge0: cp.dc_injected + desc.global.g_m0 * desc.global.v_m0,
                noise_amp: cp.noise_amp,
                noise_seed: Lcg::new(rng::noise_seed(pn)),
                ic_expression,
                theta_m: cp.theta_m,
                sigma_m: cp.sigma_m,
                theta_h: cp.theta_h,
                sigma_h: cp.sigma_h,
                taubar_h: cp.taubar_h,
                g_nap: cp.g_nap,
                v_reset: cp.v_reset,
                v_thresh: cp.v_thresh,
                delta_h: cp.delta_h,
                has_learn,
            });
        }

        // fibers: window ms → ticks, stimulus arming, afferent sources
        let mut fiberpops: Vec<FiberPop> = Vec::new();
        let mut learn_fiberpops = Vec::new();
        for (pn, fp) in desc.fiberpops.iter().enumerate() {
            let has_learn = fp
                .targets
                .iter()
                .any(|tp| syntypes[tp.syntype - 1].kind == SynKind::Learn);
            if has_learn {
                learn_fiberpops.push(pn);
            }

            let start_tick = (fp.start_ms / step).ceil() as i64;
            let stop_tick = (fp.stop_ms / step).ceil() as i64;
            let input = if fp.kind == FiberKind::Afferent {
                self.open_afferent(pn, step)?
            } else {
                None
            };

            let target_count: usize = fp.targets.iter().map(|tp| tp.terminals as usize).sum();
            let fibers = (0..fp.count)
                .map(|_| Fiber {
                    fired: false,
                    signal: 0.0,
                    targets: Vec::with_capacity(target_count),
                })
                .collect();

            fiberpops.push(FiberPop {
                name: fp.name.clone(),
                kind: fp.kind,
                fibers,
                targets: fp.targets.clone(),
                start_tick,
                stop_tick,
                probability: fp.probability,
                seed: Lcg::new(fp.seed),
                stim_mode: fp.stim_mode,
                frequency: fp.frequency,
                fuzzy_range: fp.fuzzy_range,
                next_stim: start_tick,
                next_fixed: start_tick,
                map: fp.afferent.clone(),
                input,
                prev_signal: 0.0,
                has_learn,
            });
        }

        let mut net = Network {
            global: desc.global.clone(),
            syntypes,
            cellpops,
            fiberpops,
            slots,
            learn_cellpops,
            learn_fiberpops,
        };

        // attach pass: re-draw the identical wiring and point terminals at
        // their slots
        let slot_index: HashMap<(usize, usize, usize), u32> = net
            .slots
            .iter()
            .enumerate()
            .map(|(n, s)| ((s.pop, s.cell, s.syntype), n as u32))
            .collect();

        let attach = |slots: &mut Vec<SynSlot>,
                      targets: &mut Vec<Terminal>,
                      tp: &TargetDescription,
                      w: Wiring|
         -> Result<()> {
            let key = (w.pop, w.cell, tp.syntype);
            let slot = *slot_index.get(&key).ok_or_else(|| {
                EngineError::build(format!(
                    "no slot for population {} cell {} type {}",
                    w.pop + 1,
                    w.cell + 1,
                    tp.syntype
                ))
            })?;
            let s = &mut slots[slot as usize];
            s.initial_strength = tp.strength;
            s.learned_strength = tp.strength;
            targets.push(Terminal {
                delay: w.delay,
                strength: tp.strength,
                disabled: false,
                slot,
            });
            Ok(())
        };

        for pn in 0..net.cellpops.len() {
            let desc_targets = desc.cellpops[pn].targets.clone();
            let count = net.cellpops[pn].cells.len();
            let mut failure = None;
            Self::for_terminals(count, &desc_targets, &cellpop_sizes, |inst, tp, _tidx, w| {
                let (pops, slots) = (&mut net.cellpops, &mut net.slots);
                if let Err(e) = attach(slots, &mut pops[pn].cells[inst].targets, tp, w) {
                    failure.get_or_insert(e);
                }
            })?;
            if let Some(e) = failure {
                return Err(e);
            }
        }
        for pn in 0..net.fiberpops.len() {
            let desc_targets = desc.fiberpops[pn].targets.clone();
            let count = net.fiberpops[pn].fibers.len();
            let mut failure = None;
            Self::for_terminals(count, &desc_targets, &cellpop_sizes, |inst, tp, _tidx, w| {
                let (pops, slots) = (&mut net.fiberpops, &mut net.slots);
                if let Err(e) = attach(slots, &mut pops[pn].fibers[inst].targets, tp, w) {
                    failure.get_or_insert(e);
                }
            })?;
            if let Some(e) = failure {
                return Err(e);
            }
        }

        net.check_queues()?;
        log::info!(
            "network built: {} cell pops, {} fiber pops, {} slots",
            net.cellpops.len(),
            net.fiberpops.len(),
            net.slots.len()
        );
        Ok(net)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_description() -> NetworkDescription {
        NetworkDescription::parse(
            r#"
respire description 1
global { step = 0.5  step_count = 100 }
syntype 1 { name = "excit"  kind = "normal"  eq = 115  time_constant = 1.5 }
cellpop 1 {
    name = "one"  count = 1  thresh = 10  t_mem = 9  t_gk = 7  t_th = 20
}
fiberpop 1 {
    name = "drive"  kind = "stochastic"  count = 1  probability = 1.0
    start = 0  stop = 50  seed = 11
    target 1 { mct = 3  nct = 7  nt = 4  syntype = 1  strength = 0.1  seed = 55 }
}
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_deterministic_delay_enumeration() {
        // NT == NCT − MCT: delays are MCT, MCT+1, …, NCT−1 in order
        let desc = base_description();
        let net = NetworkBuilder::new(&desc).build().unwrap();
        let delays: Vec<i32> = net.fiberpops[0].fibers[0]
            .targets
            .iter()
            .map(|t| t.delay)
            .collect();
        assert_eq!(delays, vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_random_delays_within_range() {
        let src = r#"
respire description 1
global { step = 0.5  step_count = 100 }
syntype 1 { name = "excit"  kind = "normal"  eq = 115  time_constant = 1.5 }
cellpop 1 { name = "one"  count = 5  thresh = 10 }
fiberpop 1 {
    name = "drive"  kind = "stochastic"  count = 3  probability = 0.5
    start = 0  stop = 50  seed = 11
    target 1 { mct = 2  nct = 9  nt = 20  syntype = 1  strength = 0.1  seed = 55 }
}
"#;
        let desc = NetworkDescription::parse(src).unwrap();
        let net = NetworkBuilder::new(&desc).build().unwrap();
        for fiber in &net.fiberpops[0].fibers {
            assert_eq!(fiber.targets.len(), 20);
            for t in &fiber.targets {
                assert!((2..=9).contains(&t.delay), "delay {}", t.delay);
            }
        }
    }

    #[test]
    fn test_queue_sized_to_observed_max_delay() {
        let desc = base_description();
        let net = NetworkBuilder::new(&desc).build().unwrap();
        // the four terminals have delays 3..6, so the one slot's queue
        // holds exactly max+1 entries
        assert_eq!(net.slots.len(), 1);
        assert_eq!(net.slots[0].q.len(), 7);
        assert!(net.slots[0].q.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_wiring_is_reproducible() {
        let desc = base_description();
        let a = NetworkBuilder::new(&desc).build().unwrap();
        let b = NetworkBuilder::new(&desc).build().unwrap();
        let ta: Vec<(i32, u32)> = a.fiberpops[0].fibers[0]
            .targets
            .iter()
            .map(|t| (t.delay, t.slot))
            .collect();
        let tb: Vec<(i32, u32)> = b.fiberpops[0].fibers[0]
            .targets
            .iter()
            .map(|t| (t.delay, t.slot))
            .collect();
        assert_eq!(ta, tb);
    }

    #[test]
    fn test_threshold_gaussian_spread() {
        let src = r#"
respire description 1
global { step = 0.5  step_count = 10 }
syntype 1 { name = "s"  kind = "normal"  time_constant = 1 }
cellpop 1 { name = "spread"  count = 200  thresh = 10  thresh_sd = 2 }
"#;
        let desc = NetworkDescription::parse(src).unwrap();
        let net = NetworkBuilder::new(&desc).build().unwrap();
        let thrs: Vec<f64> = net.cellpops[0].cells.iter().map(|c| c.thr).collect();
        let mean: f64 = thrs.iter().sum::<f64>() / thrs.len() as f64;
        assert!((mean - 10.0).abs() < 0.5, "mean {}", mean);
        assert!(thrs.iter().any(|&t| t > 11.0));
        assert!(thrs.iter().any(|&t| t < 9.0));
        // zero spread pins every threshold
        let src2 = src.replace("thresh_sd = 2", "thresh_sd = 0");
        let desc2 = NetworkDescription::parse(&src2).unwrap();
        let net2 = NetworkBuilder::new(&desc2).build().unwrap();
        assert!(net2.cellpops[0].cells.iter().all(|c| c.thr == 10.0));
    }

    #[test]
    fn test_estim_arming_and_window_ticks() {
        let src = r#"
respire description 1
global { step = 0.5  step_count = 100 }
syntype 1 { name = "s"  kind = "normal"  time_constant = 1 }
cellpop 1 { name = "one"  count = 1  thresh = 10 }
fiberpop 1 {
    name = "stim"  kind = "electric_stimulus"  count = 1
    start = 10  stop = 30  seed = 5  stim_mode = "fixed"  frequency = 10
    target 1 { mct = 1  nct = 2  nt = 1  syntype = 1  strength = 0.1  seed = 3 }
}
"#;
        let desc = NetworkDescription::parse(src).unwrap();
        let net = NetworkBuilder::new(&desc).build().unwrap();
        let fp = &net.fiberpops[0];
        assert_eq!(fp.start_tick, 20); // 10 ms at 0.5 ms steps
        assert_eq!(fp.stop_tick, 60);
        assert_eq!(fp.next_stim, 20);
        assert_eq!(fp.next_fixed, 20);
    }

    #[test]
    fn test_bad_injected_expression_rejected() {
        let src = r#"
respire description 1
global { step = 0.5  step_count = 10 }
syntype 1 { name = "s"  kind = "normal"  time_constant = 1 }
cellpop 1 { name = "one"  count = 1  thresh = 10  injected_expression = "Q * 2" }
"#;
        let desc = NetworkDescription::parse(src).unwrap();
        assert!(NetworkBuilder::new(&desc).build().is_err());
    }
}
