//! Runtime network graph
//!
//! The builder turns an immutable description into this mutable runtime
//! form: per-population cell and fiber arrays, outgoing terminals, and a
//! flat arena of synapse slots addressed by index. Terminals carry arena
//! indices rather than references so a mid-run reload can re-point them
//! without chasing back-references, and so delivery can mutate a target
//! slot while the source side is being iterated.

use crate::afferent::AfferentInput;
use crate::error::{EngineError, Result};
use crate::expr::Expr;
use crate::rng::Lcg;
use respire_model::{
    AfferentMap, CellKind, FiberKind, GlobalParams, StimMode, SynKind, TargetDescription,
};

/// Free-slot sentinel in a learning history ring
pub const LEARN_FREE: i32 = -1;
/// Initial learning ring capacity
pub const LEARN_SIZE: usize = 5;
/// Learning ring growth increment
pub const LEARN_GROW_BY: usize = 5;

/// One learning history entry: a sender firing awaiting its arrival window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LearnEntry {
    /// Receiving population, or [`LEARN_FREE`] when the slot is unused
    pub recv_pop: i32,
    /// Sender instance index within its population
    pub send_term: i32,
    /// Receiving cell index
    pub recv_term: i32,
    /// Ticks until the entry leaves the coincidence window
    pub arrival: i32,
}

impl LearnEntry {
    /// An unused entry
    pub const fn free() -> Self {
        Self {
            recv_pop: LEARN_FREE,
            send_term: 0,
            recv_term: 0,
            arrival: 0,
        }
    }
}

/// Derived per-run parameters of one synapse type
#[derive(Debug, Clone, PartialEq)]
pub struct SynTypeParams {
    /// Kind from the description
    pub kind: SynKind,
    /// Reversal potential
    pub eq: f64,
    /// Per-step decay factor exp(−Δt/τ)
    pub dcs: f64,
    /// 1-based parent normal type for modulators, 0 otherwise
    pub parent: usize,
    /// Learning coincidence window in ticks
    pub learn_window: i32,
    /// Learning strength bound
    pub learn_max: f64,
    /// Learning per-event delta
    pub learn_delta: f64,
}

/// A target cell's receiver object for one incoming synapse type
#[derive(Debug, Clone)]
pub struct SynSlot {
    /// Current conductance
    pub g: f64,
    /// Reversal potential copied from the type
    pub eq: f64,
    /// Decay factor copied from the type
    pub dcs: f64,
    /// Delay queue; holds contributions scheduled (index − now) ticks ahead
    pub q: Vec<f64>,
    /// 0-based target cell population
    pub pop: usize,
    /// 0-based target cell index
    pub cell: usize,
    /// 1-based synapse type index
    pub syntype: usize,
    /// Kind cached from the type
    pub kind: SynKind,
    /// 1-based parent type cached from the type
    pub parent: usize,
    /// Strength copied from the wiring at attach time
    pub initial_strength: f64,
    /// Current learned strength (learning kind only)
    pub learned_strength: f64,
    /// Learning window in ticks
    pub learn_window: i32,
    /// Learning strength bound
    pub learn_max: f64,
    /// Learning per-event delta
    pub learn_delta: f64,
    /// Learning history ring; empty for non-learning slots
    pub history: Vec<LearnEntry>,
}

/// One outgoing axonal endpoint
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Terminal {
    /// Conduction delay in ticks, stable for the run
    pub delay: i32,
    /// Strength copied from the target record
    pub strength: f64,
    /// Disabled terminals deliver nothing
    pub disabled: bool,
    /// Arena index of the receiving synapse slot
    pub slot: u32,
}

/// One cell instance
#[derive(Debug, Clone)]
pub struct Cell {
    /// Membrane potential of the previous tick
    pub vm_prev: f64,
    /// Membrane potential
    pub vm: f64,
    /// Potassium conductance (bursters: inactivation gate h)
    pub gk: f64,
    /// Firing threshold
    pub thr: f64,
    /// Excitatory noise conductance state
    pub gnoise_e: f64,
    /// Inhibitory noise conductance state
    pub gnoise_i: f64,
    /// Spike flag of the current tick
    pub spike: bool,
    /// First arena index of this cell's synapse slots
    pub slot_start: u32,
    /// Number of synapse slots
    pub slot_count: u32,
    /// Outgoing terminals, grouped by target record in description order
    pub targets: Vec<Terminal>,
}

impl Cell {
    /// Arena index range of this cell's slots
    pub fn slot_range(&self) -> std::ops::Range<usize> {
        self.slot_start as usize..(self.slot_start + self.slot_count) as usize
    }
}

/// One fiber instance
#[derive(Debug, Clone)]
pub struct Fiber {
    /// Event flag of the current tick
    pub fired: bool,
    /// Current afferent signal sample (afferent populations)
    pub signal: f64,
    /// Outgoing terminals
    pub targets: Vec<Terminal>,
}

/// Runtime cell population
#[derive(Debug)]
pub struct CellPop {
    /// Population name from the description
    pub name: String,
    /// Subtype
    pub kind: CellKind,
    /// Cell instances
    pub cells: Vec<Cell>,
    /// Target records kept for diagnostics and reload
    pub targets: Vec<TargetDescription>,
    /// Integration constant −Δt/(2·TMEM)
    pub r0: f64,
    /// Potassium decay factor exp(−Δt/TGK)
    pub dcg: f64,
    /// Threshold decay factor exp(−Δt/TTH)
    pub dcth: f64,
    /// Potassium increment per action potential
    pub b: f64,
    /// Accommodation parameter
    pub mgc: f64,
    /// Resting threshold
    pub th0: f64,
    /// Resting threshold standard deviation
    pub th0_sd: f64,
    /// Constant excitatory drive IC + G_m0·V_m0
    pub ge0: f64,
    /// Noise conductance amplitude; 0 disables noise
    pub noise_amp: f64,
    /// Noise stream
    pub noise_seed: Lcg,
    /// Injected current as a function of lung volume
    pub ic_expression: Option<Expr>,
    /// Burster constants
    pub theta_m: f64,
    /// Burster constants
    pub sigma_m: f64,
    /// Burster constants
    pub theta_h: f64,
    /// Burster constants
    pub sigma_h: f64,
    /// Burster constants
    pub taubar_h: f64,
    /// Burster constants
    pub g_nap: f64,
    /// Burster constants
    pub v_reset: f64,
    /// Burster constants
    pub v_thresh: f64,
    /// Burster constants
    pub delta_h: f64,
    /// True when any outgoing link uses a learning synapse type
    pub has_learn: bool,
}

/// Runtime fiber population
#[derive(Debug)]
pub struct FiberPop {
    /// Population name from the description
    pub name: String,
    /// Subtype
    pub kind: FiberKind,
    /// Fiber instances
    pub fibers: Vec<Fiber>,
    /// Target records kept for diagnostics and reload
    pub targets: Vec<TargetDescription>,
    /// Activity window start in ticks
    pub start_tick: i64,
    /// Activity window stop in ticks
    pub stop_tick: i64,
    /// Per-tick firing probability
    pub probability: f64,
    /// Population firing stream
    pub seed: Lcg,
    /// Electric stimulus mode
    pub stim_mode: StimMode,
    /// Electric stimulus frequency in Hz
    pub frequency: f64,
    /// Fuzzy-mode jitter window in ms
    pub fuzzy_range: f64,
    /// Next scheduled stimulus tick
    pub next_stim: i64,
    /// Unjittered stimulus schedule cursor
    pub next_fixed: i64,
    /// Value-to-probability mapping
    pub map: AfferentMap,
    /// External signal input, when the population is afferent and backed
    pub input: Option<AfferentInput>,
    /// Previous signal sample for the slope term
    pub prev_signal: f64,
    /// True when any outgoing link uses a learning synapse type
    pub has_learn: bool,
}

/// The complete runtime graph
#[derive(Debug)]
pub struct Network {
    /// Global parameters the run was built with
    pub global: GlobalParams,
    /// Derived synapse type parameters; position 0 holds type index 1
    pub syntypes: Vec<SynTypeParams>,
    /// Cell populations
    pub cellpops: Vec<CellPop>,
    /// Fiber populations
    pub fiberpops: Vec<FiberPop>,
    /// Flat synapse slot arena; cells address it via their slot ranges
    pub slots: Vec<SynSlot>,
    /// 0-based cell populations with learning outputs
    pub learn_cellpops: Vec<usize>,
    /// 0-based fiber populations with learning outputs
    pub learn_fiberpops: Vec<usize>,
}

impl Network {
    /// Total cell count across populations
    pub fn cell_count(&self) -> usize {
        self.cellpops.iter().map(|p| p.cells.len()).sum()
    }

    /// True when any population carries learning synapses
    pub fn has_learning(&self) -> bool {
        !self.learn_cellpops.is_empty() || !self.learn_fiberpops.is_empty()
    }

    /// Arena slot of a (0-based pop, cell, 1-based type) coordinate
    pub fn find_slot(&self, pop: usize, cell: usize, syntype: usize) -> Option<u32> {
        let c = self.cellpops.get(pop)?.cells.get(cell)?;
        self.slots[c.slot_range()]
            .iter()
            .position(|s| s.syntype == syntype)
            .map(|n| c.slot_start + n as u32)
    }

    /// Verify the between-ticks queue invariant: every queued value is 0,
    /// or 1 on a modulator slot when presynaptic mode is active.
    pub fn check_queues(&self) -> Result<()> {
        for (n, slot) in self.slots.iter().enumerate() {
            let modulator = matches!(slot.kind, SynKind::Pre | SynKind::Post);
            for (qn, &v) in slot.q.iter().enumerate() {
                let ok = v == 0.0 || (v == 1.0 && self.global.presynaptic && modulator);
                if !ok {
                    return Err(EngineError::build(format!(
                        "slot {} (pop {} cell {} type {}): q[{}] = {} violates the queue \
                         invariant",
                        n, slot.pop + 1, slot.cell + 1, slot.syntype, qn, v
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_learn_entry_free() {
        let e = LearnEntry::free();
        assert_eq!(e.recv_pop, LEARN_FREE);
        assert_eq!(e.arrival, 0);
    }
}
