//! Network description: populations, fibers, synapse types, globals
//!
//! The structures here mirror the legacy description file one-to-one. They
//! carry parameters in natural units (time constants in ms, windows in ms);
//! the per-step decay factors and conduction windows in ticks are derived by
//! the engine's builder once the step size is known.

use crate::error::{ModelError, Result};
use crate::schema::{parse_stream, FieldDef, FieldKind, Fields, Record, StructSchema};
use crate::DESCRIPTION_VERSION;

/// Explicit synapse kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynKind {
    /// Ordinary conductance synapse
    Normal,
    /// Presynaptic modulator of its parent normal type
    Pre,
    /// Postsynaptic modulator of its parent normal type
    Post,
    /// Hebbian learning synapse
    Learn,
}

impl SynKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Self::Normal),
            "pre" => Some(Self::Pre),
            "post" => Some(Self::Post),
            "learn" => Some(Self::Learn),
            _ => None,
        }
    }
}

/// Cell population subtype
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    /// MacGregor integrate-and-fire cell
    Standard,
    /// Hybrid IF cell with persistent sodium current
    Burster,
    /// Pulmonary stretch receptor with probability-gated firing
    Psr,
    /// Phrenic motor pool
    Phrenic,
    /// Lumbar (abdominal) motor pool
    Lumbar,
    /// Inspiratory laryngeal motor pool
    InspLaryngeal,
    /// Expiratory laryngeal motor pool
    ExpLaryngeal,
}

impl CellKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(Self::Standard),
            "burster" => Some(Self::Burster),
            "psr" => Some(Self::Psr),
            "phrenic" => Some(Self::Phrenic),
            "lumbar" => Some(Self::Lumbar),
            "insp_laryngeal" => Some(Self::InspLaryngeal),
            "exp_laryngeal" => Some(Self::ExpLaryngeal),
        _ => None,
        }
    }
}

/// Fiber population subtype
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberKind {
    /// Per-tick Bernoulli firing with fixed probability
    Stochastic,
    /// Electrical stimulus train
    ElectricStim,
    /// Externally driven afferent
    Afferent,
}

impl FiberKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "stochastic" => Some(Self::Stochastic),
            "electric_stimulus" => Some(Self::ElectricStim),
            "afferent" => Some(Self::Afferent),
            _ => None,
        }
    }
}

/// Electric stimulus scheduling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StimMode {
    /// Events at exact 1/frequency spacing
    Fixed,
    /// Spacing jittered uniformly within the fuzzy range
    Fuzzy,
}

impl StimMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "fixed" => Some(Self::Fixed),
            "fuzzy" => Some(Self::Fuzzy),
            _ => None,
        }
    }
}

/// Post-run inspiratory/expiratory marker parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarkerParams {
    /// Analog samples per detection window
    pub sample: i32,
    /// Smoothing kernel length in samples
    pub smooth: i32,
    /// Normalized upward slope threshold
    pub plus: f64,
    /// Normalized downward slope threshold
    pub minus: f64,
    /// Analog sampling frequency in Hz
    pub freq: i32,
    /// Optional first pulse pair: (code, start ms, stop ms)
    pub pulse1: Option<(i32, i32, i32)>,
    /// Optional second pulse pair: (code, start ms, stop ms)
    pub pulse2: Option<(i32, i32, i32)>,
}

impl MarkerParams {
    /// True when the description carries usable marker parameters
    pub fn enabled(&self) -> bool {
        self.freq != 0 && self.sample != 0 && self.smooth != 0
    }
}

/// Global simulation parameters
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalParams {
    /// Step size Δt in milliseconds
    pub step: f64,
    /// Total step count N
    pub step_count: i64,
    /// Potassium reversal potential E_K
    pub e_k: f64,
    /// Resting membrane potential V_m0
    pub v_m0: f64,
    /// Baseline conductance G_m0
    pub g_m0: f64,
    /// Presynaptic mode flag
    pub presynaptic: bool,
    /// Alternate (infant) lung constants flag
    pub baby_lung: bool,
    /// Laryngeal motor pool maximum firing rate (spikes/s)
    pub laryngeal_max_rate: f64,
    /// Phrenic motor drive formula over population rates (empty = default)
    pub phrenic_equation: String,
    /// Lumbar motor drive formula over population rates (empty = default)
    pub lumbar_equation: String,
    /// Post-run marker insertion parameters
    pub markers: MarkerParams,
}

impl Default for GlobalParams {
    fn default() -> Self {
        Self {
            step: 0.5,
            step_count: 0,
            e_k: -10.0,
            v_m0: 0.0,
            g_m0: 1.0,
            presynaptic: false,
            baby_lung: false,
            laryngeal_max_rate: 20.0,
            phrenic_equation: String::new(),
            lumbar_equation: String::new(),
            markers: MarkerParams::default(),
        }
    }
}

/// One synapse type of the description (index 1..T; 0 reserved)
#[derive(Debug, Clone, PartialEq)]
pub struct SynTypeDescription {
    /// Display name
    pub name: String,
    /// Explicit kind
    pub kind: SynKind,
    /// Reversal potential EQ (mV)
    pub eq: f64,
    /// Synaptic time constant τ (ms); DCS = exp(−Δt/τ)
    pub time_constant: f64,
    /// 1-based parent normal type for pre/post kinds, 0 otherwise
    pub parent: usize,
    /// Learning coincidence window in ticks
    pub learn_window: i32,
    /// Learning strength bound
    pub learn_max: f64,
    /// Learning per-event delta (may be negative for anti-Hebbian)
    pub learn_delta: f64,
}

/// One outgoing pop-to-pop link of a source population
#[derive(Debug, Clone, PartialEq)]
pub struct TargetDescription {
    /// 1-based receiver cell population index
    pub pop: usize,
    /// Minimum conduction time in ticks
    pub mct: i32,
    /// Maximum conduction time in ticks
    pub nct: i32,
    /// Number of terminals per source instance
    pub terminals: i32,
    /// 1-based synapse type index
    pub syntype: usize,
    /// Synaptic strength
    pub strength: f64,
    /// Wiring seed for the per-instance terminal stream
    pub seed: i32,
}

/// One cell population of the description
#[derive(Debug, Clone, PartialEq)]
pub struct CellPopDescription {
    /// Population name; drives motor pool discovery
    pub name: String,
    /// Subtype
    pub kind: CellKind,
    /// Number of cells
    pub count: usize,
    /// Membrane time constant TMEM (ms)
    pub t_mem: f64,
    /// Potassium conductance time constant TGK (ms); DCG = exp(−Δt/TGK)
    pub t_gk: f64,
    /// Threshold accommodation time constant TTH (ms); DCTH = exp(−Δt/TTH)
    pub t_th: f64,
    /// Potassium conductance increment per action potential (B)
    pub b: f64,
    /// Accommodation parameter MGC
    pub mgc: f64,
    /// Resting threshold Θ0 (mV)
    pub thresh: f64,
    /// Resting threshold standard deviation
    pub thresh_sd: f64,
    /// Injected current constant; GE0 = IC + G_m0·V_m0
    pub dc_injected: f64,
    /// Injected current as an expression over lung volume (variable V)
    pub injected_expression: String,
    /// Noise conductance amplitude; 0 disables noise
    pub noise_amp: f64,
    /// Burster: sodium activation midpoint θ_m
    pub theta_m: f64,
    /// Burster: sodium activation slope σ_m
    pub sigma_m: f64,
    /// Burster: inactivation midpoint θ_h
    pub theta_h: f64,
    /// Burster: inactivation slope σ_h
    pub sigma_h: f64,
    /// Burster: inactivation time constant scale (ms)
    pub taubar_h: f64,
    /// Burster: persistent sodium conductance
    pub g_nap: f64,
    /// Burster: post-spike reset base potential
    pub v_reset: f64,
    /// Burster: firing threshold
    pub v_thresh: f64,
    /// Burster: post-spike inactivation increment
    pub delta_h: f64,
    /// Outgoing links
    pub targets: Vec<TargetDescription>,
}

/// Afferent signal-to-probability mapping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AfferentMap {
    /// Backing signal file
    pub file: String,
    /// Ascending signal values
    pub values: Vec<f64>,
    /// Firing probability at each value
    pub probabilities: Vec<f64>,
    /// Display offset added to the plotted signal
    pub offset: f64,
    /// Scale applied to the signal's discrete derivative; 0 disables
    pub slope_scale: f64,
}

/// One fiber population of the description
#[derive(Debug, Clone, PartialEq)]
pub struct FiberPopDescription {
    /// Population name
    pub name: String,
    /// Subtype
    pub kind: FiberKind,
    /// Number of fibers
    pub count: usize,
    /// Per-tick firing probability (stochastic kind)
    pub probability: f64,
    /// Activity window start in ms
    pub start_ms: f64,
    /// Activity window stop in ms
    pub stop_ms: f64,
    /// Population firing seed
    pub seed: i32,
    /// Electric stimulus scheduling mode
    pub stim_mode: StimMode,
    /// Electric stimulus frequency in Hz
    pub frequency: f64,
    /// Fuzzy-mode jitter window in ms
    pub fuzzy_range: f64,
    /// Afferent signal mapping
    pub afferent: AfferentMap,
    /// Outgoing links
    pub targets: Vec<TargetDescription>,
}

/// The complete parsed network description
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkDescription {
    /// Global parameters
    pub global: GlobalParams,
    /// Synapse types; position 0 holds type index 1
    pub syntypes: Vec<SynTypeDescription>,
    /// Cell populations; position 0 holds population index 1
    pub cellpops: Vec<CellPopDescription>,
    /// Fiber populations; position 0 holds population index 1
    pub fiberpops: Vec<FiberPopDescription>,
}

/// Maximum number of (value, probability) points in an afferent table
pub const MAX_AFFERENT_POINTS: usize = 32;

const GLOBAL_SCHEMA: StructSchema = StructSchema {
    name: "global",
    fields: &[
        FieldDef { name: "step", kind: FieldKind::Float },
        FieldDef { name: "step_count", kind: FieldKind::Int },
        FieldDef { name: "k_equilibrium", kind: FieldKind::Float },
        FieldDef { name: "resting_potential", kind: FieldKind::Float },
        FieldDef { name: "baseline_conductance", kind: FieldKind::Float },
        FieldDef { name: "presynaptic", kind: FieldKind::Int },
        FieldDef { name: "baby_lung", kind: FieldKind::Int },
        FieldDef { name: "laryngeal_max_rate", kind: FieldKind::Float },
        FieldDef { name: "phrenic_equation", kind: FieldKind::Str },
        FieldDef { name: "lumbar_equation", kind: FieldKind::Str },
        FieldDef { name: "ie_sample", kind: FieldKind::Int },
        FieldDef { name: "ie_smooth", kind: FieldKind::Int },
        FieldDef { name: "ie_plus", kind: FieldKind::Float },
        FieldDef { name: "ie_minus", kind: FieldKind::Float },
        FieldDef { name: "ie_freq", kind: FieldKind::Int },
        FieldDef { name: "p1_code", kind: FieldKind::Int },
        FieldDef { name: "p1_start", kind: FieldKind::Int },
        FieldDef { name: "p1_stop", kind: FieldKind::Int },
        FieldDef { name: "p2_code", kind: FieldKind::Int },
        FieldDef { name: "p2_start", kind: FieldKind::Int },
        FieldDef { name: "p2_stop", kind: FieldKind::Int },
    ],
};

const SYNTYPE_SCHEMA: StructSchema = StructSchema {
    name: "syntype",
    fields: &[
        FieldDef { name: "name", kind: FieldKind::Str },
        FieldDef { name: "kind", kind: FieldKind::Str },
        FieldDef { name: "eq", kind: FieldKind::Float },
        FieldDef { name: "time_constant", kind: FieldKind::Float },
        FieldDef { name: "parent", kind: FieldKind::Int },
        FieldDef { name: "learn_window", kind: FieldKind::Int },
        FieldDef { name: "learn_max", kind: FieldKind::Float },
        FieldDef { name: "learn_delta", kind: FieldKind::Float },
    ],
};

const TARGET_SCHEMA: StructSchema = StructSchema {
    name: "target",
    fields: &[
        FieldDef { name: "mct", kind: FieldKind::Int },
        FieldDef { name: "nct", kind: FieldKind::Int },
        FieldDef { name: "nt", kind: FieldKind::Int },
        FieldDef { name: "syntype", kind: FieldKind::Int },
        FieldDef { name: "strength", kind: FieldKind::Float },
        FieldDef { name: "seed", kind: FieldKind::Int },
    ],
};

const CELLPOP_SCHEMA: StructSchema = StructSchema {
    name: "cellpop",
    fields: &[
        FieldDef { name: "name", kind: FieldKind::Str },
        FieldDef { name: "kind", kind: FieldKind::Str },
        FieldDef { name: "count", kind: FieldKind::Int },
        FieldDef { name: "t_mem", kind: FieldKind::Float },
        FieldDef { name: "t_gk", kind: FieldKind::Float },
        FieldDef { name: "t_th", kind: FieldKind::Float },
        FieldDef { name: "b", kind: FieldKind::Float },
        FieldDef { name: "mgc", kind: FieldKind::Float },
        FieldDef { name: "thresh", kind: FieldKind::Float },
        FieldDef { name: "thresh_sd", kind: FieldKind::Float },
        FieldDef { name: "dc_injected", kind: FieldKind::Float },
        FieldDef { name: "injected_expression", kind: FieldKind::Str },
        FieldDef { name: "noise_amp", kind: FieldKind::Float },
        FieldDef { name: "theta_m", kind: FieldKind::Float },
        FieldDef { name: "sigma_m", kind: FieldKind::Float },
        FieldDef { name: "theta_h", kind: FieldKind::Float },
        FieldDef { name: "sigma_h", kind: FieldKind::Float },
        FieldDef { name: "taubar_h", kind: FieldKind::Float },
        FieldDef { name: "g_nap", kind: FieldKind::Float },
        FieldDef { name: "v_reset", kind: FieldKind::Float },
        FieldDef { name: "v_thresh", kind: FieldKind::Float },
        FieldDef { name: "delta_h", kind: FieldKind::Float },
    ],
};

const FIBERPOP_SCHEMA: StructSchema = StructSchema {
    name: "fiberpop",
    fields: &[
        FieldDef { name: "name", kind: FieldKind::Str },
        FieldDef { name: "kind", kind: FieldKind::Str },
        FieldDef { name: "count", kind: FieldKind::Int },
        FieldDef { name: "probability", kind: FieldKind::Float },
        FieldDef { name: "start", kind: FieldKind::Float },
        FieldDef { name: "stop", kind: FieldKind::Float },
        FieldDef { name: "seed", kind: FieldKind::Int },
        FieldDef { name: "stim_mode", kind: FieldKind::Str },
        FieldDef { name: "frequency", kind: FieldKind::Float },
        FieldDef { name: "fuzzy_range", kind: FieldKind::Float },
        FieldDef { name: "afferent_file", kind: FieldKind::Str },
        FieldDef { name: "aff_val", kind: FieldKind::FloatList },
        FieldDef { name: "aff_prob", kind: FieldKind::FloatList },
        FieldDef { name: "offset", kind: FieldKind::Float },
        FieldDef { name: "slope_scale", kind: FieldKind::Float },
    ],
};

/// The published schemas, the file-compatibility contract of this format
pub fn schemas() -> [&'static StructSchema; 5] {
    [
        &GLOBAL_SCHEMA,
        &SYNTYPE_SCHEMA,
        &TARGET_SCHEMA,
        &CELLPOP_SCHEMA,
        &FIBERPOP_SCHEMA,
    ]
}

fn parse_targets(record: &Record) -> Result<Vec<TargetDescription>> {
    let mut targets = Vec::new();
    for child in record.children_named("target") {
        let pop = child.index.ok_or_else(|| {
            ModelError::parse(child.line, "target record needs a receiver population index")
        })? as usize;
        let f = Fields::new(child, &TARGET_SCHEMA);
        targets.push(TargetDescription {
            pop,
            mct: f.int("mct", 0)? as i32,
            nct: f.int("nct", 0)? as i32,
            terminals: f.int("nt", 0)? as i32,
            syntype: f.require_int("syntype")? as usize,
            strength: f.float("strength", 0.0)?,
            seed: f.int("seed", 1)? as i32,
        });
    }
    Ok(targets)
}

fn kind_error(record: &Record, field: &str, value: &str) -> ModelError {
    ModelError::bad_field(record.name.clone(), field, format!("unknown value {:?}", value))
}

fn indexed<T>(mut items: Vec<(u32, T)>, what: &str) -> Result<Vec<T>> {
    items.sort_by_key(|(idx, _)| *idx);
    for (want, (idx, _)) in items.iter().enumerate() {
        if *idx as usize != want + 1 {
            return Err(ModelError::invalid(format!(
                "{} indices must run 1..{} without gaps (found {})",
                what,
                items.len(),
                idx
            )));
        }
    }
    Ok(items.into_iter().map(|(_, item)| item).collect())
}

impl NetworkDescription {
    /// Parse a description from text
    pub fn parse(src: &str) -> Result<Self> {
        let (version, records) = parse_stream(src)?;
        if version > DESCRIPTION_VERSION {
            return Err(ModelError::UnsupportedVersion {
                found: version,
                supported: DESCRIPTION_VERSION,
            });
        }

        let mut global = GlobalParams::default();
        let mut have_global = false;
        let mut syntypes = Vec::new();
        let mut cellpops = Vec::new();
        let mut fiberpops = Vec::new();

        for record in &records {
            match record.name.as_str() {
                "global" => {
                    global = Self::parse_global(record)?;
                    have_global = true;
                }
                "syntype" => {
                    let idx = record.index.ok_or_else(|| {
                        ModelError::parse(record.line, "syntype record needs an index")
                    })?;
                    syntypes.push((idx, Self::parse_syntype(record)?));
                }
                "cellpop" => {
                    let idx = record.index.ok_or_else(|| {
                        ModelError::parse(record.line, "cellpop record needs an index")
                    })?;
                    cellpops.push((idx, Self::parse_cellpop(record)?));
                }
                "fiberpop" => {
                    let idx = record.index.ok_or_else(|| {
                        ModelError::parse(record.line, "fiberpop record needs an index")
                    })?;
                    fiberpops.push((idx, Self::parse_fiberpop(record)?));
                }
                other => {
                    log::warn!("line {}: unknown record {:?}, ignoring", record.line, other);
                }
            }
        }

        if !have_global {
            return Err(ModelError::invalid("description has no global record"));
        }

        let desc = Self {
            global,
            syntypes: indexed(syntypes, "syntype")?,
            cellpops: indexed(cellpops, "cellpop")?,
            fiberpops: indexed(fiberpops, "fiberpop")?,
        };
        desc.validate()?;
        Ok(desc)
    }

    fn parse_global(record: &Record) -> Result<GlobalParams> {
        let f = Fields::new(record, &GLOBAL_SCHEMA);
        let p1_code = f.int("p1_code", 0)? as i32;
        let p2_code = f.int("p2_code", 0)? as i32;
        Ok(GlobalParams {
            step: f.float("step", 0.5)?,
            step_count: f.require_int("step_count")?,
            e_k: f.float("k_equilibrium", -10.0)?,
            v_m0: f.float("resting_potential", 0.0)?,
            g_m0: f.float("baseline_conductance", 1.0)?,
            presynaptic: f.int("presynaptic", 0)? != 0,
            baby_lung: f.int("baby_lung", 0)? != 0,
            laryngeal_max_rate: f.float("laryngeal_max_rate", 20.0)?,
            phrenic_equation: f.string("phrenic_equation", "")?,
            lumbar_equation: f.string("lumbar_equation", "")?,
            markers: MarkerParams {
                sample: f.int("ie_sample", 0)? as i32,
                smooth: f.int("ie_smooth", 0)? as i32,
                plus: f.float("ie_plus", 0.0)?,
                minus: f.float("ie_minus", 0.0)?,
                freq: f.int("ie_freq", 0)? as i32,
                pulse1: (p1_code != 0).then(|| {
                    Ok::<_, ModelError>((
                        p1_code,
                        f.int("p1_start", 0)? as i32,
                        f.int("p1_stop", 0)? as i32,
                    ))
                }).transpose()?,
                pulse2: (p2_code != 0).then(|| {
                    Ok::<_, ModelError>((
                        p2_code,
                        f.int("p2_start", 0)? as i32,
                        f.int("p2_stop", 0)? as i32,
                    ))
                }).transpose()?,
            },
        })
    }

    fn parse_syntype(record: &Record) -> Result<SynTypeDescription> {
        let f = Fields::new(record, &SYNTYPE_SCHEMA);
        let kind_txt = f.string("kind", "normal")?;
        let kind =
            SynKind::parse(&kind_txt).ok_or_else(|| kind_error(record, "kind", &kind_txt))?;
        Ok(SynTypeDescription {
            name: f.string("name", "")?,
            kind,
            eq: f.float("eq", 0.0)?,
            time_constant: f.float("time_constant", 1.0)?,
            parent: f.int("parent", 0)? as usize,
            learn_window: f.int("learn_window", 0)? as i32,
            learn_max: f.float("learn_max", 0.0)?,
            learn_delta: f.float("learn_delta", 0.0)?,
        })
    }

    fn parse_cellpop(record: &Record) -> Result<CellPopDescription> {
        let f = Fields::new(record, &CELLPOP_SCHEMA);
        let kind_txt = f.string("kind", "standard")?;
        let kind =
            CellKind::parse(&kind_txt).ok_or_else(|| kind_error(record, "kind", &kind_txt))?;
        Ok(CellPopDescription {
            name: f.string("name", "")?,
            kind,
            count: f.int("count", 0)?.max(0) as usize,
            t_mem: f.float("t_mem", 9.0)?,
            t_gk: f.float("t_gk", 7.0)?,
            t_th: f.float("t_th", 20.0)?,
            b: f.float("b", 0.0)?,
            mgc: f.float("mgc", 0.0)?,
            thresh: f.float("thresh", 10.0)?,
            thresh_sd: f.float("thresh_sd", 0.0)?,
            dc_injected: f.float("dc_injected", 0.0)?,
            injected_expression: f.string("injected_expression", "")?,
            noise_amp: f.float("noise_amp", 0.0)?,
            theta_m: f.float("theta_m", -34.0)?,
            sigma_m: f.float("sigma_m", -5.0)?,
            theta_h: f.float("theta_h", -48.0)?,
            sigma_h: f.float("sigma_h", 5.0)?,
            taubar_h: f.float("taubar_h", 10000.0)?,
            g_nap: f.float("g_nap", 2.8)?,
            v_reset: f.float("v_reset", -50.0)?,
            v_thresh: f.float("v_thresh", -35.0)?,
            delta_h: f.float("delta_h", 0.0)?,
            targets: parse_targets(record)?,
        })
    }

    fn parse_fiberpop(record: &Record) -> Result<FiberPopDescription> {
        let f = Fields::new(record, &FIBERPOP_SCHEMA);
        let kind_txt = f.string("kind", "stochastic")?;
        let kind =
            FiberKind::parse(&kind_txt).ok_or_else(|| kind_error(record, "kind", &kind_txt))?;
        let mode_txt = f.string("stim_mode", "fixed")?;
        let stim_mode =
            StimMode::parse(&mode_txt).ok_or_else(|| kind_error(record, "stim_mode", &mode_txt))?;
        Ok(FiberPopDescription {
            name: f.string("name", "")?,
            kind,
            count: f.int("count", 0)?.max(0) as usize,
            probability: f.float("probability", 0.0)?,
            start_ms: f.float("start", 0.0)?,
            stop_ms: f.float("stop", 0.0)?,
            seed: f.int("seed", 1)? as i32,
            stim_mode,
            frequency: f.float("frequency", 0.0)?,
            fuzzy_range: f.float("fuzzy_range", 0.0)?,
            afferent: AfferentMap {
                file: f.string("afferent_file", "")?,
                values: f.floats("aff_val")?,
                probabilities: f.floats("aff_prob")?,
                offset: f.float("offset", 0.0)?,
                slope_scale: f.float("slope_scale", 0.0)?,
            },
            targets: parse_targets(record)?,
        })
    }

    fn validate_targets(&self, owner: &str, targets: &[TargetDescription]) -> Result<()> {
        for t in targets {
            if t.pop == 0 || t.pop > self.cellpops.len() {
                return Err(ModelError::invalid(format!(
                    "{} targets nonexistent cell population {}",
                    owner, t.pop
                )));
            }
            if t.mct < 0 || t.nct < t.mct {
                return Err(ModelError::invalid(format!(
                    "{} target to pop {}: need 0 <= MCT <= NCT, got {} and {}",
                    owner, t.pop, t.mct, t.nct
                )));
            }
            if t.terminals < 0 {
                return Err(ModelError::invalid(format!(
                    "{} target to pop {}: negative terminal count",
                    owner, t.pop
                )));
            }
            if t.syntype == 0 || t.syntype > self.syntypes.len() {
                return Err(ModelError::invalid(format!(
                    "{} target to pop {} uses undefined synapse type {}",
                    owner, t.pop, t.syntype
                )));
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.global.step <= 0.0 {
            return Err(ModelError::invalid("step size must be positive"));
        }
        if self.global.step_count <= 0 {
            return Err(ModelError::invalid("step count must be positive"));
        }

        // pre/post must point at a normal parent; at most one of each per normal
        let mut pre_of = vec![0usize; self.syntypes.len() + 1];
        let mut post_of = vec![0usize; self.syntypes.len() + 1];
        for (n, st) in self.syntypes.iter().enumerate() {
            match st.kind {
                SynKind::Pre | SynKind::Post => {
                    let parent_ok = st.parent >= 1
                        && st.parent <= self.syntypes.len()
                        && self.syntypes[st.parent - 1].kind == SynKind::Normal;
                    if !parent_ok {
                        return Err(ModelError::invalid(format!(
                            "synapse type {} is a modulator of invalid parent {}",
                            n + 1,
                            st.parent
                        )));
                    }
                    let slot = if st.kind == SynKind::Pre {
                        &mut pre_of[st.parent]
                    } else {
                        &mut post_of[st.parent]
                    };
                    if *slot != 0 {
                        return Err(ModelError::invalid(format!(
                            "normal synapse type {} has more than one {:?} modulator",
                            st.parent, st.kind
                        )));
                    }
                    *slot = n + 1;
                }
                SynKind::Normal | SynKind::Learn => {}
            }
        }

        for (n, cp) in self.cellpops.iter().enumerate() {
            self.validate_targets(&format!("cell population {}", n + 1), &cp.targets)?;
        }
        for (n, fp) in self.fiberpops.iter().enumerate() {
            self.validate_targets(&format!("fiber population {}", n + 1), &fp.targets)?;
            let aff = &fp.afferent;
            if fp.kind == FiberKind::Afferent {
                if aff.values.len() != aff.probabilities.len() {
                    return Err(ModelError::invalid(format!(
                        "fiber population {}: aff_val and aff_prob lengths differ",
                        n + 1
                    )));
                }
                if aff.values.len() > MAX_AFFERENT_POINTS {
                    return Err(ModelError::invalid(format!(
                        "fiber population {}: more than {} afferent points",
                        n + 1,
                        MAX_AFFERENT_POINTS
                    )));
                }
                if aff.values.windows(2).any(|w| w[0] > w[1]) {
                    return Err(ModelError::invalid(format!(
                        "fiber population {}: aff_val must be ascending",
                        n + 1
                    )));
                }
            }
        }
        Ok(())
    }

    /// 1-based pre modulator type for a normal type, if declared
    pub fn pre_modulator_of(&self, normal: usize) -> Option<usize> {
        self.modulator_of(normal, SynKind::Pre)
    }

    /// 1-based post modulator type for a normal type, if declared
    pub fn post_modulator_of(&self, normal: usize) -> Option<usize> {
        self.modulator_of(normal, SynKind::Post)
    }

    fn modulator_of(&self, normal: usize, kind: SynKind) -> Option<usize> {
        self.syntypes
            .iter()
            .position(|st| st.kind == kind && st.parent == normal)
            .map(|n| n + 1)
    }
}
