//! Simulation engine for the respire simulator
//!
//! The engine owns the runtime network graph built from a parsed
//! description, advances it in fixed time steps, and feeds the configured
//! outputs. One tick runs, in order: the lung advance, cell membrane
//! updates with terminal delivery, fiber event generation, synapse decay and
//! learning countdown, plot evaluation, analog pool decimation, and a
//! control-channel poll. Everything is single-threaded; determinism comes
//! from named per-population pseudorandom streams advanced in a fixed order.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod afferent;
pub mod build;
pub mod condi;
pub mod control;
pub mod engine;
pub mod error;
pub mod expr;
pub mod lung;
pub mod motor;
pub mod network;
pub mod plot;
pub mod quiet;
pub mod reload;
pub mod rng;
pub mod solver;

pub use build::NetworkBuilder;
pub use control::{Command, ControlLink, ControlPoll};
pub use engine::{Engine, Outputs, PlotSink, RunSummary};
pub use error::{EngineError, Result};
pub use lung::{LungModel, LungState, MotorInputs};
pub use network::Network;
pub use rng::{GaussianStream, Lcg};

/// Seed of the run-global uniform stream used by stretch-receptor firing
pub const GLOBAL_SEED: i32 = 314159;
