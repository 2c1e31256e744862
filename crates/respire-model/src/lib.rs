//! Network description and run-script data model for the respire simulator
//!
//! This crate holds the immutable inputs of a simulation run: the network
//! description (populations, fibers, synapse types, lung parameters) and the
//! run script (update interval, plot list, output selections). Both are
//! legacy text formats; the description is parsed schema-driven so that
//! unknown fields are tolerated and missing fields pick up defaults, which is
//! what keeps old and new files mutually readable.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod codes;
pub mod description;
pub mod error;
pub mod schema;
pub mod script;

pub use description::{
    AfferentMap, CellKind, CellPopDescription, FiberKind, FiberPopDescription, GlobalParams,
    MarkerParams, NetworkDescription, StimMode, SynKind, SynTypeDescription, TargetDescription,
};
pub use error::{ModelError, Result};
pub use script::{AnalogSpec, PlotSpec, RunScript, SpikeChannel, SpikeSource};

/// Description file format version this crate reads and understands.
pub const DESCRIPTION_VERSION: u32 = 1;

/// Synapse type index 0 is reserved (meaning "no synapse").
pub const SYNTYPE_RESERVED: usize = 0;
