//! Relay Sim - simulated participants for the chain scheduler
//!
//! Runs a seeded population of participants through a fully wired
//! scheduler (store, job manager, timeout supervisor) and audits the
//! chains it leaves behind.

pub mod simulator;

pub use simulator::{
    chain_stats, check_invariants, default_experiment, run_simulator, simulated_answer,
    simulation_registry, ChainStats, SimulatorConfig, SimulatorReport, SimulatorStats, Violation,
    SIM_JOB,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
