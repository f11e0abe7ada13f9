//! irgraph-sim library.
//!
//! Seeded rewrite simulations over the irgraph engine, checked against a
//! brute-force oracle.
//!
//! # Conventions
//!
//! - **Errors**: Use `anyhow::Result` for return types.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `debug!`, `trace!`).

pub mod campaign;
pub mod oracle;
pub mod rng;
pub mod simulator;

pub use campaign::{CampaignConfig, CampaignReport, run_campaign};
pub use simulator::{RewriteKind, SimulationConfig, SimulationResult, Simulator, TraceEvent};
