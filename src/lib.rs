//! Edge Engine Library
//!
//! Convergence engine for secure static-site delivery.

pub mod agents;

pub use agents::edge;
pub use agents::edge::{ConvergeReport, ConvergenceEngine, DomainTopology, EngineConfig};
