//! Agent modules for the Edge Engine
//!
//! - `edge`: secure content-delivery convergence (certificate, origin store,
//!   edge distribution, access policy, DNS aliases)

pub mod edge;

pub use edge::ConvergenceEngine;
