//! Fleet CRD Definitions
//!
//! Custom resources read by the master controller manager:
//! - `Seed`: a seed cluster and where its kubeconfig lives
//! - `Project`: a project and its owner, editor and viewer groups

pub mod project;
pub mod seed;

pub use project::*;
pub use seed::*;
