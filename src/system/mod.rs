//! System utilities
//!
//! Accelerator detection and resource monitoring used by load-time decisions
//! and the system info endpoint.

pub mod gpu;
pub mod resources;
