//! Adaptive control plane for an XDP DDoS scrubbing data plane.
//!
//! The collector turns the data plane's cumulative counters into rates, the
//! baseline learns what normal traffic looks like, and the escalation engine
//! moves the protection level up and down with hysteresis.

pub mod api;
pub mod config;
pub mod core;
pub mod models;
pub mod utils;
