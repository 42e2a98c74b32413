//! Port-type detection and HVDCP negotiation.

pub mod engine;
pub mod policy_manager;

pub use engine::{DetectionEngine, DetectionState};
