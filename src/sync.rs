//! Safe endpoint pairs for in-process communication.
//!
//! This module wraps the core ring algorithms in owned producer/consumer
//! handles that enforce the single-consumer and single-producer invariants
//! at the type level.

pub mod mpsc;
pub mod spsc;
