//! Core MPSC (Multi-Producer Single-Consumer) slot ring primitives.
//!
//! This module contains a bounded lock-free MPSC ring buffer where producers
//! deposit one element per push and the consumer drains contiguous runs.
//! Producers serialize their publication in claim order so the consumer
//! always sees a gap-free run of ready slots.
//!
//! Used by:
//! - [`crate::sync::mpsc`] - safe producer/consumer endpoints over heap memory

use thiserror::Error;

pub(crate) mod ring;

/// Failure modes of a non-blocking push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PushError {
    /// The ring holds its maximum of `N - 1` in-flight elements.
    #[error("ring full")]
    Full,
    /// The ring was canceled.
    #[error("ring canceled")]
    Canceled,
}

/// Failure modes of a non-blocking peek.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PeekError {
    /// No element has been published since the last committed pop.
    #[error("ring empty")]
    Empty,
    /// The ring was canceled.
    #[error("ring canceled")]
    Canceled,
}

/// Producer-side diagnostic counters, sampled with relaxed loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteStats {
    /// High-water mark of the queue size observed by any producer.
    pub max_queued: i32,
    /// Number of times a blocking push parked on a full ring.
    pub wait_count: i32,
}
