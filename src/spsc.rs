//! Core SPSC (Single-Producer Single-Consumer) zero-copy ring primitives.
//!
//! This module contains a bounded byte-oriented (or fixed-element) ring that
//! exposes its storage directly to the caller: the writer reserves a
//! contiguous region, fills it in place, and commits; the reader does the
//! same on the other end. Nothing is staged through an intermediate buffer.
//!
//! Used by:
//! - [`crate::sync::spsc`] - safe writer/reader endpoints over heap memory

use thiserror::Error;

pub(crate) mod ring;

/// Failure modes of a region reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GrantError {
    /// The request exceeds half the ring capacity (or is negative).
    ///
    /// Capping requests at `cap / 2` guarantees that flipping to the head of
    /// the ring always yields enough room for any admissible request once the
    /// ring drains.
    #[error("requested region exceeds half the ring capacity")]
    Oversize,
    /// Non-blocking reservation (`want == 0`) found nothing usable.
    #[error("no contiguous region available")]
    Insufficient,
    /// The ring was canceled.
    #[error("ring canceled")]
    Canceled,
}

/// Failure modes of a region commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommitError {
    /// The commit size exceeds the granted region (or no grant is pending).
    #[error("commit exceeds granted region")]
    ExceedsGrant,
    /// The ring was canceled.
    #[error("ring canceled")]
    Canceled,
}

/// Writer-side diagnostic counters, sampled with relaxed loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    /// Number of times the writer parked waiting for the reader.
    pub wait_count: i32,
    /// Number of reservation attempts that found too little room.
    pub insufficient: i32,
    /// Highest wrap boundary ever published to the reader.
    pub max_read_end_index: i32,
}
