//! Bounded, wait-capable, lock-free ring buffers for intra-process handoff.
//!
//! This crate provides two sibling primitives for producer/consumer handoff
//! between OS threads on shared-memory multiprocessors:
//!
//! - [`sync::mpsc`] - a multi-producer / single-consumer queue of fixed-size
//!   slots. Each push deposits one element; the consumer peeks a contiguous
//!   run of ready elements and commits consumption in bulk.
//! - [`sync::spsc`] - a single-producer / single-consumer ring that hands the
//!   underlying storage directly to the caller for reading and writing,
//!   never copying through an intermediate buffer.
//!
//! Both are lock-free in the hot path and park on futex-backed atomic waits
//! when full or empty. Both support a sticky, idempotent cancellation that
//! releases every parked thread.
//!
//! # Example
//!
//! ```
//! let (producer, mut consumer) = handoff::sync::mpsc::channel::<u64, 16>();
//!
//! producer.push(7).unwrap();
//! producer.push(8).unwrap();
//!
//! let run = consumer.peek(16).unwrap();
//! assert_eq!(run, &[7, 8]);
//! consumer.commit_pop();
//! ```

use thiserror::Error;

pub mod mpsc;
pub mod spsc;
pub mod sync;
pub mod trace;
pub(crate) mod wait;

/// The ring was canceled.
///
/// Cancellation is sticky: once any endpoint (or a [`sync::spsc::Canceller`])
/// cancels a ring, every subsequent operation on it fails with this error and
/// every parked thread is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("ring canceled")]
pub struct Canceled;
