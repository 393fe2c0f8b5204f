//! Lock-free MPSC slot queue for in-process (inter-thread) communication.
//!
//! A bounded queue over a heap-allocated ring where any number of producers
//! deposit single elements and one consumer drains contiguous runs.
//!
//! # Overview
//!
//! - [`Producer`] - Write end; clone it freely, one handle per producer thread
//! - [`Consumer`] - Read end (single consumer per queue)
//! - Lock-free hot path; blocking variants park on a futex, never a mutex
//!
//! # Example
//!
//! ```
//! use handoff::sync::mpsc;
//!
//! let (producer, mut consumer) = mpsc::channel::<u64, 1024>();
//!
//! // Producer threads
//! producer.push(42).expect("canceled");
//!
//! // Consumer thread
//! let run = consumer.peek(8).expect("canceled");
//! assert_eq!(run, &[42]);
//! consumer.commit_pop();
//! ```
//!
//! # Consuming
//!
//! [`Consumer::peek`] exposes a run of ready elements without consuming
//! them; [`Consumer::commit_pop`] retires the run. Peeks without an
//! intervening commit return the same run, so a consumer that fails mid-run
//! can retry from the same data.

use std::cell::Cell;
use std::marker::PhantomData;
use std::slice;
use std::sync::Arc;

use crate::Canceled;
use crate::mpsc::ring::{PeekGrant, Ring};
use crate::mpsc::{PeekError, PushError, WriteStats};

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end of the MPSC queue.
///
/// Clone one handle per producer thread, or share a single handle by
/// reference; pushes from any number of threads arbitrate through the claim
/// CAS.
pub struct Producer<T: Copy + Send, const N: usize> {
    ring: Arc<Ring<T, N>>,
}

impl<T: Copy + Send, const N: usize> Clone for Producer<T, N> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

/// Read end of the MPSC queue.
///
/// Only one consumer exists per queue; the handle is [`Send`] but not
/// [`Sync`], and peeks borrow the handle mutably so a peeked run cannot
/// outlive its commit.
pub struct Consumer<T: Copy + Send, const N: usize> {
    ring: Arc<Ring<T, N>>,
    grant: Option<PeekGrant>,
    _unsync: PhantomUnsync,
}

struct CapacityCheck<const N: usize>;

impl<const N: usize> CapacityCheck<N> {
    /// Compile-time assertion that the ring has room for the full/empty
    /// distinction.
    const OK: () = assert!(N >= 2, "queue capacity must be at least 2");
}

/// Creates a new MPSC channel with capacity `N` (at most `N - 1` elements
/// in flight).
///
/// Returns a `(Producer, Consumer)` pair. Clone the producer for additional
/// producer threads.
///
/// # Panics
///
/// Fails to compile if `N < 2`.
#[must_use]
pub fn channel<T: Copy + Send, const N: usize>() -> (Producer<T, N>, Consumer<T, N>) {
    let () = CapacityCheck::<N>::OK;

    let ring = Arc::new(Ring::new());

    let producer = Producer {
        ring: Arc::clone(&ring),
    };
    let consumer = Consumer {
        ring,
        grant: None,
        _unsync: PhantomData,
    };

    (producer, consumer)
}

impl<T: Copy + Send, const N: usize> Producer<T, N> {
    /// Deposits one element, parking while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`Canceled`] if the queue was canceled; the element is lost.
    #[inline]
    pub fn push(&self, value: T) -> Result<(), Canceled> {
        // SAFETY: the producer side tolerates any number of concurrent
        // callers; the ring lives as long as this handle.
        unsafe { self.ring.push(value, true) }.map_err(|_| Canceled)
    }

    /// Deposits one element without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`PushError::Full`] when the queue holds `N - 1` elements,
    /// [`PushError::Canceled`] after cancellation.
    #[inline]
    pub fn try_push(&self, value: T) -> Result<(), PushError> {
        // SAFETY: as in `push`.
        unsafe { self.ring.push(value, false) }
    }

    /// Producer-side diagnostic counters.
    #[must_use]
    pub fn write_stats(&self) -> WriteStats {
        self.ring.write_stats()
    }

    /// Cancels the queue: every current and future operation on any handle
    /// fails with a canceled error and all parked threads are released.
    /// Idempotent.
    pub fn cancel(&self) {
        self.ring.cancel();
    }
}

impl<T: Copy + Send, const N: usize> Consumer<T, N> {
    /// Exposes up to `max` contiguous ready elements, parking while the
    /// queue is empty.
    ///
    /// The run stays visible to subsequent peeks until [`Self::commit_pop`]
    /// retires it.
    ///
    /// # Errors
    ///
    /// Returns [`Canceled`] if the queue was canceled.
    pub fn peek(&mut self, max: usize) -> Result<&[T], Canceled> {
        // SAFETY: &mut self plus !Sync make this the only consumer call.
        let (ptr, len, grant) = unsafe { self.ring.peek(max, true) }.map_err(|_| Canceled)?;
        self.grant = Some(grant);
        // SAFETY: the run is published and stays untouched until commit_pop,
        // which needs &mut self and therefore the end of this borrow.
        Ok(unsafe { slice::from_raw_parts(ptr, len) })
    }

    /// Non-blocking variant of [`Self::peek`].
    ///
    /// # Errors
    ///
    /// Returns [`PeekError::Empty`] when nothing is ready,
    /// [`PeekError::Canceled`] after cancellation.
    pub fn try_peek(&mut self, max: usize) -> Result<&[T], PeekError> {
        // SAFETY: as in `peek`.
        let (ptr, len, grant) = unsafe { self.ring.peek(max, false) }?;
        self.grant = Some(grant);
        // SAFETY: as in `peek`.
        Ok(unsafe { slice::from_raw_parts(ptr, len) })
    }

    /// Retires the run reported by the most recent peek and wakes one
    /// producer parked on a full queue. A no-op without a pending peek.
    pub fn commit_pop(&mut self) {
        if let Some(grant) = self.grant.take() {
            // SAFETY: single consumer; the grant came from our own peek.
            unsafe { self.ring.commit_pop(grant) };
        }
    }

    /// Cancels the queue. See [`Producer::cancel`].
    pub fn cancel(&self) {
        self.ring.cancel();
    }
}
