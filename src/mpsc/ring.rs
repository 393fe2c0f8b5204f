//! Core lock-free MPSC slot ring algorithm.
//!
//! # Algorithm
//!
//! Three 64-bit index words drive the protocol:
//!
//! - `write_index`: next slot a producer will claim. Producers race on it
//!   with a strong CAS; the winner owns the slot exclusively.
//! - `read_max_index`: high-water mark of slots fully written and safe to
//!   consume. A producer that claimed slot `k` publishes `k + 1` here only
//!   after the producer of slot `k - 1` published `k`, so the mark advances
//!   strictly in claim order and the consumer always peeks a contiguous run.
//! - `read_index`: first slot not yet consumed. Written only by the consumer.
//!
//! `new_write_index == read_index` means full: one slot is always sacrificed
//! so full and empty are distinguishable. A negative value in any index word
//! means the ring is canceled; cancellation is sticky and releases every
//! parked thread.
//!
//! # Safety
//!
//! The producer side is safe for any number of concurrent callers. The
//! consumer side requires exactly one caller at a time (single consumer
//! invariant), which [`crate::sync::mpsc`] enforces at the type level.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicI32, Ordering};

use super::{PeekError, PushError, WriteStats};
use crate::trace::{debug, trace};
use crate::wait::WaitableI64;

/// Producer-written words, isolated from the consumer's cache line.
#[repr(C)]
#[repr(align(64))]
struct ProducerSide {
    /// Next slot to claim. Negative means canceled.
    write_index: WaitableI64,

    /// First-not-ready slot boundary; slots below it are safe to consume.
    /// Advanced by producers in claim order, waited on by the consumer.
    read_max_index: WaitableI64,

    /// High-water mark of the queue size. Relaxed, diagnostic only.
    max_queued: AtomicI32,

    /// Number of times a producer parked on a full ring. Relaxed.
    wait_count: AtomicI32,
}

impl ProducerSide {
    const fn new() -> Self {
        Self {
            write_index: WaitableI64::new(0),
            read_max_index: WaitableI64::new(0),
            max_queued: AtomicI32::new(0),
            wait_count: AtomicI32::new(0),
        }
    }
}

/// Consumer-written word on its own cache line.
#[repr(C)]
#[repr(align(64))]
struct ConsumerSide {
    /// First slot not yet consumed. Written only by the consumer,
    /// waited on by producers blocked on a full ring.
    read_index: WaitableI64,
}

impl ConsumerSide {
    const fn new() -> Self {
        Self {
            read_index: WaitableI64::new(0),
        }
    }
}

/// Snapshot of a successful peek, consumed by the matching [`Ring::commit_pop`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct PeekGrant {
    expected: i64,
    desired: i64,
}

/// Core MPSC slot ring.
#[repr(C)]
pub(crate) struct Ring<T, const N: usize> {
    producer: ProducerSide,
    consumer: ConsumerSide,
    buffer: [UnsafeCell<MaybeUninit<T>>; N],
}

// SAFETY: Ring is Send/Sync because concurrent access is mediated by atomics:
// - Producers resolve slot ownership via strong CAS on write_index
// - Buffer slots are written only between a producer's claim and its
//   publication on read_max_index, and read only below read_max_index
// - read_max_index (release) / acquire loads form the producer->consumer edge
unsafe impl<T: Send, const N: usize> Send for Ring<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for Ring<T, N> {}

impl<T: Copy, const N: usize> Ring<T, N> {
    pub(crate) fn new() -> Self {
        Self {
            producer: ProducerSide::new(),
            consumer: ConsumerSide::new(),
            // SAFETY: an array of UnsafeCell<MaybeUninit<T>> requires no
            // initialization; every slot is written before it is exposed.
            buffer: unsafe { MaybeUninit::uninit().assume_init() },
        }
    }

    /// Deposits one element, claiming a slot and publishing it in claim order.
    ///
    /// With `block`, parks on `read_index` while the ring is full and only
    /// fails on cancellation. Without, fails immediately with
    /// [`PushError::Full`].
    ///
    /// # Safety
    ///
    /// Callers may race freely; the claim CAS arbitrates. The ring must be
    /// alive for the duration of the call.
    pub(crate) unsafe fn push(&self, value: T, block: bool) -> Result<(), PushError> {
        let n = N as i64;
        let (write_index, new_write_index, queue_size) = loop {
            let write_index = self.producer.write_index.load(Ordering::Relaxed);
            if write_index < 0 {
                return Err(PushError::Canceled);
            }
            let read_index = self.consumer.read_index.load(Ordering::Acquire);
            if read_index < 0 {
                return Err(PushError::Canceled);
            }
            let new_write_index = (write_index + 1) % n;
            if new_write_index == read_index {
                if !block {
                    return Err(PushError::Full);
                }
                trace!(read_index, "producer parking on full ring");
                self.producer.wait_count.fetch_add(1, Ordering::Relaxed);
                self.consumer.read_index.wait(read_index);
                continue;
            }

            let queue_size = ((n + new_write_index - read_index) % n) as i32;

            // A strong CAS failure here can only mean another producer won
            // the claim, so the whole observation must be redone.
            if self
                .producer
                .write_index
                .compare_exchange(
                    write_index,
                    new_write_index,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break (write_index, new_write_index, queue_size);
            }
        };

        // SAFETY: the claim CAS makes slot `write_index` exclusively ours
        // until we publish on read_max_index below, and the full check keeps
        // the consumer away from it. write_index is in [0, N).
        unsafe {
            (*self.buffer[write_index as usize].get()).write(value);
        }

        let mut max_queued = self.producer.max_queued.load(Ordering::Relaxed);
        while max_queued < queue_size {
            match self.producer.max_queued.compare_exchange_weak(
                max_queued,
                queue_size,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => max_queued = current,
            }
        }

        // Publish readiness in claim order: this CAS only succeeds once the
        // producer of the previous slot has advanced read_max_index to our
        // claimed index. The release ordering pairs with the consumer's
        // acquire load to make the slot write visible.
        loop {
            match self.producer.read_max_index.compare_exchange_weak(
                write_index,
                new_write_index,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.producer.read_max_index.notify_one();
                    return Ok(());
                }
                Err(observed) if observed < 0 => return Err(PushError::Canceled),
                Err(_) => {}
            }
        }
    }

    /// Exposes up to `max` contiguous ready elements without consuming them.
    ///
    /// With `block`, parks on `read_max_index` while the ring is empty.
    /// At a wrap boundary the run is clipped to the end of the buffer; the
    /// remainder is returned by the peek after the next commit.
    ///
    /// # Safety
    ///
    /// Single consumer only. The returned pointer is valid for `len` reads
    /// until the grant is committed.
    pub(crate) unsafe fn peek(
        &self,
        max: usize,
        block: bool,
    ) -> Result<(*const T, usize, PeekGrant), PeekError> {
        let n = N as i64;
        let read_index = self.consumer.read_index.load(Ordering::Relaxed);
        if read_index < 0 {
            return Err(PeekError::Canceled);
        }
        let read_max_index = loop {
            let read_max_index = self.producer.read_max_index.load(Ordering::Acquire);
            if read_max_index < 0 {
                return Err(PeekError::Canceled);
            }
            if read_max_index != read_index {
                break read_max_index;
            }
            if !block {
                return Err(PeekError::Empty);
            }
            trace!(read_index, "consumer parking on empty ring");
            self.producer.read_max_index.wait(read_max_index);
        };

        let avail = if read_index <= read_max_index {
            read_max_index - read_index
        } else {
            n - read_index
        };
        let len = avail.min(max as i64);

        // SAFETY: [read_index, read_index + len) lies below read_max_index,
        // so every slot in the run was initialized by a producer before its
        // release publication. UnsafeCell<MaybeUninit<T>> is layout-identical
        // to T, so the run reads as a contiguous [T].
        let ptr = unsafe { self.buffer.as_ptr().add(read_index as usize) }.cast::<T>();
        let grant = PeekGrant {
            expected: read_index,
            desired: (read_index + len) % n,
        };
        Ok((ptr, len as usize, grant))
    }

    /// Commits consumption of the run reported by the peek that produced
    /// `grant`, then wakes one producer parked on a full ring.
    ///
    /// # Safety
    ///
    /// Single consumer only; `grant` must come from the most recent peek.
    pub(crate) unsafe fn commit_pop(&self, grant: PeekGrant) {
        loop {
            match self.consumer.read_index.compare_exchange_weak(
                grant.expected,
                grant.desired,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.consumer.read_index.notify_one();
                    return;
                }
                Err(observed) if observed < 0 => return,
                Err(_) => {}
            }
        }
    }

    /// Poisons all three index words to `-1` and releases every parked
    /// thread. Idempotent; safe to call from any thread.
    pub(crate) fn cancel(&self) {
        loop {
            let index = self.producer.write_index.load(Ordering::Relaxed);
            if index < 0 {
                break;
            }
            if self
                .producer
                .write_index
                .compare_exchange(index, -1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
        loop {
            let index = self.producer.read_max_index.load(Ordering::Relaxed);
            if index < 0 {
                break;
            }
            if self
                .producer
                .read_max_index
                .compare_exchange(index, -1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.producer.read_max_index.notify_all();
                break;
            }
        }
        loop {
            let index = self.consumer.read_index.load(Ordering::Relaxed);
            if index < 0 {
                break;
            }
            if self
                .consumer
                .read_index
                .compare_exchange(index, -1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.consumer.read_index.notify_all();
                break;
            }
        }
        debug!("mpsc ring canceled");
    }

    pub(crate) fn write_stats(&self) -> WriteStats {
        WriteStats {
            max_queued: self.producer.max_queued.load(Ordering::Relaxed),
            wait_count: self.producer.wait_count.load(Ordering::Relaxed),
        }
    }
}
