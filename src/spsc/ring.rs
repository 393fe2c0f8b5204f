//! Core lock-free SPSC zero-copy ring algorithm.
//!
//! # Protocol
//!
//! Two atomic words drive the handoff:
//!
//! - `write_ctx`: a 64-bit word packing `(write_index, read_end_index)`,
//!   both `i32`. Written only by the writer (and by `cancel`). The pair must
//!   be published in one compare-exchange: when the writer flips to the head
//!   of the ring, the reader has to observe the new `write_index` and the
//!   wrap boundary `read_end_index` together, or it would mis-compute
//!   availability from a torn pair.
//! - `read_index`: the reader's position. Written only by the reader (and by
//!   `cancel`).
//!
//! The ring is on the *front side* while `read_index <= write_index`: valid
//! data is `[read_index, write_index)` and `read_end_index` is don't-care.
//! Once the writer wraps (*back side*, `write_index < read_index`), valid
//! data is `[read_index, read_end_index)` followed by `[0, write_index)`,
//! and `read_end_index` tells the reader where the tail region ends.
//!
//! `read_index == write_index` always means empty. Back-side fullness is
//! `read_index - 1 == write_index`; one element of slack is never handed out
//! so full and empty stay distinguishable.
//!
//! Requests are capped at `cap / 2`, which guarantees a flip always opens
//! enough room for any admissible request once the reader drains.
//!
//! A negative `write_index` or `read_index` means canceled; cancellation is
//! sticky and releases both sides.
//!
//! # Safety
//!
//! Exactly one writer and one reader at a time. [`crate::sync::spsc`]
//! enforces this at the type level; the raw methods here document it per
//! call.

use std::alloc::{self, Layout};
use std::sync::atomic::{AtomicI32, Ordering};

use super::{CommitError, GrantError, WriterStats};
use crate::trace::{debug, trace};
use crate::wait::{WaitableI32, WaitableU64};

#[inline]
const fn encode_ctx(write_index: i32, read_end_index: i32) -> u64 {
    (write_index as u32 as u64) | ((read_end_index as u32 as u64) << 32)
}

#[inline]
const fn decode_ctx(ctx: u64) -> (i32, i32) {
    (ctx as u32 as i32, (ctx >> 32) as u32 as i32)
}

#[inline]
const fn is_front_side(write_index: i32, read_index: i32) -> bool {
    read_index <= write_index
}

/// Writer-side availability. Returns `(avail, flip)`; with `flip` the writer
/// should move to index 0 and publish the old `write_index` as the wrap
/// boundary.
fn check_write_available(write_index: i32, read_index: i32, cap: i32) -> (i32, bool) {
    if is_front_side(write_index, read_index) {
        let avail = cap - write_index;
        let head_room = read_index - 1;
        if avail < head_room {
            return (head_room, true);
        }
        (avail, false)
    } else {
        (read_index - write_index - 1, false)
    }
}

/// Reader-side availability. Returns `(avail, flip)`; with `flip` the tail
/// region is exhausted and the reader should continue from index 0, where
/// `[0, write_index)` is valid.
fn check_read_available(write_index: i32, read_end_index: i32, read_index: i32) -> (i32, bool) {
    // The writer may still think it is on the back side while the reader has
    // already flipped to the front, so both sides are classified from the
    // reader's position.
    if is_front_side(write_index, read_index) {
        (write_index - read_index, false)
    } else {
        let avail = read_end_index - read_index;
        debug_assert!(avail >= 0);
        if avail == 0 {
            return (write_index, true);
        }
        (avail, false)
    }
}

fn is_empty(write_index: i32, read_end_index: i32, read_index: i32) -> bool {
    if is_front_side(write_index, read_index) {
        write_index == read_index
    } else {
        read_end_index == read_index
    }
}

/// Writer-published context on its own cache line.
#[repr(C)]
#[repr(align(64))]
struct WriterSide {
    /// Packed `(write_index, read_end_index)`. Waited on by the reader.
    write_ctx: WaitableU64,
}

/// Reader-published position on its own cache line.
#[repr(C)]
#[repr(align(64))]
struct ReaderSide {
    /// Reader position. Waited on by the writer.
    read_index: WaitableI32,
}

/// Relaxed diagnostic counters, off the hot words' cache lines.
struct Diag {
    wait_count: AtomicI32,
    insufficient: AtomicI32,
    max_read_end_index: AtomicI32,
    /// Number of threads currently parked on either word.
    waiters: AtomicI32,
}

/// Snapshot of a successful write reservation, consumed by the matching
/// [`Ring::move_write_ptr`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct WriteGrant {
    /// `write_ctx` as observed at reservation; expected value of the commit CAS.
    ctx: u64,
    /// Start of the granted region (index 0 after a flip).
    write_index: i32,
    read_end_index: i32,
    read_index: i32,
    pub(crate) avail: i32,
}

/// Snapshot of a successful read reservation, consumed by the matching
/// [`Ring::move_read_ptr`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadGrant {
    /// `read_index` as observed at reservation; expected value of the commit CAS.
    read_index: i32,
    /// Start of the granted region (index 0 after a flip).
    read_start: i32,
    write_index: i32,
    read_end_index: i32,
    pub(crate) avail: i32,
}

/// Core SPSC zero-copy ring over owned, aligned heap storage.
pub(crate) struct Ring<T, const ALIGN: usize> {
    writer: WriterSide,
    reader: ReaderSide,
    diag: Diag,
    buf: *mut T,
    cap: i32,
    layout: Layout,
}

// SAFETY: Ring is Send/Sync because concurrent access is mediated by the
// write_ctx/read_index protocol: the granted writer and reader regions never
// overlap, and the release-CAS/acquire-load pairs on the two words order the
// buffer accesses on both sides.
unsafe impl<T: Send, const ALIGN: usize> Send for Ring<T, ALIGN> {}
unsafe impl<T: Send, const ALIGN: usize> Sync for Ring<T, ALIGN> {}

impl<T: Copy + Default, const ALIGN: usize> Ring<T, ALIGN> {
    /// Allocates a ring of `capacity` elements, aligned to at least `ALIGN`,
    /// with every slot default-initialized.
    ///
    /// # Panics
    ///
    /// Panics if `capacity < 2`, if `capacity` overflows `i32`, if `ALIGN`
    /// is not a power of two, or if `T` is zero-sized.
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "ring capacity must be at least 2");
        assert!(
            capacity <= i32::MAX as usize,
            "ring capacity must fit in i32"
        );
        assert!(ALIGN.is_power_of_two(), "ALIGN must be a power of two");
        assert!(size_of::<T>() > 0, "zero-sized elements are not supported");

        let align = ALIGN.max(align_of::<T>());
        let layout = Layout::from_size_align(capacity * size_of::<T>(), align)
            .expect("ring storage layout");
        // SAFETY: layout has non-zero size (capacity >= 2, T non-zero-sized).
        let buf = unsafe { alloc::alloc(layout) }.cast::<T>();
        if buf.is_null() {
            alloc::handle_alloc_error(layout);
        }
        for i in 0..capacity {
            // SAFETY: i < capacity, within the fresh allocation.
            unsafe { buf.add(i).write(T::default()) };
        }

        Self {
            writer: WriterSide {
                write_ctx: WaitableU64::new(encode_ctx(0, 0)),
            },
            reader: ReaderSide {
                read_index: WaitableI32::new(0),
            },
            diag: Diag {
                wait_count: AtomicI32::new(0),
                insufficient: AtomicI32::new(0),
                max_read_end_index: AtomicI32::new(0),
                waiters: AtomicI32::new(0),
            },
            buf,
            cap: capacity as i32,
            layout,
        }
    }
}

impl<T, const ALIGN: usize> Ring<T, ALIGN> {
    /// Reserves a contiguous writable region of at least `want` elements.
    ///
    /// `want == 0` is the non-blocking convention: returns whatever is
    /// available, or [`GrantError::Insufficient`] if nothing is. `want > 0`
    /// parks on `read_index` until the reader frees enough room.
    ///
    /// The caller may fill up to `avail` elements starting at the returned
    /// pointer, then commit with [`Ring::move_write_ptr`].
    ///
    /// # Safety
    ///
    /// Single writer only. The pointer is valid for `avail` writes until the
    /// grant is committed or the ring is dropped.
    pub(crate) unsafe fn get_write_ptr(
        &self,
        want: i32,
    ) -> Result<(*mut T, i32, WriteGrant), GrantError> {
        if want > self.cap / 2 || want < 0 {
            return Err(GrantError::Oversize);
        }
        let mut ctx = self.writer.write_ctx.load(Ordering::Relaxed);
        let (mut write_index, mut read_end_index) = decode_ctx(ctx);
        if write_index < 0 {
            return Err(GrantError::Canceled);
        }
        loop {
            // Acquire pairs with the reader's release commit: room the reader
            // freed is fully consumed before we hand it out again.
            let read_index = self.reader.read_index.load(Ordering::Acquire);
            if read_index < 0 {
                return Err(GrantError::Canceled);
            }

            let (avail, flip) = check_write_available(write_index, read_index, self.cap);
            let (granted_index, granted_end) = if flip {
                (0, write_index)
            } else {
                (write_index, read_end_index)
            };
            if avail > 0 && want <= avail {
                let grant = WriteGrant {
                    ctx,
                    write_index: granted_index,
                    read_end_index: granted_end,
                    read_index,
                    avail,
                };
                // SAFETY: granted_index is in [0, cap).
                let ptr = unsafe { self.buf.add(granted_index as usize) };
                return Ok((ptr, avail, grant));
            }
            if flip {
                // Publish the flip before parking: moving off the tail lets
                // the reader drain it and free the head for us.
                let flipped = encode_ctx(granted_index, granted_end);
                if !self.update_write_ctx(ctx, flipped) {
                    return Err(GrantError::Canceled);
                }
                ctx = flipped;
                write_index = granted_index;
                read_end_index = granted_end;
            }
            self.diag.insufficient.fetch_add(1, Ordering::Relaxed);
            if want == 0 {
                return Err(GrantError::Insufficient);
            }
            trace!(read_index, want, "writer parking");
            self.diag.wait_count.fetch_add(1, Ordering::Relaxed);
            self.diag.waiters.fetch_add(1, Ordering::Relaxed);
            self.reader.read_index.wait(read_index);
            self.diag.waiters.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Commits that `written` elements of the granted region were filled.
    ///
    /// # Safety
    ///
    /// Single writer only; `grant` must come from the most recent
    /// reservation and must not be committed twice.
    pub(crate) unsafe fn move_write_ptr(
        &self,
        grant: &WriteGrant,
        written: i32,
    ) -> Result<i32, CommitError> {
        if written < 0 || written > grant.avail {
            return Err(CommitError::ExceedsGrant);
        }
        // No modular wrap here: wrapping happens only through a flip.
        let new_write_index = grant.write_index + written;
        let new_read_end_index = if is_front_side(new_write_index, grant.read_index) {
            // Front side: the boundary is don't-care but is kept equal to the
            // write index so back-side checks degenerate correctly.
            new_write_index
        } else {
            grant.read_end_index
        };
        self.diag
            .max_read_end_index
            .fetch_max(grant.read_end_index, Ordering::Relaxed);
        let new_ctx = encode_ctx(new_write_index, new_read_end_index);
        if !self.update_write_ctx(grant.ctx, new_ctx) {
            return Err(CommitError::Canceled);
        }
        Ok(written)
    }

    /// Reserves a contiguous readable region of at least `want` elements.
    ///
    /// Mirrors [`Ring::get_write_ptr`]: `want == 0` never blocks, `want > 0`
    /// parks on `write_ctx` until the writer publishes enough data.
    ///
    /// # Safety
    ///
    /// Single reader only. The pointer is valid for `avail` reads until the
    /// grant is committed or the ring is dropped.
    pub(crate) unsafe fn get_read_ptr(
        &self,
        want: i32,
    ) -> Result<(*const T, i32, ReadGrant), GrantError> {
        if want > self.cap / 2 || want < 0 {
            return Err(GrantError::Oversize);
        }
        let mut read_index = self.reader.read_index.load(Ordering::Relaxed);
        if read_index < 0 {
            return Err(GrantError::Canceled);
        }
        loop {
            // Acquire pairs with the writer's release commit: the data behind
            // the published indices is fully written before we expose it.
            let ctx = self.writer.write_ctx.load(Ordering::Acquire);
            let (write_index, read_end_index) = decode_ctx(ctx);
            if write_index < 0 {
                return Err(GrantError::Canceled);
            }

            let (avail, flip) = check_read_available(write_index, read_end_index, read_index);
            let read_start = if flip { 0 } else { read_index };
            if avail > 0 && want <= avail {
                let grant = ReadGrant {
                    read_index,
                    read_start,
                    write_index,
                    read_end_index,
                    avail,
                };
                // SAFETY: read_start is in [0, cap).
                let ptr = unsafe { self.buf.add(read_start as usize) }.cast_const();
                return Ok((ptr, avail, grant));
            }
            if flip {
                // Publish the flip before parking: leaving the exhausted tail
                // tells the writer the head is being drained.
                if !self.update_read_index(read_index, read_start) {
                    return Err(GrantError::Canceled);
                }
                read_index = read_start;
            }
            if want == 0 {
                return Err(GrantError::Insufficient);
            }
            trace!(read_index, want, "reader parking");
            self.diag.waiters.fetch_add(1, Ordering::Relaxed);
            self.writer.write_ctx.wait(ctx);
            self.diag.waiters.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Commits that `read` elements of the granted region were consumed.
    ///
    /// # Safety
    ///
    /// Single reader only; `grant` must come from the most recent
    /// reservation and must not be committed twice.
    pub(crate) unsafe fn move_read_ptr(
        &self,
        grant: &ReadGrant,
        read: i32,
    ) -> Result<i32, CommitError> {
        if read < 0 || read > grant.avail {
            return Err(CommitError::ExceedsGrant);
        }
        let mut new_read_index = grant.read_start + read;
        if !is_front_side(grant.write_index, grant.read_start)
            && grant.read_end_index <= new_read_index
        {
            // Tail region fully consumed: continue from the head.
            new_read_index = 0;
        }
        if !self.update_read_index(grant.read_index, new_read_index) {
            return Err(CommitError::Canceled);
        }
        Ok(read)
    }

    /// Blocks the writer until the reader has consumed everything published,
    /// or the ring is canceled.
    pub(crate) fn wait_until_empty_for_writer(&self) {
        let ctx = self.writer.write_ctx.load(Ordering::Relaxed);
        let (write_index, read_end_index) = decode_ctx(ctx);
        if write_index < 0 {
            return;
        }
        loop {
            let read_index = self.reader.read_index.load(Ordering::Acquire);
            if read_index < 0 {
                return;
            }
            if is_empty(write_index, read_end_index, read_index) {
                return;
            }
            self.diag.waiters.fetch_add(1, Ordering::Relaxed);
            self.reader.read_index.wait(read_index);
            self.diag.waiters.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Poisons both words to `-1` and releases every parked thread.
    /// Idempotent; safe to call from any thread.
    pub(crate) fn cancel(&self) {
        loop {
            let ctx = self.writer.write_ctx.load(Ordering::Relaxed);
            if decode_ctx(ctx).0 < 0 {
                break;
            }
            if self
                .writer
                .write_ctx
                .compare_exchange(ctx, encode_ctx(-1, -1), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.writer.write_ctx.notify_all();
                break;
            }
        }
        loop {
            let index = self.reader.read_index.load(Ordering::Relaxed);
            if index < 0 {
                break;
            }
            if self
                .reader
                .read_index
                .compare_exchange(index, -1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.reader.read_index.notify_all();
                break;
            }
        }
        debug!("spsc ring canceled");
    }

    pub(crate) fn writer_stats(&self) -> WriterStats {
        WriterStats {
            wait_count: self.diag.wait_count.load(Ordering::Relaxed),
            insufficient: self.diag.insufficient.load(Ordering::Relaxed),
            max_read_end_index: self.diag.max_read_end_index.load(Ordering::Relaxed),
        }
    }

    /// Number of threads currently parked on the ring.
    #[cfg(test)]
    pub(crate) fn waiters(&self) -> i32 {
        self.diag.waiters.load(Ordering::Relaxed)
    }

    /// Weak-CAS loop on `write_ctx`; `false` means the ring was canceled.
    fn update_write_ctx(&self, current: u64, new: u64) -> bool {
        loop {
            match self.writer.write_ctx.compare_exchange_weak(
                current,
                new,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                // Only cancel writes this word from under the writer.
                Err(observed) if decode_ctx(observed).0 < 0 => return false,
                Err(_) => {}
            }
        }
        self.writer.write_ctx.notify_one();
        true
    }

    /// Weak-CAS loop on `read_index`; `false` means the ring was canceled.
    fn update_read_index(&self, current: i32, new: i32) -> bool {
        loop {
            match self.reader.read_index.compare_exchange_weak(
                current,
                new,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) if observed < 0 => return false,
                Err(_) => {}
            }
        }
        self.reader.read_index.notify_one();
        true
    }
}

impl<T, const ALIGN: usize> Drop for Ring<T, ALIGN> {
    fn drop(&mut self) {
        self.cancel();
        // SAFETY: buf was allocated with this layout in `new` and elements
        // are Copy, so deallocating without drops is sound.
        unsafe { alloc::dealloc(self.buf.cast::<u8>(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    const CAP: i32 = 64;

    type TestRing = Ring<u8, 8>;

    /// Reader-visible meta-states of the ring.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum State {
        /// Empty, `r == 0`.
        E0,
        /// Empty, `r > 0`.
        E1,
        /// Full, `r == 0`, `w == cap`.
        F0,
        /// Full, `r > 0`, `w == r - 1`.
        F1,
        /// Front side, `r == 0`, `r < w`.
        X0,
        /// Front side, `r > 0`, `r < w`.
        X1,
        /// Back side, `w == 0`.
        Y0,
        /// Back side, `w > 0`, `w < r`.
        Y1,
    }

    fn make() -> TestRing {
        Ring::new(CAP as usize)
    }

    fn set_state(ring: &TestRing, write_index: i32, read_end_index: i32, read_index: i32) {
        ring.writer
            .write_ctx
            .store(encode_ctx(write_index, read_end_index), Ordering::Relaxed);
        ring.reader.read_index.store(read_index, Ordering::Relaxed);
    }

    fn classify(ring: &TestRing) -> State {
        let (write_index, _) = decode_ctx(ring.writer.write_ctx.load(Ordering::Relaxed));
        let read_index = ring.reader.read_index.load(Ordering::Relaxed);

        if read_index <= write_index {
            if write_index == read_index {
                return if read_index == 0 { State::E0 } else { State::E1 };
            }
            if read_index == 0 {
                return if write_index == CAP {
                    State::F0
                } else {
                    State::X0
                };
            }
            return State::X1;
        }
        if read_index - 1 == write_index {
            return State::F1;
        }
        if write_index == 0 {
            return State::Y0;
        }
        State::Y1
    }

    // State builders, mirroring the reachable configurations of the ring.
    // `read_end_index` is don't-care on the front side and is pinned to the
    // values the writer would actually have published.

    fn make_empty0() -> TestRing {
        let ring = make();
        assert_eq!(classify(&ring), State::E0);
        ring
    }

    fn make_empty1(w_avail: i32) -> TestRing {
        let ring = make();
        let w = CAP - w_avail;
        set_state(&ring, w, 0, w);
        assert_eq!(classify(&ring), State::E1);
        ring
    }

    fn make_full0() -> TestRing {
        let ring = make();
        set_state(&ring, CAP, CAP, 0);
        assert_eq!(classify(&ring), State::F0);
        ring
    }

    fn make_full1(r_avail: i32, tail_room: i32) -> TestRing {
        let ring = make();
        let r_end = CAP - tail_room;
        let r = r_end - r_avail;
        let w = r - 1;
        assert!(r > 0);
        set_state(&ring, w, r_end, r);
        assert_eq!(classify(&ring), State::F1);
        ring
    }

    fn make_front0(w_avail: i32) -> TestRing {
        let ring = make();
        set_state(&ring, CAP - w_avail, 0, 0);
        assert_eq!(classify(&ring), State::X0);
        ring
    }

    fn make_front1(w_avail: i32, r_avail: i32) -> TestRing {
        let ring = make();
        let w = CAP - w_avail;
        let r = w - r_avail;
        assert!(r > 0);
        set_state(&ring, w, 0, r);
        assert_eq!(classify(&ring), State::X1);
        ring
    }

    fn make_back0(r_avail: i32) -> TestRing {
        let ring = make();
        let r_end = CAP - 2;
        set_state(&ring, 0, r_end, r_end - r_avail);
        assert_eq!(classify(&ring), State::Y0);
        ring
    }

    fn make_back1(w_avail: i32, r_avail: i32) -> TestRing {
        let ring = make();
        let r_end = CAP - 2;
        let r = r_end - r_avail;
        let w = r - 1 - w_avail;
        assert!(w >= 0 && w < r - 1);
        set_state(&ring, w, r_end, r);
        assert_eq!(classify(&ring), State::Y1);
        ring
    }

    /// Reserve at least `want`, fill `commit` elements, commit. Returns the
    /// granted size.
    fn drive_write(ring: &TestRing, want: i32, commit: i32) -> Result<i32, GrantError> {
        let (ptr, avail, grant) = unsafe { ring.get_write_ptr(want) }?;
        assert!(commit <= avail);
        for i in 0..commit {
            unsafe { ptr.add(i as usize).write(0) };
        }
        assert_eq!(unsafe { ring.move_write_ptr(&grant, commit) }, Ok(commit));
        Ok(avail)
    }

    /// Reserve at least `want`, consume `commit` elements, commit. Returns
    /// the granted size.
    fn drive_read(ring: &TestRing, want: i32, commit: i32) -> Result<i32, GrantError> {
        let (ptr, avail, grant) = unsafe { ring.get_read_ptr(want) }?;
        assert!(commit <= avail);
        assert!(!ptr.is_null());
        assert_eq!(unsafe { ring.move_read_ptr(&grant, commit) }, Ok(commit));
        Ok(avail)
    }

    #[test]
    fn basic_reserve_fill_drain() {
        let ring = make_empty0();
        assert_eq!(
            unsafe { ring.get_read_ptr(CAP / 2 + 1) }.unwrap_err(),
            GrantError::Oversize
        );
        assert_eq!(
            unsafe { ring.get_write_ptr(CAP / 2 + 1) }.unwrap_err(),
            GrantError::Oversize
        );
        assert_eq!(
            unsafe { ring.get_write_ptr(-1) }.unwrap_err(),
            GrantError::Oversize
        );

        assert_eq!(drive_write(&ring, CAP / 2, CAP / 2), Ok(CAP));
        assert_eq!(drive_read(&ring, CAP / 2, CAP / 2), Ok(CAP / 2));
    }

    #[test]
    fn transitions_from_empty0() {
        // E0 -w-> F0: the whole ring in one grant.
        let ring = make_empty0();
        assert_eq!(drive_write(&ring, CAP / 2, CAP), Ok(CAP));
        assert_eq!(classify(&ring), State::F0);

        // E0 -w-> X0.
        let ring = make_empty0();
        assert_eq!(drive_write(&ring, CAP / 2, CAP / 2), Ok(CAP));
        assert_eq!(classify(&ring), State::X0);

        // E0 -r-> nothing to read, non-blocking.
        let ring = make_empty0();
        assert_eq!(
            unsafe { ring.get_read_ptr(0) }.unwrap_err(),
            GrantError::Insufficient
        );
        assert_eq!(classify(&ring), State::E0);
    }

    #[test]
    fn transitions_from_empty1() {
        // E1 -w-> X1, partial fill of the tail.
        let ring = make_empty1(50);
        assert_eq!(drive_write(&ring, 10, 10), Ok(50));
        assert_eq!(classify(&ring), State::X1);

        // E1 -w-> X1, write index reaches cap exactly.
        let ring = make_empty1(50);
        assert_eq!(drive_write(&ring, CAP / 2, 50), Ok(50));
        assert_eq!(classify(&ring), State::X1);

        // E1 -w-> Y1: r == w == cap, the writer flips immediately.
        let ring = make_empty1(0);
        assert_eq!(drive_write(&ring, 10, 10), Ok(CAP - 1));
        assert_eq!(classify(&ring), State::Y1);

        // E1 -w-> F1: flip then fill all slack.
        let ring = make_empty1(0);
        assert_eq!(drive_write(&ring, CAP / 2, CAP - 1), Ok(CAP - 1));
        assert_eq!(classify(&ring), State::F1);

        // Oversize request leaves the state untouched.
        let ring = make_empty1(0);
        assert_eq!(
            unsafe { ring.get_write_ptr(CAP / 2 + 1) }.unwrap_err(),
            GrantError::Oversize
        );
        assert_eq!(classify(&ring), State::E1);

        // E1 -r-> nothing to read, non-blocking.
        let ring = make_empty1(10);
        assert_eq!(
            unsafe { ring.get_read_ptr(0) }.unwrap_err(),
            GrantError::Insufficient
        );
        assert_eq!(classify(&ring), State::E1);
    }

    #[test]
    fn transitions_from_full0() {
        // F0 -w-> no room, non-blocking.
        let ring = make_full0();
        assert_eq!(
            unsafe { ring.get_write_ptr(0) }.unwrap_err(),
            GrantError::Insufficient
        );
        assert_eq!(classify(&ring), State::F0);

        // F0 -r-> E1: drain everything.
        let ring = make_full0();
        assert_eq!(drive_read(&ring, CAP / 2, CAP), Ok(CAP));
        assert_eq!(classify(&ring), State::E1);

        // F0 -r-> X1: partial drain.
        let ring = make_full0();
        assert_eq!(drive_read(&ring, 10, 10), Ok(CAP));
        assert_eq!(classify(&ring), State::X1);

        // Oversize read rejected without state change.
        let ring = make_full0();
        assert_eq!(
            unsafe { ring.get_read_ptr(CAP + 1) }.unwrap_err(),
            GrantError::Oversize
        );
        assert_eq!(classify(&ring), State::F0);
    }

    #[test]
    fn transitions_from_full1() {
        // F1 -w-> no room, non-blocking.
        let ring = make_full1(10, 2);
        assert_eq!(
            unsafe { ring.get_write_ptr(0) }.unwrap_err(),
            GrantError::Insufficient
        );
        assert_eq!(classify(&ring), State::F1);

        // F1 -r-> X0: drain the tail, commit flips to the head.
        let ring = make_full1(10, 2);
        assert_eq!(drive_read(&ring, 10, 10), Ok(10));
        assert_eq!(classify(&ring), State::X0);

        // F1 -r-> X1: tail already exhausted (r == end), reservation flips.
        let ring = make_full1(0, 0);
        assert_eq!(drive_read(&ring, 10, 10), Ok(CAP - 1));
        assert_eq!(classify(&ring), State::X1);

        // F1 -r-> E1: same flip, drain everything.
        let ring = make_full1(0, 0);
        assert_eq!(drive_read(&ring, CAP / 2, CAP - 1), Ok(CAP - 1));
        assert_eq!(classify(&ring), State::E1);

        // Oversize read rejected without state change.
        let ring = make_full1(0, 0);
        assert_eq!(
            unsafe { ring.get_read_ptr(CAP / 2 + 1) }.unwrap_err(),
            GrantError::Oversize
        );
        assert_eq!(classify(&ring), State::F1);
    }

    #[test]
    fn transitions_from_front0() {
        // X0 -w-> F0.
        let ring = make_front0(10);
        assert_eq!(drive_write(&ring, 10, 10), Ok(10));
        assert_eq!(classify(&ring), State::F0);

        // X0 -w-> X0.
        let ring = make_front0(10);
        assert_eq!(drive_write(&ring, 5, 5), Ok(10));
        assert_eq!(classify(&ring), State::X0);

        // X0 -r-> E1.
        let ring = make_front0(10);
        assert_eq!(drive_read(&ring, CAP / 2, CAP - 10), Ok(CAP - 10));
        assert_eq!(classify(&ring), State::E1);

        // X0 -r-> X1.
        let ring = make_front0(10);
        assert_eq!(drive_read(&ring, 1, 1), Ok(CAP - 10));
        assert_eq!(classify(&ring), State::X1);
    }

    #[test]
    fn transitions_from_front1() {
        // X1 -w-> X1.
        let ring = make_front1(40, 10);
        assert_eq!(drive_write(&ring, 5, 5), Ok(40));
        assert_eq!(classify(&ring), State::X1);

        // X1 -w-> X1, write index reaches cap exactly.
        let ring = make_front1(40, 10);
        assert_eq!(drive_write(&ring, CAP / 2, 40), Ok(40));
        assert_eq!(classify(&ring), State::X1);

        // X1 -w-> Y1: w == cap, whole head minus slack is granted.
        let ring = make_front1(0, 20);
        assert_eq!(drive_write(&ring, 10, 10), Ok(CAP - 20 - 1));
        assert_eq!(classify(&ring), State::Y1);

        // X1 -w-> Y1: head larger than the tail triggers the flip early.
        let ring = make_front1(10, 10);
        assert_eq!(drive_write(&ring, CAP / 2, CAP - 22), Ok(CAP - 21));
        assert_eq!(classify(&ring), State::Y1);

        // X1 -w-> F1: flip and fill the head completely.
        let ring = make_front1(10, CAP - 10 - 21);
        assert_eq!(drive_write(&ring, 20, 20), Ok(20));
        assert_eq!(classify(&ring), State::F1);

        // X1 -r-> E1.
        let ring = make_front1(10, 10);
        assert_eq!(drive_read(&ring, 10, 10), Ok(10));
        assert_eq!(classify(&ring), State::E1);

        // X1 -r-> X1.
        let ring = make_front1(10, 10);
        assert_eq!(drive_read(&ring, 1, 1), Ok(10));
        assert_eq!(classify(&ring), State::X1);
    }

    #[test]
    fn transitions_from_back0() {
        // Y0 -w-> F1: fill all back-side slack.
        let ring = make_back0(20);
        let w_avail = CAP - 2 - 20 - 1;
        assert_eq!(drive_write(&ring, CAP / 2, w_avail), Ok(w_avail));
        assert_eq!(classify(&ring), State::F1);

        // Y0 -w-> Y1.
        let ring = make_back0(20);
        assert_eq!(drive_write(&ring, 10, 10), Ok(w_avail));
        assert_eq!(classify(&ring), State::Y1);

        // Y0 -r-> E0: drain the tail, flip back to the untouched head.
        let ring = make_back0(10);
        assert_eq!(drive_read(&ring, 10, 10), Ok(10));
        assert_eq!(classify(&ring), State::E0);

        // Y0 -r-> Y0.
        let ring = make_back0(10);
        assert_eq!(drive_read(&ring, 1, 1), Ok(10));
        assert_eq!(classify(&ring), State::Y0);
    }

    #[test]
    fn transitions_from_back1() {
        // Y1 -w-> Y1.
        let ring = make_back1(20, 20);
        assert_eq!(drive_write(&ring, 10, 10), Ok(20));
        assert_eq!(classify(&ring), State::Y1);

        // Y1 -w-> F1.
        let ring = make_back1(20, 20);
        assert_eq!(drive_write(&ring, 20, 20), Ok(20));
        assert_eq!(classify(&ring), State::F1);

        // Y1 -r-> X0: drain the tail, commit flips to the head.
        let ring = make_back1(20, 20);
        assert_eq!(drive_read(&ring, 20, 20), Ok(20));
        assert_eq!(classify(&ring), State::X0);

        // Y1 -r-> Y1.
        let ring = make_back1(20, 20);
        assert_eq!(drive_read(&ring, 10, 10), Ok(20));
        assert_eq!(classify(&ring), State::Y1);
    }

    #[test]
    fn writer_flip_publishes_wrap_boundary_atomically() {
        // Ten queued elements at [44, 54), ten elements of tail room. The
        // head region (43) beats the tail (10), so the reservation flips and
        // the commit publishes the new write index together with the old
        // high-water mark as the wrap boundary.
        let ring = make_front1(10, 10);

        let (ptr, avail, grant) = unsafe { ring.get_write_ptr(20) }.unwrap();
        assert_eq!(ptr, ring.buf);
        assert_eq!(avail, CAP - 10 - 10 - 1);
        assert_eq!(unsafe { ring.move_write_ptr(&grant, 20) }, Ok(20));

        assert_eq!(classify(&ring), State::Y1);
        let (write_index, read_end_index) =
            decode_ctx(ring.writer.write_ctx.load(Ordering::Relaxed));
        assert_eq!(write_index, 20);
        assert_eq!(read_end_index, CAP - 10);
        assert_eq!(ring.reader.read_index.load(Ordering::Relaxed), 44);
    }

    #[test]
    fn commit_larger_than_grant_is_rejected() {
        let ring = make_empty0();
        let (_, avail, grant) = unsafe { ring.get_write_ptr(8) }.unwrap();
        assert_eq!(
            unsafe { ring.move_write_ptr(&grant, avail + 1) },
            Err(CommitError::ExceedsGrant)
        );
        assert_eq!(
            unsafe { ring.move_write_ptr(&grant, -1) },
            Err(CommitError::ExceedsGrant)
        );
        // The rejected commits left the ring untouched.
        assert_eq!(classify(&ring), State::E0);
    }

    fn spin_until_parked(ring: &TestRing) {
        while ring.waiters() <= 0 {
            std::thread::yield_now();
        }
    }

    #[test]
    fn blocking_read_wakes_on_write() {
        let ring = Arc::new(make_empty0());

        let writer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                spin_until_parked(&ring);
                let (ptr, avail, grant) = unsafe { ring.get_write_ptr(1) }.unwrap();
                assert!(avail > 0);
                unsafe { ptr.write(123) };
                assert_eq!(unsafe { ring.move_write_ptr(&grant, 1) }, Ok(1));
            })
        };

        let (ptr, avail, grant) = unsafe { ring.get_read_ptr(1) }.unwrap();
        assert!(avail > 0);
        assert_eq!(unsafe { ptr.read() }, 123);
        assert_eq!(unsafe { ring.move_read_ptr(&grant, 1) }, Ok(1));

        writer.join().unwrap();
    }

    #[test]
    fn blocking_write_wakes_on_read() {
        let ring = Arc::new(make_empty0());
        let chunk = CAP / 2;

        let reader = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                spin_until_parked(&ring);
                for _ in 0..3 {
                    let (ptr, avail, grant) = unsafe { ring.get_read_ptr(chunk) }.unwrap();
                    assert!(avail >= chunk);
                    for i in 0..chunk {
                        assert_eq!(unsafe { ptr.add(i as usize).read() }, (i + 10) as u8);
                    }
                    assert_eq!(unsafe { ring.move_read_ptr(&grant, chunk) }, Ok(chunk));
                }
            })
        };

        // The third reservation has to wait for the reader to free room.
        for _ in 0..3 {
            let (ptr, avail, grant) = unsafe { ring.get_write_ptr(chunk) }.unwrap();
            assert!(avail >= chunk);
            for i in 0..chunk {
                unsafe { ptr.add(i as usize).write((i + 10) as u8) };
            }
            assert_eq!(unsafe { ring.move_write_ptr(&grant, chunk) }, Ok(chunk));
        }

        reader.join().unwrap();
        assert!(ring.writer_stats().wait_count > 0);
    }

    #[test]
    fn cancel_releases_parked_reader() {
        let ring = Arc::new(make_empty0());

        let canceler = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                spin_until_parked(&ring);
                ring.cancel();
            })
        };

        assert_eq!(
            unsafe { ring.get_read_ptr(1) }.unwrap_err(),
            GrantError::Canceled
        );
        canceler.join().unwrap();
    }

    #[test]
    fn cancel_releases_parked_writer() {
        let ring = Arc::new(make_empty0());
        let chunk = CAP / 3;

        let canceler = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                spin_until_parked(&ring);
                ring.cancel();
            })
        };

        // Three chunks fit; the fourth parks until the cancel lands.
        for _ in 0..3 {
            assert!(drive_write(&ring, chunk, chunk).is_ok());
        }
        assert_eq!(
            unsafe { ring.get_write_ptr(chunk) }.unwrap_err(),
            GrantError::Canceled
        );

        canceler.join().unwrap();
    }

    #[test]
    fn cancel_is_sticky_and_idempotent() {
        let ring = make_empty0();
        ring.cancel();
        ring.cancel();

        assert_eq!(
            unsafe { ring.get_write_ptr(1) }.unwrap_err(),
            GrantError::Canceled
        );
        assert_eq!(
            unsafe { ring.get_read_ptr(0) }.unwrap_err(),
            GrantError::Canceled
        );
        // A barrier on a canceled ring returns immediately.
        ring.wait_until_empty_for_writer();
    }

    #[test]
    fn wait_until_empty_returns_once_drained() {
        let ring = Arc::new(make_empty0());
        assert_eq!(drive_write(&ring, 16, 16), Ok(CAP));

        let reader = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                // Let the writer reach its barrier before draining.
                std::thread::sleep(Duration::from_millis(5));
                assert_eq!(drive_read(&ring, 16, 16), Ok(16));
            })
        };

        ring.wait_until_empty_for_writer();
        let read_index = ring.reader.read_index.load(Ordering::Relaxed);
        let (write_index, read_end_index) =
            decode_ctx(ring.writer.write_ctx.load(Ordering::Relaxed));
        assert!(is_empty(write_index, read_end_index, read_index));

        reader.join().unwrap();
    }
}
