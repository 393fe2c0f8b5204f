//! Zero-copy SPSC ring for in-process (inter-thread) communication.
//!
//! A bounded ring over owned, aligned heap storage whose regions are handed
//! to the caller directly: the writer fills a granted slice in place, the
//! reader consumes a granted slice in place. No element ever passes through
//! an intermediate buffer.
//!
//! # Overview
//!
//! - [`Writer`] - Write end (single writer per ring)
//! - [`Reader`] - Read end (single reader per ring)
//! - [`Canceller`] - Cloneable handle that cancels the ring from any thread
//! - Lock-free hot path; blocking variants park on a futex, never a mutex
//!
//! # Example
//!
//! ```
//! use handoff::sync::spsc;
//!
//! let (mut writer, mut reader) = spsc::ring::<u8, 8>(64);
//!
//! // Writer thread: reserve, fill in place, commit.
//! let region = writer.grant_write(4).unwrap();
//! region[..4].copy_from_slice(b"ping");
//! writer.commit_write(4).unwrap();
//!
//! // Reader thread: reserve, consume in place, commit.
//! let region = reader.grant_read(4).unwrap();
//! assert_eq!(&region[..4], b"ping");
//! reader.commit_read(4).unwrap();
//! ```
//!
//! # Reservation sizes
//!
//! A reservation of `want > 0` blocks until at least `want` contiguous
//! elements are available and may grant more. `want == 0` never blocks: it
//! grants whatever is available or fails with
//! [`GrantError::Insufficient`]. Requests above half the capacity are
//! rejected outright so a wrap can always satisfy any admissible request.

use std::cell::Cell;
use std::marker::PhantomData;
use std::slice;
use std::sync::Arc;

use crate::spsc::ring::{ReadGrant, Ring, WriteGrant};
use crate::spsc::{CommitError, GrantError, WriterStats};

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end of the zero-copy ring.
///
/// Only one writer exists per ring; the handle is [`Send`] but not
/// [`Sync`], and grants borrow the handle mutably so a granted region
/// cannot outlive its commit.
pub struct Writer<T: Send, const ALIGN: usize> {
    ring: Arc<Ring<T, ALIGN>>,
    grant: Option<WriteGrant>,
    _unsync: PhantomUnsync,
}

/// Read end of the zero-copy ring.
///
/// Single reader per ring; same handle semantics as [`Writer`].
pub struct Reader<T: Send, const ALIGN: usize> {
    ring: Arc<Ring<T, ALIGN>>,
    grant: Option<ReadGrant>,
    _unsync: PhantomUnsync,
}

/// Cloneable cancellation handle.
///
/// Both endpoints expose [`Writer::canceller`]/[`Reader::canceller`]; the
/// handle can be moved to any thread to cancel a ring whose endpoints are
/// blocked.
pub struct Canceller<T: Send, const ALIGN: usize> {
    ring: Arc<Ring<T, ALIGN>>,
}

impl<T: Send, const ALIGN: usize> Clone for Canceller<T, ALIGN> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

impl<T: Send, const ALIGN: usize> Canceller<T, ALIGN> {
    /// Cancels the ring: every current and future operation on either
    /// endpoint fails with a canceled error and all parked threads are
    /// released. Idempotent.
    pub fn cancel(&self) {
        self.ring.cancel();
    }
}

/// Creates a new zero-copy SPSC ring of `capacity` elements whose storage
/// is aligned to at least `ALIGN` bytes.
///
/// Returns a `(Writer, Reader)` pair; each can be sent to its own thread.
///
/// # Panics
///
/// Panics if `capacity < 2`, if `capacity` overflows `i32`, if `ALIGN` is
/// not a power of two, or if `T` is zero-sized.
#[must_use]
pub fn ring<T, const ALIGN: usize>(capacity: usize) -> (Writer<T, ALIGN>, Reader<T, ALIGN>)
where
    T: Copy + Default + Send,
{
    let ring = Arc::new(Ring::new(capacity));

    let writer = Writer {
        ring: Arc::clone(&ring),
        grant: None,
        _unsync: PhantomData,
    };
    let reader = Reader {
        ring,
        grant: None,
        _unsync: PhantomData,
    };

    (writer, reader)
}

impl<T: Send, const ALIGN: usize> Writer<T, ALIGN> {
    /// Reserves a contiguous writable region of at least `want` elements,
    /// parking until the reader frees enough room.
    ///
    /// The returned slice is the full granted region; fill any prefix and
    /// commit its length with [`Self::commit_write`].
    ///
    /// # Errors
    ///
    /// [`GrantError::Oversize`] for `want > capacity / 2`,
    /// [`GrantError::Insufficient`] for a non-blocking (`want == 0`) miss,
    /// [`GrantError::Canceled`] after cancellation.
    pub fn grant_write(&mut self, want: usize) -> Result<&mut [T], GrantError> {
        let want = i32::try_from(want).map_err(|_| GrantError::Oversize)?;
        // SAFETY: &mut self plus !Sync make this the only writer call.
        let (ptr, avail, grant) = unsafe { self.ring.get_write_ptr(want) }?;
        self.grant = Some(grant);
        // SAFETY: the region is writer-owned until commit_write, which needs
        // &mut self and therefore the end of this borrow.
        Ok(unsafe { slice::from_raw_parts_mut(ptr, avail as usize) })
    }

    /// Commits that the first `written` elements of the granted region were
    /// filled, publishing them to the reader.
    ///
    /// # Errors
    ///
    /// [`CommitError::ExceedsGrant`] if `written` exceeds the grant or no
    /// grant is pending, [`CommitError::Canceled`] after cancellation. A
    /// failed commit leaves the ring state untouched.
    pub fn commit_write(&mut self, written: usize) -> Result<usize, CommitError> {
        let grant = self.grant.take().ok_or(CommitError::ExceedsGrant)?;
        let written = i32::try_from(written).map_err(|_| CommitError::ExceedsGrant)?;
        // SAFETY: single writer; the grant came from our own reservation.
        unsafe { self.ring.move_write_ptr(&grant, written) }.map(|n| n as usize)
    }

    /// Blocks until the reader has consumed everything published, or the
    /// ring is canceled.
    pub fn wait_until_empty(&self) {
        self.ring.wait_until_empty_for_writer();
    }

    /// Writer-side diagnostic counters.
    #[must_use]
    pub fn stats(&self) -> WriterStats {
        self.ring.writer_stats()
    }

    /// Cancels the ring. See [`Canceller::cancel`].
    pub fn cancel(&self) {
        self.ring.cancel();
    }

    /// A cancellation handle usable from any thread.
    #[must_use]
    pub fn canceller(&self) -> Canceller<T, ALIGN> {
        Canceller {
            ring: Arc::clone(&self.ring),
        }
    }
}

impl<T: Send, const ALIGN: usize> Reader<T, ALIGN> {
    /// Reserves a contiguous readable region of at least `want` elements,
    /// parking until the writer publishes enough data.
    ///
    /// The returned slice is the full granted region; consume any prefix and
    /// commit its length with [`Self::commit_read`].
    ///
    /// # Errors
    ///
    /// As [`Writer::grant_write`].
    pub fn grant_read(&mut self, want: usize) -> Result<&[T], GrantError> {
        let want = i32::try_from(want).map_err(|_| GrantError::Oversize)?;
        // SAFETY: &mut self plus !Sync make this the only reader call.
        let (ptr, avail, grant) = unsafe { self.ring.get_read_ptr(want) }?;
        self.grant = Some(grant);
        // SAFETY: the region is reader-owned until commit_read, which needs
        // &mut self and therefore the end of this borrow.
        Ok(unsafe { slice::from_raw_parts(ptr, avail as usize) })
    }

    /// Commits that the first `read` elements of the granted region were
    /// consumed, returning the room to the writer.
    ///
    /// # Errors
    ///
    /// As [`Writer::commit_write`].
    pub fn commit_read(&mut self, read: usize) -> Result<usize, CommitError> {
        let grant = self.grant.take().ok_or(CommitError::ExceedsGrant)?;
        let read = i32::try_from(read).map_err(|_| CommitError::ExceedsGrant)?;
        // SAFETY: single reader; the grant came from our own reservation.
        unsafe { self.ring.move_read_ptr(&grant, read) }.map(|n| n as usize)
    }

    /// Cancels the ring. See [`Canceller::cancel`].
    pub fn cancel(&self) {
        self.ring.cancel();
    }

    /// A cancellation handle usable from any thread.
    #[must_use]
    pub fn canceller(&self) -> Canceller<T, ALIGN> {
        Canceller {
            ring: Arc::clone(&self.ring),
        }
    }
}
