//! Waitable atomic index words.
//!
//! The ring protocols park a thread on the exact index word it is blocked on
//! (a producer on `read_index`, a consumer on `read_max_index` or
//! `write_ctx`) and are woken by the peer that advances that word. Futexes
//! only park on 32-bit words, so each waitable word pairs its value with a
//! 32-bit notify epoch: waiters sleep on the epoch, notifiers bump it after
//! publishing the new value and then wake.
//!
//! A waiter that observes the epoch before a notifier bumps it will have its
//! futex call rejected by the kernel (epoch mismatch), so no wakeup is lost.
//! Spurious wakeups are absorbed by re-checking the value, the same contract
//! as C++ `atomic::wait`.

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};

use atomic_wait::{wait, wake_all, wake_one};

macro_rules! waitable_word {
    ($name:ident, $atomic:ident, $value:ty) => {
        pub(crate) struct $name {
            value: $atomic,
            epoch: AtomicU32,
        }

        impl $name {
            pub(crate) const fn new(value: $value) -> Self {
                Self {
                    value: $atomic::new(value),
                    epoch: AtomicU32::new(0),
                }
            }

            #[inline]
            pub(crate) fn load(&self, order: Ordering) -> $value {
                self.value.load(order)
            }

            #[cfg(test)]
            pub(crate) fn store(&self, value: $value, order: Ordering) {
                self.value.store(value, order);
            }

            #[inline]
            pub(crate) fn compare_exchange(
                &self,
                current: $value,
                new: $value,
                success: Ordering,
                failure: Ordering,
            ) -> Result<$value, $value> {
                self.value.compare_exchange(current, new, success, failure)
            }

            #[inline]
            pub(crate) fn compare_exchange_weak(
                &self,
                current: $value,
                new: $value,
                success: Ordering,
                failure: Ordering,
            ) -> Result<$value, $value> {
                self.value
                    .compare_exchange_weak(current, new, success, failure)
            }

            /// Parks the calling thread while the word still holds `expected`.
            ///
            /// Returns on any change of the value, on a notify, or spuriously.
            /// Callers re-load with their own ordering after return; the check
            /// here is only a sleep gate.
            pub(crate) fn wait(&self, expected: $value) {
                loop {
                    let epoch = self.epoch.load(Ordering::Acquire);
                    if self.value.load(Ordering::Relaxed) != expected {
                        return;
                    }
                    wait(&self.epoch, epoch);
                }
            }

            /// Wakes one thread parked on this word.
            ///
            /// Must be called after the value change is published, or the
            /// waiter may re-park on the stale value.
            #[inline]
            pub(crate) fn notify_one(&self) {
                self.epoch.fetch_add(1, Ordering::Release);
                wake_one(&self.epoch);
            }

            /// Wakes every thread parked on this word.
            #[inline]
            pub(crate) fn notify_all(&self) {
                self.epoch.fetch_add(1, Ordering::Release);
                wake_all(&self.epoch);
            }
        }
    };
}

waitable_word!(WaitableI32, AtomicI32, i32);
waitable_word!(WaitableI64, AtomicI64, i64);
waitable_word!(WaitableU64, AtomicU64, u64);
