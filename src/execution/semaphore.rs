use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A small, blocking counting semaphore.
///
/// Bounds how many chunks (or columns) are in flight inside the worker pool, independently of the
/// number of pool threads.
pub struct Semaphore {
    permits: Mutex<usize>,
    cv: Condvar,
}

/// Returns its permit on drop, so a panicking chunk cannot leak capacity.
pub struct Permit<'a> {
    sem: &'a Semaphore,
    pub waited: Duration,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.sem.release();
    }
}

impl Semaphore {
    /// `permits` is clamped to at least one.
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits.max(1)),
            cv: Condvar::new(),
        }
    }

    /// Block until a permit is available. The permit records how long the caller waited.
    pub fn acquire(&self) -> Permit<'_> {
        let start = Instant::now();
        let mut waited = false;
        let mut g = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        while *g == 0 {
            waited = true;
            g = self.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
        }
        *g -= 1;
        Permit {
            sem: self,
            waited: if waited { start.elapsed() } else { Duration::ZERO },
        }
    }

    fn release(&self) {
        let mut g = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        *g += 1;
        self.cv.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::Semaphore;
    use std::time::Duration;

    #[test]
    fn uncontended_acquire_does_not_wait() {
        let sem = Semaphore::new(2);
        let a = sem.acquire();
        let b = sem.acquire();
        assert_eq!(a.waited, Duration::ZERO);
        assert_eq!(b.waited, Duration::ZERO);
    }

    #[test]
    fn dropping_a_permit_frees_capacity() {
        let sem = Semaphore::new(1);
        drop(sem.acquire());
        let again = sem.acquire();
        assert_eq!(again.waited, Duration::ZERO);
    }
}
