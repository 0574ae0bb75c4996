//! Serializes access to the shared transport.
//!
//! A serial bus or a single TCP session cannot multiplex requests, two overlapping reads would
//! interleave on the wire and corrupt both responses. Waiters park until the holder releases or
//! their timeout elapses; the order in which waiters get the resource is unspecified.

use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::error::{Error, Result};

/// Exclusive possession of the guarded resource, released when dropped.
pub type InterlockToken<'a, T> = MutexGuard<'a, T>;

#[derive(Debug)]
pub struct Interlock<T> {
    resource: Mutex<T>,
}

impl<T> Interlock<T> {
    pub fn new(resource: T) -> Self {
        Interlock {
            resource: Mutex::new(resource),
        }
    }

    /// Waits at most `timeout` for the resource.
    pub fn acquire(&self, timeout: Duration) -> Result<InterlockToken<'_, T>> {
        self.resource
            .try_lock_for(timeout)
            .ok_or(Error::LockTimeout(timeout))
    }

    /// Runs `f` with exclusive access, the resource is released whatever `f` returns or if it panics.
    pub fn with_lock<R>(
        &self,
        timeout: Duration,
        f: impl FnOnce(&mut T) -> Result<R>,
    ) -> Result<R> {
        let mut token = self.acquire(timeout)?;
        f(&mut token)
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Instant;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn bodies_never_overlap() {
        let interlock = Arc::new(Interlock::new(0_u32));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (interlock, active, peak, barrier) =
                    (interlock.clone(), active.clone(), peak.clone(), barrier.clone());
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..10 {
                        interlock
                            .with_lock(TIMEOUT, |counter| {
                                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(now, Ordering::SeqCst);
                                thread::sleep(Duration::from_millis(1));
                                *counter += 1;
                                active.fetch_sub(1, Ordering::SeqCst);
                                Ok(())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(*interlock.acquire(TIMEOUT).unwrap(), 80);
    }

    #[test]
    fn released_after_error() {
        let interlock = Interlock::new(());
        let result: Result<()> = interlock.with_lock(TIMEOUT, |_| {
            Err(Error::Transport(std::io::ErrorKind::BrokenPipe.into()))
        });
        assert!(result.is_err());

        let started = Instant::now();
        interlock.with_lock(TIMEOUT, |_| Ok(())).unwrap();
        assert!(started.elapsed() < TIMEOUT);
    }

    #[test]
    fn released_after_panic() {
        let interlock = Interlock::new(());
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            interlock.with_lock(TIMEOUT, |_| -> Result<()> { panic!("device exploded") })
        }));
        assert!(outcome.is_err());
        assert!(interlock.with_lock(Duration::ZERO, |_| Ok(())).is_ok());
    }

    #[test]
    fn waiting_is_bounded() {
        let interlock = Arc::new(Interlock::new(()));
        let holder = interlock.acquire(TIMEOUT).unwrap();

        let waiter = {
            let interlock = interlock.clone();
            thread::spawn(move || interlock.with_lock(Duration::from_millis(50), |_| Ok(())))
        };
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(Error::LockTimeout(_))));
        assert!(result.is_err_and(|error| error.is_fatal()));
        drop(holder);
    }
}
