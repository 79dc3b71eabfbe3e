//! Blocking primitives shared by the log writer and the updaters

use flashkv_common::Result;
use parking_lot::{Condvar, Mutex};

/// Counting semaphore
///
/// `acquire` blocks the calling thread until a permit is available.
pub struct Semaphore {
    permits: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    pub const fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cv: Condvar::new(),
        }
    }

    /// Take `n` permits, waiting until all are available at once
    pub fn acquire_many(&self, n: usize) {
        let mut permits = self.permits.lock();
        while *permits < n {
            self.cv.wait(&mut permits);
        }
        *permits -= n;
    }

    pub fn acquire(&self) {
        self.acquire_many(1);
    }

    /// Take a permit if one is free
    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    pub fn release_many(&self, n: usize) {
        let mut permits = self.permits.lock();
        *permits += n;
        self.cv.notify_all();
    }

    pub fn release(&self) {
        self.release_many(1);
    }

    pub fn available(&self) -> usize {
        *self.permits.lock()
    }
}

/// One-shot completion a waiter blocks on
pub struct Completion<T> {
    result: Mutex<Option<Result<T>>>,
    cv: Condvar,
}

impl<T> Completion<T> {
    pub const fn new() -> Self {
        Self {
            result: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    /// Publish the outcome; later calls are ignored
    pub fn finish(&self, outcome: Result<T>) {
        let mut result = self.result.lock();
        if result.is_none() {
            *result = Some(outcome);
            self.cv.notify_all();
        }
    }

    /// Block until the outcome is published
    pub fn wait(&self) -> Result<T> {
        let mut guard = self.result.lock();
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            self.cv.wait(&mut guard);
        }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_semaphore_blocks_until_release() {
        let sem = Arc::new(Semaphore::new(1));
        sem.acquire();
        assert!(!sem.try_acquire());

        let acquired = Arc::new(AtomicBool::new(false));
        let handle = {
            let sem = Arc::clone(&sem);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                sem.acquire();
                acquired.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!acquired.load(Ordering::SeqCst));
        sem.release();
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn test_semaphore_acquire_many() {
        let sem = Semaphore::new(4);
        sem.acquire_many(3);
        assert_eq!(sem.available(), 1);
        sem.release_many(3);
        assert_eq!(sem.available(), 4);
    }

    #[test]
    fn test_completion() {
        let done = Arc::new(Completion::new());
        let waiter = {
            let done = Arc::clone(&done);
            thread::spawn(move || done.wait())
        };
        done.finish(Ok(7u64));
        done.finish(Ok(8u64));
        assert_eq!(waiter.join().unwrap().unwrap(), 7);
    }
}
