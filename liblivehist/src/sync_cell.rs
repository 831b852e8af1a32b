use std::sync::{Mutex, MutexGuard, PoisonError};

/// A value that is only reachable through its own mutex.
///
/// `lock` is the locking accessor. Code that must run while the lock is already held takes
/// `&T`/`&mut T` borrowed out of the guard, so there is no way to reach the value without
/// having gone through `lock` somewhere up the call stack.
///
/// A poisoned lock is recovered rather than propagated: the data guarded here (bins, records)
/// stays structurally valid even if a fill panicked half way.
#[derive(Debug, Default)]
pub struct SynchronizedCell<T> {
    inner: Mutex<T>,
}

impl<T> SynchronizedCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Acquire the mutex and return the scoped guard
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive access without locking; the borrow checker proves nobody else holds it
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_concurrent_increments() {
        let cell = Arc::new(SynchronizedCell::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cell = cell.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *cell.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*cell.lock(), 4000);
    }

    #[test]
    fn test_poison_is_recovered() {
        let cell = Arc::new(SynchronizedCell::new(vec![1, 2, 3]));
        let sent = cell.clone();
        let result = std::thread::spawn(move || {
            let _guard = sent.lock();
            panic!("poison the lock");
        })
        .join();
        assert!(result.is_err());
        assert_eq!(cell.lock().len(), 3);
    }
}
