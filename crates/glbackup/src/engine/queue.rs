use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared FIFO handed to every worker. Cloning yields another handle to the
/// same queue.
pub struct WorkQueue<T> {
    inner: Arc<Mutex<VecDeque<T>>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
        }
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking worker never holds the lock across user code, so the data
    // is still consistent after poisoning.
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn enqueue(&self, item: T) {
        self.lock().push_back(item);
    }

    pub fn try_dequeue(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> FromIterator<T> for WorkQueue<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            inner: Arc::new(Mutex::new(iter.into_iter().collect())),
        }
    }
}

impl<T> Extend<T> for WorkQueue<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.lock().extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_go_to_the_back() {
        let q: WorkQueue<u32> = [1, 2, 3].into_iter().collect();
        let handle = q.clone();
        let first = handle.try_dequeue().expect("item");
        handle.enqueue(first);
        assert_eq!(q.len(), 3);
        let order: Vec<u32> = std::iter::from_fn(|| q.try_dequeue()).collect();
        assert_eq!(order, vec![2, 3, 1]);
        assert!(q.is_empty());
    }
}
