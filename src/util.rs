#![allow(unused)] // used depending on which engines are exercised.

use std::mem::ManuallyDrop;
use std::sync::{Arc, Mutex};

pub struct ScopeGuard<F: FnOnce()> {
    dropfn: ManuallyDrop<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub fn defuse(mut self) {
        unsafe { ManuallyDrop::drop(&mut self.dropfn) }
        std::mem::forget(self)
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        // SAFETY: This is OK because `dropfn` is `ManuallyDrop` which will not be dropped by the compiler.
        let dropfn = unsafe { ManuallyDrop::take(&mut self.dropfn) };
        dropfn();
    }
}

pub fn defer<F: FnOnce()>(dropfn: F) -> ScopeGuard<F> {
    ScopeGuard {
        dropfn: ManuallyDrop::new(dropfn),
    }
}

/// A copy-on-write listener list (spec §5 "Listener lists"): a mutation
/// clones the whole `Vec`, swaps it in under a short lock, and dispatch
/// snapshots an `Arc` clone before dropping the lock so listeners may
/// add/remove themselves mid-dispatch without deadlocking.
pub struct ListenerList<T> {
    inner: Mutex<Arc<Vec<T>>>,
}

impl<T> Default for ListenerList<T> {
    fn default() -> Self {
        ListenerList {
            inner: Mutex::new(Arc::new(Vec::new())),
        }
    }
}

impl<T: Clone> ListenerList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: T) {
        let mut guard = self.inner.lock().unwrap();
        let mut next = (**guard).clone();
        next.push(item);
        *guard = Arc::new(next);
    }

    /// Removes every element for which `predicate` returns `true`.
    pub fn retain(&self, predicate: impl Fn(&T) -> bool) {
        let mut guard = self.inner.lock().unwrap();
        let next: Vec<T> = guard.iter().filter(|item| predicate(item)).cloned().collect();
        *guard = Arc::new(next);
    }

    /// A consistent point-in-time snapshot to iterate without holding the lock.
    pub fn snapshot(&self) -> Arc<Vec<T>> {
        self.inner.lock().unwrap().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_unaffected_by_concurrent_mutation() {
        let list: ListenerList<i32> = ListenerList::new();
        list.push(1);
        list.push(2);
        let snap = list.snapshot();
        list.push(3);
        assert_eq!(*snap, vec![1, 2]);
        assert_eq!(*list.snapshot(), vec![1, 2, 3]);
    }

    #[test]
    fn retain_drops_matching_predicate_failures() {
        let list: ListenerList<i32> = ListenerList::new();
        list.push(1);
        list.push(2);
        list.push(3);
        list.retain(|&x| x != 2);
        assert_eq!(*list.snapshot(), vec![1, 3]);
    }
}
