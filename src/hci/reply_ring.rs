//! The bounded command-reply ring (spec §4.3, invariant B3).
//!
//! A full ring means some caller stopped dequeuing (it timed out, or is
//! simply slow); correctness for subsequent commands matters more than
//! preserving the stale replies, so a full push drops the oldest quarter and
//! logs one warning rather than blocking the reader thread.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Reply {
    pub opcode: u16,
    pub bytes: Vec<u8>,
}

struct Inner {
    queue: VecDeque<Reply>,
    capacity: usize,
}

/// A bounded, multi-producer multi-consumer queue of command replies, keyed
/// loosely by opcode (a consumer dequeues and checks the opcode itself, spec
/// §4.3 "send-with-reply").
pub struct ReplyRing {
    inner: Mutex<Inner>,
    not_empty: Condvar,
}

impl ReplyRing {
    pub fn new(capacity: usize) -> Self {
        ReplyRing {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                capacity,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Pushes a reply, called from the reader thread. Never blocks.
    pub fn push(&self, opcode: u16, bytes: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.queue.len() >= inner.capacity {
            let drop_count = (inner.capacity / 4).max(1);
            for _ in 0..drop_count {
                inner.queue.pop_front();
            }
            tracing::warn!(target: "btstack::hci", capacity = inner.capacity, dropped = drop_count, "reply ring full, dropping oldest quarter");
        }
        inner.queue.push_back(Reply { opcode, bytes });
        self.not_empty.notify_all();
    }

    /// Blocks for up to `timeout` for any reply to arrive, then returns it
    /// without checking the opcode; the caller (`send_with_reply`) handles
    /// opcode-mismatch retries (spec §4.3).
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Reply> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(reply) = inner.queue.pop_front() {
                return Some(reply);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, timeout_result) = self.not_empty.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
            if timeout_result.timed_out() && inner.queue.is_empty() {
                return None;
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_ring_drops_oldest_quarter() {
        let ring = ReplyRing::new(8);
        for i in 0..8u16 {
            ring.push(i, vec![i as u8]);
        }
        assert_eq!(ring.len(), 8);
        ring.push(100, vec![100]);
        // dropped 2 (8/4), then pushed 1: 8 - 2 + 1 = 7
        assert_eq!(ring.len(), 7);
        let first = ring.pop_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(first.opcode, 2); // 0 and 1 were dropped
    }

    #[test]
    fn pop_times_out_when_empty() {
        let ring = ReplyRing::new(4);
        assert!(ring.pop_timeout(Duration::from_millis(20)).is_none());
    }
}
