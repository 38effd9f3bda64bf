//! The scheduler's run queue: a FIFO of runnable fibers with front-insert for
//! prioritised resumes and O(1) removal by fiber identity.
//!
//! Implemented as an intrusive doubly-linked list over a slot arena, indexed
//! by a `HashMap<FiberId, usize>` — the design's suggested alternative to a
//! hashmap-backed linked list, and a better fit for Rust's ownership model
//! than a pointer-chasing intrusive list would be (see `DESIGN.md`).

use std::collections::HashMap;

use crate::fiber::{FiberId, ResumeValue};

struct Node {
    fiber: FiberId,
    value: ResumeValue,
    prev: Option<usize>,
    next: Option<usize>,
}

/// FIFO of `(fiber, resume-value)` entries. Each fiber appears at most once;
/// re-scheduling an already-queued fiber updates its resume value in place
/// rather than duplicating the entry.
#[derive(Default)]
pub struct RunQueue {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    index: HashMap<FiberId, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl RunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, fiber: FiberId) -> bool {
        self.index.contains_key(&fiber)
    }

    /// Schedule `fiber` to run with the given resume `value`. If `fiber` is
    /// already queued, its resume value is updated in place and its
    /// position is left unchanged — this call never duplicates an entry.
    pub fn push_back(&mut self, fiber: FiberId, value: ResumeValue) {
        let value = match self.update_in_place(fiber, value) {
            Ok(()) => return,
            Err(value) => value,
        };
        let slot = self.alloc(fiber, value);
        self.link_tail(slot);
    }

    /// Like [`push_back`](Self::push_back), but inserts at the front so the
    /// fiber is the next one popped ("prioritised" resume).
    pub fn push_front(&mut self, fiber: FiberId, value: ResumeValue) {
        let value = match self.update_in_place(fiber, value) {
            Ok(()) => return,
            Err(value) => value,
        };
        let slot = self.alloc(fiber, value);
        self.link_head(slot);
    }

    /// Updates the resume value of an already-queued fiber in place.
    /// Returns the value back on failure so the caller can fall through to
    /// inserting a fresh entry without requiring `ResumeValue: Clone`.
    fn update_in_place(&mut self, fiber: FiberId, value: ResumeValue) -> Result<(), ResumeValue> {
        if let Some(&slot) = self.index.get(&fiber) {
            self.slots[slot].as_mut().expect("indexed slot is live").value = value;
            Ok(())
        } else {
            Err(value)
        }
    }

    fn alloc(&mut self, fiber: FiberId, value: ResumeValue) -> usize {
        let node = Node {
            fiber,
            value,
            prev: None,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.index.insert(fiber, slot);
        self.len += 1;
        slot
    }

    fn link_tail(&mut self, slot: usize) {
        self.slots[slot].as_mut().unwrap().prev = self.tail;
        match self.tail {
            Some(tail) => self.slots[tail].as_mut().unwrap().next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
    }

    fn link_head(&mut self, slot: usize) {
        self.slots[slot].as_mut().unwrap().next = self.head;
        match self.head {
            Some(head) => self.slots[head].as_mut().unwrap().prev = Some(slot),
            None => self.tail = Some(slot),
        }
        self.head = Some(slot);
    }

    /// Pop the fiber at the front of the queue along with its resume value.
    pub fn pop_front(&mut self) -> Option<(FiberId, ResumeValue)> {
        let slot = self.head?;
        self.unlink(slot);
        let node = self.slots[slot].take().expect("unlinked slot is live");
        self.free.push(slot);
        self.index.remove(&node.fiber);
        self.len -= 1;
        Some((node.fiber, node.value))
    }

    /// Remove `fiber` from the queue regardless of its position. Used when a
    /// fiber dies or is explicitly unscheduled. No-op if absent.
    pub fn delete(&mut self, fiber: FiberId) {
        if let Some(&slot) = self.index.get(&fiber) {
            self.unlink(slot);
            self.slots[slot] = None;
            self.free.push(slot);
            self.index.remove(&fiber);
            self.len -= 1;
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let node = self.slots[slot].as_ref().unwrap();
            (node.prev, node.next)
        };
        match prev {
            Some(prev) => self.slots[prev].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.slots[next].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::ResumeValue;

    fn fid(n: u64) -> FiberId {
        FiberId::from_raw(n)
    }

    #[test]
    fn fifo_order() {
        let mut q = RunQueue::new();
        q.push_back(fid(1), ResumeValue::Unit);
        q.push_back(fid(2), ResumeValue::Unit);
        q.push_back(fid(3), ResumeValue::Unit);
        assert_eq!(q.pop_front().map(|(f, _)| f), Some(fid(1)));
        assert_eq!(q.pop_front().map(|(f, _)| f), Some(fid(2)));
        assert_eq!(q.pop_front().map(|(f, _)| f), Some(fid(3)));
        assert!(q.pop_front().is_none());
    }

    #[test]
    fn push_front_prioritises() {
        let mut q = RunQueue::new();
        q.push_back(fid(1), ResumeValue::Unit);
        q.push_front(fid(2), ResumeValue::Unit);
        assert_eq!(q.pop_front().map(|(f, _)| f), Some(fid(2)));
        assert_eq!(q.pop_front().map(|(f, _)| f), Some(fid(1)));
    }

    #[test]
    fn reschedule_is_idempotent() {
        let mut q = RunQueue::new();
        q.push_back(fid(1), ResumeValue::Unit);
        q.push_back(fid(2), ResumeValue::Unit);
        q.push_back(fid(1), ResumeValue::Unit);
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop_front().map(|(f, _)| f), Some(fid(1)));
        assert_eq!(q.pop_front().map(|(f, _)| f), Some(fid(2)));
    }

    #[test]
    fn delete_removes_regardless_of_position() {
        let mut q = RunQueue::new();
        q.push_back(fid(1), ResumeValue::Unit);
        q.push_back(fid(2), ResumeValue::Unit);
        q.push_back(fid(3), ResumeValue::Unit);
        q.delete(fid(2));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop_front().map(|(f, _)| f), Some(fid(1)));
        assert_eq!(q.pop_front().map(|(f, _)| f), Some(fid(3)));
    }
}
