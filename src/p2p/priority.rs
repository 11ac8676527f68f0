//! Per-peer outbound prioritisation. The queue is a max-heap over
//! `(priority, enqueue sequence)` so higher-priority messages drain first
//! while equal-priority messages keep their FIFO order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::codec::Message;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
}

struct Queued {
    priority: Priority,
    sequence: u64,
    message: Message,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority wins; within a priority, the earlier sequence
        // wins (BinaryHeap is a max-heap, so invert the sequence order).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<Queued>,
    next_sequence: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message, priority: Priority) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(Queued {
            priority,
            sequence,
            message,
        });
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.heap.pop().map(|queued| queued.message)
    }

    /// Drain the whole queue in delivery order for one batched flush.
    pub fn drain(&mut self) -> Vec<Message> {
        let mut batch = Vec::with_capacity(self.heap.len());
        while let Some(queued) = self.heap.pop() {
            batch.push(queued.message);
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
