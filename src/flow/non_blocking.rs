//! Credit map that queues instead of blocking.

use std::collections::VecDeque;
use std::sync::Mutex;

use super::credit_map::CreditMap;
use crate::address::Address;
use crate::message::Message;
use crate::sync::lock;

/// Outcome of a non-blocking decrement.
#[derive(Debug)]
pub enum Admission {
    /// Credits were taken; send the message now.
    Admitted(Message),
    /// Queued until enough credits arrive.
    Queued,
    /// The queue is full; the message is handed back.
    Rejected(Message),
}

#[derive(Debug, Default)]
struct Queue {
    items: VecDeque<(Message, u64)>,
    bytes: u64,
}

/// A `CreditMap` whose senders never park: messages that do not fit are
/// queued in FIFO order and released by later replenishments.
#[derive(Debug)]
pub struct NonBlockingCreditMap {
    credits: CreditMap,
    queue: Mutex<Queue>,
    max_queue_size: u64,
}

impl NonBlockingCreditMap {
    pub fn new(max_credits: u64, max_queue_size: u64) -> Self {
        Self {
            credits: CreditMap::new(max_credits),
            queue: Mutex::new(Queue::default()),
            max_queue_size,
        }
    }

    /// The underlying credit counters.
    pub fn credits(&self) -> &CreditMap {
        &self.credits
    }

    /// Take `size` credits for `msg`, or queue it behind earlier messages.
    /// Queued bytes never exceed `max_queue_size`.
    pub fn decrement(&self, msg: Message, size: u64) -> Admission {
        let mut queue = lock(&self.queue);
        // Never overtake queued messages.
        if queue.items.is_empty() && self.credits.try_decrement(size) {
            return Admission::Admitted(msg);
        }
        if queue.bytes + size > self.max_queue_size {
            return Admission::Rejected(msg);
        }
        queue.bytes += size;
        queue.items.push_back((msg, size));
        Admission::Queued
    }

    /// Grant `member` more credits. Returns the queued messages that now
    /// fit, in queue order.
    pub fn replenish(&self, member: &Address, credits: u64) -> Vec<Message> {
        let mut queue = lock(&self.queue);
        self.credits.replenish(member, credits);
        self.release(&mut queue)
    }

    pub fn replenish_all(&self) -> Vec<Message> {
        let mut queue = lock(&self.queue);
        self.credits.replenish_all();
        self.release(&mut queue)
    }

    /// Stop tracking `member`; returns queued messages it was holding back.
    pub fn remove(&self, member: &Address) -> Vec<Message> {
        let mut queue = lock(&self.queue);
        self.credits.remove(member);
        self.release(&mut queue)
    }

    fn release(&self, queue: &mut Queue) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some((_, size)) = queue.items.front() {
            let size = *size;
            if !self.credits.try_decrement(size) {
                break;
            }
            if let Some((msg, _)) = queue.items.pop_front() {
                queue.bytes -= size;
                out.push(msg);
            }
        }
        out
    }

    pub fn is_queuing(&self) -> bool {
        !lock(&self.queue).items.is_empty()
    }

    pub fn queued_messages(&self) -> usize {
        lock(&self.queue).items.len()
    }

    pub fn queued_bytes(&self) -> u64 {
        lock(&self.queue).bytes
    }

    pub fn min_credits(&self) -> u64 {
        self.credits.min_credits()
    }

    /// Drop everything queued and stop admitting.
    pub fn reset(&self) {
        let mut queue = lock(&self.queue);
        queue.items.clear();
        queue.bytes = 0;
        self.credits.reset();
    }
}
