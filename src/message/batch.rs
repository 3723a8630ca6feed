//! Message batches
//!
//! A batch is the receive-side view of one bundled frame: every message in it
//! came from the same sender to the same destination. Protocols can consume
//! the messages that belong to them and pass the rest up.

use super::message::Message;
use crate::address::Address;

/// Messages received together from one sender.
#[derive(Debug, Clone)]
pub struct MessageBatch {
    dest: Option<Address>,
    sender: Address,
    cluster: String,
    multicast: bool,
    messages: Vec<Message>,
}

impl MessageBatch {
    pub fn new(
        dest: Option<Address>,
        sender: Address,
        cluster: impl Into<String>,
        multicast: bool,
        messages: Vec<Message>,
    ) -> Self {
        Self {
            dest,
            sender,
            cluster: cluster.into(),
            multicast,
            messages,
        }
    }

    pub fn dest(&self) -> Option<&Address> {
        self.dest.as_ref()
    }

    pub fn sender(&self) -> &Address {
        &self.sender
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn is_multicast(&self) -> bool {
        self.multicast
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Total payload bytes.
    pub fn payload_size(&self) -> usize {
        self.messages.iter().map(|m| m.len()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn add(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    /// Remove and return every message matching `pred`, preserving order of
    /// both the removed and the remaining messages.
    pub fn take_matching(&mut self, mut pred: impl FnMut(&Message) -> bool) -> Vec<Message> {
        let mut taken = Vec::new();
        let mut kept = Vec::with_capacity(self.messages.len());
        for msg in self.messages.drain(..) {
            if pred(&msg) {
                taken.push(msg);
            } else {
                kept.push(msg);
            }
        }
        self.messages = kept;
        taken
    }

    /// Batch with the same metadata and different messages.
    pub fn with_messages(&self, messages: Vec<Message>) -> MessageBatch {
        MessageBatch {
            dest: self.dest.clone(),
            sender: self.sender.clone(),
            cluster: self.cluster.clone(),
            multicast: self.multicast,
            messages,
        }
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

impl IntoIterator for MessageBatch {
    type Item = Message;
    type IntoIter = std::vec::IntoIter<Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_take_matching_preserves_order() {
        let msgs: Vec<Message> = (0u8..6)
            .map(|i| Message::new(None, Bytes::from(vec![i])))
            .collect();
        let mut batch = MessageBatch::new(None, Address::from_u128(1), "c", true, msgs);

        let even = batch.take_matching(|m| m.payload()[0] % 2 == 0);
        let even: Vec<u8> = even.iter().map(|m| m.payload()[0]).collect();
        let odd: Vec<u8> = batch.iter().map(|m| m.payload()[0]).collect();
        assert_eq!(even, vec![0, 2, 4]);
        assert_eq!(odd, vec![1, 3, 5]);
        assert_eq!(batch.payload_size(), 3);
    }
}
