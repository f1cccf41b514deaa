use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use log::debug;

use crate::{
    types::MessageIndex,
    wrapping::{sequence_less_than, wrapping_diff},
};

/// How long a reliable message stays unacknowledged before it is resent.
pub const RESEND_INTERVAL: Duration = Duration::from_millis(100);

/// Outbound half of the reliable ordered channel: assigns wrapping
/// message indices and retransmits until each index is acknowledged.
/// Sends through this channel are delivered exactly once, in order,
/// relative to other reliable sends to the same peer.
pub struct ReliableSender {
    next_index: MessageIndex,
    outstanding: Vec<OutstandingMessage>,
}

struct OutstandingMessage {
    index: MessageIndex,
    payload: Vec<u8>,
    last_sent: Option<Instant>,
}

impl ReliableSender {
    pub fn new() -> Self {
        Self {
            next_index: 0,
            outstanding: Vec::new(),
        }
    }

    /// Queues a payload and returns its assigned index.
    pub fn queue(&mut self, payload: Vec<u8>) -> MessageIndex {
        let index = self.next_index;
        self.next_index = self.next_index.wrapping_add(1);
        self.outstanding.push(OutstandingMessage {
            index,
            payload,
            last_sent: None,
        });
        index
    }

    /// Messages due for (re)send: everything never sent, plus everything
    /// unacknowledged for longer than [`RESEND_INTERVAL`].
    pub fn take_due(&mut self, now: Instant) -> Vec<(MessageIndex, Vec<u8>)> {
        let mut due = Vec::new();
        for message in &mut self.outstanding {
            let ready = match message.last_sent {
                None => true,
                Some(at) => now.duration_since(at) >= RESEND_INTERVAL,
            };
            if ready {
                message.last_sent = Some(now);
                due.push((message.index, message.payload.clone()));
            }
        }
        due
    }

    /// Processes an acknowledgement. Duplicate acks are normal over UDP
    /// and ignored.
    pub fn ack(&mut self, index: MessageIndex) {
        self.outstanding.retain(|m| m.index != index);
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }
}

impl Default for ReliableSender {
    fn default() -> Self {
        Self::new()
    }
}

/// Inbound half of the reliable ordered channel. Buffers out-of-order
/// arrivals in index slots and releases the in-order prefix, so each
/// message is delivered exactly once no matter how the datagrams were
/// duplicated or reordered in flight.
pub struct OrderedReliableReceiver {
    /// Index the next delivered message must carry.
    next_expected: MessageIndex,
    /// Slot buffer starting at `next_expected`; `None` marks a gap.
    buffer: VecDeque<Option<Vec<u8>>>,
}

impl OrderedReliableReceiver {
    pub fn new() -> Self {
        Self {
            next_expected: 0,
            buffer: VecDeque::new(),
        }
    }

    /// Accepts one arriving message and returns every message now
    /// deliverable in order. Stale and duplicate indices produce nothing.
    pub fn receive(&mut self, index: MessageIndex, payload: Vec<u8>) -> Vec<Vec<u8>> {
        if sequence_less_than(index, self.next_expected) {
            debug!("dropping already delivered reliable message {}", index);
            return Vec::new();
        }

        let offset = wrapping_diff(self.next_expected, index) as usize;
        while self.buffer.len() <= offset {
            self.buffer.push_back(None);
        }
        let slot = &mut self.buffer[offset];
        if slot.is_some() {
            debug!("dropping duplicate reliable message {}", index);
            return Vec::new();
        }
        *slot = Some(payload);

        let mut delivered = Vec::new();
        while matches!(self.buffer.front(), Some(Some(_))) {
            let message = self
                .buffer
                .pop_front()
                .flatten()
                .unwrap_or_default();
            delivered.push(message);
            self.next_expected = self.next_expected.wrapping_add(1);
        }
        delivered
    }

    pub fn next_expected(&self) -> MessageIndex {
        self.next_expected
    }
}

impl Default for OrderedReliableReceiver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_delivery() {
        let mut receiver = OrderedReliableReceiver::new();
        assert_eq!(receiver.receive(0, vec![0]), vec![vec![0]]);
        assert_eq!(receiver.receive(1, vec![1]), vec![vec![1]]);
        assert_eq!(receiver.next_expected(), 2);
    }

    #[test]
    fn reordered_delivery_is_held_back() {
        let mut receiver = OrderedReliableReceiver::new();
        assert!(receiver.receive(1, vec![1]).is_empty());
        assert!(receiver.receive(2, vec![2]).is_empty());
        assert_eq!(
            receiver.receive(0, vec![0]),
            vec![vec![0], vec![1], vec![2]]
        );
    }

    #[test]
    fn duplicates_deliver_once() {
        let mut receiver = OrderedReliableReceiver::new();
        assert_eq!(receiver.receive(0, vec![0]).len(), 1);
        assert!(receiver.receive(0, vec![0]).is_empty());
        assert!(receiver.receive(1, vec![1]).len() == 1);
        // A duplicate of something buffered but undelivered.
        assert!(receiver.receive(3, vec![3]).is_empty());
        assert!(receiver.receive(3, vec![3]).is_empty());
        assert_eq!(receiver.receive(2, vec![2]), vec![vec![2], vec![3]]);
    }

    #[test]
    fn delivery_across_index_wrap() {
        let mut receiver = OrderedReliableReceiver::new();
        receiver.next_expected = u16::MAX;
        assert_eq!(receiver.receive(u16::MAX, vec![1]).len(), 1);
        assert_eq!(receiver.receive(0, vec![2]).len(), 1);
        assert_eq!(receiver.next_expected(), 1);
    }

    #[test]
    fn sender_resends_until_acked() {
        let mut sender = ReliableSender::new();
        let index = sender.queue(vec![9]);
        let now = Instant::now();
        assert_eq!(sender.take_due(now).len(), 1);
        // Nothing due again before the resend interval.
        assert!(sender.take_due(now).is_empty());
        assert_eq!(sender.take_due(now + RESEND_INTERVAL).len(), 1);
        sender.ack(index);
        assert!(sender.take_due(now + 2 * RESEND_INTERVAL).is_empty());
        assert_eq!(sender.outstanding_count(), 0);
    }

    #[test]
    fn sender_assigns_sequential_indices() {
        let mut sender = ReliableSender::new();
        assert_eq!(sender.queue(vec![]), 0);
        assert_eq!(sender.queue(vec![]), 1);
        assert_eq!(sender.queue(vec![]), 2);
    }
}
