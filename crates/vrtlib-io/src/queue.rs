//! Bounded receive queue between the I/O task and the packet consumer.
//!
//! The queue is limited by packet count and by total octets. When a push
//! would exceed either limit the whole queue is discarded, the incoming
//! unit included, so the consumer resumes from a clean point in the
//! stream instead of a partially thinned one.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use vrtlib_packet::Unit;

/// A decoded unit tagged with the socket it came from.
///
/// `origin` changes whenever the engine opens a new socket or accepts a
/// new client, so sequence tracking never compares counters across peers.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub origin: u64,
    pub unit: Unit,
}

impl Inbound {
    fn packets(&self) -> usize {
        self.unit.packets().len()
    }

    fn octets(&self) -> usize {
        self.unit.wire_len()
    }
}

/// Result of [`PacketQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue overflowed and everything in it was dropped.
    Overflow {
        dropped_packets: usize,
        dropped_octets: usize,
    },
    /// The queue is closed; the unit was discarded.
    Closed,
}

/// Result of [`PacketQueue::pop_wait`].
#[derive(Debug)]
pub enum PopResult {
    Item(Inbound),
    Empty,
    /// Closed and fully drained.
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Inbound>,
    packets: usize,
    octets: usize,
    closed: bool,
}

#[derive(Debug)]
pub struct PacketQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    limit_packets: usize,
    limit_octets: usize,
}

impl PacketQueue {
    pub fn new(limit_packets: usize, limit_octets: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            limit_packets,
            limit_octets,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // Critical sections never panic, but don't lose the queue if one did.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, item: Inbound) -> PushOutcome {
        let packets = item.packets();
        let octets = item.octets();
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            if state.packets + packets > self.limit_packets
                || state.octets + octets > self.limit_octets
            {
                let outcome = PushOutcome::Overflow {
                    dropped_packets: state.packets + packets,
                    dropped_octets: state.octets + octets,
                };
                state.items.clear();
                state.packets = 0;
                state.octets = 0;
                outcome
            } else {
                state.items.push_back(item);
                state.packets += packets;
                state.octets += octets;
                PushOutcome::Queued
            }
        };
        if outcome == PushOutcome::Queued {
            self.notify.notify_one();
        }
        outcome
    }

    pub fn try_pop(&self) -> Option<Inbound> {
        let mut state = self.lock();
        let item = state.items.pop_front()?;
        state.packets -= item.packets();
        state.octets -= item.octets();
        Some(item)
    }

    /// Pop the next unit, waiting up to `timeout` for one to arrive.
    pub async fn pop_wait(&self, timeout: Duration) -> PopResult {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(item) = state.items.pop_front() {
                    state.packets -= item.packets();
                    state.octets -= item.octets();
                    return PopResult::Item(item);
                }
                if state.closed {
                    return PopResult::Closed;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return PopResult::Empty;
            }
        }
    }

    /// Queued packets (not units).
    pub fn len(&self) -> usize {
        self.lock().packets
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn octets(&self) -> usize {
        self.lock().octets
    }

    /// Refuse further pushes. Queued units can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vrtlib_packet::PacketBuilder;

    /// A bare data packet of `words` payload words (total 8 + 4*words octets).
    fn unit(words: usize) -> Inbound {
        let p = PacketBuilder::data(1)
            .payload(&vec![0u8; words * 4])
            .build()
            .unwrap();
        Inbound {
            origin: 1,
            unit: Unit::Packet(p),
        }
    }

    #[test]
    fn fifo_order_and_accounting() {
        let q = PacketQueue::new(10, 1 << 20);
        assert_eq!(q.push(unit(1)), PushOutcome::Queued);
        assert_eq!(q.push(unit(2)), PushOutcome::Queued);
        assert_eq!(q.len(), 2);
        assert_eq!(q.octets(), 12 + 16);

        let first = q.try_pop().unwrap();
        assert_eq!(first.unit.wire_len(), 12);
        assert_eq!(q.len(), 1);
        assert_eq!(q.octets(), 16);
    }

    #[test]
    fn overflow_on_packet_count_clears_everything() {
        let q = PacketQueue::new(3, 1 << 20);
        for _ in 0..3 {
            assert_eq!(q.push(unit(0)), PushOutcome::Queued);
        }
        let outcome = q.push(unit(0));
        assert_eq!(
            outcome,
            PushOutcome::Overflow {
                dropped_packets: 4,
                dropped_octets: 32
            }
        );
        assert_eq!(q.len(), 0);
        assert_eq!(q.octets(), 0);
        assert!(q.try_pop().is_none());

        // Usable again afterwards.
        assert_eq!(q.push(unit(0)), PushOutcome::Queued);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn overflow_on_octets() {
        let q = PacketQueue::new(100, 40);
        assert_eq!(q.push(unit(4)), PushOutcome::Queued); // 24 octets
        assert!(matches!(q.push(unit(4)), PushOutcome::Overflow { .. }));
        assert!(q.is_empty());
    }

    #[test]
    fn closed_queue_rejects_pushes() {
        let q = PacketQueue::new(10, 1000);
        q.push(unit(0));
        q.close();
        assert_eq!(q.push(unit(0)), PushOutcome::Closed);
        assert!(q.try_pop().is_some());
    }

    #[tokio::test]
    async fn pop_wait_times_out_when_empty() {
        let q = PacketQueue::new(10, 1000);
        assert!(matches!(
            q.pop_wait(Duration::from_millis(20)).await,
            PopResult::Empty
        ));
    }

    #[tokio::test]
    async fn pop_wait_wakes_on_push() {
        let q = std::sync::Arc::new(PacketQueue::new(10, 1000));
        let producer = q.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(unit(3));
        });
        match q.pop_wait(Duration::from_secs(2)).await {
            PopResult::Item(item) => assert_eq!(item.unit.wire_len(), 20),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn pop_wait_drains_then_reports_closed() {
        let q = PacketQueue::new(10, 1000);
        q.push(unit(0));
        q.close();
        assert!(matches!(
            q.pop_wait(Duration::from_millis(10)).await,
            PopResult::Item(_)
        ));
        assert!(matches!(
            q.pop_wait(Duration::from_millis(10)).await,
            PopResult::Closed
        ));
    }
}
