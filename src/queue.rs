use crate::anomaly::AnomalyEvent;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::warn;

struct QueueState {
    events: VecDeque<AnomalyEvent>,
    dropped: u64,
    closed: bool,
}

/// Bounded hand-off from ingestion to the summarization worker.
///
/// Producers never block: when the queue is full the oldest event of the
/// lowest severity is shed, or the incoming event itself if it ranks
/// strictly below everything queued.
pub struct EventQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                events: VecDeque::with_capacity(capacity.min(4096)),
                dropped: 0,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues `event`; returns the event that was shed to make room, if any.
    pub fn push(&self, event: AnomalyEvent) -> Option<AnomalyEvent> {
        let mut st = self.lock();
        if st.closed {
            return Some(event);
        }
        let mut shed = None;
        if st.events.len() >= self.capacity {
            let lowest = st.events.iter().map(|e| e.severity).min();
            match lowest {
                Some(low) if event.severity < low => shed = Some(event.clone()),
                Some(low) => {
                    let pos = st.events.iter().position(|e| e.severity == low);
                    shed = pos.and_then(|p| st.events.remove(p));
                }
                None => {}
            }
            if shed.is_some() {
                st.dropped += 1;
                warn!(dropped_total = st.dropped, capacity = self.capacity, "event queue full, shedding lowest-severity event");
            }
        }
        let incoming_shed = shed.as_ref().is_some_and(|s| s.id == event.id);
        if !incoming_shed {
            st.events.push_back(event);
            self.ready.notify_one();
        }
        shed
    }

    /// Waits up to `timeout` for the next event.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<AnomalyEvent> {
        let st = self.lock();
        let (mut st, _) = self
            .ready
            .wait_timeout_while(st, timeout, |s| s.events.is_empty() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);
        st.events.pop_front()
    }

    pub fn drain(&self) -> Vec<AnomalyEvent> {
        self.lock().events.drain(..).collect()
    }

    /// Stops accepting events and wakes the consumer; queued events stay
    /// available to `pop_timeout`/`drain`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    /// Wakes a waiting consumer without enqueuing anything.
    pub fn wake(&self) {
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
