use std::collections::VecDeque;

use futures::future::BoxFuture;

use super::refresh::RefreshOutcome;

/// Continuation for a parked call, invoked once with the outcome of the
/// refresh it waited on.
pub type Replay = Box<dyn FnOnce(RefreshOutcome) -> BoxFuture<'static, ()> + Send>;

pub struct PendingCall {
    pub id: u64,
    pub replay: Replay,
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall").field("id", &self.id).finish()
    }
}

/// FIFO buffer of calls that arrived while a refresh was running.
///
/// Only touched under the refresh coordinator's lock.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: VecDeque<PendingCall>,
    next_id: u64,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a call, returning the id used to withdraw it later.
    pub fn push(&mut self, replay: Replay) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_back(PendingCall { id, replay });
        id
    }

    /// Withdraw a call that was cancelled before the queue drained.
    pub fn remove(&mut self, id: u64) -> bool {
        match self.entries.iter().position(|call| call.id == id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Take every queued call in arrival order, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<PendingCall> {
        self.entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::{Arc, Mutex};

    fn recording(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Replay {
        let log = Arc::clone(log);
        Box::new(move |_outcome| {
            async move {
                log.lock().unwrap().push(name);
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_drain_is_fifo() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = PendingQueue::new();
        queue.push(recording(&log, "first"));
        queue.push(recording(&log, "second"));
        queue.push(recording(&log, "third"));

        for call in queue.drain() {
            (call.replay)(RefreshOutcome::Refreshed).await;
        }

        assert!(queue.is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_removed_call_is_not_replayed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = PendingQueue::new();
        queue.push(recording(&log, "kept"));
        let cancelled = queue.push(recording(&log, "cancelled"));

        assert!(queue.remove(cancelled));
        assert!(!queue.remove(cancelled));
        assert_eq!(queue.len(), 1);

        for call in queue.drain() {
            (call.replay)(RefreshOutcome::Refreshed).await;
        }
        assert_eq!(*log.lock().unwrap(), vec!["kept"]);
    }
}
