//! Pending command table.
//!
//! Maps correlation ids to one-shot completion handles. An entry is removed
//! from the map before it is resolved, so each waiter is resolved at most
//! once no matter how many answers, timeouts or close calls race for it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tidewire_protocol::Envelope;
use tokio::sync::oneshot;

use crate::error::{ChannelError, ChannelResult};

/// Receiver side of a pending entry.
pub(crate) type AnswerReceiver = oneshot::Receiver<ChannelResult<Envelope>>;

struct Waiter {
    type_id: String,
    tx: oneshot::Sender<ChannelResult<Envelope>>,
}

#[derive(Default)]
struct PendingState {
    waiters: HashMap<u64, Waiter>,
    /// Set once the owning channel is torn down.
    closed: Option<ChannelError>,
}

/// Tracks commands waiting for answers.
pub(crate) struct PendingTable {
    state: Mutex<PendingState>,
    next_id: AtomicU64,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable {
    /// Creates an empty table. Ids start at 1.
    pub(crate) fn new() -> Self {
        Self::starting_at(1)
    }

    fn starting_at(first_id: u64) -> Self {
        Self {
            state: Mutex::new(PendingState::default()),
            next_id: AtomicU64::new(first_id),
        }
    }

    /// Registers a new pending command and returns its correlation id.
    ///
    /// Fails with the close reason once the table has been failed.
    pub(crate) fn register(&self, type_id: &str) -> ChannelResult<(u64, AnswerReceiver)> {
        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(reason.clone());
        }

        // After wraparound, skip ids that are still outstanding.
        let id = loop {
            let candidate = self.next_id.fetch_add(1, Ordering::Relaxed);
            if candidate != 0 && !state.waiters.contains_key(&candidate) {
                break candidate;
            }
        };

        let (tx, rx) = oneshot::channel();
        state.waiters.insert(
            id,
            Waiter {
                type_id: type_id.to_string(),
                tx,
            },
        );
        Ok((id, rx))
    }

    /// Resolves the entry for `id`. Returns false if there was none.
    pub(crate) fn complete(&self, id: u64, result: ChannelResult<Envelope>) -> bool {
        let waiter = self.lock().waiters.remove(&id);
        match waiter {
            Some(waiter) => {
                // The caller may have given up already; that is fine.
                let _ = waiter.tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Removes the entry for `id` without resolving it.
    pub(crate) fn remove(&self, id: u64) -> bool {
        self.lock().waiters.remove(&id).is_some()
    }

    /// Returns the type id the entry was registered with.
    pub(crate) fn type_id_of(&self, id: u64) -> Option<String> {
        self.lock().waiters.get(&id).map(|w| w.type_id.clone())
    }

    /// Fails every entry with `reason` and rejects further registrations.
    ///
    /// Returns how many entries were failed.
    pub(crate) fn fail_all(&self, reason: ChannelError) -> usize {
        let waiters = {
            let mut state = self.lock();
            if state.closed.is_none() {
                state.closed = Some(reason.clone());
            }
            std::mem::take(&mut state.waiters)
        };

        let count = waiters.len();
        for (_, waiter) in waiters {
            let _ = waiter.tx.send(Err(reason.clone()));
        }
        count
    }

    /// Returns the number of outstanding entries.
    pub(crate) fn len(&self) -> usize {
        self.lock().waiters.len()
    }

    fn lock(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::collections::HashSet;

    fn answer(id: u64) -> Envelope {
        let mut command = Envelope::command("echo", None, Value::Null);
        command.correlation_id = Some(id);
        Envelope::answer_to(&command, Value::Null)
    }

    #[test]
    fn register_and_complete() {
        let pending = PendingTable::new();
        let (id, mut rx) = pending.register("echo").unwrap();
        assert_eq!(id, 1);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.type_id_of(id).as_deref(), Some("echo"));

        assert!(pending.complete(id, Ok(answer(id))));
        assert_eq!(pending.len(), 0);

        let received = rx.try_recv().unwrap().unwrap();
        assert_eq!(received.correlation_id, Some(id));
    }

    #[test]
    fn second_completion_is_ignored() {
        let pending = PendingTable::new();
        let (id, _rx) = pending.register("echo").unwrap();

        assert!(pending.complete(id, Ok(answer(id))));
        assert!(!pending.complete(id, Ok(answer(id))));
    }

    #[test]
    fn distinct_ids() {
        let pending = PendingTable::new();
        let ids: Vec<u64> = (0..10)
            .map(|_| pending.register("echo").unwrap().0)
            .collect();
        let unique: HashSet<u64> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
        assert_eq!(pending.len(), 10);
    }

    #[test]
    fn wraparound_skips_outstanding_ids() {
        let pending = PendingTable::starting_at(u64::MAX);
        let (max_id, _rx_max) = pending.register("a").unwrap();
        assert_eq!(max_id, u64::MAX);

        // Counter wraps to 0, which is never used, then 1.
        let (first, _rx_first) = pending.register("b").unwrap();
        assert_eq!(first, 1);

        pending.next_id.store(u64::MAX, Ordering::Relaxed);
        let (next, _rx_next) = pending.register("c").unwrap();
        assert_eq!(next, 2);
    }

    #[test]
    fn remove_unknown_id() {
        let pending = PendingTable::new();
        assert!(!pending.remove(99));
        assert!(!pending.complete(99, Ok(answer(99))));
    }

    #[test]
    fn fail_all_fails_every_waiter_and_blocks_registration() {
        let pending = PendingTable::new();
        let (_, mut rx1) = pending.register("a").unwrap();
        let (_, mut rx2) = pending.register("b").unwrap();

        assert_eq!(pending.fail_all(ChannelError::closed("bye")), 2);
        assert_eq!(pending.len(), 0);

        for rx in [&mut rx1, &mut rx2] {
            let err = rx.try_recv().unwrap().unwrap_err();
            assert!(err.is_connection_closed());
        }

        let err = pending.register("c").unwrap_err();
        assert!(err.is_connection_closed());

        // A second failure keeps the first reason.
        assert_eq!(pending.fail_all(ChannelError::closed("again")), 0);
        let err = pending.register("d").unwrap_err();
        assert_eq!(err.to_string(), "connection closed: bye");
    }
}
