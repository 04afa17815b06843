// Read-receipt debouncing.
//
// Clients emit markRead as the user scrolls, far faster than the read
// position is worth persisting. Submissions coalesce per chat (newest
// position wins) and a per-connection task flushes them on a fixed interval.
// Disconnecting drops the task; unflushed positions are lost, which is
// acceptable since the client resubmits on its next session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::store::ChatStore;

/// Coalesced read positions awaiting a flush. Pure state, no clock.
#[derive(Debug, Default)]
pub struct PendingReads {
    /// chat_id → newest submitted position.
    pending: HashMap<i64, DateTime<Utc>>,
    /// chat_id → last position handed to a flush, to drop stale resubmits.
    flushed: HashMap<i64, DateTime<Utc>>,
}

impl PendingReads {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a read position. Returns false when the submission is not
    /// strictly newer than what is already pending or flushed for the chat.
    pub fn submit(&mut self, chat_id: i64, up_to: DateTime<Utc>) -> bool {
        let newest_known = self
            .pending
            .get(&chat_id)
            .into_iter()
            .chain(self.flushed.get(&chat_id))
            .max()
            .copied();
        if newest_known.is_some_and(|known| up_to <= known) {
            return false;
        }
        self.pending.insert(chat_id, up_to);
        true
    }

    /// Take everything pending, marking it flushed.
    pub fn drain(&mut self) -> Vec<(i64, DateTime<Utc>)> {
        let drained: Vec<_> = self.pending.drain().collect();
        for (chat_id, up_to) in &drained {
            self.flushed.insert(*chat_id, *up_to);
        }
        drained
    }

    /// Put a failed flush back so the next tick retries it, unless a newer
    /// submission has arrived in the meantime.
    pub fn restore(&mut self, chat_id: i64, up_to: DateTime<Utc>) {
        self.flushed.remove(&chat_id);
        self.pending.entry(chat_id).and_modify(|pending| {
            if *pending < up_to {
                *pending = up_to;
            }
        }).or_insert(up_to);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Per-connection flusher for one authenticated reader.
///
/// Dropping it aborts the flush task, so a disconnect cancels any positions
/// still in the window.
pub struct ReadReceiptDebouncer {
    pending: Arc<Mutex<PendingReads>>,
    task: JoinHandle<()>,
}

impl ReadReceiptDebouncer {
    pub fn spawn(store: ChatStore, reader_id: i64, flush_interval: Duration) -> Self {
        let pending = Arc::new(Mutex::new(PendingReads::new()));
        let task = tokio::spawn(run_flush_loop(
            store,
            reader_id,
            flush_interval,
            Arc::clone(&pending),
        ));
        Self { pending, task }
    }

    pub async fn submit(&self, chat_id: i64, up_to: DateTime<Utc>) -> bool {
        self.pending.lock().await.submit(chat_id, up_to)
    }
}

impl Drop for ReadReceiptDebouncer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_flush_loop(
    store: ChatStore,
    reader_id: i64,
    flush_interval: Duration,
    pending: Arc<Mutex<PendingReads>>,
) {
    let mut interval = tokio::time::interval(flush_interval);
    interval.reset(); // skip immediate first tick
    loop {
        interval.tick().await;
        let drained = pending.lock().await.drain();
        for (chat_id, up_to) in drained {
            if let Err(error) = store.advance_read_before(chat_id, reader_id, up_to).await {
                tracing::warn!(
                    error = ?error,
                    reader_id,
                    chat_id,
                    "failed to flush read position, will retry"
                );
                pending.lock().await.restore(chat_id, up_to);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    #[test]
    fn submit_keeps_the_newest_position_per_chat() {
        let mut reads = PendingReads::new();
        assert!(reads.submit(1, at(10)));
        assert!(reads.submit(1, at(30)));
        assert!(!reads.submit(1, at(20)), "older position must be ignored");
        assert_eq!(reads.pending_count(), 1);

        let drained = reads.drain();
        assert_eq!(drained, vec![(1, at(30))]);
    }

    #[test]
    fn resubmitting_a_flushed_position_is_rejected() {
        let mut reads = PendingReads::new();
        reads.submit(1, at(10));
        reads.drain();

        assert!(!reads.submit(1, at(10)));
        assert!(!reads.submit(1, at(5)));
        assert!(reads.submit(1, at(11)));
    }

    #[test]
    fn chats_are_tracked_independently() {
        let mut reads = PendingReads::new();
        reads.submit(1, at(10));
        reads.submit(2, at(20));
        assert_eq!(reads.pending_count(), 2);

        let mut drained = reads.drain();
        drained.sort_unstable();
        assert_eq!(drained, vec![(1, at(10)), (2, at(20))]);
        assert_eq!(reads.pending_count(), 0);
    }

    #[test]
    fn restore_retries_unless_a_newer_submission_arrived() {
        let mut reads = PendingReads::new();
        reads.submit(1, at(10));
        let drained = reads.drain();
        assert_eq!(drained, vec![(1, at(10))]);

        reads.restore(1, at(10));
        assert_eq!(reads.drain(), vec![(1, at(10))]);

        // Newer submission between drain and restore wins.
        reads.restore(1, at(10));
        reads.submit(1, at(20));
        assert_eq!(reads.drain(), vec![(1, at(20))]);
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_on_the_interval() {
        let store = ChatStore::memory();
        let chat = store.resolve_personal_chat(1, 2).await.unwrap();

        let debouncer =
            ReadReceiptDebouncer::spawn(store.clone(), 1, Duration::from_millis(1000));
        let position = Utc::now();
        assert!(debouncer.submit(chat.chat_id, position).await);

        assert!(store.read_before(chat.chat_id, 1).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        tokio::task::yield_now().await;

        assert_eq!(store.read_before(chat.chat_id, 1).await.unwrap(), Some(position));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_flushes() {
        let store = ChatStore::memory();
        let chat = store.resolve_personal_chat(1, 2).await.unwrap();

        let debouncer =
            ReadReceiptDebouncer::spawn(store.clone(), 1, Duration::from_millis(1000));
        debouncer.submit(chat.chat_id, Utc::now()).await;
        drop(debouncer);

        tokio::time::sleep(Duration::from_millis(2000)).await;
        tokio::task::yield_now().await;

        assert!(store.read_before(chat.chat_id, 1).await.unwrap().is_none());
    }
}
