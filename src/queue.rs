use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};

use crate::error::JobError;
use crate::models::WorkItem;

/// Unbounded FIFO hand-off from admission to the worker pool.
///
/// Pushing never blocks. Any number of workers may pop; each item is handed
/// to exactly one of them. Every popped item must be acknowledged, which the
/// [`Delivery`] guard does when dropped, so [`WorkQueue::join`] can wait for
/// the backlog to drain.
pub struct WorkQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<WorkItem>>>,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<WorkItem>>,
    unfinished: AtomicUsize,
    drained: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: AsyncMutex::new(rx),
            unfinished: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    pub fn push(&self, item: WorkItem) -> Result<(), JobError> {
        let sender = self.sender.lock();
        let tx = sender.as_ref().ok_or(JobError::QueueClosed)?;

        self.unfinished.fetch_add(1, Ordering::AcqRel);

        if tx.send(item).is_err() {
            self.task_done();
            return Err(JobError::QueueClosed);
        }

        Ok(())
    }

    /// Waits for the next item. Returns `None` once the queue is closed and
    /// everything pushed before that has been handed out.
    pub async fn pop(&self) -> Option<Delivery<'_>> {
        let mut rx = self.receiver.lock().await;
        let item = rx.recv().await?;

        Some(Delivery { item, queue: self })
    }

    /// Stops accepting new items. Items already queued are still delivered.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    /// Items pushed but not yet acknowledged.
    pub fn pending(&self) -> usize {
        self.unfinished.load(Ordering::Acquire)
    }

    /// Resolves once every pushed item has been acknowledged.
    pub async fn join(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending() == 0 {
                return;
            }

            notified.await;
        }
    }

    fn task_done(&self) {
        if self.unfinished.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A popped item. Acknowledges it on drop, whichever way the worker leaves
/// its processing code.
pub struct Delivery<'a> {
    item: WorkItem,
    queue: &'a WorkQueue,
}

impl Delivery<'_> {
    pub fn item(&self) -> &WorkItem {
        &self.item
    }
}

impl Drop for Delivery<'_> {
    fn drop(&mut self) {
        self.queue.task_done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    fn item(id: &str) -> WorkItem {
        WorkItem {
            job_id: id.to_owned(),
            input: PathBuf::from(format!("{id}.csv")),
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = WorkQueue::new();
        for id in ["a", "b", "c"] {
            queue.push(item(id)).unwrap();
        }

        let mut seen = vec![];
        for _ in 0..3 {
            let delivery = queue.pop().await.unwrap();
            seen.push(delivery.item().job_id.clone());
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_pending_tracks_acknowledgement() {
        let queue = WorkQueue::new();
        queue.push(item("a")).unwrap();
        queue.push(item("b")).unwrap();
        assert_eq!(queue.pending(), 2);

        let delivery = queue.pop().await.unwrap();
        assert_eq!(queue.pending(), 2);
        drop(delivery);
        assert_eq!(queue.pending(), 1);
    }

    #[tokio::test]
    async fn test_join_waits_for_drain() {
        let queue = Arc::new(WorkQueue::new());
        queue.push(item("a")).unwrap();

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let delivery = queue.pop().await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
                drop(delivery);
            })
        };

        tokio::time::timeout(Duration::from_secs(5), queue.join())
            .await
            .expect("queue never drained");
        assert_eq!(queue.pending(), 0);
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn test_join_on_empty_queue_returns() {
        let queue = WorkQueue::new();
        tokio::time::timeout(Duration::from_secs(1), queue.join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_rejects_push_and_drains_remaining() {
        let queue = WorkQueue::new();
        queue.push(item("a")).unwrap();
        queue.close();

        assert!(matches!(queue.push(item("b")), Err(JobError::QueueClosed)));
        assert_eq!(queue.pop().await.unwrap().item().job_id, "a");
        assert!(queue.pop().await.is_none());
    }
}
