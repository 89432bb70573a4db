//! The durable, serialized action queue.

use crate::error::{SyncError, SyncResult};
use crate::store::StateStore;
use mirrorsync_protocol::{ActionId, CompactionPlan, PendingAction, PendingQueue, QueueOp};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Owns the pending queue and keeps it mirrored in the [`StateStore`].
///
/// Every mutation holds an internal lock, writes to the store first and
/// only then commits in memory, so a failed write leaves the in-memory
/// queue as it was.
pub struct ActionQueue {
    store: Arc<dyn StateStore>,
    queue: Mutex<PendingQueue>,
}

impl ActionQueue {
    /// Loads the queue from the store.
    pub async fn open(store: Arc<dyn StateStore>) -> SyncResult<Self> {
        let actions = store.list_actions().await.map_err(into_queue_error)?;
        debug!(pending = actions.len(), "loaded pending actions");
        Ok(Self {
            store,
            queue: Mutex::new(PendingQueue::from_actions(actions)),
        })
    }

    /// Enqueues an action, compacting it against pending intents.
    pub async fn enqueue(&self, action: PendingAction) -> SyncResult<CompactionPlan> {
        let mut queue = self.queue.lock().await;
        let mut next = queue.clone();
        let plan = next.enqueue(action);
        apply_plan(self.store.as_ref(), &plan).await?;
        *queue = next;
        Ok(plan)
    }

    /// Returns all pending actions in replay order.
    pub async fn snapshot(&self) -> Vec<PendingAction> {
        self.queue.lock().await.snapshot()
    }

    /// Returns true if any pending action reads or writes `path`.
    pub async fn touches(&self, path: &str) -> bool {
        self.queue.lock().await.touches(path)
    }

    /// Returns the number of pending actions.
    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Returns true if nothing is pending.
    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    /// Locks the queue for the duration of one replayed action.
    ///
    /// Enqueues wait until the guard is dropped, so an action cannot be
    /// compacted away while it is being applied.
    pub async fn lock(&self) -> QueueGuard<'_> {
        QueueGuard {
            store: self.store.as_ref(),
            queue: self.queue.lock().await,
        }
    }
}

/// Exclusive access to the queue, obtained through [`ActionQueue::lock`].
pub struct QueueGuard<'a> {
    store: &'a dyn StateStore,
    queue: MutexGuard<'a, PendingQueue>,
}

impl QueueGuard<'_> {
    /// Returns a pending action by ID.
    pub fn get(&self, id: ActionId) -> Option<&PendingAction> {
        self.queue.get(id)
    }

    /// Removes an action from the store and the queue.
    pub async fn remove(&mut self, id: ActionId) -> SyncResult<Option<PendingAction>> {
        if self.queue.get(id).is_none() {
            return Ok(None);
        }
        self.store
            .remove_action(id)
            .await
            .map_err(into_queue_error)?;
        Ok(self.queue.remove(id))
    }

    /// Returns the number of pending actions.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

async fn apply_plan(store: &dyn StateStore, plan: &CompactionPlan) -> SyncResult<()> {
    for op in &plan.ops {
        let result = match op {
            QueueOp::Append(action) => store.append_action(action).await,
            QueueOp::Replace(action) => store.replace_action(action).await,
            QueueOp::Remove(id) => store.remove_action(*id).await,
        };
        result.map_err(into_queue_error)?;
    }
    Ok(())
}

fn into_queue_error(err: SyncError) -> SyncError {
    match err {
        SyncError::Queue(_) => err,
        other => SyncError::queue(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStateStore;
    use mirrorsync_protocol::ActionKind;

    async fn open() -> (Arc<MemoryStateStore>, ActionQueue) {
        let store = Arc::new(MemoryStateStore::new());
        let queue = ActionQueue::open(store.clone()).await.unwrap();
        (store, queue)
    }

    #[tokio::test]
    async fn enqueue_mirrors_compaction_in_store() {
        let (store, queue) = open().await;
        queue.enqueue(PendingAction::update("a")).await.unwrap();
        queue.enqueue(PendingAction::create("b")).await.unwrap();
        queue.enqueue(PendingAction::delete("a")).await.unwrap();

        let stored = store.list_actions().await.unwrap();
        assert_eq!(stored, queue.snapshot().await);
        assert_eq!(stored[0].kind, ActionKind::Delete);
        assert_eq!(stored[1].kind, ActionKind::Create);
    }

    #[tokio::test]
    async fn failed_store_write_leaves_queue_unchanged() {
        let (store, queue) = open().await;
        queue.enqueue(PendingAction::create("a")).await.unwrap();

        store.set_unavailable(true);
        let err = queue.enqueue(PendingAction::delete("a")).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn reopen_restores_order() {
        let (store, queue) = open().await;
        queue.enqueue(PendingAction::create("a")).await.unwrap();
        queue.enqueue(PendingAction::move_to("x", "y")).await.unwrap();
        let before = queue.snapshot().await;
        drop(queue);

        let reopened = ActionQueue::open(store).await.unwrap();
        assert_eq!(reopened.snapshot().await, before);
        assert!(reopened.touches("x").await);
    }

    #[tokio::test]
    async fn guard_removes_from_store() {
        let (store, queue) = open().await;
        let action = PendingAction::create("a");
        let id = action.id;
        queue.enqueue(action).await.unwrap();

        let mut guard = queue.lock().await;
        assert!(guard.get(id).is_some());
        assert!(guard.remove(id).await.unwrap().is_some());
        assert!(guard.remove(id).await.unwrap().is_none());
        assert!(guard.is_empty());
        drop(guard);

        assert!(store.list_actions().await.unwrap().is_empty());
    }
}
