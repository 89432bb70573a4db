//! Compacting queue of pending actions.

use crate::action::{ActionKind, PendingAction};
use crate::types::ActionId;
use std::collections::HashMap;
use tracing::debug;

/// A single mutation of the durable queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOp {
    /// Append a new action at the end of the queue.
    Append(PendingAction),
    /// Rewrite an existing action in place, keeping its queue position.
    Replace(PendingAction),
    /// Remove an action.
    Remove(ActionId),
}

/// The durable-store mutations produced by one enqueue.
///
/// Applying `ops` in order to a store holding the same actions as the
/// queue before the enqueue leaves it holding the same actions as the queue
/// after it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionPlan {
    /// Ordered mutations.
    pub ops: Vec<QueueOp>,
}

impl CompactionPlan {
    /// Returns true if the enqueue collapsed into an existing intent.
    pub fn is_noop(&self) -> bool {
        self.ops.is_empty()
    }

    /// Returns the actions appended by this plan.
    pub fn appended(&self) -> impl Iterator<Item = &PendingAction> {
        self.ops.iter().filter_map(|op| match op {
            QueueOp::Append(action) => Some(action),
            _ => None,
        })
    }

    /// Returns the IDs removed by this plan.
    pub fn removed(&self) -> impl Iterator<Item = &ActionId> {
        self.ops.iter().filter_map(|op| match op {
            QueueOp::Remove(id) => Some(id),
            _ => None,
        })
    }
}

/// An ordered queue of pending actions that collapses redundant intents.
///
/// The queue keeps actions in causal order together with an index from
/// each path to the latest action that leaves a local object at that path.
/// Enqueuing consults only that latest action:
///
/// - `Create` + `Update` stays `Create` (replay re-reads the latest bytes)
/// - `Create` + `Delete` cancels out
/// - `Update` + `Delete` becomes `Delete`
/// - `Delete` + `Create`/`Update` becomes `Update`
/// - `Move(x→p)` + `Delete(p)` becomes `Delete(x)`
///
/// A `Move(a→b)` first clears intents already targeting `b`, then folds
/// into a pending `Create(a)` or `Move(x→a)` when there is one.
///
/// # Invariants
///
/// - Actions for the same path replay in the order they were observed
/// - Every compaction step is reflected in the returned [`CompactionPlan`]
#[derive(Debug, Clone, Default)]
pub struct PendingQueue {
    /// Actions in replay order.
    entries: Vec<PendingAction>,
    /// Current path to the latest action leaving an object there.
    latest: HashMap<String, ActionId>,
}

impl PendingQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a queue from actions in stored order.
    ///
    /// No compaction is applied; the actions were compacted when enqueued.
    pub fn from_actions(actions: Vec<PendingAction>) -> Self {
        let mut queue = Self {
            entries: actions,
            latest: HashMap::new(),
        };
        for action in &queue.entries {
            queue
                .latest
                .insert(action.current_path().to_string(), action.id);
        }
        queue
    }

    /// Enqueues an action, collapsing it into pending intents for its path.
    pub fn enqueue(&mut self, action: PendingAction) -> CompactionPlan {
        let mut plan = CompactionPlan::default();
        match (action.kind, action.target_path.clone()) {
            (ActionKind::Move, Some(target)) => self.enqueue_move(action, target, &mut plan),
            // Malformed moves are kept verbatim so the drain loop can report them.
            (ActionKind::Move, None) => self.push(action, &mut plan),
            _ => self.enqueue_simple(action, &mut plan),
        }
        plan
    }

    fn enqueue_simple(&mut self, action: PendingAction, plan: &mut CompactionPlan) {
        let Some(latest) = self.latest_for(&action.path).cloned() else {
            self.push(action, plan);
            return;
        };

        use ActionKind::{Create, Delete, Move, Update};
        match (latest.kind, action.kind) {
            (Create, Create) | (Create, Update) | (Update, Create) | (Update, Update)
            | (Delete, Delete) => {
                debug!(path = %action.path, kept = %latest.kind, dropped = %action.kind, "collapsed pending action");
            }
            (Create, Delete) => {
                debug!(path = %action.path, "create and delete cancel out");
                self.remove_entry(latest.id, plan);
            }
            (Update, Delete) => self.replace_entry(latest.id, Delete, &action.path, plan),
            (Delete, Create) | (Delete, Update) => {
                self.replace_entry(latest.id, Update, &action.path, plan)
            }
            (Move, Delete) => {
                // The moved asset is still at its source path remotely.
                let source = latest.path.clone();
                self.replace_entry(latest.id, Delete, &source, plan);
            }
            (Move, Create) | (Move, Update) => {
                self.push(with_kind(action, Update), plan);
            }
            (_, Move) => self.push(action, plan),
        }
    }

    fn enqueue_move(&mut self, action: PendingAction, target: String, plan: &mut CompactionPlan) {
        let source = action.path.clone();
        if source == target {
            return;
        }

        self.clear_target(&target, plan);

        match self.latest_for(&source).cloned() {
            Some(latest) if latest.kind == ActionKind::Create => {
                self.remove_entry(latest.id, plan);
                let create = PendingAction {
                    kind: ActionKind::Create,
                    path: target,
                    target_path: None,
                    ..action
                };
                self.enqueue_simple(create, plan);
            }
            Some(latest) if latest.kind == ActionKind::Update => {
                self.remove_entry(latest.id, plan);
                let update = PendingAction::update(target).enqueued_at(action.enqueued_at);
                self.push(action, plan);
                self.push(update, plan);
            }
            // Folding would move the pending move behind later intents on
            // its source path, so it only happens when there are none.
            Some(latest)
                if latest.kind == ActionKind::Move && !self.touched_after(latest.id, &latest.path) =>
            {
                self.remove_entry(latest.id, plan);
                if latest.path != target {
                    let chained = PendingAction {
                        path: latest.path.clone(),
                        target_path: Some(target),
                        ..action
                    };
                    self.push(chained, plan);
                }
            }
            _ => self.push(action, plan),
        }
    }

    /// Makes room for an object moving onto `target`.
    fn clear_target(&mut self, target: &str, plan: &mut CompactionPlan) {
        let Some(latest) = self.latest_for(target).cloned() else {
            return;
        };
        match latest.kind {
            ActionKind::Create => self.remove_entry(latest.id, plan),
            ActionKind::Update => self.replace_entry(latest.id, ActionKind::Delete, target, plan),
            ActionKind::Move => {
                let source = latest.path.clone();
                self.replace_entry(latest.id, ActionKind::Delete, &source, plan);
            }
            ActionKind::Delete => {}
        }
    }

    fn push(&mut self, action: PendingAction, plan: &mut CompactionPlan) {
        self.latest
            .insert(action.current_path().to_string(), action.id);
        self.entries.push(action.clone());
        plan.ops.push(QueueOp::Append(action));
    }

    fn replace_entry(
        &mut self,
        id: ActionId,
        kind: ActionKind,
        path: &str,
        plan: &mut CompactionPlan,
    ) {
        let Some(index) = self.position(id) else {
            return;
        };
        let old_path = self.entries[index].current_path().to_string();
        let entry = &mut self.entries[index];
        entry.kind = kind;
        entry.path = path.to_string();
        entry.target_path = None;
        let replaced = entry.clone();

        debug!(action_id = %id, action = %replaced, "rewrote pending action");
        self.reindex(&old_path);
        self.reindex(path);
        plan.ops.push(QueueOp::Replace(replaced));
    }

    fn remove_entry(&mut self, id: ActionId, plan: &mut CompactionPlan) {
        if let Some(removed) = self.take(id) {
            plan.ops.push(QueueOp::Remove(removed.id));
        }
    }

    fn take(&mut self, id: ActionId) -> Option<PendingAction> {
        let index = self.position(id)?;
        let removed = self.entries.remove(index);
        self.reindex(removed.current_path());
        Some(removed)
    }

    /// Recomputes the latest action for a path.
    fn reindex(&mut self, path: &str) {
        match self
            .entries
            .iter()
            .rev()
            .find(|a| a.current_path() == path)
        {
            Some(action) => {
                self.latest.insert(path.to_string(), action.id);
            }
            None => {
                self.latest.remove(path);
            }
        }
    }

    /// Returns true if an action queued after `id` reads or writes `path`.
    fn touched_after(&self, id: ActionId, path: &str) -> bool {
        let Some(index) = self.position(id) else {
            return false;
        };
        self.entries[index + 1..]
            .iter()
            .any(|a| a.path == path || a.target_path.as_deref() == Some(path))
    }

    fn position(&self, id: ActionId) -> Option<usize> {
        self.entries.iter().position(|a| a.id == id)
    }

    /// Removes an action, typically after it was applied.
    pub fn remove(&mut self, id: ActionId) -> Option<PendingAction> {
        self.take(id)
    }

    /// Returns the latest action leaving an object at `path`.
    pub fn latest_for(&self, path: &str) -> Option<&PendingAction> {
        let id = self.latest.get(path)?;
        self.entries.iter().find(|a| a.id == *id)
    }

    /// Returns true if any pending action leaves an object at `path`.
    pub fn has_intent_for(&self, path: &str) -> bool {
        self.latest.contains_key(path)
    }

    /// Returns true if any pending action reads or writes `path`.
    ///
    /// Unlike [`has_intent_for`](Self::has_intent_for) this also covers the
    /// source side of pending moves.
    pub fn touches(&self, path: &str) -> bool {
        self.entries
            .iter()
            .any(|a| a.path == path || a.target_path.as_deref() == Some(path))
    }

    /// Returns an action by ID.
    pub fn get(&self, id: ActionId) -> Option<&PendingAction> {
        self.entries.iter().find(|a| a.id == id)
    }

    /// Iterates over actions in replay order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingAction> {
        self.entries.iter()
    }

    /// Returns a copy of all actions in replay order.
    pub fn snapshot(&self) -> Vec<PendingAction> {
        self.entries.clone()
    }

    /// Returns the number of pending actions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn with_kind(action: PendingAction, kind: ActionKind) -> PendingAction {
    PendingAction { kind, ..action }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(queue: &PendingQueue) -> Vec<String> {
        queue.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn fifo_for_unrelated_paths() {
        let mut queue = PendingQueue::new();
        queue.enqueue(PendingAction::create("a"));
        queue.enqueue(PendingAction::update("b"));
        queue.enqueue(PendingAction::delete("c"));
        assert_eq!(kinds(&queue), vec!["CREATE a", "UPDATE b", "DELETE c"]);
    }

    #[test]
    fn create_then_update_stays_create() {
        let mut queue = PendingQueue::new();
        queue.enqueue(PendingAction::create("a"));
        let plan = queue.enqueue(PendingAction::update("a"));
        assert!(plan.is_noop());
        assert_eq!(kinds(&queue), vec!["CREATE a"]);
    }

    #[test]
    fn create_update_delete_cancels() {
        let mut queue = PendingQueue::new();
        let create = PendingAction::create("a");
        let create_id = create.id;
        queue.enqueue(create);
        queue.enqueue(PendingAction::update("a"));
        let plan = queue.enqueue(PendingAction::delete("a"));

        assert!(queue.is_empty());
        assert!(!queue.has_intent_for("a"));
        assert_eq!(plan.removed().copied().collect::<Vec<_>>(), vec![create_id]);
    }

    #[test]
    fn update_then_delete_becomes_delete_in_place() {
        let mut queue = PendingQueue::new();
        let update = PendingAction::update("a");
        let update_id = update.id;
        queue.enqueue(update);
        queue.enqueue(PendingAction::create("b"));
        queue.enqueue(PendingAction::delete("a"));

        assert_eq!(kinds(&queue), vec!["DELETE a", "CREATE b"]);
        assert_eq!(queue.iter().next().unwrap().id, update_id);
    }

    #[test]
    fn delete_then_create_becomes_update() {
        let mut queue = PendingQueue::new();
        queue.enqueue(PendingAction::delete("a"));
        let plan = queue.enqueue(PendingAction::create("a"));
        assert_eq!(kinds(&queue), vec!["UPDATE a"]);
        assert!(matches!(plan.ops.as_slice(), [QueueOp::Replace(_)]));
    }

    #[test]
    fn move_of_pending_create_becomes_create_at_target() {
        let mut queue = PendingQueue::new();
        queue.enqueue(PendingAction::create("docs/a.txt"));
        queue.enqueue(PendingAction::move_to("docs/a.txt", "docs/b.txt"));
        assert_eq!(kinds(&queue), vec!["CREATE docs/b.txt"]);
        assert!(!queue.has_intent_for("docs/a.txt"));
    }

    #[test]
    fn move_of_pending_update_keeps_identity() {
        let mut queue = PendingQueue::new();
        queue.enqueue(PendingAction::update("a"));
        queue.enqueue(PendingAction::move_to("a", "b"));
        assert_eq!(kinds(&queue), vec!["MOVE a -> b", "UPDATE b"]);
    }

    #[test]
    fn chained_moves_collapse() {
        let mut queue = PendingQueue::new();
        queue.enqueue(PendingAction::move_to("a", "b"));
        queue.enqueue(PendingAction::move_to("b", "c"));
        assert_eq!(kinds(&queue), vec!["MOVE a -> c"]);

        queue.enqueue(PendingAction::move_to("c", "a"));
        assert!(queue.is_empty());
    }

    #[test]
    fn delete_after_move_deletes_source() {
        let mut queue = PendingQueue::new();
        queue.enqueue(PendingAction::move_to("a", "b"));
        queue.enqueue(PendingAction::create("a"));
        queue.enqueue(PendingAction::delete("b"));
        assert_eq!(kinds(&queue), vec!["DELETE a", "CREATE a"]);
    }

    #[test]
    fn move_onto_pending_update_deletes_target_first() {
        let mut queue = PendingQueue::new();
        queue.enqueue(PendingAction::update("b"));
        queue.enqueue(PendingAction::move_to("a", "b"));
        assert_eq!(kinds(&queue), vec!["DELETE b", "MOVE a -> b"]);
    }

    #[test]
    fn malformed_move_is_kept_verbatim() {
        let mut queue = PendingQueue::new();
        let mut action = PendingAction::move_to("a", "b");
        action.target_path = None;
        queue.enqueue(action);
        assert_eq!(queue.len(), 1);
        assert!(queue.iter().next().unwrap().validate().is_err());
    }

    #[test]
    fn move_chain_does_not_overtake_recreated_source() {
        let mut queue = PendingQueue::new();
        queue.enqueue(PendingAction::move_to("x", "a"));
        queue.enqueue(PendingAction::create("x"));
        let plan = queue.enqueue(PendingAction::move_to("a", "b"));

        assert_eq!(plan.removed().count(), 0);
        assert_eq!(kinds(&queue), vec!["MOVE x -> a", "CREATE x", "MOVE a -> b"]);
        assert!(queue.has_intent_for("x"));
        assert!(queue.has_intent_for("b"));
    }

    #[test]
    fn touches_covers_move_sources() {
        let mut queue = PendingQueue::new();
        queue.enqueue(PendingAction::move_to("a", "b"));
        assert!(queue.touches("a"));
        assert!(queue.touches("b"));
        assert!(!queue.has_intent_for("a"));
        assert!(!queue.touches("c"));
    }

    #[test]
    fn remove_reindexes_path() {
        let mut queue = PendingQueue::new();
        queue.enqueue(PendingAction::move_to("x", "a"));
        let update = PendingAction::update("a");
        let update_id = update.id;
        queue.enqueue(update);

        assert_eq!(queue.latest_for("a").unwrap().id, update_id);
        queue.remove(update_id);
        assert_eq!(queue.latest_for("a").unwrap().kind, ActionKind::Move);
    }

    #[test]
    fn from_actions_preserves_order() {
        let actions = vec![
            PendingAction::update("a"),
            PendingAction::update("a"),
            PendingAction::delete("b"),
        ];
        let queue = PendingQueue::from_actions(actions.clone());
        assert_eq!(queue.snapshot(), actions);
        assert_eq!(queue.latest_for("a").unwrap().id, actions[1].id);
    }
}
