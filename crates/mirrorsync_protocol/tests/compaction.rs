//! Replaying a compacted queue must bring the remote store to the final local state.

use mirrorsync_protocol::{ActionKind, PendingAction, PendingQueue};
use proptest::prelude::*;
use std::collections::BTreeMap;

const PATHS: [&str; 4] = ["a", "b", "docs/c", "docs/d"];

/// Applies the queue the way the outbound handlers do, reading the final
/// local content at replay time.
fn replay(
    actions: &[PendingAction],
    local: &BTreeMap<String, u8>,
    remote: &mut BTreeMap<String, u8>,
) {
    for action in actions {
        match action.kind {
            ActionKind::Create | ActionKind::Update => {
                if let Some(content) = local.get(&action.path) {
                    remote.insert(action.path.clone(), *content);
                }
            }
            ActionKind::Delete => {
                remote.remove(&action.path);
            }
            ActionKind::Move => {
                let target = action.target_path.clone().unwrap();
                if let Some(content) = remote.remove(&action.path) {
                    remote.insert(target, content);
                } else if let Some(content) = local.get(&target) {
                    remote.insert(target, *content);
                }
            }
        }
    }
}

type Tree = BTreeMap<String, u8>;

fn run(initial: &[bool], ops: &[(u8, usize, usize, u8)]) -> (Tree, Tree) {
    let mut local: BTreeMap<String, u8> = BTreeMap::new();
    for (i, present) in initial.iter().enumerate() {
        if *present {
            local.insert(PATHS[i].to_string(), i as u8);
        }
    }
    let mut remote = local.clone();
    let mut queue = PendingQueue::new();

    for (op, from, to, content) in ops {
        let path = PATHS[*from].to_string();
        let target = PATHS[*to].to_string();
        let action = match op {
            0 if !local.contains_key(&path) => {
                local.insert(path.clone(), *content);
                PendingAction::create(path)
            }
            0 | 1 if local.contains_key(&path) => {
                local.insert(path.clone(), *content);
                PendingAction::update(path)
            }
            2 if local.contains_key(&path) => {
                local.remove(&path);
                PendingAction::delete(path)
            }
            3 if local.contains_key(&path) && !local.contains_key(&target) => {
                let moved = local.remove(&path).unwrap();
                local.insert(target.clone(), moved);
                PendingAction::move_to(path, target)
            }
            _ => continue,
        };
        queue.enqueue(action);
    }

    replay(&queue.snapshot(), &local, &mut remote);
    (local, remote)
}

proptest! {
    #[test]
    fn compacted_replay_converges(
        initial in prop::collection::vec(any::<bool>(), 4),
        ops in prop::collection::vec((0u8..4, 0usize..4, 0usize..4, any::<u8>()), 0..40),
    ) {
        let (local, remote) = run(&initial, &ops);
        prop_assert_eq!(local, remote);
    }

    #[test]
    fn without_moves_one_intent_per_path(
        ops in prop::collection::vec((0u8..3, 0usize..4, 0usize..4, any::<u8>()), 0..60),
    ) {
        let mut queue = PendingQueue::new();
        let mut local: BTreeMap<String, u8> = BTreeMap::new();
        for (op, from, _, content) in &ops {
            let path = PATHS[*from].to_string();
            let action = match op {
                0 if !local.contains_key(&path) => { local.insert(path.clone(), *content); PendingAction::create(path) }
                0 | 1 if local.contains_key(&path) => { local.insert(path.clone(), *content); PendingAction::update(path) }
                2 if local.contains_key(&path) => { local.remove(&path); PendingAction::delete(path) }
                _ => continue,
            };
            queue.enqueue(action);
        }
        prop_assert!(queue.len() <= PATHS.len());
    }
}

#[test]
fn rename_while_offline_converges() {
    let (local, remote) = run(&[true, false, false, false], &[(3, 0, 1, 0)]);
    assert_eq!(local, remote);
    assert!(remote.contains_key("b"));
    assert!(!remote.contains_key("a"));
}

#[test]
fn churn_on_one_path_converges() {
    let ops = [
        (1, 0, 0, 5),
        (3, 0, 2, 0),
        (0, 0, 0, 9),
        (2, 2, 0, 0),
        (3, 0, 2, 0),
        (1, 2, 0, 7),
    ];
    let (local, remote) = run(&[true, true, false, false], &ops);
    assert_eq!(local, remote);
}

#[test]
fn rename_chain_after_recreating_source_converges() {
    // a -> b, a recreated, b -> docs/c: the new file at a must reach the remote.
    let ops = [(3, 0, 1, 0), (0, 0, 0, 9), (3, 1, 2, 0)];
    let (local, remote) = run(&[true, false, false, false], &ops);
    assert_eq!(local, remote);
    assert_eq!(remote.get("a"), Some(&9));
    assert_eq!(remote.get("docs/c"), Some(&0));
}
