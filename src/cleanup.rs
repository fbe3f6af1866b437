use std::{
    collections::VecDeque,
    sync::Mutex,
};

use crossbeam::channel::Sender;
use log::{debug, warn};

use crate::{
    buffer::Session,
    btree::ops,
    database::Database,
    error::{ErrorKind, StoreError},
    types::TreeId,
};

/// One deferred maintenance step. Every action is idempotent and
/// restartable: crashing between enqueue and execution only delays
/// the work.
#[derive(Debug, Clone, PartialEq)]
pub enum CleanupAction {
    /// Prune the MVV chain of one key (aborted versions, dead
    /// history, physical removal of emptied chains).
    PruneKey { tree_id: TreeId, key: Vec<u8> },
    /// Sweep a whole tree; recovery schedules this for every tree.
    PruneTree { tree_id: TreeId },
    /// Drop recovered aborted transactions once the sweeps are done.
    RetireRecovered,
}

impl CleanupAction {
    /// Lower is sooner. Key prunes run before tree sweeps, and
    /// retirement strictly after the sweeps that justify it.
    fn priority(&self) -> u8 {
        match self {
            CleanupAction::PruneKey { .. } => 0,
            CleanupAction::PruneTree { .. } => 1,
            CleanupAction::RetireRecovered => 2,
        }
    }
}

/// Queue of background maintenance, drained by the cleanup worker.
pub struct CleanupManager {
    queue: Mutex<VecDeque<CleanupAction>>,
    waker: Mutex<Option<Sender<()>>>,
}

impl CleanupManager {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            waker: Mutex::new(None),
        }
    }

    pub fn set_waker(&self, waker: Option<Sender<()>>) {
        *self.waker.lock().unwrap() = waker;
    }

    pub fn enqueue(&self, action: CleanupAction) {
        {
            let mut queue = self.queue.lock().unwrap();
            let at = queue
                .iter()
                .position(|a| a.priority() > action.priority())
                .unwrap_or(queue.len());
            queue.insert(at, action);
        }
        if let Some(waker) = self.waker.lock().unwrap().as_ref() {
            let _ = waker.try_send(());
        }
    }

    pub fn enqueue_prune_key(&self, tree_id: TreeId, key: Vec<u8>) {
        self.enqueue(CleanupAction::PruneKey { tree_id, key });
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    fn pop(&self) -> Option<CleanupAction> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Execute up to `limit` queued actions. A busy page puts the
    /// action back and ends the pass; the next tick retries.
    pub fn drain(&self, session: &Session, limit: usize) -> Result<usize, StoreError> {
        let mut done = 0;
        while done < limit {
            let action = match self.pop() {
                Some(a) => a,
                None => break,
            };
            match self.run(session, &action) {
                Ok(()) => done += 1,
                Err(e) if e.kind() == ErrorKind::InUse => {
                    debug!("cleanup action deferred, page in use: {:?}", action);
                    self.enqueue(action);
                    break;
                }
                Err(e) => {
                    warn!("cleanup action {:?} failed: {}", action, e);
                }
            }
        }
        Ok(done)
    }

    fn run(&self, session: &Session, action: &CleanupAction) -> Result<(), StoreError> {
        match action {
            CleanupAction::PruneKey { tree_id, key } => {
                let tree = match Database::catalog().tree_by_id(*tree_id) {
                    Some(t) => t,
                    // the tree is gone; its pages went with it
                    None => return Ok(()),
                };
                let volume = match Database::catalog().volume(tree.volume_id()) {
                    Some(v) => v,
                    None => return Ok(()),
                };
                ops::prune_key(session, &volume, &tree, key)
            }
            CleanupAction::PruneTree { tree_id } => {
                let tree = match Database::catalog().tree_by_id(*tree_id) {
                    Some(t) => t,
                    None => return Ok(()),
                };
                let volume = match Database::catalog().volume(tree.volume_id()) {
                    Some(v) => v,
                    None => return Ok(()),
                };
                ops::prune_tree(session, &volume, &tree)
            }
            CleanupAction::RetireRecovered => {
                Database::transaction_index().retire_recovered();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        let m = CleanupManager::new();
        m.enqueue(CleanupAction::RetireRecovered);
        m.enqueue(CleanupAction::PruneTree { tree_id: 1 });
        m.enqueue(CleanupAction::PruneKey {
            tree_id: 1,
            key: b"k".to_vec(),
        });

        assert_eq!(
            m.pop(),
            Some(CleanupAction::PruneKey {
                tree_id: 1,
                key: b"k".to_vec()
            })
        );
        assert_eq!(m.pop(), Some(CleanupAction::PruneTree { tree_id: 1 }));
        assert_eq!(m.pop(), Some(CleanupAction::RetireRecovered));
    }
}
