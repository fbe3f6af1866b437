use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    thread::sleep,
    time::{Duration, Instant},
};

use crate::{
    error::{ErrorKind, StoreError},
    types::{PageKey, SessionId, StoreResult},
};

static SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a claim owner: one `Exchange`, or one background
/// worker. Unrelated to transaction identity; claims are short
/// physical latches, not transaction locks.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    timeout: Duration,
}

impl Session {
    pub fn new(timeout: Duration) -> Self {
        Self {
            id: SESSION_ID.fetch_add(1, Ordering::Relaxed),
            timeout,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Default)]
struct ClaimState {
    exclusive: Option<(SessionId, usize)>,
    shared: HashMap<SessionId, usize>,
}

impl ClaimState {
    fn is_free(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }
}

/// Two-mode page latches with per-session nesting.
///
/// A claim request polls under a table mutex; the hold times are
/// short (claims never span I/O on the caller side of the journal),
/// so contention resolves in a few spins and the timeout only fires
/// on genuine stalls.
pub struct ClaimTable {
    inner: Mutex<HashMap<PageKey, ClaimState>>,
}

const CLAIM_POLL: Duration = Duration::from_millis(1);

impl ClaimTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Blocking acquire; fails with `InUse` when the claim cannot be
    /// granted within `timeout`.
    pub fn acquire(
        &self,
        session: SessionId,
        key: PageKey,
        mode: ClaimMode,
        timeout: Duration,
    ) -> StoreResult {
        let start = Instant::now();
        loop {
            if self.try_acquire(session, key, mode) {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                let err = StoreError::new(
                    ErrorKind::InUse,
                    &format!("claim on {} not granted within {:?}", key, timeout),
                );
                err.show_backtrace();
                return Err(err);
            }
            sleep(CLAIM_POLL);
        }
    }

    /// One attempt, no waiting.
    pub fn try_acquire(&self, session: SessionId, key: PageKey, mode: ClaimMode) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.entry(key).or_default();

        // nested re-entry by the owning session
        if let Some((owner, nest)) = state.exclusive {
            if owner == session {
                state.exclusive = Some((owner, nest + 1));
                return true;
            }
            return false;
        }

        match mode {
            ClaimMode::Shared => {
                *state.shared.entry(session).or_insert(0) += 1;
                true
            }
            ClaimMode::Exclusive => {
                let foreign_readers = state
                    .shared
                    .keys()
                    .any(|owner| *owner != session);
                if foreign_readers {
                    return false;
                }
                if let Some(&nest) = state.shared.get(&session) {
                    // sole shared holder: promotion
                    state.shared.remove(&session);
                    state.exclusive = Some((session, nest + 1));
                } else {
                    state.exclusive = Some((session, 1));
                }
                true
            }
        }
    }

    /// Upgrade an already-held shared claim. Succeeds only when the
    /// caller is the sole holder; otherwise the caller must release
    /// and reacquire.
    pub fn upgrade(&self, session: SessionId, key: PageKey) -> StoreResult {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.entry(key).or_default();
        if state.exclusive.map(|(owner, _)| owner == session) == Some(true) {
            return Ok(());
        }
        if state.shared.len() == 1 && state.shared.contains_key(&session) {
            let nest = state.shared.remove(&session).unwrap();
            state.exclusive = Some((session, nest));
            return Ok(());
        }
        Err(StoreError::new(
            ErrorKind::Retry,
            &format!("cannot upgrade claim on {} in place", key),
        ))
    }

    pub fn release(&self, session: SessionId, key: PageKey, mode: ClaimMode) {
        let mut inner = self.inner.lock().unwrap();
        let state = match inner.get_mut(&key) {
            Some(s) => s,
            None => return,
        };

        match mode {
            ClaimMode::Exclusive => {
                if let Some((owner, nest)) = state.exclusive {
                    if owner == session {
                        if nest > 1 {
                            state.exclusive = Some((owner, nest - 1));
                        } else {
                            state.exclusive = None;
                        }
                    }
                }
            }
            ClaimMode::Shared => {
                // a shared release after an in-place upgrade unwinds
                // the exclusive nest instead
                if let Some((owner, nest)) = state.exclusive {
                    if owner == session {
                        if nest > 1 {
                            state.exclusive = Some((owner, nest - 1));
                        } else {
                            state.exclusive = None;
                        }
                        if state.is_free() {
                            inner.remove(&key);
                        }
                        return;
                    }
                }
                if let Some(nest) = state.shared.get_mut(&session) {
                    *nest -= 1;
                    if *nest == 0 {
                        state.shared.remove(&session);
                    }
                }
            }
        }

        if state.is_free() {
            inner.remove(&key);
        }
    }

    pub fn is_claimed(&self, key: &PageKey) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.get(key).map(|s| !s.is_free()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> PageKey {
        PageKey::new(0, 5)
    }

    #[test]
    fn test_shared_claims_coexist() {
        let t = ClaimTable::new();
        assert!(t.try_acquire(1, key(), ClaimMode::Shared));
        assert!(t.try_acquire(2, key(), ClaimMode::Shared));
        assert!(!t.try_acquire(3, key(), ClaimMode::Exclusive));
        t.release(1, key(), ClaimMode::Shared);
        t.release(2, key(), ClaimMode::Shared);
        assert!(t.try_acquire(3, key(), ClaimMode::Exclusive));
    }

    #[test]
    fn test_exclusive_excludes() {
        let t = ClaimTable::new();
        assert!(t.try_acquire(1, key(), ClaimMode::Exclusive));
        assert!(!t.try_acquire(2, key(), ClaimMode::Shared));
        // nested re-entry by the owner is fine
        assert!(t.try_acquire(1, key(), ClaimMode::Shared));
        t.release(1, key(), ClaimMode::Shared);
        t.release(1, key(), ClaimMode::Exclusive);
        assert!(t.try_acquire(2, key(), ClaimMode::Shared));
    }

    #[test]
    fn test_upgrade_sole_holder() {
        let t = ClaimTable::new();
        assert!(t.try_acquire(1, key(), ClaimMode::Shared));
        t.upgrade(1, key()).unwrap();
        assert!(!t.try_acquire(2, key(), ClaimMode::Shared));
        t.release(1, key(), ClaimMode::Exclusive);
        assert!(!t.is_claimed(&key()));
    }

    #[test]
    fn test_upgrade_contended_fails() {
        let t = ClaimTable::new();
        assert!(t.try_acquire(1, key(), ClaimMode::Shared));
        assert!(t.try_acquire(2, key(), ClaimMode::Shared));
        let err = t.upgrade(1, key()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Retry);
    }

    #[test]
    fn test_acquire_times_out_in_use() {
        let t = ClaimTable::new();
        assert!(t.try_acquire(1, key(), ClaimMode::Exclusive));
        let err = t
            .acquire(2, key(), ClaimMode::Shared, Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InUse);
    }
}
