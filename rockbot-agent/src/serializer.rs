//! Work serialization and per-session cancellation.
//!
//! Each agent process has one logical execution slot: at most one
//! top-level turn or scheduled run at a time. User work preempts
//! scheduled work; scheduled work yields to users without waiting. The
//! session tracker guarantees that a new user message cancels any
//! still-running background loop from the previous message of the same
//! session before anything new runs.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Holder {
    Free,
    User,
    Scheduled,
}

struct SlotState {
    holder: Holder,
    /// Users waiting for the slot; scheduled acquisitions yield while any
    /// are queued.
    user_waiters: usize,
    /// Preemption signal for the current scheduled holder.
    preempt: Option<CancellationToken>,
}

struct SerializerInner {
    state: Mutex<SlotState>,
    changed: watch::Sender<u64>,
}

impl SerializerInner {
    fn bump(&self) {
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
    }
}

/// The single execution slot of an agent process.
#[derive(Clone)]
pub struct WorkSerializer {
    inner: Arc<SerializerInner>,
}

impl Default for WorkSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkSerializer {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            inner: Arc::new(SerializerInner {
                state: Mutex::new(SlotState {
                    holder: Holder::Free,
                    user_waiters: 0,
                    preempt: None,
                }),
                changed,
            }),
        }
    }

    /// Acquire the slot for user work, preempting any running scheduled
    /// task and waiting (cancellably) for the slot to free up.
    pub async fn acquire_for_user(&self, token: &CancellationToken) -> Option<WorkSlot> {
        let mut rx = self.inner.changed.subscribe();
        let mut registered = false;
        loop {
            {
                let mut state = self.inner.state.lock();
                match state.holder {
                    Holder::Free => {
                        state.holder = Holder::User;
                        if registered {
                            state.user_waiters -= 1;
                        }
                        return Some(WorkSlot {
                            inner: self.inner.clone(),
                            preempt: None,
                        });
                    }
                    Holder::Scheduled => {
                        if let Some(preempt) = &state.preempt {
                            preempt.cancel();
                        }
                    }
                    Holder::User => {}
                }
                if !registered {
                    state.user_waiters += 1;
                    registered = true;
                }
            }

            tokio::select! {
                _ = token.cancelled() => {
                    if registered {
                        self.inner.state.lock().user_waiters -= 1;
                        self.inner.bump();
                    }
                    return None;
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Acquire the slot for scheduled work, only if no user work is active
    /// or queued. Never waits. The returned slot carries a preemption
    /// token that trips when a user acquisition arrives.
    pub fn try_acquire_for_scheduled(&self) -> Option<WorkSlot> {
        let mut state = self.inner.state.lock();
        if state.holder != Holder::Free || state.user_waiters > 0 {
            return None;
        }
        let preempt = CancellationToken::new();
        state.holder = Holder::Scheduled;
        state.preempt = Some(preempt.clone());
        Some(WorkSlot {
            inner: self.inner.clone(),
            preempt: Some(preempt),
        })
    }
}

/// A scoped slot acquisition. Dropping it releases the slot on every exit
/// path.
pub struct WorkSlot {
    inner: Arc<SerializerInner>,
    preempt: Option<CancellationToken>,
}

impl WorkSlot {
    /// For scheduled slots: trips when a user acquisition wants the slot.
    pub fn preemption_token(&self) -> Option<CancellationToken> {
        self.preempt.clone()
    }
}

impl Drop for WorkSlot {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock();
            state.holder = Holder::Free;
            state.preempt = None;
        }
        self.inner.bump();
    }
}

/// Tracks the active background loop of each session.
///
/// `begin_session` cancels and replaces any prior loop for the session,
/// returning a fresh token linked to the host token plus a generation
/// counter used to retire the entry without racing a newer loop.
#[derive(Default)]
pub struct SessionTaskTracker {
    sessions: Mutex<HashMap<String, (u64, CancellationToken)>>,
    next_generation: Mutex<u64>,
}

impl SessionTaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_session(
        &self,
        session_id: &str,
        host_token: &CancellationToken,
    ) -> (u64, CancellationToken) {
        let generation = {
            let mut next = self.next_generation.lock();
            *next += 1;
            *next
        };
        let token = host_token.child_token();
        let mut sessions = self.sessions.lock();
        if let Some((_, prior)) = sessions.insert(session_id.to_string(), (generation, token.clone()))
        {
            prior.cancel();
        }
        (generation, token)
    }

    /// Retire a finished loop. A newer generation for the same session is
    /// left untouched.
    pub fn complete(&self, session_id: &str, generation: u64) {
        let mut sessions = self.sessions.lock();
        if let Some((current, _)) = sessions.get(session_id) {
            if *current == generation {
                sessions.remove(session_id);
            }
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }
}
