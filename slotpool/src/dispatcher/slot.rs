//! One dispatcher slot: an endpoint, its wrapped remote, and a lifecycle state.
//!
//! State transitions are taken under the slot's own lock so exactly one caller
//! wins each of them. In particular only one terminator ever disposes a slot.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use super::Adapter;
use crate::id::SlotId;

/// Lifecycle of a slot.
///
/// `Idle ⇄ Running`, then `Idle | Running → Disposing → Disposed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Idle,
    Running,
    Disposing,
    Disposed,
}

impl SlotState {
    /// Idle or running: the slot still accepts work.
    pub fn is_live(self) -> bool {
        matches!(self, SlotState::Idle | SlotState::Running)
    }
}

pub(crate) struct Slot<A: Adapter> {
    id: SlotId,
    endpoint: A::Endpoint,
    remote: Arc<A::Remote>,
    state: Mutex<SlotState>,
}

impl<A: Adapter> Slot<A> {
    /// New slots start idle.
    pub fn new(endpoint: A::Endpoint, remote: A::Remote) -> Self {
        Self {
            id: SlotId::new(),
            endpoint,
            remote: Arc::new(remote),
            state: Mutex::new(SlotState::Idle),
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn endpoint(&self) -> &A::Endpoint {
        &self.endpoint
    }

    pub fn remote(&self) -> &A::Remote {
        &self.remote
    }

    /// Shared handle to the remote, as given to tasks.
    pub fn remote_handle(&self) -> Arc<A::Remote> {
        Arc::clone(&self.remote)
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!(slot = %self.id, "Slot state mutex poisoned - recovering");
            poisoned.into_inner()
        })
    }

    pub fn state(&self) -> SlotState {
        *self.lock()
    }

    fn transition(&self, from: &[SlotState], to: SlotState) -> bool {
        let mut state = self.lock();
        if from.contains(&state) {
            tracing::trace!(slot = %self.id, from = ?*state, to = ?to, "Slot transition");
            *state = to;
            true
        } else {
            false
        }
    }

    /// `Idle → Running`.
    pub fn try_start(&self) -> bool {
        self.transition(&[SlotState::Idle], SlotState::Running)
    }

    /// `Running → Idle`. Fails once disposal has begun.
    pub fn try_finish(&self) -> bool {
        self.transition(&[SlotState::Running], SlotState::Idle)
    }

    /// Claim the right to dispose this slot. Only the first caller wins.
    pub fn begin_dispose(&self) -> bool {
        self.transition(
            &[SlotState::Idle, SlotState::Running],
            SlotState::Disposing,
        )
    }

    pub fn mark_disposed(&self) {
        let mut state = self.lock();
        debug_assert_eq!(*state, SlotState::Disposing, "disposed without claim");
        *state = SlotState::Disposed;
    }
}
