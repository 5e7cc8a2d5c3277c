//! Shared supervision trait for everything this daemon keeps running in the
//! background: command clients, log sources, and plugin instances. All
//! three are "start once, react to config changes, stop on demand" — one
//! `Actor` trait covers all of them regardless of domain.

use std::sync::Arc;

use crate::state::SystemState;

/// Outcome of calling [`Actor::reconfigure`] after a config change.
pub enum ReconfigureOutcome {
    /// Config unchanged — no action needed.
    NoChange,
    /// Applied in-place without tearing the actor down.
    Applied,
    /// Must stop and recreate the actor.
    RestartRequired,
}

/// Common trait for self-supervised background components. `start()` is
/// expected to spawn whatever OS thread or task the component needs and
/// return immediately.
pub trait Actor: Send + Sync {
    fn start(&self, state: Arc<SystemState>);

    /// Request the actor to stop. Implementations check their own
    /// cancellation flag; this call should not block.
    fn stop(&self) {}

    fn reconfigure(&self, _state: &Arc<SystemState>) -> ReconfigureOutcome {
        ReconfigureOutcome::NoChange
    }
}
