//! Game-world collaborator interface
//!
//! The core never simulates the world itself. Everything it needs from the
//! game (who controls what, who is hostile to whom, which transforms are
//! visible to a session) comes through this narrow trait. The karma engine
//! additionally receives pre-assembled damage contexts from whoever drives
//! the simulation.

use shared::{EntityId, EntityTransform, SessionId};

/// What the server core asks of the game simulation.
pub trait GameWorld: Send {
    /// The entity currently controlled by a session, if it has spawned.
    fn subject_of(&self, session: SessionId) -> Option<EntityId>;

    /// Whether the session's controlled subject is alive.
    fn is_alive(&self, session: SessionId) -> bool;

    /// Transforms of the entities a session can currently see, already
    /// distance-gated by the given range.
    fn visible_transforms(&self, session: SessionId, range: f32) -> Vec<EntityTransform>;

    /// Mission progress words broadcast to clients.
    fn mission_states(&self) -> Vec<u16>;

    /// Whether the round has finished on its own (mission over, everyone
    /// dead, destination reached).
    fn round_completed(&self) -> bool;

    fn on_round_start(&mut self, level_seed: &str, sub: &str, mode: &str);

    fn on_round_end(&mut self);

    /// Applies a client-originated entity event that arrived in order.
    fn apply_client_event(&mut self, sender: SessionId, entity: EntityId, payload: &[u8]);
}

/// A world with nothing in it. Stands in wherever the real simulation is
/// not wired up: the bare server binary and the test suite.
#[derive(Debug, Default)]
pub struct HeadlessWorld {
    round_running: bool,
}

impl GameWorld for HeadlessWorld {
    fn subject_of(&self, _session: SessionId) -> Option<EntityId> {
        None
    }

    fn is_alive(&self, _session: SessionId) -> bool {
        self.round_running
    }

    fn visible_transforms(&self, _session: SessionId, _range: f32) -> Vec<EntityTransform> {
        Vec::new()
    }

    fn mission_states(&self) -> Vec<u16> {
        Vec::new()
    }

    fn round_completed(&self) -> bool {
        false
    }

    fn on_round_start(&mut self, _level_seed: &str, _sub: &str, _mode: &str) {
        self.round_running = true;
    }

    fn on_round_end(&mut self) {
        self.round_running = false;
    }

    fn apply_client_event(&mut self, _sender: SessionId, _entity: EntityId, _payload: &[u8]) {}
}
