use crate::rewind::error::RewindError;

/// Index of a registered rewindable object within the coordinator. Also
/// stored in event records so replay can route an event back to the object
/// that decodes it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct RewinderId(pub usize);

impl std::fmt::Display for RewinderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rewinder #{}", self.0)
    }
}

/// Capability implemented by every simulated object that participates in
/// rewind. All four operations must be deterministic given identical input
/// byte sequences; that determinism is the foundation of the whole
/// rollback contract.
pub trait Rewindable {
    /// Serializes the object's full current state.
    fn capture(&self) -> Vec<u8>;

    /// Restores the object from a previously captured state. Failure here
    /// means the simulation can no longer be reconciled and is treated as
    /// fatal by the coordinator.
    fn restore(&mut self, state: &[u8]) -> Result<(), RewindError>;

    /// Best-effort reversal of an event while the journal walks backwards.
    fn undo(&mut self, event: &[u8]);

    /// Re-applies an event while the journal walks forwards again.
    fn replay(&mut self, event: &[u8]);
}

/// The external physics/world step. Advances world state by exactly
/// `ticks` fixed steps; must be deterministic for identical inputs.
pub trait Simulator {
    fn simulate(&mut self, ticks: u32);
}
