use crate::{rewind::rewindable::RewinderId, types::Tick};

/// Payload of a journal record. States can be discarded once a newer
/// confirmed state exists; events must be retained while any future rewind
/// could still replay them, and are re-applied exactly once per forward
/// pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKind {
    /// Serialized full state of one rewindable at the record's tick.
    State {
        rewinder: RewinderId,
        buffer: Vec<u8>,
    },
    /// Serialized discrete action, decoded and applied by its rewinder.
    Event {
        rewinder: RewinderId,
        buffer: Vec<u8>,
    },
}

/// One entry of the rewind journal. The record owns its byte buffer; it is
/// freed with the record, never shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewindRecord {
    /// Tick at which the state was sampled or the event was issued.
    pub tick: Tick,
    /// True only for records derived from server-authoritative data.
    pub confirmed: bool,
    pub kind: RecordKind,
}

impl RewindRecord {
    pub fn state(tick: Tick, rewinder: RewinderId, buffer: Vec<u8>, confirmed: bool) -> Self {
        Self {
            tick,
            confirmed,
            kind: RecordKind::State { rewinder, buffer },
        }
    }

    pub fn event(tick: Tick, rewinder: RewinderId, buffer: Vec<u8>, confirmed: bool) -> Self {
        Self {
            tick,
            confirmed,
            kind: RecordKind::Event { rewinder, buffer },
        }
    }

    pub fn is_state(&self) -> bool {
        matches!(self.kind, RecordKind::State { .. })
    }

    pub fn is_event(&self) -> bool {
        matches!(self.kind, RecordKind::Event { .. })
    }

    /// The rewindable this record belongs to.
    pub fn rewinder(&self) -> RewinderId {
        match &self.kind {
            RecordKind::State { rewinder, .. } => *rewinder,
            RecordKind::Event { rewinder, .. } => *rewinder,
        }
    }

    pub fn buffer(&self) -> &[u8] {
        match &self.kind {
            RecordKind::State { buffer, .. } => buffer,
            RecordKind::Event { buffer, .. } => buffer,
        }
    }
}
