use thiserror::Error;

use crate::{rewind::rewindable::RewinderId, types::Tick};

/// Errors raised by the rewind journal. Inserting behind the consumed
/// boundary is a programmer error; callers treat it as fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JournalError {
    /// A record was inserted at a tick already consumed by a completed
    /// rewind.
    #[error("record at tick {tick} precedes the consumed boundary {boundary}")]
    BehindBoundary { tick: Tick, boundary: Tick },
}

/// Errors raised while coordinating a rewind. A failed restore indicates a
/// protocol or determinism bug, not a recoverable condition: a silent
/// partial rewind would desynchronize gameplay undetectably.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RewindError {
    /// A rewindable could not be restored from its state buffer.
    #[error("{rewinder} could not be restored from its state at tick {tick}")]
    RestoreFailed { rewinder: RewinderId, tick: Tick },

    /// A state buffer was corrupt or truncated.
    #[error("corrupt state buffer for {rewinder}: {detail}")]
    CorruptState {
        rewinder: RewinderId,
        detail: &'static str,
    },

    /// No state record exists at the rewind point for a rewindable. The
    /// coordinator prevents this by capturing a confirmed baseline at
    /// registration, so hitting it means the journal was corrupted.
    #[error("no state record for {rewinder} at or before tick {tick}")]
    MissingState { rewinder: RewinderId, tick: Tick },

    /// An event referenced a rewinder id that was never registered.
    #[error("event references unregistered {rewinder}")]
    UnknownRewinder { rewinder: RewinderId },

    #[error(transparent)]
    Journal(#[from] JournalError),
}
