pub mod coordinator;
pub mod error;
pub mod journal;
pub mod record;
pub mod rewindable;
