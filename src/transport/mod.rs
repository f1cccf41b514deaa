pub mod channel;
pub mod discovery;
pub mod error;
pub mod event;
pub mod host;
pub mod peer;
pub mod stun;
