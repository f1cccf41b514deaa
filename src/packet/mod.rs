pub mod buffer;
pub mod envelope;
