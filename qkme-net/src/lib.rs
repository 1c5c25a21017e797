//! ETSI GS QKD 014 wire formats and request decoding for qkme

pub mod protocol;
pub mod wire;

pub use protocol::*;
pub use wire::*;
