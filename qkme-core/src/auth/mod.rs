//! Authentication for qkme
//!
//! This module covers the identity side of the security plane:
//! - Client certificate inspection (common name, validity, fingerprint)
//! - The SAE registry maintained by admin tooling
//! - Resolution of a certificate to a registered SAE_ID
//! - Constant-time fingerprint comparison

pub mod certificate;
pub mod identity;
pub mod registry;
pub mod timing;

pub use certificate::*;
pub use identity::*;
pub use registry::*;
pub use timing::*;
