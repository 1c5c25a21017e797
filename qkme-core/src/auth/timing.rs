//! Constant-time comparisons
//!
//! Fingerprint checks run against attacker-supplied certificates, so they
//! must not short-circuit on the first differing byte.

use subtle::ConstantTimeEq;

/// Constant-time byte slice comparison
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.ct_eq(b).into()
}

/// Constant-time fingerprint comparison, case-insensitive on hex input
pub fn fingerprints_match(presented: &str, registered: &str) -> bool {
    let presented = presented.to_ascii_lowercase();
    let registered = registered.to_ascii_lowercase();
    constant_time_compare(presented.as_bytes(), registered.as_bytes())
}
