//! Key generation interface
//!
//! The QKD link is an external collaborator; the KME only consumes its
//! "produce key material" interface. Calls may block for as long as the link
//! needs, so callers run them on the blocking thread pool.

use hkdf::Hkdf;
use qkme_core::*;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Largest key HKDF-SHA256 can expand to, in bits
pub const MAX_GENERATED_KEY_BITS: u32 = 255 * 32 * 8;

const HKDF_INFO: &[u8] = b"qkme privacy amplification v1";

/// Producer of raw key material
pub trait KeyGenerator: Send + Sync {
    /// Produce up to `count` keys of `size_bits` each.
    /// May return fewer keys than asked for; never returns keys of another size.
    fn generate(&self, count: usize, size_bits: u32) -> Result<Vec<KeyMaterial>>;
}

/// Stand-in for a QKD link: OS randomness, configurable latency and batch
/// capacity, and an HKDF pass in place of privacy amplification.
#[derive(Debug)]
pub struct SimulatedQkdLink {
    latency: Duration,
    max_batch: usize,
    link_up: AtomicBool,
}

impl SimulatedQkdLink {
    pub fn new(latency: Duration, max_batch: usize) -> Self {
        SimulatedQkdLink {
            latency,
            max_batch,
            link_up: AtomicBool::new(true),
        }
    }

    /// Simulate the optical link going down or coming back
    pub fn set_link_up(&self, up: bool) {
        self.link_up.store(up, Ordering::Release);
    }

    pub fn is_link_up(&self) -> bool {
        self.link_up.load(Ordering::Acquire)
    }

    fn distill(size_bits: u32) -> Result<KeyMaterial> {
        let out_len = (size_bits / 8) as usize;

        // Sift twice the target length of raw bits, then compress
        let mut raw = vec![0u8; out_len * 2];
        OsRng.fill_bytes(&mut raw);
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);

        let hk = Hkdf::<Sha256>::new(Some(&salt), &raw);
        let mut okm = vec![0u8; out_len];
        hk.expand(HKDF_INFO, &mut okm)
            .map_err(|_| KmeError::Internal(format!("cannot expand to {} bits", size_bits)))?;

        raw.iter_mut().for_each(|b| *b = 0);
        Ok(KeyMaterial::new(okm))
    }
}

impl Default for SimulatedQkdLink {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), 256)
    }
}

impl KeyGenerator for SimulatedQkdLink {
    fn generate(&self, count: usize, size_bits: u32) -> Result<Vec<KeyMaterial>> {
        if !self.is_link_up() {
            return Err(KmeError::Internal("QKD link is down".to_string()));
        }

        if size_bits == 0 || size_bits % 8 != 0 || size_bits > MAX_GENERATED_KEY_BITS {
            return Err(KmeError::Internal(format!(
                "unsupported key size {} bits",
                size_bits
            )));
        }

        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        (0..count.min(self.max_batch))
            .map(|_| Self::distill(size_bits))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generates_requested_size() {
        let link = SimulatedQkdLink::new(Duration::ZERO, 16);
        let keys = link.generate(4, 256).unwrap();
        assert_eq!(keys.len(), 4);
        assert!(keys.iter().all(|k| k.bit_len() == 256));
        assert_ne!(keys[0], keys[1]);
    }

    #[test]
    fn test_batch_capacity_limits_output() {
        let link = SimulatedQkdLink::new(Duration::ZERO, 3);
        assert_eq!(link.generate(10, 128).unwrap().len(), 3);
    }

    #[test]
    fn test_link_down_fails() {
        let link = SimulatedQkdLink::new(Duration::ZERO, 3);
        link.set_link_up(false);
        assert!(link.generate(1, 256).is_err());
        link.set_link_up(true);
        assert!(link.generate(1, 256).is_ok());
    }

    #[test]
    fn test_rejects_bad_sizes() {
        let link = SimulatedQkdLink::default();
        assert!(link.generate(1, 12).is_err());
        assert!(link.generate(1, MAX_GENERATED_KEY_BITS + 8).is_err());
    }
}
