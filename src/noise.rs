//! Noise sources for the central-DP (`standard` plan) aggregation path.
//!
//! Production draws Laplace noise from a CSPRNG (`rand_chacha`, the same
//! crate `cooprefr-bettersys`'s backend and `paritytech-polkadot-sdk` pull
//! in for their own randomized components). Tests use a deterministic
//! source seeded from the bucket key, matching the reference
//! implementation's "seeded-for-replay" carve-out in §4.6.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// A source of Laplace-distributed noise for a given scale `b`.
pub trait NoiseSource: Send + Sync {
    /// Draw one sample from `Laplace(0, b)`.
    fn laplace(&self, b: f64) -> f64;
}

/// Samples from a fresh CSPRNG on every call — the production source.
pub struct CryptoNoiseSource;

impl NoiseSource for CryptoNoiseSource {
    fn laplace(&self, b: f64) -> f64 {
        let mut rng = ChaCha20Rng::from_entropy();
        sample_laplace(&mut rng, b)
    }
}

/// Deterministic noise source seeded from `(site_id, metric, window_start)`,
/// for reducer-replay tests where byte-identical output is asserted (§8).
pub struct SeededNoiseSource {
    seed: u64,
}

impl SeededNoiseSource {
    pub fn for_bucket(site_id: &str, metric: &str, window_start_rfc3339: &str) -> Self {
        let digest = blake3::hash(format!("{site_id}|{metric}|{window_start_rfc3339}").as_bytes());
        let bytes = digest.as_bytes();
        let seed = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        Self { seed }
    }
}

impl NoiseSource for SeededNoiseSource {
    fn laplace(&self, b: f64) -> f64 {
        let mut rng = ChaCha20Rng::seed_from_u64(self.seed);
        sample_laplace(&mut rng, b)
    }
}

/// Inverse-CDF sampling: `u ~ Uniform(-0.5, 0.5)`, `x = -b*sign(u)*ln(1-2|u|)`.
fn sample_laplace(rng: &mut ChaCha20Rng, b: f64) -> f64 {
    let u: f64 = rng.gen_range(-0.5..0.5);
    -b * u.signum() * (1.0 - 2.0 * u.abs()).ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_source_is_deterministic() {
        let a = SeededNoiseSource::for_bucket("site-a", "pageviews", "2026-07-31T00:00:00Z");
        let b = SeededNoiseSource::for_bucket("site-a", "pageviews", "2026-07-31T00:00:00Z");
        assert_eq!(a.laplace(1.0), b.laplace(1.0));
    }

    #[test]
    fn different_buckets_differ() {
        let a = SeededNoiseSource::for_bucket("site-a", "pageviews", "2026-07-31T00:00:00Z");
        let b = SeededNoiseSource::for_bucket("site-b", "pageviews", "2026-07-31T00:00:00Z");
        assert_ne!(a.laplace(1.0), b.laplace(1.0));
    }
}
