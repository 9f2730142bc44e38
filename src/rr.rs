//! Randomized-response (RR) decoder.
//!
//! Pure functions, no I/O — the effective channel probabilities, the
//! `+alpha` smoothing, and the clamp follow the privacy pipeline's Python
//! reference (`ldp/rr_decoder.py`) term for term. The variance formula is a
//! deliberate simplification of the original: it drops `rr_decoder.py`'s
//! `total < 1` edge-case correction, since spec.md's plain
//! `total * p * (1-p) / denominator^2` is authoritative where the two
//! disagree (see `DESIGN.md`).

/// Numerical floor below which a denominator is treated as zero.
pub const EPS_NUM: f64 = 1e-9;

/// Two-sided z-scores for the confidence levels the reducer publishes.
pub const Z_80: f64 = 1.2816;
pub const Z_95: f64 = 1.9599;

/// `(p, q)` for a randomized-response channel with privacy parameter `epsilon`.
///
/// `p = e^epsilon / (1 + e^epsilon)`, `q = 1 - p`.
pub fn prob_true(epsilon: f64) -> (f64, f64) {
    let exp = epsilon.exp();
    let p = exp / (1.0 + exp);
    (p, 1.0 - p)
}

/// Effective channel probabilities once client-side sampling is folded in.
///
/// Non-responders (the `1 - sampling_rate` fraction) default to a fair coin,
/// per §4.1: `p_eff = s*p + (1-s)*0.5`, `q_eff = s*q + (1-s)*0.5`.
pub fn adjusted_probability(epsilon: f64, sampling_rate: f64) -> (f64, f64) {
    let (p, q) = prob_true(epsilon);
    let baseline = 0.5;
    let p_adj = sampling_rate * p + (1.0 - sampling_rate) * baseline;
    let q_adj = sampling_rate * q + (1.0 - sampling_rate) * baseline;
    (p_adj, q_adj)
}

/// Unbiased estimate and variance from a count of privatized "true" bits.
///
/// Returns `(estimate, variance)`. If the channel is degenerate
/// (`|p_eff - q_eff| < EPS_NUM`), returns `(0.0, 0.0)` rather than dividing
/// by (near) zero.
pub fn unbiased_estimate(
    ones: f64,
    total: f64,
    epsilon: f64,
    sampling_rate: f64,
    alpha: f64,
) -> (f64, f64) {
    let (p_adj, q_adj) = adjusted_probability(epsilon, sampling_rate);
    let denominator = p_adj - q_adj;
    if denominator.abs() < EPS_NUM {
        return (0.0, 0.0);
    }

    let mut estimate = (ones - total * q_adj) / denominator;
    estimate += alpha;
    let upper = total / sampling_rate.max(EPS_NUM);
    estimate = estimate.max(0.0).min(upper);

    let variance = total * p_adj * (1.0 - p_adj) / (denominator * denominator);

    (estimate, variance)
}

/// Standard error from a (non-negative) variance.
pub fn standard_error(variance: f64) -> f64 {
    variance.max(0.0).sqrt()
}

/// Two-sided confidence interval `[estimate - z*se, estimate + z*se]`.
pub fn confidence_interval(estimate: f64, se: f64, z: f64) -> (f64, f64) {
    let se = if se.is_nan() { 0.0 } else { se };
    (estimate - z * se, estimate + z * se)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn prob_true_is_symmetric_around_half_at_zero_epsilon() {
        let (p, q) = prob_true(0.0);
        assert!((p - 0.5).abs() < 1e-12);
        assert!((q - 0.5).abs() < 1e-12);
    }

    #[test]
    fn degenerate_channel_returns_zero() {
        // sampling_rate = 0 forces p_eff = q_eff = 0.5 regardless of epsilon.
        let (e, v) = unbiased_estimate(50.0, 100.0, 2.0, 0.0, 0.5);
        assert_eq!(e, 0.0);
        assert_eq!(v, 0.0);
    }

    #[test]
    fn estimate_is_linear_in_ones() {
        // d(estimate)/d(ones) = 1/denominator, constant for fixed (eps, s).
        let total = 1000.0;
        let eps = 0.5;
        let s = 1.0;
        let (p_adj, q_adj) = adjusted_probability(eps, s);
        let denom = p_adj - q_adj;
        let (e1, _) = unbiased_estimate(100.0, total, eps, s, 0.0);
        let (e2, _) = unbiased_estimate(101.0, total, eps, s, 0.0);
        // Unless clamping kicks in, the slope should match 1/denom exactly.
        if e1 > 0.0 && e1 < total / s && e2 > 0.0 && e2 < total / s {
            assert!(((e2 - e1) - (1.0 / denom)).abs() < 1e-9);
        }
    }

    #[test]
    fn variance_is_monotonic_in_total() {
        let eps = 0.5;
        let s = 1.0;
        let (_, v1) = unbiased_estimate(300.0, 1000.0, eps, s, 0.5);
        let (_, v2) = unbiased_estimate(600.0, 2000.0, eps, s, 0.5);
        assert!(v2 > v1);
    }

    #[test]
    fn recovers_true_rate_within_error_bound() {
        // n=10_000, eps=0.5, true rate r=0.7: the empirical mean over 100
        // trials should land within 3*SE of r (property from the design doc).
        let eps = 0.5;
        let s = 1.0;
        let true_rate = 0.7;
        let n = 10_000usize;
        let (p_adj, _) = adjusted_probability(eps, s);
        let mut rng = StdRng::seed_from_u64(42);

        let mut estimates = Vec::with_capacity(100);
        let mut last_se = 0.0;
        for _ in 0..100 {
            let mut ones = 0.0;
            for _ in 0..n {
                let true_bit: f64 = if rng.gen::<f64>() < true_rate { 1.0 } else { 0.0 };
                let flip = rng.gen::<f64>() < p_adj;
                let observed = if flip { true_bit } else { 1.0 - true_bit };
                ones += observed;
            }
            let (e, v) = unbiased_estimate(ones, n as f64, eps, s, 0.0);
            last_se = standard_error(v);
            estimates.push(e / n as f64);
        }
        let mean: f64 = estimates.iter().sum::<f64>() / estimates.len() as f64;
        let se_of_rate = last_se / n as f64;
        assert!(
            (mean - true_rate).abs() < 3.0 * se_of_rate.max(0.02),
            "mean={mean} true_rate={true_rate} se={se_of_rate}"
        );
    }

    #[test]
    fn ci_ordering_holds() {
        let (e, v) = unbiased_estimate(700.0, 1000.0, 0.5, 1.0, 0.5);
        let se = standard_error(v);
        let (lo80, hi80) = confidence_interval(e, se, Z_80);
        let (lo95, hi95) = confidence_interval(e, se, Z_95);
        assert!(lo95 <= lo80);
        assert!(lo80 <= e);
        assert!(e <= hi80);
        assert!(hi80 <= hi95);
    }
}
