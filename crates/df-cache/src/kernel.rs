//! Evaluation kernels.
//!
//! `compact_spline_value` is the scalar interpolation routine applied once
//! per cached spline record; it is branch-light and index-addressed so the
//! same body would work as a device kernel. The Poisson likelihood kernels
//! use `wide::f64x4` with a scalar fallback; `wide::f64x4::ln()` is too
//! inaccurate (~1000 ULP), so logarithms are taken lane-by-lane with the
//! scalar `f64::ln()`.

use wide::f64x4;

/// Evaluate a compact cubic spline at parameter value `x`.
///
/// `data` is the packed representation: `data[0]` is the domain lower bound,
/// `data[1]` the inverse knot spacing, and `data[2..]` the control-point
/// values on the uniform grid. `x` is clamped into
/// `[lower_clamp, upper_clamp]` before evaluation (clamping policy: the
/// stored parameter itself is never modified).
///
/// Cubic Hermite segment between the two bracketing knots, with
/// centered-difference slopes in the interior and one-sided slopes at the
/// edge knots.
#[inline(always)]
pub fn compact_spline_value(x: f64, lower_clamp: f64, upper_clamp: f64, data: &[f64]) -> f64 {
    let dim = data.len() - 2;

    let mut x = x;
    if x < lower_clamp {
        x = lower_clamp;
    }
    if x > upper_clamp {
        x = upper_clamp;
    }

    // Spline coordinate: knot units above the lower bound.
    let s = (x - data[0]) * data[1];

    let mut ix = s as isize;
    if ix < 0 {
        ix = 0;
    }
    if ix > dim as isize - 2 {
        ix = dim as isize - 2;
    }
    let ix = ix as usize;

    let fx = s - ix as f64;
    let fxx = fx * fx;
    let fxxx = fx * fxx;

    let p1 = data[2 + ix];
    let p2 = data[3 + ix];

    let m1 = if ix > 0 { 0.5 * (p2 - data[1 + ix]) } else { p2 - p1 };
    let m2 = if ix + 2 < dim { 0.5 * (data[4 + ix] - p1) } else { p2 - p1 };

    p1 * (2.0 * fxxx - 3.0 * fxx + 1.0)
        + m1 * (fxxx - 2.0 * fxx + fx)
        + p2 * (3.0 * fxx - 2.0 * fxxx)
        + m2 * (fxxx - fxx)
}

/// Masked lane-by-lane `ln()` using scalar `f64::ln()`.
///
/// Lanes with `mask[i] == 0.0` return `0.0` without calling `ln()`; those
/// lanes are multiplied by the mask downstream and do not contribute.
#[inline(always)]
fn ln_f64x4_masked(v: f64x4, mask: [f64; 4]) -> f64x4 {
    let arr: [f64; 4] = v.into();
    f64x4::from([
        if mask[0] == 0.0 { 0.0 } else { arr[0].ln() },
        if mask[1] == 0.0 { 0.0 } else { arr[1].ln() },
        if mask[2] == 0.0 { 0.0 } else { arr[2].ln() },
        if mask[3] == 0.0 { 0.0 } else { arr[3].ln() },
    ])
}

#[inline(always)]
fn poisson_llh_bin_scalar(exp: f64, obs: f64, obs_ln_obs: f64, mask: f64) -> f64 {
    2.0 * (exp - obs) + mask * 2.0 * (obs_ln_obs - obs * exp.ln())
}

/// Poisson likelihood-ratio sum over bins:
///
///   `llh_i = 2*(exp_i - obs_i) + 2*obs_i*ln(obs_i/exp_i)`
///
/// When `mask_i = 0` (obs == 0) the log term drops and `llh_i = 2*exp_i`.
///
/// # Arguments
/// * `expected` - MC counts per bin (must be clamped >= 1e-10 by caller)
/// * `observed` - data counts per bin
/// * `obs_ln_obs` - pre-computed `obs_i * ln(obs_i)` per bin (0 for obs == 0)
/// * `obs_mask` - `1.0` if `obs > 0`, else `0.0`
///
/// # Panics
/// Panics if slice lengths are not equal.
pub fn poisson_llh_simd(
    expected: &[f64],
    observed: &[f64],
    obs_ln_obs: &[f64],
    obs_mask: &[f64],
) -> f64 {
    let n = expected.len();
    assert_eq!(n, observed.len());
    assert_eq!(n, obs_ln_obs.len());
    assert_eq!(n, obs_mask.len());

    if !use_simd() {
        return poisson_llh_scalar(expected, observed, obs_ln_obs, obs_mask);
    }

    let chunks = n / 4;
    let remainder = n % 4;
    let two = f64x4::splat(2.0);

    let mut acc = f64x4::ZERO;
    for i in 0..chunks {
        let offset = i * 4;
        let exp = f64x4::from(&expected[offset..offset + 4]);
        let obs = f64x4::from(&observed[offset..offset + 4]);
        let olo = f64x4::from(&obs_ln_obs[offset..offset + 4]);
        let mask = f64x4::from(&obs_mask[offset..offset + 4]);

        let mask_arr: [f64; 4] = mask.into();
        let ln_exp = ln_f64x4_masked(exp, mask_arr);
        // llh = 2*(exp - obs) + mask * 2*(obs_ln_obs - obs*ln_exp)
        acc += two * (exp - obs) + mask * two * (olo - obs * ln_exp);
    }

    let mut total: f64 = acc.reduce_add();

    let start = chunks * 4;
    for i in start..start + remainder {
        total += poisson_llh_bin_scalar(expected[i], observed[i], obs_ln_obs[i], obs_mask[i]);
    }

    total
}

/// Scalar reference implementation of the Poisson sum (same interface as the
/// SIMD version).
pub fn poisson_llh_scalar(
    expected: &[f64],
    observed: &[f64],
    obs_ln_obs: &[f64],
    obs_mask: &[f64],
) -> f64 {
    let n = expected.len();
    assert_eq!(n, observed.len());
    assert_eq!(n, obs_ln_obs.len());
    assert_eq!(n, obs_mask.len());

    let mut total = 0.0;
    for i in 0..n {
        total += poisson_llh_bin_scalar(expected[i], observed[i], obs_ln_obs[i], obs_mask[i]);
    }
    total
}

/// Check if SIMD should be used on the current platform.
#[inline(always)]
fn use_simd() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        is_x86_feature_detected!("avx2")
    }
    #[cfg(target_arch = "aarch64")]
    {
        // NEON is always available on aarch64
        true
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    // Packed data for a spline over [0, 3] with unit spacing and knots
    // [0, 0, 1, 0].
    fn bump_spline() -> Vec<f64> {
        vec![0.0, 1.0, 0.0, 0.0, 1.0, 0.0]
    }

    #[test]
    fn test_spline_boundary_knots() {
        let data = bump_spline();
        assert_relative_eq!(
            compact_spline_value(0.0, f64::NEG_INFINITY, f64::INFINITY, &data),
            0.0,
            epsilon = 1e-15
        );
        assert_relative_eq!(
            compact_spline_value(3.0, f64::NEG_INFINITY, f64::INFINITY, &data),
            0.0,
            epsilon = 1e-15
        );
    }

    #[test]
    fn test_spline_hits_every_knot() {
        let data = vec![-1.0, 2.0, 0.5, 1.0, 2.0, 1.5];
        // Lower bound -1, spacing 0.5, so knots sit at -1.0, -0.5, 0.0, 0.5.
        for (i, expected) in [0.5, 1.0, 2.0, 1.5].iter().enumerate() {
            let x = -1.0 + 0.5 * i as f64;
            let v = compact_spline_value(x, f64::NEG_INFINITY, f64::INFINITY, &data);
            assert_relative_eq!(v, *expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_spline_midpoint_matches_hermite_reference() {
        let data = bump_spline();
        // Segment [1, 2]: p1 = 0, p2 = 1, centered slopes m1 = (1-0)/2,
        // m2 = (0-0)/2. At fx = 0.5 the Hermite basis gives:
        let fx: f64 = 0.5;
        let (fxx, fxxx) = (fx * fx, fx * fx * fx);
        let reference = 0.5 * (fxxx - 2.0 * fxx + fx) + 1.0 * (3.0 * fxx - 2.0 * fxxx);
        let v = compact_spline_value(1.5, f64::NEG_INFINITY, f64::INFINITY, &data);
        assert_relative_eq!(v, reference, epsilon = 1e-15);
    }

    #[test]
    fn test_spline_clamps_to_bounds() {
        let data = vec![0.0, 1.0, 0.25, 0.5, 1.0, 2.0];
        let at_clamp = compact_spline_value(3.0, 0.0, 3.0, &data);
        let beyond = compact_spline_value(250.0, 0.0, 3.0, &data);
        assert_eq!(beyond.to_bits(), at_clamp.to_bits());
        assert_relative_eq!(beyond, 2.0, epsilon = 1e-12);

        let below = compact_spline_value(-17.0, 0.0, 3.0, &data);
        assert_relative_eq!(below, 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_spline_two_knots_is_linear() {
        // Minimum-size spline: two knots, straight segment.
        let data = vec![0.0, 1.0, 1.0, 3.0];
        let v = compact_spline_value(0.25, f64::NEG_INFINITY, f64::INFINITY, &data);
        assert_relative_eq!(v, 1.5, epsilon = 1e-12);
    }

    fn make_test_hists(n: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>) {
        let mut expected = Vec::with_capacity(n);
        let mut observed = Vec::with_capacity(n);
        let mut olo = Vec::with_capacity(n);
        let mut mask = Vec::with_capacity(n);
        for i in 0..n {
            let exp = 30.0 + (i as f64 * 11.7) % 80.0;
            let obs = if i % 6 == 0 { 0.0 } else { (exp + (i as f64 * 2.9 - 30.0)).max(1.0).round() };
            expected.push(exp.max(1e-10));
            observed.push(obs);
            olo.push(if obs > 0.0 { obs * obs.ln() } else { 0.0 });
            mask.push(if obs > 0.0 { 1.0 } else { 0.0 });
        }
        (expected, observed, olo, mask)
    }

    #[test]
    fn test_poisson_llh_simd_matches_scalar() {
        for n in [1, 2, 3, 4, 5, 7, 8, 15, 16, 100, 1000] {
            let (exp, obs, olo, mask) = make_test_hists(n);
            let simd_result = poisson_llh_simd(&exp, &obs, &olo, &mask);
            let scalar_result = poisson_llh_scalar(&exp, &obs, &olo, &mask);
            assert_relative_eq!(simd_result, scalar_result, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_poisson_llh_single_bin_obs_zero() {
        let result = poisson_llh_simd(&[21.0], &[0.0], &[0.0], &[0.0]);
        assert_relative_eq!(result, 42.0, epsilon = 1e-15);
    }

    #[test]
    fn test_poisson_llh_perfect_agreement_is_zero() {
        let obs = 55.0_f64;
        let result = poisson_llh_simd(&[55.0], &[obs], &[obs * obs.ln()], &[1.0]);
        assert_relative_eq!(result, 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_poisson_llh_known_value() {
        let (exp, obs) = (50.0_f64, 55.0_f64);
        let result = poisson_llh_simd(&[exp], &[obs], &[obs * obs.ln()], &[1.0]);
        let reference = 2.0 * (exp - obs) + 2.0 * obs * (obs / exp).ln();
        assert_relative_eq!(result, reference, epsilon = 1e-10);
    }

    proptest! {
        // SIMD and scalar implementations must agree for a wide range of
        // inputs, including empty bins.
        #[test]
        fn prop_poisson_llh_simd_matches_scalar_random(
            n in 1usize..=128,
            expected in proptest::collection::vec(1e-10f64..1e3, 128),
            observed in proptest::collection::vec(0u16..2000, 128),
        ) {
            let exp = &expected[..n];
            let obs: Vec<f64> = observed[..n].iter().map(|&x| x as f64).collect();
            let olo: Vec<f64> = obs.iter().map(|&o| if o > 0.0 { o * o.ln() } else { 0.0 }).collect();
            let mask: Vec<f64> = obs.iter().map(|&o| if o > 0.0 { 1.0 } else { 0.0 }).collect();

            let simd_result = poisson_llh_simd(exp, &obs, &olo, &mask);
            let scalar_result = poisson_llh_scalar(exp, &obs, &olo, &mask);

            prop_assert!((simd_result - scalar_result).abs() < 1e-9);
            prop_assert!(simd_result.is_finite());
        }

        // The interpolant must pass through every control point and stay
        // finite inside the domain.
        #[test]
        fn prop_spline_interpolates_knots(
            knots in proptest::collection::vec(-10.0f64..10.0, 2..32),
            lower in -5.0f64..5.0,
            inv_step in 0.1f64..10.0,
        ) {
            let mut data = vec![lower, inv_step];
            data.extend_from_slice(&knots);
            for (i, &k) in knots.iter().enumerate() {
                let x = lower + i as f64 / inv_step;
                let v = compact_spline_value(x, f64::NEG_INFINITY, f64::INFINITY, &data);
                prop_assert!((v - k).abs() < 1e-6 * (1.0 + k.abs()));
            }
        }
    }
}
