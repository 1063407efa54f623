//! Squared-L2 distance kernels with runtime width dispatch.
//!
//! The vector paths (AVX2, SSE2) win only once the dimension is large
//! enough to amortize the horizontal reduction; below `BF_UPBOUND_DIM`
//! the scalar loop is used unconditionally. Tails shorter than the vector
//! width go through a zero-padded stack buffer, so the main loop never
//! reads past either slice.

use std::sync::OnceLock;

/// Dimensions below this stay on the scalar loop.
pub const BF_UPBOUND_DIM: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    Avx2,
    Sse2,
    Scalar,
}

fn detected_width() -> Width {
    static WIDTH: OnceLock<Width> = OnceLock::new();
    *WIDTH.get_or_init(|| {
        #[cfg(target_arch = "x86_64")]
        {
            if is_x86_feature_detected!("avx2") {
                return Width::Avx2;
            }
            if is_x86_feature_detected!("sse2") {
                return Width::Sse2;
            }
        }
        Width::Scalar
    })
}

/// Human-readable name of the active kernel, for the startup banner.
pub fn simd_architecture() -> &'static str {
    match detected_width() {
        Width::Avx2 => "avx2",
        Width::Sse2 => "sse2",
        Width::Scalar => "scalar",
    }
}

#[inline]
fn l2_sqr_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn l2_sqr_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;
    let n = a.len();
    let mut acc = _mm256_setzero_ps();
    let mut i = 0;
    while i + 8 <= n {
        let va = _mm256_loadu_ps(a.as_ptr().add(i));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i));
        let diff = _mm256_sub_ps(va, vb);
        acc = _mm256_add_ps(acc, _mm256_mul_ps(diff, diff));
        i += 8;
    }
    if i < n {
        // Masked tail: copy the remainder into zero-padded buffers so the
        // full-width op contributes zero for the padding lanes.
        let mut ta = [0.0f32; 8];
        let mut tb = [0.0f32; 8];
        ta[..n - i].copy_from_slice(&a[i..]);
        tb[..n - i].copy_from_slice(&b[i..]);
        let va = _mm256_loadu_ps(ta.as_ptr());
        let vb = _mm256_loadu_ps(tb.as_ptr());
        let diff = _mm256_sub_ps(va, vb);
        acc = _mm256_add_ps(acc, _mm256_mul_ps(diff, diff));
    }
    let hi = _mm256_extractf128_ps(acc, 1);
    let lo = _mm256_castps256_ps128(acc);
    let sum4 = _mm_add_ps(hi, lo);
    let sum2 = _mm_add_ps(sum4, _mm_movehl_ps(sum4, sum4));
    let sum1 = _mm_add_ss(sum2, _mm_shuffle_ps(sum2, sum2, 0x1));
    _mm_cvtss_f32(sum1)
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn l2_sqr_sse2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;
    let n = a.len();
    let mut acc = _mm_setzero_ps();
    let mut i = 0;
    while i + 4 <= n {
        let va = _mm_loadu_ps(a.as_ptr().add(i));
        let vb = _mm_loadu_ps(b.as_ptr().add(i));
        let diff = _mm_sub_ps(va, vb);
        acc = _mm_add_ps(acc, _mm_mul_ps(diff, diff));
        i += 4;
    }
    if i < n {
        let mut ta = [0.0f32; 4];
        let mut tb = [0.0f32; 4];
        ta[..n - i].copy_from_slice(&a[i..]);
        tb[..n - i].copy_from_slice(&b[i..]);
        let va = _mm_loadu_ps(ta.as_ptr());
        let vb = _mm_loadu_ps(tb.as_ptr());
        let diff = _mm_sub_ps(va, vb);
        acc = _mm_add_ps(acc, _mm_mul_ps(diff, diff));
    }
    let sum2 = _mm_add_ps(acc, _mm_movehl_ps(acc, acc));
    let sum1 = _mm_add_ss(sum2, _mm_shuffle_ps(sum2, sum2, 0x1));
    _mm_cvtss_f32(sum1)
}

/// Squared L2 distance between two f32 vectors of equal dimension.
#[inline]
pub fn l2_sqr(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    if a.len() < BF_UPBOUND_DIM {
        return l2_sqr_scalar(a, b);
    }
    #[cfg(target_arch = "x86_64")]
    {
        match detected_width() {
            // Safety: the matching feature was detected at runtime.
            Width::Avx2 => return unsafe { l2_sqr_avx2(a, b) },
            Width::Sse2 => return unsafe { l2_sqr_sse2(a, b) },
            Width::Scalar => {}
        }
    }
    l2_sqr_scalar(a, b)
}

/// Squared L2 distance between two u8 vectors (widened to f32 lanes).
#[inline]
pub fn l2_sqr_u8(a: &[u8], b: &[u8]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = f32::from(x) - f32::from(y);
            d * d
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_matches_scalar_across_dims() {
        let mut rng = StdRng::seed_from_u64(7);
        // Cover sub-width, exact-width and ragged-tail dimensions.
        for dim in [1usize, 3, 8, 15, 16, 17, 31, 32, 64, 100, 128, 333] {
            let a: Vec<f32> = (0..dim).map(|_| rng.gen_range(-10.0..10.0)).collect();
            let b: Vec<f32> = (0..dim).map(|_| rng.gen_range(-10.0..10.0)).collect();
            let fast = l2_sqr(&a, &b);
            let slow = l2_sqr_scalar(&a, &b);
            let tolerance = slow.abs().max(1.0) * 1e-4;
            assert!(
                (fast - slow).abs() <= tolerance,
                "dim {dim}: {fast} vs {slow}"
            );
        }
    }

    #[test]
    fn test_zero_distance() {
        let v = vec![1.5f32; 128];
        assert_eq!(l2_sqr(&v, &v), 0.0);
    }

    #[test]
    fn test_u8_kernel() {
        assert_eq!(l2_sqr_u8(&[0, 0], &[3, 4]), 25.0);
        assert_eq!(l2_sqr_u8(&[255, 0], &[255, 0]), 0.0);
    }

    #[test]
    fn test_banner_is_stable() {
        let first = simd_architecture();
        assert_eq!(first, simd_architecture());
        assert!(["avx2", "sse2", "scalar"].contains(&first));
    }
}
