//! Seeded Lloyd's k-means, the callable that produces codebooks for both
//! the coarse and the product quantizer.

use super::distance::l2_sqr;
use anyhow::{ensure, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::debug;

/// A trained set of centroids over one (sub)space.
#[derive(Debug, Clone, PartialEq)]
pub struct Codebook {
    pub k: usize,
    pub dim: usize,
    /// Row-major `k × dim`.
    pub centers: Vec<f32>,
}

impl Codebook {
    pub fn from_centers(k: usize, dim: usize, centers: Vec<f32>) -> Result<Self> {
        ensure!(
            centers.len() == k * dim,
            "centers length {} does not match {k}×{dim}",
            centers.len()
        );
        Ok(Self { k, dim, centers })
    }

    pub fn center(&self, i: usize) -> &[f32] {
        &self.centers[i * self.dim..(i + 1) * self.dim]
    }

    /// Index of the nearest centroid by squared L2.
    pub fn predict_one(&self, v: &[f32]) -> usize {
        let mut best = 0;
        let mut best_dist = f32::INFINITY;
        for i in 0..self.k {
            let dist = l2_sqr(v, self.center(i));
            if dist < best_dist {
                best_dist = dist;
                best = i;
            }
        }
        best
    }

    /// Fit `k` centroids over `data` (`data.len() / dim` points) with the
    /// given number of Lloyd iterations. Deterministic for a fixed seed.
    pub fn fit(data: &[f32], dim: usize, k: usize, iterations: usize, seed: u64) -> Result<Self> {
        ensure!(dim > 0 && data.len() % dim == 0, "data is not a multiple of dim");
        let n = data.len() / dim;
        ensure!(n >= k, "cannot fit {k} centroids from {n} points");

        let mut rng = StdRng::seed_from_u64(seed);
        let point = |i: usize| &data[i * dim..(i + 1) * dim];

        // Initial centroids: k distinct points chosen at random.
        let mut ids: Vec<usize> = (0..n).collect();
        ids.shuffle(&mut rng);
        let mut centers = Vec::with_capacity(k * dim);
        for &id in ids.iter().take(k) {
            centers.extend_from_slice(point(id));
        }
        let mut book = Self { k, dim, centers };

        let mut assignments = vec![0usize; n];
        for sweep in 0..iterations {
            // Assignment step.
            assignments
                .par_iter_mut()
                .enumerate()
                .for_each(|(i, slot)| *slot = book.predict_one(point(i)));

            // Update step.
            let mut sums = vec![0.0f64; k * dim];
            let mut counts = vec![0usize; k];
            for (i, &c) in assignments.iter().enumerate() {
                counts[c] += 1;
                let p = point(i);
                for (j, &x) in p.iter().enumerate() {
                    sums[c * dim + j] += f64::from(x);
                }
            }
            let mut empty = 0;
            for c in 0..k {
                if counts[c] == 0 {
                    // Re-seed a starved centroid from a random point.
                    let id = rng.gen_range(0..n);
                    book.centers[c * dim..(c + 1) * dim].copy_from_slice(point(id));
                    empty += 1;
                    continue;
                }
                for j in 0..dim {
                    book.centers[c * dim + j] = (sums[c * dim + j] / counts[c] as f64) as f32;
                }
            }
            if empty > 0 {
                debug!(sweep, empty, "re-seeded starved centroids");
            }
        }
        Ok(book)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Three well-separated 2-d blobs.
    fn blobs() -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(11);
        let mut data = Vec::new();
        for (cx, cy) in [(0.0f32, 0.0f32), (10.0, 10.0), (-10.0, 10.0)] {
            for _ in 0..50 {
                data.push(cx + rng.gen_range(-0.5..0.5));
                data.push(cy + rng.gen_range(-0.5..0.5));
            }
        }
        data
    }

    #[test]
    fn test_fit_recovers_separated_blobs() {
        let data = blobs();
        let book = Codebook::fit(&data, 2, 3, 10, 42).unwrap();

        // All members of one blob must map to the same centroid, and the
        // three blobs to three different ones.
        let mut labels = Vec::new();
        for blob in 0..3 {
            let first = book.predict_one(&data[blob * 100..blob * 100 + 2]);
            for i in 0..50 {
                let p = &data[(blob * 50 + i) * 2..(blob * 50 + i) * 2 + 2];
                assert_eq!(book.predict_one(p), first);
            }
            labels.push(first);
        }
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), 3);
    }

    #[test]
    fn test_fit_is_deterministic_for_seed() {
        let data = blobs();
        let a = Codebook::fit(&data, 2, 3, 5, 7).unwrap();
        let b = Codebook::fit(&data, 2, 3, 5, 7).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_fit_rejects_undersized_corpus() {
        let data = vec![0.0f32; 4];
        assert!(Codebook::fit(&data, 2, 3, 5, 0).is_err());
    }

    #[test]
    fn test_from_centers_validates_shape() {
        assert!(Codebook::from_centers(2, 3, vec![0.0; 6]).is_ok());
        assert!(Codebook::from_centers(2, 3, vec![0.0; 5]).is_err());
    }
}
