//! k-means clustering used for codebook training.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{IndexError, Result};
use crate::simd;

const MAX_ITERATIONS: usize = 25;

/// k-means with k-means++ initialization.
pub struct KMeans {
    centroids: Vec<Vec<f32>>,
    dimension: usize,
    k: usize,
    seed: u64,
}

impl KMeans {
    pub fn new(dimension: usize, k: usize) -> Result<Self> {
        if dimension == 0 || k == 0 {
            return Err(IndexError::InvalidArgs(
                "dimension and k must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            centroids: Vec::new(),
            dimension,
            k,
            seed: 0x9E37_79B9,
        })
    }

    /// Configure a deterministic seed so repeated fits produce identical
    /// codebooks.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Train on `num_vectors` rows laid out contiguously in `vectors`.
    pub fn fit(&mut self, vectors: &[f32], num_vectors: usize) -> Result<()> {
        if vectors.len() < num_vectors * self.dimension || num_vectors == 0 {
            return Err(IndexError::InvalidArgs(
                "insufficient vectors for k-means".to_string(),
            ));
        }

        self.centroids = self.init_plus_plus(vectors, num_vectors);

        for _ in 0..MAX_ITERATIONS {
            let assignments = self.assign(vectors, num_vectors);
            let new_centroids = self.update(vectors, num_vectors, &assignments);

            let mut converged = true;
            for (old, new) in self.centroids.iter().zip(new_centroids.iter()) {
                if simd::l2_sqr(old, new) > 1e-9 {
                    converged = false;
                    break;
                }
            }
            self.centroids = new_centroids;
            if converged {
                break;
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn centroids(&self) -> &[Vec<f32>] {
        &self.centroids
    }

    fn row<'a>(&self, vectors: &'a [f32], i: usize) -> &'a [f32] {
        &vectors[i * self.dimension..(i + 1) * self.dimension]
    }

    fn init_plus_plus(&self, vectors: &[f32], num_vectors: usize) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut centroids = Vec::with_capacity(self.k);

        let first = rng.random_range(0..num_vectors);
        centroids.push(self.row(vectors, first).to_vec());

        let mut best_dist: Vec<f32> = (0..num_vectors)
            .map(|i| simd::l2_sqr(self.row(vectors, i), &centroids[0]))
            .collect();

        while centroids.len() < self.k {
            let total: f64 = best_dist.iter().map(|&d| d as f64).sum();
            let picked = if total <= 0.0 {
                // all remaining points coincide with a centroid
                rng.random_range(0..num_vectors)
            } else {
                let threshold = rng.random::<f64>() * total;
                let mut cumulative = 0.0;
                let mut picked = num_vectors - 1;
                for (i, &d) in best_dist.iter().enumerate() {
                    cumulative += d as f64;
                    if cumulative >= threshold {
                        picked = i;
                        break;
                    }
                }
                picked
            };
            let c = self.row(vectors, picked).to_vec();
            for i in 0..num_vectors {
                let d = simd::l2_sqr(self.row(vectors, i), &c);
                if d < best_dist[i] {
                    best_dist[i] = d;
                }
            }
            centroids.push(c);
        }
        centroids
    }

    fn assign(&self, vectors: &[f32], num_vectors: usize) -> Vec<usize> {
        (0..num_vectors)
            .map(|i| {
                let v = self.row(vectors, i);
                let mut best = 0;
                let mut best_dist = f32::INFINITY;
                for (c_idx, c) in self.centroids.iter().enumerate() {
                    let d = simd::l2_sqr(v, c);
                    if d < best_dist {
                        best_dist = d;
                        best = c_idx;
                    }
                }
                best
            })
            .collect()
    }

    fn update(&self, vectors: &[f32], num_vectors: usize, assignments: &[usize]) -> Vec<Vec<f32>> {
        let mut sums = vec![vec![0.0f32; self.dimension]; self.k];
        let mut counts = vec![0usize; self.k];
        for i in 0..num_vectors {
            let cluster = assignments[i];
            counts[cluster] += 1;
            for (s, x) in sums[cluster].iter_mut().zip(self.row(vectors, i)) {
                *s += x;
            }
        }
        sums.into_iter()
            .enumerate()
            .map(|(c, mut sum)| {
                if counts[c] > 0 {
                    let inv = 1.0 / counts[c] as f32;
                    for s in &mut sum {
                        *s *= inv;
                    }
                    sum
                } else {
                    // empty cluster keeps its previous centroid
                    self.centroids[c].clone()
                }
            })
            .collect()
    }
}
