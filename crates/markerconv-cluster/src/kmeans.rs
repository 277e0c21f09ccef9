use crate::grouping::{check_samples, squared_dist, PatchGrouping};
use markerconv_core::{ModelError, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// K-Means with k-means++ initialization, reduced to the grouping interface:
/// the representatives are the converged centroids.
///
/// The generator is always seeded, so a fixed seed and input order give a
/// bit-identical result.
pub struct KMeansGrouping {
    pub max_iter: usize,
    pub tol: f32,
    pub seed: u64,
}

impl KMeansGrouping {
    pub fn new(seed: u64) -> Self {
        KMeansGrouping {
            max_iter: 100,
            tol: 1e-4,
            seed,
        }
    }

    fn init_centroids_pp(
        &self,
        samples: &[Vec<f32>],
        k: usize,
        rng: &mut StdRng,
    ) -> Vec<Vec<f32>> {
        let n = samples.len();
        let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);

        // First centroid uniformly at random.
        let first = ((rand::Rng::gen::<f64>(rng) * n as f64) as usize).min(n - 1);
        centroids.push(samples[first].clone());

        // Remaining centroids proportional to squared distance from the
        // nearest existing centroid.
        for _ in 1..k {
            let distances: Vec<f32> = samples
                .iter()
                .map(|s| {
                    centroids
                        .iter()
                        .map(|c| squared_dist(s, c))
                        .fold(f32::INFINITY, f32::min)
                })
                .collect();

            let total: f32 = distances.iter().sum();
            let threshold = rand::Rng::gen::<f64>(rng) as f32 * total;
            let mut cumulative = 0.0f32;
            let mut selected = 0;
            for (i, &d) in distances.iter().enumerate() {
                cumulative += d;
                if cumulative >= threshold {
                    selected = i;
                    break;
                }
            }
            centroids.push(samples[selected].clone());
        }
        centroids
    }
}

impl PatchGrouping for KMeansGrouping {
    fn group(&self, samples: &[Vec<f32>], ngroups: usize) -> Result<Vec<Vec<f32>>> {
        let dim = check_samples(samples, ngroups)?;
        let n = samples.len();
        if ngroups >= n {
            return Ok(samples.to_vec());
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut centroids = self.init_centroids_pp(samples, ngroups, &mut rng);
        let mut labels = vec![0usize; n];
        let mut converged = false;

        for _iter in 0..self.max_iter {
            // Assignment step.
            for (i, s) in samples.iter().enumerate() {
                let mut best_dist = f32::INFINITY;
                let mut best_k = 0;
                for (k, c) in centroids.iter().enumerate() {
                    let dist = squared_dist(s, c);
                    if dist < best_dist {
                        best_dist = dist;
                        best_k = k;
                    }
                }
                labels[i] = best_k;
            }

            // Update step; an emptied cluster keeps its previous centroid.
            let mut sums = vec![vec![0.0f32; dim]; ngroups];
            let mut counts = vec![0usize; ngroups];
            for (i, s) in samples.iter().enumerate() {
                let k = labels[i];
                counts[k] += 1;
                for (acc, v) in sums[k].iter_mut().zip(s.iter()) {
                    *acc += v;
                }
            }
            let mut max_shift = 0.0f32;
            for k in 0..ngroups {
                if counts[k] == 0 {
                    continue;
                }
                for j in 0..dim {
                    let updated = sums[k][j] / counts[k] as f32;
                    let shift = (updated - centroids[k][j]).abs();
                    if shift > max_shift {
                        max_shift = shift;
                    }
                    centroids[k][j] = updated;
                }
            }

            if max_shift < self.tol {
                converged = true;
                break;
            }
        }

        if !converged {
            return Err(ModelError::Resource(format!(
                "k-means did not converge within {} iterations",
                self.max_iter
            )));
        }
        Ok(centroids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn two_blobs() -> Vec<Vec<f32>> {
        vec![
            vec![0.0, 0.0],
            vec![0.5, 0.5],
            vec![1.0, 0.0],
            vec![10.0, 10.0],
            vec![10.5, 10.5],
            vec![11.0, 10.0],
        ]
    }

    #[test]
    fn recovers_two_separated_blobs() {
        let km = KMeansGrouping::new(42);
        let mut reps = km.group(&two_blobs(), 2).unwrap();
        reps.sort_by(|a, b| a[0].partial_cmp(&b[0]).unwrap());
        assert_relative_eq!(reps[0][0], 0.5, epsilon = 1e-5);
        assert_relative_eq!(reps[0][1], 1.0 / 6.0, epsilon = 1e-5);
        assert_relative_eq!(reps[1][0], 10.5, epsilon = 1e-5);
    }

    #[test]
    fn returns_samples_when_groups_cover_them() {
        let samples = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        let km = KMeansGrouping::new(7);
        assert_eq!(km.group(&samples, 2).unwrap(), samples);
        assert_eq!(km.group(&samples, 5).unwrap(), samples);
    }

    #[test]
    fn fixed_seed_is_reproducible() {
        let km = KMeansGrouping::new(1234);
        let a = km.group(&two_blobs(), 2).unwrap();
        let b = km.group(&two_blobs(), 2).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_empty_and_mismatched_input() {
        let km = KMeansGrouping::new(0);
        assert!(matches!(km.group(&[], 2), Err(ModelError::Data(_))));
        let bad = vec![vec![1.0, 2.0], vec![1.0]];
        assert!(matches!(
            km.group(&bad, 1),
            Err(ModelError::Dimension { .. })
        ));
        assert!(matches!(
            km.group(&two_blobs(), 0),
            Err(ModelError::Config(_))
        ));
    }
}
