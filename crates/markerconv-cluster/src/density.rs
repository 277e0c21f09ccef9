use crate::grouping::{check_samples, mean_of, squared_dist, PatchGrouping};
use markerconv_core::Result;

/// Density-based grouping in the DBSCAN family: dense regions become
/// clusters, their means become the representatives, sparse points are
/// treated as noise and contribute to no representative.
///
/// Needs no random state; the scan order alone fixes the outcome.
pub struct DensityGrouping {
    /// Neighborhood radius.
    pub eps: f32,
    /// Neighbors (self included) required to seed a cluster.
    pub min_samples: usize,
}

impl DensityGrouping {
    pub fn new(eps: f32, min_samples: usize) -> Self {
        DensityGrouping { eps, min_samples }
    }

    fn region_query(&self, samples: &[Vec<f32>], i: usize) -> Vec<usize> {
        let eps2 = self.eps * self.eps;
        samples
            .iter()
            .enumerate()
            .filter(|(_, s)| squared_dist(&samples[i], s) <= eps2)
            .map(|(j, _)| j)
            .collect()
    }

    /// Cluster id per sample, -1 for noise.
    fn fit_labels(&self, samples: &[Vec<f32>]) -> Vec<i32> {
        let n = samples.len();
        let mut labels = vec![-1i32; n];
        let mut visited = vec![false; n];
        let mut cluster_id: i32 = 0;

        for i in 0..n {
            if visited[i] {
                continue;
            }
            visited[i] = true;
            let neighbors = self.region_query(samples, i);
            if neighbors.len() < self.min_samples {
                continue;
            }

            labels[i] = cluster_id;
            let mut queue = neighbors;
            let mut qi = 0;
            while qi < queue.len() {
                let j = queue[qi];
                qi += 1;

                if !visited[j] {
                    visited[j] = true;
                    let j_neighbors = self.region_query(samples, j);
                    if j_neighbors.len() >= self.min_samples {
                        for &nn in &j_neighbors {
                            if !queue.contains(&nn) {
                                queue.push(nn);
                            }
                        }
                    }
                }
                if labels[j] == -1 {
                    labels[j] = cluster_id;
                }
            }
            cluster_id += 1;
        }
        labels
    }
}

impl PatchGrouping for DensityGrouping {
    fn group(&self, samples: &[Vec<f32>], ngroups: usize) -> Result<Vec<Vec<f32>>> {
        let dim = check_samples(samples, ngroups)?;
        let labels = self.fit_labels(samples);
        let nclusters = labels.iter().copied().max().unwrap_or(-1) + 1;

        // Everything was noise: fall back to the overall mean so the caller
        // still receives one representative.
        if nclusters == 0 {
            return Ok(vec![mean_of(samples.iter(), dim)]);
        }

        let mut counts = vec![0usize; nclusters as usize];
        for &l in &labels {
            if l >= 0 {
                counts[l as usize] += 1;
            }
        }

        // Keep the largest clusters when more were found than requested.
        let mut order: Vec<usize> = (0..nclusters as usize).collect();
        order.sort_by_key(|&c| (std::cmp::Reverse(counts[c]), c));
        let mut kept: Vec<usize> = order.into_iter().take(ngroups).collect();
        kept.sort_unstable();

        let reps = kept
            .into_iter()
            .map(|c| {
                let members = samples
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| labels[*i] == c as i32)
                    .map(|(_, s)| s);
                mean_of(members, dim)
            })
            .collect();
        Ok(reps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn blobs_with_noise() -> Vec<Vec<f32>> {
        vec![
            vec![0.0, 0.0],
            vec![0.1, 0.1],
            vec![0.2, 0.0],
            vec![10.0, 10.0],
            vec![10.1, 10.1],
            vec![10.2, 10.0],
            vec![100.0, 100.0],
        ]
    }

    #[test]
    fn dense_regions_become_representatives() {
        let db = DensityGrouping::new(1.0, 2);
        let reps = db.group(&blobs_with_noise(), 4).unwrap();
        assert_eq!(reps.len(), 2);
        assert_relative_eq!(reps[0][0], 0.1, epsilon = 1e-5);
        assert_relative_eq!(reps[1][0], 10.1, epsilon = 1e-5);
        // The lone far point is noise and pulls no mean.
        assert!(reps.iter().all(|r| r[0] < 50.0));
    }

    #[test]
    fn keeps_largest_clusters_when_over_budget() {
        let mut samples = blobs_with_noise();
        samples.truncate(6);
        samples.push(vec![0.05, 0.05]); // first blob now has 4 members
        let db = DensityGrouping::new(1.0, 2);
        let reps = db.group(&samples, 1).unwrap();
        assert_eq!(reps.len(), 1);
        assert!(reps[0][0] < 1.0);
    }

    #[test]
    fn all_noise_falls_back_to_overall_mean() {
        let samples = vec![vec![0.0, 0.0], vec![50.0, 0.0], vec![0.0, 50.0]];
        let db = DensityGrouping::new(1.0, 2);
        let reps = db.group(&samples, 3).unwrap();
        assert_eq!(reps.len(), 1);
        assert_relative_eq!(reps[0][0], 50.0 / 3.0, epsilon = 1e-4);
    }
}
