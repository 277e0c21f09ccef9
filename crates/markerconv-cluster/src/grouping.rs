use markerconv_core::{ModelError, Result};

/// A service that reduces a set of patch vectors to at most `ngroups`
/// representative vectors of the same dimension.
///
/// Implementations must be deterministic for a fixed input order and
/// configuration; kernel estimation relies on that for reproducible banks.
pub trait PatchGrouping {
    fn group(&self, samples: &[Vec<f32>], ngroups: usize) -> Result<Vec<Vec<f32>>>;
}

pub(crate) fn check_samples(samples: &[Vec<f32>], ngroups: usize) -> Result<usize> {
    if ngroups == 0 {
        return Err(ModelError::Config("requested zero groups".into()));
    }
    let first = samples
        .first()
        .ok_or_else(|| ModelError::Data("no samples to group".into()))?;
    let dim = first.len();
    if dim == 0 {
        return Err(ModelError::Data("samples have zero dimension".into()));
    }
    for s in samples {
        if s.len() != dim {
            return Err(ModelError::Dimension {
                expected: vec![dim],
                got: vec![s.len()],
                context: "patch grouping input".into(),
            });
        }
    }
    Ok(dim)
}

pub(crate) fn squared_dist(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}

pub(crate) fn mean_of<'a, I>(samples: I, dim: usize) -> Vec<f32>
where
    I: IntoIterator<Item = &'a Vec<f32>>,
{
    let mut mean = vec![0.0f32; dim];
    let mut count = 0usize;
    for s in samples {
        for (m, v) in mean.iter_mut().zip(s.iter()) {
            *m += v;
        }
        count += 1;
    }
    if count > 0 {
        for m in &mut mean {
            *m /= count as f32;
        }
    }
    mean
}
