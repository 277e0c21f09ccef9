use markerconv_core::{ModelError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Per-kernel statistics stored next to the weights, fixing how the raw
/// convolution response is finished at inference time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BankStats {
    /// Z-score the response of kernel `k` with `(mean[k], stdev[k])`.
    /// Produced by clustering-based estimation.
    Normalization { mean: Vec<f32>, stdev: Vec<f32> },
    /// Add `bias[k]` to the response of kernel `k`. Produced by SGD
    /// estimation, where the channel statistics are folded into the
    /// weights and the bias up front.
    Bias { bias: Vec<f32> },
}

impl BankStats {
    fn check_len(&self, nkernels: usize) -> Result<()> {
        let (len, what) = match self {
            BankStats::Normalization { mean, stdev } => {
                if mean.len() != stdev.len() {
                    return Err(ModelError::Dimension {
                        expected: vec![mean.len()],
                        got: vec![stdev.len()],
                        context: "normalization statistics".into(),
                    });
                }
                if let Some(k) = stdev.iter().position(|&s| s <= 0.0) {
                    return Err(ModelError::Config(format!(
                        "kernel {k} has non-positive stdev {}",
                        stdev[k]
                    )));
                }
                (mean.len(), "normalization statistics")
            }
            BankStats::Bias { bias } => (bias.len(), "bias vector"),
        };
        if len != nkernels {
            return Err(ModelError::Dimension {
                expected: vec![nkernels],
                got: vec![len],
                context: what.into(),
            });
        }
        Ok(())
    }

    fn select(&self, indices: &[usize]) -> BankStats {
        match self {
            BankStats::Normalization { mean, stdev } => BankStats::Normalization {
                mean: indices.iter().map(|&i| mean[i]).collect(),
                stdev: indices.iter().map(|&i| stdev[i]).collect(),
            },
            BankStats::Bias { bias } => BankStats::Bias {
                bias: indices.iter().map(|&i| bias[i]).collect(),
            },
        }
    }
}

/// The learned parameters of one layer: `nkernels` weight rows of
/// `kernel_len` values each (offset-major, band-minor, matching the
/// adjacency order), plus the per-kernel statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelBank {
    weights: Vec<f32>,
    nkernels: usize,
    kernel_len: usize,
    stats: BankStats,
}

impl KernelBank {
    pub fn new(
        weights: Vec<f32>,
        nkernels: usize,
        kernel_len: usize,
        stats: BankStats,
    ) -> Result<Self> {
        let bank = KernelBank {
            weights,
            nkernels,
            kernel_len,
            stats,
        };
        bank.check()?;
        Ok(bank)
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.weights.len() != self.nkernels * self.kernel_len {
            return Err(ModelError::Dimension {
                expected: vec![self.nkernels * self.kernel_len],
                got: vec![self.weights.len()],
                context: "kernel bank weights".into(),
            });
        }
        self.stats.check_len(self.nkernels)
    }

    pub fn nkernels(&self) -> usize {
        self.nkernels
    }

    pub fn kernel_len(&self) -> usize {
        self.kernel_len
    }

    pub fn kernel(&self, k: usize) -> &[f32] {
        &self.weights[k * self.kernel_len..(k + 1) * self.kernel_len]
    }

    pub fn stats(&self) -> &BankStats {
        &self.stats
    }

    /// Number of input channels the bank expects under an adjacency of
    /// `adj_len` offsets.
    pub fn input_channels(&self, adj_len: usize) -> Result<usize> {
        if adj_len == 0 || self.kernel_len % adj_len != 0 {
            return Err(ModelError::Dimension {
                expected: vec![adj_len],
                got: vec![self.kernel_len],
                context: "kernel length vs adjacency size".into(),
            });
        }
        Ok(self.kernel_len / adj_len)
    }

    /// New bank holding exactly the kernels named by `indices`, in that
    /// order, with their statistics. Rejects an empty selection, indices
    /// out of range, and repeated indices.
    pub fn select(&self, indices: &[usize]) -> Result<KernelBank> {
        if indices.is_empty() {
            return Err(ModelError::Config("kernel selection is empty".into()));
        }
        let mut seen = BTreeSet::new();
        for &i in indices {
            if i >= self.nkernels {
                return Err(ModelError::Config(format!(
                    "kernel index {i} out of range for a bank of {}",
                    self.nkernels
                )));
            }
            if !seen.insert(i) {
                return Err(ModelError::Config(format!("kernel index {i} selected twice")));
            }
        }
        let mut weights = Vec::with_capacity(indices.len() * self.kernel_len);
        for &i in indices {
            weights.extend_from_slice(self.kernel(i));
        }
        Ok(KernelBank {
            weights,
            nkernels: indices.len(),
            kernel_len: self.kernel_len,
            stats: self.stats.select(indices),
        })
    }
}

impl fmt::Display for KernelBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bank({} kernels x {})", self.nkernels, self.kernel_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_kernel_bank() -> KernelBank {
        KernelBank::new(
            vec![1.0, 1.0, 2.0, 2.0, 3.0, 3.0],
            3,
            2,
            BankStats::Normalization {
                mean: vec![0.1, 0.2, 0.3],
                stdev: vec![1.0, 2.0, 3.0],
            },
        )
        .unwrap()
    }

    #[test]
    fn construction_checks_weight_and_stat_lengths() {
        let bad = KernelBank::new(
            vec![0.0; 5],
            3,
            2,
            BankStats::Bias { bias: vec![0.0; 3] },
        );
        assert!(matches!(bad, Err(ModelError::Dimension { .. })));

        let bad = KernelBank::new(
            vec![0.0; 6],
            3,
            2,
            BankStats::Bias { bias: vec![0.0; 2] },
        );
        assert!(bad.is_err());
    }

    #[test]
    fn selection_reorders_kernels_and_stats() {
        let bank = three_kernel_bank();
        let picked = bank.select(&[2, 0]).unwrap();
        assert_eq!(picked.nkernels(), 2);
        assert_eq!(picked.kernel(0), &[3.0, 3.0]);
        assert_eq!(picked.kernel(1), &[1.0, 1.0]);
        match picked.stats() {
            BankStats::Normalization { mean, stdev } => {
                assert_eq!(mean, &[0.3, 0.1]);
                assert_eq!(stdev, &[3.0, 1.0]);
            }
            _ => panic!("expected normalization statistics"),
        }
    }

    #[test]
    fn selection_rejects_bad_indices() {
        let bank = three_kernel_bank();
        assert!(matches!(bank.select(&[]), Err(ModelError::Config(_))));
        assert!(bank.select(&[3]).is_err());
        assert!(bank.select(&[1, 1]).is_err());
    }

    #[test]
    fn stats_variants_encode_their_kind_tag() {
        let json = serde_json::to_string(&three_kernel_bank()).unwrap();
        assert!(json.contains("\"kind\":\"normalization\""));
        let back: KernelBank = serde_json::from_str(&json).unwrap();
        assert_eq!(back, three_kernel_bank());

        let bias = KernelBank::new(
            vec![1.0, 2.0],
            2,
            1,
            BankStats::Bias {
                bias: vec![0.5, -0.5],
            },
        )
        .unwrap();
        let json = serde_json::to_string(&bias).unwrap();
        assert!(json.contains("\"kind\":\"bias\""));
    }

    #[test]
    fn input_channels_divides_kernel_length() {
        let bank = three_kernel_bank();
        assert_eq!(bank.input_channels(2).unwrap(), 1);
        assert_eq!(bank.input_channels(1).unwrap(), 2);
        assert!(bank.input_channels(4).is_err());
    }
}
