use markerconv_core::{ModelError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

/// Spatial reduction applied at the end of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolType {
    NoPool,
    AvgPool,
    MaxPool,
}

impl PoolType {
    pub fn pools(&self) -> bool {
        !matches!(self, PoolType::NoPool)
    }
}

impl fmt::Display for PoolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PoolType::NoPool => "no_pool",
            PoolType::AvgPool => "avg_pool",
            PoolType::MaxPool => "max_pool",
        };
        f.write_str(s)
    }
}

/// One convolutional layer of the architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    /// Kernel extent along x, y, z. The z extent is ignored for 2D inputs.
    pub kernel_size: [usize; 3],
    /// Dilation rate along x, y, z.
    pub dilation_rate: [usize; 3],
    /// Kernel candidates kept per training image.
    pub nkernels_per_image: usize,
    /// Kernel candidates estimated per marker label.
    pub nkernels_per_marker: usize,
    /// Consensus kernels, and therefore output channels, of the layer.
    pub noutput_channels: usize,
    pub relu: bool,
    pub pool_type: PoolType,
    /// Pooling window extent along x, y, z; ignored for `no_pool`.
    pub pool_size: [usize; 3],
    /// Pooling stride; ignored for `no_pool`.
    pub pool_stride: usize,
    /// Indices of earlier layers whose outputs are concatenated channel-wise
    /// with this layer's output before pooling.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skip_connections: Vec<usize>,
}

/// The full network description: an ordered layer sequence plus the global
/// hyperparameters shared by training and extraction. Loaded once from JSON
/// and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Architecture {
    /// Additive floor for marker-based normalization denominators.
    pub stdev_factor: f32,
    /// When set, training preserves spatial resolution and compensates for
    /// pooling strides by dilating kernels with an atrous factor instead.
    #[serde(default)]
    pub apply_intrinsic_atrous: bool,
    pub layers: Vec<Layer>,
}

impl Architecture {
    pub fn from_json(json: &str) -> Result<Self> {
        let arch: Architecture = serde_json::from_str(json)
            .map_err(|e| ModelError::Config(format!("malformed architecture: {e}")))?;
        arch.validate()?;
        Ok(arch)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path.as_ref())?;
        Self::from_json(&json)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ModelError::Config(format!("could not encode architecture: {e}")))?;
        fs::write(path.as_ref(), json)?;
        Ok(())
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, index: usize) -> Result<&Layer> {
        self.layers.get(index).ok_or_else(|| {
            ModelError::Config(format!(
                "layer index {index} out of range for a {}-layer architecture",
                self.layers.len()
            ))
        })
    }

    /// Dilation multiplier for `layer_index`: the product of the pooling
    /// strides of all preceding pooling layers when intrinsic atrous
    /// compensation is on, 1 otherwise.
    pub fn atrous_factor(&self, layer_index: usize) -> usize {
        if !self.apply_intrinsic_atrous {
            return 1;
        }
        self.cumulative_stride(layer_index)
    }

    /// Grid shrink factor accumulated before `layer_index` when pooling runs
    /// with its true strides.
    pub fn cumulative_stride(&self, layer_index: usize) -> usize {
        self.layers[..layer_index.min(self.layers.len())]
            .iter()
            .filter(|l| l.pool_type.pools())
            .map(|l| l.pool_stride)
            .product()
    }

    fn validate(&self) -> Result<()> {
        if self.layers.is_empty() {
            return Err(ModelError::Config("architecture has no layers".into()));
        }
        if self.stdev_factor <= 0.0 {
            return Err(ModelError::Config(format!(
                "stdev_factor must be positive, got {}",
                self.stdev_factor
            )));
        }
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.noutput_channels == 0 {
                return Err(ModelError::Config(format!(
                    "layer {i}: noutput_channels must be at least 1"
                )));
            }
            if layer.nkernels_per_image == 0 || layer.nkernels_per_marker == 0 {
                return Err(ModelError::Config(format!(
                    "layer {i}: kernel counts must be at least 1"
                )));
            }
            for axis in 0..3 {
                let k = layer.kernel_size[axis];
                if k == 0 || k % 2 == 0 {
                    return Err(ModelError::Config(format!(
                        "layer {i}: kernel extent {k} on axis {axis} must be odd"
                    )));
                }
                if layer.dilation_rate[axis] == 0 {
                    return Err(ModelError::Config(format!(
                        "layer {i}: dilation rate on axis {axis} must be positive"
                    )));
                }
            }
            if layer.pool_type.pools() {
                if layer.pool_stride == 0 {
                    return Err(ModelError::Config(format!(
                        "layer {i}: pooling stride must be positive"
                    )));
                }
                if layer.pool_size.iter().any(|&s| s == 0) {
                    return Err(ModelError::Config(format!(
                        "layer {i}: pooling window must be positive on every axis"
                    )));
                }
            }
            for &s in &layer.skip_connections {
                if s >= i {
                    return Err(ModelError::Config(format!(
                        "layer {i}: skip connection to layer {s} is not an earlier layer"
                    )));
                }
            }
        }
        Ok(())
    }
}
