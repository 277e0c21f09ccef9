use crate::pool::pool_with_window;
use markerconv_arch::PoolType;
use markerconv_bank::KernelBank;
use markerconv_core::{AdjRel, ModelError, MultibandImage, ObjectMask, Result};
use std::fmt;
use std::sync::Arc;

/// An execution target for the numeric kernels of the forward pipeline.
///
/// Implementations must agree on the numeric contract: given the same
/// inputs, `convolve` and `pool` produce the same values up to floating
/// point tolerance, so that the choice of device never changes results.
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Bytes of working memory this device offers, when known.
    fn available_memory(&self) -> Option<u64>;

    /// Raw convolution responses: for every voxel, the dot product of the
    /// zero-padded neighborhood vector with each kernel row. Statistics and
    /// activation are applied by the caller. Voxels outside `mask` stay
    /// zero and may be skipped entirely.
    fn convolve(
        &self,
        input: &MultibandImage,
        adj: &AdjRel,
        bank: &KernelBank,
        mask: Option<&ObjectMask>,
    ) -> Result<MultibandImage>;

    /// Window pooling with anchored offsets; `kind` must not be `no_pool`.
    /// Windows anchored outside `mask` write zero vectors and the rest
    /// aggregate in-mask voxels only.
    fn pool(
        &self,
        input: &MultibandImage,
        window: &AdjRel,
        stride: usize,
        kind: PoolType,
        mask: Option<&ObjectMask>,
    ) -> Result<MultibandImage>;
}

/// Reference implementation on the host CPU.
pub struct CpuBackend {
    /// Memory ceiling handed to the batch sizer.
    pub memory_budget: u64,
}

impl CpuBackend {
    pub const DEFAULT_MEMORY_BUDGET: u64 = 4 * 1024 * 1024 * 1024;

    pub fn new(memory_budget: u64) -> Self {
        CpuBackend { memory_budget }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        CpuBackend::new(Self::DEFAULT_MEMORY_BUDGET)
    }
}

impl ExecutionBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn available_memory(&self) -> Option<u64> {
        Some(self.memory_budget)
    }

    fn convolve(
        &self,
        input: &MultibandImage,
        adj: &AdjRel,
        bank: &KernelBank,
        mask: Option<&ObjectMask>,
    ) -> Result<MultibandImage> {
        let nbands = input.nbands();
        let expected = bank.input_channels(adj.len())?;
        if expected != nbands {
            return Err(ModelError::Dimension {
                expected: vec![expected],
                got: vec![nbands],
                context: "convolution input channels".into(),
            });
        }
        let shape = input.shape();
        if let Some(m) = mask {
            if m.shape() != shape {
                return Err(ModelError::Dimension {
                    expected: vec![shape.xsize, shape.ysize, shape.zsize],
                    got: vec![m.shape().xsize, m.shape().ysize, m.shape().zsize],
                    context: "object mask grid".into(),
                });
            }
        }

        let mut out = MultibandImage::zeros(shape, bank.nkernels());
        let mut patch = vec![0.0f32; bank.kernel_len()];
        for v in 0..shape.n_voxels() {
            if let Some(m) = mask {
                if !m.is_inside(v) {
                    continue;
                }
            }
            let center = shape.voxel_at(v);
            let mut i = 0;
            for o in adj.iter() {
                let q = shape.shifted(center, o.dx, o.dy, o.dz);
                for b in 0..nbands {
                    patch[i + b] = input.value_at_or_zero(q, b);
                }
                i += nbands;
            }
            let bands = out.bands_at_mut(v);
            for k in 0..bank.nkernels() {
                bands[k] = bank
                    .kernel(k)
                    .iter()
                    .zip(patch.iter())
                    .map(|(w, p)| w * p)
                    .sum();
            }
        }
        Ok(out)
    }

    fn pool(
        &self,
        input: &MultibandImage,
        window: &AdjRel,
        stride: usize,
        kind: PoolType,
        mask: Option<&ObjectMask>,
    ) -> Result<MultibandImage> {
        pool_with_window(input, window, stride, kind, mask)
    }
}

/// Resolved execution target: the host CPU or one accelerator slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Accelerator(usize),
}

impl Device {
    /// Conventional integer encoding: -1 selects the CPU, a non-negative
    /// value selects an accelerator slot. Anything below -1 is invalid.
    pub fn from_index(index: i32) -> Result<Device> {
        match index {
            -1 => Ok(Device::Cpu),
            i if i >= 0 => Ok(Device::Accelerator(i as usize)),
            i => Err(ModelError::Resource(format!("invalid device index {i}"))),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Accelerator(k) => write!(f, "accelerator:{k}"),
        }
    }
}

/// Known backends for this process. The CPU is always present; accelerator
/// backends are plugged in by the embedding application. Requesting an
/// unregistered accelerator fails eagerly, it never falls back to the CPU.
pub struct DeviceRegistry {
    cpu: Arc<dyn ExecutionBackend>,
    accelerators: Vec<Arc<dyn ExecutionBackend>>,
}

impl DeviceRegistry {
    pub fn new(cpu: Arc<dyn ExecutionBackend>) -> Self {
        DeviceRegistry {
            cpu,
            accelerators: Vec::new(),
        }
    }

    /// Registry with only a host CPU of the given memory ceiling.
    pub fn with_cpu_budget(memory_budget: u64) -> Self {
        Self::new(Arc::new(CpuBackend::new(memory_budget)))
    }

    pub fn register_accelerator(&mut self, backend: Arc<dyn ExecutionBackend>) {
        self.accelerators.push(backend);
    }

    pub fn n_accelerators(&self) -> usize {
        self.accelerators.len()
    }

    pub fn resolve(&self, device: Device) -> Result<Arc<dyn ExecutionBackend>> {
        match device {
            Device::Cpu => Ok(Arc::clone(&self.cpu)),
            Device::Accelerator(k) => self.accelerators.get(k).cloned().ok_or_else(|| {
                ModelError::Resource(format!(
                    "accelerator {k} is not available ({} registered)",
                    self.accelerators.len()
                ))
            }),
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(Arc::new(CpuBackend::default()))
    }
}
