//! Runtime types shared by every backend.
//!
//! These are the values that cross the `ProgramImpl` boundary: the shared
//! result buffer, launch contexts, compiled entry points, allocation
//! handles, fences and device capabilities. No backend logic lives here.

pub mod layout;

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub use layout::{check_args, pack_arguments, Alignment, ArgumentLayout, DataLayout};

use crate::error::{BackendError, Result};
use crate::ir::{DataType, Fingerprint, Scalar};

/// Maximum number of return slots per kernel.
pub const MAX_RETURNS: usize = 16;

/// Maximum number of simultaneously materialized trees.
pub const MAX_TREES: usize = 32;

/// Maximum number of parameters per kernel.
pub const MAX_ARGS: usize = 64;

// ─── Result buffer ─────────────────────────────────────────────────

/// Values that can be read back from a result slot.
pub trait ReturnValue: Sized {
    const DTYPE: DataType;

    fn from_bits(bits: u32) -> Self;
}

impl ReturnValue for i32 {
    const DTYPE: DataType = DataType::I32;

    fn from_bits(bits: u32) -> Self {
        bits as i32
    }
}

impl ReturnValue for u32 {
    const DTYPE: DataType = DataType::U32;

    fn from_bits(bits: u32) -> Self {
        bits
    }
}

impl ReturnValue for f32 {
    const DTYPE: DataType = DataType::F32;

    fn from_bits(bits: u32) -> Self {
        f32::from_bits(bits)
    }
}

/// Host-visible return slots, shared between the session and its backend.
///
/// Created by `materialize_runtime` and valid until the backend is
/// finalized. Each slot holds a 4-byte value zero-extended to 64 bits.
#[derive(Clone, Default)]
pub struct ResultBuffer(Arc<Mutex<[u64; MAX_RETURNS]>>);

impl ResultBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, [u64; MAX_RETURNS]> {
        // Slots are plain data; a panic mid-write cannot break an invariant.
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, slot: usize) -> Option<u64> {
        self.slots().get(slot).copied()
    }

    pub fn set(&self, slot: usize, value: u64) -> Result<()> {
        let mut slots = self.slots();
        let target = slots.get_mut(slot).ok_or_else(|| {
            BackendError::Transfer(format!("result slot {} out of range", slot))
        })?;
        *target = value;
        Ok(())
    }

    /// Copy 32-bit return values into the leading slots.
    pub fn store_u32(&self, values: &[u32]) {
        let mut slots = self.slots();
        for (slot, v) in slots.iter_mut().zip(values) {
            *slot = *v as u64;
        }
    }

    pub fn fetch<T: ReturnValue>(&self, slot: usize) -> Option<T> {
        self.get(slot).map(|bits| T::from_bits(bits as u32))
    }

    pub fn fetch_scalar(&self, slot: usize, dtype: DataType) -> Option<Scalar> {
        self.get(slot)
            .map(|bits| Scalar::from_bits(dtype, bits as u32))
    }

    pub fn ptr_eq(&self, other: &ResultBuffer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ResultBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResultBuffer").field(&*self.slots()).finish()
    }
}

// ─── Allocations ───────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AllocationId(pub u64);

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationKind {
    Buffer,
    Texture,
}

/// Opaque handle to memory owned by a backend until released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceAllocation {
    pub id: AllocationId,
    pub size: u64,
    pub kind: AllocationKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TexelFormat {
    R32Float,
    R32Uint,
    Rgba8Unorm,
    Rgba32Float,
}

impl TexelFormat {
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            TexelFormat::R32Float | TexelFormat::R32Uint | TexelFormat::Rgba8Unorm => 4,
            TexelFormat::Rgba32Float => 16,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageParams {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub format: TexelFormat,
}

impl ImageParams {
    pub fn size_bytes(&self) -> u64 {
        self.width as u64
            * self.height as u64
            * self.depth.max(1) as u64
            * self.format.bytes_per_texel() as u64
    }
}

/// Outcome of a sparse dynamic-allocation count query.
///
/// `Unsupported` is distinguishable from a real zero, while `value()`
/// keeps the neutral 0 for callers that only want a number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationCount {
    Exact(u64),
    Unsupported,
}

impl AllocationCount {
    pub fn value(self) -> u64 {
        match self {
            AllocationCount::Exact(n) => n,
            AllocationCount::Unsupported => 0,
        }
    }

    pub fn is_supported(self) -> bool {
        matches!(self, AllocationCount::Exact(_))
    }
}

// ─── Launch ────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ArgValue {
    Scalar(Scalar),
    NdArray(DeviceAllocation),
}

/// Arguments for one kernel invocation plus the result buffer it writes.
#[derive(Clone, Debug)]
pub struct LaunchContext {
    args: Vec<ArgValue>,
    result_buffer: ResultBuffer,
}

impl LaunchContext {
    pub fn new(result_buffer: &ResultBuffer) -> Self {
        Self {
            args: Vec::new(),
            result_buffer: result_buffer.clone(),
        }
    }

    /// Append a scalar argument.
    pub fn arg(mut self, value: impl Into<Scalar>) -> Self {
        self.args.push(ArgValue::Scalar(value.into()));
        self
    }

    /// Append an ndarray argument.
    pub fn ndarray(mut self, alloc: &DeviceAllocation) -> Self {
        self.args.push(ArgValue::NdArray(*alloc));
        self
    }

    pub fn args(&self) -> &[ArgValue] {
        &self.args
    }

    pub fn result_buffer(&self) -> &ResultBuffer {
        &self.result_buffer
    }

    /// Integer scalar argument, for evaluating range bounds on the host.
    pub fn scalar_i32(&self, index: usize) -> Option<i32> {
        match self.args.get(index) {
            Some(ArgValue::Scalar(Scalar::I32(v))) => Some(*v),
            _ => None,
        }
    }
}

pub type LaunchFn = dyn Fn(&LaunchContext) -> Result<()> + Send + Sync;

/// An invocable kernel entry point.
///
/// Cheap to clone. Calling it on a backend that has since been finalized
/// fails with `RuntimeNotMaterialized`.
#[derive(Clone)]
pub struct CompiledFunction {
    name: String,
    fingerprint: Fingerprint,
    launcher: Arc<LaunchFn>,
}

impl CompiledFunction {
    pub fn new(
        name: &str,
        fingerprint: Fingerprint,
        launcher: impl Fn(&LaunchContext) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            fingerprint,
            launcher: Arc::new(launcher),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn launch(&self, ctx: &LaunchContext) -> Result<()> {
        (self.launcher)(ctx)
    }
}

impl fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("name", &self.name)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

// ─── Completion ────────────────────────────────────────────────────

/// Completion handle returned by `flush`.
pub struct Fence(FenceState);

enum FenceState {
    Signaled,
    Submission {
        device: Arc<wgpu::Device>,
        index: wgpu::SubmissionIndex,
    },
}

impl Fence {
    /// A fence that is already complete.
    pub fn signaled() -> Self {
        Fence(FenceState::Signaled)
    }

    pub(crate) fn submission(device: Arc<wgpu::Device>, index: wgpu::SubmissionIndex) -> Self {
        Fence(FenceState::Submission { device, index })
    }

    pub fn is_signaled(&self) -> bool {
        matches!(self.0, FenceState::Signaled)
    }

    /// Block until the work submitted before the fence has completed.
    pub fn wait(self) -> Result<()> {
        if let FenceState::Submission { device, index } = self.0 {
            let _ = device.poll(wgpu::Maintain::WaitForSubmissionIndex(index));
        }
        Ok(())
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            FenceState::Signaled => f.write_str("Fence(signaled)"),
            FenceState::Submission { .. } => f.write_str("Fence(pending)"),
        }
    }
}

// ─── Profiling and capabilities ────────────────────────────────────

/// Timing hook invoked once per kernel launch.
pub trait KernelProfiler: Send + Sync {
    fn record(&self, kernel: &str, elapsed: Duration);
}

/// Profiler that keeps every sample in memory.
#[derive(Default)]
pub struct RecordingProfiler {
    samples: Mutex<Vec<(String, Duration)>>,
}

impl RecordingProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> Vec<(String, Duration)> {
        self.samples
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, kernel: &str) -> usize {
        self.samples()
            .iter()
            .filter(|(name, _)| name == kernel)
            .count()
    }
}

impl KernelProfiler for RecordingProfiler {
    fn record(&self, kernel: &str, elapsed: Duration) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.push((kernel.to_string(), elapsed));
        }
    }
}

/// What a device can do, queried once per backend instance.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct DeviceCaps {
    /// Kernels can receive raw device addresses as arguments.
    pub raw_device_pointers: bool,
    pub max_storage_buffers_per_stage: u32,
    pub max_workgroups_per_dimension: u32,
    pub max_storage_buffer_binding_size: u64,
}

impl DeviceCaps {
    /// The host, as seen by the transpile backend.
    pub fn host() -> Self {
        Self {
            raw_device_pointers: true,
            max_storage_buffers_per_stage: u32::MAX,
            max_workgroups_per_dimension: u32::MAX,
            max_storage_buffer_binding_size: u64::MAX,
        }
    }
}

impl Default for DeviceCaps {
    /// Limits every WebGPU implementation guarantees.
    fn default() -> Self {
        Self {
            raw_device_pointers: false,
            max_storage_buffers_per_stage: 8,
            max_workgroups_per_dimension: 65_535,
            max_storage_buffer_binding_size: 128 << 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_buffer_shared() {
        let a = ResultBuffer::new();
        let b = a.clone();
        a.set(3, 2.5f32.to_bits() as u64).unwrap();
        assert_eq!(b.fetch::<f32>(3), Some(2.5));
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&ResultBuffer::new()));
        assert!(a.set(MAX_RETURNS, 0).is_err());
        assert_eq!(a.get(MAX_RETURNS), None);
    }

    #[test]
    fn test_store_u32_zero_extends() {
        let buf = ResultBuffer::new();
        buf.store_u32(&[u32::MAX, 7]);
        assert_eq!(buf.get(0), Some(u32::MAX as u64));
        assert_eq!(buf.fetch::<i32>(0), Some(-1));
        assert_eq!(buf.fetch_scalar(1, DataType::U32), Some(Scalar::U32(7)));
    }

    #[test]
    fn test_allocation_count_neutral_value() {
        assert_eq!(AllocationCount::Unsupported.value(), 0);
        assert!(!AllocationCount::Unsupported.is_supported());
        assert_eq!(AllocationCount::Exact(0).value(), 0);
        assert_ne!(AllocationCount::Exact(0), AllocationCount::Unsupported);
    }

    #[test]
    fn test_launch_context_args() {
        let rb = ResultBuffer::new();
        let alloc = DeviceAllocation {
            id: AllocationId(4),
            size: 64,
            kind: AllocationKind::Buffer,
        };
        let ctx = LaunchContext::new(&rb).arg(5).ndarray(&alloc).arg(1.0f32);
        assert_eq!(ctx.args().len(), 3);
        assert_eq!(ctx.scalar_i32(0), Some(5));
        assert_eq!(ctx.scalar_i32(1), None);
        assert_eq!(ctx.scalar_i32(2), None);
        assert!(ctx.result_buffer().ptr_eq(&rb));
    }

    #[test]
    fn test_signaled_fence() {
        let fence = Fence::signaled();
        assert!(fence.is_signaled());
        fence.wait().unwrap();
    }

    #[test]
    fn test_recording_profiler() {
        let p = RecordingProfiler::new();
        p.record("fill", Duration::from_micros(3));
        p.record("fill", Duration::from_micros(4));
        p.record("sum", Duration::from_micros(1));
        assert_eq!(p.count("fill"), 2);
        assert_eq!(p.samples().len(), 3);
    }

    #[test]
    fn test_image_size() {
        let params = ImageParams {
            width: 4,
            height: 2,
            depth: 0,
            format: TexelFormat::Rgba32Float,
        };
        assert_eq!(params.size_bytes(), 4 * 2 * 16);
    }
}
