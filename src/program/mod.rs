//! The `ProgramImpl` contract and the session that drives it.
//!
//! A `ProgramImpl` is one execution backend for one session. Callers
//! materialize the runtime first, then trees and kernels, then launch.
//! `Program` wraps a backend with the bookkeeping every caller needs:
//! the shared result buffer, a fingerprint-keyed compile cache and typed
//! ndarray transfers.

pub mod cc;
pub mod gfx;

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{Arch, CompileConfig};
use crate::error::{BackendError, Result};
use crate::ir::{DataType, Fingerprint, Kernel};
use crate::runtime::{
    AllocationCount, AllocationId, ArgValue, CompiledFunction, DataLayout, DeviceAllocation,
    DeviceCaps, Fence, ImageParams, KernelProfiler, LaunchContext, ResultBuffer, ReturnValue,
};
use crate::snode::{compute_layout, SNodeId, SNodeTree, TreeId};

pub use gfx::aot::AotModule;

/// Collects trees and kernels for ahead-of-time export.
pub trait AotModuleBuilder {
    fn add_snode_tree(&mut self, tree: &SNodeTree) -> Result<()>;

    fn add_kernel(&mut self, kernel: &Kernel) -> Result<()>;

    /// Lower everything added so far into a serializable module.
    fn build(self: Box<Self>) -> Result<AotModule>;
}

/// One execution backend.
///
/// Every operation except the layout queries requires a prior
/// `materialize_runtime`. Operations a backend cannot perform return a
/// documented neutral value or `BackendError::NotImplemented`.
pub trait ProgramImpl: Send {
    fn arch(&self) -> Arch;

    /// One-time bootstrap. Returns the result buffer kernels write into.
    fn materialize_runtime(
        &mut self,
        profiler: Option<Arc<dyn KernelProfiler>>,
    ) -> Result<ResultBuffer>;

    /// Lower `kernel` into an invocable entry point. Compiling the same
    /// kernel again yields an equivalent entry point.
    fn compile(&mut self, config: &CompileConfig, kernel: &Kernel) -> Result<CompiledFunction>;

    /// Compute layout types ahead of materialization.
    fn compile_snode_tree_types(&mut self, tree: &SNodeTree) -> Result<()> {
        compute_layout(tree).map(|_| ())
    }

    fn materialize_snode_tree(
        &mut self,
        tree: &SNodeTree,
        result_buffer: &ResultBuffer,
    ) -> Result<()>;

    fn destroy_snode_tree(&mut self, tree: TreeId) -> Result<()>;

    /// Block until all submitted work has completed.
    fn synchronize(&mut self) -> Result<()>;

    /// Submit pending work without blocking.
    fn flush(&mut self) -> Result<Fence> {
        Ok(Fence::signaled())
    }

    fn make_aot_module_builder(&self, _caps: &DeviceCaps) -> Option<Box<dyn AotModuleBuilder>> {
        None
    }

    /// Number of cells a sparse node has allocated. Never fails.
    fn get_snode_num_dynamically_allocated(
        &self,
        _snode: SNodeId,
        _result_buffer: &ResultBuffer,
    ) -> AllocationCount {
        AllocationCount::Unsupported
    }

    fn allocate_memory_ndarray(
        &mut self,
        size: u64,
        result_buffer: &ResultBuffer,
    ) -> Result<DeviceAllocation>;

    fn allocate_texture(&mut self, _params: &ImageParams) -> Result<DeviceAllocation> {
        Err(BackendError::not_implemented(
            self.arch().name(),
            "allocate_texture",
        ))
    }

    /// Whether submitted but unsynchronized work references `id`.
    fn used_in_kernel(&self, _id: AllocationId) -> bool {
        false
    }

    /// Free an allocation. Fails with `DeviceAllocationInUse` while
    /// `used_in_kernel` reports it.
    fn release_allocation(&mut self, alloc: &DeviceAllocation) -> Result<()>;

    fn write_ndarray(&mut self, alloc: &DeviceAllocation, offset: u64, data: &[u8]) -> Result<()>;

    fn read_ndarray(&mut self, alloc: &DeviceAllocation, offset: u64, len: u64) -> Result<Vec<u8>>;

    /// Byte offset of a place's first element inside its tree.
    fn get_field_in_tree_offset(&self, tree: TreeId, snode: SNodeId) -> Result<usize>;

    fn get_kernel_argument_data_layout(&self) -> DataLayout;

    fn get_kernel_return_data_layout(&self) -> DataLayout {
        DataLayout::RETURN
    }

    /// Synchronize and release all runtime state.
    fn finalize(&mut self) -> Result<()>;
}

/// Create the backend selected by `config.arch`.
pub fn create_program_impl(config: &CompileConfig) -> Result<Box<dyn ProgramImpl>> {
    match config.arch {
        Arch::Cc => Ok(Box::new(cc::CcProgram::new(config))),
        Arch::Gfx => Ok(Box::new(gfx::GfxProgram::new()?)),
    }
}

// ─── Session ───────────────────────────────────────────────────────

/// A backend plus the session state around it.
pub struct Program {
    config: CompileConfig,
    backend: Box<dyn ProgramImpl>,
    result_buffer: ResultBuffer,
    compiled: HashMap<Fingerprint, CompiledFunction>,
    returns: HashMap<String, Vec<DataType>>,
    finalized: bool,
}

impl Program {
    /// Create the configured backend and materialize its runtime.
    pub fn new(config: CompileConfig) -> Result<Self> {
        let backend = create_program_impl(&config)?;
        Self::with_backend(config, backend, None)
    }

    pub fn with_backend(
        config: CompileConfig,
        mut backend: Box<dyn ProgramImpl>,
        profiler: Option<Arc<dyn KernelProfiler>>,
    ) -> Result<Self> {
        let result_buffer = backend.materialize_runtime(profiler)?;
        tracing::info!(arch = %backend.arch(), "runtime materialized");
        Ok(Self {
            config,
            backend,
            result_buffer,
            compiled: HashMap::new(),
            returns: HashMap::new(),
            finalized: false,
        })
    }

    pub fn arch(&self) -> Arch {
        self.backend.arch()
    }

    pub fn config(&self) -> &CompileConfig {
        &self.config
    }

    pub fn backend(&self) -> &dyn ProgramImpl {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut dyn ProgramImpl {
        self.backend.as_mut()
    }

    pub fn result_buffer(&self) -> &ResultBuffer {
        &self.result_buffer
    }

    pub fn add_snode_tree(&mut self, tree: &SNodeTree) -> Result<()> {
        self.backend.compile_snode_tree_types(tree)?;
        self.backend.materialize_snode_tree(tree, &self.result_buffer)
    }

    pub fn destroy_snode_tree(&mut self, tree: TreeId) -> Result<()> {
        self.backend.destroy_snode_tree(tree)
    }

    /// Compile a kernel, reusing the entry point of an identical kernel.
    pub fn compile(&mut self, kernel: &Kernel) -> Result<CompiledFunction> {
        let fingerprint = kernel.fingerprint();
        if let Some(f) = self.compiled.get(&fingerprint) {
            return Ok(f.clone());
        }
        let f = self.backend.compile(&self.config, kernel)?;
        tracing::debug!(kernel = %kernel.name, %fingerprint, "compiled");
        self.compiled.insert(fingerprint, f.clone());
        self.returns.insert(kernel.name.clone(), kernel.returns.clone());
        Ok(f)
    }

    /// A launch context bound to this session's result buffer.
    pub fn launch_context(&self) -> LaunchContext {
        LaunchContext::new(&self.result_buffer)
    }

    /// Compile (if needed) and launch `kernel` with `args`.
    pub fn launch(&mut self, kernel: &Kernel, args: &[ArgValue]) -> Result<()> {
        let f = self.compile(kernel)?;
        let ctx = args
            .iter()
            .fold(self.launch_context(), |ctx, arg| match arg {
                ArgValue::Scalar(v) => ctx.arg(*v),
                ArgValue::NdArray(a) => ctx.ndarray(a),
            });
        f.launch(&ctx)
    }

    pub fn fetch_result<T: ReturnValue>(&self, slot: usize) -> Option<T> {
        self.result_buffer.fetch(slot)
    }

    /// Return slot types of a compiled kernel.
    pub fn return_types(&self, kernel: &str) -> Option<&[DataType]> {
        self.returns.get(kernel).map(Vec::as_slice)
    }

    pub fn synchronize(&mut self) -> Result<()> {
        self.backend.synchronize()
    }

    pub fn flush(&mut self) -> Result<Fence> {
        self.backend.flush()
    }

    /// Allocate an ndarray of `len` 4-byte elements.
    pub fn allocate_ndarray(&mut self, len: usize) -> Result<DeviceAllocation> {
        let size = (len * DataType::SIZE) as u64;
        self.backend.allocate_memory_ndarray(size, &self.result_buffer)
    }

    pub fn write_ndarray<T: bytemuck::Pod>(
        &mut self,
        alloc: &DeviceAllocation,
        data: &[T],
    ) -> Result<()> {
        self.backend
            .write_ndarray(alloc, 0, bytemuck::cast_slice(data))
    }

    pub fn read_ndarray<T: bytemuck::Pod>(&mut self, alloc: &DeviceAllocation) -> Result<Vec<T>> {
        let bytes = self.backend.read_ndarray(alloc, 0, alloc.size)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    pub fn release(&mut self, alloc: &DeviceAllocation) -> Result<()> {
        self.backend.release_allocation(alloc)
    }

    pub fn finalize(mut self) -> Result<()> {
        self.finalized = true;
        self.compiled.clear();
        self.backend.finalize()
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        if !self.finalized {
            if let Err(e) = self.backend.finalize() {
                tracing::warn!(error = %e, "finalize on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests;
