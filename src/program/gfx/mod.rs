//! wgpu compute backend.
//!
//! Each tree lives in one storage buffer, each ndarray in another. Kernel
//! launches are recorded into a pending command encoder and only reach
//! the queue on `flush`, `synchronize`, a host transfer or a kernel with
//! return values. Allocations referenced by recorded work stay in use
//! until the next synchronize.

pub mod aot;
pub mod device;
pub mod runtime;
pub mod snode_tree;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use self::aot::GfxAotModuleBuilder;
use self::device::{check_transfer, GfxDevice};
use self::runtime::{GfxAllocations, GfxRuntime};
use self::snode_tree::{SNodeTreeManager, TreeAllocation};
use super::{AotModuleBuilder, ProgramImpl};
use crate::config::{Arch, CompileConfig, DEFAULT_GTMP_BYTES};
use crate::error::{BackendError, Result};
use crate::ir::Kernel;
use crate::runtime::{
    AllocationId, CompiledFunction, DataLayout, DeviceAllocation, DeviceCaps, Fence, ImageParams,
    KernelProfiler, LaunchContext, ResultBuffer,
};
use crate::snode::{compute_layout, Layouts, SNodeId, SNodeTree, TreeId};

struct GfxState {
    device: GfxDevice,
    trees: SNodeTreeManager,
    runtime: Option<GfxRuntime>,
    allocations: GfxAllocations,
    encoder: Option<wgpu::CommandEncoder>,
    result_buffer: ResultBuffer,
    profiler: Option<Arc<dyn KernelProfiler>>,
}

impl GfxState {
    /// Submit recorded launches, if any.
    fn submit(&mut self) -> Option<wgpu::SubmissionIndex> {
        let encoder = self.encoder.take()?;
        Some(self.device.queue.submit(std::iter::once(encoder.finish())))
    }

    fn synchronize(&mut self) {
        self.submit();
        let _ = self.device.device.poll(wgpu::Maintain::Wait);
        self.allocations.retire();
    }
}

type Shared = Arc<Mutex<Option<GfxState>>>;

fn lock(shared: &Shared) -> Result<MutexGuard<'_, Option<GfxState>>> {
    shared.lock().map_err(|_| BackendError::Poisoned)
}

fn launch(shared: &Shared, name: &str, ctx: &LaunchContext) -> Result<()> {
    let mut guard = lock(shared)?;
    let state = guard.as_mut().ok_or(BackendError::RuntimeNotMaterialized)?;
    let start = Instant::now();

    let runtime = state
        .runtime
        .as_ref()
        .ok_or_else(|| BackendError::UnknownKernel(name.to_string()))?;
    let device = &state.device;
    let encoder = state.encoder.get_or_insert_with(|| {
        device
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("weft_launches"),
            })
    });
    let recorded = runtime.record(device, encoder, &state.trees, &state.allocations, name, ctx)?;

    if recorded.returns > 0 {
        state.submit();
        let rets = match &state.runtime {
            Some(runtime) => state
                .device
                .read_buffer(runtime.rets(), 0, (recorded.returns * 4) as u64)?,
            None => Vec::new(),
        };
        let words: Vec<u32> = bytemuck::pod_collect_to_vec(&rets);
        ctx.result_buffer().store_u32(&words);
        state.allocations.retire();
    } else {
        state.allocations.mark_in_flight(recorded.ndarrays);
    }

    let elapsed = start.elapsed();
    if let Some(profiler) = &state.profiler {
        profiler.record(name, elapsed);
    }
    tracing::debug!(kernel = name, ?elapsed, "launched");
    Ok(())
}

// ─── Backend ───────────────────────────────────────────────────────

pub struct GfxProgram {
    /// Held until the runtime is materialized.
    device: Option<GfxDevice>,
    caps: DeviceCaps,
    gtmp_bytes: usize,
    /// Layouts of every tree whose types were compiled.
    tree_types: Layouts,
    state: Shared,
}

impl GfxProgram {
    /// Backend on the first available adapter.
    pub fn new() -> Result<Self> {
        Ok(Self::with_device(GfxDevice::new()?))
    }

    pub fn with_device(device: GfxDevice) -> Self {
        tracing::info!(adapter = %device.adapter_name, "gfx device acquired");
        Self {
            caps: device.caps,
            device: Some(device),
            gtmp_bytes: DEFAULT_GTMP_BYTES,
            tree_types: Layouts::new(),
            state: Arc::new(Mutex::new(None)),
        }
    }

    pub fn caps(&self) -> DeviceCaps {
        self.caps
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut GfxState) -> Result<T>) -> Result<T> {
        let mut guard = lock(&self.state)?;
        let state = guard.as_mut().ok_or(BackendError::RuntimeNotMaterialized)?;
        f(state)
    }

    /// Run `f` against the storage buffer and layout of a materialized
    /// tree. wgpu has no device addresses, so this is the handle other
    /// GPU code binds to reach a tree's data.
    pub fn with_snode_tree_buffer<T>(
        &self,
        tree: TreeId,
        f: impl FnOnce(&TreeAllocation) -> T,
    ) -> Result<T> {
        self.with_state(|s| {
            let alloc = s.trees.get(tree).ok_or(BackendError::UnknownTree(tree.0))?;
            Ok(f(alloc))
        })
    }

    /// The WGSL generated for a compiled kernel.
    pub fn kernel_source(&self, name: &str) -> Result<String> {
        self.with_state(|s| {
            let runtime = s
                .runtime
                .as_ref()
                .ok_or_else(|| BackendError::UnknownKernel(name.to_string()))?;
            Ok(runtime.kernel(name)?.source.clone())
        })
    }

    fn function(&self, kernel: &Kernel) -> CompiledFunction {
        let shared = Arc::clone(&self.state);
        let name = kernel.name.clone();
        CompiledFunction::new(&kernel.name, kernel.fingerprint(), move |ctx| {
            launch(&shared, &name, ctx)
        })
    }
}

impl ProgramImpl for GfxProgram {
    fn arch(&self) -> Arch {
        Arch::Gfx
    }

    fn materialize_runtime(
        &mut self,
        profiler: Option<Arc<dyn KernelProfiler>>,
    ) -> Result<ResultBuffer> {
        let mut guard = lock(&self.state)?;
        if let Some(state) = guard.as_ref() {
            tracing::warn!("runtime already materialized");
            return Ok(state.result_buffer.clone());
        }
        let device = self
            .device
            .take()
            .ok_or(BackendError::RuntimeNotMaterialized)?;
        let result_buffer = ResultBuffer::new();
        tracing::info!(adapter = %device.adapter_name, "gfx runtime materialized");
        *guard = Some(GfxState {
            device,
            trees: SNodeTreeManager::new(),
            runtime: None,
            allocations: GfxAllocations::default(),
            encoder: None,
            result_buffer: result_buffer.clone(),
            profiler,
        });
        Ok(result_buffer)
    }

    fn compile(&mut self, config: &CompileConfig, kernel: &Kernel) -> Result<CompiledFunction> {
        let gtmp_bytes = self.with_state(|s| {
            let runtime = match s.runtime.take() {
                Some(runtime) => runtime,
                None => GfxRuntime::new(&s.device, config.gtmp_bytes),
            };
            let runtime = s.runtime.insert(runtime);
            runtime.compile(&s.device, config, kernel, &s.trees.layouts())?;
            Ok(runtime.gtmp_bytes())
        })?;
        self.gtmp_bytes = gtmp_bytes;
        Ok(self.function(kernel))
    }

    fn compile_snode_tree_types(&mut self, tree: &SNodeTree) -> Result<()> {
        let layout = compute_layout(tree)?;
        self.tree_types.insert(tree.id, layout);
        Ok(())
    }

    fn materialize_snode_tree(
        &mut self,
        tree: &SNodeTree,
        _result_buffer: &ResultBuffer,
    ) -> Result<()> {
        let layout = self.with_state(|s| s.trees.materialize(&s.device, tree).cloned())?;
        self.tree_types.insert(tree.id, layout);
        Ok(())
    }

    fn destroy_snode_tree(&mut self, tree: TreeId) -> Result<()> {
        self.with_state(|s| {
            s.submit();
            s.trees.destroy(tree)
        })?;
        self.tree_types.remove(&tree);
        tracing::debug!(tree = tree.0, "destroyed tree");
        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        self.with_state(|s| {
            s.synchronize();
            Ok(())
        })
    }

    fn flush(&mut self) -> Result<Fence> {
        self.with_state(|s| {
            let index = match s.submit() {
                Some(index) => index,
                None => s.device.queue.submit(std::iter::empty()),
            };
            Ok(Fence::submission(Arc::clone(&s.device.device), index))
        })
    }

    fn make_aot_module_builder(&self, caps: &DeviceCaps) -> Option<Box<dyn AotModuleBuilder>> {
        Some(Box::new(GfxAotModuleBuilder::new(
            *caps,
            self.gtmp_bytes,
            self.tree_types.clone(),
        )))
    }

    fn allocate_memory_ndarray(
        &mut self,
        size: u64,
        _result_buffer: &ResultBuffer,
    ) -> Result<DeviceAllocation> {
        self.with_state(|s| s.allocations.allocate_buffer(&s.device, size))
    }

    fn allocate_texture(&mut self, params: &ImageParams) -> Result<DeviceAllocation> {
        self.with_state(|s| s.allocations.allocate_texture(&s.device, params))
    }

    fn used_in_kernel(&self, id: AllocationId) -> bool {
        match self.state.lock() {
            Ok(guard) => guard
                .as_ref()
                .is_some_and(|s| s.allocations.used_in_kernel(id)),
            // Unknown after a panic mid-launch, so never report it free.
            Err(_) => true,
        }
    }

    fn release_allocation(&mut self, alloc: &DeviceAllocation) -> Result<()> {
        self.with_state(|s| s.allocations.release(alloc.id))
    }

    fn write_ndarray(&mut self, alloc: &DeviceAllocation, offset: u64, data: &[u8]) -> Result<()> {
        self.with_state(|s| {
            s.submit();
            let (buffer, size) = s.allocations.buffer(alloc.id)?;
            check_transfer(size, offset, data.len() as u64)?;
            s.device.queue.write_buffer(buffer, offset, data);
            Ok(())
        })
    }

    fn read_ndarray(&mut self, alloc: &DeviceAllocation, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.with_state(|s| {
            s.submit();
            let (buffer, size) = s.allocations.buffer(alloc.id)?;
            check_transfer(size, offset, len)?;
            let bytes = s.device.read_buffer(buffer, offset, len)?;
            s.allocations.retire();
            Ok(bytes)
        })
    }

    fn get_field_in_tree_offset(&self, tree: TreeId, snode: SNodeId) -> Result<usize> {
        let layout = self
            .tree_types
            .get(&tree)
            .ok_or(BackendError::UnknownTree(tree.0))?;
        layout
            .field(snode)
            .map(|f| f.offset)
            .ok_or_else(|| BackendError::UnknownSNode(snode.to_string()))
    }

    fn get_kernel_argument_data_layout(&self) -> DataLayout {
        DataLayout::for_arguments(&self.caps)
    }

    fn finalize(&mut self) -> Result<()> {
        let state = lock(&self.state)?.take();
        if let Some(mut state) = state {
            state.synchronize();
            state.trees.clear();
            state.allocations.clear();
            tracing::info!("gfx runtime finalized");
        }
        Ok(())
    }
}
