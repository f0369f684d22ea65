//! Transpile-to-native backend.
//!
//! Kernels are lowered to C and collected into one translation unit
//! together with the runtime support and the layout constants of every
//! materialized tree. Adding a kernel or a tree marks the module dirty;
//! the next launch relinks it: build the unit, swap the loaded module,
//! resolve every entry point again. All of this, and every launch, runs
//! under one mutex.

pub mod runtime;
pub mod toolchain;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use self::runtime::{translation_unit, KernelEntry, WeftContext};
use self::toolchain::{LoadedModule, SystemToolchain, Toolchain};
use super::ProgramImpl;
use crate::arena::Arena;
use crate::config::{Arch, CompileConfig};
use crate::error::{BackendError, Result};
use crate::ir::offload::{offload, OffloadedKernel};
use crate::ir::{Fingerprint, Kernel};
use crate::lower::{CLowering, KernelLowering};
use crate::runtime::{
    check_args, pack_arguments, AllocationId, AllocationKind, ArgValue, ArgumentLayout,
    CompiledFunction, DataLayout, DeviceAllocation, DeviceCaps, KernelProfiler, LaunchContext,
    ResultBuffer, MAX_ARGS, MAX_TREES,
};
use crate::snode::{compute_layout, Layouts, SNodeId, SNodeTree, TreeId};

/// Capacity of the argument arena.
pub const ARGS_BYTES: usize = 1024;

static INSTANCE: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// The loaded module contains every registered kernel and tree.
    Clean,
    /// Something was added since the last relink.
    Dirty,
    /// A relink failed. The session cannot launch anything again.
    Poisoned(String),
}

// ─── Host allocations ──────────────────────────────────────────────

/// Ndarray storage on the host. Launches are synchronous, so an
/// allocation is never in use once a call returns.
#[derive(Default)]
pub struct HostAllocator {
    next_id: u64,
    arenas: BTreeMap<AllocationId, Arena>,
}

impl HostAllocator {
    pub fn allocate(&mut self, size: u64) -> Result<DeviceAllocation> {
        let len = usize::try_from(size)
            .map_err(|_| BackendError::Transfer(format!("cannot allocate {} bytes", size)))?;
        self.next_id += 1;
        let id = AllocationId(self.next_id);
        self.arenas.insert(id, Arena::new(len));
        Ok(DeviceAllocation {
            id,
            size,
            kind: AllocationKind::Buffer,
        })
    }

    fn arena(&self, id: AllocationId) -> Result<&Arena> {
        self.arenas.get(&id).ok_or(BackendError::UnknownAllocation(id.0))
    }

    fn arena_mut(&mut self, id: AllocationId) -> Result<&mut Arena> {
        self.arenas
            .get_mut(&id)
            .ok_or(BackendError::UnknownAllocation(id.0))
    }

    pub fn write(&mut self, id: AllocationId, offset: u64, data: &[u8]) -> Result<()> {
        self.arena_mut(id)?.write(offset as usize, data)
    }

    pub fn read(&self, id: AllocationId, offset: u64, len: u64) -> Result<Vec<u8>> {
        Ok(self.arena(id)?.read(offset as usize, len as usize)?.to_vec())
    }

    /// Base address handed to generated code, and the number of 4-byte
    /// elements behind it.
    pub fn address(&mut self, id: AllocationId) -> Result<(usize, u32)> {
        let arena = self.arena_mut(id)?;
        let elements = u32::try_from(arena.len() / 4).unwrap_or(u32::MAX);
        Ok((arena.as_mut_ptr() as usize, elements))
    }

    pub fn release(&mut self, id: AllocationId) -> Result<()> {
        self.arenas
            .remove(&id)
            .map(|_| ())
            .ok_or(BackendError::UnknownAllocation(id.0))
    }

    pub fn len(&self) -> usize {
        self.arenas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arenas.is_empty()
    }
}

// ─── State ─────────────────────────────────────────────────────────

struct CcKernel {
    fingerprint: Fingerprint,
    offloaded: OffloadedKernel,
    args: ArgumentLayout,
    source: String,
}

struct CcState {
    toolchain: Box<dyn Toolchain>,
    module_dir: PathBuf,
    gtmp_bytes: usize,
    kernels: Vec<CcKernel>,
    entries: HashMap<String, KernelEntry>,
    module: Option<Box<dyn LoadedModule>>,
    link: LinkState,
    generation: u64,
    layouts: Layouts,
    context: WeftContext,
    args: Arena,
    roots: BTreeMap<TreeId, Arena>,
    gtmp: Arena,
    allocator: HostAllocator,
    result_buffer: ResultBuffer,
    profiler: Option<Arc<dyn KernelProfiler>>,
}

type Shared = Arc<Mutex<Option<CcState>>>;

fn lock(shared: &Shared) -> Result<MutexGuard<'_, Option<CcState>>> {
    shared.lock().map_err(|_| BackendError::Poisoned)
}

fn link_failure(message: &str) -> BackendError {
    BackendError::LinkFailure {
        message: message.to_string(),
        diagnostics: Vec::new(),
    }
}

impl CcState {
    fn kernel_index(&self, name: &str) -> Result<usize> {
        self.kernels
            .iter()
            .position(|k| k.offloaded.name == name)
            .ok_or_else(|| BackendError::UnknownKernel(name.to_string()))
    }

    fn source(&self) -> String {
        translation_unit(
            &self.layouts,
            self.gtmp_bytes,
            self.kernels.iter().map(|k| k.source.as_str()),
        )
    }

    fn mark_dirty(&mut self) {
        if self.link == LinkState::Clean {
            self.link = LinkState::Dirty;
        }
    }

    fn module_path(&self, generation: u64) -> PathBuf {
        self.module_dir.join(format!(
            "libweft_g{}.{}",
            generation,
            std::env::consts::DLL_EXTENSION
        ))
    }

    /// Relink if dirty. A failed relink poisons the state.
    fn ensure_linked(&mut self) -> Result<()> {
        match &self.link {
            LinkState::Clean => Ok(()),
            LinkState::Poisoned(message) => Err(link_failure(message)),
            LinkState::Dirty => match self.relink() {
                Ok(()) => {
                    self.link = LinkState::Clean;
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(error = %e, "relink failed; session is poisoned");
                    self.entries.clear();
                    self.link = LinkState::Poisoned(e.to_string());
                    Err(e)
                }
            },
        }
    }

    fn relink(&mut self) -> Result<()> {
        let source = self.source();
        self.generation += 1;
        let path = self.module_path(self.generation);
        std::fs::create_dir_all(&self.module_dir)?;
        let start = Instant::now();
        self.toolchain.build(&source, &path)?;

        // Entry points die with the module they came from.
        self.entries.clear();
        self.module = None;
        let module = self.toolchain.load(&path)?;
        for kernel in &self.kernels {
            let symbol = &kernel.offloaded.symbol;
            let entry = module
                .resolve(symbol)
                .ok_or_else(|| BackendError::SymbolResolution(symbol.clone()))?;
            self.entries.insert(kernel.offloaded.name.clone(), entry);
        }
        self.module = Some(module);
        tracing::debug!(
            generation = self.generation,
            kernels = self.kernels.len(),
            path = %path.display(),
            elapsed = ?start.elapsed(),
            "relinked module"
        );
        Ok(())
    }

    fn load_kernel(&self, name: &str) -> Result<KernelEntry> {
        if let LinkState::Poisoned(message) = &self.link {
            return Err(link_failure(message));
        }
        if self.module.is_none() {
            return Err(BackendError::RuntimeNotLinked);
        }
        self.kernel_index(name)?;
        match self.entries.get(name) {
            Some(entry) => Ok(*entry),
            // Registered after the last relink.
            None if self.link == LinkState::Dirty => Err(BackendError::RuntimeNotLinked),
            None => Err(BackendError::SymbolResolution(name.to_string())),
        }
    }

    /// Marshal `args` into the argument arena and point the context at
    /// every arena the kernel may touch.
    fn update_context(&mut self, index: usize, args: &[ArgValue]) -> Result<()> {
        let kernel = &self.kernels[index];
        check_args(&kernel.offloaded.name, &kernel.offloaded.params, args)?;
        let mut bytes = kernel.args.marshal_scalars(args)?;
        self.context.nd_len = [0; MAX_ARGS];
        for (i, arg) in args.iter().enumerate() {
            if let ArgValue::NdArray(alloc) = arg {
                let (address, elements) = self.allocator.address(alloc.id)?;
                kernel.args.write_pointer(&mut bytes, i, address)?;
                self.context.nd_len[i] = elements;
            }
        }
        self.args.clear();
        self.args.write(0, &bytes)?;
        self.context.args = self.args.as_mut_ptr();
        self.context.gtmp = self.gtmp.as_mut_ptr();
        for (tree, arena) in self.roots.iter_mut() {
            self.context.roots[tree.0 as usize] = arena.as_mut_ptr();
        }
        self.context.rets = [0; crate::runtime::MAX_RETURNS];
        self.context.fault = 0;
        Ok(())
    }

    fn context_to_result_buffer(&self, index: usize, result_buffer: &ResultBuffer) {
        let n = self.kernels[index].offloaded.returns.len();
        result_buffer.store_u32(&self.context.rets[..n]);
    }
}

fn launch(shared: &Shared, name: &str, ctx: &LaunchContext) -> Result<()> {
    let mut guard = lock(shared)?;
    let state = guard.as_mut().ok_or(BackendError::RuntimeNotMaterialized)?;
    state.ensure_linked()?;
    let entry = state.load_kernel(name)?;
    let index = state.kernel_index(name)?;
    state.update_context(index, ctx.args())?;

    let start = Instant::now();
    // SAFETY: `entry` was resolved from the module currently loaded, and
    // the context points only at arenas owned by `state`. Generated code
    // checks every field index against its extent and every ndarray index
    // against `nd_len` before touching memory.
    unsafe { entry(&mut state.context) };
    let elapsed = start.elapsed();

    // Out-of-range loads read zero, so the returns are still published.
    state.context_to_result_buffer(index, ctx.result_buffer());
    if let Some(profiler) = &state.profiler {
        profiler.record(name, elapsed);
    }
    if state.context.fault != 0 {
        tracing::debug!(kernel = name, "out-of-range access");
        return Err(BackendError::IndexOutOfBounds(name.to_string()));
    }
    tracing::debug!(kernel = name, ?elapsed, "launched");
    Ok(())
}

// ─── Backend ───────────────────────────────────────────────────────

pub struct CcProgram {
    config: CompileConfig,
    toolchain: Option<Box<dyn Toolchain>>,
    state: Shared,
}

impl CcProgram {
    /// Backend driving the configured system C compiler.
    pub fn new(config: &CompileConfig) -> Self {
        Self::with_toolchain(config, Box::new(SystemToolchain::from_config(config)))
    }

    pub fn with_toolchain(config: &CompileConfig, toolchain: Box<dyn Toolchain>) -> Self {
        Self {
            config: config.clone(),
            toolchain: Some(toolchain),
            state: Arc::new(Mutex::new(None)),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut CcState) -> Result<T>) -> Result<T> {
        let mut guard = lock(&self.state)?;
        let state = guard.as_mut().ok_or(BackendError::RuntimeNotMaterialized)?;
        f(state)
    }

    pub fn link_state(&self) -> Result<LinkState> {
        self.with_state(|s| Ok(s.link.clone()))
    }

    /// Number of successful or attempted relinks so far.
    pub fn generation(&self) -> Result<u64> {
        self.with_state(|s| Ok(s.generation))
    }

    /// Relink now if anything changed since the last relink.
    pub fn relink(&self) -> Result<()> {
        self.with_state(|s| s.ensure_linked())
    }

    /// Resolve a registered kernel from the current module.
    ///
    /// The returned pointer is only valid until the next relink.
    pub fn load_kernel(&self, name: &str) -> Result<KernelEntry> {
        self.with_state(|s| s.load_kernel(name))
    }

    /// The combined unit the next relink would build.
    pub fn translation_unit(&self) -> Result<String> {
        self.with_state(|s| Ok(s.source()))
    }

    pub fn module_dir(&self) -> Result<PathBuf> {
        self.with_state(|s| Ok(s.module_dir.clone()))
    }

    fn function(&self, name: &str, fingerprint: Fingerprint) -> CompiledFunction {
        let shared = Arc::clone(&self.state);
        let kernel = name.to_string();
        CompiledFunction::new(name, fingerprint, move |ctx| launch(&shared, &kernel, ctx))
    }
}

fn session_dir(configured: Option<&Path>) -> PathBuf {
    let base = configured
        .map(Path::to_path_buf)
        .unwrap_or_else(|| std::env::temp_dir().join("weft"));
    base.join(format!(
        "{}-{}",
        std::process::id(),
        INSTANCE.fetch_add(1, Ordering::Relaxed)
    ))
}

impl ProgramImpl for CcProgram {
    fn arch(&self) -> Arch {
        Arch::Cc
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
        let toolchain = self
            .toolchain
            .take()
            .ok_or(BackendError::RuntimeNotMaterialized)?;
        let module_dir = session_dir(self.config.module_dir.as_deref());
        let result_buffer = ResultBuffer::new();
        tracing::info!(module_dir = %module_dir.display(), "cc runtime materialized");
        *guard = Some(CcState {
            toolchain,
            module_dir,
            gtmp_bytes: self.config.gtmp_bytes,
            kernels: Vec::new(),
            entries: HashMap::new(),
            module: None,
            link: LinkState::Dirty,
            generation: 0,
            layouts: Layouts::new(),
            context: WeftContext::new(),
            args: Arena::new(ARGS_BYTES),
            roots: BTreeMap::new(),
            gtmp: Arena::new(self.config.gtmp_bytes),
            allocator: HostAllocator::default(),
            result_buffer: result_buffer.clone(),
            profiler,
        });
        Ok(result_buffer)
    }

    fn compile(&mut self, config: &CompileConfig, kernel: &Kernel) -> Result<CompiledFunction> {
        let fingerprint = kernel.fingerprint();
        self.with_state(|state| {
            if let Some(existing) = state.kernels.iter().find(|k| k.offloaded.name == kernel.name) {
                if existing.fingerprint != fingerprint {
                    return Err(BackendError::DuplicateKernel(kernel.name.clone()));
                }
                return Ok(());
            }
            let symbol = kernel.symbol();
            if state.kernels.iter().any(|k| k.offloaded.symbol == symbol) {
                return Err(BackendError::DuplicateKernel(kernel.name.clone()));
            }
            let offloaded = offload(kernel, &state.layouts, state.gtmp_bytes)?;
            let args = pack_arguments(
                &offloaded.params,
                &DataLayout::for_arguments(&DeviceCaps::host()),
            );
            if args.size > ARGS_BYTES {
                return Err(BackendError::invalid_kernel(
                    &kernel.name,
                    format!("arguments need {} bytes, limit is {}", args.size, ARGS_BYTES),
                ));
            }
            let source = CLowering::new().lower(&offloaded, &args);
            if config.print_kernel_source {
                tracing::info!(kernel = %kernel.name, "generated C:\n{}", source);
            }
            tracing::debug!(
                kernel = %kernel.name,
                tasks = offloaded.tasks.len(),
                "registered kernel"
            );
            state.kernels.push(CcKernel {
                fingerprint,
                offloaded,
                args,
                source,
            });
            state.mark_dirty();
            Ok(())
        })?;
        Ok(self.function(&kernel.name, fingerprint))
    }

    fn materialize_snode_tree(
        &mut self,
        tree: &SNodeTree,
        _result_buffer: &ResultBuffer,
    ) -> Result<()> {
        if tree.id.0 as usize >= MAX_TREES {
            return Err(BackendError::invalid_tree(
                tree.id.0,
                format!("tree ids must be below {}", MAX_TREES),
            ));
        }
        let layout = compute_layout(tree)?;
        self.with_state(|state| {
            if state.layouts.contains_key(&tree.id) {
                return Err(BackendError::invalid_tree(tree.id.0, "already materialized"));
            }
            let mut arena = Arena::new(layout.size);
            state.context.roots[tree.id.0 as usize] = arena.as_mut_ptr();
            state.roots.insert(tree.id, arena);
            tracing::debug!(tree = tree.id.0, size = layout.size, "materialized tree");
            state.layouts.insert(tree.id, layout);
            state.mark_dirty();
            Ok(())
        })
    }

    fn destroy_snode_tree(&mut self, tree: TreeId) -> Result<()> {
        tracing::warn!(tree = tree.0, "cc backend keeps tree storage until finalize");
        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        Ok(())
    }

    fn allocate_memory_ndarray(
        &mut self,
        size: u64,
        _result_buffer: &ResultBuffer,
    ) -> Result<DeviceAllocation> {
        self.with_state(|s| s.allocator.allocate(size))
    }

    fn release_allocation(&mut self, alloc: &DeviceAllocation) -> Result<()> {
        self.with_state(|s| s.allocator.release(alloc.id))
    }

    fn write_ndarray(&mut self, alloc: &DeviceAllocation, offset: u64, data: &[u8]) -> Result<()> {
        self.with_state(|s| s.allocator.write(alloc.id, offset, data))
    }

    fn read_ndarray(&mut self, alloc: &DeviceAllocation, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.with_state(|s| s.allocator.read(alloc.id, offset, len))
    }

    fn get_field_in_tree_offset(&self, tree: TreeId, snode: SNodeId) -> Result<usize> {
        self.with_state(|s| {
            let layout = s.layouts.get(&tree).ok_or(BackendError::UnknownTree(tree.0))?;
            layout
                .field(snode)
                .map(|f| f.offset)
                .ok_or_else(|| BackendError::UnknownSNode(snode.to_string()))
        })
    }

    fn get_kernel_argument_data_layout(&self) -> DataLayout {
        DataLayout::for_arguments(&DeviceCaps::host())
    }

    fn finalize(&mut self) -> Result<()> {
        let state = lock(&self.state)?.take();
        if let Some(state) = state {
            let dir = state.module_dir.clone();
            drop(state);
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    tracing::warn!(dir = %dir.display(), error = %e, "cannot remove module dir");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
