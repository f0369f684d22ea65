use std::collections::BTreeMap;
use std::sync::Mutex;

use super::*;
use crate::ir::KernelBuilder;
use crate::runtime::{AllocationKind, LaunchContext};
use crate::snode::{SNodeTreeBuilder, TreeLayout};

#[derive(Default)]
struct Calls {
    compiles: Vec<String>,
    launches: usize,
    trees: Vec<TreeId>,
    finalized: usize,
}

/// In-memory backend recording every call. Kernels return their
/// first scalar argument plus one.
#[derive(Default)]
struct MockBackend {
    calls: Arc<Mutex<Calls>>,
    layouts: BTreeMap<TreeId, TreeLayout>,
    memory: BTreeMap<AllocationId, Vec<u8>>,
    next_id: u64,
}

impl ProgramImpl for MockBackend {
    fn arch(&self) -> Arch {
        Arch::Cc
    }

    fn materialize_runtime(
        &mut self,
        _profiler: Option<Arc<dyn KernelProfiler>>,
    ) -> Result<ResultBuffer> {
        Ok(ResultBuffer::new())
    }

    fn compile(&mut self, _config: &CompileConfig, kernel: &Kernel) -> Result<CompiledFunction> {
        self.calls.lock().unwrap().compiles.push(kernel.name.clone());
        let calls = Arc::clone(&self.calls);
        Ok(CompiledFunction::new(
            &kernel.name,
            kernel.fingerprint(),
            move |ctx| {
                calls.lock().unwrap().launches += 1;
                let v = ctx.scalar_i32(0).unwrap_or(0);
                ctx.result_buffer().set(0, (v + 1) as u32 as u64)
            },
        ))
    }

    fn materialize_snode_tree(
        &mut self,
        tree: &SNodeTree,
        _result_buffer: &ResultBuffer,
    ) -> Result<()> {
        self.calls.lock().unwrap().trees.push(tree.id);
        self.layouts.insert(tree.id, compute_layout(tree)?);
        Ok(())
    }

    fn destroy_snode_tree(&mut self, tree: TreeId) -> Result<()> {
        self.layouts
            .remove(&tree)
            .map(|_| ())
            .ok_or(BackendError::UnknownTree(tree.0))
    }

    fn synchronize(&mut self) -> Result<()> {
        Ok(())
    }

    fn allocate_memory_ndarray(
        &mut self,
        size: u64,
        _result_buffer: &ResultBuffer,
    ) -> Result<DeviceAllocation> {
        self.next_id += 1;
        let id = AllocationId(self.next_id);
        self.memory.insert(id, vec![0; size as usize]);
        Ok(DeviceAllocation {
            id,
            size,
            kind: AllocationKind::Buffer,
        })
    }

    fn release_allocation(&mut self, alloc: &DeviceAllocation) -> Result<()> {
        self.memory
            .remove(&alloc.id)
            .map(|_| ())
            .ok_or(BackendError::UnknownAllocation(alloc.id.0))
    }

    fn write_ndarray(&mut self, alloc: &DeviceAllocation, offset: u64, data: &[u8]) -> Result<()> {
        let mem = self
            .memory
            .get_mut(&alloc.id)
            .ok_or(BackendError::UnknownAllocation(alloc.id.0))?;
        let at = offset as usize;
        mem[at..at + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_ndarray(&mut self, alloc: &DeviceAllocation, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mem = self
            .memory
            .get(&alloc.id)
            .ok_or(BackendError::UnknownAllocation(alloc.id.0))?;
        Ok(mem[offset as usize..(offset + len) as usize].to_vec())
    }

    fn get_field_in_tree_offset(&self, tree: TreeId, snode: SNodeId) -> Result<usize> {
        let layout = self.layouts.get(&tree).ok_or(BackendError::UnknownTree(tree.0))?;
        layout
            .field(snode)
            .map(|f| f.offset)
            .ok_or_else(|| BackendError::UnknownSNode(snode.to_string()))
    }

    fn get_kernel_argument_data_layout(&self) -> DataLayout {
        DataLayout::for_arguments(&DeviceCaps::host())
    }

    fn finalize(&mut self) -> Result<()> {
        self.calls.lock().unwrap().finalized += 1;
        Ok(())
    }
}

fn session() -> (Program, Arc<Mutex<Calls>>) {
    let backend = MockBackend::default();
    let calls = Arc::clone(&backend.calls);
    let program = Program::with_backend(CompileConfig::default(), Box::new(backend), None).unwrap();
    (program, calls)
}

fn incr_kernel(name: &str) -> Kernel {
    let mut k = KernelBuilder::new(name);
    let x = k.scalar_arg(DataType::I32);
    let r = k.return_slot(DataType::I32);
    k.ret(r, x + 1.into());
    k.build()
}

#[test]
fn test_compile_cache_by_fingerprint() {
    let (mut program, calls) = session();
    let a = program.compile(&incr_kernel("incr")).unwrap();
    let b = program.compile(&incr_kernel("incr")).unwrap();
    assert_eq!(a.fingerprint(), b.fingerprint());
    program.compile(&incr_kernel("incr2")).unwrap();
    assert_eq!(calls.lock().unwrap().compiles, vec!["incr", "incr2"]);
    assert_eq!(program.return_types("incr"), Some(&[DataType::I32][..]));
    assert_eq!(program.return_types("missing"), None);
}

#[test]
fn test_launch_and_fetch() {
    let (mut program, calls) = session();
    let kernel = incr_kernel("incr");
    program
        .launch(&kernel, &[ArgValue::Scalar(41.into())])
        .unwrap();
    assert_eq!(program.fetch_result::<i32>(0), Some(42));
    program
        .launch(&kernel, &[ArgValue::Scalar((-3).into())])
        .unwrap();
    assert_eq!(program.fetch_result::<i32>(0), Some(-2));
    let calls = calls.lock().unwrap();
    assert_eq!(calls.launches, 2);
    assert_eq!(calls.compiles.len(), 1);
}

#[test]
fn test_trees_and_layout_queries() {
    let (mut program, calls) = session();
    let mut b = SNodeTreeBuilder::new(TreeId(1));
    let root = b.root();
    let d = b.dense(root, &[8]);
    let x = b.place(d, DataType::F32, "x");
    let y = b.place(d, DataType::F32, "y");
    program.add_snode_tree(&b.build().unwrap()).unwrap();
    assert_eq!(calls.lock().unwrap().trees, vec![TreeId(1)]);

    let backend = program.backend();
    assert_eq!(backend.get_field_in_tree_offset(TreeId(1), x).unwrap(), 0);
    assert_eq!(backend.get_field_in_tree_offset(TreeId(1), y).unwrap(), 4);
    assert_eq!(backend.get_kernel_return_data_layout(), DataLayout::RETURN);
    assert!(backend.make_aot_module_builder(&DeviceCaps::default()).is_none());
    assert_eq!(
        backend.get_snode_num_dynamically_allocated(x, program.result_buffer()),
        AllocationCount::Unsupported
    );

    program.destroy_snode_tree(TreeId(1)).unwrap();
    assert!(matches!(
        program.destroy_snode_tree(TreeId(1)),
        Err(BackendError::UnknownTree(1))
    ));
}

#[test]
fn test_typed_ndarray_transfers() {
    let (mut program, _) = session();
    let alloc = program.allocate_ndarray(4).unwrap();
    assert_eq!(alloc.size, 16);
    program.write_ndarray(&alloc, &[1.5f32, 2.5, -1.0, 0.0]).unwrap();
    let back: Vec<f32> = program.read_ndarray(&alloc).unwrap();
    assert_eq!(back, vec![1.5, 2.5, -1.0, 0.0]);
    assert!(!program.backend().used_in_kernel(alloc.id));
    program.release(&alloc).unwrap();
    assert!(program.release(&alloc).is_err());
}

#[test]
fn test_default_backend_operations() {
    let (mut program, _) = session();
    assert!(program.flush().unwrap().is_signaled());
    let params = ImageParams {
        width: 4,
        height: 4,
        depth: 1,
        format: crate::runtime::TexelFormat::R32Float,
    };
    assert!(matches!(
        program.backend_mut().allocate_texture(&params),
        Err(BackendError::NotImplemented {
            backend: "cc",
            operation: "allocate_texture"
        })
    ));
}

#[test]
fn test_finalize_runs_once() {
    let (program, calls) = session();
    program.finalize().unwrap();
    assert_eq!(calls.lock().unwrap().finalized, 1);

    let (program, calls) = session();
    drop(program);
    assert_eq!(calls.lock().unwrap().finalized, 1);
}

#[test]
fn test_launch_context_uses_session_buffer() {
    let (program, _) = session();
    let ctx: LaunchContext = program.launch_context().arg(3);
    assert!(ctx.result_buffer().ptr_eq(program.result_buffer()));
    assert_eq!(ctx.scalar_i32(0), Some(3));
}

#[test]
fn test_create_program_impl_for_cc() {
    let backend = create_program_impl(&CompileConfig::for_arch(Arch::Cc)).unwrap();
    assert_eq!(backend.arch(), Arch::Cc);
    assert_eq!(backend.get_kernel_argument_data_layout().to_string(), "1b");
}
