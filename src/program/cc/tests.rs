use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::runtime::{layout_constants, KernelEntry, WeftContext, RUNTIME_SUPPORT};
use super::toolchain::{LoadedModule, Toolchain};
use super::*;
use crate::diagnostic::parse_toolchain_output;
use crate::ir::{DataType, Expr, KernelBuilder};
use crate::runtime::{AllocationCount, ImageParams, RecordingProfiler, TexelFormat};
use crate::snode::SNodeTreeBuilder;

// Stand-ins for compiled kernels. Each one mimics what the C lowering
// of the matching kernel below does.

unsafe extern "C" fn answer(ctx: *mut WeftContext) {
    (*ctx).rets[0] = 42;
}

unsafe extern "C" fn double(ctx: *mut WeftContext) {
    let v = std::ptr::read_unaligned((*ctx).args as *const i32);
    (*ctx).rets[0] = v.wrapping_mul(2) as u32;
}

unsafe extern "C" fn poke(ctx: *mut WeftContext) {
    let base = std::ptr::read_unaligned((*ctx).args as *const usize) as *mut f32;
    base.add(1).write_unaligned(7.0);
}

unsafe extern "C" fn lengths(ctx: *mut WeftContext) {
    (*ctx).rets[0] = (*ctx).nd_len[0];
    (*ctx).rets[1] = (*ctx).nd_len[1];
    (*ctx).rets[2] = (*ctx).nd_len[2];
}

unsafe extern "C" fn stray(ctx: *mut WeftContext) {
    (*ctx).fault = 1;
}

#[derive(Clone, Default)]
struct FakeToolchain {
    builds: Arc<Mutex<Vec<(String, PathBuf)>>>,
    fail_with: Option<String>,
    /// Builds that succeed before `fail_with` applies.
    succeed_first: usize,
    missing: Vec<&'static str>,
}

struct FakeModule {
    missing: Vec<&'static str>,
}

impl Toolchain for FakeToolchain {
    fn build(&self, source: &str, output: &Path) -> Result<()> {
        let attempt = {
            let mut builds = self.builds.lock().unwrap();
            builds.push((source.to_string(), output.to_path_buf()));
            builds.len()
        };
        match &self.fail_with {
            Some(stderr) if attempt > self.succeed_first => Err(BackendError::LinkFailure {
                message: "cc exited with status 1".to_string(),
                diagnostics: parse_toolchain_output(stderr, source),
            }),
            _ => Ok(()),
        }
    }

    fn load(&self, _path: &Path) -> Result<Box<dyn LoadedModule>> {
        Ok(Box::new(FakeModule {
            missing: self.missing.clone(),
        }))
    }
}

impl LoadedModule for FakeModule {
    fn resolve(&self, symbol: &str) -> Option<KernelEntry> {
        if self.missing.contains(&symbol) {
            return None;
        }
        let entry: KernelEntry = match symbol {
            "weft_k_answer" => answer,
            "weft_k_double" => double,
            "weft_k_poke" => poke,
            "weft_k_lengths" => lengths,
            "weft_k_stray" => stray,
            _ => return None,
        };
        Some(entry)
    }
}

fn answer_kernel() -> Kernel {
    let mut k = KernelBuilder::new("answer");
    let r = k.return_slot(DataType::I32);
    k.ret(r, 42.into());
    k.build()
}

fn double_kernel() -> Kernel {
    let mut k = KernelBuilder::new("double");
    let x = k.scalar_arg(DataType::I32);
    let r = k.return_slot(DataType::I32);
    k.ret(r, x * 2.into());
    k.build()
}

fn poke_kernel() -> Kernel {
    let mut k = KernelBuilder::new("poke");
    let arr = k.ndarray_arg(DataType::F32);
    k.nd_store(arr, 1.into(), 7.0f32.into());
    k.build()
}

struct Setup {
    program: CcProgram,
    rb: ResultBuffer,
    config: CompileConfig,
    builds: Arc<Mutex<Vec<(String, PathBuf)>>>,
    _dir: tempfile::TempDir,
}

fn setup_with(toolchain: FakeToolchain) -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let config = CompileConfig {
        module_dir: Some(dir.path().to_path_buf()),
        gtmp_bytes: 64,
        ..CompileConfig::default()
    };
    let builds = Arc::clone(&toolchain.builds);
    let mut program = CcProgram::with_toolchain(&config, Box::new(toolchain));
    let rb = program.materialize_runtime(None).unwrap();
    Setup {
        program,
        rb,
        config,
        builds,
        _dir: dir,
    }
}

fn setup() -> Setup {
    setup_with(FakeToolchain::default())
}

#[test]
fn test_requires_materialized_runtime() {
    let config = CompileConfig::default();
    let mut program = CcProgram::with_toolchain(&config, Box::new(FakeToolchain::default()));
    assert!(matches!(
        program.compile(&config, &answer_kernel()),
        Err(BackendError::RuntimeNotMaterialized)
    ));
    let rb = ResultBuffer::new();
    assert!(matches!(
        program.allocate_memory_ndarray(16, &rb),
        Err(BackendError::RuntimeNotMaterialized)
    ));
}

#[test]
fn test_launch_relinks_once() {
    let mut s = setup();
    let f = s.program.compile(&s.config, &answer_kernel()).unwrap();
    assert_eq!(s.program.link_state().unwrap(), LinkState::Dirty);

    f.launch(&LaunchContext::new(&s.rb)).unwrap();
    assert_eq!(s.rb.fetch::<i32>(0), Some(42));
    f.launch(&LaunchContext::new(&s.rb)).unwrap();

    assert_eq!(s.program.link_state().unwrap(), LinkState::Clean);
    assert_eq!(s.program.generation().unwrap(), 1);
    let builds = s.builds.lock().unwrap();
    assert_eq!(builds.len(), 1);
    let file = builds[0].1.file_name().unwrap().to_string_lossy().to_string();
    assert_eq!(
        file,
        format!("libweft_g1.{}", std::env::consts::DLL_EXTENSION)
    );
    assert!(builds[0].0.starts_with(RUNTIME_SUPPORT));
    assert!(builds[0].0.contains("WEFT_EXPORT void weft_k_answer(WeftContext *ctx)"));
}

#[test]
fn test_earlier_kernel_survives_relink() {
    let mut s = setup();
    let answer = s.program.compile(&s.config, &answer_kernel()).unwrap();
    answer.launch(&LaunchContext::new(&s.rb)).unwrap();

    let double = s.program.compile(&s.config, &double_kernel()).unwrap();
    double.launch(&LaunchContext::new(&s.rb).arg(21)).unwrap();
    assert_eq!(s.rb.fetch::<i32>(0), Some(42));
    assert_eq!(s.program.generation().unwrap(), 2);

    s.rb.set(0, 0).unwrap();
    answer.launch(&LaunchContext::new(&s.rb)).unwrap();
    assert_eq!(s.rb.fetch::<i32>(0), Some(42));

    let source = s.program.translation_unit().unwrap();
    let a = source.find("weft_k_answer").unwrap();
    let d = source.find("weft_k_double").unwrap();
    assert!(a < d);
}

#[test]
fn test_repeat_compile_is_equivalent() {
    let mut s = setup();
    let first = s.program.compile(&s.config, &double_kernel()).unwrap();
    let second = s.program.compile(&s.config, &double_kernel()).unwrap();
    assert_eq!(first.fingerprint(), second.fingerprint());

    for f in [&first, &second] {
        f.launch(&LaunchContext::new(&s.rb).arg(-4)).unwrap();
        assert_eq!(s.rb.fetch::<i32>(0), Some(-8));
    }
    assert_eq!(s.builds.lock().unwrap().len(), 1);
}

#[test]
fn test_duplicate_kernel_name() {
    let mut s = setup();
    s.program.compile(&s.config, &answer_kernel()).unwrap();
    let mut k = KernelBuilder::new("answer");
    let r = k.return_slot(DataType::I32);
    k.ret(r, 7.into());
    assert!(matches!(
        s.program.compile(&s.config, &k.build()),
        Err(BackendError::DuplicateKernel(name)) if name == "answer"
    ));

    // Different names, same symbol after sanitizing.
    s.program.compile(&s.config, &KernelBuilder::new("a_b").build()).unwrap();
    assert!(matches!(
        s.program.compile(&s.config, &KernelBuilder::new("a-b").build()),
        Err(BackendError::DuplicateKernel(_))
    ));
}

#[test]
fn test_load_kernel_errors() {
    let mut s = setup();
    s.program.compile(&s.config, &answer_kernel()).unwrap();
    assert!(matches!(
        s.program.load_kernel("answer"),
        Err(BackendError::RuntimeNotLinked)
    ));
    s.program.relink().unwrap();
    assert!(s.program.load_kernel("answer").is_ok());
    assert!(matches!(
        s.program.load_kernel("nope"),
        Err(BackendError::UnknownKernel(_))
    ));
}

#[test]
fn test_load_kernel_after_failed_relink() {
    let mut s = setup_with(FakeToolchain {
        fail_with: Some("weft.c:1:1: error: boom\n".to_string()),
        succeed_first: 1,
        ..FakeToolchain::default()
    });
    let answer = s.program.compile(&s.config, &answer_kernel()).unwrap();
    answer.launch(&LaunchContext::new(&s.rb)).unwrap();
    assert!(s.program.load_kernel("answer").is_ok());

    // Registered since the last relink: not linked yet, not a missing symbol.
    let double = s.program.compile(&s.config, &double_kernel()).unwrap();
    assert!(matches!(
        s.program.load_kernel("double"),
        Err(BackendError::RuntimeNotLinked)
    ));

    assert!(matches!(
        double.launch(&LaunchContext::new(&s.rb).arg(2)),
        Err(BackendError::LinkFailure { .. })
    ));
    // The module from the first build is still loaded, but nothing in it
    // is handed out again.
    for name in ["answer", "double"] {
        assert!(matches!(
            s.program.load_kernel(name),
            Err(BackendError::LinkFailure { .. })
        ));
    }
    assert!(matches!(
        answer.launch(&LaunchContext::new(&s.rb)),
        Err(BackendError::LinkFailure { .. })
    ));
    assert_eq!(s.builds.lock().unwrap().len(), 2);
}

#[test]
fn test_failed_relink_poisons_session() {
    let mut s = setup_with(FakeToolchain {
        fail_with: Some("weft.c:3:1: error: expected ';'\n".to_string()),
        ..FakeToolchain::default()
    });
    let f = s.program.compile(&s.config, &answer_kernel()).unwrap();
    match f.launch(&LaunchContext::new(&s.rb)) {
        Err(BackendError::LinkFailure { diagnostics, .. }) => {
            assert_eq!(diagnostics.len(), 1);
            assert_eq!(diagnostics[0].line, 3);
        }
        other => panic!("expected link failure, got {:?}", other),
    }
    assert!(matches!(
        s.program.link_state().unwrap(),
        LinkState::Poisoned(_)
    ));

    // No second build attempt: the session is dead.
    assert!(matches!(
        f.launch(&LaunchContext::new(&s.rb)),
        Err(BackendError::LinkFailure { .. })
    ));
    let g = s.program.compile(&s.config, &double_kernel()).unwrap();
    assert!(matches!(
        g.launch(&LaunchContext::new(&s.rb).arg(1)),
        Err(BackendError::LinkFailure { .. })
    ));
    assert_eq!(s.builds.lock().unwrap().len(), 1);
}

#[test]
fn test_missing_symbol_is_fatal() {
    let mut s = setup_with(FakeToolchain {
        missing: vec!["weft_k_double"],
        ..FakeToolchain::default()
    });
    s.program.compile(&s.config, &answer_kernel()).unwrap();
    let f = s.program.compile(&s.config, &double_kernel()).unwrap();
    let err = f.launch(&LaunchContext::new(&s.rb).arg(1)).unwrap_err();
    assert!(matches!(&err, BackendError::SymbolResolution(sym) if sym == "weft_k_double"));
    assert!(err.is_fatal());
    assert!(matches!(
        s.program.link_state().unwrap(),
        LinkState::Poisoned(_)
    ));
}

#[test]
fn test_argument_mismatch() {
    let mut s = setup();
    let f = s.program.compile(&s.config, &double_kernel()).unwrap();
    assert!(matches!(
        f.launch(&LaunchContext::new(&s.rb).arg(1.5f32)),
        Err(BackendError::ArgumentMismatch { .. })
    ));
    assert!(matches!(
        f.launch(&LaunchContext::new(&s.rb)),
        Err(BackendError::ArgumentMismatch { .. })
    ));
}

#[test]
fn test_ndarray_pointer_marshalling() {
    let mut s = setup();
    let alloc = s.program.allocate_memory_ndarray(16, &s.rb).unwrap();
    s.program
        .write_ndarray(&alloc, 0, bytemuck::cast_slice(&[1.0f32; 4]))
        .unwrap();
    let f = s.program.compile(&s.config, &poke_kernel()).unwrap();
    f.launch(&LaunchContext::new(&s.rb).ndarray(&alloc)).unwrap();

    let bytes = s.program.read_ndarray(&alloc, 0, 16).unwrap();
    let values: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes);
    assert_eq!(values, vec![1.0, 7.0, 1.0, 1.0]);

    assert!(!s.program.used_in_kernel(alloc.id));
    s.program.release_allocation(&alloc).unwrap();
    assert!(matches!(
        s.program.release_allocation(&alloc),
        Err(BackendError::UnknownAllocation(_))
    ));
    assert!(matches!(
        f.launch(&LaunchContext::new(&s.rb).ndarray(&alloc)),
        Err(BackendError::UnknownAllocation(_))
    ));
}

#[test]
fn test_neutral_operations() {
    let mut s = setup();
    let id = SNodeId {
        tree: TreeId(0),
        index: 1,
    };
    let count = s.program.get_snode_num_dynamically_allocated(id, &s.rb);
    assert_eq!(count, AllocationCount::Unsupported);
    assert_eq!(count.value(), 0);
    assert!(s.program.make_aot_module_builder(&DeviceCaps::host()).is_none());
    assert!(matches!(
        s.program.allocate_texture(&ImageParams {
            width: 4,
            height: 4,
            depth: 1,
            format: TexelFormat::R32Float,
        }),
        Err(BackendError::NotImplemented { backend: "cc", .. })
    ));
    s.program.destroy_snode_tree(TreeId(0)).unwrap();
    s.program.synchronize().unwrap();
    assert!(s.program.flush().unwrap().is_signaled());
}

#[test]
fn test_data_layouts() {
    let s = setup();
    assert_eq!(s.program.get_kernel_argument_data_layout().to_string(), "1b");
    assert_eq!(s.program.get_kernel_return_data_layout().to_string(), "4-");
}

fn pair_tree(id: u32) -> (SNodeTree, SNodeId, SNodeId) {
    let mut b = SNodeTreeBuilder::new(TreeId(id));
    let root = b.root();
    let d = b.dense(root, &[4]);
    let x = b.place(d, DataType::F32, "x");
    let y = b.place(d, DataType::I32, "y");
    (b.build().unwrap(), x, y)
}

#[test]
fn test_tree_materialization() {
    let mut s = setup();
    let (tree, x, y) = pair_tree(0);
    s.program.materialize_snode_tree(&tree, &s.rb).unwrap();
    assert_eq!(s.program.get_field_in_tree_offset(TreeId(0), x).unwrap(), 0);
    assert_eq!(s.program.get_field_in_tree_offset(TreeId(0), y).unwrap(), 4);
    assert!(matches!(
        s.program.get_field_in_tree_offset(TreeId(5), x),
        Err(BackendError::UnknownTree(5))
    ));
    assert!(matches!(
        s.program.materialize_snode_tree(&tree, &s.rb),
        Err(BackendError::InvalidTree { .. })
    ));

    let (far, _, _) = pair_tree(MAX_TREES as u32);
    assert!(matches!(
        s.program.materialize_snode_tree(&far, &s.rb),
        Err(BackendError::InvalidTree { .. })
    ));
}

#[test]
fn test_tree_marks_dirty() {
    let mut s = setup();
    let f = s.program.compile(&s.config, &answer_kernel()).unwrap();
    f.launch(&LaunchContext::new(&s.rb)).unwrap();
    let (tree, x, _) = pair_tree(1);
    s.program.materialize_snode_tree(&tree, &s.rb).unwrap();
    assert_eq!(s.program.link_state().unwrap(), LinkState::Dirty);

    let mut k = KernelBuilder::new("touch");
    k.store(x, vec![0.into()], Expr::from(1.0f32));
    s.program.compile(&s.config, &k.build()).unwrap();
    assert!(s
        .program
        .translation_unit()
        .unwrap()
        .contains("#define WEFT_T1_N2_OFF 0"));
}

#[test]
fn test_layout_constants() {
    let (tree, _, _) = pair_tree(0);
    let mut layouts = Layouts::new();
    layouts.insert(tree.id, compute_layout(&tree).unwrap());
    insta::assert_snapshot!(layout_constants(&layouts, 64), @r###"
    /* layout: 1 tree(s) */
    #define WEFT_GTMP_SIZE 64
    #define WEFT_T0_SIZE 32
    #define WEFT_T0_N2_OFF 0
    #define WEFT_T0_N2_D0 4
    #define WEFT_T0_N2_S0 8
    #define WEFT_T0_N3_OFF 4
    #define WEFT_T0_N3_D0 4
    #define WEFT_T0_N3_S0 8
    "###);
}

#[test]
fn test_profiler_and_finalize() {
    let dir = tempfile::tempdir().unwrap();
    let config = CompileConfig {
        module_dir: Some(dir.path().to_path_buf()),
        ..CompileConfig::default()
    };
    let profiler = Arc::new(RecordingProfiler::new());
    let mut program = CcProgram::with_toolchain(&config, Box::new(FakeToolchain::default()));
    let rb = program
        .materialize_runtime(Some(profiler.clone() as Arc<dyn KernelProfiler>))
        .unwrap();
    let f = program.compile(&config, &answer_kernel()).unwrap();
    f.launch(&LaunchContext::new(&rb)).unwrap();
    f.launch(&LaunchContext::new(&rb)).unwrap();
    assert_eq!(profiler.count("answer"), 2);

    let module_dir = program.module_dir().unwrap();
    assert!(module_dir.starts_with(dir.path()));
    program.finalize().unwrap();
    assert!(!module_dir.exists());
    assert!(matches!(
        f.launch(&LaunchContext::new(&rb)),
        Err(BackendError::RuntimeNotMaterialized)
    ));
}

#[test]
fn test_context_carries_ndarray_lengths() {
    let mut s = setup();
    let mut k = KernelBuilder::new("lengths");
    let a = k.ndarray_arg(DataType::F32);
    let n = k.scalar_arg(DataType::I32);
    let b = k.ndarray_arg(DataType::F32);
    for slot in 0..3 {
        let r = k.return_slot(DataType::U32);
        k.ret(r, (slot as u32).into());
    }
    k.nd_store(a, n.clone(), Expr::nd_load(b, n));
    let f = s.program.compile(&s.config, &k.build()).unwrap();

    let big = s.program.allocate_memory_ndarray(40, &s.rb).unwrap();
    let odd = s.program.allocate_memory_ndarray(7, &s.rb).unwrap();
    f.launch(
        &LaunchContext::new(&s.rb)
            .ndarray(&big)
            .arg(0)
            .ndarray(&odd),
    )
    .unwrap();
    // Position 1 is the scalar, so it carries no length; a trailing
    // partial element does not count.
    assert_eq!(s.rb.fetch::<u32>(0), Some(10));
    assert_eq!(s.rb.fetch::<u32>(1), Some(0));
    assert_eq!(s.rb.fetch::<u32>(2), Some(1));
}

#[test]
fn test_out_of_range_access_is_reported() {
    let mut s = setup();
    let mut k = KernelBuilder::new("stray");
    let arr = k.ndarray_arg(DataType::F32);
    let i = k.scalar_arg(DataType::I32);
    k.nd_store(arr, i, 1.0f32.into());
    let f = s.program.compile(&s.config, &k.build()).unwrap();
    let alloc = s.program.allocate_memory_ndarray(16, &s.rb).unwrap();

    let err = f
        .launch(&LaunchContext::new(&s.rb).ndarray(&alloc).arg(1 << 28))
        .unwrap_err();
    assert!(matches!(&err, BackendError::IndexOutOfBounds(name) if name == "stray"));
    assert!(!err.is_fatal());
    assert_eq!(s.program.link_state().unwrap(), LinkState::Clean);

    let source = s.program.translation_unit().unwrap();
    let ptr = std::mem::size_of::<usize>();
    assert!(source.contains(&format!(
        "weft_stp_f32(weft_nd_at(ctx, 0, 0u, (int32_t)(weft_ld_i32(ctx->args + {}))), \
         weft_f32(0x3f800000u));",
        ptr
    )));
}
