use super::offload::{eval_bound, offload, BoundOp, ExprKind, TaskKind, TaskStmt};
use super::*;
use crate::error::BackendError;
use crate::snode::{compute_layout, Layouts, SNodeTreeBuilder, TreeId};

fn layouts_with_x() -> (Layouts, SNodeId) {
    let mut b = SNodeTreeBuilder::new(TreeId(0));
    let root = b.root();
    let d = b.dense(root, &[16]);
    let x = b.place(d, DataType::F32, "x");
    let tree = b.build().unwrap();
    let mut layouts = Layouts::new();
    layouts.insert(tree.id, compute_layout(&tree).unwrap());
    (layouts, x)
}

fn fill_kernel(x: SNodeId) -> Kernel {
    let mut k = KernelBuilder::new("fill");
    let n = k.scalar_arg(DataType::I32);
    let value = k.scalar_arg(DataType::F32);
    k.for_range("i", 0.into(), n, |k, i| {
        k.store(x, vec![i.clone()], value.clone() + i.cast(DataType::F32));
    });
    k.build()
}

#[test]
fn test_builder_shapes_kernel() {
    let (_, x) = layouts_with_x();
    let k = fill_kernel(x);
    assert_eq!(k.name, "fill");
    assert_eq!(
        k.params,
        vec![Param::Scalar(DataType::I32), Param::Scalar(DataType::F32)]
    );
    assert_eq!(k.body.len(), 1);
    match &k.body[0] {
        Stmt::For {
            var,
            body,
            serialize,
            ..
        } => {
            assert_eq!(var, "i");
            assert!(!serialize);
            assert_eq!(body.len(), 1);
        }
        other => panic!("expected a loop, got {:?}", other),
    }
}

#[test]
fn test_kernel_symbol_sanitized() {
    assert_eq!(kernel_symbol("fill"), "weft_k_fill");
    assert_eq!(kernel_symbol("my-kernel.v2"), "weft_k_my_kernel_v2");
}

#[test]
fn test_scalar_bits() {
    assert_eq!(Scalar::F32(1.5).to_bits(), 1.5f32.to_bits());
    assert_eq!(Scalar::I32(-1).to_bits(), u32::MAX);
    assert_eq!(
        Scalar::from_bits(DataType::I32, u32::MAX),
        Scalar::I32(-1)
    );
    assert_eq!(Scalar::F32(2.0).as_i64(), None);
}

#[test]
fn test_fingerprint_is_stable_and_sensitive() {
    let (_, x) = layouts_with_x();
    let a = fill_kernel(x);
    let b = fill_kernel(x);
    assert_eq!(a.fingerprint(), b.fingerprint());

    let mut c = fill_kernel(x);
    c.name = "fill2".to_string();
    assert_ne!(a.fingerprint(), c.fingerprint());

    let mut d = fill_kernel(x);
    if let Stmt::For { serialize, .. } = &mut d.body[0] {
        *serialize = true;
    }
    assert_ne!(a.fingerprint(), d.fingerprint());
    assert_eq!(a.fingerprint().to_hex().len(), 64);
}

#[test]
fn test_offload_splits_tasks() {
    let (layouts, x) = layouts_with_x();
    let mut k = KernelBuilder::new("sum");
    let n = k.scalar_arg(DataType::I32);
    let slot = k.return_slot(DataType::F32);
    k.for_range("i", 0.into(), n.clone(), |k, i| {
        k.store(x, vec![i.clone()], i.cast(DataType::F32));
    });
    let acc = k.declare("acc", 0.0f32.into());
    k.serial_range("j", 0.into(), n, |k, j| {
        k.assign("acc", Expr::var("acc") + Expr::load(x, vec![j]));
    });
    k.ret(slot, acc);
    let kernel = k.build();

    let off = offload(&kernel, &layouts, 64).unwrap();
    assert_eq!(off.tasks.len(), 2);
    assert!(matches!(off.tasks[0].kind, TaskKind::Range(_)));
    assert!(matches!(off.tasks[1].kind, TaskKind::Serial));
    assert_eq!(off.tasks[1].body.len(), 3);
    assert!(matches!(off.tasks[1].body[0], TaskStmt::SetGlobal { offset: 0, .. }));
    assert_eq!(off.gtmp_size, 4);
    assert!(off.trees.contains(&TreeId(0)));

    match &off.tasks[1].body[2] {
        TaskStmt::Return { slot, value } => {
            assert_eq!(*slot, 0);
            assert_eq!(value.kind, ExprKind::Global(0));
        }
        other => panic!("expected return, got {:?}", other),
    }
}

#[test]
fn test_range_bounds_evaluate_on_host() {
    let (layouts, x) = layouts_with_x();
    let mut k = KernelBuilder::new("window");
    let lo = k.scalar_arg(DataType::I32);
    let hi = k.scalar_arg(DataType::I32);
    k.for_range(
        "i",
        lo + 1.into(),
        Expr::binary(BinOp::Min, hi, 16.into()),
        |k, i| k.store(x, vec![i], 1.0f32.into()),
    );
    let off = offload(&k.build(), &layouts, 64).unwrap();
    let TaskKind::Range(range) = &off.tasks[0].kind else {
        panic!("expected a range task");
    };
    assert_eq!(
        range.begin_program,
        vec![BoundOp::Arg(0), BoundOp::Const(1), BoundOp::Add]
    );
    let args = [2, 40];
    let arg = |i: usize| args.get(i).copied();
    assert_eq!(range.iterations(arg).unwrap(), 13);
    let empty = [20, 5];
    assert_eq!(range.iterations(|i: usize| empty.get(i).copied()).unwrap(), 0);
}

#[test]
fn test_eval_bound_division() {
    let program = [BoundOp::Const(7), BoundOp::Const(0), BoundOp::Div];
    assert_eq!(eval_bound(&program, |_| None).unwrap(), 7);
    let program = [BoundOp::Const(-7), BoundOp::Const(2), BoundOp::Div];
    assert_eq!(eval_bound(&program, |_| None).unwrap(), -3);
    assert!(eval_bound(&[BoundOp::Add], |_| None).is_err());
    assert!(eval_bound(&[BoundOp::Arg(3)], |_| None).is_err());
}

fn reject(kernel: Kernel, layouts: &Layouts) -> String {
    match offload(&kernel, layouts, 64) {
        Err(BackendError::InvalidKernel { reason, .. }) => reason,
        other => panic!("expected InvalidKernel, got {:?}", other),
    }
}

#[test]
fn test_rejects_global_assignment_in_parallel_loop() {
    let (layouts, _) = layouts_with_x();
    let mut k = KernelBuilder::new("race");
    k.declare("total", 0.into());
    k.for_range("i", 0.into(), 8.into(), |k, i| {
        k.assign("total", Expr::var("total") + i);
    });
    let reason = reject(k.build(), &layouts);
    assert!(reason.contains("parallel loop"), "{}", reason);
}

#[test]
fn test_rejects_non_host_bounds() {
    let (layouts, x) = layouts_with_x();
    let mut k = KernelBuilder::new("dyn");
    k.for_range(
        "i",
        0.into(),
        Expr::load(x, vec![0.into()]).cast(DataType::I32),
        |_, _| {},
    );
    let reason = reject(k.build(), &layouts);
    assert!(reason.contains("range bounds"), "{}", reason);
}

#[test]
fn test_rejects_type_errors() {
    let (layouts, x) = layouts_with_x();

    let mut k = KernelBuilder::new("mixed");
    k.declare("a", Expr::from(1) + Expr::from(1.0f32));
    assert!(reject(k.build(), &layouts).contains("operands differ"));

    let mut k = KernelBuilder::new("store");
    k.serial_range("i", 0.into(), 4.into(), |k, i| k.store(x, vec![i.clone()], i));
    assert!(reject(k.build(), &layouts).contains("expects f32"));

    let mut k = KernelBuilder::new("rank");
    k.store(x, vec![], 1.0f32.into());
    assert!(reject(k.build(), &layouts).contains("axes"));

    let mut k = KernelBuilder::new("sqrt");
    k.declare("s", Expr::unary(UnOp::Sqrt, 4.into()));
    assert!(reject(k.build(), &layouts).contains("not defined"));
}

#[test]
fn test_rejects_scoping_errors() {
    let (layouts, _) = layouts_with_x();

    let mut k = KernelBuilder::new("unknown");
    k.declare("a", Expr::var("b"));
    assert!(reject(k.build(), &layouts).contains("unknown variable"));

    let mut k = KernelBuilder::new("shadow");
    k.serial_range("t", 0.into(), 2.into(), |_, _| {});
    k.declare("t", 0.into());
    assert!(reject(k.build(), &layouts).contains("shadows"));

    let mut k = KernelBuilder::new("index");
    k.serial_range("i", 0.into(), 2.into(), |k, _| k.assign("i", 0.into()));
    assert!(reject(k.build(), &layouts).contains("cannot be assigned"));

    let mut k = KernelBuilder::new("twice");
    k.declare("a", 0.into());
    k.declare("a", 1.into());
    assert!(reject(k.build(), &layouts).contains("twice"));
}

#[test]
fn test_rejects_bad_returns_and_args() {
    let (layouts, _) = layouts_with_x();

    let mut k = KernelBuilder::new("slot");
    k.ret(0, 1.into());
    assert!(reject(k.build(), &layouts).contains("not declared"));

    let mut k = KernelBuilder::new("ndscalar");
    let arr = k.ndarray_arg(DataType::F32);
    k.declare("v", Expr::Arg(arr));
    assert!(reject(k.build(), &layouts).contains("used as a scalar"));

    let mut k = KernelBuilder::new("many");
    for _ in 0..=crate::runtime::MAX_RETURNS {
        k.return_slot(DataType::I32);
    }
    assert!(reject(k.build(), &layouts).contains("exceed"));

    let mut k = KernelBuilder::new("wide");
    for _ in 0..=crate::runtime::MAX_ARGS {
        k.scalar_arg(DataType::I32);
    }
    assert!(reject(k.build(), &layouts).contains("parameters exceed"));
}

#[test]
fn test_gtmp_capacity_enforced() {
    let (layouts, _) = layouts_with_x();
    let mut k = KernelBuilder::new("big");
    for i in 0..3 {
        k.declare(&format!("v{}", i), 0.into());
    }
    let kernel = k.build();
    assert!(offload(&kernel, &layouts, 12).is_ok());
    assert!(offload(&kernel, &layouts, 8).is_err());
}

#[test]
fn test_unknown_tree_is_reported() {
    let mut k = KernelBuilder::new("orphan");
    let field = SNodeId {
        tree: TreeId(3),
        index: 1,
    };
    k.store(field, vec![], 0.into());
    assert!(matches!(
        offload(&k.build(), &Layouts::new(), 64),
        Err(BackendError::UnknownTree(3))
    ));
}
