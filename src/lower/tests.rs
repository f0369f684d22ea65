use super::*;
use crate::lower::wgsl::WGSL_SUPPORT;
use crate::ir::offload::offload;
use crate::ir::{DataType, Expr, Kernel, KernelBuilder, UnOp};
use crate::runtime::{pack_arguments, DataLayout, DeviceCaps};
use crate::snode::{compute_layout, Layouts, SNodeId, SNodeTreeBuilder, TreeId};

fn grid() -> (Layouts, SNodeId) {
    let mut b = SNodeTreeBuilder::new(TreeId(2));
    let root = b.root();
    let d = b.dense(root, &[4, 8]);
    b.place(d, DataType::I32, "tag");
    let g = b.place(d, DataType::F32, "g");
    let tree = b.build().unwrap();
    let mut layouts = Layouts::new();
    layouts.insert(tree.id, compute_layout(&tree).unwrap());
    (layouts, g)
}

fn scale_kernel() -> Kernel {
    let mut k = KernelBuilder::new("scale");
    let arr = k.ndarray_arg(DataType::F32);
    let n = k.scalar_arg(DataType::I32);
    let factor = k.scalar_arg(DataType::F32);
    k.for_range("i", 0.into(), n, |k, i| {
        k.nd_store(arr, i.clone(), Expr::nd_load(arr, i) * factor.clone());
    });
    k.build()
}

fn lower_with(arch: Arch, kernel: &Kernel, layouts: &Layouts, layout: &str) -> String {
    let off = offload(kernel, layouts, 1024).unwrap();
    let args = pack_arguments(&off.params, &layout.parse().unwrap());
    create_kernel_lowering(arch).lower(&off, &args)
}

#[test]
fn test_create_kernel_lowering() {
    assert_eq!(create_kernel_lowering(Arch::Cc).target_name(), "c");
    assert_eq!(create_kernel_lowering(Arch::Gfx).target_name(), "wgsl");
}

#[test]
fn test_c_range_task() {
    let src = lower_with(Arch::Cc, &scale_kernel(), &Layouts::new(), "1b");
    let ptr = std::mem::size_of::<usize>();
    assert!(src.contains("WEFT_EXPORT void weft_k_scale(WeftContext *ctx) {"));
    assert!(src.contains(&format!("const int32_t weft_e0 = weft_ld_i32(ctx->args + {});", ptr)));
    assert!(src.contains("for (int32_t v_i = weft_b0; v_i < weft_e0; ++v_i) {"));
    assert!(src.contains("weft_stp_f32(weft_nd_at(ctx, 0, 0u, (int32_t)(v_i)), "));
    assert!(src.contains("weft_ldp_f32(weft_nd_at(ctx, 0, 0u, (int32_t)(v_i)))"));
    assert!(src.contains(&format!("weft_ld_f32(ctx->args + {})", ptr + 4)));
}

#[test]
fn test_c_fields_use_layout_macros() {
    let (layouts, g) = grid();
    let mut k = KernelBuilder::new("touch");
    k.store(g, vec![1.into(), 2.into()], 0.5f32.into());
    let src = lower_with(Arch::Cc, &k.build(), &layouts, "1b");
    assert!(src.contains("/* task 0: serial */"));
    assert!(src.contains(
        "weft_stp_f32(weft_at(ctx, ctx->roots[2] + WEFT_T2_N3_OFF, 2, \
         (const int32_t[]){(int32_t)(1), (int32_t)(2)}, \
         (const uint32_t[]){WEFT_T2_N3_D0, WEFT_T2_N3_D1}, \
         (const size_t[]){WEFT_T2_N3_S0, WEFT_T2_N3_S1}), weft_f32(0x3f000000u));"
    ));
    assert_eq!(field_macro(g), "WEFT_T2_N3");
}

#[test]
fn test_c_constants_and_ops() {
    let mut k = KernelBuilder::new("ops");
    let r = k.return_slot(DataType::I32);
    let a = k.declare("a", Expr::from(i32::MIN));
    let b = k.declare("b", Expr::binary(crate::ir::BinOp::Div, a, (-3).into()));
    let c = k.declare("c", Expr::unary(UnOp::Abs, b).cast(DataType::F32));
    k.ret(r, c.cast(DataType::I32));
    let src = lower_with(Arch::Cc, &k.build(), &Layouts::new(), "1b");
    assert!(src.contains("weft_st_i32(ctx->gtmp + 0, (-2147483647 - 1));"));
    assert!(src.contains("weft_div_i32(weft_ld_i32(ctx->gtmp + 0), (-3))"));
    assert!(src.contains("(float)(weft_abs_i32(weft_ld_i32(ctx->gtmp + 4)))"));
    assert!(src.contains("ctx->rets[0] = weft_bits_i32(weft_f32_to_i32(weft_ld_f32(ctx->gtmp + 8)));"));
}

#[test]
fn test_c_empty_kernel_compiles_to_noop() {
    let k = KernelBuilder::new("nothing").build();
    let src = lower_with(Arch::Cc, &k, &Layouts::new(), "1b");
    assert!(src.contains("(void)ctx;"));
}

#[test]
fn test_wgsl_bindings_and_entry_points() {
    let (layouts, g) = grid();
    let mut k = KernelBuilder::new("mix");
    let arr = k.ndarray_arg(DataType::F32);
    let n = k.scalar_arg(DataType::I32);
    k.for_range("i", 0.into(), n, |k, i| {
        k.store(g, vec![0.into(), i.clone()], Expr::nd_load(arr, i));
    });
    k.declare("total", 0.0f32.into());
    let off = offload(&k.build(), &layouts, 1024).unwrap();
    assert_eq!(
        bindings(&off),
        vec![
            Binding::Args,
            Binding::Rets,
            Binding::Gtmp,
            Binding::Root(TreeId(2)),
            Binding::NdArray(0)
        ]
    );

    let args = pack_arguments(&off.params, &DataLayout::for_arguments(&DeviceCaps::default()));
    let src = WgslLowering::new().lower(&off, &args);
    assert!(src.contains("@group(0) @binding(0) var<storage, read> weft_args: array<u32>;"));
    assert!(src.contains("@group(0) @binding(3) var<storage, read_write> weft_root_2: array<u32>;"));
    assert!(src.contains("@group(0) @binding(4) var<storage, read_write> weft_nd_0: array<u32>;"));
    assert!(src.contains("@compute @workgroup_size(64)"));
    assert!(src.contains("let weft_end: i32 = bitcast<i32>(weft_args[0]);"));
    assert!(src.contains("let v_i: i32 = weft_begin + i32(weft_linear);"));
    assert!(src.contains(
        "weft_t2_n3_st(u32(0i), u32(v_i), bitcast<u32>(bitcast<f32>(weft_nd_0_ld(u32(v_i)))));"
    ));
    // tag and g interleave: g is at word 1, row stride 16 words, column stride 2.
    assert!(src.contains("fn weft_t2_n3_st(i0: u32, i1: u32, v: u32) {"));
    assert!(src.contains("if (i0 < 4u && i1 < 8u) {"));
    assert!(src.contains("weft_root_2[1u + i0 * 16u + i1 * 2u] = v;"));
    assert!(src.contains("fn weft_nd_0_ld(i: u32) -> u32 {"));
    assert!(src.contains("if (i >= arrayLength(&weft_nd_0)) {"));
    assert!(!src.contains("fn weft_t2_n2_"));
    assert!(src.contains("@compute @workgroup_size(1)\nfn task_1() {"));
    assert!(src.contains("weft_gtmp[0] = bitcast<u32>(bitcast<f32>(0x00000000u));"));
}

#[test]
fn test_wgsl_comparisons_and_select() {
    let mut k = KernelBuilder::new("cmp");
    let x = k.scalar_arg(DataType::U32);
    let r = k.return_slot(DataType::U32);
    let lt = Expr::binary(crate::ir::BinOp::Lt, x.clone(), 10u32.into());
    k.ret(r, Expr::select(lt, x, Expr::from(-1i32).cast(DataType::U32)));
    let src = lower_with(Arch::Gfx, &k.build(), &Layouts::new(), "1-");
    assert!(src.contains(
        "weft_rets[0] = select(u32(bitcast<i32>(4294967295u)), weft_args[0], \
         select(0i, 1i, weft_args[0] < 10u) != 0i);"
    ));
}

#[test]
fn test_wgsl_integer_division_uses_helpers() {
    let mut k = KernelBuilder::new("divs");
    let x = k.scalar_arg(DataType::I32);
    let y = k.scalar_arg(DataType::U32);
    let f = k.scalar_arg(DataType::F32);
    let q = k.return_slot(DataType::I32);
    let r = k.return_slot(DataType::U32);
    let c = k.return_slot(DataType::I32);
    k.ret(q, x.clone() / 0.into());
    k.ret(r, y % 3u32.into());
    k.ret(c, f.cast(DataType::I32));
    let src = lower_with(Arch::Gfx, &k.build(), &Layouts::new(), "1-");
    assert!(src.contains("weft_rets[0] = bitcast<u32>(weft_div_i32(bitcast<i32>(weft_args[0]), 0i));"));
    assert!(src.contains("weft_rets[1] = weft_rem_u32(weft_args[1], 3u);"));
    assert!(src.contains(
        "weft_rets[2] = bitcast<u32>(weft_f32_to_i32(bitcast<f32>(weft_args[2])));"
    ));
    assert!(src.ends_with(WGSL_SUPPORT));
    assert!(!src.contains(" / 0i"));
}

#[test]
fn test_c_scalar_field_has_no_bounds_check() {
    let mut b = SNodeTreeBuilder::new(TreeId(0));
    let root = b.root();
    let s = b.place(root, DataType::I32, "s");
    let tree = b.build().unwrap();
    let mut layouts = Layouts::new();
    layouts.insert(tree.id, compute_layout(&tree).unwrap());

    let mut k = KernelBuilder::new("bump");
    k.store(s, vec![], Expr::load(s, vec![]) + 1.into());
    let kernel = k.build();
    let src = lower_with(Arch::Cc, &kernel, &layouts, "1b");
    assert!(src.contains(
        "weft_stp_i32(ctx->roots[0] + WEFT_T0_N1_OFF, \
         (weft_ldp_i32(ctx->roots[0] + WEFT_T0_N1_OFF) + 1));"
    ));
    let wgsl = lower_with(Arch::Gfx, &kernel, &layouts, "1-");
    assert!(wgsl.contains("weft_t0_n1_st(bitcast<u32>((bitcast<i32>(weft_t0_n1_ld()) + 1i)));"));
    assert!(wgsl.contains("fn weft_t0_n1_ld() -> u32 {\n    return weft_root_0[0u];\n}"));
}
