//! WGSL lowering: one shader module per kernel, one entry point per task.
//!
//! All storage is bound as `array<u32>` and values are bitcast on access,
//! which keeps every buffer byte-compatible with the host layouts. Range
//! tasks run one invocation per iteration in workgroups of
//! `RANGE_WORKGROUP_SIZE`; the linear index spans a 2D dispatch so large
//! ranges fit under the per-dimension workgroup limit.
//!
//! Integer division, remainder and float to integer casts go through the
//! helpers in `WGSL_SUPPORT`, which match the C runtime bit for bit. Field
//! and ndarray accesses go through generated accessors that read 0 and
//! drop stores outside the extent, the same rule the C lowering applies.

use std::cell::RefCell;
use std::collections::BTreeMap;

use super::{KernelLowering, SourceWriter};
use crate::ir::offload::{ExprKind, OffloadedKernel, TaskKind, TaskStmt, TypedExpr};
use crate::ir::{BinOp, DataType, Scalar, UnOp};
use crate::runtime::ArgumentLayout;
use crate::snode::{FieldLayout, TreeId};

pub const RANGE_WORKGROUP_SIZE: u32 = 64;

/// Helpers appended to every module. NaN is tested on the bit pattern
/// because shader compilers may fold `v != v` to false.
pub const WGSL_SUPPORT: &str = r#"fn weft_div_i32(a: i32, b: i32) -> i32 {
    let keep = b == 0i || (a == bitcast<i32>(0x80000000u) && b == -1i);
    return a / select(b, 1i, keep);
}

fn weft_rem_i32(a: i32, b: i32) -> i32 {
    let keep = b == 0i || (a == bitcast<i32>(0x80000000u) && b == -1i);
    return select(a % select(b, 1i, keep), 0i, keep);
}

fn weft_div_u32(a: u32, b: u32) -> u32 {
    return a / select(b, 1u, b == 0u);
}

fn weft_rem_u32(a: u32, b: u32) -> u32 {
    return select(a % select(b, 1u, b == 0u), 0u, b == 0u);
}

fn weft_is_nan(v: f32) -> bool {
    return (bitcast<u32>(v) & 0x7fffffffu) > 0x7f800000u;
}

fn weft_f32_to_i32(v: f32) -> i32 {
    if (weft_is_nan(v)) {
        return 0i;
    }
    if (v <= -2147483648.0) {
        return bitcast<i32>(0x80000000u);
    }
    if (v >= 2147483648.0) {
        return 2147483647i;
    }
    return i32(v);
}

fn weft_f32_to_u32(v: f32) -> u32 {
    if (weft_is_nan(v) || v <= 0.0) {
        return 0u;
    }
    if (v >= 4294967296.0) {
        return 4294967295u;
    }
    return u32(v);
}
"#;

/// One storage binding of a kernel's bind group, in binding order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub enum Binding {
    Args,
    Rets,
    Gtmp,
    Root(TreeId),
    /// Ndarray argument by position.
    NdArray(u32),
}

impl Binding {
    pub fn var_name(&self) -> String {
        match self {
            Binding::Args => "weft_args".to_string(),
            Binding::Rets => "weft_rets".to_string(),
            Binding::Gtmp => "weft_gtmp".to_string(),
            Binding::Root(tree) => format!("weft_root_{}", tree.0),
            Binding::NdArray(arg) => format!("weft_nd_{}", arg),
        }
    }

    pub fn read_only(&self) -> bool {
        matches!(self, Binding::Args)
    }
}

/// Bind group entries of a kernel: args, rets, gtmp, then every tree the
/// kernel touches and every ndarray parameter.
pub fn bindings(kernel: &OffloadedKernel) -> Vec<Binding> {
    let mut out = vec![Binding::Args, Binding::Rets, Binding::Gtmp];
    out.extend(kernel.trees.iter().map(|t| Binding::Root(*t)));
    out.extend(kernel.ndarrays().into_iter().map(|i| Binding::NdArray(i as u32)));
    out
}

pub struct WgslLowering;

impl WgslLowering {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WgslLowering {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelLowering for WgslLowering {
    fn target_name(&self) -> &str {
        "wgsl"
    }

    fn lower(&self, kernel: &OffloadedKernel, args: &ArgumentLayout) -> String {
        let cx = Cx {
            args,
            fields: RefCell::new(BTreeMap::new()),
        };
        let mut w = SourceWriter::new();
        w.line(format!(
            "// kernel {}: {} task(s)",
            kernel.name,
            kernel.tasks.len()
        ));
        for (i, binding) in bindings(kernel).iter().enumerate() {
            let access = if binding.read_only() {
                "read"
            } else {
                "read_write"
            };
            w.line(format!(
                "@group(0) @binding({}) var<storage, {}> {}: array<u32>;",
                i,
                access,
                binding.var_name()
            ));
        }

        for (i, task) in kernel.tasks.iter().enumerate() {
            w.line("");
            match &task.kind {
                TaskKind::Serial => {
                    w.line("@compute @workgroup_size(1)");
                    w.block(format!("fn task_{}()", i), |w| cx.stmts(w, &task.body));
                }
                TaskKind::Range(range) => {
                    w.line(format!("@compute @workgroup_size({})", RANGE_WORKGROUP_SIZE));
                    w.block(
                        format!(
                            "fn task_{}(@builtin(global_invocation_id) gid: vec3<u32>, \
                             @builtin(num_workgroups) nwg: vec3<u32>)",
                            i
                        ),
                        |w| {
                            w.line(format!(
                                "let weft_linear = gid.x + gid.y * nwg.x * {}u;",
                                RANGE_WORKGROUP_SIZE
                            ));
                            w.line(format!("let weft_begin: i32 = {};", cx.expr(&range.begin)));
                            w.line(format!("let weft_end: i32 = {};", cx.expr(&range.end)));
                            w.block("if (i32(weft_linear) >= weft_end - weft_begin)", |w| {
                                w.line("return;")
                            });
                            w.line(format!(
                                "let {}: i32 = weft_begin + i32(weft_linear);",
                                local(&range.var)
                            ));
                            cx.stmts(w, &task.body);
                        },
                    );
                }
            }
        }

        for binding in bindings(kernel) {
            if let Binding::NdArray(arg) = binding {
                w.line("");
                nd_accessors(&mut w, arg);
            }
        }
        for field in cx.fields.borrow().values() {
            w.line("");
            field_accessors(&mut w, field);
        }
        w.line("");
        let mut out = w.finish();
        out.push_str(WGSL_SUPPORT);
        out
    }
}

fn nd_accessors(w: &mut SourceWriter, arg: u32) {
    let var = Binding::NdArray(arg).var_name();
    w.block(format!("fn {}_ld(i: u32) -> u32", var), |w| {
        w.block(format!("if (i >= arrayLength(&{}))", var), |w| w.line("return 0u;"));
        w.line(format!("return {}[i];", var));
    });
    w.line("");
    w.block(format!("fn {}_st(i: u32, v: u32)", var), |w| {
        w.block(format!("if (i < arrayLength(&{}))", var), |w| {
            w.line(format!("{}[i] = v;", var))
        });
    });
}

fn field_name(field: &FieldLayout) -> String {
    format!("weft_t{}_n{}", field.snode.tree.0, field.snode.index)
}

fn field_accessors(w: &mut SourceWriter, field: &FieldLayout) {
    let name = field_name(field);
    let root = Binding::Root(field.snode.tree).var_name();
    let params: Vec<String> = (0..field.rank()).map(|k| format!("i{}: u32", k)).collect();
    let mut slot = format!("{}u", field.offset / 4);
    for (k, axis) in field.axes.iter().enumerate() {
        slot.push_str(&format!(" + i{} * {}u", k, axis.stride / 4));
    }
    let inside = field
        .axes
        .iter()
        .enumerate()
        .map(|(k, axis)| format!("i{} < {}u", k, axis.extent))
        .collect::<Vec<_>>()
        .join(" && ");
    let guarded = |w: &mut SourceWriter, body: &dyn Fn(&mut SourceWriter)| {
        if inside.is_empty() {
            body(w);
        } else {
            w.block(format!("if ({})", inside), |w| body(w));
        }
    };

    w.block(format!("fn {}_ld({}) -> u32", name, params.join(", ")), |w| {
        guarded(w, &|w| w.line(format!("return {}[{}];", root, slot)));
        if !inside.is_empty() {
            w.line("return 0u;");
        }
    });
    w.line("");
    let mut st_params = params.clone();
    st_params.push("v: u32".to_string());
    w.block(format!("fn {}_st({})", name, st_params.join(", ")), |w| {
        guarded(w, &|w| w.line(format!("{}[{}] = v;", root, slot)));
    });
}

pub(crate) fn wgsl_type(dt: DataType) -> &'static str {
    match dt {
        DataType::I32 => "i32",
        DataType::U32 => "u32",
        DataType::F32 => "f32",
    }
}

fn local(name: &str) -> String {
    format!("v_{}", name)
}

fn wgsl_const(v: Scalar) -> String {
    match v {
        Scalar::I32(v) if v < 0 => format!("bitcast<i32>({}u)", v as u32),
        Scalar::I32(v) => format!("{}i", v),
        Scalar::U32(v) => format!("{}u", v),
        Scalar::F32(v) => format!("bitcast<f32>(0x{:08x}u)", v.to_bits()),
    }
}

/// Reinterpret a storage word as `dt`.
fn from_word(dt: DataType, word: String) -> String {
    match dt {
        DataType::U32 => word,
        dt => format!("bitcast<{}>({})", wgsl_type(dt), word),
    }
}

/// Reinterpret a `dt` value as a storage word.
fn to_word(dt: DataType, value: String) -> String {
    match dt {
        DataType::U32 => value,
        _ => format!("bitcast<u32>({})", value),
    }
}

struct Cx<'a> {
    args: &'a ArgumentLayout,
    /// Fields the kernel touches, keyed by (tree, node).
    fields: RefCell<BTreeMap<(u32, u32), FieldLayout>>,
}

impl Cx<'_> {
    fn arg_word(&self, index: usize) -> usize {
        self.args.offsets.get(index).copied().flatten().unwrap_or(0) / 4
    }

    /// Call of a field accessor: `weft_t<tree>_n<node>_<op>(indices.., extra)`.
    fn field_call(
        &self,
        op: &str,
        field: &FieldLayout,
        indices: &[TypedExpr],
        extra: Option<String>,
    ) -> String {
        self.fields
            .borrow_mut()
            .entry((field.snode.tree.0, field.snode.index))
            .or_insert_with(|| field.clone());
        let mut args: Vec<String> = indices
            .iter()
            .map(|i| format!("u32({})", self.expr(i)))
            .collect();
        args.extend(extra);
        format!("{}_{}({})", field_name(field), op, args.join(", "))
    }

    fn nd_call(&self, op: &str, arg: usize, index: &TypedExpr, extra: Option<String>) -> String {
        let mut args = vec![format!("u32({})", self.expr(index))];
        args.extend(extra);
        format!("weft_nd_{}_{}({})", arg, op, args.join(", "))
    }

    fn stmts(&self, w: &mut SourceWriter, body: &[TaskStmt]) {
        for stmt in body {
            self.stmt(w, stmt);
        }
    }

    fn stmt(&self, w: &mut SourceWriter, stmt: &TaskStmt) {
        match stmt {
            TaskStmt::Let { name, value } => {
                w.line(format!(
                    "var {}: {} = {};",
                    local(name),
                    wgsl_type(value.dtype),
                    self.expr(value)
                ));
            }
            TaskStmt::SetLocal { name, value } => {
                w.line(format!("{} = {};", local(name), self.expr(value)));
            }
            TaskStmt::SetGlobal { offset, value } => {
                w.line(format!(
                    "weft_gtmp[{}] = {};",
                    offset / 4,
                    to_word(value.dtype, self.expr(value))
                ));
            }
            TaskStmt::Store {
                field,
                indices,
                value,
            } => {
                let word = to_word(value.dtype, self.expr(value));
                w.line(format!("{};", self.field_call("st", field, indices, Some(word))));
            }
            TaskStmt::NdStore { arg, index, value } => {
                let word = to_word(value.dtype, self.expr(value));
                w.line(format!("{};", self.nd_call("st", *arg, index, Some(word))));
            }
            TaskStmt::For {
                var,
                begin,
                end,
                body,
            } => {
                let v = local(var);
                w.block(
                    format!(
                        "for (var {v}: i32 = {b}; {v} < {e}; {v} = {v} + 1)",
                        v = v,
                        b = self.expr(begin),
                        e = self.expr(end)
                    ),
                    |w| self.stmts(w, body),
                );
            }
            TaskStmt::If {
                cond,
                then_body,
                else_body,
            } => {
                w.block(format!("if ({} != 0i)", self.expr(cond)), |w| {
                    self.stmts(w, then_body)
                });
                if !else_body.is_empty() {
                    w.block("else", |w| self.stmts(w, else_body));
                }
            }
            TaskStmt::Return { slot, value } => {
                w.line(format!(
                    "weft_rets[{}] = {};",
                    slot,
                    to_word(value.dtype, self.expr(value))
                ));
            }
        }
    }

    fn expr(&self, e: &TypedExpr) -> String {
        match &e.kind {
            ExprKind::Const(v) => wgsl_const(*v),
            ExprKind::Arg(i) => from_word(e.dtype, format!("weft_args[{}]", self.arg_word(*i))),
            ExprKind::Local(name) => local(name),
            ExprKind::Global(offset) => from_word(e.dtype, format!("weft_gtmp[{}]", offset / 4)),
            ExprKind::Binary(op, lhs, rhs) => self.binary(*op, lhs, rhs),
            ExprKind::Unary(op, arg) => self.unary(*op, arg),
            ExprKind::Cast(arg) => match (arg.dtype, e.dtype) {
                (from, to) if from == to => self.expr(arg),
                (DataType::F32, to) => format!("weft_f32_to_{}({})", to, self.expr(arg)),
                (_, to) => format!("{}({})", wgsl_type(to), self.expr(arg)),
            },
            ExprKind::Select(cond, a, b) => format!(
                "select({}, {}, {} != 0i)",
                self.expr(b),
                self.expr(a),
                self.expr(cond)
            ),
            ExprKind::Load { field, indices } => {
                from_word(field.dtype, self.field_call("ld", field, indices, None))
            }
            ExprKind::NdLoad { arg, index } => {
                from_word(e.dtype, self.nd_call("ld", *arg, index, None))
            }
        }
    }

    fn binary(&self, op: BinOp, lhs: &TypedExpr, rhs: &TypedExpr) -> String {
        let dt = lhs.dtype;
        let a = self.expr(lhs);
        let b = self.expr(rhs);
        let infix = |sym: &str| format!("({} {} {})", a, sym, b);
        let compare = |sym: &str| format!("select(0i, 1i, {} {} {})", a, sym, b);
        match op {
            BinOp::Add => infix("+"),
            BinOp::Sub => infix("-"),
            BinOp::Mul => infix("*"),
            BinOp::Div if dt == DataType::F32 => infix("/"),
            BinOp::Div => format!("weft_div_{}({}, {})", dt, a, b),
            BinOp::Rem => format!("weft_rem_{}({}, {})", dt, a, b),
            BinOp::Min => format!("min({}, {})", a, b),
            BinOp::Max => format!("max({}, {})", a, b),
            BinOp::Lt => compare("<"),
            BinOp::Le => compare("<="),
            BinOp::Gt => compare(">"),
            BinOp::Ge => compare(">="),
            BinOp::Eq => compare("=="),
            BinOp::Ne => compare("!="),
            BinOp::BitAnd => infix("&"),
            BinOp::BitOr => infix("|"),
            BinOp::BitXor => infix("^"),
            BinOp::Shl => format!("({} << (u32({}) & 31u))", a, b),
            BinOp::Shr => format!("({} >> (u32({}) & 31u))", a, b),
        }
    }

    fn unary(&self, op: UnOp, arg: &TypedExpr) -> String {
        let a = self.expr(arg);
        match op {
            UnOp::Neg => format!("(-{})", a),
            UnOp::BitNot => format!("(~{})", a),
            other => format!("{}({})", other.name(), a),
        }
    }
}
