//! C lowering: one exported function per kernel.
//!
//! Generated code touches memory only through the `WeftContext` it is
//! handed: `args` holds the marshalled arguments, `roots[t]` the storage
//! of tree `t`, `gtmp` the global temporaries, `rets` the return slots.
//! Field offsets, extents and strides are referenced by macro name so the
//! code stays valid when the translation unit is regenerated. Every field
//! and ndarray access goes through the bounds-checked helpers of the
//! runtime support.

use super::{KernelLowering, SourceWriter};
use crate::ir::offload::{ExprKind, OffloadedKernel, TaskKind, TaskStmt, TypedExpr};
use crate::ir::{BinOp, DataType, Scalar, UnOp};
use crate::runtime::ArgumentLayout;
use crate::snode::{FieldLayout, SNodeId};

pub struct CLowering;

impl CLowering {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CLowering {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelLowering for CLowering {
    fn target_name(&self) -> &str {
        "c"
    }

    fn lower(&self, kernel: &OffloadedKernel, args: &ArgumentLayout) -> String {
        let cx = Cx { args };
        let mut w = SourceWriter::new();
        w.line(format!(
            "/* kernel {}: {} task(s) */",
            kernel.name,
            kernel.tasks.len()
        ));
        w.block(
            format!("WEFT_EXPORT void {}(WeftContext *ctx)", kernel.symbol),
            |w| {
                if kernel.tasks.is_empty() {
                    w.line("(void)ctx;");
                }
                for (i, task) in kernel.tasks.iter().enumerate() {
                    match &task.kind {
                        TaskKind::Serial => {
                            w.line(format!("/* task {}: serial */", i));
                            w.block("", |w| cx.stmts(w, &task.body));
                        }
                        TaskKind::Range(range) => {
                            w.line(format!("/* task {}: range over {} */", i, range.var));
                            w.block("", |w| {
                                w.line(format!("const int32_t weft_b{} = {};", i, cx.expr(&range.begin)));
                                w.line(format!("const int32_t weft_e{} = {};", i, cx.expr(&range.end)));
                                let var = local(&range.var);
                                w.block(
                                    format!(
                                        "for (int32_t {v} = weft_b{i}; {v} < weft_e{i}; ++{v})",
                                        v = var,
                                        i = i
                                    ),
                                    |w| cx.stmts(w, &task.body),
                                );
                            });
                        }
                    }
                }
            },
        );
        w.finish()
    }
}

/// Macro prefix for a place's layout constants, e.g. `WEFT_T0_N2`.
pub fn field_macro(id: SNodeId) -> String {
    format!("WEFT_T{}_N{}", id.tree.0, id.index)
}

pub(crate) fn c_type(dt: DataType) -> &'static str {
    match dt {
        DataType::I32 => "int32_t",
        DataType::U32 => "uint32_t",
        DataType::F32 => "float",
    }
}

fn local(name: &str) -> String {
    format!("v_{}", name)
}

fn c_const(v: Scalar) -> String {
    match v {
        Scalar::I32(i32::MIN) => "(-2147483647 - 1)".to_string(),
        Scalar::I32(v) if v < 0 => format!("({})", v),
        Scalar::I32(v) => v.to_string(),
        Scalar::U32(v) => format!("{}u", v),
        Scalar::F32(v) => format!("weft_f32(0x{:08x}u)", v.to_bits()),
    }
}

struct Cx<'a> {
    args: &'a ArgumentLayout,
}

impl Cx<'_> {
    fn arg_offset(&self, index: usize) -> usize {
        self.args.offsets.get(index).copied().flatten().unwrap_or(0)
    }

    /// Address of one field element, NULL when an index is out of range.
    fn field_addr(&self, field: &FieldLayout, indices: &[TypedExpr]) -> String {
        let m = field_macro(field.snode);
        let base = format!("ctx->roots[{}] + {}_OFF", field.snode.tree.0, m);
        if indices.is_empty() {
            return base;
        }
        let list = |f: &dyn Fn(usize) -> String| {
            (0..indices.len()).map(f).collect::<Vec<_>>().join(", ")
        };
        format!(
            "weft_at(ctx, {}, {}, (const int32_t[]){{{}}}, (const uint32_t[]){{{}}}, (const size_t[]){{{}}})",
            base,
            indices.len(),
            list(&|k| format!("(int32_t)({})", self.expr(&indices[k]))),
            list(&|k| format!("{}_D{}", m, k)),
            list(&|k| format!("{}_S{}", m, k)),
        )
    }

    fn nd_addr(&self, arg: usize, index: &TypedExpr) -> String {
        format!(
            "weft_nd_at(ctx, {}, {}u, (int32_t)({}))",
            self.arg_offset(arg),
            arg,
            self.expr(index)
        )
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
                    "{} {} = {};",
                    c_type(value.dtype),
                    local(name),
                    self.expr(value)
                ));
            }
            TaskStmt::SetLocal { name, value } => {
                w.line(format!("{} = {};", local(name), self.expr(value)));
            }
            TaskStmt::SetGlobal { offset, value } => {
                w.line(format!(
                    "weft_st_{}(ctx->gtmp + {}, {});",
                    value.dtype,
                    offset,
                    self.expr(value)
                ));
            }
            TaskStmt::Store {
                field,
                indices,
                value,
            } => {
                w.line(format!(
                    "weft_stp_{}({}, {});",
                    field.dtype,
                    self.field_addr(field, indices),
                    self.expr(value)
                ));
            }
            TaskStmt::NdStore { arg, index, value } => {
                w.line(format!(
                    "weft_stp_{}({}, {});",
                    value.dtype,
                    self.nd_addr(*arg, index),
                    self.expr(value)
                ));
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
                        "for (int32_t {v} = {b}; {v} < {e}; ++{v})",
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
                w.block(format!("if (({}) != 0)", self.expr(cond)), |w| {
                    self.stmts(w, then_body)
                });
                if !else_body.is_empty() {
                    w.block("else", |w| self.stmts(w, else_body));
                }
            }
            TaskStmt::Return { slot, value } => {
                w.line(format!(
                    "ctx->rets[{}] = weft_bits_{}({});",
                    slot,
                    value.dtype,
                    self.expr(value)
                ));
            }
        }
    }

    fn expr(&self, e: &TypedExpr) -> String {
        match &e.kind {
            ExprKind::Const(v) => c_const(*v),
            ExprKind::Arg(i) => format!("weft_ld_{}(ctx->args + {})", e.dtype, self.arg_offset(*i)),
            ExprKind::Local(name) => local(name),
            ExprKind::Global(offset) => format!("weft_ld_{}(ctx->gtmp + {})", e.dtype, offset),
            ExprKind::Binary(op, lhs, rhs) => self.binary(*op, lhs, rhs),
            ExprKind::Unary(op, arg) => self.unary(*op, arg),
            ExprKind::Cast(arg) => cast(arg.dtype, e.dtype, &self.expr(arg)),
            ExprKind::Select(cond, a, b) => format!(
                "(({}) != 0 ? {} : {})",
                self.expr(cond),
                self.expr(a),
                self.expr(b)
            ),
            ExprKind::Load { field, indices } => {
                format!("weft_ldp_{}({})", field.dtype, self.field_addr(field, indices))
            }
            ExprKind::NdLoad { arg, index } => {
                format!("weft_ldp_{}({})", e.dtype, self.nd_addr(*arg, index))
            }
        }
    }

    fn binary(&self, op: BinOp, lhs: &TypedExpr, rhs: &TypedExpr) -> String {
        let dt = lhs.dtype;
        let a = self.expr(lhs);
        let b = self.expr(rhs);
        let infix = |sym: &str| format!("({} {} {})", a, sym, b);
        let compare = |sym: &str| format!("(int32_t)({} {} {})", a, sym, b);
        match op {
            BinOp::Add => infix("+"),
            BinOp::Sub => infix("-"),
            BinOp::Mul => infix("*"),
            BinOp::Div if dt == DataType::F32 => infix("/"),
            BinOp::Div => format!("weft_div_{}({}, {})", dt, a, b),
            BinOp::Rem => format!("weft_rem_{}({}, {})", dt, a, b),
            BinOp::Min => format!("weft_min_{}({}, {})", dt, a, b),
            BinOp::Max => format!("weft_max_{}({}, {})", dt, a, b),
            BinOp::Lt => compare("<"),
            BinOp::Le => compare("<="),
            BinOp::Gt => compare(">"),
            BinOp::Ge => compare(">="),
            BinOp::Eq => compare("=="),
            BinOp::Ne => compare("!="),
            BinOp::BitAnd => infix("&"),
            BinOp::BitOr => infix("|"),
            BinOp::BitXor => infix("^"),
            BinOp::Shl if dt == DataType::I32 => {
                format!("(int32_t)((uint32_t)({}) << ((uint32_t)({}) & 31u))", a, b)
            }
            BinOp::Shl => format!("({} << ((uint32_t)({}) & 31u))", a, b),
            BinOp::Shr => format!("({} >> ((uint32_t)({}) & 31u))", a, b),
        }
    }

    fn unary(&self, op: UnOp, arg: &TypedExpr) -> String {
        let a = self.expr(arg);
        let float = |f: &str| format!("{}({})", f, a);
        match op {
            UnOp::Neg => format!("(-{})", a),
            UnOp::BitNot => format!("(~{})", a),
            UnOp::Abs if arg.dtype == DataType::F32 => float("fabsf"),
            UnOp::Abs => format!("weft_abs_i32({})", a),
            UnOp::Sqrt => float("sqrtf"),
            UnOp::Floor => float("floorf"),
            UnOp::Sin => float("sinf"),
            UnOp::Cos => float("cosf"),
            UnOp::Exp => float("expf"),
            UnOp::Log => float("logf"),
        }
    }
}

fn cast(from: DataType, to: DataType, a: &str) -> String {
    match (from, to) {
        (f, t) if f == t => a.to_string(),
        (DataType::F32, DataType::I32) => format!("weft_f32_to_i32({})", a),
        (DataType::F32, DataType::U32) => format!("weft_f32_to_u32({})", a),
        (_, t) => format!("({})({})", c_type(t), a),
    }
}
