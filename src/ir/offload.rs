//! Offloading: validate a kernel and split it into tasks.
//!
//! Each non-serialized top-level `For` becomes a parallel range task.
//! Every maximal run of other top-level statements becomes one serial
//! task. Top-level `Let`s are stored in global temporaries so later tasks
//! can read them. The result is fully typed: variables are resolved to
//! locals or gtmp offsets and field accesses carry their layout, so the
//! lowerers only print.

use std::collections::{BTreeMap, BTreeSet};

use super::{BinOp, DataType, Expr, Kernel, Param, Scalar, Stmt, UnOp};
use crate::error::{BackendError, Result};
use crate::runtime::{MAX_ARGS, MAX_RETURNS};
use crate::snode::layout::find_field;
use crate::snode::{FieldLayout, Layouts, SNodeId, TreeId};

// ─── Typed task IR ─────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct TypedExpr {
    pub dtype: DataType,
    pub kind: ExprKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    Const(Scalar),
    Arg(usize),
    Local(String),
    /// Byte offset into global temporaries.
    Global(usize),
    Binary(BinOp, Box<TypedExpr>, Box<TypedExpr>),
    Unary(UnOp, Box<TypedExpr>),
    /// Convert the operand to `dtype` of the enclosing expression.
    Cast(Box<TypedExpr>),
    Select(Box<TypedExpr>, Box<TypedExpr>, Box<TypedExpr>),
    Load {
        field: FieldLayout,
        indices: Vec<TypedExpr>,
    },
    NdLoad {
        arg: usize,
        index: Box<TypedExpr>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum TaskStmt {
    Let {
        name: String,
        value: TypedExpr,
    },
    SetLocal {
        name: String,
        value: TypedExpr,
    },
    SetGlobal {
        offset: usize,
        value: TypedExpr,
    },
    Store {
        field: FieldLayout,
        indices: Vec<TypedExpr>,
        value: TypedExpr,
    },
    NdStore {
        arg: usize,
        index: TypedExpr,
        value: TypedExpr,
    },
    /// Sequential loop inside a task.
    For {
        var: String,
        begin: TypedExpr,
        end: TypedExpr,
        body: Vec<TaskStmt>,
    },
    If {
        cond: TypedExpr,
        then_body: Vec<TaskStmt>,
        else_body: Vec<TaskStmt>,
    },
    Return {
        slot: usize,
        value: TypedExpr,
    },
}

/// Host-evaluable range bound in postfix form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub enum BoundOp {
    Const(i32),
    /// Scalar integer argument by position.
    Arg(u32),
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
}

/// Evaluate a bound program with 32-bit wrapping arithmetic, matching
/// what the generated code computes on the device.
///
/// Division by zero yields the dividend, as it does in WGSL.
pub fn eval_bound(program: &[BoundOp], arg: impl Fn(usize) -> Option<i32>) -> Result<i32> {
    let mut stack: Vec<i32> = Vec::with_capacity(program.len());
    for op in program {
        let value = match *op {
            BoundOp::Const(v) => v,
            BoundOp::Arg(i) => arg(i as usize).ok_or_else(|| {
                BackendError::Transfer(format!("range bound reads missing argument {}", i))
            })?,
            op => {
                let (Some(b), Some(a)) = (stack.pop(), stack.pop()) else {
                    return Err(BackendError::Transfer("malformed range bound".to_string()));
                };
                match op {
                    BoundOp::Add => a.wrapping_add(b),
                    BoundOp::Sub => a.wrapping_sub(b),
                    BoundOp::Mul => a.wrapping_mul(b),
                    BoundOp::Div if b == 0 => a,
                    BoundOp::Div => a.wrapping_div(b),
                    BoundOp::Min => a.min(b),
                    _ => a.max(b),
                }
            }
        };
        stack.push(value);
    }
    match stack.as_slice() {
        [v] => Ok(*v),
        _ => Err(BackendError::Transfer("malformed range bound".to_string())),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RangeTask {
    pub var: String,
    pub begin: TypedExpr,
    pub end: TypedExpr,
    pub begin_program: Vec<BoundOp>,
    pub end_program: Vec<BoundOp>,
}

impl RangeTask {
    /// Number of iterations for the given scalar arguments.
    pub fn iterations(&self, arg: impl Fn(usize) -> Option<i32> + Copy) -> Result<u32> {
        let begin = eval_bound(&self.begin_program, arg)?;
        let end = eval_bound(&self.end_program, arg)?;
        Ok((end as i64 - begin as i64).clamp(0, u32::MAX as i64) as u32)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TaskKind {
    Serial,
    Range(RangeTask),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Task {
    pub kind: TaskKind,
    pub body: Vec<TaskStmt>,
}

/// A validated kernel split into tasks.
#[derive(Clone, Debug, PartialEq)]
pub struct OffloadedKernel {
    pub name: String,
    pub symbol: String,
    pub params: Vec<Param>,
    pub returns: Vec<DataType>,
    pub tasks: Vec<Task>,
    /// Bytes of global temporaries used.
    pub gtmp_size: usize,
    /// Trees whose fields are read or written.
    pub trees: BTreeSet<TreeId>,
}

impl OffloadedKernel {
    /// Argument indices of ndarray parameters, in order.
    pub fn ndarrays(&self) -> Vec<usize> {
        self.params
            .iter()
            .enumerate()
            .filter(|(_, p)| matches!(p, Param::NdArray(_)))
            .map(|(i, _)| i)
            .collect()
    }
}

// ─── Offloading ────────────────────────────────────────────────────

struct Local {
    name: String,
    dtype: DataType,
    mutable: bool,
}

struct Offloader<'a> {
    kernel: &'a Kernel,
    layouts: &'a Layouts,
    gtmp_capacity: usize,
    /// Every top-level `Let` name in the kernel.
    top_names: BTreeSet<&'a str>,
    /// Top-level variables declared so far: name → (type, gtmp offset).
    globals: BTreeMap<String, (DataType, usize)>,
    scopes: Vec<Vec<Local>>,
    in_parallel: bool,
    trees: BTreeSet<TreeId>,
}

/// Validate `kernel` against the materialized trees and split it into tasks.
pub fn offload(kernel: &Kernel, layouts: &Layouts, gtmp_capacity: usize) -> Result<OffloadedKernel> {
    if kernel.name.is_empty() {
        return Err(BackendError::invalid_kernel("", "kernel name is empty"));
    }
    if kernel.returns.len() > MAX_RETURNS {
        return Err(BackendError::invalid_kernel(
            &kernel.name,
            format!(
                "{} return values exceed the limit of {}",
                kernel.returns.len(),
                MAX_RETURNS
            ),
        ));
    }
    if kernel.params.len() > MAX_ARGS {
        return Err(BackendError::invalid_kernel(
            &kernel.name,
            format!(
                "{} parameters exceed the limit of {}",
                kernel.params.len(),
                MAX_ARGS
            ),
        ));
    }

    let top_names = kernel
        .body
        .iter()
        .filter_map(|s| match s {
            Stmt::Let { name, .. } => Some(name.as_str()),
            _ => None,
        })
        .collect();
    let mut o = Offloader {
        kernel,
        layouts,
        gtmp_capacity,
        top_names,
        globals: BTreeMap::new(),
        scopes: Vec::new(),
        in_parallel: false,
        trees: BTreeSet::new(),
    };

    let mut tasks = Vec::new();
    let mut serial: Vec<TaskStmt> = Vec::new();
    for stmt in &kernel.body {
        match stmt {
            Stmt::For {
                var,
                begin,
                end,
                body,
                serialize: false,
            } => {
                if !serial.is_empty() {
                    tasks.push(Task {
                        kind: TaskKind::Serial,
                        body: std::mem::take(&mut serial),
                    });
                }
                tasks.push(o.range_task(var, begin, end, body)?);
            }
            Stmt::Let { name, value } => {
                o.check_name(name)?;
                if o.globals.contains_key(name) {
                    return Err(o.error(format!("'{}' is declared twice", name)));
                }
                let value = o.expr(value)?;
                let offset = o.globals.len() * DataType::SIZE;
                if offset + DataType::SIZE > o.gtmp_capacity {
                    return Err(o.error(format!(
                        "top-level variables exceed the {} byte global temporary region",
                        o.gtmp_capacity
                    )));
                }
                o.globals.insert(name.clone(), (value.dtype, offset));
                serial.push(TaskStmt::SetGlobal { offset, value });
            }
            other => serial.push(o.stmt(other)?),
        }
    }
    if !serial.is_empty() {
        tasks.push(Task {
            kind: TaskKind::Serial,
            body: serial,
        });
    }

    Ok(OffloadedKernel {
        name: kernel.name.clone(),
        symbol: kernel.symbol(),
        params: kernel.params.clone(),
        returns: kernel.returns.clone(),
        tasks,
        gtmp_size: o.globals.len() * DataType::SIZE,
        trees: o.trees,
    })
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl<'a> Offloader<'a> {
    fn error(&self, reason: impl Into<String>) -> BackendError {
        BackendError::invalid_kernel(&self.kernel.name, reason)
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if !is_identifier(name) {
            return Err(self.error(format!("'{}' is not a valid variable name", name)));
        }
        Ok(())
    }

    fn lookup_local(&self, name: &str) -> Option<&Local> {
        self.scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.iter().rev())
            .find(|l| l.name == name)
    }

    fn declare_local(&mut self, name: &str, dtype: DataType, mutable: bool) -> Result<()> {
        self.check_name(name)?;
        if self.lookup_local(name).is_some() || self.globals.contains_key(name) {
            return Err(self.error(format!("'{}' is already declared", name)));
        }
        if self.top_names.contains(name) {
            return Err(self.error(format!("'{}' shadows a top-level variable", name)));
        }
        if let Some(scope) = self.scopes.last_mut() {
            scope.push(Local {
                name: name.to_string(),
                dtype,
                mutable,
            });
        }
        Ok(())
    }

    fn range_task(&mut self, var: &str, begin: &Expr, end: &Expr, body: &[Stmt]) -> Result<Task> {
        let begin_typed = self.index_expr(begin, "range begin")?;
        let end_typed = self.index_expr(end, "range end")?;
        let begin_program = self.bound_program(begin)?;
        let end_program = self.bound_program(end)?;

        self.in_parallel = true;
        self.scopes.push(Vec::new());
        let body = self
            .declare_local(var, DataType::I32, false)
            .and_then(|_| self.block_in_scope(body));
        self.scopes.pop();
        self.in_parallel = false;

        Ok(Task {
            kind: TaskKind::Range(RangeTask {
                var: var.to_string(),
                begin: begin_typed,
                end: end_typed,
                begin_program,
                end_program,
            }),
            body: body?,
        })
    }

    fn bound_program(&self, expr: &Expr) -> Result<Vec<BoundOp>> {
        let mut program = Vec::new();
        self.bound_into(expr, &mut program)?;
        Ok(program)
    }

    fn bound_into(&self, expr: &Expr, out: &mut Vec<BoundOp>) -> Result<()> {
        match expr {
            Expr::Const(Scalar::I32(v)) => out.push(BoundOp::Const(*v)),
            Expr::Arg(i) if matches!(self.kernel.params.get(*i), Some(Param::Scalar(DataType::I32))) => {
                out.push(BoundOp::Arg(*i as u32))
            }
            Expr::Binary(op, lhs, rhs) => {
                let op = match op {
                    BinOp::Add => BoundOp::Add,
                    BinOp::Sub => BoundOp::Sub,
                    BinOp::Mul => BoundOp::Mul,
                    BinOp::Div => BoundOp::Div,
                    BinOp::Min => BoundOp::Min,
                    BinOp::Max => BoundOp::Max,
                    other => {
                        return Err(self.error(format!(
                            "'{}' is not allowed in a parallel range bound",
                            other.name()
                        )))
                    }
                };
                self.bound_into(lhs, out)?;
                self.bound_into(rhs, out)?;
                out.push(op);
            }
            _ => {
                return Err(self.error(
                    "parallel range bounds may only use i32 constants, i32 arguments and arithmetic",
                ))
            }
        }
        Ok(())
    }

    fn block(&mut self, body: &[Stmt]) -> Result<Vec<TaskStmt>> {
        self.scopes.push(Vec::new());
        let out = self.block_in_scope(body);
        self.scopes.pop();
        out
    }

    fn block_in_scope(&mut self, body: &[Stmt]) -> Result<Vec<TaskStmt>> {
        body.iter().map(|s| self.stmt(s)).collect()
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<TaskStmt> {
        match stmt {
            Stmt::Let { name, value } => {
                let value = self.expr(value)?;
                self.declare_local(name, value.dtype, true)?;
                Ok(TaskStmt::Let {
                    name: name.clone(),
                    value,
                })
            }
            Stmt::Assign { name, value } => {
                let value = self.expr(value)?;
                if let Some(local) = self.lookup_local(name) {
                    if !local.mutable {
                        return Err(self.error(format!("loop index '{}' cannot be assigned", name)));
                    }
                    self.expect(local.dtype, value.dtype, name)?;
                    return Ok(TaskStmt::SetLocal {
                        name: name.clone(),
                        value,
                    });
                }
                let Some(&(dtype, offset)) = self.globals.get(name) else {
                    return Err(self.error(format!("unknown variable '{}'", name)));
                };
                if self.in_parallel {
                    return Err(self.error(format!(
                        "top-level variable '{}' is assigned inside a parallel loop",
                        name
                    )));
                }
                self.expect(dtype, value.dtype, name)?;
                Ok(TaskStmt::SetGlobal { offset, value })
            }
            Stmt::Store {
                field,
                indices,
                value,
            } => {
                let (field, indices) = self.field_access(*field, indices)?;
                let value = self.expr(value)?;
                self.expect(field.dtype, value.dtype, &field.snode.to_string())?;
                Ok(TaskStmt::Store {
                    field,
                    indices,
                    value,
                })
            }
            Stmt::NdStore { arg, index, value } => {
                let dtype = self.ndarray_param(*arg)?;
                let index = self.index_expr(index, "ndarray index")?;
                let value = self.expr(value)?;
                self.expect(dtype, value.dtype, &format!("ndarray argument {}", arg))?;
                Ok(TaskStmt::NdStore {
                    arg: *arg,
                    index,
                    value,
                })
            }
            Stmt::For {
                var,
                begin,
                end,
                body,
                ..
            } => {
                let begin = self.index_expr(begin, "loop begin")?;
                let end = self.index_expr(end, "loop end")?;
                self.scopes.push(Vec::new());
                let body = self
                    .declare_local(var, DataType::I32, false)
                    .and_then(|_| self.block_in_scope(body));
                self.scopes.pop();
                Ok(TaskStmt::For {
                    var: var.clone(),
                    begin,
                    end,
                    body: body?,
                })
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                let cond = self.index_expr(cond, "condition")?;
                let then_body = self.block(then_body)?;
                let else_body = self.block(else_body)?;
                Ok(TaskStmt::If {
                    cond,
                    then_body,
                    else_body,
                })
            }
            Stmt::Return { slot, value } => {
                if self.in_parallel {
                    return Err(self.error("return inside a parallel loop"));
                }
                let Some(&dtype) = self.kernel.returns.get(*slot) else {
                    return Err(self.error(format!("return slot {} is not declared", slot)));
                };
                let value = self.expr(value)?;
                self.expect(dtype, value.dtype, &format!("return slot {}", slot))?;
                Ok(TaskStmt::Return { slot: *slot, value })
            }
        }
    }

    fn expect(&self, want: DataType, got: DataType, what: &str) -> Result<()> {
        if want != got {
            return Err(self.error(format!("{} expects {}, got {}", what, want, got)));
        }
        Ok(())
    }

    fn index_expr(&mut self, expr: &Expr, what: &str) -> Result<TypedExpr> {
        let typed = self.expr(expr)?;
        self.expect(DataType::I32, typed.dtype, what)?;
        Ok(typed)
    }

    fn ndarray_param(&self, arg: usize) -> Result<DataType> {
        match self.kernel.params.get(arg) {
            Some(Param::NdArray(dt)) => Ok(*dt),
            Some(Param::Scalar(_)) => Err(self.error(format!("argument {} is not an ndarray", arg))),
            None => Err(self.error(format!("argument {} does not exist", arg))),
        }
    }

    fn field_access(
        &mut self,
        field: SNodeId,
        indices: &[Expr],
    ) -> Result<(FieldLayout, Vec<TypedExpr>)> {
        let layout = find_field(self.layouts, field)?.clone();
        if indices.len() != layout.rank() {
            return Err(self.error(format!(
                "field {} has {} axes but {} indices were given",
                field,
                layout.rank(),
                indices.len()
            )));
        }
        let indices = indices
            .iter()
            .map(|i| self.index_expr(i, "field index"))
            .collect::<Result<Vec<_>>>()?;
        self.trees.insert(field.tree);
        Ok((layout, indices))
    }

    fn expr(&mut self, expr: &Expr) -> Result<TypedExpr> {
        let (dtype, kind) = match expr {
            Expr::Const(v) => (v.dtype(), ExprKind::Const(*v)),
            Expr::Arg(i) => match self.kernel.params.get(*i) {
                Some(Param::Scalar(dt)) => (*dt, ExprKind::Arg(*i)),
                Some(Param::NdArray(_)) => {
                    return Err(self.error(format!("ndarray argument {} used as a scalar", i)))
                }
                None => return Err(self.error(format!("argument {} does not exist", i))),
            },
            Expr::Var(name) => {
                if let Some(local) = self.lookup_local(name) {
                    (local.dtype, ExprKind::Local(name.clone()))
                } else if let Some(&(dt, offset)) = self.globals.get(name) {
                    (dt, ExprKind::Global(offset))
                } else {
                    return Err(self.error(format!("unknown variable '{}'", name)));
                }
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.expr(lhs)?;
                let rhs = self.expr(rhs)?;
                if lhs.dtype != rhs.dtype {
                    return Err(self.error(format!(
                        "'{}' operands differ: {} and {}",
                        op.name(),
                        lhs.dtype,
                        rhs.dtype
                    )));
                }
                if op.is_int_only() && !lhs.dtype.is_int() {
                    return Err(self.error(format!("'{}' requires integer operands", op.name())));
                }
                let dtype = if op.is_comparison() {
                    DataType::I32
                } else {
                    lhs.dtype
                };
                (dtype, ExprKind::Binary(*op, Box::new(lhs), Box::new(rhs)))
            }
            Expr::Unary(op, arg) => {
                let arg = self.expr(arg)?;
                let ok = match op {
                    UnOp::Neg | UnOp::Abs => arg.dtype != DataType::U32,
                    UnOp::BitNot => arg.dtype.is_int(),
                    _ => arg.dtype == DataType::F32,
                };
                if !ok {
                    return Err(self.error(format!("'{}' is not defined for {}", op.name(), arg.dtype)));
                }
                (arg.dtype, ExprKind::Unary(*op, Box::new(arg)))
            }
            Expr::Cast(to, arg) => (*to, ExprKind::Cast(Box::new(self.expr(arg)?))),
            Expr::Select(cond, a, b) => {
                let cond = self.index_expr(cond, "select condition")?;
                let a = self.expr(a)?;
                let b = self.expr(b)?;
                self.expect(a.dtype, b.dtype, "select")?;
                (a.dtype, ExprKind::Select(Box::new(cond), Box::new(a), Box::new(b)))
            }
            Expr::Load { field, indices } => {
                let (field, indices) = self.field_access(*field, indices)?;
                (field.dtype, ExprKind::Load { field, indices })
            }
            Expr::NdLoad { arg, index } => {
                let dtype = self.ndarray_param(*arg)?;
                let index = self.index_expr(index, "ndarray index")?;
                (
                    dtype,
                    ExprKind::NdLoad {
                        arg: *arg,
                        index: Box::new(index),
                    },
                )
            }
        };
        Ok(TypedExpr { dtype, kind })
    }
}
