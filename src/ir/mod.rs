//! Kernel IR consumed by the backends.
//!
//! A `Kernel` is an immutable tree of statements over typed scalar and
//! ndarray parameters and SNode fields. Backends never see it directly:
//! `offload::offload` validates it against the materialized tree layouts
//! and splits it into typed tasks, which `lower` turns into C or WGSL.

pub mod builder;
mod fingerprint;
pub mod offload;

pub use builder::KernelBuilder;
pub use fingerprint::Fingerprint;

use crate::snode::SNodeId;

// ─── Types ─────────────────────────────────────────────────────────

/// Scalar element type. Every type is 4 bytes wide.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[rkyv(derive(Debug, PartialEq))]
pub enum DataType {
    I32,
    U32,
    F32,
}

impl DataType {
    pub const SIZE: usize = 4;

    pub fn size(self) -> usize {
        Self::SIZE
    }

    pub fn is_int(self) -> bool {
        matches!(self, DataType::I32 | DataType::U32)
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::I32 => "i32",
            DataType::U32 => "u32",
            DataType::F32 => "f32",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed scalar value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Scalar {
    I32(i32),
    U32(u32),
    F32(f32),
}

impl Scalar {
    pub fn dtype(self) -> DataType {
        match self {
            Scalar::I32(_) => DataType::I32,
            Scalar::U32(_) => DataType::U32,
            Scalar::F32(_) => DataType::F32,
        }
    }

    /// Raw 32-bit pattern, as stored in argument and result slots.
    pub fn to_bits(self) -> u32 {
        match self {
            Scalar::I32(v) => v as u32,
            Scalar::U32(v) => v,
            Scalar::F32(v) => v.to_bits(),
        }
    }

    pub fn from_bits(dtype: DataType, bits: u32) -> Self {
        match dtype {
            DataType::I32 => Scalar::I32(bits as i32),
            DataType::U32 => Scalar::U32(bits),
            DataType::F32 => Scalar::F32(f32::from_bits(bits)),
        }
    }

    /// Integer value for host-side bound evaluation; `None` for floats.
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Scalar::I32(v) => Some(v as i64),
            Scalar::U32(v) => Some(v as i64),
            Scalar::F32(_) => None,
        }
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Scalar::I32(v)
    }
}

impl From<u32> for Scalar {
    fn from(v: u32) -> Self {
        Scalar::U32(v)
    }
}

impl From<f32> for Scalar {
    fn from(v: f32) -> Self {
        Scalar::F32(v)
    }
}

/// Kernel parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Param {
    Scalar(DataType),
    /// One-dimensional external array of `DataType` elements.
    NdArray(DataType),
}

impl Param {
    pub fn dtype(self) -> DataType {
        match self {
            Param::Scalar(dt) | Param::NdArray(dt) => dt,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Min,
    Max,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl BinOp {
    /// Comparisons yield an `I32` truth value (0 or 1).
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne
        )
    }

    /// Operators only defined on integer operands.
    pub fn is_int_only(self) -> bool {
        matches!(
            self,
            BinOp::Rem | BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl | BinOp::Shr
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            BinOp::Rem => "rem",
            BinOp::Min => "min",
            BinOp::Max => "max",
            BinOp::Lt => "lt",
            BinOp::Le => "le",
            BinOp::Gt => "gt",
            BinOp::Ge => "ge",
            BinOp::Eq => "eq",
            BinOp::Ne => "ne",
            BinOp::BitAnd => "bit_and",
            BinOp::BitOr => "bit_or",
            BinOp::BitXor => "bit_xor",
            BinOp::Shl => "shl",
            BinOp::Shr => "shr",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnOp {
    Neg,
    BitNot,
    Abs,
    Sqrt,
    Floor,
    Sin,
    Cos,
    Exp,
    Log,
}

impl UnOp {
    /// Transcendental and rounding ops only accept `F32`.
    pub fn is_float_only(self) -> bool {
        matches!(
            self,
            UnOp::Sqrt | UnOp::Floor | UnOp::Sin | UnOp::Cos | UnOp::Exp | UnOp::Log
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            UnOp::Neg => "neg",
            UnOp::BitNot => "bit_not",
            UnOp::Abs => "abs",
            UnOp::Sqrt => "sqrt",
            UnOp::Floor => "floor",
            UnOp::Sin => "sin",
            UnOp::Cos => "cos",
            UnOp::Exp => "exp",
            UnOp::Log => "log",
        }
    }
}

// ─── Expressions and statements ────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Const(Scalar),
    /// Scalar kernel argument by position.
    Arg(usize),
    Var(String),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Unary(UnOp, Box<Expr>),
    Cast(DataType, Box<Expr>),
    /// `cond != 0 ? then : otherwise`.
    Select(Box<Expr>, Box<Expr>, Box<Expr>),
    /// Read a place field; one index per dense axis above it.
    Load { field: SNodeId, indices: Vec<Expr> },
    /// Read element `index` of ndarray argument `arg`.
    NdLoad { arg: usize, index: Box<Expr> },
}

impl Expr {
    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn unary(op: UnOp, arg: Expr) -> Expr {
        Expr::Unary(op, Box::new(arg))
    }

    pub fn var(name: &str) -> Expr {
        Expr::Var(name.to_string())
    }

    pub fn cast(self, dtype: DataType) -> Expr {
        Expr::Cast(dtype, Box::new(self))
    }

    pub fn select(cond: Expr, then: Expr, otherwise: Expr) -> Expr {
        Expr::Select(Box::new(cond), Box::new(then), Box::new(otherwise))
    }

    pub fn load(field: SNodeId, indices: Vec<Expr>) -> Expr {
        Expr::Load { field, indices }
    }

    pub fn nd_load(arg: usize, index: Expr) -> Expr {
        Expr::NdLoad {
            arg,
            index: Box::new(index),
        }
    }
}

impl From<i32> for Expr {
    fn from(v: i32) -> Self {
        Expr::Const(Scalar::I32(v))
    }
}

impl From<u32> for Expr {
    fn from(v: u32) -> Self {
        Expr::Const(Scalar::U32(v))
    }
}

impl From<f32> for Expr {
    fn from(v: f32) -> Self {
        Expr::Const(Scalar::F32(v))
    }
}

macro_rules! impl_binop {
    ($trait:ident, $method:ident, $op:expr) => {
        impl std::ops::$trait for Expr {
            type Output = Expr;

            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary($op, self, rhs)
            }
        }
    };
}

impl_binop!(Add, add, BinOp::Add);
impl_binop!(Sub, sub, BinOp::Sub);
impl_binop!(Mul, mul, BinOp::Mul);
impl_binop!(Div, div, BinOp::Div);
impl_binop!(Rem, rem, BinOp::Rem);

impl std::ops::Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        Expr::unary(UnOp::Neg, self)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    /// Declare a variable. At the top level of a kernel it lives in
    /// global temporaries and is visible to every later task.
    Let { name: String, value: Expr },
    Assign { name: String, value: Expr },
    Store {
        field: SNodeId,
        indices: Vec<Expr>,
        value: Expr,
    },
    NdStore { arg: usize, index: Expr, value: Expr },
    /// `for var in begin..end`. A top-level loop runs in parallel unless
    /// `serialize` is set.
    For {
        var: String,
        begin: Expr,
        end: Expr,
        body: Vec<Stmt>,
        serialize: bool,
    },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    /// Write return slot `slot`. Execution continues.
    Return { slot: usize, value: Expr },
}

/// One kernel: the unit of compilation and launch.
#[derive(Clone, Debug, PartialEq)]
pub struct Kernel {
    pub name: String,
    pub params: Vec<Param>,
    pub returns: Vec<DataType>,
    pub body: Vec<Stmt>,
}

impl Kernel {
    /// Content hash over the canonical serialization of the kernel.
    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint::fingerprint_kernel(self)
    }

    /// Symbol name of the kernel's entry point in a transpiled module.
    pub fn symbol(&self) -> String {
        kernel_symbol(&self.name)
    }
}

/// `weft_k_` followed by the name with every non `[A-Za-z0-9_]` byte
/// replaced by `_`.
pub fn kernel_symbol(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    format!("weft_k_{}", sanitized)
}

#[cfg(test)]
mod tests;
