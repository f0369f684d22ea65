//! Kernel content hashing.
//!
//! The kernel is serialized into a tagged byte stream and hashed with
//! BLAKE3. Every node starts with a one-byte tag and variable-length
//! parts are length-prefixed, so distinct kernels never share a stream.

use super::*;

const FINGERPRINT_VERSION: u8 = 1;

const TAG_KERNEL: u8 = 0x01;
const TAG_PARAM_SCALAR: u8 = 0x02;
const TAG_PARAM_NDARRAY: u8 = 0x03;
const TAG_RETURN: u8 = 0x04;

const TAG_CONST: u8 = 0x10;
const TAG_ARG: u8 = 0x11;
const TAG_VAR: u8 = 0x12;
const TAG_BINARY: u8 = 0x13;
const TAG_UNARY: u8 = 0x14;
const TAG_CAST: u8 = 0x15;
const TAG_SELECT: u8 = 0x16;
const TAG_LOAD: u8 = 0x17;
const TAG_ND_LOAD: u8 = 0x18;

const TAG_LET: u8 = 0x20;
const TAG_ASSIGN: u8 = 0x21;
const TAG_STORE: u8 = 0x22;
const TAG_ND_STORE: u8 = 0x23;
const TAG_FOR: u8 = 0x24;
const TAG_IF: u8 = 0x25;
const TAG_RETURN_STMT: u8 = 0x26;
const TAG_END: u8 = 0x2f;

/// A 256-bit BLAKE3 kernel hash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// First 8 hex digits.
    pub fn to_short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.to_short())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.to_short())
    }
}

pub(super) fn fingerprint_kernel(kernel: &Kernel) -> Fingerprint {
    let mut buf = Vec::with_capacity(256);
    buf.push(FINGERPRINT_VERSION);
    buf.push(TAG_KERNEL);
    write_str(&mut buf, &kernel.name);
    write_len(&mut buf, kernel.params.len());
    for param in &kernel.params {
        match param {
            Param::Scalar(_) => buf.push(TAG_PARAM_SCALAR),
            Param::NdArray(_) => buf.push(TAG_PARAM_NDARRAY),
        }
        buf.push(dtype_tag(param.dtype()));
    }
    write_len(&mut buf, kernel.returns.len());
    for dt in &kernel.returns {
        buf.push(TAG_RETURN);
        buf.push(dtype_tag(*dt));
    }
    write_block(&mut buf, &kernel.body);
    Fingerprint(*blake3::hash(&buf).as_bytes())
}

fn dtype_tag(dt: DataType) -> u8 {
    match dt {
        DataType::I32 => 0,
        DataType::U32 => 1,
        DataType::F32 => 2,
    }
}

fn write_len(buf: &mut Vec<u8>, len: usize) {
    buf.extend_from_slice(&(len as u64).to_le_bytes());
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    write_len(buf, s.len());
    buf.extend_from_slice(s.as_bytes());
}

fn write_snode(buf: &mut Vec<u8>, id: SNodeId) {
    buf.extend_from_slice(&id.tree.0.to_le_bytes());
    buf.extend_from_slice(&id.index.to_le_bytes());
}

fn write_block(buf: &mut Vec<u8>, body: &[Stmt]) {
    write_len(buf, body.len());
    for stmt in body {
        write_stmt(buf, stmt);
    }
    buf.push(TAG_END);
}

fn write_stmt(buf: &mut Vec<u8>, stmt: &Stmt) {
    match stmt {
        Stmt::Let { name, value } => {
            buf.push(TAG_LET);
            write_str(buf, name);
            write_expr(buf, value);
        }
        Stmt::Assign { name, value } => {
            buf.push(TAG_ASSIGN);
            write_str(buf, name);
            write_expr(buf, value);
        }
        Stmt::Store {
            field,
            indices,
            value,
        } => {
            buf.push(TAG_STORE);
            write_snode(buf, *field);
            write_exprs(buf, indices);
            write_expr(buf, value);
        }
        Stmt::NdStore { arg, index, value } => {
            buf.push(TAG_ND_STORE);
            write_len(buf, *arg);
            write_expr(buf, index);
            write_expr(buf, value);
        }
        Stmt::For {
            var,
            begin,
            end,
            body,
            serialize,
        } => {
            buf.push(TAG_FOR);
            write_str(buf, var);
            write_expr(buf, begin);
            write_expr(buf, end);
            buf.push(*serialize as u8);
            write_block(buf, body);
        }
        Stmt::If {
            cond,
            then_body,
            else_body,
        } => {
            buf.push(TAG_IF);
            write_expr(buf, cond);
            write_block(buf, then_body);
            write_block(buf, else_body);
        }
        Stmt::Return { slot, value } => {
            buf.push(TAG_RETURN_STMT);
            write_len(buf, *slot);
            write_expr(buf, value);
        }
    }
}

fn write_exprs(buf: &mut Vec<u8>, exprs: &[Expr]) {
    write_len(buf, exprs.len());
    for e in exprs {
        write_expr(buf, e);
    }
}

fn write_expr(buf: &mut Vec<u8>, expr: &Expr) {
    match expr {
        Expr::Const(v) => {
            buf.push(TAG_CONST);
            buf.push(dtype_tag(v.dtype()));
            buf.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        Expr::Arg(i) => {
            buf.push(TAG_ARG);
            write_len(buf, *i);
        }
        Expr::Var(name) => {
            buf.push(TAG_VAR);
            write_str(buf, name);
        }
        Expr::Binary(op, lhs, rhs) => {
            buf.push(TAG_BINARY);
            write_str(buf, op.name());
            write_expr(buf, lhs);
            write_expr(buf, rhs);
        }
        Expr::Unary(op, arg) => {
            buf.push(TAG_UNARY);
            write_str(buf, op.name());
            write_expr(buf, arg);
        }
        Expr::Cast(dt, arg) => {
            buf.push(TAG_CAST);
            buf.push(dtype_tag(*dt));
            write_expr(buf, arg);
        }
        Expr::Select(cond, a, b) => {
            buf.push(TAG_SELECT);
            write_expr(buf, cond);
            write_expr(buf, a);
            write_expr(buf, b);
        }
        Expr::Load { field, indices } => {
            buf.push(TAG_LOAD);
            write_snode(buf, *field);
            write_exprs(buf, indices);
        }
        Expr::NdLoad { arg, index } => {
            buf.push(TAG_ND_LOAD);
            write_len(buf, *arg);
            write_expr(buf, index);
        }
    }
}
