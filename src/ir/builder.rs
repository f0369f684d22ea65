//! Programmatic kernel construction.

use super::{DataType, Expr, Kernel, Param, Stmt};
use crate::snode::SNodeId;

/// Builds a `Kernel` statement by statement.
///
/// Nested blocks are written with closures; the closure receives the
/// builder and, for loops, the loop index as an expression.
pub struct KernelBuilder {
    name: String,
    params: Vec<Param>,
    returns: Vec<DataType>,
    blocks: Vec<Vec<Stmt>>,
}

impl KernelBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            params: Vec::new(),
            returns: Vec::new(),
            blocks: vec![Vec::new()],
        }
    }

    /// Add a scalar parameter and return an expression reading it.
    pub fn scalar_arg(&mut self, dtype: DataType) -> Expr {
        self.params.push(Param::Scalar(dtype));
        Expr::Arg(self.params.len() - 1)
    }

    /// Add an ndarray parameter and return its argument index.
    pub fn ndarray_arg(&mut self, dtype: DataType) -> usize {
        self.params.push(Param::NdArray(dtype));
        self.params.len() - 1
    }

    /// Declare a return slot and return its index.
    pub fn return_slot(&mut self, dtype: DataType) -> usize {
        self.returns.push(dtype);
        self.returns.len() - 1
    }

    fn push(&mut self, stmt: Stmt) {
        if let Some(block) = self.blocks.last_mut() {
            block.push(stmt);
        }
    }

    fn block(&mut self, f: impl FnOnce(&mut Self)) -> Vec<Stmt> {
        self.blocks.push(Vec::new());
        f(self);
        self.blocks.pop().unwrap_or_default()
    }

    pub fn declare(&mut self, name: &str, value: Expr) -> Expr {
        self.push(Stmt::Let {
            name: name.to_string(),
            value,
        });
        Expr::var(name)
    }

    pub fn assign(&mut self, name: &str, value: Expr) {
        self.push(Stmt::Assign {
            name: name.to_string(),
            value,
        });
    }

    pub fn store(&mut self, field: SNodeId, indices: Vec<Expr>, value: Expr) {
        self.push(Stmt::Store {
            field,
            indices,
            value,
        });
    }

    pub fn nd_store(&mut self, arg: usize, index: Expr, value: Expr) {
        self.push(Stmt::NdStore { arg, index, value });
    }

    pub fn ret(&mut self, slot: usize, value: Expr) {
        self.push(Stmt::Return { slot, value });
    }

    /// `for var in begin..end`, parallel when at the top level.
    pub fn for_range(
        &mut self,
        var: &str,
        begin: Expr,
        end: Expr,
        f: impl FnOnce(&mut Self, Expr),
    ) {
        self.range(var, begin, end, false, f);
    }

    /// `for var in begin..end`, always executed in order.
    pub fn serial_range(
        &mut self,
        var: &str,
        begin: Expr,
        end: Expr,
        f: impl FnOnce(&mut Self, Expr),
    ) {
        self.range(var, begin, end, true, f);
    }

    fn range(
        &mut self,
        var: &str,
        begin: Expr,
        end: Expr,
        serialize: bool,
        f: impl FnOnce(&mut Self, Expr),
    ) {
        let index = Expr::var(var);
        let body = self.block(|b| f(b, index));
        self.push(Stmt::For {
            var: var.to_string(),
            begin,
            end,
            body,
            serialize,
        });
    }

    pub fn if_then(&mut self, cond: Expr, then: impl FnOnce(&mut Self)) {
        self.if_else(cond, then, |_| {});
    }

    pub fn if_else(
        &mut self,
        cond: Expr,
        then: impl FnOnce(&mut Self),
        otherwise: impl FnOnce(&mut Self),
    ) {
        let then_body = self.block(then);
        let else_body = self.block(otherwise);
        self.push(Stmt::If {
            cond,
            then_body,
            else_body,
        });
    }

    pub fn build(mut self) -> Kernel {
        let body = self.blocks.pop().unwrap_or_default();
        Kernel {
            name: self.name,
            params: self.params,
            returns: self.returns,
            body,
        }
    }
}
