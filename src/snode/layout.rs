//! Byte layout of a materialized SNode tree.
//!
//! Children of a node are packed in declaration order into one cell; a
//! `Dense` node repeats its cell row-major over its shape. Every place is
//! 4 bytes and 4-byte aligned, so no padding is ever needed.

use std::collections::BTreeMap;

use super::{SNodeId, SNodeKind, SNodeTree, TreeId};
use crate::error::{BackendError, Result};
use crate::ir::DataType;

/// One dense axis on the path to a place.
#[derive(Clone, Copy, Debug, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct Axis {
    pub extent: u32,
    /// Byte distance between consecutive indices on this axis.
    pub stride: usize,
}

#[derive(Clone, Debug, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct FieldLayout {
    pub snode: SNodeId,
    pub dtype: DataType,
    /// Byte offset of element `[0, 0, ..]` from the tree root.
    pub offset: usize,
    pub axes: Vec<Axis>,
}

impl FieldLayout {
    pub fn rank(&self) -> usize {
        self.axes.len()
    }

    pub fn num_elements(&self) -> usize {
        self.axes.iter().map(|a| a.extent as usize).product()
    }

    /// Byte offset of one element, or `None` when an index is out of range.
    pub fn element_offset(&self, indices: &[u32]) -> Option<usize> {
        if indices.len() != self.axes.len() {
            return None;
        }
        let mut offset = self.offset;
        for (axis, &i) in self.axes.iter().zip(indices) {
            if i >= axis.extent {
                return None;
            }
            offset += axis.stride * i as usize;
        }
        Some(offset)
    }
}

#[derive(Clone, Debug, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct TreeLayout {
    pub tree: TreeId,
    /// Total bytes of backing storage.
    pub size: usize,
    /// Place layouts keyed by node index.
    pub fields: BTreeMap<u32, FieldLayout>,
}

impl TreeLayout {
    pub fn field(&self, id: SNodeId) -> Option<&FieldLayout> {
        if id.tree != self.tree {
            return None;
        }
        self.fields.get(&id.index)
    }
}

/// Layouts of every materialized tree, by tree id.
pub type Layouts = BTreeMap<TreeId, TreeLayout>;

/// Find a field across materialized trees.
pub fn find_field(layouts: &Layouts, id: SNodeId) -> Result<&FieldLayout> {
    let tree = layouts.get(&id.tree).ok_or(BackendError::UnknownTree(id.tree.0))?;
    tree.field(id)
        .ok_or_else(|| BackendError::UnknownSNode(id.to_string()))
}

struct Walker<'t> {
    tree: &'t SNodeTree,
    fields: BTreeMap<u32, FieldLayout>,
}

impl Walker<'_> {
    fn overflow(&self) -> BackendError {
        BackendError::invalid_tree(self.tree.id.0, "layout size overflows usize")
    }

    /// Lay out the children of `index` as one cell starting at `base`.
    /// Returns the cell size.
    fn cell(&mut self, index: u32, base: usize, axes: &[Axis]) -> Result<usize> {
        let children = self.tree.nodes()[index as usize].children.clone();
        let mut size = 0usize;
        for child in children {
            let offset = base.checked_add(size).ok_or_else(|| self.overflow())?;
            let child_size = self.node(child, offset, axes)?;
            size = size.checked_add(child_size).ok_or_else(|| self.overflow())?;
        }
        Ok(size)
    }

    /// Lay out one node at `offset`; returns its total size.
    fn node(&mut self, index: u32, offset: usize, axes: &[Axis]) -> Result<usize> {
        let tree = self.tree;
        let node = &tree.nodes()[index as usize];
        match &node.kind {
            SNodeKind::Place { dtype } => {
                self.fields.insert(
                    index,
                    FieldLayout {
                        snode: node.id,
                        dtype: *dtype,
                        offset,
                        axes: axes.to_vec(),
                    },
                );
                Ok(dtype.size())
            }
            SNodeKind::Dense { shape } => {
                // Strides are only known once the cell size is, so lay the
                // cell out with placeholder strides and patch them after.
                let first_new = axes.len();
                let mut inner: Vec<Axis> = axes.to_vec();
                inner.extend(shape.iter().map(|&extent| Axis { extent, stride: 0 }));
                let cell = self.cell(index, offset, &inner)?;

                let mut strides = vec![0usize; shape.len()];
                let mut stride = cell;
                for (k, &extent) in shape.iter().enumerate().rev() {
                    strides[k] = stride;
                    stride = stride
                        .checked_mul(extent as usize)
                        .ok_or_else(|| self.overflow())?;
                }
                let subtree = tree.descendants(index);
                for field in self.fields.values_mut() {
                    if subtree.contains(&field.snode.index) {
                        for (k, s) in strides.iter().enumerate() {
                            field.axes[first_new + k].stride = *s;
                        }
                    }
                }
                Ok(stride)
            }
            SNodeKind::Root => self.cell(index, offset, axes),
            kind => Err(BackendError::not_implemented("snode", sparse_operation(kind))),
        }
    }
}

fn sparse_operation(kind: &SNodeKind) -> &'static str {
    match kind {
        SNodeKind::Pointer { .. } => "pointer snode layout",
        SNodeKind::Bitmasked { .. } => "bitmasked snode layout",
        _ => "dynamic snode layout",
    }
}

impl SNodeTree {
    /// Node indices in the subtree under `index`, excluding `index`.
    fn descendants(&self, index: u32) -> Vec<u32> {
        let mut out = Vec::new();
        let mut stack = self.nodes()[index as usize].children.clone();
        while let Some(n) = stack.pop() {
            out.push(n);
            stack.extend_from_slice(&self.nodes()[n as usize].children);
        }
        out
    }
}

/// Compute the dense layout of a tree. Sparse kinds are not supported.
pub fn compute_layout(tree: &SNodeTree) -> Result<TreeLayout> {
    let mut walker = Walker {
        tree,
        fields: BTreeMap::new(),
    };
    let size = walker.node(0, 0, &[])?;
    Ok(TreeLayout {
        tree: tree.id,
        size,
        fields: walker.fields,
    })
}
