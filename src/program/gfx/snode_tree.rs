//! Device storage for materialized SNode trees.

use std::collections::BTreeMap;

use super::device::GfxDevice;
use crate::error::{BackendError, Result};
use crate::snode::{compute_layout, Layouts, SNodeTree, TreeId, TreeLayout};

pub struct TreeAllocation {
    pub layout: TreeLayout,
    pub buffer: wgpu::Buffer,
}

/// Owns one storage buffer per materialized tree.
#[derive(Default)]
pub struct SNodeTreeManager {
    trees: BTreeMap<TreeId, TreeAllocation>,
}

impl SNodeTreeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lay out `tree` and allocate its zero-initialized buffer.
    pub fn materialize(&mut self, device: &GfxDevice, tree: &SNodeTree) -> Result<&TreeLayout> {
        if self.trees.contains_key(&tree.id) {
            return Err(BackendError::invalid_tree(tree.id.0, "already materialized"));
        }
        let layout = compute_layout(tree)?;
        if layout.size as u64 > device.caps.max_storage_buffer_binding_size {
            return Err(BackendError::invalid_tree(
                tree.id.0,
                format!(
                    "{} bytes exceed the device binding limit of {}",
                    layout.size, device.caps.max_storage_buffer_binding_size
                ),
            ));
        }
        let buffer = device.storage_buffer(&format!("weft_root_{}", tree.id.0), layout.size as u64);
        tracing::debug!(tree = tree.id.0, size = layout.size, "allocated tree buffer");
        let entry = self
            .trees
            .entry(tree.id)
            .or_insert(TreeAllocation { layout, buffer });
        Ok(&entry.layout)
    }

    /// Free a tree's storage. Queued work must not reference it.
    pub fn destroy(&mut self, tree: TreeId) -> Result<()> {
        let alloc = self
            .trees
            .remove(&tree)
            .ok_or(BackendError::UnknownTree(tree.0))?;
        alloc.buffer.destroy();
        Ok(())
    }

    pub fn get(&self, tree: TreeId) -> Option<&TreeAllocation> {
        self.trees.get(&tree)
    }

    pub fn buffer(&self, tree: TreeId) -> Result<&wgpu::Buffer> {
        self.trees
            .get(&tree)
            .map(|t| &t.buffer)
            .ok_or(BackendError::UnknownTree(tree.0))
    }

    pub fn layouts(&self) -> Layouts {
        self.trees
            .iter()
            .map(|(id, t)| (*id, t.layout.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    pub fn clear(&mut self) {
        for (_, t) in std::mem::take(&mut self.trees) {
            t.buffer.destroy();
        }
    }
}
