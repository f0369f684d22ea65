//! SNode trees: declarative descriptions of nested field storage.
//!
//! A tree hangs off a `Root`. `Dense` nodes repeat their children over a
//! fixed shape, `Place` nodes hold one scalar. The sparse kinds
//! (`Pointer`, `Bitmasked`, `Dynamic`) can be described but not laid out.

pub mod layout;

pub use layout::{compute_layout, Axis, FieldLayout, Layouts, TreeLayout};

use crate::error::{BackendError, Result};
use crate::ir::DataType;

/// Identifies one SNode tree within a session.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[rkyv(derive(Debug, PartialEq, Eq, PartialOrd, Ord))]
pub struct TreeId(pub u32);

impl std::fmt::Display for TreeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One node of one tree.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct SNodeId {
    pub tree: TreeId,
    pub index: u32,
}

impl std::fmt::Display for SNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}.n{}", self.tree.0, self.index)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SNodeKind {
    Root,
    Dense { shape: Vec<u32> },
    Pointer { shape: Vec<u32> },
    Bitmasked { shape: Vec<u32> },
    Dynamic { capacity: u32 },
    Place { dtype: DataType },
}

impl SNodeKind {
    pub fn is_sparse(&self) -> bool {
        matches!(
            self,
            SNodeKind::Pointer { .. } | SNodeKind::Bitmasked { .. } | SNodeKind::Dynamic { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            SNodeKind::Root => "root",
            SNodeKind::Dense { .. } => "dense",
            SNodeKind::Pointer { .. } => "pointer",
            SNodeKind::Bitmasked { .. } => "bitmasked",
            SNodeKind::Dynamic { .. } => "dynamic",
            SNodeKind::Place { .. } => "place",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SNode {
    pub id: SNodeId,
    pub kind: SNodeKind,
    pub parent: Option<u32>,
    pub children: Vec<u32>,
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SNodeTree {
    pub id: TreeId,
    nodes: Vec<SNode>,
}

impl SNodeTree {
    pub fn root(&self) -> &SNode {
        &self.nodes[0]
    }

    pub fn node(&self, id: SNodeId) -> Option<&SNode> {
        if id.tree != self.id {
            return None;
        }
        self.nodes.get(id.index as usize)
    }

    pub fn nodes(&self) -> &[SNode] {
        &self.nodes
    }

    pub fn places(&self) -> impl Iterator<Item = &SNode> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.kind, SNodeKind::Place { .. }))
    }

    pub fn is_sparse(&self) -> bool {
        self.nodes.iter().any(|n| n.kind.is_sparse())
    }

    /// Find a place by name.
    pub fn field(&self, name: &str) -> Option<SNodeId> {
        self.places()
            .find(|n| n.name.as_deref() == Some(name))
            .map(|n| n.id)
    }
}

/// Incrementally describes a tree. Structural errors are reported by `build`.
pub struct SNodeTreeBuilder {
    id: TreeId,
    nodes: Vec<SNode>,
}

impl SNodeTreeBuilder {
    pub fn new(id: TreeId) -> Self {
        let root = SNode {
            id: SNodeId { tree: id, index: 0 },
            kind: SNodeKind::Root,
            parent: None,
            children: Vec::new(),
            name: None,
        };
        Self {
            id,
            nodes: vec![root],
        }
    }

    pub fn root(&self) -> SNodeId {
        SNodeId {
            tree: self.id,
            index: 0,
        }
    }

    fn add(&mut self, parent: SNodeId, kind: SNodeKind, name: Option<&str>) -> SNodeId {
        let id = SNodeId {
            tree: self.id,
            index: self.nodes.len() as u32,
        };
        if let Some(p) = self.nodes.get_mut(parent.index as usize) {
            p.children.push(id.index);
        }
        self.nodes.push(SNode {
            id,
            kind,
            parent: Some(parent.index),
            children: Vec::new(),
            name: name.map(str::to_string),
        });
        id
    }

    pub fn dense(&mut self, parent: SNodeId, shape: &[u32]) -> SNodeId {
        self.add(
            parent,
            SNodeKind::Dense {
                shape: shape.to_vec(),
            },
            None,
        )
    }

    pub fn pointer(&mut self, parent: SNodeId, shape: &[u32]) -> SNodeId {
        self.add(
            parent,
            SNodeKind::Pointer {
                shape: shape.to_vec(),
            },
            None,
        )
    }

    pub fn bitmasked(&mut self, parent: SNodeId, shape: &[u32]) -> SNodeId {
        self.add(
            parent,
            SNodeKind::Bitmasked {
                shape: shape.to_vec(),
            },
            None,
        )
    }

    pub fn dynamic(&mut self, parent: SNodeId, capacity: u32) -> SNodeId {
        self.add(parent, SNodeKind::Dynamic { capacity }, None)
    }

    pub fn place(&mut self, parent: SNodeId, dtype: DataType, name: &str) -> SNodeId {
        self.add(parent, SNodeKind::Place { dtype }, Some(name))
    }

    pub fn build(self) -> Result<SNodeTree> {
        let tree = self.id.0;
        for node in &self.nodes {
            if let Some(parent) = node.parent {
                let parent = self
                    .nodes
                    .get(parent as usize)
                    .filter(|p| p.id.tree == self.id)
                    .ok_or_else(|| {
                        BackendError::invalid_tree(tree, format!("{} has no valid parent", node.id))
                    })?;
                if matches!(parent.kind, SNodeKind::Place { .. }) {
                    return Err(BackendError::invalid_tree(
                        tree,
                        format!("{} is placed under leaf {}", node.id, parent.id),
                    ));
                }
            }
            match &node.kind {
                SNodeKind::Dense { shape }
                | SNodeKind::Pointer { shape }
                | SNodeKind::Bitmasked { shape } => {
                    if shape.is_empty() || shape.contains(&0) {
                        return Err(BackendError::invalid_tree(
                            tree,
                            format!("{} has empty shape {:?}", node.id, shape),
                        ));
                    }
                }
                SNodeKind::Dynamic { capacity: 0 } => {
                    return Err(BackendError::invalid_tree(
                        tree,
                        format!("{} has zero capacity", node.id),
                    ));
                }
                _ => {}
            }
        }
        let mut names = std::collections::BTreeSet::new();
        for name in self.nodes.iter().filter_map(|n| n.name.as_deref()) {
            if !names.insert(name) {
                return Err(BackendError::invalid_tree(
                    tree,
                    format!("duplicate field name '{}'", name),
                ));
            }
        }
        Ok(SNodeTree {
            id: self.id,
            nodes: self.nodes,
        })
    }
}
