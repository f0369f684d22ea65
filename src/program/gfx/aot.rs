//! Ahead-of-time kernel modules for the GPU backend.
//!
//! A module captures everything a loader needs to run kernels without the
//! compiler: tree layouts, WGSL per kernel, bind group order, argument
//! offsets and host-evaluable range bounds. Modules serialize with rkyv
//! behind an 8-byte magic header.

use std::collections::BTreeMap;
use std::path::Path;

use rayon::prelude::*;
use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{BackendError, Result};
use crate::ir::offload::{offload, BoundOp, TaskKind};
use crate::ir::{DataType, Kernel};
use crate::lower::{bindings, Binding, KernelLowering, WgslLowering, RANGE_WORKGROUP_SIZE};
use crate::program::AotModuleBuilder;
use crate::runtime::{pack_arguments, DataLayout, DeviceCaps};
use crate::snode::{compute_layout, Layouts, SNodeTree, TreeId, TreeLayout};

pub const AOT_MAGIC: &[u8; 8] = b"WEFTAOT1";
pub const AOT_FORMAT_VERSION: u32 = 1;

#[derive(Archive, Serialize, Deserialize, Clone, Debug)]
#[rkyv(derive(Debug))]
pub struct AotRange {
    pub begin: Vec<BoundOp>,
    pub end: Vec<BoundOp>,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug)]
#[rkyv(derive(Debug))]
pub struct AotTask {
    pub entry_point: String,
    pub workgroup_size: u32,
    /// Present for range tasks; serial tasks dispatch one invocation.
    pub range: Option<AotRange>,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug)]
#[rkyv(derive(Debug))]
pub struct AotKernel {
    pub name: String,
    pub symbol: String,
    pub fingerprint: [u8; 32],
    pub source: String,
    pub tasks: Vec<AotTask>,
    pub bindings: Vec<Binding>,
    pub arg_offsets: Vec<Option<u32>>,
    pub args_size: u32,
    pub returns: Vec<DataType>,
    pub gtmp_size: u32,
}

/// A serialized set of kernels and the trees they were compiled against.
#[derive(Archive, Serialize, Deserialize, Clone, Debug)]
#[rkyv(derive(Debug))]
pub struct AotModule {
    pub format_version: u32,
    pub arch: String,
    pub caps: DeviceCaps,
    pub trees: Vec<TreeLayout>,
    pub kernels: Vec<AotKernel>,
}

impl AotModule {
    pub fn kernel(&self, name: &str) -> Option<&AotKernel> {
        self.kernels.iter().find(|k| k.name == name)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let body = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| BackendError::Aot(format!("serialize: {}", e)))?;
        let mut out = Vec::with_capacity(AOT_MAGIC.len() + body.len());
        out.extend_from_slice(AOT_MAGIC);
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let body = bytes
            .strip_prefix(AOT_MAGIC.as_slice())
            .ok_or_else(|| BackendError::Aot("missing module header".to_string()))?;
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(body.len());
        aligned.extend_from_slice(body);
        let module = rkyv::from_bytes::<AotModule, rkyv::rancor::Error>(&aligned)
            .map_err(|e| BackendError::Aot(format!("deserialize: {}", e)))?;
        if module.format_version != AOT_FORMAT_VERSION {
            return Err(BackendError::Aot(format!(
                "format version {} is not supported (expected {})",
                module.format_version, AOT_FORMAT_VERSION
            )));
        }
        Ok(module)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_bytes(&std::fs::read(path)?)
    }
}

/// Collects trees and kernels, then lowers every kernel in parallel.
pub struct GfxAotModuleBuilder {
    caps: DeviceCaps,
    gtmp_bytes: usize,
    layouts: Layouts,
    kernels: Vec<Kernel>,
}

impl GfxAotModuleBuilder {
    pub fn new(caps: DeviceCaps, gtmp_bytes: usize, layouts: Layouts) -> Self {
        Self {
            caps,
            gtmp_bytes,
            layouts,
            kernels: Vec::new(),
        }
    }

    fn lower_kernel(&self, kernel: &Kernel) -> Result<AotKernel> {
        let offloaded = offload(kernel, &self.layouts, self.gtmp_bytes)?;
        let args = pack_arguments(&offloaded.params, &DataLayout::for_arguments(&self.caps));
        let bindings = bindings(&offloaded);
        if bindings.len() > self.caps.max_storage_buffers_per_stage as usize {
            return Err(BackendError::invalid_kernel(
                &kernel.name,
                format!(
                    "needs {} storage bindings, target allows {}",
                    bindings.len(),
                    self.caps.max_storage_buffers_per_stage
                ),
            ));
        }
        let source = WgslLowering::new().lower(&offloaded, &args);
        let tasks = offloaded
            .tasks
            .iter()
            .enumerate()
            .map(|(i, task)| match &task.kind {
                TaskKind::Serial => AotTask {
                    entry_point: format!("task_{}", i),
                    workgroup_size: 1,
                    range: None,
                },
                TaskKind::Range(range) => AotTask {
                    entry_point: format!("task_{}", i),
                    workgroup_size: RANGE_WORKGROUP_SIZE,
                    range: Some(AotRange {
                        begin: range.begin_program.clone(),
                        end: range.end_program.clone(),
                    }),
                },
            })
            .collect();
        Ok(AotKernel {
            name: offloaded.name.clone(),
            symbol: offloaded.symbol.clone(),
            fingerprint: kernel.fingerprint().0,
            source,
            tasks,
            bindings,
            arg_offsets: args.offsets.iter().map(|o| o.map(|v| v as u32)).collect(),
            args_size: args.size as u32,
            returns: offloaded.returns.clone(),
            gtmp_size: offloaded.gtmp_size as u32,
        })
    }
}

impl AotModuleBuilder for GfxAotModuleBuilder {
    fn add_snode_tree(&mut self, tree: &SNodeTree) -> Result<()> {
        let layout = compute_layout(tree)?;
        if layout.size as u64 > self.caps.max_storage_buffer_binding_size {
            return Err(BackendError::invalid_tree(
                tree.id.0,
                "exceeds the target binding limit",
            ));
        }
        self.layouts.insert(tree.id, layout);
        Ok(())
    }

    fn add_kernel(&mut self, kernel: &Kernel) -> Result<()> {
        if let Some(existing) = self.kernels.iter().find(|k| k.name == kernel.name) {
            if existing.fingerprint() != kernel.fingerprint() {
                return Err(BackendError::DuplicateKernel(kernel.name.clone()));
            }
            return Ok(());
        }
        self.kernels.push(kernel.clone());
        Ok(())
    }

    fn build(self: Box<Self>) -> Result<AotModule> {
        let this = *self;
        let kernels = this
            .kernels
            .par_iter()
            .map(|k| this.lower_kernel(k))
            .collect::<Result<Vec<_>>>()?;
        let trees: BTreeMap<TreeId, TreeLayout> = this.layouts;
        tracing::info!(
            kernels = kernels.len(),
            trees = trees.len(),
            "built gfx AOT module"
        );
        Ok(AotModule {
            format_version: AOT_FORMAT_VERSION,
            arch: "gfx".to_string(),
            caps: this.caps,
            trees: trees.into_values().collect(),
            kernels,
        })
    }
}
