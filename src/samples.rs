//! Bundled sample kernels.
//!
//! One dense tree of `SAMPLE_LEN` floats and three kernels over it: a
//! parallel fill, a serial reduction with a return value, and a parallel
//! scale of an ndarray. The CLI and the integration tests run them on
//! every backend.

use crate::error::Result;
use crate::ir::{DataType, Expr, Kernel, KernelBuilder};
use crate::program::Program;
use crate::snode::{SNodeId, SNodeTree, SNodeTreeBuilder, TreeId};

pub const SAMPLE_LEN: u32 = 1024;

pub struct Samples {
    pub tree: SNodeTree,
    pub x: SNodeId,
    pub fill: Kernel,
    pub sum: Kernel,
    pub scale: Kernel,
}

impl Samples {
    pub fn new() -> Result<Self> {
        let mut b = SNodeTreeBuilder::new(TreeId(0));
        let root = b.root();
        let dense = b.dense(root, &[SAMPLE_LEN]);
        let x = b.place(dense, DataType::F32, "x");
        let tree = b.build()?;
        Ok(Self {
            tree,
            x,
            fill: fill(x),
            sum: sum(x),
            scale: scale(),
        })
    }

    pub fn kernels(&self) -> [&Kernel; 3] {
        [&self.fill, &self.sum, &self.scale]
    }
}

/// `fill(n, value)`: `x[i] = value` for `i < n`.
pub fn fill(x: SNodeId) -> Kernel {
    let mut k = KernelBuilder::new("fill");
    let n = k.scalar_arg(DataType::I32);
    let value = k.scalar_arg(DataType::F32);
    k.for_range("i", 0.into(), n, |k, i| k.store(x, vec![i], value.clone()));
    k.build()
}

/// `sum(n) -> f32`: sequential sum of the first `n` cells.
pub fn sum(x: SNodeId) -> Kernel {
    let mut k = KernelBuilder::new("sum");
    let n = k.scalar_arg(DataType::I32);
    let slot = k.return_slot(DataType::F32);
    let acc = k.declare("acc", 0.0f32.into());
    k.serial_range("i", 0.into(), n, |k, i| {
        k.assign("acc", acc.clone() + Expr::load(x, vec![i]));
    });
    k.ret(slot, acc);
    k.build()
}

/// `scale(arr, n, k)`: `arr[i] *= k` for `i < n`.
pub fn scale() -> Kernel {
    let mut k = KernelBuilder::new("scale");
    let arr = k.ndarray_arg(DataType::F32);
    let n = k.scalar_arg(DataType::I32);
    let factor = k.scalar_arg(DataType::F32);
    k.for_range("i", 0.into(), n, |k, i| {
        k.nd_store(arr, i.clone(), Expr::nd_load(arr, i) * factor.clone());
    });
    k.build()
}

/// What `run` observed.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleReport {
    pub n: u32,
    pub sum: f32,
    pub scaled: Vec<f32>,
}

/// Materialize the sample tree on `program` and run every sample kernel
/// over the first `n` cells.
pub fn run(program: &mut Program, samples: &Samples, n: u32) -> Result<SampleReport> {
    let n = n.min(SAMPLE_LEN);
    program.add_snode_tree(&samples.tree)?;

    let fill = program.compile(&samples.fill)?;
    fill.launch(&program.launch_context().arg(n as i32).arg(0.25f32))?;
    let sum = program.compile(&samples.sum)?;
    sum.launch(&program.launch_context().arg(n as i32))?;
    let total = program.fetch_result::<f32>(0).unwrap_or_default();

    let input: Vec<f32> = (0..n).map(|i| i as f32).collect();
    let alloc = program.allocate_ndarray(n.max(1) as usize)?;
    if n > 0 {
        program.write_ndarray(&alloc, &input)?;
    }
    let scale = program.compile(&samples.scale)?;
    scale.launch(
        &program
            .launch_context()
            .ndarray(&alloc)
            .arg(n as i32)
            .arg(2.0f32),
    )?;
    program.synchronize()?;
    let mut scaled: Vec<f32> = program.read_ndarray(&alloc)?;
    scaled.truncate(n as usize);
    program.release(&alloc)?;

    tracing::debug!(n, sum = total, "samples finished");
    Ok(SampleReport {
        n,
        sum: total,
        scaled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Arch;
    use crate::ir::offload::{offload, TaskKind};
    use crate::snode::compute_layout;

    #[test]
    fn test_sample_kernels_offload() {
        let samples = Samples::new().unwrap();
        let mut layouts = crate::snode::Layouts::new();
        layouts.insert(TreeId(0), compute_layout(&samples.tree).unwrap());

        let fill = offload(&samples.fill, &layouts, 64).unwrap();
        assert_eq!(fill.tasks.len(), 1);
        assert!(matches!(fill.tasks[0].kind, TaskKind::Range(_)));

        let sum = offload(&samples.sum, &layouts, 64).unwrap();
        assert!(sum
            .tasks
            .iter()
            .all(|t| matches!(t.kind, TaskKind::Serial)));
        assert_eq!(sum.gtmp_size, 4);

        let scale = offload(&samples.scale, &layouts, 64).unwrap();
        assert_eq!(scale.ndarrays(), vec![0]);
        assert!(scale.trees.is_empty());
    }

    #[test]
    fn test_sample_layout() {
        let samples = Samples::new().unwrap();
        let layout = compute_layout(&samples.tree).unwrap();
        assert_eq!(layout.size, SAMPLE_LEN as usize * 4);
        assert_eq!(layout.field(samples.x).unwrap().offset, 0);
        assert_eq!(samples.kernels().map(|k| k.name.as_str()), ["fill", "sum", "scale"]);
        assert_eq!(Arch::all().len(), 2);
    }
}
