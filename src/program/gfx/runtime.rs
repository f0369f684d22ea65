//! Kernel compiler and launcher for the GPU backend, plus the
//! allocations kernels bind.
//!
//! Compiling lowers a kernel to one WGSL module with an entry point per
//! task and builds a pipeline per entry point against an explicit bind
//! group layout. Launching uploads the marshalled arguments, binds every
//! buffer the kernel touches and records one compute pass per task into
//! the caller's encoder. Nothing is submitted here.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use wgpu::util::DeviceExt;

use super::device::GfxDevice;
use super::snode_tree::SNodeTreeManager;
use crate::config::CompileConfig;
use crate::error::{BackendError, Result};
use crate::ir::offload::{offload, OffloadedKernel, TaskKind};
use crate::ir::{Fingerprint, Kernel};
use crate::lower::{bindings, Binding, KernelLowering, WgslLowering, RANGE_WORKGROUP_SIZE};
use crate::runtime::{
    check_args, pack_arguments, AllocationId, AllocationKind, ArgValue, ArgumentLayout,
    DataLayout, DeviceAllocation, ImageParams, LaunchContext, TexelFormat, MAX_RETURNS,
};
use crate::snode::Layouts;

// ─── Allocations ───────────────────────────────────────────────────

enum Storage {
    Buffer(wgpu::Buffer),
    Texture(wgpu::Texture),
}

struct GfxAllocation {
    size: u64,
    storage: Storage,
}

/// Ndarrays and textures owned by one backend instance.
#[derive(Default)]
pub struct GfxAllocations {
    next_id: u64,
    entries: BTreeMap<AllocationId, GfxAllocation>,
    /// Referenced by work launched since the last synchronize.
    in_flight: BTreeSet<AllocationId>,
}

fn texture_format(format: TexelFormat) -> wgpu::TextureFormat {
    match format {
        TexelFormat::R32Float => wgpu::TextureFormat::R32Float,
        TexelFormat::R32Uint => wgpu::TextureFormat::R32Uint,
        TexelFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TexelFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
    }
}

impl GfxAllocations {
    fn insert(&mut self, size: u64, storage: Storage, kind: AllocationKind) -> DeviceAllocation {
        self.next_id += 1;
        let id = AllocationId(self.next_id);
        self.entries.insert(id, GfxAllocation { size, storage });
        DeviceAllocation { id, size, kind }
    }

    pub fn allocate_buffer(&mut self, device: &GfxDevice, size: u64) -> Result<DeviceAllocation> {
        if size > device.caps.max_storage_buffer_binding_size {
            return Err(BackendError::Transfer(format!(
                "{} bytes exceed the device binding limit of {}",
                size, device.caps.max_storage_buffer_binding_size
            )));
        }
        let buffer = device.storage_buffer("weft_ndarray", size);
        Ok(self.insert(size, Storage::Buffer(buffer), AllocationKind::Buffer))
    }

    pub fn allocate_texture(
        &mut self,
        device: &GfxDevice,
        params: &ImageParams,
    ) -> Result<DeviceAllocation> {
        if params.width == 0 || params.height == 0 {
            return Err(BackendError::Transfer(format!(
                "texture extent {}x{} is empty",
                params.width, params.height
            )));
        }
        let depth = params.depth.max(1);
        let texture = device.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("weft_texture"),
            size: wgpu::Extent3d {
                width: params.width,
                height: params.height,
                depth_or_array_layers: depth,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: if depth > 1 {
                wgpu::TextureDimension::D3
            } else {
                wgpu::TextureDimension::D2
            },
            format: texture_format(params.format),
            usage: wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        Ok(self.insert(
            params.size_bytes(),
            Storage::Texture(texture),
            AllocationKind::Texture,
        ))
    }

    /// The buffer and size behind an ndarray allocation.
    pub fn buffer(&self, id: AllocationId) -> Result<(&wgpu::Buffer, u64)> {
        match self.entries.get(&id) {
            Some(GfxAllocation {
                size,
                storage: Storage::Buffer(buffer),
            }) => Ok((buffer, *size)),
            Some(_) => Err(BackendError::not_implemented("gfx", "texture transfer")),
            None => Err(BackendError::UnknownAllocation(id.0)),
        }
    }

    pub fn used_in_kernel(&self, id: AllocationId) -> bool {
        self.in_flight.contains(&id)
    }

    pub fn mark_in_flight(&mut self, ids: impl IntoIterator<Item = AllocationId>) {
        self.in_flight.extend(ids);
    }

    /// Everything submitted so far has completed.
    pub fn retire(&mut self) {
        self.in_flight.clear();
    }

    pub fn release(&mut self, id: AllocationId) -> Result<()> {
        if self.in_flight.contains(&id) {
            return Err(BackendError::DeviceAllocationInUse(id.0));
        }
        let alloc = self
            .entries
            .remove(&id)
            .ok_or(BackendError::UnknownAllocation(id.0))?;
        match alloc.storage {
            Storage::Buffer(buffer) => buffer.destroy(),
            Storage::Texture(texture) => texture.destroy(),
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.in_flight.clear();
        let ids: Vec<AllocationId> = self.entries.keys().copied().collect();
        for id in ids {
            let _ = self.release(id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─── Compiled kernels ──────────────────────────────────────────────

pub struct GfxKernel {
    pub fingerprint: Fingerprint,
    pub offloaded: OffloadedKernel,
    pub args: ArgumentLayout,
    pub bindings: Vec<Binding>,
    pub source: String,
    bind_group_layout: wgpu::BindGroupLayout,
    pipelines: Vec<wgpu::ComputePipeline>,
}

/// Workgroup counts for `iterations` invocations of a range task, split
/// into two dimensions when one would exceed `max_per_dim`.
pub fn dispatch_dims(iterations: u32, max_per_dim: u32) -> Result<Option<(u32, u32)>> {
    if iterations == 0 {
        return Ok(None);
    }
    let groups = iterations.div_ceil(RANGE_WORKGROUP_SIZE);
    let max = max_per_dim.max(1);
    if groups <= max {
        return Ok(Some((groups, 1)));
    }
    let y = groups.div_ceil(max);
    if y > max {
        return Err(BackendError::Device(format!(
            "{} iterations exceed the dispatch limit",
            iterations
        )));
    }
    Ok(Some((max, y)))
}

/// Compiled kernels plus the buffers every kernel shares.
pub struct GfxRuntime {
    kernels: HashMap<String, GfxKernel>,
    rets: wgpu::Buffer,
    gtmp: wgpu::Buffer,
    gtmp_bytes: usize,
}

/// What a recorded launch left for the caller to finish.
pub struct Recorded {
    pub returns: usize,
    pub ndarrays: Vec<AllocationId>,
}

impl GfxRuntime {
    pub fn new(device: &GfxDevice, gtmp_bytes: usize) -> Self {
        tracing::debug!(gtmp_bytes, "creating gfx kernel runtime");
        Self {
            kernels: HashMap::new(),
            rets: device.storage_buffer("weft_rets", (MAX_RETURNS * 4) as u64),
            gtmp: device.storage_buffer("weft_gtmp", gtmp_bytes as u64),
            gtmp_bytes,
        }
    }

    pub fn kernel(&self, name: &str) -> Result<&GfxKernel> {
        self.kernels
            .get(name)
            .ok_or_else(|| BackendError::UnknownKernel(name.to_string()))
    }

    pub fn gtmp_bytes(&self) -> usize {
        self.gtmp_bytes
    }

    pub fn rets(&self) -> &wgpu::Buffer {
        &self.rets
    }

    /// Compile `kernel` unless an identical one is already registered.
    pub fn compile(
        &mut self,
        device: &GfxDevice,
        config: &CompileConfig,
        kernel: &Kernel,
        layouts: &Layouts,
    ) -> Result<Fingerprint> {
        let fingerprint = kernel.fingerprint();
        if let Some(existing) = self.kernels.get(&kernel.name) {
            if existing.fingerprint != fingerprint {
                return Err(BackendError::DuplicateKernel(kernel.name.clone()));
            }
            return Ok(fingerprint);
        }

        let offloaded = offload(kernel, layouts, self.gtmp_bytes)?;
        let args = pack_arguments(&offloaded.params, &DataLayout::for_arguments(&device.caps));
        let bindings = bindings(&offloaded);
        if bindings.len() > device.caps.max_storage_buffers_per_stage as usize {
            return Err(BackendError::invalid_kernel(
                &kernel.name,
                format!(
                    "needs {} storage bindings, device allows {}",
                    bindings.len(),
                    device.caps.max_storage_buffers_per_stage
                ),
            ));
        }
        let source = WgslLowering::new().lower(&offloaded, &args);
        if config.print_kernel_source {
            tracing::info!(kernel = %kernel.name, "generated WGSL:\n{}", source);
        }

        let dev = &device.device;
        dev.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = dev.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&kernel.name),
            source: wgpu::ShaderSource::Wgsl(source.as_str().into()),
        });
        let entries: Vec<wgpu::BindGroupLayoutEntry> = bindings
            .iter()
            .enumerate()
            .map(|(i, b)| wgpu::BindGroupLayoutEntry {
                binding: i as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage {
                        read_only: b.read_only(),
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        let bind_group_layout = dev.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(&kernel.name),
            entries: &entries,
        });
        let pipeline_layout = dev.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&kernel.name),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let pipelines = (0..offloaded.tasks.len())
            .map(|i| {
                let entry_point = format!("task_{}", i);
                dev.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(&entry_point),
                    layout: Some(&pipeline_layout),
                    module: &module,
                    entry_point: Some(&entry_point),
                    compilation_options: Default::default(),
                    cache: None,
                })
            })
            .collect();
        if let Some(error) = pollster::block_on(dev.pop_error_scope()) {
            return Err(BackendError::invalid_kernel(
                &kernel.name,
                format!("shader rejected by the device: {}", error),
            ));
        }

        tracing::debug!(
            kernel = %kernel.name,
            tasks = offloaded.tasks.len(),
            bindings = bindings.len(),
            "compiled gfx kernel"
        );
        self.kernels.insert(
            kernel.name.clone(),
            GfxKernel {
                fingerprint,
                offloaded,
                args,
                bindings,
                source,
                bind_group_layout,
                pipelines,
            },
        );
        Ok(fingerprint)
    }

    /// Record one launch of `name` into `encoder`.
    pub fn record(
        &self,
        device: &GfxDevice,
        encoder: &mut wgpu::CommandEncoder,
        trees: &SNodeTreeManager,
        allocations: &GfxAllocations,
        name: &str,
        ctx: &LaunchContext,
    ) -> Result<Recorded> {
        let kernel = self.kernel(name)?;
        let args = ctx.args();
        check_args(name, &kernel.offloaded.params, args)?;

        let mut dims = Vec::with_capacity(kernel.offloaded.tasks.len());
        for task in &kernel.offloaded.tasks {
            dims.push(match &task.kind {
                TaskKind::Serial => Some((1, 1)),
                TaskKind::Range(range) => dispatch_dims(
                    range.iterations(|i| ctx.scalar_i32(i))?,
                    device.caps.max_workgroups_per_dimension,
                )?,
            });
        }

        let mut bytes = kernel.args.marshal_scalars(args)?;
        if bytes.is_empty() {
            bytes = vec![0; 4];
        }
        let args_buffer = device
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("weft_args"),
                contents: &bytes,
                usage: wgpu::BufferUsages::STORAGE,
            });

        let mut ndarrays = Vec::new();
        // Ndarrays bind exactly their whole elements so `arrayLength` in the
        // shader is the element count the bounds checks compare against.
        let mut buffers: Vec<(&wgpu::Buffer, Option<wgpu::BufferSize>)> =
            Vec::with_capacity(kernel.bindings.len());
        for binding in &kernel.bindings {
            let buffer = match binding {
                Binding::Args => (&args_buffer, None),
                Binding::Rets => (&self.rets, None),
                Binding::Gtmp => (&self.gtmp, None),
                Binding::Root(tree) => (trees.buffer(*tree)?, None),
                Binding::NdArray(arg) => match args.get(*arg as usize) {
                    Some(ArgValue::NdArray(alloc)) => {
                        ndarrays.push(alloc.id);
                        let (buffer, size) = allocations.buffer(alloc.id)?;
                        (buffer, wgpu::BufferSize::new((size / 4).max(1) * 4))
                    }
                    _ => {
                        return Err(BackendError::argument_mismatch(
                            name,
                            format!("argument {} is not an ndarray", arg),
                        ))
                    }
                },
            };
            buffers.push(buffer);
        }
        let entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .enumerate()
            .map(|(i, (buffer, size))| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: *buffer,
                    offset: 0,
                    size: *size,
                }),
            })
            .collect();
        let bind_group = device.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(name),
            layout: &kernel.bind_group_layout,
            entries: &entries,
        });

        let returns = kernel.offloaded.returns.len();
        if returns > 0 {
            encoder.clear_buffer(&self.rets, 0, None);
        }
        for (pipeline, dims) in kernel.pipelines.iter().zip(&dims) {
            let Some((x, y)) = *dims else {
                continue;
            };
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(name),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(x, y, 1);
        }
        Ok(Recorded { returns, ndarrays })
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}
