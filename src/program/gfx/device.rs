//! Device acquisition, capability query and buffer helpers.

use std::sync::Arc;

use crate::error::{BackendError, Result};
use crate::runtime::DeviceCaps;

/// A wgpu device with the capabilities queried when it was created.
pub struct GfxDevice {
    pub device: Arc<wgpu::Device>,
    pub queue: wgpu::Queue,
    pub caps: DeviceCaps,
    pub adapter_name: String,
}

/// Try to create a wgpu device and queue.
/// Returns None if no GPU adapter is available.
pub fn try_create_device() -> Option<GfxDevice> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }))?;
    let (device, queue) = pollster::block_on(adapter.request_device(
        &wgpu::DeviceDescriptor {
            label: Some("weft-gfx"),
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
            memory_hints: wgpu::MemoryHints::Performance,
        },
        None,
    ))
    .ok()?;
    let caps = caps_from_limits(&device.limits());
    Some(GfxDevice {
        device: Arc::new(device),
        queue,
        caps,
        adapter_name: adapter.get_info().name,
    })
}

/// wgpu exposes no device addresses, so ndarrays are always bound by slot.
pub fn caps_from_limits(limits: &wgpu::Limits) -> DeviceCaps {
    DeviceCaps {
        raw_device_pointers: false,
        max_storage_buffers_per_stage: limits.max_storage_buffers_per_shader_stage,
        max_workgroups_per_dimension: limits.max_compute_workgroups_per_dimension,
        max_storage_buffer_binding_size: limits.max_storage_buffer_binding_size as u64,
    }
}

impl GfxDevice {
    pub fn new() -> Result<Self> {
        try_create_device().ok_or(BackendError::NoAdapter)
    }

    pub fn storage_buffer(&self, label: &str, size: u64) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: padded_size(size),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    /// Copy `len` bytes of `buffer` at `offset` back to the host. Blocks.
    ///
    /// `offset` and `len` must be multiples of 4.
    pub fn read_buffer(&self, buffer: &wgpu::Buffer, offset: u64, len: u64) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("weft_readback"),
            size: len,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("weft_readback_encoder"),
            });
        encoder.copy_buffer_to_buffer(buffer, offset, &staging, 0, len);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| BackendError::Device("readback channel closed".to_string()))?
            .map_err(|e| BackendError::Device(format!("readback failed: {}", e)))?;

        let bytes = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(bytes)
    }
}

/// Buffers are never empty and always a multiple of 4 bytes.
pub fn padded_size(size: u64) -> u64 {
    size.max(4).div_ceil(4) * 4
}

/// Check a host transfer against a buffer of `size` bytes.
pub fn check_transfer(size: u64, offset: u64, len: u64) -> Result<()> {
    if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 || len % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
        return Err(BackendError::Transfer(format!(
            "offset {} and length {} must be multiples of {}",
            offset,
            len,
            wgpu::COPY_BUFFER_ALIGNMENT
        )));
    }
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(BackendError::Transfer(format!(
            "range {}..{} outside allocation of {} bytes",
            offset,
            offset.saturating_add(len),
            size
        ))),
    }
}
