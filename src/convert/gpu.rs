//! WebGPU compute backend
//!
//! The kernel, pipeline, bind group and every device buffer are created once
//! for a fixed frame size. Per frame the converter uploads RGB, clears the
//! output, dispatches, copies into a mappable buffer and waits for readback.

use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, instrument};
use wgpu::util::DeviceExt;
use wgpu::*;

use super::{ColorConvert, ConvertedBuffer, PlanarLayout};
use crate::{ConversionError, InitializationError};

const KERNEL: &str = include_str!("rgb_to_nv12.wgsl");
const WORKGROUP: u32 = 8;

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct Params {
    width: u32,
    height: u32,
    uv_width: u32,
    uv_height: u32,
}

pub struct WgpuConverter {
    layout: PlanarLayout,
    device: Device,
    queue: Queue,
    pipeline: ComputePipeline,
    bind_group: BindGroup,
    rgb_buffer: Buffer,
    nv12_buffer: Buffer,
    readback: Buffer,
    nv12_padded: u64,
    workgroups: (u32, u32),
}

impl WgpuConverter {
    #[instrument(skip(backends))]
    pub fn new(layout: PlanarLayout, backends: Backends) -> Result<Self, InitializationError> {
        info!("Initializing WebGPU colour converter");

        let instance = Instance::new(InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&RequestAdapterOptions {
            power_preference: PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or(InitializationError::NoAdapter)?;

        let info = adapter.get_info();
        info!("GPU: {} ({:?})", info.name, info.backend);

        let (device, queue) = pollster::block_on(adapter.request_device(
            &DeviceDescriptor {
                label: Some("camerad convert device"),
                required_features: Features::empty(),
                required_limits: adapter.limits(),
                memory_hints: MemoryHints::Performance,
            },
            None,
        ))?;

        let workgroups = (
            layout.uv_width().div_ceil(WORKGROUP),
            layout.uv_height().div_ceil(WORKGROUP),
        );
        let limits = device.limits();
        let rgb_padded = align(layout.rgb_len() as u64);
        let nv12_padded = align(layout.nv12_len() as u64);
        if workgroups.0 > limits.max_compute_workgroups_per_dimension
            || workgroups.1 > limits.max_compute_workgroups_per_dimension
            || rgb_padded > limits.max_storage_buffer_binding_size as u64
        {
            return Err(InitializationError::Allocation(format!(
                "{}x{} exceeds device compute limits",
                layout.width, layout.height
            )));
        }

        device.push_error_scope(ErrorFilter::OutOfMemory);
        device.push_error_scope(ErrorFilter::Validation);

        let shader = device.create_shader_module(ShaderModuleDescriptor {
            label: Some("rgb_to_nv12"),
            source: ShaderSource::Wgsl(KERNEL.into()),
        });
        let pipeline = create_pipeline(&device, &shader);

        let params = Params {
            width: layout.width,
            height: layout.height,
            uv_width: layout.uv_width(),
            uv_height: layout.uv_height(),
        };
        let params_buffer = device.create_buffer_init(&util::BufferInitDescriptor {
            label: Some("nv12 params"),
            contents: bytemuck::bytes_of(&params),
            usage: BufferUsages::UNIFORM,
        });
        let rgb_buffer = device.create_buffer(&BufferDescriptor {
            label: Some("rgb input"),
            size: rgb_padded,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let nv12_buffer = device.create_buffer(&BufferDescriptor {
            label: Some("nv12 output"),
            size: nv12_padded,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let readback = device.create_buffer(&BufferDescriptor {
            label: Some("nv12 readback"),
            size: nv12_padded,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_group = device.create_bind_group(&BindGroupDescriptor {
            label: Some("nv12 bind group"),
            layout: &pipeline.get_bind_group_layout(0),
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: params_buffer.as_entire_binding(),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: rgb_buffer.as_entire_binding(),
                },
                BindGroupEntry {
                    binding: 2,
                    resource: nv12_buffer.as_entire_binding(),
                },
            ],
        });

        if let Some(e) = pollster::block_on(device.pop_error_scope()) {
            return Err(InitializationError::Kernel(e.to_string()));
        }
        if let Some(e) = pollster::block_on(device.pop_error_scope()) {
            return Err(InitializationError::Allocation(e.to_string()));
        }

        info!(
            "Kernel ready for {}x{}, dispatch {}x{} workgroups",
            layout.width, layout.height, workgroups.0, workgroups.1
        );

        Ok(Self {
            layout,
            device,
            queue,
            pipeline,
            bind_group,
            rgb_buffer,
            nv12_buffer,
            readback,
            nv12_padded,
            workgroups,
        })
    }

    /// Stage the frame; the tail is zero-padded to the copy alignment
    fn upload(&self, rgb: &[u8]) {
        let aligned = rgb.len() - rgb.len() % COPY_BUFFER_ALIGNMENT as usize;
        if aligned > 0 {
            self.queue.write_buffer(&self.rgb_buffer, 0, &rgb[..aligned]);
        }
        if aligned < rgb.len() {
            let mut tail = [0u8; COPY_BUFFER_ALIGNMENT as usize];
            tail[..rgb.len() - aligned].copy_from_slice(&rgb[aligned..]);
            self.queue
                .write_buffer(&self.rgb_buffer, aligned as BufferAddress, &tail);
        }
    }

    fn read_back(&self) -> Result<Bytes, ConversionError> {
        let slice = self.readback.slice(..);
        let (tx, rx) = flume::bounded(1);
        slice.map_async(MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(Maintain::Wait);

        match rx.try_recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ConversionError::Readback(e.to_string())),
            Err(_) => {
                return Err(ConversionError::Readback(
                    "map callback did not fire after device wait".into(),
                ))
            }
        }

        let data = {
            let view = slice.get_mapped_range();
            Bytes::copy_from_slice(&view[..self.layout.nv12_len()])
        };
        self.readback.unmap();
        Ok(data)
    }
}

impl ColorConvert for WgpuConverter {
    fn layout(&self) -> PlanarLayout {
        self.layout
    }

    #[instrument(skip_all, level = "debug")]
    fn convert(&mut self, rgb: &[u8]) -> Result<ConvertedBuffer, ConversionError> {
        self.layout.check_input(rgb)?;
        let start = Instant::now();

        self.device.push_error_scope(ErrorFilter::OutOfMemory);
        self.device.push_error_scope(ErrorFilter::Validation);

        self.upload(rgb);
        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("nv12 encoder"),
            });
        encoder.clear_buffer(&self.nv12_buffer, 0, None);
        {
            let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
                label: Some("nv12 pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &self.bind_group, &[]);
            pass.dispatch_workgroups(self.workgroups.0, self.workgroups.1, 1);
        }
        encoder.copy_buffer_to_buffer(&self.nv12_buffer, 0, &self.readback, 0, self.nv12_padded);
        self.queue.submit(Some(encoder.finish()));

        // Pop both scopes before bailing so the stack stays balanced
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        if let Some(e) = validation.or(out_of_memory) {
            return Err(scope_error(e));
        }

        let data = self.read_back()?;
        debug!("GPU conversion took {:?}", start.elapsed());
        Ok(ConvertedBuffer {
            data,
            layout: self.layout,
        })
    }
}

fn scope_error(e: Error) -> ConversionError {
    match e {
        Error::OutOfMemory { .. } => {
            ConversionError::Dispatch(format!("out of device memory: {e}"))
        }
        other => ConversionError::Dispatch(other.to_string()),
    }
}

fn align(len: u64) -> u64 {
    len.div_ceil(COPY_BUFFER_ALIGNMENT) * COPY_BUFFER_ALIGNMENT
}

fn create_pipeline(device: &Device, shader: &ShaderModule) -> ComputePipeline {
    let storage = |binding, read_only| BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::COMPUTE,
        ty: BindingType::Buffer {
            ty: BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    };

    let bind_group_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
        label: Some("nv12 bind group layout"),
        entries: &[
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStages::COMPUTE,
                ty: BindingType::Buffer {
                    ty: BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
            storage(1, true),
            storage(2, false),
        ],
    });

    let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
        label: Some("nv12 pipeline layout"),
        bind_group_layouts: &[&bind_group_layout],
        push_constant_ranges: &[],
    });

    device.create_compute_pipeline(&ComputePipelineDescriptor {
        label: Some("nv12 pipeline"),
        layout: Some(&pipeline_layout),
        module: shader,
        entry_point: Some("rgb_to_nv12"),
        compilation_options: Default::default(),
        cache: None,
    })
}
