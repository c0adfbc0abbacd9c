//! Host storage with matrix multiplies offloaded to a WGSL compute shader.
//!
//! Memory lives in host buffers exactly as for [`BufferBackend`]. Each
//! `f32` matmul copies its operands into device buffers, runs
//! `kernel/matmul.wgsl` and maps the result back inside the queued kernel.

use super::{Backend, BufferBackend, BufferPtr, MatmulProvider, MemoryProvider, ReduceProvider};
use crate::error::{Error, ErrorKind};
use crate::matmul::{self, BatchFormat, MatmulParams};
use crate::mem::{BufferKind, BufferMemObject, DataType, Float, MemObject, MutMemObject};
use crate::runtime::{DeviceInfo, Event, Queue};
use std::borrow::Cow;
use std::mem::size_of;
use std::sync::Arc;
use wgpu::util::{BufferInitDescriptor, DeviceExt};
use wgpu::{
    BindGroup, BindGroupDescriptor, BindGroupEntry, BindGroupLayout, BindGroupLayoutDescriptor,
    Buffer, BufferDescriptor, BufferUsages, CommandEncoderDescriptor, ComputePassDescriptor,
    ComputePipeline, ComputePipelineDescriptor, Device, DeviceDescriptor, Features, Instance,
    Label, Maintain, MapMode, PipelineLayout, PowerPreference, RequestAdapterOptions,
    ShaderModuleDescriptor, ShaderSource,
};

const MATMUL: &str = include_str!("../kernel/matmul.wgsl");
const WORKGROUP: u32 = 64;
const MAX_GROUPS: u32 = 65535;

#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C, align(16))]
struct Params {
    batches: u32,
    m: u32,
    k: u32,
    n: u32,
    alpha: f32,
    beta: f32,
    transpose_lhs: u32,
    transpose_rhs: u32,
    interleaved: u32,
    row_stride: u32,
    _pad: [u32; 2],
}

impl Params {
    fn new(p: &MatmulParams, row_stride: u32) -> Self {
        Self {
            batches: p.batches as _,
            m: p.m as _,
            k: p.k as _,
            n: p.n as _,
            alpha: p.alpha,
            beta: p.beta,
            transpose_lhs: p.transpose_lhs as _,
            transpose_rhs: p.transpose_rhs as _,
            interleaved: (p.batch_format == BatchFormat::Interleaved) as _,
            row_stride,
            _pad: [0; 2],
        }
    }
}

/// Workgroup grid covering `items` invocations.
fn dispatch_dims(items: usize) -> [u32; 2] {
    let groups = (items as u32 + WORKGROUP - 1) / WORKGROUP;
    let x = groups.min(MAX_GROUPS).max(1);
    [x, (groups + x - 1) / x]
}

/// Device, queue and the compiled matmul pipeline.
#[derive(Debug)]
struct Gpu {
    device: Device,
    queue: wgpu::Queue,
    pipeline: ComputePipeline,
    layouts: [BindGroupLayout; 3],
}

impl Gpu {
    async fn new() -> Result<(Self, wgpu::AdapterInfo), Error> {
        let inst = Instance::default();

        let adapter = inst
            .request_adapter(&RequestAdapterOptions {
                power_preference: PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .ok_or(ErrorKind::NoAdapter)?;

        let (device, queue) = adapter
            .request_device(
                &DeviceDescriptor {
                    label: None,
                    features: Features::empty(),
                    limits: adapter.limits(),
                },
                None,
            )
            .await
            .map_err(|e| ErrorKind::RequestDevice(e.to_string()))?;

        let (layout, layouts) = mk_pipeline_layout(&device, 2, 1, &[size_of::<Params>()]);
        let module = device.create_shader_module(ShaderModuleDescriptor {
            label: Some("matmul"),
            source: ShaderSource::Wgsl(Cow::Borrowed(MATMUL)),
        });
        let pipeline = device.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("matmul"),
            layout: Some(&layout),
            module: &module,
            entry_point: "main",
        });

        let gpu = Self {
            device,
            queue,
            pipeline,
            layouts,
        };
        Ok((gpu, adapter.get_info()))
    }

    fn storage(&self, data: &[f32], usage: BufferUsages) -> Buffer {
        self.device.create_buffer_init(&BufferInitDescriptor {
            label: None,
            contents: bytemuck::cast_slice(data),
            usage: BufferUsages::STORAGE | usage,
        })
    }

    /// `out = alpha * op(lhs) · op(rhs) + beta * out`, blocking until done.
    fn matmul(&self, lhs: &[f32], rhs: &[f32], out: &mut [f32], p: &MatmulParams) -> Result<(), Error> {
        let [gx, gy] = dispatch_dims(out.len());
        let params = Params::new(p, gx * WORKGROUP);

        let uni = self.device.create_buffer_init(&BufferInitDescriptor {
            label: Some("matmul params"),
            contents: bytemuck::bytes_of(&params),
            usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
        });
        let lhs = self.storage(lhs, BufferUsages::empty());
        let rhs = self.storage(rhs, BufferUsages::empty());
        let dst = self.storage(out, BufferUsages::COPY_SRC);
        let recv = self.device.create_buffer(&BufferDescriptor {
            label: None,
            size: dst.size(),
            usage: BufferUsages::COPY_DST | BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let [ubg, ibg, obg] = mk_bind_groups(&self.device, &self.layouts, [&[&uni], &[&lhs, &rhs], &[&dst]]);

        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor { label: None });
        {
            let mut cpass = encoder.begin_compute_pass(&ComputePassDescriptor { label: None });
            cpass.set_pipeline(&self.pipeline);
            cpass.set_bind_group(0, &ubg, &[]);
            cpass.set_bind_group(1, &ibg, &[]);
            cpass.set_bind_group(2, &obg, &[]);
            cpass.insert_debug_marker("MatOp");
            cpass.dispatch_workgroups(gx, gy, 1);
        }
        encoder.copy_buffer_to_buffer(&dst, 0, &recv, 0, dst.size());
        self.queue.submit(Some(encoder.finish()));

        let slice = recv.slice(..);
        let (s, r) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(MapMode::Read, move |v| {
            let _ = s.send(v);
        });
        self.device.poll(Maintain::Wait);

        match pollster::block_on(r.receive()) {
            Some(Ok(())) => {
                let data = slice.get_mapped_range();
                out.copy_from_slice(bytemuck::cast_slice(&data));
                drop(data);
                recv.unmap();
                Ok(())
            }
            Some(Err(e)) => Err(ErrorKind::BufferMap(e.to_string()).into()),
            None => Err(ErrorKind::BufferMap("mapping callback dropped".to_string()).into()),
        }
    }
}

fn mk_ubuf_layout(device: &Device, sizes: &[usize]) -> BindGroupLayout {
    let entries = sizes
        .iter()
        .enumerate()
        .map(|(i, s)| wgpu::BindGroupLayoutEntry {
            binding: i as u32,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: wgpu::BufferSize::new(*s as _),
            },
            count: None,
        })
        .collect::<Vec<_>>();

    device.create_bind_group_layout(&BindGroupLayoutDescriptor {
        label: Label::from("Uniforms"),
        entries: &entries,
    })
}

fn mk_sbuf_layout(device: &Device, count: u32, read_only: bool) -> BindGroupLayout {
    let entries = (0..count)
        .map(|i| wgpu::BindGroupLayoutEntry {
            binding: i,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: wgpu::BufferSize::new(4),
            },
            count: None,
        })
        .collect::<Vec<_>>();

    device.create_bind_group_layout(&BindGroupLayoutDescriptor {
        label: Label::from(if read_only { "Inputs" } else { "Outputs" }),
        entries: &entries,
    })
}

fn mk_pipeline_layout(
    device: &Device,
    icount: u32,
    ocount: u32,
    unis: &[usize],
) -> (PipelineLayout, [BindGroupLayout; 3]) {
    let uni_layout = mk_ubuf_layout(device, unis);
    let in_layout = mk_sbuf_layout(device, icount, true);
    let out_layout = mk_sbuf_layout(device, ocount, false);

    (
        device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: None,
            bind_group_layouts: &[&uni_layout, &in_layout, &out_layout],
            push_constant_ranges: &[],
        }),
        [uni_layout, in_layout, out_layout],
    )
}

fn mk_bind_groups(
    device: &Device,
    [ul, il, ol]: &[BindGroupLayout; 3],
    [ubs, ibs, obs]: [&[&Buffer]; 3],
) -> [BindGroup; 3] {
    let bind = |layout: &BindGroupLayout, bufs: &[&Buffer]| {
        let entries = bufs
            .iter()
            .enumerate()
            .map(|(i, v)| BindGroupEntry {
                binding: i as u32,
                resource: v.as_entire_binding(),
            })
            .collect::<Vec<_>>();
        device.create_bind_group(&BindGroupDescriptor {
            label: None,
            layout,
            entries: &entries,
        })
    };
    [bind(ul, ubs), bind(il, ibs), bind(ol, obs)]
}

/// Buffer-kind backend whose `f32` matmuls run on a wgpu adapter.
#[derive(Debug)]
pub struct WgpuBackend {
    host: BufferBackend,
    gpu: Arc<Gpu>,
}

impl WgpuBackend {
    /// Picks the highest performance adapter. Fails with
    /// [`ErrorKind::NoAdapter`] when there is none.
    pub async fn new(queue: Queue) -> Result<Self, Error> {
        let (gpu, adapter) = Gpu::new().await?;
        log::debug!("wgpu adapter {} ({:?})", adapter.name, adapter.backend);
        let mut info = DeviceInfo::host(&queue);
        info.name = adapter.name;
        info.vendor = format!("{:#x}", adapter.vendor);
        Ok(Self {
            host: BufferBackend::with_device_info(queue, info),
            gpu: Arc::new(gpu),
        })
    }

    pub fn host() -> Result<Self, Error> {
        pollster::block_on(Self::new(Queue::host()?))
    }
}

impl MemoryProvider for WgpuBackend {
    type Kind = BufferKind;
    type Pointer<T: DataType> = BufferPtr<T>;
    type MemObject<T: DataType> = BufferMemObject<T>;

    fn get_mem_object<T: DataType>(&self, ptr: BufferPtr<T>, n_elems: usize) -> BufferMemObject<T> {
        self.host.get_mem_object(ptr, n_elems)
    }

    fn get_queue(&self) -> &Queue {
        self.host.get_queue()
    }

    fn device_info(&self) -> &DeviceInfo {
        self.host.device_info()
    }
}

impl Backend for WgpuBackend {
    type InternalPointer<T: DataType> = BufferPtr<T>;

    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn allocate<T: DataType>(&self, n_elems: usize) -> Result<BufferPtr<T>, Error> {
        self.host.allocate(n_elems)
    }

    fn deallocate<T: DataType>(&self, ptr: BufferPtr<T>) {
        self.host.deallocate(ptr)
    }

    fn get_mem_object_internal<T: DataType>(
        &self,
        ptr: BufferPtr<T>,
        n_elems: usize,
    ) -> BufferMemObject<T> {
        self.host.get_mem_object_internal(ptr, n_elems)
    }

    fn to_internal_pointer<T: DataType>(&self, ptr: BufferPtr<T>) -> BufferPtr<T> {
        ptr
    }

    fn supports_interleaved_matmul(&self) -> bool {
        true
    }
}

impl MatmulProvider for WgpuBackend {
    fn matmul<T: Float>(
        &self,
        lhs: BufferPtr<T>,
        rhs: BufferPtr<T>,
        output: BufferPtr<T>,
        params: &MatmulParams,
        wait: &[Event],
    ) -> Event {
        let p = *params;
        if T::NAME != "f32" {
            let status = matmul::launch::<T, _>(lhs, rhs, output, &p, &self.host, wait);
            assert!(status.is_ok(), "wgpu matmul rejected {p:?}: {}", status.status);
            return status.event;
        }
        let sizes = matmul::get_sizes(&p);
        let lhs = self.get_mem_object_internal(lhs, sizes.lhs_size).as_const();
        let rhs = self.get_mem_object_internal(rhs, sizes.rhs_size).as_const();
        let out = self.get_mem_object_internal(output, sizes.output_size);
        let gpu = self.gpu.clone();

        self.get_queue().submit("wgpu_matmul", wait, move |cgh| {
            let lhs = lhs.read_mem(cgh);
            let rhs = rhs.read_mem(cgh);
            let out = out.read_write_mem(cgh);
            cgh.try_single_task(move || {
                let narrow = |v: Vec<T>| v.into_iter().map(|x| x.to_f64() as f32).collect::<Vec<_>>();
                let mut res = narrow(out.to_vec());
                gpu.matmul(&narrow(lhs.to_vec()), &narrow(rhs.to_vec()), &mut res, &p)?;
                for (i, v) in res.into_iter().enumerate() {
                    out.set(i, T::from_f64(v as f64));
                }
                Ok(())
            })
        })
    }
}

impl ReduceProvider for WgpuBackend {}
