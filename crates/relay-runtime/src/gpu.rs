//! wgpu implementation of [`Device`].
//!
//! Each graph operator is a small WGSL kernel over f32 arrays. A binding table
//! becomes one bind group per node, stored in the descriptor heap, so recording
//! a dispatch is just a compute pass replaying those bind groups.

use crate::error::RuntimeError;
use crate::layout::{self, GraphLayout, Region};
use relay_core::{
    BindingProperties, BufferBinding, BufferResource, Device, DispatchBindings, Error, GraphDesc,
    InitializeBindings, Operator, ResourceHandle, Result, SubmissionId, TensorRef,
};
use std::any::Any;
use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

const WORKGROUP_SIZE: u64 = 64;

const IDENTITY_SHADER: &str = r#"
@group(0) @binding(0) var<storage, read_write> a: array<f32>;
@group(0) @binding(1) var<storage, read_write> out: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    if (i >= arrayLength(&out)) {
        return;
    }
    out[i] = a[i];
}
"#;

const ADD_SHADER: &str = r#"
@group(0) @binding(0) var<storage, read_write> a: array<f32>;
@group(0) @binding(1) var<storage, read_write> b: array<f32>;
@group(0) @binding(2) var<storage, read_write> out: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    if (i >= arrayLength(&out)) {
        return;
    }
    out[i] = a[i] + b[i];
}
"#;

const MULTIPLY_SHADER: &str = r#"
@group(0) @binding(0) var<storage, read_write> a: array<f32>;
@group(0) @binding(1) var<storage, read_write> b: array<f32>;
@group(0) @binding(2) var<storage, read_write> out: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    if (i >= arrayLength(&out)) {
        return;
    }
    out[i] = a[i] * b[i];
}
"#;

const ACCUMULATE_SHADER: &str = r#"
@group(0) @binding(0) var<storage, read_write> a: array<f32>;
@group(0) @binding(1) var<storage, read_write> state: array<f32>;
@group(0) @binding(2) var<storage, read_write> out: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    if (i >= arrayLength(&out)) {
        return;
    }
    state[i] = state[i] + a[i];
    out[i] = state[i];
}
"#;

fn shader_source(operator: Operator) -> &'static str {
    match operator {
        Operator::Identity => IDENTITY_SHADER,
        Operator::Add => ADD_SHADER,
        Operator::Multiply => MULTIPLY_SHADER,
        Operator::Accumulate => ACCUMULATE_SHADER,
    }
}

/// Number of storage bindings a kernel declares.
fn binding_count(operator: Operator) -> usize {
    match operator {
        Operator::Identity => 2,
        Operator::Add | Operator::Multiply | Operator::Accumulate => 3,
    }
}

/// A storage buffer created by [`GpuDevice`].
#[derive(Debug)]
pub struct GpuBuffer {
    buffer: wgpu::Buffer,
    label: String,
}

impl GpuBuffer {
    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }
}

impl BufferResource for GpuBuffer {
    fn size(&self) -> u64 {
        self.buffer.size()
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn gpu_buffer(resource: &ResourceHandle) -> Result<&wgpu::Buffer> {
    resource
        .as_any()
        .downcast_ref::<GpuBuffer>()
        .map(GpuBuffer::buffer)
        .ok_or_else(|| {
            Error::Device(format!(
                "resource '{}' was not created by the wgpu device",
                resource.label()
            ))
        })
}

struct KernelPipeline {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

/// Graph compiled for the wgpu device.
#[derive(Debug, Clone)]
pub struct GpuGraph {
    inner: Arc<GpuGraphInner>,
}

#[derive(Debug)]
struct GpuGraphInner {
    name: String,
    desc: GraphDesc,
    layout: GraphLayout,
}

/// One node of a bound dispatch.
#[derive(Debug)]
struct BoundNode {
    operator: Operator,
    bind_group: wgpu::BindGroup,
    workgroups: u32,
}

/// One step of a bound initializer.
#[derive(Debug)]
enum InitStep {
    Copy {
        source: ResourceHandle,
        source_offset: u64,
        destination: ResourceHandle,
        destination_offset: u64,
        size: u64,
    },
    Clear {
        destination: ResourceHandle,
        offset: u64,
        size: u64,
    },
}

#[derive(Debug)]
enum GpuTable {
    Initialize(Vec<InitStep>),
    Dispatch(Vec<BoundNode>),
}

/// Bind groups written by a bind call.
#[derive(Debug, Clone)]
pub struct GpuDescriptorHeap {
    inner: Arc<GpuHeapInner>,
}

#[derive(Debug)]
struct GpuHeapInner {
    capacity: u32,
    table: Mutex<Option<GpuTable>>,
}

impl GpuDescriptorHeap {
    pub fn capacity(&self) -> u32 {
        self.inner.capacity
    }

    fn table(&self) -> MutexGuard<'_, Option<GpuTable>> {
        self.inner.table.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Compute device backed by a `wgpu::Device` and its queue.
pub struct GpuDevice {
    name: String,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    pipelines: HashMap<Operator, KernelPipeline>,
    storage_alignment: u64,

    /// Command buffers recorded since the last submit.
    recorded: Mutex<Vec<wgpu::CommandBuffer>>,
    /// wgpu index of each submission not yet known to be complete.
    submissions: Mutex<VecDeque<(SubmissionId, wgpu::SubmissionIndex)>>,
    submitted: AtomicU64,
    completed: Arc<AtomicU64>,
    lost: Arc<Mutex<Option<String>>>,
}

impl std::fmt::Debug for GpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuDevice")
            .field("name", &self.name)
            .field("submitted", &self.submitted)
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}

impl GpuDevice {
    /// Wrap an existing device and queue, building one pipeline per operator.
    pub fn new(
        name: impl Into<String>,
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
    ) -> Self {
        let lost = Arc::new(Mutex::new(None));
        let lost_reason = Arc::clone(&lost);
        device.set_device_lost_callback(move |reason, message| {
            warn!(?reason, %message, "wgpu device lost");
            *lost_reason.lock().unwrap_or_else(|p| p.into_inner()) =
                Some(format!("{reason:?}: {message}"));
        });

        let pipelines = [
            Operator::Identity,
            Operator::Add,
            Operator::Multiply,
            Operator::Accumulate,
        ]
        .into_iter()
        .map(|operator| (operator, create_pipeline(&device, operator)))
        .collect();

        let storage_alignment = u64::from(device.limits().min_storage_buffer_offset_alignment);

        Self {
            name: name.into(),
            device,
            queue,
            pipelines,
            storage_alignment,
            recorded: Mutex::new(Vec::new()),
            submissions: Mutex::new(VecDeque::new()),
            submitted: AtomicU64::new(0),
            completed: Arc::new(AtomicU64::new(0)),
            lost,
        }
    }

    pub fn wgpu_device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub fn wgpu_queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }

    /// Submissions not yet observed as complete by [`Device::wait_for`].
    pub fn pending_submissions(&self) -> usize {
        self.submissions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    fn pipeline(&self, operator: Operator) -> Result<&KernelPipeline> {
        self.pipelines
            .get(&operator)
            .ok_or_else(|| Error::Device(format!("no pipeline for {operator:?}")))
    }

    /// Storage binding of `size` bytes at `offset` in `binding`.
    fn storage_range<'a>(
        &self,
        binding: &'a BufferBinding,
        offset: u64,
        size: u64,
        what: &str,
    ) -> Result<(&'a wgpu::Buffer, u64, u64)> {
        let BufferBinding::Buffer {
            resource,
            offset: base,
            ..
        } = binding
        else {
            return Err(Error::Device(format!("{what} is unbound")));
        };
        let offset = base + offset;
        if offset % self.storage_alignment != 0 {
            return Err(Error::Device(format!(
                "{what} starts at byte {offset}, which is not a multiple of {}",
                self.storage_alignment
            )));
        }
        Ok((gpu_buffer(resource)?, offset, size))
    }

    fn push_commands(&self, encoder: wgpu::CommandEncoder) {
        self.recorded
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(encoder.finish());
    }

    fn wgpu_index(&self, submission: SubmissionId) -> Option<wgpu::SubmissionIndex> {
        self.submissions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|(id, _)| *id == submission)
            .map(|(_, index)| index.clone())
    }

    fn mark_completed(&self, submission: SubmissionId) {
        self.completed.fetch_max(submission.0, Ordering::SeqCst);
        self.submissions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|(id, _)| *id > submission);
    }

    /// Copy `resource` into a mappable buffer and read it back.
    fn read_back(&self, resource: &ResourceHandle) -> std::result::Result<Vec<u8>, RuntimeError> {
        let buffer = gpu_buffer(resource)?;
        let size = buffer.size();

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("download_staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("download_copy"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
        let index = self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: Some(index),
                timeout: None,
            })
            .map_err(|e| {
                RuntimeError::ExecutionError(format!("GPU poll failed during download: {e:?}"))
            })?;

        receiver
            .recv()
            .map_err(|e| RuntimeError::ExecutionError(format!("Map recv failed: {e}")))??;

        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }
}

fn create_pipeline(device: &wgpu::Device, operator: Operator) -> KernelPipeline {
    let label = format!("{operator:?}").to_lowercase();

    let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(&label),
        source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(shader_source(operator))),
    });

    let entries: Vec<wgpu::BindGroupLayoutEntry> = (0..binding_count(operator))
        .map(|binding| wgpu::BindGroupLayoutEntry {
            binding: binding as u32,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: false },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        })
        .collect();

    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(&format!("{label}_layout")),
        entries: &entries,
    });

    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(&format!("{label}_pipeline_layout")),
        bind_group_layouts: &[&bind_group_layout],
        immediate_size: 0,
    });

    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(&label),
        layout: Some(&pipeline_layout),
        module: &shader_module,
        entry_point: Some("main"),
        compilation_options: Default::default(),
        cache: None,
    });

    KernelPipeline {
        pipeline,
        bind_group_layout,
    }
}

impl Device for GpuDevice {
    type CompiledGraph = GpuGraph;
    type DescriptorHeap = GpuDescriptorHeap;

    fn name(&self) -> &str {
        &self.name
    }

    fn compile_graph(&self, name: &str, desc: &GraphDesc) -> Result<GpuGraph> {
        desc.validate(name)?;
        let max_workgroups = u64::from(self.device.limits().max_compute_workgroups_per_dimension);
        for node in &desc.nodes {
            if node.element_count.div_ceil(WORKGROUP_SIZE) > max_workgroups {
                return Err(Error::Compilation {
                    name: name.to_string(),
                    reason: format!(
                        "node '{}' has {} elements, more than one dispatch can cover",
                        node.name, node.element_count
                    ),
                });
            }
        }
        let layout = GraphLayout::new(desc);
        debug!(
            name,
            nodes = desc.nodes.len(),
            temporary = layout.temporary_size,
            persistent = layout.persistent_size,
            "compiled graph"
        );
        Ok(GpuGraph {
            inner: Arc::new(GpuGraphInner {
                name: name.to_string(),
                desc: desc.clone(),
                layout,
            }),
        })
    }

    fn initializer_properties(&self, graph: &GpuGraph) -> BindingProperties {
        BindingProperties {
            required_descriptor_count: layout::initializer_descriptor_count(&graph.inner.desc),
            temporary_resource_size: 0,
            persistent_resource_size: 0,
        }
    }

    fn execution_properties(&self, graph: &GpuGraph) -> BindingProperties {
        BindingProperties {
            required_descriptor_count: layout::execution_descriptor_count(&graph.inner.desc),
            temporary_resource_size: graph.inner.layout.temporary_size,
            persistent_resource_size: graph.inner.layout.persistent_size,
        }
    }

    fn create_buffer(&self, size_in_bytes: u64, label: &str) -> Result<ResourceHandle> {
        self.check_removed()?;
        // Storage bindings and copies work in 4-byte units.
        let size = size_in_bytes.max(4).div_ceil(4) * 4;
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        trace!(label, size, "created buffer");
        Ok(Arc::new(GpuBuffer {
            buffer,
            label: label.to_string(),
        }))
    }

    fn create_descriptor_heap(&self, descriptor_count: u32) -> Result<GpuDescriptorHeap> {
        self.check_removed()?;
        Ok(GpuDescriptorHeap {
            inner: Arc::new(GpuHeapInner {
                capacity: descriptor_count,
                table: Mutex::new(None),
            }),
        })
    }

    fn bind_initializer(
        &self,
        graph: &GpuGraph,
        heap: &GpuDescriptorHeap,
        bindings: &InitializeBindings,
    ) -> Result<()> {
        let name = &graph.inner.name;
        let layout = &graph.inner.layout;
        let required = self.initializer_properties(graph).required_descriptor_count;
        layout::check_capacity(name, heap.capacity(), required)?;
        layout::validate_initialize(name, layout, bindings)?;

        let mut steps = Vec::new();
        if let Some(BufferBinding::Buffer {
            resource: persistent,
            offset: persistent_base,
            ..
        }) = &bindings.persistent
        {
            for owned in &layout.owned {
                let Region { offset, size } = owned.region;
                match bindings.inputs.get(owned.slot) {
                    Some(BufferBinding::Buffer {
                        resource, offset: source_offset, ..
                    }) => {
                        if source_offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
                            return Err(Error::Device(format!(
                                "owned input slot {} of '{name}' starts at unaligned byte {source_offset}",
                                owned.slot
                            )));
                        }
                        steps.push(InitStep::Copy {
                            source: resource.clone(),
                            source_offset: *source_offset,
                            destination: persistent.clone(),
                            destination_offset: persistent_base + offset,
                            size,
                        });
                    }
                    _ => {
                        return Err(Error::Device(format!(
                            "owned input slot {} of '{name}' is unbound",
                            owned.slot
                        )));
                    }
                }
            }
            for region in layout.state.iter().flatten() {
                steps.push(InitStep::Clear {
                    destination: persistent.clone(),
                    offset: persistent_base + region.offset,
                    size: region.size,
                });
            }
        }

        *heap.table() = Some(GpuTable::Initialize(steps));
        Ok(())
    }

    fn bind_dispatch(
        &self,
        graph: &GpuGraph,
        heap: &GpuDescriptorHeap,
        bindings: &DispatchBindings,
    ) -> Result<()> {
        let name = &graph.inner.name;
        let desc = &graph.inner.desc;
        let layout = &graph.inner.layout;
        let required = self.execution_properties(graph).required_descriptor_count;
        layout::check_capacity(name, heap.capacity(), required)?;
        layout::validate_dispatch(name, desc, layout, bindings)?;

        let none = BufferBinding::None;
        let persistent = bindings.persistent.as_ref().unwrap_or(&none);
        let temporary = bindings.temporary.as_ref().unwrap_or(&none);

        let mut nodes = Vec::with_capacity(desc.nodes.len());
        for (index, node) in desc.nodes.iter().enumerate() {
            let bytes = node.tensor_bytes();
            let locate = |tensor: TensorRef| {
                let what = format!("{tensor:?} of node '{}'", node.name);
                match tensor {
                    TensorRef::Input(slot) => match layout.owned_region(slot) {
                        Some(region) => self.storage_range(persistent, region.offset, bytes, &what),
                        None => {
                            let input = bindings.inputs.get(slot).unwrap_or(&none);
                            self.storage_range(input, 0, bytes, &what)
                        }
                    },
                    TensorRef::Output(slot) => {
                        let output = bindings.outputs.get(slot).unwrap_or(&none);
                        self.storage_range(output, 0, bytes, &what)
                    }
                    TensorRef::Intermediate(i) => match layout.intermediates.get(i) {
                        Some(region) => self.storage_range(temporary, region.offset, bytes, &what),
                        None => Err(Error::Device(format!("{what} has no intermediate region"))),
                    },
                }
            };

            let mut ranges = Vec::with_capacity(3);
            for input in &node.inputs {
                ranges.push(locate(*input)?);
            }
            if node.operator == Operator::Accumulate {
                let region = layout.state[index].ok_or_else(|| {
                    Error::Device(format!("node '{}' has no accumulator state", node.name))
                })?;
                ranges.push(self.storage_range(persistent, region.offset, bytes, "accumulator state")?);
            }
            for output in &node.outputs {
                ranges.push(locate(*output)?);
            }

            let entries: Vec<wgpu::BindGroupEntry> = ranges
                .iter()
                .enumerate()
                .map(|(binding, (buffer, offset, size))| wgpu::BindGroupEntry {
                    binding: binding as u32,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer,
                        offset: *offset,
                        size: NonZeroU64::new(*size),
                    }),
                })
                .collect();

            let kernel = self.pipeline(node.operator)?;
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&node.name),
                layout: &kernel.bind_group_layout,
                entries: &entries,
            });
            let workgroups = u32::try_from(node.element_count.div_ceil(WORKGROUP_SIZE))
                .map_err(|_| Error::Device(format!("node '{}' is too large", node.name)))?;
            nodes.push(BoundNode {
                operator: node.operator,
                bind_group,
                workgroups,
            });
        }

        *heap.table() = Some(GpuTable::Dispatch(nodes));
        Ok(())
    }

    fn record_initialize(&self, graph: &GpuGraph, heap: &GpuDescriptorHeap) -> Result<()> {
        let table = heap.table();
        let Some(GpuTable::Initialize(steps)) = table.as_ref() else {
            return Err(Error::Device(format!(
                "no initializer binding table for '{}'",
                graph.inner.name
            )));
        };

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("initialize"),
            });
        for step in steps {
            match step {
                InitStep::Copy {
                    source,
                    source_offset,
                    destination,
                    destination_offset,
                    size,
                } => encoder.copy_buffer_to_buffer(
                    gpu_buffer(source)?,
                    *source_offset,
                    gpu_buffer(destination)?,
                    *destination_offset,
                    *size,
                ),
                InitStep::Clear {
                    destination,
                    offset,
                    size,
                } => encoder.clear_buffer(gpu_buffer(destination)?, *offset, Some(*size)),
            }
        }
        self.push_commands(encoder);
        Ok(())
    }

    fn record_dispatch(&self, graph: &GpuGraph, heap: &GpuDescriptorHeap) -> Result<()> {
        let table = heap.table();
        let Some(GpuTable::Dispatch(nodes)) = table.as_ref() else {
            return Err(Error::Device(format!(
                "no dispatch binding table for '{}'",
                graph.inner.name
            )));
        };

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(&graph.inner.name),
            });
        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&graph.inner.name),
                timestamp_writes: None,
            });
            for node in nodes {
                let kernel = self.pipeline(node.operator)?;
                compute_pass.set_pipeline(&kernel.pipeline);
                compute_pass.set_bind_group(0, &node.bind_group, &[]);
                compute_pass.dispatch_workgroups(node.workgroups, 1, 1);
            }
        }
        self.push_commands(encoder);
        Ok(())
    }

    fn submit(&self) -> Result<SubmissionId> {
        self.check_removed()?;
        let commands: Vec<wgpu::CommandBuffer> =
            std::mem::take(&mut *self.recorded.lock().unwrap_or_else(|p| p.into_inner()));
        let id = SubmissionId(self.submitted.fetch_add(1, Ordering::SeqCst) + 1);
        let index = self.queue.submit(commands);

        let completed = Arc::clone(&self.completed);
        self.queue.on_submitted_work_done(move || {
            completed.fetch_max(id.0, Ordering::SeqCst);
        });
        self.submissions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back((id, index));
        trace!(submission = %id, "submitted");
        Ok(id)
    }

    fn wait_for(&self, submission: SubmissionId) -> Result<()> {
        if self.completed_submission() >= submission {
            self.mark_completed(submission);
            return self.check_removed();
        }
        let index = self.wgpu_index(submission);
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: index,
                timeout: None,
            })
            .map_err(|e| Error::Device(format!("GPU poll failed: {e:?}")))?;
        self.mark_completed(submission);
        self.check_removed()
    }

    fn completed_submission(&self) -> SubmissionId {
        let _ = self.device.poll(wgpu::PollType::Poll);
        SubmissionId(self.completed.load(Ordering::SeqCst))
    }

    fn next_submission(&self) -> SubmissionId {
        SubmissionId(self.submitted.load(Ordering::SeqCst) + 1)
    }

    fn device_removed_reason(&self) -> Option<String> {
        self.lost.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn upload(&self, resource: &ResourceHandle, offset: u64, data: &[u8]) -> Result<()> {
        self.check_removed()?;
        let buffer = gpu_buffer(resource)?;
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(Error::Device(format!(
                "upload to '{}' at unaligned offset {offset}",
                resource.label()
            )));
        }
        let mut bytes = data.to_vec();
        bytes.resize(data.len().div_ceil(4) * 4, 0);
        if offset + bytes.len() as u64 > buffer.size() {
            return Err(Error::Device(format!(
                "upload of {} bytes at {offset} overruns '{}' ({} bytes)",
                data.len(),
                resource.label(),
                buffer.size()
            )));
        }
        self.queue.write_buffer(buffer, offset, &bytes);
        Ok(())
    }

    fn download(&self, resource: &ResourceHandle) -> Result<Vec<u8>> {
        self.check_removed()?;
        let mut data = self.read_back(resource).map_err(Error::from)?;
        data.truncate(resource.size() as usize);
        Ok(data)
    }
}
