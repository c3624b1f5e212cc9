//! Host (CPU) reference device.
//!
//! Executes graphs on the CPU with the same memory layout and binding rules as
//! the GPU device. Submitted work runs lazily when it is waited on, so work is
//! asynchronous in the same way a GPU queue is. Tests can simulate device
//! loss with [`HostDevice::remove`].

use crate::layout::{self, GraphLayout};
use relay_core::{
    BindingProperties, BufferBinding, BufferResource, Device, DispatchBindings, Error, GraphDesc,
    InitializeBindings, Operator, ResourceHandle, Result, SubmissionId, TensorRef,
};
use std::any::Any;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

/// A buffer in host memory.
#[derive(Debug)]
pub struct HostBuffer {
    label: String,
    data: Mutex<Vec<u8>>,
}

impl HostBuffer {
    fn new(size: u64, label: &str) -> Result<Self> {
        let size = usize::try_from(size)
            .map_err(|_| Error::Device(format!("buffer '{label}' of {size} bytes is too large")))?;
        Ok(Self {
            label: label.to_string(),
            data: Mutex::new(vec![0; size]),
        })
    }

    fn data(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of the full contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data().clone()
    }

    pub fn read(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        let data = self.data();
        let range = self.range(data.len(), offset, size)?;
        Ok(data[range].to_vec())
    }

    pub fn write(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut data = self.data();
        let range = self.range(data.len(), offset, bytes.len() as u64)?;
        data[range].copy_from_slice(bytes);
        Ok(())
    }

    fn range(&self, len: usize, offset: u64, size: u64) -> Result<std::ops::Range<usize>> {
        offset
            .checked_add(size)
            .filter(|&end| end <= len as u64)
            .map(|end| offset as usize..end as usize)
            .ok_or_else(|| {
                Error::Device(format!(
                    "range {offset}+{size} is outside buffer '{}' of {len} bytes",
                    self.label
                ))
            })
    }
}

impl BufferResource for HostBuffer {
    fn size(&self) -> u64 {
        self.data().len() as u64
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn host_buffer(resource: &ResourceHandle) -> Result<&HostBuffer> {
    resource.as_any().downcast_ref::<HostBuffer>().ok_or_else(|| {
        Error::Device(format!(
            "resource '{}' was not created by the host device",
            resource.label()
        ))
    })
}

/// Binding table written into a host descriptor heap.
#[derive(Debug, Clone)]
enum HostTable {
    Initialize(InitializeBindings),
    Dispatch(DispatchBindings),
}

/// Descriptor storage for the host device.
#[derive(Debug, Clone)]
pub struct HostDescriptorHeap {
    inner: Arc<HostHeapInner>,
}

#[derive(Debug)]
struct HostHeapInner {
    capacity: u32,
    table: Mutex<Option<HostTable>>,
}

impl HostDescriptorHeap {
    pub fn capacity(&self) -> u32 {
        self.inner.capacity
    }

    fn write(&self, table: HostTable) {
        *self.inner.table.lock().unwrap_or_else(|p| p.into_inner()) = Some(table);
    }

    fn table(&self) -> Option<HostTable> {
        self.inner
            .table
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

/// Graph compiled for the host device.
#[derive(Debug, Clone)]
pub struct HostGraph {
    inner: Arc<HostGraphInner>,
}

#[derive(Debug)]
struct HostGraphInner {
    name: String,
    desc: GraphDesc,
    layout: GraphLayout,
}

impl HostGraph {
    pub fn layout(&self) -> &GraphLayout {
        &self.inner.layout
    }
}

#[derive(Debug)]
enum HostCommand {
    Initialize {
        graph: HostGraph,
        bindings: InitializeBindings,
    },
    Dispatch {
        graph: HostGraph,
        bindings: DispatchBindings,
    },
}

#[derive(Debug, Default)]
struct HostState {
    recorded: Vec<HostCommand>,
    in_flight: VecDeque<(SubmissionId, Vec<HostCommand>)>,
    submitted: u64,
    completed: u64,
    removed: Option<String>,
    buffers_created: u64,
    heaps_created: u64,
}

/// CPU implementation of [`Device`].
#[derive(Debug)]
pub struct HostDevice {
    name: String,
    state: Mutex<HostState>,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDevice {
    pub fn new() -> Self {
        Self {
            name: "host".to_string(),
            state: Mutex::new(HostState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Simulate device removal. Every later submission fails.
    pub fn remove(&self, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(%reason, "host device removed");
        self.state().removed = Some(reason);
    }

    /// Buffers created so far, including transients.
    pub fn buffers_created(&self) -> u64 {
        self.state().buffers_created
    }

    pub fn heaps_created(&self) -> u64 {
        self.state().heaps_created
    }

    /// Submissions not yet executed.
    pub fn in_flight(&self) -> usize {
        self.state().in_flight.len()
    }

    fn ensure_present(state: &HostState) -> Result<()> {
        match &state.removed {
            Some(reason) => Err(Error::DeviceRemoved(reason.clone())),
            None => Ok(()),
        }
    }

    /// Execute every submission up to and including `submission`.
    fn retire(state: &mut HostState, submission: SubmissionId) -> Result<()> {
        while let Some((id, _)) = state.in_flight.front() {
            if *id > submission {
                break;
            }
            let Some((id, commands)) = state.in_flight.pop_front() else {
                break;
            };
            for command in &commands {
                execute(command)?;
            }
            state.completed = id.0;
            trace!(submission = %id, "retired");
        }
        Ok(())
    }

    fn record(&self, command: HostCommand) -> Result<()> {
        let mut state = self.state();
        Self::ensure_present(&state)?;
        state.recorded.push(command);
        Ok(())
    }
}

impl Device for HostDevice {
    type CompiledGraph = HostGraph;
    type DescriptorHeap = HostDescriptorHeap;

    fn name(&self) -> &str {
        &self.name
    }

    fn compile_graph(&self, name: &str, desc: &GraphDesc) -> Result<HostGraph> {
        desc.validate(name)?;
        let layout = GraphLayout::new(desc);
        debug!(
            name,
            nodes = desc.nodes.len(),
            temporary = layout.temporary_size,
            persistent = layout.persistent_size,
            "compiled graph"
        );
        Ok(HostGraph {
            inner: Arc::new(HostGraphInner {
                name: name.to_string(),
                desc: desc.clone(),
                layout,
            }),
        })
    }

    fn initializer_properties(&self, graph: &HostGraph) -> BindingProperties {
        BindingProperties {
            required_descriptor_count: layout::initializer_descriptor_count(&graph.inner.desc),
            temporary_resource_size: 0,
            persistent_resource_size: 0,
        }
    }

    fn execution_properties(&self, graph: &HostGraph) -> BindingProperties {
        BindingProperties {
            required_descriptor_count: layout::execution_descriptor_count(&graph.inner.desc),
            temporary_resource_size: graph.inner.layout.temporary_size,
            persistent_resource_size: graph.inner.layout.persistent_size,
        }
    }

    fn create_buffer(&self, size_in_bytes: u64, label: &str) -> Result<ResourceHandle> {
        let mut state = self.state();
        Self::ensure_present(&state)?;
        state.buffers_created += 1;
        Ok(Arc::new(HostBuffer::new(size_in_bytes, label)?))
    }

    fn create_descriptor_heap(&self, descriptor_count: u32) -> Result<HostDescriptorHeap> {
        let mut state = self.state();
        Self::ensure_present(&state)?;
        state.heaps_created += 1;
        Ok(HostDescriptorHeap {
            inner: Arc::new(HostHeapInner {
                capacity: descriptor_count,
                table: Mutex::new(None),
            }),
        })
    }

    fn bind_initializer(
        &self,
        graph: &HostGraph,
        heap: &HostDescriptorHeap,
        bindings: &InitializeBindings,
    ) -> Result<()> {
        let required = self.initializer_properties(graph).required_descriptor_count;
        layout::check_capacity(&graph.inner.name, heap.capacity(), required)?;
        layout::validate_initialize(&graph.inner.name, &graph.inner.layout, bindings)?;
        heap.write(HostTable::Initialize(bindings.clone()));
        Ok(())
    }

    fn bind_dispatch(
        &self,
        graph: &HostGraph,
        heap: &HostDescriptorHeap,
        bindings: &DispatchBindings,
    ) -> Result<()> {
        let required = self.execution_properties(graph).required_descriptor_count;
        layout::check_capacity(&graph.inner.name, heap.capacity(), required)?;
        layout::validate_dispatch(
            &graph.inner.name,
            &graph.inner.desc,
            &graph.inner.layout,
            bindings,
        )?;
        heap.write(HostTable::Dispatch(bindings.clone()));
        Ok(())
    }

    fn record_initialize(&self, graph: &HostGraph, heap: &HostDescriptorHeap) -> Result<()> {
        match heap.table() {
            Some(HostTable::Initialize(bindings)) => self.record(HostCommand::Initialize {
                graph: graph.clone(),
                bindings,
            }),
            _ => Err(Error::Device(format!(
                "no initializer binding table for '{}'",
                graph.inner.name
            ))),
        }
    }

    fn record_dispatch(&self, graph: &HostGraph, heap: &HostDescriptorHeap) -> Result<()> {
        match heap.table() {
            Some(HostTable::Dispatch(bindings)) => self.record(HostCommand::Dispatch {
                graph: graph.clone(),
                bindings,
            }),
            _ => Err(Error::Device(format!(
                "no dispatch binding table for '{}'",
                graph.inner.name
            ))),
        }
    }

    fn submit(&self) -> Result<SubmissionId> {
        let mut state = self.state();
        Self::ensure_present(&state)?;
        state.submitted += 1;
        let id = SubmissionId(state.submitted);
        let commands = std::mem::take(&mut state.recorded);
        trace!(submission = %id, commands = commands.len(), "submitted");
        state.in_flight.push_back((id, commands));
        Ok(id)
    }

    fn wait_for(&self, submission: SubmissionId) -> Result<()> {
        let mut state = self.state();
        Self::ensure_present(&state)?;
        Self::retire(&mut state, submission)
    }

    fn completed_submission(&self) -> SubmissionId {
        SubmissionId(self.state().completed)
    }

    fn next_submission(&self) -> SubmissionId {
        SubmissionId(self.state().submitted + 1)
    }

    fn device_removed_reason(&self) -> Option<String> {
        self.state().removed.clone()
    }

    fn upload(&self, resource: &ResourceHandle, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state();
        Self::ensure_present(&state)?;
        // Uploads are ordered after everything already submitted.
        let last = SubmissionId(state.submitted);
        Self::retire(&mut state, last)?;
        host_buffer(resource)?.write(offset, data)
    }

    fn download(&self, resource: &ResourceHandle) -> Result<Vec<u8>> {
        let mut state = self.state();
        Self::ensure_present(&state)?;
        let last = SubmissionId(state.submitted);
        Self::retire(&mut state, last)?;
        Ok(host_buffer(resource)?.contents())
    }
}

fn execute(command: &HostCommand) -> Result<()> {
    match command {
        HostCommand::Initialize { graph, bindings } => initialize(graph, bindings),
        HostCommand::Dispatch { graph, bindings } => dispatch(graph, bindings),
    }
}

/// Byte range of `binding` starting at `offset` within it.
fn read_binding(binding: &BufferBinding, offset: u64, size: u64) -> Result<Vec<u8>> {
    match binding {
        BufferBinding::Buffer {
            resource,
            offset: base,
            ..
        } => host_buffer(resource)?.read(base + offset, size),
        BufferBinding::None => Err(Error::Device("read from an unbound slot".to_string())),
    }
}

fn write_binding(binding: &BufferBinding, offset: u64, bytes: &[u8]) -> Result<()> {
    match binding {
        BufferBinding::Buffer {
            resource,
            offset: base,
            ..
        } => host_buffer(resource)?.write(base + offset, bytes),
        BufferBinding::None => Err(Error::Device("write to an unbound slot".to_string())),
    }
}

fn initialize(graph: &HostGraph, bindings: &InitializeBindings) -> Result<()> {
    let layout = &graph.inner.layout;
    let Some(persistent) = &bindings.persistent else {
        return Ok(());
    };

    for owned in &layout.owned {
        let source = bindings.inputs.get(owned.slot).ok_or_else(|| {
            Error::Device(format!(
                "owned input slot {} of '{}' is out of range",
                owned.slot, graph.inner.name
            ))
        })?;
        let bytes = read_binding(source, 0, owned.region.size)?;
        write_binding(persistent, owned.region.offset, &bytes)?;
    }
    for region in layout.state.iter().flatten() {
        write_binding(persistent, region.offset, &vec![0; region.size as usize])?;
    }
    trace!(graph = %graph.inner.name, "initialized");
    Ok(())
}

fn dispatch(graph: &HostGraph, bindings: &DispatchBindings) -> Result<()> {
    let desc = &graph.inner.desc;
    let layout = &graph.inner.layout;

    let locate = |tensor: TensorRef| -> Result<(BufferBinding, u64)> {
        let unbound = || Error::Device(format!("{tensor:?} of '{}' is unbound", graph.inner.name));
        match tensor {
            TensorRef::Input(slot) => match layout.owned_region(slot) {
                Some(region) => Ok((
                    bindings.persistent.clone().ok_or_else(unbound)?,
                    region.offset,
                )),
                None => Ok((bindings.inputs.get(slot).cloned().ok_or_else(unbound)?, 0)),
            },
            TensorRef::Output(slot) => {
                Ok((bindings.outputs.get(slot).cloned().ok_or_else(unbound)?, 0))
            }
            TensorRef::Intermediate(index) => Ok((
                bindings.temporary.clone().ok_or_else(unbound)?,
                layout.intermediates[index].offset,
            )),
        }
    };
    let read = |tensor: TensorRef, bytes: u64| -> Result<Vec<f32>> {
        let (binding, offset) = locate(tensor)?;
        Ok(bytemuck::pod_collect_to_vec(&read_binding(&binding, offset, bytes)?))
    };
    let write = |tensor: TensorRef, values: &[f32]| -> Result<()> {
        let (binding, offset) = locate(tensor)?;
        write_binding(&binding, offset, bytemuck::cast_slice(values))
    };

    for (index, node) in desc.nodes.iter().enumerate() {
        let bytes = node.tensor_bytes();
        let a = read(node.inputs[0], bytes)?;
        let result: Vec<f32> = match node.operator {
            Operator::Identity => a,
            Operator::Add => {
                let b = read(node.inputs[1], bytes)?;
                a.iter().zip(&b).map(|(x, y)| x + y).collect()
            }
            Operator::Multiply => {
                let b = read(node.inputs[1], bytes)?;
                a.iter().zip(&b).map(|(x, y)| x * y).collect()
            }
            Operator::Accumulate => {
                let (Some(region), Some(persistent)) = (layout.state[index], &bindings.persistent)
                else {
                    return Err(Error::Device(format!(
                        "accumulator state of node '{}' is unbound",
                        node.name
                    )));
                };
                let state: Vec<f32> =
                    bytemuck::pod_collect_to_vec(&read_binding(persistent, region.offset, bytes)?);
                let sum: Vec<f32> = state.iter().zip(&a).map(|(s, x)| s + x).collect();
                write_binding(persistent, region.offset, bytemuck::cast_slice(&sum))?;
                sum
            }
        };
        write(node.outputs[0], &result)?;
    }
    trace!(graph = %graph.inner.name, "dispatched");
    Ok(())
}
