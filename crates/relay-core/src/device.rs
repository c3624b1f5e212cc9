//! The device collaborator: compiles graphs, allocates memory, and runs work.
//!
//! Relay never talks to a GPU API directly. Everything device-specific sits
//! behind [`Device`], so the lifecycle and binding logic is written once and
//! runs unchanged on the host reference device and on wgpu.

use crate::binding::{BindingTable, BufferBinding};
use crate::graph::GraphDesc;
use crate::resource::ResourceHandle;
use crate::{Error, Result};
use std::fmt;

/// Monotonically increasing identifier of a queue submission.
///
/// `SubmissionId(0)` means "nothing submitted yet"; the first submission is 1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubmissionId(pub u64);

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Device-reported binding requirements of a compiled graph or its initializer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindingProperties {
    /// Descriptors the binding table needs.
    pub required_descriptor_count: u32,

    /// Scratch bytes valid for one initialize or dispatch.
    pub temporary_resource_size: u64,

    /// Scratch bytes that must live as long as the compiled graph.
    pub persistent_resource_size: u64,
}

/// Everything bound to a graph's initializer.
#[derive(Debug, Clone, Default)]
pub struct InitializeBindings {
    /// Input slots resolved from the initialization binding set.
    pub inputs: BindingTable,

    /// Temporary scratch space, if the initializer needs any.
    pub temporary: Option<BufferBinding>,

    /// The persistent resource, written by the initializer.
    pub persistent: Option<BufferBinding>,
}

/// Everything bound to one dispatch of a compiled graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchBindings {
    pub inputs: BindingTable,
    pub outputs: BindingTable,
    pub temporary: Option<BufferBinding>,
    pub persistent: Option<BufferBinding>,
}

/// A compute device as seen by the dispatch lifecycle.
///
/// Work is recorded into an implicit command list and runs when
/// [`submit`](Device::submit) is called. Submissions complete in order.
pub trait Device: Send + Sync + 'static {
    /// A graph compiled for this device.
    type CompiledGraph: Send + Sync;

    /// Descriptor storage backing a binding table. Cloning shares the heap.
    type DescriptorHeap: Clone + Send + Sync + fmt::Debug;

    /// Human-readable device name.
    fn name(&self) -> &str;

    /// Compile `desc` into a dispatchable object.
    fn compile_graph(&self, name: &str, desc: &GraphDesc) -> Result<Self::CompiledGraph>;

    /// Binding requirements for initializing `graph`.
    fn initializer_properties(&self, graph: &Self::CompiledGraph) -> BindingProperties;

    /// Binding requirements for dispatching `graph`.
    fn execution_properties(&self, graph: &Self::CompiledGraph) -> BindingProperties;

    /// Create a device-resident buffer.
    fn create_buffer(&self, size_in_bytes: u64, label: &str) -> Result<ResourceHandle>;

    /// Create descriptor storage for `descriptor_count` descriptors.
    fn create_descriptor_heap(&self, descriptor_count: u32) -> Result<Self::DescriptorHeap>;

    /// Write the initializer's binding table into `heap`.
    fn bind_initializer(
        &self,
        graph: &Self::CompiledGraph,
        heap: &Self::DescriptorHeap,
        bindings: &InitializeBindings,
    ) -> Result<()>;

    /// Write the dispatch binding table into `heap`.
    fn bind_dispatch(
        &self,
        graph: &Self::CompiledGraph,
        heap: &Self::DescriptorHeap,
        bindings: &DispatchBindings,
    ) -> Result<()>;

    /// Record initialization of `graph` using the table in `heap`.
    fn record_initialize(
        &self,
        graph: &Self::CompiledGraph,
        heap: &Self::DescriptorHeap,
    ) -> Result<()>;

    /// Record a dispatch of `graph` using the table in `heap`.
    fn record_dispatch(&self, graph: &Self::CompiledGraph, heap: &Self::DescriptorHeap)
    -> Result<()>;

    /// Submit recorded work to the queue without waiting for it.
    fn submit(&self) -> Result<SubmissionId>;

    /// Block until `submission` has completed.
    fn wait_for(&self, submission: SubmissionId) -> Result<()>;

    /// Highest submission known to have completed.
    fn completed_submission(&self) -> SubmissionId;

    /// Identifier the next [`submit`](Device::submit) will return.
    fn next_submission(&self) -> SubmissionId;

    /// Why the device was removed, if it was.
    fn device_removed_reason(&self) -> Option<String>;

    /// Write `data` into `resource` at byte `offset`.
    fn upload(&self, resource: &ResourceHandle, offset: u64, data: &[u8]) -> Result<()>;

    /// Read back the full contents of `resource`.
    fn download(&self, resource: &ResourceHandle) -> Result<Vec<u8>>;

    /// Fail with [`Error::DeviceRemoved`] if the device is gone.
    fn check_removed(&self) -> Result<()> {
        match self.device_removed_reason() {
            Some(reason) => Err(Error::DeviceRemoved(reason)),
            None => Ok(()),
        }
    }

    /// Submit recorded work and block until it completes.
    fn submit_and_wait(&self) -> Result<SubmissionId> {
        let submission = self.submit()?;
        self.wait_for(submission)?;
        Ok(submission)
    }
}
