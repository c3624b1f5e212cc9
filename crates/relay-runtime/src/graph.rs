//! Dispatchable for a native operator graph.

use relay_core::{
    BindingProperties, BindingSet, BufferBinding, Device, DispatchBindings, Dispatchable, Error,
    GraphDesc, InitializeBindings, LifecycleState, PersistentSlot, ResolveMode, Result,
    SubmissionId, TransientAllocator, resolve,
};
use std::sync::Arc;
use tracing::{debug, trace};

/// Per-call state once the graph has been compiled.
struct Compiled<D: Device> {
    graph: D::CompiledGraph,
    execution: BindingProperties,
}

/// A [`GraphDesc`] compiled and run on a [`Device`].
///
/// The initialization binding set is supplied at construction and consumed by
/// [`initialize`](Dispatchable::initialize). Every owned input must be bound
/// there; it is copied into the persistent resource, so later binding sets
/// may omit it.
pub struct GraphDispatchable<D: Device> {
    name: String,
    desc: GraphDesc,
    init_bindings: BindingSet,
    allocator: TransientAllocator<D>,
    persistent: PersistentSlot,
    compiled: Option<Compiled<D>>,

    /// Heap written by the last bind, consumed by the next dispatch.
    heap: Option<D::DescriptorHeap>,
    bindings: Option<DispatchBindings>,
    last_submission: Option<SubmissionId>,
}

impl<D: Device> GraphDispatchable<D> {
    pub fn new(
        name: impl Into<String>,
        device: Arc<D>,
        desc: GraphDesc,
        init_bindings: BindingSet,
    ) -> Self {
        Self {
            name: name.into(),
            desc,
            init_bindings,
            allocator: TransientAllocator::new(device),
            persistent: PersistentSlot::new(),
            compiled: None,
            heap: None,
            bindings: None,
            last_submission: None,
        }
    }

    pub fn desc(&self) -> &GraphDesc {
        &self.desc
    }

    /// Binding tables produced by the most recent bind.
    pub fn last_bindings(&self) -> Option<&DispatchBindings> {
        self.bindings.as_ref()
    }

    /// The persistent resource, once initialized.
    pub fn persistent(&self) -> &PersistentSlot {
        &self.persistent
    }

    /// Temporary resources and heaps awaiting release.
    pub fn pending_release(&self) -> usize {
        self.allocator.pending()
    }

    fn device(&self) -> &Arc<D> {
        self.allocator.device()
    }

    fn compiled(&self, operation: &'static str) -> Result<&Compiled<D>> {
        self.compiled.as_ref().ok_or_else(|| Error::Lifecycle {
            name: self.name.clone(),
            operation,
            state: LifecycleState::Constructed,
        })
    }
}

impl<D: Device> Dispatchable for GraphDispatchable<D> {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(skip_all, fields(name = %self.name))]
    fn initialize(&mut self) -> Result<()> {
        if self.persistent.is_created() {
            return Err(Error::PersistentReallocated(self.name.clone()));
        }
        let device = Arc::clone(self.device());
        let graph = device.compile_graph(&self.name, &self.desc)?;
        let initializer = device.initializer_properties(&graph);
        let execution = device.execution_properties(&graph);
        debug!(?initializer, ?execution, "binding properties");

        let inputs = resolve(
            &self.desc.inputs,
            &self.init_bindings,
            ResolveMode::Initialization,
        )?;
        // Owned inputs are copied into persistent memory here and never read
        // from the execution set again.
        for &slot in &self.desc.owned_inputs {
            if inputs.get(slot).is_none_or(BufferBinding::is_none) {
                let bind_point = self
                    .desc
                    .input_bind_point(slot)
                    .map_or_else(|| format!("input slot {slot}"), |point| point.name.clone());
                return Err(Error::MissingRequiredBinding { bind_point });
            }
        }

        let heap = self
            .allocator
            .descriptor_heap(initializer.required_descriptor_count)?;
        let temporary = self.allocator.temporary(
            initializer.temporary_resource_size,
            &format!("{}_init_temporary", self.name),
        )?;
        // The initializer fills the resource that every dispatch reuses, so it
        // is sized by the execution requirement.
        self.allocator.persistent(
            &mut self.persistent,
            execution.persistent_resource_size,
            &format!("{}_persistent", self.name),
        )?;

        let bindings = InitializeBindings {
            inputs,
            temporary: temporary.map(BufferBinding::whole),
            persistent: self.persistent.binding(),
        };
        device.bind_initializer(&graph, &heap, &bindings)?;
        device.record_initialize(&graph, &heap)?;

        let submission = device.submit()?;
        self.allocator.submitted(submission);
        device.wait_for(submission)?;
        device.check_removed()?;

        self.compiled = Some(Compiled { graph, execution });
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(name = %self.name))]
    fn bind(&mut self, bindings: &BindingSet) -> Result<()> {
        let execution = self.compiled("bind")?.execution;
        self.heap = None;
        self.bindings = None;

        let inputs = resolve(
            &self.desc.inputs,
            bindings,
            ResolveMode::Execution {
                initialized: Some(&self.init_bindings),
            },
        )?;
        let outputs = resolve(
            &self.desc.outputs,
            bindings,
            ResolveMode::Execution { initialized: None },
        )?;

        let heap = self
            .allocator
            .descriptor_heap(execution.required_descriptor_count)?;
        let temporary = self.allocator.temporary(
            execution.temporary_resource_size,
            &format!("{}_temporary", self.name),
        )?;

        let table = DispatchBindings {
            inputs,
            outputs,
            temporary: temporary.map(BufferBinding::whole),
            persistent: self.persistent.binding(),
        };
        trace!(
            inputs = table.inputs.bound_count(),
            outputs = table.outputs.bound_count(),
            "binding table built"
        );

        let compiled = self.compiled("bind")?;
        let device = self.allocator.device();
        device.bind_dispatch(&compiled.graph, &heap, &table)?;
        device.check_removed()?;

        self.heap = Some(heap);
        self.bindings = Some(table);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(name = %self.name))]
    fn dispatch(&mut self) -> Result<()> {
        let compiled = self.compiled("dispatch")?;
        let heap = self.heap.as_ref().ok_or_else(|| Error::Lifecycle {
            name: self.name.clone(),
            operation: "dispatch",
            state: LifecycleState::Initialized,
        })?;
        let device = self.allocator.device();
        device.record_dispatch(&compiled.graph, heap)?;
        let submission = device.submit()?;
        device.check_removed()?;

        self.allocator.submitted(submission);
        self.last_submission = Some(submission);
        trace!(%submission, "dispatched");
        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        if let Some(submission) = self.last_submission {
            self.device().wait_for(submission)?;
        }
        self.device().check_removed()
    }
}
