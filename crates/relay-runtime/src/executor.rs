//! Workload execution: creates named resources, builds binding sets from
//! binding descriptions, and drives dispatchables through their lifecycle.

use relay_core::{
    BindingDescs, BindingSet, Command, Device, DispatchCommand, Dispatchable, Error, Lifecycle,
    LifecycleState, ResourceDesc, ResourceHandle, ResourceKind, ResourceSource, Result,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span};

/// How dispatch commands are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Bind and dispatch each command this many times.
    pub iterations: u32,

    /// Wait after every dispatch instead of once per command.
    pub wait_each_iteration: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            iterations: 1,
            wait_each_iteration: true,
        }
    }
}

impl ExecutorOptions {
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_wait_each_iteration(mut self, wait: bool) -> Self {
        self.wait_each_iteration = wait;
        self
    }
}

/// A device resource created for a workload.
#[derive(Debug, Clone)]
struct NamedResource {
    desc: Arc<ResourceDesc>,
    handle: ResourceHandle,
}

type BoxedDispatchable = Lifecycle<Box<dyn Dispatchable>>;

/// Runs workload commands against named resources and dispatchables.
pub struct Executor<D: Device> {
    device: Arc<D>,
    options: ExecutorOptions,
    resources: HashMap<String, NamedResource>,
    /// In registration order.
    dispatchables: Vec<BoxedDispatchable>,
}

impl<D: Device> Executor<D> {
    /// Create a device buffer for every resource and upload its initial values.
    ///
    /// Textures get a backing buffer of `width * height` elements so they can
    /// be referenced by name, but they cannot be bound.
    #[tracing::instrument(skip_all, fields(device = device.name(), resources = resources.len()))]
    pub fn new(device: Arc<D>, resources: &[ResourceDesc], options: ExecutorOptions) -> Result<Self> {
        let mut created = HashMap::with_capacity(resources.len());

        for desc in resources {
            if created.contains_key(&desc.name) {
                return Err(Error::Device(format!("resource '{}' is declared twice", desc.name)));
            }
            let (size, initial_values): (u64, &[u8]) = match &desc.kind {
                ResourceKind::Buffer(buffer) => (buffer.size_in_bytes, buffer.initial_values.as_slice()),
                ResourceKind::Texture(texture) => {
                    let element_size = texture.format.size().ok_or_else(|| {
                        Error::UnsupportedElementType {
                            tensor: desc.name.clone(),
                            dtype: texture.format,
                        }
                    })?;
                    let size = u64::from(texture.width) * u64::from(texture.height) * element_size;
                    (size, &[][..])
                }
            };
            if initial_values.len() as u64 > size {
                return Err(Error::Device(format!(
                    "initial values for '{}' are {} bytes but the resource holds {size}",
                    desc.name,
                    initial_values.len()
                )));
            }

            let handle = device.create_buffer(size, &desc.name)?;
            if !initial_values.is_empty() {
                device.upload(&handle, 0, initial_values)?;
            }
            debug!(resource = %desc.name, kind = desc.kind.kind_name(), size, "created resource");
            created.insert(
                desc.name.clone(),
                NamedResource {
                    desc: Arc::new(desc.clone()),
                    handle,
                },
            );
        }

        Ok(Self {
            device,
            options,
            resources: created,
            dispatchables: Vec::new(),
        })
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn options(&self) -> ExecutorOptions {
        self.options
    }

    /// Device buffer created for resource `name`.
    pub fn resource(&self, name: &str) -> Result<&ResourceHandle> {
        self.named(name).map(|resource| &resource.handle)
    }

    fn named(&self, name: &str) -> Result<&NamedResource> {
        self.resources
            .get(name)
            .ok_or_else(|| Error::UnknownResource(name.to_string()))
    }

    /// Turn binding descriptions into a binding set over this executor's resources.
    pub fn binding_set(&self, descs: &BindingDescs) -> Result<BindingSet> {
        let mut set = BindingSet::new();
        for (bind_point, sources) in descs {
            let sources = sources
                .iter()
                .map(|source| {
                    let named = self.named(&source.resource)?;
                    let mut resolved = ResourceSource::new(named.handle.clone(), named.desc.clone());
                    let element_size = source
                        .element_size_in_bytes
                        .unwrap_or(resolved.element_size_in_bytes);
                    resolved = resolved.with_offset(source.element_offset, element_size);
                    if let Some(counter) = &source.counter {
                        resolved = resolved.with_counter(self.named(counter)?.handle.clone());
                    }
                    Ok(resolved)
                })
                .collect::<Result<Vec<_>>>()?;
            set.insert(bind_point.clone(), sources);
        }
        Ok(set)
    }

    /// Register a dispatchable under its own name.
    pub fn register(&mut self, dispatchable: impl Dispatchable + 'static) -> Result<()> {
        if self.find(dispatchable.name()).is_some() {
            return Err(Error::Device(format!(
                "dispatchable '{}' is registered twice",
                dispatchable.name()
            )));
        }
        self.dispatchables
            .push(Lifecycle::new(Box::new(dispatchable) as Box<dyn Dispatchable>));
        Ok(())
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.dispatchables.iter().position(|d| d.name() == name)
    }

    /// Lifecycle state of dispatchable `name`.
    pub fn dispatchable_state(&self, name: &str) -> Option<LifecycleState> {
        self.find(name).map(|index| self.dispatchables[index].state())
    }

    /// Successful dispatches of `name`.
    pub fn dispatch_count(&self, name: &str) -> Option<u64> {
        self.find(name)
            .map(|index| self.dispatchables[index].dispatch_count())
    }

    /// Initialize every dispatchable not yet initialized, in registration order.
    pub fn initialize(&mut self) -> Result<()> {
        for dispatchable in &mut self.dispatchables {
            if dispatchable.state() != LifecycleState::Constructed {
                continue;
            }
            let _span = info_span!("initialize", dispatchable = dispatchable.name()).entered();
            let start = Instant::now();
            dispatchable.initialize()?;
            info!(elapsed = ?start.elapsed(), "initialized");
        }
        Ok(())
    }

    /// Run `commands` in order, returning the contents of every `Read`.
    pub fn execute(&mut self, commands: &[Command]) -> Result<Vec<(String, Vec<u8>)>> {
        let mut reads = Vec::new();
        for command in commands {
            match command {
                Command::Dispatch(dispatch) => self.dispatch(dispatch)?,
                Command::Read { resource } => {
                    let _span = info_span!("read", resource = %resource).entered();
                    reads.push((resource.clone(), self.read(resource)?));
                }
            }
        }
        Ok(reads)
    }

    fn dispatch(&mut self, command: &DispatchCommand) -> Result<()> {
        let _span = info_span!("dispatch", dispatchable = %command.dispatchable).entered();
        let bindings = self.binding_set(&command.bindings)?;
        let index = self
            .find(&command.dispatchable)
            .ok_or_else(|| Error::UnknownDispatchable(command.dispatchable.clone()))?;
        let options = self.options;
        let dispatchable = &mut self.dispatchables[index];

        let start = Instant::now();
        for iteration in 0..options.iterations {
            let iteration_start = Instant::now();
            dispatchable.bind(&bindings)?;
            dispatchable.dispatch()?;
            if options.wait_each_iteration {
                dispatchable.wait()?;
            }
            debug!(iteration, elapsed = ?iteration_start.elapsed(), "iteration");
        }
        if !options.wait_each_iteration && options.iterations > 0 {
            dispatchable.wait()?;
        }

        let elapsed = start.elapsed();
        info!(
            iterations = options.iterations,
            ?elapsed,
            average = ?elapsed.checked_div(options.iterations.max(1)),
            "dispatch complete"
        );
        Ok(())
    }

    /// Download resource `name` once all submitted work has completed.
    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        let handle = self.resource(name)?;
        let mut data = self.device.download(handle)?;
        if let Some(buffer) = self.named(name)?.desc.as_buffer() {
            data.truncate(buffer.size_in_bytes as usize);
        }
        Ok(data)
    }
}
