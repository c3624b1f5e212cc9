//! Dispatchable wrapping an imported model.
//!
//! Model tensors are bound by name. Binding is strict when the caller supplies
//! a resource and permissive otherwise: tensors without an explicit binding get
//! a lazily created device buffer, a host tensor, or are left to the importer.

use crate::options::SessionOptions;
use crate::session::{
    HostTensor, MemoryLocation, ModelImporter, ModelSession, TensorDesc, TensorValue,
    element_count,
};
use relay_core::{
    BindingSet, Device, Dispatchable, Error, LifecycleState, ResourceHandle, ResourceSource,
    Result, buffer_tensor_size,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// A model run through a [`ModelSession`] on a [`Device`].
pub struct ModelDispatchable<I: ModelImporter, D: Device> {
    name: String,
    device: Arc<D>,
    importer: I,
    options: SessionOptions,
    session: Option<I::Session>,
    /// Buffers created for tensors the caller did not bind, reused across binds.
    lazy_buffers: HashMap<String, ResourceHandle>,
    /// Concrete shapes for outputs with free dimensions.
    output_shapes: HashMap<String, Vec<u64>>,
}

impl<I: ModelImporter, D: Device> ModelDispatchable<I, D> {
    pub fn new(
        name: impl Into<String>,
        device: Arc<D>,
        importer: I,
        options: SessionOptions,
    ) -> Self {
        Self {
            name: name.into(),
            device,
            importer,
            options,
            session: None,
            lazy_buffers: HashMap::new(),
            output_shapes: HashMap::new(),
        }
    }

    /// Fix the shape of outputs with free dimensions, typically to the shapes
    /// a catalogue trial run observed.
    ///
    /// An output with a known shape can be bound to an explicit resource and
    /// gets a lazily created buffer when left unbound.
    pub fn with_output_shapes(
        mut self,
        shapes: impl IntoIterator<Item = (String, Vec<u64>)>,
    ) -> Self {
        self.output_shapes.extend(shapes);
        self
    }

    /// The loaded session, after initialization.
    pub fn session(&self) -> Option<&I::Session> {
        self.session.as_ref()
    }

    /// Buffer created for tensor `name` because nothing was bound to it.
    pub fn lazy_buffer(&self, name: &str) -> Option<&ResourceHandle> {
        self.lazy_buffers.get(name)
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    fn not_initialized(&self, operation: &'static str) -> Error {
        Error::Lifecycle {
            name: self.name.clone(),
            operation,
            state: LifecycleState::Constructed,
        }
    }
}

impl<I: ModelImporter, D: Device> Dispatchable for ModelDispatchable<I, D> {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(skip_all, fields(name = %self.name))]
    fn initialize(&mut self) -> Result<()> {
        let session = self.importer.load(&self.options)?;
        debug!(
            inputs = session.inputs().len(),
            outputs = session.outputs().len(),
            "model loaded"
        );
        self.session = Some(session);
        self.device.check_removed()
    }

    #[tracing::instrument(skip_all, fields(name = %self.name))]
    fn bind(&mut self, bindings: &BindingSet) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(self.not_initialized("bind"));
        };

        let inputs: Vec<TensorDesc> =
            session.inputs().iter().map(|t| self.options.apply(t)).collect();
        let outputs: Vec<TensorDesc> =
            session.outputs().iter().map(|t| self.options.apply(t)).collect();

        session.clear_bindings();

        for tensor in &inputs {
            match tensor_value(&*self.device, &mut self.lazy_buffers, tensor, Role::Input, bindings)? {
                Some(value) => session.bind_input(&tensor.name, value)?,
                // Only non-tensor inputs stay unbound.
                None => trace!(tensor = %tensor.name, "non-tensor input left unbound"),
            }
        }

        for tensor in &outputs {
            let shape = self.output_shapes.get(&tensor.name).map(Vec::as_slice);
            let value = tensor_value(
                &*self.device,
                &mut self.lazy_buffers,
                tensor,
                Role::Output(shape),
                bindings,
            )?
                .unwrap_or_else(|| {
                    let location = if tensor.is_tensor() && tensor.dtype.is_device_supported() {
                        MemoryLocation::Device
                    } else {
                        MemoryLocation::Host
                    };
                    debug!(tensor = %tensor.name, ?location, "importer allocates output");
                    TensorValue::Allocate(location)
                });
            session.bind_output(&tensor.name, value)?;
        }

        self.device.check_removed()
    }

    #[tracing::instrument(skip_all, fields(name = %self.name))]
    fn dispatch(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(self.not_initialized("dispatch"));
        };
        session.run()?;
        self.device.check_removed()
    }

    fn wait(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(self.not_initialized("wait"));
        };
        session.synchronize_outputs()?;
        self.device.check_removed()
    }
}

/// Which side of the model a tensor is bound on.
#[derive(Debug, Clone, Copy)]
enum Role<'a> {
    Input,
    /// Output, with the configured shape for free dimensions if one was given.
    Output(Option<&'a [u64]>),
}

/// Value to bind to `tensor`, or `None` to leave the decision to the caller.
fn tensor_value<D: Device>(
    device: &D,
    lazy_buffers: &mut HashMap<String, ResourceHandle>,
    tensor: &TensorDesc,
    role: Role<'_>,
    bindings: &BindingSet,
) -> Result<Option<TensorValue>> {
    let explicit = bindings.get(&tensor.name);

    if !tensor.is_tensor() {
        if explicit.is_some() {
            return Err(Error::UnsupportedBinding {
                tensor: tensor.name.clone(),
                reason: "only tensor values can be bound to resources".to_string(),
            });
        }
        return Ok(None);
    }

    // Free input dimensions can always be fixed to 1. Free output dimensions
    // depend on what the model computes.
    let sizes = match role {
        Role::Input => {
            if tensor.has_free_dims() {
                warn!(tensor = %tensor.name, "forcing free input dimensions to 1");
            }
            Some(tensor.sizes_with_free_as_one())
        }
        Role::Output(configured) => match (tensor.static_sizes(), configured) {
            (Some(sizes), _) => Some(sizes),
            (None, Some(shape)) => {
                check_configured_shape(tensor, shape)?;
                debug!(tensor = %tensor.name, ?shape, "using configured output shape");
                Some(shape.to_vec())
            }
            (None, None) => None,
        },
    };

    match (explicit, sizes) {
        (Some(sources), None) => Err(Error::NonStaticShape {
            tensor: tensor.name.clone(),
            resource: sources
                .first()
                .map(|source| source.desc.name.clone())
                .unwrap_or_default(),
        }),

        (Some(sources), Some(sizes)) => {
            if !tensor.dtype.is_device_supported() {
                return Err(Error::UnsupportedElementType {
                    tensor: tensor.name.clone(),
                    dtype: tensor.dtype,
                });
            }
            let source = single_source(&tensor.name, sources)?;
            let required = element_count(&sizes)
                .zip(tensor.dtype.size())
                .and_then(|(count, size)| count.checked_mul(size));
            if required.is_none_or(|required| source.resource.size() < required) {
                return Err(Error::UnsupportedBinding {
                    tensor: tensor.name.clone(),
                    reason: format!(
                        "resource '{}' holds {} bytes but shape {sizes:?} of {:?} needs more",
                        source.desc.name,
                        source.resource.size(),
                        tensor.dtype
                    ),
                });
            }
            trace!(tensor = %tensor.name, resource = %source.desc.name, "bound explicitly");
            Ok(Some(TensorValue::Device {
                resource: source.resource.clone(),
                shape: sizes,
                dtype: tensor.dtype,
            }))
        }

        (None, Some(sizes)) if tensor.dtype.is_device_supported() => {
            let resource = match lazy_buffers.get(&tensor.name) {
                Some(resource) => resource.clone(),
                None => {
                    let size = buffer_tensor_size(tensor.dtype, &sizes).ok_or_else(|| {
                        Error::UnsupportedBinding {
                            tensor: tensor.name.clone(),
                            reason: format!("shape {sizes:?} is too large"),
                        }
                    })?;
                    warn!(tensor = %tensor.name, size, "no binding supplied; allocating device buffer");
                    let resource = device.create_buffer(size, &tensor.name)?;
                    lazy_buffers.insert(tensor.name.clone(), resource.clone());
                    resource
                }
            };
            Ok(Some(TensorValue::Device {
                resource,
                shape: sizes,
                dtype: tensor.dtype,
            }))
        }

        (None, Some(sizes)) => {
            debug!(tensor = %tensor.name, dtype = ?tensor.dtype, "allocating host tensor");
            Ok(Some(TensorValue::Host(HostTensor::zeros(
                &tensor.name,
                tensor.dtype,
                sizes,
            )?)))
        }

        (None, None) => Ok(None),
    }
}

/// A configured output shape must keep the tensor's rank and fixed dimensions.
fn check_configured_shape(tensor: &TensorDesc, shape: &[u64]) -> Result<()> {
    let matches = shape.len() == tensor.shape.len()
        && tensor
            .shape
            .iter()
            .zip(shape)
            .all(|(dim, &size)| dim.fixed().is_none_or(|fixed| fixed == size));
    if matches {
        return Ok(());
    }
    Err(Error::UnsupportedBinding {
        tensor: tensor.name.clone(),
        reason: format!("configured shape {shape:?} does not fit {:?}", tensor.shape),
    })
}

/// The one resource source bound to a model tensor.
fn single_source<'a>(tensor: &str, sources: &'a [ResourceSource]) -> Result<&'a ResourceSource> {
    let unsupported = |reason: &str| Error::UnsupportedBinding {
        tensor: tensor.to_string(),
        reason: reason.to_string(),
    };

    let [source] = sources else {
        return Err(unsupported("model tensors must map to a single binding source"));
    };
    if source.counter.is_some() {
        return Err(unsupported("model tensors do not support counter resources"));
    }
    if source.element_offset != 0 {
        return Err(unsupported("model tensors do not support binding offsets"));
    }
    Ok(source)
}
