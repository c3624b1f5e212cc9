//! Resource catalogue for an imported model, with output shapes discovered by
//! a trial run when the model cannot report them statically.

use crate::options::SessionOptions;
use crate::session::{
    HostTensor, MemoryLocation, ModelImporter, ModelSession, TensorDesc, TensorValue,
    element_count,
};
use relay_core::{
    BindingDescs, BindingSource, Command, DispatchCommand, Error, ResourceDesc, ResourceKind,
    Result, Workload, buffer_tensor_size,
};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Resources and bindings needed to dispatch one model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCatalogue {
    /// Name of the model dispatchable.
    pub model: String,

    /// One buffer per input, then one per output, in model order.
    pub resources: Vec<ResourceDesc>,

    /// Every tensor bound to the resource of the same name.
    pub bindings: BindingDescs,

    /// Whether output sizes came from a trial run.
    pub trial_run: bool,

    /// Shapes the trial run produced for outputs with free dimensions.
    ///
    /// Pass these to [`ModelDispatchable::with_output_shapes`] so the
    /// trial-sized output resources can be bound explicitly.
    ///
    /// [`ModelDispatchable::with_output_shapes`]: crate::ModelDispatchable::with_output_shapes
    pub output_shapes: BTreeMap<String, Vec<u64>>,
}

impl ModelCatalogue {
    pub fn resource(&self, name: &str) -> Option<&ResourceDesc> {
        self.resources.iter().find(|desc| desc.name == name)
    }

    /// Dispatch of the model with every tensor bound.
    pub fn dispatch_command(&self) -> DispatchCommand {
        DispatchCommand {
            dispatchable: self.model.clone(),
            bindings: self.bindings.clone(),
        }
    }

    /// Workload creating every resource and dispatching the model once.
    pub fn workload(&self) -> Workload {
        Workload {
            resources: self.resources.clone(),
            commands: vec![Command::Dispatch(self.dispatch_command())],
        }
    }
}

/// Build the resource catalogue for a model.
///
/// Dimension overrides are applied first and remaining free input dimensions
/// are fixed to 1. If any output still has a free dimension, the model is run
/// once on zero-filled inputs and output sizes are rewritten from the shapes
/// it produced. The numeric results are discarded.
///
/// # Errors
///
/// - [`Error::ModelImport`] for non-tensor inputs or outputs
/// - [`Error::UnsupportedElementType`] for types without a device representation
/// - [`Error::TrialExecution`] if the trial run fails or reports no shape
#[tracing::instrument(skip_all, fields(model = name))]
pub fn resolve_catalogue<I: ModelImporter>(
    importer: &I,
    name: &str,
    options: &SessionOptions,
) -> Result<ModelCatalogue> {
    let mut session = importer.load(options)?;

    let inputs: Vec<TensorDesc> = session.inputs().iter().map(|t| options.apply(t)).collect();
    let outputs: Vec<TensorDesc> = session.outputs().iter().map(|t| options.apply(t)).collect();

    let mut catalogue = ModelCatalogue {
        model: name.to_string(),
        resources: Vec::with_capacity(inputs.len() + outputs.len()),
        bindings: BindingDescs::new(),
        trial_run: false,
        output_shapes: BTreeMap::new(),
    };

    for tensor in inputs.iter().chain(&outputs) {
        let (desc, source) = describe(tensor)?;
        catalogue.resources.push(desc);
        catalogue.bindings.insert(tensor.name.clone(), vec![source]);
    }

    if !outputs.iter().any(TensorDesc::has_free_dims) {
        debug!("output shapes are static; no trial run needed");
        return Ok(catalogue);
    }

    info!("running model once to discover output shapes");
    let trial_failed = |reason: String| Error::TrialExecution {
        model: name.to_string(),
        reason,
    };

    session.clear_bindings();
    for input in &inputs {
        let zeros = HostTensor::zeros(&input.name, input.dtype, input.sizes_with_free_as_one())?;
        session
            .bind_input(&input.name, TensorValue::Host(zeros))
            .map_err(|err| trial_failed(err.to_string()))?;
    }
    for output in &outputs {
        session
            .bind_output(&output.name, TensorValue::Allocate(MemoryLocation::Host))
            .map_err(|err| trial_failed(err.to_string()))?;
    }
    session
        .run()
        .and_then(|()| session.synchronize_outputs())
        .map_err(|err| trial_failed(err.to_string()))?;

    for output in &outputs {
        let shape = session
            .output_shape(&output.name)
            .ok_or_else(|| trial_failed(format!("no shape produced for output '{}'", output.name)))?;
        let (size, count) = buffer_tensor_size(output.dtype, &shape)
            .zip(element_count(&shape))
            .ok_or_else(|| trial_failed(format!("output '{}' shape {shape:?} is too large", output.name)))?;

        if let Some(ResourceDesc {
            kind: ResourceKind::Buffer(buffer),
            ..
        }) = catalogue
            .resources
            .iter_mut()
            .find(|desc| desc.name == output.name)
        {
            buffer.size_in_bytes = size;
        }
        if let Some(source) = catalogue
            .bindings
            .get_mut(&output.name)
            .and_then(|sources| sources.first_mut())
        {
            source.element_count = count;
        }
        debug!(output = %output.name, ?shape, size, "resolved output size");
        if output.has_free_dims() {
            catalogue.output_shapes.insert(output.name.clone(), shape);
        }
    }

    session.clear_bindings();
    catalogue.trial_run = true;
    Ok(catalogue)
}

/// Resource and binding source for one model tensor.
fn describe(tensor: &TensorDesc) -> Result<(ResourceDesc, BindingSource)> {
    if !tensor.is_tensor() {
        return Err(Error::ModelImport(format!(
            "unsupported non-tensor input/output '{}'",
            tensor.name
        )));
    }
    let unsupported = || Error::UnsupportedElementType {
        tensor: tensor.name.clone(),
        dtype: tensor.dtype,
    };
    if !tensor.dtype.is_device_supported() {
        return Err(unsupported());
    }
    let element_size = tensor.dtype.size().ok_or_else(unsupported)?;

    if tensor.has_free_dims() {
        warn!(tensor = %tensor.name, "free dimensions sized as 1");
    }
    // Output sizes computed here may be rewritten after the trial run.
    let sizes = tensor.sizes_with_free_as_one();
    let (size_in_bytes, count) = buffer_tensor_size(tensor.dtype, &sizes)
        .zip(element_count(&sizes))
        .ok_or_else(|| {
            Error::ModelImport(format!("tensor '{}' shape {sizes:?} is too large", tensor.name))
        })?;

    Ok((
        ResourceDesc::buffer(&tensor.name, tensor.dtype, size_in_bytes),
        BindingSource::new(&tensor.name)
            .with_element_count(count)
            .with_element_size(element_size),
    ))
}
