//! Model dispatchable tests against the in-memory doubling model.

mod common;

use common::{DoublingImporter, host_source, init_tracing, to_f32};
use relay_core::{
    BindingSet, Command, DataType, Device, Dispatchable, Error, Lifecycle, LifecycleState,
    ResourceDesc, ResourceKind,
};
use relay_model::{
    MemoryLocation, ModelDispatchable, SessionOptions, TensorValue, resolve_catalogue,
};
use relay_runtime::{Executor, ExecutorOptions, HostDevice};
use std::sync::Arc;

type DoublingModel = ModelDispatchable<DoublingImporter, HostDevice>;

fn model(device: &Arc<HostDevice>, importer: DoublingImporter) -> Lifecycle<DoublingModel> {
    Lifecycle::new(ModelDispatchable::new(
        "double",
        device.clone(),
        importer,
        SessionOptions::default(),
    ))
}

#[test]
fn test_explicit_bindings_end_to_end() {
    init_tracing();
    let device = Arc::new(HostDevice::new());
    let (_, x) = host_source(&device, "x", &[1.0, 2.0, 3.0, 4.0]);
    let (y_buffer, y) = host_source(&device, "y", &[0.0; 4]);

    let mut model = model(&device, DoublingImporter::new());
    model.initialize().unwrap();
    model
        .bind(&BindingSet::new().with("X", vec![x]).with("Y", vec![y]))
        .unwrap();
    model.dispatch().unwrap();
    model.wait().unwrap();

    let y_values = to_f32(&device.download(&y_buffer).unwrap());
    assert_eq!(y_values, vec![2.0, 4.0, 6.0, 8.0]);
    assert_eq!(model.inner().session().unwrap().runs, 1);
    // Nothing was created on the caller's behalf.
    assert!(model.inner().lazy_buffer("X").is_none());
    assert!(model.inner().lazy_buffer("Y").is_none());
}

#[test]
fn test_unbound_tensors_reuse_lazy_buffers() {
    let device = Arc::new(HostDevice::new());
    let mut model = model(&device, DoublingImporter::new().with_extra_inputs());
    model.initialize().unwrap();

    model.bind(&BindingSet::new()).unwrap();
    let x = model.inner().lazy_buffer("X").cloned().unwrap();
    assert_eq!(x.size(), 16);
    assert_eq!(device.buffers_created(), 2);

    model.bind(&BindingSet::new()).unwrap();
    assert!(Arc::ptr_eq(&x, model.inner().lazy_buffer("X").unwrap()));
    assert_eq!(device.buffers_created(), 2);

    let session = model.inner().session().unwrap();
    assert!(matches!(session.inputs.get("X"), Some(TensorValue::Device { .. })));
    match session.inputs.get("mask") {
        Some(TensorValue::Host(tensor)) => assert_eq!(tensor.data, vec![0]),
        other => panic!("mask should be a host tensor, got {other:?}"),
    }
    assert!(session.inputs.get("meta").is_none());
    assert!(matches!(session.outputs.get("Y"), Some(TensorValue::Device { .. })));
}

#[test]
fn test_dynamic_output_left_to_importer() {
    let device = Arc::new(HostDevice::new());
    let mut model = model(&device, DoublingImporter::new().dynamic());
    model.initialize().unwrap();
    model.bind(&BindingSet::new()).unwrap();

    let session = model.inner().session().unwrap();
    assert!(matches!(
        session.outputs.get("Y"),
        Some(TensorValue::Allocate(MemoryLocation::Device))
    ));
    assert!(model.inner().lazy_buffer("Y").is_none());
    // Only X got a buffer.
    assert_eq!(device.buffers_created(), 1);
}

#[test]
fn test_dynamic_output_cannot_be_bound_explicitly() {
    let device = Arc::new(HostDevice::new());
    let (_, y) = host_source(&device, "y", &[0.0; 4]);
    let mut model = model(&device, DoublingImporter::new().dynamic());
    model.initialize().unwrap();

    let err = model.bind(&BindingSet::new().with("Y", vec![y])).unwrap_err();
    match err {
        Error::NonStaticShape { tensor, resource } => {
            assert_eq!(tensor, "Y");
            assert_eq!(resource, "y");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(model.state(), LifecycleState::Initialized);
}

#[test]
fn test_binding_offset_rejected() {
    let device = Arc::new(HostDevice::new());
    let (_, x) = host_source(&device, "x", &[0.0; 8]);
    let mut model = model(&device, DoublingImporter::new());
    model.initialize().unwrap();

    let err = model
        .bind(&BindingSet::new().with("X", vec![x.with_offset(4, 4)]))
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedBinding { ref tensor, .. } if tensor == "X"));
}

#[test]
fn test_multiple_sources_rejected() {
    let device = Arc::new(HostDevice::new());
    let (_, a) = host_source(&device, "a", &[0.0; 4]);
    let (_, b) = host_source(&device, "b", &[0.0; 4]);
    let mut model = model(&device, DoublingImporter::new());
    model.initialize().unwrap();

    let err = model
        .bind(&BindingSet::new().with("X", vec![a, b]))
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedBinding { ref tensor, .. } if tensor == "X"));
}

#[test]
fn test_undersized_resource_rejected() {
    let device = Arc::new(HostDevice::new());
    let (_, x) = host_source(&device, "x", &[0.0; 2]);
    let mut model = model(&device, DoublingImporter::new());
    model.initialize().unwrap();

    let err = model.bind(&BindingSet::new().with("X", vec![x])).unwrap_err();
    match err {
        Error::UnsupportedBinding { tensor, reason } => {
            assert_eq!(tensor, "X");
            assert!(reason.contains("8 bytes"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_non_tensor_and_host_only_inputs_reject_resources() {
    let device = Arc::new(HostDevice::new());
    let (_, meta) = host_source(&device, "meta", &[0.0; 4]);
    let (_, mask) = host_source(&device, "mask", &[0.0; 4]);
    let mut model = model(&device, DoublingImporter::new().with_extra_inputs());
    model.initialize().unwrap();

    let err = model
        .bind(&BindingSet::new().with("meta", vec![meta]))
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedBinding { ref tensor, .. } if tensor == "meta"));

    let err = model
        .bind(&BindingSet::new().with("mask", vec![mask]))
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedElementType { ref tensor, .. } if tensor == "mask"));
}

#[test]
fn test_calls_before_initialize_rejected() {
    let device = Arc::new(HostDevice::new());
    let mut model: DoublingModel = ModelDispatchable::new(
        "double",
        device,
        DoublingImporter::new(),
        SessionOptions::default(),
    );
    assert!(matches!(
        model.bind(&BindingSet::new()),
        Err(Error::Lifecycle { operation: "bind", .. })
    ));
    assert!(matches!(model.dispatch(), Err(Error::Lifecycle { .. })));
}

#[test]
fn test_device_removal_fails_model() {
    let device = Arc::new(HostDevice::new());
    let mut model = model(&device, DoublingImporter::new());
    model.initialize().unwrap();
    model.bind(&BindingSet::new()).unwrap();

    device.remove("driver reset");
    let err = model.dispatch().unwrap_err();
    assert!(err.is_device_lost());
    assert_eq!(model.state(), LifecycleState::Failed);
}

#[test]
fn test_catalogue_workload_runs_through_executor() {
    init_tracing();
    let importer = DoublingImporter::new();
    let catalogue = resolve_catalogue(&importer, "double", &SessionOptions::default()).unwrap();
    assert!(!catalogue.trial_run);

    let mut workload = catalogue.workload();
    let x = workload
        .resources
        .iter_mut()
        .find(|desc| desc.name == "X")
        .unwrap();
    if let ResourceKind::Buffer(buffer) = &mut x.kind {
        buffer.initial_values = bytemuck::cast_slice(&[1.0f32, 2.0, 3.0, 4.0]).to_vec();
    }
    workload.commands.push(Command::Read {
        resource: "Y".to_string(),
    });

    let device = Arc::new(HostDevice::new());
    let mut executor =
        Executor::new(device.clone(), &workload.resources, ExecutorOptions::default()).unwrap();
    executor
        .register(ModelDispatchable::new(
            "double",
            device,
            importer,
            SessionOptions::default(),
        ))
        .unwrap();
    executor.initialize().unwrap();

    let reads = executor.execute(&workload.commands).unwrap();
    assert_eq!(reads.len(), 1);
    assert_eq!(reads[0].0, "Y");
    assert_eq!(to_f32(&reads[0].1), vec![2.0, 4.0, 6.0, 8.0]);
    assert_eq!(executor.dispatch_count("double"), Some(1));
}

#[test]
fn test_dynamic_catalogue_workload_runs_through_executor() {
    init_tracing();
    let importer = DoublingImporter::new().dynamic();
    let catalogue = resolve_catalogue(&importer, "double", &SessionOptions::default()).unwrap();
    assert!(catalogue.trial_run);
    assert_eq!(
        catalogue.resource("Y"),
        Some(&ResourceDesc::buffer("Y", DataType::F32, 16))
    );
    assert_eq!(catalogue.output_shapes.get("Y"), Some(&vec![1, 4]));

    let mut workload = catalogue.workload();
    let x = workload
        .resources
        .iter_mut()
        .find(|desc| desc.name == "X")
        .unwrap();
    if let ResourceKind::Buffer(buffer) = &mut x.kind {
        buffer.initial_values = bytemuck::cast_slice(&[1.0f32, 2.0, 3.0, 4.0]).to_vec();
    }
    workload.commands.push(Command::Read {
        resource: "Y".to_string(),
    });

    let device = Arc::new(HostDevice::new());
    let mut executor =
        Executor::new(device.clone(), &workload.resources, ExecutorOptions::default()).unwrap();
    executor
        .register(
            ModelDispatchable::new("double", device, importer, SessionOptions::default())
                .with_output_shapes(catalogue.output_shapes.clone()),
        )
        .unwrap();
    executor.initialize().unwrap();

    let reads = executor.execute(&workload.commands).unwrap();
    assert_eq!(reads.len(), 1);
    assert_eq!(to_f32(&reads[0].1), vec![2.0, 4.0, 6.0, 8.0]);
    assert_eq!(executor.dispatchable_state("double"), Some(LifecycleState::Dispatched));
    assert_eq!(executor.dispatch_count("double"), Some(1));
}

#[test]
fn test_configured_output_shape_gets_lazy_buffer() {
    let device = Arc::new(HostDevice::new());
    let mut model = Lifecycle::new(
        ModelDispatchable::new(
            "double",
            device.clone(),
            DoublingImporter::new().dynamic(),
            SessionOptions::default(),
        )
        .with_output_shapes([("Y".to_string(), vec![1, 4])]),
    );
    model.initialize().unwrap();
    model.bind(&BindingSet::new()).unwrap();

    let y = model.inner().lazy_buffer("Y").cloned().unwrap();
    assert_eq!(y.size(), 16);
    match model.inner().session().unwrap().outputs.get("Y") {
        Some(TensorValue::Device { shape, .. }) => assert_eq!(shape, &vec![1, 4]),
        other => panic!("Y should be a device tensor, got {other:?}"),
    }
}

#[test]
fn test_configured_output_shape_must_fit_declaration() {
    let device = Arc::new(HostDevice::new());
    let (_, y) = host_source(&device, "y", &[0.0; 4]);
    let mut model = Lifecycle::new(
        ModelDispatchable::new(
            "double",
            device.clone(),
            DoublingImporter::new().dynamic(),
            SessionOptions::default(),
        )
        .with_output_shapes([("Y".to_string(), vec![2, 2])]),
    );
    model.initialize().unwrap();

    let err = model.bind(&BindingSet::new().with("Y", vec![y])).unwrap_err();
    assert!(matches!(err, Error::UnsupportedBinding { ref tensor, .. } if tensor == "Y"));
    assert_eq!(model.state(), LifecycleState::Initialized);
}
