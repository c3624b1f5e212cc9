//! Workload execution tests on the host device.

mod common;

use common::{copy_graph, f32_buffer, init_tracing, to_f32, weighted_sum_graph};
use relay_core::{
    BindingSet, BindingSource, Command, DataType, DispatchCommand, Error, LifecycleState,
    ResourceDesc, ResourceKind, ResourceSource, TextureDesc, Workload,
};
use relay_runtime::{Executor, ExecutorOptions, GraphDispatchable, HostDevice};
use std::sync::Arc;

fn copy_workload() -> Workload {
    Workload::new()
        .resource(f32_buffer("x", &[1.0, 2.0, 3.0, 4.0]))
        .resource(ResourceDesc::buffer("y", DataType::F32, 16))
        .command(Command::Dispatch(
            DispatchCommand::new("copy")
                .bind("X", vec![BindingSource::new("x")])
                .bind("Y", vec![BindingSource::new("y")]),
        ))
        .command(Command::Read {
            resource: "y".to_string(),
        })
}

fn executor(workload: &Workload, options: ExecutorOptions) -> Executor<HostDevice> {
    let device = Arc::new(HostDevice::new());
    Executor::new(device, &workload.resources, options).unwrap()
}

fn copy_dispatchable(device: &Arc<HostDevice>) -> GraphDispatchable<HostDevice> {
    GraphDispatchable::new("copy", device.clone(), copy_graph(4), BindingSet::new())
}

#[test]
fn test_workload_runs_and_reads() {
    init_tracing();
    let workload = copy_workload();
    let mut executor = executor(&workload, ExecutorOptions::default());
    let dispatchable = copy_dispatchable(executor.device());
    executor.register(dispatchable).unwrap();
    executor.initialize().unwrap();

    let reads = executor.execute(&workload.commands).unwrap();
    assert_eq!(reads.len(), 1);
    assert_eq!(reads[0].0, "y");
    assert_eq!(to_f32(&reads[0].1), vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(executor.dispatchable_state("copy"), Some(LifecycleState::Dispatched));
    assert_eq!(executor.dispatch_count("copy"), Some(1));
}

#[test]
fn test_initial_values_shorter_than_buffer_are_zero_filled() {
    let mut desc = ResourceDesc::buffer("x", DataType::F32, 16);
    if let ResourceKind::Buffer(buffer) = &mut desc.kind {
        buffer.initial_values = bytemuck::cast_slice(&[7.0f32]).to_vec();
    }
    let executor = executor(&Workload::new().resource(desc), ExecutorOptions::default());
    assert_eq!(to_f32(&executor.read("x").unwrap()), vec![7.0, 0.0, 0.0, 0.0]);
}

#[test]
fn test_initial_values_longer_than_buffer_rejected() {
    let mut desc = ResourceDesc::buffer("x", DataType::F32, 4);
    if let ResourceKind::Buffer(buffer) = &mut desc.kind {
        buffer.initial_values = vec![0; 8];
    }
    let device = Arc::new(HostDevice::new());
    let result = Executor::new(device, &[desc], ExecutorOptions::default());
    assert!(matches!(result, Err(Error::Device(ref message)) if message.contains("8 bytes")));
}

#[test]
fn test_duplicate_resource_rejected() {
    let device = Arc::new(HostDevice::new());
    let resources = [
        ResourceDesc::buffer("x", DataType::F32, 16),
        ResourceDesc::buffer("x", DataType::F32, 32),
    ];
    let result = Executor::new(device, &resources, ExecutorOptions::default());
    assert!(matches!(result, Err(Error::Device(_))));
}

#[test]
fn test_duplicate_dispatchable_rejected() {
    let workload = copy_workload();
    let mut executor = executor(&workload, ExecutorOptions::default());
    let first = copy_dispatchable(executor.device());
    let second = copy_dispatchable(executor.device());
    executor.register(first).unwrap();
    assert!(matches!(executor.register(second), Err(Error::Device(_))));
}

#[test]
fn test_unknown_names_rejected() {
    let workload = copy_workload();
    let mut executor = executor(&workload, ExecutorOptions::default());
    let dispatchable = copy_dispatchable(executor.device());
    executor.register(dispatchable).unwrap();
    executor.initialize().unwrap();

    let missing_resource = Command::Dispatch(
        DispatchCommand::new("copy").bind("X", vec![BindingSource::new("nope")]),
    );
    assert!(matches!(
        executor.execute(&[missing_resource]),
        Err(Error::UnknownResource(ref name)) if name == "nope"
    ));

    let missing_dispatchable = Command::Dispatch(DispatchCommand::new("other"));
    assert!(matches!(
        executor.execute(&[missing_dispatchable]),
        Err(Error::UnknownDispatchable(ref name)) if name == "other"
    ));

    let missing_read = Command::Read {
        resource: "z".to_string(),
    };
    assert!(matches!(
        executor.execute(&[missing_read]),
        Err(Error::UnknownResource(_))
    ));
}

#[test]
fn test_binding_set_applies_offset_and_element_size() {
    let workload = Workload::new()
        .resource(ResourceDesc::buffer("x", DataType::F32, 64))
        .resource(ResourceDesc::buffer("counter", DataType::U32, 4));
    let executor = executor(&workload, ExecutorOptions::default());

    let descs = DispatchCommand::new("copy")
        .bind(
            "X",
            vec![
                BindingSource::new("x")
                    .with_element_size(8)
                    .with_offset(2)
                    .with_counter("counter"),
            ],
        )
        .bindings;
    let set = executor.binding_set(&descs).unwrap();

    let sources: &[ResourceSource] = set.get("X").unwrap();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].element_offset, 2);
    assert_eq!(sources[0].element_size_in_bytes, 8);
    assert!(Arc::ptr_eq(
        sources[0].counter.as_ref().unwrap(),
        executor.resource("counter").unwrap()
    ));
}

#[test]
fn test_textures_are_created_but_cannot_be_bound() {
    let texture = ResourceDesc {
        name: "image".to_string(),
        kind: ResourceKind::Texture(TextureDesc {
            width: 4,
            height: 2,
            format: DataType::F32,
        }),
    };
    let workload = copy_workload().resource(texture);
    let mut executor = executor(&workload, ExecutorOptions::default());
    assert_eq!(executor.resource("image").unwrap().size(), 32);

    let dispatchable = copy_dispatchable(executor.device());
    executor.register(dispatchable).unwrap();
    executor.initialize().unwrap();
    let command = Command::Dispatch(
        DispatchCommand::new("copy")
            .bind("X", vec![BindingSource::new("image")])
            .bind("Y", vec![BindingSource::new("y")]),
    );
    assert!(matches!(
        executor.execute(&[command]),
        Err(Error::UnsupportedResourceKind { kind: "texture", .. })
    ));
    assert_eq!(executor.dispatchable_state("copy"), Some(LifecycleState::Initialized));
}

#[test]
fn test_iterations_without_waiting_each_time() {
    let workload = Workload::new()
        .resource(f32_buffer("x", &[1.0, 2.0, 3.0, 4.0]))
        .resource(f32_buffer("w", &[0.5; 4]))
        .resource(ResourceDesc::buffer("y", DataType::F32, 16))
        .command(Command::Dispatch(
            DispatchCommand::new("weighted")
                .bind("X", vec![BindingSource::new("x")])
                .bind("Y", vec![BindingSource::new("y")]),
        ))
        .command(Command::Read {
            resource: "y".to_string(),
        });
    let options = ExecutorOptions::default()
        .with_iterations(4)
        .with_wait_each_iteration(false);
    let mut executor = executor(&workload, options);

    let init = executor
        .binding_set(
            &DispatchCommand::new("weighted")
                .bind("W", vec![BindingSource::new("w")])
                .bindings,
        )
        .unwrap();
    let dispatchable = GraphDispatchable::new(
        "weighted",
        executor.device().clone(),
        weighted_sum_graph(4),
        init,
    );
    executor.register(dispatchable).unwrap();
    executor.initialize().unwrap();

    let reads = executor.execute(&workload.commands).unwrap();
    assert_eq!(to_f32(&reads[0].1), vec![2.0, 4.0, 6.0, 8.0]);
    assert_eq!(executor.dispatch_count("weighted"), Some(4));
    assert_eq!(executor.device().in_flight(), 0);
}

#[test]
fn test_initialize_skips_initialized_dispatchables() {
    let workload = copy_workload();
    let mut executor = executor(&workload, ExecutorOptions::default());
    let dispatchable = copy_dispatchable(executor.device());
    executor.register(dispatchable).unwrap();
    executor.initialize().unwrap();
    let heaps = executor.device().heaps_created();

    executor.initialize().unwrap();
    assert_eq!(executor.device().heaps_created(), heaps);
    assert_eq!(executor.dispatchable_state("copy"), Some(LifecycleState::Initialized));
}
