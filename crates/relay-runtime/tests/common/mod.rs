//! Common test utilities for runtime tests.
//!
//! Provides graph and resource builders plus an in-memory model importer that
//! computes on host device buffers.

#![allow(dead_code)]

use relay_core::{
    BindPoint, DataType, Device, Error, GraphDesc, GraphNode, Operator, ResourceDesc,
    ResourceHandle, ResourceKind, ResourceSource, Result, TensorRef,
};
use relay_model::{
    Dimension, ModelImporter, ModelSession, SessionOptions, TensorDesc, TensorValue, ValueKind,
};
use relay_runtime::{HostBuffer, HostDevice};
use std::collections::HashMap;
use std::sync::Arc;

/// Install a test subscriber. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("relay_runtime=debug,relay_core=debug")
        .try_init();
}

/// An f32 buffer holding `values`.
pub fn f32_buffer(name: &str, values: &[f32]) -> ResourceDesc {
    let mut desc = ResourceDesc::buffer(name, DataType::F32, (values.len() * 4) as u64);
    if let ResourceKind::Buffer(buffer) = &mut desc.kind {
        buffer.initial_values = bytemuck::cast_slice(values).to_vec();
    }
    desc
}

/// Create a host buffer holding `values` and a source binding all of it.
pub fn host_source(
    device: &HostDevice,
    name: &str,
    values: &[f32],
) -> (ResourceHandle, ResourceSource) {
    let desc = f32_buffer(name, values);
    let size = desc.as_buffer().unwrap().size_in_bytes;
    let resource = device.create_buffer(size, name).unwrap();
    device
        .upload(&resource, 0, bytemuck::cast_slice(values))
        .unwrap();
    (resource.clone(), ResourceSource::new(resource, Arc::new(desc)))
}

pub fn to_f32(bytes: &[u8]) -> Vec<f32> {
    bytemuck::pod_collect_to_vec(bytes)
}

/// `Y = X`, with `count` elements.
pub fn copy_graph(count: u64) -> GraphDesc {
    GraphDesc::new()
        .input(BindPoint::required("X"))
        .output(BindPoint::required("Y"))
        .node(GraphNode::new(
            "copy",
            Operator::Identity,
            vec![TensorRef::Input(0)],
            vec![TensorRef::Output(0)],
            count,
        ))
}

/// `Y = running sum of (X * W)`, where `W` is owned after initialization.
///
/// The product goes through an intermediate, so dispatches need both a
/// temporary and a persistent resource.
pub fn weighted_sum_graph(count: u64) -> GraphDesc {
    GraphDesc::new()
        .input(BindPoint::required("X"))
        .input(BindPoint::required("W"))
        .output(BindPoint::required("Y"))
        .owned_input(1)
        .node(GraphNode::new(
            "scale",
            Operator::Multiply,
            vec![TensorRef::Input(0), TensorRef::Input(1)],
            vec![TensorRef::Intermediate(0)],
            count,
        ))
        .node(GraphNode::new(
            "sum",
            Operator::Accumulate,
            vec![TensorRef::Intermediate(0)],
            vec![TensorRef::Output(0)],
            count,
        ))
}

fn host_buffer(value: &TensorValue) -> Option<&HostBuffer> {
    match value {
        TensorValue::Device { resource, .. } => resource.as_any().downcast_ref::<HostBuffer>(),
        _ => None,
    }
}

/// Importer for the `Y = 2 * X` model.
///
/// - `X:[batch, 4]` f32 with `batch` free
/// - `Y:[1, 4]` f32, or `[batch, 4]` when built with [`dynamic`](Self::dynamic)
///
/// [`with_extra_inputs`](Self::with_extra_inputs) adds inputs the model ignores:
/// `mask:[1]` bool, which has no device representation, and `meta`, a sequence.
#[derive(Clone)]
pub struct DoublingImporter {
    pub inputs: Vec<TensorDesc>,
    pub outputs: Vec<TensorDesc>,
}

impl DoublingImporter {
    pub fn new() -> Self {
        Self {
            inputs: vec![TensorDesc::tensor(
                "X",
                DataType::F32,
                vec![Dimension::named("batch"), Dimension::Fixed(4)],
            )],
            outputs: vec![TensorDesc::tensor(
                "Y",
                DataType::F32,
                vec![Dimension::Fixed(1), Dimension::Fixed(4)],
            )],
        }
    }

    pub fn with_extra_inputs(mut self) -> Self {
        self.inputs.push(TensorDesc::tensor(
            "mask",
            DataType::Bool,
            vec![Dimension::Fixed(1)],
        ));
        self.inputs.push(TensorDesc {
            name: "meta".to_string(),
            value_kind: ValueKind::Sequence,
            dtype: DataType::F32,
            shape: Vec::new(),
        });
        self
    }

    /// Give the output the same free batch dimension as the input.
    pub fn dynamic(mut self) -> Self {
        self.outputs[0].shape = vec![Dimension::named("batch"), Dimension::Fixed(4)];
        self
    }
}

impl ModelImporter for DoublingImporter {
    type Session = DoublingSession;

    fn load(&self, _options: &SessionOptions) -> Result<DoublingSession> {
        Ok(DoublingSession {
            importer: self.clone(),
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            shapes: HashMap::new(),
            runs: 0,
        })
    }
}

pub struct DoublingSession {
    importer: DoublingImporter,
    pub inputs: HashMap<String, TensorValue>,
    pub outputs: HashMap<String, TensorValue>,
    shapes: HashMap<String, Vec<u64>>,
    pub runs: usize,
}

impl ModelSession for DoublingSession {
    fn inputs(&self) -> &[TensorDesc] {
        &self.importer.inputs
    }

    fn outputs(&self) -> &[TensorDesc] {
        &self.importer.outputs
    }

    fn bind_input(&mut self, name: &str, value: TensorValue) -> Result<()> {
        self.inputs.insert(name.to_string(), value);
        Ok(())
    }

    fn bind_output(&mut self, name: &str, value: TensorValue) -> Result<()> {
        self.outputs.insert(name.to_string(), value);
        Ok(())
    }

    fn clear_bindings(&mut self) {
        self.inputs.clear();
        self.outputs.clear();
    }

    fn run(&mut self) -> Result<()> {
        self.runs += 1;
        let input = self
            .inputs
            .get("X")
            .ok_or_else(|| Error::Session("input 'X' is not bound".to_string()))?;
        let (shape, values) = match input {
            TensorValue::Host(tensor) => (tensor.shape.clone(), to_f32(&tensor.data)),
            TensorValue::Device { shape, .. } => {
                let buffer = host_buffer(input)
                    .ok_or_else(|| Error::Session("'X' is not a host buffer".to_string()))?;
                (shape.clone(), to_f32(&buffer.contents()))
            }
            TensorValue::Allocate(_) => {
                return Err(Error::Session("input 'X' has no value".to_string()));
            }
        };

        let doubled: Vec<f32> = values.iter().map(|v| v * 2.0).collect();
        if let Some(buffer) = self.outputs.get("Y").and_then(host_buffer) {
            buffer.write(0, bytemuck::cast_slice(&doubled))?;
        }
        self.shapes.insert("Y".to_string(), shape);
        Ok(())
    }

    fn synchronize_outputs(&mut self) -> Result<()> {
        Ok(())
    }

    fn output_shape(&self, name: &str) -> Option<Vec<u64>> {
        self.shapes.get(name).cloned()
    }
}
