//! Declarative description of a native operator graph.
//!
//! A [`GraphDesc`] is what a [`Device`](crate::Device) compiles into a
//! dispatchable object. Tensors are f32 arrays referenced by flattened bind
//! point slot (`Input`/`Output`) or by intermediate index. Intermediates live
//! in the temporary resource; owned inputs and accumulator state live in the
//! persistent resource.

use crate::binding::{BindPoint, total_slot_count};
use crate::{Error, Result};

/// Largest tensor a node may declare. Keeps layout arithmetic (aligned
/// regions summed into transient resources) free of overflow.
pub const MAX_TENSOR_BYTES: u64 = 1 << 40;

/// Operators a device knows how to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    /// `out = a`
    Identity,
    /// `out = a + b`
    Add,
    /// `out = a * b`
    Multiply,
    /// `state += a; out = state`. State persists across iterations.
    Accumulate,
}

impl Operator {
    /// Number of (inputs, outputs) the operator takes.
    pub fn arity(&self) -> (usize, usize) {
        match self {
            Operator::Identity | Operator::Accumulate => (1, 1),
            Operator::Add | Operator::Multiply => (2, 1),
        }
    }
}

/// Reference to a tensor used by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorRef {
    /// Flattened input slot.
    Input(usize),
    /// Flattened output slot.
    Output(usize),
    /// Intermediate produced by an earlier node.
    Intermediate(usize),
}

/// A single operation in the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    /// Node name for debugging.
    pub name: String,

    pub operator: Operator,

    pub inputs: Vec<TensorRef>,

    pub outputs: Vec<TensorRef>,

    /// Number of f32 elements every tensor of this node holds.
    pub element_count: u64,
}

impl GraphNode {
    /// Create a node.
    pub fn new(
        name: impl Into<String>,
        operator: Operator,
        inputs: Vec<TensorRef>,
        outputs: Vec<TensorRef>,
        element_count: u64,
    ) -> Self {
        Self {
            name: name.into(),
            operator,
            inputs,
            outputs,
            element_count,
        }
    }

    /// Bytes occupied by one tensor of this node, or `None` on overflow.
    pub fn checked_tensor_bytes(&self) -> Option<u64> {
        self.element_count.checked_mul(4)
    }

    /// Bytes occupied by one tensor of this node.
    ///
    /// Saturates for graphs that have not passed [`GraphDesc::validate`].
    pub fn tensor_bytes(&self) -> u64 {
        self.checked_tensor_bytes().unwrap_or(u64::MAX)
    }
}

/// A graph of operators plus its bind point declaration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphDesc {
    /// Input bind points, in declaration order.
    pub inputs: Vec<BindPoint>,

    /// Output bind points, in declaration order.
    pub outputs: Vec<BindPoint>,

    /// Flattened input slots whose contents are consumed once at
    /// initialization and owned by the device afterwards.
    pub owned_inputs: Vec<usize>,

    /// Nodes in execution order.
    pub nodes: Vec<GraphNode>,

    /// Number of intermediate tensors.
    pub intermediate_count: usize,
}

impl GraphDesc {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an input bind point.
    pub fn input(mut self, bind_point: BindPoint) -> Self {
        self.inputs.push(bind_point);
        self
    }

    /// Declare an output bind point.
    pub fn output(mut self, bind_point: BindPoint) -> Self {
        self.outputs.push(bind_point);
        self
    }

    /// Mark a flattened input slot as owned by the device after initialization.
    pub fn owned_input(mut self, slot: usize) -> Self {
        self.owned_inputs.push(slot);
        self
    }

    /// Append a node. Intermediates it writes extend `intermediate_count`.
    pub fn node(mut self, node: GraphNode) -> Self {
        for output in &node.outputs {
            if let TensorRef::Intermediate(index) = output {
                self.intermediate_count = self.intermediate_count.max(index + 1);
            }
        }
        self.nodes.push(node);
        self
    }

    pub fn input_slot_count(&self) -> usize {
        total_slot_count(&self.inputs)
    }

    pub fn output_slot_count(&self) -> usize {
        total_slot_count(&self.outputs)
    }

    pub fn is_owned(&self, slot: usize) -> bool {
        self.owned_inputs.contains(&slot)
    }

    /// Input bind point covering a flattened input slot.
    pub fn input_bind_point(&self, slot: usize) -> Option<&BindPoint> {
        let mut first = 0;
        for bind_point in &self.inputs {
            let end = first + bind_point.resource_count as usize;
            if slot < end {
                return Some(bind_point);
            }
            first = end;
        }
        None
    }

    /// Check operator arity, slot ranges and intermediate ordering.
    ///
    /// Devices call this when compiling; `name` labels the error.
    pub fn validate(&self, name: &str) -> Result<()> {
        let fail = |reason: String| Error::Compilation {
            name: name.to_string(),
            reason,
        };

        let input_slots = self.input_slot_count();
        let output_slots = self.output_slot_count();

        for &slot in &self.owned_inputs {
            if slot >= input_slots {
                return Err(fail(format!(
                    "owned input slot {slot} is out of range ({input_slots} input slots)"
                )));
            }
        }

        let mut produced = vec![false; self.intermediate_count];
        for node in &self.nodes {
            let (inputs, outputs) = node.operator.arity();
            if node.inputs.len() != inputs || node.outputs.len() != outputs {
                return Err(fail(format!(
                    "node '{}' ({:?}) takes {inputs} inputs and {outputs} outputs, got {} and {}",
                    node.name,
                    node.operator,
                    node.inputs.len(),
                    node.outputs.len()
                )));
            }
            if node.element_count == 0 {
                return Err(fail(format!("node '{}' has no elements", node.name)));
            }
            if node.checked_tensor_bytes().is_none_or(|bytes| bytes > MAX_TENSOR_BYTES) {
                return Err(fail(format!(
                    "node '{}' has {} elements, more than a tensor can hold",
                    node.name, node.element_count
                )));
            }

            for input in &node.inputs {
                match *input {
                    TensorRef::Input(slot) if slot < input_slots => {}
                    TensorRef::Intermediate(index)
                        if produced.get(index).copied().unwrap_or(false) => {}
                    other => {
                        return Err(fail(format!(
                            "node '{}' reads {other:?}, which is not available",
                            node.name
                        )));
                    }
                }
            }

            for output in &node.outputs {
                match *output {
                    TensorRef::Output(slot) if slot < output_slots => {}
                    TensorRef::Intermediate(index) if index < produced.len() => {
                        produced[index] = true;
                    }
                    other => {
                        return Err(fail(format!(
                            "node '{}' writes {other:?}, which is not writable",
                            node.name
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}
