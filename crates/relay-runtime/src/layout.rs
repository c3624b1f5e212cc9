//! Memory layout of a compiled graph.
//!
//! Intermediates are packed into the temporary resource. Owned input copies
//! and accumulator state are packed into the persistent resource. Every region
//! starts on a [`REGION_ALIGNMENT`] boundary so it can be bound as a storage
//! buffer range on any backend.

use relay_core::{
    BindingTable, BufferBinding, DispatchBindings, Error, GraphDesc, InitializeBindings,
    Operator, Result, TensorRef,
};

/// Alignment of every region inside a transient resource.
pub const REGION_ALIGNMENT: u64 = 256;

fn align(offset: u64) -> u64 {
    offset.div_ceil(REGION_ALIGNMENT) * REGION_ALIGNMENT
}

/// Byte range inside a transient resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset: u64,
    pub size: u64,
}

/// Copy of an owned input slot kept in the persistent resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnedInput {
    pub slot: usize,
    pub region: Region,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphLayout {
    /// Region of each intermediate in the temporary resource.
    pub intermediates: Vec<Region>,
    pub temporary_size: u64,

    /// Owned inputs that some node reads.
    pub owned: Vec<OwnedInput>,
    /// Accumulator state per node index.
    pub state: Vec<Option<Region>>,
    pub persistent_size: u64,
}

impl GraphLayout {
    /// Lay out `desc`, which must already be validated.
    pub fn new(desc: &GraphDesc) -> Self {
        let mut intermediate_sizes = vec![0u64; desc.intermediate_count];
        let mut owned_sizes: Vec<(usize, u64)> = Vec::new();

        for node in &desc.nodes {
            for output in &node.outputs {
                if let TensorRef::Intermediate(index) = *output {
                    intermediate_sizes[index] = intermediate_sizes[index].max(node.tensor_bytes());
                }
            }
            for input in &node.inputs {
                let TensorRef::Input(slot) = *input else {
                    continue;
                };
                if !desc.is_owned(slot) {
                    continue;
                }
                match owned_sizes.iter_mut().find(|(s, _)| *s == slot) {
                    Some((_, size)) => *size = (*size).max(node.tensor_bytes()),
                    None => owned_sizes.push((slot, node.tensor_bytes())),
                }
            }
        }

        let mut cursor = 0;
        let intermediates = intermediate_sizes
            .iter()
            .map(|&size| {
                let region = Region {
                    offset: cursor,
                    size,
                };
                cursor = align(cursor + size);
                region
            })
            .collect();
        let temporary_size = cursor;

        let mut cursor = 0;
        let owned = owned_sizes
            .into_iter()
            .map(|(slot, size)| {
                let region = Region {
                    offset: cursor,
                    size,
                };
                cursor = align(cursor + size);
                OwnedInput { slot, region }
            })
            .collect();
        let state = desc
            .nodes
            .iter()
            .map(|node| {
                (node.operator == Operator::Accumulate).then(|| {
                    let region = Region {
                        offset: cursor,
                        size: node.tensor_bytes(),
                    };
                    cursor = align(cursor + node.tensor_bytes());
                    region
                })
            })
            .collect();

        Self {
            intermediates,
            temporary_size,
            owned,
            state,
            persistent_size: cursor,
        }
    }

    pub fn owned_region(&self, slot: usize) -> Option<Region> {
        self.owned
            .iter()
            .find(|owned| owned.slot == slot)
            .map(|owned| owned.region)
    }
}

/// Descriptors the initializer binds: every input slot plus the persistent resource.
pub fn initializer_descriptor_count(desc: &GraphDesc) -> u32 {
    u32::try_from(desc.input_slot_count() + 1).unwrap_or(u32::MAX)
}

/// Descriptors a dispatch binds: every input and output slot plus both transients.
pub fn execution_descriptor_count(desc: &GraphDesc) -> u32 {
    u32::try_from(desc.input_slot_count() + desc.output_slot_count() + 2).unwrap_or(u32::MAX)
}

/// Check that a heap of `capacity` descriptors can hold `required`.
pub fn check_capacity(name: &str, capacity: u32, required: u32) -> Result<()> {
    if capacity < required {
        return Err(Error::Device(format!(
            "descriptor heap for '{name}' holds {capacity} descriptors, {required} required"
        )));
    }
    Ok(())
}

fn binding_size(binding: Option<&BufferBinding>) -> Option<u64> {
    match binding {
        Some(BufferBinding::Buffer { size, .. }) => Some(*size),
        _ => None,
    }
}

fn check_transient(
    name: &str,
    what: &str,
    binding: Option<&BufferBinding>,
    required: u64,
) -> Result<()> {
    if required == 0 {
        return Ok(());
    }
    match binding_size(binding) {
        Some(size) if size >= required => Ok(()),
        Some(size) => Err(Error::Device(format!(
            "{what} resource for '{name}' is {size} bytes, {required} required"
        ))),
        None => Err(Error::Device(format!(
            "{what} resource for '{name}' is not bound"
        ))),
    }
}

/// Check an initializer binding table against the layout.
pub fn validate_initialize(
    name: &str,
    layout: &GraphLayout,
    bindings: &InitializeBindings,
) -> Result<()> {
    check_transient(
        name,
        "persistent",
        bindings.persistent.as_ref(),
        layout.persistent_size,
    )?;
    for owned in &layout.owned {
        match binding_size(bindings.inputs.get(owned.slot)) {
            Some(size) if size < owned.region.size => {
                return Err(Error::Device(format!(
                    "owned input slot {} of '{name}' is {size} bytes, {} required",
                    owned.slot, owned.region.size
                )));
            }
            Some(_) => {}
            None => {
                return Err(Error::Device(format!(
                    "owned input slot {} of '{name}' is unbound",
                    owned.slot
                )));
            }
        }
    }
    Ok(())
}

/// Check a dispatch binding table against what the graph reads and writes.
pub fn validate_dispatch(
    name: &str,
    desc: &GraphDesc,
    layout: &GraphLayout,
    bindings: &DispatchBindings,
) -> Result<()> {
    check_transient(
        name,
        "temporary",
        bindings.temporary.as_ref(),
        layout.temporary_size,
    )?;
    check_transient(
        name,
        "persistent",
        bindings.persistent.as_ref(),
        layout.persistent_size,
    )?;

    let check_slot = |table: &BindingTable, kind: &str, slot: usize, node: &str, bytes: u64| {
        match binding_size(table.get(slot)) {
            Some(size) if size >= bytes => Ok(()),
            Some(size) => Err(Error::Device(format!(
                "{kind} slot {slot} of '{name}' is {size} bytes but node '{node}' needs {bytes}"
            ))),
            None => Err(Error::Device(format!(
                "{kind} slot {slot} of '{name}' is unbound but used by node '{node}'"
            ))),
        }
    };

    for node in &desc.nodes {
        for input in &node.inputs {
            match *input {
                TensorRef::Input(slot) if !desc.is_owned(slot) => {
                    check_slot(&bindings.inputs, "input", slot, &node.name, node.tensor_bytes())?;
                }
                _ => {}
            }
        }
        for output in &node.outputs {
            if let TensorRef::Output(slot) = *output {
                check_slot(&bindings.outputs, "output", slot, &node.name, node.tensor_bytes())?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{BindPoint, BufferResource, GraphNode};
    use std::any::Any;
    use std::sync::Arc;

    #[derive(Debug)]
    struct SizedBuffer(u64);

    impl BufferResource for SizedBuffer {
        fn size(&self) -> u64 {
            self.0
        }

        fn label(&self) -> &str {
            "sized"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn accumulate_graph() -> GraphDesc {
        GraphDesc::new()
            .input(BindPoint::required("x"))
            .input(BindPoint::required("w"))
            .output(BindPoint::required("y"))
            .owned_input(1)
            .node(GraphNode::new(
                "scale",
                Operator::Multiply,
                vec![TensorRef::Input(0), TensorRef::Input(1)],
                vec![TensorRef::Intermediate(0)],
                8,
            ))
            .node(GraphNode::new(
                "sum",
                Operator::Accumulate,
                vec![TensorRef::Intermediate(0)],
                vec![TensorRef::Output(0)],
                8,
            ))
    }

    #[test]
    fn test_layout_regions_are_aligned() {
        let layout = GraphLayout::new(&accumulate_graph());

        assert_eq!(layout.intermediates, vec![Region { offset: 0, size: 32 }]);
        assert_eq!(layout.temporary_size, 256);

        assert_eq!(layout.owned_region(1), Some(Region { offset: 0, size: 32 }));
        assert_eq!(layout.owned_region(0), None);
        assert_eq!(layout.state[0], None);
        assert_eq!(layout.state[1], Some(Region { offset: 256, size: 32 }));
        assert_eq!(layout.persistent_size, 512);
    }

    #[test]
    fn test_stateless_graph_needs_no_persistent_memory() {
        let desc = GraphDesc::new()
            .input(BindPoint::required("x"))
            .output(BindPoint::required("y"))
            .node(GraphNode::new(
                "copy",
                Operator::Identity,
                vec![TensorRef::Input(0)],
                vec![TensorRef::Output(0)],
                4,
            ));
        let layout = GraphLayout::new(&desc);
        assert_eq!(layout.temporary_size, 0);
        assert_eq!(layout.persistent_size, 0);
        assert_eq!(execution_descriptor_count(&desc), 4);
        assert_eq!(initializer_descriptor_count(&desc), 2);
    }

    #[test]
    fn test_unbound_read_slot_rejected() {
        let desc = accumulate_graph();
        let layout = GraphLayout::new(&desc);
        let bindings = DispatchBindings {
            inputs: BindingTable::unbound(2),
            outputs: BindingTable::unbound(1),
            ..Default::default()
        };
        let err = validate_dispatch("acc", &desc, &layout, &bindings).unwrap_err();
        assert!(matches!(err, Error::Device(_)));
    }

    #[test]
    fn test_unbound_owned_slot_rejected_at_initialization() {
        let desc = accumulate_graph();
        let layout = GraphLayout::new(&desc);
        let bindings = InitializeBindings {
            inputs: BindingTable::unbound(2),
            temporary: None,
            persistent: Some(BufferBinding::Buffer {
                resource: Arc::new(SizedBuffer(layout.persistent_size)),
                offset: 0,
                size: layout.persistent_size,
            }),
        };
        let err = validate_initialize("acc", &layout, &bindings).unwrap_err();
        assert!(matches!(err, Error::Device(ref message) if message.contains("unbound")));
    }

    #[test]
    fn test_capacity() {
        assert!(check_capacity("g", 4, 4).is_ok());
        assert!(check_capacity("g", 1, 4).is_err());
    }
}
