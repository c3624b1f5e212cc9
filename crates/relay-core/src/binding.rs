//! Bind points, binding sets, and the resolver that maps one onto the other.
//!
//! A dispatchable declares an ordered list of [`BindPoint`]s. Callers supply a
//! [`BindingSet`] per call; [`resolve`] matches the two and produces a
//! [`BindingTable`] with exactly one entry per declared slot, in declaration
//! order, so devices can index it positionally.

use crate::resource::{ResourceHandle, ResourceKind, ResourceSource};
use crate::{Error, Result};
use std::collections::HashMap;
use tracing::{debug, trace};

/// A named, fixed-arity slot declared by a dispatchable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindPoint {
    /// Unique name used to look the bind point up in a binding set.
    pub name: String,

    /// Number of resources bound to this point. Always at least one.
    pub resource_count: u32,

    /// Whether the bind point must be supplied.
    pub required: bool,
}

impl BindPoint {
    /// A required bind point of arity one.
    pub fn required(name: impl Into<String>) -> Self {
        Self::new(name, 1, true)
    }

    /// An optional bind point of arity one.
    pub fn optional(name: impl Into<String>) -> Self {
        Self::new(name, 1, false)
    }

    /// Create a bind point.
    ///
    /// # Panics
    ///
    /// Panics if `resource_count` is zero.
    pub fn new(name: impl Into<String>, resource_count: u32, required: bool) -> Self {
        assert!(resource_count >= 1, "bind points have at least one slot");
        Self {
            name: name.into(),
            resource_count,
            required,
        }
    }
}

/// Total number of slots across `bind_points`.
pub fn total_slot_count(bind_points: &[BindPoint]) -> usize {
    bind_points.iter().map(|p| p.resource_count as usize).sum()
}

/// Caller-supplied mapping from bind point name to the resources bound to it.
///
/// Lookup ignores insertion order; the order of sources under one name is the
/// slot order.
#[derive(Debug, Clone, Default)]
pub struct BindingSet {
    bindings: HashMap<String, Vec<ResourceSource>>,
}

impl BindingSet {
    /// Create an empty binding set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `sources` to `name`, replacing any previous binding.
    pub fn insert(&mut self, name: impl Into<String>, sources: Vec<ResourceSource>) {
        self.bindings.insert(name.into(), sources);
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, name: impl Into<String>, sources: Vec<ResourceSource>) -> Self {
        self.insert(name, sources);
        self
    }

    /// Sources bound to `name`.
    pub fn get(&self, name: &str) -> Option<&[ResourceSource]> {
        self.bindings.get(name).map(Vec::as_slice)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Iterate over `(name, sources)` pairs in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[ResourceSource])> {
        self.bindings
            .iter()
            .map(|(name, sources)| (name.as_str(), sources.as_slice()))
    }
}

/// One resolved slot of a binding table.
#[derive(Debug, Clone)]
pub enum BufferBinding {
    /// Nothing bound to this slot.
    None,

    /// A byte range of a device buffer.
    Buffer {
        resource: ResourceHandle,
        offset: u64,
        size: u64,
    },
}

impl BufferBinding {
    /// Bind the whole of `resource`.
    pub fn whole(resource: ResourceHandle) -> Self {
        let size = resource.size();
        BufferBinding::Buffer {
            resource,
            offset: 0,
            size,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, BufferBinding::None)
    }

    /// The bound resource, if any.
    pub fn resource(&self) -> Option<&ResourceHandle> {
        match self {
            BufferBinding::None => None,
            BufferBinding::Buffer { resource, .. } => Some(resource),
        }
    }
}

/// Two bindings are equal when they reference the same resource with the same
/// byte range.
impl PartialEq for BufferBinding {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (BufferBinding::None, BufferBinding::None) => true,
            (
                BufferBinding::Buffer {
                    resource: a,
                    offset: a_offset,
                    size: a_size,
                },
                BufferBinding::Buffer {
                    resource: b,
                    offset: b_offset,
                    size: b_size,
                },
            ) => {
                handle_ptr(a) == handle_ptr(b) && a_offset == b_offset && a_size == b_size
            }
            _ => false,
        }
    }
}

fn handle_ptr(handle: &ResourceHandle) -> *const () {
    std::sync::Arc::as_ptr(handle).cast::<()>()
}

/// Ordered buffer bindings parallel to the flattened bind point slots.
///
/// Rebuilt on every bind; never persisted across iterations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindingTable {
    bindings: Vec<BufferBinding>,
}

impl BindingTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// A table of `count` unbound slots.
    pub fn unbound(count: usize) -> Self {
        Self {
            bindings: vec![BufferBinding::None; count],
        }
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Binding for flattened slot `index`.
    pub fn get(&self, index: usize) -> Option<&BufferBinding> {
        self.bindings.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BufferBinding> {
        self.bindings.iter()
    }

    /// Number of slots that reference a resource.
    pub fn bound_count(&self) -> usize {
        self.bindings.iter().filter(|b| !b.is_none()).count()
    }

    /// Slot count as the `u32` devices consume.
    pub fn count_u32(&self, what: &'static str) -> Result<u32> {
        u32::try_from(self.bindings.len()).map_err(|_| Error::TooManyBindings {
            what,
            count: self.bindings.len(),
        })
    }
}

impl From<Vec<BufferBinding>> for BindingTable {
    fn from(bindings: Vec<BufferBinding>) -> Self {
        Self { bindings }
    }
}

/// Which binding semantics a resolution uses.
#[derive(Debug, Clone, Copy)]
pub enum ResolveMode<'a> {
    /// Resolving the initialization binding set. Missing required bind points
    /// are left unbound; they are checked again at execution.
    Initialization,

    /// Resolving an execution binding set. A missing required bind point is an
    /// error unless it appears in `initialized`, the set consumed at
    /// initialization.
    Execution { initialized: Option<&'a BindingSet> },
}

/// Resolve `bindings` against `bind_points`.
///
/// The produced table has exactly [`total_slot_count`] entries in declaration
/// order. Bind points without a binding produce `resource_count` unbound slots.
/// Each bound slot covers the byte range from
/// `element_offset * element_size_in_bytes` to the end of its buffer.
///
/// # Errors
///
/// - [`Error::MissingRequiredBinding`] for an absent required bind point in
///   execution mode that was not supplied at initialization
/// - [`Error::ArityMismatch`] when the number of sources differs from the
///   bind point's resource count
/// - [`Error::UnsupportedResourceKind`] for non-buffer resources
/// - [`Error::OffsetOutOfRange`] when the byte offset exceeds the buffer
/// - [`Error::UnsupportedBinding`] for sources carrying a counter resource
pub fn resolve(
    bind_points: &[BindPoint],
    bindings: &BindingSet,
    mode: ResolveMode<'_>,
) -> Result<BindingTable> {
    let mut table = Vec::with_capacity(total_slot_count(bind_points));

    for bind_point in bind_points {
        let Some(sources) = bindings.get(&bind_point.name) else {
            if let ResolveMode::Execution { initialized } = mode {
                let satisfied_at_init =
                    initialized.is_some_and(|init| init.contains(&bind_point.name));
                if bind_point.required && !satisfied_at_init {
                    return Err(Error::MissingRequiredBinding {
                        bind_point: bind_point.name.clone(),
                    });
                }
            }
            trace!(bind_point = %bind_point.name, slots = bind_point.resource_count, "unbound");
            table.extend(
                std::iter::repeat_n(BufferBinding::None, bind_point.resource_count as usize),
            );
            continue;
        };

        if sources.len() != bind_point.resource_count as usize {
            return Err(Error::ArityMismatch {
                bind_point: bind_point.name.clone(),
                expected: bind_point.resource_count,
                actual: sources.len(),
            });
        }

        for source in sources {
            table.push(resolve_source(&bind_point.name, source)?);
        }
    }

    Ok(BindingTable::from(table))
}

fn resolve_source(bind_point: &str, source: &ResourceSource) -> Result<BufferBinding> {
    let buffer = match &source.desc.kind {
        ResourceKind::Buffer(buffer) => buffer,
        other => {
            return Err(Error::UnsupportedResourceKind {
                bind_point: bind_point.to_string(),
                resource: source.desc.name.clone(),
                kind: other.kind_name(),
            });
        }
    };

    if source.counter.is_some() {
        return Err(Error::UnsupportedBinding {
            tensor: bind_point.to_string(),
            reason: "graph bind points do not support counter resources".to_string(),
        });
    }

    // The allocated buffer, not its description, bounds the slot.
    let total = source.resource.size();
    if buffer.size_in_bytes != total {
        debug!(
            bind_point,
            resource = %source.desc.name,
            described = buffer.size_in_bytes,
            allocated = total,
            "description size differs from buffer"
        );
    }

    let offset = source
        .element_offset
        .checked_mul(source.element_size_in_bytes)
        .filter(|&offset| offset <= total)
        .ok_or_else(|| Error::OffsetOutOfRange {
            bind_point: bind_point.to_string(),
            offset: source
                .element_offset
                .saturating_mul(source.element_size_in_bytes),
            size: total,
        })?;

    trace!(
        bind_point,
        resource = %source.desc.name,
        offset,
        size = total - offset,
        "bound"
    );

    Ok(BufferBinding::Buffer {
        resource: source.resource.clone(),
        offset,
        size: total - offset,
    })
}
