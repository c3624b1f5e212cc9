//! Resource descriptions and the caller-owned resources bound to bind points.

use crate::types::DataType;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Description of a caller-visible resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDesc {
    /// Resource name, unique within a workload.
    pub name: String,

    /// What kind of resource this is.
    pub kind: ResourceKind,
}

/// The kind of a resource and its kind-specific description.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceKind {
    Buffer(BufferDesc),
    Texture(TextureDesc),
}

impl ResourceKind {
    /// Human-readable kind name used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ResourceKind::Buffer(_) => "buffer",
            ResourceKind::Texture(_) => "texture",
        }
    }
}

/// Linear device buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferDesc {
    /// Total buffer size in bytes.
    pub size_in_bytes: u64,

    /// Element type of the initial values (and of the tensor it backs).
    pub data_type: DataType,

    /// Raw initial contents; zero-filled when shorter than the buffer.
    pub initial_values: Vec<u8>,
}

/// Two-dimensional texture. Textures cannot be bound to bind points.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: DataType,
}

impl ResourceDesc {
    /// Describe a zero-initialised buffer.
    pub fn buffer(name: impl Into<String>, data_type: DataType, size_in_bytes: u64) -> Self {
        Self {
            name: name.into(),
            kind: ResourceKind::Buffer(BufferDesc {
                size_in_bytes,
                data_type,
                initial_values: Vec::new(),
            }),
        }
    }

    /// Buffer description, if this is a buffer.
    pub fn as_buffer(&self) -> Option<&BufferDesc> {
        match &self.kind {
            ResourceKind::Buffer(desc) => Some(desc),
            ResourceKind::Texture(_) => None,
        }
    }
}

/// A device-resident buffer created by a [`Device`](crate::Device).
///
/// Devices downcast handles back to their own buffer type through
/// [`as_any`](BufferResource::as_any).
pub trait BufferResource: Send + Sync + fmt::Debug {
    /// Allocated size in bytes.
    fn size(&self) -> u64;

    /// Debug label given at creation.
    fn label(&self) -> &str;

    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a device buffer.
///
/// The owner of a resource (the workload or model that created it) keeps a
/// handle for as long as it wants the buffer; bindings only clone the handle
/// for the duration of a dispatch.
pub type ResourceHandle = Arc<dyn BufferResource>;

/// One concrete resource bound to one slot of a bind point.
#[derive(Debug, Clone)]
pub struct ResourceSource {
    /// The bound buffer.
    pub resource: ResourceHandle,

    /// Description of the bound resource (size, element type).
    pub desc: Arc<ResourceDesc>,

    /// Offset of the binding in elements.
    pub element_offset: u64,

    /// Size of one element in bytes.
    pub element_size_in_bytes: u64,

    /// Secondary resource such as a UAV counter.
    pub counter: Option<ResourceHandle>,
}

impl ResourceSource {
    /// Bind the whole of `resource`, starting at element zero.
    pub fn new(resource: ResourceHandle, desc: Arc<ResourceDesc>) -> Self {
        let element_size_in_bytes = desc
            .as_buffer()
            .and_then(|buffer| buffer.data_type.size())
            .unwrap_or(1);
        Self {
            resource,
            desc,
            element_offset: 0,
            element_size_in_bytes,
            counter: None,
        }
    }

    /// Start the binding `element_offset` elements of `element_size_in_bytes` into the buffer.
    pub fn with_offset(mut self, element_offset: u64, element_size_in_bytes: u64) -> Self {
        self.element_offset = element_offset;
        self.element_size_in_bytes = element_size_in_bytes;
        self
    }

    /// Attach a counter resource.
    pub fn with_counter(mut self, counter: ResourceHandle) -> Self {
        self.counter = Some(counter);
        self
    }
}
