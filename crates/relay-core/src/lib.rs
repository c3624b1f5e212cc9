//! Binding resolution and the two-phase dispatch lifecycle for Relay.
//!
//! This crate provides the foundational abstractions the other Relay crates
//! depend on:
//! - Resource descriptions and caller-supplied binding sets (`resource`)
//! - Bind points and the resolver that turns binding sets into binding tables (`binding`)
//! - The `Device` collaborator trait (`device`)
//! - Transient (temporary/persistent) allocation and deferred release (`transient`)
//! - The `Dispatchable` trait and the lifecycle state machine (`lifecycle`)
//! - A declarative operator graph description consumed by devices (`graph`)
//! - Name-based workload descriptions (`workload`)

pub mod binding;
pub mod device;
pub mod graph;
pub mod lifecycle;
pub mod resource;
pub mod transient;
pub mod types;
pub mod workload;

// Re-export commonly used types
pub use binding::{
    BindPoint, BindingSet, BindingTable, BufferBinding, ResolveMode, resolve, total_slot_count,
};
pub use device::{BindingProperties, Device, DispatchBindings, InitializeBindings, SubmissionId};
pub use graph::{GraphDesc, GraphNode, MAX_TENSOR_BYTES, Operator, TensorRef};
pub use lifecycle::{Dispatchable, Lifecycle, LifecycleState};
pub use resource::{
    BufferDesc, BufferResource, ResourceDesc, ResourceHandle, ResourceKind, ResourceSource,
    TextureDesc,
};
pub use transient::{DeferredRelease, PersistentSlot, TransientAllocator};
pub use types::{DataType, buffer_tensor_size};
pub use workload::{BindingDescs, BindingSource, Command, DispatchCommand, Workload};

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type shared by every lifecycle call.
///
/// Each variant carries the offending bind point, tensor or resource name so a
/// failure can be diagnosed without inspecting internal state.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Nothing bound for required bind point '{bind_point}'")]
    MissingRequiredBinding { bind_point: String },

    #[error("Bind point '{bind_point}' requires {expected} resources, but {actual} were bound")]
    ArityMismatch {
        bind_point: String,
        expected: u32,
        actual: usize,
    },

    #[error(
        "Resource '{resource}' bound to '{bind_point}' is a {kind}; only buffer bindings are supported"
    )]
    UnsupportedResourceKind {
        bind_point: String,
        resource: String,
        kind: &'static str,
    },

    #[error("Binding offset {offset} for '{bind_point}' is outside its {size}-byte buffer")]
    OffsetOutOfRange {
        bind_point: String,
        offset: u64,
        size: u64,
    },

    #[error("Tensor '{tensor}' has unsupported element type {dtype:?}")]
    UnsupportedElementType { tensor: String, dtype: DataType },

    #[error("Invalid binding for '{tensor}': {reason}")]
    UnsupportedBinding { tensor: String, reason: String },

    #[error("Binding resource '{resource}' to tensor '{tensor}' is invalid because the tensor shape is not static")]
    NonStaticShape { tensor: String, resource: String },

    #[error("{what} count {count} is too large")]
    TooManyBindings { what: &'static str, count: usize },

    #[error("Compilation of '{name}' failed: {reason}")]
    Compilation { name: String, reason: String },

    #[error("Device removed: {0}")]
    DeviceRemoved(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Cannot {operation} dispatchable '{name}' while it is {state}")]
    Lifecycle {
        name: String,
        operation: &'static str,
        state: LifecycleState,
    },

    #[error("Persistent resource for '{0}' was already created")]
    PersistentReallocated(String),

    #[error("Model import failed: {0}")]
    ModelImport(String),

    #[error("Trial execution of '{model}' failed: {reason}")]
    TrialExecution { model: String, reason: String },

    #[error("Session error: {0}")]
    Session(String),

    #[error("Unknown resource '{0}'")]
    UnknownResource(String),

    #[error("Unknown dispatchable '{0}'")]
    UnknownDispatchable(String),
}

impl Error {
    /// True for failures that leave the device context unusable.
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Error::DeviceRemoved(_))
    }
}
