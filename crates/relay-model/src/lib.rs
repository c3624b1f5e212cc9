//! Model-native dispatchables for Relay.
//!
//! Imported models bind tensors by name instead of through bind points. This
//! crate provides:
//! - The importer collaborator traits (`session`)
//! - Declared and call-site configuration and their merge (`options`)
//! - [`ModelDispatchable`], which drives a session through the dispatch lifecycle
//! - [`resolve_catalogue`], which sizes every model tensor, running the model
//!   once when output shapes are only known after execution

pub mod catalogue;
pub mod dispatchable;
pub mod options;
pub mod session;

pub use catalogue::{ModelCatalogue, resolve_catalogue};
pub use dispatchable::ModelDispatchable;
pub use options::{GraphOptimizationLevel, LoggingLevel, ModelDesc, ModelOptions, SessionOptions};
pub use session::{
    Dimension, HostTensor, MemoryLocation, ModelImporter, ModelSession, TensorDesc, TensorValue,
    ValueKind, element_count,
};

pub use relay_core::{Error, Result};
