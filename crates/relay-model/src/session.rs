//! The model importer collaborator.
//!
//! A [`ModelImporter`] loads a model into a [`ModelSession`], which reports
//! its input and output tensors and runs the model against whatever values
//! are bound to them.

use crate::options::SessionOptions;
use relay_core::{DataType, Error, ResourceHandle, Result};

/// What kind of value a model input or output carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Tensor,
    Sequence,
    Map,
}

/// A single dimension of a declared tensor shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dimension {
    /// Size known from the model.
    Fixed(u64),

    /// Size unknown until runtime. May carry a symbolic name and a semantic
    /// denotation (such as `DATA_BATCH`) that overrides can match.
    Free {
        name: Option<String>,
        denotation: Option<String>,
    },
}

impl Dimension {
    /// A free dimension with a symbolic name.
    pub fn named(name: impl Into<String>) -> Self {
        Dimension::Free {
            name: Some(name.into()),
            denotation: None,
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, Dimension::Free { .. })
    }

    pub fn fixed(&self) -> Option<u64> {
        match self {
            Dimension::Fixed(size) => Some(*size),
            Dimension::Free { .. } => None,
        }
    }
}

/// Declared input or output of a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDesc {
    pub name: String,
    pub value_kind: ValueKind,
    pub dtype: DataType,
    pub shape: Vec<Dimension>,
}

impl TensorDesc {
    /// A tensor value.
    pub fn tensor(name: impl Into<String>, dtype: DataType, shape: Vec<Dimension>) -> Self {
        Self {
            name: name.into(),
            value_kind: ValueKind::Tensor,
            dtype,
            shape,
        }
    }

    pub fn is_tensor(&self) -> bool {
        self.value_kind == ValueKind::Tensor
    }

    pub fn has_free_dims(&self) -> bool {
        self.shape.iter().any(Dimension::is_free)
    }

    /// Concrete sizes, if every dimension is fixed.
    pub fn static_sizes(&self) -> Option<Vec<u64>> {
        self.shape.iter().map(Dimension::fixed).collect()
    }

    /// Concrete sizes with every free dimension forced to 1.
    pub fn sizes_with_free_as_one(&self) -> Vec<u64> {
        self.shape.iter().map(|dim| dim.fixed().unwrap_or(1)).collect()
    }
}

/// Number of elements in a tensor of `sizes`. Scalars have one element.
pub fn element_count(sizes: &[u64]) -> Option<u64> {
    sizes
        .iter()
        .try_fold(1u64, |count, &dim| count.checked_mul(dim))
}

/// A tensor held in host memory.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub dtype: DataType,
    pub shape: Vec<u64>,
    pub data: Vec<u8>,
}

impl HostTensor {
    /// A zero-filled tensor.
    pub fn zeros(name: &str, dtype: DataType, shape: Vec<u64>) -> Result<Self> {
        let element_size = dtype.size().ok_or_else(|| Error::UnsupportedElementType {
            tensor: name.to_string(),
            dtype,
        })?;
        let bytes = element_count(&shape)
            .and_then(|count| count.checked_mul(element_size))
            .and_then(|bytes| usize::try_from(bytes).ok())
            .ok_or_else(|| {
                Error::ModelImport(format!("tensor '{name}' of shape {shape:?} is too large"))
            })?;
        Ok(Self {
            dtype,
            shape,
            data: vec![0; bytes],
        })
    }
}

/// Where the importer should allocate a value it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    Device,
    Host,
}

/// A value bound to a model input or output.
#[derive(Debug, Clone)]
pub enum TensorValue {
    /// View of an existing device buffer. No copy is made.
    Device {
        resource: ResourceHandle,
        shape: Vec<u64>,
        dtype: DataType,
    },

    /// Host-resident tensor.
    Host(HostTensor),

    /// Let the importer allocate the value.
    Allocate(MemoryLocation),
}

/// Loads models.
pub trait ModelImporter {
    type Session: ModelSession;

    fn load(&self, options: &SessionOptions) -> Result<Self::Session>;
}

/// A loaded model.
pub trait ModelSession {
    /// Declared inputs, in model order.
    fn inputs(&self) -> &[TensorDesc];

    /// Declared outputs, in model order.
    fn outputs(&self) -> &[TensorDesc];

    fn bind_input(&mut self, name: &str, value: TensorValue) -> Result<()>;

    fn bind_output(&mut self, name: &str, value: TensorValue) -> Result<()>;

    /// Drop every input and output binding.
    fn clear_bindings(&mut self);

    /// Run the model once against the current bindings.
    fn run(&mut self) -> Result<()>;

    /// Block until outputs of the last run are readable.
    fn synchronize_outputs(&mut self) -> Result<()>;

    /// Concrete shape of output `name` from the last run.
    fn output_shape(&self, name: &str) -> Option<Vec<u64>>;
}
