//! Element types and tensor buffer sizing.

/// Element data types that may appear on a tensor or buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    F16,
    BF16,
    F64,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    Bool,
    String,
    Complex64,
    Complex128,
}

impl DataType {
    /// Size of one element in bytes, or `None` for non-numeric types.
    pub fn size(&self) -> Option<u64> {
        match self {
            DataType::U8 | DataType::I8 | DataType::Bool => Some(1),
            DataType::U16 | DataType::I16 | DataType::F16 | DataType::BF16 => Some(2),
            DataType::U32 | DataType::I32 | DataType::F32 => Some(4),
            DataType::U64 | DataType::I64 | DataType::F64 | DataType::Complex64 => Some(8),
            DataType::Complex128 => Some(16),
            DataType::String => None,
        }
    }

    /// Whether device buffers can hold this type.
    ///
    /// Bool, bfloat16, strings and complex numbers have no device buffer
    /// representation; tensors of these types live in host memory.
    pub fn is_device_supported(&self) -> bool {
        !matches!(
            self,
            DataType::Bool
                | DataType::BF16
                | DataType::String
                | DataType::Complex64
                | DataType::Complex128
        )
    }
}

/// Byte size of a packed device buffer holding a tensor of `sizes`.
///
/// An empty shape is a scalar (one element). The result is rounded up to a
/// multiple of 4 bytes. Returns `None` for types without a device
/// representation or if the size overflows.
pub fn buffer_tensor_size(dtype: DataType, sizes: &[u64]) -> Option<u64> {
    if !dtype.is_device_supported() {
        return None;
    }
    let element_size = dtype.size()?;
    let element_count = sizes
        .iter()
        .try_fold(1u64, |count, &dim| count.checked_mul(dim))?;
    let bytes = element_count.checked_mul(element_size)?;
    bytes.checked_add(3).map(|b| b & !3)
}
