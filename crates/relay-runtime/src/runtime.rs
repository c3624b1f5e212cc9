//! GPU initialization and device management.

use crate::error::{Result, RuntimeError};
use crate::gpu::GpuDevice;
use std::sync::Arc;

/// Entry point for running Relay workloads on a GPU.
///
/// Owns the wgpu device through a [`GpuDevice`] that dispatchables and the
/// [`Executor`](crate::Executor) share.
///
/// # Example
/// ```no_run
/// # use relay_runtime::Runtime;
/// #[pollster::main]
/// async fn main() -> anyhow::Result<()> {
///     let runtime = Runtime::new().await?;
///     println!("running on {}", runtime.adapter_info().name);
///     Ok(())
/// }
/// ```
pub struct Runtime {
    device: Arc<GpuDevice>,
    adapter_info: wgpu::AdapterInfo,
}

impl Runtime {
    /// Initialize the runtime with the default GPU adapter.
    ///
    /// # Errors
    /// Returns an error if no suitable GPU is found or initialization fails.
    pub async fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| {
                RuntimeError::InitError(format!("Failed to find suitable GPU adapter: {e}"))
            })?;

        Self::with_adapter(&adapter).await
    }

    /// Initialize the runtime with a specific GPU adapter.
    ///
    /// # Errors
    /// Returns an error if device initialization fails.
    pub async fn with_adapter(adapter: &wgpu::Adapter) -> Result<Self> {
        let adapter_info = adapter.get_info();

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor::default())
            .await
            .map_err(|e| RuntimeError::InitError(format!("Failed to create device: {e}")))?;

        tracing::info!(adapter = %adapter_info.name, backend = ?adapter_info.backend, "GPU initialized");

        Ok(Self {
            device: Arc::new(GpuDevice::new(
                adapter_info.name.clone(),
                Arc::new(device),
                Arc::new(queue),
            )),
            adapter_info,
        })
    }

    /// The shared compute device.
    pub fn device(&self) -> Arc<GpuDevice> {
        Arc::clone(&self.device)
    }

    /// Get information about the GPU adapter.
    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }
}
