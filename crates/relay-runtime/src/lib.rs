//! Devices and execution for Relay.
//!
//! This crate provides the concrete side of the [`Device`](relay_core::Device)
//! seam and everything that drives it:
//! 1. **Devices** - [`HostDevice`], a CPU reference implementation, and
//!    [`GpuDevice`] on `wgpu` (created through [`Runtime`])
//! 2. **Graph dispatchables** - [`GraphDispatchable`] compiles a
//!    [`GraphDesc`](relay_core::GraphDesc) and runs it through the lifecycle
//! 3. **Execution** - [`Executor`] creates named resources, builds binding
//!    sets and runs workload commands
//!
//! # Example
//!
//! ```no_run
//! use relay_core::{BindPoint, BindingSet, Command, DataType, DispatchCommand, BindingSource,
//!     GraphDesc, GraphNode, Operator, ResourceDesc, TensorRef};
//! use relay_runtime::{Executor, ExecutorOptions, GraphDispatchable, Runtime};
//!
//! #[pollster::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = Runtime::new().await?;
//!     let device = runtime.device();
//!
//!     let desc = GraphDesc::new()
//!         .input(BindPoint::required("X"))
//!         .output(BindPoint::required("Y"))
//!         .node(GraphNode::new(
//!             "copy",
//!             Operator::Identity,
//!             vec![TensorRef::Input(0)],
//!             vec![TensorRef::Output(0)],
//!             4,
//!         ));
//!
//!     let resources = [
//!         ResourceDesc::buffer("x", DataType::F32, 16),
//!         ResourceDesc::buffer("y", DataType::F32, 16),
//!     ];
//!     let mut executor = Executor::new(device.clone(), &resources, ExecutorOptions::default())?;
//!     executor.register(GraphDispatchable::new("copy", device, desc, BindingSet::new()))?;
//!     executor.initialize()?;
//!
//!     let reads = executor.execute(&[
//!         Command::Dispatch(
//!             DispatchCommand::new("copy")
//!                 .bind("X", vec![BindingSource::new("x")])
//!                 .bind("Y", vec![BindingSource::new("y")]),
//!         ),
//!         Command::Read { resource: "y".to_string() },
//!     ])?;
//!     println!("{:?}", reads);
//!     Ok(())
//! }
//! ```

mod error;
mod executor;
mod gpu;
mod graph;
mod host;
mod layout;
mod runtime;

// Public exports
pub use error::{Result, RuntimeError};
pub use executor::{Executor, ExecutorOptions};
pub use gpu::{GpuBuffer, GpuDescriptorHeap, GpuDevice, GpuGraph};
pub use graph::GraphDispatchable;
pub use host::{HostBuffer, HostDescriptorHeap, HostDevice, HostGraph};
pub use layout::{GraphLayout, OwnedInput, REGION_ALIGNMENT, Region};
pub use runtime::Runtime;
