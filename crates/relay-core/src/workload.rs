//! Name-based workload descriptions.
//!
//! A [`Workload`] refers to resources by name. The executor creates the
//! resources and turns each [`BindingSource`] list into a concrete
//! [`BindingSet`](crate::BindingSet) before running commands.

use crate::resource::ResourceDesc;
use std::collections::BTreeMap;

/// Description of one resource bound to one bind point slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSource {
    /// Name of the bound resource.
    pub resource: String,

    /// Number of elements the binding covers. Informational; bindings always
    /// extend to the end of the buffer.
    pub element_count: u64,

    /// Element size; defaults to the size of the resource's element type.
    pub element_size_in_bytes: Option<u64>,

    /// Offset of the binding in elements.
    pub element_offset: u64,

    /// Name of a counter resource.
    pub counter: Option<String>,
}

impl BindingSource {
    /// Bind the whole of `resource`.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            element_count: 0,
            element_size_in_bytes: None,
            element_offset: 0,
            counter: None,
        }
    }

    pub fn with_element_count(mut self, element_count: u64) -> Self {
        self.element_count = element_count;
        self
    }

    pub fn with_element_size(mut self, element_size_in_bytes: u64) -> Self {
        self.element_size_in_bytes = Some(element_size_in_bytes);
        self
    }

    pub fn with_offset(mut self, element_offset: u64) -> Self {
        self.element_offset = element_offset;
        self
    }

    pub fn with_counter(mut self, counter: impl Into<String>) -> Self {
        self.counter = Some(counter.into());
        self
    }
}

/// Bind point name to binding source descriptions.
pub type BindingDescs = BTreeMap<String, Vec<BindingSource>>;

/// Run a dispatchable with the given execution bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchCommand {
    pub dispatchable: String,
    pub bindings: BindingDescs,
}

impl DispatchCommand {
    pub fn new(dispatchable: impl Into<String>) -> Self {
        Self {
            dispatchable: dispatchable.into(),
            bindings: BindingDescs::new(),
        }
    }

    /// Bind `sources` to `bind_point`.
    pub fn bind(mut self, bind_point: impl Into<String>, sources: Vec<BindingSource>) -> Self {
        self.bindings.insert(bind_point.into(), sources);
        self
    }
}

/// One step of a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Dispatch(DispatchCommand),
    /// Download a resource after all earlier commands have completed.
    Read { resource: String },
}

/// Resources plus the commands that use them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workload {
    pub resources: Vec<ResourceDesc>,
    pub commands: Vec<Command>,
}

impl Workload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resource(mut self, desc: ResourceDesc) -> Self {
        self.resources.push(desc);
        self
    }

    pub fn command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    /// Description of the resource called `name`.
    pub fn find_resource(&self, name: &str) -> Option<&ResourceDesc> {
        self.resources.iter().find(|desc| desc.name == name)
    }
}
