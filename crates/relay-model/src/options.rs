//! Model and session configuration.
//!
//! A [`ModelDesc`] carries the settings declared alongside a model. Call-site
//! [`ModelOptions`] override them. [`SessionOptions::merge`] combines the two
//! into what the importer receives.

use crate::session::{Dimension, TensorDesc};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// How aggressively the importer may rewrite the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum GraphOptimizationLevel {
    Disabled,
    Basic,
    #[default]
    Extended,
    All,
}

/// Importer log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LoggingLevel {
    Verbose,
    Info,
    #[default]
    Warning,
    Error,
    Fatal,
}

/// Settings declared with a model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelDesc {
    pub source_path: PathBuf,
    pub free_dim_name_overrides: BTreeMap<String, u64>,
    pub free_dim_denotation_overrides: BTreeMap<String, u64>,
    pub session_config_entries: BTreeMap<String, String>,
    pub graph_optimization_level: GraphOptimizationLevel,
    pub logging_level: LoggingLevel,
}

impl ModelDesc {
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            ..Default::default()
        }
    }

    pub fn with_free_dim(mut self, name: impl Into<String>, size: u64) -> Self {
        self.free_dim_name_overrides.insert(name.into(), size);
        self
    }

    pub fn with_denotation(mut self, denotation: impl Into<String>, size: u64) -> Self {
        self.free_dim_denotation_overrides
            .insert(denotation.into(), size);
        self
    }

    pub fn with_config_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.session_config_entries.insert(key.into(), value.into());
        self
    }
}

/// Call-site settings. Anything set here wins over the [`ModelDesc`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelOptions {
    pub free_dim_name_overrides: BTreeMap<String, u64>,
    pub free_dim_denotation_overrides: BTreeMap<String, u64>,
    pub session_config_entries: BTreeMap<String, String>,
    pub graph_optimization_level: Option<GraphOptimizationLevel>,
    pub logging_level: Option<LoggingLevel>,
}

impl ModelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_free_dim(mut self, name: impl Into<String>, size: u64) -> Self {
        self.free_dim_name_overrides.insert(name.into(), size);
        self
    }

    pub fn with_denotation(mut self, denotation: impl Into<String>, size: u64) -> Self {
        self.free_dim_denotation_overrides
            .insert(denotation.into(), size);
        self
    }

    pub fn with_config_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.session_config_entries.insert(key.into(), value.into());
        self
    }

    pub fn with_graph_optimization_level(mut self, level: GraphOptimizationLevel) -> Self {
        self.graph_optimization_level = Some(level);
        self
    }

    pub fn with_logging_level(mut self, level: LoggingLevel) -> Self {
        self.logging_level = Some(level);
        self
    }
}

/// Merged settings handed to the importer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionOptions {
    pub source_path: PathBuf,
    pub free_dim_name_overrides: BTreeMap<String, u64>,
    pub free_dim_denotation_overrides: BTreeMap<String, u64>,
    pub session_config_entries: BTreeMap<String, String>,
    pub graph_optimization_level: GraphOptimizationLevel,
    pub logging_level: LoggingLevel,
}

impl SessionOptions {
    /// Merge declared settings with call-site options, key by key.
    pub fn merge(desc: &ModelDesc, options: &ModelOptions) -> Self {
        fn overlay<V: Clone>(
            declared: &BTreeMap<String, V>,
            call_site: &BTreeMap<String, V>,
        ) -> BTreeMap<String, V> {
            let mut merged = declared.clone();
            merged.extend(call_site.iter().map(|(k, v)| (k.clone(), v.clone())));
            merged
        }

        Self {
            source_path: desc.source_path.clone(),
            free_dim_name_overrides: overlay(
                &desc.free_dim_name_overrides,
                &options.free_dim_name_overrides,
            ),
            free_dim_denotation_overrides: overlay(
                &desc.free_dim_denotation_overrides,
                &options.free_dim_denotation_overrides,
            ),
            session_config_entries: overlay(
                &desc.session_config_entries,
                &options.session_config_entries,
            ),
            graph_optimization_level: options
                .graph_optimization_level
                .unwrap_or(desc.graph_optimization_level),
            logging_level: options.logging_level.unwrap_or(desc.logging_level),
        }
    }

    /// Resolve a free dimension through the overrides. Name overrides are
    /// checked before denotation overrides.
    pub fn resolve_dimension(&self, dim: &Dimension) -> Dimension {
        let Dimension::Free { name, denotation } = dim else {
            return dim.clone();
        };
        let by_name = name
            .as_ref()
            .and_then(|name| self.free_dim_name_overrides.get(name));
        let by_denotation = denotation
            .as_ref()
            .and_then(|denotation| self.free_dim_denotation_overrides.get(denotation));
        match by_name.or(by_denotation) {
            Some(&size) => Dimension::Fixed(size),
            None => dim.clone(),
        }
    }

    /// `tensor` with every overridable free dimension fixed.
    pub fn apply(&self, tensor: &TensorDesc) -> TensorDesc {
        TensorDesc {
            shape: tensor
                .shape
                .iter()
                .map(|dim| self.resolve_dimension(dim))
                .collect(),
            ..tensor.clone()
        }
    }
}
