//! Common test utilities for model tests.
//!
//! Provides an in-memory importer whose single model concatenates its input
//! with itself along the first axis, so the output's first dimension is only
//! known after running it.

#![allow(dead_code)]

use relay_model::{
    Dimension, Error, ModelImporter, ModelSession, Result, SessionOptions, TensorDesc,
    TensorValue,
};
use relay_core::DataType;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Importer for the `Y = concat(X, X)` model.
///
/// - Input: `X:[batch, 4]` f32, `batch` free
/// - Output: `Y:[doubled, 4]` f32, `doubled` free
#[derive(Clone)]
pub struct ConcatImporter {
    pub inputs: Vec<TensorDesc>,
    pub outputs: Vec<TensorDesc>,
    pub fail_run: bool,
    pub runs: Arc<AtomicUsize>,
    pub loaded_with: Arc<Mutex<Option<SessionOptions>>>,
}

impl ConcatImporter {
    pub fn new() -> Self {
        Self {
            inputs: vec![TensorDesc::tensor(
                "X",
                DataType::F32,
                vec![Dimension::named("batch"), Dimension::Fixed(4)],
            )],
            outputs: vec![TensorDesc::tensor(
                "Y",
                DataType::F32,
                vec![Dimension::named("doubled"), Dimension::Fixed(4)],
            )],
            fail_run: false,
            runs: Arc::new(AtomicUsize::new(0)),
            loaded_with: Arc::new(Mutex::new(None)),
        }
    }

    /// Declare the output as `[2, 4]` so no trial run is needed.
    pub fn with_static_output(mut self) -> Self {
        self.outputs[0].shape = vec![Dimension::Fixed(2), Dimension::Fixed(4)];
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_run = true;
        self
    }

    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl ModelImporter for ConcatImporter {
    type Session = ConcatSession;

    fn load(&self, options: &SessionOptions) -> Result<ConcatSession> {
        *self.loaded_with.lock().unwrap() = Some(options.clone());
        Ok(ConcatSession {
            importer: self.clone(),
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            shapes: HashMap::new(),
        })
    }
}

pub struct ConcatSession {
    importer: ConcatImporter,
    pub inputs: HashMap<String, TensorValue>,
    pub outputs: HashMap<String, TensorValue>,
    shapes: HashMap<String, Vec<u64>>,
}

impl ModelSession for ConcatSession {
    fn inputs(&self) -> &[TensorDesc] {
        &self.importer.inputs
    }

    fn outputs(&self) -> &[TensorDesc] {
        &self.importer.outputs
    }

    fn bind_input(&mut self, name: &str, value: TensorValue) -> Result<()> {
        self.inputs.insert(name.to_string(), value);
        Ok(())
    }

    fn bind_output(&mut self, name: &str, value: TensorValue) -> Result<()> {
        self.outputs.insert(name.to_string(), value);
        Ok(())
    }

    fn clear_bindings(&mut self) {
        self.inputs.clear();
        self.outputs.clear();
    }

    fn run(&mut self) -> Result<()> {
        self.importer.runs.fetch_add(1, Ordering::SeqCst);
        if self.importer.fail_run {
            return Err(Error::Session("kernel failed".to_string()));
        }
        let mut shape = match self.inputs.get("X") {
            Some(TensorValue::Host(tensor)) => tensor.shape.clone(),
            Some(TensorValue::Device { shape, .. }) => shape.clone(),
            _ => return Err(Error::Session("input 'X' is not bound".to_string())),
        };
        shape[0] *= 2;
        self.shapes.insert("Y".to_string(), shape);
        Ok(())
    }

    fn synchronize_outputs(&mut self) -> Result<()> {
        Ok(())
    }

    fn output_shape(&self, name: &str) -> Option<Vec<u64>> {
        self.shapes.get(name).cloned()
    }
}
