//! Activation cache for block-wise optimization
//!
//! During the capture pass a block's inputs and reference outputs are
//! recorded per calibration sample; during training, mini-batches are drawn
//! back out by index. The cache is exclusively owned by one block's window
//! at a time: cleared before capture, reset after optimization.

use crate::error::{Error, Result};
use crate::Tensor;

/// Storage capability set for captured activations
pub trait Cache {
    /// Number of stored calibration samples
    fn len(&self) -> usize;

    /// Check if no samples are stored
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one calibration sample's block input. May be called across
    /// several capture passes before a `clear`.
    fn store_inputs(&mut self, inputs: Tensor);

    /// Append the matching reference output
    fn store_output(&mut self, output: Tensor);

    /// Materialize the `(inputs, reference outputs)` pair for the given
    /// sample indices, as detached tensors.
    fn sample_batch(&self, indices: &[usize]) -> Result<(Vec<Tensor>, Vec<Tensor>)>;

    /// One-time setup, invoked once per optimization run before any block
    fn initialize(&mut self);

    /// Discard accumulated samples before capturing a new block
    fn clear(&mut self);

    /// Release storage after a block's optimization completes
    fn reset(&mut self);
}

/// In-memory cache holding one tensor pair per calibration sample
///
/// `clear` keeps the allocations for the next block's capture; `reset`
/// releases them.
#[derive(Default)]
pub struct ActivationCache {
    inputs: Vec<Tensor>,
    outputs: Vec<Tensor>,
    initialized: bool,
}

impl ActivationCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if `initialize` has been called
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Number of stored reference outputs
    pub fn output_len(&self) -> usize {
        self.outputs.len()
    }
}

impl Cache for ActivationCache {
    fn len(&self) -> usize {
        self.inputs.len()
    }

    fn store_inputs(&mut self, inputs: Tensor) {
        self.inputs.push(inputs);
    }

    fn store_output(&mut self, output: Tensor) {
        self.outputs.push(output);
    }

    fn sample_batch(&self, indices: &[usize]) -> Result<(Vec<Tensor>, Vec<Tensor>)> {
        if self.inputs.len() != self.outputs.len() {
            return Err(Error::Capture(format!(
                "cache holds {} inputs but {} outputs",
                self.inputs.len(),
                self.outputs.len()
            )));
        }

        let mut inputs = Vec::with_capacity(indices.len());
        let mut outputs = Vec::with_capacity(indices.len());
        for &idx in indices {
            if idx >= self.inputs.len() {
                return Err(Error::Capture(format!(
                    "sample index {} out of range for {} cached samples",
                    idx,
                    self.inputs.len()
                )));
            }
            inputs.push(self.inputs[idx].detach());
            outputs.push(self.outputs[idx].detach());
        }
        Ok((inputs, outputs))
    }

    fn initialize(&mut self) {
        self.initialized = true;
    }

    fn clear(&mut self) {
        self.inputs.clear();
        self.outputs.clear();
    }

    fn reset(&mut self) {
        self.inputs = Vec::new();
        self.outputs = Vec::new();
    }
}
