//! Capture tap for calibration passes

use super::cache::Cache;
use crate::nn::{BlockPath, Module};
use crate::Tensor;
use std::ops::ControlFlow;

/// Forward interceptor that records a target block's activations
///
/// A saver lives for exactly one capture pass. `forward_intercepted` offers
/// the target's input/output pair to `record` and then breaks out of the
/// pass, so nothing downstream of the captured block is computed. Which of
/// the pair is kept is controlled per pass by the store flags; with
/// `offload` set, tensors are detached from the tape before storage so the
/// cache holds plain buffers instead of live forward graphs.
pub struct DataSaver<'a> {
    cache: &'a mut dyn Cache,
    target: BlockPath,
    store_inputs: bool,
    store_output: bool,
    offload: bool,
}

impl<'a> DataSaver<'a> {
    /// Create a saver for one capture pass
    pub fn new(
        cache: &'a mut dyn Cache,
        target: BlockPath,
        store_inputs: bool,
        store_output: bool,
        offload: bool,
    ) -> Self {
        Self {
            cache,
            target,
            store_inputs,
            store_output,
            offload,
        }
    }

    /// The block this saver is tapping
    pub fn target(&self) -> &BlockPath {
        &self.target
    }

    /// Record one sample's block input and output, per the store flags
    pub fn record(&mut self, inputs: &Tensor, output: &Tensor) {
        if self.store_inputs {
            self.cache.store_inputs(self.place(inputs));
        }
        if self.store_output {
            self.cache.store_output(self.place(output));
        }
    }

    fn place(&self, tensor: &Tensor) -> Tensor {
        if self.offload {
            tensor.detach()
        } else {
            tensor.clone()
        }
    }
}

/// Run a model's forward pass under a capture tap.
///
/// This is the default `model_forward` for tree-structured models: it
/// resolves the saver's target path and lets the tree route the pass.
/// `Break` means the target was observed and the rest of the pass was
/// skipped.
pub fn forward_with_tap<M: Module>(
    model: &mut M,
    input: &Tensor,
    saver: &mut DataSaver<'_>,
) -> ControlFlow<(), Tensor> {
    let target = saver.target().clone();
    model.forward_intercepted(input, target.segments(), saver)
}
