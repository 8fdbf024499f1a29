//! Module trait and tree addressing

use crate::quant::{LearnedRound, RoundImpl};
use crate::round::DataSaver;
use crate::Tensor;
use std::fmt;
use std::ops::ControlFlow;

/// A node in the model tree
///
/// Leaf layers implement `forward` and override the accessors that apply to
/// them; containers additionally expose `named_children` and route
/// intercepted forwards. The provided methods recurse through the children,
/// so a plain container only has to describe its structure.
pub trait Module {
    /// Forward pass through this module
    fn forward(&mut self, input: &Tensor) -> Tensor;

    /// Ordered named children of this node. Leaves return nothing.
    fn named_children(&mut self) -> Vec<(String, &mut dyn Module)> {
        Vec::new()
    }

    /// All parameters of this module and its descendants
    fn parameters(&mut self) -> Vec<&mut Tensor> {
        let mut params = Vec::new();
        for (_, child) in self.named_children() {
            params.extend(child.parameters());
        }
        params
    }

    /// Switch training/evaluation mode for this subtree
    fn set_training(&mut self, training: bool) {
        for (_, child) in self.named_children() {
            child.set_training(training);
        }
    }

    /// Enable or disable weight quantization for this subtree
    fn set_quant_enabled(&mut self, enabled: bool) {
        for (_, child) in self.named_children() {
            child.set_quant_enabled(enabled);
        }
    }

    /// Learned rounding modules of this subtree, in traversal order
    fn learned_round_modules(&mut self) -> Vec<&mut LearnedRound> {
        let mut modules = Vec::new();
        for (_, child) in self.named_children() {
            modules.extend(child.learned_round_modules());
        }
        modules
    }

    /// Attach learned rounding to every quantized layer in this subtree.
    /// Layers that already carry a rounding module are left alone.
    fn insert_learned_round(&mut self, imp: &RoundImpl) {
        for (_, child) in self.named_children() {
            child.insert_learned_round(imp);
        }
    }

    /// Forward pass with a capture tap at the descendant addressed by
    /// `target` (path segments relative to this module). Once the target
    /// has produced its output the pass stops with `ControlFlow::Break`;
    /// `Continue` carries this module's output when the target was not hit.
    ///
    /// The default handles the empty path (this module is the target);
    /// containers override it to route into the addressed child. A leaf
    /// given a non-empty path cannot route and falls back to a plain
    /// forward, leaving the saver untouched.
    fn forward_intercepted(
        &mut self,
        input: &Tensor,
        target: &[String],
        saver: &mut DataSaver<'_>,
    ) -> ControlFlow<(), Tensor> {
        if target.is_empty() {
            let output = self.forward(input);
            saver.record(input, &output);
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(self.forward(input))
        }
    }
}

/// Dotted path of child names addressing a module in the tree
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlockPath(Vec<String>);

impl BlockPath {
    /// Create a path from its segments
    pub fn new(segments: Vec<String>) -> Self {
        Self(segments)
    }

    /// Parse a dotted path like `"encoder.block0"`
    pub fn from_dotted(path: &str) -> Self {
        Self(path.split('.').map(str::to_string).collect())
    }

    /// Path segments, outermost first
    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for BlockPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// Resolve a path to the module it addresses
pub fn module_at<'a>(root: &'a mut dyn Module, path: &BlockPath) -> Option<&'a mut dyn Module> {
    descend(root, path.segments())
}

fn descend<'a>(module: &'a mut dyn Module, segments: &[String]) -> Option<&'a mut dyn Module> {
    match segments.split_first() {
        None => Some(module),
        Some((head, rest)) => {
            for (name, child) in module.named_children() {
                if name == *head {
                    return descend(child, rest);
                }
            }
            None
        }
    }
}
