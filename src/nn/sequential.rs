//! Sequential container

use super::module::Module;
use crate::round::DataSaver;
use crate::Tensor;
use std::ops::ControlFlow;

/// Ordered named container: each stage consumes the previous stage's output
///
/// # Example
///
/// ```
/// use cuantizar::nn::{Module, QuantLinear, Sequential};
/// use cuantizar::quant::QuantConfig;
/// use cuantizar::Tensor;
///
/// let mut model = Sequential::new()
///     .push("block0", QuantLinear::new(vec![0.1; 4], 2, 2, QuantConfig::q8_symmetric()))
///     .push("block1", QuantLinear::new(vec![0.2; 4], 2, 2, QuantConfig::q8_symmetric()));
///
/// let out = model.forward(&Tensor::from_vec(vec![1.0, -1.0], false));
/// assert_eq!(out.len(), 2);
/// ```
#[derive(Default)]
pub struct Sequential {
    stages: Vec<(String, Box<dyn Module>)>,
}

impl Sequential {
    /// Create an empty container
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Append a named stage
    pub fn push(mut self, name: &str, module: impl Module + 'static) -> Self {
        self.stages.push((name.to_string(), Box::new(module)));
        self
    }

    /// Number of stages
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Check if the container has no stages
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Module for Sequential {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        let mut x = input.clone();
        for (_, stage) in &mut self.stages {
            x = stage.forward(&x);
        }
        x
    }

    fn named_children(&mut self) -> Vec<(String, &mut dyn Module)> {
        self.stages
            .iter_mut()
            .map(|(name, module)| (name.clone(), module.as_mut() as &mut dyn Module))
            .collect()
    }

    fn forward_intercepted(
        &mut self,
        input: &Tensor,
        target: &[String],
        saver: &mut DataSaver<'_>,
    ) -> ControlFlow<(), Tensor> {
        let (head, rest) = match target.split_first() {
            // The container itself is the target
            None => {
                let output = self.forward(input);
                saver.record(input, &output);
                return ControlFlow::Break(());
            }
            Some(split) => split,
        };

        let mut x = input.clone();
        for (name, stage) in &mut self.stages {
            if name == head {
                match stage.forward_intercepted(&x, rest, saver) {
                    ControlFlow::Break(()) => return ControlFlow::Break(()),
                    ControlFlow::Continue(out) => x = out,
                }
            } else {
                x = stage.forward(&x);
            }
        }
        ControlFlow::Continue(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::QuantLinear;
    use crate::quant::QuantConfig;
    use approx::assert_abs_diff_eq;

    fn identity_layer() -> QuantLinear {
        // 2×2 identity weight
        QuantLinear::new(vec![1.0, 0.0, 0.0, 1.0], 2, 2, QuantConfig::q8_symmetric())
    }

    #[test]
    fn test_sequential_chains_stages() {
        let mut model = Sequential::new()
            .push("a", identity_layer())
            .push("b", identity_layer());
        model.set_quant_enabled(false);

        let out = model.forward(&Tensor::from_vec(vec![0.5, -0.25], false));
        assert_abs_diff_eq!(out.data()[0], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(out.data()[1], -0.25, epsilon = 1e-6);
    }

    #[test]
    fn test_named_children_preserve_order() {
        let mut model = Sequential::new()
            .push("first", identity_layer())
            .push("second", identity_layer());

        let names: Vec<String> = model
            .named_children()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn test_parameters_collected_recursively() {
        let mut model = Sequential::new()
            .push("a", identity_layer())
            .push("b", identity_layer());

        // one weight tensor per layer, no bias, no rounding yet
        assert_eq!(model.parameters().len(), 2);
    }
}
