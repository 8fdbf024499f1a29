//! Quantized linear layer

use super::module::Module;
use crate::autograd::{add, matmul};
use crate::quant::{LearnedRound, QuantConfig, RoundImpl, WeightQuantizer};
use crate::Tensor;

/// Linear layer with fake-quantized weights
///
/// The weight matrix is stored flattened row-major as `[d_out * d_in]`.
/// The per-tensor quantizer is calibrated from the weight at construction;
/// while quantization is enabled the forward pass multiplies by the
/// fake-quantized weight, otherwise by the float weight.
pub struct QuantLinear {
    weight: Tensor,
    bias: Option<Tensor>,
    d_out: usize,
    d_in: usize,
    quant: WeightQuantizer,
    quant_enabled: bool,
}

impl QuantLinear {
    /// Create a layer from a flattened `[d_out * d_in]` weight matrix
    pub fn new(weight: Vec<f32>, d_out: usize, d_in: usize, config: QuantConfig) -> Self {
        assert_eq!(
            weight.len(),
            d_out * d_in,
            "weight size must match d_out * d_in"
        );

        let mut quant = WeightQuantizer::new(config);
        quant.calibrate(&weight);

        Self {
            weight: Tensor::from_vec(weight, true),
            bias: None,
            d_out,
            d_in,
            quant,
            quant_enabled: true,
        }
    }

    /// Add a bias vector of size `d_out`
    pub fn with_bias(mut self, bias: Vec<f32>) -> Self {
        assert_eq!(bias.len(), self.d_out, "bias size must match d_out");
        self.bias = Some(Tensor::from_vec(bias, true));
        self
    }

    /// Output dimension
    pub fn d_out(&self) -> usize {
        self.d_out
    }

    /// Input dimension
    pub fn d_in(&self) -> usize {
        self.d_in
    }

    /// The float weight tensor
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// The weight quantizer
    pub fn quantizer(&self) -> &WeightQuantizer {
        &self.quant
    }
}

impl Module for QuantLinear {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        assert_eq!(input.len(), self.d_in, "input size must match d_in");

        let weight = if self.quant_enabled {
            self.quant.quantize(&self.weight)
        } else {
            self.weight.clone()
        };

        let out = matmul(&weight, input, self.d_out, self.d_in, 1);
        match &self.bias {
            Some(bias) => add(&out, bias),
            None => out,
        }
    }

    fn parameters(&mut self) -> Vec<&mut Tensor> {
        let mut params = vec![&mut self.weight];
        if let Some(bias) = &mut self.bias {
            params.push(bias);
        }
        if let Some(round) = &mut self.quant.learned_round {
            params.push(round.value_mut());
        }
        params
    }

    fn set_training(&mut self, training: bool) {
        if let Some(round) = &mut self.quant.learned_round {
            round.set_training(training);
        }
    }

    fn set_quant_enabled(&mut self, enabled: bool) {
        self.quant_enabled = enabled;
    }

    fn learned_round_modules(&mut self) -> Vec<&mut LearnedRound> {
        self.quant.learned_round.iter_mut().collect()
    }

    fn insert_learned_round(&mut self, imp: &RoundImpl) {
        self.quant.insert_learned_round(&self.weight, imp);
    }
}
