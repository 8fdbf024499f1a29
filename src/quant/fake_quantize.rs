//! Fake quantization of weight tensors
//!
//! Quantize → clamp → dequantize keeps values in floating point while
//! introducing the rounding error a real integer kernel would. Rounding is
//! nearest by default; attaching a [`LearnedRound`] module replaces it with
//! a learnable floor/ceil decision per element.

use super::learned_round::{LearnedRound, RoundImpl};
use crate::Tensor;

/// Quantization grid configuration
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct QuantConfig {
    /// Number of bits (e.g. 4, 8)
    pub bits: usize,
    /// Whether the grid is symmetric around zero
    pub symmetric: bool,
    /// Smallest representable integer
    pub qmin: i32,
    /// Largest representable integer
    pub qmax: i32,
}

impl QuantConfig {
    /// Symmetric grid: qmin = -(2^(bits-1) - 1), qmax = 2^(bits-1) - 1
    pub fn symmetric(bits: usize) -> Self {
        let qmax = (1 << (bits - 1)) - 1;
        Self {
            bits,
            symmetric: true,
            qmin: -qmax,
            qmax,
        }
    }

    /// Asymmetric grid: qmin = 0, qmax = 2^bits - 1
    pub fn asymmetric(bits: usize) -> Self {
        Self {
            bits,
            symmetric: false,
            qmin: 0,
            qmax: (1 << bits) - 1,
        }
    }

    /// 4-bit symmetric grid
    pub fn q4_symmetric() -> Self {
        Self::symmetric(4)
    }

    /// 8-bit symmetric grid
    pub fn q8_symmetric() -> Self {
        Self::symmetric(8)
    }
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self::q8_symmetric()
    }
}

/// Per-tensor weight quantizer
///
/// Holds the calibrated scale/zero-point for one weight tensor and,
/// optionally, the learned rounding module that replaces nearest rounding.
#[derive(Clone, Debug)]
pub struct WeightQuantizer {
    /// Grid configuration
    pub config: QuantConfig,
    /// Scale factor
    pub scale: f32,
    /// Zero point (asymmetric grids only)
    pub zero_point: i32,
    initialized: bool,
    /// Learned floor/ceil rounding, if inserted
    pub learned_round: Option<LearnedRound>,
}

impl WeightQuantizer {
    /// Create an uncalibrated quantizer
    pub fn new(config: QuantConfig) -> Self {
        Self {
            config,
            scale: 1.0,
            zero_point: 0,
            initialized: false,
            learned_round: None,
        }
    }

    /// Min-max calibration of scale (and zero point for asymmetric grids)
    pub fn calibrate(&mut self, data: &[f32]) {
        if data.is_empty() {
            return;
        }

        let min_val = data.iter().cloned().fold(f32::INFINITY, f32::min);
        let max_val = data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);

        if self.config.symmetric {
            let max_abs = min_val.abs().max(max_val.abs());
            self.scale = max_abs / self.config.qmax as f32;
            self.zero_point = 0;
        } else {
            self.scale = (max_val - min_val) / (self.config.qmax - self.config.qmin) as f32;
            self.zero_point = (self.config.qmin as f32 - min_val / self.scale).round() as i32;
            self.zero_point = self.zero_point.clamp(self.config.qmin, self.config.qmax);
        }

        if self.scale < 1e-10 {
            self.scale = 1e-10;
        }

        self.initialized = true;
    }

    /// Check if the scale has been calibrated
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Attach a learned rounding module sized to `weight`. A module that is
    /// already present is left alone.
    pub fn insert_learned_round(&mut self, weight: &Tensor, imp: &RoundImpl) {
        if self.learned_round.is_none() {
            self.learned_round = Some(LearnedRound::for_weight(weight.data(), self.scale, imp.clone()));
        }
    }

    /// Fake-quantize a weight tensor.
    ///
    /// With a learned rounding module attached, the rounding decision flows
    /// through the module and gradients reach its value parameter; without
    /// one this is plain nearest rounding and records nothing on the tape.
    pub fn quantize(&self, weight: &Tensor) -> Tensor {
        match &self.learned_round {
            Some(round) => round.quantize(weight, self.scale, self.config.qmin, self.config.qmax),
            None => {
                let data = weight.data().mapv(|x| self.nearest_value(x));
                Tensor::new(data, weight.requires_grad())
            }
        }
    }

    /// Nearest fake quantization of a single value
    fn nearest_value(&self, x: f32) -> f32 {
        let q = ((x / self.scale) + self.zero_point as f32)
            .round()
            .clamp(self.config.qmin as f32, self.config.qmax as f32) as i32;
        (q - self.zero_point) as f32 * self.scale
    }

    /// Number of representable levels
    pub fn num_levels(&self) -> usize {
        (self.config.qmax - self.config.qmin + 1) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    #[test]
    fn test_config_symmetric_grids() {
        let q4 = QuantConfig::symmetric(4);
        assert_eq!((q4.qmin, q4.qmax), (-7, 7));

        let q8 = QuantConfig::symmetric(8);
        assert_eq!((q8.qmin, q8.qmax), (-127, 127));
    }

    #[test]
    fn test_config_asymmetric_grids() {
        let q4 = QuantConfig::asymmetric(4);
        assert_eq!((q4.qmin, q4.qmax), (0, 15));

        let q8 = QuantConfig::asymmetric(8);
        assert_eq!((q8.qmin, q8.qmax), (0, 255));
    }

    #[test]
    fn test_calibration_symmetric() {
        let mut quant = WeightQuantizer::new(QuantConfig::q8_symmetric());
        quant.calibrate(&[0.0, 1.0, -2.0, 1.5]);

        assert!(quant.is_initialized());
        assert_abs_diff_eq!(quant.scale, 2.0 / 127.0, epsilon = 1e-6);
        assert_eq!(quant.zero_point, 0);
    }

    #[test]
    fn test_nearest_quantize_zero_stays_zero() {
        let mut quant = WeightQuantizer::new(QuantConfig::q8_symmetric());
        let weight = Tensor::from_vec(vec![0.0, 1.0, -1.0, 0.5], false);
        quant.calibrate(weight.data().as_slice().unwrap());

        let out = quant.quantize(&weight);
        assert_abs_diff_eq!(out.data()[0], 0.0, epsilon = 1e-6);
    }

    proptest! {
        /// Nearest fake quantization lands on grid points within the range
        #[test]
        fn prop_nearest_output_on_grid(
            values in prop::collection::vec(-5.0f32..5.0, 4..32),
            bits in 4usize..9,
        ) {
            let mut quant = WeightQuantizer::new(QuantConfig::symmetric(bits));
            quant.calibrate(&values);

            let out = quant.quantize(&Tensor::from_vec(values, false));
            for &val in out.data().iter() {
                let q = (val / quant.scale).round();
                prop_assert!((val - q * quant.scale).abs() < 1e-5);
                prop_assert!(q >= quant.config.qmin as f32 - 0.5);
                prop_assert!(q <= quant.config.qmax as f32 + 0.5);
            }
        }

        /// Quantization error is bounded by half a grid step inside the range
        #[test]
        fn prop_nearest_error_bounded(
            values in prop::collection::vec(-2.0f32..2.0, 4..32),
        ) {
            let mut quant = WeightQuantizer::new(QuantConfig::q8_symmetric());
            quant.calibrate(&values);

            let out = quant.quantize(&Tensor::from_vec(values.clone(), false));
            for (i, &orig) in values.iter().enumerate() {
                prop_assert!((orig - out.data()[i]).abs() <= quant.scale * 0.5 + 1e-6);
            }
        }
    }
}
