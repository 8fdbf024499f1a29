//! Learned floor/ceil rounding
//!
//! Each quantized weight element gets a learnable parameter deciding whether
//! it rounds down or up. Rounding itself is not differentiable, so gradients
//! flow through straight-through estimators: the floor/round step passes
//! gradients unchanged, while the soft rounding probability contributes its
//! rectified-sigmoid derivative.

use crate::autograd::BackwardOp;
use crate::Tensor;
use ndarray::Array1;
use std::cell::RefCell;
use std::rc::Rc;

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// How the learned parameter maps to a rounding decision
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum RoundImpl {
    /// Rectified sigmoid `p = clamp(sigmoid(v)·(zeta−gamma)+gamma, 0, 1)`;
    /// the quantized integer is `floor(w/s) + p` while training and
    /// `floor(w/s) + [v ≥ 0]` once frozen. Insertion solves for `v` so the
    /// initial `p` equals the fractional part of `w/s`.
    HardSigmoid {
        /// Upper stretch of the rectified sigmoid
        zeta: f32,
        /// Lower stretch of the rectified sigmoid
        gamma: f32,
    },
    /// Additive offset `round(w/s + v)` with `v` zero-initialized
    Identity,
}

impl RoundImpl {
    /// Hard sigmoid with the standard stretch (1.1, −0.1)
    pub fn hard_sigmoid() -> Self {
        Self::HardSigmoid {
            zeta: 1.1,
            gamma: -0.1,
        }
    }
}

impl Default for RoundImpl {
    fn default() -> Self {
        Self::hard_sigmoid()
    }
}

/// Learned rounding module for one weight tensor
///
/// Owns the per-element rounding parameter. Training mode selects the soft
/// (differentiable) rounding path; evaluation mode hardens the decision.
#[derive(Clone, Debug)]
pub struct LearnedRound {
    value: Tensor,
    imp: RoundImpl,
    training: bool,
}

impl LearnedRound {
    /// Create a module from an explicit initial parameter
    pub fn new(init: Array1<f32>, imp: RoundImpl) -> Self {
        Self {
            value: Tensor::new(init, true),
            imp,
            training: false,
        }
    }

    /// Build the module for a weight tensor and its quantization scale.
    ///
    /// Hard sigmoid initializes `v` by the inverse rectified sigmoid of the
    /// fractional part of `w/s`, so the soft quantization initially
    /// reconstructs the weight and the hardened decision starts at nearest
    /// rounding; the additive variant starts at zero.
    pub fn for_weight(weight: &Array1<f32>, scale: f32, imp: RoundImpl) -> Self {
        let init = match imp {
            RoundImpl::HardSigmoid { zeta, gamma } => weight.mapv(|w| {
                let ws = w / scale;
                let frac = ws - ws.floor();
                -((zeta - gamma) / (frac - gamma) - 1.0).ln()
            }),
            RoundImpl::Identity => Array1::zeros(weight.len()),
        };
        Self::new(init, imp)
    }

    /// The rounding implementation
    pub fn round_impl(&self) -> &RoundImpl {
        &self.imp
    }

    /// The learnable rounding parameter
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Mutable access to the rounding parameter
    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    /// Check training mode
    pub fn training(&self) -> bool {
        self.training
    }

    /// Switch between soft (training) and hard (frozen) rounding
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// Soft rounding probabilities `p` as a graph-attached tensor, for loss
    /// terms that regularize the rounding decision. Only the hard-sigmoid
    /// implementation has a probability interpretation.
    pub fn p_forward(&self) -> Option<Tensor> {
        let (zeta, gamma) = match self.imp {
            RoundImpl::HardSigmoid { zeta, gamma } => (zeta, gamma),
            RoundImpl::Identity => return None,
        };

        let n = self.value.len();
        let mut p = Array1::zeros(n);
        let mut dp_dv = Array1::zeros(n);
        for (i, &v) in self.value.data().iter().enumerate() {
            let s = sigmoid(v);
            let raw = s * (zeta - gamma) + gamma;
            p[i] = raw.clamp(0.0, 1.0);
            // Derivative is zero where the rectification clamps
            dp_dv[i] = if raw > 0.0 && raw < 1.0 {
                s * (1.0 - s) * (zeta - gamma)
            } else {
                0.0
            };
        }

        let requires_grad = self.value.requires_grad();
        let mut result = Tensor::new(p, requires_grad);
        if requires_grad {
            result.set_backward_op(Rc::new(HardSigmoidBackward {
                value: self.value.clone(),
                dp_dv,
                result_grad: result.grad_cell(),
            }));
        }
        Some(result)
    }

    /// Fake-quantize `weight` with the learned rounding decision.
    ///
    /// Straight-through backward: gradients reach the rounding parameter
    /// (and the weight, if it tracks gradients) wherever the quantized
    /// integer stays inside `[qmin, qmax]`.
    pub fn quantize(&self, weight: &Tensor, scale: f32, qmin: i32, qmax: i32) -> Tensor {
        assert_eq!(
            weight.len(),
            self.value.len(),
            "rounding parameter size must match weight size"
        );

        let qmin = qmin as f32;
        let qmax = qmax as f32;
        let n = weight.len();

        let mut out = Array1::zeros(n);
        let mut grad_value = Array1::zeros(n);
        let mut grad_weight = Array1::zeros(n);

        for i in 0..n {
            let ws = weight.data()[i] / scale;
            let v = self.value.data()[i];

            let (q_soft, dq_dv) = match self.imp {
                RoundImpl::HardSigmoid { zeta, gamma } => {
                    if self.training {
                        let s = sigmoid(v);
                        let raw = s * (zeta - gamma) + gamma;
                        let p = raw.clamp(0.0, 1.0);
                        let dp = if raw > 0.0 && raw < 1.0 {
                            s * (1.0 - s) * (zeta - gamma)
                        } else {
                            0.0
                        };
                        (ws.floor() + p, dp)
                    } else {
                        let p = if v >= 0.0 { 1.0 } else { 0.0 };
                        (ws.floor() + p, 0.0)
                    }
                }
                RoundImpl::Identity => ((ws + v).round(), 1.0),
            };

            let in_range = q_soft >= qmin && q_soft <= qmax;
            let q = q_soft.clamp(qmin, qmax);
            out[i] = q * scale;
            if in_range {
                grad_value[i] = dq_dv * scale;
                grad_weight[i] = 1.0;
            }
        }

        let requires_grad = weight.requires_grad() || self.value.requires_grad();
        let mut result = Tensor::new(out, requires_grad);
        if requires_grad {
            result.set_backward_op(Rc::new(LearnedRoundBackward {
                weight: weight.clone(),
                value: self.value.clone(),
                grad_weight,
                grad_value,
                result_grad: result.grad_cell(),
            }));
        }
        result
    }
}

struct HardSigmoidBackward {
    value: Tensor,
    dp_dv: Array1<f32>,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for HardSigmoidBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.value.requires_grad() {
                self.value.accumulate_grad(grad * &self.dp_dv);
            }
            if let Some(op) = self.value.backward_op() {
                op.backward();
            }
        }
    }
}

struct LearnedRoundBackward {
    weight: Tensor,
    value: Tensor,
    grad_weight: Array1<f32>,
    grad_value: Array1<f32>,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for LearnedRoundBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.value.requires_grad() {
                self.value.accumulate_grad(grad * &self.grad_value);
            }
            if self.weight.requires_grad() {
                self.weight.accumulate_grad(grad * &self.grad_weight);
            }
            if let Some(op) = self.value.backward_op() {
                op.backward();
            }
            if let Some(op) = self.weight.backward_op() {
                op.backward();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::{backward, sum};
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_hard_sigmoid_init_reconstructs_weight() {
        let weight = ndarray::arr1(&[0.31, -0.72, 0.08, 0.5]);
        let scale = 0.1;
        let round = LearnedRound::for_weight(&weight, scale, RoundImpl::hard_sigmoid());

        let mut soft = round.clone();
        soft.set_training(true);

        let out = soft.quantize(&Tensor::new(weight.clone(), false), scale, -127, 127);
        // floor(w/s) + frac(w/s) = w/s, so dequantization returns the weight
        for (i, &w) in weight.iter().enumerate() {
            assert_abs_diff_eq!(out.data()[i], w, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_identity_zero_init_is_nearest_rounding() {
        let weight = ndarray::arr1(&[0.31, -0.72, 0.08]);
        let scale = 0.1;
        let round = LearnedRound::for_weight(&weight, scale, RoundImpl::Identity);

        let out = round.quantize(&Tensor::new(weight.clone(), false), scale, -127, 127);
        for (i, &w) in weight.iter().enumerate() {
            let nearest = (w / scale).round() * scale;
            assert_abs_diff_eq!(out.data()[i], nearest, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_hard_mode_rounds_to_floor_or_ceil() {
        let weight = ndarray::arr1(&[0.34, 0.36]);
        let scale = 0.1;
        let mut round = LearnedRound::new(ndarray::arr1(&[-1.0, 1.0]), RoundImpl::hard_sigmoid());
        round.set_training(false);

        let out = round.quantize(&Tensor::new(weight, false), scale, -127, 127);
        // v < 0 floors, v ≥ 0 ceils
        assert_abs_diff_eq!(out.data()[0], 0.3, epsilon = 1e-5);
        assert_abs_diff_eq!(out.data()[1], 0.4, epsilon = 1e-5);
    }

    #[test]
    fn test_quantize_gradient_reaches_rounding_parameter() {
        let weight = Tensor::from_vec(vec![0.31, -0.72], false);
        let mut round = LearnedRound::for_weight(weight.data(), 0.1, RoundImpl::hard_sigmoid());
        round.set_training(true);

        let mut loss = sum(&round.quantize(&weight, 0.1, -127, 127));
        backward(&mut loss, None);

        let grad = round.value().grad().unwrap();
        // scale · p'(v) with p'(v) > 0 away from the rectification bounds
        assert!(grad.iter().all(|&g| g > 0.0));
    }

    #[test]
    fn test_identity_gradient_is_scale_inside_range() {
        let weight = Tensor::from_vec(vec![0.31], false);
        let round = LearnedRound::for_weight(weight.data(), 0.1, RoundImpl::Identity);

        let mut loss = sum(&round.quantize(&weight, 0.1, -127, 127));
        backward(&mut loss, None);

        assert_abs_diff_eq!(round.value().grad().unwrap()[0], 0.1, epsilon = 1e-6);
    }

    #[test]
    fn test_gradient_clipped_outside_quant_range() {
        // w/s = 20 overflows a 4-bit grid; the clamp kills the gradient
        let weight = Tensor::from_vec(vec![2.0], false);
        let round = LearnedRound::for_weight(weight.data(), 0.1, RoundImpl::Identity);

        let mut loss = sum(&round.quantize(&weight, 0.1, -7, 7));
        backward(&mut loss, None);

        assert_abs_diff_eq!(round.value().grad().unwrap()[0], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_p_forward_matches_fractional_init() {
        let weight = ndarray::arr1(&[0.37, -0.61]);
        let scale = 0.1;
        let round = LearnedRound::for_weight(&weight, scale, RoundImpl::hard_sigmoid());

        let p = round.p_forward().unwrap();
        for (i, &w) in weight.iter().enumerate() {
            let ws = w / scale;
            assert_abs_diff_eq!(p.data()[i], ws - ws.floor(), epsilon = 1e-4);
        }
    }

    #[test]
    fn test_p_forward_none_for_identity() {
        let round = LearnedRound::new(ndarray::arr1(&[0.0]), RoundImpl::Identity);
        assert!(round.p_forward().is_none());
    }
}
