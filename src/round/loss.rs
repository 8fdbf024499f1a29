//! Loss strategies for learned-rounding optimization

use crate::autograd::{add, scale, square, sub, sum, BackwardOp};
use crate::error::{Error, Result};
use crate::quant::{LearnedRound, RoundImpl};
use crate::Tensor;
use ndarray::Array1;
use std::cell::RefCell;
use std::rc::Rc;

/// Loss component values of one optimization step
#[derive(Clone, Copy, Debug)]
pub enum LossTerms {
    /// Reconstruction-only loss
    Reconstruction {
        /// Total loss
        total: f32,
    },
    /// Reconstruction plus rounding regularization
    Regularized {
        /// Total loss
        total: f32,
        /// Reconstruction term
        rec: f32,
        /// Regularization term (zero during warmup)
        round: f32,
        /// Current temperature exponent
        beta: f32,
    },
}

impl LossTerms {
    /// The total loss value
    pub fn total(&self) -> f32 {
        match *self {
            LossTerms::Reconstruction { total } => total,
            LossTerms::Regularized { total, .. } => total,
        }
    }
}

/// Per-block training objective
///
/// Stateful across calls: implementations may keep an iteration counter and
/// anneal their terms. One fresh instance is created per block. `rounding`
/// carries the graph-attached soft rounding probabilities of the block's
/// rounding modules, for strategies that regularize the rounding decision.
pub trait BlockLoss {
    /// Compute the loss over one mini-batch of block outputs
    fn compute(
        &mut self,
        pred: &[Tensor],
        target: &[Tensor],
        rounding: &[Tensor],
    ) -> (Tensor, LossTerms);

    /// Render the loss components for progress logging
    fn format_terms(&self, terms: &LossTerms) -> String;
}

/// Mean over the batch of per-sample sums of squared errors
fn batch_sse_mean(pred: &[Tensor], target: &[Tensor]) -> Tensor {
    assert!(!pred.is_empty(), "loss needs a non-empty batch");
    assert_eq!(pred.len(), target.len(), "batch sizes must match");

    let mut total: Option<Tensor> = None;
    for (p, t) in pred.iter().zip(target.iter()) {
        let sse = sum(&square(&sub(p, t)));
        total = Some(match total {
            Some(acc) => add(&acc, &sse),
            None => sse,
        });
    }
    let total = total.expect("batch checked non-empty above");
    scale(&total, 1.0 / pred.len() as f32)
}

/// Reconstruction-only objective
#[derive(Default)]
pub struct ReconstructionLoss;

impl ReconstructionLoss {
    /// Create the objective
    pub fn new() -> Self {
        Self
    }
}

impl BlockLoss for ReconstructionLoss {
    fn compute(
        &mut self,
        pred: &[Tensor],
        target: &[Tensor],
        _rounding: &[Tensor],
    ) -> (Tensor, LossTerms) {
        let loss = batch_sse_mean(pred, target);
        let total = loss.data()[0];
        (loss, LossTerms::Reconstruction { total })
    }

    fn format_terms(&self, terms: &LossTerms) -> String {
        format!("loss = {:.4}", terms.total())
    }
}

/// Linear temperature decay for the regularization exponent
///
/// Holds `start_b` until `rel_start_decay · t_max`, then interpolates
/// linearly down to `end_b`, with the interpolation factor clamped so it
/// never goes negative.
#[derive(Clone, Debug)]
pub struct LinearTempDecay {
    t_max: f32,
    start_decay: f32,
    start_b: f32,
    end_b: f32,
}

impl LinearTempDecay {
    /// Create a decay schedule over `t_max` iterations
    pub fn new(t_max: f32, rel_start_decay: f32, start_b: f32, end_b: f32) -> Self {
        Self {
            t_max,
            start_decay: rel_start_decay * t_max,
            start_b,
            end_b,
        }
    }

    /// Temperature at iteration `t`
    pub fn at(&self, t: f32) -> f32 {
        if t < self.start_decay {
            self.start_b
        } else {
            let rel_t = (t - self.start_decay) / (self.t_max - self.start_decay);
            self.end_b + (self.start_b - self.end_b) * (1.0 - rel_t).max(0.0)
        }
    }
}

/// Reconstruction plus annealed rounding regularization
///
/// After a warmup fraction of the iteration budget, adds
/// `weight · Σ (1 − |2(p − ½)|^b)` over the soft rounding probabilities,
/// pushing every rounding decision towards a hard 0 or 1 as the exponent
/// `b` anneals from exploration to commitment.
pub struct RegularizedLoss {
    weight: f32,
    warmup_end: f32,
    temp_decay: LinearTempDecay,
    iter: usize,
}

impl RegularizedLoss {
    /// Create the objective for one block.
    ///
    /// The regularizer operates on a single rounding module's probability
    /// vector; a block with more (or fewer) rounding modules, or one whose
    /// rounding has no probability interpretation, is a configuration
    /// error.
    pub fn new(
        iters: usize,
        weight: f32,
        b_range: (f32, f32),
        warmup: f32,
        decay_start: f32,
        round_modules: &[&LearnedRound],
    ) -> Result<Self> {
        if round_modules.len() != 1 {
            return Err(Error::Config(format!(
                "regularized rounding loss requires exactly one rounding module per block, got {}",
                round_modules.len()
            )));
        }
        if !matches!(round_modules[0].round_impl(), RoundImpl::HardSigmoid { .. }) {
            return Err(Error::Config(
                "regularized rounding loss requires a hard-sigmoid rounding module".to_string(),
            ));
        }

        let rel_start_decay = warmup + (1.0 - warmup) * decay_start;
        Ok(Self {
            weight,
            warmup_end: iters as f32 * warmup,
            temp_decay: LinearTempDecay::new(iters as f32, rel_start_decay, b_range.0, b_range.1),
            iter: 0,
        })
    }
}

impl BlockLoss for RegularizedLoss {
    fn compute(
        &mut self,
        pred: &[Tensor],
        target: &[Tensor],
        rounding: &[Tensor],
    ) -> (Tensor, LossTerms) {
        assert_eq!(
            rounding.len(),
            1,
            "regularized rounding loss expects one probability tensor"
        );
        self.iter += 1;

        let rec = batch_sse_mean(pred, target);
        let beta = self.temp_decay.at(self.iter as f32);

        if (self.iter as f32) < self.warmup_end {
            let total = rec.data()[0];
            (
                rec,
                LossTerms::Regularized {
                    total,
                    rec: total,
                    round: 0.0,
                    beta,
                },
            )
        } else {
            let reg = scale(&round_regularizer(&rounding[0], beta), self.weight);
            let round = reg.data()[0];
            let loss = add(&rec, &reg);
            let terms = LossTerms::Regularized {
                total: loss.data()[0],
                rec: rec.data()[0],
                round,
                beta,
            };
            (loss, terms)
        }
    }

    fn format_terms(&self, terms: &LossTerms) -> String {
        match *terms {
            LossTerms::Regularized {
                total,
                rec,
                round,
                beta,
            } => format!(
                "loss = {:.4}, rec_loss = {:.4}, round_loss = {:.4}, b = {:.2}",
                total, rec, round, beta
            ),
            LossTerms::Reconstruction { total } => format!("loss = {:.4}", total),
        }
    }
}

/// Loss strategy selection, with per-strategy options
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum LossKind {
    /// Reconstruction-only objective
    Reconstruction,
    /// Reconstruction plus annealed rounding regularization
    Regularized {
        /// Weight of the regularization term
        weight: f32,
        /// Initial temperature exponent (exploration)
        b_start: f32,
        /// Final temperature exponent (commitment)
        b_end: f32,
        /// Fraction of the iteration budget with the regularizer gated off
        warmup: f32,
        /// Fraction of the post-warmup window before the decay starts
        decay_start: f32,
    },
}

impl LossKind {
    /// Regularized strategy with the standard options
    pub fn regularized() -> Self {
        Self::Regularized {
            weight: 0.01,
            b_start: 20.0,
            b_end: 2.0,
            warmup: 0.2,
            decay_start: 0.0,
        }
    }

    /// Validate strategy options
    pub fn validate(&self) -> Result<()> {
        if let LossKind::Regularized { weight, warmup, .. } = self {
            if *weight <= 0.0 {
                return Err(Error::Config(
                    "regularization weight must be positive".to_string(),
                ));
            }
            if !(0.0..1.0).contains(warmup) {
                return Err(Error::Config(format!(
                    "warmup fraction must be in [0, 1), got {warmup}"
                )));
            }
        }
        Ok(())
    }

    /// Build a fresh per-block loss object
    pub fn instantiate(
        &self,
        iters: usize,
        round_modules: &[&LearnedRound],
    ) -> Result<Box<dyn BlockLoss>> {
        match *self {
            LossKind::Reconstruction => Ok(Box::new(ReconstructionLoss::new())),
            LossKind::Regularized {
                weight,
                b_start,
                b_end,
                warmup,
                decay_start,
            } => Ok(Box::new(RegularizedLoss::new(
                iters,
                weight,
                (b_start, b_end),
                warmup,
                decay_start,
                round_modules,
            )?)),
        }
    }
}

impl Default for LossKind {
    fn default() -> Self {
        Self::Reconstruction
    }
}

/// `Σ (1 − |2(p − ½)|^b)` with its analytic backward
fn round_regularizer(p: &Tensor, b: f32) -> Tensor {
    let value: f32 = p
        .data()
        .iter()
        .map(|&x| 1.0 - (2.0 * (x - 0.5)).abs().powf(b))
        .sum();

    let requires_grad = p.requires_grad();
    let mut result = Tensor::from_vec(vec![value], requires_grad);

    if requires_grad {
        // d/dp (1 − |2(p−½)|^b) = −2b · |2(p−½)|^(b−1) · sign(p−½)
        let grad = p.data().mapv(|x| {
            let base = (2.0 * (x - 0.5)).abs();
            if base > 0.0 {
                -2.0 * b * base.powf(b - 1.0) * (x - 0.5).signum()
            } else {
                0.0
            }
        });
        result.set_backward_op(Rc::new(RoundRegularizerBackward {
            p: p.clone(),
            grad,
            result_grad: result.grad_cell(),
        }));
    }

    result
}

struct RoundRegularizerBackward {
    p: Tensor,
    grad: Array1<f32>,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for RoundRegularizerBackward {
    fn backward(&self) {
        if let Some(grad_out) = self.result_grad.borrow().as_ref() {
            if self.p.requires_grad() {
                self.p.accumulate_grad(&self.grad * grad_out[0]);
            }
            if let Some(op) = self.p.backward_op() {
                op.backward();
            }
        }
    }
}

/// Round a tensor's values through f16 while passing gradients straight
/// through, emulating reduced-precision arithmetic in the loss path.
pub fn cast_f16(t: &Tensor) -> Tensor {
    let data = t.data().mapv(|x| half::f16::from_f32(x).to_f32());
    let requires_grad = t.requires_grad();
    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        result.set_backward_op(Rc::new(CastF16Backward {
            a: t.clone(),
            result_grad: result.grad_cell(),
        }));
    }
    result
}

struct CastF16Backward {
    a: Tensor,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for CastF16Backward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                self.a.accumulate_grad(grad.clone());
            }
            if let Some(op) = self.a.backward_op() {
                op.backward();
            }
        }
    }
}
